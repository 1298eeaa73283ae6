//! The process-wide catalog: listen endpoint, database directory, database
//! enumeration and user credentials. Backed by one JSON config file with
//! replace-on-write persistence; all mutation is serialized on one mutex.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub name: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub user: String,
    /// Obscured form of `user + password + user`.
    pub passwd: String,
    pub access: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    host: String,
    port: u16,
    path: String,
    databases: Vec<DatabaseEntry>,
    users: Vec<UserEntry>,
}

/// The authenticated identity of one session: who, what they may touch, and
/// the secrets the session transforms are keyed with.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user: String,
    pub access: Vec<String>,
    pub passwd: String,
    /// Session key the client must echo on every request.
    pub key: String,
}

#[derive(Deserialize)]
struct CredentialPair {
    u: String,
    p: String,
}

#[derive(Debug)]
pub struct Catalog {
    filename: PathBuf,
    base_dir: PathBuf,
    inner: Mutex<CatalogFile>,
}

impl Catalog {
    /// Load the catalog from `path`. A missing file is `MissingConfigError`.
    pub async fn load(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                DbError::MissingConfig(format!(
                    "the config file {} does not exist",
                    path.display()
                ))
            } else {
                DbError::Io(err)
            }
        })?;
        let file: CatalogFile = serde_json::from_slice(&bytes)
            .map_err(|err| DbError::SchemaType(format!("malformed config file: {err}")))?;
        let base_dir = std::env::current_dir()?;
        Ok(Catalog {
            filename: path.to_path_buf(),
            base_dir,
            inner: Mutex::new(file),
        })
    }

    pub async fn listen_addr(&self) -> (String, u16) {
        let inner = self.inner.lock().await;
        (inner.host.clone(), inner.port)
    }

    /// Directory holding the database files: `{cwd}/{config.path}`.
    pub async fn db_dir(&self) -> PathBuf {
        let inner = self.inner.lock().await;
        self.base_dir.join(&inner.path)
    }

    pub async fn databases(&self) -> Vec<DatabaseEntry> {
        self.inner.lock().await.databases.clone()
    }

    pub async fn exists(&self, dbname: &str) -> bool {
        self.inner
            .lock()
            .await
            .databases
            .iter()
            .any(|db| db.name == dbname)
    }

    /// Register a new database and grant `user` access to it.
    pub async fn add_db(&self, dbname: &str, user: &str) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.databases.iter().any(|db| db.name == dbname) {
            inner.databases.push(DatabaseEntry {
                name: dbname.to_string(),
                filename: format!("{dbname}.json"),
            });
        }
        if let Some(entry) = inner.users.iter_mut().find(|entry| entry.user == user) {
            if !entry.access.iter().any(|name| name == dbname) {
                entry.access.push(dbname.to_string());
            }
        }
        self.save(&inner).await
    }

    /// Drop a database: remove its entry and file, and scrub it from every
    /// user's access list. Returns whether anything was removed.
    pub async fn del_db(&self, dbname: &str) -> DbResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(position) = inner.databases.iter().position(|db| db.name == dbname) else {
            return Ok(false);
        };
        let entry = inner.databases.remove(position);
        let file = self.base_dir.join(&inner.path).join(&entry.filename);
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(DbError::Io(err)),
        }
        for user in &mut inner.users {
            user.access.retain(|name| name != dbname);
        }
        self.save(&inner).await?;
        Ok(true)
    }

    /// Authenticate the pre-auth credentials blob. The first byte is a
    /// protocol tag and is skipped; the rest unobscures to `{"u", "p"}`.
    /// Matches against the stored token `obscure(u + p + u)` and issues a
    /// fresh session key on success.
    pub async fn auth_user(&self, credentials: &str) -> DbResult<Principal> {
        let blob = credentials.as_bytes();
        if blob.len() < 2 {
            return Err(invalid_user());
        }
        let decoded = common_codec::unobscure(&blob[1..]).map_err(|_| invalid_user())?;
        let pair: CredentialPair =
            serde_json::from_slice(&decoded).map_err(|_| invalid_user())?;
        let token = password_token(&pair.u, &pair.p);

        let inner = self.inner.lock().await;
        let entry = inner
            .users
            .iter()
            .find(|entry| entry.passwd == token)
            .ok_or_else(invalid_user)?;
        let key = common_codec::obscure(format!("{}{}", Uuid::new_v4(), pair.u).as_bytes());
        Ok(Principal {
            user: entry.user.clone(),
            access: entry.access.clone(),
            passwd: pair.p,
            key,
        })
    }

    async fn save(&self, inner: &CatalogFile) -> DbResult<()> {
        let bytes = serde_json::to_vec_pretty(inner)
            .map_err(|err| DbError::SchemaType(format!("malformed config file: {err}")))?;
        let mut tmp = self.filename.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.filename).await?;
        Ok(())
    }
}

fn invalid_user() -> DbError {
    DbError::InvalidUser("unable to authenticate user credentials".into())
}

/// The stored password token for a user: `obscure(user + password + user)`.
pub fn password_token(user: &str, password: &str) -> String {
    common_codec::obscure(format!("{user}{password}{user}").as_bytes())
}

/// Obscured credentials blob as a client produces it: one protocol tag byte
/// followed by `obscure({"u", "p"})`.
pub fn credentials_blob(user: &str, password: &str) -> String {
    let body = serde_json::json!({"u": user, "p": password});
    let encoded = common_codec::obscure(body.to_string().as_bytes());
    format!("#{encoded}")
}
