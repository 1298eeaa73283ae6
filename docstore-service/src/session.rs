//! Per-connection session handling.
//!
//! A session starts unauthenticated: frames are obscured and only `AUTH` is
//! honored. After a successful `AUTH` the outer transform switches to
//! password encryption when the client asked for it, and every request must
//! echo the issued session key. Errors are reported in-band; only framing or
//! I/O failures terminate the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tracing::{debug, info};

use common_proto::{
    read_frame, write_frame, AddManyPayload, AddNewKeyPayload, AddPayload, AddSectionPayload,
    AuthPayload, Command, CreateDbPayload, DeleteByIdPayload, DeleteByQueryPayload,
    GetAllBySectionPayload, GetByIdPayload, GetByQueryPayload, PurgePayload, Request, Response,
    SetIdGeneratorPayload, UpdateByIdPayload, UpdateByQueryPayload, UseDbPayload,
    UseSectionPayload,
};

use crate::catalog::{Catalog, Principal};
use crate::engine::Engine;
use crate::errors::{DbError, DbResult};
use crate::server::EngineRegistry;

enum FrameDecode {
    Payload(Vec<u8>),
    Reject(DbError),
    Close,
}

pub struct Session {
    catalog: Arc<Catalog>,
    engines: Arc<EngineRegistry>,
    peer: SocketAddr,
    principal: Option<Principal>,
    encrypt: bool,
    selected: Option<Arc<Engine>>,
}

impl Session {
    pub fn new(catalog: Arc<Catalog>, engines: Arc<EngineRegistry>, peer: SocketAddr) -> Self {
        Session {
            catalog,
            engines,
            peer,
            principal: None,
            encrypt: true,
            selected: None,
        }
    }

    pub async fn run(mut self, stream: TcpStream) {
        info!(peer = %self.peer, "connection established");
        let (mut reader, mut writer) = stream.into_split();
        loop {
            let raw = match read_frame(&mut reader).await {
                Ok(raw) => raw,
                Err(err) => {
                    debug!(peer = %self.peer, error = %err, "read failed");
                    break;
                }
            };
            let payload = match self.decode_frame(&raw) {
                FrameDecode::Payload(payload) => payload,
                FrameDecode::Reject(err) => {
                    if self.send(&mut writer, err.to_response()).await.is_err() {
                        break;
                    }
                    continue;
                }
                FrameDecode::Close => break,
            };
            let request: Request = match serde_json::from_slice(&payload) {
                Ok(request) => request,
                Err(err) => {
                    debug!(peer = %self.peer, error = %err, "malformed request");
                    break;
                }
            };
            let response = self.dispatch(request).await;
            if self.send(&mut writer, response).await.is_err() {
                break;
            }
        }
        info!(peer = %self.peer, "connection terminated");
    }

    fn decode_frame(&self, raw: &[u8]) -> FrameDecode {
        match &self.principal {
            None => match common_codec::unobscure(raw) {
                Ok(payload) => FrameDecode::Payload(payload),
                Err(err) => {
                    debug!(peer = %self.peer, error = %err, "undecodable pre-auth frame");
                    FrameDecode::Close
                }
            },
            Some(principal) if self.encrypt => {
                match common_codec::password_decrypt(raw, &principal.passwd) {
                    Ok(payload) => FrameDecode::Payload(payload),
                    Err(err) => FrameDecode::Reject(DbError::AuthIntegrity(format!(
                        "unable to decrypt request: {err}"
                    ))),
                }
            }
            Some(_) => match common_codec::unobscure(raw) {
                Ok(payload) => FrameDecode::Payload(payload),
                Err(err) => {
                    debug!(peer = %self.peer, error = %err, "undecodable frame");
                    FrameDecode::Close
                }
            },
        }
    }

    async fn send(&self, writer: &mut OwnedWriteHalf, response: Response) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(&response)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        let encoded = match &self.principal {
            Some(principal) if self.encrypt => {
                common_codec::password_encrypt(&bytes, &principal.passwd)
            }
            _ => common_codec::obscure(&bytes),
        };
        write_frame(writer, encoded.as_bytes()).await
    }

    async fn dispatch(&mut self, request: Request) -> Response {
        if request.cmd != Command::Auth {
            let authorized = match &self.principal {
                Some(principal) => request.auth.as_deref() == Some(principal.key.as_str()),
                None => false,
            };
            if !authorized {
                return DbError::InvalidUser("unable to authenticate user credentials".into())
                    .to_response();
            }
        }
        let result = match request.cmd {
            Command::Auth => self.authenticate(request.payload).await,
            Command::UseDb => self.use_db(request.payload).await,
            Command::UseSection => self.use_section(request.payload).await,
            Command::CreateDb => self.create_db(request.payload).await,
            Command::Add => self.add(request.payload).await,
            Command::AddMany => self.add_many(request.payload).await,
            Command::AddNewKey => self.add_new_key(request.payload).await,
            Command::AddSection => self.add_section(request.payload).await,
            Command::GetAll => self.get_all().await,
            Command::GetAllBySection => self.get_all_by_section(request.payload).await,
            Command::GetById => self.get_by_id(request.payload).await,
            Command::GetByQuery => self.get_by_query(request.payload).await,
            Command::UpdateById => self.update_by_id(request.payload).await,
            Command::UpdateByQuery => self.update_by_query(request.payload).await,
            Command::DeleteById => self.delete_by_id(request.payload).await,
            Command::DeleteByQuery => self.delete_by_query(request.payload).await,
            Command::Purge => self.purge(request.payload).await,
            Command::PurgeAll => self.purge_all().await,
            Command::SetIdGenerator => self.set_id_generator(request.payload).await,
        };
        match result {
            Ok(data) => Response::ok(data),
            Err(err) => err.to_response(),
        }
    }

    async fn authenticate(&mut self, payload: Value) -> DbResult<Value> {
        let payload: AuthPayload = parse(payload)?;
        self.encrypt = payload.encrypt;
        let principal = self.catalog.auth_user(&payload.credentials).await?;
        let key = principal.key.clone();
        info!(peer = %self.peer, user = %principal.user, encrypt = self.encrypt, "session authenticated");
        self.principal = Some(principal);
        Ok(Value::String(key))
    }

    async fn use_db(&mut self, payload: Value) -> DbResult<Value> {
        let payload: UseDbPayload = parse(payload)?;
        let principal = self.principal()?;
        if !principal.access.iter().any(|name| name == &payload.dbname) {
            return Err(DbError::InvalidUser(format!(
                "user {} does not have access to database {}",
                principal.user, payload.dbname
            )));
        }
        let engine = self.engines.get(&payload.dbname).await.ok_or_else(|| {
            DbError::DatabaseNotFound(format!("database {} not found", payload.dbname))
        })?;
        engine.force_load().await?;
        let mut data = Map::new();
        data.insert("dbname".into(), Value::String(payload.dbname));
        if let Some(section) = payload.section {
            if !engine.has_section(&section).await? {
                return Err(DbError::section_not_found(&section));
            }
            data.insert("section".into(), Value::String(section));
        }
        self.selected = Some(engine);
        Ok(Value::Object(data))
    }

    async fn use_section(&mut self, payload: Value) -> DbResult<Value> {
        let payload: UseSectionPayload = parse(payload)?;
        let engine = self.selected()?;
        if !engine.has_section(&payload.section).await? {
            return Err(DbError::section_not_found(&payload.section));
        }
        Ok(Value::String(payload.section))
    }

    async fn create_db(&mut self, payload: Value) -> DbResult<Value> {
        let payload: CreateDbPayload = parse(payload)?;
        let user = self.principal()?.user.clone();
        let path = self
            .engines
            .dir()
            .join(format!("{}.json", payload.dbname));
        if !payload.force {
            let taken = self.engines.contains(&payload.dbname).await
                || self.catalog.exists(&payload.dbname).await
                || tokio::fs::try_exists(&path).await?;
            if taken {
                return Err(DbError::DatabaseAlreadyExists(format!(
                    "database {} already exists",
                    payload.dbname
                )));
            }
        } else if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&path).await?;
        }
        Engine::init_file(&path).await?;
        self.catalog.add_db(&payload.dbname, &user).await?;
        if let Some(principal) = self.principal.as_mut() {
            if !principal.access.iter().any(|name| name == &payload.dbname) {
                principal.access.push(payload.dbname.clone());
            }
        }
        let engine = self.engines.register(&payload.dbname, path).await;
        info!(peer = %self.peer, db = %payload.dbname, "database created");
        if payload.use_db {
            engine.force_load().await?;
            self.selected = Some(engine);
        }
        Ok(Value::String(String::new()))
    }

    async fn add(&mut self, payload: Value) -> DbResult<Value> {
        let payload: AddPayload = parse(payload)?;
        let engine = self.selected()?;
        let id = engine
            .add(&payload.section, payload.data, payload.ignore_missing_key)
            .await?;
        engine.commit().await?;
        Ok(Value::String(id))
    }

    async fn add_many(&mut self, payload: Value) -> DbResult<Value> {
        let payload: AddManyPayload = parse(payload)?;
        let engine = self.selected()?;
        let result = engine
            .add_many(
                &payload.section,
                payload.data,
                payload.json_response,
                payload.ignore_missing_key,
            )
            .await?;
        engine.commit().await?;
        Ok(result)
    }

    async fn add_new_key(&mut self, payload: Value) -> DbResult<Value> {
        let payload: AddNewKeyPayload = parse(payload)?;
        let engine = self.selected()?;
        engine
            .add_new_key(&payload.section, &payload.key, payload.default)
            .await?;
        engine.commit().await?;
        Ok(Value::Object(Map::new()))
    }

    async fn add_section(&mut self, payload: Value) -> DbResult<Value> {
        let payload: AddSectionPayload = parse(payload)?;
        let engine = self.selected()?;
        engine.add_section(&payload.section).await?;
        engine.commit().await?;
        // Selection is advisory; with or without `use` the reply names the
        // freshly created section.
        Ok(Value::String(payload.section))
    }

    async fn get_all(&mut self) -> DbResult<Value> {
        let engine = self.selected()?;
        Ok(Value::Object(engine.get_all().await?))
    }

    async fn get_all_by_section(&mut self, payload: Value) -> DbResult<Value> {
        let payload: GetAllBySectionPayload = parse(payload)?;
        let engine = self.selected()?;
        Ok(Value::Object(
            engine.get_all_by_section(&payload.section).await?,
        ))
    }

    async fn get_by_id(&mut self, payload: Value) -> DbResult<Value> {
        let payload: GetByIdPayload = parse(payload)?;
        let engine = self.selected()?;
        engine.get_by_id(&payload.section, &payload.id).await
    }

    async fn get_by_query(&mut self, payload: Value) -> DbResult<Value> {
        let payload: GetByQueryPayload = parse(payload)?;
        let engine = self.selected()?;
        Ok(Value::Object(
            engine.get_by_query(&payload.section, &payload.query).await?,
        ))
    }

    async fn update_by_id(&mut self, payload: Value) -> DbResult<Value> {
        let payload: UpdateByIdPayload = parse(payload)?;
        let engine = self.selected()?;
        let updated = engine
            .update_by_id(&payload.section, &payload.id, payload.data)
            .await?;
        engine.commit().await?;
        Ok(updated)
    }

    async fn update_by_query(&mut self, payload: Value) -> DbResult<Value> {
        let payload: UpdateByQueryPayload = parse(payload)?;
        let engine = self.selected()?;
        let updated = engine
            .update_by_query(&payload.section, &payload.query, payload.data)
            .await?;
        engine.commit().await?;
        Ok(Value::Array(
            updated.into_iter().map(Value::String).collect(),
        ))
    }

    async fn delete_by_id(&mut self, payload: Value) -> DbResult<Value> {
        let payload: DeleteByIdPayload = parse(payload)?;
        let engine = self.selected()?;
        engine.delete_by_id(&payload.section, &payload.id).await?;
        engine.commit().await?;
        Ok(Value::Object(Map::new()))
    }

    async fn delete_by_query(&mut self, payload: Value) -> DbResult<Value> {
        let payload: DeleteByQueryPayload = parse(payload)?;
        let engine = self.selected()?;
        let deleted = engine
            .delete_by_query(&payload.section, &payload.query)
            .await?;
        engine.commit().await?;
        Ok(Value::Array(
            deleted.into_iter().map(Value::String).collect(),
        ))
    }

    async fn purge(&mut self, payload: Value) -> DbResult<Value> {
        let payload: PurgePayload = parse(payload)?;
        let engine = self.selected()?;
        engine.purge(&payload.section).await?;
        engine.commit().await?;
        Ok(Value::Object(Map::new()))
    }

    async fn purge_all(&mut self) -> DbResult<Value> {
        let engine = self.selected()?;
        engine.purge_all().await?;
        engine.commit().await?;
        Ok(Value::Object(Map::new()))
    }

    async fn set_id_generator(&mut self, payload: Value) -> DbResult<Value> {
        let payload: SetIdGeneratorPayload = parse(payload)?;
        let engine = self.selected()?;
        engine.set_id_generator(&payload.generator).await?;
        Ok(Value::String(String::new()))
    }

    fn principal(&self) -> DbResult<&Principal> {
        self.principal
            .as_ref()
            .ok_or_else(|| DbError::InvalidState("no authenticated principal".into()))
    }

    fn selected(&self) -> DbResult<Arc<Engine>> {
        self.selected
            .clone()
            .ok_or_else(|| DbError::InvalidState("no database selected (issue USE_DB first)".into()))
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> DbResult<T> {
    serde_json::from_value(payload)
        .map_err(|err| DbError::BadType(format!("malformed payload: {err}")))
}
