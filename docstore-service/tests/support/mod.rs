use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::net::TcpStream;

use common_proto::{read_frame, write_frame, Response};
use docstore_service::catalog::{credentials_blob, password_token};
use docstore_service::{Catalog, Server};

/// A server booted on a free port inside a scratch directory, plus the
/// handle needed to tear it down.
pub struct TestServer {
    pub addr: SocketAddr,
    pub dir: tempfile::TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub fn db_file(&self, dbname: &str) -> PathBuf {
        self.dir.path().join(format!("{dbname}.json"))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn_server(users: &[(&str, &str)]) -> Result<TestServer> {
    let dir = tempfile::tempdir()?;
    let port = portpicker::pick_unused_port().context("no free port available")?;

    let users = users
        .iter()
        .map(|(user, password)| {
            json!({"user": user, "passwd": password_token(user, password), "access": []})
        })
        .collect::<Vec<_>>();
    let config = json!({
        "host": "127.0.0.1",
        "port": port,
        "path": dir.path().to_str().context("non-utf8 tempdir")?,
        "databases": [],
        "users": users,
    });
    let config_path = dir.path().join("config.json");
    tokio::fs::write(&config_path, serde_json::to_vec_pretty(&config)?).await?;

    let catalog = Catalog::load(&config_path).await?;
    let server = Server::bind(Arc::new(catalog)).await?;
    let addr = server.local_addr()?;
    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });

    Ok(TestServer { addr, dir, handle })
}

/// Minimal framed protocol client used to drive the server end to end.
pub struct TestClient {
    stream: TcpStream,
    key: Option<String>,
    passwd: Option<String>,
    encrypt: bool,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Ok(TestClient {
            stream: TcpStream::connect(addr).await?,
            key: None,
            passwd: None,
            encrypt: false,
        })
    }

    /// Issue `AUTH`; on success the session key and outer transform settings
    /// stick for every subsequent request.
    pub async fn auth(&mut self, user: &str, password: &str, encrypt: bool) -> Result<Response> {
        let request = json!({
            "cmd": "AUTH",
            "auth": null,
            "payload": {"credentials": credentials_blob(user, password), "encrypt": encrypt},
        });
        let encoded = common_codec::obscure(request.to_string().as_bytes());
        write_frame(&mut self.stream, encoded.as_bytes()).await?;

        let raw = read_frame(&mut self.stream).await?;
        // A successful AUTH reply already uses the post-auth transform; a
        // rejected one is still obscured.
        let plain = if encrypt {
            match common_codec::password_decrypt(&raw, password) {
                Ok(plain) => plain,
                Err(_) => common_codec::unobscure(&raw)?,
            }
        } else {
            common_codec::unobscure(&raw)?
        };
        let response: Response = serde_json::from_slice(&plain)?;
        if response.is_ok() {
            self.key = response.data.as_str().map(str::to_string);
            self.passwd = Some(password.to_string());
            self.encrypt = encrypt;
        }
        Ok(response)
    }

    pub async fn send(&mut self, cmd: &str, payload: Value) -> Result<Response> {
        let auth = self.key.clone();
        self.roundtrip(json!({"cmd": cmd, "auth": auth, "payload": payload}))
            .await
    }

    /// Like [`TestClient::send`] with an explicit session key, for driving
    /// the server with a token it never issued.
    pub async fn send_with_key(
        &mut self,
        cmd: &str,
        payload: Value,
        key: Option<&str>,
    ) -> Result<Response> {
        self.roundtrip(json!({"cmd": cmd, "auth": key, "payload": payload}))
            .await
    }

    async fn roundtrip(&mut self, request: Value) -> Result<Response> {
        let bytes = request.to_string().into_bytes();
        let encoded = match (&self.key, &self.passwd) {
            (Some(_), Some(passwd)) if self.encrypt => {
                common_codec::password_encrypt(&bytes, passwd)
            }
            _ => common_codec::obscure(&bytes),
        };
        write_frame(&mut self.stream, encoded.as_bytes()).await?;

        let raw = read_frame(&mut self.stream).await?;
        let plain = match (&self.key, &self.passwd) {
            (Some(_), Some(passwd)) if self.encrypt => {
                common_codec::password_decrypt(&raw, passwd)?
            }
            _ => common_codec::unobscure(&raw)?,
        };
        Ok(serde_json::from_slice(&plain)?)
    }

    /// Send a request and require a `NoError` response.
    pub async fn expect_ok(&mut self, cmd: &str, payload: Value) -> Result<Value> {
        let response = self.send(cmd, payload).await?;
        anyhow::ensure!(
            response.is_ok(),
            "{cmd} failed: {} ({})",
            response.error,
            response.data
        );
        Ok(response.data)
    }
}
