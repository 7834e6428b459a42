//! HTTP client for the in-guest agent.
//!
//! The agent speaks HTTP/1.1 over the host-guest socket, guarded by
//! mutual TLS: we present the instance's client certificate and accept
//! exactly the agent certificate generated for that instance, nothing
//! else. Endpoints mirror the instance REST subset for state, files and
//! exec.

pub mod transport;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, ServerName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_rustls::TlsConnector;
use tracing::debug;

use self::transport::Transport;
use crate::{Error, Result};

/// vsock port the guest agent listens on.
pub const AGENT_PORT: u32 = 8443;

/// Request body for in-guest command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub stdin: Vec<u8>,
}

/// Outcome of an in-guest command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Metadata for a file push.
#[derive(Debug, Clone, Default)]
pub struct FilePutArgs {
    pub uid: i64,
    pub gid: i64,
    pub mode: u32,
    /// "overwrite" or "append".
    pub write_mode: String,
}

/// Cached, cloneable agent client for one instance.
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<AgentClientInner>,
}

struct AgentClientInner {
    transport: Transport,
    tls: Arc<ClientConfig>,
    server_name: ServerName,
}

impl AgentClient {
    /// Build a client for the instance reachable at `cid`, loading the
    /// client pair and the pinned agent certificate from the instance
    /// directory.
    pub fn new(cid: u32, instance_path: &Path, name: &str) -> Result<Self> {
        Self::with_transport(
            Transport::Vsock {
                cid,
                port: AGENT_PORT,
            },
            instance_path,
            name,
        )
    }

    /// Client over an arbitrary transport; the test suite points this at
    /// a unix socket.
    pub fn with_transport(transport: Transport, instance_path: &Path, name: &str) -> Result<Self> {
        let client_cert = load_certs(&instance_path.join("agent-client.crt"))?;
        let client_key = load_key(&instance_path.join("agent-client.key"))?;
        let pinned = load_certs(&instance_path.join("agent.crt"))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Transport("agent.crt holds no certificate".into()))?;

        let tls = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(PinnedVerifier { pinned }))
            .with_client_auth_cert(client_cert, client_key)
            .map_err(|e| Error::Transport(format!("client certificate rejected: {e}")))?;

        let server_name = ServerName::try_from(name)
            .unwrap_or_else(|_| ServerName::try_from("agent").expect("static name"));

        Ok(Self {
            inner: Arc::new(AgentClientInner {
                transport,
                tls: Arc::new(tls),
                server_name,
            }),
        })
    }

    /// In-guest state report.
    pub async fn get_state(&self) -> Result<Value> {
        let (status, body) = self.request(Method::GET, "/1.0/state", &[], Bytes::new()).await?;
        expect_ok(status, &body)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetch a file from the guest filesystem.
    pub async fn file_get(&self, path: &str) -> Result<Vec<u8>> {
        let uri = format!("/1.0/files?path={}", urlencode(path));
        let (status, body) = self.request(Method::GET, &uri, &[], Bytes::new()).await?;
        expect_ok(status, &body)?;
        Ok(body.to_vec())
    }

    /// Push a file into the guest filesystem.
    pub async fn file_put(&self, path: &str, content: &[u8], args: &FilePutArgs) -> Result<()> {
        let uri = format!("/1.0/files?path={}", urlencode(path));
        let headers = [
            ("X-File-Uid", args.uid.to_string()),
            ("X-File-Gid", args.gid.to_string()),
            ("X-File-Mode", format!("{:o}", args.mode)),
            ("X-File-Write", args.write_mode.clone()),
        ];
        let header_refs: Vec<(&str, &str)> = headers
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .collect();

        let (status, body) = self
            .request(
                Method::POST,
                &uri,
                &header_refs,
                Bytes::copy_from_slice(content),
            )
            .await?;
        expect_ok(status, &body)
    }

    /// Delete a file in the guest filesystem.
    pub async fn file_delete(&self, path: &str) -> Result<()> {
        let uri = format!("/1.0/files?path={}", urlencode(path));
        let (status, body) = self.request(Method::DELETE, &uri, &[], Bytes::new()).await?;
        expect_ok(status, &body)
    }

    /// Run a command inside the guest and collect its output.
    pub async fn exec(&self, req: &ExecRequest) -> Result<ExecResult> {
        let body = serde_json::to_vec(req)?;
        let (status, body) = self
            .request(
                Method::POST,
                "/1.0/exec",
                &[("Content-Type", "application/json")],
                Bytes::from(body),
            )
            .await?;
        expect_ok(status, &body)?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn request(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
        body: Bytes,
    ) -> Result<(StatusCode, Bytes)> {
        let stream = self.inner.transport.connect().await?;

        let connector = TlsConnector::from(self.inner.tls.clone());
        let tls_stream = connector
            .connect(self.inner.server_name.clone(), stream)
            .await
            .map_err(|e| Error::Transport(format!("TLS handshake: {e}")))?;

        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(tls_stream))
                .await
                .map_err(|e| Error::Transport(format!("HTTP handshake: {e}")))?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(hyper::header::HOST, "agent");
        for (key, value) in headers {
            builder = builder.header(*key, *value);
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| Error::Transport(format!("bad request: {e}")))?;

        debug!(uri, "agent request");
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::Transport(format!("agent request failed: {e}")))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Transport(format!("agent response read failed: {e}")))?
            .to_bytes();

        Ok((status, body))
    }
}

fn expect_ok(status: StatusCode, body: &Bytes) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    Err(Error::Transport(format!(
        "agent returned {status}: {}",
        String::from_utf8_lossy(body)
    )))
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::Transport(format!("reading {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .map_err(|e| Error::Transport(format!("parsing {}: {e}", path.display())))?;
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::Transport(format!("reading {}: {e}", path.display())))?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut pem.as_slice())
        .map_err(|e| Error::Transport(format!("parsing {}: {e}", path.display())))?;
    keys.pop()
        .map(PrivateKey)
        .ok_or_else(|| Error::Transport(format!("{} holds no private key", path.display())))
}

/// Accepts exactly the certificate generated for this instance's agent.
struct PinnedVerifier {
    pinned: Certificate,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.0 == self.pinned.0 {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;
    use tokio_rustls::TlsAcceptor;

    /// Serve a single HTTP request over TLS using the instance's agent
    /// certificate, returning a canned body.
    async fn one_shot_agent(listener: UnixListener, instance_path: std::path::PathBuf, body: &'static str) {
        let cert_pem = std::fs::read(instance_path.join("agent.crt")).unwrap();
        let key_pem = std::fs::read(instance_path.join("agent.key")).unwrap();

        let certs: Vec<Certificate> = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .unwrap()
            .into_iter()
            .map(Certificate)
            .collect();
        let key = PrivateKey(
            rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_slice())
                .unwrap()
                .remove(0),
        );

        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();

        let mut buf = [0u8; 4096];
        let _ = tls.read(&mut buf).await.unwrap();

        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        tls.write_all(response.as_bytes()).await.unwrap();
        tls.shutdown().await.ok();
    }

    fn agent_fixture() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let instance_path = dir.path().join("inst");
        std::fs::create_dir_all(&instance_path).unwrap();
        certs::find_or_generate(&instance_path, "web").unwrap();
        (dir, instance_path)
    }

    #[tokio::test]
    async fn test_get_state_round_trip() {
        let (dir, instance_path) = agent_fixture();
        let socket = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        tokio::spawn(one_shot_agent(
            listener,
            instance_path.clone(),
            r#"{"status": "Running", "processes": 12}"#,
        ));

        let client =
            AgentClient::with_transport(Transport::Unix(socket), &instance_path, "web").unwrap();
        let state = client.get_state().await.unwrap();
        assert_eq!(state["status"], "Running");
        assert_eq!(state["processes"], 12);
    }

    #[tokio::test]
    async fn test_pinned_verifier_rejects_other_certs() {
        let (dir, instance_path) = agent_fixture();

        // A second instance's certs: valid TLS, wrong identity.
        let other_path = dir.path().join("other");
        std::fs::create_dir_all(&other_path).unwrap();
        certs::find_or_generate(&other_path, "other").unwrap();

        let socket = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(one_shot_agent(listener, other_path, "{}"));

        let client =
            AgentClient::with_transport(Transport::Unix(socket), &instance_path, "web").unwrap();
        let err = client.get_state().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("/etc/host name"), "/etc/host%20name");
        assert_eq!(urlencode("/plain/path"), "/plain/path");
    }

    #[test]
    fn test_exec_request_shape() {
        let req = ExecRequest {
            command: vec!["uname".into(), "-a".into()],
            environment: BTreeMap::new(),
            cwd: String::new(),
            stdin: Vec::new(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: ExecRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.command, vec!["uname", "-a"]);
    }
}
