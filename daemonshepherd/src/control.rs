//! Control socket
//! Unix stream socket carrying one JSON request line and one JSON reply
//! line per connection. The socket file is unlinked on orderly close.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::error::{Error, Result};

/// Administrative request, dispatched by the controller.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Reload,
    List,
    Start { daemon: String },
    Stop { daemon: String },
    Restart { daemon: String },
    CancelRestart { daemon: String },
    #[serde(rename = "list-commands")]
    ListCommands { daemon: String },
    AdminCommand { daemon: String, admin_command: String },
}

pub fn reply_ok() -> Value {
    json!({"status": "ok"})
}

pub fn reply_result(result: Value) -> Value {
    json!({"status": "ok", "result": result})
}

pub fn reply_error(reason: impl Into<String>) -> Value {
    json!({"status": "error", "reason": reason.into()})
}

/// Listening end of the control channel.
pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlSocket {
    pub fn bind(path: &Path) -> Result<Self> {
        let listener = UnixListener::bind(path).map_err(|source| Error::SocketBind {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "control socket bound");
        Ok(ControlSocket {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read the single request line of a connection.
///
/// Malformed JSON and unknown commands come back as `Err` with the reason
/// to report; the connection stays usable for the error reply.
pub async fn read_request(stream: &mut BufReader<UnixStream>) -> std::io::Result<Option<Request>> {
    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&line).map_err(|err| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
    })?))
}

/// Write the single reply line and flush.
pub async fn send_reply(stream: &mut BufReader<UnixStream>, reply: &Value) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(reply)?;
    payload.push(b'\n');
    stream.get_mut().write_all(&payload).await?;
    stream.get_mut().flush().await
}

/// Client side: send one request, read one reply.
pub async fn roundtrip(path: &Path, request: &Value) -> std::io::Result<Value> {
    let stream = UnixStream::connect(path).await?;
    let mut stream = BufReader::new(stream);
    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    stream.get_mut().write_all(&payload).await?;
    stream.get_mut().flush().await?;

    let mut line = String::new();
    stream.read_line(&mut line).await?;
    serde_json::from_str(&line)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_command_names() {
        let req: Request = serde_json::from_str(r#"{"command":"reload"}"#).unwrap();
        assert_eq!(req, Request::Reload);

        let req: Request =
            serde_json::from_str(r#"{"command":"cancel_restart","daemon":"d"}"#).unwrap();
        assert_eq!(
            req,
            Request::CancelRestart {
                daemon: "d".to_string()
            }
        );

        let req: Request =
            serde_json::from_str(r#"{"command":"list-commands","daemon":"d"}"#).unwrap();
        assert_eq!(
            req,
            Request::ListCommands {
                daemon: "d".to_string()
            }
        );

        let req: Request = serde_json::from_str(
            r#"{"command":"admin_command","daemon":"d","admin_command":"rotate"}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            Request::AdminCommand {
                daemon: "d".to_string(),
                admin_command: "rotate".to_string()
            }
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"command":"explode"}"#).is_err());
    }

    #[test]
    fn wrong_argument_shape_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"command":"start"}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"command":"start","daemon":7}"#).is_err());
    }

    #[tokio::test]
    async fn roundtrip_over_a_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        let socket = ControlSocket::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let stream = socket.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let request = read_request(&mut stream).await.unwrap().unwrap();
            assert_eq!(request, Request::List);
            send_reply(&mut stream, &reply_result(json!([]))).await.unwrap();
        });

        let reply = roundtrip(&path, &json!({"command": "list"})).await.unwrap();
        assert_eq!(reply["status"], "ok");
        assert_eq!(reply["result"], json!([]));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn socket_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        let socket = ControlSocket::bind(&path).unwrap();
        assert!(path.exists());
        drop(socket);
        assert!(!path.exists());
    }
}
