//! Control socket
//! Administrative channel: a Unix stream socket, one JSON request line
//! and one JSON reply line per connection. Validation failures all
//! collapse into `{"error": "bad request"}`; the server stays up.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::FlowId;
use crate::tracker::StateTracker;

/// Administrative request. `location`, when present, must be an object.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub aspect: Option<String>,
    #[serde(default)]
    pub location: Option<Map<String, Value>>,
    #[serde(default)]
    pub duration: Option<i64>,
}

pub fn bad_request() -> Value {
    json!({"error": "bad request"})
}

pub fn reply_result(result: Value) -> Value {
    json!({"result": result})
}

/// Apply one control request to the tracker.
pub fn dispatch(tracker: &mut StateTracker, request: &Request, now: i64) -> Value {
    let flow_id = || -> Option<FlowId> {
        let aspect = request.aspect.as_deref()?;
        let location = request.location.as_ref()?;
        Some(FlowId::new(aspect, location))
    };

    match request.command.as_str() {
        "list" => {
            let rows: Vec<Value> = tracker
                .list()
                .into_iter()
                .map(|row| {
                    json!({
                        "aspect": row.aspect,
                        "location": row.location,
                        "info": row.info,
                    })
                })
                .collect();
            reply_result(json!(rows))
        }
        "list_muted" => {
            let rows: Vec<Value> = tracker
                .list_muted()
                .into_iter()
                .map(|(id, expires)| {
                    json!({
                        "aspect": id.aspect,
                        "location": id.location_object(),
                        "expires": expires,
                    })
                })
                .collect();
            reply_result(json!(rows))
        }
        "forget" => match flow_id() {
            Some(id) => reply_result(json!(tracker.forget(&id))),
            None => bad_request(),
        },
        "mute" => match (flow_id(), request.duration) {
            (Some(id), Some(duration)) if duration > 0 => {
                tracker.mute(id, duration, now);
                reply_result(json!(true))
            }
            _ => bad_request(),
        },
        "unmute" => match flow_id() {
            Some(id) => reply_result(json!(tracker.unmute(&id))),
            None => bad_request(),
        },
        "reset_flapping" => match flow_id() {
            Some(id) => reply_result(json!(tracker.reset_flapping(&id))),
            None => bad_request(),
        },
        "reset_reminder" => match flow_id() {
            Some(id) => reply_result(json!(tracker.reset_reminder(&id))),
            None => bad_request(),
        },
        _ => bad_request(),
    }
}

/// Listening end of the control channel; the socket file is unlinked on
/// drop.
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

/// Read the single request line; `Ok(None)` when the client hung up,
/// `Err` when the line does not validate.
pub async fn read_request(
    stream: &mut BufReader<UnixStream>,
) -> std::io::Result<Option<Request>> {
    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&line).map_err(|err| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
    })?))
}

pub async fn send_reply(stream: &mut BufReader<UnixStream>, reply: &Value) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(reply)?;
    payload.push(b'\n');
    stream.get_mut().write_all(&payload).await?;
    stream.get_mut().flush().await
}

/// Client side: one request, one reply.
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
    use crate::message::Message;
    use crate::tracker::TrackerOptions;

    fn request(value: Value) -> Request {
        serde_json::from_value(value).unwrap()
    }

    fn tracker_with_flow() -> StateTracker {
        let mut tracker = StateTracker::new(TrackerOptions::default());
        let message = Message::parse(
            r#"{"time":100,"aspect":"cpu","location":{"host":"h1"},"state":"high","severity":"error"}"#,
        )
        .unwrap();
        tracker.handle_message(&message, 100);
        tracker
    }

    #[test]
    fn location_must_be_an_object() {
        let parsed: std::result::Result<Request, _> = serde_json::from_str(
            r#"{"command":"forget","aspect":"cpu","location":"host=h1"}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn list_returns_flow_rows() {
        let mut tracker = tracker_with_flow();
        let reply = dispatch(&mut tracker, &request(json!({"command":"list"})), 100);
        let rows = reply["result"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["aspect"], "cpu");
        assert_eq!(rows[0]["info"]["status"], "degraded");
    }

    #[test]
    fn forget_removes_the_flow() {
        let mut tracker = tracker_with_flow();
        let forget = json!({"command":"forget","aspect":"cpu","location":{"host":"h1"}});
        let reply = dispatch(&mut tracker, &request(forget.clone()), 100);
        assert_eq!(reply["result"], json!(true));
        let reply = dispatch(&mut tracker, &request(forget), 100);
        assert_eq!(reply["result"], json!(false));
    }

    #[test]
    fn mute_requires_positive_duration() {
        let mut tracker = tracker_with_flow();
        let reply = dispatch(
            &mut tracker,
            &request(json!({"command":"mute","aspect":"cpu","location":{"host":"h1"}})),
            100,
        );
        assert_eq!(reply, bad_request());
        let reply = dispatch(
            &mut tracker,
            &request(
                json!({"command":"mute","aspect":"cpu","location":{"host":"h1"},"duration":0}),
            ),
            100,
        );
        assert_eq!(reply, bad_request());
        let reply = dispatch(
            &mut tracker,
            &request(
                json!({"command":"mute","aspect":"cpu","location":{"host":"h1"},"duration":60}),
            ),
            100,
        );
        assert_eq!(reply["result"], json!(true));

        let reply = dispatch(&mut tracker, &request(json!({"command":"list_muted"})), 100);
        let rows = reply["result"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["expires"], json!(160));
        assert_eq!(rows[0]["location"], json!({"host":"h1"}));
    }

    #[test]
    fn mute_may_target_an_unseen_flow() {
        let mut tracker = StateTracker::new(TrackerOptions::default());
        let reply = dispatch(
            &mut tracker,
            &request(
                json!({"command":"mute","aspect":"disk","location":{"host":"h9"},"duration":30}),
            ),
            100,
        );
        assert_eq!(reply["result"], json!(true));
    }

    #[test]
    fn unknown_command_is_a_bad_request() {
        let mut tracker = tracker_with_flow();
        let reply = dispatch(&mut tracker, &request(json!({"command":"explode"})), 100);
        assert_eq!(reply, bad_request());
    }
}
