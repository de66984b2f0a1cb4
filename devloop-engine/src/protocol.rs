//! Client side of the control socket.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, EngineError};
use crate::paths::socket_path;
use crate::view::EngineView;

/// JSON newline-delimited request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineRequest {
    pub cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl EngineRequest {
    pub fn status() -> Self {
        Self {
            cmd: "status".to_string(),
            target: None,
        }
    }

    pub fn trigger(target: impl Into<String>) -> Self {
        Self {
            cmd: "trigger".to_string(),
            target: Some(target.into()),
        }
    }

    pub fn stop() -> Self {
        Self {
            cmd: "stop".to_string(),
            target: None,
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EngineResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// How long `status` waits for an engine that is still binding its socket.
pub const STARTUP_GRACE: Duration = Duration::from_millis(500);
const STARTUP_POLL: Duration = Duration::from_millis(50);
/// Upper bound on waiting for one response line.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocking client for one project's control socket.
#[derive(Debug, Clone)]
pub struct EngineClient {
    socket: PathBuf,
    timeout: Duration,
}

impl EngineClient {
    pub fn new(root: &Path) -> Self {
        Self {
            socket: socket_path(root),
            timeout: RESPONSE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait up to `grace` for an engine started moments ago to accept
    /// connections. A socket file nobody listens on counts as not running.
    pub fn wait_until_listening(&self, grace: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now() + grace;
        loop {
            match self.connect() {
                Ok(_) => return Ok(()),
                Err(err @ EngineError::EngineNotRunning { .. }) => {
                    if self.socket.exists() || Instant::now() >= deadline {
                        return Err(err);
                    }
                    sleep(STARTUP_POLL);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One request, one response line.
    pub fn send(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
        let mut stream = self.connect()?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| io_err(&self.socket, e))?;

        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        stream
            .write_all(&payload)
            .map_err(|e| io_err(&self.socket, e))?;

        let mut line = String::new();
        match BufReader::new(stream).read_line(&mut line) {
            Ok(0) => Err(EngineError::Protocol(
                "engine closed connection before responding".to_string(),
            )),
            Ok(_) => Ok(serde_json::from_str(line.trim_end())?),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(EngineError::Protocol(format!(
                    "engine did not answer '{}' within {:?}",
                    request.cmd, self.timeout
                )))
            }
            Err(err) => Err(io_err(&self.socket, err)),
        }
    }

    /// Send `request` and unwrap the `data` of a successful response.
    pub fn call(&self, request: &EngineRequest) -> Result<Value, EngineError> {
        response_into_data(self.send(request)?)
    }

    fn connect(&self) -> Result<UnixStream, EngineError> {
        UnixStream::connect(&self.socket).map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                EngineError::EngineNotRunning {
                    socket: self.socket.clone(),
                }
            }
            _ => io_err(&self.socket, err),
        })
    }
}

/// Current engine view, allowing for an engine that is still starting.
pub fn request_status(root: &Path) -> Result<EngineView, EngineError> {
    let client = EngineClient::new(root);
    client.wait_until_listening(STARTUP_GRACE)?;
    Ok(serde_json::from_value(client.call(&EngineRequest::status())?)?)
}

pub fn request_trigger(root: &Path, target: &str) -> Result<Value, EngineError> {
    EngineClient::new(root).call(&EngineRequest::trigger(target))
}

pub fn request_stop(root: &Path) -> Result<(), EngineError> {
    EngineClient::new(root)
        .call(&EngineRequest::stop())
        .map(|_| ())
}

fn response_into_data(response: EngineResponse) -> Result<Value, EngineError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(EngineError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown engine error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_omit_absent_target() {
        let status = serde_json::to_string(&EngineRequest::status()).expect("encode");
        assert_eq!(status, r#"{"cmd":"status"}"#);
        let trigger = serde_json::to_string(&EngineRequest::trigger("web")).expect("encode");
        assert_eq!(trigger, r#"{"cmd":"trigger","target":"web"}"#);
    }

    #[test]
    fn missing_socket_means_not_running() {
        let root = tempfile::TempDir::new().expect("root");
        let client = EngineClient::new(root.path());
        let err = client.send(&EngineRequest::status()).expect_err("no engine");
        assert!(matches!(err, EngineError::EngineNotRunning { .. }));

        let waited = Instant::now();
        let err = client
            .wait_until_listening(Duration::from_millis(120))
            .expect_err("no engine");
        assert!(matches!(err, EngineError::EngineNotRunning { .. }));
        assert!(waited.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn stale_socket_file_fails_without_waiting() {
        let root = tempfile::TempDir::new().expect("root");
        let socket = socket_path(root.path());
        std::fs::create_dir_all(socket.parent().expect("runtime dir")).expect("mkdir");
        drop(std::os::unix::net::UnixListener::bind(&socket).expect("bind"));
        assert!(socket.exists(), "listener gone, file left behind");

        let waited = Instant::now();
        let err = EngineClient::new(root.path())
            .wait_until_listening(Duration::from_secs(5))
            .expect_err("nobody listening");
        assert!(matches!(err, EngineError::EngineNotRunning { .. }));
        assert!(waited.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn silent_engine_times_out() {
        let root = tempfile::TempDir::new().expect("root");
        let socket = socket_path(root.path());
        std::fs::create_dir_all(socket.parent().expect("runtime dir")).expect("mkdir");
        let _listener = std::os::unix::net::UnixListener::bind(&socket).expect("bind");

        let err = EngineClient::new(root.path())
            .with_timeout(Duration::from_millis(100))
            .send(&EngineRequest::status())
            .expect_err("no answer");
        assert!(
            err.to_string().contains("did not answer 'status'"),
            "{err}"
        );
    }

    #[test]
    fn error_responses_surface_their_message() {
        let err = response_into_data(EngineResponse::error("unknown target 'api'"))
            .expect_err("error response");
        assert_eq!(err.to_string(), "engine protocol error: unknown target 'api'");
    }
}
