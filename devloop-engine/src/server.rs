//! Control socket: newline-delimited JSON at `<root>/.devloop/devloop.sock`.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use devloop_core::TargetName;

use crate::action::Action;
use crate::error::{io_err, EngineError};
use crate::protocol::{EngineRequest, EngineResponse};
use crate::store::StoreHandle;
use crate::view::EngineView;

pub(crate) async fn socket_server_task(
    socket: PathBuf,
    store: StoreHandle,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    if let Some(dir) = socket.parent() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let store = store.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, store, cancel).await {
                        error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    store: StoreHandle,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("engine socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: EngineRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &EngineResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = respond(&request, &store, &cancel)?;
        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

/// Answer one request against the current snapshot.
pub(crate) fn respond(
    request: &EngineRequest,
    store: &StoreHandle,
    cancel: &CancellationToken,
) -> Result<EngineResponse, EngineError> {
    let response = match request.cmd.as_str() {
        "status" => {
            let view = EngineView::from_state(&store.snapshot());
            EngineResponse::ok(serde_json::to_value(view)?)
        }
        "trigger" => match request.target.as_deref() {
            None => EngineResponse::error("trigger requires a target"),
            Some(name) => {
                let target = TargetName::from(name);
                if store.snapshot().target(&target).is_none() {
                    EngineResponse::error(format!("unknown target '{name}'"))
                } else if store.dispatch(Action::trigger(target)) {
                    info!(target = name, "build triggered");
                    EngineResponse::ok(json!({ "triggered": name }))
                } else {
                    EngineResponse::error("engine is shutting down")
                }
            }
        },
        "stop" => {
            info!("stop requested");
            cancel.cancel();
            EngineResponse::ok(json!({ "stopping": true }))
        }
        other => EngineResponse::error(format!("unknown command '{other}'")),
    };
    Ok(response)
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), EngineError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(EngineError::Protocol(format!(
                "engine socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale engine socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &EngineResponse,
) -> Result<(), EngineError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("engine socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("engine socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("engine socket flush", e))?;
    Ok(())
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), EngineError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), EngineError> {
    Ok(())
}
