//! One request/response exchange per connection.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::error::{KbError, KbResult};

use super::protocol::{AdminAction, Request, Response, PING_ACK};
use super::Daemon;

pub(super) async fn handle_connection(stream: UnixStream, daemon: Arc<Daemon>) -> KbResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let limit = daemon.config.max_request_bytes;
    let mut reader = BufReader::new(read_half.take(limit as u64 + 1));
    let mut line = Vec::new();

    let read = tokio::time::timeout(
        daemon.config.request_timeout(),
        reader.read_until(b'\n', &mut line),
    )
    .await;
    let bytes = match read {
        Ok(result) => result?,
        Err(_) => {
            debug!("client sent no request in time");
            return Ok(());
        }
    };
    if bytes == 0 {
        return Ok(());
    }

    let mut stop_requested = false;
    let response = if !line.ends_with(b"\n") && line.len() > limit {
        warn!(limit, "request too large");
        Response::failure(&KbError::Protocol(format!(
            "request exceeds {limit} bytes"
        )))
    } else {
        match serde_json::from_slice::<Request>(&line) {
            Ok(request) => {
                debug!(cmd = request.name(), "request");
                stop_requested = request == Request::Stop;
                dispatch(&daemon, request).await
            }
            Err(err) => {
                debug!(error = %err, "malformed request");
                Response::failure(&KbError::Protocol(format!("malformed request: {err}")))
            }
        }
    };

    let mut payload = serde_json::to_vec(&response)?;
    payload.push(b'\n');
    let written = write_half.write_all(&payload).await;
    let flushed = write_half.flush().await;

    if stop_requested {
        daemon.request_shutdown("stop requested");
    }
    written?;
    flushed?;
    Ok(())
}

async fn dispatch(daemon: &Arc<Daemon>, request: Request) -> Response {
    match request {
        Request::Ping => Response::success(PING_ACK),
        Request::Status => Response::success(daemon.status()),
        Request::Stop => Response::success("stopping"),
        Request::Append { fact } => {
            daemon.touch();
            match daemon.with_store(move |store| store.append(fact)).await {
                Ok(outcome) => {
                    if outcome.rebuild_needed {
                        daemon.schedule_rebuild();
                    }
                    Response::success(outcome)
                }
                Err(err) => failure(err),
            }
        }
        Request::Query {
            text,
            filters,
            top_k,
        } => {
            daemon.touch();
            let result = daemon
                .with_store(move |store| store.query(&text, &filters, top_k))
                .await;
            respond(result)
        }
        Request::Admin { action } => {
            let result = match action {
                AdminAction::Init => daemon
                    .with_store(|store| store.init())
                    .await
                    .and_then(to_value),
                AdminAction::Rebuild => daemon
                    .with_store(|store| store.rebuild())
                    .await
                    .and_then(to_value),
                AdminAction::Validate => daemon
                    .with_store(|store| store.validate())
                    .await
                    .and_then(to_value),
                AdminAction::Repair => daemon
                    .with_store(|store| store.repair())
                    .await
                    .and_then(to_value),
            };
            respond(result)
        }
    }
}

fn to_value<T: serde::Serialize>(value: T) -> KbResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn respond<T: serde::Serialize>(result: KbResult<T>) -> Response {
    match result {
        Ok(value) => Response::success(value),
        Err(err) => failure(err),
    }
}

fn failure(err: KbError) -> Response {
    match &err {
        KbError::NotInitialized(_) | KbError::Protocol(_) | KbError::Cancelled => {
            debug!(code = err.code(), error = %err, "request rejected")
        }
        _ => warn!(code = err.code(), error = %err, "request failed"),
    }
    Response::failure(&err)
}
