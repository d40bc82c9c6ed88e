//! The `/ws` console endpoint.
//!
//! Clients arrive with a one-time ticket minted by
//! `GET /api/vms/{id}/serial-console`, upgrade to a WebSocket, and speak
//! event-typed JSON frames:
//!
//! ```text
//! client -> server   console.connect {vmName}     optional sanity check
//! client -> server   console.input {text}
//! server -> client   console.output {text}
//! server -> client   console.disconnected
//! server -> client   console.error {error}
//! ```

use anyhow::{format_err, Error};
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, UPGRADE};
use http::StatusCode;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use vdc_api_types::{api_err, time::epoch_i64, Ulid};
use vdc_console::websocket::{
    encode_close, encode_frame, handshake_response, CloseCode, FrameReader, OpCode,
};
use vdc_rest_server::{
    ApiHandler, ApiMethod, ApiResponseFuture, Body, Router, SubdirMap,
};

use crate::context::state;

const WS_SUBDIRS: SubdirMap = &[("ws", &WS_ROUTER)];

/// The tree served on the WebSocket listener.
pub static ROOT_ROUTER: Router = Router::new().subdirs(WS_SUBDIRS);

static WS_ROUTER: Router = Router::new().get(&API_METHOD_CONSOLE_WS);
static API_METHOD_CONSOLE_WS: ApiMethod =
    ApiMethod::new(&ApiHandler::Raw(&console_ws)).status(101);

fn console_ws(mut req: Request<Incoming>, param: Value) -> ApiResponseFuture {
    Box::pin(async move {
        let app = state();

        let ticket = param
            .get("ticket")
            .and_then(Value::as_str)
            .ok_or_else(|| api_err!(Unauthorized, "missing console ticket"))?;
        let Some(vm_id) = app.tickets.redeem(ticket, epoch_i64()) else {
            return Err(api_err!(Unauthorized, "invalid or expired console ticket"));
        };

        let accept = handshake_response(req.headers())
            .map_err(|err| api_err!(Validation, "websocket handshake failed: {err}"))?;

        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let io = TokioIo::new(upgraded);
                    if let Err(err) = run_session(io, vm_id).await {
                        debug!(vm = %vm_id, "console session ended: {err:#}");
                    }
                }
                Err(err) => warn!(vm = %vm_id, "websocket upgrade failed: {err}"),
            }
        });

        let response = http::Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header(SEC_WEBSOCKET_ACCEPT, accept)
            .body(Body::new(bytes::Bytes::new()))?;
        Ok(response)
    })
}

async fn event_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    event: &Value,
) -> Result<(), Error> {
    let frame = encode_frame(OpCode::Text, event.to_string().as_bytes())?;
    writer.write_all(&frame).await?;
    Ok(())
}

async fn run_session<S>(io: S, vm_id: Ulid) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let app = state();

    // join the VM's session, opening the host stream on first use
    let handle = match app.hub.attach(vm_id) {
        Some(handle) => handle,
        None => {
            let (vm, _) = app.lookup_vm(vm_id)?;
            let socket = vm
                .serial_socket
                .clone()
                .ok_or_else(|| format_err!("vm '{}' has no serial console", vm.name))?;
            let host = vm
                .host
                .clone()
                .ok_or_else(|| format_err!("vm '{}' has no owner host", vm.name))?;
            let driver = app.driver(&host)?;
            let stream = driver.open_serial_console(&socket).await?;
            app.hub.open(vm_id, Box::new(stream))
        }
    };

    info!(vm = %vm_id, "console client connected");

    let (reader, mut writer) = tokio::io::split(io);
    let mut frames = FrameReader::new(reader);
    let mut output = handle.output.resubscribe();

    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Ok(bytes) => {
                    let event = json!({
                        "type": "console.output",
                        "text": String::from_utf8_lossy(&bytes),
                    });
                    event_frame(&mut writer, &event).await?;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // the 64 KiB fan-out budget ran out for this client
                    let event = json!({ "type": "console.error", "error": "slow_consumer" });
                    let _ = event_frame(&mut writer, &event).await;
                    let close = encode_close(CloseCode::Policy, "slow_consumer")?;
                    let _ = writer.write_all(&close).await;
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    let event = json!({ "type": "console.disconnected" });
                    let _ = event_frame(&mut writer, &event).await;
                    let close = encode_close(CloseCode::Normal, "")?;
                    let _ = writer.write_all(&close).await;
                    break;
                }
            },
            frame = frames.next_frame() => match frame? {
                None => break,
                Some(frame) => match frame.opcode {
                    OpCode::Text | OpCode::Binary => {
                        handle_client_event(app, &handle, &mut writer, &frame.payload).await?;
                    }
                    OpCode::Ping => {
                        let pong = encode_frame(OpCode::Pong, &frame.payload)?;
                        writer.write_all(&pong).await?;
                    }
                    OpCode::Close => {
                        let close = encode_close(CloseCode::Normal, "")?;
                        let _ = writer.write_all(&close).await;
                        break;
                    }
                    _ => (),
                },
            },
        }
    }

    info!(vm = %vm_id, "console client disconnected");
    Ok(())
}

async fn handle_client_event<W: AsyncWrite + Unpin>(
    app: &'static crate::context::AppState,
    handle: &vdc_console::ClientHandle,
    writer: &mut W,
    payload: &[u8],
) -> Result<(), Error> {
    let event: Value = match serde_json::from_slice(payload) {
        Ok(event) => event,
        Err(_) => {
            let event = json!({ "type": "console.error", "error": "invalid frame" });
            return event_frame(writer, &event).await;
        }
    };

    match event.get("type").and_then(Value::as_str) {
        Some("console.input") => {
            if let Some(text) = event.get("text").and_then(Value::as_str) {
                handle.send_input(text.as_bytes().to_vec()).await?;
            }
        }
        Some("console.connect") => {
            // the ticket already pins the VM; reject a mismatched name
            if let Some(name) = event.get("vmName").and_then(Value::as_str) {
                let (vm, _) = app.lookup_vm(handle.vm())?;
                if vm.name != name {
                    let event = json!({
                        "type": "console.error",
                        "error": format!("ticket is not valid for vm '{name}'"),
                    });
                    event_frame(writer, &event).await?;
                }
            }
        }
        _ => {
            let event = json!({ "type": "console.error", "error": "unknown event type" });
            event_frame(writer, &event).await?;
        }
    }
    Ok(())
}
