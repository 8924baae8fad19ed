//! # Talk Relay WebSocket
//!
//! Lets a browser (or any WebSocket client) hold a two-way conversation
//! through the doorbell. Clients connect to `/api/v1/devices/{id}/talk`.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: The relay starts the device's talk session if it is
//!    not already active and tells the client with a `session` message
//! 2. **Client → Relay**: Binary frames of device-format audio, forwarded in
//!    order to the doorbell speaker
//! 3. **Relay → Client**: Binary frames from the doorbell microphone
//! 4. **Disconnect**: If this socket started the session, it stops it
//!
//! ## Message Format:
//! Status and errors are JSON text frames tagged by `type`.

use crate::handlers::ready_device;
use crate::intercom::{SessionCoordinator, SessionState};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Text messages sent to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TalkEvent {
    /// Session is open and audio is flowing
    Session {
        device: String,
        state: SessionState,
        owns_session: bool,
    },
    /// Something went wrong; the socket closes after this
    Error { message: String },
}

impl TalkEvent {
    fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Result of opening the relay: who owns the session and the microphone feed.
type Opened = Result<(bool, broadcast::Receiver<Vec<u8>>), String>;

/// Message sent by the outbound pump when relaying stops working.
#[derive(Message)]
#[rtype(result = "()")]
struct RelayFailed(String);

/// WebSocket actor for one talk connection.
///
/// ## Actor Model:
/// Each connection is an independent actor. Audio from the client goes
/// through an unbounded queue to a pump task so frames reach the device in
/// the order they arrived, without blocking the actor.
pub struct TalkSocket {
    device_id: String,
    coordinator: Arc<SessionCoordinator>,
    state: web::Data<AppState>,
    /// True when this socket started the session and must stop it
    owns_session: bool,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    last_heartbeat: Instant,
}

impl TalkSocket {
    pub fn new(
        device_id: String,
        coordinator: Arc<SessionCoordinator>,
        state: web::Data<AppState>,
    ) -> Self {
        Self {
            device_id,
            coordinator,
            state,
            owns_session: false,
            outbound: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(device = %act.device_id, "Talk socket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn fail(&self, ctx: &mut ws::WebsocketContext<Self>, message: String) {
        error!(device = %self.device_id, "Talk relay failed: {}", message);
        if let Some(json) = (TalkEvent::Error { message }).to_json() {
            ctx.text(json);
        }
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Error,
            description: None,
        }));
        ctx.stop();
    }

    /// Start the outbound pump draining client audio into the device.
    fn spawn_pump(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.outbound = Some(tx);

        let coordinator = self.coordinator.clone();
        let addr = ctx.address();
        actix_web::rt::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match coordinator.send_audio(frame).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Dropped audio frame; to-device channel unavailable"),
                    Err(err) => {
                        addr.do_send(RelayFailed(err.to_string()));
                        break;
                    }
                }
            }
        });
    }
}

async fn open_relay(coordinator: Arc<SessionCoordinator>) -> Opened {
    let owns_session = if coordinator.state() == SessionState::Active {
        false
    } else if coordinator.start().await {
        true
    } else {
        return Err("Failed to start session".to_string());
    };

    match coordinator.listen().await {
        Ok(inbound) => Ok((owns_session, inbound)),
        Err(err) => {
            if owns_session {
                coordinator.stop().await;
            }
            Err(err.to_string())
        }
    }
}

impl Actor for TalkSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(device = %self.device_id, "Talk socket connected");
        self.state.increment_talk_sockets();
        self.start_heartbeat(ctx);

        // Hold back client frames until the session is open.
        let opening = open_relay(self.coordinator.clone())
            .into_actor(self)
            .map(|opened: Opened, act, ctx| match opened {
                Ok((owns_session, inbound)) => {
                    act.owns_session = owns_session;
                    ctx.add_stream(BroadcastStream::new(inbound));
                    act.spawn_pump(ctx);

                    let event = TalkEvent::Session {
                        device: act.device_id.clone(),
                        state: act.coordinator.state(),
                        owns_session,
                    };
                    if let Some(json) = event.to_json() {
                        ctx.text(json);
                    }
                }
                Err(message) => act.fail(ctx, message),
            });
        ctx.wait(opening);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(device = %self.device_id, "Talk socket disconnected");
        self.state.decrement_talk_sockets();
        self.outbound.take();

        if self.owns_session {
            let coordinator = self.coordinator.clone();
            actix_web::rt::spawn(async move {
                coordinator.stop().await;
            });
        }
    }
}

/// Client frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TalkSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                if let Some(outbound) = &self.outbound {
                    if outbound.send(data.to_vec()).is_err() {
                        warn!(device = %self.device_id, "Audio pump stopped; dropping frame");
                    }
                }
            }
            Ok(ws::Message::Text(text)) => {
                debug!(device = %self.device_id, "Ignoring text frame: {}", text);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(device = %self.device_id, "Talk socket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(device = %self.device_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(device = %self.device_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Microphone frames from the device.
impl StreamHandler<Result<Vec<u8>, BroadcastStreamRecvError>> for TalkSocket {
    fn handle(&mut self, item: Result<Vec<u8>, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match item {
            Ok(frame) => ctx.binary(frame),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(device = %self.device_id, skipped = skipped, "Talk socket lagging; frames dropped");
            }
        }
    }

    /// The from-device channel closed (session stopped or aborted elsewhere).
    fn finished(&mut self, ctx: &mut Self::Context) {
        info!(device = %self.device_id, "Device audio ended, closing talk socket");
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

impl Handler<RelayFailed> for TalkSocket {
    type Result = ();

    fn handle(&mut self, msg: RelayFailed, ctx: &mut Self::Context) {
        self.fail(ctx, msg.0);
    }
}

/// `GET /api/v1/devices/{id}/talk`
///
/// ## HTTP to WebSocket Upgrade:
/// Checks the device, then hands the connection to a [`TalkSocket`] actor.
pub async fn talk(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, actix_web::Error> {
    let device_id = path.into_inner();
    let entry = ready_device(&state, &device_id)?;

    let peer = req.connection_info().peer_addr().map(str::to_string);
    info!(device = %device_id, peer = ?peer, "New talk connection request");

    let socket = TalkSocket::new(device_id, entry.coordinator.clone(), state.clone());
    ws::start(socket, &req, stream)
}
