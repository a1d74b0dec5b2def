//! # Call Socket
//!
//! One WebSocket connection is one phone call. Callers connect to
//! `/llm-websocket` and exchange JSON text frames (see [`crate::protocol`]).
//!
//! ## Actor Model:
//! Each connection is an independent actix actor. Its mailbox handles two
//! streams in arrival order:
//! 1. **Inbound frames** from the socket, decoded and handed to the
//!    connection's [`TurnCoordinator`]
//! 2. **Outbound fragments** produced by relay tasks, written to the socket
//!    unless their turn was abandoned in the meantime
//!
//! Both run on the actor, so a newer turn accepted from an inbound frame is
//! always visible to the write check of every fragment handled after it.
//!
//! ## Lifecycle:
//! - **started**: outbound stream attached, heartbeat armed, call counted
//! - **stopped**: coordinator torn down (every relay cancelled), call uncounted

use crate::config::SessionConfig;
use crate::coordinator::{OutboundFragment, TurnCoordinator};
use crate::prompt::PromptAssembler;
use crate::protocol;
use crate::state::{AppMetrics, AppState};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct CallSocket {
    /// Identifies this call in logs
    call_id: String,

    coordinator: TurnCoordinator,

    /// Taken once the actor starts and attached as a stream
    outbound: Option<mpsc::UnboundedReceiver<OutboundFragment>>,

    settings: SessionConfig,

    metrics: Arc<AppMetrics>,

    /// Last time the caller showed any sign of life
    last_heartbeat: Instant,
}

impl CallSocket {
    pub fn new(app_state: &AppState) -> Self {
        let call_id = Uuid::new_v4().to_string();
        let config = &app_state.config;
        let (tx, rx) = mpsc::unbounded_channel();

        let coordinator = TurnCoordinator::new(
            call_id.clone(),
            app_state.provider.clone(),
            PromptAssembler::from_config(&config.prompt),
            config.prompt.greeting.clone(),
            tx,
            app_state.metrics.clone(),
        );

        Self {
            call_id,
            coordinator,
            outbound: Some(rx),
            settings: config.session.clone(),
            metrics: app_state.metrics.clone(),
            last_heartbeat: Instant::now(),
        }
    }

    fn handle_text(&mut self, text: &str) {
        match protocol::decode(text) {
            Ok(event) => {
                // Relay tasks run detached; their outcome is logged and counted by the coordinator
                let _ = self.coordinator.handle(event);
            }
            Err(err) => {
                warn!(call_id = %self.call_id, error = %err, "Dropping undecodable frame");
            }
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let client_timeout = self.settings.client_timeout();

        ctx.run_interval(self.settings.heartbeat_interval(), move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!(call_id = %act.call_id, "Caller heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for CallSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(call_id = %self.call_id, "Call connection opened");
        self.metrics.call_started();

        if let Some(rx) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(rx));
        }
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.coordinator.teardown();
        self.metrics.call_ended();
        info!(
            call_id = %self.call_id,
            last_stream_id = ?self.coordinator.current_stream_id(),
            "Call connection closed"
        );
    }
}

/// Inbound frames from the caller.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                warn!(call_id = %self.call_id, bytes = data.len(), "Ignoring binary frame");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(call_id = %self.call_id, reason = ?reason, "Caller closed the socket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(call_id = %self.call_id, "Ignoring continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(call_id = %self.call_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Fragments produced by relay tasks.
impl StreamHandler<OutboundFragment> for CallSocket {
    fn handle(&mut self, fragment: OutboundFragment, ctx: &mut Self::Context) {
        if fragment.is_abandoned() {
            debug!(
                call_id = %self.call_id,
                stream_id = fragment.response.stream_id,
                "Dropping fragment of abandoned turn"
            );
            return;
        }
        ctx.text(protocol::encode(&fragment.response));
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        // The coordinator holds the sender, so this only happens while stopping
    }
}

/// WebSocket endpoint handler.
///
/// Upgrades the HTTP request; everything after that is handled by [`CallSocket`].
pub async fn call_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "Call connection request");
    ws::start(CallSocket::new(&app_state), &req, stream)
}
