//! TCP control channel.
//!
//! Synchronous request/reply command surface with one in-flight request per
//! connection: the session loop reads one request, dispatches it through the
//! [`CommandRouter`], and writes exactly one response (success or structured
//! error) within the configured deadline. A handler missing its deadline
//! produces a `Timeout` response, never a silent hang; callers may retry
//! idempotent commands only.
//!
//! The router is constructed once at startup with every collaborator handle
//! it needs (intent queue, status watches, analysis worker) and matches on
//! the closed [`RequestKind`] tag. No handler is looked up or rebuilt per
//! call.
//!
//! A connection may opt into broadcast forwarding (`SubscribeStatus` /
//! `SubscribeHealth`), after which the server streams messages until the
//! client disconnects. Slow subscribers are dropped behind, never allowed
//! to stall acquisition.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::acquisition::coordinator::{ControlIntent, StatusSnapshot};
use crate::acquisition::session::AcquisitionParams;
use crate::analysis::worker::{AnalysisStatus, AnalysisWorker};
use crate::config::Settings;
use crate::error::{IsiError, IsiResult};
use crate::transport::broadcast::{note_lagged, HealthReport};
use crate::transport::protocol::{
    recv_message, send_message, CommandReply, ControlRequest, ControlResponse, RequestKind,
    ResponseStatus, StartAcquisitionParams, StartAnalysisParams,
};

/// Closed command dispatch table, built once at startup.
pub struct CommandRouter {
    settings: Arc<Settings>,
    intents: mpsc::Sender<ControlIntent>,
    status_rx: watch::Receiver<StatusSnapshot>,
    analysis: Arc<AnalysisWorker>,
    analysis_status_rx: watch::Receiver<AnalysisStatus>,
    reply_deadline: Duration,
}

impl CommandRouter {
    /// Build the router with its collaborator handles.
    pub fn new(
        settings: Arc<Settings>,
        intents: mpsc::Sender<ControlIntent>,
        status_rx: watch::Receiver<StatusSnapshot>,
        analysis: Arc<AnalysisWorker>,
        analysis_status_rx: watch::Receiver<AnalysisStatus>,
    ) -> Self {
        let reply_deadline = settings.transport.control_timeout;
        Self {
            settings,
            intents,
            status_rx,
            analysis,
            analysis_status_rx,
            reply_deadline,
        }
    }

    /// Execute one command and produce its single response.
    pub async fn dispatch(&self, request: &ControlRequest) -> ControlResponse {
        let reply = match request.kind {
            RequestKind::StartAcquisition => self.start_acquisition(&request.payload).await,
            RequestKind::AbortAcquisition => self.abort_acquisition().await,
            RequestKind::GetStatus => self.get_status(),
            RequestKind::StartAnalysis => self.start_analysis(&request.payload),
            RequestKind::GetAnalysisStatus => self.get_analysis_status(),
            RequestKind::Heartbeat => Ok(CommandReply::ok(json!({ "alive": true }))),
            // Subscription switches are acknowledged here and handled by the
            // session loop.
            RequestKind::SubscribeStatus | RequestKind::SubscribeHealth => {
                Ok(CommandReply::ok(json!({ "subscribed": true })))
            }
        };

        match reply {
            Ok(reply) => match serde_json::to_vec(&reply) {
                Ok(payload) => ControlResponse::success(request.request_id, payload),
                Err(e) => ControlResponse::error(
                    request.request_id,
                    ResponseStatus::Error,
                    format!("response serialization failed: {e}"),
                ),
            },
            Err(e) => {
                let reply = CommandReply::err(&e);
                let payload = serde_json::to_vec(&reply).unwrap_or_default();
                let mut response =
                    ControlResponse::error(request.request_id, ResponseStatus::Error, e.to_string());
                response.payload = payload;
                response
            }
        }
    }

    async fn start_acquisition(&self, payload: &[u8]) -> IsiResult<CommandReply> {
        let overrides: StartAcquisitionParams = if payload.is_empty() {
            StartAcquisitionParams::default()
        } else {
            serde_json::from_slice(payload)
                .map_err(|e| IsiError::Configuration(format!("bad parameters: {e}")))?
        };
        let params = AcquisitionParams::resolve(&self.settings, &overrides);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.intents
            .send(ControlIntent::Start {
                params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| IsiError::Transport("orchestrator intent queue closed".into()))?;

        let session_id = tokio::time::timeout(self.reply_deadline, reply_rx)
            .await
            .map_err(|_| IsiError::Transport("orchestrator did not answer in time".into()))?
            .map_err(|_| IsiError::Transport("orchestrator dropped the reply".into()))??;

        Ok(CommandReply::ok(json!({ "session_id": session_id })))
    }

    async fn abort_acquisition(&self) -> IsiResult<CommandReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.intents
            .send(ControlIntent::Abort { reply: reply_tx })
            .await
            .map_err(|_| IsiError::Transport("orchestrator intent queue closed".into()))?;

        tokio::time::timeout(self.reply_deadline, reply_rx)
            .await
            .map_err(|_| IsiError::Transport("orchestrator did not answer in time".into()))?
            .map_err(|_| IsiError::Transport("orchestrator dropped the reply".into()))??;

        Ok(CommandReply::ok(json!({ "aborted": true })))
    }

    fn get_status(&self) -> IsiResult<CommandReply> {
        let snapshot = self.status_rx.borrow().clone();
        Ok(CommandReply::ok(serde_json::to_value(snapshot)?))
    }

    fn start_analysis(&self, payload: &[u8]) -> IsiResult<CommandReply> {
        let params: StartAnalysisParams = serde_json::from_slice(payload)
            .map_err(|e| IsiError::Configuration(format!("bad parameters: {e}")))?;
        self.analysis.start(params.session_id.clone())?;
        Ok(CommandReply::ok(json!({ "session_id": params.session_id })))
    }

    fn get_analysis_status(&self) -> IsiResult<CommandReply> {
        let status = self.analysis_status_rx.borrow().clone();
        Ok(CommandReply::ok(serde_json::to_value(status)?))
    }
}

/// The TCP control listener.
pub struct ControlServer {
    router: Arc<CommandRouter>,
    status_rx: watch::Receiver<StatusSnapshot>,
    health_bus: broadcast::Sender<HealthReport>,
    status_interval: Duration,
    reply_deadline: Duration,
}

impl ControlServer {
    /// Build the server around an already constructed router.
    pub fn new(
        router: Arc<CommandRouter>,
        status_rx: watch::Receiver<StatusSnapshot>,
        health_bus: broadcast::Sender<HealthReport>,
        status_interval: Duration,
        reply_deadline: Duration,
    ) -> Self {
        Self {
            router,
            status_rx,
            health_bus,
            status_interval,
            reply_deadline,
        }
    }

    /// Bind `addr` and serve connections until the task is aborted.
    ///
    /// Returns the accept-loop handle and the bound address (useful when
    /// binding port 0 in tests).
    pub async fn spawn(self, addr: &str) -> IsiResult<(JoinHandle<()>, std::net::SocketAddr)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| IsiError::Transport(format!("bind {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| IsiError::Transport(e.to_string()))?;
        info!(%local, "control server listening");

        let server = Arc::new(self);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "control client connected");
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            if let Err(e) = server.serve_connection(stream).await {
                                debug!(%peer, %e, "control session ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(%e, "control accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok((handle, local))
    }

    async fn serve_connection(&self, mut stream: TcpStream) -> IsiResult<()> {
        loop {
            let body = recv_message(&mut stream).await?;
            let request = match ControlRequest::decode(&body) {
                Ok(request) => request,
                Err(e) => {
                    let response =
                        ControlResponse::error(0, ResponseStatus::InvalidRequest, e.to_string());
                    send_message(&mut stream, &response.encode()).await?;
                    continue;
                }
            };

            let kind = request.kind;
            let response =
                match tokio::time::timeout(self.reply_deadline, self.router.dispatch(&request))
                    .await
                {
                    Ok(response) => response,
                    Err(_) => ControlResponse::error(
                        request.request_id,
                        ResponseStatus::Timeout,
                        "handler missed its deadline".into(),
                    ),
                };
            send_message(&mut stream, &response.encode()).await?;

            // A subscription switches this connection into a one-way stream.
            match kind {
                RequestKind::SubscribeStatus => return self.stream_status(stream).await,
                RequestKind::SubscribeHealth => return self.stream_health(stream).await,
                _ => {}
            }
        }
    }

    /// Forward status snapshots: on change and on the periodic tick.
    async fn stream_status(&self, mut stream: TcpStream) -> IsiResult<()> {
        let mut status_rx = self.status_rx.clone();
        let mut ticker = tokio::time::interval(self.status_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {}
            }
            let snapshot = status_rx.borrow_and_update().clone();
            let body = serde_json::to_vec(&snapshot)?;
            send_message(&mut stream, &body).await?;
        }
    }

    /// Forward health reports as the publisher emits them.
    async fn stream_health(&self, mut stream: TcpStream) -> IsiResult<()> {
        let mut rx = self.health_bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(report) => {
                    let body = serde_json::to_vec(&report)?;
                    send_message(&mut stream, &body).await?;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    note_lagged("health", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

/// Minimal client for the control protocol, used by tests and tooling.
pub struct ControlClient {
    stream: TcpStream,
    next_request_id: u32,
}

impl ControlClient {
    /// Connect to a control server.
    pub async fn connect(addr: std::net::SocketAddr) -> IsiResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| IsiError::Transport(format!("connect {addr}: {e}")))?;
        Ok(Self {
            stream,
            next_request_id: 1,
        })
    }

    /// Send one request and await its response.
    pub async fn request(
        &mut self,
        kind: RequestKind,
        payload: Vec<u8>,
    ) -> IsiResult<ControlResponse> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let request = ControlRequest::new(request_id, kind, payload);
        send_message(&mut self.stream, &request.encode()).await?;
        let body = recv_message(&mut self.stream).await?;
        let response = ControlResponse::decode(&body)?;
        if response.request_id != request_id && response.request_id != 0 {
            return Err(IsiError::Transport(format!(
                "response correlates to request {} (sent {})",
                response.request_id, request_id
            )));
        }
        Ok(response)
    }

    /// Parse the JSON command reply out of a response.
    pub fn reply(response: &ControlResponse) -> IsiResult<CommandReply> {
        Ok(serde_json::from_slice(&response.payload)?)
    }

    /// After a subscribe request, read the next broadcast message body.
    pub async fn next_broadcast(&mut self) -> IsiResult<Vec<u8>> {
        recv_message(&mut self.stream).await
    }
}
