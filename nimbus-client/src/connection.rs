//! Connection supervisor.
//!
//! One spawned task owns the transport, the frame decoder and the write
//! buffer. It runs the state machine
//! `Connecting -> Handshaking -> Open -> Reconnecting -> ...`, demultiplexes
//! inbound frames to subscription sinks and the inbox router, drains the
//! command queue onto the wire in batches, and supervises liveness with
//! client-initiated pings.

use crate::error::ClientError;
use crate::events::{ClientEvent, ConnectionStatus};
use crate::inbox::InboxMultiplexer;
use crate::options::{ConnectOptions, ServerAddr};
use crate::subscriptions::{Delivery, SubscriptionRegistry};
use crate::transport::Transport;
use crate::writer::{Command, FrameWriter};
use nimbus_protocol::{ClientFrame, ConnectInfo, FrameDecoder, ServerFrame, ServerInfo};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

/// State shared between client handles and the supervisor task.
#[derive(Debug)]
pub(crate) struct SharedState {
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) inbox: Arc<InboxMultiplexer>,
    pub(crate) max_payload: AtomicUsize,
    pub(crate) status: AtomicU8,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) server_info: Mutex<ServerInfo>,
}

impl SharedState {
    pub(crate) fn new(options: &ConnectOptions) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            registry: SubscriptionRegistry::new(),
            inbox: Arc::new(InboxMultiplexer::new(&options.inbox_prefix)),
            max_payload: AtomicUsize::new(nimbus_protocol::DEFAULT_MAX_PAYLOAD),
            status: AtomicU8::new(ConnectionStatus::Closed as u8),
            events,
            server_info: Mutex::new(ServerInfo::default()),
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status.load(Ordering::Relaxed).into()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

/// One established transport with its parse state.
struct Session {
    transport: Transport,
    decoder: FrameDecoder,
    info: ServerInfo,
}

enum Flow {
    Continue,
    Close(oneshot::Sender<()>),
}

type PongWaiter = Option<oneshot::Sender<Result<(), ClientError>>>;

pub(crate) struct ConnectionDriver {
    options: ConnectOptions,
    commands: mpsc::Receiver<Command>,
    state: Arc<SharedState>,
    servers: Vec<ServerAddr>,
    writer: FrameWriter,
    /// `Close` waiters, acknowledged only once teardown has finished.
    close_acks: Vec<oneshot::Sender<()>>,
}

impl ConnectionDriver {
    pub(crate) fn new(
        options: ConnectOptions,
        commands: mpsc::Receiver<Command>,
        state: Arc<SharedState>,
        servers: Vec<ServerAddr>,
    ) -> Self {
        let writer = FrameWriter::new(options.object_pool_size);
        Self {
            options,
            commands,
            state,
            servers,
            writer,
            close_acks: Vec::new(),
        }
    }

    /// Runs the supervisor until the connection is disposed.
    ///
    /// `ready` resolves once the first handshake completes (or fails, in
    /// which case the task exits without retrying).
    pub(crate) async fn run(mut self, ready: oneshot::Sender<Result<(), ClientError>>) {
        let mut ready = Some(ready);
        let mut attempts: u32 = 0;

        loop {
            match self.establish().await {
                Ok(mut session) => {
                    attempts = 0;
                    self.state.set_status(ConnectionStatus::Open);
                    if let Some(tx) = ready.take() {
                        self.state.emit(ClientEvent::Connected);
                        let _ = tx.send(Ok(()));
                    } else {
                        self.state.emit(ClientEvent::Reconnected);
                    }
                    match self.drive(&mut session).await {
                        Ok(()) => break,
                        Err(err) => {
                            tracing::warn!(error = %err, "connection lost");
                            self.writer.discard();
                            self.state.set_status(ConnectionStatus::Reconnecting);
                            self.state.emit(ClientEvent::Disconnected);
                            self.state.emit(ClientEvent::Reconnecting);
                            if matches!(err, ClientError::Auth(_)) {
                                // Credentials will not get better by retrying.
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    if let Some(tx) = ready.take() {
                        self.state.set_status(ConnectionStatus::Closed);
                        let _ = tx.send(Err(err));
                        return;
                    }
                    tracing::debug!(error = %err, attempts, "reconnect attempt failed");
                    attempts += 1;
                    if self.options.max_reconnects >= 0
                        && attempts > self.options.max_reconnects as u32
                    {
                        tracing::error!("reconnect attempts exhausted");
                        break;
                    }
                    tokio::time::sleep(self.backoff(attempts)).await;
                }
            }
        }
        self.shutdown().await;
    }

    /// Tries every known server once, in shuffled order.
    async fn establish(&mut self) -> Result<Session, ClientError> {
        self.state.set_status(ConnectionStatus::Connecting);
        let mut rotation = self.servers.clone();
        rotation.shuffle(&mut rand::thread_rng());

        let mut last_err = None;
        for server in &rotation {
            match self.handshake(server).await {
                Ok(session) => {
                    for url in &session.info.connect_urls {
                        if let Ok(addr) = ServerAddr::parse(url) {
                            if !self.servers.contains(&addr) {
                                self.servers.push(addr);
                            }
                        }
                    }
                    *self.state.server_info.lock().unwrap() = session.info.clone();
                    return Ok(session);
                }
                Err(err) => {
                    tracing::debug!(host = %server.host, port = server.port, error = %err,
                        "connect attempt failed");
                    self.writer.discard();
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(ClientError::ConnectionClosed))
    }

    /// Connects one socket and completes `INFO`/TLS/`CONNECT`/`PING`-`PONG`,
    /// then replays live subscriptions onto the fresh transport.
    async fn handshake(&mut self, server: &ServerAddr) -> Result<Session, ClientError> {
        let deadline = Instant::now() + self.options.connect_timeout;
        let mut transport = Transport::connect(server, &self.options.tls, deadline).await?;
        self.state.set_status(ConnectionStatus::Handshaking);

        let mut decoder = FrameDecoder::new();
        let info = loop {
            match read_frame(&mut transport, &mut decoder, deadline).await? {
                ServerFrame::Info(info) => break info,
                ServerFrame::Ping => self.writer.push(&ClientFrame::Pong)?,
                other => {
                    tracing::debug!(?other, "unexpected frame before INFO");
                }
            }
        };

        let was_tls = transport.is_tls();
        transport = transport
            .negotiate_tls(server, &self.options.tls, &info)
            .await?;
        if transport.is_tls() && !was_tls {
            // Plaintext buffered across the upgrade boundary is stale; the
            // server stays quiet until CONNECT anyway.
            decoder.clear();
        }

        let connect = self.connect_info(transport.is_tls())?;
        self.writer.push(&ClientFrame::Connect(connect))?;
        self.writer.push(&ClientFrame::Ping)?;
        self.writer.flush(&mut transport).await?;

        loop {
            match read_frame(&mut transport, &mut decoder, deadline).await? {
                ServerFrame::Pong => break,
                ServerFrame::Err(reason) => return Err(classify_server_error(reason)),
                ServerFrame::Ping => {
                    self.writer.push(&ClientFrame::Pong)?;
                    self.writer.flush(&mut transport).await?;
                }
                ServerFrame::Ok | ServerFrame::Info(_) => {}
                ServerFrame::Msg { .. } => {
                    tracing::debug!("message before handshake completion, dropping");
                }
            }
        }

        if info.max_payload > 0 {
            self.state
                .max_payload
                .store(info.max_payload, Ordering::Relaxed);
        }

        // Replay completes before any queued command is drained.
        self.state.registry.replay(&mut self.writer)?;
        self.writer.flush(&mut transport).await?;

        tracing::debug!(server_id = %info.server_id, tls = transport.is_tls(), "handshake complete");
        Ok(Session {
            transport,
            decoder,
            info,
        })
    }

    fn connect_info(&self, tls: bool) -> Result<ConnectInfo, ClientError> {
        let auth = &self.options.auth;
        let mut connect = ConnectInfo {
            name: self.options.name.clone(),
            tls_required: tls,
            auth_token: auth.token.clone(),
            user: auth.user.clone(),
            pass: auth.pass.clone(),
            jwt: auth.jwt.clone(),
            ..ConnectInfo::default()
        };
        if let Some(path) = &auth.credentials_file {
            let jwt = load_credentials_jwt(path)?;
            connect.jwt = Some(jwt);
        }
        Ok(connect)
    }

    /// Runs one established session until the transport fails or the
    /// connection is disposed. `Ok(())` means a clean close.
    async fn drive(&mut self, session: &mut Session) -> Result<(), ClientError> {
        let mut pongs: VecDeque<PongWaiter> = VecDeque::new();
        let result = self.drive_inner(session, &mut pongs).await;
        if result.is_err() {
            // The PING may or may not have crossed the boundary; waiters
            // cannot distinguish, so they see a transport failure.
            for waiter in pongs.drain(..).flatten() {
                let _ = waiter.send(Err(ClientError::Transport(std::io::Error::other(
                    "connection lost before PONG",
                ))));
            }
        }
        result
    }

    async fn drive_inner(
        &mut self,
        session: &mut Session,
        pongs: &mut VecDeque<PongWaiter>,
    ) -> Result<(), ClientError> {
        enum Step {
            Cmd(Option<Command>),
            Read(std::io::Result<usize>),
            PingTick,
            SweepTick,
        }

        let ping_period = self.options.ping_interval;
        let sweep_period = self.options.subscription_cleanup_interval;
        let mut ping_interval =
            tokio::time::interval_at(Instant::now() + ping_period, ping_period);
        let mut sweep_interval =
            tokio::time::interval_at(Instant::now() + sweep_period, sweep_period);
        let mut read_chunk = vec![0u8; 8192];

        loop {
            // Frames already buffered from the last read.
            while let Some(frame) = session.decoder.decode()? {
                self.handle_frame(frame, pongs)?;
            }
            self.writer.flush(&mut session.transport).await?;

            let step = tokio::select! {
                biased;
                cmd = self.commands.recv() => Step::Cmd(cmd),
                result = session.transport.read(&mut read_chunk) => Step::Read(result),
                _ = ping_interval.tick() => Step::PingTick,
                _ = sweep_interval.tick() => Step::SweepTick,
            };

            match step {
                Step::Cmd(None) => {
                    // Every client handle is gone.
                    let _ = self.writer.flush(&mut session.transport).await;
                    return Ok(());
                }
                Step::Cmd(Some(cmd)) => {
                    if let Flow::Close(done) = self.handle_command(cmd, pongs)? {
                        let _ = self.writer.flush(&mut session.transport).await;
                        self.close_acks.push(done);
                        return Ok(());
                    }
                    // Batch whatever else is already queued into this write.
                    while let Ok(cmd) = self.commands.try_recv() {
                        if let Flow::Close(done) = self.handle_command(cmd, pongs)? {
                            let _ = self.writer.flush(&mut session.transport).await;
                            self.close_acks.push(done);
                            return Ok(());
                        }
                    }
                }
                Step::Read(Ok(0)) => {
                    return Err(ClientError::Transport(std::io::Error::other(
                        "server closed the connection",
                    )));
                }
                Step::Read(Ok(n)) => {
                    session.decoder.extend(&read_chunk[..n]);
                }
                Step::Read(Err(err)) => return Err(ClientError::Transport(err)),
                Step::PingTick => {
                    if pongs.len() >= 2 {
                        return Err(ClientError::Transport(std::io::Error::other(
                            "missed two consecutive pongs",
                        )));
                    }
                    pongs.push_back(None);
                    self.writer.push(&ClientFrame::Ping)?;
                }
                Step::SweepTick => {
                    for sid in self.state.registry.sweep() {
                        tracing::debug!(sid, "sweeping abandoned subscription");
                        self.writer.push(&ClientFrame::Unsubscribe {
                            sid,
                            max_msgs: None,
                        })?;
                        self.state.emit(ClientEvent::SubscriptionDropped(sid));
                    }
                }
            }
        }
    }

    fn handle_command(
        &mut self,
        cmd: Command,
        pongs: &mut VecDeque<PongWaiter>,
    ) -> Result<Flow, ClientError> {
        match cmd {
            Command::Publish {
                subject,
                reply,
                headers,
                payload,
            } => {
                self.writer.push(&ClientFrame::Publish {
                    subject,
                    reply,
                    headers,
                    payload,
                })?;
            }
            Command::Subscribe {
                sid,
                subject,
                queue_group,
            } => {
                self.writer.push(&ClientFrame::Subscribe {
                    sid,
                    subject,
                    queue_group,
                })?;
            }
            Command::Unsubscribe { sid, max_msgs } => {
                self.writer
                    .push(&ClientFrame::Unsubscribe { sid, max_msgs })?;
            }
            Command::Flush { done } => {
                self.writer.push(&ClientFrame::Ping)?;
                pongs.push_back(Some(done));
            }
            Command::Close { done } => return Ok(Flow::Close(done)),
        }
        Ok(Flow::Continue)
    }

    fn handle_frame(
        &mut self,
        frame: ServerFrame,
        pongs: &mut VecDeque<PongWaiter>,
    ) -> Result<(), ClientError> {
        match frame {
            ServerFrame::Ping => self.writer.push(&ClientFrame::Pong)?,
            ServerFrame::Pong => {
                if let Some(Some(waiter)) = pongs.pop_front() {
                    let _ = waiter.send(Ok(()));
                }
            }
            ServerFrame::Ok => {}
            ServerFrame::Err(reason) => {
                tracing::warn!(%reason, "server error");
                let err = classify_server_error(reason);
                if matches!(err, ClientError::Auth(_)) {
                    return Err(err);
                }
            }
            ServerFrame::Info(info) => {
                if info.max_payload > 0 {
                    self.state
                        .max_payload
                        .store(info.max_payload, Ordering::Relaxed);
                }
                for url in &info.connect_urls {
                    if let Ok(addr) = ServerAddr::parse(url) {
                        if !self.servers.contains(&addr) {
                            self.servers.push(addr);
                        }
                    }
                }
                *self.state.server_info.lock().unwrap() = info;
            }
            ServerFrame::Msg { sid, message } => match self.state.registry.deliver(sid, message) {
                Delivery::Delivered => {}
                Delivery::Inbox(message) => self.state.inbox.route(message),
                Delivery::Dead => {
                    tracing::debug!(sid, "sink dropped, unsubscribing lazily");
                    self.writer.push(&ClientFrame::Unsubscribe {
                        sid,
                        max_msgs: None,
                    })?;
                    self.state.emit(ClientEvent::SubscriptionDropped(sid));
                }
                Delivery::Unknown => {
                    tracing::debug!(sid, "message for unknown sid");
                }
            },
        }
        Ok(())
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let base = self
            .options
            .reconnect_delay_min
            .saturating_mul(1u32 << exponent)
            .min(self.options.reconnect_delay_max);
        if self.options.reconnect_jitter.is_zero() {
            base
        } else {
            base + self
                .options
                .reconnect_jitter
                .mul_f64(rand::thread_rng().gen::<f64>())
        }
    }

    /// Final teardown. Commands still queued here never reached the wire,
    /// so their waiters see `Canceled` rather than a transport verdict.
    async fn shutdown(&mut self) {
        self.state.set_status(ConnectionStatus::Closed);
        self.state.emit(ClientEvent::Closed);
        self.commands.close();
        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                Command::Flush { done } => {
                    let _ = done.send(Err(ClientError::Canceled));
                }
                Command::Close { done } => self.close_acks.push(done),
                Command::Publish { subject, .. } => {
                    tracing::debug!(%subject, "publish canceled at teardown");
                }
                Command::Subscribe { .. } | Command::Unsubscribe { .. } => {}
            }
        }
        for ack in self.close_acks.drain(..) {
            let _ = ack.send(());
        }
    }
}

async fn read_frame(
    transport: &mut Transport,
    decoder: &mut FrameDecoder,
    deadline: Instant,
) -> Result<ServerFrame, ClientError> {
    loop {
        if let Some(frame) = decoder.decode()? {
            return Ok(frame);
        }
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout_at(deadline, transport.read(&mut chunk))
            .await
            .map_err(|_| ClientError::Timeout)??;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        decoder.extend(&chunk[..n]);
    }
}

fn classify_server_error(reason: String) -> ClientError {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("authorization") || lower.contains("authentication") {
        ClientError::Auth(reason)
    } else if lower.contains("tls") {
        ClientError::Tls(reason)
    } else {
        ClientError::Transport(std::io::Error::other(reason))
    }
}

/// Extracts the user JWT from a credentials file.
fn load_credentials_jwt(path: &Path) -> Result<String, ClientError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ClientError::Usage(format!("cannot read credentials file {path:?}: {e}")))?;
    let mut in_jwt = false;
    for line in content.lines() {
        let line = line.trim();
        if line.contains("BEGIN NATS USER JWT") {
            in_jwt = true;
            continue;
        }
        if in_jwt && !line.is_empty() && !line.starts_with('-') {
            return Ok(line.to_string());
        }
    }
    Err(ClientError::Usage(format!(
        "no user JWT found in credentials file {path:?}"
    )))
}
