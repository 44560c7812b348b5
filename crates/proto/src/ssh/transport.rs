//! The SSH transport: one session over one byte stream.
//!
//! # Tasks
//!
//! Starting a transport exchanges banners and spawns three tasks:
//!
//! - the **reader** pulls packets off the [`Packetizer`] and hands them to
//!   the driver. After a NEWKEYS it waits until the driver has installed
//!   the inbound keys, since the next packet is already encrypted with them.
//! - the **driver** is the receive loop. It owns the key exchange state,
//!   dispatches every message and tears the session down when the loop
//!   ends for any reason.
//! - the **outbox** sends the driver's own replies in order while the
//!   driver keeps reading, so the driver never blocks behind a key
//!   exchange it has to finish itself.
//!
//! Application code talks to the driver only through the packetizer's
//! write path and through completion handles (`oneshot`, `watch`,
//! `Notify`) that the driver resolves or drops.
//!
//! # States
//!
//! ```text
//! Connecting -> BannerExchanged -> KexInProgress -> KeysActive -> Authenticated -> Closed
//!                                        ^               |              |
//!                                        +---- rekey ----+--------------+
//! ```

use crate::ssh::auth::SERVICE_USERAUTH;
use crate::ssh::auth_handler::{ClientAuthState, ServerAuthenticator};
use crate::ssh::channel::{Channel, ChannelTable, ExitSignal, Lookup};
use crate::ssh::config::TransportConfig;
use crate::ssh::connection::{
    channel_only_message, recipient_channel, request_success_message, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest,
    ChannelRequestType, ChannelType, GlobalRequest,
};
use crate::ssh::hostkey::{fingerprint, key_blob_algorithm, HostKey};
use crate::ssh::kex::{
    create_engine, derive_direction_keys, KexAlgorithm, KexInit, KexOutput, KexParams, KexStep,
    Negotiated, NewKeys,
};
use crate::ssh::message::{
    ignore_message, is_channel_specific, is_kex_method_specific, is_userauth,
    parse_debug_message, parse_service_message, service_message, unimplemented_message,
    Disconnect, DisconnectReason, MessageType,
};
use crate::ssh::packet::{DirectionKeys, Packetizer, ReceivedMessage};
use crate::ssh::server::ServerHandler;
use crate::ssh::session::{keepalive_message, KeepaliveTask, KEEPALIVE_PAYLOAD_LEN};
use crate::ssh::version::Version;
use crate::ssh::wire::Reader;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_platform::{TesseraError, TesseraResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

/// Packets buffered between the reader and the driver.
const INBOUND_QUEUE: usize = 64;

/// How long teardown waits for queued replies and the final DISCONNECT.
const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket connected, nothing exchanged
    Connecting,
    /// Identification lines exchanged
    BannerExchanged,
    /// A key exchange is running
    KexInProgress,
    /// Keys active, user not authenticated
    KeysActive,
    /// User authenticated
    Authenticated,
    /// Session ended
    Closed,
}

enum Outgoing {
    Message {
        payload: Vec<u8>,
        sent: Option<oneshot::Sender<()>>,
    },
    Flush(oneshot::Sender<()>),
}

pub(crate) struct TransportInner {
    pub(crate) is_server: bool,
    pub(crate) config: TransportConfig,
    pub(crate) packetizer: Arc<Packetizer>,
    pub(crate) channels: Arc<ChannelTable>,
    pub(crate) client_auth: Mutex<ClientAuthState>,
    pub(crate) auth_lock: tokio::sync::Mutex<()>,
    remote_version: Version,
    outbox: mpsc::UnboundedSender<Outgoing>,
    state: watch::Sender<SessionState>,
    kex_rounds: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    rekey_requested: Notify,
    closed: AtomicBool,
    authenticated: AtomicBool,
    session_id: Mutex<Option<Vec<u8>>>,
    remote_host_key: Mutex<Option<Vec<u8>>>,
    negotiated: Mutex<Option<Negotiated>>,
    username: Mutex<Option<String>>,
    global_replies: Mutex<VecDeque<oneshot::Sender<Option<Vec<u8>>>>>,
    global_lock: tokio::sync::Mutex<()>,
    incoming_channels: tokio::sync::Mutex<mpsc::UnboundedReceiver<Channel>>,
    last_error: Mutex<Option<String>>,
    keepalive: Mutex<Option<KeepaliveTask>>,
    span: Span,
}

impl TransportInner {
    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == SessionState::Closed || *current == next {
                return false;
            }
            trace!(from = ?*current, to = ?next, "State change");
            *current = next;
            true
        });
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn session_error(&self) -> TesseraError {
        TesseraError::SessionClosed(self.last_error())
    }

    fn mark_authenticated(&self, user: Option<String>) {
        self.authenticated.store(true, Ordering::SeqCst);
        if user.is_some() {
            *self.username.lock() = user;
        }
        if *self.state.borrow() != SessionState::KexInProgress {
            self.set_state(SessionState::Authenticated);
        }
    }

    fn register_channel(&self, kind: ChannelType) -> Channel {
        let packetizer = Arc::clone(&self.packetizer);
        let table = Arc::downgrade(&self.channels);
        let (window, max_packet, timeout) = (
            self.config.window_size,
            self.config.max_packet_size,
            self.config.channel_timeout,
        );
        let channel = self.channels.allocate(|id| {
            Channel::new(id, kind, packetizer, table, window, max_packet, timeout)
        });
        if self.closed.load(Ordering::SeqCst) {
            self.channels.remove(channel.local_id());
            channel.force_close(self.last_error());
        }
        channel
    }

    async fn send_keepalive(&self) -> TesseraResult<()> {
        let message = keepalive_message(self.config.rng.as_ref(), KEEPALIVE_PAYLOAD_LEN)?;
        self.packetizer.send_when_clear(&message).await?;
        Ok(())
    }
}

/// A running SSH session, client or server side.
///
/// Cloning is cheap; clones share the session.
#[derive(Clone)]
pub struct Transport {
    pub(crate) inner: Arc<TransportInner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("is_server", &self.inner.is_server)
            .field("state", &self.state())
            .field("remote_version", &self.inner.remote_version.to_string())
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

impl Transport {
    /// Runs the client handshake over `stream`.
    ///
    /// Returns once the first key exchange has finished; authentication is
    /// up to the caller.
    ///
    /// # Errors
    ///
    /// - [`TesseraError::Config`] for an invalid configuration
    /// - [`TesseraError::Protocol`] / [`TesseraError::Timeout`] for a bad banner
    /// - [`TesseraError::SessionClosed`] carrying the cause if the key
    ///   exchange fails
    pub async fn start_client<S>(stream: S, config: TransportConfig) -> TesseraResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(stream, config, None).await
    }

    /// Runs the server handshake over `stream`.
    pub async fn start_server<S>(
        stream: S,
        host_key: Arc<dyn HostKey>,
        handler: Arc<dyn ServerHandler>,
        config: TransportConfig,
    ) -> TesseraResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(stream, config, Some((host_key, handler))).await
    }

    async fn start<S>(
        stream: S,
        config: TransportConfig,
        server: Option<(Arc<dyn HostKey>, Arc<dyn ServerHandler>)>,
    ) -> TesseraResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let is_server = server.is_some();
        let span = info_span!("ssh", role = if is_server { "server" } else { "client" });

        async move {
            let packetizer = Arc::new(Packetizer::from_stream(
                stream,
                config.rekey,
                Arc::clone(&config.rng),
            ));
            packetizer.write_banner(&config.local_version).await?;
            let (remote_version, remote_line) = packetizer.read_banner(config.banner).await?;
            info!(remote = %remote_line, "Banner exchanged");

            let (state, _) = watch::channel(SessionState::BannerExchanged);
            let (kex_rounds, _) = watch::channel(0u64);
            let (shutdown, shutdown_rx) = watch::channel(false);
            let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
            let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
            let (packets_tx, packets_rx) = mpsc::channel(INBOUND_QUEUE);

            let local_line = config.local_version.to_string();
            let (client_version, server_version) = if is_server {
                (remote_line, local_line)
            } else {
                (local_line, remote_line)
            };

            let inner = Arc::new(TransportInner {
                is_server,
                config,
                packetizer: Arc::clone(&packetizer),
                channels: Arc::new(ChannelTable::default()),
                client_auth: Mutex::new(ClientAuthState::default()),
                auth_lock: tokio::sync::Mutex::new(()),
                remote_version,
                outbox: outbox_tx,
                state,
                kex_rounds,
                shutdown,
                rekey_requested: Notify::new(),
                closed: AtomicBool::new(false),
                authenticated: AtomicBool::new(false),
                session_id: Mutex::new(None),
                remote_host_key: Mutex::new(None),
                negotiated: Mutex::new(None),
                username: Mutex::new(None),
                global_replies: Mutex::new(VecDeque::new()),
                global_lock: tokio::sync::Mutex::new(()),
                incoming_channels: tokio::sync::Mutex::new(incoming_rx),
                last_error: Mutex::new(None),
                keepalive: Mutex::new(None),
                span: Span::current(),
            });

            let installed = Arc::new(Notify::new());
            let reader = tokio::spawn(
                run_reader(Arc::clone(&packetizer), packets_tx, Arc::clone(&installed))
                    .in_current_span(),
            );
            let outbox = tokio::spawn(run_outbox(Arc::clone(&packetizer), outbox_rx).in_current_span());

            let (host_key, server) = match server {
                Some((host_key, handler)) => {
                    let auth = ServerAuthenticator::new(
                        Arc::clone(&handler),
                        inner.config.max_auth_attempts,
                    );
                    (
                        Some(host_key),
                        Some(ServerSide {
                            handler,
                            auth,
                            userauth_accepted: false,
                        }),
                    )
                }
                None => (None, None),
            };

            let driver = Driver {
                inner: Arc::clone(&inner),
                packets: packets_rx,
                inbound_installed: installed,
                client_version,
                server_version,
                host_key,
                server,
                incoming_channels: incoming_tx,
                kex: KexState::default(),
                reader,
                outbox,
                disconnect_reason: DisconnectReason::ProtocolError,
                peer_disconnected: false,
            };
            tokio::spawn(driver.run(shutdown_rx).in_current_span());

            let transport = Transport { inner };
            transport.wait_for_kex(1).await?;
            transport.start_keepalive();
            Ok(transport)
        }
        .instrument(span)
        .await
    }

    fn start_keepalive(&self) {
        let Some(interval) = self.inner.config.keepalive_interval else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let mut task = KeepaliveTask::new(interval);
        task.start(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.send_keepalive().await,
                    None => Err(TesseraError::SessionClosed(None)),
                }
            }
        });
        *self.inner.keepalive.lock() = Some(task);
    }

    async fn wait_for_kex(&self, rounds: u64) -> TesseraResult<()> {
        let mut completed = self.inner.kex_rounds.subscribe();
        let mut state = self.inner.state.subscribe();
        tokio::select! {
            result = completed.wait_for(|n| *n >= rounds) => {
                result.map(|_| ()).map_err(|_| self.inner.session_error())
            }
            _ = state.wait_for(|s| *s == SessionState::Closed) => Err(self.inner.session_error()),
        }
    }

    /// True on the server side.
    pub fn is_server(&self) -> bool {
        self.inner.is_server
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// True until the session closes.
    pub fn is_active(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// True once user authentication succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    /// Exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.inner.session_id.lock().clone()
    }

    /// The peer's identification string.
    pub fn remote_version(&self) -> &Version {
        &self.inner.remote_version
    }

    /// Server host key blob, on the client side.
    pub fn remote_host_key(&self) -> Option<Vec<u8>> {
        self.inner.remote_host_key.lock().clone()
    }

    /// Algorithms chosen by the latest key exchange.
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.inner.negotiated.lock().clone()
    }

    /// Number of completed key exchanges, the first included.
    pub fn kex_rounds(&self) -> u64 {
        *self.inner.kex_rounds.borrow()
    }

    /// Banner the server sent during authentication, if any.
    pub fn auth_banner(&self) -> Option<String> {
        self.inner.client_auth.lock().banner()
    }

    /// Authenticated (server) or attempted (client) user name.
    pub fn username(&self) -> Option<String> {
        let user = self.inner.username.lock().clone();
        user.or_else(|| self.inner.client_auth.lock().username())
    }

    /// The error that ended the session, if it did not end cleanly.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error()
    }

    /// Number of channels in the table.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// Opens a channel and waits for the peer's answer.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::OpenFailed`](tessera_platform::ChannelError::OpenFailed)
    ///   with the peer's reason code
    /// - [`TesseraError::SessionClosed`] if the session dies first
    pub async fn open_channel(&self, kind: ChannelType) -> TesseraResult<Channel> {
        if !self.is_active() {
            return Err(self.inner.session_error());
        }
        let inner = &self.inner;
        let channel = inner.register_channel(kind.clone());
        let id = channel.local_id();
        debug!(channel = id, kind = kind.name(), "Opening channel");

        let open = ChannelOpen::new(
            kind,
            id,
            inner.config.window_size,
            inner.config.max_packet_size,
        );
        if let Err(e) = inner.packetizer.send_when_clear(&open.to_bytes()).await {
            inner.channels.remove(id);
            return Err(e);
        }
        match channel.wait_open().await {
            Ok(()) => Ok(channel),
            Err(e) => {
                inner.channels.remove(id);
                debug!(channel = id, error = %e, "Channel open failed");
                Err(e)
            }
        }
    }

    /// Opens a `session` channel.
    pub async fn open_session(&self) -> TesseraResult<Channel> {
        self.open_channel(ChannelType::Session).await
    }

    /// Waits for a channel the peer opened.
    ///
    /// # Errors
    ///
    /// [`TesseraError::Timeout`] when `timeout` elapses, or
    /// [`TesseraError::SessionClosed`] once the session is gone.
    pub async fn accept(&self, timeout: Option<Duration>) -> TesseraResult<Channel> {
        let mut state = self.inner.state.subscribe();
        let wait = async {
            let mut incoming = self.inner.incoming_channels.lock().await;
            tokio::select! {
                channel = incoming.recv() => channel.ok_or_else(|| self.inner.session_error()),
                _ = state.wait_for(|s| *s == SessionState::Closed) => Err(self.inner.session_error()),
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| TesseraError::Timeout("waiting for an incoming channel".to_string()))?,
            None => wait.await,
        }
    }

    /// Sends a global request.
    ///
    /// With `want_reply`, returns `Some(data)` on success and `None` on
    /// failure; without it, returns `None` as soon as the request is sent.
    pub async fn global_request(
        &self,
        name: &str,
        data: &[u8],
        want_reply: bool,
    ) -> TesseraResult<Option<Vec<u8>>> {
        let inner = &self.inner;
        let reply = {
            let _order = inner.global_lock.lock().await;
            let reply = if want_reply {
                let (tx, rx) = oneshot::channel();
                let mut waiters = inner.global_replies.lock();
                if inner.closed.load(Ordering::SeqCst) {
                    return Err(inner.session_error());
                }
                waiters.push_back(tx);
                Some(rx)
            } else {
                None
            };
            let request = GlobalRequest {
                name: name.to_string(),
                want_reply,
                data: data.to_vec(),
            };
            inner.packetizer.send_when_clear(&request.to_bytes()).await?;
            reply
        };
        debug!(request = name, want_reply, "Global request sent");

        match reply {
            Some(rx) => rx.await.map_err(|_| inner.session_error()),
            None => Ok(None),
        }
    }

    /// Runs a key re-exchange now and waits for it to finish.
    ///
    /// Channel traffic is held back while it runs and resumes afterwards.
    pub async fn rekey(&self) -> TesseraResult<()> {
        if !self.is_active() {
            return Err(self.inner.session_error());
        }
        let target = self.kex_rounds() + 1;
        info!(round = target, "Rekey requested");
        self.inner.rekey_requested.notify_one();
        self.wait_for_kex(target).await
    }

    /// Sends SSH_MSG_IGNORE with `data`.
    pub async fn send_ignore(&self, data: &[u8]) -> TesseraResult<()> {
        self.inner.packetizer.send_when_clear(&ignore_message(data)).await?;
        Ok(())
    }

    /// Sends DISCONNECT and shuts the session down.
    ///
    /// Every blocked channel, auth and request waiter is released.
    pub async fn close(&self) {
        if self.inner.shutdown.send_replace(true) {
            debug!(parent: &self.inner.span, "Close already requested");
        }
        self.wait_closed().await;
    }

    /// Waits until the session has fully shut down.
    pub async fn wait_closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

async fn run_reader(
    packetizer: Arc<Packetizer>,
    packets: mpsc::Sender<TesseraResult<ReceivedMessage>>,
    inbound_installed: Arc<Notify>,
) {
    loop {
        let result = packetizer.read_message().await;
        let failed = result.is_err();
        let newkeys = matches!(&result, Ok(msg) if msg.msg_type() == MessageType::NewKeys as u8);
        if packets.send(result).await.is_err() || failed {
            break;
        }
        if newkeys {
            inbound_installed.notified().await;
        }
    }
    trace!("Reader stopped");
}

async fn run_outbox(packetizer: Arc<Packetizer>, mut queue: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(item) = queue.recv().await {
        match item {
            Outgoing::Message { payload, sent } => {
                if let Err(e) = packetizer.send_when_clear(&payload).await {
                    debug!(error = %e, "Outbox stopped");
                    break;
                }
                if let Some(sent) = sent {
                    let _ = sent.send(());
                }
            }
            Outgoing::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Sends kex engine output straight through, bypassing the clear-to-send gate.
async fn send_kex(packetizer: &Packetizer, messages: Vec<Vec<u8>>) -> TesseraResult<()> {
    for message in messages {
        packetizer.send_message(&message).await?;
    }
    Ok(())
}

struct ServerSide {
    handler: Arc<dyn ServerHandler>,
    auth: ServerAuthenticator,
    userauth_accepted: bool,
}

#[derive(Default)]
struct KexState {
    local_kexinit: Option<Vec<u8>>,
    peer_kexinit: Option<Vec<u8>>,
    negotiated: Option<Negotiated>,
    engine: Option<Box<dyn KexAlgorithm>>,
    pending_inbound: Option<DirectionKeys>,
    skip_guessed_packet: bool,
    newkeys_sent: bool,
    completed: u64,
}

enum Event {
    Shutdown,
    Rekey(&'static str),
    Packet(Option<TesseraResult<ReceivedMessage>>),
}

struct Driver {
    inner: Arc<TransportInner>,
    packets: mpsc::Receiver<TesseraResult<ReceivedMessage>>,
    inbound_installed: Arc<Notify>,
    client_version: String,
    server_version: String,
    host_key: Option<Arc<dyn HostKey>>,
    server: Option<ServerSide>,
    incoming_channels: mpsc::UnboundedSender<Channel>,
    kex: KexState,
    reader: JoinHandle<()>,
    outbox: JoinHandle<()>,
    disconnect_reason: DisconnectReason,
    peer_disconnected: bool,
}

impl Driver {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let result = self.run_loop(&mut shutdown).await;
        self.teardown(result).await;
    }

    async fn run_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> TesseraResult<()> {
        self.start_kex().await?;
        let inner = Arc::clone(&self.inner);
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.changed() => Event::Shutdown,
                _ = inner.packetizer.rekey_requested() => Event::Rekey("threshold"),
                _ = inner.rekey_requested.notified() => Event::Rekey("application"),
                packet = self.packets.recv() => Event::Packet(packet),
            };
            match event {
                Event::Shutdown => return Ok(()),
                Event::Rekey(trigger) => {
                    debug!(trigger, "Starting key re-exchange");
                    self.start_kex().await?;
                }
                Event::Packet(Some(Ok(msg))) => self.dispatch(msg).await?,
                Event::Packet(Some(Err(e))) => return Err(e),
                Event::Packet(None) => return Err(TesseraError::closed("reader stopped")),
            }
        }
    }

    fn queue(&self, payload: Vec<u8>) {
        let _ = self.inner.outbox.send(Outgoing::Message {
            payload,
            sent: None,
        });
    }

    /// Queues `payload` and returns a handle that resolves once it is sent.
    fn queue_then(&self, payload: Vec<u8>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.inner.outbox.send(Outgoing::Message {
            payload,
            sent: Some(tx),
        });
        rx
    }

    async fn dispatch(&mut self, msg: ReceivedMessage) -> TesseraResult<()> {
        let kind = msg.msg_type();
        let payload = msg.payload.as_slice();

        if is_kex_method_specific(kind) {
            return self.handle_kex_message(payload).await;
        }
        if is_userauth(kind) {
            return self.handle_auth(payload).await;
        }

        match MessageType::from_u8(kind) {
            Some(MessageType::Disconnect) => {
                let disconnect = Disconnect::from_bytes(payload)?;
                info!(
                    code = disconnect.reason_code,
                    reason = ?disconnect.reason(),
                    description = %disconnect.description,
                    "Peer disconnected"
                );
                self.peer_disconnected = true;
                Err(TesseraError::closed(format!(
                    "peer disconnected: {}",
                    disconnect.description
                )))
            }
            Some(MessageType::Ignore) => {
                trace!("Ignore message");
                Ok(())
            }
            Some(MessageType::Debug) => {
                let (always_display, text) = parse_debug_message(payload)?;
                debug!(always_display, message = %text, "Peer debug message");
                Ok(())
            }
            Some(MessageType::Unimplemented) => {
                let sequence = Reader::after_type(payload).read_u32()?;
                warn!(sequence, "Peer did not implement a message we sent");
                Ok(())
            }
            Some(MessageType::ServiceRequest) => self.handle_service_request(payload),
            Some(MessageType::ServiceAccept) => {
                if self.inner.is_server {
                    return Err(TesseraError::Protocol("Client sent SERVICE_ACCEPT".to_string()));
                }
                let service = parse_service_message(MessageType::ServiceAccept, payload)?;
                debug!(service = %service, "Service accepted");
                self.inner.client_auth.lock().handle_service_accept(&service)
            }
            Some(MessageType::KexInit) => self.handle_kexinit(payload).await,
            Some(MessageType::NewKeys) => self.handle_newkeys(payload).await,
            Some(MessageType::GlobalRequest) => self.handle_global_request(payload).await,
            Some(MessageType::RequestSuccess) | Some(MessageType::RequestFailure) => {
                let waiter = self.inner.global_replies.lock().pop_front();
                match waiter {
                    Some(tx) => {
                        let data = (kind == MessageType::RequestSuccess as u8)
                            .then(|| payload[1..].to_vec());
                        let _ = tx.send(data);
                    }
                    None => debug!("Unsolicited global request reply"),
                }
                Ok(())
            }
            Some(MessageType::ChannelOpen) => self.handle_channel_open(payload).await,
            Some(_) if is_channel_specific(kind) => self.handle_channel_message(kind, payload).await,
            _ => {
                debug!(kind, sequence = msg.sequence, "Unimplemented message");
                self.queue(unimplemented_message(msg.sequence));
                Ok(())
            }
        }
    }

    // Key exchange.

    async fn start_kex(&mut self) -> TesseraResult<()> {
        if self.kex.local_kexinit.is_some() {
            return Ok(());
        }
        let config = &self.inner.config;
        let payload = KexInit::new(&config.algorithms, config.rng.as_ref())?.to_bytes();
        if self.inner.packetizer.pause_and_send(&payload).await?.is_none() {
            return Err(TesseraError::Protocol(
                "Outbound traffic already paused for a key exchange".to_string(),
            ));
        }
        debug!("Sent KEXINIT");
        self.kex.local_kexinit = Some(payload);
        self.inner.set_state(SessionState::KexInProgress);
        if self.kex.peer_kexinit.is_some() {
            self.begin_exchange().await?;
        }
        Ok(())
    }

    async fn handle_kexinit(&mut self, payload: &[u8]) -> TesseraResult<()> {
        if self.kex.peer_kexinit.is_some() {
            return Err(TesseraError::Protocol("Duplicate KEXINIT".to_string()));
        }
        debug!("Received KEXINIT");
        self.inner.packetizer.note_peer_kexinit();
        self.kex.peer_kexinit = Some(payload.to_vec());
        if self.kex.local_kexinit.is_none() {
            self.start_kex().await
        } else {
            self.begin_exchange().await
        }
    }

    async fn begin_exchange(&mut self) -> TesseraResult<()> {
        let (local, peer) = match (&self.kex.local_kexinit, &self.kex.peer_kexinit) {
            (Some(local), Some(peer)) => (local.clone(), peer.clone()),
            _ => return Err(TesseraError::Protocol("KEXINIT missing".to_string())),
        };
        let is_server = self.inner.is_server;
        let (client_bytes, server_bytes) = if is_server {
            (peer, local)
        } else {
            (local, peer)
        };
        let client = KexInit::from_bytes(&client_bytes)?;
        let server = KexInit::from_bytes(&server_bytes)?;
        let negotiated = Negotiated::from_kexinits(&client, &server)?;

        let peer_init = if is_server { &client } else { &server };
        self.kex.skip_guessed_packet =
            peer_init.first_kex_packet_follows() && !peer_init.guess_matches(&negotiated);
        info!(
            kex = %negotiated.kex,
            host_key = %negotiated.host_key,
            cipher_out = if is_server {
                negotiated.cipher_server_to_client.name()
            } else {
                negotiated.cipher_client_to_server.name()
            },
            "Negotiated algorithms"
        );

        let config = &self.inner.config;
        let params = KexParams {
            is_server,
            client_version: self.client_version.clone(),
            server_version: self.server_version.clone(),
            client_kexinit: client_bytes,
            server_kexinit: server_bytes,
            host_key: self.host_key.clone(),
            rng: Arc::clone(&config.rng),
            gex_bounds: config.gex,
            moduli: Arc::clone(&config.moduli),
        };
        let mut engine = create_engine(&negotiated.kex, params)?;
        let messages = engine.start()?;
        self.kex.engine = Some(engine);
        self.kex.negotiated = Some(negotiated);
        send_kex(&self.inner.packetizer, messages).await
    }


    async fn handle_kex_message(&mut self, payload: &[u8]) -> TesseraResult<()> {
        if self.kex.skip_guessed_packet {
            self.kex.skip_guessed_packet = false;
            debug!(kind = payload[0], "Discarding wrongly guessed kex packet");
            return Ok(());
        }
        let engine = self.kex.engine.as_mut().ok_or_else(|| {
            TesseraError::Protocol(format!(
                "Key exchange message {} outside a key exchange",
                payload[0]
            ))
        })?;
        match engine.handle(payload)? {
            KexStep::Continue(messages) => send_kex(&self.inner.packetizer, messages).await,
            KexStep::Done(messages, output) => {
                send_kex(&self.inner.packetizer, messages).await?;
                self.finish_kex(output).await
            }
        }
    }

    async fn finish_kex(&mut self, output: KexOutput) -> TesseraResult<()> {
        let negotiated = self
            .kex
            .negotiated
            .clone()
            .ok_or_else(|| TesseraError::Protocol("Key exchange finished early".to_string()))?;
        let inner = Arc::clone(&self.inner);

        if !inner.is_server {
            let algorithm = key_blob_algorithm(&output.host_key_blob)?;
            if algorithm != negotiated.host_key {
                return Err(TesseraError::Security(format!(
                    "Server sent a {} host key, negotiated {}",
                    algorithm, negotiated.host_key
                )));
            }
            if let Some(verifier) = &inner.config.host_key_verifier {
                if !verifier(&output.host_key_blob) {
                    self.disconnect_reason = DisconnectReason::HostKeyNotVerifiable;
                    return Err(TesseraError::Security(format!(
                        "Host key {} rejected",
                        fingerprint(&output.host_key_blob)
                    )));
                }
            }
            debug!(fingerprint = %fingerprint(&output.host_key_blob), "Server host key accepted");
            *inner.remote_host_key.lock() = Some(output.host_key_blob.clone());
        }

        let session_id = inner
            .session_id
            .lock()
            .get_or_insert_with(|| output.exchange_hash.clone())
            .clone();
        let (outbound, inbound) =
            derive_direction_keys(&negotiated, &output, &session_id, inner.is_server)?;
        self.kex.pending_inbound = Some(inbound);
        self.kex.engine = None;

        inner
            .packetizer
            .send_then_switch(&NewKeys::new().to_bytes(), outbound)
            .await?;
        self.kex.newkeys_sent = true;
        *inner.negotiated.lock() = Some(negotiated);
        debug!("Sent NEWKEYS");
        Ok(())
    }

    async fn handle_newkeys(&mut self, payload: &[u8]) -> TesseraResult<()> {
        NewKeys::from_bytes(payload)?;
        let keys = match (self.kex.newkeys_sent, self.kex.pending_inbound.take()) {
            (true, Some(keys)) => keys,
            _ => {
                return Err(TesseraError::Protocol(
                    "NEWKEYS before the key exchange finished".to_string(),
                ))
            }
        };
        self.inner.packetizer.set_inbound(keys).await;
        self.inbound_installed.notify_one();

        let completed = self.kex.completed + 1;
        self.kex = KexState {
            completed,
            ..KexState::default()
        };
        let next = if self.inner.authenticated.load(Ordering::SeqCst) {
            SessionState::Authenticated
        } else {
            SessionState::KeysActive
        };
        self.inner.set_state(next);
        self.inner.kex_rounds.send_replace(completed);
        info!(round = completed, "Key exchange complete");
        Ok(())
    }

    // Services and authentication.

    fn handle_service_request(&mut self, payload: &[u8]) -> TesseraResult<()> {
        let service = parse_service_message(MessageType::ServiceRequest, payload)?;
        let accepted = match self.server.as_mut() {
            Some(side) if service == SERVICE_USERAUTH => {
                side.userauth_accepted = true;
                true
            }
            Some(_) => false,
            None => {
                return Err(TesseraError::Protocol("Server sent SERVICE_REQUEST".to_string()))
            }
        };
        if !accepted {
            self.disconnect_reason = DisconnectReason::ServiceNotAvailable;
            return Err(TesseraError::Protocol(format!(
                "Service '{}' not available",
                service
            )));
        }
        debug!(service = %service, "Service accepted");
        self.queue(service_message(MessageType::ServiceAccept, &service));
        Ok(())
    }

    async fn handle_auth(&mut self, payload: &[u8]) -> TesseraResult<()> {
        let session_id = self.inner.session_id.lock().clone().unwrap_or_default();
        let step = match self.server.as_mut() {
            Some(side) => {
                if !side.userauth_accepted {
                    return Err(TesseraError::Protocol(
                        "Auth message before ssh-userauth was requested".to_string(),
                    ));
                }
                let step = side.auth.handle(payload, &session_id).await?;
                if step.exhausted {
                    warn!(
                        failures = side.auth.failures(),
                        exhausted = side.auth.is_exhausted(),
                        "Authentication attempt limit reached"
                    );
                }
                step
            }
            None => {
                let done = self.inner.client_auth.lock().handle(payload)?;
                if done {
                    self.inner.mark_authenticated(None);
                }
                return Ok(());
            }
        };

        for reply in step.replies {
            self.queue(reply);
        }
        if let Some(user) = step.authenticated {
            self.inner.mark_authenticated(Some(user));
        }
        if step.exhausted {
            self.disconnect_reason = DisconnectReason::NoMoreAuthMethodsAvailable;
            return Err(TesseraError::closed("too many authentication failures"));
        }
        Ok(())
    }

    // Connection protocol.

    async fn handle_global_request(&mut self, payload: &[u8]) -> TesseraResult<()> {
        let request = GlobalRequest::from_bytes(payload)?;
        let response = match &self.server {
            Some(side) if self.inner.authenticated.load(Ordering::SeqCst) => {
                side.handler.global_request(&request.name, &request.data).await
            }
            _ => None,
        };
        debug!(
            request = %request.name,
            accepted = response.is_some(),
            "Global request"
        );
        if request.want_reply {
            self.queue(match response {
                Some(data) => request_success_message(&data),
                None => vec![MessageType::RequestFailure as u8],
            });
        }
        Ok(())
    }

    async fn handle_channel_open(&mut self, payload: &[u8]) -> TesseraResult<()> {
        let open = ChannelOpen::from_bytes(payload)?;
        let decision = match &self.server {
            Some(side) if self.inner.authenticated.load(Ordering::SeqCst) => {
                side.handler.channel_open(open.channel_type()).await
            }
            _ => Err(ChannelOpenFailureReason::AdministrativelyProhibited),
        };

        match decision {
            Err(reason) => {
                debug!(
                    kind = open.channel_type().name(),
                    reason = reason.as_str(),
                    "Refusing channel"
                );
                self.queue(ChannelOpenFailure::new(open.sender_channel(), reason).to_bytes());
            }
            Ok(()) => {
                let channel = self.inner.register_channel(open.channel_type().clone());
                channel.activate(
                    open.sender_channel(),
                    open.initial_window_size(),
                    open.maximum_packet_size(),
                );
                let confirmation = ChannelOpenConfirmation {
                    recipient_channel: open.sender_channel(),
                    sender_channel: channel.local_id(),
                    initial_window_size: self.inner.config.window_size,
                    maximum_packet_size: self.inner.config.max_packet_size,
                };
                let sent = self.queue_then(confirmation.to_bytes());
                let incoming = self.incoming_channels.clone();
                tokio::spawn(async move {
                    if sent.await.is_ok() {
                        let _ = incoming.send(channel);
                    }
                });
            }
        }
        Ok(())
    }

    fn lookup(&self, id: u32) -> TesseraResult<Option<Channel>> {
        match self.inner.channels.get(id) {
            Lookup::Live(channel) => Ok(Some(channel)),
            Lookup::Stale => {
                debug!(channel = id, "Message for a closed channel");
                Ok(None)
            }
            Lookup::Unknown => Err(TesseraError::Protocol(format!(
                "Message for unknown channel {}",
                id
            ))),
        }
    }

    async fn handle_channel_message(&mut self, kind: u8, payload: &[u8]) -> TesseraResult<()> {
        let id = recipient_channel(payload)?;
        let Some(channel) = self.lookup(id)? else {
            return Ok(());
        };
        let mut r = Reader::after_type(payload);
        r.read_u32()?;

        match MessageType::from_u8(kind) {
            Some(MessageType::ChannelOpenConfirmation) => {
                let confirmation = ChannelOpenConfirmation::from_bytes(payload)?;
                channel.activate(
                    confirmation.sender_channel,
                    confirmation.initial_window_size,
                    confirmation.maximum_packet_size,
                );
            }
            Some(MessageType::ChannelOpenFailure) => {
                let failure = ChannelOpenFailure::from_bytes(payload)?;
                debug!(channel = id, reason = failure.reason_code, "Channel open refused");
                self.inner.channels.remove(id);
                channel.fail_open(failure.into_error());
            }
            Some(MessageType::ChannelWindowAdjust) => channel.handle_window_adjust(r.read_u32()?),
            Some(MessageType::ChannelData) => channel.handle_data(r.read_bytes()?),
            Some(MessageType::ChannelExtendedData) => {
                let code = r.read_u32()?;
                channel.handle_extended_data(code, r.read_bytes()?);
            }
            Some(MessageType::ChannelEof) => channel.handle_eof(),
            Some(MessageType::ChannelClose) => {
                if let Some(remote_id) = channel.handle_close() {
                    self.queue(channel_only_message(MessageType::ChannelClose, remote_id));
                }
            }
            Some(MessageType::ChannelRequest) => self.handle_channel_request(channel, payload).await?,
            Some(MessageType::ChannelSuccess) => channel.handle_request_reply(true),
            Some(MessageType::ChannelFailure) => channel.handle_request_reply(false),
            _ => {
                return Err(TesseraError::Protocol(format!(
                    "Unexpected channel message {}",
                    kind
                )))
            }
        }
        Ok(())
    }

    async fn handle_channel_request(&mut self, channel: Channel, payload: &[u8]) -> TesseraResult<()> {
        let request = ChannelRequest::from_bytes(payload)?;
        let Some(remote_id) = channel.active_remote_id() else {
            debug!(channel = channel.local_id(), "Request on an inactive channel");
            return Ok(());
        };
        let handler = self.server.as_ref().map(|side| Arc::clone(&side.handler));
        let request_type = request.request_type().clone();

        let (accepted, starts_session) = match (&request_type, &handler) {
            (ChannelRequestType::ExitStatus { exit_status }, _) => {
                channel.set_exit_status(*exit_status);
                (true, false)
            }
            (
                ChannelRequestType::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                },
                _,
            ) => {
                channel.set_exit_signal(ExitSignal {
                    signal_name: signal_name.clone(),
                    core_dumped: *core_dumped,
                    error_message: error_message.clone(),
                });
                (true, false)
            }
            (ChannelRequestType::PtyReq { term, width_chars, height_rows, .. }, Some(h)) => {
                (h.pty_request(&channel, term, *width_chars, *height_rows).await, false)
            }
            (ChannelRequestType::Shell, Some(h)) => (h.shell_request(&channel).await, true),
            (ChannelRequestType::Exec { command }, Some(h)) => {
                (h.exec_request(&channel, command).await, true)
            }
            (ChannelRequestType::Subsystem { name }, Some(h)) => {
                (h.subsystem_request(&channel, name).await, true)
            }
            (ChannelRequestType::Env { name, value }, Some(h)) => {
                (h.env_request(&channel, name, value).await, false)
            }
            (ChannelRequestType::WindowChange { width_chars, height_rows, .. }, Some(h)) => {
                (h.window_change_request(&channel, *width_chars, *height_rows).await, false)
            }
            _ => (false, false),
        };
        debug!(
            channel = channel.local_id(),
            request = request_type.name(),
            accepted,
            "Channel request"
        );

        let sent = request.want_reply().then(|| {
            let reply = if accepted {
                MessageType::ChannelSuccess
            } else {
                MessageType::ChannelFailure
            };
            self.queue_then(channel_only_message(reply, remote_id))
        });

        if let (true, true, Some(handler)) = (accepted, starts_session, handler) {
            tokio::spawn(
                async move {
                    if let Some(sent) = sent {
                        if sent.await.is_err() {
                            return;
                        }
                    }
                    handler.session_started(channel, request_type).await;
                }
                .in_current_span(),
            );
        }
        Ok(())
    }

    // Shutdown.

    async fn teardown(mut self, result: TesseraResult<()>) {
        let inner = Arc::clone(&self.inner);
        inner.closed.store(true, Ordering::SeqCst);

        let reason = match &result {
            Ok(()) => {
                info!("Closing transport");
                DisconnectReason::ByApplication
            }
            Err(e) => {
                if self.peer_disconnected {
                    info!(error = %e, "Transport ended");
                } else {
                    warn!(error = %e, "Transport failed");
                }
                *inner.last_error.lock() = Some(e.to_string());
                self.disconnect_reason
            }
        };

        let (flushed_tx, flushed) = oneshot::channel();
        if inner.outbox.send(Outgoing::Flush(flushed_tx)).is_ok() {
            let _ = tokio::time::timeout(TEARDOWN_GRACE, flushed).await;
        }
        self.outbox.abort();

        if !self.peer_disconnected && !inner.packetizer.is_closed() {
            let description = match &result {
                Ok(()) => "closed by application".to_string(),
                Err(e) => e.to_string(),
            };
            let disconnect = Disconnect::new(reason, description).to_bytes();
            let _ = tokio::time::timeout(
                TEARDOWN_GRACE,
                inner.packetizer.send_message(&disconnect),
            )
            .await;
        }
        let _ = tokio::time::timeout(TEARDOWN_GRACE, inner.packetizer.close()).await;
        self.reader.abort();
        self.packets.close();

        if let Some(mut keepalive) = inner.keepalive.lock().take() {
            keepalive.stop();
        }

        let cause = inner.last_error();
        let channels = inner.channels.drain();
        debug!(channels = channels.len(), "Releasing channels");
        for channel in channels {
            channel.force_close(cause.clone());
        }
        inner.client_auth.lock().close();
        inner.global_replies.lock().clear();
        self.kex = KexState::default();

        inner.state.send_replace(SessionState::Closed);
        info!("Transport closed");
    }
}
