//! SSH channels (RFC 4254 Section 5).
//!
//! A [`Channel`] is a flow-controlled, two-stream virtual connection
//! multiplexed over one transport. The transport's receive loop feeds it
//! (data, window adjusts, EOF, close, request replies) while application
//! tasks read, write and issue requests through cheap clones of the handle.
//!
//! # Flow control
//!
//! Outbound sends are clipped to the peer's window and maximum packet size
//! and wait while the window is zero. Inbound, every byte the application
//! consumes is counted; once more than a tenth of the advertised window has
//! been consumed a `CHANNEL_WINDOW_ADJUST` returns that much credit.
//!
//! # Locking
//!
//! The [`ChannelTable`] lock is always taken before a channel's own lock,
//! never the reverse, and no channel lock is held across a send.

use crate::ssh::connection::{
    channel_only_message, data_message, extended_data_message, window_adjust_message,
    ChannelRequest, ChannelRequestType, ChannelType, CHANNEL_DATA_OVERHEAD, EXTENDED_DATA_STDERR,
};
use crate::ssh::message::MessageType;
use crate::ssh::packet::Packetizer;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tessera_platform::{ChannelError, TesseraError, TesseraResult};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Largest window a peer may grant (RFC 4254 Section 5.2).
const MAX_WINDOW: u64 = u32::MAX as u64;

/// Exit signal reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    /// Signal name without the "SIG" prefix
    pub signal_name: String,
    /// Whether a core was dumped
    pub core_dumped: bool,
    /// Error message
    pub error_message: String,
}

#[derive(Debug)]
struct ChannelState {
    remote_id: u32,
    active: bool,
    open_error: Option<ChannelError>,

    remote_window: u64,
    remote_max_packet: u32,

    local_window: u32,
    local_window_size: u32,
    local_max_packet: u32,
    consumed_since_adjust: u32,

    stdout: BytesMut,
    stderr: BytesMut,
    combine_stderr: bool,

    eof_received: bool,
    eof_sent: bool,
    close_received: bool,
    close_sent: bool,
    closed: bool,
    read_shutdown: bool,

    exit_status: Option<u32>,
    exit_signal: Option<ExitSignal>,
    pending_requests: VecDeque<oneshot::Sender<bool>>,

    session_closed: bool,
    session_cause: Option<String>,
}

impl ChannelState {
    fn closed_error(&self) -> TesseraError {
        if self.session_closed {
            TesseraError::SessionClosed(self.session_cause.clone())
        } else {
            TesseraError::Channel(ChannelError::Closed)
        }
    }

    /// Returns credit to hand back to the peer, if enough has been consumed.
    fn take_window_adjust(&mut self, consumed: usize) -> Option<(u32, u32)> {
        self.consumed_since_adjust = self.consumed_since_adjust.saturating_add(consumed as u32);
        if self.consumed_since_adjust <= self.local_window_size / 10
            || self.closed
            || self.eof_received
        {
            return None;
        }
        let amount = self.consumed_since_adjust;
        self.consumed_since_adjust = 0;
        self.local_window = self.local_window.saturating_add(amount);
        Some((self.remote_id, amount))
    }
}

struct ChannelInner {
    local_id: u32,
    kind: ChannelType,
    packetizer: Arc<Packetizer>,
    table: Weak<ChannelTable>,
    state: Mutex<ChannelState>,
    changed: Notify,
    request_lock: tokio::sync::Mutex<()>,
    timeout: Mutex<Option<Duration>>,
}

/// A handle to one SSH channel.
///
/// Clones share the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Channel")
            .field("local_id", &self.inner.local_id)
            .field("remote_id", &st.remote_id)
            .field("kind", &self.inner.kind.name())
            .field("active", &st.active)
            .field("closed", &st.closed)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        local_id: u32,
        kind: ChannelType,
        packetizer: Arc<Packetizer>,
        table: Weak<ChannelTable>,
        window_size: u32,
        max_packet_size: u32,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                local_id,
                kind,
                packetizer,
                table,
                state: Mutex::new(ChannelState {
                    remote_id: 0,
                    active: false,
                    open_error: None,
                    remote_window: 0,
                    remote_max_packet: 0,
                    local_window: window_size,
                    local_window_size: window_size,
                    local_max_packet: max_packet_size,
                    consumed_since_adjust: 0,
                    stdout: BytesMut::new(),
                    stderr: BytesMut::new(),
                    combine_stderr: false,
                    eof_received: false,
                    eof_sent: false,
                    close_received: false,
                    close_sent: false,
                    closed: false,
                    read_shutdown: false,
                    exit_status: None,
                    exit_signal: None,
                    pending_requests: VecDeque::new(),
                    session_closed: false,
                    session_cause: None,
                }),
                changed: Notify::new(),
                request_lock: tokio::sync::Mutex::new(()),
                timeout: Mutex::new(timeout),
            }),
        }
    }

    /// Local channel id.
    pub fn local_id(&self) -> u32 {
        self.inner.local_id
    }

    /// Peer's channel id (0 until the channel is active).
    pub fn remote_id(&self) -> u32 {
        self.inner.state.lock().remote_id
    }

    /// Channel kind as opened.
    pub fn kind(&self) -> &ChannelType {
        &self.inner.kind
    }

    /// True once the open handshake completed and until the channel closes.
    pub fn is_active(&self) -> bool {
        let st = self.inner.state.lock();
        st.active && !st.closed
    }

    /// True once the channel is closed locally or by the peer.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// True once the peer sent EOF.
    pub fn eof_received(&self) -> bool {
        self.inner.state.lock().eof_received
    }

    /// Sets the timeout applied to blocking sends and receives.
    ///
    /// `None` blocks indefinitely. Expiry raises [`TesseraError::Timeout`]
    /// and leaves the channel open.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *self.inner.timeout.lock() = timeout;
    }

    /// Returns the current timeout.
    pub fn timeout(&self) -> Option<Duration> {
        *self.inner.timeout.lock()
    }

    /// Routes stderr data into the stdout buffer.
    ///
    /// Anything already buffered on stderr is moved over immediately.
    pub fn set_combine_stderr(&self, combine: bool) -> bool {
        let mut st = self.inner.state.lock();
        let old = st.combine_stderr;
        st.combine_stderr = combine;
        if combine && !st.stderr.is_empty() {
            let pending = st.stderr.split();
            st.stdout.extend_from_slice(&pending);
        }
        old
    }

    /// True if `recv` would return without waiting.
    pub fn recv_ready(&self) -> bool {
        let st = self.inner.state.lock();
        !st.stdout.is_empty() || st.eof_received || st.closed || st.read_shutdown
    }

    /// True if `recv_stderr` would return without waiting.
    pub fn recv_stderr_ready(&self) -> bool {
        let st = self.inner.state.lock();
        !st.stderr.is_empty() || st.eof_received || st.closed || st.read_shutdown
    }

    /// True if `send` would not wait for window.
    pub fn send_ready(&self) -> bool {
        let st = self.inner.state.lock();
        st.closed || st.eof_sent || st.remote_window > 0
    }

    /// True once the peer reported an exit status or the channel closed.
    pub fn exit_status_ready(&self) -> bool {
        let st = self.inner.state.lock();
        st.exit_status.is_some() || st.closed
    }

    /// Exit signal, if the peer sent one.
    pub fn exit_signal(&self) -> Option<ExitSignal> {
        self.inner.state.lock().exit_signal.clone()
    }

    /// Sends data on the primary stream.
    ///
    /// Sends at most as much as the peer's window and packet size allow and
    /// returns how many bytes went out. Waits while the window is zero.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] after EOF was sent or the channel closed
    /// - [`TesseraError::Timeout`] if the channel timeout expires first
    /// - [`TesseraError::SessionClosed`] if the session died
    pub async fn send(&self, data: &[u8]) -> TesseraResult<usize> {
        self.send_stream(data, None).await
    }

    /// Sends data on the stderr stream (server side).
    pub async fn send_stderr(&self, data: &[u8]) -> TesseraResult<usize> {
        self.send_stream(data, Some(EXTENDED_DATA_STDERR)).await
    }

    /// Sends all of `data`, waiting for window as needed.
    pub async fn sendall(&self, data: &[u8]) -> TesseraResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            offset += self.send(&data[offset..]).await?;
        }
        Ok(())
    }

    /// Sends all of `data` on the stderr stream.
    pub async fn sendall_stderr(&self, data: &[u8]) -> TesseraResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            offset += self.send_stderr(&data[offset..]).await?;
        }
        Ok(())
    }

    async fn send_stream(&self, data: &[u8], extended: Option<u32>) -> TesseraResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let deadline = self.deadline();
        let (remote_id, size) = loop {
            let notified = self.inner.changed.notified();
            {
                let mut st = self.inner.state.lock();
                if st.closed || st.eof_sent {
                    return Err(st.closed_error());
                }
                if !st.active {
                    return Err(TesseraError::Channel(ChannelError::Closed));
                }
                if st.remote_window > 0 {
                    let chunk = st
                        .remote_max_packet
                        .saturating_sub(CHANNEL_DATA_OVERHEAD)
                        .max(1) as u64;
                    let size = (data.len() as u64).min(st.remote_window).min(chunk);
                    st.remote_window -= size;
                    break (st.remote_id, size as usize);
                }
            }
            trace!(channel = self.inner.local_id, "Waiting for window");
            self.wait(notified, deadline, "window credit").await?;
        };

        let payload = match extended {
            Some(code) => extended_data_message(remote_id, code, &data[..size]),
            None => data_message(remote_id, &data[..size]),
        };
        self.inner.packetizer.send_when_clear(&payload).await?;
        trace!(channel = self.inner.local_id, bytes = size, "Sent channel data");
        Ok(size)
    }

    /// Receives up to `max` bytes from the primary stream.
    ///
    /// Returns an empty vector at end of stream (EOF, close or read
    /// shutdown). Buffered data is always delivered first.
    ///
    /// # Errors
    ///
    /// - [`TesseraError::SessionClosed`] with the cause if the session died
    ///   before the peer finished the stream
    /// - [`TesseraError::Timeout`] if the channel timeout expires first
    pub async fn recv(&self, max: usize) -> TesseraResult<Vec<u8>> {
        self.recv_stream(max, false).await
    }

    /// Receives up to `max` bytes from the stderr stream.
    pub async fn recv_stderr(&self, max: usize) -> TesseraResult<Vec<u8>> {
        self.recv_stream(max, true).await
    }

    async fn recv_stream(&self, max: usize, stderr: bool) -> TesseraResult<Vec<u8>> {
        let deadline = self.deadline();
        let (data, adjust) = loop {
            let notified = self.inner.changed.notified();
            {
                let mut st = self.inner.state.lock();
                let buf = if stderr { &mut st.stderr } else { &mut st.stdout };
                if !buf.is_empty() {
                    let n = max.min(buf.len());
                    let data = buf.split_to(n).to_vec();
                    let adjust = st.take_window_adjust(n);
                    break (data, adjust);
                }
                if st.eof_received || st.read_shutdown {
                    return Ok(Vec::new());
                }
                if st.session_closed {
                    return Err(st.closed_error());
                }
                if st.closed {
                    return Ok(Vec::new());
                }
            }
            self.wait(notified, deadline, "channel data").await?;
        };

        if let Some((remote_id, amount)) = adjust {
            debug!(channel = self.inner.local_id, bytes = amount, "Adjusting window");
            if let Err(e) = self
                .inner
                .packetizer
                .send_when_clear(&window_adjust_message(remote_id, amount))
                .await
            {
                debug!(channel = self.inner.local_id, error = %e, "Window adjust not sent");
            }
        }
        Ok(data)
    }

    /// Reads the primary stream until end of stream.
    pub async fn read_to_end(&self) -> TesseraResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.recv(32 * 1024).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Reads the stderr stream until end of stream.
    pub async fn read_stderr_to_end(&self) -> TesseraResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.recv_stderr(32 * 1024).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Waits for the peer's exit status.
    ///
    /// Returns `None` if the channel closed without one.
    ///
    /// # Errors
    ///
    /// [`TesseraError::SessionClosed`] if the session died before a status
    /// arrived.
    pub async fn recv_exit_status(&self) -> TesseraResult<Option<u32>> {
        let deadline = self.deadline();
        loop {
            let notified = self.inner.changed.notified();
            {
                let st = self.inner.state.lock();
                if st.exit_status.is_some() {
                    return Ok(st.exit_status);
                }
                if st.session_closed {
                    return Err(st.closed_error());
                }
                if st.closed {
                    return Ok(None);
                }
            }
            self.wait(notified, deadline, "exit status").await?;
        }
    }

    /// Requests execution of `command`.
    pub async fn exec(&self, command: &str) -> TesseraResult<()> {
        self.request(ChannelRequestType::Exec {
            command: command.to_string(),
        })
        .await
    }

    /// Requests an interactive shell.
    pub async fn shell(&self) -> TesseraResult<()> {
        self.request(ChannelRequestType::Shell).await
    }

    /// Requests a named subsystem such as `sftp`.
    pub async fn subsystem(&self, name: &str) -> TesseraResult<()> {
        self.request(ChannelRequestType::Subsystem {
            name: name.to_string(),
        })
        .await
    }

    /// Requests a pseudo-terminal.
    pub async fn request_pty(&self, term: &str, width: u32, height: u32) -> TesseraResult<()> {
        self.request(ChannelRequestType::PtyReq {
            term: term.to_string(),
            width_chars: width,
            height_rows: height,
            width_pixels: 0,
            height_pixels: 0,
            modes: vec![0],
        })
        .await
    }

    /// Sets an environment variable for the command about to run.
    pub async fn set_environment_variable(&self, name: &str, value: &str) -> TesseraResult<()> {
        self.request(ChannelRequestType::Env {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// Tells the peer the terminal was resized. No reply is expected.
    pub async fn resize_pty(&self, width: u32, height: u32) -> TesseraResult<()> {
        self.notify_request(ChannelRequestType::WindowChange {
            width_chars: width,
            height_rows: height,
            width_pixels: 0,
            height_pixels: 0,
        })
        .await
    }

    /// Reports a command's exit status to the client (server side).
    pub async fn send_exit_status(&self, status: u32) -> TesseraResult<()> {
        self.notify_request(ChannelRequestType::ExitStatus {
            exit_status: status,
        })
        .await
    }

    /// Sends a request that wants a reply and waits for it.
    ///
    /// Replies arrive in request order, so sends are serialized per channel.
    ///
    /// # Errors
    ///
    /// [`ChannelError::RequestDenied`] on `CHANNEL_FAILURE`.
    pub async fn request(&self, request_type: ChannelRequestType) -> TesseraResult<()> {
        let name = request_type.name().to_string();
        let reply = {
            let _order = self.inner.request_lock.lock().await;
            let (tx, rx) = oneshot::channel();
            let remote_id = {
                let mut st = self.inner.state.lock();
                if st.closed || !st.active {
                    return Err(st.closed_error());
                }
                st.pending_requests.push_back(tx);
                st.remote_id
            };
            let payload = ChannelRequest::new(remote_id, request_type, true).to_bytes();
            self.inner.packetizer.send_when_clear(&payload).await?;
            rx
        };
        debug!(channel = self.inner.local_id, request = %name, "Channel request sent");

        match reply.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TesseraError::Channel(ChannelError::RequestDenied(name))),
            Err(_) => Err(self.inner.state.lock().closed_error()),
        }
    }

    async fn notify_request(&self, request_type: ChannelRequestType) -> TesseraResult<()> {
        let remote_id = {
            let st = self.inner.state.lock();
            if st.closed || !st.active {
                return Err(st.closed_error());
            }
            st.remote_id
        };
        let payload = ChannelRequest::new(remote_id, request_type, false).to_bytes();
        self.inner.packetizer.send_when_clear(&payload).await?;
        Ok(())
    }

    /// Stops delivering inbound data to callers. Nothing is sent.
    pub fn shutdown_read(&self) {
        let mut st = self.inner.state.lock();
        st.read_shutdown = true;
        st.stdout.clear();
        st.stderr.clear();
        drop(st);
        self.inner.changed.notify_waiters();
    }

    /// Sends EOF. A second call does nothing.
    pub async fn shutdown_write(&self) -> TesseraResult<()> {
        let remote_id = {
            let mut st = self.inner.state.lock();
            if st.eof_sent || st.closed || !st.active {
                return Ok(());
            }
            st.eof_sent = true;
            st.remote_id
        };
        self.inner.changed.notify_waiters();
        self.inner
            .packetizer
            .send_when_clear(&channel_only_message(MessageType::ChannelEof, remote_id))
            .await?;
        Ok(())
    }

    /// Shuts both directions down.
    pub async fn shutdown(&self) -> TesseraResult<()> {
        self.shutdown_read();
        self.shutdown_write().await
    }

    /// Sends EOF if needed, then CLOSE, and marks the channel closed.
    pub async fn close(&self) -> TesseraResult<()> {
        let (remote_id, send_eof, unlink) = {
            let mut st = self.inner.state.lock();
            if st.close_sent || !st.active {
                return Ok(());
            }
            let send_eof = !st.eof_sent;
            st.eof_sent = true;
            st.close_sent = true;
            st.closed = true;
            (st.remote_id, send_eof, st.close_received)
        };
        self.inner.changed.notify_waiters();
        debug!(channel = self.inner.local_id, "Closing channel");

        let packetizer = &self.inner.packetizer;
        let result = async {
            if send_eof {
                packetizer
                    .send_when_clear(&channel_only_message(MessageType::ChannelEof, remote_id))
                    .await?;
            }
            packetizer
                .send_when_clear(&channel_only_message(MessageType::ChannelClose, remote_id))
                .await
        }
        .await;

        if unlink {
            self.unlink();
        }
        match result {
            Ok(_) => Ok(()),
            Err(_) if packetizer.is_closed() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout().map(|t| Instant::now() + t)
    }

    async fn wait(
        &self,
        notified: tokio::sync::futures::Notified<'_>,
        deadline: Option<Instant>,
        what: &str,
    ) -> TesseraResult<()> {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, notified)
                .await
                .map_err(|_| TesseraError::Timeout(format!("waiting for {}", what))),
            None => {
                notified.await;
                Ok(())
            }
        }
    }

    fn unlink(&self) {
        if let Some(table) = self.inner.table.upgrade() {
            table.remove(self.inner.local_id);
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut ChannelState) -> R) -> R {
        let result = f(&mut self.inner.state.lock());
        self.inner.changed.notify_waiters();
        result
    }

    // Receive-loop entry points.

    /// Marks the channel open with the peer's parameters.
    pub(crate) fn activate(&self, remote_id: u32, remote_window: u32, remote_max_packet: u32) {
        self.update(|st| {
            st.remote_id = remote_id;
            st.remote_window = remote_window as u64;
            st.remote_max_packet = remote_max_packet;
            st.active = true;
        });
        debug!(
            channel = self.inner.local_id,
            remote = remote_id,
            window = remote_window,
            max_packet = remote_max_packet,
            "Channel active"
        );
    }

    /// Records an open failure.
    pub(crate) fn fail_open(&self, error: ChannelError) {
        self.update(|st| {
            st.open_error = Some(error);
            st.closed = true;
        });
    }

    /// Waits for the open handshake to finish.
    pub(crate) async fn wait_open(&self) -> TesseraResult<()> {
        loop {
            let notified = self.inner.changed.notified();
            {
                let mut st = self.inner.state.lock();
                if let Some(err) = st.open_error.take() {
                    return Err(TesseraError::Channel(err));
                }
                if st.active {
                    return Ok(());
                }
                if st.closed {
                    return Err(st.closed_error());
                }
            }
            notified.await;
        }
    }

    pub(crate) fn handle_data(&self, data: &[u8]) {
        self.receive(data, false);
    }

    pub(crate) fn handle_extended_data(&self, code: u32, data: &[u8]) {
        if code != EXTENDED_DATA_STDERR {
            debug!(channel = self.inner.local_id, code, "Ignoring extended data type");
            return;
        }
        self.receive(data, true);
    }

    fn receive(&self, data: &[u8], stderr: bool) {
        let local_id = self.inner.local_id;
        self.update(|st| {
            if st.closed || st.eof_received {
                debug!(channel = local_id, "Dropping data after EOF");
                return;
            }
            if data.len() > st.local_max_packet as usize {
                warn!(channel = local_id, len = data.len(), "Peer exceeded max packet size");
            }
            let accepted = data.len().min(st.local_window as usize);
            if accepted < data.len() {
                warn!(
                    channel = local_id,
                    dropped = data.len() - accepted,
                    "Peer exceeded window"
                );
            }
            st.local_window -= accepted as u32;
            if st.read_shutdown {
                st.consumed_since_adjust = st.consumed_since_adjust.saturating_add(accepted as u32);
                return;
            }
            if stderr && !st.combine_stderr {
                st.stderr.extend_from_slice(&data[..accepted]);
            } else {
                st.stdout.extend_from_slice(&data[..accepted]);
            }
        });
    }

    pub(crate) fn handle_window_adjust(&self, bytes: u32) {
        let window = self.update(|st| {
            st.remote_window = (st.remote_window + bytes as u64).min(MAX_WINDOW);
            st.remote_window
        });
        trace!(channel = self.inner.local_id, bytes, window, "Window adjusted");
    }

    pub(crate) fn handle_eof(&self) {
        debug!(channel = self.inner.local_id, "EOF received");
        self.update(|st| st.eof_received = true);
    }

    /// Handles the peer's CLOSE.
    ///
    /// Returns the remote id to answer with our own CLOSE, if one is still
    /// owed. The channel is unlinked from the table either way.
    pub(crate) fn handle_close(&self) -> Option<u32> {
        debug!(channel = self.inner.local_id, "CLOSE received");
        let reply = self.update(|st| {
            st.close_received = true;
            st.closed = true;
            st.pending_requests.clear();
            if st.close_sent {
                None
            } else {
                st.close_sent = true;
                st.eof_sent = true;
                Some(st.remote_id)
            }
        });
        self.unlink();
        reply
    }

    /// Delivers a CHANNEL_SUCCESS or CHANNEL_FAILURE.
    pub(crate) fn handle_request_reply(&self, success: bool) {
        let waiter = self.inner.state.lock().pending_requests.pop_front();
        match waiter {
            Some(tx) => {
                let _ = tx.send(success);
            }
            None => debug!(channel = self.inner.local_id, "Unsolicited request reply"),
        }
    }

    pub(crate) fn set_exit_status(&self, status: u32) {
        debug!(channel = self.inner.local_id, status, "Exit status received");
        self.update(|st| st.exit_status = Some(status));
    }

    pub(crate) fn set_exit_signal(&self, signal: ExitSignal) {
        debug!(channel = self.inner.local_id, signal = %signal.signal_name, "Exit signal received");
        self.update(|st| st.exit_signal = Some(signal));
    }

    /// Remote id, if the channel is active.
    pub(crate) fn active_remote_id(&self) -> Option<u32> {
        let st = self.inner.state.lock();
        st.active.then_some(st.remote_id)
    }

    /// Closes the channel because the session ended, waking every waiter.
    pub(crate) fn force_close(&self, cause: Option<String>) {
        self.update(|st| {
            st.closed = true;
            st.session_closed = true;
            st.session_cause = cause;
            st.pending_requests.clear();
        });
    }
}

/// Result of looking a channel id up.
#[derive(Debug)]
pub(crate) enum Lookup {
    Live(Channel),
    /// The id was used before; the channel has since gone away.
    Stale,
    /// The id was never allocated.
    Unknown,
}

#[derive(Debug, Default)]
struct TableState {
    next_id: u32,
    /// Set once ids have wrapped past `u32::MAX`; every id then counts as
    /// allocated before.
    wrapped: bool,
    channels: HashMap<u32, Channel>,
}

/// The transport's channel table, keyed by local id.
#[derive(Debug, Default)]
pub(crate) struct ChannelTable {
    state: Mutex<TableState>,
}

impl ChannelTable {
    /// Allocates the next free id and inserts the channel `build` makes.
    pub(crate) fn allocate(&self, build: impl FnOnce(u32) -> Channel) -> Channel {
        let mut st = self.state.lock();
        let mut id = st.next_id;
        while st.channels.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        if id < st.next_id || id == u32::MAX {
            st.wrapped = true;
        }
        st.next_id = id.wrapping_add(1);
        let channel = build(id);
        st.channels.insert(id, channel.clone());
        channel
    }

    pub(crate) fn get(&self, id: u32) -> Lookup {
        let st = self.state.lock();
        match st.channels.get(&id) {
            Some(channel) => Lookup::Live(channel.clone()),
            None if st.wrapped || id < st.next_id => Lookup::Stale,
            None => Lookup::Unknown,
        }
    }

    pub(crate) fn remove(&self, id: u32) -> Option<Channel> {
        let removed = self.state.lock().channels.remove(&id);
        if removed.is_some() {
            trace!(channel = id, "Channel unlinked");
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Removes and returns every channel.
    pub(crate) fn drain(&self) -> Vec<Channel> {
        self.state.lock().channels.drain().map(|(_, c)| c).collect()
    }
}
