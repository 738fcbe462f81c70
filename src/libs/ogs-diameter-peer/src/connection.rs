//! Diameter connection
//!
//! A [`Connection`] owns one framed byte stream to a remote peer. A single
//! reader task receives every inbound message and dispatches it:
//!
//! - base protocol answers (CEA, DWA, DPA) go to the exchange waiting on
//!   their hop-by-hop identifier, which judges them itself,
//! - DWR and DPR are answered in place,
//! - application answers are delivered to the matching pending exchange,
//! - everything else goes to the registered handler, or is reported as
//!   unhandled.
//!
//! Outbound frames are encoded by the caller and written by a single writer
//! task, so a caller that gives up mid-send never leaves half a frame behind.
//!
//! Lifecycle:
//!   Connecting -> Handshaking -> Open -> Closing -> Closed
//!   Connecting / Handshaking -> Closed (handshake failure)

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::avp::{Avp, AvpData};
use crate::common::{avp_code, DisconnectCause};
use crate::config::{PeerIdentity, PeerSettings};
use crate::correlator::{PendingTable, Resolution};
use crate::dict::Dictionary;
use crate::error::{DiameterError, DiameterResult, PeerError, PeerResult, ResultCode};
use crate::handler::HandlerRegistry;
use crate::message::{base_cmd, CommandId, DiameterMessage};
use crate::report::{ErrorCause, ErrorReporter};
use crate::session::SessionIdGenerator;
use crate::transport::{BoxedReader, BoxedWriter, Frame};

/// Consecutive undecodable frames tolerated before the connection is dropped
const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 3;

/// Encoded frames waiting for the writer task
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// One frame for the writer task and the slot acknowledging it
struct Outbound {
    frame: Bytes,
    done: oneshot::Sender<DiameterResult<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Transport established, CER not sent yet
    Connecting,
    /// CER sent, waiting for CEA
    Handshaking,
    Open,
    /// Pending exchanges failed, DPR in flight
    Closing,
    Closed,
}

impl ConnectionState {
    fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Connecting, Closed)
                | (Handshaking, Open)
                | (Handshaking, Closed)
                | (Open, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the remote peer advertised in its CEA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeerMetadata {
    pub origin_host: String,
    pub origin_realm: String,
    /// Auth, Acct and vendor-specific application ids
    pub application_ids: Vec<u32>,
}

/// Everything a connection shares with the client that created it
#[derive(Debug, Clone)]
pub(crate) struct ConnectionContext {
    pub(crate) identity: Arc<PeerIdentity>,
    pub(crate) settings: Arc<PeerSettings>,
    pub(crate) dictionary: Arc<Dictionary>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) reporter: ErrorReporter,
}

struct ConnectionInner {
    peer_addr: String,
    context: ConnectionContext,
    state: watch::Sender<ConnectionState>,
    metadata: OnceLock<RemotePeerMetadata>,
    /// Queue to the writer task; taken on teardown
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    pending: PendingTable,
    /// Base protocol exchanges by hop-by-hop id
    base_waiters: Mutex<HashMap<u32, oneshot::Sender<DiameterMessage>>>,
    sessions: SessionIdGenerator,
    hop_by_hop: AtomicU32,
    end_to_end: AtomicU32,
    last_inbound: Mutex<Instant>,
    tasks: Mutex<Vec<AbortHandle>>,
    torn_down: AtomicBool,
}

/// Handle to a live peer connection; cheap to clone
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes a base exchange waiter when the exchange ends, however it ends
struct BaseWaiter<'a> {
    conn: &'a Connection,
    hop_by_hop_id: u32,
}

impl Drop for BaseWaiter<'_> {
    fn drop(&mut self) {
        lock(&self.conn.inner.base_waiters).remove(&self.hop_by_hop_id);
    }
}

impl Connection {
    pub(crate) fn new(context: ConnectionContext, peer_addr: String, writer: BoxedWriter) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let sessions = SessionIdGenerator::new(context.identity.origin_host.clone());
        let conn = Self {
            inner: Arc::new(ConnectionInner {
                peer_addr,
                context,
                state,
                metadata: OnceLock::new(),
                outbound: Mutex::new(Some(outbound)),
                pending: PendingTable::default(),
                base_waiters: Mutex::new(HashMap::new()),
                sessions,
                hop_by_hop: AtomicU32::new(rand::random()),
                end_to_end: AtomicU32::new(rand::random()),
                last_inbound: Mutex::new(Instant::now()),
                tasks: Mutex::new(Vec::new()),
                torn_down: AtomicBool::new(false),
            }),
        };
        tokio::spawn(run_writer(conn.clone(), writer, queue));
        conn
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the connection is Closed
    pub async fn closed(&self) {
        let mut state = self.subscribe_state();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Remote transport address
    pub fn peer_addr(&self) -> &str {
        &self.inner.peer_addr
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.inner.context.identity
    }

    pub fn settings(&self) -> &PeerSettings {
        &self.inner.context.settings
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.inner.context.dictionary
    }

    /// Identity of the remote peer, known once the handshake completed
    pub fn peer_metadata(&self) -> PeerResult<&RemotePeerMetadata> {
        let state = self.state();
        match (state, self.inner.metadata.get()) {
            (ConnectionState::Connecting | ConnectionState::Handshaking, _) | (_, None) => {
                Err(PeerError::PeerMetadataUnavailable { state })
            }
            (_, Some(metadata)) => Ok(metadata),
        }
    }

    /// Number of exchanges waiting for an answer
    pub fn pending_exchanges(&self) -> usize {
        self.inner.pending.len()
    }

    pub(crate) fn pending(&self) -> &PendingTable {
        &self.inner.pending
    }

    pub(crate) fn next_session_id(&self) -> String {
        self.inner.sessions.next_id()
    }

    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let peer = &self.inner.peer_addr;
        self.inner.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                log::debug!("[{peer}] {state} -> {next}");
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Record the CEA outcome and move to Open
    pub(crate) fn open(&self, metadata: RemotePeerMetadata) -> bool {
        let _ = self.inner.metadata.set(metadata);
        self.touch();
        self.transition(ConnectionState::Open)
    }

    pub(crate) fn touch(&self) {
        *lock(&self.inner.last_inbound) = Instant::now();
    }

    /// Time since the last valid inbound message
    pub(crate) fn idle_for(&self) -> Duration {
        lock(&self.inner.last_inbound).elapsed()
    }

    pub(crate) fn report(&self, cause: ErrorCause, detail: impl Into<String>) {
        self.inner
            .context
            .reporter
            .report(cause, Some(&self.inner.peer_addr), detail);
    }

    pub(crate) fn describe(&self, command: CommandId) -> String {
        self.dictionary()
            .command_name(command)
            .unwrap_or_else(|| command.to_string())
    }

    fn track_task(&self, handle: AbortHandle) {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            handle.abort();
        } else {
            lock(&self.inner.tasks).push(handle);
        }
    }

    /// Run `task` for the lifetime of the connection
    pub(crate) fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.track_task(handle.abort_handle());
    }

    pub(crate) fn spawn_reader(&self, reader: BoxedReader) {
        self.spawn_task(run_reader(self.clone(), reader));
    }

    /// Assign hop-by-hop and end-to-end identifiers to a request lacking them
    pub(crate) fn prepare_request(&self, msg: &mut DiameterMessage) {
        if msg.header.hop_by_hop_id == 0 {
            msg.header.hop_by_hop_id = self.inner.hop_by_hop.fetch_add(1, Ordering::Relaxed);
        }
        if msg.header.end_to_end_id == 0 {
            msg.header.end_to_end_id = self.inner.end_to_end.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Queue `msg` for the writer task and wait until it is on the wire.
    ///
    /// Once queued, the frame is written in full even if this future is
    /// dropped.
    pub(crate) async fn write(&self, msg: &DiameterMessage) -> PeerResult<()> {
        let (done, written) = oneshot::channel();
        {
            let queue = lock(&self.inner.outbound)
                .clone()
                .ok_or(PeerError::ConnectionClosed)?;
            let frame = msg.encode().freeze();
            queue
                .send(Outbound { frame, done })
                .await
                .map_err(|_| PeerError::ConnectionClosed)?;
        }

        match written.await {
            Ok(Ok(())) => {
                log::debug!(
                    "[{}] sent {} (hbh {:#010x})",
                    self.inner.peer_addr,
                    self.describe(msg.command_id()),
                    msg.header.hop_by_hop_id
                );
                Ok(())
            }
            Ok(Err(e)) => Err(PeerError::Send(e)),
            Err(_) => Err(PeerError::ConnectionClosed),
        }
    }

    /// Send a message without waiting for an answer.
    ///
    /// Requests get fresh hop-by-hop / end-to-end identifiers when they
    /// carry none. The message must satisfy the dictionary.
    pub async fn send(&self, mut msg: DiameterMessage) -> PeerResult<()> {
        match self.state() {
            ConnectionState::Open => {}
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(PeerError::ConnectionClosed)
            }
            state => return Err(PeerError::NotOpen { state }),
        }
        self.dictionary()
            .validate(&msg)
            .map_err(PeerError::InvalidMessage)?;
        if msg.header.is_request() {
            self.prepare_request(&mut msg);
        }
        self.write(&msg).await
    }

    /// Send a base request and wait for its answer, retransmitting with the
    /// T bit set every `interval`, at most `max_retransmits` times.
    ///
    /// `Ok(None)` means every attempt went unanswered.
    pub(crate) async fn exchange_base(
        &self,
        mut request: DiameterMessage,
        max_retransmits: u32,
        interval: Duration,
    ) -> PeerResult<Option<DiameterMessage>> {
        self.prepare_request(&mut request);
        let hop_by_hop_id = request.header.hop_by_hop_id;

        let (tx, mut rx) = oneshot::channel();
        lock(&self.inner.base_waiters).insert(hop_by_hop_id, tx);
        let _waiter = BaseWaiter {
            conn: self,
            hop_by_hop_id,
        };

        self.write(&request).await?;
        let mut retransmits = 0;
        loop {
            match tokio::time::timeout(interval, &mut rx).await {
                Ok(Ok(answer)) => return Ok(Some(answer)),
                Ok(Err(_)) => return Err(PeerError::ConnectionClosed),
                Err(_) if retransmits < max_retransmits => {
                    retransmits += 1;
                    log::debug!(
                        "[{}] no answer to {} within {interval:?}, retransmission {retransmits}/{max_retransmits}",
                        self.inner.peer_addr,
                        self.describe(request.command_id()),
                    );
                    request.header.set_retransmit();
                    self.write(&request).await?;
                }
                Err(_) => return Ok(None),
            }
        }
    }

    fn header_avps(&self, msg: &mut DiameterMessage) {
        let identity = self.identity();
        msg.add_avp(Avp::identity(avp_code::ORIGIN_HOST, &identity.origin_host));
        msg.add_avp(Avp::identity(avp_code::ORIGIN_REALM, &identity.origin_realm));
    }

    pub(crate) fn build_dwr(&self) -> DiameterMessage {
        let mut dwr = DiameterMessage::new_base_request(base_cmd::DEVICE_WATCHDOG);
        self.header_avps(&mut dwr);
        dwr.add_avp(Avp::unsigned32(
            avp_code::ORIGIN_STATE_ID,
            self.identity().origin_state_id,
        ));
        dwr
    }

    fn build_dpr(&self, cause: DisconnectCause) -> DiameterMessage {
        let mut dpr = DiameterMessage::new_base_request(base_cmd::DISCONNECT_PEER);
        self.header_avps(&mut dpr);
        dpr.add_avp(Avp::mandatory(
            avp_code::DISCONNECT_CAUSE,
            AvpData::Enumerated(cause as i32),
        ));
        dpr
    }

    /// Answer carrying Session-Id (if any), Result-Code and origin AVPs
    fn build_answer(&self, request: &DiameterMessage, result: ResultCode) -> DiameterMessage {
        let mut answer = DiameterMessage::new_answer(request);
        if let Some(session_id) = request.session_id() {
            answer.add_avp(Avp::utf8(avp_code::SESSION_ID, session_id));
        }
        answer.add_avp(Avp::unsigned32(avp_code::RESULT_CODE, result as u32));
        self.header_avps(&mut answer);
        if result.is_protocol_error() {
            answer.header.set_error();
        }
        answer
    }

    async fn reply(&self, answer: DiameterMessage) {
        if let Err(e) = self.write(&answer).await {
            log::warn!(
                "[{}] failed to answer {}: {e}",
                self.inner.peer_addr,
                self.describe(answer.command_id())
            );
        }
    }

    /// Reader task entry point for each decoded message
    async fn dispatch(&self, msg: DiameterMessage) {
        let command = msg.command_id();
        log::debug!(
            "[{}] received {} (hbh {:#010x})",
            self.inner.peer_addr,
            self.describe(command),
            msg.header.hop_by_hop_id
        );

        if command.is_base() && msg.header.is_answer() {
            self.dispatch_base_answer(msg);
            return;
        }

        if let Err(e) = self.dictionary().validate(&msg) {
            self.report(
                ErrorCause::DecodeError,
                format!("{} rejected: {e}", self.describe(command)),
            );
            if msg.header.is_request() {
                let result = match e {
                    DiameterError::UnknownApplication(_) => ResultCode::ApplicationUnsupported,
                    DiameterError::UnknownCommand(_) => ResultCode::CommandUnsupported,
                    DiameterError::MissingAvp(_) => ResultCode::MissingAvp,
                    _ => ResultCode::UnableToComply,
                };
                self.reply(self.build_answer(&msg, result)).await;
            }
            return;
        }
        self.touch();

        if command.is_base() {
            self.dispatch_base(msg).await;
            return;
        }

        if self.state() != ConnectionState::Open {
            self.report(
                ErrorCause::UnhandledMessage,
                format!("{} received while {}", self.describe(command), self.state()),
            );
            return;
        }

        let msg = if msg.header.is_answer() {
            match self.inner.pending.resolve(msg) {
                Resolution::Delivered => return,
                Resolution::Late(session_id) => {
                    log::debug!(
                        "[{}] dropping late {} for session {session_id}",
                        self.inner.peer_addr,
                        self.describe(command)
                    );
                    return;
                }
                Resolution::Unmatched(msg) => msg,
            }
        } else {
            msg
        };

        match self.inner.context.handlers.get(command) {
            Some(handler) => handler(self, msg),
            None => {
                self.report(
                    ErrorCause::UnhandledMessage,
                    format!("no handler for {}", self.describe(command)),
                );
                if msg.header.is_request() {
                    self.reply(self.build_answer(&msg, ResultCode::CommandUnsupported))
                        .await;
                }
            }
        }
    }

    /// Hand a CEA/DWA/DPA to its waiter as received.
    ///
    /// The waiter checks the content, so an answer missing AVPs still counts
    /// as an answer. Only answers nobody waits for are validated here.
    fn dispatch_base_answer(&self, msg: DiameterMessage) {
        let hop_by_hop_id = msg.header.hop_by_hop_id;
        let waiter = lock(&self.inner.base_waiters).remove(&hop_by_hop_id);
        if let Some(tx) = waiter {
            self.touch();
            let _ = tx.send(msg);
            return;
        }

        let name = self.describe(msg.command_id());
        match self.dictionary().validate(&msg) {
            Ok(()) => {
                self.touch();
                self.report(
                    ErrorCause::UnhandledMessage,
                    format!("unexpected {name} (hbh {hop_by_hop_id:#010x})"),
                );
            }
            Err(e) => self.report(ErrorCause::DecodeError, format!("{name} rejected: {e}")),
        }
    }

    /// Base protocol requests
    async fn dispatch_base(&self, msg: DiameterMessage) {
        match msg.header.command_code {
            base_cmd::DEVICE_WATCHDOG => {
                let mut dwa = self.build_answer(&msg, ResultCode::Success);
                dwa.add_avp(Avp::unsigned32(
                    avp_code::ORIGIN_STATE_ID,
                    self.identity().origin_state_id,
                ));
                self.reply(dwa).await;
            }
            base_cmd::DISCONNECT_PEER => {
                let cause = msg
                    .find_avp(avp_code::DISCONNECT_CAUSE)
                    .and_then(Avp::as_u32)
                    .and_then(DisconnectCause::from_u32);
                log::info!(
                    "[{}] peer requested disconnect ({cause:?})",
                    self.inner.peer_addr
                );
                self.reply(self.build_answer(&msg, ResultCode::Success)).await;
                self.teardown("disconnect requested by peer");
            }
            _ => {
                self.report(
                    ErrorCause::UnhandledMessage,
                    format!("unexpected {}", self.describe(msg.command_id())),
                );
                self.reply(self.build_answer(&msg, ResultCode::CommandUnsupported))
                    .await;
            }
        }
    }

    /// Gracefully close: fail pending exchanges, send DPR, wait briefly for
    /// DPA, then shut the transport down.
    pub async fn close(&self) {
        if self.transition(ConnectionState::Closing) {
            let failed = self.inner.pending.fail_all();
            log::info!(
                "[{}] closing connection ({failed} pending exchange(s) failed)",
                self.inner.peer_addr
            );
            let dpr = self.build_dpr(DisconnectCause::DoNotWantToTalkToYou);
            match self
                .exchange_base(dpr, 0, self.settings().retransmit_interval)
                .await
            {
                Ok(Some(_)) => log::debug!("[{}] DPA received", self.inner.peer_addr),
                Ok(None) => log::debug!("[{}] no DPA, closing anyway", self.inner.peer_addr),
                Err(e) => log::debug!("[{}] DPR not delivered: {e}", self.inner.peer_addr),
            }
        }
        self.teardown("closed locally");
    }

    /// Release everything the connection holds and move to Closed.
    ///
    /// Runs once; later calls return immediately. May be called from the
    /// connection's own tasks, so task cancellation happens last.
    pub(crate) fn teardown(&self, reason: &str) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[{}] connection closing: {reason}", self.inner.peer_addr);

        self.transition(ConnectionState::Closing);
        let failed = self.inner.pending.fail_all();
        if failed > 0 {
            log::debug!(
                "[{}] {failed} pending exchange(s) failed with connection closed",
                self.inner.peer_addr
            );
        }
        lock(&self.inner.base_waiters).clear();

        // The writer task finishes what is queued, then shuts the stream down
        lock(&self.inner.outbound).take();

        self.transition(ConnectionState::Closed);
        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in tasks {
            task.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

async fn run_reader(conn: Connection, mut reader: BoxedReader) {
    let mut decode_errors = 0;
    loop {
        match reader.recv().await {
            Ok(Frame::Message(msg)) => {
                decode_errors = 0;
                conn.dispatch(msg).await;
            }
            Ok(Frame::Malformed(e)) => {
                decode_errors += 1;
                conn.report(ErrorCause::DecodeError, format!("malformed message: {e}"));
                if decode_errors >= MAX_CONSECUTIVE_DECODE_ERRORS {
                    conn.teardown("too many malformed messages");
                    return;
                }
            }
            Err(e) => {
                match conn.state() {
                    ConnectionState::Closing | ConnectionState::Closed => {
                        log::debug!("[{}] reader stopped: {e}", conn.peer_addr());
                    }
                    _ => conn.report(ErrorCause::TransportFailure, e.to_string()),
                }
                conn.teardown("transport failure");
                return;
            }
        }
    }
}

/// Sole owner of the write half. Every write is bounded by
/// `write_timeout`; a stalled or failed write closes the connection.
async fn run_writer(
    conn: Connection,
    mut writer: BoxedWriter,
    mut queue: mpsc::Receiver<Outbound>,
) {
    let write_timeout = conn.settings().write_timeout;
    while let Some(Outbound { frame, done }) = queue.recv().await {
        let result = match tokio::time::timeout(write_timeout, writer.send_frame(&frame)).await {
            Ok(result) => result,
            Err(_) => Err(DiameterError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("write stalled for {write_timeout:?}"),
            ))),
        };
        if let Err(e) = result {
            let detail = format!("write failed: {e}");
            let _ = done.send(Err(e));
            match conn.state() {
                ConnectionState::Closing | ConnectionState::Closed => {
                    log::debug!("[{}] {detail}", conn.peer_addr());
                }
                _ => conn.report(ErrorCause::TransportFailure, detail),
            }
            conn.teardown("transport failure");
            return;
        }
        let _ = done.send(Ok(()));
    }

    match tokio::time::timeout(write_timeout, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("[{}] transport shutdown: {e}", conn.peer_addr()),
        Err(_) => log::debug!("[{}] transport shutdown timed out", conn.peer_addr()),
    }
}
