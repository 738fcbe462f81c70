//! Request/answer correlation
//!
//! Every [`Connection::send_and_wait`] registers its Session-Id in the
//! connection's [`PendingTable`] before the request is written. The reader
//! task resolves the entry when the answer arrives; the caller expires it
//! when its deadline passes. Whichever comes first removes the entry under
//! the table lock, so each exchange completes exactly once.
//!
//! Recently finished Session-Ids are remembered for a while so an answer
//! arriving after its exchange timed out is recognised and dropped instead
//! of being handed to a handler.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::avp::Avp;
use crate::common::avp_code;
use crate::connection::{Connection, ConnectionState, RemotePeerMetadata};
use crate::error::{DiameterError, PeerError, PeerResult};
use crate::message::{CommandId, DiameterMessage};

/// Finished Session-Ids kept for late answer detection
const FINISHED_HISTORY: usize = 256;

type AnswerSlot = oneshot::Sender<PeerResult<DiameterMessage>>;

struct Waiter {
    expected: CommandId,
    slot: AnswerSlot,
}

#[derive(Default)]
struct PendingInner {
    waiting: HashMap<String, Waiter>,
    finished: VecDeque<String>,
    /// Set once the connection starts closing; no new exchanges after that
    closed: bool,
}

impl PendingInner {
    fn remember(&mut self, session_id: String) {
        if self.finished.len() == FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back(session_id);
    }
}

/// Outcome of offering an inbound answer to the table
#[derive(Debug)]
pub(crate) enum Resolution {
    Delivered,
    /// Answer for an exchange that already timed out
    Late(String),
    Unmatched(DiameterMessage),
}

/// Session-Id → waiting caller
#[derive(Default)]
pub(crate) struct PendingTable {
    inner: Mutex<PendingInner>,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn register(
        &self,
        session_id: &str,
        expected: CommandId,
    ) -> PeerResult<oneshot::Receiver<PeerResult<DiameterMessage>>> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(PeerError::ConnectionClosed);
        }
        if inner.waiting.contains_key(session_id) {
            return Err(PeerError::DuplicateSession(session_id.to_string()));
        }
        let (slot, rx) = oneshot::channel();
        inner
            .waiting
            .insert(session_id.to_string(), Waiter { expected, slot });
        Ok(rx)
    }

    /// Deliver `answer` to the exchange waiting on its Session-Id
    pub(crate) fn resolve(&self, answer: DiameterMessage) -> Resolution {
        let Some(session_id) = answer.session_id().map(str::to_string) else {
            return Resolution::Unmatched(answer);
        };

        let mut inner = self.lock();
        let expected = inner
            .waiting
            .get(&session_id)
            .is_some_and(|w| w.expected == answer.command_id());
        if expected {
            if let Some(waiter) = inner.waiting.remove(&session_id) {
                // Sent under the lock so an expiring caller finds it in its slot
                let _ = waiter.slot.send(Ok(answer));
                inner.remember(session_id);
                return Resolution::Delivered;
            }
        }
        if inner.finished.contains(&session_id) {
            return Resolution::Late(session_id);
        }
        Resolution::Unmatched(answer)
    }

    /// Remove an unanswered exchange; false if it was already resolved
    pub(crate) fn expire(&self, session_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.waiting.remove(session_id) {
            Some(_) => {
                inner.remember(session_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Fail every waiting exchange with `ConnectionClosed` and refuse new ones
    pub(crate) fn fail_all(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        let waiting = std::mem::take(&mut inner.waiting);
        let count = waiting.len();
        for (_, waiter) in waiting {
            let _ = waiter.slot.send(Err(PeerError::ConnectionClosed));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().waiting.len()
    }
}

/// Caller side of one registered exchange.
///
/// Dropping it before completion (send failure, cancelled caller) removes
/// the table entry.
pub(crate) struct PendingExchange<'a> {
    table: &'a PendingTable,
    session_id: String,
    deadline: Instant,
    answer: oneshot::Receiver<PeerResult<DiameterMessage>>,
    done: bool,
}

impl<'a> PendingExchange<'a> {
    pub(crate) fn register(
        table: &'a PendingTable,
        session_id: String,
        expected: CommandId,
        deadline: Instant,
    ) -> PeerResult<Self> {
        let answer = table.register(&session_id, expected)?;
        Ok(Self {
            table,
            session_id,
            deadline,
            answer,
            done: false,
        })
    }

    pub(crate) async fn wait(mut self, timeout: Duration) -> PeerResult<DiameterMessage> {
        let outcome = tokio::time::timeout_at(self.deadline, &mut self.answer).await;
        self.done = true;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PeerError::ConnectionClosed),
            Err(_) => self.expire_or_take(timeout),
        }
    }

    /// Deadline passed: expire the exchange unless the reader resolved it
    /// first, in which case the answer is already in the slot.
    fn expire_or_take(&mut self, timeout: Duration) -> PeerResult<DiameterMessage> {
        self.done = true;
        if self.table.expire(&self.session_id) {
            return Err(PeerError::Timeout {
                session_id: self.session_id.clone(),
                timeout,
            });
        }
        self.answer
            .try_recv()
            .unwrap_or(Err(PeerError::ConnectionClosed))
    }
}

impl Drop for PendingExchange<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.table.expire(&self.session_id);
        }
    }
}

impl Connection {
    /// Start a request for `command` with a fresh Session-Id and the
    /// origin/destination AVPs filled in.
    pub fn new_request(&self, command: CommandId) -> PeerResult<DiameterMessage> {
        let metadata = self.peer_metadata()?;
        let mut request = DiameterMessage::new_request(command.command_code, command.application_id);
        request.add_avp(Avp::utf8(avp_code::SESSION_ID, self.next_session_id()));
        self.fill_routing(&mut request, metadata);
        Ok(request)
    }

    fn fill_routing(&self, request: &mut DiameterMessage, metadata: &RemotePeerMetadata) {
        let identity = self.identity();
        request.add_avp_if_absent(Avp::identity(avp_code::ORIGIN_HOST, &identity.origin_host));
        request.add_avp_if_absent(Avp::identity(avp_code::ORIGIN_REALM, &identity.origin_realm));
        request.add_avp_if_absent(Avp::identity(
            avp_code::DESTINATION_REALM,
            &metadata.origin_realm,
        ));
        request.add_avp_if_absent(Avp::identity(
            avp_code::DESTINATION_HOST,
            &metadata.origin_host,
        ));
    }

    /// Send `request` and wait up to `timeout` for its answer.
    ///
    /// A Session-Id is generated unless the request already carries one;
    /// Origin-Host/Realm come from the local identity and
    /// Destination-Host/Realm from the peer's CEA unless already present.
    /// The answer is matched on Session-Id and command. An answer arriving
    /// after the timeout is dropped.
    pub async fn send_and_wait(
        &self,
        mut request: DiameterMessage,
        timeout: Duration,
    ) -> PeerResult<DiameterMessage> {
        let metadata = self.peer_metadata()?;
        if self.state() != ConnectionState::Open {
            return Err(PeerError::ConnectionClosed);
        }
        if !request.header.is_request() {
            return Err(PeerError::InvalidMessage(DiameterError::InvalidMessage(
                "send_and_wait needs a request".to_string(),
            )));
        }

        let session_id = match request.session_id() {
            Some(id) => id.to_string(),
            None => {
                let id = self.next_session_id();
                request.avps.insert(0, Avp::utf8(avp_code::SESSION_ID, &id));
                id
            }
        };
        self.fill_routing(&mut request, metadata);
        self.dictionary()
            .validate(&request)
            .map_err(PeerError::InvalidMessage)?;
        self.prepare_request(&mut request);

        let deadline = Instant::now() + timeout;
        let exchange = PendingExchange::register(
            self.pending(),
            session_id,
            request.command_id().to_answer(),
            deadline,
        )?;
        self.write(&request).await?;
        exchange.wait(timeout).await
    }
}
