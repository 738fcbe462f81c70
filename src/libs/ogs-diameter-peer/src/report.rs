//! Asynchronous error reporting channel
//!
//! Faults detected on background tasks (reader loop, watchdog) have no
//! caller to return to, so they are published as [`ErrorReport`]s on a
//! bounded queue that the application drains at its own pace.
//!
//! Producers never block. When the queue is full the report being
//! published is discarded (drop-newest) and counted; the count is exposed
//! through [`ErrorReports::dropped`]. Every report is logged at `warn`
//! level before it is queued, so a dropped report still reaches the log.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// What went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCause {
    Dial,
    HandshakeTimeout,
    HandshakeFailed,
    WatchdogFailure,
    UnhandledMessage,
    DecodeError,
    /// The byte stream failed or was closed by the peer
    TransportFailure,
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCause::Dial => "dial error",
            ErrorCause::HandshakeTimeout => "handshake timeout",
            ErrorCause::HandshakeFailed => "handshake failed",
            ErrorCause::WatchdogFailure => "watchdog failure",
            ErrorCause::UnhandledMessage => "unhandled message",
            ErrorCause::DecodeError => "decode error",
            ErrorCause::TransportFailure => "transport failure",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub cause: ErrorCause,
    pub detail: String,
    /// Remote address of the connection the fault was seen on
    pub peer: Option<String>,
    pub timestamp: SystemTime,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.peer {
            Some(peer) => write!(f, "{} [{}]: {}", self.cause, peer, self.detail),
            None => write!(f, "{}: {}", self.cause, self.detail),
        }
    }
}

/// Producer side, cloned into every background task
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<ErrorReport>,
    dropped: Arc<AtomicU64>,
}

/// Consumer side, handed to the application once
#[derive(Debug)]
pub struct ErrorReports {
    rx: mpsc::Receiver<ErrorReport>,
    dropped: Arc<AtomicU64>,
}

/// Create a reporting channel holding at most `capacity` undelivered reports
pub fn error_channel(capacity: usize) -> (ErrorReporter, ErrorReports) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        ErrorReporter {
            tx,
            dropped: dropped.clone(),
        },
        ErrorReports { rx, dropped },
    )
}

impl ErrorReporter {
    /// Publish a report without waiting
    pub fn report(&self, cause: ErrorCause, peer: Option<&str>, detail: impl Into<String>) {
        let report = ErrorReport {
            cause,
            detail: detail.into(),
            peer: peer.map(str::to_string),
            timestamp: SystemTime::now(),
        };
        log::warn!("{report}");

        match self.tx.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(report)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("Error report queue full, dropped \"{report}\" ({dropped} so far)");
            }
            Err(TrySendError::Closed(_)) => {
                log::trace!("Error report receiver is gone");
            }
        }
    }
}

impl ErrorReports {
    /// Wait for the next report; `None` once every producer is gone
    pub async fn recv(&mut self) -> Option<ErrorReport> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ErrorReport> {
        self.rx.try_recv().ok()
    }

    /// Reports discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_delivered_in_order() {
        let (reporter, mut reports) = error_channel(8);
        reporter.report(ErrorCause::DecodeError, Some("127.0.0.1:3868"), "bad AVP");
        reporter.report(ErrorCause::UnhandledMessage, None, "111A (app 999)");

        let first = reports.recv().await.unwrap();
        assert_eq!(first.cause, ErrorCause::DecodeError);
        assert_eq!(first.to_string(), "decode error [127.0.0.1:3868]: bad AVP");
        let second = reports.recv().await.unwrap();
        assert_eq!(second.cause, ErrorCause::UnhandledMessage);
        assert!(reports.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let (reporter, mut reports) = error_channel(2);
        for i in 0..5 {
            reporter.report(ErrorCause::DecodeError, None, format!("report {i}"));
        }

        assert_eq!(reports.dropped(), 3);
        assert_eq!(reports.try_recv().unwrap().detail, "report 0");
        assert_eq!(reports.try_recv().unwrap().detail, "report 1");
        assert!(reports.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_report_after_receiver_dropped() {
        let (reporter, reports) = error_channel(1);
        drop(reports);
        reporter.report(ErrorCause::TransportFailure, None, "gone");
    }

    #[tokio::test]
    async fn test_recv_ends_when_producers_gone() {
        let (reporter, mut reports) = error_channel(1);
        drop(reporter);
        assert!(reports.recv().await.is_none());
    }
}
