//! Single-slot acknowledgement rendezvous for the sending side.
//!
//! The sender has at most one frame awaiting acknowledgement at any time
//! (a `file-start` or one chunk). The slot holds the key of that frame and a
//! oneshot sender; the router task resolves it when the matching ack
//! arrives, and a channel close releases it as [`TransferError::Cancelled`].
//! Occupancy of the slot *is* the outstanding-ack flag.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::core::error::TransferError;

/// What the armed wait is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckKey {
    Start(String),
    Chunk(String, u32),
}

impl AckKey {
    pub fn file_id(&self) -> &str {
        match self {
            Self::Start(id) | Self::Chunk(id, _) => id,
        }
    }
}

/// An inbound message that may release the armed wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckSignal {
    Start(String),
    /// `seq: None` comes from untagged peers and matches any pending ack of
    /// that file, including the start ack.
    Chunk { file_id: String, seq: Option<u32> },
    /// The peer gave up on the file.
    Failed { file_id: String, reason: String },
}

type Reply = Result<(), TransferError>;

struct Armed {
    key: AckKey,
    tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Slot {
    armed: Option<Armed>,
    closed: bool,
    /// `transfer-failed` that arrived while nothing was armed for the file.
    rejected: Option<(String, String)>,
}

#[derive(Default)]
pub struct AckWaiter {
    slot: Mutex<Slot>,
}

impl AckWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Occupy the slot for `key`.
    ///
    /// Fails with `Busy` while another ack is outstanding, `Cancelled` once
    /// the session has closed, and `Rejected` if the peer already failed
    /// this file.
    pub fn arm(&self, key: AckKey) -> Result<oneshot::Receiver<Reply>, TransferError> {
        let mut slot = self.lock();
        if slot.closed {
            return Err(TransferError::Cancelled);
        }
        if slot.armed.is_some() {
            return Err(TransferError::Busy);
        }
        if let Some((file_id, reason)) = slot.rejected.take()
            && file_id == key.file_id()
        {
            return Err(TransferError::Rejected(reason));
        }
        let (tx, rx) = oneshot::channel();
        slot.armed = Some(Armed { key, tx });
        Ok(rx)
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> bool {
        self.lock().armed.is_some()
    }

    /// Feed an inbound ack. Returns `true` if it released the armed wait.
    pub fn resolve(&self, signal: AckSignal) -> bool {
        let mut slot = self.lock();
        let Some(armed) = slot.armed.as_ref() else {
            if let AckSignal::Failed { file_id, reason } = signal {
                slot.rejected = Some((file_id, reason));
            } else {
                debug!(event = "ack_unexpected", ?signal, "Ack with nothing outstanding");
            }
            return false;
        };

        let reply = match (&armed.key, &signal) {
            (AckKey::Start(want), AckSignal::Start(got)) if want == got => Ok(()),
            (AckKey::Chunk(want, want_seq), AckSignal::Chunk { file_id, seq: Some(seq) })
                if want == file_id && want_seq == seq =>
            {
                Ok(())
            }
            (key, AckSignal::Chunk { file_id, seq: None }) if key.file_id() == file_id => Ok(()),
            (key, AckSignal::Failed { file_id, reason }) if key.file_id() == file_id => {
                Err(TransferError::Rejected(reason.clone()))
            }
            _ => {
                debug!(event = "ack_mismatch", key = ?armed.key, ?signal, "Ignoring ack for another frame");
                return false;
            }
        };

        if let Some(armed) = slot.armed.take() {
            let _ = armed.tx.send(reply);
        }
        true
    }

    /// Drop whatever is armed without resolving it.
    pub fn disarm(&self) {
        self.lock().armed = None;
    }

    /// Release any armed wait as `Cancelled` and refuse future waits.
    pub fn cancel_all(&self) {
        let mut slot = self.lock();
        slot.closed = true;
        if let Some(armed) = slot.armed.take() {
            let _ = armed.tx.send(Err(TransferError::Cancelled));
        }
    }

    /// Suspend until the armed wait resolves or `limit` elapses.
    ///
    /// On timeout the slot is cleared so a late ack is ignored.
    pub async fn wait(&self, rx: oneshot::Receiver<Reply>, limit: Duration) -> Reply {
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransferError::Cancelled),
            Err(_) => {
                self.disarm();
                Err(TransferError::Timeout)
            }
        }
    }

    /// `arm` followed by `wait`.
    #[cfg(test)]
    pub async fn expect(&self, key: AckKey, limit: Duration) -> Reply {
        let rx = self.arm(key)?;
        self.wait(rx, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const LIMIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn chunk_ack_releases_matching_wait() {
        let acks = AckWaiter::new();
        let rx = acks.arm(AckKey::Chunk("0".into(), 2)).unwrap();
        assert!(acks.outstanding());

        assert!(!acks.resolve(AckSignal::Chunk { file_id: "0".into(), seq: Some(1) }));
        assert!(!acks.resolve(AckSignal::Chunk { file_id: "1".into(), seq: Some(2) }));
        assert!(acks.resolve(AckSignal::Chunk { file_id: "0".into(), seq: Some(2) }));

        assert!(acks.wait(rx, LIMIT).await.is_ok());
        assert!(!acks.outstanding());
    }

    #[tokio::test]
    async fn only_one_wait_at_a_time() {
        let acks = AckWaiter::new();
        let _rx = acks.arm(AckKey::Start("0".into())).unwrap();
        assert!(matches!(acks.arm(AckKey::Chunk("0".into(), 0)), Err(TransferError::Busy)));
    }

    #[tokio::test]
    async fn untagged_ack_matches_start_and_chunks() {
        let acks = AckWaiter::new();
        let rx = acks.arm(AckKey::Start("4".into())).unwrap();
        assert!(acks.resolve(AckSignal::Chunk { file_id: "4".into(), seq: None }));
        assert!(acks.wait(rx, LIMIT).await.is_ok());

        let rx = acks.arm(AckKey::Chunk("4".into(), 9)).unwrap();
        assert!(acks.resolve(AckSignal::Chunk { file_id: "4".into(), seq: None }));
        assert!(acks.wait(rx, LIMIT).await.is_ok());
    }

    #[tokio::test]
    async fn close_releases_pending_wait_as_cancelled() {
        let acks = Arc::new(AckWaiter::new());
        let waiter = {
            let acks = acks.clone();
            tokio::spawn(async move { acks.expect(AckKey::Chunk("0".into(), 0), LIMIT).await })
        };
        while !acks.outstanding() {
            tokio::task::yield_now().await;
        }
        acks.cancel_all();
        assert!(matches!(waiter.await.unwrap(), Err(TransferError::Cancelled)));
        assert!(matches!(acks.arm(AckKey::Start("1".into())), Err(TransferError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_clears_the_slot() {
        let acks = AckWaiter::new();
        let res = acks.expect(AckKey::Start("0".into()), Duration::from_millis(50)).await;
        assert!(matches!(res, Err(TransferError::Timeout)));
        assert!(!acks.outstanding());
        assert!(!acks.resolve(AckSignal::Start("0".into())));
    }

    #[tokio::test]
    async fn peer_failure_rejects_wait() {
        let acks = AckWaiter::new();
        let rx = acks.arm(AckKey::Chunk("2".into(), 0)).unwrap();
        acks.resolve(AckSignal::Failed { file_id: "2".into(), reason: "disk full".into() });
        match acks.wait(rx, LIMIT).await {
            Err(TransferError::Rejected(reason)) => assert_eq!(reason, "disk full"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn early_failure_is_remembered_for_that_file() {
        let acks = AckWaiter::new();
        acks.resolve(AckSignal::Failed { file_id: "3".into(), reason: "nope".into() });
        assert!(matches!(acks.arm(AckKey::Chunk("3".into(), 1)), Err(TransferError::Rejected(_))));
        assert!(acks.arm(AckKey::Start("4".into())).is_ok());
    }
}
