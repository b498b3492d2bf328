//! Transfer pipeline: acknowledgement gating, file source, sinks and the
//! two protocol engines that drive a session.

pub mod acks;
pub mod receiver;
pub mod sender;
pub mod sink;
pub mod source;

pub use receiver::{IngestEngine, IngestEvent};
pub use sender::{TransferEngine, TransferEvent, TransferState};
pub use sink::{SinkOutput, SinkProvider};
pub use source::FileSource;

use tokio::sync::mpsc;

/// Best-effort event delivery to an optional observer.
pub(crate) fn notify<T>(tx: &Option<mpsc::UnboundedSender<T>>, msg: T) {
    if let Some(tx) = tx {
        let _ = tx.send(msg);
    }
}
