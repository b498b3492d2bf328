//! SessionChannel: transport-agnostic handle to one peer-to-peer byte channel.
//!
//! The channel is message-oriented: every `send` arrives as exactly one
//! `Data` event on the other side, in order. Text and binary messages keep
//! their kind end to end; any further tagging is the protocol layer's job.
//!
//! A channel is created together with a [`TransportEnd`], which the concrete
//! transport (WebRTC bridge, in-memory pair) drives: it drains outbound
//! frames and reports lifecycle changes through a [`TransportHandle`].

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Negotiating,
    Connected,
    Closed,
}

/// One message on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Self::Binary(b) => b.len(),
            Self::Text(t) => t.len(),
        }
    }
}

/// Lifecycle and data notifications, delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Fires at most once per session.
    Connected,
    Data(Frame),
    Closed,
    Error(String),
}

struct Shared {
    state: watch::Sender<ChannelState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Shared {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn mark_closed(&self) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if *s == ChannelState::Closed {
                false
            } else {
                *s = ChannelState::Closed;
                true
            }
        });
        if changed {
            self.emit(ChannelEvent::Closed);
        }
        changed
    }
}

/// Sending half plus state, shared by everything that talks to the peer.
#[derive(Clone)]
pub struct SessionChannel {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Frame>,
}

/// The transport's side of a [`SessionChannel`].
pub struct TransportEnd {
    pub handle: TransportHandle,
    /// Frames queued by `SessionChannel::send`, in order.
    pub outbound: mpsc::UnboundedReceiver<Frame>,
}

/// Lets a transport report lifecycle changes and deliver inbound frames.
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<Shared>,
}

impl SessionChannel {
    /// Create a channel in `Negotiating` state.
    ///
    /// Returns the channel, the transport end that must be attached to a
    /// real transport, and the event stream for the protocol engine.
    pub fn new() -> (Self, TransportEnd, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (state, _) = watch::channel(ChannelState::Negotiating);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state,
            events: events_tx,
        });
        (
            Self {
                shared: shared.clone(),
                outbound: out_tx,
            },
            TransportEnd {
                handle: TransportHandle { shared },
                outbound: out_rx,
            },
            events_rx,
        )
    }

    /// Two connected in-memory endpoints. Must be called inside a tokio runtime.
    #[cfg(test)]
    pub fn pair() -> (
        (SessionChannel, mpsc::UnboundedReceiver<ChannelEvent>),
        (SessionChannel, mpsc::UnboundedReceiver<ChannelEvent>),
    ) {
        let (a, a_end, a_events) = Self::new();
        let (b, b_end, b_events) = Self::new();
        let a_handle = a_end.handle.clone();
        let b_handle = b_end.handle.clone();
        spawn_forwarder(a_end, b_handle.clone());
        spawn_forwarder(b_end, a_handle.clone());
        a_handle.mark_connected();
        b_handle.mark_connected();
        ((a, a_events), (b, b_events))
    }

    /// Queue one frame. A no-op returning `false` unless `Connected`.
    pub fn send(&self, frame: Frame) -> bool {
        if self.state() != ChannelState::Connected {
            debug!(event = "send_not_connected", bytes = frame.len(), "Dropping frame on non-connected channel");
            return false;
        }
        self.outbound.send(frame).is_ok()
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Observe state changes, e.g. to wait for `Closed`.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Close locally. Emits `Closed` once; the transport tears down on its own.
    pub fn close(&self) {
        self.shared.mark_closed();
    }
}

impl TransportHandle {
    /// `Negotiating → Connected`. Ignored in any other state.
    pub fn mark_connected(&self) {
        let changed = self.shared.state.send_if_modified(|s| {
            if *s == ChannelState::Negotiating {
                *s = ChannelState::Connected;
                true
            } else {
                false
            }
        });
        if changed {
            self.shared.emit(ChannelEvent::Connected);
        }
    }

    /// Hand one received frame to the engine. Dropped unless `Connected`.
    pub fn deliver(&self, frame: Frame) {
        if *self.shared.state.borrow() == ChannelState::Connected {
            self.shared.emit(ChannelEvent::Data(frame));
        }
    }

    pub fn mark_closed(&self) {
        self.shared.mark_closed();
    }

    /// Report a transport error. Errors are terminal: the channel closes too.
    pub fn mark_error(&self, reason: impl Into<String>) {
        if *self.shared.state.borrow() == ChannelState::Closed {
            return;
        }
        let reason = reason.into();
        warn!(event = "channel_error", %reason, "Session channel error");
        self.shared.emit(ChannelEvent::Error(reason));
        self.shared.mark_closed();
    }

    /// Resolves once the channel is closed, from either side.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == ChannelState::Closed).await;
    }
}

/// Forward frames from one in-memory endpoint to the other until either closes.
#[cfg(test)]
fn spawn_forwarder(mut from: TransportEnd, to: TransportHandle) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = from.outbound.recv() => match frame {
                    Some(frame) => to.deliver(frame),
                    None => break,
                },
                _ = from.handle.closed() => {
                    // flush whatever was queued before the close
                    while let Ok(frame) = from.outbound.try_recv() {
                        to.deliver(frame);
                    }
                    to.mark_closed();
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(data: &'static [u8]) -> Frame {
        Frame::Binary(Bytes::from_static(data))
    }

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let ((a, mut a_events), (b, mut b_events)) = SessionChannel::pair();
        assert_eq!(a_events.recv().await, Some(ChannelEvent::Connected));
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Connected));

        assert!(a.send(bin(b"one")));
        assert!(a.send(Frame::Text("two".into())));
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Data(bin(b"one"))));
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Data(Frame::Text("two".into()))));
        assert_eq!(b.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn send_before_connect_is_a_noop() {
        let (channel, mut end, _events) = SessionChannel::new();
        assert_eq!(channel.state(), ChannelState::Negotiating);
        assert!(!channel.send(bin(b"x")));
        assert!(end.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn connected_fires_once_and_close_propagates() {
        let (channel, end, mut events) = SessionChannel::new();
        end.handle.mark_connected();
        end.handle.mark_connected();
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));

        channel.close();
        channel.close();
        assert_eq!(events.recv().await, Some(ChannelEvent::Closed));
        assert!(events.try_recv().is_err());
        assert!(!channel.send(bin(b"late")));
    }

    #[tokio::test]
    async fn closing_one_side_closes_the_other() {
        let ((a, _a_events), (b, mut b_events)) = SessionChannel::pair();
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Connected));
        a.send(bin(b"last"));
        a.close();
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Data(bin(b"last"))));
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(b.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn error_is_terminal() {
        let (channel, end, mut events) = SessionChannel::new();
        end.handle.mark_connected();
        end.handle.mark_error("boom");
        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        assert_eq!(events.recv().await, Some(ChannelEvent::Error("boom".into())));
        assert_eq!(events.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(channel.state(), ChannelState::Closed);
    }
}
