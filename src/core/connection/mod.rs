pub mod channel;
pub mod webrtc;

pub use channel::{ChannelEvent, ChannelState, SessionChannel};
pub use self::webrtc::{SignalingMessage, WebRTCConnection};
