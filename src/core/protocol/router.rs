//! Frame encoding and classification for the single data channel.
//!
//! Tagged framing (default) prefixes every message with one byte:
//!
//!   [0x01][json bytes]                      control
//!   [0x02][4 bytes seq BE][raw chunk data]  chunk
//!
//! Legacy framing sends control messages as bare JSON text messages and
//! chunks as bare binary messages. Text frames are control in either mode.
//! Binary frames in legacy mode are sniffed: one is control only if it starts
//! with `{`, is shorter than [`LEGACY_CONTROL_THRESHOLD`], and parses as a
//! known message. Anything else is a chunk, so chunk data that happens to look
//! like a small control message is misclassified. That risk is accepted for
//! interop only.

use anyhow::Result;
use bytes::{BufMut, Bytes};
use tracing::{trace, warn};

use super::messages::ControlMessage;
use crate::core::config::{Framing, LEGACY_CONTROL_THRESHOLD};
use crate::core::connection::channel::Frame;

/// Frame type marker for control messages.
pub const FRAME_CONTROL: u8 = 0x01;

/// Frame type marker for chunk data.
pub const FRAME_CHUNK: u8 = 0x02;

const CHUNK_HEADER_LEN: usize = 1 + 4;

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlMessage),
    /// Chunk data for the active file. `seq` is `None` in legacy framing.
    Chunk { seq: Option<u32>, payload: Bytes },
}

/// Encodes outbound frames and classifies inbound ones for one framing mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageRouter {
    framing: Framing,
}

impl MessageRouter {
    pub fn new(framing: Framing) -> Self {
        Self { framing }
    }

    /// Encode a control frame.
    pub fn encode_control(&self, msg: &ControlMessage) -> Result<Frame> {
        match self.framing {
            Framing::Tagged => {
                let json = serde_json::to_vec(msg)?;
                let mut buf = Vec::with_capacity(1 + json.len());
                buf.put_u8(FRAME_CONTROL);
                buf.extend_from_slice(&json);
                Ok(Frame::Binary(Bytes::from(buf)))
            }
            Framing::Legacy => Ok(Frame::Text(serde_json::to_string(&legacy_form(msg))?)),
        }
    }

    /// Encode a chunk frame into a reusable buffer, clearing it first.
    pub fn encode_chunk_into(&self, buf: &mut Vec<u8>, seq: u32, payload: &[u8]) {
        buf.clear();
        match self.framing {
            Framing::Tagged => {
                buf.reserve(CHUNK_HEADER_LEN + payload.len());
                buf.put_u8(FRAME_CHUNK);
                buf.put_u32(seq);
                buf.extend_from_slice(payload);
            }
            Framing::Legacy => buf.extend_from_slice(payload),
        }
    }

    /// Classify one received frame. Returns `None` for frames that must be
    /// dropped (empty, unknown tag, undecodable control).
    pub fn classify(&self, frame: Frame) -> Option<Inbound> {
        match (frame, self.framing) {
            (Frame::Text(text), _) => classify_text(&text),
            (Frame::Binary(bytes), Framing::Tagged) => classify_tagged(bytes),
            (Frame::Binary(bytes), Framing::Legacy) => Some(classify_untagged(bytes)),
        }
    }
}

fn classify_text(text: &str) -> Option<Inbound> {
    match serde_json::from_str::<ControlMessage>(text) {
        Ok(msg) => Some(Inbound::Control(msg)),
        Err(e) => {
            warn!(event = "control_decode_error", bytes = text.len(), %e, "Dropping undecodable text frame");
            None
        }
    }
}

fn classify_tagged(frame: Bytes) -> Option<Inbound> {
    let (&tag, _) = frame.split_first()?;
    match tag {
        FRAME_CONTROL => match serde_json::from_slice::<ControlMessage>(&frame[1..]) {
            Ok(msg) => Some(Inbound::Control(msg)),
            Err(e) => {
                warn!(event = "control_decode_error", bytes = frame.len(), %e, "Dropping undecodable control frame");
                None
            }
        },
        FRAME_CHUNK => {
            if frame.len() < CHUNK_HEADER_LEN {
                warn!(event = "chunk_frame_short", bytes = frame.len(), "Dropping truncated chunk frame");
                return None;
            }
            let seq = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
            Some(Inbound::Chunk {
                seq: Some(seq),
                payload: frame.slice(CHUNK_HEADER_LEN..),
            })
        }
        other => {
            warn!(event = "unknown_frame_tag", tag = other, "Dropping frame with unknown tag");
            None
        }
    }
}

fn classify_untagged(frame: Bytes) -> Inbound {
    if frame.first() == Some(&b'{') && frame.len() < LEGACY_CONTROL_THRESHOLD {
        // serde_json validates UTF-8 itself
        if let Ok(msg) = serde_json::from_slice::<ControlMessage>(&frame) {
            return Inbound::Control(msg);
        }
        trace!(event = "legacy_sniff_miss", bytes = frame.len(), "Brace-prefixed frame treated as chunk");
    }
    Inbound::Chunk {
        seq: None,
        payload: frame,
    }
}

/// Untagged peers know a single acknowledgement type keyed by file id.
fn legacy_form(msg: &ControlMessage) -> ControlMessage {
    match msg {
        ControlMessage::StartAck { file_id } | ControlMessage::ChunkAck { file_id, .. } => {
            ControlMessage::ChunkAck {
                file_id: file_id.clone(),
                seq: None,
            }
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(seq: Option<u32>) -> ControlMessage {
        ControlMessage::ChunkAck {
            file_id: "0".into(),
            seq,
        }
    }

    fn bin(data: &'static [u8]) -> Frame {
        Frame::Binary(Bytes::from_static(data))
    }

    #[test]
    fn tagged_control_is_classified_exactly() {
        let router = MessageRouter::new(Framing::Tagged);
        let frame = router.encode_control(&ack(Some(7))).unwrap();
        let Frame::Binary(bytes) = &frame else {
            panic!("tagged control must be binary");
        };
        assert_eq!(bytes[0], FRAME_CONTROL);
        assert_eq!(router.classify(frame), Some(Inbound::Control(ack(Some(7)))));
    }

    #[test]
    fn tagged_chunk_may_contain_valid_json() {
        let router = MessageRouter::new(Framing::Tagged);
        let json = serde_json::to_vec(&ack(None)).unwrap();
        let mut buf = Vec::new();
        router.encode_chunk_into(&mut buf, 3, &json);

        match router.classify(Frame::Binary(Bytes::from(buf))) {
            Some(Inbound::Chunk { seq, payload }) => {
                assert_eq!(seq, Some(3));
                assert_eq!(&payload[..], &json[..]);
            }
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn tagged_drops_bad_control_and_unknown_tags() {
        let router = MessageRouter::new(Framing::Tagged);
        assert_eq!(router.classify(bin(b"\x01{not json")), None);
        assert_eq!(router.classify(bin(b"\x09abc")), None);
        assert_eq!(router.classify(bin(b"\x02ab")), None);
        assert_eq!(router.classify(bin(b"")), None);
    }

    #[test]
    fn text_frames_are_control_in_both_modes() {
        let text = Frame::Text(r#"{"type":"file-end","fileId":"4"}"#.into());
        let expected = Some(Inbound::Control(ControlMessage::FileEnd { file_id: "4".into() }));
        assert_eq!(MessageRouter::new(Framing::Tagged).classify(text.clone()), expected);
        assert_eq!(MessageRouter::new(Framing::Legacy).classify(text), expected);
        assert_eq!(
            MessageRouter::new(Framing::Legacy).classify(Frame::Text("not json".into())),
            None
        );
    }

    #[test]
    fn legacy_brace_prefixed_garbage_is_a_chunk() {
        let router = MessageRouter::new(Framing::Legacy);
        let bytes = Bytes::from_static(b"{\x00\xff binary that is not json");
        assert_eq!(
            router.classify(Frame::Binary(bytes.clone())),
            Some(Inbound::Chunk {
                seq: None,
                payload: bytes
            })
        );
    }

    #[test]
    fn legacy_large_control_travels_as_text() {
        let router = MessageRouter::new(Framing::Legacy);
        let msg = ControlMessage::FileStart {
            file_id: "0".into(),
            size: 1,
            name: "x".repeat(LEGACY_CONTROL_THRESHOLD),
        };
        let frame = router.encode_control(&msg).unwrap();
        assert!(matches!(frame, Frame::Text(_)));
        assert!(frame.len() > LEGACY_CONTROL_THRESHOLD);
        assert_eq!(router.classify(frame), Some(Inbound::Control(msg)));
    }

    #[test]
    fn legacy_oversized_binary_json_is_a_chunk() {
        let router = MessageRouter::new(Framing::Legacy);
        let msg = ControlMessage::FileStart {
            file_id: "0".into(),
            size: 1,
            name: "x".repeat(LEGACY_CONTROL_THRESHOLD),
        };
        let bytes = Bytes::from(serde_json::to_vec(&msg).unwrap());
        assert!(matches!(
            router.classify(Frame::Binary(bytes)),
            Some(Inbound::Chunk { seq: None, .. })
        ));
    }

    #[test]
    fn legacy_unknown_type_is_a_chunk() {
        let router = MessageRouter::new(Framing::Legacy);
        assert!(matches!(
            router.classify(bin(br#"{"type":"hello"}"#)),
            Some(Inbound::Chunk { .. })
        ));
    }

    #[test]
    fn legacy_binary_control_is_still_sniffed() {
        let router = MessageRouter::new(Framing::Legacy);
        assert_eq!(
            router.classify(bin(br#"{"type":"chunk-ack","fileId":"0"}"#)),
            Some(Inbound::Control(ack(None)))
        );
    }

    #[test]
    fn legacy_writes_start_ack_as_chunk_ack() {
        let router = MessageRouter::new(Framing::Legacy);
        let frame = router
            .encode_control(&ControlMessage::StartAck { file_id: "0".into() })
            .unwrap();
        assert_eq!(frame, Frame::Text(r#"{"type":"chunk-ack","fileId":"0"}"#.into()));
        assert_eq!(router.classify(frame), Some(Inbound::Control(ack(None))));
    }

    #[test]
    fn legacy_chunk_is_sent_bare() {
        let router = MessageRouter::new(Framing::Legacy);
        let mut buf = vec![9, 9, 9];
        router.encode_chunk_into(&mut buf, 42, b"abc");
        assert_eq!(buf, b"abc");
    }
}
