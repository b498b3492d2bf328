//! Glue between an `RTCDataChannel` and the transport end of a
//! [`SessionChannel`](crate::core::connection::channel::SessionChannel).

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;

use crate::core::connection::channel::{Frame, TransportEnd};

/// Attach `on_open`, `on_message`, `on_close` and `on_error` callbacks to
/// `dc` and spawn the writer task draining queued outbound frames.
pub(super) fn attach(dc: &Arc<RTCDataChannel>, end: TransportEnd) {
    let TransportEnd {
        handle,
        mut outbound,
    } = end;
    let label = dc.label().to_string();

    let h = handle.clone();
    let l = label.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            info!(event = "dc_open", channel = %l, "DataChannel open");
            h.mark_connected();
        })
    }));

    let h = handle.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let h = h.clone();
        Box::pin(async move { h.deliver(inbound_frame(msg)) })
    }));

    let h = handle.clone();
    let l = label.clone();
    dc.on_close(Box::new(move || {
        let h = h.clone();
        let l = l.clone();
        Box::pin(async move {
            warn!(event = "dc_closed", channel = %l, "DataChannel closed by transport");
            h.mark_closed();
        })
    }));

    let h = handle.clone();
    let l = label;
    dc.on_error(Box::new(move |err| {
        let h = h.clone();
        let l = l.clone();
        Box::pin(async move {
            error!(event = "dc_error", channel = %l, %err, "DataChannel transport error");
            h.mark_error(err.to_string());
        })
    }));

    // The answerer receives the channel from `on_data_channel`, possibly
    // already open.
    if dc.ready_state() == RTCDataChannelState::Open {
        handle.mark_connected();
    }

    let dc = dc.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = send_frame(&dc, frame).await {
                        handle.mark_error(format!("send failed: {e}"));
                        break;
                    }
                }
                _ = handle.closed() => {
                    while let Ok(frame) = outbound.try_recv() {
                        if send_frame(&dc, frame).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        debug!(event = "dc_writer_stopped", channel = %dc.label(), "Closing data channel");
        let _ = dc.close().await;
    });
}

/// Text messages stay text; a text payload that is not UTF-8 is handed on
/// as binary.
fn inbound_frame(msg: DataChannelMessage) -> Frame {
    if !msg.is_string {
        return Frame::Binary(msg.data);
    }
    match String::from_utf8(msg.data.to_vec()) {
        Ok(text) => Frame::Text(text),
        Err(_) => Frame::Binary(msg.data),
    }
}

async fn send_frame(dc: &RTCDataChannel, frame: Frame) -> webrtc::error::Result<usize> {
    match frame {
        Frame::Binary(data) => dc.send(&data).await,
        Frame::Text(text) => dc.send_text(text).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message(is_string: bool, data: &'static [u8]) -> DataChannelMessage {
        DataChannelMessage {
            is_string,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn message_kind_is_preserved() {
        assert_eq!(
            inbound_frame(message(true, br#"{"type":"file-end","fileId":"0"}"#)),
            Frame::Text(r#"{"type":"file-end","fileId":"0"}"#.into())
        );
        assert_eq!(
            inbound_frame(message(false, b"{}")),
            Frame::Binary(Bytes::from_static(b"{}"))
        );
    }

    #[test]
    fn invalid_utf8_text_falls_back_to_binary() {
        assert_eq!(
            inbound_frame(message(true, b"\xff\xfe")),
            Frame::Binary(Bytes::from_static(b"\xff\xfe"))
        );
    }
}
