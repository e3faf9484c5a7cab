//! Websocket frames as seen by the relay
//!
//! The client connection is an axum websocket and the upstream connection a
//! tokio-tungstenite one. Both are adapted to the same [`Frame`] stream/sink
//! so the bridge never deals with either library's message type directly.

use crate::relay::RelayError;
use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::borrow::Cow;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Generic abnormal closure as sent on the wire. 1006 is reserved for local
/// use and can never appear in a close frame.
pub const CLOSE_ABNORMAL: u16 = 1011;

/// Peer sent more data than the relay will hold
pub const CLOSE_TOO_BIG: u16 = 1009;

/// Close reasons must fit a 125 byte control frame together with the code
const MAX_CLOSE_REASON: usize = 123;

/// A single websocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseFrame>),
}

impl Frame {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) | Frame::Ping(data) | Frame::Pong(data) => data.len(),
            Frame::Close(Some(close)) => 2 + close.reason.len(),
            Frame::Close(None) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this frame carries console data rather than connection control
    pub fn is_data(&self) -> bool {
        matches!(self, Frame::Text(_) | Frame::Binary(_))
    }
}

/// Close code and reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: truncate_reason(reason.into()),
        }
    }

    pub fn normal() -> Self {
        Self::new(CLOSE_NORMAL, "")
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }

    /// Close frame to send to one side after the other side closed with `received`
    pub fn propagate(received: Option<&CloseFrame>) -> Self {
        match received {
            None => Self::normal(),
            Some(close) if is_sendable(close.code) => Self::new(close.code, close.reason.clone()),
            Some(close) => Self::abnormal(format!("peer closed with {}", close.code)),
        }
    }
}

/// Whether a close code may be sent in a close frame
pub fn is_sendable(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

impl From<AxumMessage> for Frame {
    fn from(msg: AxumMessage) -> Self {
        match msg {
            AxumMessage::Text(text) => Frame::Text(text),
            AxumMessage::Binary(data) => Frame::Binary(data),
            AxumMessage::Ping(data) => Frame::Ping(data),
            AxumMessage::Pong(data) => Frame::Pong(data),
            AxumMessage::Close(close) => Frame::Close(close.map(|c| CloseFrame {
                code: c.code,
                reason: c.reason.into_owned(),
            })),
        }
    }
}

impl From<Frame> for AxumMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => AxumMessage::Text(text),
            Frame::Binary(data) => AxumMessage::Binary(data),
            Frame::Ping(data) => AxumMessage::Ping(data),
            Frame::Pong(data) => AxumMessage::Pong(data),
            Frame::Close(close) => AxumMessage::Close(close.map(|c| AxumCloseFrame {
                code: c.code,
                reason: Cow::Owned(c.reason),
            })),
        }
    }
}

impl From<WsMessage> for Frame {
    fn from(msg: WsMessage) -> Self {
        match msg {
            WsMessage::Text(text) => Frame::Text(text),
            WsMessage::Binary(data) => Frame::Binary(data),
            WsMessage::Ping(data) => Frame::Ping(data),
            WsMessage::Pong(data) => Frame::Pong(data),
            WsMessage::Close(close) => Frame::Close(close.map(|c| CloseFrame {
                code: u16::from(c.code),
                reason: c.reason.into_owned(),
            })),
            // Raw frames are only produced when writing
            WsMessage::Frame(frame) => Frame::Binary(frame.into_data()),
        }
    }
}

impl From<Frame> for WsMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => WsMessage::Text(text),
            Frame::Binary(data) => WsMessage::Binary(data),
            Frame::Ping(data) => WsMessage::Ping(data),
            Frame::Pong(data) => WsMessage::Pong(data),
            Frame::Close(close) => WsMessage::Close(close.map(|c| WsCloseFrame {
                code: CloseCode::from(c.code),
                reason: Cow::Owned(c.reason),
            })),
        }
    }
}

/// A bidirectional connection carrying [`Frame`]s
pub trait FrameStream:
    Stream<Item = Result<Frame, RelayError>> + Sink<Frame, Error = RelayError> + Send
{
}

impl<T> FrameStream for T where
    T: Stream<Item = Result<Frame, RelayError>> + Sink<Frame, Error = RelayError> + Send
{
}

/// Adapt the client-facing axum websocket
pub fn client_frames<S>(socket: S) -> impl FrameStream
where
    S: Stream<Item = Result<AxumMessage, axum::Error>>
        + Sink<AxumMessage, Error = axum::Error>
        + Send,
{
    socket
        .map(|msg| msg.map(Frame::from).map_err(RelayError::Client))
        .sink_map_err(RelayError::Client)
        .with(|frame: Frame| future::ready(Ok::<_, RelayError>(AxumMessage::from(frame))))
}

/// Adapt the upstream tokio-tungstenite websocket
pub fn upstream_frames<S>(socket: S) -> impl FrameStream
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Send,
{
    socket
        .map(|msg| msg.map(Frame::from).map_err(RelayError::Upstream))
        .sink_map_err(RelayError::Upstream)
        .with(|frame: Frame| future::ready(Ok::<_, RelayError>(WsMessage::from(frame))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sendable_codes() {
        for code in [1000, 1001, 1003, 1007, 1011, 3000, 4001, 4999] {
            assert!(is_sendable(code), "{}", code);
        }
        for code in [0, 999, 1004, 1005, 1006, 1012, 1015, 2000, 2999, 5000] {
            assert!(!is_sendable(code), "{}", code);
        }
    }

    #[test]
    fn test_propagate() {
        let app = CloseFrame::new(4001, "bye");
        assert_eq!(CloseFrame::propagate(Some(&app)), app);

        let reserved = CloseFrame::new(1006, "");
        assert_eq!(CloseFrame::propagate(Some(&reserved)).code, CLOSE_ABNORMAL);

        assert_eq!(CloseFrame::propagate(None).code, CLOSE_NORMAL);
    }

    #[test]
    fn test_long_reason_is_truncated_on_char_boundary() {
        let close = CloseFrame::new(4000, "é".repeat(100));
        assert!(close.reason.len() <= MAX_CLOSE_REASON);
        assert!(close.reason.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_message_conversions_keep_framing() {
        let text = Frame::from(AxumMessage::Text("RFB 003.008\n".to_string()));
        assert_eq!(text, Frame::Text("RFB 003.008\n".to_string()));
        assert!(matches!(WsMessage::from(text), WsMessage::Text(_)));

        let binary = Frame::from(WsMessage::Binary(vec![1, 2, 3]));
        assert!(matches!(AxumMessage::from(binary), AxumMessage::Binary(data) if data == [1, 2, 3]));

        let close = Frame::from(WsMessage::Close(Some(WsCloseFrame {
            code: CloseCode::from(4001),
            reason: Cow::Borrowed("bye"),
        })));
        assert_eq!(close, Frame::Close(Some(CloseFrame::new(4001, "bye"))));
        match AxumMessage::from(close) {
            AxumMessage::Close(Some(frame)) => assert_eq!(frame.code, 4001),
            other => panic!("unexpected message {:?}", other),
        }
    }
}
