//! Narrow capability interface over a live WebSocket.
//!
//! The relay only ever receives one frame or sends one frame, so real
//! sockets and test doubles implement just these two traits.

use crate::bus::BoxFuture;
use crate::envelope::MessageType;
use crate::error::RelayResult;

/// One WebSocket frame as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub message_type: MessageType,
    pub end_of_message: bool,
}

impl Frame {
    pub fn text(text: &str) -> Self {
        Self {
            payload: text.as_bytes().to_vec(),
            message_type: MessageType::Text,
            end_of_message: true,
        }
    }

    pub fn binary(payload: Vec<u8>) -> Self {
        Self {
            payload,
            message_type: MessageType::Binary,
            end_of_message: true,
        }
    }

    pub fn close() -> Self {
        Self {
            payload: Vec::new(),
            message_type: MessageType::Close,
            end_of_message: true,
        }
    }
}

/// The receiving half of a socket.
pub trait FrameSource: Send {
    /// Receive the next frame. `Ok(None)` means the peer went away without
    /// a close frame.
    fn recv_frame(&mut self) -> BoxFuture<'_, RelayResult<Option<Frame>>>;
}

/// The sending half of a socket. Shared between the relay's consumers, so
/// implementations synchronize internally.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: Frame) -> BoxFuture<'_, RelayResult<()>>;
}
