use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::broker::route::ClientId;
use crate::transport::frame::Frame;

/// A client connected to the broker.
///
/// Frames pushed on `sender` are written to the socket by that client's
/// writer task. The queue is bounded: a client whose writer is gone, or
/// whose queue is full because it stopped reading, counts as dead.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    pub id: ClientId,
    /// `<peer address>/<id>`, used in logs
    pub ident: String,
    pub sender: Sender<Frame>,
    pub inbox: Option<String>,
}

impl ConnectedClient {
    pub fn new(id: ClientId, peer: &str, sender: Sender<Frame>) -> Self {
        Self {
            id,
            ident: format!("{peer}/{id}"),
            sender,
            inbox: None,
        }
    }

    /// Queues a frame for the client without waiting. False when the frame
    /// could not be queued.
    pub fn send(&self, frame: Frame) -> bool {
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(client = %self.ident, "outbound queue full");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
