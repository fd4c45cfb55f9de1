use crate::packet::Packet;
use thiserror::Error;

/// Failure of a single transmit attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet rejected by transport: {reason}")]
    Rejected { reason: String },

    #[error("transport is closed")]
    Closed,
}

/// The unreliable datagram primitive the engine sends through.
///
/// Delivery is best effort: a successful return only means the packet was
/// handed off, it may still be lost, duplicated or reordered on the way.
/// Reliability is entirely the engine's job.
///
/// `send` is invoked while the flow registry lock is held. Implementations
/// must not call back into the registry synchronously; acknowledgements
/// have to be reported from another task or thread.
pub trait Transport: Send + Sync {
    fn send(&self, packet: &Packet) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        (**self).send(packet)
    }
}
