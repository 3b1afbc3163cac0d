//! Relay boundary for envelopes.

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::session::SessionAddress;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Hands envelopes to the cloud relay.
///
/// Delivery is at-least-once: the receiving side must tolerate duplicates
/// and reordering.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// # Errors
    /// `Unavailable` if the relay cannot accept the envelope right now.
    async fn send(&self, recipient: &SessionAddress, envelope: &Envelope) -> Result<()>;
}

/// Inbound side of a [`LoopbackNetwork`] registration.
pub struct Inbox {
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Inbox {
    /// Waits for the next envelope; `None` once the network is dropped.
    pub async fn recv(&mut self) -> Option<Result<Envelope>> {
        let frame = self.receiver.recv().await?;
        Some(Envelope::from_bytes(&frame))
    }

    /// Next envelope if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Result<Envelope>> {
        let frame = self.receiver.try_recv().ok()?;
        Some(Envelope::from_bytes(&frame))
    }
}

/// In-process relay that carries envelopes as encoded bytes.
#[derive(Default)]
pub struct LoopbackNetwork {
    mailboxes: Mutex<HashMap<SessionAddress, mpsc::UnboundedSender<Vec<u8>>>>,
    offline: AtomicBool,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address`, replacing any previous inbox for it.
    pub fn register(&self, address: &SessionAddress) -> Result<Inbox> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.mailboxes
            .lock()
            .map_err(|_| Error::Unavailable)?
            .insert(address.clone(), sender);
        Ok(Inbox { receiver })
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportAdapter for LoopbackNetwork {
    async fn send(&self, recipient: &SessionAddress, envelope: &Envelope) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Unavailable);
        }
        let frame = envelope.to_bytes()?;
        let mailboxes = self.mailboxes.lock().map_err(|_| Error::Unavailable)?;
        let mailbox = mailboxes.get(recipient).ok_or(Error::Unavailable)?;
        mailbox.send(frame).map_err(|_| Error::Unavailable)?;
        tracing::trace!(recipient = %recipient, kind = ?envelope.kind(), "relayed envelope");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;

    fn envelope() -> Envelope {
        Envelope::new(EnvelopeKind::Message, SessionAddress::new("alice", 1), vec![7u8; 60])
    }

    #[tokio::test]
    async fn test_loopback_delivers_in_order() {
        let network = LoopbackNetwork::new();
        let bob = SessionAddress::new("bob", 1);
        let mut inbox = network.register(&bob).unwrap();

        network.send(&bob, &envelope()).await.unwrap();
        network.send(&bob, &envelope()).await.unwrap();

        assert_eq!(inbox.recv().await.unwrap().unwrap(), envelope());
        assert_eq!(inbox.try_recv().unwrap().unwrap(), envelope());
        assert!(inbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unknown_recipient_or_offline() {
        let network = LoopbackNetwork::new();
        let bob = SessionAddress::new("bob", 1);
        assert_eq!(
            network.send(&bob, &envelope()).await.unwrap_err(),
            Error::Unavailable
        );

        let _inbox = network.register(&bob).unwrap();
        network.set_online(false);
        assert_eq!(
            network.send(&bob, &envelope()).await.unwrap_err(),
            Error::Unavailable
        );
    }
}
