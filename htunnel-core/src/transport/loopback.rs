use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::transport::{
    ChannelRef, DataChannel, Negotiation, Role, Transport, TransportEvent, TransportSession,
    TrySendError,
};
use crate::PeerId;

/// (offerer, answerer)
type PairKey = (PeerId, PeerId);

struct Parked {
    endpoint: Arc<Endpoint>,
    link: Arc<AtomicBool>,
    sender: oneshot::Sender<Arc<Endpoint>>,
}

/// An in-process medium connecting the offerer and answerer sessions of
/// every peer pair that shares it.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    parked: HashMap<PairKey, Parked>,
    failures: HashSet<PairKey>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
        }
    }
    /// Every establishment between `offerer` and `answerer` fails from now on.
    pub fn fail_establish(&self, offerer: PeerId, answerer: PeerId) {
        self.state.lock().failures.insert((offerer, answerer));
    }
}

#[derive(Clone)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn establish(&self, negotiation: Negotiation) -> Result<Box<dyn TransportSession>> {
        let key = match negotiation.role {
            Role::Offerer => (negotiation.local_peer, negotiation.remote_peer),
            Role::Answerer => (negotiation.remote_peer, negotiation.local_peer),
        };
        let local = Arc::new(Endpoint {
            events: negotiation.events,
            channels: Mutex::new(HashMap::new()),
        });
        let (receiver, link) = {
            let mut state = self.network.state.lock();
            if state.failures.contains(&key) {
                return Err(Error::Negotiation(format!(
                    "loopback {}->{} refused",
                    key.0, key.1
                )));
            }
            if let Some(parked) = state.parked.remove(&key) {
                if parked.sender.send(local.clone()).is_ok() {
                    log::debug!("loopback {}->{} paired", key.0, key.1);
                    return Ok(Box::new(LoopbackSession {
                        local,
                        remote: parked.endpoint,
                        link: parked.link,
                    }));
                }
            }
            let (sender, receiver) = oneshot::channel();
            let link = Arc::new(AtomicBool::new(false));
            state.parked.insert(
                key,
                Parked {
                    endpoint: local.clone(),
                    link: link.clone(),
                    sender,
                },
            );
            (receiver, link)
        };
        let remote = receiver
            .await
            .map_err(|_| Error::Negotiation("loopback peer went away".into()))?;
        Ok(Box::new(LoopbackSession {
            local,
            remote,
            link,
        }))
    }
}

struct Endpoint {
    events: UnboundedSender<TransportEvent>,
    channels: Mutex<HashMap<String, Arc<LoopbackChannel>>>,
}

struct LoopbackSession {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
    link: Arc<AtomicBool>,
}

impl TransportSession for LoopbackSession {
    fn open_channel(&self, label: &str) -> Result<ChannelRef> {
        if self.link.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        let closed = Arc::new(AtomicBool::new(false));
        let local_half = Arc::new(LoopbackChannel {
            label: label.to_string(),
            closed: closed.clone(),
            local: Arc::downgrade(&self.local),
            remote: Arc::downgrade(&self.remote),
        });
        let remote_half = Arc::new(LoopbackChannel {
            label: label.to_string(),
            closed,
            local: Arc::downgrade(&self.remote),
            remote: Arc::downgrade(&self.local),
        });
        {
            let mut channels = self.local.channels.lock();
            if channels.contains_key(label) {
                return Err(Error::LabelInUse(label.to_string()));
            }
            channels.insert(label.to_string(), local_half.clone());
        }
        {
            let mut channels = self.remote.channels.lock();
            if channels.contains_key(label) {
                drop(channels);
                self.local.channels.lock().remove(label);
                return Err(Error::LabelInUse(label.to_string()));
            }
            channels.insert(label.to_string(), remote_half.clone());
        }
        if self
            .remote
            .events
            .send(TransportEvent::ChannelOpened(remote_half))
            .is_err()
        {
            log::debug!("loopback remote gone while opening {label}");
        }
        Ok(local_half)
    }

    fn close(&self) {
        if self.link.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels: Vec<_> = self.local.channels.lock().values().cloned().collect();
        for channel in channels {
            channel.close();
        }
        let _ = self.local.events.send(TransportEvent::SessionClosed);
        let _ = self.remote.events.send(TransportEvent::SessionClosed);
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        self.close();
    }
}

struct LoopbackChannel {
    label: String,
    closed: Arc<AtomicBool>,
    local: Weak<Endpoint>,
    remote: Weak<Endpoint>,
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn try_send(&self, data: Bytes) -> std::result::Result<(), TrySendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TrySendError::Closed);
        }
        let Some(remote) = self.remote.upgrade() else {
            return Err(TrySendError::Closed);
        };
        remote
            .events
            .send(TransportEvent::ChannelMessage {
                label: self.label.clone(),
                data,
            })
            .map_err(|_| TrySendError::Closed)
    }

    async fn writable(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ChannelClosed)
        } else {
            Ok(())
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for endpoint in [self.local.upgrade(), self.remote.upgrade()]
            .into_iter()
            .flatten()
        {
            endpoint.channels.lock().remove(&self.label);
            let _ = endpoint
                .events
                .send(TransportEvent::ChannelClosed(self.label.clone()));
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::LoopbackNetwork;
    use crate::error::Error;
    use crate::transport::{
        Negotiation, Role, Signaler, Transport, TransportEvent, TransportSession,
    };
    use crate::PeerId;

    fn negotiation(
        local: u64,
        remote: u64,
        role: Role,
    ) -> (Negotiation, mpsc::UnboundedReceiver<TransportEvent>) {
        let (signal_tx, _signal_rx) = mpsc::unbounded_channel();
        let (_envelope_tx, envelope_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let negotiation = Negotiation {
            local_peer: PeerId::new(local),
            remote_peer: PeerId::new(remote),
            role,
            signal: Signaler::new(PeerId::new(remote), role, signal_tx),
            envelopes: envelope_rx,
            events: event_tx,
        };
        (negotiation, event_rx)
    }

    async fn pair(
        network: &LoopbackNetwork,
    ) -> (
        Box<dyn TransportSession>,
        mpsc::UnboundedReceiver<TransportEvent>,
        Box<dyn TransportSession>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (offer, offer_events) = negotiation(1, 2, Role::Offerer);
        let (answer, answer_events) = negotiation(2, 1, Role::Answerer);
        let transport = network.transport();
        let (a, b) = tokio::join!(transport.establish(offer), transport.establish(answer));
        (a.unwrap(), offer_events, b.unwrap(), answer_events)
    }

    #[tokio::test]
    async fn open_send_close() {
        let network = LoopbackNetwork::new();
        let (offerer, mut offer_events, _answerer, mut answer_events) = pair(&network).await;

        let channel = offerer.open_channel("control_label").unwrap();
        let remote = match answer_events.recv().await.unwrap() {
            TransportEvent::ChannelOpened(channel) => channel,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(remote.label(), "control_label");
        assert!(matches!(
            offerer.open_channel("control_label"),
            Err(Error::LabelInUse(_))
        ));

        channel.try_send(Bytes::from_static(b"hi")).unwrap();
        match answer_events.recv().await.unwrap() {
            TransportEvent::ChannelMessage { label, data } => {
                assert_eq!(label, "control_label");
                assert_eq!(&data[..], b"hi");
            }
            other => panic!("unexpected {other:?}"),
        }

        remote.close();
        remote.close();
        assert!(channel.is_closed());
        assert!(matches!(
            offer_events.recv().await.unwrap(),
            TransportEvent::ChannelClosed(label) if label == "control_label"
        ));
        assert!(matches!(
            answer_events.recv().await.unwrap(),
            TransportEvent::ChannelClosed(_)
        ));
        assert!(answer_events.try_recv().is_err());
        assert!(channel.writable().await.is_err());
    }

    #[tokio::test]
    async fn session_close_reaches_both_sides() {
        let network = LoopbackNetwork::new();
        let (offerer, mut offer_events, answerer, mut answer_events) = pair(&network).await;
        offerer.close();
        assert!(matches!(
            offer_events.recv().await.unwrap(),
            TransportEvent::SessionClosed
        ));
        assert!(matches!(
            answer_events.recv().await.unwrap(),
            TransportEvent::SessionClosed
        ));
        assert!(matches!(
            answerer.open_channel("1|1"),
            Err(Error::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn injected_failure() {
        let network = LoopbackNetwork::new();
        network.fail_establish(PeerId::new(1), PeerId::new(2));
        let (offer, _events) = negotiation(1, 2, Role::Offerer);
        assert!(matches!(
            network.transport().establish(offer).await,
            Err(Error::Negotiation(_))
        ));
    }
}
