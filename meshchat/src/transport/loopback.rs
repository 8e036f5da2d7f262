//! Loopback links for testing.
//!
//! A [`LoopbackNetwork`] is an in-process hub. Each participant gets a
//! [`LoopbackConnector`] from [`LoopbackNetwork::connector`]; links
//! between connectors are pairs of [`tokio::sync::mpsc`] pumps. Every
//! frame is pushed through the codec, so only envelopes that survive the
//! wire format arrive.
//!
//! The hub can make a peer unreachable (new links to it fail) or silent
//! (frames it sends are dropped while its links stay open), which is how
//! tests provoke reconnection and keep-alive expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use meshchat_proto::codec;
use meshchat_proto::link::LinkPurpose;
use meshchat_proto::message::{Envelope, PeerId};

use super::{
    Connector, LinkCommand, LinkEvent, LinkEventSink, LinkHandle, TransportError, notify,
};

#[derive(Debug)]
struct Endpoint {
    listener: Option<LinkEventSink>,
    reachable: bool,
    silent: bool,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            listener: None,
            reachable: true,
            silent: false,
        }
    }
}

/// In-process hub connecting [`LoopbackConnector`]s.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<Mutex<HashMap<PeerId, Endpoint>>>,
}

impl LoopbackNetwork {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a connector acting as `id` on this hub.
    #[must_use]
    pub fn connector(&self, id: impl Into<String>) -> LoopbackConnector {
        let id = PeerId::new(id);
        self.endpoints.lock().entry(id.clone()).or_default();
        LoopbackConnector {
            local_id: id,
            network: self.clone(),
        }
    }

    /// Controls whether new links to `peer` can be opened.
    pub fn set_reachable(&self, peer: &PeerId, reachable: bool) {
        self.endpoints
            .lock()
            .entry(peer.clone())
            .or_default()
            .reachable = reachable;
    }

    /// Controls whether frames sent by `peer` are silently dropped.
    pub fn set_silent(&self, peer: &PeerId, silent: bool) {
        self.endpoints.lock().entry(peer.clone()).or_default().silent = silent;
    }

    fn is_silent(&self, peer: &PeerId) -> bool {
        self.endpoints.lock().get(peer).is_some_and(|e| e.silent)
    }

    fn listener_for(&self, peer: &PeerId) -> Option<LinkEventSink> {
        self.endpoints
            .lock()
            .get(peer)
            .filter(|e| e.reachable)
            .and_then(|e| e.listener.clone())
    }
}

/// One participant's view of a [`LoopbackNetwork`].
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    local_id: PeerId,
    network: LoopbackNetwork,
}

impl Connector for LoopbackConnector {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    fn connect(
        &self,
        peer: &PeerId,
        purpose: LinkPurpose,
        events: LinkEventSink,
    ) -> Result<LinkHandle, TransportError> {
        let (local, local_rx, local_closed) = LinkHandle::new(peer.clone(), purpose.clone());

        let Some(remote_sink) = self.network.listener_for(peer) else {
            local.close();
            notify(
                &events,
                &local,
                LinkEvent::Error(TransportError::Unreachable(peer.clone()).to_string()),
            );
            return Ok(local);
        };

        let (remote, remote_rx, remote_closed) =
            LinkHandle::new(self.local_id.clone(), purpose);
        let token = CancellationToken::new();

        tokio::spawn(pump(Pump {
            from: self.local_id.clone(),
            rx: local_rx,
            to: remote.clone(),
            to_sink: remote_sink.clone(),
            to_closed: remote_closed,
            token: token.clone(),
            network: self.network.clone(),
        }));
        tokio::spawn(pump(Pump {
            from: peer.clone(),
            rx: remote_rx,
            to: local.clone(),
            to_sink: events.clone(),
            to_closed: local_closed,
            token,
            network: self.network.clone(),
        }));

        notify(&remote_sink, &remote, LinkEvent::Incoming(remote.clone()));
        notify(&events, &local, LinkEvent::Opened);
        tracing::debug!(from = %self.local_id, to = %peer, "loopback link opened");
        Ok(local)
    }

    fn listen(&self, events: LinkEventSink) -> Result<(), TransportError> {
        self.network
            .endpoints
            .lock()
            .entry(self.local_id.clone())
            .or_default()
            .listener = Some(events);
        Ok(())
    }
}

/// One direction of a loopback link.
struct Pump {
    from: PeerId,
    rx: mpsc::UnboundedReceiver<LinkCommand>,
    to: LinkHandle,
    to_sink: LinkEventSink,
    to_closed: Arc<AtomicBool>,
    token: CancellationToken,
    network: LoopbackNetwork,
}

async fn pump(mut p: Pump) {
    loop {
        let cmd = tokio::select! {
            biased;
            cmd = p.rx.recv() => cmd,
            () = p.token.cancelled() => break,
        };
        match cmd {
            Some(LinkCommand::Frame(envelope)) => {
                if p.network.is_silent(&p.from) {
                    continue;
                }
                match through_wire(&envelope) {
                    Ok(envelope) => {
                        notify(&p.to_sink, &p.to, LinkEvent::Data(envelope));
                    }
                    Err(e) => {
                        tracing::warn!(from = %p.from, error = %e, "loopback frame dropped");
                    }
                }
            }
            Some(LinkCommand::Close) | None => {
                p.token.cancel();
                p.to_closed.store(true, Ordering::Release);
                notify(&p.to_sink, &p.to, LinkEvent::Closed);
                break;
            }
        }
    }
}

fn through_wire(envelope: &Envelope) -> Result<Envelope, codec::CodecError> {
    let frame = codec::encode_framed(envelope)?;
    codec::decode_framed(&frame).map(|(envelope, _)| envelope)
}
