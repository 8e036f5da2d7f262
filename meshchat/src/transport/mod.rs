//! Link layer abstraction for meshchat.
//!
//! A [`Connector`] opens point-to-point links to other peers and accepts
//! links from them. Every link is represented locally by a [`LinkHandle`]
//! for sending and by [`LinkNotice`]s delivered to the event sink the
//! link was opened with. Concrete implementations:
//! - [`loopback::LoopbackNetwork`]: in-process links used by tests
//! - [`tcp::TcpConnector`]: framed envelopes over TCP streams

pub mod loopback;
pub mod tcp;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;

use meshchat_proto::link::LinkPurpose;
use meshchat_proto::message::{Envelope, PeerId};

/// Errors that can occur during link operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The specified peer is not reachable via this connector.
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    /// The peer id cannot be used as an address by this connector.
    #[error("invalid peer address {0}")]
    InvalidAddress(PeerId),

    /// Encoding or decoding a frame failed.
    #[error("codec error: {0}")]
    Codec(#[from] meshchat_proto::codec::CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-unique identifier of one local link endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

impl LinkId {
    /// Allocates a fresh identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Instruction from a [`LinkHandle`] to the connector driving the link.
#[derive(Debug)]
pub enum LinkCommand {
    /// Deliver one envelope to the remote end.
    Frame(Envelope),
    /// Tear the link down.
    Close,
}

/// Local handle to one open (or opening) link.
///
/// Sending never blocks. Frames sent before the link opens are queued and
/// flushed once it does. Clones refer to the same link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    id: LinkId,
    peer: PeerId,
    purpose: LinkPurpose,
    tx: mpsc::UnboundedSender<LinkCommand>,
    closed: Arc<AtomicBool>,
}

impl LinkHandle {
    /// Creates a handle and the command receiver its connector drains.
    #[must_use]
    pub fn new(
        peer: PeerId,
        purpose: LinkPurpose,
    ) -> (Self, mpsc::UnboundedReceiver<LinkCommand>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let handle = Self {
            id: LinkId::next(),
            peer,
            purpose,
            tx,
            closed: Arc::clone(&closed),
        };
        (handle, rx, closed)
    }

    /// This link's identifier.
    #[must_use]
    pub const fn id(&self) -> LinkId {
        self.id
    }

    /// The remote peer.
    #[must_use]
    pub const fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// What the link was opened for.
    #[must_use]
    pub const fn purpose(&self) -> &LinkPurpose {
        &self.purpose
    }

    /// Queues an envelope for the remote end.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the link is closed.
    pub fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(LinkCommand::Frame(envelope))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Closes the link. Calling this more than once has no further effect.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(LinkCommand::Close);
        }
    }

    /// Whether the link has been closed from either end.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

/// What happened on a link.
#[derive(Debug)]
pub enum LinkEvent {
    /// A remote peer opened a link to us; the handle is ready to use.
    Incoming(LinkHandle),
    /// An outbound link finished opening.
    Opened,
    /// An envelope arrived.
    Data(Envelope),
    /// The remote end closed the link.
    Closed,
    /// The link failed to open or broke.
    Error(String),
}

/// A [`LinkEvent`] tagged with the link it belongs to.
#[derive(Debug)]
pub struct LinkNotice {
    /// Local link identifier.
    pub link: LinkId,
    /// Remote peer.
    pub peer: PeerId,
    /// What the link carries.
    pub purpose: LinkPurpose,
    /// The event itself.
    pub event: LinkEvent,
}

/// Where a connector delivers [`LinkNotice`]s.
pub type LinkEventSink = mpsc::UnboundedSender<LinkNotice>;

/// Builds a notice for `handle` and pushes it into `sink`.
///
/// Returns `false` when the sink's receiver is gone.
pub(crate) fn notify(sink: &LinkEventSink, handle: &LinkHandle, event: LinkEvent) -> bool {
    sink.send(LinkNotice {
        link: handle.id(),
        peer: handle.peer().clone(),
        purpose: handle.purpose().clone(),
        event,
    })
    .is_ok()
}

/// Opens and accepts links between peers.
///
/// Methods are synchronous; connection work happens on spawned tasks and
/// outcomes arrive on the event sink. They must be called from within a
/// tokio runtime.
pub trait Connector: Send + Sync {
    /// This process's peer identity.
    fn local_id(&self) -> &PeerId;

    /// Starts opening a link to `peer`.
    ///
    /// The returned handle is usable immediately. [`LinkEvent::Opened`]
    /// or [`LinkEvent::Error`] follows on `events`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the attempt cannot even be started.
    fn connect(
        &self,
        peer: &PeerId,
        purpose: LinkPurpose,
        events: LinkEventSink,
    ) -> Result<LinkHandle, TransportError>;

    /// Starts accepting inbound links; each one arrives as
    /// [`LinkEvent::Incoming`] on `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connector cannot start listening.
    fn listen(&self, events: LinkEventSink) -> Result<(), TransportError>;
}
