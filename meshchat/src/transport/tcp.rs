//! TCP links.
//!
//! A peer's id is the socket address it listens on. Every link is one TCP
//! stream of length-prefixed postcard frames; the dialing side first sends
//! a [`LinkHello`] naming itself and the link's purpose.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use meshchat_proto::codec::{self, FRAME_HEADER_LEN};
use meshchat_proto::link::{LinkHello, LinkPurpose};
use meshchat_proto::message::{Envelope, PeerId};

use super::{
    Connector, LinkCommand, LinkEvent, LinkEventSink, LinkHandle, TransportError, notify,
};

/// How long an accepted stream may take to send its hello frame.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Connector speaking framed envelopes over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    local_id: PeerId,
    listen_addr: SocketAddr,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector that will listen on `listen_addr`.
    ///
    /// `advertised` is the id other peers dial; it defaults to the listen
    /// address when `None`.
    #[must_use]
    pub fn new(
        listen_addr: SocketAddr,
        advertised: Option<PeerId>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            local_id: advertised.unwrap_or_else(|| PeerId::new(listen_addr.to_string())),
            listen_addr,
            connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    fn connect(
        &self,
        peer: &PeerId,
        purpose: LinkPurpose,
        events: LinkEventSink,
    ) -> Result<LinkHandle, TransportError> {
        let addr: SocketAddr = peer
            .as_str()
            .parse()
            .map_err(|_| TransportError::InvalidAddress(peer.clone()))?;
        let (handle, rx, closed) = LinkHandle::new(peer.clone(), purpose.clone());
        let hello = LinkHello {
            peer_id: self.local_id.clone(),
            purpose,
        };
        let timeout = self.connect_timeout;
        let link = handle.clone();

        tokio::spawn(async move {
            match dial(addr, &hello, timeout).await {
                Ok(stream) => {
                    notify(&events, &link, LinkEvent::Opened);
                    drive(stream, link, rx, closed, events).await;
                }
                Err(e) => {
                    tracing::debug!(peer = %link.peer(), error = %e, "dial failed");
                    closed.store(true, Ordering::Release);
                    notify(&events, &link, LinkEvent::Error(e.to_string()));
                }
            }
        });
        Ok(handle)
    }

    fn listen(&self, events: LinkEventSink) -> Result<(), TransportError> {
        let std_listener = std::net::TcpListener::bind(self.listen_addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        tracing::info!(addr = %self.listen_addr, "listening for peers");

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tokio::spawn(accept(stream, remote, events.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
                if events.is_closed() {
                    break;
                }
            }
        });
        Ok(())
    }
}

async fn dial(
    addr: SocketAddr,
    hello: &LinkHello,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)??;
    stream.set_nodelay(true)?;
    stream.write_all(&codec::encode_framed(hello)?).await?;
    Ok(stream)
}

async fn accept(mut stream: TcpStream, remote: SocketAddr, events: LinkEventSink) {
    let hello = match tokio::time::timeout(HELLO_TIMEOUT, read_frame::<_, LinkHello>(&mut stream))
        .await
    {
        Ok(Ok(Some(hello))) => hello,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            tracing::warn!(%remote, error = %e, "bad hello frame");
            return;
        }
        Err(_) => {
            tracing::warn!(%remote, "no hello frame");
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%remote, error = %e, "set_nodelay failed");
    }

    let (handle, rx, closed) = LinkHandle::new(hello.peer_id, hello.purpose);
    tracing::debug!(%remote, peer = %handle.peer(), "accepted link");
    notify(&events, &handle, LinkEvent::Incoming(handle.clone()));
    drive(stream, handle, rx, closed, events).await;
}

/// Runs a link until either side closes it.
async fn drive(
    stream: TcpStream,
    link: LinkHandle,
    rx: mpsc::UnboundedReceiver<LinkCommand>,
    closed: Arc<AtomicBool>,
    events: LinkEventSink,
) {
    let (reader, writer) = stream.into_split();
    let token = CancellationToken::new();
    let read_task = tokio::spawn(read_loop(
        reader,
        link.clone(),
        Arc::clone(&closed),
        events.clone(),
        token.clone(),
    ));
    write_loop(writer, &link, rx, &closed, &events, &token).await;
    closed.store(true, Ordering::Release);
    token.cancel();
    read_task.abort();
}

/// Writes queued frames until the link is closed or the stream breaks.
/// A broken stream is reported as [`LinkEvent::Error`] unless the reader
/// already reported the link gone.
async fn write_loop<W>(
    mut writer: W,
    link: &LinkHandle,
    mut rx: mpsc::UnboundedReceiver<LinkCommand>,
    closed: &AtomicBool,
    events: &LinkEventSink,
    token: &CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let cmd = tokio::select! {
            cmd = rx.recv() => cmd,
            () = token.cancelled() => break,
        };
        match cmd {
            Some(LinkCommand::Frame(envelope)) => match write_frame(&mut writer, &envelope).await {
                Ok(()) => {}
                Err(TransportError::Codec(e)) => {
                    tracing::warn!(peer = %link.peer(), error = %e, "frame not sent");
                }
                Err(e) => {
                    tracing::debug!(peer = %link.peer(), error = %e, "write failed");
                    if !closed.swap(true, Ordering::AcqRel) {
                        notify(events, link, LinkEvent::Error(e.to_string()));
                    }
                    break;
                }
            },
            Some(LinkCommand::Close) | None => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    link: LinkHandle,
    closed: Arc<AtomicBool>,
    events: LinkEventSink,
    token: CancellationToken,
) {
    loop {
        match read_frame::<_, Envelope>(&mut reader).await {
            Ok(Some(envelope)) => {
                if !notify(&events, &link, LinkEvent::Data(envelope)) {
                    break;
                }
            }
            Ok(None) => {
                if !closed.swap(true, Ordering::AcqRel) {
                    notify(&events, &link, LinkEvent::Closed);
                }
                break;
            }
            Err(TransportError::Codec(codec::CodecError::Serialization(e))) => {
                tracing::warn!(peer = %link.peer(), error = %e, "skipping undecodable frame");
            }
            Err(e) => {
                if !closed.swap(true, Ordering::AcqRel) {
                    notify(&events, &link, LinkEvent::Error(e.to_string()));
                }
                break;
            }
        }
    }
    token.cancel();
}

/// Reads one frame. `Ok(None)` means a clean end of stream.
async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = codec::read_frame_len(&header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(codec::decode(&payload)?))
}

async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = codec::encode_framed(envelope)?;
    writer.write_all(&frame).await?;
    Ok(())
}
