//! Listen transports (TCP, unix path, unix abstract) and length-prefixed frame I/O.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bus_core::config::ListenSpec;
use bus_core::wire::{decode_payload, encode_frame, frame_len, LEN_SIZE};
use bus_core::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// A connected byte stream of either transport.
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A bound listener for one listen spec.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    pub async fn bind(spec: &ListenSpec) -> io::Result<Self> {
        match spec {
            ListenSpec::Tcp { addr, port } => {
                Ok(Listener::Tcp(TcpListener::bind((*addr, *port)).await?))
            }
            #[cfg(unix)]
            ListenSpec::UnixPath(path) => Ok(Listener::Unix(UnixListener::bind(path)?)),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            ListenSpec::UnixAbstract(name) => {
                let addr = abstract_addr(name)?;
                let std = std::os::unix::net::UnixListener::bind_addr(&addr)?;
                std.set_nonblocking(true)?;
                Ok(Listener::Unix(UnixListener::from_std(std)?))
            }
            #[allow(unreachable_patterns)]
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("transport not supported on this platform: {other}"),
            )),
        }
    }

    /// Connectable form of the listen spec this listener was bound from.
    pub fn connect_spec(&self, spec: &ListenSpec) -> io::Result<ListenSpec> {
        match self {
            Listener::Tcp(l) => Ok(spec.connectable(Some(l.local_addr()?))),
            #[cfg(unix)]
            Listener::Unix(_) => Ok(spec.connectable(None)),
        }
    }

    /// Accept one connection. Returns the stream and a peer label for logs.
    pub async fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(l) => {
                let (s, addr) = l.accept().await?;
                s.set_nodelay(true)?;
                Ok((Stream::Tcp(s), addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(l) => {
                let (s, _) = l.accept().await?;
                Ok((Stream::Unix(s), "unix".to_string()))
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn abstract_addr(name: &str) -> io::Result<std::os::unix::net::SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
}

#[cfg(target_os = "android")]
fn abstract_addr(name: &str) -> io::Result<std::os::unix::net::SocketAddr> {
    use std::os::android::net::SocketAddrExt;
    std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
}

/// Connect to a daemon listening on `spec`. Must be called inside a tokio runtime.
pub async fn connect(spec: &ListenSpec) -> io::Result<Stream> {
    match spec {
        ListenSpec::Tcp { addr, port } => {
            let s = TcpStream::connect((*addr, *port)).await?;
            s.set_nodelay(true)?;
            Ok(Stream::Tcp(s))
        }
        #[cfg(unix)]
        ListenSpec::UnixPath(path) => Ok(Stream::Unix(UnixStream::connect(path).await?)),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        ListenSpec::UnixAbstract(name) => {
            let addr = abstract_addr(name)?;
            let std = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            std.set_nonblocking(true)?;
            Ok(Stream::Unix(UnixStream::from_std(std)?))
        }
        #[allow(unreachable_patterns)]
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("transport not supported on this platform: {other}"),
        )),
    }
}

/// Read one frame. `Ok(None)` on clean EOF before a header.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Message>> {
    let mut header = [0u8; LEN_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = frame_len(header).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_payload(&payload)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> io::Result<()> {
    let frame = encode_frame(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}
