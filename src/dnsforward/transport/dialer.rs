//! The dialer capability the transport consumes: given a protocol
//! tag and an address, produce a connection with message-oriented
//! read/write/deadline/close primitives. `TokioDialer` is the concrete,
//! real-network implementation; tests substitute a hand-rolled fake.

use std::{fmt, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::Instant,
};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::dnsforward::dns::{self, Message};

/// Transport-level protocol tag: udp, tcp, or tcp-tls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
    TcpTls,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::TcpTls => "tcp-tls",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// A message-oriented connection to one upstream. Implementations own the
/// deadline bookkeeping so the transport never has to reach into socket
/// internals.
#[async_trait]
pub trait Conn: Send {
    async fn write_msg(&mut self, msg: &Message) -> io::Result<()>;
    async fn read_msg(&mut self) -> io::Result<Message>;
    fn set_read_deadline(&mut self, deadline: Instant);
    fn set_write_deadline(&mut self, deadline: Instant);
    async fn close(&mut self);
    fn udp_size(&self) -> u16;
    fn set_udp_size(&mut self, size: u16);
}

async fn with_deadline<F, T>(deadline: Option<Instant>, fut: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match deadline {
        Some(d) => tokio::time::timeout_at(d, fut)
            .await
            .unwrap_or_else(|_| Err(io::Error::from(io::ErrorKind::TimedOut))),
        None => fut.await,
    }
}

/// The dialer capability consumed by the transport.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        proto: Protocol,
        addr: &str,
        timeout: Duration,
    ) -> io::Result<Box<dyn Conn>>;
}

/// Real-network dialer: plain TCP/UDP, or DNS-over-TLS when the transport is
/// configured for `tcp-tls`.
pub struct TokioDialer {
    tls_config: Arc<rustls::ClientConfig>,
}

impl TokioDialer {
    pub fn new() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let cfg = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            tls_config: Arc::new(cfg),
        }
    }
}

impl Default for TokioDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TokioDialer {
    async fn dial(
        &self,
        proto: Protocol,
        addr: &str,
        timeout: Duration,
    ) -> io::Result<Box<dyn Conn>> {
        let dial_fut = async {
            match proto {
                Protocol::Udp => {
                    let sock = UdpSocket::bind("0.0.0.0:0").await?;
                    sock.connect(addr).await?;
                    Ok(Box::new(UdpConn {
                        sock,
                        udp_size: 512,
                        read_deadline: None,
                        write_deadline: None,
                    }) as Box<dyn Conn>)
                }
                Protocol::Tcp => {
                    let stream = TcpStream::connect(addr).await?;
                    Ok(Box::new(StreamConn {
                        stream,
                        udp_size: 512,
                        read_deadline: None,
                        write_deadline: None,
                    }) as Box<dyn Conn>)
                }
                Protocol::TcpTls => {
                    let stream = TcpStream::connect(addr).await?;
                    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
                    let server_name = ServerName::try_from(host.to_string())
                        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad TLS server name"))?;
                    let connector = TlsConnector::from(self.tls_config.clone());
                    let tls = connector.connect(server_name, stream).await?;
                    Ok(Box::new(StreamConn {
                        stream: tls,
                        udp_size: 512,
                        read_deadline: None,
                        write_deadline: None,
                    }) as Box<dyn Conn>)
                }
            }
        };

        tokio::time::timeout(timeout, dial_fut)
            .await
            .unwrap_or_else(|_| Err(io::Error::from(io::ErrorKind::TimedOut)))
    }
}

/// A length-prefixed stream connection: plain TCP or DNS-over-TLS, both of
/// which use the same 2-byte big-endian length prefix on the wire.
struct StreamConn<S> {
    stream: S,
    udp_size: u16,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

#[async_trait]
impl Conn for StreamConn<TcpStream> {
    async fn write_msg(&mut self, msg: &Message) -> io::Result<()> {
        write_framed(&mut self.stream, self.write_deadline, msg).await
    }

    async fn read_msg(&mut self) -> io::Result<Message> {
        read_framed(&mut self.stream, self.read_deadline).await
    }

    fn set_read_deadline(&mut self, deadline: Instant) {
        self.read_deadline = Some(deadline);
    }

    fn set_write_deadline(&mut self, deadline: Instant) {
        self.write_deadline = Some(deadline);
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    fn udp_size(&self) -> u16 {
        self.udp_size
    }

    fn set_udp_size(&mut self, size: u16) {
        self.udp_size = size;
    }
}

#[async_trait]
impl Conn for StreamConn<TlsStream<TcpStream>> {
    async fn write_msg(&mut self, msg: &Message) -> io::Result<()> {
        write_framed(&mut self.stream, self.write_deadline, msg).await
    }

    async fn read_msg(&mut self) -> io::Result<Message> {
        read_framed(&mut self.stream, self.read_deadline).await
    }

    fn set_read_deadline(&mut self, deadline: Instant) {
        self.read_deadline = Some(deadline);
    }

    fn set_write_deadline(&mut self, deadline: Instant) {
        self.write_deadline = Some(deadline);
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    fn udp_size(&self) -> u16 {
        self.udp_size
    }

    fn set_udp_size(&mut self, size: u16) {
        self.udp_size = size;
    }
}

async fn write_framed<S>(stream: &mut S, deadline: Option<Instant>, msg: &Message) -> io::Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let raw = msg.raw();
    let n: u16 = raw
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large for tcp framing"))?;
    with_deadline(deadline, async {
        stream.write_u16(n).await?;
        stream.write_all(raw).await?;
        stream.flush().await
    })
    .await
}

async fn read_framed<S>(stream: &mut S, deadline: Option<Instant>) -> io::Result<Message>
where
    S: tokio::io::AsyncRead + Unpin,
{
    with_deadline(deadline, async {
        let n = stream.read_u16().await? as usize;
        if n > MAX_MESSAGE_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "response too large"));
        }
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).await?;
        dns::parse_message(Bytes::from(buf))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    })
    .await
}

struct UdpConn {
    sock: UdpSocket,
    udp_size: u16,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

#[async_trait]
impl Conn for UdpConn {
    async fn write_msg(&mut self, msg: &Message) -> io::Result<()> {
        let raw = msg.raw();
        with_deadline(self.write_deadline, async { self.sock.send(raw).await.map(|_| ()) }).await
    }

    async fn read_msg(&mut self) -> io::Result<Message> {
        with_deadline(self.read_deadline, async {
            let mut buf = BytesMut::zeroed(MAX_MESSAGE_BYTES);
            let n = self.sock.recv(&mut buf).await?;
            buf.truncate(n);
            dns::parse_message(buf.freeze())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        })
        .await
    }

    fn set_read_deadline(&mut self, deadline: Instant) {
        self.read_deadline = Some(deadline);
    }

    fn set_write_deadline(&mut self, deadline: Instant) {
        self.write_deadline = Some(deadline);
    }

    async fn close(&mut self) {
        // UDP sockets have no handshake to tear down; drop is sufficient.
    }

    fn udp_size(&self) -> u16 {
        self.udp_size
    }

    fn set_udp_size(&mut self, size: u16) {
        self.udp_size = size;
    }
}
