use multiaddr::{Multiaddr, Protocol};
use socket2::{Domain, Socket, Type};
use std::{
    io,
    net::{IpAddr, SocketAddr},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::{
    error::{Error, Result},
    message::Message,
    MAX_MESSAGE_SIZE,
};

const LISTEN_BACKLOG: i32 = 1024;

/// Listening side of the node.
#[derive(Debug)]
pub struct Transport {
    listener: tokio::net::TcpListener,
    local_addr: SocketAddr,
}

impl Transport {
    /// Binds a listener on `socket_addr`. Port 0 lets the OS pick one.
    pub fn listen_on(socket_addr: SocketAddr) -> io::Result<Self> {
        let socket = Self::create_socket(&socket_addr)?;
        socket.set_reuse_address(true)?;
        socket.bind(&socket_addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;

        let listener = tokio::net::TcpListener::from_std(socket.into())?;
        let local_addr = listener.local_addr()?;

        debug!("Listen on {}", socketaddr_to_multiaddr(&local_addr));
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, remote_addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((TcpStream::new(stream), remote_addr))
    }

    pub async fn dial(socket_addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = tokio::net::TcpStream::connect(socket_addr).await?;
        stream.set_nodelay(true)?;
        Ok(TcpStream::new(stream))
    }

    fn create_socket(socket_addr: &SocketAddr) -> io::Result<Socket> {
        let domain = if socket_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?;
        if socket_addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_nodelay(true)?;

        Ok(socket)
    }
}

/// A connection speaking length-prefixed [`Message`] frames.
#[derive(Debug)]
pub struct TcpStream {
    inner: tokio::net::TcpStream,
}

impl TcpStream {
    fn new(inner: tokio::net::TcpStream) -> Self {
        Self { inner }
    }

    pub async fn read_msg(&mut self) -> Result<Message> {
        let mut len = [0u8; 4];
        self.inner.read_exact(&mut len).await?;

        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::FrameTooLarge(len));
        }

        let mut frame = vec![0u8; len];
        self.inner.read_exact(&mut frame).await?;

        Message::decode(&frame)
    }

    pub async fn write_msg(&mut self, msg: &Message) -> Result<()> {
        let frame = msg.encode()?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn close(mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

pub fn multiaddr_to_socketaddr(mut addr: Multiaddr) -> Result<SocketAddr> {
    let unsupported = |addr: &Multiaddr| Error::UnsupportedAddress(addr.to_string());
    let original = addr.clone();

    // "Pop" the IP address and TCP port from the end of the address,
    // ignoring a `/p2p/...` suffix as well as any prefix of possibly
    // outer protocols, if present.
    let mut port = None;
    while let Some(proto) = addr.pop() {
        match proto {
            Protocol::Ip4(ipv4) => match port {
                Some(port) => return Ok(SocketAddr::new(ipv4.into(), port)),
                None => return Err(unsupported(&original)),
            },
            Protocol::Ip6(ipv6) => match port {
                Some(port) => return Ok(SocketAddr::new(ipv6.into(), port)),
                None => return Err(unsupported(&original)),
            },
            Protocol::Tcp(portnum) => match port {
                Some(_) => return Err(unsupported(&original)),
                None => port = Some(portnum),
            },
            Protocol::P2p(_) => {}
            _ => return Err(unsupported(&original)),
        }
    }
    Err(unsupported(&original))
}

pub fn socketaddr_to_multiaddr(socket_addr: &SocketAddr) -> Multiaddr {
    let ip = match socket_addr.ip() {
        IpAddr::V4(ip) => Protocol::Ip4(ip),
        IpAddr::V6(ip) => Protocol::Ip6(ip),
    };

    Multiaddr::empty()
        .with(ip)
        .with(Protocol::Tcp(socket_addr.port()))
}
