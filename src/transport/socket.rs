//! Socket endpoint with per-half state tracking
//!
//! A connection is modeled as two small state machines, one for the read
//! half and one for the write half. Either half is, when active, in one of
//! three states:
//!
//! ```text
//!                  busy                    done              idle
//! ----------|--------------------------|-------------------|------|
//! read      | waiting for inbound data | have inbound data | idle |
//! write     | busy writing out data    | completed write   | idle |
//! ```
//!
//! A half is `done` only between an operation completing and the tunnel
//! state machine acknowledging it; the ack returns the half to `idle`
//! before the next operation may be issued. Reads are discrete: the read
//! buffer is reused across operations, so a read is never re-armed until
//! its bytes have been fully consumed (encrypted and written, or handed
//! to the TLS transport).

use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};

use super::TransportError;

/// Status of one direction of one socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfState {
    Idle,
    Busy,
    Done,
}

/// A TCP endpoint owned by one tunnel. At most one operation per half is
/// outstanding at any time; the owning state machine enforces this through
/// the `done`-then-ack discipline.
pub struct PeerSocket {
    stream: Option<TcpStream>,
    addr: Option<SocketAddr>,
    rdstate: HalfState,
    wrstate: HalfState,
    buf: Vec<u8>,
    nread: usize,
    err: Option<io::Error>,
}

impl PeerSocket {
    /// Wrap an accepted connection.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            addr: None,
            rdstate: HalfState::Idle,
            wrstate: HalfState::Idle,
            buf: vec![0u8; crate::SSR_BUFF_SIZE],
            nread: 0,
            err: None,
        }
    }

    /// An endpoint with no connection yet (the upstream side before dial).
    pub fn unconnected() -> Self {
        Self {
            stream: None,
            addr: None,
            rdstate: HalfState::Idle,
            wrstate: HalfState::Idle,
            buf: vec![0u8; crate::SSR_BUFF_SIZE],
            nread: 0,
            err: None,
        }
    }

    /// Stash the destination address for a later [`connect`](Self::connect).
    pub fn set_addr(&mut self, addr: SocketAddr) {
        self.addr = Some(addr);
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn rdstate(&self) -> HalfState {
        self.rdstate
    }

    pub fn wrstate(&self) -> HalfState {
        self.wrstate
    }

    /// Post one discrete read. The half goes `busy` for the duration and
    /// `done` on completion; the outcome is surfaced by
    /// [`ack_read`](Self::ack_read).
    pub async fn read(&mut self) {
        debug_assert_eq!(self.rdstate, HalfState::Idle);
        self.rdstate = HalfState::Busy;
        match self.stream.as_mut() {
            Some(stream) => match stream.read(&mut self.buf).await {
                Ok(n) => {
                    self.nread = n;
                    self.err = None;
                }
                Err(e) => {
                    self.nread = 0;
                    self.err = Some(e);
                }
            },
            None => {
                self.nread = 0;
                self.err = Some(io::Error::from(io::ErrorKind::NotConnected));
            }
        }
        self.rdstate = HalfState::Done;
    }

    /// Acknowledge a completed read: asserts the half is `done`, returns it
    /// to `idle`, and yields the received bytes (empty on EOF) or the error.
    pub fn ack_read(&mut self) -> io::Result<&[u8]> {
        debug_assert_eq!(self.rdstate, HalfState::Done);
        self.rdstate = HalfState::Idle;
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(&self.buf[..self.nread]),
        }
    }

    /// Send all of `data`. The half goes `busy` for the duration and `done`
    /// on completion.
    pub async fn write(&mut self, data: &[u8]) {
        debug_assert_eq!(self.wrstate, HalfState::Idle);
        self.wrstate = HalfState::Busy;
        match self.stream.as_mut() {
            Some(stream) => {
                self.err = stream.write_all(data).await.err();
            }
            None => {
                self.err = Some(io::Error::from(io::ErrorKind::NotConnected));
            }
        }
        self.wrstate = HalfState::Done;
    }

    /// Acknowledge a completed write.
    pub fn ack_write(&mut self) -> io::Result<()> {
        debug_assert_eq!(self.wrstate, HalfState::Done);
        self.wrstate = HalfState::Idle;
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolve `host` and stash the first result (carrying `port`) as the
    /// destination address. The outcome is surfaced by [`ack_op`](Self::ack_op).
    pub async fn resolve(&mut self, host: &str, port: u16) {
        match lookup_host((host, port)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => {
                    self.addr = Some(addr);
                    self.err = None;
                }
                None => {
                    self.err = Some(io::Error::new(
                        io::ErrorKind::NotFound,
                        "no addresses returned",
                    ));
                }
            },
            Err(e) => self.err = Some(e),
        }
    }

    /// Dial the stashed destination address.
    pub async fn connect(&mut self) {
        let Some(addr) = self.addr else {
            self.err = Some(io::Error::from(io::ErrorKind::InvalidInput));
            return;
        };
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                self.stream = Some(stream);
                self.err = None;
            }
            Err(e) => self.err = Some(e),
        }
    }

    /// Acknowledge a completed resolve or connect operation.
    pub fn ack_op(&mut self) -> io::Result<()> {
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear the socket into independently owned halves for streaming. The
    /// read buffer travels with the read end.
    pub fn split(&mut self) -> Result<(ReadEnd, WriteEnd), TransportError> {
        debug_assert_eq!(self.rdstate, HalfState::Idle);
        debug_assert_eq!(self.wrstate, HalfState::Idle);
        let stream = self.stream.take().ok_or(TransportError::NotConnected)?;
        let (rd, wr) = stream.into_split();
        Ok((
            ReadEnd {
                half: rd,
                state: HalfState::Idle,
                buf: std::mem::take(&mut self.buf),
                nread: 0,
                err: None,
            },
            WriteEnd {
                half: wr,
                state: HalfState::Idle,
                err: None,
            },
        ))
    }
}

/// The read half of a split socket, with the same discrete-read discipline
/// as [`PeerSocket`].
pub struct ReadEnd {
    half: OwnedReadHalf,
    state: HalfState,
    buf: Vec<u8>,
    nread: usize,
    err: Option<io::Error>,
}

impl ReadEnd {
    pub async fn read(&mut self) {
        debug_assert_eq!(self.state, HalfState::Idle);
        self.state = HalfState::Busy;
        match self.half.read(&mut self.buf).await {
            Ok(n) => {
                self.nread = n;
                self.err = None;
            }
            Err(e) => {
                self.nread = 0;
                self.err = Some(e);
            }
        }
        self.state = HalfState::Done;
    }

    pub fn ack_read(&mut self) -> io::Result<&[u8]> {
        debug_assert_eq!(self.state, HalfState::Done);
        self.state = HalfState::Idle;
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(&self.buf[..self.nread]),
        }
    }
}

/// The write half of a split socket.
pub struct WriteEnd {
    half: OwnedWriteHalf,
    state: HalfState,
    err: Option<io::Error>,
}

impl WriteEnd {
    pub async fn write(&mut self, data: &[u8]) {
        debug_assert_eq!(self.state, HalfState::Idle);
        self.state = HalfState::Busy;
        self.err = self.half.write_all(data).await.err();
        self.state = HalfState::Done;
    }

    pub fn ack_write(&mut self) -> io::Result<()> {
        debug_assert_eq!(self.state, HalfState::Done);
        self.state = HalfState::Idle;
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_half_state_discipline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            peer.write_all(b"pong").await.unwrap();
            let mut buf = [0u8; 4];
            peer.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut sock = PeerSocket::unconnected();
        sock.set_addr(addr);
        sock.connect().await;
        sock.ack_op().unwrap();

        assert_eq!(sock.rdstate(), HalfState::Idle);
        sock.read().await;
        assert_eq!(sock.rdstate(), HalfState::Done);
        let data = sock.ack_read().unwrap();
        assert_eq!(data, b"pong");
        assert_eq!(sock.rdstate(), HalfState::Idle);

        sock.write(b"ping").await;
        assert_eq!(sock.wrstate(), HalfState::Done);
        sock.ack_write().unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_read_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (peer, _) = listener.accept().await.unwrap();
            drop(peer);
        });

        let mut sock = PeerSocket::unconnected();
        sock.set_addr(addr);
        sock.connect().await;
        sock.ack_op().unwrap();

        sock.read().await;
        let data = sock.ack_read().unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_failure() {
        let mut sock = PeerSocket::unconnected();
        sock.resolve("definitely-not-a-real-host.invalid", 80).await;
        assert!(sock.ack_op().is_err());
    }

    #[tokio::test]
    async fn test_split_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let echo = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            peer.read_exact(&mut buf).await.unwrap();
            peer.write_all(&buf).await.unwrap();
        });

        let mut sock = PeerSocket::unconnected();
        sock.set_addr(addr);
        sock.connect().await;
        sock.ack_op().unwrap();

        let (mut rd, mut wr) = sock.split().unwrap();
        wr.write(b"hello").await;
        wr.ack_write().unwrap();

        rd.read().await;
        assert_eq!(rd.ack_read().unwrap(), b"hello");
        echo.await.unwrap();
    }
}
