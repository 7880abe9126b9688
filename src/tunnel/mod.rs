//! Per-session tunnel state machine
//!
//! A [`Tunnel`] pairs one accepted local connection with one upstream
//! transport and drives the session through a linear sequence of stages:
//! SOCKS5 negotiation on the incoming socket, resolve/dial of the upstream,
//! the obfuscation handshake (with an optional challenge-response round),
//! then bidirectional streaming until either side goes away.
//!
//! Every stage is entered from a completed socket or TLS operation. The
//! handler for a stage first acknowledges the half-state of the operation
//! that woke it (asserting it is `done` and returning it to `idle`),
//! inspects the result, then issues the operation the next stage waits on.
//! Any failed operation short-circuits to shutdown; an incomplete SOCKS
//! parse re-arms the incoming read without changing stage.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::cipher::{CipherError, ProtocolDecoder, ProtocolEncoder, ServerInfo};
use crate::env::ServerEnv;
use crate::socks5::{self, Command, ParseStatus, Parser, Reply, Socks5Error, AUTH_NONE};
use crate::transport::{
    PeerSocket, ReadEnd, TlsClient, TlsEvent, TransportError, WriteEnd,
};
use crate::transport::tls::TlsSender;

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{0} junk bytes after {1}")]
    Junk(usize, &'static str),

    #[error("Peer closed during negotiation")]
    PeerClosed,

    #[error("Codec failure during streaming")]
    CodecFailure,

    #[error("TLS transport shut down")]
    TlsClosed,

    #[error("Unexpected {0}")]
    Unexpected(&'static str),
}

/// Session stages. At most one is set per tunnel; the transition graph is
/// acyclic except for the streaming self-loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for the client greeting
    Handshake,
    /// Method reply written, waiting for its completion
    HandshakeReplied,
    /// Waiting for the client request
    S5Request,
    /// UDP-ASSOCIATE reply written, shutting down once it lands
    S5UdpAssoc,
    /// Waiting for the TLS established upcall
    TlsConnecting,
    /// First encrypted package sent over TLS, waiting for the server answer
    TlsFirstPackage,
    /// TLS streaming
    TlsStreaming,
    /// Waiting for upstream hostname resolution
    ResolveDone,
    /// Waiting for the upstream TCP connect
    ConnectingUpstream,
    /// Initial encrypted package written upstream
    SsrAuthSent,
    /// Waiting for the server challenge
    SsrWaitingFeedback,
    /// Challenge receipt written upstream
    SsrReceiptSent,
    /// SOCKS5 success reply written, streaming starts when it lands
    AuthCompletionDone,
    /// Piping data back and forth
    Streaming,
    /// Tear the session down
    Kill,
}

/// One proxied session: the incoming socket, the upstream transport, and
/// the state shared between them.
pub struct Tunnel {
    env: Arc<ServerEnv>,
    id: u64,
    stage: Stage,
    incoming: PeerSocket,
    outgoing: PeerSocket,
    tls: Option<TlsClient>,
    parser: Parser,
    init_pkg: Vec<u8>,
    cipher: Option<crate::cipher::TunnelCipher>,
    desired_addr: Option<socks5::Address>,
}

impl Tunnel {
    /// Register a freshly accepted connection and spawn its session task.
    pub fn spawn(env: Arc<ServerEnv>, stream: tokio::net::TcpStream) {
        let (id, shutdown) = env.registry().register();
        let tunnel = Self {
            env,
            id,
            stage: Stage::Handshake,
            incoming: PeerSocket::from_stream(stream),
            outgoing: PeerSocket::unconnected(),
            tls: None,
            parser: Parser::new(),
            init_pkg: Vec::new(),
            cipher: None,
            desired_addr: None,
        };
        tokio::spawn(tunnel.run(shutdown));
    }

    /// Run the session to completion. The shutdown signal cancels all
    /// pending I/O at the next suspension point; either way the dying path
    /// removes the tunnel from the registry exactly once.
    async fn run(mut self, shutdown: Arc<Notify>) {
        let env = Arc::clone(&self.env);
        let id = self.id;

        tokio::select! {
            _ = shutdown.notified() => {
                debug!(tunnel = id, stage = ?self.stage, "shutdown requested");
            }
            _ = self.process() => {}
        }

        env.registry().remove(id);
        debug!(tunnel = id, "tunnel closed");
    }

    async fn process(&mut self) {
        if let Err(e) = self.drive().await {
            debug!(tunnel = self.id, stage = ?self.stage, "tunnel ended: {}", e);
        }
    }

    /// The core dispatch loop. Each handler is entered with the half-state
    /// of the socket whose operation just completed set to `done`.
    async fn drive(&mut self) -> Result<(), TunnelError> {
        self.incoming.read().await;

        loop {
            match self.stage {
                Stage::Handshake => self.do_handshake().await?,
                Stage::HandshakeReplied => self.do_wait_s5_request().await?,
                Stage::S5Request => self.do_parse_s5_request().await?,
                Stage::S5UdpAssoc => {
                    self.incoming.ack_write()?;
                    return Ok(());
                }
                Stage::TlsConnecting => self.do_tls_connecting().await?,
                Stage::TlsFirstPackage => self.do_tls_first_package().await?,
                Stage::ResolveDone => self.do_resolve_done().await?,
                Stage::ConnectingUpstream => self.do_connect_done().await?,
                Stage::SsrAuthSent => self.do_ssr_auth_sent().await?,
                Stage::SsrWaitingFeedback => self.do_ssr_waiting_feedback().await?,
                Stage::SsrReceiptSent => self.do_ssr_receipt_sent().await?,
                Stage::AuthCompletionDone => self.do_launch_streaming()?,
                Stage::Streaming => return self.relay_streaming().await,
                Stage::TlsStreaming => return self.relay_tls_streaming().await,
                Stage::Kill => return Ok(()),
            }
        }
    }

    /// Client greeting arrived. Only the no-auth method is offered.
    async fn do_handshake(&mut self) -> Result<(), TunnelError> {
        let data = self.incoming.ack_read()?;
        if data.is_empty() {
            return Err(TunnelError::PeerClosed);
        }

        let mut rest = data;
        let status = self.parser.parse(&mut rest)?;
        match status {
            ParseStatus::NeedMore => {
                self.incoming.read().await;
            }
            ParseStatus::SelectAuth => {
                if !rest.is_empty() {
                    return Err(TunnelError::Junk(rest.len(), "handshake"));
                }
                if self.parser.auth_methods() & AUTH_NONE != 0 {
                    self.incoming.write(&[0x05, 0x00]).await;
                    self.stage = Stage::HandshakeReplied;
                } else {
                    // No acceptable auth; reply and terminate.
                    self.incoming.write(&[0x05, 0xFF]).await;
                    self.incoming.ack_write()?;
                    self.stage = Stage::Kill;
                }
            }
            ParseStatus::ExecCmd => {
                return Err(TunnelError::Unexpected("command during handshake"));
            }
        }
        Ok(())
    }

    /// Method reply landed; arm the request read.
    async fn do_wait_s5_request(&mut self) -> Result<(), TunnelError> {
        self.incoming.ack_write()?;
        self.incoming.read().await;
        self.stage = Stage::S5Request;
        Ok(())
    }

    /// Request bytes arrived. Dispatch CONNECT / UDP-ASSOCIATE / BIND.
    async fn do_parse_s5_request(&mut self) -> Result<(), TunnelError> {
        let data = self.incoming.ack_read()?;
        if data.is_empty() {
            return Err(TunnelError::PeerClosed);
        }

        let mut rest = data;
        let status = self.parser.parse(&mut rest)?;
        match status {
            ParseStatus::NeedMore => {
                self.incoming.read().await;
                return Ok(());
            }
            ParseStatus::SelectAuth => {
                return Err(TunnelError::Unexpected("greeting during request"));
            }
            ParseStatus::ExecCmd => {}
        }
        if !rest.is_empty() {
            return Err(TunnelError::Junk(rest.len(), "request"));
        }

        let env = Arc::clone(&self.env);
        let config = env.config();

        let cmd = self
            .parser
            .command()
            .ok_or(TunnelError::Unexpected("request without command"))?;
        match cmd {
            Command::Bind => {
                // Not supported but relatively straightforward to implement.
                warn!(tunnel = self.id, "BIND requests are not supported");
                self.stage = Stage::Kill;
            }
            Command::UdpAssociate => {
                let reply = socks5::udp_assoc_reply(
                    config.udp,
                    &config.listen_host,
                    config.listen_port,
                );
                self.incoming.write(&reply).await;
                self.stage = Stage::S5UdpAssoc;
            }
            Command::Connect => {
                let addr = self.parser.dest_addr()?;
                debug!(tunnel = self.id, "CONNECT to {}", addr);
                self.init_pkg = socks5::initial_package(&addr);
                self.desired_addr = Some(addr);

                let mut cipher = self.env.create_cipher(crate::MAX_CHUNK_SIZE)?;
                cipher.set_server_info(ServerInfo {
                    buffer_size: crate::SSR_BUFF_SIZE,
                    head_len: socks5::head_size(&self.init_pkg, 30),
                });
                self.cipher = Some(cipher);

                if config.over_tls_enable {
                    let sni = config
                        .over_tls_server_domain
                        .clone()
                        .unwrap_or_else(|| config.remote_host.clone());
                    self.tls = Some(TlsClient::launch(
                        config.remote_host.clone(),
                        config.remote_port,
                        sni,
                    ));
                    self.stage = Stage::TlsConnecting;
                } else if let Ok(ip) = config.remote_host.parse::<IpAddr>() {
                    // Numeric remote host, no resolution needed.
                    self.outgoing
                        .set_addr(SocketAddr::new(ip, config.remote_port));
                    self.do_connect_upstream().await?;
                } else {
                    self.outgoing
                        .resolve(&config.remote_host, config.remote_port)
                        .await;
                    self.stage = Stage::ResolveDone;
                }
            }
        }
        Ok(())
    }

    /// Resolution finished. On failure reply host-unreachable and die.
    async fn do_resolve_done(&mut self) -> Result<(), TunnelError> {
        if let Err(e) = self.outgoing.ack_op() {
            error!(
                tunnel = self.id,
                "lookup error for \"{}\": {}",
                self.env.config().remote_host,
                e
            );
            return self.reply_and_kill(Reply::HostUnreachable).await;
        }
        self.do_connect_upstream().await
    }

    /// Gate on the access policy, then dial the stashed upstream address.
    async fn do_connect_upstream(&mut self) -> Result<(), TunnelError> {
        let addr = self
            .outgoing
            .addr()
            .ok_or(TunnelError::Unexpected("dial without address"))?;

        if !crate::acl::can_access(&addr) {
            warn!(tunnel = self.id, "connection to {} not allowed by ruleset", addr);
            return self.reply_and_kill(Reply::NotAllowed).await;
        }

        self.outgoing.connect().await;
        self.stage = Stage::ConnectingUpstream;
        Ok(())
    }

    /// Upstream connect finished. On success send the encrypted initial
    /// package; on failure reply connection-refused and die.
    async fn do_connect_done(&mut self) -> Result<(), TunnelError> {
        if let Err(e) = self.outgoing.ack_op() {
            error!(tunnel = self.id, "upstream connection: {}", e);
            return self.reply_and_kill(Reply::ConnectionRefused).await;
        }

        let mut pkg = self.init_pkg.clone();
        let cipher = self
            .cipher
            .as_mut()
            .ok_or(TunnelError::Unexpected("send before cipher setup"))?;
        cipher.encrypt(&mut pkg)?;

        self.outgoing.write(&pkg).await;
        self.stage = Stage::SsrAuthSent;
        Ok(())
    }

    /// Initial package write landed. Protocols with a challenge round read
    /// the server's answer next; the rest go straight to the success reply.
    async fn do_ssr_auth_sent(&mut self) -> Result<(), TunnelError> {
        self.outgoing.ack_write()?;

        let needs_feedback = self
            .cipher
            .as_ref()
            .map(|c| c.needs_feedback())
            .unwrap_or(false);
        if needs_feedback {
            self.outgoing.read().await;
            self.stage = Stage::SsrWaitingFeedback;
        } else {
            self.do_socks5_reply_success().await?;
        }
        Ok(())
    }

    /// A challenge chunk arrived from the server. No application bytes may
    /// appear in the handshake; the decoder yields only the receipt.
    async fn do_ssr_waiting_feedback(&mut self) -> Result<(), TunnelError> {
        let data = self.outgoing.ack_read()?;
        if data.is_empty() {
            return Err(TunnelError::PeerClosed);
        }

        let mut buf = data.to_vec();
        let cipher = self
            .cipher
            .as_mut()
            .ok_or(TunnelError::Unexpected("feedback before cipher setup"))?;
        let feedback = cipher.decrypt(&mut buf)?;
        let challenge_pending = cipher.challenge_pending();
        debug_assert!(buf.is_empty(), "handshake decrypt must consume all input");

        match feedback {
            Some(receipt) => {
                self.outgoing.write(&receipt).await;
                self.stage = Stage::SsrReceiptSent;
            }
            None if challenge_pending => {
                // Partial challenge chunk; keep reading.
                self.outgoing.read().await;
            }
            None => self.do_socks5_reply_success().await?,
        }
        Ok(())
    }

    /// Receipt write landed; the upstream handshake is complete.
    async fn do_ssr_receipt_sent(&mut self) -> Result<(), TunnelError> {
        self.outgoing.ack_write()?;
        self.do_socks5_reply_success().await
    }

    /// Emit `05 00 00` followed by the initial package verbatim.
    async fn do_socks5_reply_success(&mut self) -> Result<(), TunnelError> {
        let mut reply = Vec::with_capacity(3 + self.init_pkg.len());
        reply.extend_from_slice(&[0x05, 0x00, 0x00]);
        reply.extend_from_slice(&self.init_pkg);
        self.incoming.write(&reply).await;
        self.stage = Stage::AuthCompletionDone;
        Ok(())
    }

    /// Success reply landed; pick the streaming mode.
    fn do_launch_streaming(&mut self) -> Result<(), TunnelError> {
        self.incoming.ack_write()?;
        self.stage = if self.env.config().over_tls_enable {
            Stage::TlsStreaming
        } else {
            Stage::Streaming
        };
        Ok(())
    }

    /// Write a canned SOCKS reply to the client and enter the kill stage.
    async fn reply_and_kill(&mut self, reply: Reply) -> Result<(), TunnelError> {
        self.incoming.write(&socks5::build_reply(reply)).await;
        self.incoming.ack_write()?;
        self.stage = Stage::Kill;
        Ok(())
    }

    /// TLS established. Send the encrypted initial package as the first
    /// record.
    async fn do_tls_connecting(&mut self) -> Result<(), TunnelError> {
        let ev = match self.tls.as_mut() {
            Some(tls) => tls.next_event().await,
            None => return Err(TunnelError::Unexpected("TLS stage without transport")),
        };

        match ev {
            TlsEvent::Established => {
                let mut pkg = self.init_pkg.clone();
                let cipher = self
                    .cipher
                    .as_mut()
                    .ok_or(TunnelError::Unexpected("send before cipher setup"))?;
                cipher.encrypt(&mut pkg)?;

                let tls = self
                    .tls
                    .as_ref()
                    .ok_or(TunnelError::Unexpected("TLS stage without transport"))?;
                tls.send(pkg).await?;
                self.stage = Stage::TlsFirstPackage;
                Ok(())
            }
            TlsEvent::ShuttingDown => Err(TunnelError::TlsClosed),
            TlsEvent::Data(_) => Err(TunnelError::Unexpected("data before TLS established")),
        }
    }

    /// The server's answer to the first package arrived over TLS. Decode
    /// it and complete the SOCKS exchange.
    async fn do_tls_first_package(&mut self) -> Result<(), TunnelError> {
        let ev = match self.tls.as_mut() {
            Some(tls) => tls.next_event().await,
            None => return Err(TunnelError::Unexpected("TLS stage without transport")),
        };

        match ev {
            TlsEvent::Data(data) => {
                let mut buf = data;
                let cipher = self
                    .cipher
                    .as_mut()
                    .ok_or(TunnelError::Unexpected("feedback before cipher setup"))?;
                let feedback = cipher.decrypt(&mut buf)?;
                debug_assert!(feedback.is_none(), "unexpected feedback over TLS");
                self.do_socks5_reply_success().await
            }
            TlsEvent::ShuttingDown => Err(TunnelError::TlsClosed),
            TlsEvent::Established => Err(TunnelError::Unexpected("duplicate TLS established")),
        }
    }

    /// Plain streaming: both sockets split into halves, one relay future
    /// per direction. Whichever direction finishes first (EOF or error)
    /// tears the session down.
    async fn relay_streaming(&mut self) -> Result<(), TunnelError> {
        debug!(tunnel = self.id, target = ?self.desired_addr, "streaming started");
        let (in_rd, in_wr) = self.incoming.split()?;
        let (out_rd, out_wr) = self.outgoing.split()?;
        let cipher = self
            .cipher
            .as_mut()
            .ok_or(TunnelError::Unexpected("streaming before cipher setup"))?;
        let (enc, dec) = cipher.halves_mut();

        tokio::select! {
            r = relay_direction(in_rd, out_wr, Codec::Encrypt(enc)) => r,
            r = relay_direction(out_rd, in_wr, Codec::Decrypt(dec)) => r,
        }
    }

    /// TLS streaming: the upstream is owned by the TLS session task; the
    /// tunnel drives the incoming socket and the TLS upcalls.
    async fn relay_tls_streaming(&mut self) -> Result<(), TunnelError> {
        debug!(tunnel = self.id, target = ?self.desired_addr, "TLS streaming started");
        let (in_rd, in_wr) = self.incoming.split()?;
        let tls = self
            .tls
            .as_mut()
            .ok_or(TunnelError::Unexpected("TLS streaming without transport"))?;
        let sender = tls.sender();
        let events = tls.events_mut();
        let cipher = self
            .cipher
            .as_mut()
            .ok_or(TunnelError::Unexpected("streaming before cipher setup"))?;
        let (enc, dec) = cipher.halves_mut();

        tokio::select! {
            r = relay_to_tls(in_rd, sender, enc) => r,
            r = relay_from_tls(events, in_wr, dec) => r,
        }
    }
}

/// Streaming transform selector: encrypt for the incoming→outgoing
/// direction, decrypt for outgoing→incoming.
pub(crate) enum Codec<'a> {
    Encrypt(&'a mut ProtocolEncoder),
    Decrypt(&'a mut ProtocolDecoder),
}

/// Clone a socket's received bytes and run them through the codec for its
/// direction. `None` signals a codec failure; the caller shuts down.
pub(crate) fn extract_data(data: &[u8], codec: &mut Codec<'_>) -> Option<Vec<u8>> {
    let mut buf = data.to_vec();
    match codec {
        Codec::Encrypt(enc) => enc.encrypt(&mut buf).ok()?,
        Codec::Decrypt(dec) => {
            let feedback = dec.decrypt(&mut buf).ok()?;
            // Feedback only exists during the handshake.
            debug_assert!(feedback.is_none(), "unexpected feedback after handshake");
        }
    }
    Some(buf)
}

/// One streaming direction: discrete read, transform, serialized write,
/// re-arm. The read buffer is never re-armed while its bytes are in
/// flight.
async fn relay_direction(
    mut rd: ReadEnd,
    mut wr: WriteEnd,
    mut codec: Codec<'_>,
) -> Result<(), TunnelError> {
    loop {
        rd.read().await;
        let data = rd.ack_read()?;
        if data.is_empty() {
            return Ok(());
        }
        let Some(out) = extract_data(data, &mut codec) else {
            return Err(TunnelError::CodecFailure);
        };
        if !out.is_empty() {
            wr.write(&out).await;
            wr.ack_write()?;
        }
    }
}

/// Incoming→TLS direction of TLS streaming.
async fn relay_to_tls(
    mut rd: ReadEnd,
    sender: TlsSender,
    enc: &mut ProtocolEncoder,
) -> Result<(), TunnelError> {
    let mut codec = Codec::Encrypt(enc);
    loop {
        rd.read().await;
        let data = rd.ack_read()?;
        if data.is_empty() {
            return Ok(());
        }
        let Some(out) = extract_data(data, &mut codec) else {
            return Err(TunnelError::CodecFailure);
        };
        if !out.is_empty() {
            sender.send(out).await?;
        }
    }
}

/// TLS→incoming direction of TLS streaming.
async fn relay_from_tls(
    events: &mut mpsc::Receiver<TlsEvent>,
    mut wr: WriteEnd,
    dec: &mut ProtocolDecoder,
) -> Result<(), TunnelError> {
    let mut codec = Codec::Decrypt(dec);
    loop {
        match events.recv().await {
            Some(TlsEvent::Data(data)) => {
                let Some(out) = extract_data(&data, &mut codec) else {
                    return Err(TunnelError::CodecFailure);
                };
                if !out.is_empty() {
                    wr.write(&out).await;
                    wr.ack_write()?;
                }
            }
            Some(TlsEvent::ShuttingDown) | None => return Ok(()),
            Some(TlsEvent::Established) => {
                return Err(TunnelError::Unexpected("duplicate TLS established"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{Method, Obfs, Protocol, TunnelCipher};

    fn cipher() -> TunnelCipher {
        TunnelCipher::create(
            Method::Chacha20Poly1305,
            Protocol::Origin,
            Obfs::Plain,
            "pw",
            crate::MAX_CHUNK_SIZE,
        )
        .unwrap()
    }

    #[test]
    fn test_extract_data_roundtrip() {
        let mut client = cipher();
        let mut server = cipher();
        let (enc, _) = client.halves_mut();
        let (_, dec) = server.halves_mut();

        let wire = extract_data(b"hello", &mut Codec::Encrypt(enc)).unwrap();
        assert_ne!(&wire[..], b"hello");

        let plain = extract_data(&wire, &mut Codec::Decrypt(dec)).unwrap();
        assert_eq!(plain, b"hello");
    }

    #[test]
    fn test_extract_data_signals_codec_failure() {
        let mut server = cipher();
        let (_, dec) = server.halves_mut();
        // A frame with a valid length prefix but garbage ciphertext.
        let mut junk = vec![0x00, 0x20];
        junk.extend_from_slice(&[0xAA; 0x20]);
        assert!(extract_data(&junk, &mut Codec::Decrypt(dec)).is_none());
    }

    #[test]
    fn test_partial_frame_yields_empty_not_error() {
        let mut client = cipher();
        let mut server = cipher();
        let (enc, _) = client.halves_mut();
        let (_, dec) = server.halves_mut();

        let wire = extract_data(b"split", &mut Codec::Encrypt(enc)).unwrap();
        let mut codec = Codec::Decrypt(dec);
        let first = extract_data(&wire[..3], &mut codec).unwrap();
        assert!(first.is_empty());
        let second = extract_data(&wire[3..], &mut codec).unwrap();
        assert_eq!(second, b"split");
    }
}
