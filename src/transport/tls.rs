//! TLS client transport
//!
//! When `over_tls_enable` is set, the upstream connection is wrapped in
//! TLS and owned by a background session task. The tunnel talks to it
//! through [`TlsClient::send`] and receives three upcalls as
//! [`TlsEvent`]s: `Established` once after the handshake, `Data` for each
//! inbound record, and `ShuttingDown` when the session ends for any
//! reason.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::TransportError;

/// Upcalls from the TLS session task
#[derive(Debug)]
pub enum TlsEvent {
    /// Handshake complete; the transport accepts sends
    Established,
    /// Inbound bytes from the server
    Data(Vec<u8>),
    /// The session is gone (EOF, error, or local close)
    ShuttingDown,
}

/// Cloneable send handle into the TLS session
#[derive(Clone)]
pub struct TlsSender {
    outbound: mpsc::Sender<Vec<u8>>,
}

impl TlsSender {
    pub async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.outbound
            .send(data)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Handle to a TLS-wrapped upstream session
pub struct TlsClient {
    outbound: mpsc::Sender<Vec<u8>>,
    events: mpsc::Receiver<TlsEvent>,
}

impl TlsClient {
    /// Connect to `host:port` and wrap the stream in TLS against
    /// `server_name`. Returns immediately; progress is reported through the
    /// event stream, starting with `Established` or `ShuttingDown`.
    pub fn launch(host: String, port: u16, server_name: String) -> Self {
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(32);
        let (ev_tx, ev_rx) = mpsc::channel::<TlsEvent>(32);

        tokio::spawn(async move {
            if let Err(e) = run_session(&host, port, server_name, out_rx, &ev_tx).await {
                debug!("TLS session to {}:{} ended: {}", host, port, e);
            }
            let _ = ev_tx.send(TlsEvent::ShuttingDown).await;
        });

        Self {
            outbound: out_tx,
            events: ev_rx,
        }
    }

    /// Queue bytes for the server.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.outbound
            .send(data)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// A cloneable send handle, usable independently of the event stream.
    pub fn sender(&self) -> TlsSender {
        TlsSender {
            outbound: self.outbound.clone(),
        }
    }

    /// Await the next upcall. A closed channel is reported as
    /// `ShuttingDown`.
    pub async fn next_event(&mut self) -> TlsEvent {
        self.events.recv().await.unwrap_or(TlsEvent::ShuttingDown)
    }

    /// Mutable access to the event stream for streaming-phase selects.
    pub fn events_mut(&mut self) -> &mut mpsc::Receiver<TlsEvent> {
        &mut self.events
    }
}

async fn run_session(
    host: &str,
    port: u16,
    server_name: String,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    events: &mpsc::Sender<TlsEvent>,
) -> Result<(), TransportError> {
    let tcp = TcpStream::connect((host, port)).await?;
    tcp.set_nodelay(true).ok();

    let connector = TlsConnector::from(Arc::new(client_config()?));
    let name = ServerName::try_from(server_name)
        .map_err(|e| TransportError::Tls(format!("Invalid SNI: {}", e)))?;
    let stream = connector
        .connect(name, tcp)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    if events.send(TlsEvent::Established).await.is_err() {
        return Ok(());
    }

    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut buf = vec![0u8; crate::SSR_BUFF_SIZE];

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(data) => wr.write_all(&data).await?,
                // The tunnel dropped its handle; shut the session down.
                None => break,
            },
            n = rd.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    break;
                }
                if events.send(TlsEvent::Data(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }

    Ok(())
}

fn client_config() -> Result<rustls::ClientConfig, TransportError> {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let provider = rustls::crypto::ring::default_provider();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(config)
}
