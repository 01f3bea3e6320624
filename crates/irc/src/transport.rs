//! Line transport: TCP with optional TLS, framed into IRC lines.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, RwLock},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{Sink, SinkExt, Stream, StreamExt, future},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::TcpStream,
        sync::{Mutex, OwnedMutexGuard},
    },
    tokio_rustls::{
        TlsConnector,
        rustls::{ClientConfig, RootCertStore, crypto::ring, pki_types::ServerName},
    },
    tokio_util::codec::{Framed, LinesCodec, LinesCodecError},
    tracing::{debug, warn},
};

use crate::{
    error::{Error, Result},
    protocol::{Command, irc_to_lower},
};

/// Longest line accepted from a server. RFC 1459 allows 512 bytes; IRCv3
/// tags can add up to 8191 more.
const MAX_LINE_LENGTH: usize = 8704;

pub type LineSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An open connection, split into its write and read halves.
pub struct Connection {
    /// Accepts lines without CRLF.
    pub sink: LineSink,
    /// Yields lines with CRLF stripped.
    pub stream: LineStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections to IRC servers.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16, tls: bool) -> Result<Connection>;
}

/// Dials real servers over TCP, upgrading to TLS against the system roots.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16, tls: bool) -> Result<Connection> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout { phase: "connect" })?
            .map_err(|e| Error::transport(format!("connect {host}:{port}"), e))?;
        tcp.set_nodelay(true)?;
        debug!(host, port, tls, "tcp connected");

        if !tls {
            return Ok(frame(tcp));
        }
        let connector = tls_connector()?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Tls(format!("invalid server name {host}: {e}")))?;
        let stream = tokio::time::timeout(self.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::Timeout { phase: "tls handshake" })?
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(frame(stream))
    }
}

fn tls_connector() -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!(error = %e, "error loading native root certificate");
    }
    for cert in native.certs {
        if let Err(e) = roots.add(cert) {
            warn!(error = %e, "skipping invalid root certificate");
        }
    }
    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

fn frame<T>(io: T) -> Connection
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let framed = Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let (sink, stream) = framed.split::<String>();
    // The codec terminates with LF; IRC wants CRLF.
    let sink = sink
        .sink_map_err(|e: LinesCodecError| Error::transport("write line", e))
        .with(|line: String| future::ready(Ok::<_, Error>(format!("{line}\r"))));
    let stream = stream.map(|item| item.map_err(|e: LinesCodecError| Error::transport("read line", e)));
    Connection {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
    }
}

/// Shared write half of a connection.
///
/// Every write goes through one lock, so lines leave in the order their
/// senders were awaited and never interleave mid-line. Whole responses are
/// ordered per target through [`IrcWriter::lane`].
#[derive(Clone)]
pub struct IrcWriter {
    sink: Arc<Mutex<LineSink>>,
    lanes: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
}

impl std::fmt::Debug for IrcWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrcWriter").finish_non_exhaustive()
    }
}

impl IrcWriter {
    pub fn new(sink: LineSink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            lanes: Arc::default(),
        }
    }

    /// Exclusive send lane for `target`. Hold the guard for a whole
    /// response so two responses to one conversation never interleave.
    pub async fn lane(&self, target: &str) -> OwnedMutexGuard<()> {
        let lane = {
            let mut lanes = self.lanes.write().unwrap_or_else(|e| e.into_inner());
            Arc::clone(lanes.entry(irc_to_lower(target)).or_default())
        };
        lane.lock_owned().await
    }

    pub async fn send(&self, command: &Command) -> Result<()> {
        debug!(line = %command, "irc send");
        self.sink.lock().await.send(command.to_line()).await
    }

    /// Send several commands back to back without other writers slipping
    /// in between.
    pub async fn send_batch(&self, commands: &[Command]) -> Result<()> {
        let mut sink = self.sink.lock().await;
        for command in commands {
            debug!(line = %command, "irc send");
            sink.send(command.to_line()).await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.sink.lock().await.close().await
    }
}
