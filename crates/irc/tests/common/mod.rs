//! In-memory IRC server for driving sessions and connectors.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt, channel::mpsc},
    moltis_channels::{ChannelEvent, ChannelEventSink},
    moltis_irc::{
        AgentReply, Error, InboundContext, IrcAccountConfig, IrcAgent, IrcInboundMessage,
        transport::{Connection, Dialer, LineSink, LineStream},
    },
    serde_json::Value,
    tokio::sync::mpsc as tokio_mpsc,
};

const LINE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn account(value: Value) -> Arc<IrcAccountConfig> {
    let mut base = serde_json::json!({
        "host": "irc.test",
        "nick": "moltbot",
        "tls": false,
        "reconnect": { "baseDelayMs": 10, "maxDelayMs": 10, "jitter": 0.0 },
    });
    if let (Some(base), Some(extra)) = (base.as_object_mut(), value.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
    Arc::new(serde_json::from_value(base).unwrap())
}

/// Hands out queued in-memory connections; refuses when none are left.
#[derive(Default)]
pub struct MemoryDialer {
    pending: Mutex<VecDeque<Connection>>,
    dials: AtomicUsize,
}

impl MemoryDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a connection for the next dial and return its server end.
    pub fn accept(&self) -> FakeServer {
        let (client_tx, from_client) = mpsc::unbounded::<String>();
        let (to_client, client_rx) = mpsc::unbounded::<moltis_irc::Result<String>>();
        let sink: LineSink = Box::pin(client_tx.sink_map_err(|e| Error::transport("write", e)));
        let stream: LineStream = Box::pin(client_rx);
        self.pending
            .lock()
            .unwrap()
            .push_back(Connection { sink, stream });
        FakeServer {
            from_client,
            to_client,
        }
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, host: &str, port: u16, _tls: bool) -> moltis_irc::Result<Connection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().unwrap().pop_front().ok_or_else(|| {
            Error::transport(
                format!("connect {host}:{port}"),
                io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            )
        })
    }
}

/// Server end of an in-memory connection.
pub struct FakeServer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<moltis_irc::Result<String>>,
}

impl FakeServer {
    pub fn send(&self, line: &str) {
        self.to_client.unbounded_send(Ok(line.to_string())).unwrap();
    }

    pub async fn recv(&mut self) -> String {
        tokio::time::timeout(LINE_TIMEOUT, self.from_client.next())
            .await
            .expect("timed out waiting for a client line")
            .expect("client closed the connection")
    }

    pub async fn expect(&mut self, line: &str) {
        assert_eq!(self.recv().await, line);
    }

    /// Accept NICK/USER and welcome the client.
    pub async fn welcome(&mut self, nick: &str) {
        self.expect(&format!("NICK {nick}")).await;
        self.expect(&format!("USER {nick} 0 * :moltis")).await;
        self.send(&format!(":irc.test 001 {nick} :Welcome to the test network"));
    }

    /// Close the connection from the server side.
    pub fn hang_up(&self) {
        self.to_client.close_channel();
    }
}

/// Agent that reports every message and answers from a fixed reply.
pub struct RecordingAgent {
    seen: tokio_mpsc::UnboundedSender<(IrcInboundMessage, InboundContext)>,
    reply: fn(&IrcInboundMessage) -> AgentReply,
}

impl RecordingAgent {
    pub fn new(
        reply: fn(&IrcInboundMessage) -> AgentReply,
    ) -> (
        Arc<Self>,
        tokio_mpsc::UnboundedReceiver<(IrcInboundMessage, InboundContext)>,
    ) {
        let (seen, rx) = tokio_mpsc::unbounded_channel();
        (Arc::new(Self { seen, reply }), rx)
    }

    pub fn echo() -> (
        Arc<Self>,
        tokio_mpsc::UnboundedReceiver<(IrcInboundMessage, InboundContext)>,
    ) {
        Self::new(|m| AgentReply::Text(format!("echo: {}", m.text)))
    }
}

#[async_trait]
impl IrcAgent for RecordingAgent {
    async fn handle(
        &self,
        _account_id: &str,
        message: IrcInboundMessage,
        context: InboundContext,
    ) -> anyhow::Result<AgentReply> {
        let reply = (self.reply)(&message);
        let _ = self.seen.send((message, context));
        Ok(reply)
    }
}

/// Event sink forwarding into a channel.
pub struct ChannelEvents(pub tokio_mpsc::UnboundedSender<ChannelEvent>);

impl ChannelEvents {
    pub fn new() -> (Arc<Self>, tokio_mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        (Arc::new(Self(tx)), rx)
    }
}

#[async_trait]
impl ChannelEventSink for ChannelEvents {
    async fn emit(&self, event: ChannelEvent) {
        let _ = self.0.send(event);
    }
}

pub async fn next_message(
    rx: &mut tokio_mpsc::UnboundedReceiver<(IrcInboundMessage, InboundContext)>,
) -> (IrcInboundMessage, InboundContext) {
    tokio::time::timeout(LINE_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for the agent")
        .expect("agent dropped")
}
