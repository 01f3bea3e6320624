#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use {
    common::{MemoryDialer, RecordingAgent, account, next_message},
    moltis_channels::{
        MemoryMessageLog, NoPairings, StreamEvent, message_log::MessageLog, stream_channel,
    },
    moltis_irc::{
        AccountConnector, AgentReply, ConnectorDeps, IrcAgent, mention::Mention,
    },
    serde_json::{Value, json},
    tokio::{
        task::JoinHandle,
        time::{Duration, Instant},
    },
    tokio_util::sync::CancellationToken,
};

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<moltis_irc::Result<()>>,
}

impl Running {
    async fn stop(self) {
        self.cancel.cancel();
        self.task.await.unwrap().unwrap();
    }
}

fn start(
    config: Value,
    dialer: &Arc<MemoryDialer>,
    agent: Arc<dyn IrcAgent>,
    log: &Arc<MemoryMessageLog>,
) -> Running {
    let message_log: Arc<dyn MessageLog> = Arc::clone(log) as Arc<dyn MessageLog>;
    let connector = AccountConnector::new("main", account(config), ConnectorDeps {
        dialer: Arc::clone(dialer) as _,
        agent,
        pairings: Arc::new(NoPairings),
        message_log: Some(message_log),
        event_sink: None,
    });
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move { connector.run(token).await });
    Running { cancel, task }
}

#[tokio::test]
async fn dm_allowlist_forwards_only_listed_senders() {
    let dialer = MemoryDialer::new();
    let mut server = dialer.accept();
    let (agent, mut seen) = RecordingAgent::echo();
    let log = Arc::new(MemoryMessageLog::new(50));
    let running = start(
        json!({ "dmPolicy": "allowlist", "allowFrom": ["alice"], "channels": ["#moltis"] }),
        &dialer,
        agent,
        &log,
    );

    server.welcome("moltbot").await;
    server.expect("JOIN #moltis").await;
    server.send(":bob!~bob@example.net PRIVMSG moltbot :let me in");
    server.send(":alice!~alice@example.org PRIVMSG moltbot :hello there");

    let (message, context) = next_message(&mut seen).await;
    assert_eq!(message.sender_nick, "alice");
    assert_eq!(message.target, "alice");
    assert_eq!(message.raw_target.as_deref(), Some("moltbot"));
    assert_eq!(message.text, "hello there");
    assert!(!message.is_group);
    assert_eq!(context.mention, Some(Mention::Direct));
    server.expect("PRIVMSG alice :echo: hello there").await;

    let entries = log.entries("main");
    assert_eq!(entries.len(), 2);
    let bob = entries.iter().find(|e| e.peer_id == "bob").unwrap();
    assert!(!bob.access_granted);
    let alice = entries.iter().find(|e| e.peer_id == "alice").unwrap();
    assert!(alice.access_granted);

    running.cancel.cancel();
    server.expect("QUIT :shutting down").await;
    running.task.await.unwrap().unwrap();
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn group_mention_is_stripped_and_reply_chunked() {
    let dialer = MemoryDialer::new();
    let mut server = dialer.accept();
    let (agent, mut seen) =
        RecordingAgent::new(|_| AgentReply::Text("abcdefghijklmnopqrstuvwxy".into()));
    let log = Arc::new(MemoryMessageLog::new(50));
    let running = start(
        json!({
            "groupPolicy": "open",
            "channels": ["#moltis"],
            "historyLimit": 5,
            "textChunkLimit": 20,
        }),
        &dialer,
        agent,
        &log,
    );

    server.welcome("moltbot").await;
    server.expect("JOIN #moltis").await;
    server.send(":carol!~carol@example.net PRIVMSG #moltis :just chatting");
    server.send(":alice!~alice@example.org PRIVMSG #moltis :MoltBot, summarize please");

    let (message, context) = next_message(&mut seen).await;
    assert_eq!(message.target, "#moltis");
    assert!(message.is_group);
    assert_eq!(message.text, "summarize please");
    assert_eq!(context.mention, Some(Mention::Nick));
    assert_eq!(context.effective.history_limit, Some(5));
    let history: Vec<_> = context.history.iter().map(|e| e.body.as_str()).collect();
    assert_eq!(history, ["just chatting"]);

    server.expect("PRIVMSG #moltis :abcdefghijklmnopqrst").await;
    server.expect("PRIVMSG #moltis :uvwxy").await;

    running.stop().await;
}

#[tokio::test]
async fn disabled_channel_is_neither_forwarded_nor_logged() {
    let dialer = MemoryDialer::new();
    let mut server = dialer.accept();
    let (agent, mut seen) = RecordingAgent::echo();
    let log = Arc::new(MemoryMessageLog::new(50));
    let running = start(
        json!({
            "groupPolicy": "open",
            "dmPolicy": "open",
            "groups": { "#quiet": { "enabled": false } },
        }),
        &dialer,
        agent,
        &log,
    );

    server.welcome("moltbot").await;
    server.send(":alice!~alice@example.org PRIVMSG #quiet :moltbot: are you there");
    server.send(":alice!~alice@example.org PRIVMSG #moltis :no mention here");
    server.send(":alice!~alice@example.org PRIVMSG moltbot :direct");

    let (message, _) = next_message(&mut seen).await;
    assert_eq!(message.text, "direct");
    server.expect("PRIVMSG alice :echo: direct").await;

    let entries = log.entries("main");
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.chat_id != "#quiet"));
    let unaddressed = entries.iter().find(|e| e.chat_id == "#moltis").unwrap();
    assert!(unaddressed.access_granted);

    running.stop().await;
}

#[tokio::test]
async fn own_echoes_and_ctcp_are_ignored() {
    let dialer = MemoryDialer::new();
    let mut server = dialer.accept();
    let (agent, mut seen) = RecordingAgent::echo();
    let log = Arc::new(MemoryMessageLog::new(50));
    let running = start(json!({ "dmPolicy": "open", "groupPolicy": "open" }), &dialer, agent, &log);

    server.welcome("moltbot").await;
    server.send(":moltbot!~moltbot@example.com PRIVMSG #moltis :moltbot: talking to myself");
    server.send(":alice!~alice@example.org PRIVMSG moltbot :\u{1}VERSION\u{1}");
    server.send(":alice!~alice@example.org PRIVMSG moltbot :real question");

    let (message, _) = next_message(&mut seen).await;
    assert_eq!(message.text, "real question");
    server.expect("PRIVMSG alice :echo: real question").await;
    assert_eq!(log.entries("main").len(), 1);

    running.stop().await;
}

#[tokio::test]
async fn answers_ping_and_reconnects_after_hang_up() {
    let dialer = MemoryDialer::new();
    let mut first = dialer.accept();
    let mut second = dialer.accept();
    let (agent, mut seen) = RecordingAgent::echo();
    let log = Arc::new(MemoryMessageLog::new(50));
    let running = start(
        json!({ "dmPolicy": "open", "channels": ["#moltis"] }),
        &dialer,
        agent,
        &log,
    );

    first.welcome("moltbot").await;
    first.expect("JOIN #moltis").await;
    first.send("PING :irc.test");
    first.expect("PONG :irc.test").await;
    first.hang_up();

    second.welcome("moltbot").await;
    second.expect("JOIN #moltis").await;
    second.send(":alice!~alice@example.org PRIVMSG moltbot :still there?");
    next_message(&mut seen).await;
    second.expect("PRIVMSG alice :echo: still there?").await;
    assert_eq!(dialer.dials(), 2);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn flapping_server_is_redialed_with_growing_delay() {
    let dialer = MemoryDialer::new();
    let mut servers = [dialer.accept(), dialer.accept(), dialer.accept()];
    let (agent, _seen) = RecordingAgent::echo();
    let log = Arc::new(MemoryMessageLog::new(50));
    let running = start(
        json!({
            "dmPolicy": "open",
            "reconnect": { "baseDelayMs": 1000, "maxDelayMs": 8000, "jitter": 0.0 },
        }),
        &dialer,
        agent,
        &log,
    );

    servers[0].welcome("moltbot").await;
    servers[0].hang_up();
    let dropped = Instant::now();
    servers[1].welcome("moltbot").await;
    assert!(dropped.elapsed() >= Duration::from_millis(1000));
    assert_eq!(dialer.dials(), 2);

    servers[1].hang_up();
    let dropped = Instant::now();
    servers[2].welcome("moltbot").await;
    assert!(dropped.elapsed() >= Duration::from_millis(2000));
    assert_eq!(dialer.dials(), 3);

    running.stop().await;
}

#[tokio::test]
async fn streamed_reply_is_coalesced_into_one_line() {
    let dialer = MemoryDialer::new();
    let mut server = dialer.accept();
    let (agent, mut seen) = RecordingAgent::new(|_| {
        let (tx, rx) = stream_channel(8);
        tokio::spawn(async move {
            for event in [
                StreamEvent::Delta("hello ".into()),
                StreamEvent::Delta("world".into()),
                StreamEvent::Done,
            ] {
                tx.send(event).await.unwrap();
            }
        });
        AgentReply::Stream(rx)
    });
    let log = Arc::new(MemoryMessageLog::new(50));
    let running = start(json!({ "dmPolicy": "open" }), &dialer, agent, &log);

    server.welcome("moltbot").await;
    server.send(":alice!~alice@example.org PRIVMSG moltbot :stream it");
    next_message(&mut seen).await;
    server.expect("PRIVMSG alice :hello world").await;

    running.stop().await;
}

#[tokio::test]
async fn concurrent_streamed_replies_to_one_target_do_not_interleave() {
    let dialer = MemoryDialer::new();
    let mut server = dialer.accept();
    let (agent, mut seen) = RecordingAgent::new(|m| {
        let tag = m.text.clone();
        let (tx, rx) = stream_channel(8);
        tokio::spawn(async move {
            tx.send(StreamEvent::Delta(format!("{tag}1"))).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            tx.send(StreamEvent::Delta(format!("{tag}2"))).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            tx.send(StreamEvent::Done).await.unwrap();
        });
        AgentReply::Stream(rx)
    });
    let log = Arc::new(MemoryMessageLog::new(50));
    let running = start(
        json!({
            "dmPolicy": "open",
            "blockStreaming": true,
            "blockStreamingCoalesce": { "minChars": 2, "idleMs": 1000 },
        }),
        &dialer,
        agent,
        &log,
    );

    server.welcome("moltbot").await;
    server.send(":alice!~alice@example.org PRIVMSG moltbot :a");
    server.send(":alice!~alice@example.org PRIVMSG moltbot :b");
    next_message(&mut seen).await;
    next_message(&mut seen).await;

    let mut lines = Vec::new();
    for _ in 0..4 {
        lines.push(server.recv().await);
    }
    let texts: Vec<&str> = lines
        .iter()
        .map(|l| l.strip_prefix("PRIVMSG alice :").unwrap())
        .collect();
    assert!(
        texts == ["a1", "a2", "b1", "b2"] || texts == ["b1", "b2", "a1", "a2"],
        "replies interleaved: {texts:?}"
    );

    running.stop().await;
}
