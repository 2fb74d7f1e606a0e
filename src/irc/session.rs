//! IRC Server Session: one long-lived connection per configured server.
//!
//! Owns registration, NickServ identification, channel membership, CTCP
//! reception, idle reclamation, and the outbound command API. Generalizes
//! the teacher's one-shot `irc_session_inner` (connect, join, request one
//! pack, quit) into a persistent, multi-channel, operator-driven session.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{GlobalConfig, ServerConfig};
use crate::dcc::ctcp;
use crate::dcc::registry::{Registry, TransferKey};
use crate::dcc::transfer::{self, LineSender, TransferParams};
use crate::dcc::PendingAccepts;
use crate::error::BotError;
use crate::irc::wire::Message;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);
const NICKSERV_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TICK: Duration = Duration::from_millis(1000);
const MAX_LINE_PAYLOAD: usize = 510;

/// Operator-driven commands routed to a running session.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Join(String),
    Part(String),
    Msg { target: String, text: String },
    XdccRequest { peer: String, pack: String },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatusKind {
    Connecting,
    Ready,
    Disconnected,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub host: String,
    pub nick: String,
    pub status: SessionStatusKind,
    pub channels: Vec<String>,
}

/// Handle to a running session's task, held by the Supervisor.
#[derive(Clone)]
pub struct SessionHandle {
    host: String,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn join(&self, channel: String) {
        let _ = self.cmd_tx.send(SessionCommand::Join(channel));
    }

    pub fn part(&self, channel: String) {
        let _ = self.cmd_tx.send(SessionCommand::Part(channel));
    }

    pub fn msg(&self, target: String, text: String) {
        let _ = self.cmd_tx.send(SessionCommand::Msg { target, text });
    }

    pub fn xdcc_request(&self, peer: String, pack: String) {
        let _ = self.cmd_tx.send(SessionCommand::XdccRequest { peer, pack });
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().await.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown);
        self.shutdown.cancel();
    }
}

struct ChannelState {
    joined: bool,
    last_activity: Instant,
    /// Peer nicks observed speaking in this channel, used to decide
    /// whether idle reclamation may PART it (spec §4.1, Open Question b:
    /// `also_join` channels are tracked independently of their trigger).
    seen_peers: HashSet<String>,
    /// The `also_join` source channel that caused this one to be joined,
    /// if any. `None` for a channel joined directly (config or operator
    /// `join()`). Used to cascade `part()` onto `also_join` children that
    /// were only entered because of their trigger (spec §4.1).
    triggered_by: Option<String>,
}

impl ChannelState {
    fn fresh() -> Self {
        Self {
            joined: false,
            last_activity: Instant::now(),
            seen_peers: HashSet::new(),
            triggered_by: None,
        }
    }
}

/// Internal loop state, rebuilt on each (re)connect attempt.
struct SessionLoop {
    cfg: ServerConfig,
    global: Arc<GlobalConfig>,
    registry: Arc<Registry>,
    pending_accepts: Arc<PendingAccepts>,
    nick: String,
    channels: HashMap<String, ChannelState>,
    outstanding_requests: HashSet<String>,
    last_activity: Instant,
    snapshot: Arc<RwLock<SessionSnapshot>>,
}

/// Boxed line sender shared with spawned transfer engines: fire-and-forget
/// onto the session's single writer queue, which preserves submission
/// order (spec §5 Ordering guarantees).
struct WriterLineSender(mpsc::UnboundedSender<String>);

impl LineSender for WriterLineSender {
    fn send_line(&self, line: String) {
        let _ = self.0.send(line);
    }
}

trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

/// Spawn a session task for `cfg`, returning a handle the Supervisor can
/// route commands through immediately (the handle works before the
/// connection finishes registering; early commands are queued).
pub fn spawn(
    cfg: ServerConfig,
    global: Arc<GlobalConfig>,
    registry: Arc<Registry>,
    pending_accepts: Arc<PendingAccepts>,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let snapshot = Arc::new(RwLock::new(SessionSnapshot {
        host: cfg.host.clone(),
        nick: cfg.nick.clone(),
        status: SessionStatusKind::Connecting,
        channels: Vec::new(),
    }));

    let handle = SessionHandle {
        host: cfg.host.clone(),
        cmd_tx,
        snapshot: snapshot.clone(),
        shutdown: shutdown.clone(),
    };

    tokio::spawn(run(cfg, global, registry, pending_accepts, cmd_rx, shutdown, snapshot));

    handle
}

async fn run(
    cfg: ServerConfig,
    global: Arc<GlobalConfig>,
    registry: Arc<Registry>,
    pending_accepts: Arc<PendingAccepts>,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    shutdown: CancellationToken,
    snapshot: Arc<RwLock<SessionSnapshot>>,
) {
    let mut reconnected = false;
    loop {
        let result = run_once(&cfg, &global, &registry, &pending_accepts, &mut cmd_rx, &shutdown, &snapshot).await;
        match result {
            Ok(()) => break,
            Err(e) => {
                tracing::warn!(host = %cfg.host, error = %e, "session connection error");
                if shutdown.is_cancelled() || reconnected {
                    snapshot.write().await.status = SessionStatusKind::Disconnected;
                    break;
                }
                reconnected = true;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
    tracing::info!(host = %cfg.host, "session terminated");
}

async fn run_once(
    cfg: &ServerConfig,
    global: &Arc<GlobalConfig>,
    registry: &Arc<Registry>,
    pending_accepts: &Arc<PendingAccepts>,
    cmd_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
    shutdown: &CancellationToken,
    snapshot: &Arc<RwLock<SessionSnapshot>>,
) -> Result<(), BotError> {
    snapshot.write().await.status = SessionStatusKind::Connecting;

    let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port))
        .await
        .map_err(|e| BotError::NetworkUnavailable(e.to_string()))?;
    let local_ip = match tcp.local_addr() {
        Ok(addr) => match addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        },
        Err(_) => Ipv4Addr::UNSPECIFIED,
    };

    let stream: Box<dyn AsyncDuplex> = if cfg.use_tls {
        let mut builder = native_tls::TlsConnector::builder();
        if !cfg.verify_ssl {
            builder.danger_accept_invalid_certs(true);
        }
        let connector = builder
            .build()
            .map_err(|e| BotError::NetworkUnavailable(format!("tls setup: {e}")))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls = connector
            .connect(&cfg.host, tcp)
            .await
            .map_err(|e| BotError::NetworkUnavailable(format!("tls handshake: {e}")))?;
        Box::new(tls)
    } else {
        Box::new(tcp)
    };

    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        let mut write_half = write_half;
        while let Some(line) = writer_rx.recv().await {
            let payload = truncate_to_byte_limit(&line, MAX_LINE_PAYLOAD);
            tracing::debug!("IRC > {}", payload);
            if write_half
                .write_all(format!("{payload}\r\n").as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let nick = if cfg.random_nick {
        format!("{}{}", cfg.nick, random_suffix())
    } else {
        cfg.nick.clone()
    };

    let mut state = SessionLoop {
        cfg: cfg.clone(),
        global: global.clone(),
        registry: registry.clone(),
        pending_accepts: pending_accepts.clone(),
        nick: nick.clone(),
        channels: HashMap::new(),
        outstanding_requests: HashSet::new(),
        last_activity: Instant::now(),
        snapshot: snapshot.clone(),
    };

    let send = |line: String| {
        let _ = writer_tx.send(line);
    };

    send(format!("NICK {}", state.nick));
    send(format!("USER {} 0 * :{}", state.nick, state.nick));

    let registration = register(&mut reader, &mut state, &send);
    let registration_result = timeout(REGISTRATION_TIMEOUT, registration).await;
    let result = match registration_result {
        Ok(Ok(())) => {
            snapshot.write().await.nick = state.nick.clone();
            snapshot.write().await.status = SessionStatusKind::Ready;
            main_loop(
                &mut reader,
                &mut state,
                &send,
                &writer_tx,
                cmd_rx,
                shutdown,
                local_ip,
            )
            .await
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(BotError::AuthFailed("registration timed out".into())),
    };

    drop(writer_tx);
    let _ = writer_task.await;
    result
}

/// Truncate to at most `limit` bytes without splitting a UTF-8 code point,
/// enforcing the 510-byte IRC payload limit (spec §3 invariants).
fn truncate_to_byte_limit(line: &str, limit: usize) -> &str {
    if line.len() <= limit {
        return line;
    }
    let mut end = limit;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

fn random_suffix() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..4)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Drive NICK/USER registration through `001`/nick-collision retries and
/// MOTD end, then (if configured) NickServ identification bounded to 5s,
/// then join the configured channels.
async fn register<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    state: &mut SessionLoop,
    send: &impl Fn(String),
) -> Result<(), BotError> {
    loop {
        let line = read_line(reader).await?;
        let Some(msg) = Message::parse(&line) else { continue };

        match msg.command.as_str() {
            "PING" => {
                let token = msg.trailing.clone().unwrap_or_default();
                send(format!("PONG :{token}"));
            }
            "433" | "436" => {
                if state.cfg.random_nick {
                    state.nick = format!("{}{}", state.cfg.nick, random_suffix());
                    send(format!("NICK {}", state.nick));
                } else {
                    return Err(BotError::AuthFailed(format!(
                        "nick {} rejected: {}",
                        state.nick, msg.command
                    )));
                }
            }
            "376" | "422" => break,
            _ => {}
        }
    }

    if let Some(password) = state.cfg.nickserv_password.clone() {
        send(format!("PRIVMSG NickServ :IDENTIFY {password}"));
        let deadline = Instant::now() + NICKSERV_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, read_line(reader)).await {
                Ok(Ok(line)) => {
                    let Some(msg) = Message::parse(&line) else { continue };
                    if msg.command == "PING" {
                        let token = msg.trailing.clone().unwrap_or_default();
                        send(format!("PONG :{token}"));
                    } else if msg.command == "NOTICE" {
                        let text = msg.trailing.as_deref().unwrap_or("").to_ascii_lowercase();
                        if text.contains("identified") || text.contains("accepted") {
                            break;
                        }
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }
        }
    }

    for channel in state.cfg.channels.clone() {
        join_channel(state, send, &channel, None);
    }

    Ok(())
}

/// Idempotent: a channel already tracked (joined, or join already sent and
/// awaiting its echo) is never re-sent. `triggered_by` records the
/// `also_join` source channel when this join is a cascade, so a later
/// `part()` of the source can cascade too; pass `None` for a directly
/// requested (config or operator) join.
fn join_channel(state: &mut SessionLoop, send: &impl Fn(String), channel: &str, triggered_by: Option<&str>) {
    if state.channels.contains_key(channel) {
        return;
    }
    send(format!("JOIN {channel}"));
    let mut entry = ChannelState::fresh();
    entry.triggered_by = triggered_by.map(|s| s.to_string());
    state.channels.insert(channel.to_string(), entry);
}

async fn read_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<String, BotError> {
    let mut buf = Vec::with_capacity(512);
    let n = reader
        .read_until(b'\n', &mut buf)
        .await
        .map_err(|e| BotError::NetworkUnavailable(e.to_string()))?;
    if n == 0 {
        return Err(BotError::NetworkUnavailable("connection closed by peer".into()));
    }
    Ok(String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string())
}

#[allow(clippy::too_many_arguments)]
async fn main_loop<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    state: &mut SessionLoop,
    send: &impl Fn(String),
    writer_tx: &mpsc::UnboundedSender<String>,
    cmd_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
    shutdown: &CancellationToken,
    local_ip: Ipv4Addr,
) -> Result<(), BotError> {
    let mut idle_tick = tokio::time::interval(IDLE_TICK);
    idle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    sync_snapshot(state).await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                send("QUIT :shutting down".to_string());
                return Ok(());
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCommand::Join(channel)) => {
                        join_channel(state, send, &channel, None);
                        if let Some(extra) = state.cfg.also_join.get(&channel).cloned() {
                            for also in extra {
                                join_channel(state, send, &also, Some(&channel));
                            }
                        }
                        sync_snapshot(state).await;
                    }
                    Some(SessionCommand::Part(channel)) => {
                        if state.channels.get(&channel).is_some_and(|c| c.joined) {
                            send(format!("PART {channel}"));
                            state.channels.remove(&channel);
                            if let Some(extra) = state.cfg.also_join.get(&channel).cloned() {
                                for also in extra {
                                    let only_entered_via_this = state
                                        .channels
                                        .get(&also)
                                        .is_some_and(|c| c.triggered_by.as_deref() == Some(channel.as_str()));
                                    if only_entered_via_this {
                                        send(format!("PART {also}"));
                                        state.channels.remove(&also);
                                    }
                                }
                            }
                        }
                        sync_snapshot(state).await;
                    }
                    Some(SessionCommand::Msg { target, text }) => {
                        dispatch_msg(state, send, &target, &text);
                    }
                    Some(SessionCommand::XdccRequest { peer, pack }) => {
                        state.outstanding_requests.insert(peer.clone());
                        dispatch_msg(state, send, &peer, &format!("xdcc send {pack}"));
                    }
                    Some(SessionCommand::Shutdown) | None => {
                        send("QUIT :shutting down".to_string());
                        return Ok(());
                    }
                }
            }
            _ = idle_tick.tick() => {
                reap_idle_channels(state, send).await;
                if state.channels.is_empty()
                    && !state.registry.has_active(&state.cfg.host).await
                    && state.last_activity.elapsed().as_secs() >= state.global.server_idle_timeout
                {
                    send("QUIT :idle".to_string());
                    return Ok(());
                }
            }
            line = read_line(reader) => {
                let line = line?;
                state.last_activity = Instant::now();
                handle_line(state, send, writer_tx, &line, local_ip).await?;
            }
        }
    }
}

fn dispatch_msg(state: &mut SessionLoop, send: &impl Fn(String), target: &str, text: &str) {
    let rewritten = rewrite_ssend(state, target, text);
    send(format!("PRIVMSG {target} :{rewritten}"));
    if let Some(channel) = state.channels.get_mut(target) {
        channel.last_activity = Instant::now();
    }
}

/// Applies spec §4.1 ssend rewrite: `xdcc send ` -> `xdcc ssend ` when the
/// target channel is in `rewrite_to_ssend`, or the target peer is forced
/// via `ssend_map`.
fn rewrite_ssend(state: &SessionLoop, target: &str, text: &str) -> String {
    if !text.starts_with("xdcc send ") {
        return text.to_string();
    }
    let forced_by_channel = state.cfg.rewrite_to_ssend.contains(target);
    let forced_by_peer = state.global.ssend_map.get(target).copied().unwrap_or(false);
    if forced_by_channel || forced_by_peer {
        format!("xdcc ssend {}", &text["xdcc send ".len()..])
    } else {
        text.to_string()
    }
}

async fn reap_idle_channels(state: &mut SessionLoop, send: &impl Fn(String)) {
    let timeout_secs = state.global.channel_idle_timeout;
    let mut to_part = Vec::new();
    for (channel, info) in state.channels.iter() {
        if !info.joined {
            continue;
        }
        if info.last_activity.elapsed().as_secs() < timeout_secs {
            continue;
        }
        if state
            .registry
            .has_active_for_peers(&state.cfg.host, &info.seen_peers)
            .await
        {
            continue;
        }
        to_part.push(channel.clone());
    }
    if to_part.is_empty() {
        return;
    }
    for channel in &to_part {
        send(format!("PART {channel}"));
        state.channels.remove(channel);
    }
    sync_snapshot(state).await;
}

async fn sync_snapshot(state: &SessionLoop) {
    let mut snap = state.snapshot.write().await;
    snap.nick = state.nick.clone();
    snap.channels = state
        .channels
        .iter()
        .filter(|(_, c)| c.joined)
        .map(|(name, _)| name.clone())
        .collect();
}

async fn handle_line(
    state: &mut SessionLoop,
    send: &impl Fn(String),
    writer_tx: &mpsc::UnboundedSender<String>,
    line: &str,
    local_ip: Ipv4Addr,
) -> Result<(), BotError> {
    let Some(msg) = Message::parse(line) else { return Ok(()) };
    tracing::debug!("IRC < {}", line);

    match msg.command.as_str() {
        "PING" => {
            let token = msg.trailing.clone().unwrap_or_default();
            send(format!("PONG :{token}"));
        }
        "JOIN" => {
            let channel = msg.trailing.clone().or_else(|| msg.params.first().cloned());
            if let (Some(nick), Some(channel)) = (msg.prefix_nick(), channel) {
                if nick == state.nick {
                    let entry = state.channels.entry(channel.clone()).or_insert_with(ChannelState::fresh);
                    entry.joined = true;
                    entry.last_activity = Instant::now();
                    if let Some(extra) = state.cfg.also_join.get(&channel).cloned() {
                        for also in extra {
                            join_channel(state, send, &also, Some(&channel));
                        }
                    }
                } else if let Some(info) = state.channels.get_mut(&channel) {
                    info.seen_peers.insert(nick.to_string());
                }
                sync_snapshot(state).await;
            }
        }
        "PART" | "KICK" => {
            let channel = msg.params.first().cloned();
            let affected_nick = if msg.command == "KICK" {
                msg.params.get(1).cloned()
            } else {
                msg.prefix_nick().map(|s| s.to_string())
            };
            if let (Some(channel), Some(nick)) = (channel, affected_nick) {
                if nick == state.nick {
                    state.channels.remove(&channel);
                    sync_snapshot(state).await;
                }
            }
        }
        "ERROR" => {
            return Err(BotError::NetworkUnavailable(format!(
                "server ERROR: {}",
                msg.trailing.unwrap_or_default()
            )));
        }
        "QUIT" => {
            if msg.prefix_nick() == Some(state.nick.as_str()) {
                return Err(BotError::NetworkUnavailable("received QUIT for own nick".into()));
            }
        }
        "PRIVMSG" => handle_privmsg(state, writer_tx, &msg, local_ip).await,
        _ => {}
    }
    Ok(())
}

async fn handle_privmsg(
    state: &mut SessionLoop,
    writer_tx: &mpsc::UnboundedSender<String>,
    msg: &Message,
    local_ip: Ipv4Addr,
) {
    let Some(target) = msg.params.first() else { return };
    let Some(text) = &msg.trailing else { return };
    let Some(sender) = msg.prefix_nick().map(|s| s.to_string()) else { return };

    if let Some(ctcp_body) = ctcp::unwrap_ctcp(text) {
        handle_ctcp(state, writer_tx, &sender, &ctcp_body, local_ip).await;
        return;
    }

    if target.starts_with('#') {
        if let Some(channel) = state.channels.get_mut(target.as_str()) {
            channel.last_activity = Instant::now();
            channel.seen_peers.insert(sender.clone());
        }
        if state.global.auto_md5sum {
            if let Some(md5) = extract_md5(text) {
                state
                    .registry
                    .mark_md5_advertised(&state.cfg.host, &sender, text, &md5)
                    .await;
            }
        }
    }
}

/// Matches `^[0-9a-f]{32}\b` anywhere in the line (spec §4.1).
fn extract_md5(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    for start in 0..bytes.len() {
        if start + 32 > bytes.len() {
            break;
        }
        let candidate = &text[start..start + 32];
        if candidate.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            let boundary_ok = bytes
                .get(start + 32)
                .map(|b| !b.is_ascii_alphanumeric())
                .unwrap_or(true);
            if boundary_ok {
                return Some(candidate.to_string());
            }
        }
    }
    None
}

async fn handle_ctcp(
    state: &mut SessionLoop,
    writer_tx: &mpsc::UnboundedSender<String>,
    sender: &str,
    body: &str,
    local_ip: Ipv4Addr,
) {
    if let Some(accept) = ctcp::parse_dcc_accept(body) {
        state.pending_accepts.resolve(sender, accept);
        return;
    }

    let Some(offer) = ctcp::parse_dcc_send(body) else { return };
    state.outstanding_requests.remove(sender);

    let key = TransferKey {
        server: state.cfg.host.clone(),
        peer_nick: sender.to_string(),
        filename: offer.filename.clone(),
    };

    let params = TransferParams {
        key,
        offer,
        global: state.global.clone(),
        registry: state.registry.clone(),
        pending_accepts: state.pending_accepts.clone(),
        line_sender: Arc::new(WriterLineSender(writer_tx.clone())),
        local_ip,
    };

    tokio::spawn(async move {
        if let Err(e) = transfer::run(params).await {
            tracing::warn!("transfer failed: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_lines_to_byte_limit() {
        let long = "a".repeat(600);
        let truncated = truncate_to_byte_limit(&long, MAX_LINE_PAYLOAD);
        assert_eq!(truncated.len(), MAX_LINE_PAYLOAD);
    }

    #[test]
    fn short_lines_are_unchanged() {
        assert_eq!(truncate_to_byte_limit("PING :x", MAX_LINE_PAYLOAD), "PING :x");
    }

    #[test]
    fn extracts_md5_with_trailing_text() {
        assert_eq!(
            extract_md5("d41d8cd98f00b204e9800998ecf8427e is the hash"),
            Some("d41d8cd98f00b204e9800998ecf8427e".to_string())
        );
    }

    #[test]
    fn rejects_uppercase_hex() {
        assert_eq!(extract_md5("D41D8CD98F00B204E9800998ECF8427E"), None);
    }

    #[test]
    fn ignores_short_tokens() {
        assert_eq!(extract_md5("deadbeef"), None);
    }

    #[test]
    fn ssend_rewrite_applies_for_configured_channel() {
        let mut cfg = ServerConfig {
            host: "irc.example.org".to_string(),
            ..ServerConfig::default()
        };
        cfg.rewrite_to_ssend.insert("#warez".to_string());
        let state = SessionLoop {
            cfg,
            global: Arc::new(GlobalConfig::default()),
            registry: Registry::new(),
            pending_accepts: Arc::new(PendingAccepts::new()),
            nick: "dccbot".to_string(),
            channels: HashMap::new(),
            outstanding_requests: HashSet::new(),
            last_activity: Instant::now(),
            snapshot: Arc::new(RwLock::new(SessionSnapshot {
                host: "irc.example.org".to_string(),
                nick: "dccbot".to_string(),
                status: SessionStatusKind::Connecting,
                channels: Vec::new(),
            })),
        };
        let rewritten = rewrite_ssend(&state, "#warez", "xdcc send 5");
        assert_eq!(rewritten, "xdcc ssend 5");
    }

    #[test]
    fn ssend_rewrite_leaves_other_channels_untouched() {
        let cfg = ServerConfig {
            host: "irc.example.org".to_string(),
            ..ServerConfig::default()
        };
        let state = SessionLoop {
            cfg,
            global: Arc::new(GlobalConfig::default()),
            registry: Registry::new(),
            pending_accepts: Arc::new(PendingAccepts::new()),
            nick: "dccbot".to_string(),
            channels: HashMap::new(),
            outstanding_requests: HashSet::new(),
            last_activity: Instant::now(),
            snapshot: Arc::new(RwLock::new(SessionSnapshot {
                host: "irc.example.org".to_string(),
                nick: "dccbot".to_string(),
                status: SessionStatusKind::Connecting,
                channels: Vec::new(),
            })),
        };
        let rewritten = rewrite_ssend(&state, "#other", "xdcc send 5");
        assert_eq!(rewritten, "xdcc send 5");
    }
}
