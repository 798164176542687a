#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Fake MPD daemon for integration testing
//!
//! Speaks enough of the text protocol over loopback TCP to drive every
//! client path: greeting, `password`, `idle`/`noidle` with per-connection
//! pending events, channels, stickers, stored playlists, and a kill switch
//! that drops every connection at once.
//!
//! Like the real daemon, changes that happen while a connection is not
//! idling are remembered and reported by its next matching `idle`, and a
//! `noidle` outside of `idle` is ignored.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

pub const GREETING: &str = "OK MPD 0.23.5";

type Lines = FramedRead<tokio::net::tcp::OwnedReadHalf, LinesCodec>;
type Writer = FramedWrite<tokio::net::tcp::OwnedWriteHalf, LinesCodec>;

/// Per-connection daemon state
#[derive(Debug, Default)]
struct ClientState {
    /// Changed subsystems not yet reported, in first-seen order
    pending: Vec<String>,
    subscriptions: HashSet<String>,
    messages: Vec<(String, String)>,
    notify: Arc<Notify>,
}

/// Shared daemon state
#[derive(Debug, Default)]
pub struct MockMpdState {
    clients: HashMap<usize, ClientState>,
    next_client: usize,
    /// `(uri, name) -> value`
    stickers: BTreeMap<(String, String), String>,
    playlists: BTreeMap<String, Vec<String>>,
    /// Every line received, tagged with its connection
    log: Vec<(usize, String)>,
}

impl MockMpdState {
    /// Mark `subsystem` changed for every connection accepted by `wanted`
    fn emit(&mut self, subsystem: &str, wanted: impl Fn(&ClientState) -> bool) {
        for client in self.clients.values_mut() {
            if !wanted(client) {
                continue;
            }
            if !client.pending.iter().any(|s| s == subsystem) {
                client.pending.push(subsystem.to_string());
            }
            client.notify.notify_one();
        }
    }
}

/// Fake MPD server
pub struct MockMpdServer {
    addr: SocketAddr,
    state: Arc<Mutex<MockMpdState>>,
    kill: CancellationToken,
    handle: JoinHandle<()>,
}

impl MockMpdServer {
    /// Start a server without a password on a random port
    pub async fn start() -> Self {
        Self::start_with_password(None).await
    }

    /// Start a server that requires `password` for everything but `ping`
    pub async fn start_with_password(password: Option<&str>) -> Self {
        let state = Arc::new(Mutex::new(MockMpdState::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let kill = CancellationToken::new();
        let password = password.map(str::to_string);

        let state_clone = Arc::clone(&state);
        let kill_clone = kill.clone();
        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = kill_clone.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&state_clone);
                        let kill = kill_clone.clone();
                        let password = password.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, state, password, kill).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            addr,
            state,
            kill,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Report `subsystem` as changed to every connection
    pub fn trigger(&self, subsystem: &str) {
        self.state.lock().unwrap().emit(subsystem, |_| true);
    }

    /// Drop every connection and stop accepting new ones
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Every line received so far
    pub fn commands(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.log.iter().map(|(_, line)| line.clone()).collect()
    }

    /// How many times exactly `line` was received
    pub fn count(&self, line: &str) -> usize {
        self.commands().iter().filter(|l| *l == line).count()
    }

    /// Connections currently open
    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().clients.len()
    }

    pub fn set_sticker(&self, uri: &str, name: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .stickers
            .insert((uri.to_string(), name.to_string()), value.to_string());
    }

    pub fn sticker(&self, uri: &str, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .stickers
            .get(&(uri.to_string(), name.to_string()))
            .cloned()
    }

    pub fn stop(self) {
        self.kill.cancel();
        self.handle.abort();
    }
}

/// What an `idle` should do next
enum IdleStep {
    Report(Vec<String>),
    Wait(Arc<Notify>),
    Gone,
}

fn idle_step(state: &Mutex<MockMpdState>, id: usize, filter: &[String]) -> IdleStep {
    let mut state = state.lock().unwrap();
    let Some(client) = state.clients.get_mut(&id) else {
        return IdleStep::Gone;
    };

    let ready: Vec<String> = client
        .pending
        .iter()
        .filter(|s| filter.is_empty() || filter.contains(s))
        .cloned()
        .collect();

    if ready.is_empty() {
        IdleStep::Wait(Arc::clone(&client.notify))
    } else {
        client.pending.retain(|s| !ready.contains(s));
        IdleStep::Report(ready)
    }
}

fn log_line(state: &Mutex<MockMpdState>, id: usize, line: &str) {
    state.lock().unwrap().log.push((id, line.to_string()));
}

async fn reply(writer: &mut Writer, lines: Vec<String>) -> bool {
    writer.send(lines.join("\n")).await.is_ok()
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<Mutex<MockMpdState>>,
    password: Option<String>,
    kill: CancellationToken,
) {
    let id = {
        let mut state = state.lock().unwrap();
        let id = state.next_client;
        state.next_client += 1;
        state.clients.insert(id, ClientState::default());
        id
    };

    let (read_half, write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new());
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());
    let mut authed = password.is_none();

    if writer.send(GREETING).await.is_ok() {
        loop {
            let line = tokio::select! {
                _ = kill.cancelled() => break,
                line = lines.next() => match line {
                    Some(Ok(line)) => line,
                    _ => break,
                },
            };
            log_line(&state, id, &line);

            let args = tokenize(&line);
            match args.first().map(String::as_str) {
                Some("close") => break,
                // Not idling; the real daemon ignores it too
                Some("noidle") => continue,
                Some("idle") if authed => {
                    if !idle(&mut lines, &mut writer, &state, id, &args[1..], &kill).await {
                        break;
                    }
                }
                _ => {
                    let response = {
                        let mut state = state.lock().unwrap();
                        execute(&mut state, id, &args, password.as_deref(), &mut authed)
                    };
                    if !reply(&mut writer, response).await {
                        break;
                    }
                }
            }
        }
    }

    state.lock().unwrap().clients.remove(&id);
}

/// Block until a matching change or `noidle`; false when the connection ends
async fn idle(
    lines: &mut Lines,
    writer: &mut Writer,
    state: &Mutex<MockMpdState>,
    id: usize,
    filter: &[String],
    kill: &CancellationToken,
) -> bool {
    loop {
        let notify = match idle_step(state, id, filter) {
            IdleStep::Report(changed) => {
                let mut response: Vec<String> =
                    changed.iter().map(|s| format!("changed: {}", s)).collect();
                response.push("OK".to_string());
                return reply(writer, response).await;
            }
            IdleStep::Wait(notify) => notify,
            IdleStep::Gone => return false,
        };

        tokio::select! {
            _ = kill.cancelled() => return false,
            _ = notify.notified() => continue,
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    log_line(state, id, &line);
                    if line != "noidle" {
                        // Anything else during idle is a protocol violation
                        return false;
                    }
                    return reply(writer, vec!["OK".to_string()]).await;
                }
                _ => return false,
            },
        }
    }
}

/// Split a command line into words, honoring double quotes and backslashes
pub fn tokenize(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek() == Some(&' ') {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut arg = String::new();
        if first == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            arg.push(escaped);
                        }
                    }
                    '"' => break,
                    other => arg.push(other),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ' ' {
                    break;
                }
                arg.push(c);
                chars.next();
            }
        }
        args.push(arg);
    }

    args
}

fn ok(mut lines: Vec<String>) -> Vec<String> {
    lines.push("OK".to_string());
    lines
}

fn ack(code: u32, command: &str, message: &str) -> Vec<String> {
    vec![format!("ACK [{}@0] {{{}}} {}", code, command, message)]
}

fn execute(
    state: &mut MockMpdState,
    id: usize,
    args: &[String],
    password: Option<&str>,
    authed: &mut bool,
) -> Vec<String> {
    let Some(name) = args.first().map(String::as_str) else {
        return ack(5, "", "No command given");
    };
    let arg = |i: usize| args.get(i).map(String::as_str);
    let wrong_args = || ack(2, name, "wrong number of arguments");

    if name == "password" {
        return match (arg(1), password) {
            (Some(given), Some(expected)) if given == expected => {
                *authed = true;
                ok(vec![])
            }
            (Some(_), None) => ok(vec![]),
            _ => ack(3, "password", "incorrect password"),
        };
    }

    if !*authed && name != "ping" {
        return ack(4, name, &format!("you don't have permission for \"{}\"", name));
    }

    match name {
        "ping" => ok(vec![]),
        "status" => ok(vec![
            "volume: 50".to_string(),
            "repeat: 0".to_string(),
            "state: play".to_string(),
            "time: 12:240".to_string(),
        ]),
        "currentsong" => ok(vec![
            "file: music/track.flac".to_string(),
            "Title: Track".to_string(),
            "Artist: Artist".to_string(),
        ]),
        "subscribe" => {
            let Some(channel) = arg(1) else {
                return wrong_args();
            };
            let client = state.clients.get_mut(&id).unwrap();
            if !client.subscriptions.insert(channel.to_string()) {
                return ack(56, name, "already subscribed to this channel");
            }
            state.emit("subscription", |_| true);
            ok(vec![])
        }
        "unsubscribe" => {
            let Some(channel) = arg(1) else {
                return wrong_args();
            };
            let client = state.clients.get_mut(&id).unwrap();
            if !client.subscriptions.remove(channel) {
                return ack(50, name, "not subscribed to this channel");
            }
            state.emit("subscription", |_| true);
            ok(vec![])
        }
        "channels" => {
            let channels: BTreeSet<&String> = state
                .clients
                .values()
                .flat_map(|c| c.subscriptions.iter())
                .collect();
            ok(channels.iter().map(|c| format!("channel: {}", c)).collect())
        }
        "sendmessage" => {
            let (Some(channel), Some(text)) = (arg(1), arg(2)) else {
                return wrong_args();
            };
            let mut delivered = false;
            for client in state.clients.values_mut() {
                if client.subscriptions.contains(channel) {
                    client.messages.push((channel.to_string(), text.to_string()));
                    delivered = true;
                }
            }
            if !delivered {
                return ack(50, name, "nobody is subscribed to this channel");
            }
            state.emit("message", |c| c.subscriptions.contains(channel));
            ok(vec![])
        }
        "readmessages" => {
            let client = state.clients.get_mut(&id).unwrap();
            let lines = client
                .messages
                .drain(..)
                .flat_map(|(channel, message)| {
                    [format!("channel: {}", channel), format!("message: {}", message)]
                })
                .collect();
            ok(lines)
        }
        "sticker" => sticker(state, args),
        "listplaylists" => ok(state
            .playlists
            .keys()
            .flat_map(|name| {
                [
                    format!("playlist: {}", name),
                    "Last-Modified: 2013-06-01T20:15:00Z".to_string(),
                ]
            })
            .collect()),
        "save" => {
            let Some(playlist) = arg(1) else {
                return wrong_args();
            };
            if state.playlists.contains_key(playlist) {
                return ack(56, name, "Playlist already exists");
            }
            state
                .playlists
                .insert(playlist.to_string(), vec!["music/track.flac".to_string()]);
            state.emit("stored_playlist", |_| true);
            ok(vec![])
        }
        "rm" | "playlistclear" | "listplaylist" => {
            let Some(playlist) = arg(1) else {
                return wrong_args();
            };
            let Some(songs) = state.playlists.get(playlist).cloned() else {
                return ack(50, name, "No such playlist");
            };
            match name {
                "rm" => {
                    state.playlists.remove(playlist);
                }
                "playlistclear" => {
                    state.playlists.insert(playlist.to_string(), Vec::new());
                }
                _ => return ok(songs.iter().map(|s| format!("file: {}", s)).collect()),
            }
            state.emit("stored_playlist", |_| true);
            ok(vec![])
        }
        "playlistadd" => {
            let (Some(playlist), Some(uri)) = (arg(1), arg(2)) else {
                return wrong_args();
            };
            state
                .playlists
                .entry(playlist.to_string())
                .or_default()
                .push(uri.to_string());
            state.emit("stored_playlist", |_| true);
            ok(vec![])
        }
        other => ack(5, "", &format!("unknown command \"{}\"", other)),
    }
}

fn sticker(state: &mut MockMpdState, args: &[String]) -> Vec<String> {
    let arg = |i: usize| args.get(i).map(String::as_str);

    if arg(2) != Some("song") {
        return ack(2, "sticker", "unknown sticker domain");
    }

    match (arg(1), arg(3), arg(4)) {
        (Some("get"), Some(uri), Some(name)) => {
            match state.stickers.get(&(uri.to_string(), name.to_string())) {
                Some(value) => ok(vec![format!("sticker: {}={}", name, value)]),
                None => ack(50, "sticker", "no such sticker"),
            }
        }
        (Some("set"), Some(uri), Some(name)) => {
            let Some(value) = arg(5) else {
                return ack(2, "sticker", "wrong number of arguments");
            };
            state
                .stickers
                .insert((uri.to_string(), name.to_string()), value.to_string());
            state.emit("sticker", |_| true);
            ok(vec![])
        }
        (Some("find"), Some(uri), Some(name)) => ok(state
            .stickers
            .iter()
            .filter(|((u, n), _)| u.starts_with(uri) && n == name)
            .flat_map(|((u, n), v)| [format!("file: {}", u), format!("sticker: {}={}", n, v)])
            .collect()),
        _ => ack(2, "sticker", "bad request"),
    }
}
