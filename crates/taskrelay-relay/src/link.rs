//! One persistent connection to one relay.
//!
//! A [`RelayLink`] owns a background task that keeps a WebSocket open to its
//! relay. Outbound frames sent while the socket is down are queued and
//! flushed on the next open; registered subscriptions are replayed as fresh
//! `REQ` frames on every open because relays forget a client's
//! subscriptions when it disconnects. After a close the task waits the
//! reconnect delay and tries again. Nothing here reports connection errors
//! to callers.

use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use taskrelay_protocol::{ClientMessage, Filter, RelayMessage};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Link tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Delay before reconnecting after a close or failed connect.
    pub reconnect_delay: Duration,
    /// Upper bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Frames kept while disconnected; the oldest is dropped past this.
    pub max_queued: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(2500),
            connect_timeout: Duration::from_secs(10),
            max_queued: 1000,
        }
    }
}

/// Connection state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Open,
    Closed,
    Shutdown,
}

/// A frame received from a relay, tagged with its origin.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub relay_url: String,
    pub message: RelayMessage,
}

enum LinkCommand {
    Send(String),
    Subscribe { id: String, filters: Vec<Filter> },
    Unsubscribe(String),
    Ensure,
    Shutdown,
}

enum SessionEnd {
    Disconnected,
    Shutdown,
}

/// Handle to a relay connection task.
pub struct RelayLink {
    url: String,
    commands: mpsc::UnboundedSender<LinkCommand>,
    status: watch::Receiver<LinkStatus>,
    task: JoinHandle<()>,
}

impl RelayLink {
    /// Spawn the connection task. Must be called inside a tokio runtime.
    pub fn spawn(
        url: impl Into<String>,
        config: RelayConfig,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        let url = url.into();
        let (commands, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(LinkStatus::Connecting);
        let task = tokio::spawn(run_link(url.clone(), config, rx, inbound, status_tx));
        Self {
            url,
            commands,
            status,
            task,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Whether the background task is still running.
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished() && !self.commands.is_closed()
    }

    /// Open the connection now if it is down; no-op when open.
    pub fn ensure(&self) {
        let _ = self.commands.send(LinkCommand::Ensure);
    }

    /// Send a frame if open, queue it otherwise.
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        let frame = message.to_json()?;
        self.commands
            .send(LinkCommand::Send(frame))
            .map_err(|_| Error::LinkClosed(self.url.clone()))
    }

    /// Register a subscription; it is sent now and replayed on every reconnect.
    pub fn subscribe(&self, id: &str, filters: Vec<Filter>) -> Result<()> {
        self.commands
            .send(LinkCommand::Subscribe {
                id: id.to_string(),
                filters,
            })
            .map_err(|_| Error::LinkClosed(self.url.clone()))
    }

    /// Forget a subscription and send `CLOSE` if connected.
    pub fn unsubscribe(&self, id: &str) {
        let _ = self.commands.send(LinkCommand::Unsubscribe(id.to_string()));
    }

    /// Wait until the link reports `Open`, up to `timeout`.
    pub async fn wait_open(&self, timeout: Duration) -> bool {
        let mut status = self.status.clone();
        tokio::time::timeout(timeout, async {
            loop {
                if *status.borrow_and_update() == LinkStatus::Open {
                    return true;
                }
                if status.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Stop the task and close the socket.
    pub fn close(&self) {
        let _ = self.commands.send(LinkCommand::Shutdown);
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Per-link state that survives reconnects.
struct LinkState {
    queue: VecDeque<String>,
    subscriptions: BTreeMap<String, Vec<Filter>>,
    max_queued: usize,
}

impl LinkState {
    fn enqueue(&mut self, url: &str, frame: String) {
        if self.queue.len() >= self.max_queued {
            self.queue.pop_front();
            warn!("Relay {} outbound queue full, dropping oldest frame", url);
        }
        self.queue.push_back(frame);
    }

    /// Apply a command while disconnected. Returns false on shutdown.
    fn buffer(&mut self, url: &str, command: LinkCommand) -> bool {
        match command {
            LinkCommand::Send(frame) => self.enqueue(url, frame),
            LinkCommand::Subscribe { id, filters } => {
                self.subscriptions.insert(id, filters);
            }
            LinkCommand::Unsubscribe(id) => {
                self.subscriptions.remove(&id);
            }
            LinkCommand::Ensure => {}
            LinkCommand::Shutdown => return false,
        }
        true
    }
}

async fn run_link(
    url: String,
    config: RelayConfig,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    inbound: mpsc::UnboundedSender<Inbound>,
    status: watch::Sender<LinkStatus>,
) {
    let mut state = LinkState {
        queue: VecDeque::new(),
        subscriptions: BTreeMap::new(),
        max_queued: config.max_queued.max(1),
    };

    'outer: loop {
        status.send_replace(LinkStatus::Connecting);
        debug!("Connecting to relay {}", url);

        match tokio::time::timeout(config.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((socket, _))) => {
                info!("Connected to relay {}", url);
                status.send_replace(LinkStatus::Open);
                match run_session(&url, socket, &mut commands, &mut state, &inbound).await {
                    SessionEnd::Shutdown => break 'outer,
                    SessionEnd::Disconnected => info!("Relay {} disconnected", url),
                }
            }
            Ok(Err(e)) => debug!("Failed to connect to relay {}: {}", url, e),
            Err(_) => debug!("Connecting to relay {} timed out", url),
        }

        status.send_replace(LinkStatus::Closed);

        // Buffer commands during the backoff; `ensure` ends it early.
        let wait = tokio::time::sleep(config.reconnect_delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                command = commands.recv() => match command {
                    None => break 'outer,
                    Some(LinkCommand::Ensure) => break,
                    Some(command) => {
                        if !state.buffer(&url, command) {
                            break 'outer;
                        }
                    }
                },
            }
        }
    }

    status.send_replace(LinkStatus::Shutdown);
    debug!("Relay link {} stopped", url);
}

async fn run_session(
    url: &str,
    socket: Socket,
    commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
    state: &mut LinkState,
    inbound: &mpsc::UnboundedSender<Inbound>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();

    // Flush what queued up while we were away, then replay subscriptions.
    while let Some(frame) = state.queue.pop_front() {
        if let Err(e) = sink.send(Message::Text(frame.clone())).await {
            debug!("Relay {} send failed during flush: {}", url, e);
            state.queue.push_front(frame);
            return SessionEnd::Disconnected;
        }
    }
    for (id, filters) in &state.subscriptions {
        let req = ClientMessage::Req {
            subscription_id: id.clone(),
            filters: filters.clone(),
        };
        let frame = match req.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping unencodable subscription {}: {}", id, e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(frame)).await {
            debug!("Relay {} send failed during replay: {}", url, e);
            return SessionEnd::Disconnected;
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => {
                let frame = match command {
                    None | Some(LinkCommand::Shutdown) => {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                    Some(LinkCommand::Ensure) => continue,
                    Some(LinkCommand::Send(frame)) => frame,
                    Some(LinkCommand::Subscribe { id, filters }) => {
                        let req = ClientMessage::Req { subscription_id: id.clone(), filters: filters.clone() };
                        state.subscriptions.insert(id, filters);
                        match req.to_json() {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("Dropping unencodable subscription: {}", e);
                                continue;
                            }
                        }
                    }
                    Some(LinkCommand::Unsubscribe(id)) => {
                        if state.subscriptions.remove(&id).is_none() {
                            continue;
                        }
                        match ClientMessage::Close(id).to_json() {
                            Ok(frame) => frame,
                            Err(_) => continue,
                        }
                    }
                };
                if let Err(e) = sink.send(Message::Text(frame.clone())).await {
                    debug!("Relay {} send failed: {}", url, e);
                    state.enqueue(url, frame);
                    return SessionEnd::Disconnected;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(url, &text, inbound),
                Some(Ok(Message::Ping(data))) => {
                    if sink.send(Message::Pong(data)).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Relay {} closed connection: {:?}", url, frame);
                    return SessionEnd::Disconnected;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Relay {} WebSocket error: {}", url, e);
                    return SessionEnd::Disconnected;
                }
                None => return SessionEnd::Disconnected,
            },
        }
    }
}

fn handle_text(url: &str, text: &str, inbound: &mpsc::UnboundedSender<Inbound>) {
    let message = match RelayMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            trace!("Ignoring frame from {}: {}", url, e);
            return;
        }
    };
    match &message {
        RelayMessage::Notice(notice) => info!("Relay {} notice: {}", url, notice),
        RelayMessage::Ok {
            event_id,
            accepted: false,
            message,
        } => warn!("Relay {} rejected event {}: {}", url, event_id, message),
        _ => {}
    }
    let _ = inbound.send(Inbound {
        relay_url: url.to_string(),
        message,
    });
}
