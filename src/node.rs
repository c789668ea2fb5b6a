//! # Node
//!
//! A [`Node`] runs one [`Switch`] on a UDP socket inside a tokio task.
//!
//! ```ignore
//! let node = Node::bind("0.0.0.0:0").await?;
//! for seed in load_seeds("seeds.json")? {
//!     node.add_seed(seed).await?;
//! }
//! node.online().await?;
//!
//! let mut incoming = node.listen("chat", ChannelKind::Reliable).await?;
//! let mut channel = node.open_channel(peer, "chat", ChannelKind::Reliable).await?;
//! channel.send(Payload::new("hello")).await?;
//! while let Some(Ok(payload)) = channel.recv().await {
//!     println!("{:?}", payload.body);
//! }
//! ```
//!
//! ## Actor Layout
//!
//! | Piece | Owns | Role |
//! |-------|------|------|
//! | [`Node`] | command sender | cheap handle used by the application |
//! | `NodeActor` | switch, socket, routes | single task serialising all switch access |
//! | [`Channel`] | per-channel receiver | one conversation with one peer |
//!
//! The actor wakes on a datagram, a command, or the switch's next deadline.
//! After every wakeup it drains switch events and routes them to channel
//! handles, listeners and pending seeks.
//!
//! Reliable channels hand the application one packet at a time: the next
//! packet is released only after [`Channel::recv`] returned the previous one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::channel::ChannelKind;
use crate::config::{Seed, SwitchConfig};
use crate::error::{ChannelError, Error, SeekError};
use crate::identity::{Hashname, Keypair};
use crate::messages::{ChannelId, Payload};
use crate::path::Path;
use crate::switch::{Event, Switch, SwitchStats};
use crate::transport::{UdpTransport, MAX_DATAGRAM};

/// Buffered packets per channel handle. Raw packets beyond this are dropped.
const CHANNEL_BUFFER: usize = 64;

/// Buffered inbound channels per listener.
const LISTENER_BUFFER: usize = 32;

type SeekReply = oneshot::Sender<std::result::Result<Vec<Hashname>, SeekError>>;

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    AddSeed(Seed, oneshot::Sender<crate::error::Result<Hashname>>),
    AddPeer {
        key: Vec<u8>,
        paths: Vec<Path>,
        reply: oneshot::Sender<crate::error::Result<Hashname>>,
    },
    Online(oneshot::Sender<()>),
    Listen {
        channel_type: String,
        kind: ChannelKind,
        reply: oneshot::Sender<crate::error::Result<mpsc::Receiver<Channel>>>,
    },
    Open {
        to: Hashname,
        channel_type: String,
        kind: ChannelKind,
        reply: oneshot::Sender<crate::error::Result<Channel>>,
    },
    Send {
        to: Hashname,
        channel: ChannelId,
        payload: Payload,
        reply: oneshot::Sender<crate::error::Result<()>>,
    },
    Fail {
        to: Hashname,
        channel: ChannelId,
        reason: String,
    },
    Delivered {
        to: Hashname,
        channel: ChannelId,
    },
    Seek(Hashname, SeekReply),
    Bridge {
        target: Hashname,
        via: Hashname,
        reply: oneshot::Sender<crate::error::Result<()>>,
    },
    PathSync(Hashname),
    Stats(oneshot::Sender<SwitchStats>),
    Quit,
}

// ============================================================================
// Node Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct Node {
    hashname: Hashname,
    public_key: [u8; 32],
    local_addr: SocketAddr,
    cmd_tx: mpsc::Sender<Command>,
}

impl Node {
    /// Bind a fresh identity with default settings.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_keypair(addr, Keypair::generate()).await
    }

    pub async fn bind_with_keypair(addr: &str, keypair: Keypair) -> Result<Self> {
        Self::bind_with_config(addr, keypair, SwitchConfig::default()).await
    }

    pub async fn bind_with_config(addr: &str, keypair: Keypair, config: SwitchConfig) -> Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid bind address {addr}"))?;
        let transport = UdpTransport::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = transport.local_addr();
        let socket = transport.socket();
        let routable = transport.routable_paths();

        let hashname = keypair.hashname();
        let public_key = keypair.public_key_bytes();
        let mut switch = Switch::new(keypair, config, transport);
        switch.set_local_paths(routable);

        let (cmd_tx, cmd_rx) = mpsc::channel(1000);
        let actor = NodeActor {
            switch,
            socket,
            cmd_tx: cmd_tx.clone(),
            routes: HashMap::new(),
            listeners: HashMap::new(),
            seeks: HashMap::new(),
        };
        tokio::spawn(actor.run(cmd_rx));

        info!(hashname = %hashname, addr = %local_addr, "node bound");
        Ok(Self {
            hashname,
            public_key,
            local_addr,
            cmd_tx,
        })
    }

    pub fn hashname(&self) -> Hashname {
        self.hashname
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| Error::Closed)?;
        Ok(rx.await.map_err(|_| Error::Closed)?)
    }

    pub async fn add_seed(&self, seed: Seed) -> Result<Hashname> {
        Ok(self.call(|reply| Command::AddSeed(seed, reply)).await??)
    }

    /// Learn a peer's key and addresses.
    pub async fn add_peer(&self, key: &[u8], addrs: &[SocketAddr]) -> Result<Hashname> {
        let key = key.to_vec();
        let paths = addrs.iter().copied().map(Path::from_socket_addr).collect();
        Ok(self
            .call(|reply| Command::AddPeer { key, paths, reply })
            .await??)
    }

    /// Seek ourselves through every seed and start mesh maintenance.
    pub async fn online(&self) -> Result<()> {
        self.call(Command::Online).await
    }

    /// Accept inbound channels of `channel_type`.
    pub async fn listen(&self, channel_type: &str, kind: ChannelKind) -> Result<mpsc::Receiver<Channel>> {
        let channel_type = channel_type.to_string();
        Ok(self
            .call(|reply| Command::Listen { channel_type, kind, reply })
            .await??)
    }

    pub async fn open_channel(&self, to: Hashname, channel_type: &str, kind: ChannelKind) -> Result<Channel> {
        let channel_type = channel_type.to_string();
        Ok(self
            .call(|reply| Command::Open { to, channel_type, kind, reply })
            .await??)
    }

    /// Find the peers closest to `target`. The result includes `target`
    /// itself when it was reached.
    pub async fn seek(&self, target: Hashname) -> Result<Vec<Hashname>> {
        Ok(self.call(|reply| Command::Seek(target, reply)).await??)
    }

    /// Ask `via` to forward the line with `target` at its own address.
    pub async fn bridge(&self, target: Hashname, via: Hashname) -> Result<()> {
        Ok(self
            .call(|reply| Command::Bridge { target, via, reply })
            .await??)
    }

    /// Re-probe every known path to `peer`.
    pub async fn path_sync(&self, peer: Hashname) -> Result<()> {
        self.cmd_tx
            .send(Command::PathSync(peer))
            .await
            .map_err(|_| Error::Closed)?;
        Ok(())
    }

    pub async fn telemetry(&self) -> Result<SwitchStats> {
        self.call(Command::Stats).await
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Channel Handle
// ============================================================================

/// One channel with one peer.
///
/// `recv` yields packets in order on reliable channels, then `None` once the
/// remote end arrived. A terminal failure is yielded once as `Err`.
pub struct Channel {
    peer: Hashname,
    id: ChannelId,
    channel_type: String,
    kind: ChannelKind,
    cmd_tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<std::result::Result<Payload, ChannelError>>,
}

impl Channel {
    pub fn peer(&self) -> Hashname {
        self.peer
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub async fn send(&self, payload: Payload) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                to: self.peer,
                channel: self.id,
                payload,
                reply,
            })
            .await
            .map_err(|_| Error::Closed)?;
        Ok(rx.await.map_err(|_| Error::Closed)??)
    }

    /// Send `body` with `end` set.
    pub async fn end(&self, body: impl Into<Vec<u8>>) -> Result<()> {
        self.send(Payload::end(body)).await
    }

    /// Terminate the channel with `reason`.
    pub async fn fail(self, reason: &str) {
        let _ = self
            .cmd_tx
            .send(Command::Fail {
                to: self.peer,
                channel: self.id,
                reason: reason.to_string(),
            })
            .await;
    }

    pub async fn recv(&mut self) -> Option<std::result::Result<Payload, ChannelError>> {
        let item = self.rx.recv().await?;
        if self.kind == ChannelKind::Reliable && item.is_ok() {
            let _ = self
                .cmd_tx
                .send(Command::Delivered {
                    to: self.peer,
                    channel: self.id,
                })
                .await;
        }
        Some(item)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("id", &self.id)
            .field("channel_type", &self.channel_type)
            .field("kind", &self.kind)
            .finish()
    }
}

// ============================================================================
// Node Actor (owns state)
// ============================================================================

struct NodeActor {
    switch: Switch<UdpTransport>,
    socket: std::sync::Arc<tokio::net::UdpSocket>,
    cmd_tx: mpsc::Sender<Command>,
    /// Live channel handles by peer and channel id.
    routes: HashMap<(Hashname, ChannelId), mpsc::Sender<std::result::Result<Payload, ChannelError>>>,
    listeners: HashMap<String, mpsc::Sender<Channel>>,
    seeks: HashMap<Hashname, Vec<SeekReply>>,
}

impl NodeActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let socket = self.socket.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let deadline = self.switch.next_timeout();
            let wake = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Quit) => {
                            debug!("node actor quitting");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            debug!("node handles dropped, actor quitting");
                            break;
                        }
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            self.switch.receive(&buf[..len], Path::from_socket_addr(from), Instant::now());
                        }
                        Err(e) => warn!(error = %e, "socket receive failed"),
                    }
                }
                _ = wake => self.switch.handle_timeout(Instant::now()),
            }

            self.dispatch_events();
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::AddSeed(seed, reply) => {
                let _ = reply.send(self.switch.add_seed(&seed));
            }
            Command::AddPeer { key, paths, reply } => {
                let _ = reply.send(self.switch.add_peer(&key, paths));
            }
            Command::Online(reply) => {
                self.switch.online(now);
                let _ = reply.send(());
            }
            Command::Listen { channel_type, kind, reply } => {
                let result = self.switch.listen(&channel_type, kind).map(|()| {
                    let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
                    self.listeners.insert(channel_type, tx);
                    rx
                });
                let _ = reply.send(result);
            }
            Command::Open { to, channel_type, kind, reply } => {
                let result = self
                    .switch
                    .open_channel(to, &channel_type, kind, now)
                    .map(|id| self.handle(to, id, channel_type, kind));
                let _ = reply.send(result);
            }
            Command::Send { to, channel, payload, reply } => {
                let _ = reply.send(self.switch.send(to, channel, payload, false, now));
            }
            Command::Fail { to, channel, reason } => {
                self.routes.remove(&(to, channel));
                if let Err(e) = self.switch.fail_channel(to, channel, &reason, now) {
                    debug!(peer = %to.short(), channel, error = %e, "fail on unknown channel");
                }
            }
            Command::Delivered { to, channel } => {
                if let Err(e) = self.switch.delivered(to, channel, now) {
                    trace!(peer = %to.short(), channel, error = %e, "delivered on finished channel");
                }
            }
            Command::Seek(target, reply) => {
                self.seeks.entry(target).or_default().push(reply);
                self.switch.seek(target, now);
            }
            Command::Bridge { target, via, reply } => {
                let _ = reply.send(self.switch.bridge(target, via, now));
            }
            Command::PathSync(peer) => self.switch.path_sync(peer, now),
            Command::Stats(reply) => {
                let _ = reply.send(self.switch.stats());
            }
            Command::Quit => {}
        }
    }

    fn handle(&mut self, peer: Hashname, id: ChannelId, channel_type: String, kind: ChannelKind) -> Channel {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        self.routes.insert((peer, id), tx);
        Channel {
            peer,
            id,
            channel_type,
            kind,
            cmd_tx: self.cmd_tx.clone(),
            rx,
        }
    }

    fn dispatch_events(&mut self) {
        while let Some(event) = self.switch.poll_event() {
            match event {
                Event::Message { peer, channel, channel_type, kind, payload } => {
                    self.route_message(peer, channel, channel_type, kind, payload);
                }
                Event::ChannelError { peer, channel, error } => {
                    if let Some(tx) = self.routes.remove(&(peer, channel)) {
                        let _ = tx.try_send(Err(error));
                    }
                }
                Event::Acked { peer, channel, seq } => {
                    trace!(peer = %peer.short(), channel, seq, "acknowledged");
                }
                Event::SeekComplete { target, result } => {
                    for waiter in self.seeks.remove(&target).unwrap_or_default() {
                        let _ = waiter.send(result.clone());
                    }
                }
                Event::LineUp { peer } => debug!(peer = %peer.short(), "line up"),
            }
        }
    }

    fn route_message(
        &mut self,
        peer: Hashname,
        channel: ChannelId,
        channel_type: String,
        kind: ChannelKind,
        payload: Payload,
    ) {
        let key = (peer, channel);
        if !self.routes.contains_key(&key) {
            let Some(listener) = self.listeners.get(&channel_type).cloned() else {
                debug!(peer = %peer.short(), channel, channel_type, "no listener, refusing channel");
                let _ = self.switch.fail_channel(peer, channel, crate::error::ERR_UNKNOWN_TYPE, Instant::now());
                return;
            };
            let handle = self.handle(peer, channel, channel_type, kind);
            if listener.try_send(handle).is_err() {
                debug!(peer = %peer.short(), channel, "listener unavailable, refusing channel");
                self.routes.remove(&key);
                let _ = self.switch.fail_channel(peer, channel, crate::error::ERR_UNKNOWN_TYPE, Instant::now());
                return;
            }
        }

        let end = payload.end;
        let Some(tx) = self.routes.get(&key) else {
            return;
        };
        match tx.try_send(Ok(payload)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(peer = %peer.short(), channel, "channel handle backlogged, dropping packet");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.routes.remove(&key);
                let _ = self.switch.fail_channel(peer, channel, "closed", Instant::now());
                return;
            }
        }
        if end {
            self.routes.remove(&key);
        }
    }
}
