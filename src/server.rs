//! Server state tables and the datagram event loop.
//!
//! One UDP socket, one task. Every handler runs to completion before the
//! next datagram is read, so the tables need no locking. A maintenance
//! interval multiplexed with the socket drives keep-alives, soft-state
//! join refresh, and the inactivity sweeps.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::config::ServerConfig;
use crate::protocol::{Packet, BUFF_SIZE, DEFAULT_CHANNEL, REFRESH_RATE};
use crate::s2s::IdCache;

/// A client logged into this server.
#[derive(Debug)]
pub struct User {
    pub addr: SocketAddr,
    /// Canonical `"ip:port"` form of `addr`; the user-table key.
    pub key: String,
    pub username: String,
    /// Names of the channels this user is subscribed to, insertion order.
    pub channels: Vec<String>,
    /// Clock minute of the last packet received from this client.
    pub last_min: u8,
}

/// A statically configured adjacent server.
#[derive(Debug)]
pub struct Neighbor {
    pub addr: SocketAddr,
    /// Canonical `"ip:port"` form of `addr`; the neighbor-table key.
    pub key: String,
    /// Clock minute of the last S2S packet received from this server.
    pub last_min: u8,
}

/// The state tables every handler mutates.
///
/// Channel member lists and routing lists hold `"ip:port"` keys into the
/// owning user/neighbor maps; destroying a record means removing it from
/// the owning map and scrubbing its key from every list.
#[derive(Debug, Default)]
pub struct ServerState {
    /// Logged-in clients, keyed by `"ip:port"`.
    pub users: HashMap<String, User>,
    /// Channel name → member user keys, insertion order.
    pub channels: HashMap<String, Vec<String>>,
    /// Adjacent servers, keyed by `"ip:port"`.
    pub neighbors: HashMap<String, Neighbor>,
    /// Channel name → subscribed neighbor keys (the S2S sub-tree).
    pub routing: HashMap<String, Vec<String>>,
    /// Recently seen S2S packet IDs.
    pub cache: IdCache,
}

/// Point-in-time copy of the routing table, published after every event so
/// observers (tests, tooling) can watch sub-tree convergence.
#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    pub channels: HashMap<String, Vec<String>>,
}

/// A running DuckChat server: the socket plus the state tables.
pub struct Server {
    pub(crate) socket: UdpSocket,
    pub(crate) state: ServerState,
    /// This server's own `"ip:port"` string, used as a flood origin.
    pub(crate) local: String,
    tick: Duration,
    ticks_since_sweep: u8,
    topology_tx: watch::Sender<RoutingSnapshot>,
}

impl Server {
    /// Bind the socket and initialize the tables from `config`.
    pub async fn bind(config: &ServerConfig) -> Result<(Self, watch::Receiver<RoutingSnapshot>)> {
        let socket = UdpSocket::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
        let local = socket
            .local_addr()
            .context("socket has no local address")?
            .to_string();

        let mut state = ServerState::default();
        state.channels.insert(DEFAULT_CHANNEL.to_string(), Vec::new());
        for addr in config.resolve_neighbors()? {
            let key = addr.to_string();
            state.neighbors.insert(
                key.clone(),
                Neighbor {
                    addr,
                    key,
                    last_min: clock_minute(),
                },
            );
        }

        let (topology_tx, topology_rx) = watch::channel(RoutingSnapshot::default());
        let server = Self {
            socket,
            state,
            local,
            tick: Duration::from_secs(config.tick_secs),
            ticks_since_sweep: 0,
            topology_tx,
        };
        Ok((server, topology_rx))
    }

    /// Bind and spawn the event loop; returns the bound address, a routing
    /// snapshot receiver, and the task handle (for testing).
    pub async fn start(
        config: &ServerConfig,
    ) -> Result<(SocketAddr, watch::Receiver<RoutingSnapshot>, JoinHandle<Result<()>>)> {
        let (server, topology_rx) = Server::bind(config).await?;
        let addr = server.socket.local_addr()?;
        let handle = tokio::spawn(server.run());
        Ok((addr, topology_rx, handle))
    }

    /// Run the event loop until the task is dropped.
    pub async fn run(self) -> Result<()> {
        let span = tracing::info_span!("server", addr = %self.local);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> Result<()> {
        info!("duckchat server launched");
        let mut buf = vec![0u8; BUFF_SIZE];
        let start = tokio::time::Instant::now() + self.tick;
        let mut ticker = tokio::time::interval_at(start, self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick().await,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => self.on_datagram(&buf[..len], src).await,
                    Err(e) => warn!("recv error: {e}"),
                },
            }
            self.publish_topology();
        }
    }

    /// Decode and dispatch one datagram.
    pub(crate) async fn on_datagram(&mut self, datagram: &[u8], src: SocketAddr) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(peer = %src, "dropped undecodable datagram: {e}");
                return;
            }
        };

        // Any S2S traffic proves the neighbor is alive.
        if packet.is_s2s() {
            if let Some(neighbor) = self.state.neighbors.get_mut(&src.to_string()) {
                neighbor.last_min = clock_minute();
            }
        }

        match packet {
            Packet::Verify { username } => self.handle_verify(&username, src).await,
            Packet::Login { username } => self.handle_login(&username, src),
            Packet::Logout => self.handle_logout(src).await,
            Packet::Join { channel } => self.handle_join(&channel, src).await,
            Packet::Leave { channel } => self.handle_leave(&channel, src).await,
            Packet::Say { channel, text } => self.handle_say(&channel, &text, src).await,
            Packet::List => self.handle_list(src).await,
            Packet::Who { channel } => self.handle_who(&channel, src).await,
            Packet::KeepAlive => self.handle_keep_alive(src),

            Packet::S2sJoin { channel } => self.handle_s2s_join(&channel, src).await,
            Packet::S2sLeave { channel } => self.handle_s2s_leave(&channel, src).await,
            Packet::S2sSay {
                id,
                username,
                channel,
                text,
            } => self.handle_s2s_say(id, &username, &channel, &text, src).await,
            Packet::S2sList {
                id,
                client,
                channels,
                to_visit,
            } => self.handle_s2s_list(id, &client, channels, to_visit, src).await,
            Packet::S2sWho {
                id,
                client,
                channel,
                users,
                to_visit,
            } => {
                self.handle_s2s_who(id, &client, &channel, users, to_visit, src)
                    .await
            }
            Packet::S2sVerify {
                id,
                username,
                client,
                to_visit,
            } => {
                self.handle_s2s_verify(id, &username, &client, to_visit, src)
                    .await
            }
            Packet::S2sLeaf { id, channel } => self.handle_s2s_leaf(id, &channel, src).await,
            Packet::S2sKeepAlive => {} // stamped above

            Packet::TxtSay { .. }
            | Packet::TxtList { .. }
            | Packet::TxtWho { .. }
            | Packet::TxtError { .. }
            | Packet::TxtVerify { .. } => {
                debug!(peer = %src, "dropped server-to-client packet from the wire");
            }
        }
    }

    /// Encode and send; transient send failures are logged and dropped.
    pub(crate) async fn send(&self, packet: &Packet, to: SocketAddr) {
        if let Err(e) = self.socket.send_to(&packet.encode(), to).await {
            warn!(peer = %to, "send failed: {e}");
        }
    }

    fn publish_topology(&self) {
        self.topology_tx.send_replace(RoutingSnapshot {
            channels: self.state.routing.clone(),
        });
    }

    /// One maintenance tick: keep-alives, join refresh, and every
    /// `REFRESH_RATE` ticks the inactivity sweeps.
    pub(crate) async fn on_tick(&mut self) {
        self.flood_keep_alive().await;
        self.refresh_joins().await;
        self.ticks_since_sweep += 1;
        if self.ticks_since_sweep >= REFRESH_RATE {
            self.sweep_inactive_users().await;
            self.sweep_inactive_neighbors().await;
            self.ticks_since_sweep = 0;
        }
    }

    /// Forcibly log out every user whose last packet is older than the
    /// refresh horizon.
    pub(crate) async fn sweep_inactive_users(&mut self) {
        let stale: Vec<String> = self
            .state
            .users
            .values()
            .filter(|user| is_inactive(user.last_min))
            .map(|user| user.key.clone())
            .collect();
        for key in stale {
            if let Some(user) = self.state.users.remove(&key) {
                info!(peer = %key, "forcefully logged out inactive user {}", user.username);
                self.scrub_user(user).await;
            }
        }
    }

    /// Drop neighbors that have gone silent and scrub them from every
    /// routing list, re-evaluating leaf status per channel.
    pub(crate) async fn sweep_inactive_neighbors(&mut self) {
        let stale: Vec<String> = self
            .state
            .neighbors
            .values()
            .filter(|neighbor| is_inactive(neighbor.last_min))
            .map(|neighbor| neighbor.key.clone())
            .collect();
        for key in stale {
            self.state.neighbors.remove(&key);
            info!(peer = %key, "removed crashed server");
            let channels: Vec<String> = self.state.routing.keys().cloned().collect();
            for channel in channels {
                let removed = match self.state.routing.get_mut(&channel) {
                    Some(list) => {
                        let before = list.len();
                        list.retain(|k| k != &key);
                        before != list.len()
                    }
                    None => false,
                };
                if removed {
                    self.prune_if_leaf(&channel).await;
                }
            }
        }
    }
}

/// Current minute of the hour, the granularity liveness tracking uses.
pub(crate) fn clock_minute() -> u8 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    ((secs / 60) % 60) as u8
}

/// Minutes elapsed from `last` to `now` on the wrapping minute-of-hour dial.
pub(crate) fn minutes_since(now: u8, last: u8) -> u8 {
    if now >= last {
        now - last
    } else {
        (60 - last) + now
    }
}

fn is_inactive(last_min: u8) -> bool {
    minutes_since(clock_minute(), last_min) > REFRESH_RATE
}

/// A clock minute `minutes` in the past, wrapped onto the dial.
#[cfg(test)]
pub(crate) fn minutes_ago(minutes: u8) -> u8 {
    (clock_minute() + 60 - (minutes % 60)) % 60
}
