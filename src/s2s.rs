//! Server-to-server federation.
//!
//! The delivery fabric is a per-channel spanning sub-tree grown by
//! reverse-path flooding of JOINs and trimmed by explicit leaf detection.
//! There is no routing protocol: the tree is a byproduct of the
//! JOIN/SAY flood paths and LEAVE replies, with a fixed ring of recently
//! seen packet IDs breaking cycles in the mesh. Federated LIST/WHO/VERIFY
//! walk the mesh along an explicit unvisited-neighbor route instead of
//! flooding.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use tracing::{info, warn};

use crate::protocol::{Packet, DEFAULT_CHANNEL, MSGQ_SIZE};
use crate::server::Server;

/// Fixed ring of recently seen S2S packet IDs with a wrap-around write
/// index. Small by design: a burst of distinct IDs can evict entries
/// early, weakening loop suppression rather than breaking delivery.
#[derive(Debug)]
pub struct IdCache {
    slots: [u64; MSGQ_SIZE],
    next: usize,
}

impl Default for IdCache {
    fn default() -> Self {
        Self {
            slots: [0; MSGQ_SIZE],
            next: 0,
        }
    }
}

impl IdCache {
    pub fn contains(&self, id: u64) -> bool {
        self.slots.contains(&id)
    }

    /// Record `id`, evicting the oldest entry.
    pub fn insert(&mut self, id: u64) {
        self.slots[self.next] = id;
        self.next = (self.next + 1) % MSGQ_SIZE;
    }

    /// Draw a random ID and record it, so this server suppresses its own
    /// floods when the mesh loops them back.
    pub fn fresh(&mut self) -> u64 {
        let id = rand::random::<u64>();
        self.insert(id);
        id
    }
}

/// Parse an `"ip:port"` string carried inside a traversal packet.
fn parse_peer(s: &str) -> Option<SocketAddr> {
    match s.parse() {
        Ok(addr) => Some(addr),
        Err(_) => {
            warn!("undeliverable traversal address {s:?}");
            None
        }
    }
}

impl Server {
    pub(crate) fn neighbor_addr(&self, key: &str) -> Option<SocketAddr> {
        self.state.neighbors.get(key).map(|n| n.addr)
    }

    /// Register `channel` in the routing table with every configured
    /// neighbor pre-installed as a subscriber.
    pub(crate) fn register_routed_channel(&mut self, channel: &str) {
        let all: Vec<String> = self.state.neighbors.keys().cloned().collect();
        self.state.routing.insert(channel.to_string(), all);
    }

    /// Flood an S2S JOIN for `channel` to every neighbor except `sender`.
    pub(crate) async fn flood_join(&self, channel: &str, sender: &str) {
        let packet = Packet::S2sJoin {
            channel: channel.to_string(),
        };
        for (key, neighbor) in &self.state.neighbors {
            if key == sender {
                continue;
            }
            self.send(&packet, neighbor.addr).await;
            info!(peer = %key, "send S2S JOIN {channel}");
        }
    }

    /// Keep the neighbors from sweeping us while we have nothing to say.
    pub(crate) async fn flood_keep_alive(&self) {
        for neighbor in self.state.neighbors.values() {
            self.send(&Packet::S2sKeepAlive, neighbor.addr).await;
        }
    }

    /// Re-announce every routed channel. Subscriptions are soft state:
    /// absent these refreshes, the neighbors age them out.
    pub(crate) async fn refresh_joins(&self) {
        for channel in self.state.routing.keys() {
            self.flood_join(channel, &self.local).await;
        }
    }

    /// Self-prune when this server is a leaf for `channel`: at most one
    /// subscribed neighbor and no local members. Drops the routing entry
    /// and tells the lone remaining neighbor to cut this edge.
    pub(crate) async fn prune_if_leaf(&mut self, channel: &str) -> bool {
        if self.state.neighbors.is_empty() {
            return false;
        }
        let Some(subscribed) = self.state.routing.get(channel) else {
            return false;
        };
        let no_local_members = self
            .state
            .channels
            .get(channel)
            .map_or(true, |members| members.is_empty());
        if subscribed.len() >= 2 || !no_local_members {
            return false;
        }

        if let Some(subscribed) = self.state.routing.remove(channel) {
            if let Some(key) = subscribed.first() {
                if let Some(addr) = self.neighbor_addr(key) {
                    self.send(
                        &Packet::S2sLeave {
                            channel: channel.to_string(),
                        },
                        addr,
                    )
                    .await;
                    info!(peer = %key, "send S2S LEAVE {channel}");
                }
            }
        }
        true
    }

    /// Probe the subscribed neighbors after losing the last local member
    /// of `channel` without being provably a leaf yet.
    pub(crate) async fn probe_leaf(&mut self, channel: &str) {
        if self.state.neighbors.is_empty() {
            return;
        }
        let targets = match self.state.routing.get(channel) {
            Some(subscribed) => subscribed.clone(),
            None => return,
        };
        let id = self.state.cache.fresh();
        let packet = Packet::S2sLeaf {
            id,
            channel: channel.to_string(),
        };
        for key in &targets {
            if let Some(addr) = self.neighbor_addr(key) {
                self.send(&packet, addr).await;
                info!(peer = %key, "send S2S LEAF {channel}");
            }
        }
    }

    /// Send an S2S SAY for `channel` to every subscribed neighbor,
    /// skipping the one the packet came from.
    pub(crate) async fn forward_say(
        &self,
        id: u64,
        username: &str,
        channel: &str,
        text: &str,
        skip: Option<&str>,
    ) {
        let Some(subscribed) = self.state.routing.get(channel) else {
            return;
        };
        let packet = Packet::S2sSay {
            id,
            username: username.to_string(),
            channel: channel.to_string(),
            text: text.to_string(),
        };
        for key in subscribed {
            if skip == Some(key.as_str()) {
                continue;
            }
            if let Some(addr) = self.neighbor_addr(key) {
                self.send(&packet, addr).await;
                info!(peer = %key, "send S2S SAY {username} {channel} \"{text}\"");
            }
        }
    }

    pub(crate) async fn handle_s2s_join(&mut self, channel: &str, src: SocketAddr) {
        let key = src.to_string();
        if !self.state.neighbors.contains_key(&key) {
            return;
        }
        info!(peer = %key, "recv S2S JOIN {channel}");

        // Already subscribed: record the sender and stop — the branch is
        // pruned here.
        if let Some(subscribed) = self.state.routing.get_mut(channel) {
            if !subscribed.iter().any(|k| k == &key) {
                subscribed.push(key);
            }
            return;
        }

        self.register_routed_channel(channel);
        self.flood_join(channel, &key).await;
    }

    pub(crate) async fn handle_s2s_leave(&mut self, channel: &str, src: SocketAddr) {
        let key = src.to_string();
        info!(peer = %key, "recv S2S LEAVE {channel}");
        match self.state.routing.get_mut(channel) {
            Some(subscribed) => subscribed.retain(|k| k != &key),
            None => return,
        }
        self.prune_if_leaf(channel).await;
    }

    pub(crate) async fn handle_s2s_say(
        &mut self,
        id: u64,
        username: &str,
        channel: &str,
        text: &str,
        src: SocketAddr,
    ) {
        let key = src.to_string();
        if !self.state.neighbors.contains_key(&key) {
            return;
        }
        if !self.state.routing.contains_key(channel) {
            return;
        }

        // Same ID seen twice: the mesh has a cycle through this edge.
        // Acknowledge it and prune the redundant edge in one reply.
        if self.state.cache.contains(id) {
            self.send(
                &Packet::S2sLeave {
                    channel: channel.to_string(),
                },
                src,
            )
            .await;
            info!(peer = %key, "send S2S LEAVE {channel}");
            return;
        }
        self.state.cache.insert(id);

        info!(peer = %key, "recv S2S SAY {username} {channel} \"{text}\"");
        self.broadcast_say(channel, username, text).await;

        if self.prune_if_leaf(channel).await {
            return;
        }
        self.forward_say(id, username, channel, text, Some(key.as_str()))
            .await;
    }

    pub(crate) async fn handle_s2s_leaf(&mut self, id: u64, channel: &str, src: SocketAddr) {
        if self.prune_if_leaf(channel).await {
            return;
        }
        let key = src.to_string();

        // The probe looped back: cut the edge it arrived on.
        if self.state.cache.contains(id) {
            let Some(subscribed) = self.state.routing.get_mut(channel) else {
                return;
            };
            subscribed.retain(|k| k != &key);
            if subscribed.is_empty() {
                self.state.routing.remove(channel);
            }
            self.send(
                &Packet::S2sLeave {
                    channel: channel.to_string(),
                },
                src,
            )
            .await;
            info!(peer = %key, "send S2S LEAVE {channel}");
            return;
        }
        self.state.cache.insert(id);

        if self
            .state
            .channels
            .get(channel)
            .is_some_and(|members| !members.is_empty())
        {
            return;
        }
        let targets = match self.state.routing.get(channel) {
            Some(subscribed) => subscribed.clone(),
            None => return,
        };
        let packet = Packet::S2sLeaf {
            id,
            channel: channel.to_string(),
        };
        for k in targets.iter().filter(|k| *k != &key) {
            if let Some(addr) = self.neighbor_addr(k) {
                self.send(&packet, addr).await;
                info!(peer = %k, "send S2S LEAF {channel}");
            }
        }
    }

    /// Seed the unvisited set from this server's neighbors (only when the
    /// traversal id is fresh here) and merge the route the packet carries.
    fn collect_unvisited(&self, fresh: bool, sender: &str, carried: Vec<String>) -> BTreeSet<String> {
        let mut unvisited: BTreeSet<String> = if fresh {
            self.state
                .neighbors
                .keys()
                .filter(|k| k.as_str() != sender)
                .cloned()
                .collect()
        } else {
            BTreeSet::new()
        };
        unvisited.extend(carried.into_iter().filter(|peer| !peer.is_empty()));
        unvisited
    }

    pub(crate) async fn handle_s2s_list(
        &mut self,
        id: u64,
        client: &str,
        channels: Vec<String>,
        to_visit: Vec<String>,
        src: SocketAddr,
    ) {
        let key = src.to_string();
        info!(peer = %key, "recv S2S LIST");

        let mut names: BTreeSet<String> = channels.into_iter().collect();
        let fresh = !self.state.cache.contains(id);
        if fresh {
            self.state.cache.insert(id);
            names.extend(self.state.channels.keys().cloned());
        }

        let mut unvisited = self.collect_unvisited(fresh, &key, to_visit);
        if unvisited.is_empty() {
            let Some(addr) = parse_peer(client) else { return };
            self.send(
                &Packet::TxtList {
                    channels: names.into_iter().collect(),
                },
                addr,
            )
            .await;
            info!(peer = %client, "send LIST REPLY");
            return;
        }

        let next_key = match unvisited.iter().next().cloned() {
            Some(k) => k,
            None => return,
        };
        unvisited.remove(&next_key);
        let Some(next) = parse_peer(&next_key) else { return };
        self.send(
            &Packet::S2sList {
                id,
                client: client.to_string(),
                channels: names.into_iter().collect(),
                to_visit: unvisited.into_iter().collect(),
            },
            next,
        )
        .await;
        info!(peer = %next_key, "send S2S LIST");
    }

    pub(crate) async fn handle_s2s_who(
        &mut self,
        id: u64,
        client: &str,
        channel: &str,
        users: Vec<String>,
        to_visit: Vec<String>,
        src: SocketAddr,
    ) {
        let key = src.to_string();
        info!(peer = %key, "recv S2S WHO {channel}");

        let mut names: BTreeSet<String> = users.into_iter().collect();
        let fresh = !self.state.cache.contains(id);
        if fresh {
            self.state.cache.insert(id);
            if let Some(members) = self.state.channels.get(channel) {
                names.extend(
                    members
                        .iter()
                        .filter_map(|k| self.state.users.get(k))
                        .map(|u| u.username.clone()),
                );
            }
        }

        let mut unvisited = self.collect_unvisited(fresh, &key, to_visit);
        if unvisited.is_empty() {
            let Some(addr) = parse_peer(client) else { return };
            if names.is_empty() && channel != DEFAULT_CHANNEL {
                self.send_error(addr, &format!("No channel by the name {channel}."))
                    .await;
                return;
            }
            self.send(
                &Packet::TxtWho {
                    channel: channel.to_string(),
                    users: names.into_iter().collect(),
                },
                addr,
            )
            .await;
            info!(peer = %client, "send WHO REPLY {channel}");
            return;
        }

        let next_key = match unvisited.iter().next().cloned() {
            Some(k) => k,
            None => return,
        };
        unvisited.remove(&next_key);
        let Some(next) = parse_peer(&next_key) else { return };
        self.send(
            &Packet::S2sWho {
                id,
                client: client.to_string(),
                channel: channel.to_string(),
                users: names.into_iter().collect(),
                to_visit: unvisited.into_iter().collect(),
            },
            next,
        )
        .await;
        info!(peer = %next_key, "send S2S WHO {channel}");
    }

    pub(crate) async fn handle_s2s_verify(
        &mut self,
        id: u64,
        username: &str,
        client: &str,
        to_visit: Vec<String>,
        src: SocketAddr,
    ) {
        let key = src.to_string();
        info!(peer = %key, "recv S2S VERIFY {username}");

        let fresh = !self.state.cache.contains(id);
        let mut taken = false;
        if fresh {
            self.state.cache.insert(id);
            taken = self.state.users.values().any(|u| u.username == username);
        }

        let mut unvisited = self.collect_unvisited(fresh, &key, to_visit);
        // A collision anywhere settles the verdict; don't walk further.
        if taken || unvisited.is_empty() {
            let Some(addr) = parse_peer(client) else { return };
            self.send(&Packet::TxtVerify { valid: !taken }, addr).await;
            info!(peer = %client, "send VERIFICATION {username}");
            return;
        }

        let next_key = match unvisited.iter().next().cloned() {
            Some(k) => k,
            None => return,
        };
        unvisited.remove(&next_key);
        let Some(next) = parse_peer(&next_key) else { return };
        self.send(
            &Packet::S2sVerify {
                id,
                username: username.to_string(),
                client: client.to_string(),
                to_visit: unvisited.into_iter().collect(),
            },
            next,
        )
        .await;
        info!(peer = %next_key, "send S2S VERIFY {username}");
    }

    /// Start a LIST traversal carrying this server's channel names.
    pub(crate) async fn start_list_traversal(&mut self, channels: Vec<String>, client: &str) {
        let Some((first, rest)) = self.pick_route() else {
            return;
        };
        let id = self.state.cache.fresh();
        let Some(next) = self.neighbor_addr(&first) else {
            return;
        };
        self.send(
            &Packet::S2sList {
                id,
                client: client.to_string(),
                channels,
                to_visit: rest,
            },
            next,
        )
        .await;
        info!(peer = %first, "send S2S LIST");
    }

    /// Start a WHO traversal carrying this server's members of `channel`.
    pub(crate) async fn start_who_traversal(
        &mut self,
        channel: &str,
        users: Vec<String>,
        client: &str,
    ) {
        let Some((first, rest)) = self.pick_route() else {
            return;
        };
        let id = self.state.cache.fresh();
        let Some(next) = self.neighbor_addr(&first) else {
            return;
        };
        self.send(
            &Packet::S2sWho {
                id,
                client: client.to_string(),
                channel: channel.to_string(),
                users,
                to_visit: rest,
            },
            next,
        )
        .await;
        info!(peer = %first, "send S2S WHO {channel}");
    }

    /// Start a VERIFY traversal for a username that is unique locally.
    pub(crate) async fn start_verify_traversal(&mut self, username: &str, client: &str) {
        let Some((first, rest)) = self.pick_route() else {
            return;
        };
        let id = self.state.cache.fresh();
        let Some(next) = self.neighbor_addr(&first) else {
            return;
        };
        self.send(
            &Packet::S2sVerify {
                id,
                username: username.to_string(),
                client: client.to_string(),
                to_visit: rest,
            },
            next,
        )
        .await;
        info!(peer = %first, "send S2S VERIFY {username}");
    }

    /// Split the neighbor set into a first hop and the remaining route.
    fn pick_route(&self) -> Option<(String, Vec<String>)> {
        let mut keys: Vec<String> = self.state.neighbors.keys().cloned().collect();
        if keys.is_empty() {
            return None;
        }
        let first = keys.remove(0);
        Some((first, keys))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::IdCache;
    use crate::protocol::{Packet, MSGQ_SIZE};
    use crate::server::test_support::*;

    #[test]
    fn cache_evicts_the_oldest_entry() {
        let mut cache = IdCache::default();
        for id in 1..=(MSGQ_SIZE as u64) {
            cache.insert(id);
        }
        assert!(cache.contains(1));
        cache.insert(1000);
        assert!(!cache.contains(1));
        assert!(cache.contains(1000));
        assert!(cache.contains(MSGQ_SIZE as u64));
    }

    #[test]
    fn fresh_ids_are_remembered() {
        let mut cache = IdCache::default();
        let id = cache.fresh();
        assert!(cache.contains(id));
    }

    #[tokio::test]
    async fn s2s_join_registers_the_channel_and_floods_onward() {
        let mut server = server().await;
        let n1 = peer().await;
        let n2 = peer().await;
        link(&mut server, &n1);
        link(&mut server, &n2);

        server.handle_s2s_join("dev", n1.addr).await;

        let subscribed = &server.state.routing["dev"];
        assert!(subscribed.contains(&n1.key) && subscribed.contains(&n2.key));
        // The flood skips the sender.
        assert_eq!(
            n2.recv().await,
            Packet::S2sJoin {
                channel: "dev".into()
            }
        );
        assert!(n1.silent_for(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn repeated_s2s_join_stops_the_flood() {
        let mut server = server().await;
        let n1 = peer().await;
        let n2 = peer().await;
        link(&mut server, &n1);
        link(&mut server, &n2);
        server.handle_s2s_join("dev", n1.addr).await;
        n2.recv().await;

        server.handle_s2s_join("dev", n1.addr).await;

        assert!(n2.silent_for(Duration::from_millis(200)).await);
        assert_eq!(server.state.routing["dev"].len(), 2);
    }

    #[tokio::test]
    async fn s2s_join_from_a_stranger_is_dropped() {
        let mut server = server().await;
        let n1 = peer().await;
        link(&mut server, &n1);
        let stranger = peer().await;

        server.handle_s2s_join("dev", stranger.addr).await;

        assert!(!server.state.routing.contains_key("dev"));
    }

    #[tokio::test]
    async fn duplicate_s2s_say_elicits_exactly_one_leave() {
        let mut server = server().await;
        let n1 = peer().await;
        let n2 = peer().await;
        link(&mut server, &n1);
        link(&mut server, &n2);
        server.register_routed_channel("dev");

        server.handle_s2s_say(42, "alice", "dev", "hi", n1.addr).await;
        assert!(server.state.cache.contains(42));
        // First delivery forwards along the tree, skipping the sender.
        assert_eq!(
            n2.recv().await,
            Packet::S2sSay {
                id: 42,
                username: "alice".into(),
                channel: "dev".into(),
                text: "hi".into()
            }
        );

        server.handle_s2s_say(42, "alice", "dev", "hi", n1.addr).await;
        assert_eq!(
            n1.recv().await,
            Packet::S2sLeave {
                channel: "dev".into()
            }
        );
        assert!(n2.silent_for(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn s2s_say_delivers_to_local_members() {
        let mut server = server().await;
        let n1 = peer().await;
        link(&mut server, &n1);
        let alice = peer().await;
        server.handle_login("alice", alice.addr);
        server.handle_join("dev", alice.addr).await;
        n1.recv().await; // the JOIN flood

        server.handle_s2s_say(7, "bob", "dev", "hello", n1.addr).await;

        assert_eq!(
            alice.recv().await,
            Packet::TxtSay {
                channel: "dev".into(),
                username: "bob".into(),
                text: "hello".into()
            }
        );
    }

    #[tokio::test]
    async fn s2s_say_for_unrouted_channel_is_dropped() {
        let mut server = server().await;
        let n1 = peer().await;
        link(&mut server, &n1);

        server.handle_s2s_say(9, "bob", "ghost", "boo", n1.addr).await;

        assert!(!server.state.cache.contains(9));
        assert!(n1.silent_for(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn leaf_server_prunes_itself_after_forwarding() {
        let mut server = server().await;
        let n1 = peer().await;
        link(&mut server, &n1);
        server.register_routed_channel("dev");

        // One subscribed neighbor, no local members: receiving a SAY makes
        // this server a provable leaf.
        server.handle_s2s_say(13, "bob", "dev", "x", n1.addr).await;

        assert!(!server.state.routing.contains_key("dev"));
        assert_eq!(
            n1.recv().await,
            Packet::S2sLeave {
                channel: "dev".into()
            }
        );
    }

    #[tokio::test]
    async fn s2s_leave_removes_the_sender_edge() {
        let mut server = server().await;
        let n1 = peer().await;
        let n2 = peer().await;
        link(&mut server, &n1);
        link(&mut server, &n2);
        let alice = peer().await;
        server.handle_login("alice", alice.addr);
        server.handle_join("dev", alice.addr).await;
        n1.recv().await;
        n2.recv().await;

        server.handle_s2s_leave("dev", n1.addr).await;

        // A local member keeps the channel alive with the remaining edge.
        assert_eq!(server.state.routing["dev"], vec![n2.key.clone()]);
    }

    #[tokio::test]
    async fn looped_leaf_probe_cuts_the_edge() {
        let mut server = server().await;
        let n1 = peer().await;
        let n2 = peer().await;
        link(&mut server, &n1);
        link(&mut server, &n2);
        server.register_routed_channel("dev");
        server.state.cache.insert(55);

        server.handle_s2s_leaf(55, "dev", n1.addr).await;

        assert_eq!(server.state.routing["dev"], vec![n2.key.clone()]);
        assert_eq!(
            n1.recv().await,
            Packet::S2sLeave {
                channel: "dev".into()
            }
        );
    }

    #[tokio::test]
    async fn fresh_leaf_probe_is_forwarded_when_no_locals_listen() {
        let mut server = server().await;
        let n1 = peer().await;
        let n2 = peer().await;
        link(&mut server, &n1);
        link(&mut server, &n2);
        server.register_routed_channel("dev");

        server.handle_s2s_leaf(77, "dev", n1.addr).await;

        assert!(server.state.cache.contains(77));
        assert_eq!(
            n2.recv().await,
            Packet::S2sLeaf {
                id: 77,
                channel: "dev".into()
            }
        );
        assert!(n1.silent_for(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn s2s_list_replies_to_the_client_at_the_end_of_the_route() {
        let mut server = server().await;
        let n1 = peer().await;
        link(&mut server, &n1);
        let alice = peer().await;
        server.handle_login("alice", alice.addr);
        server.handle_join("dev", alice.addr).await;
        n1.recv().await;

        let client = peer().await;
        server
            .handle_s2s_list(101, &client.key, vec!["ops".into()], vec![], n1.addr)
            .await;

        match client.recv().await {
            Packet::TxtList { mut channels } => {
                channels.sort();
                assert_eq!(channels, vec!["Common", "dev", "ops"]);
            }
            other => panic!("expected TXT_LIST, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_s2s_list_contributes_nothing_local() {
        let mut server = server().await;
        let n1 = peer().await;
        link(&mut server, &n1);
        server.state.cache.insert(101);

        let client = peer().await;
        server
            .handle_s2s_list(101, &client.key, vec!["ops".into()], vec![], n1.addr)
            .await;

        assert_eq!(
            client.recv().await,
            Packet::TxtList {
                channels: vec!["ops".into()]
            }
        );
    }

    #[tokio::test]
    async fn s2s_who_reports_missing_channels() {
        let mut server = server().await;
        let n1 = peer().await;
        link(&mut server, &n1);

        let client = peer().await;
        server
            .handle_s2s_who(7, &client.key, "ghost", vec![], vec![], n1.addr)
            .await;

        assert_eq!(
            client.recv().await,
            Packet::TxtError {
                message: "No channel by the name ghost.".into()
            }
        );
    }

    #[tokio::test]
    async fn s2s_verify_collision_short_circuits_the_route() {
        let mut server = server().await;
        let n1 = peer().await;
        let n2 = peer().await;
        link(&mut server, &n1);
        link(&mut server, &n2);
        let bob = peer().await;
        server.handle_login("bob", bob.addr);

        let client = peer().await;
        // The carried route still has stops; the collision ends it anyway.
        server
            .handle_s2s_verify(88, "bob", &client.key, vec![n2.key.clone()], n1.addr)
            .await;

        assert_eq!(client.recv().await, Packet::TxtVerify { valid: false });
        assert!(n2.silent_for(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn s2s_verify_forwards_along_the_carried_route() {
        let mut server = server().await;
        let n1 = peer().await;
        let n2 = peer().await;
        link(&mut server, &n1);
        link(&mut server, &n2);

        let client = peer().await;
        server
            .handle_s2s_verify(89, "fresh", &client.key, vec![], n1.addr)
            .await;

        // The only unvisited neighbor is n2; the packet moves there.
        match n2.recv().await {
            Packet::S2sVerify {
                id,
                username,
                to_visit,
                ..
            } => {
                assert_eq!(id, 89);
                assert_eq!(username, "fresh");
                assert!(to_visit.is_empty());
            }
            other => panic!("expected S2S VERIFY, got {other:?}"),
        }
    }
}
