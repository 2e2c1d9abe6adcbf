//! Client-facing request handlers.
//!
//! Requests from addresses that never logged in are dropped, except
//! VERIFY and LOGIN which precede the user record. Recoverable failures
//! are reported back to the client as a TXT_ERROR; nothing here can stop
//! the server.

use std::net::SocketAddr;

use tracing::info;

use crate::protocol::{Packet, DEFAULT_CHANNEL, MAX_CHANNELS};
use crate::server::{clock_minute, Server, User};

impl Server {
    /// Pre-login username check. Unique locally and neighbors configured:
    /// the verdict needs the whole mesh, so start a traversal. Otherwise
    /// answer from the local table.
    pub(crate) async fn handle_verify(&mut self, username: &str, src: SocketAddr) {
        info!(peer = %src, "recv Request VERIFY {username}");
        let taken = self.state.users.values().any(|u| u.username == username);
        if !taken && !self.state.neighbors.is_empty() {
            self.start_verify_traversal(username, &src.to_string()).await;
            return;
        }
        self.send(&Packet::TxtVerify { valid: !taken }, src).await;
        info!(peer = %src, "send VERIFICATION {username}");
    }

    /// Create the user record. A repeated login from the same address is a
    /// no-op; no reply is sent on success.
    pub(crate) fn handle_login(&mut self, username: &str, src: SocketAddr) {
        let key = src.to_string();
        info!(peer = %key, "recv Request LOGIN {username}");
        self.state.users.entry(key.clone()).or_insert_with(|| User {
            addr: src,
            key,
            username: username.to_string(),
            channels: Vec::new(),
            last_min: clock_minute(),
        });
    }

    pub(crate) async fn handle_logout(&mut self, src: SocketAddr) {
        let Some(user) = self.state.users.remove(&src.to_string()) else {
            return;
        };
        info!(peer = %user.key, "recv Request LOGOUT {}", user.username);
        self.scrub_user(user).await;
    }

    /// Remove a departing user from every channel it was subscribed to,
    /// dropping channels that empty out and re-evaluating the sub-tree per
    /// channel. Shared by LOGOUT and the inactivity sweep.
    pub(crate) async fn scrub_user(&mut self, mut user: User) {
        for channel in user.channels.drain(..) {
            self.drop_member(&channel, &user.key);
            if self.prune_if_leaf(&channel).await {
                continue;
            }
            if self
                .state
                .channels
                .get(&channel)
                .is_some_and(|members| !members.is_empty())
            {
                continue;
            }
            self.probe_leaf(&channel).await;
        }
    }

    /// Remove `key` from `channel`'s member list, deleting the channel if
    /// it empties and is not the default.
    fn drop_member(&mut self, channel: &str, key: &str) {
        let Some(members) = self.state.channels.get_mut(channel) else {
            return;
        };
        members.retain(|k| k != key);
        if members.is_empty() && channel != DEFAULT_CHANNEL {
            self.state.channels.remove(channel);
            info!("removed the empty channel {channel}");
        }
    }

    pub(crate) async fn handle_join(&mut self, channel: &str, src: SocketAddr) {
        let key = src.to_string();
        let (addr, username, already_member, at_limit) = match self.state.users.get_mut(&key) {
            Some(user) => {
                user.last_min = clock_minute();
                (
                    user.addr,
                    user.username.clone(),
                    user.channels.iter().any(|c| c == channel),
                    user.channels.len() >= MAX_CHANNELS,
                )
            }
            None => return,
        };
        info!(peer = %key, "recv Request JOIN {username} {channel}");

        if already_member {
            return;
        }
        if at_limit {
            self.send_error(addr, &format!("Failed to join {channel}."))
                .await;
            return;
        }

        // First participation in this channel: register it in the routing
        // table with every neighbor pre-installed and announce it.
        if !self.state.neighbors.is_empty() && !self.state.routing.contains_key(channel) {
            self.register_routed_channel(channel);
            self.flood_join(channel, &self.local).await;
        }

        if let Some(user) = self.state.users.get_mut(&key) {
            user.channels.push(channel.to_string());
        }
        let members = self.state.channels.entry(channel.to_string()).or_default();
        if !members.iter().any(|k| k == &key) {
            members.push(key);
        }
    }

    pub(crate) async fn handle_leave(&mut self, channel: &str, src: SocketAddr) {
        let key = src.to_string();
        let (addr, username, position) = match self.state.users.get_mut(&key) {
            Some(user) => {
                user.last_min = clock_minute();
                (
                    user.addr,
                    user.username.clone(),
                    user.channels.iter().position(|c| c == channel),
                )
            }
            None => return,
        };

        if !self.state.channels.contains_key(channel) {
            self.send_error(addr, &format!("No channel by the name {channel}."))
                .await;
            return;
        }
        let Some(position) = position else {
            self.send_error(addr, &format!("You are not subscribed to {channel}."))
                .await;
            return;
        };

        if let Some(user) = self.state.users.get_mut(&key) {
            user.channels.remove(position);
        }
        info!(peer = %key, "recv Request LEAVE {username} {channel}");
        self.drop_member(channel, &key);

        if self.prune_if_leaf(channel).await {
            return;
        }
        if self
            .state
            .channels
            .get(channel)
            .is_some_and(|members| !members.is_empty())
        {
            return;
        }
        self.probe_leaf(channel).await;
    }

    pub(crate) async fn handle_say(&mut self, channel: &str, text: &str, src: SocketAddr) {
        let key = src.to_string();
        let username = match self.state.users.get_mut(&key) {
            Some(user) => {
                user.last_min = clock_minute();
                user.username.clone()
            }
            None => return,
        };
        if !self.state.channels.contains_key(channel) {
            return;
        }
        info!(peer = %key, "recv Request SAY {username} {channel} \"{text}\"");

        self.broadcast_say(channel, &username, text).await;

        // The fresh ID lands in our own cache first, so the flood is
        // suppressed if the mesh loops it back here.
        let id = self.state.cache.fresh();
        self.forward_say(id, &username, channel, text, None).await;
    }

    /// Unicast a TXT_SAY to every local member of `channel`.
    pub(crate) async fn broadcast_say(&self, channel: &str, username: &str, text: &str) {
        let Some(members) = self.state.channels.get(channel) else {
            return;
        };
        let packet = Packet::TxtSay {
            channel: channel.to_string(),
            username: username.to_string(),
            text: text.to_string(),
        };
        for key in members {
            if let Some(user) = self.state.users.get(key) {
                self.send(&packet, user.addr).await;
            }
        }
    }

    pub(crate) async fn handle_list(&mut self, src: SocketAddr) {
        let key = src.to_string();
        let (addr, username) = match self.state.users.get_mut(&key) {
            Some(user) => {
                user.last_min = clock_minute();
                (user.addr, user.username.clone())
            }
            None => return,
        };
        info!(peer = %key, "recv Request LIST {username}");

        let local_channels: Vec<String> = self.state.channels.keys().cloned().collect();
        if self.state.neighbors.is_empty() {
            self.send(
                &Packet::TxtList {
                    channels: local_channels,
                },
                addr,
            )
            .await;
            return;
        }
        self.start_list_traversal(local_channels, &key).await;
    }

    pub(crate) async fn handle_who(&mut self, channel: &str, src: SocketAddr) {
        let key = src.to_string();
        let (addr, username) = match self.state.users.get_mut(&key) {
            Some(user) => {
                user.last_min = clock_minute();
                (user.addr, user.username.clone())
            }
            None => return,
        };
        info!(peer = %key, "recv Request WHO {username} {channel}");

        let members: Option<Vec<String>> = self.state.channels.get(channel).map(|keys| {
            keys.iter()
                .filter_map(|k| self.state.users.get(k))
                .map(|u| u.username.clone())
                .collect()
        });

        if self.state.neighbors.is_empty() {
            match members {
                Some(users) => {
                    self.send(
                        &Packet::TxtWho {
                            channel: channel.to_string(),
                            users,
                        },
                        addr,
                    )
                    .await
                }
                None => {
                    self.send_error(addr, &format!("No channel by the name {channel}."))
                        .await
                }
            }
            return;
        }
        self.start_who_traversal(channel, members.unwrap_or_default(), &key)
            .await;
    }

    /// Pure side effect: the user stays logged in.
    pub(crate) fn handle_keep_alive(&mut self, src: SocketAddr) {
        if let Some(user) = self.state.users.get_mut(&src.to_string()) {
            user.last_min = clock_minute();
            info!(peer = %user.key, "recv Request KEEP ALIVE {}", user.username);
        }
    }

    /// Report a recoverable failure back to the originating client.
    pub(crate) async fn send_error(&self, addr: SocketAddr, message: &str) {
        self.send(
            &Packet::TxtError {
                message: message.to_string(),
            },
            addr,
        )
        .await;
        info!(peer = %addr, "send ERROR \"{message}\"");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::protocol::{Packet, DEFAULT_CHANNEL, MAX_CHANNELS};
    use crate::server::test_support::*;
    use crate::server::minutes_ago;

    #[tokio::test]
    async fn login_is_idempotent() {
        let mut server = server().await;
        let alice = peer().await;
        server.handle_login("alice", alice.addr);
        server.handle_login("impostor", alice.addr);
        assert_eq!(server.state.users[&alice.key].username, "alice");
    }

    #[tokio::test]
    async fn join_subscribes_both_sides_once() {
        let mut server = server().await;
        let alice = peer().await;
        server.handle_login("alice", alice.addr);
        server.handle_join("dev", alice.addr).await;
        server.handle_join("dev", alice.addr).await;

        assert_eq!(server.state.users[&alice.key].channels, vec!["dev"]);
        assert_eq!(server.state.channels["dev"], vec![alice.key.clone()]);
    }

    #[tokio::test]
    async fn join_from_unknown_address_is_dropped() {
        let mut server = server().await;
        let stranger = peer().await;
        server.handle_join("dev", stranger.addr).await;
        assert!(!server.state.channels.contains_key("dev"));
    }

    #[tokio::test]
    async fn join_enforces_the_channel_limit() {
        let mut server = server().await;
        let alice = peer().await;
        server.handle_login("alice", alice.addr);
        for i in 0..MAX_CHANNELS {
            server.handle_join(&format!("ch{i}"), alice.addr).await;
        }
        server.handle_join("overflow", alice.addr).await;

        assert_eq!(server.state.users[&alice.key].channels.len(), MAX_CHANNELS);
        assert_eq!(
            alice.recv().await,
            Packet::TxtError {
                message: "Failed to join overflow.".into()
            }
        );
    }

    #[tokio::test]
    async fn leave_reports_unknown_channel() {
        let mut server = server().await;
        let alice = peer().await;
        server.handle_login("alice", alice.addr);
        server.handle_leave("nowhere", alice.addr).await;
        assert_eq!(
            alice.recv().await,
            Packet::TxtError {
                message: "No channel by the name nowhere.".into()
            }
        );
    }

    #[tokio::test]
    async fn leave_reports_missing_subscription() {
        let mut server = server().await;
        let alice = peer().await;
        server.handle_login("alice", alice.addr);
        server.handle_leave(DEFAULT_CHANNEL, alice.addr).await;
        assert_eq!(
            alice.recv().await,
            Packet::TxtError {
                message: format!("You are not subscribed to {DEFAULT_CHANNEL}.")
            }
        );
    }

    #[tokio::test]
    async fn leave_deletes_empty_channels_but_never_common() {
        let mut server = server().await;
        let alice = peer().await;
        server.handle_login("alice", alice.addr);
        server.handle_join("dev", alice.addr).await;
        server.handle_join(DEFAULT_CHANNEL, alice.addr).await;

        server.handle_leave("dev", alice.addr).await;
        server.handle_leave(DEFAULT_CHANNEL, alice.addr).await;

        assert!(!server.state.channels.contains_key("dev"));
        assert!(server.state.channels.contains_key(DEFAULT_CHANNEL));
        assert!(server.state.channels[DEFAULT_CHANNEL].is_empty());
    }

    #[tokio::test]
    async fn say_reaches_every_member_including_the_sender() {
        let mut server = server().await;
        let alice = peer().await;
        let bob = peer().await;
        server.handle_login("alice", alice.addr);
        server.handle_login("bob", bob.addr);
        server.handle_join("dev", alice.addr).await;
        server.handle_join("dev", bob.addr).await;

        server.handle_say("dev", "hi", alice.addr).await;

        let expected = Packet::TxtSay {
            channel: "dev".into(),
            username: "alice".into(),
            text: "hi".into(),
        };
        assert_eq!(alice.recv().await, expected);
        assert_eq!(bob.recv().await, expected);
    }

    #[tokio::test]
    async fn say_to_unknown_channel_is_dropped() {
        let mut server = server().await;
        let alice = peer().await;
        server.handle_login("alice", alice.addr);
        server.handle_say("dev", "hi", alice.addr).await;
        assert!(alice.silent_for(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn logout_scrubs_every_channel() {
        let mut server = server().await;
        let alice = peer().await;
        server.handle_login("alice", alice.addr);
        server.handle_join("dev", alice.addr).await;
        server.handle_join(DEFAULT_CHANNEL, alice.addr).await;

        server.handle_logout(alice.addr).await;

        assert!(server.state.users.is_empty());
        assert!(!server.state.channels.contains_key("dev"));
        assert!(server.state.channels[DEFAULT_CHANNEL].is_empty());
    }

    #[tokio::test]
    async fn keep_alive_refreshes_the_user_stamp() {
        let mut server = server().await;
        let alice = peer().await;
        server.handle_login("alice", alice.addr);
        server.state.users.get_mut(&alice.key).unwrap().last_min = minutes_ago(5);

        server.handle_keep_alive(alice.addr);

        let user = &server.state.users[&alice.key];
        assert!(crate::server::minutes_since(crate::server::clock_minute(), user.last_min) <= 1);
    }

    #[tokio::test]
    async fn verify_answers_locally_without_neighbors() {
        let mut server = server().await;
        let alice = peer().await;
        let probe = peer().await;
        server.handle_login("alice", alice.addr);

        server.handle_verify("alice", probe.addr).await;
        assert_eq!(probe.recv().await, Packet::TxtVerify { valid: false });

        server.handle_verify("fresh", probe.addr).await;
        assert_eq!(probe.recv().await, Packet::TxtVerify { valid: true });
    }

    #[tokio::test]
    async fn list_answers_locally_without_neighbors() {
        let mut server = server().await;
        let alice = peer().await;
        server.handle_login("alice", alice.addr);
        server.handle_join("dev", alice.addr).await;

        server.handle_list(alice.addr).await;

        match alice.recv().await {
            Packet::TxtList { mut channels } => {
                channels.sort();
                assert_eq!(channels, vec!["Common".to_string(), "dev".to_string()]);
            }
            other => panic!("expected TXT_LIST, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn who_answers_locally_without_neighbors() {
        let mut server = server().await;
        let alice = peer().await;
        let bob = peer().await;
        server.handle_login("alice", alice.addr);
        server.handle_login("bob", bob.addr);
        server.handle_join("dev", alice.addr).await;
        server.handle_join("dev", bob.addr).await;

        server.handle_who("dev", alice.addr).await;
        match alice.recv().await {
            Packet::TxtWho { channel, mut users } => {
                assert_eq!(channel, "dev");
                users.sort();
                assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);
            }
            other => panic!("expected TXT_WHO, got {other:?}"),
        }

        server.handle_who("nowhere", alice.addr).await;
        assert_eq!(
            alice.recv().await,
            Packet::TxtError {
                message: "No channel by the name nowhere.".into()
            }
        );
    }
}
