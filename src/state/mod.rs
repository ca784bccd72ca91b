//! The server-state replicator: channel and user tables maintained from
//! idempotent state deltas, with lifecycle callbacks fired on observable
//! changes.

pub mod acl;
pub mod channels;
pub mod users;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

pub use acl::{AclEntry, AclGroup, AclView};
pub use channels::{Channel, ChannelDiff};
pub use users::{User, UserDiff};

use crate::blobs::BlobCache;
use crate::callbacks::Callbacks;
use crate::commands::Command;
use crate::mumble_proto;

pub struct Replicator {
    channels: Mutex<HashMap<u32, Channel>>,
    users: Mutex<HashMap<u32, User>>,
    acls: Mutex<HashMap<u32, AclView>>,
    myself_session: Mutex<Option<u32>>,
    callbacks: Arc<Callbacks>,
    blobs: Arc<BlobCache>,
    /// Blob fetches are suppressed during the pre-sync burst unless greedy
    /// prefetch is configured.
    ready: AtomicBool,
    greedy_blobs: bool,
}

impl Replicator {
    pub fn new(callbacks: Arc<Callbacks>, blobs: Arc<BlobCache>, greedy_blobs: bool) -> Self {
        Replicator {
            channels: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            acls: Mutex::new(HashMap::new()),
            myself_session: Mutex::new(None),
            callbacks,
            blobs,
            ready: AtomicBool::new(false),
            greedy_blobs,
        }
    }

    fn fetch_allowed(&self) -> bool {
        self.greedy_blobs || self.ready.load(Ordering::Acquire)
    }

    /// Apply a `ChannelState`; returns a blob request to enqueue, if the
    /// description needs fetching.
    pub fn handle_channel_state(&self, packet: &mumble_proto::ChannelState) -> Option<Command> {
        let Some(id) = packet.channel_id else {
            warn!("ChannelState without channel_id");
            return None;
        };

        let (snapshot, diff, needs_fetch) = {
            let mut channels = self.channels.lock();
            match channels.entry(id) {
                Entry::Occupied(mut entry) => {
                    let channel = entry.get_mut();
                    let (diff, needs_fetch) = channel.apply(packet, &self.blobs);
                    (channel.clone(), Some(diff), needs_fetch)
                }
                Entry::Vacant(entry) => {
                    let (channel, needs_fetch) = Channel::from_packet(packet, &self.blobs);
                    entry.insert(channel.clone());
                    (channel, None, needs_fetch)
                }
            }
        };

        match diff {
            Some(diff) if diff.is_empty() => {}
            Some(diff) => self.callbacks.channel_updated(snapshot, diff),
            None => self.callbacks.channel_created(snapshot),
        }

        (needs_fetch && self.fetch_allowed()).then(|| Command::request_blob(&[], &[], &[id]))
    }

    pub fn handle_channel_remove(&self, channel_id: u32) {
        let removed = self.channels.lock().remove(&channel_id);
        self.acls.lock().remove(&channel_id);
        match removed {
            Some(channel) => self.callbacks.channel_removed(channel),
            None => warn!("cannot remove channel {channel_id}: channel does not exist"),
        }
    }

    /// Apply a `UserState`; returns a blob request to enqueue, if a comment
    /// or avatar needs fetching.
    pub fn handle_user_state(&self, packet: &mumble_proto::UserState) -> Option<Command> {
        let Some(session) = packet.session else {
            warn!("UserState without session");
            return None;
        };

        let (snapshot, actor, diff, needs) = {
            let mut users = self.users.lock();
            let (snapshot, diff, needs) = match users.entry(session) {
                Entry::Occupied(mut entry) => {
                    let user = entry.get_mut();
                    let (diff, needs) = user.apply(packet, &self.blobs);
                    (user.clone(), Some(diff), needs)
                }
                Entry::Vacant(entry) => {
                    let (user, needs) = User::from_packet(packet, &self.blobs);
                    entry.insert(user.clone());
                    (user, None, needs)
                }
            };
            // The server reports no actor for self-initiated changes; fall
            // back to the affected user.
            let actor = packet
                .actor
                .and_then(|actor| users.get(&actor).cloned())
                .unwrap_or_else(|| snapshot.clone());
            (snapshot, actor, diff, needs)
        };

        match diff {
            Some(diff) if diff.is_empty() => {}
            Some(diff) => self.callbacks.user_updated(snapshot.clone(), actor, diff),
            None => {
                if Some(session) != *self.myself_session.lock() {
                    self.callbacks.user_created(snapshot.clone());
                }
            }
        }

        let own_session = [session];
        let comment_sessions: &[u32] = if needs.comment { &own_session } else { &[] };
        let texture_sessions: &[u32] = if needs.texture { &own_session } else { &[] };
        ((needs.comment || needs.texture) && self.fetch_allowed())
            .then(|| Command::request_blob(texture_sessions, comment_sessions, &[]))
    }

    pub fn handle_user_remove(&self, packet: &mumble_proto::UserRemove) {
        let (removed, actor) = {
            let mut users = self.users.lock();
            let removed = users.remove(&packet.session);
            let actor = packet.actor.and_then(|actor| users.get(&actor).cloned());
            (removed, actor)
        };
        match removed {
            Some(user) => self.callbacks.user_removed(
                user,
                actor,
                packet.ban.unwrap_or(false),
                packet.reason.clone().unwrap_or_default(),
            ),
            None => warn!("cannot remove user {}: user does not exist", packet.session),
        }
    }

    /// Replace the ACL view of the queried channel in one step.
    pub fn handle_acl(&self, packet: &mumble_proto::Acl) {
        let view = AclView::from_packet(packet);
        self.acls.lock().insert(packet.channel_id, view.clone());
        self.callbacks.acl_received(packet.channel_id, view);
    }

    pub fn set_myself(&self, session: u32) {
        *self.myself_session.lock() = Some(session);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Drop all replicated state; runs when a `Version` packet opens a new
    /// handshake, ahead of the state burst that repopulates the tables.
    pub fn clear(&self) {
        self.channels.lock().clear();
        self.users.lock().clear();
        self.acls.lock().clear();
        *self.myself_session.lock() = None;
        self.ready.store(false, Ordering::Release);
    }

    pub fn channel(&self, id: u32) -> Option<Channel> {
        self.channels.lock().get(&id).cloned()
    }

    pub fn user(&self, session: u32) -> Option<User> {
        self.users.lock().get(&session).cloned()
    }

    pub fn myself(&self) -> Option<User> {
        let session = (*self.myself_session.lock())?;
        self.user(session)
    }

    pub fn acl(&self, channel_id: u32) -> Option<AclView> {
        self.acls.lock().get(&channel_id).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}
