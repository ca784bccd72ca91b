use crate::blobs::{BlobCache, BlobKind};
use crate::mumble_proto::ChannelState;

/// One replicated channel. `parent` is stored as an id; resolve through the
/// table when a reference is needed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Channel {
    pub id: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub description: String,
    pub description_hash: Vec<u8>,
    pub temporary: bool,
    pub position: i32,
    pub max_users: u32,
    pub links: Vec<u32>,
    pub can_enter: bool,
    pub is_enter_restricted: bool,
}

/// Previous values of the fields a `ChannelState` actually changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelDiff {
    pub name: Option<String>,
    pub parent: Option<u32>,
    pub temporary: Option<bool>,
    pub position: Option<i32>,
    pub max_users: Option<u32>,
    pub links: Option<Vec<u32>>,
    pub description: Option<String>,
    pub can_enter: Option<bool>,
    pub is_enter_restricted: Option<bool>,
}

impl ChannelDiff {
    pub fn is_empty(&self) -> bool {
        *self == ChannelDiff::default()
    }
}

impl Channel {
    /// Build a channel from its first `ChannelState`, consulting the blob
    /// cache for a known description. Returns the channel and whether the
    /// description blob needs fetching.
    pub fn from_packet(packet: &ChannelState, blobs: &BlobCache) -> (Channel, bool) {
        let mut channel = Channel {
            id: packet.channel_id(),
            parent: packet.parent,
            name: packet.name().to_owned(),
            description: packet.description().to_owned(),
            description_hash: packet.description_hash().to_vec(),
            temporary: packet.temporary(),
            position: packet.position(),
            max_users: packet.max_users(),
            links: packet.links.clone(),
            can_enter: packet.can_enter(),
            is_enter_restricted: packet.is_enter_restricted(),
        };

        let entity = channel.id.to_string();
        let mut needs_fetch = false;
        if packet.description.is_some() {
            blobs.put(
                BlobKind::ChannelDescription,
                &entity,
                &channel.description_hash,
                channel.description.as_bytes(),
            );
        } else if !channel.description_hash.is_empty() {
            if blobs.has(BlobKind::ChannelDescription, &entity, &channel.description_hash) {
                if let Some(payload) = blobs.get(BlobKind::ChannelDescription, &entity) {
                    channel.description = String::from_utf8_lossy(&payload).into_owned();
                }
            } else {
                needs_fetch = true;
            }
        } else {
            blobs.put(BlobKind::ChannelDescription, &entity, b"", b"");
        }

        (channel, needs_fetch)
    }

    /// Diff the supplied fields against the current state and apply them.
    /// Returns the previous values of changed fields and whether the
    /// description blob needs fetching.
    pub fn apply(&mut self, packet: &ChannelState, blobs: &BlobCache) -> (ChannelDiff, bool) {
        let mut diff = ChannelDiff::default();
        let mut needs_fetch = false;
        let entity = self.id.to_string();

        if packet.name.is_some() && self.name != packet.name() {
            diff.name = Some(std::mem::replace(&mut self.name, packet.name().to_owned()));
        }
        if let Some(parent) = packet.parent {
            if self.parent != Some(parent) {
                diff.parent = self.parent.replace(parent);
            }
        }
        if packet.temporary.is_some() && self.temporary != packet.temporary() {
            diff.temporary = Some(self.temporary);
            self.temporary = packet.temporary();
        }
        if packet.position.is_some() && self.position != packet.position() {
            diff.position = Some(self.position);
            self.position = packet.position();
        }
        if packet.max_users.is_some() && self.max_users != packet.max_users() {
            diff.max_users = Some(self.max_users);
            self.max_users = packet.max_users();
        }
        if !packet.links.is_empty() && self.links != packet.links {
            diff.links = Some(std::mem::replace(&mut self.links, packet.links.clone()));
        }
        if !packet.links_add.is_empty() || !packet.links_remove.is_empty() {
            let previous = self.links.clone();
            self.links.retain(|id| !packet.links_remove.contains(id));
            for id in &packet.links_add {
                if !self.links.contains(id) {
                    self.links.push(*id);
                }
            }
            if previous != self.links {
                diff.links.get_or_insert(previous);
            }
        }
        if packet.can_enter.is_some() && self.can_enter != packet.can_enter() {
            diff.can_enter = Some(self.can_enter);
            self.can_enter = packet.can_enter();
        }
        if packet.is_enter_restricted.is_some()
            && self.is_enter_restricted != packet.is_enter_restricted()
        {
            diff.is_enter_restricted = Some(self.is_enter_restricted);
            self.is_enter_restricted = packet.is_enter_restricted();
        }

        if packet.description_hash.is_some() && self.description_hash != packet.description_hash()
        {
            self.description_hash = packet.description_hash().to_vec();
            if blobs.has(BlobKind::ChannelDescription, &entity, &self.description_hash) {
                if let Some(payload) = blobs.get(BlobKind::ChannelDescription, &entity) {
                    self.description = String::from_utf8_lossy(&payload).into_owned();
                }
            } else {
                needs_fetch = true;
            }
        }
        if packet.description.is_some() && self.description != packet.description() {
            diff.description = Some(std::mem::replace(
                &mut self.description,
                packet.description().to_owned(),
            ));
            if self.description.is_empty() {
                self.description_hash.clear();
            }
            blobs.put(
                BlobKind::ChannelDescription,
                &entity,
                &self.description_hash,
                self.description.as_bytes(),
            );
            needs_fetch = false;
        }

        (diff, needs_fetch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> BlobCache {
        BlobCache::open(None).unwrap()
    }

    fn state(id: u32, name: &str) -> ChannelState {
        ChannelState {
            channel_id: Some(id),
            name: Some(name.to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn create_captures_supplied_fields() {
        let blobs = cache();
        let mut packet = state(5, "Lobby");
        packet.parent = Some(0);
        packet.position = Some(3);
        let (channel, fetch) = Channel::from_packet(&packet, &blobs);
        assert_eq!(channel.id, 5);
        assert_eq!(channel.parent, Some(0));
        assert_eq!(channel.name, "Lobby");
        assert_eq!(channel.position, 3);
        assert!(!fetch);
    }

    #[test]
    fn rename_reports_the_previous_name() {
        let blobs = cache();
        let (mut channel, _) = Channel::from_packet(&state(5, "Lobby"), &blobs);
        let (diff, _) = channel.apply(&state(5, "Hall"), &blobs);
        assert_eq!(channel.name, "Hall");
        assert_eq!(diff.name.as_deref(), Some("Lobby"));
        assert!(diff.position.is_none());
        assert!(!diff.is_empty());
    }

    #[test]
    fn identical_update_produces_an_empty_diff() {
        let blobs = cache();
        let (mut channel, _) = Channel::from_packet(&state(5, "Lobby"), &blobs);
        let (diff, fetch) = channel.apply(&state(5, "Lobby"), &blobs);
        assert!(diff.is_empty());
        assert!(!fetch);
    }

    #[test]
    fn unknown_description_hash_requests_a_fetch() {
        let blobs = cache();
        let (mut channel, _) = Channel::from_packet(&state(5, "Lobby"), &blobs);

        let mut packet = ChannelState {
            channel_id: Some(5),
            description_hash: Some(b"h1".to_vec()),
            ..Default::default()
        };
        let (diff, fetch) = channel.apply(&packet, &blobs);
        assert!(fetch);
        // A hash change alone is not an observable field change.
        assert!(diff.is_empty());

        // A full description fills the cache; the same hash afterwards is
        // satisfied locally.
        packet.description = Some("big blob".to_owned());
        let (diff, fetch) = channel.apply(&packet, &blobs);
        assert!(!fetch);
        assert_eq!(diff.description.as_deref(), Some(""));

        let mut fresh = Channel {
            id: 5,
            ..Default::default()
        };
        let hash_only = ChannelState {
            channel_id: Some(5),
            description_hash: Some(b"h1".to_vec()),
            ..Default::default()
        };
        let (_, fetch) = fresh.apply(&hash_only, &blobs);
        assert!(!fetch);
        assert_eq!(fresh.description, "big blob");
    }

    #[test]
    fn link_add_and_remove_adjust_the_set() {
        let blobs = cache();
        let (mut channel, _) = Channel::from_packet(
            &ChannelState {
                channel_id: Some(1),
                links: vec![2, 3],
                ..Default::default()
            },
            &blobs,
        );

        let packet = ChannelState {
            channel_id: Some(1),
            links_add: vec![4],
            links_remove: vec![2],
            ..Default::default()
        };
        let (diff, _) = channel.apply(&packet, &blobs);
        assert_eq!(channel.links, vec![3, 4]);
        assert_eq!(diff.links, Some(vec![2, 3]));
    }
}
