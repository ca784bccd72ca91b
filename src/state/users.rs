use crate::blobs::{BlobCache, BlobKind};
use crate::mumble_proto::UserState;

/// One replicated user, keyed by ephemeral session id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    pub session: u32,
    /// Stable identity hash of the user certificate; empty for anonymous
    /// users.
    pub hash: String,
    pub name: String,
    pub channel_id: u32,
    pub user_id: Option<u32>,
    pub muted: bool,
    pub self_muted: bool,
    pub deafened: bool,
    pub self_deafened: bool,
    pub suppressed: bool,
    pub priority_speaker: bool,
    pub recording: bool,
    pub comment: String,
    pub comment_hash: Vec<u8>,
    pub texture: Vec<u8>,
    pub texture_hash: Vec<u8>,
}

/// Previous values of the fields a `UserState` actually changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserDiff {
    pub name: Option<String>,
    pub channel_id: Option<u32>,
    pub muted: Option<bool>,
    pub self_muted: Option<bool>,
    pub deafened: Option<bool>,
    pub self_deafened: Option<bool>,
    pub suppressed: Option<bool>,
    pub priority_speaker: Option<bool>,
    pub recording: Option<bool>,
    pub comment: Option<String>,
    pub texture: Option<Vec<u8>>,
}

impl UserDiff {
    pub fn is_empty(&self) -> bool {
        *self == UserDiff::default()
    }
}

/// Blob fetches a user state made necessary.
#[derive(Debug, Default, PartialEq)]
pub struct UserBlobNeeds {
    pub comment: bool,
    pub texture: bool,
}

impl User {
    pub fn from_packet(packet: &UserState, blobs: &BlobCache) -> (User, UserBlobNeeds) {
        let mut user = User {
            session: packet.session(),
            hash: packet.hash().to_owned(),
            name: packet.name().to_owned(),
            channel_id: packet.channel_id(),
            user_id: packet.user_id,
            muted: packet.mute(),
            self_muted: packet.self_mute(),
            deafened: packet.deaf(),
            self_deafened: packet.self_deaf(),
            suppressed: packet.suppress(),
            priority_speaker: packet.priority_speaker(),
            recording: packet.recording(),
            comment: packet.comment().to_owned(),
            comment_hash: packet.comment_hash().to_vec(),
            texture: packet.texture().to_vec(),
            texture_hash: packet.texture_hash().to_vec(),
        };

        let mut needs = UserBlobNeeds::default();
        if packet.comment.is_some() {
            blobs.put(
                BlobKind::UserComment,
                &user.hash,
                &user.comment_hash,
                user.comment.as_bytes(),
            );
        } else if !user.comment_hash.is_empty() {
            if blobs.has(BlobKind::UserComment, &user.hash, &user.comment_hash) {
                if let Some(payload) = blobs.get(BlobKind::UserComment, &user.hash) {
                    user.comment = String::from_utf8_lossy(&payload).into_owned();
                }
            } else {
                needs.comment = true;
            }
        }
        if packet.texture.is_some() {
            blobs.put(
                BlobKind::UserTexture,
                &user.hash,
                &user.texture_hash,
                &user.texture,
            );
        } else if !user.texture_hash.is_empty() {
            if blobs.has(BlobKind::UserTexture, &user.hash, &user.texture_hash) {
                if let Some(payload) = blobs.get(BlobKind::UserTexture, &user.hash) {
                    user.texture = payload;
                }
            } else {
                needs.texture = true;
            }
        }

        (user, needs)
    }

    /// Diff the supplied fields against the current state and apply them.
    pub fn apply(&mut self, packet: &UserState, blobs: &BlobCache) -> (UserDiff, UserBlobNeeds) {
        let mut diff = UserDiff::default();
        let mut needs = UserBlobNeeds::default();

        if packet.name.is_some() && self.name != packet.name() {
            diff.name = Some(std::mem::replace(&mut self.name, packet.name().to_owned()));
        }
        if packet.channel_id.is_some() && self.channel_id != packet.channel_id() {
            diff.channel_id = Some(self.channel_id);
            self.channel_id = packet.channel_id();
        }
        if packet.mute.is_some() && self.muted != packet.mute() {
            diff.muted = Some(self.muted);
            self.muted = packet.mute();
        }
        if packet.self_mute.is_some() && self.self_muted != packet.self_mute() {
            diff.self_muted = Some(self.self_muted);
            self.self_muted = packet.self_mute();
        }
        if packet.deaf.is_some() && self.deafened != packet.deaf() {
            diff.deafened = Some(self.deafened);
            self.deafened = packet.deaf();
        }
        if packet.self_deaf.is_some() && self.self_deafened != packet.self_deaf() {
            diff.self_deafened = Some(self.self_deafened);
            self.self_deafened = packet.self_deaf();
        }
        if packet.suppress.is_some() && self.suppressed != packet.suppress() {
            diff.suppressed = Some(self.suppressed);
            self.suppressed = packet.suppress();
        }
        if packet.priority_speaker.is_some() && self.priority_speaker != packet.priority_speaker()
        {
            diff.priority_speaker = Some(self.priority_speaker);
            self.priority_speaker = packet.priority_speaker();
        }
        if packet.recording.is_some() && self.recording != packet.recording() {
            diff.recording = Some(self.recording);
            self.recording = packet.recording();
        }
        if let Some(user_id) = packet.user_id {
            self.user_id = Some(user_id);
        }

        if packet.comment_hash.is_some() && self.comment_hash != packet.comment_hash() {
            self.comment_hash = packet.comment_hash().to_vec();
            if blobs.has(BlobKind::UserComment, &self.hash, &self.comment_hash) {
                if let Some(payload) = blobs.get(BlobKind::UserComment, &self.hash) {
                    self.comment = String::from_utf8_lossy(&payload).into_owned();
                }
            } else {
                needs.comment = true;
            }
        }
        if packet.comment.is_some() && self.comment != packet.comment() {
            diff.comment = Some(std::mem::replace(
                &mut self.comment,
                packet.comment().to_owned(),
            ));
            if self.comment.is_empty() {
                self.comment_hash.clear();
            }
            blobs.put(
                BlobKind::UserComment,
                &self.hash,
                &self.comment_hash,
                self.comment.as_bytes(),
            );
            needs.comment = false;
        }

        if packet.texture_hash.is_some() && self.texture_hash != packet.texture_hash() {
            self.texture_hash = packet.texture_hash().to_vec();
            if blobs.has(BlobKind::UserTexture, &self.hash, &self.texture_hash) {
                if let Some(payload) = blobs.get(BlobKind::UserTexture, &self.hash) {
                    self.texture = payload;
                }
            } else {
                needs.texture = true;
            }
        }
        if packet.texture.is_some() && self.texture != packet.texture() {
            diff.texture = Some(std::mem::replace(
                &mut self.texture,
                packet.texture().to_vec(),
            ));
            if self.texture.is_empty() {
                self.texture_hash.clear();
            }
            blobs.put(
                BlobKind::UserTexture,
                &self.hash,
                &self.texture_hash,
                &self.texture,
            );
            needs.texture = false;
        }

        (diff, needs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> BlobCache {
        BlobCache::open(None).unwrap()
    }

    fn joined(session: u32, name: &str) -> UserState {
        UserState {
            session: Some(session),
            name: Some(name.to_owned()),
            channel_id: Some(0),
            hash: Some(format!("hash-{session}")),
            ..Default::default()
        }
    }

    #[test]
    fn mute_toggle_reports_previous_value() {
        let blobs = cache();
        let (mut user, _) = User::from_packet(&joined(3, "alice"), &blobs);
        assert!(!user.muted);

        let packet = UserState {
            session: Some(3),
            mute: Some(true),
            ..Default::default()
        };
        let (diff, _) = user.apply(&packet, &blobs);
        assert!(user.muted);
        assert_eq!(diff.muted, Some(false));
        assert!(diff.channel_id.is_none());
    }

    #[test]
    fn channel_move_is_diffed() {
        let blobs = cache();
        let (mut user, _) = User::from_packet(&joined(3, "alice"), &blobs);
        let packet = UserState {
            session: Some(3),
            channel_id: Some(9),
            ..Default::default()
        };
        let (diff, _) = user.apply(&packet, &blobs);
        assert_eq!(user.channel_id, 9);
        assert_eq!(diff.channel_id, Some(0));
    }

    #[test]
    fn repeated_state_is_an_empty_diff() {
        let blobs = cache();
        let (mut user, _) = User::from_packet(&joined(3, "alice"), &blobs);
        let (diff, needs) = user.apply(&joined(3, "alice"), &blobs);
        assert!(diff.is_empty());
        assert_eq!(needs, UserBlobNeeds::default());
    }

    #[test]
    fn comment_hash_gates_the_fetch() {
        let blobs = cache();
        let (mut user, _) = User::from_packet(&joined(3, "alice"), &blobs);

        let packet = UserState {
            session: Some(3),
            comment_hash: Some(b"c1".to_vec()),
            ..Default::default()
        };
        let (diff, needs) = user.apply(&packet, &blobs);
        assert!(needs.comment);
        assert!(diff.is_empty());

        // The blob arrives as a full comment; a rejoin with the same hash is
        // then served from the cache.
        let packet = UserState {
            session: Some(3),
            comment_hash: Some(b"c1".to_vec()),
            comment: Some("novel".to_owned()),
            ..Default::default()
        };
        let (diff, needs) = user.apply(&packet, &blobs);
        assert!(!needs.comment);
        assert_eq!(diff.comment.as_deref(), Some(""));

        let (user2, needs) = User::from_packet(
            &UserState {
                session: Some(7),
                hash: Some("hash-3".to_owned()),
                comment_hash: Some(b"c1".to_vec()),
                ..Default::default()
            },
            &blobs,
        );
        assert!(!needs.comment);
        assert_eq!(user2.comment, "novel");
    }

    #[test]
    fn full_texture_lands_in_the_cache() {
        let blobs = cache();
        let (mut user, _) = User::from_packet(&joined(3, "alice"), &blobs);
        let packet = UserState {
            session: Some(3),
            texture_hash: Some(b"t1".to_vec()),
            texture: Some(vec![1, 2, 3]),
            ..Default::default()
        };
        let (diff, needs) = user.apply(&packet, &blobs);
        assert!(!needs.texture);
        assert_eq!(diff.texture, Some(Vec::new()));
        assert!(blobs.has(BlobKind::UserTexture, "hash-3", b"t1"));
    }
}
