//! Outbound command construction.
//!
//! Every command is a type code plus a pre-encoded payload, built and
//! validated synchronously so the command queue carries only wire-ready
//! messages. Text size limits are enforced here, against the most recent
//! server-advertised settings; a violating message never reaches the queue.

use bytes::Bytes;

use crate::error::Error;
use crate::messages::{encode_payload, MessageType};
use crate::mumble_proto;

/// Server-advertised limits, updated from `ServerConfig`.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub allow_html: bool,
    pub max_message_length: u32,
    pub max_image_message_length: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            allow_html: true,
            max_message_length: 5000,
            max_image_message_length: 131_072,
        }
    }
}

/// A wire-ready outbound command.
#[derive(Debug, Clone)]
pub struct Command {
    pub ty: MessageType,
    pub payload: Bytes,
}

/// Optional `UserState` fields for [`Command::modify_user_state`].
#[derive(Debug, Clone, Default)]
pub struct UserStateUpdate {
    pub mute: Option<bool>,
    pub self_mute: Option<bool>,
    pub deaf: Option<bool>,
    pub self_deaf: Option<bool>,
    pub suppress: Option<bool>,
    pub recording: Option<bool>,
    pub comment: Option<String>,
    pub texture: Option<Vec<u8>>,
    pub user_id: Option<u32>,
    pub plugin_context: Option<Vec<u8>>,
    pub listening_channel_add: Vec<u32>,
    pub listening_channel_remove: Vec<u32>,
}

/// Optional `ChannelState` fields for [`Command::update_channel`].
#[derive(Debug, Clone, Default)]
pub struct ChannelUpdate {
    pub name: Option<String>,
    pub parent: Option<u32>,
    pub position: Option<i32>,
    pub max_users: Option<u32>,
    pub description: Option<String>,
    pub links_add: Vec<u32>,
    pub links_remove: Vec<u32>,
}

/// One group row of an ACL update.
#[derive(Debug, Clone, Default)]
pub struct AclGroupUpdate {
    pub name: String,
    pub inherit: Option<bool>,
    pub inheritable: Option<bool>,
    pub add: Vec<u32>,
    pub remove: Vec<u32>,
}

/// One entry row of an ACL update.
#[derive(Debug, Clone, Default)]
pub struct AclEntryUpdate {
    pub apply_here: Option<bool>,
    pub apply_subs: Option<bool>,
    pub user_id: Option<u32>,
    pub group: Option<String>,
    pub grant: Option<u32>,
    pub deny: Option<u32>,
}

impl Command {
    /// Move a user into a channel.
    pub fn move_user(session: u32, channel_id: u32) -> Command {
        let packet = mumble_proto::UserState {
            session: Some(session),
            channel_id: Some(channel_id),
            ..Default::default()
        };
        Command {
            ty: MessageType::UserState,
            payload: encode_payload(&packet),
        }
    }

    /// Text message to any mix of channels and users. Image messages are
    /// checked against the image limit, plain ones against the message
    /// limit.
    pub fn text_message(
        settings: &ServerSettings,
        sessions: &[u32],
        channel_ids: &[u32],
        message: impl Into<String>,
    ) -> Result<Command, Error> {
        let message = message.into();
        let is_image = message.contains("<img") && message.contains("src");
        if is_image {
            if message.len() > settings.max_image_message_length as usize {
                return Err(Error::ImageTooBig {
                    len: message.len(),
                    max: settings.max_image_message_length,
                });
            }
        } else if message.len() > settings.max_message_length as usize {
            return Err(Error::TextTooLong {
                len: message.len(),
                max: settings.max_message_length,
            });
        }

        let packet = mumble_proto::TextMessage {
            session: sessions.to_vec(),
            channel_id: channel_ids.to_vec(),
            message,
            ..Default::default()
        };
        Ok(Command {
            ty: MessageType::TextMessage,
            payload: encode_payload(&packet),
        })
    }

    pub fn modify_user_state(session: u32, update: UserStateUpdate) -> Command {
        let packet = mumble_proto::UserState {
            session: Some(session),
            mute: update.mute,
            self_mute: update.self_mute,
            deaf: update.deaf,
            self_deaf: update.self_deaf,
            suppress: update.suppress,
            recording: update.recording,
            comment: update.comment,
            texture: update.texture,
            user_id: update.user_id,
            plugin_context: update.plugin_context,
            listening_channel_add: update.listening_channel_add,
            listening_channel_remove: update.listening_channel_remove,
            ..Default::default()
        };
        Command {
            ty: MessageType::UserState,
            payload: encode_payload(&packet),
        }
    }

    /// Kick, or ban when `ban` is set.
    pub fn remove_user(session: u32, reason: impl Into<String>, ban: bool) -> Command {
        let packet = mumble_proto::UserRemove {
            session,
            reason: Some(reason.into()),
            ban: Some(ban),
            ..Default::default()
        };
        Command {
            ty: MessageType::UserRemove,
            payload: encode_payload(&packet),
        }
    }

    pub fn create_channel(parent: u32, name: impl Into<String>, temporary: bool) -> Command {
        let packet = mumble_proto::ChannelState {
            parent: Some(parent),
            name: Some(name.into()),
            temporary: Some(temporary),
            ..Default::default()
        };
        Command {
            ty: MessageType::ChannelState,
            payload: encode_payload(&packet),
        }
    }

    pub fn remove_channel(channel_id: u32) -> Command {
        let packet = mumble_proto::ChannelRemove { channel_id };
        Command {
            ty: MessageType::ChannelRemove,
            payload: encode_payload(&packet),
        }
    }

    pub fn update_channel(channel_id: u32, update: ChannelUpdate) -> Command {
        let packet = mumble_proto::ChannelState {
            channel_id: Some(channel_id),
            name: update.name,
            parent: update.parent,
            position: update.position,
            max_users: update.max_users,
            description: update.description,
            links_add: update.links_add,
            links_remove: update.links_remove,
            ..Default::default()
        };
        Command {
            ty: MessageType::ChannelState,
            payload: encode_payload(&packet),
        }
    }

    pub fn query_acl(channel_id: u32) -> Command {
        let packet = mumble_proto::Acl {
            channel_id,
            query: Some(true),
            ..Default::default()
        };
        Command {
            ty: MessageType::Acl,
            payload: encode_payload(&packet),
        }
    }

    pub fn update_acl(
        channel_id: u32,
        inherit_acls: bool,
        groups: Vec<AclGroupUpdate>,
        entries: Vec<AclEntryUpdate>,
    ) -> Command {
        let packet = mumble_proto::Acl {
            channel_id,
            inherit_acls: Some(inherit_acls),
            groups: groups
                .into_iter()
                .map(|g| mumble_proto::acl::ChanGroup {
                    name: g.name,
                    inherit: g.inherit,
                    inheritable: g.inheritable,
                    add: g.add,
                    remove: g.remove,
                    ..Default::default()
                })
                .collect(),
            acls: entries
                .into_iter()
                .map(|a| mumble_proto::acl::ChanAcl {
                    apply_here: a.apply_here,
                    apply_subs: a.apply_subs,
                    user_id: a.user_id,
                    group: a.group,
                    grant: a.grant,
                    deny: a.deny,
                    ..Default::default()
                })
                .collect(),
            query: Some(false),
        };
        Command {
            ty: MessageType::Acl,
            payload: encode_payload(&packet),
        }
    }

    /// Register a whisper target aimed at a set of users.
    pub fn whisper_users(id: u32, sessions: &[u32]) -> Command {
        let target = mumble_proto::voice_target::Target {
            session: sessions.to_vec(),
            ..Default::default()
        };
        Self::voice_target(id, vec![target])
    }

    /// Register a whisper target aimed at a channel.
    pub fn whisper_channel(id: u32, channel_id: u32) -> Command {
        let target = mumble_proto::voice_target::Target {
            channel_id: Some(channel_id),
            ..Default::default()
        };
        Self::voice_target(id, vec![target])
    }

    /// Clear a previously registered whisper target.
    pub fn clear_whisper(id: u32) -> Command {
        Self::voice_target(id, Vec::new())
    }

    fn voice_target(id: u32, targets: Vec<mumble_proto::voice_target::Target>) -> Command {
        let packet = mumble_proto::VoiceTarget {
            id: Some(id),
            targets,
        };
        Command {
            ty: MessageType::VoiceTarget,
            payload: encode_payload(&packet),
        }
    }

    /// Request large blobs (avatars, comments, descriptions) by owner id.
    pub fn request_blob(
        session_textures: &[u32],
        session_comments: &[u32],
        channel_descriptions: &[u32],
    ) -> Command {
        let packet = mumble_proto::RequestBlob {
            session_texture: session_textures.to_vec(),
            session_comment: session_comments.to_vec(),
            channel_description: channel_descriptions.to_vec(),
        };
        Command {
            ty: MessageType::RequestBlob,
            payload: encode_payload(&packet),
        }
    }

    /// Re-send `Authenticate` with an extra access token.
    pub fn reauthenticate(
        username: &str,
        password: &str,
        tokens: &[String],
        extra_token: impl Into<String>,
    ) -> Command {
        let mut all_tokens = tokens.to_vec();
        all_tokens.push(extra_token.into());
        let packet = mumble_proto::Authenticate {
            username: Some(username.to_owned()),
            password: Some(password.to_owned()),
            tokens: all_tokens,
            opus: Some(true),
            ..Default::default()
        };
        Command {
            ty: MessageType::Authenticate,
            payload: encode_payload(&packet),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn move_command_carries_session_and_channel() {
        let cmd = Command::move_user(42, 9);
        assert_eq!(cmd.ty, MessageType::UserState);
        let packet = mumble_proto::UserState::decode(cmd.payload.as_ref()).unwrap();
        assert_eq!(packet.session, Some(42));
        assert_eq!(packet.channel_id, Some(9));
        assert_eq!(packet.mute, None);
    }

    #[test]
    fn oversized_text_fails_locally() {
        let settings = ServerSettings {
            max_message_length: 10,
            ..Default::default()
        };
        let err = Command::text_message(&settings, &[], &[0], "a".repeat(11)).unwrap_err();
        assert!(matches!(err, Error::TextTooLong { len: 11, max: 10 }));
    }

    #[test]
    fn image_messages_use_the_image_limit() {
        let settings = ServerSettings {
            max_message_length: 10,
            max_image_message_length: 1000,
            ..Default::default()
        };
        // Longer than the text limit, but images are held to the image limit.
        let body = format!("<img src=\"data:{}\"/>", "x".repeat(100));
        let cmd = Command::text_message(&settings, &[], &[0], body).unwrap();
        assert_eq!(cmd.ty, MessageType::TextMessage);

        let body = format!("<img src=\"data:{}\"/>", "x".repeat(2000));
        let err = Command::text_message(&settings, &[], &[0], body).unwrap_err();
        assert!(matches!(err, Error::ImageTooBig { max: 1000, .. }));
    }

    #[test]
    fn whisper_users_builds_one_target_with_all_sessions() {
        let cmd = Command::whisper_users(2, &[7, 8]);
        let packet = mumble_proto::VoiceTarget::decode(cmd.payload.as_ref()).unwrap();
        assert_eq!(packet.id, Some(2));
        assert_eq!(packet.targets.len(), 1);
        assert_eq!(packet.targets[0].session, vec![7, 8]);
        assert_eq!(packet.targets[0].channel_id, None);
    }

    #[test]
    fn clear_whisper_has_no_targets() {
        let cmd = Command::clear_whisper(0);
        let packet = mumble_proto::VoiceTarget::decode(cmd.payload.as_ref()).unwrap();
        assert_eq!(packet.id, Some(0));
        assert!(packet.targets.is_empty());
    }

    #[test]
    fn update_channel_sets_only_the_given_fields() {
        let cmd = Command::update_channel(
            5,
            ChannelUpdate {
                name: Some("Lobby".into()),
                links_add: vec![6],
                ..Default::default()
            },
        );
        let packet = mumble_proto::ChannelState::decode(cmd.payload.as_ref()).unwrap();
        assert_eq!(packet.channel_id, Some(5));
        assert_eq!(packet.name.as_deref(), Some("Lobby"));
        assert_eq!(packet.links_add, vec![6]);
        assert_eq!(packet.parent, None);
        assert_eq!(packet.max_users, None);
    }

    #[test]
    fn reauthenticate_appends_the_new_token() {
        let cmd = Command::reauthenticate("user", "pw", &["a".into()], "b");
        let packet = mumble_proto::Authenticate::decode(cmd.payload.as_ref()).unwrap();
        assert_eq!(packet.tokens, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(packet.opus, Some(true));
    }
}
