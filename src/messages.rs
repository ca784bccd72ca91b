//! Control-channel message type codes and the inbound event views handed to
//! callbacks.

use bytes::Bytes;
use num_derive::FromPrimitive;

use crate::state::{Channel, User};

/// Type codes of the framed control messages, as assigned by the protocol.
/// Codes outside this table are logged and ignored.
#[repr(u16)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Clone, Copy)]
pub enum MessageType {
    Version = 0,
    UdpTunnel,
    Authenticate,
    Ping,
    Reject,
    ServerSync,
    ChannelRemove,
    ChannelState,
    UserRemove,
    UserState,
    BanList,
    TextMessage,
    PermissionDenied,
    Acl,
    QueryUsers,
    CryptSetup,
    ContextActionModify,
    ContextAction,
    UserList,
    VoiceTarget,
    PermissionQuery,
    CodecVersion,
    UserStats,
    RequestBlob,
    ServerConfig,
    SuggestConfig,
    PluginDataTransmission,
}

/// Encode a control message body; the frame header is added by the writer.
pub fn encode_payload<M: prost::Message>(message: &M) -> Bytes {
    message.encode_to_vec().into()
}

/// An inbound text message, resolved against the replicated state. Either
/// side may be unresolvable if the message raced a roster change.
#[derive(Debug, Clone)]
pub struct TextMessageEvent {
    pub author: Option<User>,
    pub channel: Option<Channel>,
    pub content: String,
}

/// A server-reported permission denial.
#[derive(Debug, Clone)]
pub struct PermissionDeniedEvent {
    pub session: Option<u32>,
    pub channel_id: Option<u32>,
    pub name: Option<String>,
    pub deny_type: i32,
    pub reason: Option<String>,
}
