//! Voice-datagram payload codecs.
//!
//! Two wire variants exist: the legacy bit-packed header (servers < 1.5.0)
//! and the protobuf framing with a one-byte kind tag (>= 1.5.0). The voice
//! stack picks the variant per negotiated server version; this module only
//! builds and parses the plaintext payloads that the OCB2 layer wraps.

use bytes::{BufMut, Bytes, BytesMut};
use num_traits::FromPrimitive;
use prost::Message;
use thiserror::Error;

use crate::audio::AudioType;
use crate::messages::MessageType;
use crate::mumble_proto;
use crate::mumble_udp;
use crate::varint::{self, BufMutExt};

/// Kind tag leading every protobuf-variant datagram.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpMessageType {
    Audio = 0,
    Ping = 1,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("datagram is truncated")]
    Truncated,
    #[error("unknown datagram kind {0}")]
    UnknownKind(u8),
    #[error("malformed protobuf payload")]
    Proto,
}

impl From<varint::VarintError> for ParseError {
    fn from(_: varint::VarintError) -> Self {
        ParseError::Truncated
    }
}

impl From<prost::DecodeError> for ParseError {
    fn from(_: prost::DecodeError) -> Self {
        ParseError::Proto
    }
}

/// An outbound voice datagram before encryption.
#[derive(Debug, Clone)]
pub enum UdpData {
    Audio(AudioData),
    Ping(PingData),
}

#[derive(Debug, Clone)]
pub struct AudioData {
    pub opus: Bytes,
    pub sequence: u64,
    pub target: u8,
    pub positional: Option<[f32; 3]>,
}

#[derive(Debug, Clone, Default)]
pub struct PingData {
    /// Nanosecond-resolution nonce, echoed back by the server.
    pub timestamp: u64,
    pub request_extended_information: bool,
}

impl UdpData {
    pub fn is_ping(&self) -> bool {
        matches!(self, UdpData::Ping(_))
    }

    /// Serialize for the datagram socket in the given wire variant.
    pub fn datagram(&self, legacy: bool) -> Bytes {
        if legacy {
            self.legacy_datagram()
        } else {
            self.proto_datagram()
        }
    }

    fn legacy_datagram(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            UdpData::Audio(audio) => {
                buf.put_u8((AudioType::Opus as u8) << 5 | audio.target & 0b0001_1111);
                buf.put_varint(audio.sequence);
                // 14-bit length; the 0x2000 bit would mark additional
                // frames, which the encoder never emits.
                buf.put_varint(audio.opus.len() as u64 & 0x1FFF);
                buf.put_slice(&audio.opus);
                if let Some(pos) = audio.positional {
                    for coord in pos {
                        buf.put_f32_le(coord);
                    }
                }
            }
            UdpData::Ping(ping) => {
                if ping.request_extended_information {
                    buf.put_slice(&[0, 0, 0, 0]);
                } else {
                    buf.put_u8((AudioType::Ping as u8) << 5);
                }
                buf.put_varint(ping.timestamp);
            }
        }
        buf.freeze()
    }

    fn proto_datagram(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            UdpData::Audio(audio) => {
                buf.put_u8(UdpMessageType::Audio as u8);
                let packet = mumble_udp::Audio {
                    header: Some(mumble_udp::audio::Header::Target(u32::from(audio.target))),
                    frame_number: audio.sequence,
                    opus_data: audio.opus.to_vec(),
                    positional_data: audio
                        .positional
                        .map(|p| p.to_vec())
                        .unwrap_or_default(),
                    ..Default::default()
                };
                buf.put_slice(&packet.encode_to_vec());
            }
            UdpData::Ping(ping) => {
                buf.put_u8(UdpMessageType::Ping as u8);
                let packet = mumble_udp::Ping {
                    timestamp: ping.timestamp,
                    request_extended_information: ping.request_extended_information,
                    ..Default::default()
                };
                buf.put_slice(&packet.encode_to_vec());
            }
        }
        buf.freeze()
    }

    /// Serialize for the reliable-channel fallback. The legacy variant is
    /// tunnelled raw; the protobuf variant is wrapped in a `UDPTunnel`
    /// message. Returns the control frame payload and its type code.
    pub fn tunnel_frame(&self, legacy: bool) -> (MessageType, Bytes) {
        if legacy {
            (MessageType::UdpTunnel, self.legacy_datagram())
        } else {
            let wrapper = mumble_proto::UdpTunnel {
                packet: self.proto_datagram().to_vec(),
            };
            (MessageType::UdpTunnel, wrapper.encode_to_vec().into())
        }
    }
}

/// A decrypted (or tunnelled) inbound voice datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundVoice {
    Audio(InboundAudio),
    Ping(InboundPing),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundAudio {
    pub session: u32,
    pub sequence: u64,
    pub codec: AudioType,
    pub target: u8,
    pub data: Bytes,
    pub positional: Option<[f32; 3]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundPing {
    pub timestamp: u64,
    pub max_bandwidth_per_user: Option<u32>,
}

pub fn parse(payload: &[u8], legacy: bool) -> Result<InboundVoice, ParseError> {
    if legacy {
        parse_legacy(payload)
    } else {
        parse_proto(payload)
    }
}

fn parse_proto(payload: &[u8]) -> Result<InboundVoice, ParseError> {
    let (&kind, body) = payload.split_first().ok_or(ParseError::Truncated)?;
    match kind {
        k if k == UdpMessageType::Audio as u8 => {
            let packet = mumble_udp::Audio::decode(body)?;
            let target = match packet.header {
                Some(mumble_udp::audio::Header::Target(t)) => t as u8,
                _ => 0,
            };
            Ok(InboundVoice::Audio(InboundAudio {
                session: packet.sender_session,
                sequence: packet.frame_number,
                codec: AudioType::Opus,
                target,
                data: packet.opus_data.into(),
                positional: positional_triple(&packet.positional_data),
            }))
        }
        k if k == UdpMessageType::Ping as u8 => {
            let packet = mumble_udp::Ping::decode(body)?;
            Ok(InboundVoice::Ping(InboundPing {
                timestamp: packet.timestamp,
                max_bandwidth_per_user: (packet.max_bandwidth_per_user != 0)
                    .then_some(packet.max_bandwidth_per_user),
            }))
        }
        other => Err(ParseError::UnknownKind(other)),
    }
}

fn parse_legacy(payload: &[u8]) -> Result<InboundVoice, ParseError> {
    let (&header, rest) = payload.split_first().ok_or(ParseError::Truncated)?;
    let kind = header >> 5;
    let target = header & 0b0001_1111;

    if kind == AudioType::Ping as u8 {
        let (timestamp, _) = varint::decode(rest)?;
        return Ok(InboundVoice::Ping(InboundPing {
            timestamp,
            max_bandwidth_per_user: None,
        }));
    }

    let codec = AudioType::from_u8(kind).ok_or(ParseError::UnknownKind(kind))?;
    let mut pos = 0;
    let (session, used) = varint::decode(&rest[pos..])?;
    pos += used;
    let (sequence, used) = varint::decode(&rest[pos..])?;
    pos += used;

    let data = if codec == AudioType::Opus {
        let (frame_header, used) = varint::decode(&rest[pos..])?;
        pos += used;
        let len = (frame_header & 0x1FFF) as usize;
        if rest.len() < pos + len {
            return Err(ParseError::Truncated);
        }
        let data = Bytes::copy_from_slice(&rest[pos..pos + len]);
        pos += len;
        data
    } else {
        // CELT/Speex frames are 7-bit length prefixed with a continuation
        // bit. The payload is skipped: decode of these codecs is
        // unsupported, only the framing is understood.
        loop {
            let &frame_header = rest.get(pos).ok_or(ParseError::Truncated)?;
            pos += 1;
            let len = (frame_header & 0x7F) as usize;
            if rest.len() < pos + len {
                return Err(ParseError::Truncated);
            }
            pos += len;
            if frame_header & 0x80 == 0 {
                break;
            }
        }
        Bytes::new()
    };

    let positional = if rest.len() - pos >= 12 {
        let mut coords = [0f32; 3];
        for (i, chunk) in rest[pos..pos + 12].chunks_exact(4).enumerate() {
            coords[i] = f32::from_le_bytes(chunk.try_into().unwrap());
        }
        Some(coords)
    } else {
        None
    };

    Ok(InboundVoice::Audio(InboundAudio {
        session: session as u32,
        sequence,
        codec,
        target,
        data,
        positional,
    }))
}

fn positional_triple(data: &[f32]) -> Option<[f32; 3]> {
    (data.len() >= 3).then(|| [data[0], data[1], data[2]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_audio_layout() {
        let audio = UdpData::Audio(AudioData {
            opus: Bytes::from_static(b"opus!"),
            sequence: 4,
            target: 2,
            positional: None,
        });
        let bytes = audio.datagram(true);
        // Header: type Opus (4) in the top 3 bits, target 2 in the low 5.
        assert_eq!(bytes[0], 4 << 5 | 2);
        // Varint session is absent serverbound; sequence then length.
        assert_eq!(bytes[1], 4);
        assert_eq!(bytes[2], 5);
        assert_eq!(&bytes[3..], b"opus!");
    }

    #[test]
    fn legacy_audio_roundtrip_via_clientbound_form() {
        // Clientbound packets carry the speaker session; build one by hand
        // and parse it.
        let mut buf = BytesMut::new();
        buf.put_u8(4 << 5 | 1);
        buf.put_varint(42); // session
        buf.put_varint(96); // sequence
        buf.put_varint(5); // frame length, terminator
        buf.put_slice(b"opus!");
        for coord in [1.0f32, 2.0, 3.0] {
            buf.put_f32_le(coord);
        }

        let parsed = parse(&buf, true).unwrap();
        assert_eq!(
            parsed,
            InboundVoice::Audio(InboundAudio {
                session: 42,
                sequence: 96,
                codec: AudioType::Opus,
                target: 1,
                data: Bytes::from_static(b"opus!"),
                positional: Some([1.0, 2.0, 3.0]),
            })
        );
    }

    #[test]
    fn legacy_ping_roundtrip() {
        let ping = UdpData::Ping(PingData {
            timestamp: 123_456_789,
            request_extended_information: false,
        });
        let bytes = ping.datagram(true);
        assert_eq!(bytes[0], 1 << 5);
        match parse(&bytes, true).unwrap() {
            InboundVoice::Ping(p) => assert_eq!(p.timestamp, 123_456_789),
            other => panic!("expected ping, got {other:?}"),
        }
    }

    #[test]
    fn proto_audio_roundtrip() {
        let audio = UdpData::Audio(AudioData {
            opus: Bytes::from_static(b"frame"),
            sequence: 12,
            target: 2,
            positional: Some([0.5, -1.5, 2.5]),
        });
        let bytes = audio.datagram(false);
        assert_eq!(bytes[0], UdpMessageType::Audio as u8);
        match parse(&bytes, false).unwrap() {
            InboundVoice::Audio(a) => {
                assert_eq!(a.sequence, 12);
                assert_eq!(a.target, 2);
                assert_eq!(a.codec, AudioType::Opus);
                assert_eq!(a.data.as_ref(), b"frame");
                assert_eq!(a.positional, Some([0.5, -1.5, 2.5]));
            }
            other => panic!("expected audio, got {other:?}"),
        }
    }

    #[test]
    fn proto_ping_carries_extended_info() {
        let packet = mumble_udp::Ping {
            timestamp: 7,
            max_bandwidth_per_user: 128_000,
            ..Default::default()
        };
        let mut bytes = vec![UdpMessageType::Ping as u8];
        bytes.extend_from_slice(&packet.encode_to_vec());
        match parse(&bytes, false).unwrap() {
            InboundVoice::Ping(p) => {
                assert_eq!(p.timestamp, 7);
                assert_eq!(p.max_bandwidth_per_user, Some(128_000));
            }
            other => panic!("expected ping, got {other:?}"),
        }
    }

    #[test]
    fn celt_frames_parse_but_carry_no_data() {
        let mut buf = BytesMut::new();
        buf.put_u8(0); // CELT alpha, target 0
        buf.put_varint(3); // session
        buf.put_varint(0); // sequence
        buf.put_u8(0x80 | 2); // 2-byte frame, continuation set
        buf.put_slice(&[0xAA, 0xBB]);
        buf.put_u8(1); // final 1-byte frame
        buf.put_u8(0xCC);

        match parse(&buf, true).unwrap() {
            InboundVoice::Audio(a) => {
                assert_eq!(a.codec, AudioType::CeltAlpha);
                assert!(a.data.is_empty());
            }
            other => panic!("expected audio, got {other:?}"),
        }
    }

    #[test]
    fn unknown_proto_kind_is_rejected() {
        assert_eq!(parse(&[9, 1, 2, 3], false), Err(ParseError::UnknownKind(9)));
        assert_eq!(parse(&[], false), Err(ParseError::Truncated));
    }

    #[test]
    fn tunnel_frame_wraps_proto_variant() {
        let ping = UdpData::Ping(PingData {
            timestamp: 99,
            request_extended_information: false,
        });
        let (ty, payload) = ping.tunnel_frame(false);
        assert_eq!(ty, MessageType::UdpTunnel);
        let wrapper = mumble_proto::UdpTunnel::decode(payload.as_ref()).unwrap();
        assert_eq!(wrapper.packet[0], UdpMessageType::Ping as u8);

        let (ty, payload) = ping.tunnel_frame(true);
        assert_eq!(ty, MessageType::UdpTunnel);
        assert_eq!(payload[0], 1 << 5);
    }
}
