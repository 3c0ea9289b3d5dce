// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;
use std::io::Write;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet,
    PacketId, PacketType, PubTopic, QoS,
};

/// Transport of application messages, from the Client to the Server or from
/// the Server to the Client.
///
/// Basic structure of packet:
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// |                       |
/// +-----------------------+
/// | Topic name length     |
/// |                       |
/// +-----------------------+
/// | Topic name ...        |
/// +-----------------------+
/// | Packet Identifier     |
/// |                       |
/// +-----------------------+
/// | Msg payload ...       |
/// +-----------------------+
/// ```
///
/// Note that `packet_id` only appears in QoS 1 and QoS 2 packets.
///
/// Response of `PublishPacket`:
/// * QoS 0, no response
/// * QoS 1, `PublishAckPacket`
/// * QoS 2, `PublishReceivedPacket`
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    /// False means this is the first occasion the packet is sent, true means
    /// it might be a re-delivery of an earlier attempt.
    ///
    /// Must be false if QoS is 0 [MQTT-3.3.1-2].
    dup: bool,

    /// Level of assurance for delivery of this message.
    qos: QoS,

    /// If true on a packet sent to the Server, the message is stored and
    /// delivered to future subscribers of its topic. A retained message with
    /// a zero length payload removes the stored entry.
    ///
    /// The Server sets this flag on messages delivered because of a new
    /// subscription, and clears it on normal forwarding.
    retain: bool,

    /// Topic name, must not contain wildcard characters.
    topic: PubTopic,

    /// Only present when QoS is 1 or 2.
    packet_id: PacketId,

    /// Application payload. Zero length payload is valid.
    msg: Bytes,
}

impl PublishPacket {
    /// Create a new publish packet.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str, qos: QoS, msg: &[u8]) -> Result<Self, EncodeError> {
        let topic = PubTopic::new(topic)?;
        Ok(Self {
            dup: false,
            qos,
            retain: false,
            topic,
            packet_id: PacketId::new(0),
            msg: Bytes::copy_from_slice(msg),
        })
    }

    /// Update `retain` flag.
    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    /// Update `dup` flag.
    ///
    /// # Errors
    ///
    /// Returns error if `dup` is set on a QoS 0 packet.
    pub fn set_dup(&mut self, dup: bool) -> Result<&mut Self, EncodeError> {
        // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
        if dup && self.qos == QoS::AtMostOnce {
            return Err(EncodeError::InvalidData);
        }
        self.dup = dup;
        Ok(self)
    }

    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    /// Update QoS value. Downgrading to QoS 0 clears the packet id.
    pub fn set_qos(&mut self, qos: QoS) -> &mut Self {
        if qos == QoS::AtMostOnce {
            self.packet_id = PacketId::new(0);
            self.dup = false;
        }
        self.qos = qos;
        self
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// The packet id field is only present in packets where the QoS level
    /// is 1 or 2.
    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.msg
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, EncodeError> {
        let mut remaining_length = self.topic.bytes() + self.msg.len();
        if self.qos != QoS::AtMostOnce {
            remaining_length += PacketId::bytes();
        }

        let packet_type = PacketType::Publish {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
        };
        FixedHeader::new(packet_type, remaining_length)
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;

        let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() else {
            return Err(DecodeError::InvalidPacketType);
        };

        // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::InvalidPacketFlags);
        }

        let topic = PubTopic::decode(ba)?;

        let packet_id = if qos == QoS::AtMostOnce {
            PacketId::new(0)
        } else {
            let packet_id = PacketId::decode(ba)?;
            // PUBLISH (in cases where QoS > 0) Control Packets MUST contain
            // a non-zero Packet Identifier [MQTT-2.3.1-1].
            if packet_id.value() == 0 {
                return Err(DecodeError::InvalidPacketId);
            }
            packet_id
        };

        // It is valid for a PUBLISH packet to contain a zero length payload.
        let mut msg_len = fixed_header
            .remaining_length()
            .checked_sub(topic.bytes())
            .ok_or(DecodeError::InvalidRemainingLength)?;
        if qos != QoS::AtMostOnce {
            msg_len = msg_len
                .checked_sub(PacketId::bytes())
                .ok_or(DecodeError::InvalidRemainingLength)?;
        }

        let msg = Bytes::copy_from_slice(ba.read_bytes(msg_len)?);
        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            msg,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;

        self.topic.encode(buf)?;
        if self.qos != QoS::AtMostOnce {
            self.packet_id.encode(buf)?;
        }
        buf.write_all(&self.msg)?;

        Ok(buf.len() - old_len)
    }
}

impl Packet for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_qos0() {
        let packet = PublishPacket::new("a/b", QoS::AtMostOnce, b"hi").unwrap();
        let mut buf = Vec::new();
        let _ = packet.encode(&mut buf).unwrap();
        assert_eq!(
            buf,
            vec![0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']
        );
    }

    #[test]
    fn test_round_trip_qos1() {
        let mut packet = PublishPacket::new("sensors/1", QoS::AtLeastOnce, b"42").unwrap();
        packet.set_packet_id(PacketId::new(10));
        packet.set_retain(true);

        let mut buf = Vec::new();
        let _ = packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.packet_id(), PacketId::new(10));
        assert!(decoded.retain());
    }

    #[test]
    fn test_qos0_with_dup_is_rejected() {
        let mut packet = PublishPacket::new("a", QoS::AtMostOnce, b"").unwrap();
        assert!(packet.set_dup(true).is_err());

        // 0x38 = PUBLISH with dup=1, qos=0.
        let buf = [0x38, 0x03, 0x00, 0x01, b'a'];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishPacket::decode(&mut ba),
            Err(DecodeError::InvalidPacketFlags)
        );
    }

    #[test]
    fn test_qos1_with_zero_packet_id_is_rejected() {
        let buf = [0x32, 0x05, 0x00, 0x01, b'a', 0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishPacket::decode(&mut ba),
            Err(DecodeError::InvalidPacketId)
        );
    }

    #[test]
    fn test_dup_redelivery_qos1() {
        // DUP on QoS 1 marks a re-delivery and is valid.
        let buf = [0x3a, 0x05, 0x00, 0x01, b'a', 0x00, 0x07];
        let mut ba = ByteArray::new(&buf);
        let packet = PublishPacket::decode(&mut ba).unwrap();
        assert!(packet.dup());
        assert_eq!(packet.qos(), QoS::AtLeastOnce);
    }

    #[test]
    fn test_empty_payload() {
        let packet = PublishPacket::new("a/b", QoS::AtMostOnce, b"").unwrap();
        let mut buf = Vec::new();
        let _ = packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert!(decoded.message().is_empty());
    }
}
