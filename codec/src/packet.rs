// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::{
    ByteArray, ConnectAckPacket, ConnectPacket, DecodeError, DecodePacket, DisconnectPacket,
    EncodeError, EncodePacket, FixedHeader, Packet, PacketType, PingRequestPacket,
    PingResponsePacket, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, SubscribeAckPacket, SubscribePacket,
    UnsubscribeAckPacket, UnsubscribePacket,
};

/// Tagged union over all control packet kinds, used to decode whatever
/// arrives next on a stream.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, PartialEq)]
pub enum MqttPacket {
    Connect(ConnectPacket),
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    Subscribe(SubscribePacket),
    SubscribeAck(SubscribeAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingRequest(PingRequestPacket),
    PingResponse(PingResponsePacket),
    Disconnect(DisconnectPacket),
}

impl MqttPacket {
    /// Decode the next control packet from `ba`.
    ///
    /// The whole packet must be available; `InsufficientData` is returned
    /// when only a prefix has arrived so that callers can wait for more
    /// bytes without treating it as a protocol violation.
    ///
    /// # Errors
    ///
    /// Returns error if bytes are malformed or incomplete.
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        // Peek at the fixed header first so we can check that the packet
        // body has arrived in full.
        let start = ba.offset();
        let mut peek = *ba;
        let fixed_header = FixedHeader::decode(&mut peek)?;
        if peek.remaining_bytes() < fixed_header.remaining_length() {
            return Err(DecodeError::InsufficientData);
        }
        let packet_len = (peek.offset() - start) + fixed_header.remaining_length();

        let packet = match fixed_header.packet_type() {
            PacketType::Connect => ConnectPacket::decode(ba).map(Self::Connect),
            PacketType::ConnectAck => ConnectAckPacket::decode(ba).map(Self::ConnectAck),
            PacketType::Publish { .. } => PublishPacket::decode(ba).map(Self::Publish),
            PacketType::PublishAck => PublishAckPacket::decode(ba).map(Self::PublishAck),
            PacketType::PublishReceived => {
                PublishReceivedPacket::decode(ba).map(Self::PublishReceived)
            }
            PacketType::PublishRelease => {
                PublishReleasePacket::decode(ba).map(Self::PublishRelease)
            }
            PacketType::PublishComplete => {
                PublishCompletePacket::decode(ba).map(Self::PublishComplete)
            }
            PacketType::Subscribe => SubscribePacket::decode(ba).map(Self::Subscribe),
            PacketType::SubscribeAck => SubscribeAckPacket::decode(ba).map(Self::SubscribeAck),
            PacketType::Unsubscribe => UnsubscribePacket::decode(ba).map(Self::Unsubscribe),
            PacketType::UnsubscribeAck => {
                UnsubscribeAckPacket::decode(ba).map(Self::UnsubscribeAck)
            }
            PacketType::PingRequest => PingRequestPacket::decode(ba).map(Self::PingRequest),
            PacketType::PingResponse => PingResponsePacket::decode(ba).map(Self::PingResponse),
            PacketType::Disconnect => DisconnectPacket::decode(ba).map(Self::Disconnect),
        }?;

        // The variable header and payload must consume the remaining length
        // in full, otherwise the stream would desynchronize.
        if ba.offset() - start != packet_len {
            return Err(DecodeError::InvalidRemainingLength);
        }
        Ok(packet)
    }
}

impl EncodePacket for MqttPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::Connect(packet) => packet.encode(buf),
            Self::ConnectAck(packet) => packet.encode(buf),
            Self::Publish(packet) => packet.encode(buf),
            Self::PublishAck(packet) => packet.encode(buf),
            Self::PublishReceived(packet) => packet.encode(buf),
            Self::PublishRelease(packet) => packet.encode(buf),
            Self::PublishComplete(packet) => packet.encode(buf),
            Self::Subscribe(packet) => packet.encode(buf),
            Self::SubscribeAck(packet) => packet.encode(buf),
            Self::Unsubscribe(packet) => packet.encode(buf),
            Self::UnsubscribeAck(packet) => packet.encode(buf),
            Self::PingRequest(packet) => packet.encode(buf),
            Self::PingResponse(packet) => packet.encode(buf),
            Self::Disconnect(packet) => packet.encode(buf),
        }
    }
}

impl Packet for MqttPacket {
    fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(packet) => packet.packet_type(),
            Self::ConnectAck(packet) => packet.packet_type(),
            Self::Publish(packet) => packet.packet_type(),
            Self::PublishAck(packet) => packet.packet_type(),
            Self::PublishReceived(packet) => packet.packet_type(),
            Self::PublishRelease(packet) => packet.packet_type(),
            Self::PublishComplete(packet) => packet.packet_type(),
            Self::Subscribe(packet) => packet.packet_type(),
            Self::SubscribeAck(packet) => packet.packet_type(),
            Self::Unsubscribe(packet) => packet.packet_type(),
            Self::UnsubscribeAck(packet) => packet.packet_type(),
            Self::PingRequest(packet) => packet.packet_type(),
            Self::PingResponse(packet) => packet.packet_type(),
            Self::Disconnect(packet) => packet.packet_type(),
        }
    }
}

impl From<ConnectPacket> for MqttPacket {
    fn from(packet: ConnectPacket) -> Self {
        Self::Connect(packet)
    }
}

impl From<ConnectAckPacket> for MqttPacket {
    fn from(packet: ConnectAckPacket) -> Self {
        Self::ConnectAck(packet)
    }
}

impl From<PublishPacket> for MqttPacket {
    fn from(packet: PublishPacket) -> Self {
        Self::Publish(packet)
    }
}

impl From<PublishAckPacket> for MqttPacket {
    fn from(packet: PublishAckPacket) -> Self {
        Self::PublishAck(packet)
    }
}

impl From<PublishReceivedPacket> for MqttPacket {
    fn from(packet: PublishReceivedPacket) -> Self {
        Self::PublishReceived(packet)
    }
}

impl From<PublishReleasePacket> for MqttPacket {
    fn from(packet: PublishReleasePacket) -> Self {
        Self::PublishRelease(packet)
    }
}

impl From<PublishCompletePacket> for MqttPacket {
    fn from(packet: PublishCompletePacket) -> Self {
        Self::PublishComplete(packet)
    }
}

impl From<SubscribePacket> for MqttPacket {
    fn from(packet: SubscribePacket) -> Self {
        Self::Subscribe(packet)
    }
}

impl From<SubscribeAckPacket> for MqttPacket {
    fn from(packet: SubscribeAckPacket) -> Self {
        Self::SubscribeAck(packet)
    }
}

impl From<UnsubscribePacket> for MqttPacket {
    fn from(packet: UnsubscribePacket) -> Self {
        Self::Unsubscribe(packet)
    }
}

impl From<UnsubscribeAckPacket> for MqttPacket {
    fn from(packet: UnsubscribeAckPacket) -> Self {
        Self::UnsubscribeAck(packet)
    }
}

impl From<PingRequestPacket> for MqttPacket {
    fn from(packet: PingRequestPacket) -> Self {
        Self::PingRequest(packet)
    }
}

impl From<PingResponsePacket> for MqttPacket {
    fn from(packet: PingResponsePacket) -> Self {
        Self::PingResponse(packet)
    }
}

impl From<DisconnectPacket> for MqttPacket {
    fn from(packet: DisconnectPacket) -> Self {
        Self::Disconnect(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PacketId, QoS};

    #[test]
    fn test_decode_dispatch() {
        let mut buf = Vec::new();
        let mut publish = PublishPacket::new("a/b", QoS::AtLeastOnce, b"x").unwrap();
        publish.set_packet_id(PacketId::new(2));
        let _ = publish.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let packet = MqttPacket::decode(&mut ba).unwrap();
        assert_eq!(packet, MqttPacket::Publish(publish));
    }

    #[test]
    fn test_decode_partial_packet() {
        let mut buf = Vec::new();
        let publish = PublishPacket::new("a/b", QoS::AtMostOnce, b"payload").unwrap();
        let _ = publish.encode(&mut buf).unwrap();

        // Only a prefix has arrived.
        let mut ba = ByteArray::new(&buf[..buf.len() - 3]);
        assert_eq!(
            MqttPacket::decode(&mut ba),
            Err(DecodeError::InsufficientData)
        );
    }

    #[test]
    fn test_decode_consumes_exactly_one_packet() {
        let mut buf = Vec::new();
        let _ = PingRequestPacket::new().encode(&mut buf).unwrap();
        let _ = DisconnectPacket::new().encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let first = MqttPacket::decode(&mut ba).unwrap();
        assert_eq!(
            first,
            MqttPacket::PingRequest(PingRequestPacket::new())
        );
        let second = MqttPacket::decode(&mut ba).unwrap();
        assert_eq!(second, MqttPacket::Disconnect(DisconnectPacket::new()));
        assert_eq!(ba.remaining_bytes(), 0);
    }
}
