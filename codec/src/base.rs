// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

use crate::{ByteArray, DecodeError, EncodeError, PacketType};

/// Decode packet from byte array.
pub trait DecodePacket: Sized {
    /// Decode self from `ba`.
    ///
    /// # Errors
    ///
    /// Returns error if byte array is malformed or incomplete.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}

/// Encode packet to byte stream.
pub trait EncodePacket {
    /// Encode self into `buf` and return number of bytes appended.
    ///
    /// # Errors
    ///
    /// Returns error if packet fields are invalid.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

/// Common operations of control packets.
pub trait Packet {
    fn packet_type(&self) -> PacketType;
}

/// Packet identifier of control packet.
///
/// SUBSCRIBE, UNSUBSCRIBE, and PUBLISH (in cases where QoS > 0) Control Packets
/// MUST contain a non-zero 16-bit Packet Identifier [MQTT-2.3.1-1].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId(u16);

impl PacketId {
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        2
    }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let value = ba.read_u16()?;
        Ok(Self(value))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.extend_from_slice(&self.0.to_be_bytes());
        Ok(Self::bytes())
    }
}

/// Quality of service level of application messages.
#[repr(u8)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,

    /// At least once delivery.
    AtLeastOnce = 1,

    /// Exactly once delivery.
    ExactOnce = 2,
}

impl QoS {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }

    /// Return the smaller of two QoS values.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

/// Protocol level in Connect packet variable header.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolLevel {
    /// MQTT 3.1
    V31 = 3,

    /// MQTT 3.1.1
    #[default]
    V311 = 4,

    /// MQTT 5.0
    V5 = 5,
}

impl ProtocolLevel {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for ProtocolLevel {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            3 => Ok(Self::V31),
            4 => Ok(Self::V311),
            5 => Ok(Self::V5),
            _ => Err(DecodeError::InvalidProtocolLevel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_min() {
        assert_eq!(QoS::ExactOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::AtMostOnce.min(QoS::ExactOnce), QoS::AtMostOnce);
        assert_eq!(QoS::AtLeastOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
    }

    #[test]
    fn test_packet_id_round_trip() {
        let mut buf = Vec::new();
        let packet_id = PacketId::new(0x1a2b);
        let _ = packet_id.encode(&mut buf);
        assert_eq!(&buf, &[0x1a, 0x2b]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(PacketId::decode(&mut ba), Ok(packet_id));
    }
}
