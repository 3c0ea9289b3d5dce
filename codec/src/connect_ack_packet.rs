// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet,
    PacketType,
};

/// Return code in ConnectAck packet variable header.
#[repr(u8)]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum ConnectReturnCode {
    /// Connection accepted.
    #[default]
    Accepted = 0,

    /// The Server does not support the level of the MQTT protocol requested
    /// by the Client.
    UnacceptableProtocolVersion = 1,

    /// The Client identifier is correct UTF-8 but not allowed by the Server.
    IdentifierRejected = 2,

    /// The Network Connection has been made but the MQTT service is
    /// unavailable.
    ServerUnavailable = 3,

    /// The data in the user name or password is malformed.
    BadUserNameOrPassword = 4,

    /// The Client is not authorized to connect.
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::UnacceptableProtocolVersion),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::BadUserNameOrPassword),
            5 => Ok(Self::NotAuthorized),
            _ => Err(DecodeError::InvalidPacketFlags),
        }
    }
}

/// The packet sent by the Server in response to a Connect packet.
///
/// The first packet sent from the Server to the Client MUST be a ConnectAck
/// packet [MQTT-3.2.0-1].
///
/// Basic structure of packet:
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// |                       |
/// +-----------------------+
/// | Ack flags             |
/// +-----------------------+
/// | Return code           |
/// +-----------------------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAckPacket {
    /// Set to true if the Server keeps session state from a previous
    /// connection of this client id [MQTT-3.2.2-2].
    session_present: bool,

    return_code: ConnectReturnCode,
}

impl ConnectAckPacket {
    #[must_use]
    pub const fn new(session_present: bool, return_code: ConnectReturnCode) -> Self {
        // If a server sends a ConnectAck packet containing a non-zero return
        // code it MUST set Session Present to 0 [MQTT-3.2.2-4].
        let session_present =
            matches!(return_code, ConnectReturnCode::Accepted) && session_present;
        Self {
            session_present,
            return_code,
        }
    }

    #[must_use]
    pub const fn session_present(&self) -> bool {
        self.session_present
    }

    #[must_use]
    pub const fn return_code(&self) -> ConnectReturnCode {
        self.return_code
    }
}

impl EncodePacket for ConnectAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let fixed_header = FixedHeader::new(
            PacketType::ConnectAck,
            1 + ConnectReturnCode::bytes(),
        )?;
        let len = fixed_header.encode(buf)?;
        buf.push(u8::from(self.session_present));
        buf.push(self.return_code as u8);
        Ok(len + 2)
    }
}

impl DecodePacket for ConnectAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::ConnectAck {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() != 2 {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let ack_flags = ba.read_byte()?;
        // Bits 7-1 are reserved and MUST be set to 0 [MQTT-3.2.2-1].
        if ack_flags & 0b1111_1110 != 0 {
            return Err(DecodeError::InvalidPacketFlags);
        }
        let session_present = ack_flags & 0b0000_0001 == 0b0000_0001;
        let return_code = ConnectReturnCode::try_from(ba.read_byte()?)?;

        Ok(Self {
            session_present,
            return_code,
        })
    }
}

impl Packet for ConnectAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::ConnectAck
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let packet = ConnectAckPacket::new(true, ConnectReturnCode::Accepted);
        let mut buf = Vec::new();
        let _ = packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0x20, 0x02, 0x01, 0x00]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(ConnectAckPacket::decode(&mut ba), Ok(packet));
    }

    #[test]
    fn test_session_present_cleared_on_error() {
        let packet = ConnectAckPacket::new(true, ConnectReturnCode::NotAuthorized);
        assert!(!packet.session_present());

        let mut buf = Vec::new();
        let _ = packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0x20, 0x02, 0x00, 0x05]);
    }
}
