// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Helpers to script the peer side of a handler under test.

use codec::{ByteArray, DecodeError, EncodePacket, MqttPacket};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Read the next control packet from a raw tcp stream.
pub async fn read_packet(stream: &mut TcpStream, buf: &mut Vec<u8>) -> MqttPacket {
    loop {
        if !buf.is_empty() {
            let mut ba = ByteArray::new(buf);
            match MqttPacket::decode(&mut ba) {
                Ok(packet) => {
                    let consumed = ba.offset();
                    buf.drain(..consumed);
                    return packet;
                }
                Err(DecodeError::InsufficientData) => {}
                Err(err) => panic!("peer: decode error: {err:?}"),
            }
        }
        let n_read = stream.read_buf(buf).await.unwrap();
        assert!(n_read > 0, "peer: connection closed while expecting packet");
    }
}

/// Serialize one control packet onto a raw tcp stream.
pub async fn write_packet<P: EncodePacket>(stream: &mut TcpStream, packet: &P) {
    let mut buf = Vec::new();
    packet.encode(&mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();
    stream.flush().await.unwrap();
}
