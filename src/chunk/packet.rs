use super::{CHUNK_HEADER_SIZE, Chunk};
use crate::error::SctpError;
use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

pub(crate) const COMMON_HEADER_LEN: usize = 12;

/// An SCTP packet: common header plus bundled chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub source_port: u16,
    pub destination_port: u16,
    pub verification_tag: u32,
    pub chunks: Vec<Chunk>,
}

impl Packet {
    pub fn new(source_port: u16, destination_port: u16, verification_tag: u32) -> Self {
        Self {
            source_port,
            destination_port,
            verification_tag,
            chunks: Vec::new(),
        }
    }

    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1200);
        buf.put_u16(self.source_port);
        buf.put_u16(self.destination_port);
        buf.put_u32(self.verification_tag);
        buf.put_u32(0);
        for chunk in &self.chunks {
            chunk.encode(&mut buf);
        }
        let checksum = crc32c::crc32c(&buf);
        buf[8..12].copy_from_slice(&checksum.to_le_bytes());
        buf.freeze()
    }

    pub fn unmarshal(packet: Bytes) -> Result<Self> {
        if packet.len() < COMMON_HEADER_LEN {
            return Err(SctpError::PacketTooShort(packet.len()).into());
        }

        let mut buf = packet.clone();
        let source_port = buf.get_u16();
        let destination_port = buf.get_u16();
        let verification_tag = buf.get_u32();
        let received_checksum = buf.get_u32_le();
        trace!(
            "SCTP packet received: src={}, dst={}, vtag={:08x}",
            source_port, destination_port, verification_tag
        );

        // CRC32c over the packet with the checksum field read as zero.
        let zeroed_checksum: [u8; 4] = [0; 4];
        let crc = crc32c::crc32c(&packet[..8]);
        let crc = crc32c::crc32c_append(crc, &zeroed_checksum);
        let calculated = crc32c::crc32c_append(crc, &packet[COMMON_HEADER_LEN..]);
        if calculated != received_checksum {
            return Err(SctpError::ChecksumMismatch {
                received: received_checksum,
                calculated,
            }
            .into());
        }

        let mut chunks = Vec::new();
        while buf.remaining() >= CHUNK_HEADER_SIZE {
            let chunk_type = buf.get_u8();
            let chunk_flags = buf.get_u8();
            let chunk_length = buf.get_u16() as usize;

            if chunk_length < CHUNK_HEADER_SIZE || buf.remaining() < chunk_length - CHUNK_HEADER_SIZE
            {
                debug!("Truncated chunk of type {} length {}", chunk_type, chunk_length);
                break;
            }

            let chunk_value = buf.split_to(chunk_length - CHUNK_HEADER_SIZE);

            // Padding
            let padding = (4 - (chunk_length % 4)) % 4;
            if buf.remaining() >= padding {
                buf.advance(padding);
            }

            match Chunk::decode(chunk_type, chunk_flags, chunk_value)? {
                Some(chunk) => chunks.push(chunk),
                // Upper bit clear: stop processing the rest of the packet.
                None if chunk_type & 0x80 == 0 => {
                    trace!("Unrecognized SCTP chunk type {}, discarding remainder", chunk_type);
                    break;
                }
                None => trace!("Skipping unrecognized SCTP chunk type {}", chunk_type),
            }
        }

        Ok(Self {
            source_port,
            destination_port,
            verification_tag,
            chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_unmarshal_with_checksum() {
        let mut packet = Packet::new(5000, 5001, 0x1234_5678);
        packet.chunks.push(Chunk::CookieAck);
        packet.chunks.push(Chunk::Shutdown { cum_tsn_ack: 77 });
        let raw = packet.marshal();

        let parsed = Packet::unmarshal(raw).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_corrupted_packet_is_rejected() {
        let mut packet = Packet::new(1, 2, 3);
        packet.chunks.push(Chunk::CookieAck);
        let mut raw = BytesMut::from(&packet.marshal()[..]);
        raw[13] ^= 0xff;
        let err = Packet::unmarshal(raw.freeze()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SctpError>(),
            Some(SctpError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_short_packet() {
        let err = Packet::unmarshal(Bytes::from_static(&[0u8; 6])).unwrap_err();
        assert_eq!(
            err.downcast_ref::<SctpError>(),
            Some(&SctpError::PacketTooShort(6))
        );
    }
}
