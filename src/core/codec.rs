//! Packet framing
//!
//! Wire format, identical in both directions:
//! - Length (4 bytes, little-endian u32): id byte + payload
//! - Id (1 byte)
//! - Payload (length - 1 bytes)
//!
//! Decoded packets keep their complete wire form so they can be relayed
//! unchanged when no hook touches them.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::ProxyError;

/// Length prefix size
pub const LENGTH_SIZE: usize = 4;
/// Length prefix + id byte
pub const HEADER_SIZE: usize = LENGTH_SIZE + 1;
/// Initial read buffer size for a framed reader
pub const READ_CHUNK: usize = 2048;
/// Largest accepted length field unless configured otherwise
pub const DEFAULT_MAX_PACKET_SIZE: usize = 8 * 1024 * 1024;

/// One framed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    id: u8,
    raw: Bytes,
}

impl Packet {
    /// Build a packet from id and payload, producing a consistent length prefix
    pub fn from_parts(id: u8, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u32_le(payload.len() as u32 + 1);
        buf.put_u8(id);
        buf.put_slice(payload);
        Self {
            id,
            raw: buf.freeze(),
        }
    }

    /// Validate that `raw` holds exactly one well-formed packet
    pub fn parse(raw: Bytes) -> Result<Self, ProxyError> {
        if raw.len() < HEADER_SIZE {
            return Err(ProxyError::MalformedPacket(format!(
                "{} bytes is shorter than the packet header",
                raw.len()
            )));
        }
        let length = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if length + LENGTH_SIZE != raw.len() {
            return Err(ProxyError::MalformedPacket(format!(
                "length field {} does not match {} bytes of body",
                length,
                raw.len() - LENGTH_SIZE
            )));
        }
        Ok(Self { id: raw[LENGTH_SIZE], raw })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Payload without the header
    pub fn payload(&self) -> &[u8] {
        &self.raw[HEADER_SIZE..]
    }

    /// Value of the length field (id byte + payload)
    pub fn length(&self) -> u32 {
        (self.raw.len() - LENGTH_SIZE) as u32
    }

    /// Complete wire form
    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }

    pub fn into_bytes(self) -> Bytes {
        self.raw
    }
}

/// Decoder yielding one [`Packet`] per complete frame
///
/// Partial reads accumulate in the `FramedRead` buffer, so a pending read can be
/// dropped and resumed without losing bytes.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ProxyError> {
        if src.len() < LENGTH_SIZE {
            return Ok(None);
        }

        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length == 0 {
            return Err(ProxyError::MalformedPacket(
                "length field is zero, no room for the id byte".to_string(),
            ));
        }
        if length > self.max_packet_size {
            return Err(ProxyError::MalformedPacket(format!(
                "length field {} exceeds limit {}",
                length, self.max_packet_size
            )));
        }

        let total = LENGTH_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total).freeze();
        Ok(Some(Packet {
            id: raw[LENGTH_SIZE],
            raw,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, ProxyError> {
        match self.decode(buf)? {
            Some(packet) => Ok(Some(packet)),
            // Stream ended before or in the middle of a packet
            None if buf.is_empty() => Ok(None),
            None => Err(ProxyError::ConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn test_from_parts_length_prefix() {
        let packet = Packet::from_parts(7, b"hello");
        assert_eq!(packet.id(), 7);
        assert_eq!(packet.length(), 6);
        assert_eq!(packet.payload(), b"hello");
        assert_eq!(&packet.as_bytes()[..5], &[6, 0, 0, 0, 7]);
    }

    #[test]
    fn test_decode_empty_payload() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[0x01, 0x00, 0x00, 0x00, 0x2A][..]);
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.id(), 0x2A);
        assert!(packet.payload().is_empty());
        assert_eq!(packet.as_bytes().as_ref(), &[0x01, 0x00, 0x00, 0x00, 0x2A]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_needs_more_data() {
        let mut codec = PacketCodec::default();
        let full = Packet::from_parts(3, &[9u8; 100]).into_bytes();

        let mut buf = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[3..50]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[50..]);
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.as_bytes(), &full);
    }

    #[test]
    fn test_decode_two_packets_in_one_buffer() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(Packet::from_parts(1, b"a").as_bytes());
        buf.extend_from_slice(Packet::from_parts(2, b"bc").as_bytes());

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().id(), 1);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.id(), 2);
        assert_eq!(second.payload(), b"bc");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_zero_length_is_malformed() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0, 1][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProxyError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_oversized_is_malformed() {
        let mut codec = PacketCodec::new(16);
        let mut buf = BytesMut::from(&[17u8, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProxyError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_eof_mid_packet_is_connection_closed() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[10u8, 0, 0, 0, 5, 1, 2][..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(ProxyError::ConnectionClosed)
        ));

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_parse_validates_length() {
        let raw = Packet::from_parts(4, b"xyz").into_bytes();
        assert_eq!(Packet::parse(raw.clone()).unwrap().id(), 4);

        let mut truncated = BytesMut::from(&raw[..]);
        truncated.truncate(raw.len() - 1);
        assert!(Packet::parse(truncated.freeze()).is_err());
        assert!(Packet::parse(Bytes::from_static(&[1, 0])).is_err());
    }

    #[tokio::test]
    async fn test_framed_read_accumulates_partial_writes() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let expected = Packet::from_parts(0x11, &payload);
        let wire = expected.as_bytes().clone();

        let writer = tokio::spawn(async move {
            for chunk in wire.chunks(37) {
                tx.write_all(chunk).await.unwrap();
            }
        });

        let mut framed = FramedRead::with_capacity(rx, PacketCodec::default(), READ_CHUNK);
        let packet = framed.next().await.unwrap().unwrap();
        writer.await.unwrap();

        assert_eq!(packet, expected);
        assert_eq!(packet.length() as usize, 1 + payload.len());
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_framed_read_closed_mid_packet() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(&[20, 0, 0, 0, 9, 1, 2, 3]).await.unwrap();
        drop(tx);

        let mut framed = FramedRead::new(rx, PacketCodec::default());
        assert!(matches!(
            framed.next().await,
            Some(Err(ProxyError::ConnectionClosed))
        ));
    }
}
