//! Game protocol codec
//!
//! Implements the small subset of the game's wire format needed to probe a
//! server for status and to route incoming connections by hostname:
//! - Varints: 7 data bits per byte, low group first, high bit set while more follow
//! - Packets: `varint(length) || payload`, payload starts with a varint packet id
//! - Strings: `varint(byte length) || utf-8 bytes`

use crate::error::CodecError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Longest varint accepted on the wire (a full 64-bit varlong)
pub const MAX_VARINT_LEN: usize = 10;

/// Largest packet accepted from a peer
pub const MAX_PACKET_LEN: usize = 2 * 1024 * 1024;

/// Handshake `next_state` value requesting a status response
pub const NEXT_STATE_STATUS: i32 = 1;

/// Handshake `next_state` value starting a login
pub const NEXT_STATE_LOGIN: i32 = 2;

/// Append the varint encoding of `value` to `out`
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Number of bytes `value` occupies when varint-encoded
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Decode a varint from the start of `buf`.
///
/// Returns the value and the number of bytes consumed, or `Ok(None)` when
/// `buf` ends in the middle of a varint.
pub fn decode_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, CodecError> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        if i + 1 == MAX_VARINT_LEN {
            return Err(CodecError::VarIntTooLong { max: MAX_VARINT_LEN });
        }
    }
    Ok(None)
}

/// Read one varint from an async stream, returning the value and its raw bytes
pub async fn read_varint_raw<R>(reader: &mut R) -> Result<(u64, Vec<u8>), CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::with_capacity(5);
    loop {
        let byte = reader.read_u8().await?;
        raw.push(byte);
        if let Some((value, _)) = decode_varint(&raw)? {
            return Ok((value, raw));
        }
    }
}

/// Read a frame length prefix, rejecting empty and oversized packets
pub async fn read_frame_length<R>(reader: &mut R) -> Result<usize, CodecError>
where
    R: AsyncRead + Unpin,
{
    let (length, _) = read_varint_raw(reader).await?;
    check_frame_length(length)
}

fn check_frame_length(length: u64) -> Result<usize, CodecError> {
    if length == 0 || length > MAX_PACKET_LEN as u64 {
        return Err(CodecError::InvalidLength(length as i64));
    }
    Ok(length as usize)
}

/// A packet read off the wire, keeping the exact bytes received
#[derive(Debug, Clone)]
pub struct Frame {
    raw: Vec<u8>,
    payload_start: usize,
}

impl Frame {
    /// The packet payload (id followed by fields)
    pub fn payload(&self) -> &[u8] {
        &self.raw[self.payload_start..]
    }

    /// The bytes exactly as received, length prefix included
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// A reader over the payload
    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(self.payload())
    }
}

/// Read one complete framed packet
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, CodecError>
where
    R: AsyncRead + Unpin,
{
    let (length, mut raw) = read_varint_raw(reader).await?;
    let length = check_frame_length(length)?;
    let payload_start = raw.len();
    raw.resize(payload_start + length, 0);
    reader.read_exact(&mut raw[payload_start..]).await?;
    Ok(Frame { raw, payload_start })
}

/// Builder for an outgoing packet
#[derive(Debug, Clone, Default)]
pub struct Packet {
    data: Vec<u8>,
}

impl Packet {
    /// Start a packet with the given id
    pub fn new(id: i32) -> Self {
        let mut packet = Self::default();
        packet.write_varint(id);
        packet
    }

    pub fn write_varint(&mut self, value: i32) -> &mut Self {
        encode_varint(u64::from(value as u32), &mut self.data);
        self
    }

    pub fn write_varlong(&mut self, value: i64) -> &mut Self {
        encode_varint(value as u64, &mut self.data);
        self
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        encode_varint(value.len() as u64, &mut self.data);
        self.data.extend_from_slice(value.as_bytes());
        self
    }

    /// Big-endian unsigned short
    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Big-endian long
    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Length-prefixed bytes ready for the wire
    pub fn frame(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 5);
        encode_varint(self.data.len() as u64, &mut out);
        out.extend_from_slice(&self.data);
        out
    }
}

/// Write a framed packet to a stream
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.frame()).await?;
    Ok(())
}

/// Cursor over the payload of one packet.
///
/// Every read is bounded by the packet. Call [`PacketReader::finish`] once
/// the expected fields have been consumed.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Read exactly `n` bytes of the packet
    pub fn read_exact(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if n > self.remaining() {
            return Err(CodecError::UnexpectedEnd {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_varlong(&mut self) -> Result<i64, CodecError> {
        match decode_varint(&self.buf[self.pos..])? {
            Some((value, used)) => {
                self.pos += used;
                Ok(value as i64)
            }
            None => Err(CodecError::UnexpectedEnd {
                needed: self.remaining() + 1,
                remaining: self.remaining(),
            }),
        }
    }

    pub fn read_varint(&mut self) -> Result<i32, CodecError> {
        let value = self.read_varlong()? as u64;
        if value > u64::from(u32::MAX) {
            return Err(CodecError::VarIntTooLong { max: 5 });
        }
        Ok(value as u32 as i32)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let length = self.read_varint()?;
        if length < 0 {
            return Err(CodecError::InvalidLength(i64::from(length)));
        }
        let bytes = self.read_exact(length as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidString)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.read_exact(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        let bytes = self.read_exact(8)?;
        let mut array = [0u8; 8];
        array.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(array))
    }

    /// Complete the packet, draining anything left unread.
    ///
    /// Leftover bytes are a protocol violation by the peer but not fatal.
    /// Returns how many bytes were drained.
    pub fn finish(mut self) -> usize {
        let leftover = self.remaining();
        if leftover > 0 {
            warn!(leftover, "Packet not fully consumed, draining remainder");
            self.pos = self.buf.len();
        }
        leftover
    }
}

/// The first packet a client sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

impl Handshake {
    /// Handshake packet id
    pub const ID: i32 = 0x00;

    pub fn to_packet(&self) -> Packet {
        let mut packet = Packet::new(Self::ID);
        packet
            .write_varint(self.protocol_version)
            .write_string(&self.server_address)
            .write_u16(self.server_port)
            .write_varint(self.next_state);
        packet
    }

    /// Parse a handshake from a packet payload (id included)
    pub fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        let mut reader = PacketReader::new(payload);
        let id = reader.read_varint()?;
        if id != Self::ID {
            return Err(CodecError::UnexpectedPacket(id));
        }
        let handshake = Self {
            protocol_version: reader.read_varint()?,
            server_address: reader.read_string()?,
            server_port: reader.read_u16()?,
            next_state: reader.read_varint()?,
        };
        reader.finish();
        Ok(handshake)
    }

    /// Hostname the client dialed, normalised for routing
    pub fn hostname(&self) -> String {
        normalize_hostname(&self.server_address)
    }
}

/// Lower-case a dialed address and strip mod-loader suffixes and the trailing dot
pub fn normalize_hostname(address: &str) -> String {
    let host = address.split('\0').next().unwrap_or_default();
    host.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: u64) -> (u64, usize) {
        let mut buf = Vec::new();
        encode_varint(value, &mut buf);
        assert_eq!(buf.len(), varint_len(value));
        decode_varint(&buf).unwrap().unwrap()
    }

    #[test]
    fn test_varint_round_trip_sampled_range() {
        let mut value: u64 = 0;
        while value < (1u64 << 31) {
            let (decoded, _) = round_trip(value);
            assert_eq!(decoded, value);
            value = value * 3 + 1;
        }
        for value in [0u64, 1, 127, 128, 255, 300, 16_383, 16_384, 2_097_151, 2_097_152] {
            assert_eq!(round_trip(value).0, value);
        }
    }

    #[test]
    fn test_varint_five_byte_boundary() {
        assert_eq!(round_trip(268_435_455), (268_435_455, 4));
        assert_eq!(round_trip(268_435_456), (268_435_456, 5));
        assert_eq!(round_trip((1 << 31) - 1), ((1 << 31) - 1, 5));
    }

    #[test]
    fn test_varint_known_encodings() {
        let mut buf = Vec::new();
        encode_varint(300, &mut buf);
        assert_eq!(buf, vec![0xAC, 0x02]);

        let mut packet = Packet::new(0);
        packet.write_varint(-1);
        assert_eq!(packet.payload(), &[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn test_varint_longer_than_ten_bytes_is_malformed() {
        let chain = [0xFFu8; 11];
        assert!(matches!(
            decode_varint(&chain),
            Err(CodecError::VarIntTooLong { max: 10 })
        ));
    }

    #[test]
    fn test_varint_ten_bytes_is_accepted() {
        let mut chain = vec![0x80u8; 9];
        chain.push(0x01);
        let (value, used) = decode_varint(&chain).unwrap().unwrap();
        assert_eq!(used, 10);
        assert_eq!(value, 1u64 << 63);
    }

    #[test]
    fn test_varint_incomplete() {
        assert!(decode_varint(&[0x80, 0x80]).unwrap().is_none());
        assert!(decode_varint(&[]).unwrap().is_none());
    }

    #[test]
    fn test_handshake_round_trip_through_frame() {
        let handshake = Handshake {
            protocol_version: 5,
            server_address: "Play.Example.com.".to_string(),
            server_port: 25565,
            next_state: NEXT_STATE_STATUS,
        };
        let framed = handshake.to_packet().frame();
        let (length, used) = decode_varint(&framed).unwrap().unwrap();
        assert_eq!(length as usize, framed.len() - used);

        let parsed = Handshake::parse(&framed[used..]).unwrap();
        assert_eq!(parsed, handshake);
        assert_eq!(parsed.hostname(), "play.example.com");
    }

    #[test]
    fn test_port_is_big_endian() {
        let mut packet = Packet::new(0);
        packet.write_u16(25565);
        assert_eq!(&packet.payload()[1..], &[0x63, 0xDD]);
    }

    #[test]
    fn test_reader_finish_drains_leftover() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut reader = PacketReader::new(&data);
        assert_eq!(reader.read_exact(1).unwrap(), &[0x01]);
        assert_eq!(reader.finish(), 3);

        let mut reader = PacketReader::new(&data);
        reader.read_exact(4).unwrap();
        assert_eq!(reader.finish(), 0);
    }

    #[test]
    fn test_reader_bounds_are_enforced() {
        let data = [0x05, b'a', b'b'];
        let mut reader = PacketReader::new(&data);
        assert!(matches!(
            reader.read_string(),
            Err(CodecError::UnexpectedEnd { needed: 5, remaining: 2 })
        ));
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("MC.Example.com"), "mc.example.com");
        assert_eq!(normalize_hostname("mc.example.com.\0FML\0"), "mc.example.com");
    }

    #[tokio::test]
    async fn test_read_frame_keeps_raw_bytes() {
        let mut packet = Packet::new(0x00);
        packet.write_string("hello");
        let bytes = packet.frame();
        let mut stream = &bytes[..];

        let frame = read_frame(&mut stream).await.unwrap();
        assert_eq!(frame.raw(), &bytes[..]);
        let mut reader = frame.reader();
        assert_eq!(reader.read_varint().unwrap(), 0);
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.finish(), 0);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_empty_packet() {
        let bytes = [0x00u8];
        let mut stream = &bytes[..];
        assert!(matches!(
            read_frame(&mut stream).await,
            Err(CodecError::InvalidLength(0))
        ));
    }
}
