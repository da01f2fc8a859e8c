use std::fmt::{Debug, Display, Formatter};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use crate::error::CourierError;
use crate::safe_converter::SafeCast;

/// Four ASCII bytes identifying the kind of a frame
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Signature(pub [u8; 4]);

impl Signature {
    pub const HELO: Signature = Signature(*b"HELO");
    pub const VERS: Signature = Signature(*b"VERS");
    pub const PING: Signature = Signature(*b"PING");
    pub const PONG: Signature = Signature(*b"PONG");
    pub const JDAT: Signature = Signature(*b"JDAT");
    pub const ACKN: Signature = Signature(*b"ACKN");
    /// sent in reply to any signature the receiver does not understand
    pub const UNKNOWN: Signature = Signature(*b"????");

    /// Pads short input with spaces and truncates long input to four bytes
    pub fn new(raw: &[u8]) -> Signature {
        let mut signature = [b' '; 4];
        for (dst, src) in signature.iter_mut().zip(raw) {
            *dst = *src;
        }
        Signature(signature)
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}'", self)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameHeader {
    pub signature: Signature,
    pub length: u32,
}

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.signature.0);
        buf.put_u32(self.length);
    }

    pub fn deser(raw: &[u8; Self::SERIALIZED_LEN]) -> FrameHeader {
        FrameHeader {
            signature: Signature([raw[0], raw[1], raw[2], raw[3]]),
            length: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub signature: Signature,
    pub body: Bytes,
}

pub fn encode_frame(signature: Signature, body: &[u8], buf: &mut BytesMut) -> Result<(), CourierError> {
    let length = u32::try_from(body.len())
        .map_err(|_| CourierError::protocol(format!("{} body of {} bytes exceeds the maximum frame length", signature, body.len())))?;

    buf.reserve(FrameHeader::SERIALIZED_LEN + body.len());
    FrameHeader { signature, length }.ser(buf);
    buf.put_slice(body);
    Ok(())
}

pub fn frame_bytes(signature: Signature, body: &[u8]) -> Result<Bytes, CourierError> {
    let mut buf = BytesMut::new();
    encode_frame(signature, body, &mut buf)?;
    Ok(buf.freeze())
}

/// Reads the next frame header. A stream that ends cleanly between two frames yields
///  [CourierError::Eof], a stream that ends inside the header is a protocol violation.
pub async fn read_frame_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<FrameHeader, CourierError> {
    let mut raw = [0u8; FrameHeader::SERIALIZED_LEN];
    let mut filled = 0;
    while filled < raw.len() {
        let n = reader.read(&mut raw[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(CourierError::Eof);
            }
            return Err(CourierError::protocol(format!("stream ended after {} of {} frame header bytes", filled, raw.len())));
        }
        filled += n;
    }
    Ok(FrameHeader::deser(&raw))
}

pub async fn read_frame_body<R: AsyncRead + Unpin>(reader: &mut R, header: &FrameHeader) -> Result<Bytes, CourierError> {
    let mut body = vec![0u8; header.length.safe_cast()];
    reader.read_exact(&mut body).await
        .map_err(CourierError::from_read_error)?;
    Ok(Bytes::from(body))
}

/// Reads a complete frame, rejecting bodies longer than `max_len` before allocating for them
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_len: u32) -> Result<Frame, CourierError> {
    let header = read_frame_header(reader).await?;
    if header.length > max_len {
        return Err(CourierError::protocol(format!("{} frame of {} bytes exceeds the maximum of {}", header.signature, header.length, max_len)));
    }
    let body = read_frame_body(reader, &header).await?;
    Ok(Frame {
        signature: header.signature,
        body,
    })
}
