use bytes::{BufMut, Bytes, BytesMut};
use crate::error::CourierError;
use crate::frame::{encode_frame, Frame, Signature};
use crate::nonce::Nonce;
use crate::version::VersionInfo;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AcknMessage {
    pub nonce: Nonce,
    pub sequence: u32,
}

impl AcknMessage {
    pub const SERIALIZED_LEN: usize = Nonce::SERIALIZED_LEN + 4;

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.nonce.ser(buf);
        buf.put_u32(self.sequence);
    }

    pub fn deser(body: &[u8]) -> Result<AcknMessage, CourierError> {
        if body.len() != Self::SERIALIZED_LEN {
            return Err(CourierError::protocol(format!("ACKN message size invalid ({} bytes)", body.len())));
        }
        let mut buf = body;
        let nonce = Nonce::try_deser(&mut buf)?;
        let sequence = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        Ok(AcknMessage { nonce, sequence })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JdatMessage {
    pub nonce: Nonce,
    /// zlib stream of length-prefixed events, see [crate::jdat]
    pub compressed: Bytes,
}

impl JdatMessage {
    /// a nonce plus at least one byte of compressed data
    pub const MIN_LEN: usize = Nonce::SERIALIZED_LEN + 1;

    pub fn deser(body: &Bytes) -> Result<JdatMessage, CourierError> {
        if body.len() < Self::MIN_LEN {
            return Err(CourierError::protocol(format!("JDAT message too small ({} bytes)", body.len())));
        }
        let nonce = Nonce::try_deser(&mut body.as_ref())?;
        Ok(JdatMessage {
            nonce,
            compressed: body.slice(Nonce::SERIALIZED_LEN..),
        })
    }
}

/// A decoded frame. Signatures we do not know are kept rather than rejected so that the
///  receiver can answer them with '????'.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ProtocolMessage {
    Helo(VersionInfo),
    Vers(VersionInfo),
    Ping,
    Pong,
    Jdat(JdatMessage),
    Ackn(AcknMessage),
    Unknown,
    Unrecognized(Signature),
}

impl ProtocolMessage {
    pub fn signature(&self) -> Signature {
        match self {
            ProtocolMessage::Helo(_) => Signature::HELO,
            ProtocolMessage::Vers(_) => Signature::VERS,
            ProtocolMessage::Ping => Signature::PING,
            ProtocolMessage::Pong => Signature::PONG,
            ProtocolMessage::Jdat(_) => Signature::JDAT,
            ProtocolMessage::Ackn(_) => Signature::ACKN,
            ProtocolMessage::Unknown => Signature::UNKNOWN,
            ProtocolMessage::Unrecognized(signature) => *signature,
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<ProtocolMessage, CourierError> {
        let body = &frame.body;
        match frame.signature {
            Signature::HELO => Ok(ProtocolMessage::Helo(VersionInfo::deser(body)?)),
            Signature::VERS => Ok(ProtocolMessage::Vers(VersionInfo::deser(body)?)),
            Signature::PING => {
                expect_empty(Signature::PING, body)?;
                Ok(ProtocolMessage::Ping)
            }
            Signature::PONG => {
                expect_empty(Signature::PONG, body)?;
                Ok(ProtocolMessage::Pong)
            }
            Signature::JDAT => Ok(ProtocolMessage::Jdat(JdatMessage::deser(body)?)),
            Signature::ACKN => Ok(ProtocolMessage::Ackn(AcknMessage::deser(body)?)),
            Signature::UNKNOWN => Ok(ProtocolMessage::Unknown),
            other => Ok(ProtocolMessage::Unrecognized(other)),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), CourierError> {
        let mut body = BytesMut::new();
        match self {
            ProtocolMessage::Helo(version) | ProtocolMessage::Vers(version) => version.ser(&mut body),
            ProtocolMessage::Jdat(jdat) => {
                jdat.nonce.ser(&mut body);
                body.put_slice(&jdat.compressed);
            }
            ProtocolMessage::Ackn(ackn) => ackn.ser(&mut body),
            ProtocolMessage::Ping | ProtocolMessage::Pong | ProtocolMessage::Unknown | ProtocolMessage::Unrecognized(_) => {}
        }
        encode_frame(self.signature(), &body, buf)
    }

    pub fn to_frame_bytes(&self) -> Result<Bytes, CourierError> {
        let mut buf = BytesMut::new();
        self.ser(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn expect_empty(signature: Signature, body: &[u8]) -> Result<(), CourierError> {
    if body.is_empty() {
        Ok(())
    }
    else {
        Err(CourierError::protocol(format!("unexpected data attached to {} message ({} bytes)", signature, body.len())))
    }
}
