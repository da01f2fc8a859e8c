use std::borrow::Cow;
use std::io::{Read, Write};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde_json::Value;
use tracing::warn;
use crate::error::CourierError;
use crate::event::{Event, EventSerializer};
use crate::nonce::Nonce;
use crate::safe_converter::SafeCast;

/// Builds a complete JDAT body: the nonce followed by the zlib-compressed, length-prefixed
///  serialized events
pub fn encode_jdat_body<'a>(nonce: &Nonce, events: impl IntoIterator<Item = &'a Event>, serializer: &dyn EventSerializer) -> Result<Bytes, CourierError> {
    let mut body = BytesMut::new();
    nonce.ser(&mut body);

    let mut encoder = ZlibEncoder::new(body.writer(), Compression::default());
    for event in events {
        let raw = serializer.serialize(event)?;
        let len = u32::try_from(raw.len())
            .map_err(|_| CourierError::Serialization(format!("serialized event of {} bytes is too large", raw.len())))?;
        encoder.write_all(&len.to_be_bytes())?;
        encoder.write_all(&raw)?;
    }
    Ok(encoder.finish()?.into_inner().freeze())
}

/// The decompressed events of a JDAT payload, decoded one at a time so the receiver can report
///  progress per event
pub struct JdatEvents<'a> {
    data: Vec<u8>,
    pos: usize,
    serializer: &'a dyn EventSerializer,
}

impl <'a> JdatEvents<'a> {
    pub fn inflate(compressed: &[u8], serializer: &'a dyn EventSerializer) -> Result<JdatEvents<'a>, CourierError> {
        let mut data = Vec::new();
        ZlibDecoder::new(compressed)
            .read_to_end(&mut data)
            .map_err(|e| CourierError::protocol(format!("JDAT payload failed to decompress: {}", e)))?;
        Ok(JdatEvents {
            data,
            pos: 0,
            serializer,
        })
    }

    fn next_event(&mut self) -> Result<Event, CourierError> {
        let remaining = &self.data[self.pos..];
        if remaining.len() < 4 {
            return Err(CourierError::protocol("JDAT payload ended inside an event length"));
        }
        let len: usize = u32::from_be_bytes([remaining[0], remaining[1], remaining[2], remaining[3]]).safe_cast();
        if remaining.len() - 4 < len {
            return Err(CourierError::protocol(format!("JDAT event of {} bytes exceeds the remaining {} bytes of the payload", len, remaining.len() - 4)));
        }
        let raw = &remaining[4..4 + len];
        self.pos += 4 + len;

        let text = String::from_utf8_lossy(raw);
        if let Cow::Owned(_) = &text {
            warn!(replaced = text.matches(char::REPLACEMENT_CHARACTER).count(), "event contained invalid UTF-8, invalid sequences were replaced");
        }

        match self.serializer.deserialize(&text) {
            Ok(event) => Ok(event),
            Err(e) => {
                warn!(error = %e, "event failed to parse, forwarding its raw text as 'message'");
                let mut event = Event::new();
                event.insert("message".to_string(), Value::String(text.into_owned()));
                Ok(event)
            }
        }
    }
}

impl Iterator for JdatEvents<'_> {
    type Item = Result<Event, CourierError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let result = self.next_event();
        if result.is_err() {
            // a framing error leaves no way to find the next event
            self.pos = self.data.len();
        }
        Some(result)
    }
}
