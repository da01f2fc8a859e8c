use bytes::BufMut;
use crate::error::CourierError;

/// Version and identity a peer announces in HELO (client) or VERS (server)
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct VersionInfo {
    pub flags: [u8; 4],
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub client_tag: [u8; 4],
}

impl VersionInfo {
    /// the layout we send
    pub const SERIALIZED_LEN: usize = 20;
    /// compact layout of older peers: flags byte, three version bytes, tag
    pub const LEGACY_LEN: usize = 8;
    /// peers may append reserved bytes up to this total
    pub const MAX_LEN: usize = 32;

    pub const FLAG_SUPPORTS_EVNT: u8 = 0x01;

    pub const TAG_LOG_COURIER: [u8; 4] = *b"LCOR";
    pub const TAG_LOG_CARVER: [u8; 4] = *b"LCVR";
    pub const TAG_RUBY_LOG_COURIER: [u8; 4] = *b"RYLC";
    pub const TAG_RUST_LOG_COURIER: [u8; 4] = *b"RSLC";

    /// The version of this crate, tagged as a Rust Log Courier peer
    pub fn current() -> VersionInfo {
        VersionInfo {
            flags: [0; 4],
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
            client_tag: Self::TAG_RUST_LOG_COURIER,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.flags);
        buf.put_u32(self.major);
        buf.put_u32(self.minor);
        buf.put_u32(self.patch);
        buf.put_slice(&self.client_tag);
    }

    /// Bodies shorter than the legacy layout carry no usable information and decode to an
    ///  all-zero (unidentified) version rather than failing the handshake.
    pub fn deser(body: &[u8]) -> Result<VersionInfo, CourierError> {
        if body.len() > Self::MAX_LEN {
            return Err(CourierError::protocol(format!("version info of {} bytes exceeds the maximum of {}", body.len(), Self::MAX_LEN)));
        }

        if body.len() >= Self::SERIALIZED_LEN {
            Ok(VersionInfo {
                flags: [body[0], body[1], body[2], body[3]],
                major: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                minor: u32::from_be_bytes([body[8], body[9], body[10], body[11]]),
                patch: u32::from_be_bytes([body[12], body[13], body[14], body[15]]),
                client_tag: [body[16], body[17], body[18], body[19]],
            })
        }
        else if body.len() >= Self::LEGACY_LEN {
            Ok(VersionInfo {
                flags: [body[0], 0, 0, 0],
                major: body[1] as u32,
                minor: body[2] as u32,
                patch: body[3] as u32,
                client_tag: [body[4], body[5], body[6], body[7]],
            })
        }
        else {
            Ok(VersionInfo::default())
        }
    }

    pub fn supports_evnt(&self) -> bool {
        self.flags[0] & Self::FLAG_SUPPORTS_EVNT != 0
    }

    pub fn client_name(&self) -> String {
        match self.client_tag {
            Self::TAG_LOG_COURIER => "Log Courier".to_string(),
            Self::TAG_LOG_CARVER => "Log Carver".to_string(),
            Self::TAG_RUBY_LOG_COURIER => "Ruby Log Courier".to_string(),
            Self::TAG_RUST_LOG_COURIER => "Rust Log Courier".to_string(),
            [0, 0, 0, 0] => "Unknown".to_string(),
            tag => format!("Unknown ({})", String::from_utf8_lossy(&tag)),
        }
    }

    /// `None` for peers that did not identify themselves
    pub fn version(&self) -> Option<String> {
        if self.major == 0 && self.minor == 0 && self.patch == 0 {
            None
        }
        else {
            Some(format!("{}.{}.{}", self.major, self.minor, self.patch))
        }
    }

    pub fn client_version(&self) -> String {
        match self.version() {
            Some(v) => format!("{} v{}", self.client_name(), v),
            None => self.client_name(),
        }
    }
}
