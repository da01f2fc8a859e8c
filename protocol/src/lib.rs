//! Wire format and shared building blocks for shipping structured log events between a
//!  client and a server over a reliable byte stream (plain TCP or TLS).
//!
//! ## Frames
//!
//! Every message on the wire is a frame - all numbers in network byte order (BE):
//! ```ascii
//! 0: signature (4 ASCII bytes, e.g. 'JDAT')
//! 4: body length (u32)
//! 8: body
//! ```
//!
//! The following signatures are defined:
//! * `HELO` client -> server, body is the client's version info (see below)
//! * `VERS` server -> client, body is the server's version info
//! * `PING` client -> server, empty body
//! * `PONG` server -> client, empty body
//! * `JDAT` client -> server, a compressed payload of events
//! * `ACKN` server -> client, acknowledges a prefix of a payload
//! * `????` reply to an unrecognised signature - the connection stays open
//!
//! ## Version info
//!
//! ```ascii
//!  0: flags (4 bytes) - bit 0 of the first byte signals support for EVNT payloads
//!  4: major (u32)
//!  8: minor (u32)
//! 12: patch (u32)
//! 16: client tag (4 ASCII bytes, e.g. 'RSLC')
//! ```
//!
//! Older peers send a compact 8 byte form with single byte version components, and newer peers
//!  may append reserved bytes up to a total of 32 bytes. Both are accepted on decode.
//!
//! ## JDAT
//!
//! ```ascii
//!  0: nonce (16 bytes), identifies the payload for acknowledgement
//! 16: zlib stream, inflating to a sequence of
//!     * length (u32)
//!     * UTF-8 JSON object (length bytes)
//! ```
//!
//! ## ACKN
//!
//! ```ascii
//!  0: nonce (16 bytes)
//! 16: sequence (u32) - number of leading events of the payload that were processed
//! ```
//!
//! A payload is complete once the acknowledged sequence reaches its number of events. Partial
//!  acknowledgements double as keepalives while a server is applying backpressure.

pub mod error;
pub mod event;
pub mod event_queue;
pub mod frame;
pub mod jdat;
pub mod message;
pub mod nonce;
pub mod safe_converter;
pub mod stream;
pub mod tls;
pub mod version;
