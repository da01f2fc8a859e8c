use tokio::io::{AsyncRead, AsyncWrite};

/// A connected byte stream, plain TCP or TLS. Transports hand these out boxed so that the
///  protocol code above them does not care how the bytes travel.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl <T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;
