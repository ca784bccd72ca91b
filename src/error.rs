use thiserror::Error;

/// Errors surfaced to the embedding application.
///
/// Voice-datagram decryption failures are deliberately absent: they are
/// tracked as `late`/`lost` in the cipher counters and never propagate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// The server sent a `Reject` packet. Fatal to the session; the client
    /// does not reconnect after a rejection.
    #[error("connection rejected by server: {0}")]
    ConnectionRejected(String),

    #[error("transport failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// No reliable ping response for the timeout window.
    #[error("server stopped responding to pings")]
    Timeout,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("session is not connected")]
    NotConnected,

    #[error("text message is {len} bytes, server limit is {max}")]
    TextTooLong { len: usize, max: u32 },

    #[error("image message is {len} bytes, server limit is {max}")]
    ImageTooBig { len: usize, max: u32 },

    #[error("unsupported audio codec (type {0})")]
    CodecNotSupported(u8),

    #[error("opus codec error: {0}")]
    Opus(#[from] opus::Error),

    #[error("blob store error: {0}")]
    BlobStore(#[from] rusqlite::Error),
}
