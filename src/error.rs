/// Errors produced by the protocol engine and its clients.
///
/// The device itself only distinguishes success from failure; this enum
/// keeps the one-failure-per-call contract but tells the causes apart so
/// callers can decide what is worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error from the underlying transport.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),
    /// A read or write did not complete within the transport's deadline.
    #[error("transaction timed out")]
    Timeout,
    /// A write accepted fewer bytes than requested.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    /// The request checksum could not be computed (payload too long or
    /// missing), so no frame was formed.
    #[error("request cannot be encoded: checksum undefined for this payload")]
    RequestChecksum,
    /// The response did not begin with the 0xDD start marker.
    #[error("invalid start marker 0x{0:02X}")]
    StartMarker(u8),
    /// The response declared a payload longer than the protocol allows.
    #[error("declared payload length {0} exceeds maximum of 64")]
    PayloadLength(u8),
    /// The response declared more payload bytes than the destination buffer
    /// can hold.
    #[error("response payload of {needed} bytes exceeds buffer of {capacity}")]
    ResponseBuffer { needed: u8, capacity: usize },
    /// The recomputed response checksum does not match the received one.
    #[error("checksum mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    Checksum { computed: u16, received: u16 },
    /// The peripheral reported an error through its return code.
    #[error("peripheral returned error code 0x{0:02X}")]
    ReturnCode(u8),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Transport(err),
        }
    }
}
