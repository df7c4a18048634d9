#[derive(Debug)]
pub enum EngineError {
    Io(std::io::Error),
    /// A document or typed payload failed to encode or decode.
    Codec(String),
    /// A synchronous call did not receive its reply within the deadline.
    Timeout,
    ConnectionClosed,
    /// Malformed traffic from a peer: null argument, unknown event name,
    /// unknown cid, oversized frame. Logged server-side, never fatal.
    ProtocolViolation(String),
    /// An internal invariant was broken. Fatal to the session that hit it.
    Assertion(&'static str),
    Storage(String),
}

impl Clone for EngineError {
    fn clone(&self) -> Self {
        match self {
            EngineError::Io(e) => EngineError::Io(std::io::Error::new(e.kind(), e.to_string())),
            EngineError::Codec(s) => EngineError::Codec(s.clone()),
            EngineError::Timeout => EngineError::Timeout,
            EngineError::ConnectionClosed => EngineError::ConnectionClosed,
            EngineError::ProtocolViolation(s) => EngineError::ProtocolViolation(s.clone()),
            EngineError::Assertion(s) => EngineError::Assertion(s),
            EngineError::Storage(s) => EngineError::Storage(s.clone()),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Io(e) => write!(f, "IO error: {}", e),
            EngineError::Codec(e) => write!(f, "Codec error: {}", e),
            EngineError::Timeout => write!(f, "Call timed out"),
            EngineError::ConnectionClosed => write!(f, "Connection closed"),
            EngineError::ProtocolViolation(e) => write!(f, "Protocol violation: {}", e),
            EngineError::Assertion(e) => write!(f, "Assertion violation: {}", e),
            EngineError::Storage(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e)
    }
}
