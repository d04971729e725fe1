use std::{
    error::Error,
    fmt::Display,
    io::{self},
    str::Utf8Error,
};

/// Errors that may occur when decoding a request or reply.
#[derive(Debug)]
pub enum ProtocolError {
    IoError(io::Error),
    /// The buffer ends before a field that must be read.
    MalformedRequest { needed: usize, got: usize },
    /// The request is addressed to a program other than the VXI-11 core.
    ProtocolMismatch(u32),
    UnknownProcedure(u32),
    InvalidUtf8(Utf8Error),
    TooLarge { max: usize, got: usize },
    InvalidReply(String),
}

impl ProtocolError {
    /// Whether this error was caused by the bytes that were received
    /// rather than by the transport.
    pub fn is_request_error(&self) -> bool {
        !matches!(self, ProtocolError::IoError(_))
    }
}

impl From<io::Error> for ProtocolError {
    fn from(value: io::Error) -> Self {
        ProtocolError::IoError(value)
    }
}

impl From<Utf8Error> for ProtocolError {
    fn from(value: Utf8Error) -> Self {
        ProtocolError::InvalidUtf8(value)
    }
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::IoError(error) => write!(f, "{}", error),
            ProtocolError::MalformedRequest { needed, got } => {
                write!(f, "Malformed request: need {} bytes, got {}", needed, got)
            }
            ProtocolError::ProtocolMismatch(program) => {
                write!(f, "Request for foreign program id {}", program)
            }
            ProtocolError::UnknownProcedure(procedure) => {
                write!(f, "Unknown procedure id {}", procedure)
            }
            ProtocolError::InvalidUtf8(error) => write!(f, "Invalid UTF8: {}", error),
            ProtocolError::TooLarge { max, got } => {
                write!(f, "Record too large! Maximum is {}, but got {}", max, got)
            }
            ProtocolError::InvalidReply(reason) => write!(f, "Invalid reply: {}", reason),
        }
    }
}

impl Error for ProtocolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProtocolError::IoError(error) => Some(error),
            ProtocolError::InvalidUtf8(error) => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transport_errors_are_not_request_errors() {
        let reset = ProtocolError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!reset.is_request_error());
        assert!(ProtocolError::UnknownProcedure(13).is_request_error());
        assert!(ProtocolError::TooLarge { max: 8, got: 9 }.is_request_error());
    }
}
