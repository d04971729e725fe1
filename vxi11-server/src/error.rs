use std::{error::Error, fmt::Display, io, net::SocketAddr};

use crate::registry::PortRange;

/// Errors that stop the server.
#[derive(Debug)]
pub enum ServerError {
    /// A listening socket could not be opened.
    Bind { addr: SocketAddr, source: io::Error },
    /// Accepting a VXI-11 connection failed.
    FatalSession,
    IoError(io::Error),
    PortOutOfRange { port: u16, range: PortRange },
}

impl From<io::Error> for ServerError {
    fn from(value: io::Error) -> Self {
        ServerError::IoError(value)
    }
}

impl Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind { addr, source } => {
                write!(f, "Cannot listen on {}: {}", addr, source)
            }
            ServerError::FatalSession => {
                write!(f, "Accepting a VXI-11 connection failed, stopping server")
            }
            ServerError::IoError(error) => write!(f, "{}", error),
            ServerError::PortOutOfRange { port, range } => {
                write!(f, "Port {} is outside of {}", port, range)
            }
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            ServerError::IoError(error) => Some(error),
            ServerError::FatalSession | ServerError::PortOutOfRange { .. } => None,
        }
    }
}
