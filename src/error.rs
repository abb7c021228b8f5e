use std::error::Error;
use std::fmt;

/// Error type for engine, bus and transport operations
#[derive(Debug)]
pub enum MidiError {
    /// Client, queue or port could not be created or reached
    ConnectionError(String),
    /// Invalid channel, read-ahead, tempo or other setting rejected at the API boundary
    ConfigurationError(String),
    /// Outbound buffer saturated; the event was dropped
    TransportDropped,
    /// Malformed inbound event or MMC payload
    ProtocolDecodeError(String),
    /// Error when sending a MIDI message
    SendError(String),
    /// Error when receiving a MIDI message
    RecvError(String),
    /// File system failure (export, settings)
    Io(std::io::Error),
}

impl fmt::Display for MidiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MidiError::ConnectionError(msg) => write!(f, "MIDI connection error: {}", msg),
            MidiError::ConfigurationError(msg) => write!(f, "MIDI configuration error: {}", msg),
            MidiError::TransportDropped => write!(f, "MIDI output buffer full, event dropped"),
            MidiError::ProtocolDecodeError(msg) => write!(f, "MIDI decode error: {}", msg),
            MidiError::SendError(msg) => write!(f, "MIDI send error: {}", msg),
            MidiError::RecvError(msg) => write!(f, "MIDI receive error: {}", msg),
            MidiError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl Error for MidiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MidiError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MidiError {
    fn from(err: std::io::Error) -> Self {
        MidiError::Io(err)
    }
}

impl From<::config::ConfigError> for MidiError {
    fn from(err: ::config::ConfigError) -> Self {
        MidiError::ConfigurationError(err.to_string())
    }
}

/// Result type for MIDI operations
pub type Result<T> = std::result::Result<T, MidiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let conn_error = MidiError::ConnectionError("no sequencer".to_string());
        assert_eq!(conn_error.to_string(), "MIDI connection error: no sequencer");

        let cfg_error = MidiError::ConfigurationError("read-ahead must be positive".to_string());
        assert_eq!(
            cfg_error.to_string(),
            "MIDI configuration error: read-ahead must be positive"
        );
    }

    #[test]
    fn test_io_error_has_source() {
        let err: MidiError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.source().is_some());
        assert!(MidiError::TransportDropped.source().is_none());
    }
}
