//! Error taxonomy for the endpoint.
//!
//! Fatal errors latch on the half-connection that produced them; every
//! later operation on that direction returns the same value. The two
//! warning sentinels (`NoCertificate`, `EndOfEarlyData`) circulate
//! inside the state machine only and never reach the application.

use crate::alert::Alert;

/// Connection errors. Cloneable so a latched error can be returned on
/// every subsequent call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed, oversized or version-mismatched record framing.
    #[error("tls: record framing error: {0}")]
    RecordFraming(String),

    /// Decryption, MAC or padding failure on an inbound record.
    #[error("tls: crypto failure: {0}")]
    CryptoFailure(Alert),

    /// A content type or handshake message not permitted in the
    /// current state.
    #[error("tls: unexpected message: {0}")]
    UnexpectedMessage(String),

    /// An extension or value forbidden by the negotiated version.
    #[error("tls: protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer sent a fatal alert.
    #[error("tls: remote error: {0}")]
    RemoteAlert(Alert),

    /// We sent a fatal alert; the direction is now dead.
    #[error("tls: local error: {0}")]
    LocalAlert(Alert),

    /// The peer closed the stream cleanly with close_notify.
    #[error("tls: close notify received")]
    CloseNotify,

    /// Underlying transport failure.
    #[error("tls: io error: {0}")]
    Io(String),

    /// The stream ended in the middle of a record.
    #[error("tls: unexpected end of stream")]
    UnexpectedEof,

    /// Handshake-level failure outside the record layer.
    #[error("tls: handshake failure: {0}")]
    Handshake(String),

    /// An expectation configured through the bug knobs was violated by
    /// the peer.
    #[error("tls: peer violated test expectation: {0}")]
    Expectation(String),

    /// Internal sentinel: peer sent an SSL 3.0 no_certificate warning.
    #[error("tls: no certificate alert")]
    NoCertificate,

    /// Internal sentinel: peer signalled the end of early data.
    #[error("tls: end of early data alert")]
    EndOfEarlyData,
}

impl Error {
    /// Convert an io error, flagging clean EOF distinctly.
    pub fn from_io(err: std::io::Error) -> Error {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::UnexpectedEof
        } else {
            Error::Io(err.to_string())
        }
    }

    /// True for the sentinels that must not escape the state machine.
    pub fn is_warning_sentinel(&self) -> bool {
        matches!(self, Error::NoCertificate | Error::EndOfEarlyData)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::from_io(err)
    }
}

pub type TlsResult<T> = Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::ALERT_BAD_RECORD_MAC;

    #[test]
    fn test_clone_and_eq() {
        let e = Error::CryptoFailure(ALERT_BAD_RECORD_MAC);
        assert_eq!(e.clone(), e);
    }

    #[test]
    fn test_sentinels() {
        assert!(Error::NoCertificate.is_warning_sentinel());
        assert!(Error::EndOfEarlyData.is_warning_sentinel());
        assert!(!Error::CloseNotify.is_warning_sentinel());
    }
}
