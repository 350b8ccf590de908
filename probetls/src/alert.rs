//! TLS alert codes and their level classification.

use std::fmt;

/// A TLS alert description byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Alert(pub u8);

pub const ALERT_CLOSE_NOTIFY: Alert = Alert(0);
pub const ALERT_UNEXPECTED_MESSAGE: Alert = Alert(10);
pub const ALERT_BAD_RECORD_MAC: Alert = Alert(20);
pub const ALERT_DECRYPTION_FAILED: Alert = Alert(21);
pub const ALERT_RECORD_OVERFLOW: Alert = Alert(22);
pub const ALERT_DECOMPRESSION_FAILURE: Alert = Alert(30);
pub const ALERT_HANDSHAKE_FAILURE: Alert = Alert(40);
pub const ALERT_NO_CERTIFICATE: Alert = Alert(41);
pub const ALERT_BAD_CERTIFICATE: Alert = Alert(42);
pub const ALERT_UNSUPPORTED_CERTIFICATE: Alert = Alert(43);
pub const ALERT_CERTIFICATE_REVOKED: Alert = Alert(44);
pub const ALERT_CERTIFICATE_EXPIRED: Alert = Alert(45);
pub const ALERT_CERTIFICATE_UNKNOWN: Alert = Alert(46);
pub const ALERT_ILLEGAL_PARAMETER: Alert = Alert(47);
pub const ALERT_UNKNOWN_CA: Alert = Alert(48);
pub const ALERT_ACCESS_DENIED: Alert = Alert(49);
pub const ALERT_DECODE_ERROR: Alert = Alert(50);
pub const ALERT_DECRYPT_ERROR: Alert = Alert(51);
pub const ALERT_PROTOCOL_VERSION: Alert = Alert(70);
pub const ALERT_INSUFFICIENT_SECURITY: Alert = Alert(71);
pub const ALERT_INTERNAL_ERROR: Alert = Alert(80);
pub const ALERT_INAPPROPRIATE_FALLBACK: Alert = Alert(86);
pub const ALERT_USER_CANCELED: Alert = Alert(90);
pub const ALERT_NO_RENEGOTIATION: Alert = Alert(100);
pub const ALERT_MISSING_EXTENSION: Alert = Alert(109);
pub const ALERT_UNSUPPORTED_EXTENSION: Alert = Alert(110);
pub const ALERT_UNRECOGNIZED_NAME: Alert = Alert(112);
pub const ALERT_BAD_CERTIFICATE_STATUS_RESPONSE: Alert = Alert(113);
pub const ALERT_UNKNOWN_PSK_IDENTITY: Alert = Alert(115);
pub const ALERT_CERTIFICATE_REQUIRED: Alert = Alert(116);
pub const ALERT_NO_APPLICATION_PROTOCOL: Alert = Alert(120);
/// Pre-RFC 8446 drafts signalled the end of 0-RTT data with an alert.
pub const ALERT_END_OF_EARLY_DATA: Alert = Alert(1);

impl Alert {
    /// Alerts this endpoint sends at warning level; everything else is
    /// fatal.
    pub fn default_level(self) -> u8 {
        match self {
            ALERT_NO_RENEGOTIATION | ALERT_CLOSE_NOTIFY | ALERT_NO_CERTIFICATE
            | ALERT_END_OF_EARLY_DATA => crate::ALERT_LEVEL_WARNING,
            _ => crate::ALERT_LEVEL_ERROR,
        }
    }

    pub fn description(self) -> &'static str {
        match self.0 {
            0 => "close notify",
            1 => "end of early data",
            10 => "unexpected message",
            20 => "bad record MAC",
            21 => "decryption failed",
            22 => "record overflow",
            30 => "decompression failure",
            40 => "handshake failure",
            41 => "no certificate",
            42 => "bad certificate",
            43 => "unsupported certificate",
            44 => "revoked certificate",
            45 => "expired certificate",
            46 => "unknown certificate",
            47 => "illegal parameter",
            48 => "unknown certificate authority",
            49 => "access denied",
            50 => "error decoding message",
            51 => "error decrypting message",
            70 => "protocol version not supported",
            71 => "insufficient security level",
            80 => "internal error",
            86 => "inappropriate fallback",
            90 => "user canceled",
            100 => "no renegotiation",
            109 => "missing extension",
            110 => "unsupported extension",
            112 => "unrecognized name",
            113 => "bad certificate status response",
            115 => "unknown PSK identity",
            116 => "certificate required",
            120 => "no application protocol",
            _ => "unknown alert",
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alert({}): {}", self.0, self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!(ALERT_CLOSE_NOTIFY.default_level(), crate::ALERT_LEVEL_WARNING);
        assert_eq!(ALERT_NO_RENEGOTIATION.default_level(), crate::ALERT_LEVEL_WARNING);
        assert_eq!(ALERT_BAD_RECORD_MAC.default_level(), crate::ALERT_LEVEL_ERROR);
        assert_eq!(ALERT_PROTOCOL_VERSION.default_level(), crate::ALERT_LEVEL_ERROR);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", ALERT_BAD_RECORD_MAC), "alert(20): bad record MAC");
    }
}
