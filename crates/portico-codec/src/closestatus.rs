//! Close status codes (RFC 6455 §7.4).

/// A typed close status code.
///
/// Codes 1000–1015 map to named variants; 3000–4999 are application or
/// registered codes; anything else in the valid range is carried through as
/// [`Reserved`](CloseStatus::Reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// Normal closure (1000).
    Normal,
    /// Endpoint going away (1001).
    GoingAway,
    /// Protocol error (1002).
    ProtocolError,
    /// Unsupported data type (1003).
    UnsupportedData,
    /// No status code present (1005) — never appears on the wire.
    NoStatusReceived,
    /// Abnormal closure (1006) — never appears on the wire.
    AbnormalClosure,
    /// Invalid payload data (1007).
    InvalidPayload,
    /// Policy violation (1008).
    PolicyViolation,
    /// Message too big (1009).
    MessageTooBig,
    /// Missing expected extension (1010).
    MandatoryExtension,
    /// Internal server error (1011).
    InternalError,
    /// Service restart (1012).
    ServiceRestart,
    /// Try again later (1013).
    TryAgainLater,
    /// Bad gateway (1014).
    BadGateway,
    /// TLS handshake failure (1015) — never appears on the wire.
    TlsHandshake,
    /// Application-defined or IANA-registered code in 3000–4999.
    Application(u16),
    /// Any other code in the 1000–2999 range without a name.
    Reserved(u16),
}

impl CloseStatus {
    /// The 2-byte wire value.
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::UnsupportedData => 1003,
            Self::NoStatusReceived => 1005,
            Self::AbnormalClosure => 1006,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::MessageTooBig => 1009,
            Self::MandatoryExtension => 1010,
            Self::InternalError => 1011,
            Self::ServiceRestart => 1012,
            Self::TryAgainLater => 1013,
            Self::BadGateway => 1014,
            Self::TlsHandshake => 1015,
            Self::Application(code) | Self::Reserved(code) => code,
        }
    }

    /// Map a wire value to its typed variant.
    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::UnsupportedData,
            1005 => Self::NoStatusReceived,
            1006 => Self::AbnormalClosure,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1010 => Self::MandatoryExtension,
            1011 => Self::InternalError,
            1012 => Self::ServiceRestart,
            1013 => Self::TryAgainLater,
            1014 => Self::BadGateway,
            1015 => Self::TlsHandshake,
            3000..=4999 => Self::Application(code),
            _ => Self::Reserved(code),
        }
    }
}

impl std::fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_u16())
    }
}

/// Build a close frame payload: the code big-endian, then the UTF-8 reason.
pub fn close_payload(status: CloseStatus, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&status.to_u16().to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Split a close frame payload into its code and reason bytes.
///
/// Returns `None` for an empty payload (no status code present). A one-byte
/// payload never reaches here; the decoder rejects it.
pub fn parse_close_payload(payload: &[u8]) -> Option<(CloseStatus, &[u8])> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    Some((CloseStatus::from_u16(code), &payload[2..]))
}
