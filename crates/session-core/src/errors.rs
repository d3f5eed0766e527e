//! Error taxonomy and the numeric code table.
//!
//! Operation errors return to the caller and never stop their subject; only
//! hard backend failures and observer deaths terminate sessions or calls.
//! The signaling adapters convert [`CoreError`] values to user-visible
//! `{code, text}` pairs through [`error_code`].

use thiserror::Error;

use crate::types::{CallId, RoomId, SessionId};

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error kinds.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("call not found: {0}")]
    CallNotFound(CallId),

    #[error("invite not found")]
    InviteNotFound,

    #[error("already answered")]
    AlreadyAnswered,

    #[error("no destination")]
    NoDestination,

    #[error("no answer")]
    NoAnswer,

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("room already exists: {0}")]
    RoomAlreadyExists(RoomId),

    #[error("session error: {0}")]
    SessionError(String),

    #[error("call error: {0}")]
    CallError(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("not yet available")]
    NotYet,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("sip: {0}")]
    Sip(#[from] SipError),

    #[error("verto: {0}")]
    Verto(#[from] VertoError),

    #[error("fs backend: {0}")]
    Fs(#[from] FsError),

    #[error("kms backend: {0}")]
    Kms(#[from] KmsError),
}

/// SIP-layer errors (codes 2110–2115).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SipError {
    #[error("registrar disabled")]
    RegistrarDisabled,

    #[error("domain not allowed: {0}")]
    DomainNotAllowed(String),

    #[error("register failed: {0}")]
    RegisterFailed(String),

    #[error("invite rejected")]
    InviteRejected,

    #[error("no sdp in request")]
    NoSdp,

    #[error("dialog not found")]
    DialogNotFound,
}

/// Verto-layer errors (codes 2130–2131).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VertoError {
    #[error("login rejected")]
    LoginRejected,

    #[error("unknown call: {0}")]
    UnknownCall(String),
}

/// FS backend errors (codes 2300–2311).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FsError {
    #[error("engine not available")]
    NotAvailable,

    #[error("start error: {0}")]
    StartError(String),

    #[error("offer error: {0}")]
    OfferError(String),

    #[error("answer error: {0}")]
    AnswerError(String),

    #[error("transfer error: {0}")]
    TransferError(String),

    #[error("bridge error: {0}")]
    BridgeError(String),

    #[error("conference error: {0}")]
    ConferenceError(String),

    #[error("layout error: {0}")]
    LayoutError(String),

    #[error("channel stop")]
    ChannelStop,

    #[error("channel not found")]
    ChannelNotFound,

    #[error("park timeout")]
    ParkTimeout,

    #[error("channel hangup: {0}")]
    Hangup(u16),
}

/// KMS backend errors (codes 2400–2412).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KmsError {
    #[error("engine not available")]
    NotAvailable,

    #[error("endpoint error: {0}")]
    EndpointError(String),

    #[error("offer error: {0}")]
    OfferError(String),

    #[error("answer error: {0}")]
    AnswerError(String),

    #[error("candidate error: {0}")]
    CandidateError(String),

    #[error("connect error: {0}")]
    ConnectError(String),

    #[error("release error: {0}")]
    ReleaseError(String),

    #[error("publisher not found: {0}")]
    PublisherNotFound(SessionId),

    #[error("room error: {0}")]
    RoomError(String),

    #[error("engine disconnected")]
    Disconnected,

    #[error("ice error: {0}")]
    IceError(String),

    #[error("media error: {0}")]
    MediaError(String),

    #[error("session limit reached")]
    SessionLimit,
}

/// Map an error to its user-visible `(code, text)` pair. SIP-layer errors
/// take 2110–2115, Verto 2130–2131, FS 2300–2311, KMS 2400–2412; kinds
/// without a protocol layer use the 1000 block.
pub fn error_code(err: &CoreError) -> (u32, String) {
    let code = match err {
        CoreError::Internal(_) => 1000,
        CoreError::UnknownCommand(_) => 1001,
        CoreError::SessionNotFound(_) => 1002,
        CoreError::CallNotFound(_) => 1003,
        CoreError::InviteNotFound => 1004,
        CoreError::AlreadyAnswered => 1005,
        CoreError::NoDestination => 1006,
        CoreError::NoAnswer => 1007,
        CoreError::UserNotFound(_) => 1008,
        CoreError::RoomNotFound(_) => 1009,
        CoreError::RoomAlreadyExists(_) => 1010,
        CoreError::SessionError(_) => 1011,
        CoreError::CallError(_) => 1012,
        CoreError::Timeout(_) => 1013,
        CoreError::NotYet => 1014,
        CoreError::Sip(e) => match e {
            SipError::RegistrarDisabled => 2110,
            SipError::DomainNotAllowed(_) => 2111,
            SipError::RegisterFailed(_) => 2112,
            SipError::InviteRejected => 2113,
            SipError::NoSdp => 2114,
            SipError::DialogNotFound => 2115,
        },
        CoreError::Verto(e) => match e {
            VertoError::LoginRejected => 2130,
            VertoError::UnknownCall(_) => 2131,
        },
        CoreError::Fs(e) => match e {
            FsError::NotAvailable => 2300,
            FsError::StartError(_) => 2301,
            FsError::OfferError(_) => 2302,
            FsError::AnswerError(_) => 2303,
            FsError::TransferError(_) => 2304,
            FsError::BridgeError(_) => 2305,
            FsError::ConferenceError(_) => 2306,
            FsError::LayoutError(_) => 2307,
            FsError::ChannelStop => 2308,
            FsError::ChannelNotFound => 2309,
            FsError::ParkTimeout => 2310,
            FsError::Hangup(_) => 2311,
        },
        CoreError::Kms(e) => match e {
            KmsError::NotAvailable => 2400,
            KmsError::EndpointError(_) => 2401,
            KmsError::OfferError(_) => 2402,
            KmsError::AnswerError(_) => 2403,
            KmsError::CandidateError(_) => 2404,
            KmsError::ConnectError(_) => 2405,
            KmsError::ReleaseError(_) => 2406,
            KmsError::PublisherNotFound(_) => 2407,
            KmsError::RoomError(_) => 2408,
            KmsError::Disconnected => 2409,
            KmsError::IceError(_) => 2410,
            KmsError::MediaError(_) => 2411,
            KmsError::SessionLimit => 2412,
        },
    };
    (code, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_codes_stay_in_their_ranges() {
        let (code, _) = error_code(&CoreError::Sip(SipError::RegistrarDisabled));
        assert!((2110..=2115).contains(&code));

        let (code, _) = error_code(&CoreError::Verto(VertoError::LoginRejected));
        assert!((2130..=2131).contains(&code));

        let (code, _) = error_code(&CoreError::Fs(FsError::Hangup(16)));
        assert!((2300..=2311).contains(&code));

        let (code, _) = error_code(&CoreError::Kms(KmsError::Disconnected));
        assert!((2400..=2412).contains(&code));
    }

    #[test]
    fn text_carries_detail() {
        let (_, text) = error_code(&CoreError::Fs(FsError::BridgeError("peer gone".into())));
        assert!(text.contains("peer gone"));
    }
}
