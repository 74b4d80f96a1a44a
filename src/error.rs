use thiserror::Error;

use crate::stun;

/// Errors surfaced by the agent and its checklist operations.
///
/// Validation failures (`FingerprintNotFound`, `FingerprintMismatch`,
/// `IntegrityMismatch`) drop the offending message without failing the pair;
/// the transactor keeps retransmitting until a valid response or a timeout
/// arrives. Only `UnrecoverableErrorCode` moves a pair to `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The buffer does not look like a STUN message. Callers may treat the
    /// datagram as application data.
    #[error("packet is not a STUN message")]
    NotStunMessage,
    /// The buffer looked like STUN but failed to decode.
    #[error("malformed STUN message: {0}")]
    MalformedStun(stun::Error),
    /// The response carries no FINGERPRINT attribute.
    #[error("no FINGERPRINT attribute in response")]
    FingerprintNotFound,
    /// The FINGERPRINT CRC does not cover the message.
    #[error("FINGERPRINT mismatch")]
    FingerprintMismatch,
    /// Short-term MESSAGE-INTEGRITY verification failed.
    #[error("MESSAGE-INTEGRITY mismatch")]
    IntegrityMismatch,
    /// A response whose class is neither success nor error.
    #[error("unexpected response message class: {0}")]
    UnexpectedResponseType(stun::MessageClass),
    /// An error response without an ERROR-CODE attribute.
    #[error("error response without ERROR-CODE")]
    MissingErrorCode,
    /// A terminal STUN error code; the checked pair is failed.
    #[error("unrecoverable STUN error code {0}")]
    UnrecoverableErrorCode(u16),
    /// STUN error code 487. The caller resolves it by tie-breaker
    /// comparison, see [`Agent::resolve_role_conflict`](crate::Agent::resolve_role_conflict).
    #[error("role conflict")]
    RoleConflict,
    /// A success response without an XOR-MAPPED-ADDRESS attribute.
    #[error("success response without XOR-MAPPED-ADDRESS")]
    MappedAddressNotFound,
    /// No checklist is selected, or none is running.
    #[error("no active checklist")]
    NoChecklist,
    /// The current checklist has no pair eligible for a check.
    #[error("no pair available for check")]
    NoPair,
    /// No per-pair credentials were registered for the pair.
    #[error("no context registered for pair")]
    MissingContext,
    /// A foundation exceeded the fixed key capacity.
    #[error("foundation of {0} bytes exceeds the {max} byte bound", max = crate::foundation::MAX_FOUNDATION_LEN)]
    OversizedFoundation(usize),
    /// Synchronous failure reported by the STUN transactor.
    #[error("transport: {0}")]
    Transport(String),
}
