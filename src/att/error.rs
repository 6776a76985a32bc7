//! ATT error codes and the error-class ordering used by Read Multiple

use thiserror::Error;

// Wire values from the standard error table
pub const ATT_ERROR_INVALID_HANDLE: u8 = 0x01;
pub const ATT_ERROR_READ_NOT_PERMITTED: u8 = 0x02;
pub const ATT_ERROR_WRITE_NOT_PERMITTED: u8 = 0x03;
pub const ATT_ERROR_INVALID_PDU: u8 = 0x04;
pub const ATT_ERROR_INSUFFICIENT_AUTHENTICATION: u8 = 0x05;
pub const ATT_ERROR_REQUEST_NOT_SUPPORTED: u8 = 0x06;
pub const ATT_ERROR_INVALID_OFFSET: u8 = 0x07;
pub const ATT_ERROR_INSUFFICIENT_AUTHORIZATION: u8 = 0x08;
pub const ATT_ERROR_PREPARE_QUEUE_FULL: u8 = 0x09;
pub const ATT_ERROR_ATTRIBUTE_NOT_FOUND: u8 = 0x0A;
pub const ATT_ERROR_ATTRIBUTE_NOT_LONG: u8 = 0x0B;
pub const ATT_ERROR_INSUFFICIENT_ENCRYPTION_KEY_SIZE: u8 = 0x0C;
pub const ATT_ERROR_INVALID_ATTRIBUTE_VALUE_LENGTH: u8 = 0x0D;
pub const ATT_ERROR_UNLIKELY: u8 = 0x0E;
pub const ATT_ERROR_INSUFFICIENT_ENCRYPTION: u8 = 0x0F;
pub const ATT_ERROR_UNSUPPORTED_GROUP_TYPE: u8 = 0x10;
pub const ATT_ERROR_INSUFFICIENT_RESOURCES: u8 = 0x11;
pub const ATT_ERROR_WRITE_REQUEST_REJECTED: u8 = 0xFC;
pub const ATT_ERROR_CCCD_IMPROPERLY_CONFIGURED: u8 = 0xFD;
pub const ATT_ERROR_PROCEDURE_ALREADY_IN_PROGRESS: u8 = 0xFE;
pub const ATT_ERROR_OUT_OF_RANGE: u8 = 0xFF;
pub const ATT_ERROR_APPLICATION_START: u8 = 0x80;
pub const ATT_ERROR_APPLICATION_END: u8 = 0x9F;

/// An ATT protocol error code.
///
/// `SUCCESS` is represented by the absence of an error; a zero byte arriving
/// inside an `ERROR_RESPONSE` is substituted with [`AttErrorCode::Unlikely`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttErrorCode {
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    Unlikely,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
    WriteRequestRejected,
    CccdImproperlyConfigured,
    ProcedureAlreadyInProgress,
    OutOfRange,
    /// Application-defined code in 0x80..=0x9F
    Application(u8),
    /// Any other code from the common-profile range or future revisions
    Other(u8),
}

impl From<u8> for AttErrorCode {
    fn from(code: u8) -> Self {
        match code {
            // 0 is not a valid error code on the wire
            0x00 => AttErrorCode::Unlikely,
            ATT_ERROR_INVALID_HANDLE => AttErrorCode::InvalidHandle,
            ATT_ERROR_READ_NOT_PERMITTED => AttErrorCode::ReadNotPermitted,
            ATT_ERROR_WRITE_NOT_PERMITTED => AttErrorCode::WriteNotPermitted,
            ATT_ERROR_INVALID_PDU => AttErrorCode::InvalidPdu,
            ATT_ERROR_INSUFFICIENT_AUTHENTICATION => AttErrorCode::InsufficientAuthentication,
            ATT_ERROR_REQUEST_NOT_SUPPORTED => AttErrorCode::RequestNotSupported,
            ATT_ERROR_INVALID_OFFSET => AttErrorCode::InvalidOffset,
            ATT_ERROR_INSUFFICIENT_AUTHORIZATION => AttErrorCode::InsufficientAuthorization,
            ATT_ERROR_PREPARE_QUEUE_FULL => AttErrorCode::PrepareQueueFull,
            ATT_ERROR_ATTRIBUTE_NOT_FOUND => AttErrorCode::AttributeNotFound,
            ATT_ERROR_ATTRIBUTE_NOT_LONG => AttErrorCode::AttributeNotLong,
            ATT_ERROR_INSUFFICIENT_ENCRYPTION_KEY_SIZE => {
                AttErrorCode::InsufficientEncryptionKeySize
            }
            ATT_ERROR_INVALID_ATTRIBUTE_VALUE_LENGTH => AttErrorCode::InvalidAttributeValueLength,
            ATT_ERROR_UNLIKELY => AttErrorCode::Unlikely,
            ATT_ERROR_INSUFFICIENT_ENCRYPTION => AttErrorCode::InsufficientEncryption,
            ATT_ERROR_UNSUPPORTED_GROUP_TYPE => AttErrorCode::UnsupportedGroupType,
            ATT_ERROR_INSUFFICIENT_RESOURCES => AttErrorCode::InsufficientResources,
            ATT_ERROR_WRITE_REQUEST_REJECTED => AttErrorCode::WriteRequestRejected,
            ATT_ERROR_CCCD_IMPROPERLY_CONFIGURED => AttErrorCode::CccdImproperlyConfigured,
            ATT_ERROR_PROCEDURE_ALREADY_IN_PROGRESS => AttErrorCode::ProcedureAlreadyInProgress,
            ATT_ERROR_OUT_OF_RANGE => AttErrorCode::OutOfRange,
            c if (ATT_ERROR_APPLICATION_START..=ATT_ERROR_APPLICATION_END).contains(&c) => {
                AttErrorCode::Application(c)
            }
            c => AttErrorCode::Other(c),
        }
    }
}

impl From<AttErrorCode> for u8 {
    fn from(code: AttErrorCode) -> Self {
        match code {
            AttErrorCode::InvalidHandle => ATT_ERROR_INVALID_HANDLE,
            AttErrorCode::ReadNotPermitted => ATT_ERROR_READ_NOT_PERMITTED,
            AttErrorCode::WriteNotPermitted => ATT_ERROR_WRITE_NOT_PERMITTED,
            AttErrorCode::InvalidPdu => ATT_ERROR_INVALID_PDU,
            AttErrorCode::InsufficientAuthentication => ATT_ERROR_INSUFFICIENT_AUTHENTICATION,
            AttErrorCode::RequestNotSupported => ATT_ERROR_REQUEST_NOT_SUPPORTED,
            AttErrorCode::InvalidOffset => ATT_ERROR_INVALID_OFFSET,
            AttErrorCode::InsufficientAuthorization => ATT_ERROR_INSUFFICIENT_AUTHORIZATION,
            AttErrorCode::PrepareQueueFull => ATT_ERROR_PREPARE_QUEUE_FULL,
            AttErrorCode::AttributeNotFound => ATT_ERROR_ATTRIBUTE_NOT_FOUND,
            AttErrorCode::AttributeNotLong => ATT_ERROR_ATTRIBUTE_NOT_LONG,
            AttErrorCode::InsufficientEncryptionKeySize => {
                ATT_ERROR_INSUFFICIENT_ENCRYPTION_KEY_SIZE
            }
            AttErrorCode::InvalidAttributeValueLength => ATT_ERROR_INVALID_ATTRIBUTE_VALUE_LENGTH,
            AttErrorCode::Unlikely => ATT_ERROR_UNLIKELY,
            AttErrorCode::InsufficientEncryption => ATT_ERROR_INSUFFICIENT_ENCRYPTION,
            AttErrorCode::UnsupportedGroupType => ATT_ERROR_UNSUPPORTED_GROUP_TYPE,
            AttErrorCode::InsufficientResources => ATT_ERROR_INSUFFICIENT_RESOURCES,
            AttErrorCode::WriteRequestRejected => ATT_ERROR_WRITE_REQUEST_REJECTED,
            AttErrorCode::CccdImproperlyConfigured => ATT_ERROR_CCCD_IMPROPERLY_CONFIGURED,
            AttErrorCode::ProcedureAlreadyInProgress => ATT_ERROR_PROCEDURE_ALREADY_IN_PROGRESS,
            AttErrorCode::OutOfRange => ATT_ERROR_OUT_OF_RANGE,
            AttErrorCode::Application(c) => c,
            AttErrorCode::Other(c) => c,
        }
    }
}

impl AttErrorCode {
    /// Ranks an error for the Read Multiple aggregation rule: when several
    /// handles fail for different reasons, the whole response reports the
    /// highest-ranked class, naming the first handle that hit it.
    pub fn read_error_rank(self) -> u8 {
        match self {
            AttErrorCode::InsufficientAuthorization => 5,
            AttErrorCode::InsufficientAuthentication => 4,
            AttErrorCode::InsufficientEncryptionKeySize => 3,
            AttErrorCode::InsufficientEncryption => 2,
            AttErrorCode::ReadNotPermitted => 1,
            _ => 0,
        }
    }
}

/// ATT-layer failure as seen by the client side of the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttError {
    #[error("ATT error {code:?} for handle 0x{handle:04X}")]
    Protocol { code: AttErrorCode, handle: u16 },

    #[error("ATT transaction timed out")]
    Timeout,

    #[error("connection closed")]
    Disconnected,

    #[error("ATT bearer is shut down after timeout")]
    BearerDead,
}

impl AttError {
    pub fn protocol(code: AttErrorCode, handle: u16) -> Self {
        AttError::Protocol { code, handle }
    }

    /// The protocol error code, if this failure carries one.
    pub fn code(&self) -> Option<AttErrorCode> {
        match self {
            AttError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type AttResult<T> = Result<T, AttError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_wire_code_becomes_unlikely() {
        assert_eq!(AttErrorCode::from(0x00), AttErrorCode::Unlikely);
    }

    #[test]
    fn application_range_is_preserved() {
        for code in 0x80u8..=0x9F {
            assert_eq!(AttErrorCode::from(code), AttErrorCode::Application(code));
            assert_eq!(u8::from(AttErrorCode::Application(code)), code);
        }
    }

    #[test]
    fn read_error_classes_are_ordered() {
        let ranked = [
            AttErrorCode::InsufficientAuthorization,
            AttErrorCode::InsufficientAuthentication,
            AttErrorCode::InsufficientEncryptionKeySize,
            AttErrorCode::InsufficientEncryption,
            AttErrorCode::ReadNotPermitted,
            AttErrorCode::InvalidHandle,
        ];
        for pair in ranked.windows(2) {
            assert!(pair[0].read_error_rank() > pair[1].read_error_rank());
        }
    }
}
