use thiserror::Error;

use crate::dn::DnError;

/// LDAP result codes from RFC 4511, restricted to the ones the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    CompareFalse = 5,
    CompareTrue = 6,
    AdminLimitExceeded = 11,
    UnavailableCriticalExtension = 12,
    NoSuchAttribute = 16,
    ConstraintViolation = 19,
    TypeOrValueExists = 20,
    InvalidSyntax = 21,
    NoSuchObject = 32,
    InvalidDnSyntax = 34,
    InappropriateAuth = 48,
    InvalidCredentials = 49,
    InsufficientAccess = 50,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    ObjectClassViolation = 65,
    AlreadyExists = 68,
    Other = 80,
}

impl ResultCode {
    /// Numeric wire value of the result code.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::CompareTrue | Self::CompareFalse)
    }
}

/// Canonical error type for directory core operations.
///
/// Every variant maps onto an RFC 4511 result code via [`LdapError::result_code`],
/// which is what ultimately travels back to the client.
#[derive(Debug, Error)]
pub enum LdapError {
    /// The request could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A DN failed to parse or normalize.
    #[error(transparent)]
    InvalidDn(#[from] DnError),

    /// An attribute value violated its syntax.
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),

    /// A critical control is unknown or inapplicable to the operation.
    #[error("unavailable critical extension: {0}")]
    UnavailableCriticalExtension(String),

    /// The requestor lacks access to the target.
    #[error("insufficient access: {0}")]
    InsufficientAccess(String),

    /// Simple bind credentials did not match.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The authentication method is not appropriate for the target.
    #[error("inappropriate authentication: {0}")]
    InappropriateAuth(String),

    /// The server refuses to perform the operation.
    #[error("unwilling to perform: {0}")]
    UnwillingToPerform(String),

    /// An administrative constraint was violated.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The target entry does not exist.
    #[error("no such object: {0}")]
    NoSuchObject(String),

    /// The entry to be added already exists.
    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    /// The named attribute is absent from the target entry.
    #[error("no such attribute: {0}")]
    NoSuchAttribute(String),

    /// An attribute value to be added is already present.
    #[error("type or value exists: {0}")]
    TypeOrValueExists(String),

    /// The entry does not conform to its object classes.
    #[error("object class violation: {0}")]
    ObjectClassViolation(String),

    /// The server is too busy to service the request.
    #[error("server busy: {0}")]
    Busy(String),

    /// The target backend or subsystem is shut down or deleted.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// An internal inconsistency was detected.
    #[error("operations error: {0}")]
    OperationsError(String),

    /// A hard limit (CSN time adjustment, proxy depth) was exceeded.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// A size or time limit was exceeded.
    #[error("administrative limit exceeded: {0}")]
    AdminLimitExceeded(String),

    /// A parameter-block read addressed a key that is not set.
    #[error("invalid parameter key: {0}")]
    InvalidKey(&'static str),

    /// An underlying I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LdapError {
    /// Maps the error onto the result code sent to the client.
    #[must_use]
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::MalformedMessage(_) => ResultCode::ProtocolError,
            Self::InvalidDn(_) => ResultCode::InvalidDnSyntax,
            Self::InvalidSyntax(_) => ResultCode::InvalidSyntax,
            Self::UnavailableCriticalExtension(_) => ResultCode::UnavailableCriticalExtension,
            Self::InsufficientAccess(_) => ResultCode::InsufficientAccess,
            Self::InvalidCredentials => ResultCode::InvalidCredentials,
            Self::InappropriateAuth(_) => ResultCode::InappropriateAuth,
            Self::UnwillingToPerform(_) => ResultCode::UnwillingToPerform,
            Self::ConstraintViolation(_) => ResultCode::ConstraintViolation,
            Self::NoSuchObject(_) => ResultCode::NoSuchObject,
            Self::AlreadyExists(_) => ResultCode::AlreadyExists,
            Self::NoSuchAttribute(_) => ResultCode::NoSuchAttribute,
            Self::TypeOrValueExists(_) => ResultCode::TypeOrValueExists,
            Self::ObjectClassViolation(_) => ResultCode::ObjectClassViolation,
            Self::Busy(_) => ResultCode::Busy,
            Self::Unavailable(_) => ResultCode::Unavailable,
            Self::LimitExceeded(_) => ResultCode::UnwillingToPerform,
            Self::AdminLimitExceeded(_) => ResultCode::AdminLimitExceeded,
            Self::OperationsError(_) | Self::InvalidKey(_) | Self::Io(_) => {
                ResultCode::OperationsError
            }
        }
    }

    /// Creates a `NoSuchObject` for a DN.
    #[must_use]
    pub fn no_such_object(dn: impl Into<String>) -> Self {
        Self::NoSuchObject(dn.into())
    }

    /// Creates an `UnwillingToPerform` with a diagnostic message.
    #[must_use]
    pub fn unwilling(message: impl Into<String>) -> Self {
        Self::UnwillingToPerform(message.into())
    }

    /// Creates an `OperationsError` with a diagnostic message.
    #[must_use]
    pub fn operations_error(message: impl Into<String>) -> Self {
        Self::OperationsError(message.into())
    }

    /// Rebuilds an error from a result code and diagnostic text, for paths
    /// (callbacks, backends) that report outcomes as codes.
    #[must_use]
    pub fn from_code(code: ResultCode, text: impl Into<String>) -> Self {
        let text = text.into();
        match code {
            ResultCode::ProtocolError => Self::MalformedMessage(text),
            ResultCode::InvalidSyntax => Self::InvalidSyntax(text),
            ResultCode::UnavailableCriticalExtension => Self::UnavailableCriticalExtension(text),
            ResultCode::InsufficientAccess => Self::InsufficientAccess(text),
            ResultCode::InvalidCredentials => Self::InvalidCredentials,
            ResultCode::InappropriateAuth => Self::InappropriateAuth(text),
            ResultCode::UnwillingToPerform => Self::UnwillingToPerform(text),
            ResultCode::ConstraintViolation => Self::ConstraintViolation(text),
            ResultCode::NoSuchObject => Self::NoSuchObject(text),
            ResultCode::AlreadyExists => Self::AlreadyExists(text),
            ResultCode::NoSuchAttribute => Self::NoSuchAttribute(text),
            ResultCode::TypeOrValueExists => Self::TypeOrValueExists(text),
            ResultCode::ObjectClassViolation => Self::ObjectClassViolation(text),
            ResultCode::Busy => Self::Busy(text),
            ResultCode::Unavailable => Self::Unavailable(text),
            ResultCode::AdminLimitExceeded
            | ResultCode::TimeLimitExceeded
            | ResultCode::SizeLimitExceeded => Self::AdminLimitExceeded(text),
            _ => Self::OperationsError(text),
        }
    }
}

/// Convenient result alias for directory operations.
pub type LdapResult<T> = Result<T, LdapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes_match_rfc_values() {
        assert_eq!(ResultCode::Success.as_u32(), 0);
        assert_eq!(ResultCode::NoSuchObject.as_u32(), 32);
        assert_eq!(ResultCode::UnwillingToPerform.as_u32(), 53);
        assert_eq!(ResultCode::AlreadyExists.as_u32(), 68);
    }

    #[test]
    fn errors_map_to_codes() {
        assert_eq!(
            LdapError::no_such_object("cn=missing").result_code(),
            ResultCode::NoSuchObject
        );
        assert_eq!(
            LdapError::InvalidCredentials.result_code(),
            ResultCode::InvalidCredentials
        );
        assert_eq!(
            LdapError::AdminLimitExceeded("size".into()).result_code(),
            ResultCode::AdminLimitExceeded
        );
    }
}
