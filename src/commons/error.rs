//! Defines all signer errors.

use std::borrow::Cow;
use std::time::Duration;
use std::{error, fmt, io};

use serde::{Deserialize, Serialize};


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // Unknown entities
    //-----------------------------------------------------------------
    TokenNotFound(String),
    KeyNotFound(String),
    CertNotFound(String),
    CertRequestNotFound(String),

    //-----------------------------------------------------------------
    // Token state
    //-----------------------------------------------------------------
    TokenNotActive(String),
    TokenNotInitialized(String),
    TokenReadOnly(String),
    PinIncorrect(String),
    PinPolicyViolation(String),
    KeyNotAvailable(String),

    //-----------------------------------------------------------------
    // Certificates
    //-----------------------------------------------------------------
    WrongCertUsage(String),
    CertificateAlreadyExists(String),
    InvalidCertificate(String),

    //-----------------------------------------------------------------
    // Signing and devices
    //-----------------------------------------------------------------
    UnsupportedSignAlgorithm {
        key_id: String,
        algorithm: String,
    },
    SessionPoolExhausted {
        token_id: String,
        timeout: Duration,
    },
    Device {
        context: Cow<'static, str>,
        err: String,
    },
    CannotSign {
        key_id: String,
        reason: String,
    },

    //-----------------------------------------------------------------
    // System issues
    //-----------------------------------------------------------------
    Io {
        context: Cow<'static, str>,
        err: io::Error,
    },
    Json(serde_json::Error),
    Crypto(String),
    Other(String),
}

impl Error {
    pub fn io(context: impl Into<Cow<'static, str>>, err: io::Error) -> Self {
        Error::Io { context: context.into(), err }
    }

    pub fn device(
        context: impl Into<Cow<'static, str>>, err: impl fmt::Display
    ) -> Self {
        Error::Device { context: context.into(), err: err.to_string() }
    }

    pub fn cannot_sign(key_id: &str, reason: impl fmt::Display) -> Self {
        Error::CannotSign {
            key_id: key_id.to_string(), reason: reason.to_string()
        }
    }

    pub fn unsupported_algorithm(
        key_id: &str, algorithm: impl fmt::Display
    ) -> Self {
        Error::UnsupportedSignAlgorithm {
            key_id: key_id.to_string(), algorithm: algorithm.to_string()
        }
    }

    pub fn wrong_usage(msg: impl Into<String>) -> Self {
        Error::WrongCertUsage(msg.into())
    }

    pub fn invalid_cert(msg: impl fmt::Display) -> Self {
        Error::InvalidCertificate(msg.to_string())
    }

    pub fn crypto(msg: impl fmt::Display) -> Self {
        Error::Crypto(msg.to_string())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Returns the kind of error for reporting to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TokenNotFound(_)
            | Error::KeyNotFound(_)
            | Error::CertNotFound(_)
            | Error::CertRequestNotFound(_) => ErrorKind::NotFound,
            Error::TokenNotActive(_) => ErrorKind::TokenNotActive,
            Error::TokenNotInitialized(_) => ErrorKind::TokenNotInitialized,
            Error::TokenReadOnly(_) => ErrorKind::TokenReadOnly,
            Error::PinIncorrect(_) => ErrorKind::PinIncorrect,
            Error::PinPolicyViolation(_) => ErrorKind::PinPolicyViolation,
            Error::KeyNotAvailable(_) => ErrorKind::KeyNotAvailable,
            Error::WrongCertUsage(_) => ErrorKind::WrongCertUsage,
            Error::CertificateAlreadyExists(_) => {
                ErrorKind::CertificateAlreadyExists
            }
            Error::InvalidCertificate(_) => ErrorKind::InvalidCertificate,
            Error::UnsupportedSignAlgorithm { .. } => {
                ErrorKind::UnsupportedSignAlgorithm
            }
            Error::SessionPoolExhausted { .. } => {
                ErrorKind::SessionPoolExhausted
            }
            Error::Device { .. } => ErrorKind::DeviceError,
            Error::CannotSign { .. } => ErrorKind::CannotSign,
            Error::Io { .. }
            | Error::Json(_)
            | Error::Crypto(_)
            | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Returns whether the caller may succeed by retrying with corrected
    /// input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TokenReadOnly
                | ErrorKind::KeyNotAvailable
                | ErrorKind::PinIncorrect
        )
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse { kind: self.kind(), msg: self.to_string() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::TokenNotFound(id) => write!(f, "Token '{id}' not found"),
            Error::KeyNotFound(id) => write!(f, "Key '{id}' not found"),
            Error::CertNotFound(id) => {
                write!(f, "Certificate '{id}' not found")
            }
            Error::CertRequestNotFound(id) => {
                write!(f, "Certificate request '{id}' not found")
            }
            Error::TokenNotActive(id) => {
                write!(f, "Token '{id}' not active")
            }
            Error::TokenNotInitialized(id) => {
                write!(f, "Token '{id}' is not initialized")
            }
            Error::TokenReadOnly(id) => {
                write!(f, "Token '{id}' is read-only")
            }
            Error::PinIncorrect(id) => {
                write!(f, "PIN incorrect for token '{id}'")
            }
            Error::PinPolicyViolation(reason) => {
                write!(f, "Token PIN does not meet the requirements: {reason}")
            }
            Error::KeyNotAvailable(id) => {
                write!(f, "Key '{id}' is not available")
            }
            Error::WrongCertUsage(msg) => f.write_str(msg),
            Error::CertificateAlreadyExists(hash) => {
                write!(f, "Certificate with hash '{hash}' already exists")
            }
            Error::InvalidCertificate(msg) => {
                write!(f, "Invalid certificate: {msg}")
            }
            Error::UnsupportedSignAlgorithm { key_id, algorithm } => {
                write!(f,
                    "Unsupported signature algorithm '{algorithm}' \
                     for key '{key_id}'"
                )
            }
            Error::SessionPoolExhausted { token_id, timeout } => {
                write!(f,
                    "No PKCS#11 session available for token '{token_id}' \
                     within {} ms",
                    timeout.as_millis()
                )
            }
            Error::Device { context, err } => {
                write!(f, "{context}: device error: {err}")
            }
            Error::CannotSign { key_id, reason } => {
                write!(f, "Cannot sign with key '{key_id}': {reason}")
            }
            Error::Io { context, err } => write!(f, "{context}: {err}"),
            Error::Json(err) => write!(f, "Invalid JSON: {err}"),
            Error::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for Error { }

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io("I/O error", err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Error::Crypto(err.to_string())
    }
}


//------------ ErrorKind -----------------------------------------------------

/// The kind of an error as reported to clients.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    TokenNotActive,
    TokenNotInitialized,
    TokenReadOnly,
    PinIncorrect,
    PinPolicyViolation,
    KeyNotAvailable,
    WrongCertUsage,
    CertificateAlreadyExists,
    InvalidCertificate,
    UnsupportedSignAlgorithm,
    SessionPoolExhausted,
    DeviceError,
    CannotSign,
    Internal,
}


//------------ ErrorResponse -------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub msg: String,
}


//------------ Tests ---------------------------------------------------------
