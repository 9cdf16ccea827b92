//! Data structures shared between the registry, the token workers and
//! the request dispatch.

mod tokens;
pub use self::tokens::*;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};


//------------ TokenKind -----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Software,
    Hardware,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenKind::Software => f.write_str("software"),
            TokenKind::Hardware => f.write_str("hardware"),
        }
    }
}


//------------ TokenStatus ---------------------------------------------------

/// The login related status of a token.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    #[default]
    NotInitialized,
    Ok,
    UserPinLocked,
    UserPinFinalTry,
    UserPinCountLow,
    UserPinIncorrect,
    UserPinInvalid,
    UserPinExpired,
}

impl TokenStatus {
    /// Returns whether a login may be attempted in this status.
    pub fn allows_login(self) -> bool {
        !matches!(
            self,
            TokenStatus::NotInitialized | TokenStatus::UserPinLocked
        )
    }
}


//------------ KeyUsage ------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    Signing,
    Authentication,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyUsage::Signing => f.write_str("signing"),
            KeyUsage::Authentication => f.write_str("authentication"),
        }
    }
}

impl FromStr for KeyUsage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "signing" | "sign" => Ok(KeyUsage::Signing),
            "authentication" | "auth" => Ok(KeyUsage::Authentication),
            _ => Err(format!("unknown key usage '{s}'")),
        }
    }
}


//------------ CertStatus ----------------------------------------------------

/// The registration status of a certificate.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertStatus {
    Saved,
    Registration,
    Registered,
    DeletionInProgress,
    GlobalError,
}

impl fmt::Display for CertStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            CertStatus::Saved => "saved",
            CertStatus::Registration => "registration",
            CertStatus::Registered => "registered",
            CertStatus::DeletionInProgress => "deletion_in_progress",
            CertStatus::GlobalError => "global_error",
        })
    }
}


//------------ CertRequestFormat ---------------------------------------------

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertRequestFormat {
    #[default]
    Der,
    Pem,
}


//------------ ClientId ------------------------------------------------------

/// The identifier of the member owning a signing certificate.
///
/// Members are identified by their path in the trust federation, e.g.
/// `EE/GOV/70000001`.
#[derive(
    Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize
)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        ClientId(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        ClientId(s)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_usage() {
        assert_eq!(KeyUsage::from_str("SIGNING"), Ok(KeyUsage::Signing));
        assert_eq!(
            KeyUsage::from_str("auth"), Ok(KeyUsage::Authentication)
        );
        assert!(KeyUsage::from_str("encryption").is_err());
    }

    #[test]
    fn locked_token_cannot_log_in() {
        assert!(!TokenStatus::UserPinLocked.allows_login());
        assert!(!TokenStatus::NotInitialized.allows_login());
        assert!(TokenStatus::UserPinIncorrect.allows_login());
        assert!(TokenStatus::Ok.allows_login());
    }
}
