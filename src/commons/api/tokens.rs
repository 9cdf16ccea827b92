//! Tokens, keys, certificates and certificate requests.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::commons::crypto::x509;
use crate::commons::error::Error;
use crate::commons::util::ext_serde;

use super::{CertStatus, ClientId, KeyUsage, TokenKind, TokenStatus};


//------------ TokenInfo -----------------------------------------------------

/// A key container, either the software keystore or a PKCS#11 token.
///
/// The `status`, `active`, `available` and `device_info` fields describe
/// the token as currently seen at runtime. They are reset whenever the
/// key configuration is loaded.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TokenInfo {
    pub id: String,
    pub kind: TokenKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default = "default_true")]
    pub batch_signing_enabled: bool,

    #[serde(default)]
    pub pin_verification_per_signing: bool,

    /// The configured PKCS#11 module this token was found in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_uid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_index: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default)]
    pub status: TokenStatus,

    #[serde(default)]
    pub active: bool,

    #[serde(default)]
    pub available: bool,

    /// Descriptive information reported by the device.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub device_info: BTreeMap<String, String>,

    #[serde(default)]
    pub keys: Vec<KeyInfo>,
}

fn default_true() -> bool {
    true
}

impl TokenInfo {
    pub fn new(id: impl Into<String>, kind: TokenKind) -> Self {
        TokenInfo {
            id: id.into(),
            kind,
            friendly_name: None,
            read_only: false,
            batch_signing_enabled: true,
            pin_verification_per_signing: false,
            module_uid: None,
            slot_index: None,
            serial_number: None,
            label: None,
            status: TokenStatus::NotInitialized,
            active: false,
            available: false,
            device_info: BTreeMap::new(),
            keys: Vec::new(),
        }
    }

    pub fn key(&self, key_id: &str) -> Option<&KeyInfo> {
        self.keys.iter().find(|key| key.id == key_id)
    }

    pub fn key_mut(&mut self, key_id: &str) -> Option<&mut KeyInfo> {
        self.keys.iter_mut().find(|key| key.id == key_id)
    }

    /// Returns a copy fit for persisting.
    ///
    /// Runtime state is reset and certificates only discovered on the
    /// device are left out.
    pub fn to_persisted(&self) -> TokenInfo {
        TokenInfo {
            status: TokenStatus::NotInitialized,
            active: false,
            available: false,
            device_info: BTreeMap::new(),
            keys: self.keys.iter().map(KeyInfo::to_persisted).collect(),
            ..self.clone()
        }
    }
}


//------------ KeyInfo -------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyInfo {
    /// The hex encoded key identifier.
    pub id: String,

    pub token_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Fixed on first certificate request or import.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<KeyUsage>,

    /// The DER encoded SubjectPublicKeyInfo, once known.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "ext_serde::de_bytes_opt",
        serialize_with = "ext_serde::ser_bytes_opt"
    )]
    pub public_key: Option<Bytes>,

    #[serde(default)]
    pub available: bool,

    /// The PKCS#11 mechanism used for signing with this key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_mechanism: Option<String>,

    #[serde(default)]
    pub certs: Vec<CertificateInfo>,

    #[serde(default)]
    pub cert_requests: Vec<CertRequestInfo>,
}

impl KeyInfo {
    pub fn new(token_id: &str, id: impl Into<String>) -> Self {
        KeyInfo {
            id: id.into(),
            token_id: token_id.to_string(),
            friendly_name: None,
            label: None,
            usage: None,
            public_key: None,
            available: false,
            sign_mechanism: None,
            certs: Vec::new(),
            cert_requests: Vec::new(),
        }
    }

    pub fn cert(&self, cert_id: &str) -> Option<&CertificateInfo> {
        self.certs.iter().find(|cert| cert.id == cert_id)
    }

    pub fn cert_by_hash(&self, hash: &str) -> Option<&CertificateInfo> {
        self.certs.iter().find(|cert| cert.has_hash(hash))
    }

    pub fn cert_request(&self, csr_id: &str) -> Option<&CertRequestInfo> {
        self.cert_requests.iter().find(|req| req.id == csr_id)
    }

    /// Returns whether the key has certificates or requests worth keeping.
    pub fn has_persisted_data(&self) -> bool {
        !self.cert_requests.is_empty()
            || self.certs.iter().any(|cert| cert.saved_to_configuration)
    }

    fn to_persisted(&self) -> KeyInfo {
        KeyInfo {
            available: false,
            certs: self.certs.iter()
                .filter(|cert| cert.saved_to_configuration)
                .cloned()
                .collect(),
            ..self.clone()
        }
    }
}


//------------ CertificateInfo -----------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertificateInfo {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<ClientId>,

    pub active: bool,

    /// False for certificates only discovered on a device.
    pub saved_to_configuration: bool,

    pub status: CertStatus,

    #[serde(
        deserialize_with = "ext_serde::de_bytes",
        serialize_with = "ext_serde::ser_bytes"
    )]
    pub certificate_bytes: Bytes,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "ext_serde::de_bytes_opt",
        serialize_with = "ext_serde::ser_bytes_opt"
    )]
    pub ocsp_bytes: Option<Bytes>,

    /// Why the last OCSP verification of this certificate failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocsp_verify_error: Option<String>,
}

impl CertificateInfo {
    /// Returns the hex encoded SHA-1 hash of the certificate.
    pub fn hash(&self) -> Result<String, Error> {
        x509::cert_hash(&self.certificate_bytes)
    }

    /// Returns whether the certificate has the given hash.
    ///
    /// Hex digits are compared ignoring case. A certificate whose hash
    /// cannot be computed matches nothing.
    pub fn has_hash(&self, hash: &str) -> bool {
        self.hash().is_ok_and(|own| own.eq_ignore_ascii_case(hash))
    }
}


//------------ CertRequestInfo -----------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertRequestInfo {
    pub id: String,

    pub key_id: String,

    /// Required for signing keys, absent for authentication keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<ClientId>,

    pub subject_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_alt_name: Option<String>,

    pub usage: KeyUsage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_profile: Option<String>,
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(id: &str, saved: bool) -> CertificateInfo {
        CertificateInfo {
            id: id.to_string(),
            member_id: None,
            active: true,
            saved_to_configuration: saved,
            status: CertStatus::Registered,
            certificate_bytes: Bytes::from(id.as_bytes().to_vec()),
            ocsp_bytes: None,
            ocsp_verify_error: None,
        }
    }

    #[test]
    fn persisted_copy_drops_runtime_state() {
        let mut token = TokenInfo::new("0", TokenKind::Software);
        token.active = true;
        token.available = true;
        token.status = TokenStatus::Ok;
        token.device_info.insert("label".into(), "x".into());

        let mut key = KeyInfo::new("0", "aa");
        key.available = true;
        key.certs.push(cert("saved", true));
        key.certs.push(cert("transient", false));
        token.keys.push(key);

        let persisted = token.to_persisted();
        assert!(!persisted.active);
        assert!(!persisted.available);
        assert_eq!(persisted.status, TokenStatus::NotInitialized);
        assert!(persisted.device_info.is_empty());
        assert!(!persisted.keys[0].available);
        assert_eq!(persisted.keys[0].certs.len(), 1);
        assert_eq!(persisted.keys[0].certs[0].id, "saved");
    }

    #[test]
    fn certificates_match_their_hash_only() {
        let cert = cert("abc", true);
        let hash = cert.hash().unwrap();
        assert_eq!(hash.len(), 40);
        assert!(cert.has_hash(&hash));
        assert!(cert.has_hash(&hash.to_ascii_uppercase()));
        assert!(!cert.has_hash(""));
        assert!(!cert.has_hash("abc"));
    }

    #[test]
    fn bytes_are_base64_in_json() {
        let json = serde_json::to_string(&cert("abc", true)).unwrap();
        assert!(json.contains("\"certificate_bytes\":\"YWJj\""));
        let back: CertificateInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.certificate_bytes.as_ref(), b"abc");
    }
}
