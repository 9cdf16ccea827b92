//! Requests to the signer and their responses.
//!
//! Requests and responses are JSON. Binary values such as digests,
//! signatures and certificates are base64 encoded strings. A request is
//! an object whose `type` field names the operation:
//!
//! ```json
//! {"type": "sign", "key_id": "ab01", "algorithm": "SHA256withRSA",
//!  "digest": "..."}
//! ```
//!
//! The response is either `{"ok": ...}` with the result of the operation
//! or `{"error": {"kind": ..., "msg": ...}}`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::commons::api::{
    CertRequestFormat, CertStatus, CertificateInfo, ClientId, KeyInfo,
    KeyUsage, TokenInfo,
};
use crate::commons::crypto::{KeyAlgorithm, SignAlgorithm};
use crate::commons::error::{Error, ErrorResponse};
use crate::commons::util::ext_serde;
use crate::commons::SignerResult;

use super::manager::TokenManager;


//------------ Request -------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    //-----------------------------------------------------------------
    // Tokens
    //-----------------------------------------------------------------
    ListTokens,
    GetTokenInfo {
        token_id: String,
    },
    GetKeyConfChecksum,
    ActivateToken {
        token_id: String,
        activate: bool,
        #[serde(default)]
        pin: Option<SecretString>,
    },
    InitSoftwareToken {
        pin: SecretString,
    },
    UpdateSoftwareTokenPin {
        token_id: String,
        old_pin: SecretString,
        new_pin: SecretString,
    },
    SetTokenFriendlyName {
        token_id: String,
        friendly_name: String,
    },

    //-----------------------------------------------------------------
    // Keys
    //-----------------------------------------------------------------
    GetKeyInfo {
        key_id: String,
    },
    GenerateKey {
        token_id: String,
        #[serde(default)]
        algorithm: Option<KeyAlgorithm>,
        #[serde(default)]
        label: String,
    },
    DeleteKey {
        key_id: String,
        #[serde(default)]
        delete_from_device: bool,
    },
    SetKeyFriendlyName {
        key_id: String,
        friendly_name: String,
    },
    Sign {
        key_id: String,
        algorithm: SignAlgorithm,
        #[serde(deserialize_with = "ext_serde::de_bytes")]
        digest: Bytes,
    },
    SignCertificate {
        key_id: String,
        algorithm: SignAlgorithm,
        subject_name: String,
        #[serde(deserialize_with = "ext_serde::de_bytes")]
        public_key: Bytes,
    },

    //-----------------------------------------------------------------
    // Certificate requests
    //-----------------------------------------------------------------
    GenerateCertRequest {
        key_id: String,
        #[serde(default)]
        member_id: Option<ClientId>,
        usage: KeyUsage,
        subject_name: String,
        #[serde(default)]
        subject_alt_name: Option<String>,
        #[serde(default)]
        format: CertRequestFormat,
        #[serde(default)]
        certificate_profile: Option<String>,
    },
    RegenerateCertRequest {
        csr_id: String,
        #[serde(default)]
        format: CertRequestFormat,
    },
    DeleteCertRequest {
        csr_id: String,
    },

    //-----------------------------------------------------------------
    // Certificates
    //-----------------------------------------------------------------
    ImportCert {
        #[serde(deserialize_with = "ext_serde::de_bytes")]
        certificate: Bytes,
        #[serde(default)]
        member_id: Option<ClientId>,
        initial_status: CertStatus,
        #[serde(default)]
        activate: bool,
    },
    ActivateCert {
        cert_id: String,
        active: bool,
    },
    SetCertStatus {
        cert_id: String,
        status: CertStatus,
    },
    DeleteCert {
        cert_id: String,
    },
    GetCertificateInfoForHash {
        hash: String,
    },
    GetKeyIdForCertHash {
        hash: String,
    },
    GetMemberCerts {
        member_id: ClientId,
    },
    SetOcspResponses {
        cert_hashes: Vec<String>,
        #[serde(deserialize_with = "ext_serde::de_bytes_vec")]
        responses: Vec<Bytes>,
    },
}

impl Request {
    /// Returns whether the request only reads state.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Request::ListTokens
                | Request::GetTokenInfo { .. }
                | Request::GetKeyConfChecksum
                | Request::GetKeyInfo { .. }
                | Request::GetCertificateInfoForHash { .. }
                | Request::GetKeyIdForCertHash { .. }
                | Request::GetMemberCerts { .. }
        )
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Request::ListTokens => f.write_str("list tokens"),
            Request::GetTokenInfo { token_id } => {
                write!(f, "get token '{token_id}'")
            }
            Request::GetKeyConfChecksum => f.write_str("get checksum"),
            Request::ActivateToken { token_id, activate, .. } => {
                if *activate {
                    write!(f, "activate token '{token_id}'")
                }
                else {
                    write!(f, "deactivate token '{token_id}'")
                }
            }
            Request::InitSoftwareToken { .. } => {
                f.write_str("initialize software token")
            }
            Request::UpdateSoftwareTokenPin { token_id, .. } => {
                write!(f, "update PIN of token '{token_id}'")
            }
            Request::SetTokenFriendlyName { token_id, .. } => {
                write!(f, "rename token '{token_id}'")
            }
            Request::GetKeyInfo { key_id } => write!(f, "get key '{key_id}'"),
            Request::GenerateKey { token_id, .. } => {
                write!(f, "generate key on token '{token_id}'")
            }
            Request::DeleteKey { key_id, .. } => {
                write!(f, "delete key '{key_id}'")
            }
            Request::SetKeyFriendlyName { key_id, .. } => {
                write!(f, "rename key '{key_id}'")
            }
            Request::Sign { key_id, algorithm, .. } => {
                write!(f, "sign with key '{key_id}' using {algorithm}")
            }
            Request::SignCertificate { key_id, .. } => {
                write!(f, "sign certificate with key '{key_id}'")
            }
            Request::GenerateCertRequest { key_id, .. } => {
                write!(f, "generate certificate request for key '{key_id}'")
            }
            Request::RegenerateCertRequest { csr_id, .. } => {
                write!(f, "regenerate certificate request '{csr_id}'")
            }
            Request::DeleteCertRequest { csr_id } => {
                write!(f, "delete certificate request '{csr_id}'")
            }
            Request::ImportCert { .. } => f.write_str("import certificate"),
            Request::ActivateCert { cert_id, active } => {
                if *active {
                    write!(f, "activate certificate '{cert_id}'")
                }
                else {
                    write!(f, "deactivate certificate '{cert_id}'")
                }
            }
            Request::SetCertStatus { cert_id, status } => {
                write!(f, "set status of certificate '{cert_id}' to {status}")
            }
            Request::DeleteCert { cert_id } => {
                write!(f, "delete certificate '{cert_id}'")
            }
            Request::GetCertificateInfoForHash { hash } => {
                write!(f, "get certificate '{hash}'")
            }
            Request::GetKeyIdForCertHash { hash } => {
                write!(f, "get key for certificate '{hash}'")
            }
            Request::GetMemberCerts { member_id } => {
                write!(f, "get certificates of member '{member_id}'")
            }
            Request::SetOcspResponses { cert_hashes, .. } => {
                write!(f, "set {} OCSP responses", cert_hashes.len())
            }
        }
    }
}


//------------ Response ------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(Payload),
    Error(ErrorResponse),
}

impl Response {
    /// Returns the payload of a successful response.
    pub fn ok(self) -> Option<Payload> {
        match self {
            Response::Ok(payload) => Some(payload),
            Response::Error(_) => None,
        }
    }
}

impl From<SignerResult<Payload>> for Response {
    fn from(res: SignerResult<Payload>) -> Self {
        match res {
            Ok(payload) => Response::Ok(payload),
            Err(err) => Response::Error(err.to_error_response()),
        }
    }
}


//------------ Payload -------------------------------------------------------

/// The result of a successful request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Empty,
    Tokens(Vec<TokenInfo>),
    Token(TokenInfo),
    Key(KeyInfo),
    KeyId(String),
    Checksum(String),
    Cert(CertificateInfo),
    Certs(Vec<CertificateInfo>),

    #[serde(
        serialize_with = "ext_serde::ser_bytes",
        deserialize_with = "ext_serde::de_bytes"
    )]
    Signature(Bytes),

    /// A new certificate followed by its issuer.
    #[serde(
        serialize_with = "ext_serde::ser_bytes",
        deserialize_with = "ext_serde::de_bytes"
    )]
    CertChain(Bytes),

    CertRequest {
        id: String,
        #[serde(
            serialize_with = "ext_serde::ser_bytes",
            deserialize_with = "ext_serde::de_bytes"
        )]
        request: Bytes,
    },
}


//------------ SignerService -------------------------------------------------

/// Processes requests against a token manager.
#[derive(Clone)]
pub struct SignerService {
    manager: Arc<TokenManager>,
}

impl SignerService {
    pub fn new(manager: Arc<TokenManager>) -> Self {
        SignerService { manager }
    }

    pub fn manager(&self) -> &TokenManager {
        &self.manager
    }

    /// Processes a request encoded as JSON.
    pub fn handle_json(&self, json: &str) -> Response {
        match serde_json::from_str::<Request>(json) {
            Ok(req) => self.handle(req),
            Err(err) => {
                warn!("Rejecting malformed request: {err}");
                Response::Error(Error::Json(err).to_error_response())
            }
        }
    }

    /// Processes a request.
    ///
    /// Failed requests are logged. Queries only log at debug level.
    pub fn handle(&self, req: Request) -> Response {
        let desc = req.to_string();
        let query = req.is_query();
        debug!("Processing request: {desc}");
        let res = self.process(req);
        if let Err(err) = &res {
            if query {
                debug!("Request '{desc}' failed: {err}");
            }
            else {
                warn!("Request '{desc}' failed: {err}");
            }
        }
        res.into()
    }

    fn process(&self, req: Request) -> SignerResult<Payload> {
        let manager = &self.manager;
        match req {
            Request::ListTokens => Ok(Payload::Tokens(manager.tokens())),
            Request::GetTokenInfo { token_id } => {
                manager.token(&token_id).map(Payload::Token)
            }
            Request::GetKeyConfChecksum => {
                Ok(Payload::Checksum(manager.checksum()))
            }
            Request::ActivateToken { token_id, activate, pin } => {
                manager.activate_token(&token_id, activate, pin.as_ref())
                    .map(|_| Payload::Empty)
            }
            Request::InitSoftwareToken { pin } => {
                manager.init_software_token(&pin).map(|_| Payload::Empty)
            }
            Request::UpdateSoftwareTokenPin { token_id, old_pin, new_pin } => {
                manager.update_software_token_pin(
                    &token_id, &old_pin, &new_pin
                ).map(|_| Payload::Empty)
            }
            Request::SetTokenFriendlyName { token_id, friendly_name } => {
                manager.set_token_friendly_name(&token_id, &friendly_name)
                    .map(|_| Payload::Empty)
            }
            Request::GetKeyInfo { key_id } => {
                manager.key(&key_id).map(Payload::Key)
            }
            Request::GenerateKey { token_id, algorithm, label } => {
                manager.generate_key(&token_id, algorithm, &label)
                    .map(Payload::Key)
            }
            Request::DeleteKey { key_id, delete_from_device } => {
                manager.delete_key(&key_id, delete_from_device)
                    .map(|_| Payload::Empty)
            }
            Request::SetKeyFriendlyName { key_id, friendly_name } => {
                manager.set_key_friendly_name(&key_id, &friendly_name)
                    .map(|_| Payload::Empty)
            }
            Request::Sign { key_id, algorithm, digest } => {
                manager.sign(&key_id, algorithm, &digest)
                    .map(|sig| Payload::Signature(Bytes::from(sig)))
            }
            Request::SignCertificate {
                key_id, algorithm, subject_name, public_key
            } => {
                manager.sign_certificate(
                    &key_id, algorithm, &subject_name, &public_key
                ).map(Payload::CertChain)
            }
            Request::GenerateCertRequest {
                key_id,
                member_id,
                usage,
                subject_name,
                subject_alt_name,
                format,
                certificate_profile,
            } => {
                manager.generate_cert_request(
                    &key_id,
                    member_id,
                    usage,
                    &subject_name,
                    subject_alt_name,
                    format,
                    certificate_profile,
                ).map(|csr| Payload::CertRequest {
                    id: csr.id, request: csr.request
                })
            }
            Request::RegenerateCertRequest { csr_id, format } => {
                manager.regenerate_cert_request(&csr_id, format).map(|csr| {
                    Payload::CertRequest { id: csr.id, request: csr.request }
                })
            }
            Request::DeleteCertRequest { csr_id } => {
                manager.delete_cert_request(&csr_id).map(|_| Payload::Empty)
            }
            Request::ImportCert {
                certificate, member_id, initial_status, activate
            } => {
                manager.import_cert(
                    &certificate, member_id, initial_status, activate
                ).map(Payload::KeyId)
            }
            Request::ActivateCert { cert_id, active } => {
                manager.activate_cert(&cert_id, active).map(|_| Payload::Empty)
            }
            Request::SetCertStatus { cert_id, status } => {
                manager.set_cert_status(&cert_id, status)
                    .map(|_| Payload::Empty)
            }
            Request::DeleteCert { cert_id } => {
                manager.delete_cert(&cert_id).map(|_| Payload::Empty)
            }
            Request::GetCertificateInfoForHash { hash } => {
                manager.cert_by_hash(&hash).map(Payload::Cert)
            }
            Request::GetKeyIdForCertHash { hash } => {
                manager.key_id_for_cert_hash(&hash).map(Payload::KeyId)
            }
            Request::GetMemberCerts { member_id } => {
                Ok(Payload::Certs(manager.member_certs(&member_id)))
            }
            Request::SetOcspResponses { cert_hashes, responses } => {
                manager.set_ocsp_responses(&cert_hashes, &responses)
                    .map(|_| Payload::Empty)
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;

    use super::*;
    use crate::commons::crypto::x509::cert_hash;
    use crate::commons::error::ErrorKind;
    use crate::commons::test::{ocsp_cache, test_under_tmp, TestCa};
    use crate::commons::util::ext_serde::to_base64;
    use crate::constants::SOFT_TOKEN_ID;
    use crate::daemon::config::Config;

    fn service(dir: &Path, ca: &TestCa) -> SignerService {
        let manager = TokenManager::with_collaborators(
            &Config::test(dir), ca.global_conf(), ocsp_cache()
        ).unwrap();
        SignerService::new(Arc::new(manager))
    }

    fn call(service: &SignerService, req: serde_json::Value) -> Response {
        service.handle_json(&req.to_string())
    }

    fn ok(service: &SignerService, req: serde_json::Value) -> Payload {
        match call(service, req.clone()) {
            Response::Ok(payload) => payload,
            Response::Error(err) => panic!("{req} failed: {}", err.msg),
        }
    }

    fn error_kind(service: &SignerService, req: serde_json::Value) -> ErrorKind {
        match call(service, req.clone()) {
            Response::Ok(payload) => panic!("{req} succeeded: {payload:?}"),
            Response::Error(err) => err.kind,
        }
    }

    /// Initializes and activates the software token, returns a new key.
    fn ready_key(service: &SignerService) -> KeyInfo {
        ok(service, json!({
            "type": "init_software_token", "pin": "Secret-Pin-1"
        }));
        ok(service, json!({
            "type": "activate_token", "token_id": SOFT_TOKEN_ID,
            "activate": true, "pin": "Secret-Pin-1"
        }));
        match ok(service, json!({
            "type": "generate_key", "token_id": SOFT_TOKEN_ID,
            "label": "test"
        })) {
            Payload::Key(key) => key,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn malformed_requests_are_rejected() {
        test_under_tmp(|dir| {
            let ca = TestCa::new("CN=Test CA");
            let service = service(&dir, &ca);
            match service.handle_json("{\"type\": \"explode\"}") {
                Response::Error(err) => {
                    assert_eq!(err.kind, ErrorKind::Internal)
                }
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(
                error_kind(&service, json!({
                    "type": "sign", "key_id": "ab",
                    "algorithm": "SHA256withRSA", "digest": "%%%"
                })),
                ErrorKind::Internal
            );
        })
    }

    #[test]
    fn pins_stay_out_of_request_output() {
        let req: Request = serde_json::from_value(json!({
            "type": "update_software_token_pin", "token_id": "0",
            "old_pin": "Old-Secret-1", "new_pin": "New-Secret-2"
        })).unwrap();
        let debug = format!("{req:?} {req}");
        assert!(!debug.contains("Old-Secret-1"));
        assert!(!debug.contains("New-Secret-2"));
    }

    #[test]
    fn list_and_checksum() {
        test_under_tmp(|dir| {
            let ca = TestCa::new("CN=Test CA");
            let service = service(&dir, &ca);
            match ok(&service, json!({"type": "list_tokens"})) {
                Payload::Tokens(tokens) => {
                    assert!(tokens.iter().any(|t| t.id == SOFT_TOKEN_ID))
                }
                other => panic!("unexpected payload {other:?}"),
            }
            let before = ok(&service, json!({"type": "get_key_conf_checksum"}));
            ok(&service, json!({
                "type": "set_token_friendly_name", "token_id": SOFT_TOKEN_ID,
                "friendly_name": "softToken-0"
            }));
            let after = ok(&service, json!({"type": "get_key_conf_checksum"}));
            assert_ne!(before, after);
        })
    }

    #[test]
    fn sign_checks_digest_length() {
        test_under_tmp(|dir| {
            let ca = TestCa::new("CN=Test CA");
            let service = service(&dir, &ca);
            let key = ready_key(&service);

            let digest = to_base64(&[1u8; 32]);
            match ok(&service, json!({
                "type": "sign", "key_id": key.id,
                "algorithm": "SHA256withRSA", "digest": digest
            })) {
                Payload::Signature(sig) => assert_eq!(sig.len(), 256),
                other => panic!("unexpected payload {other:?}"),
            }
            assert_eq!(
                error_kind(&service, json!({
                    "type": "sign", "key_id": key.id,
                    "algorithm": "SHA512withRSA", "digest": digest
                })),
                ErrorKind::CannotSign
            );
            assert_eq!(
                error_kind(&service, json!({
                    "type": "sign", "key_id": key.id,
                    "algorithm": "SHA256withECDSA", "digest": digest
                })),
                ErrorKind::UnsupportedSignAlgorithm
            );
            assert_eq!(
                error_kind(&service, json!({
                    "type": "sign", "key_id": "unknown",
                    "algorithm": "SHA256withRSA", "digest": digest
                })),
                ErrorKind::NotFound
            );
        })
    }

    #[test]
    fn import_twice_reports_existing_certificate() {
        test_under_tmp(|dir| {
            let ca = TestCa::new("C=EE, O=Test, CN=Test CA");
            let service = service(&dir, &ca);
            let key = ready_key(&service);
            let public_key = openssl::pkey::PKey::public_key_from_der(
                key.public_key.as_ref().unwrap()
            ).unwrap();
            let cert = ca.issue(
                &public_key, "CN=member", Some(KeyUsage::Signing)
            );
            let import = json!({
                "type": "import_cert",
                "certificate": to_base64(&cert),
                "member_id": "EE/GOV/70000001",
                "initial_status": "registered",
            });

            assert_eq!(
                ok(&service, import.clone()), Payload::KeyId(key.id.clone())
            );
            assert_eq!(
                error_kind(&service, import),
                ErrorKind::CertificateAlreadyExists
            );

            match ok(&service, json!({
                "type": "get_member_certs", "member_id": "EE/GOV/70000001"
            })) {
                Payload::Certs(certs) => {
                    assert_eq!(certs.len(), 1);
                    assert_eq!(certs[0].id, cert_hash(&cert).unwrap());
                }
                other => panic!("unexpected payload {other:?}"),
            }
        })
    }

    #[test]
    fn responses_serialize_as_tagged_json() {
        let res = Response::Ok(Payload::Signature(Bytes::from_static(b"ab")));
        assert_eq!(
            serde_json::to_value(&res).unwrap(),
            json!({"ok": {"signature": "YWI="}})
        );
        let res = Response::Ok(Payload::Empty);
        assert_eq!(serde_json::to_value(&res).unwrap(), json!({"ok": "empty"}));

        let err = Error::TokenNotActive("0".into());
        let res = Response::from(Err(err));
        assert_eq!(
            serde_json::to_value(&res).unwrap(),
            json!({"error": {
                "kind": "token_not_active", "msg": "Token '0' not active"
            }})
        );
    }
}
