//! Certificate import, activation and certification requests.

pub mod csr;
pub mod globalconf;
pub mod ocsp;

pub use self::globalconf::{GlobalConf, StaticGlobalConf};
pub use self::ocsp::{OcspCache, OcspResponseCache};

use std::sync::Arc;

use bytes::Bytes;
use log::{info, warn};
use openssl::x509::X509Ref;

use crate::commons::api::{CertStatus, CertificateInfo, ClientId};
use crate::commons::crypto::x509::{
    self, cert_der, cert_hash, cert_public_key_info, is_self_signed,
    parse_cert,
};
use crate::commons::error::Error;
use crate::commons::{SignerEmptyResult, SignerResult};

use super::registry::TokenRegistry;


//------------ CertManager ---------------------------------------------------

/// Imports and activates certificates for the keys in the registry.
#[derive(Clone, Debug)]
pub struct CertManager {
    registry: Arc<TokenRegistry>,
    globalconf: Arc<dyn GlobalConf>,
    ocsp: Arc<dyn OcspCache>,
}

impl CertManager {
    pub fn new(
        registry: Arc<TokenRegistry>,
        globalconf: Arc<dyn GlobalConf>,
        ocsp: Arc<dyn OcspCache>,
    ) -> Self {
        CertManager { registry, globalconf, ocsp }
    }

    /// Imports a certificate and returns the id of the key it belongs to.
    ///
    /// Certificates that cannot be parsed, belong to no known key or have
    /// the wrong usage are rejected. A certificate whose chain or OCSP
    /// status cannot be verified is still stored, but inactive and with
    /// the reason recorded.
    pub fn import_cert(
        &self,
        cert_bytes: &[u8],
        member_id: Option<ClientId>,
        initial_status: CertStatus,
        activate: bool,
    ) -> SignerResult<String> {
        let cert = parse_cert(cert_bytes)?;
        let der = cert_der(&cert)?;
        let hash = cert_hash(&der)?;
        let public_key = cert_public_key_info(&cert)?;

        let key = self.registry.key_for_certificate(&public_key, &hash)?;
        let usage = x509::cert_usage(&der)?;
        if let Some(existing) = key.usage {
            if existing != usage {
                return Err(Error::wrong_usage(format!(
                    "Cannot import {usage} certificate '{hash}' to \
                     {existing} key '{}'",
                    key.id
                )))
            }
        }
        if let Ok(existing) = self.registry.cert_by_hash(&hash) {
            if existing.saved_to_configuration {
                return Err(Error::CertificateAlreadyExists(hash))
            }
        }

        let (active, ocsp_verify_error) = match self.verify(&cert) {
            Ok(()) => (activate, None),
            Err(err) => {
                warn!(
                    "Importing certificate '{hash}' as inactive: {err}"
                );
                (false, Some(err.to_string()))
            }
        };

        let info = CertificateInfo {
            id: hash.clone(),
            member_id,
            active,
            saved_to_configuration: true,
            status: initial_status,
            certificate_bytes: der,
            ocsp_bytes: self.ocsp.get(&hash),
            ocsp_verify_error,
        };
        self.registry.import_cert(&key.id, info, usage, public_key)?;
        info!(
            "Imported {usage} certificate '{hash}' for key '{}'", key.id
        );
        Ok(key.id)
    }

    /// Activates or deactivates a certificate.
    ///
    /// Activation verifies the chain and current OCSP status of
    /// certificates that are not self-signed. If that fails, the
    /// certificate stays inactive and the reason is recorded.
    pub fn activate_cert(
        &self, cert_id: &str, active: bool
    ) -> SignerEmptyResult {
        if !active {
            info!("Deactivating certificate '{cert_id}'");
            return self.registry.set_cert_active(cert_id, false)
        }

        let info = self.registry.cert(cert_id)?;
        let cert = parse_cert(&info.certificate_bytes)?;
        let verified = self.verify(&cert);
        self.registry.update_cert(cert_id, |cert| {
            match verified.as_ref() {
                Ok(()) => {
                    cert.active = true;
                    cert.ocsp_verify_error = None;
                }
                Err(err) => {
                    cert.active = false;
                    cert.ocsp_verify_error = Some(err.to_string());
                }
            }
            Ok(())
        })?;
        verified?;
        info!("Activated certificate '{cert_id}'");
        Ok(())
    }

    /// Verifies the chain of a certificate and the OCSP responses for it.
    ///
    /// Self-signed certificates need no verification.
    pub fn verify(&self, cert: &X509Ref) -> SignerEmptyResult {
        if is_self_signed(cert) {
            return Ok(())
        }
        let chain = ocsp::verify_chain(self.globalconf.as_ref(), cert)?;
        ocsp::verify_chain_ocsp(
            self.globalconf.as_ref(), self.ocsp.as_ref(), &chain
        )
    }

    /// Stores OCSP responses for the certificates with the given hashes.
    pub fn set_ocsp_responses(
        &self, cert_hashes: &[String], responses: &[Bytes]
    ) -> SignerEmptyResult {
        if cert_hashes.len() != responses.len() {
            return Err(Error::other(format!(
                "Got {} OCSP responses for {} certificates",
                responses.len(), cert_hashes.len()
            )))
        }
        for (hash, response) in cert_hashes.iter().zip(responses) {
            self.ocsp.set(hash, response.clone())?;
        }
        self.registry.mutate(|tokens| {
            let certs = tokens.iter_mut()
                .flat_map(|token| token.keys.iter_mut())
                .flat_map(|key| key.certs.iter_mut());
            for cert in certs {
                let pos = cert_hashes.iter().position(|h| {
                    cert.has_hash(h)
                });
                if let Some(pos) = pos {
                    cert.ocsp_bytes = Some(responses[pos].clone());
                }
            }
            Ok(())
        })
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::api::{KeyInfo, KeyUsage, TokenInfo, TokenKind};
    use crate::commons::error::ErrorKind;
    use crate::commons::test::{
        ocsp_cache, rsa_key, test_under_tmp, TestCa,
    };
    use openssl::pkey::{PKey, Private};
    use std::path::Path;

    struct Fixture {
        ca: TestCa,
        registry: Arc<TokenRegistry>,
        manager: CertManager,
    }

    impl Fixture {
        fn new(dir: &Path) -> Self {
            let ca = TestCa::new("C=EE, O=Test, CN=Test CA");
            let registry = Arc::new(TokenRegistry::open(dir).unwrap());
            registry.add_token(
                TokenInfo::new("0", TokenKind::Software)
            ).unwrap();
            let manager = CertManager::new(
                registry.clone(), ca.global_conf(), ocsp_cache()
            );
            Fixture { ca, registry, manager }
        }

        /// Adds a key whose public key is known to the registry.
        fn add_key(&self, id: &str, key: &PKey<Private>) {
            let mut info = KeyInfo::new("0", id);
            info.public_key = Some(
                Bytes::from(key.public_key_to_der().unwrap())
            );
            self.registry.add_key(info).unwrap();
        }

        fn supply_ocsp(&self, cert: &[u8], response: Bytes) {
            self.manager.set_ocsp_responses(
                &[cert_hash(cert).unwrap()], &[response]
            ).unwrap();
        }
    }

    #[test]
    fn import_without_ocsp_stores_inactive() {
        test_under_tmp(|dir| {
            let fx = Fixture::new(&dir);
            let key = rsa_key();
            fx.add_key("k1", &key);
            let cert = fx.ca.issue(&key, "CN=member", Some(KeyUsage::Signing));

            let key_id = fx.manager.import_cert(
                &cert, Some("EE/GOV/1".into()), CertStatus::Registered, true
            ).unwrap();
            assert_eq!(key_id, "k1");

            let stored = fx.registry.cert_by_hash(&cert_hash(&cert).unwrap()).unwrap();
            assert!(!stored.active);
            assert!(stored.saved_to_configuration);
            assert!(stored.ocsp_verify_error.unwrap().contains("OCSP"));
            assert_eq!(
                fx.registry.key("k1").unwrap().usage, Some(KeyUsage::Signing)
            );
        })
    }

    #[test]
    fn import_with_fresh_ocsp_activates() {
        test_under_tmp(|dir| {
            let fx = Fixture::new(&dir);
            let key = rsa_key();
            fx.add_key("k1", &key);
            let cert = fx.ca.issue(&key, "CN=member", Some(KeyUsage::Signing));
            fx.supply_ocsp(&cert, fx.ca.ocsp_fresh(&cert));

            fx.manager.import_cert(
                &cert, None, CertStatus::Registered, true
            ).unwrap();
            let stored = fx.registry.cert_by_hash(&cert_hash(&cert).unwrap()).unwrap();
            assert!(stored.active);
            assert!(stored.ocsp_bytes.is_some());
            assert!(stored.ocsp_verify_error.is_none());
        })
    }

    #[test]
    fn activation_requires_current_ocsp() {
        test_under_tmp(|dir| {
            let fx = Fixture::new(&dir);
            let key = rsa_key();
            fx.add_key("k1", &key);
            let cert = fx.ca.issue(&key, "CN=member", Some(KeyUsage::Signing));
            let id = cert_hash(&cert).unwrap();
            fx.manager.import_cert(
                &cert, None, CertStatus::Registered, false
            ).unwrap();

            fx.supply_ocsp(&cert, fx.ca.ocsp_expired(&cert));
            let err = fx.manager.activate_cert(&id, true).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidCertificate);
            let stored = fx.registry.cert(&id).unwrap();
            assert!(!stored.active);
            assert!(stored.ocsp_verify_error.is_some());

            fx.supply_ocsp(&cert, fx.ca.ocsp_fresh(&cert));
            fx.manager.activate_cert(&id, true).unwrap();
            let stored = fx.registry.cert(&id).unwrap();
            assert!(stored.active);
            assert!(stored.ocsp_verify_error.is_none());

            fx.manager.activate_cert(&id, false).unwrap();
            assert!(!fx.registry.cert(&id).unwrap().active);
        })
    }

    #[test]
    fn self_signed_activates_unconditionally() {
        test_under_tmp(|dir| {
            let fx = Fixture::new(&dir);
            let own = TestCa::new("CN=self");
            fx.add_key("k1", &own.key);
            let cert = own.cert_der();

            fx.manager.import_cert(
                &cert, None, CertStatus::Saved, true
            ).unwrap();
            let stored = fx.registry.cert(&cert_hash(&cert).unwrap()).unwrap();
            assert!(stored.active);
            fx.manager.activate_cert(&stored.id, true).unwrap();
        })
    }

    #[test]
    fn replayed_import_is_rejected() {
        test_under_tmp(|dir| {
            let fx = Fixture::new(&dir);
            let key = rsa_key();
            fx.add_key("k1", &key);
            let cert = fx.ca.issue(&key, "CN=member", Some(KeyUsage::Signing));

            fx.manager.import_cert(
                &cert, None, CertStatus::Registered, false
            ).unwrap();
            let err = fx.manager.import_cert(
                &cert, None, CertStatus::Registered, false
            ).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CertificateAlreadyExists);
        })
    }

    #[test]
    fn import_replaces_device_copy() {
        test_under_tmp(|dir| {
            let fx = Fixture::new(&dir);
            let key = rsa_key();
            let cert = fx.ca.issue(&key, "CN=member", Some(KeyUsage::Signing));

            // The key was found on a device together with the certificate
            // before its public key was known.
            fx.registry.add_key(KeyInfo::new("0", "k1")).unwrap();
            fx.registry.add_cert("k1", CertificateInfo {
                id: "device".into(),
                member_id: None,
                active: false,
                saved_to_configuration: false,
                status: CertStatus::Saved,
                certificate_bytes: cert.clone(),
                ocsp_bytes: None,
                ocsp_verify_error: None,
            }).unwrap();

            let key_id = fx.manager.import_cert(
                &cert, None, CertStatus::Registered, false
            ).unwrap();
            assert_eq!(key_id, "k1");

            let stored = fx.registry.key("k1").unwrap();
            assert_eq!(stored.certs.len(), 1);
            assert!(stored.certs[0].saved_to_configuration);
            assert!(stored.public_key.is_some());
        })
    }

    #[test]
    fn usage_is_exclusive_per_key() {
        test_under_tmp(|dir| {
            let fx = Fixture::new(&dir);
            let key = rsa_key();
            fx.add_key("k1", &key);

            let both = fx.ca.issue_with_both_usages(&key);
            let err = fx.manager.import_cert(
                &both, None, CertStatus::Registered, false
            ).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WrongCertUsage);

            let none = fx.ca.issue(&key, "CN=none", None);
            let err = fx.manager.import_cert(
                &none, None, CertStatus::Registered, false
            ).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WrongCertUsage);

            let sign = fx.ca.issue(&key, "CN=sign", Some(KeyUsage::Signing));
            fx.manager.import_cert(
                &sign, None, CertStatus::Registered, false
            ).unwrap();
            let auth = fx.ca.issue(
                &key, "CN=auth", Some(KeyUsage::Authentication)
            );
            let err = fx.manager.import_cert(
                &auth, None, CertStatus::Registered, false
            ).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WrongCertUsage);

            let key = fx.registry.key("k1").unwrap();
            assert_eq!(key.certs.len(), 1);
            assert!(key.certs.iter().all(|cert| {
                x509::cert_usage(&cert.certificate_bytes).unwrap()
                    == KeyUsage::Signing
            }));
        })
    }

    #[test]
    fn rejects_garbage_and_unknown_keys() {
        test_under_tmp(|dir| {
            let fx = Fixture::new(&dir);
            let err = fx.manager.import_cert(
                b"garbage", None, CertStatus::Registered, false
            ).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidCertificate);

            let cert = fx.ca.issue(
                &rsa_key(), "CN=stranger", Some(KeyUsage::Signing)
            );
            let err = fx.manager.import_cert(
                &cert, None, CertStatus::Registered, false
            ).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
        })
    }
}
