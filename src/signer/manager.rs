//! The token manager.
//!
//! The [`TokenManager`] owns the registry, the PIN vault and one
//! [`TokenWorker`] per token. Requests name a token, key, certificate or
//! certificate request and are routed to the worker of the token that
//! holds it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use log::{debug, info, warn};
use secrecy::SecretString;

use crate::commons::api::{
    CertRequestFormat, CertRequestInfo, CertStatus, CertificateInfo,
    ClientId, KeyInfo, KeyUsage, TokenInfo,
};
use crate::commons::crypto::keys::public_key_algorithm;
use crate::commons::crypto::{KeyAlgorithm, SignAlgorithm, SignMechanism};
use crate::commons::error::Error;
use crate::commons::{SignerEmptyResult, SignerResult};
use crate::constants::SOFT_TOKEN_ID;
use crate::daemon::config::Config;

#[cfg(feature = "hsm")]
use crate::daemon::config::{Pkcs11ModuleConfig, SessionPoolConfig};

use super::certmanager::csr::{encode_request, CertRequestBuilder};
use super::certmanager::{
    CertManager, GlobalConf, OcspCache, OcspResponseCache, StaticGlobalConf,
};
use super::pins::PinVault;
use super::registry::TokenRegistry;
use super::softtoken::SoftwareBackend;
use super::worker::TokenWorker;


//------------ GeneratedCertRequest ------------------------------------------

/// A certification request ready to be handed to a CA.
#[derive(Clone, Debug)]
pub struct GeneratedCertRequest {
    /// The id of the request in the registry.
    pub id: String,

    /// The encoded request.
    pub request: Bytes,
}


//------------ TokenManager --------------------------------------------------

pub struct TokenManager {
    registry: Arc<TokenRegistry>,
    pins: Arc<PinVault>,
    certs: CertManager,

    /// The workers by token id.
    workers: RwLock<HashMap<String, Arc<TokenWorker>>>,

    #[cfg(feature = "hsm")]
    modules: Vec<Pkcs11ModuleConfig>,

    #[cfg(feature = "hsm")]
    session_pool: SessionPoolConfig,
}

/// # Set up
impl TokenManager {
    /// Creates the manager for a configuration.
    ///
    /// This opens the key configuration, the OCSP response cache and the
    /// software token. PKCS#11 modules are only scanned by
    /// [`Self::refresh`].
    pub fn build(config: &Config) -> SignerResult<Self> {
        let globalconf = Arc::new(StaticGlobalConf::from_config(config)?);
        let ocsp = Arc::new(OcspResponseCache::open(&config.ocsp_dir())?);
        Self::with_collaborators(config, globalconf, ocsp)
    }

    /// Creates the manager with the given global configuration and OCSP
    /// response cache.
    pub fn with_collaborators(
        config: &Config,
        globalconf: Arc<dyn GlobalConf>,
        ocsp: Arc<dyn OcspCache>,
    ) -> SignerResult<Self> {
        let registry = Arc::new(TokenRegistry::open(&config.data_dir)?);
        let pins = Arc::new(PinVault::new());
        let certs = CertManager::new(registry.clone(), globalconf, ocsp);

        let mut workers = HashMap::new();
        if config.software_token_enabled {
            let backend = SoftwareBackend::new(
                registry.clone(),
                pins.clone(),
                &config.data_dir,
                config.software_token_key_algorithm,
                config.enforce_token_pin_policy,
            )?;
            let worker = TokenWorker::new(Box::new(backend), registry.clone());
            worker.refresh();
            workers.insert(SOFT_TOKEN_ID.to_string(), Arc::new(worker));
        }
        else {
            info!("Software token disabled");
        }

        Ok(TokenManager {
            registry,
            pins,
            certs,
            workers: RwLock::new(workers),
            #[cfg(feature = "hsm")]
            modules: config.enabled_modules().cloned().collect(),
            #[cfg(feature = "hsm")]
            session_pool: config.session_pool.clone(),
        })
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    pub fn cert_manager(&self) -> &CertManager {
        &self.certs
    }

    /// Returns the worker of a token.
    pub fn worker(&self, token_id: &str) -> SignerResult<Arc<TokenWorker>> {
        self.workers.read()
            .unwrap_or_else(|err| err.into_inner())
            .get(token_id)
            .cloned()
            .ok_or_else(|| Error::TokenNotFound(token_id.to_string()))
    }

    /// Returns the worker of the token holding a key.
    pub fn worker_for_key(
        &self, key_id: &str
    ) -> SignerResult<Arc<TokenWorker>> {
        let (token, _) = self.registry.find_token_and_key(key_id)?;
        self.worker(&token.id)
    }

    fn workers(&self) -> Vec<Arc<TokenWorker>> {
        self.workers.read()
            .unwrap_or_else(|err| err.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

/// # Discovery
impl TokenManager {
    /// Scans the PKCS#11 modules and refreshes all tokens.
    ///
    /// Refreshing is best effort. Problems are logged but never stop the
    /// other tokens from being refreshed.
    pub fn refresh(&self) {
        #[cfg(feature = "hsm")]
        self.discover_modules();

        for worker in self.workers() {
            worker.refresh();
        }
    }

    /// Creates workers for new hardware tokens and retires the workers of
    /// tokens that disappeared.
    ///
    /// A token that is gone stays in the registry, unavailable and
    /// inactive, so that its keys and certificates are kept.
    #[cfg(feature = "hsm")]
    pub fn discover_modules(&self) {
        use std::collections::HashSet;

        use crate::commons::api::TokenKind;
        use super::hsm::{self, HardwareBackend};

        let mut present = HashSet::new();
        for module in &self.modules {
            let found = match hsm::discover(module) {
                Ok(found) => found,
                Err(err) => {
                    warn!("[{}] Cannot list tokens: {err}", module.uid);
                    continue
                }
            };
            for token in found {
                present.insert(token.info.id.clone());
                if self.worker(&token.info.id).is_ok() {
                    continue
                }
                let backend = match HardwareBackend::new(
                    &token,
                    module,
                    &self.session_pool,
                    self.registry.clone(),
                    self.pins.clone(),
                ) {
                    Ok(backend) => backend,
                    Err(err) => {
                        warn!(
                            "[{}] Cannot set up token '{}': {err}",
                            module.uid, token.info.id
                        );
                        continue
                    }
                };
                let worker = Arc::new(
                    TokenWorker::new(Box::new(backend), self.registry.clone())
                );
                worker.refresh();
                self.workers.write()
                    .unwrap_or_else(|err| err.into_inner())
                    .insert(token.info.id.clone(), worker);
            }
        }

        let gone: Vec<String> = self.registry.read(|tokens| {
            tokens.iter()
                .filter(|token| {
                    token.kind == TokenKind::Hardware
                        && (token.available || token.active)
                        && !present.contains(&token.id)
                })
                .map(|token| token.id.clone())
                .collect()
        });
        for token_id in gone {
            info!("[{token_id}] Token no longer present");
            self.pins.clear(&token_id);
            let res = self.registry.update_token(&token_id, |token| {
                token.available = false;
                token.active = false;
                for key in token.keys.iter_mut() {
                    key.available = false;
                }
                Ok(())
            });
            if let Err(err) = res {
                warn!("[{token_id}] Cannot mark token unavailable: {err}");
            }
        }
        self.workers.write()
            .unwrap_or_else(|err| err.into_inner())
            .retain(|token_id, _| {
                token_id == SOFT_TOKEN_ID || present.contains(token_id)
            });
    }
}

/// # Tokens
impl TokenManager {
    pub fn tokens(&self) -> Vec<TokenInfo> {
        self.registry.tokens()
    }

    pub fn token(&self, token_id: &str) -> SignerResult<TokenInfo> {
        self.registry.token(token_id)
    }

    /// Logs in to or out of a token.
    pub fn activate_token(
        &self,
        token_id: &str,
        activate: bool,
        pin: Option<&SecretString>,
    ) -> SignerEmptyResult {
        let worker = self.worker(token_id)?;
        if activate {
            let pin = pin.ok_or_else(|| {
                Error::PinIncorrect(token_id.to_string())
            })?;
            worker.activate(pin)
        }
        else {
            worker.deactivate()
        }
    }

    /// Sets the PIN of the uninitialized software token.
    pub fn init_software_token(&self, pin: &SecretString) -> SignerEmptyResult {
        self.worker(SOFT_TOKEN_ID)?.initialize(pin)
    }

    pub fn update_software_token_pin(
        &self,
        token_id: &str,
        old_pin: &SecretString,
        new_pin: &SecretString,
    ) -> SignerEmptyResult {
        self.worker(token_id)?.update_pin(old_pin, new_pin)
    }

    pub fn set_token_friendly_name(
        &self, token_id: &str, name: &str
    ) -> SignerEmptyResult {
        self.registry.set_token_friendly_name(token_id, name)
    }

    /// Returns the checksum of the key configuration.
    pub fn checksum(&self) -> String {
        self.registry.checksum()
    }
}

/// # Keys
impl TokenManager {
    pub fn key(&self, key_id: &str) -> SignerResult<KeyInfo> {
        self.registry.key(key_id)
    }

    pub fn generate_key(
        &self,
        token_id: &str,
        algorithm: Option<KeyAlgorithm>,
        label: &str,
    ) -> SignerResult<KeyInfo> {
        self.worker(token_id)?.generate_key(algorithm, label)
    }

    pub fn delete_key(
        &self, key_id: &str, from_device: bool
    ) -> SignerEmptyResult {
        self.worker_for_key(key_id)?.delete_key(key_id, from_device)
    }

    pub fn set_key_friendly_name(
        &self, key_id: &str, name: &str
    ) -> SignerEmptyResult {
        self.registry.set_key_friendly_name(key_id, name)
    }

    pub fn sign(
        &self, key_id: &str, algorithm: SignAlgorithm, digest: &[u8]
    ) -> SignerResult<Vec<u8>> {
        self.worker_for_key(key_id)?.sign(key_id, algorithm, digest)
    }

    pub fn sign_certificate(
        &self,
        key_id: &str,
        algorithm: SignAlgorithm,
        subject_name: &str,
        public_key: &[u8],
    ) -> SignerResult<Bytes> {
        self.worker_for_key(key_id)?.sign_certificate(
            key_id, algorithm, subject_name, public_key
        )
    }
}

/// # Certificates
impl TokenManager {
    pub fn cert_by_hash(&self, hash: &str) -> SignerResult<CertificateInfo> {
        self.registry.cert_by_hash(hash)
    }

    pub fn key_id_for_cert_hash(&self, hash: &str) -> SignerResult<String> {
        self.registry.key_id_for_cert_hash(hash)
    }

    pub fn member_certs(&self, member: &ClientId) -> Vec<CertificateInfo> {
        self.registry.member_certs(member)
    }

    pub fn import_cert(
        &self,
        cert_bytes: &[u8],
        member_id: Option<ClientId>,
        initial_status: CertStatus,
        activate: bool,
    ) -> SignerResult<String> {
        self.certs.import_cert(cert_bytes, member_id, initial_status, activate)
    }

    pub fn activate_cert(
        &self, cert_id: &str, active: bool
    ) -> SignerEmptyResult {
        self.certs.activate_cert(cert_id, active)
    }

    pub fn set_cert_status(
        &self, cert_id: &str, status: CertStatus
    ) -> SignerEmptyResult {
        self.registry.set_cert_status(cert_id, status)
    }

    /// Deletes a certificate through the worker of its token.
    pub fn delete_cert(&self, cert_id: &str) -> SignerEmptyResult {
        let key = self.registry.key_for_cert_id(cert_id)?;
        self.worker(&key.token_id)?.delete_cert(cert_id)
    }

    pub fn set_ocsp_responses(
        &self, cert_hashes: &[String], responses: &[Bytes]
    ) -> SignerEmptyResult {
        self.certs.set_ocsp_responses(cert_hashes, responses)
    }
}

/// # Certificate requests
impl TokenManager {
    /// Creates a certification request for a key and registers it.
    ///
    /// If the key already has a request for the same member and subject,
    /// that request is returned with a freshly signed encoding.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_cert_request(
        &self,
        key_id: &str,
        member_id: Option<ClientId>,
        usage: KeyUsage,
        subject_name: &str,
        subject_alt_name: Option<String>,
        format: CertRequestFormat,
        certificate_profile: Option<String>,
    ) -> SignerResult<GeneratedCertRequest> {
        let key = self.registry.key(key_id)?;
        if let Some(existing) = key.usage {
            if existing != usage {
                return Err(Error::wrong_usage(format!(
                    "Cannot request {usage} certificate for {existing} key \
                     '{key_id}'"
                )))
            }
        }
        if usage == KeyUsage::Signing && member_id.is_none() {
            return Err(Error::other(format!(
                "Signing certificate request for key '{key_id}' needs a \
                 member"
            )))
        }

        let request = self.build_request(
            &key, subject_name, subject_alt_name.as_deref(), usage, format
        )?;
        let id = self.registry.add_cert_request(
            key_id,
            member_id,
            subject_name,
            subject_alt_name,
            usage,
            certificate_profile,
        )?;
        Ok(GeneratedCertRequest { id, request })
    }

    /// Signs a registered certification request anew.
    pub fn regenerate_cert_request(
        &self, csr_id: &str, format: CertRequestFormat
    ) -> SignerResult<GeneratedCertRequest> {
        let (key, req) = self.registry.cert_request(csr_id)?;
        let CertRequestInfo {
            id, subject_name, subject_alt_name, usage, ..
        } = req;
        let request = self.build_request(
            &key, &subject_name, subject_alt_name.as_deref(), usage, format
        )?;
        debug!("Regenerated certificate request '{id}'");
        Ok(GeneratedCertRequest { id, request })
    }

    pub fn delete_cert_request(&self, csr_id: &str) -> SignerEmptyResult {
        self.registry.remove_cert_request(csr_id)
    }

    fn build_request(
        &self,
        key: &KeyInfo,
        subject_name: &str,
        subject_alt_name: Option<&str>,
        usage: KeyUsage,
        format: CertRequestFormat,
    ) -> SignerResult<Bytes> {
        let public_key = key.public_key.as_ref().ok_or_else(|| {
            Error::cannot_sign(&key.id, "public key unknown")
        })?;
        let algorithm = request_algorithm(key, public_key)?;
        let worker = self.worker(&key.token_id)?;
        let der = CertRequestBuilder::new(subject_name, usage, public_key)
            .subject_alt_name(subject_alt_name)
            .build(algorithm, |digest| {
                worker.sign(&key.id, algorithm, digest)
            })?;
        encode_request(&der, format)
    }
}

/// Returns the algorithm a key signs its certification requests with.
fn request_algorithm(
    key: &KeyInfo, public_key: &[u8]
) -> SignerResult<SignAlgorithm> {
    let key_algorithm = public_key_algorithm(public_key)?;
    let pss = key.sign_mechanism.as_deref()
        == Some(SignMechanism::RsaPkcsPss.name());
    if key_algorithm == KeyAlgorithm::Rsa && pss {
        Ok(SignAlgorithm::Sha256WithRsaMgf1)
    }
    else {
        Ok(SignAlgorithm::default_for(key_algorithm))
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use openssl::x509::X509Req;

    use super::*;
    use crate::commons::crypto::x509::cert_hash;
    use crate::commons::error::ErrorKind;
    use crate::commons::test::{ocsp_cache, pin, test_under_tmp, TestCa};

    fn manager(dir: &Path, ca: &TestCa) -> TokenManager {
        TokenManager::with_collaborators(
            &Config::test(dir), ca.global_conf(), ocsp_cache()
        ).unwrap()
    }

    /// Returns a manager with an initialized and active software token.
    fn active_manager(dir: &Path, ca: &TestCa) -> TokenManager {
        let manager = manager(dir, ca);
        manager.init_software_token(&pin("Secret-Pin-1")).unwrap();
        manager.activate_token(
            SOFT_TOKEN_ID, true, Some(&pin("Secret-Pin-1"))
        ).unwrap();
        manager
    }

    #[test]
    fn software_token_is_registered() {
        test_under_tmp(|dir| {
            let ca = TestCa::new("CN=Test CA");
            let manager = manager(&dir, &ca);
            let token = manager.token(SOFT_TOKEN_ID).unwrap();
            assert!(!token.active);
            assert!(manager.worker("missing").is_err());
        })
    }

    #[test]
    fn activation_needs_pin() {
        test_under_tmp(|dir| {
            let ca = TestCa::new("CN=Test CA");
            let manager = manager(&dir, &ca);
            manager.init_software_token(&pin("Secret-Pin-1")).unwrap();
            let err = manager.activate_token(
                SOFT_TOKEN_ID, true, None
            ).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PinIncorrect);

            manager.activate_token(
                SOFT_TOKEN_ID, true, Some(&pin("Secret-Pin-1"))
            ).unwrap();
            assert!(manager.token(SOFT_TOKEN_ID).unwrap().active);
            manager.activate_token(SOFT_TOKEN_ID, false, None).unwrap();
            assert!(!manager.token(SOFT_TOKEN_ID).unwrap().active);
        })
    }

    #[test]
    fn requested_certificate_attaches_to_its_key() {
        test_under_tmp(|dir| {
            let ca = TestCa::new("C=EE, O=Test, CN=Test CA");
            let manager = active_manager(&dir, &ca);
            let key = manager.generate_key(SOFT_TOKEN_ID, None, "").unwrap();
            let member = ClientId::from("EE/GOV/70000001");

            let csr = manager.generate_cert_request(
                &key.id,
                Some(member.clone()),
                KeyUsage::Signing,
                "CN=test",
                None,
                CertRequestFormat::Der,
                None,
            ).unwrap();
            let req = X509Req::from_der(&csr.request).unwrap();
            let public_key = req.public_key().unwrap();
            assert!(req.verify(&public_key).unwrap());

            let cert = ca.issue(
                &public_key, "CN=test", Some(KeyUsage::Signing)
            );
            let key_id = manager.import_cert(
                &cert, Some(member), CertStatus::Registered, false
            ).unwrap();
            assert_eq!(key_id, key.id);

            let key = manager.key(&key.id).unwrap();
            assert_eq!(key.usage, Some(KeyUsage::Signing));
            assert!(key.cert_requests.is_empty());
            assert_eq!(
                manager.key_id_for_cert_hash(&cert_hash(&cert).unwrap()).unwrap(),
                key.id
            );
        })
    }

    #[test]
    fn repeated_request_reuses_registration() {
        test_under_tmp(|dir| {
            let ca = TestCa::new("CN=Test CA");
            let manager = active_manager(&dir, &ca);
            let key = manager.generate_key(SOFT_TOKEN_ID, None, "").unwrap();

            let first = manager.generate_cert_request(
                &key.id, None, KeyUsage::Authentication, "CN=ss1",
                Some("ss1.example.com".into()), CertRequestFormat::Pem, None,
            ).unwrap();
            assert!(
                first.request.starts_with(b"-----BEGIN CERTIFICATE REQUEST")
            );
            let second = manager.generate_cert_request(
                &key.id, None, KeyUsage::Authentication, "cn=SS1",
                None, CertRequestFormat::Der, None,
            ).unwrap();
            assert_eq!(first.id, second.id);

            let again = manager.regenerate_cert_request(
                &first.id, CertRequestFormat::Der
            ).unwrap();
            let req = X509Req::from_der(&again.request).unwrap();
            let cn = req.subject_name()
                .entries_by_nid(openssl::nid::Nid::COMMONNAME)
                .next().unwrap()
                .data().as_utf8().unwrap().to_string();
            assert_eq!(cn, "ss1");

            let err = manager.generate_cert_request(
                &key.id, Some("EE/GOV/1".into()), KeyUsage::Signing,
                "CN=sign", None, CertRequestFormat::Der, None,
            ).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WrongCertUsage);

            manager.delete_cert_request(&first.id).unwrap();
            assert!(manager.key(&key.id).unwrap().cert_requests.is_empty());
        })
    }

    #[test]
    fn signing_request_needs_member() {
        test_under_tmp(|dir| {
            let ca = TestCa::new("CN=Test CA");
            let manager = active_manager(&dir, &ca);
            let key = manager.generate_key(SOFT_TOKEN_ID, None, "").unwrap();
            assert!(manager.generate_cert_request(
                &key.id, None, KeyUsage::Signing, "CN=test", None,
                CertRequestFormat::Der, None,
            ).is_err());
            assert!(manager.key(&key.id).unwrap().cert_requests.is_empty());
        })
    }

    #[test]
    fn certificates_are_deleted_through_their_token() {
        test_under_tmp(|dir| {
            let ca = TestCa::new("CN=Test CA");
            let manager = active_manager(&dir, &ca);
            let key = manager.generate_key(SOFT_TOKEN_ID, None, "").unwrap();
            let public_key = openssl::pkey::PKey::public_key_from_der(
                key.public_key.as_ref().unwrap()
            ).unwrap();
            let cert = ca.issue(
                &public_key, "CN=auth", Some(KeyUsage::Authentication)
            );
            manager.import_cert(
                &cert, None, CertStatus::Saved, false
            ).unwrap();

            let hash = cert_hash(&cert).unwrap();
            manager.set_cert_status(&hash, CertStatus::Registered).unwrap();
            assert_eq!(
                manager.cert_by_hash(&hash).unwrap().status,
                CertStatus::Registered
            );
            manager.delete_cert(&hash).unwrap();
            assert_eq!(
                manager.cert_by_hash(&hash).unwrap_err().kind(),
                ErrorKind::NotFound
            );
        })
    }

    #[test]
    fn keys_route_to_their_token() {
        test_under_tmp(|dir| {
            let ca = TestCa::new("CN=Test CA");
            let manager = active_manager(&dir, &ca);
            let key = manager.generate_key(
                SOFT_TOKEN_ID, Some(KeyAlgorithm::Ec), "ec"
            ).unwrap();
            let digest = vec![7u8; 32];
            let signature = manager.sign(
                &key.id, SignAlgorithm::Sha256WithEcdsa, &digest
            ).unwrap();
            assert!(!signature.is_empty());

            let checksum = manager.checksum();
            manager.delete_key(&key.id, true).unwrap();
            assert_ne!(manager.checksum(), checksum);
            assert_eq!(
                manager.sign(&key.id, SignAlgorithm::Sha256WithEcdsa, &digest)
                    .unwrap_err().kind(),
                ErrorKind::NotFound
            );
        })
    }
}
