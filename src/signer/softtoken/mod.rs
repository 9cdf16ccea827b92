//! The software token.
//!
//! There is exactly one software token with id `0`. Its keys are kept in
//! a [`KeyStore`] encrypted with the token PIN. Once the token is
//! activated, the PIN is kept in the [`PinVault`] and decrypted keys are
//! cached in memory until the token is deactivated again.

mod keystore;
pub use self::keystore::KeyStore;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use log::{debug, info, warn};
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use secrecy::SecretString;

use crate::commons::api::{KeyInfo, TokenInfo, TokenKind, TokenStatus};
use crate::commons::crypto::keys::{random_key_id, sign_digest};
use crate::commons::crypto::{KeyAlgorithm, SignAlgorithm};
use crate::commons::error::{Error, ErrorKind};
use crate::commons::{SignerEmptyResult, SignerResult};
use crate::constants::{SOFT_TOKEN_DIR, SOFT_TOKEN_ID, SOFT_TOKEN_RSA_BITS};

use super::pins::{PinVault, TokenPinPolicy};
use super::registry::TokenRegistry;
use super::worker::{available_key, clear_key_conf, TokenBackend};


//------------ SoftwareBackend -----------------------------------------------

#[derive(Debug)]
pub struct SoftwareBackend {
    registry: Arc<TokenRegistry>,
    pins: Arc<PinVault>,
    store: KeyStore,

    /// Decrypted keys by key id.
    keys: RwLock<HashMap<String, PKey<Private>>>,

    /// The algorithm for new keys if none is requested.
    key_algorithm: KeyAlgorithm,

    enforce_pin_policy: bool,
}

impl SoftwareBackend {
    pub fn new(
        registry: Arc<TokenRegistry>,
        pins: Arc<PinVault>,
        data_dir: &Path,
        key_algorithm: KeyAlgorithm,
        enforce_pin_policy: bool,
    ) -> SignerResult<Self> {
        let store = KeyStore::open(data_dir.join(SOFT_TOKEN_DIR))?;
        registry.add_token(TokenInfo::new(SOFT_TOKEN_ID, TokenKind::Software))?;
        Ok(SoftwareBackend {
            registry,
            pins,
            store,
            keys: RwLock::new(HashMap::new()),
            key_algorithm,
            enforce_pin_policy,
        })
    }

    fn pin(&self) -> SignerResult<SecretString> {
        self.pins.get(SOFT_TOKEN_ID).ok_or_else(|| {
            Error::TokenNotActive(SOFT_TOKEN_ID.into())
        })
    }

    fn check_policy(&self, pin: &SecretString) -> SignerEmptyResult {
        if self.enforce_pin_policy {
            TokenPinPolicy::check(pin)
        }
        else {
            Ok(())
        }
    }

    fn cached_key(&self, key_id: &str) -> Option<PKey<Private>> {
        self.keys.read()
            .unwrap_or_else(|err| err.into_inner())
            .get(key_id)
            .cloned()
    }

    fn cache_key(&self, key_id: &str, key: PKey<Private>) {
        self.keys.write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(key_id.to_string(), key);
    }

    fn clear_cache(&self) {
        self.keys.write().unwrap_or_else(|err| err.into_inner()).clear();
    }

    /// Returns the decrypted key, loading it from the store if needed.
    fn load_key(
        &self, key_id: &str, pin: &SecretString
    ) -> SignerResult<PKey<Private>> {
        if let Some(key) = self.cached_key(key_id) {
            return Ok(key)
        }
        let key = self.store.read_key(key_id, pin)?;
        self.cache_key(key_id, key.clone());
        Ok(key)
    }

    /// Marks all keys of the token available or not.
    fn set_keys_available(&self, available: bool) -> SignerEmptyResult {
        self.registry.update_token(SOFT_TOKEN_ID, |token| {
            for key in token.keys.iter_mut() {
                key.available = available && self.store.has_key(&key.id);
            }
            Ok(())
        })
    }

    /// Registers key files found in the store but not in the registry.
    fn discover_keys(&self, pin: Option<&SecretString>) -> SignerEmptyResult {
        for key_id in self.store.list_key_ids()? {
            if self.registry.key(&key_id).is_ok() {
                continue
            }
            info!("[{SOFT_TOKEN_ID}] Found unregistered key '{key_id}'");
            let mut info = KeyInfo::new(SOFT_TOKEN_ID, key_id.as_str());
            if let Some(pin) = pin {
                match self.load_key(&key_id, pin) {
                    Ok(key) => {
                        info.public_key = Some(
                            Bytes::from(key.public_key_to_der()?)
                        );
                        info.available = true;
                    }
                    Err(err) => {
                        warn!(
                            "[{SOFT_TOKEN_ID}] Cannot load key '{key_id}': \
                             {err}"
                        );
                    }
                }
            }
            self.registry.add_key(info)?;
        }
        Ok(())
    }

    /// Checks each registered key for whether it can be loaded.
    fn check_keys(&self, pin: &SecretString) -> SignerEmptyResult {
        let token = self.registry.token(SOFT_TOKEN_ID)?;
        for key in &token.keys {
            let available = match self.load_key(&key.id, pin) {
                Ok(loaded) => {
                    if key.public_key.is_none() {
                        self.registry.set_public_key(
                            &key.id, Bytes::from(loaded.public_key_to_der()?)
                        )?;
                    }
                    true
                }
                Err(err) => {
                    debug!(
                        "[{SOFT_TOKEN_ID}] Key '{}' not loadable: {err}",
                        key.id
                    );
                    false
                }
            };
            if available != key.available {
                self.registry.set_key_available(&key.id, available)?;
            }
        }
        Ok(())
    }
}

impl TokenBackend for SoftwareBackend {
    fn token_id(&self) -> &str {
        SOFT_TOKEN_ID
    }

    fn activate(&mut self, pin: &SecretString) -> SignerEmptyResult {
        if !self.store.is_initialized() {
            return Err(Error::TokenNotInitialized(SOFT_TOKEN_ID.into()))
        }
        if let Err(err) = self.store.verify_pin(pin) {
            if err.kind() == ErrorKind::PinIncorrect {
                self.registry.set_token_status(
                    SOFT_TOKEN_ID, TokenStatus::UserPinIncorrect
                )?;
            }
            return Err(err)
        }
        self.pins.set(SOFT_TOKEN_ID, pin.clone());
        self.registry.update_token(SOFT_TOKEN_ID, |token| {
            token.active = true;
            token.available = true;
            token.status = TokenStatus::Ok;
            Ok(())
        })?;
        self.discover_keys(Some(pin))?;
        self.check_keys(pin)
    }

    fn deactivate(&mut self) -> SignerEmptyResult {
        self.pins.clear(SOFT_TOKEN_ID);
        self.clear_cache();
        self.registry.set_token_active(SOFT_TOKEN_ID, false)?;
        self.set_keys_available(false)
    }

    fn initialize(&mut self, pin: &SecretString) -> SignerEmptyResult {
        self.check_policy(pin)?;
        self.store.init_pin(pin)?;
        self.registry.update_token(SOFT_TOKEN_ID, |token| {
            token.available = true;
            token.status = TokenStatus::Ok;
            Ok(())
        })
    }

    fn generate_key(
        &mut self, algorithm: Option<KeyAlgorithm>, label: &str
    ) -> SignerResult<KeyInfo> {
        let pin = self.pin()?;
        let key = match algorithm.unwrap_or(self.key_algorithm) {
            KeyAlgorithm::Rsa => {
                PKey::from_rsa(Rsa::generate(SOFT_TOKEN_RSA_BITS)?)?
            }
            KeyAlgorithm::Ec => {
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
        };
        let key_id = random_key_id()?;
        self.store.write_key(&key_id, &key, &pin)?;

        let mut info = KeyInfo::new(SOFT_TOKEN_ID, key_id.as_str());
        info.available = true;
        info.public_key = Some(Bytes::from(key.public_key_to_der()?));
        if !label.is_empty() {
            info.label = Some(label.to_string());
        }
        self.cache_key(&key_id, key);
        self.registry.add_key(info)
    }

    fn delete_key(
        &mut self, key_id: &str, from_device: bool
    ) -> SignerEmptyResult {
        let (token, _) = self.registry.find_token_and_key(key_id)?;
        if token.id != SOFT_TOKEN_ID {
            return Err(Error::KeyNotFound(key_id.to_string()))
        }
        if !from_device {
            // The key file stays in the store, and so does its record.
            return clear_key_conf(&self.registry, key_id).map(|_| ())
        }
        self.store.delete_key(key_id)?;
        self.keys.write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(key_id);
        self.registry.remove_key(key_id)
    }

    fn delete_cert(&mut self, cert_id: &str) -> SignerEmptyResult {
        self.registry.remove_cert(cert_id).map(|_| ())
    }

    fn update_pin(
        &mut self, old_pin: &SecretString, new_pin: &SecretString
    ) -> SignerEmptyResult {
        self.check_policy(new_pin)?;
        if !self.store.is_initialized() {
            return Err(Error::TokenNotInitialized(SOFT_TOKEN_ID.into()))
        }
        self.store.rotate_pin(old_pin, new_pin)?;
        if self.pins.contains(SOFT_TOKEN_ID) {
            self.pins.set(SOFT_TOKEN_ID, new_pin.clone());
        }
        Ok(())
    }

    fn refresh(&mut self) -> SignerEmptyResult {
        if !self.store.is_initialized() {
            return self.registry.update_token(SOFT_TOKEN_ID, |token| {
                token.available = false;
                token.active = false;
                token.status = TokenStatus::NotInitialized;
                Ok(())
            })
        }
        let pin = self.pins.get(SOFT_TOKEN_ID);
        self.registry.update_token(SOFT_TOKEN_ID, |token| {
            token.available = true;
            token.active = pin.is_some();
            if token.status == TokenStatus::NotInitialized {
                token.status = TokenStatus::Ok;
            }
            Ok(())
        })?;
        self.discover_keys(pin.as_ref())?;
        match pin {
            Some(pin) => self.check_keys(&pin),
            None => self.set_keys_available(false),
        }
    }

    fn sign(
        &self, key_id: &str, algorithm: SignAlgorithm, digest: &[u8]
    ) -> SignerResult<Vec<u8>> {
        available_key(&self.registry, SOFT_TOKEN_ID, key_id)?;
        let pin = self.pin()?;
        let key = self.load_key(key_id, &pin)?;

        if KeyAlgorithm::of_key(&key)? != algorithm.key_algorithm() {
            return Err(Error::unsupported_algorithm(key_id, algorithm))
        }
        if digest.len() != algorithm.digest().digest_len() {
            return Err(Error::cannot_sign(
                key_id,
                format!(
                    "digest length {} does not match {algorithm}",
                    digest.len()
                )
            ))
        }
        sign_digest(&key, algorithm, digest)
    }

    fn after_action(&self) {
        let initialized = self.store.is_initialized();
        let available = self.registry.read(|tokens| {
            tokens.iter()
                .find(|token| token.id == SOFT_TOKEN_ID)
                .map(|token| token.available)
        });
        if available.is_some_and(|available| available != initialized) {
            if let Err(err) = self.registry.set_token_available(
                SOFT_TOKEN_ID, initialized
            ) {
                warn!("[{SOFT_TOKEN_ID}] Cannot update token: {err}");
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::api::{CertStatus, CertificateInfo, KeyUsage};
    use crate::commons::test::{pin, test_under_tmp};
    use openssl::sign::Verifier;

    const PIN: &str = "Secret-Pin-123";

    fn backend(dir: &Path) -> (SoftwareBackend, Arc<TokenRegistry>) {
        let registry = Arc::new(TokenRegistry::open(dir).unwrap());
        let backend = SoftwareBackend::new(
            registry.clone(), Arc::new(PinVault::new()), dir,
            KeyAlgorithm::Rsa, true,
        ).unwrap();
        (backend, registry)
    }

    fn active_backend(dir: &Path) -> (SoftwareBackend, Arc<TokenRegistry>) {
        let (mut backend, registry) = backend(dir);
        backend.initialize(&pin(PIN)).unwrap();
        backend.activate(&pin(PIN)).unwrap();
        (backend, registry)
    }

    #[test]
    fn initialize_and_activate() {
        test_under_tmp(|dir| {
            let (mut backend, registry) = backend(&dir);
            backend.refresh().unwrap();
            let token = registry.token(SOFT_TOKEN_ID).unwrap();
            assert_eq!(token.status, TokenStatus::NotInitialized);
            assert!(!token.available);

            assert_eq!(
                backend.activate(&pin(PIN)).unwrap_err().kind(),
                ErrorKind::TokenNotInitialized
            );
            assert_eq!(
                backend.initialize(&pin("short")).unwrap_err().kind(),
                ErrorKind::PinPolicyViolation
            );
            backend.initialize(&pin(PIN)).unwrap();
            assert!(backend.initialize(&pin(PIN)).is_err());

            assert_eq!(
                backend.activate(&pin("Wrong-Pin-123")).unwrap_err().kind(),
                ErrorKind::PinIncorrect
            );
            assert_eq!(
                registry.token(SOFT_TOKEN_ID).unwrap().status,
                TokenStatus::UserPinIncorrect
            );

            backend.activate(&pin(PIN)).unwrap();
            let token = registry.token(SOFT_TOKEN_ID).unwrap();
            assert!(token.active && token.available);
            assert_eq!(token.status, TokenStatus::Ok);
        })
    }

    #[test]
    fn generated_keys_sign() {
        test_under_tmp(|dir| {
            let (mut backend, registry) = active_backend(&dir);
            let rsa = backend.generate_key(None, "rsa").unwrap();
            let ec = backend.generate_key(Some(KeyAlgorithm::Ec), "").unwrap();
            assert!(rsa.available);
            assert_eq!(rsa.label.as_deref(), Some("rsa"));
            assert_eq!(registry.token(SOFT_TOKEN_ID).unwrap().keys.len(), 2);

            let data = b"to be signed";
            let alg = SignAlgorithm::Sha256WithRsa;
            let sig = backend.sign(
                &rsa.id, alg, &alg.digest().digest(data).unwrap()
            ).unwrap();
            let public = PKey::public_key_from_der(
                rsa.public_key.as_ref().unwrap()
            ).unwrap();
            let mut verifier = Verifier::new(
                alg.digest().message_digest(), &public
            ).unwrap();
            verifier.update(data).unwrap();
            assert!(verifier.verify(&sig).unwrap());

            let err = backend.sign(
                &ec.id, alg, &alg.digest().digest(data).unwrap()
            ).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnsupportedSignAlgorithm);
            let err = backend.sign(&rsa.id, alg, &[0u8; 20]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CannotSign);
        })
    }

    #[test]
    fn deactivated_token_cannot_sign() {
        test_under_tmp(|dir| {
            let (mut backend, registry) = active_backend(&dir);
            let key = backend.generate_key(None, "").unwrap();
            backend.deactivate().unwrap();

            assert!(!registry.key(&key.id).unwrap().available);
            let alg = SignAlgorithm::Sha256WithRsa;
            let err = backend.sign(&key.id, alg, &[0u8; 32]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TokenNotActive);
            assert_eq!(
                backend.generate_key(None, "").unwrap_err().kind(),
                ErrorKind::TokenNotActive
            );
        })
    }

    #[test]
    fn keys_survive_pin_change_and_restart() {
        test_under_tmp(|dir| {
            let new_pin = "Other-Pin-456";
            let key_id = {
                let (mut backend, _) = active_backend(&dir);
                let key = backend.generate_key(None, "").unwrap();
                assert_eq!(
                    backend.update_pin(&pin(PIN), &pin("weak"))
                        .unwrap_err().kind(),
                    ErrorKind::PinPolicyViolation
                );
                backend.update_pin(&pin(PIN), &pin(new_pin)).unwrap();
                key.id
            };

            let (mut backend, registry) = backend(&dir);
            backend.refresh().unwrap();
            assert!(!registry.key(&key_id).unwrap().available);
            assert!(backend.activate(&pin(PIN)).is_err());
            backend.activate(&pin(new_pin)).unwrap();
            assert!(registry.key(&key_id).unwrap().available);
        })
    }

    #[test]
    fn refresh_discovers_unregistered_keys() {
        test_under_tmp(|dir| {
            let key_id = {
                let (mut backend, _) = active_backend(&dir);
                backend.generate_key(None, "").unwrap().id
            };
            // Lose the key configuration but keep the key store.
            std::fs::remove_file(
                dir.join(crate::constants::KEY_CONF_FILE)
            ).unwrap();

            let (mut backend, registry) = backend(&dir);
            backend.activate(&pin(PIN)).unwrap();
            let key = registry.key(&key_id).unwrap();
            assert!(key.available);
            assert!(key.public_key.is_some());
        })
    }

    #[test]
    fn delete_key_from_device() {
        test_under_tmp(|dir| {
            let (mut backend, registry) = active_backend(&dir);
            let kept = backend.generate_key(None, "").unwrap();
            let gone = backend.generate_key(None, "").unwrap();

            registry.add_cert_request(
                &kept.id, None, "CN=kept", None, KeyUsage::Authentication,
                None,
            ).unwrap();
            registry.add_cert(&kept.id, CertificateInfo {
                id: "saved".into(),
                member_id: None,
                active: true,
                saved_to_configuration: true,
                status: CertStatus::Registered,
                certificate_bytes: Bytes::from_static(b"saved"),
                ocsp_bytes: None,
                ocsp_verify_error: None,
            }).unwrap();

            backend.delete_key(&kept.id, false).unwrap();
            let key = registry.key(&kept.id).unwrap();
            assert!(key.certs.is_empty() && key.cert_requests.is_empty());
            assert!(backend.store.has_key(&kept.id));

            backend.refresh().unwrap();
            let token = registry.token(SOFT_TOKEN_ID).unwrap();
            assert_eq!(token.keys.len(), 2);
            let key = registry.key(&kept.id).unwrap();
            assert!(key.available);
            assert!(key.certs.is_empty() && key.cert_requests.is_empty());

            backend.delete_key(&gone.id, true).unwrap();
            assert!(registry.key(&gone.id).is_err());
            assert!(!backend.store.has_key(&gone.id));
        })
    }
}
