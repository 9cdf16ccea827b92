//! Per-token workers.
//!
//! A [`TokenWorker`] wraps the backend of one token into a reader-writer
//! lock: operations changing the token take the write lock, signing takes
//! the read lock. Many signatures can be made at the same time, but never
//! while the token is being changed.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use log::{debug, info, warn};
use secrecy::SecretString;

use crate::commons::api::{KeyInfo, KeyUsage};
use crate::commons::crypto::asn1::{self, TbsCertificate};
use crate::commons::crypto::x509::{self, parse_cert, parse_name};
use crate::commons::crypto::{KeyAlgorithm, SignAlgorithm};
use crate::commons::error::Error;
use crate::commons::{SignerEmptyResult, SignerResult};

use super::registry::TokenRegistry;


//------------ TokenBackend --------------------------------------------------

/// The token specific part of a worker.
///
/// Backends do not lock anything themselves. The [`TokenWorker`]
/// guarantees that `&mut self` methods never run concurrently with any
/// other method.
pub trait TokenBackend: Send + Sync {
    fn token_id(&self) -> &str;

    /// Logs in to the token.
    fn activate(&mut self, pin: &SecretString) -> SignerEmptyResult;

    /// Logs out of the token.
    fn deactivate(&mut self) -> SignerEmptyResult;

    /// Initializes an uninitialized token with a PIN.
    fn initialize(&mut self, pin: &SecretString) -> SignerEmptyResult;

    /// Generates a new key pair and registers it.
    ///
    /// Without an algorithm, the default of the token is used.
    fn generate_key(
        &mut self, algorithm: Option<KeyAlgorithm>, label: &str
    ) -> SignerResult<KeyInfo>;

    /// Deletes a key, see [`remove_key_from_conf`] for the semantics of
    /// keeping it on the device.
    fn delete_key(
        &mut self, key_id: &str, from_device: bool
    ) -> SignerEmptyResult;

    /// Deletes a certificate.
    fn delete_cert(&mut self, cert_id: &str) -> SignerEmptyResult;

    fn update_pin(
        &mut self, old_pin: &SecretString, new_pin: &SecretString
    ) -> SignerEmptyResult;

    /// Brings the registry in line with the token.
    fn refresh(&mut self) -> SignerEmptyResult;

    /// Signs a digest computed with the digest of `algorithm`.
    fn sign(
        &self, key_id: &str, algorithm: SignAlgorithm, digest: &[u8]
    ) -> SignerResult<Vec<u8>>;

    /// Called after every operation, whatever its outcome.
    fn after_action(&self) { }
}


//------------ TokenWorker ---------------------------------------------------

pub struct TokenWorker {
    token_id: String,
    backend: RwLock<Box<dyn TokenBackend>>,
    registry: Arc<TokenRegistry>,
}

impl TokenWorker {
    pub fn new(
        backend: Box<dyn TokenBackend>, registry: Arc<TokenRegistry>
    ) -> Self {
        TokenWorker {
            token_id: backend.token_id().to_string(),
            backend: RwLock::new(backend),
            registry,
        }
    }

    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    fn read(&self) -> ActionGuard<RwLockReadGuard<'_, Box<dyn TokenBackend>>> {
        ActionGuard(
            self.backend.read().unwrap_or_else(|err| err.into_inner())
        )
    }

    fn write(
        &self
    ) -> ActionGuard<RwLockWriteGuard<'_, Box<dyn TokenBackend>>> {
        ActionGuard(
            self.backend.write().unwrap_or_else(|err| err.into_inner())
        )
    }
}

/// # Changing the token
impl TokenWorker {
    pub fn activate(&self, pin: &SecretString) -> SignerEmptyResult {
        info!("[{}] Activating token", self.token_id);
        self.write().activate(pin)
    }

    pub fn deactivate(&self) -> SignerEmptyResult {
        info!("[{}] Deactivating token", self.token_id);
        self.write().deactivate()
    }

    pub fn initialize(&self, pin: &SecretString) -> SignerEmptyResult {
        info!("[{}] Initializing token", self.token_id);
        self.write().initialize(pin)
    }

    pub fn generate_key(
        &self, algorithm: Option<KeyAlgorithm>, label: &str
    ) -> SignerResult<KeyInfo> {
        let key = self.write().generate_key(algorithm, label)?;
        info!("[{}] Generated key '{}'", self.token_id, key.id);
        Ok(key)
    }

    pub fn delete_key(
        &self, key_id: &str, from_device: bool
    ) -> SignerEmptyResult {
        info!(
            "[{}] Deleting key '{key_id}' (from device: {from_device})",
            self.token_id
        );
        self.write().delete_key(key_id, from_device)
    }

    pub fn delete_cert(&self, cert_id: &str) -> SignerEmptyResult {
        info!("[{}] Deleting certificate '{cert_id}'", self.token_id);
        self.write().delete_cert(cert_id)
    }

    pub fn update_pin(
        &self, old_pin: &SecretString, new_pin: &SecretString
    ) -> SignerEmptyResult {
        info!("[{}] Updating token PIN", self.token_id);
        self.write().update_pin(old_pin, new_pin)
    }

    /// Refreshes the token.
    ///
    /// Refreshing is best effort, failures are logged and swallowed.
    pub fn refresh(&self) {
        if let Err(err) = self.write().refresh() {
            warn!("[{}] Refresh failed: {err}", self.token_id);
        }
    }
}

/// # Signing
impl TokenWorker {
    pub fn sign(
        &self, key_id: &str, algorithm: SignAlgorithm, digest: &[u8]
    ) -> SignerResult<Vec<u8>> {
        debug!(
            "[{}] Signing with key '{key_id}' using {algorithm}",
            self.token_id
        );
        self.read().sign(key_id, algorithm, digest)
    }

    /// Issues a certificate for a public key, signed with a token key.
    ///
    /// The first active certificate of the key is the issuer. The new
    /// certificate is valid until the issuer certificate expires. Returns
    /// the DER encoded new certificate followed by the issuer
    /// certificate.
    pub fn sign_certificate(
        &self,
        key_id: &str,
        algorithm: SignAlgorithm,
        subject_name: &str,
        public_key: &[u8],
    ) -> SignerResult<Bytes> {
        let backend = self.read();

        let key = self.registry.key(key_id)?;
        let issuer_info = key.certs.iter().find(|cert| cert.active)
            .ok_or_else(|| {
                Error::cannot_sign(key_id, "key has no active certificate")
            })?;
        let issuer = parse_cert(&issuer_info.certificate_bytes)?;

        let tbs = TbsCertificate {
            serial: rand::random::<u64>() >> 1,
            algorithm,
            issuer: asn1::capture(&issuer.subject_name().to_der()?)?,
            not_before: Utc::now(),
            not_after: x509::not_after(&issuer)?,
            subject: asn1::capture(&parse_name(subject_name)?.to_der()?)?,
            public_key_info: asn1::capture(public_key)?,
            extensions: vec![asn1::key_usage_extension(KeyUsage::Signing)],
        }.encode();
        let digest = algorithm.digest().digest(tbs.as_slice())?;
        let signature = backend.sign(key_id, algorithm, &digest)?;
        let cert = asn1::signed_structure(tbs, algorithm, signature);

        info!(
            "[{}] Issued certificate for '{subject_name}' with key \
             '{key_id}'",
            self.token_id
        );
        let mut chain = BytesMut::with_capacity(
            cert.len() + issuer_info.certificate_bytes.len()
        );
        chain.extend_from_slice(&cert);
        chain.extend_from_slice(&issuer_info.certificate_bytes);
        Ok(chain.freeze())
    }
}


//------------ ActionGuard ---------------------------------------------------

/// Access to a backend that runs its after action hook when dropped.
///
/// The hook runs before the lock is released, also when the operation
/// failed or panicked.
struct ActionGuard<G: Deref<Target = Box<dyn TokenBackend>>>(G);

impl<G: Deref<Target = Box<dyn TokenBackend>>> Deref for ActionGuard<G> {
    type Target = dyn TokenBackend;

    fn deref(&self) -> &Self::Target {
        &**self.0
    }
}

impl<G> DerefMut for ActionGuard<G>
where
    G: DerefMut<Target = Box<dyn TokenBackend>>,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.0
    }
}

impl<G: Deref<Target = Box<dyn TokenBackend>>> Drop for ActionGuard<G> {
    fn drop(&mut self) {
        self.0.after_action()
    }
}


//------------ Shared Backend Logic ------------------------------------------

/// Removes a key from the key configuration while leaving it on its token.
///
/// Saved certificates and certificate requests are removed. If the key
/// still has certificates only found on the device, the key record is
/// kept for them, otherwise it is removed.
pub fn remove_key_from_conf(
    registry: &TokenRegistry, key_id: &str
) -> SignerEmptyResult {
    if !clear_key_conf(registry, key_id)? {
        registry.remove_key(key_id)?;
    }
    Ok(())
}

/// Removes the saved certificates and all requests of a key.
///
/// Returns whether certificates only known from the device remain.
pub fn clear_key_conf(
    registry: &TokenRegistry, key_id: &str
) -> SignerResult<bool> {
    registry.update_key(key_id, |key| {
        key.certs.retain(|cert| !cert.saved_to_configuration);
        key.cert_requests.clear();
        Ok(!key.certs.is_empty())
    })
}

/// Checks that a key exists on this token and is available.
pub fn available_key(
    registry: &TokenRegistry, token_id: &str, key_id: &str
) -> SignerResult<KeyInfo> {
    let (token, key) = registry.find_token_and_key(key_id)?;
    if token.id != token_id {
        return Err(Error::KeyNotFound(key_id.to_string()))
    }
    if !token.active {
        return Err(Error::TokenNotActive(token_id.to_string()))
    }
    if !key.available {
        return Err(Error::KeyNotAvailable(key_id.to_string()))
    }
    Ok(key)
}


//------------ Tests ---------------------------------------------------------
