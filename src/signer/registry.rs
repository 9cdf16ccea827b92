//! The directory of tokens, keys, certificates and certificate requests.
//!
//! All token workers share one registry. Every change goes through
//! [`TokenRegistry::mutate`], which applies it to a copy of the state,
//! writes the key configuration to disk if its persisted form changed,
//! and only then makes the copy the current state. A crash after a
//! mutation returned can therefore not lose it, and readers never see a
//! change half applied.

use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use log::{debug, info};
use openssl::hash::{hash, MessageDigest};

use crate::commons::api::{
    CertRequestInfo, CertStatus, CertificateInfo, ClientId, KeyInfo,
    KeyUsage, TokenInfo, TokenStatus,
};
use crate::commons::crypto::SignMechanism;
use crate::commons::error::Error;
use crate::commons::util::file;
use crate::commons::{SignerEmptyResult, SignerResult};
use crate::constants::KEY_CONF_FILE;


//------------ TokenRegistry -------------------------------------------------

#[derive(Debug)]
pub struct TokenRegistry {
    path: PathBuf,
    state: RwLock<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    tokens: Vec<TokenInfo>,

    /// The key configuration as last written to disk.
    persisted: Bytes,

    checksum: String,
}

impl TokenRegistry {
    /// Loads the registry from the key configuration under `data_dir`.
    pub fn open(data_dir: &Path) -> SignerResult<Self> {
        let path = data_dir.join(KEY_CONF_FILE);
        let tokens: Vec<TokenInfo> = file::load_json(&path)?
            .unwrap_or_default();
        let persisted = Self::persisted_form(&tokens)?;
        let checksum = checksum(&persisted)?;
        debug!(
            "Loaded {} tokens from '{}'", tokens.len(), path.display()
        );
        Ok(TokenRegistry {
            path,
            state: RwLock::new(RegistryState { tokens, persisted, checksum }),
        })
    }

    /// Returns the checksum of the persisted key configuration.
    ///
    /// Changes only when something that is persisted changes.
    pub fn checksum(&self) -> String {
        self.read_state().checksum.clone()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|err| err.into_inner())
    }

    fn persisted_form(tokens: &[TokenInfo]) -> SignerResult<Bytes> {
        let persisted: Vec<_> = tokens.iter()
            .map(TokenInfo::to_persisted)
            .collect();
        Ok(Bytes::from(serde_json::to_vec_pretty(&persisted)?))
    }

    /// Reads the current state.
    pub fn read<R>(&self, op: impl FnOnce(&[TokenInfo]) -> R) -> R {
        op(&self.read_state().tokens)
    }

    /// Applies a change as a single atomic step.
    ///
    /// If `op` fails, nothing changes. Otherwise the change is on disk
    /// before this returns.
    pub fn mutate<R>(
        &self,
        op: impl FnOnce(&mut Vec<TokenInfo>) -> SignerResult<R>,
    ) -> SignerResult<R> {
        let mut state = self.write_state();
        let mut tokens = state.tokens.clone();
        let res = op(&mut tokens)?;

        let persisted = Self::persisted_form(&tokens)?;
        if persisted != state.persisted {
            file::save_atomic(&persisted, &self.path)?;
            state.checksum = checksum(&persisted)?;
            state.persisted = persisted;
        }
        state.tokens = tokens;
        Ok(res)
    }
}

/// # Lookups
///
/// All lookups return copies. The state may change right after.
impl TokenRegistry {
    pub fn tokens(&self) -> Vec<TokenInfo> {
        self.read(|tokens| tokens.to_vec())
    }

    pub fn token(&self, token_id: &str) -> SignerResult<TokenInfo> {
        self.read(|tokens| {
            tokens.iter().find(|token| token.id == token_id).cloned()
        }).ok_or_else(|| Error::TokenNotFound(token_id.to_string()))
    }

    pub fn has_token(&self, token_id: &str) -> bool {
        self.read(|tokens| tokens.iter().any(|token| token.id == token_id))
    }

    pub fn find_token_and_key(
        &self, key_id: &str
    ) -> SignerResult<(TokenInfo, KeyInfo)> {
        self.read(|tokens| {
            tokens.iter().find_map(|token| {
                token.key(key_id).map(|key| (token.clone(), key.clone()))
            })
        }).ok_or_else(|| Error::KeyNotFound(key_id.to_string()))
    }

    pub fn key(&self, key_id: &str) -> SignerResult<KeyInfo> {
        self.find_token_and_key(key_id).map(|(_, key)| key)
    }

    pub fn key_for_cert_id(&self, cert_id: &str) -> SignerResult<KeyInfo> {
        self.read(|tokens| {
            all_keys(tokens).find(|key| key.cert(cert_id).is_some()).cloned()
        }).ok_or_else(|| Error::CertNotFound(cert_id.to_string()))
    }

    pub fn cert(&self, cert_id: &str) -> SignerResult<CertificateInfo> {
        self.read(|tokens| {
            all_keys(tokens).find_map(|key| key.cert(cert_id)).cloned()
        }).ok_or_else(|| Error::CertNotFound(cert_id.to_string()))
    }

    pub fn cert_by_hash(&self, hash: &str) -> SignerResult<CertificateInfo> {
        let hash = hash.to_ascii_lowercase();
        self.read(|tokens| {
            all_keys(tokens).find_map(|key| key.cert_by_hash(&hash)).cloned()
        }).ok_or_else(|| Error::CertNotFound(hash))
    }

    pub fn key_id_for_cert_hash(&self, hash: &str) -> SignerResult<String> {
        let hash = hash.to_ascii_lowercase();
        self.read(|tokens| {
            all_keys(tokens)
                .find(|key| key.cert_by_hash(&hash).is_some())
                .map(|key| key.id.clone())
        }).ok_or_else(|| Error::CertNotFound(hash))
    }

    /// Returns the certificate request and the key it belongs to.
    pub fn cert_request(
        &self, csr_id: &str
    ) -> SignerResult<(KeyInfo, CertRequestInfo)> {
        self.read(|tokens| {
            all_keys(tokens).find_map(|key| {
                key.cert_request(csr_id).map(|req| (key.clone(), req.clone()))
            })
        }).ok_or_else(|| Error::CertRequestNotFound(csr_id.to_string()))
    }

    pub fn token_and_key_id_for_cert_request(
        &self, csr_id: &str
    ) -> SignerResult<(String, String)> {
        self.cert_request(csr_id).map(|(key, _)| (key.token_id, key.id))
    }

    /// Returns the signing certificates of a member.
    pub fn member_certs(&self, member: &ClientId) -> Vec<CertificateInfo> {
        self.read(|tokens| {
            all_keys(tokens)
                .filter(|key| key.usage == Some(KeyUsage::Signing))
                .flat_map(|key| key.certs.iter())
                .filter(|cert| cert.member_id.as_ref() == Some(member))
                .cloned()
                .collect()
        })
    }

    /// Finds the key a certificate belongs to.
    ///
    /// Keys are matched by their public key. Keys whose public key is not
    /// yet known match if they hold an unsaved copy of the certificate.
    pub fn key_for_certificate(
        &self, public_key_info: &[u8], cert_hash: &str
    ) -> SignerResult<KeyInfo> {
        self.read(|tokens| {
            all_keys(tokens).find(|key| {
                key.public_key.as_deref() == Some(public_key_info)
            }).or_else(|| {
                all_keys(tokens).find(|key| {
                    key.certs.iter().any(|cert| {
                        !cert.saved_to_configuration
                            && cert.has_hash(cert_hash)
                    })
                })
            }).cloned()
        }).ok_or_else(|| {
            Error::KeyNotFound(format!("for certificate '{cert_hash}'"))
        })
    }
}

/// # Token changes
impl TokenRegistry {
    /// Adds a token unless one with the same id exists.
    ///
    /// Returns whether the token was added.
    pub fn add_token(&self, token: TokenInfo) -> SignerResult<bool> {
        self.mutate(|tokens| {
            if tokens.iter().any(|existing| existing.id == token.id) {
                return Ok(false)
            }
            info!("Adding new token '{}'", token.id);
            tokens.push(token);
            Ok(true)
        })
    }

    /// Applies a change to a single token.
    pub fn update_token<R>(
        &self,
        token_id: &str,
        op: impl FnOnce(&mut TokenInfo) -> SignerResult<R>,
    ) -> SignerResult<R> {
        self.mutate(|tokens| {
            let token = tokens.iter_mut()
                .find(|token| token.id == token_id)
                .ok_or_else(|| Error::TokenNotFound(token_id.to_string()))?;
            op(token)
        })
    }

    pub fn set_token_active(
        &self, token_id: &str, active: bool
    ) -> SignerEmptyResult {
        self.update_token(token_id, |token| {
            token.active = active;
            Ok(())
        })
    }

    pub fn set_token_available(
        &self, token_id: &str, available: bool
    ) -> SignerEmptyResult {
        self.update_token(token_id, |token| {
            token.available = available;
            Ok(())
        })
    }

    pub fn set_token_status(
        &self, token_id: &str, status: TokenStatus
    ) -> SignerEmptyResult {
        self.update_token(token_id, |token| {
            token.status = status;
            Ok(())
        })
    }

    pub fn set_token_friendly_name(
        &self, token_id: &str, name: &str
    ) -> SignerEmptyResult {
        self.update_token(token_id, |token| {
            token.friendly_name = Some(name.to_string());
            Ok(())
        })
    }
}

/// # Key changes
impl TokenRegistry {
    /// Adds a key to a token.
    ///
    /// If the token already has a key with that id, it is returned
    /// unchanged.
    pub fn add_key(&self, key: KeyInfo) -> SignerResult<KeyInfo> {
        let token_id = key.token_id.clone();
        self.update_token(&token_id, |token| {
            if let Some(existing) = token.key(&key.id) {
                return Ok(existing.clone())
            }
            debug!("[{}] Adding key '{}'", token.id, key.id);
            token.keys.push(key.clone());
            Ok(key)
        })
    }

    /// Removes a key with everything it holds.
    pub fn remove_key(&self, key_id: &str) -> SignerEmptyResult {
        self.mutate(|tokens| {
            for token in tokens.iter_mut() {
                let pos = token.keys.iter().position(|k| k.id == key_id);
                if let Some(pos) = pos {
                    token.keys.remove(pos);
                    return Ok(())
                }
            }
            Err(Error::KeyNotFound(key_id.to_string()))
        })
    }

    /// Applies a change to a single key.
    pub fn update_key<R>(
        &self,
        key_id: &str,
        op: impl FnOnce(&mut KeyInfo) -> SignerResult<R>,
    ) -> SignerResult<R> {
        self.mutate(|tokens| {
            let key = tokens.iter_mut()
                .flat_map(|token| token.keys.iter_mut())
                .find(|key| key.id == key_id)
                .ok_or_else(|| Error::KeyNotFound(key_id.to_string()))?;
            op(key)
        })
    }

    pub fn set_key_available(
        &self, key_id: &str, available: bool
    ) -> SignerEmptyResult {
        self.update_key(key_id, |key| {
            key.available = available;
            Ok(())
        })
    }

    /// Fixes the usage of a key.
    ///
    /// Fails if the key already has a different usage.
    pub fn set_key_usage(
        &self, key_id: &str, usage: KeyUsage
    ) -> SignerEmptyResult {
        self.update_key(key_id, |key| apply_usage(key, usage))
    }

    pub fn set_public_key(
        &self, key_id: &str, public_key: Bytes
    ) -> SignerEmptyResult {
        self.update_key(key_id, |key| {
            key.public_key = Some(public_key);
            Ok(())
        })
    }

    pub fn set_key_friendly_name(
        &self, key_id: &str, name: &str
    ) -> SignerEmptyResult {
        self.update_key(key_id, |key| {
            key.friendly_name = Some(name.to_string());
            Ok(())
        })
    }

    pub fn set_key_label(&self, key_id: &str, label: &str) -> SignerEmptyResult {
        self.update_key(key_id, |key| {
            key.label = Some(label.to_string());
            Ok(())
        })
    }

    pub fn set_sign_mechanism(
        &self, key_id: &str, mechanism: SignMechanism
    ) -> SignerEmptyResult {
        self.update_key(key_id, |key| {
            key.sign_mechanism = Some(mechanism.name().to_string());
            Ok(())
        })
    }
}

/// # Certificate changes
impl TokenRegistry {
    /// Adds a certificate to a key.
    ///
    /// A certificate with the same content that is already saved is an
    /// error, an unsaved one is replaced.
    pub fn add_cert(
        &self, key_id: &str, cert: CertificateInfo
    ) -> SignerEmptyResult {
        self.mutate(|tokens| {
            replace_transient_copy(tokens, &cert.hash()?)?;
            let key = find_key_mut(tokens, key_id)?;
            key.certs.push(cert);
            Ok(())
        })
    }

    /// Stores an imported certificate.
    ///
    /// In one step this adds the certificate, fixes the usage of the key,
    /// records its public key if still unknown and removes the
    /// certificate requests of the key for the same member.
    pub fn import_cert(
        &self,
        key_id: &str,
        cert: CertificateInfo,
        usage: KeyUsage,
        public_key: Bytes,
    ) -> SignerEmptyResult {
        self.mutate(|tokens| {
            replace_transient_copy(tokens, &cert.hash()?)?;
            let key = find_key_mut(tokens, key_id)?;
            apply_usage(key, usage)?;
            if key.public_key.is_none() {
                key.public_key = Some(public_key);
            }
            key.cert_requests.retain(|req| req.member_id != cert.member_id);
            key.certs.push(cert);
            Ok(())
        })
    }

    /// Removes a certificate and returns it.
    pub fn remove_cert(&self, cert_id: &str) -> SignerResult<CertificateInfo> {
        self.mutate(|tokens| {
            for key in tokens.iter_mut().flat_map(|t| t.keys.iter_mut()) {
                let pos = key.certs.iter().position(|c| c.id == cert_id);
                if let Some(pos) = pos {
                    return Ok(key.certs.remove(pos))
                }
            }
            Err(Error::CertNotFound(cert_id.to_string()))
        })
    }

    /// Applies a change to a single certificate.
    pub fn update_cert<R>(
        &self,
        cert_id: &str,
        op: impl FnOnce(&mut CertificateInfo) -> SignerResult<R>,
    ) -> SignerResult<R> {
        self.mutate(|tokens| {
            let cert = tokens.iter_mut()
                .flat_map(|token| token.keys.iter_mut())
                .flat_map(|key| key.certs.iter_mut())
                .find(|cert| cert.id == cert_id)
                .ok_or_else(|| Error::CertNotFound(cert_id.to_string()))?;
            op(cert)
        })
    }

    pub fn set_cert_active(
        &self, cert_id: &str, active: bool
    ) -> SignerEmptyResult {
        self.update_cert(cert_id, |cert| {
            cert.active = active;
            Ok(())
        })
    }

    pub fn set_cert_status(
        &self, cert_id: &str, status: CertStatus
    ) -> SignerEmptyResult {
        self.update_cert(cert_id, |cert| {
            cert.status = status;
            Ok(())
        })
    }
}

/// # Certificate request changes
impl TokenRegistry {
    /// Adds a certificate request to a key and returns its id.
    ///
    /// If the key already has a request for the same member and subject,
    /// its id is returned instead. The usage of the key is fixed by the
    /// first request.
    pub fn add_cert_request(
        &self,
        key_id: &str,
        member_id: Option<ClientId>,
        subject_name: &str,
        subject_alt_name: Option<String>,
        usage: KeyUsage,
        certificate_profile: Option<String>,
    ) -> SignerResult<String> {
        self.mutate(|tokens| {
            let key = find_key_mut(tokens, key_id)?;
            apply_usage(key, usage)?;

            let existing = key.cert_requests.iter().find(|req| {
                req.member_id == member_id
                    && req.subject_name.eq_ignore_ascii_case(subject_name)
            });
            if let Some(existing) = existing {
                info!(
                    "Certificate request for '{}' already exists on key '{}'",
                    subject_name, key_id
                );
                return Ok(existing.id.clone())
            }

            let id = uuid::Uuid::new_v4().to_string();
            key.cert_requests.push(CertRequestInfo {
                id: id.clone(),
                key_id: key_id.to_string(),
                member_id,
                subject_name: subject_name.to_string(),
                subject_alt_name,
                usage,
                certificate_profile,
            });
            info!("Added certificate request '{id}' to key '{key_id}'");
            Ok(id)
        })
    }

    pub fn remove_cert_request(&self, csr_id: &str) -> SignerEmptyResult {
        self.mutate(|tokens| {
            for key in tokens.iter_mut().flat_map(|t| t.keys.iter_mut()) {
                let pos = key.cert_requests.iter().position(|r| {
                    r.id == csr_id
                });
                if let Some(pos) = pos {
                    key.cert_requests.remove(pos);
                    return Ok(())
                }
            }
            Err(Error::CertRequestNotFound(csr_id.to_string()))
        })
    }
}


//------------ Helpers -------------------------------------------------------

fn all_keys(tokens: &[TokenInfo]) -> impl Iterator<Item = &KeyInfo> {
    tokens.iter().flat_map(|token| token.keys.iter())
}

fn find_key_mut<'a>(
    tokens: &'a mut [TokenInfo], key_id: &str
) -> SignerResult<&'a mut KeyInfo> {
    tokens.iter_mut()
        .flat_map(|token| token.keys.iter_mut())
        .find(|key| key.id == key_id)
        .ok_or_else(|| Error::KeyNotFound(key_id.to_string()))
}

fn apply_usage(key: &mut KeyInfo, usage: KeyUsage) -> SignerEmptyResult {
    match key.usage {
        Some(existing) if existing != usage => {
            Err(Error::wrong_usage(format!(
                "Key '{}' is an {existing} key and cannot be used for \
                 {usage}",
                key.id
            )))
        }
        _ => {
            key.usage = Some(usage);
            Ok(())
        }
    }
}

/// Removes an unsaved certificate with the given hash from any key.
///
/// Fails if a saved certificate with that hash exists.
fn replace_transient_copy(
    tokens: &mut [TokenInfo], hash: &str
) -> SignerEmptyResult {
    for key in tokens.iter_mut().flat_map(|token| token.keys.iter_mut()) {
        if let Some(pos) = key.certs.iter().position(|c| c.has_hash(hash)) {
            if key.certs[pos].saved_to_configuration {
                return Err(Error::CertificateAlreadyExists(hash.to_string()))
            }
            debug!("Replacing transient certificate '{hash}'");
            key.certs.remove(pos);
        }
    }
    Ok(())
}

fn checksum(content: &[u8]) -> SignerResult<String> {
    Ok(hex::encode(hash(MessageDigest::sha256(), content)?))
}


//------------ Tests ---------------------------------------------------------
