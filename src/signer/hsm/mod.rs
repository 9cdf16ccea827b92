//! Tokens on PKCS#11 devices.
//!
//! Every token found in a slot of a configured module gets its own
//! [`HardwareBackend`]. Operations changing the token run over a single
//! management session and are retried with an exponential backoff when
//! the device reports a condition that may go away by itself. Signing
//! uses a pool of logged in sessions if one is configured.

mod context;
mod module;
mod session;

pub use self::context::Pkcs11Context;
pub use self::module::{
    device_status, discover, format_token_id, DiscoveredToken,
};
pub use self::session::{SessionOpener, SessionProvider};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use bytes::Bytes;
use cryptoki::error::{Error as Pkcs11Error, RvError};
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsPssParams};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{Attribute, AttributeType, KeyType, ObjectClass};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use log::{debug, error, info, warn};
use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::nid::Nid;
use secrecy::{ExposeSecret, SecretString};

use crate::commons::api::{
    CertStatus, CertificateInfo, KeyInfo, TokenStatus,
};
use crate::commons::crypto::asn1::digest_info;
use crate::commons::crypto::keys::{
    ec_public_key_info, params_for_curve, public_key_algorithm,
    random_key_id, rsa_public_key_info,
};
use crate::commons::crypto::x509::cert_hash;
use crate::commons::crypto::{
    DigestAlgorithm, KeyAlgorithm, SignAlgorithm, SignMechanism,
};
use crate::commons::error::Error;
use crate::commons::{SignerEmptyResult, SignerResult};
use crate::constants::{
    DEVICE_RSA_BITS, RETRY_REQ_AFTER, RETRY_REQ_AFTER_MULTIPLIER,
    RETRY_REQ_UNTIL_MAX,
};
use crate::daemon::config::{Pkcs11ModuleConfig, SessionPoolConfig};

use super::pins::PinVault;
use super::registry::TokenRegistry;
use super::worker::{available_key, remove_key_from_conf, TokenBackend};


/// The attributes read from public key objects.
const PUBLIC_KEY_ATTRIBUTES: [AttributeType; 6] = [
    AttributeType::Id,
    AttributeType::Label,
    AttributeType::Modulus,
    AttributeType::PublicExponent,
    AttributeType::EcParams,
    AttributeType::EcPoint,
];


//------------ DeviceSessions ------------------------------------------------

/// Opens sessions with the token in one slot.
#[derive(Debug)]
pub struct DeviceSessions {
    token_id: String,
    context: Arc<Pkcs11Context>,
    slot: Slot,
    read_only: bool,
    pins: Arc<PinVault>,

    /// Whether new sessions are logged in if the PIN is known.
    login_on_open: bool,
}

impl DeviceSessions {
    fn error(&self, context: &'static str, err: Pkcs11Error) -> Error {
        device_error(&self.token_id, context, err)
    }

    fn token_info(&self) -> Result<cryptoki::slot::TokenInfo, Pkcs11Error> {
        self.context.pkcs11().get_token_info(self.slot)
    }
}

impl SessionOpener for DeviceSessions {
    type Session = Session;

    fn open(&self) -> SignerResult<Session> {
        let session = if self.read_only {
            self.context.pkcs11().open_ro_session(self.slot)
        }
        else {
            self.context.pkcs11().open_rw_session(self.slot)
        }.map_err(|err| self.error("open session", err))?;

        if self.login_on_open {
            if let Some(pin) = self.pins.get(&self.token_id) {
                self.login(&session, &pin)?;
            }
        }
        Ok(session)
    }

    fn login(
        &self, session: &Session, pin: &SecretString
    ) -> SignerEmptyResult {
        login(session, pin).map_err(|err| self.error("login", err))
    }

    fn check_alive(&self, session: &Session) -> SignerEmptyResult {
        session.get_session_info()
            .map(|_| ())
            .map_err(|err| self.error("check session", err))
    }
}

/// Logs a session in as the normal user.
///
/// The login state is shared by all sessions with a token, so a session
/// finding the user already logged in is fine.
fn login(session: &Session, pin: &SecretString) -> Result<(), Pkcs11Error> {
    let pin = AuthPin::from(pin.expose_secret().to_string());
    match session.login(UserType::User, Some(&pin)) {
        Err(Pkcs11Error::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => Ok(()),
        res => res,
    }
}

fn logout(session: &Session) -> Result<(), Pkcs11Error> {
    match session.logout() {
        Err(Pkcs11Error::Pkcs11(RvError::UserNotLoggedIn, _)) => Ok(()),
        res => res,
    }
}


//------------ HardwareBackend -----------------------------------------------

#[derive(Debug)]
pub struct HardwareBackend {
    token_id: String,
    registry: Arc<TokenRegistry>,
    pins: Arc<PinVault>,
    sessions: Arc<DeviceSessions>,

    /// The session used for everything but signing.
    management: SessionProvider<DeviceSessions>,

    /// The signing session pool while the token is active, if enabled.
    signing: Option<SessionProvider<DeviceSessions>>,

    pool: SessionPoolConfig,
    module_read_only: bool,
    pin_per_signing: bool,

    /// The mechanism used for RSA keys.
    rsa_mechanism: SignMechanism,
}

impl HardwareBackend {
    /// Creates the backend for a discovered token.
    ///
    /// The token is added to the registry if it is new. Otherwise its
    /// runtime state is updated from the device.
    pub fn new(
        discovered: &DiscoveredToken,
        module: &Pkcs11ModuleConfig,
        pool: &SessionPoolConfig,
        registry: Arc<TokenRegistry>,
        pins: Arc<PinVault>,
    ) -> SignerResult<Self> {
        let device = &discovered.info;
        if !registry.add_token(device.clone())? {
            registry.update_token(&device.id, |token| {
                token.module_uid = device.module_uid.clone();
                token.slot_index = device.slot_index;
                token.serial_number = device.serial_number.clone();
                token.label = device.label.clone();
                token.read_only = device.read_only;
                token.batch_signing_enabled = device.batch_signing_enabled;
                token.pin_verification_per_signing =
                    device.pin_verification_per_signing;
                token.available = true;
                token.status = device.status;
                token.device_info = device.device_info.clone();
                Ok(())
            })?;
        }

        let sessions = Arc::new(DeviceSessions {
            token_id: device.id.clone(),
            context: discovered.context.clone(),
            slot: discovered.slot,
            read_only: device.read_only,
            pins: pins.clone(),
            login_on_open: !module.sign_verify_pin,
        });
        Ok(HardwareBackend {
            token_id: device.id.clone(),
            registry,
            pins,
            management: SessionProvider::single(sessions.clone()),
            sessions,
            signing: None,
            pool: pool.clone(),
            module_read_only: module.read_only,
            pin_per_signing: module.sign_verify_pin,
            rsa_mechanism: module.sign_mechanism,
        })
    }

    fn error(&self, context: &'static str, err: Pkcs11Error) -> Error {
        device_error(&self.token_id, context, err)
    }

    fn check_writable(&self) -> SignerEmptyResult {
        if self.registry.token(&self.token_id)?.read_only {
            Err(Error::TokenReadOnly(self.token_id.clone()))
        }
        else {
            Ok(())
        }
    }

    fn check_active(&self) -> SignerEmptyResult {
        if self.pins.contains(&self.token_id) {
            Ok(())
        }
        else {
            Err(Error::TokenNotActive(self.token_id.clone()))
        }
    }

    /// Returns the PIN to log in with around each operation, if any.
    fn operation_pin(&self) -> Option<SecretString> {
        if self.pin_per_signing {
            self.pins.get(&self.token_id)
        }
        else {
            None
        }
    }

    /// Runs an operation, logging in before and out after if a PIN is
    /// given.
    fn logged_in<R>(
        session: &Session,
        pin: Option<&SecretString>,
        op: impl FnOnce() -> Result<R, Pkcs11Error>,
    ) -> Result<R, Pkcs11Error> {
        let Some(pin) = pin else {
            return op()
        };
        login(session, pin)?;
        let res = op();
        if let Err(err) = logout(session) {
            debug!("Logging out after operation failed: {err}");
        }
        res
    }

    /// Runs an operation on the management session, retrying transient
    /// failures.
    fn with_retry<T>(
        &self,
        desc: &'static str,
        op: impl Fn(&Session) -> Result<T, Pkcs11Error>,
    ) -> SignerResult<T> {
        let token_id = &self.token_id;

        let backoff_policy = ExponentialBackoff {
            initial_interval: RETRY_REQ_AFTER,
            multiplier: RETRY_REQ_AFTER_MULTIPLIER,
            max_elapsed_time: Some(RETRY_REQ_UNTIL_MAX),
            ..Default::default()
        };

        let notify = |err: Error, next: Duration| {
            warn!(
                "[{token_id}] {desc} failed, retrying in {} seconds: {err}",
                next.as_secs()
            );
        };

        let pin = self.operation_pin();
        let attempt = || {
            let mut transient = false;
            let res = self.management.with_session(|session| {
                Self::logged_in(session, pin.as_ref(), || op(session))
                    .map_err(|err| {
                        transient = is_transient_error(&err);
                        self.error(desc, err)
                    })
            });
            res.map_err(|err| {
                if transient {
                    backoff::Error::transient(err)
                }
                else {
                    backoff::Error::permanent(err)
                }
            })
        };

        backoff::retry_notify(backoff_policy, attempt, notify).map_err(|err| {
            let err = match err {
                backoff::Error::Permanent(err) => err,
                backoff::Error::Transient { err, .. } => err,
            };
            error!("[{token_id}] {desc} failed: {err}");
            err
        })
    }

    fn signing_sessions(&self) -> &SessionProvider<DeviceSessions> {
        self.signing.as_ref().unwrap_or(&self.management)
    }

    /// Marks the token and its keys as gone.
    fn mark_unavailable(&mut self) -> SignerEmptyResult {
        self.signing = None;
        self.management.close();
        self.pins.clear(&self.token_id);
        self.registry.update_token(&self.token_id, |token| {
            token.available = false;
            token.active = false;
            for key in token.keys.iter_mut() {
                key.available = false;
            }
            Ok(())
        })
    }

    /// Lists the objects currently on the token.
    fn device_objects(&self, active: bool) -> SignerResult<DeviceObjects> {
        self.with_retry("list objects", |session| {
            let mut objects = DeviceObjects::default();
            if active {
                let template = [Attribute::Class(ObjectClass::PRIVATE_KEY)];
                for handle in session.find_objects(&template)? {
                    let attrs = session.get_attributes(
                        handle, &[AttributeType::Id]
                    )?;
                    if let Some(id) = object_id(&attrs) {
                        objects.private_keys.insert(id);
                    }
                }
            }
            let template = [Attribute::Class(ObjectClass::PUBLIC_KEY)];
            for handle in session.find_objects(&template)? {
                objects.public_keys.push(
                    session.get_attributes(handle, &PUBLIC_KEY_ATTRIBUTES)?
                );
            }
            let template = [Attribute::Class(ObjectClass::CERTIFICATE)];
            for handle in session.find_objects(&template)? {
                let attrs = session.get_attributes(
                    handle, &[AttributeType::Id, AttributeType::Value]
                )?;
                let value = attrs.iter().find_map(|attr| match attr {
                    Attribute::Value(value) => Some(value.clone()),
                    _ => None,
                });
                if let (Some(id), Some(value)) = (object_id(&attrs), value) {
                    objects.certs.push((id, Bytes::from(value)));
                }
            }
            Ok(objects)
        })
    }

    /// Brings the keys and certificates of the registry in line with the
    /// objects on the device.
    fn reconcile(
        &self, objects: DeviceObjects, active: bool
    ) -> SignerEmptyResult {
        let mut public_keys = Vec::new();
        for attrs in &objects.public_keys {
            let Some(key_id) = object_id(attrs) else {
                debug!("[{}] Ignoring public key without id", self.token_id);
                continue
            };
            let public_key = match public_key_info(attrs) {
                Ok(public_key) => public_key,
                Err(err) => {
                    warn!(
                        "[{}] Cannot read public key '{key_id}': {err}",
                        self.token_id
                    );
                    None
                }
            };
            public_keys.push((key_id, object_label(attrs), public_key));
        }

        let found = objects.private_keys.iter()
            .chain(public_keys.iter().map(|(id, _, _)| id));
        for key_id in found {
            match self.registry.find_token_and_key(key_id) {
                Ok((token, _)) if token.id == self.token_id => { }
                Ok((token, _)) => {
                    warn!(
                        "[{}] Key '{key_id}' is already known on token '{}'",
                        self.token_id, token.id
                    );
                }
                Err(_) => {
                    info!(
                        "[{}] Found new key '{key_id}' on device",
                        self.token_id
                    );
                    self.registry.add_key(
                        KeyInfo::new(&self.token_id, key_id.as_str())
                    )?;
                }
            }
        }

        let device_ids: HashSet<&String> = objects.private_keys.iter()
            .chain(public_keys.iter().map(|(id, _, _)| id))
            .collect();
        for (key_id, label, public_key) in &public_keys {
            let Ok(key) = self.registry.key(key_id) else { continue };
            if key.token_id != self.token_id {
                continue
            }
            if let Some(label) = label {
                if key.label.as_ref() != Some(label) {
                    self.registry.set_key_label(key_id, label)?;
                }
            }
            if key.public_key.is_none() {
                if let Some(public_key) = public_key {
                    self.registry.set_public_key(key_id, public_key.clone())?;
                    if key.sign_mechanism.is_none() {
                        let mechanism = SignMechanism::for_key(
                            self.rsa_mechanism,
                            public_key_algorithm(public_key)?,
                        );
                        self.registry.set_sign_mechanism(key_id, mechanism)?;
                    }
                }
            }
        }

        let token = self.registry.token(&self.token_id)?;
        for key in &token.keys {
            let available = active && device_ids.contains(&key.id);
            if available != key.available {
                self.registry.set_key_available(&key.id, available)?;
            }
        }

        for (key_id, der) in objects.certs {
            let hash = cert_hash(&der)?;
            if self.registry.cert_by_hash(&hash).is_ok() {
                continue
            }
            if token.key(&key_id).is_none() {
                debug!(
                    "[{}] Ignoring certificate '{hash}' without key",
                    self.token_id
                );
                continue
            }
            info!(
                "[{}] Found certificate '{hash}' for key '{key_id}' on device",
                self.token_id
            );
            self.registry.add_cert(&key_id, CertificateInfo {
                id: hash,
                member_id: None,
                active: true,
                saved_to_configuration: false,
                status: CertStatus::Saved,
                certificate_bytes: der,
                ocsp_bytes: None,
                ocsp_verify_error: None,
            })?;
        }
        Ok(())
    }
}

impl TokenBackend for HardwareBackend {
    fn token_id(&self) -> &str {
        &self.token_id
    }

    fn activate(&mut self, pin: &SecretString) -> SignerEmptyResult {
        let token = self.registry.token(&self.token_id)?;
        if !token.available {
            return Err(Error::device("activate", "token is not present"))
        }
        if token.status == TokenStatus::NotInitialized {
            return Err(Error::TokenNotInitialized(self.token_id.clone()))
        }

        let mut failed_status = None;
        let res = self.management.with_session(|session| {
            login(session, pin).map_err(|err| {
                failed_status = login_status(&err);
                self.error("login", err)
            })?;
            if self.pin_per_signing {
                logout(session).map_err(|err| self.error("logout", err))?;
            }
            Ok(())
        });
        if let Err(err) = res {
            if let Some(status) = failed_status {
                let status = self.sessions.token_info().ok()
                    .and_then(|device| device_status(&device))
                    .unwrap_or(status);
                self.registry.set_token_status(&self.token_id, status)?;
            }
            return Err(err)
        }

        self.pins.set(&self.token_id, pin.clone());
        if self.pool.enabled && !self.pin_per_signing {
            match SessionProvider::pooled(
                &self.token_id,
                self.sessions.clone(),
                self.pins.clone(),
                self.pool.size,
                self.pool.acquire_timeout(),
            ) {
                Ok(pool) => self.signing = Some(pool),
                Err(err) => {
                    error!(
                        "[{}] Cannot create signing session pool: {err}",
                        self.token_id
                    );
                    self.pins.clear(&self.token_id);
                    let _ = self.management.with_session(|session| {
                        logout(session).map_err(|err| {
                            self.error("logout", err)
                        })
                    });
                    return Err(err)
                }
            }
        }

        self.registry.update_token(&self.token_id, |token| {
            token.active = true;
            token.status = TokenStatus::Ok;
            Ok(())
        })?;
        if let Err(err) = self.refresh() {
            warn!("[{}] Cannot list token objects: {err}", self.token_id);
        }
        Ok(())
    }

    fn deactivate(&mut self) -> SignerEmptyResult {
        self.signing = None;
        let res = self.management.with_session(|session| {
            logout(session).map_err(|err| self.error("logout", err))
        });
        if let Err(err) = res {
            warn!("[{}] {err}", self.token_id);
        }
        self.management.close();
        self.pins.clear(&self.token_id);
        self.registry.update_token(&self.token_id, |token| {
            token.active = false;
            for key in token.keys.iter_mut() {
                key.available = false;
            }
            Ok(())
        })
    }

    fn initialize(&mut self, _pin: &SecretString) -> SignerEmptyResult {
        Err(Error::other(format!(
            "hardware token '{}' must be initialized with the tools of \
             its vendor",
            self.token_id
        )))
    }

    fn generate_key(
        &mut self, algorithm: Option<KeyAlgorithm>, label: &str
    ) -> SignerResult<KeyInfo> {
        self.check_writable()?;
        self.check_active()?;
        let algorithm = algorithm.unwrap_or(KeyAlgorithm::Rsa);
        let key_id = random_key_id()?;
        let id = hex::decode(&key_id).map_err(Error::crypto)?;

        let mut public_template = vec![
            Attribute::Token(true),
            Attribute::Private(false),
            Attribute::Verify(true),
            Attribute::Id(id.clone()),
        ];
        let mut private_template = vec![
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Sign(true),
            Attribute::Id(id),
        ];
        if !label.is_empty() {
            public_template.push(Attribute::Label(label.as_bytes().to_vec()));
            private_template.push(Attribute::Label(label.as_bytes().to_vec()));
        }
        let mechanism = match algorithm {
            KeyAlgorithm::Rsa => {
                public_template.push(
                    Attribute::ModulusBits(DEVICE_RSA_BITS.into())
                );
                public_template.push(
                    Attribute::PublicExponent(vec![0x01, 0x00, 0x01])
                );
                Mechanism::RsaPkcsKeyPairGen
            }
            KeyAlgorithm::Ec => {
                public_template.push(Attribute::EcParams(
                    params_for_curve(Nid::X9_62_PRIME256V1)?.to_vec()
                ));
                Mechanism::EccKeyPairGen
            }
        };

        let attrs = self.with_retry("generate key", |session| {
            let (public, _) = session.generate_key_pair(
                &mechanism, &public_template, &private_template
            )?;
            session.get_attributes(public, &PUBLIC_KEY_ATTRIBUTES)
        })?;

        let mut info = KeyInfo::new(&self.token_id, key_id.as_str());
        info.available = true;
        info.public_key = public_key_info(&attrs)?;
        info.sign_mechanism = Some(
            SignMechanism::for_key(self.rsa_mechanism, algorithm)
                .name().to_string()
        );
        if !label.is_empty() {
            info.label = Some(label.to_string());
        }
        self.registry.add_key(info)
    }

    fn delete_key(
        &mut self, key_id: &str, from_device: bool
    ) -> SignerEmptyResult {
        let (token, _) = self.registry.find_token_and_key(key_id)?;
        if token.id != self.token_id {
            return Err(Error::KeyNotFound(key_id.to_string()))
        }
        if !from_device {
            return remove_key_from_conf(&self.registry, key_id)
        }
        self.check_writable()?;
        let id = hex::decode(key_id).map_err(|_| {
            Error::KeyNotFound(key_id.to_string())
        })?;
        self.with_retry("delete key", |session| {
            for handle in session.find_objects(&[Attribute::Id(id.clone())])? {
                session.destroy_object(handle)?;
            }
            Ok(())
        })?;
        self.registry.remove_key(key_id)
    }

    fn delete_cert(&mut self, cert_id: &str) -> SignerEmptyResult {
        let key = self.registry.key_for_cert_id(cert_id)?;
        if key.token_id != self.token_id {
            return Err(Error::CertNotFound(cert_id.to_string()))
        }
        let cert = self.registry.cert(cert_id)?;
        let template = [
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::Value(cert.certificate_bytes.to_vec()),
        ];
        let on_device = self.with_retry("find certificate", |session| {
            session.find_objects(&template)
        })?;
        if !on_device.is_empty() {
            self.check_writable()?;
            self.with_retry("delete certificate", |session| {
                for handle in session.find_objects(&template)? {
                    session.destroy_object(handle)?;
                }
                Ok(())
            })?;
        }
        self.registry.remove_cert(cert_id).map(|_| ())
    }

    fn update_pin(
        &mut self, _old_pin: &SecretString, _new_pin: &SecretString
    ) -> SignerEmptyResult {
        Err(Error::other(format!(
            "the PIN of hardware token '{}' must be changed with the tools \
             of its vendor",
            self.token_id
        )))
    }

    fn refresh(&mut self) -> SignerEmptyResult {
        let device = match self.sessions.token_info() {
            Ok(device) => device,
            Err(err) => {
                self.mark_unavailable()?;
                return Err(self.error("read token info", err))
            }
        };

        let active = self.pins.contains(&self.token_id);
        let flags_status = device_status(&device);
        let read_only = self.module_read_only || device.write_protected();
        self.registry.update_token(&self.token_id, |token| {
            token.available = true;
            token.active = active;
            token.read_only = read_only;
            match flags_status {
                Some(status) => token.status = status,
                None => {
                    if is_flag_status(token.status) {
                        token.status = TokenStatus::Ok;
                    }
                }
            }
            Ok(())
        })?;
        if flags_status == Some(TokenStatus::NotInitialized) {
            return Ok(())
        }

        let objects = self.device_objects(active)?;
        self.reconcile(objects, active)
    }

    fn sign(
        &self, key_id: &str, algorithm: SignAlgorithm, digest: &[u8]
    ) -> SignerResult<Vec<u8>> {
        let key = available_key(&self.registry, &self.token_id, key_id)?;
        let key_algorithm = match key.public_key.as_ref() {
            Some(der) => Some(public_key_algorithm(der)?),
            None => None,
        };
        if key_algorithm.is_some_and(|alg| alg != algorithm.key_algorithm()) {
            return Err(Error::unsupported_algorithm(key_id, algorithm))
        }
        let mechanism = SignMechanism::for_algorithm(
            self.rsa_mechanism, algorithm
        ).ok_or_else(|| Error::unsupported_algorithm(key_id, algorithm))?;
        if digest.len() != algorithm.digest().digest_len() {
            return Err(Error::cannot_sign(
                key_id,
                format!(
                    "digest length {} does not match {algorithm}",
                    digest.len()
                )
            ))
        }

        let (ck_mechanism, data) = match mechanism {
            SignMechanism::RsaPkcs => (
                Mechanism::RsaPkcs,
                digest_info(algorithm.digest(), digest).to_vec(),
            ),
            SignMechanism::RsaPkcsPss => (
                Mechanism::RsaPkcsPss(pss_params(algorithm.digest())),
                digest.to_vec(),
            ),
            SignMechanism::Ecdsa => (Mechanism::Ecdsa, digest.to_vec()),
        };
        let id = hex::decode(key_id).map_err(|_| {
            Error::KeyNotAvailable(key_id.to_string())
        })?;

        let pin = if self.pin_per_signing {
            Some(self.pins.get(&self.token_id).ok_or_else(|| {
                Error::TokenNotActive(self.token_id.clone())
            })?)
        }
        else {
            None
        };

        let signature = self.signing_sessions().with_session(|session| {
            let found = Self::logged_in(session, pin.as_ref(), || {
                let template = [
                    Attribute::Class(ObjectClass::PRIVATE_KEY),
                    Attribute::Id(id.clone()),
                ];
                let Some(handle) = session.find_objects(&template)?
                    .into_iter().next()
                else {
                    return Ok(None)
                };
                if key_algorithm.is_none() {
                    let attrs = session.get_attributes(
                        handle, &[AttributeType::KeyType]
                    )?;
                    let matches = attrs.iter().any(|attr| {
                        matches!(
                            (attr, algorithm.key_algorithm()),
                            (Attribute::KeyType(KeyType::RSA), KeyAlgorithm::Rsa)
                            | (Attribute::KeyType(KeyType::EC), KeyAlgorithm::Ec)
                        )
                    });
                    if !matches {
                        return Ok(Some(Err(
                            Error::unsupported_algorithm(key_id, algorithm)
                        )))
                    }
                }
                session.sign(&ck_mechanism, handle, &data).map(|sig| {
                    Some(Ok(sig))
                })
            }).map_err(|err| self.error("sign", err))?;
            found.unwrap_or_else(|| {
                Err(Error::KeyNotAvailable(key_id.to_string()))
            })
        })?;

        match mechanism {
            SignMechanism::Ecdsa => ecdsa_signature_to_der(&signature),
            _ => Ok(signature),
        }
    }
}


//------------ DeviceObjects -------------------------------------------------

/// The objects found on a token during a refresh.
#[derive(Default)]
struct DeviceObjects {
    /// The hex encoded ids of the private keys.
    private_keys: HashSet<String>,

    /// The attributes of the public keys.
    public_keys: Vec<Vec<Attribute>>,

    /// The certificates with the id of their key.
    certs: Vec<(String, Bytes)>,
}

fn object_id(attrs: &[Attribute]) -> Option<String> {
    attrs.iter().find_map(|attr| match attr {
        Attribute::Id(id) if !id.is_empty() => Some(hex::encode(id)),
        _ => None,
    })
}

fn object_label(attrs: &[Attribute]) -> Option<String> {
    attrs.iter().find_map(|attr| match attr {
        Attribute::Label(label) if !label.is_empty() => {
            Some(String::from_utf8_lossy(label).trim().to_string())
        }
        _ => None,
    })
}

/// Builds the SubjectPublicKeyInfo from the attributes of a public key.
fn public_key_info(attrs: &[Attribute]) -> SignerResult<Option<Bytes>> {
    let (mut modulus, mut exponent, mut params, mut point) =
        (None, None, None, None);
    for attr in attrs {
        match attr {
            Attribute::Modulus(value) => modulus = Some(value),
            Attribute::PublicExponent(value) => exponent = Some(value),
            Attribute::EcParams(value) => params = Some(value),
            Attribute::EcPoint(value) => point = Some(value),
            _ => { }
        }
    }
    match (modulus, exponent, params, point) {
        (Some(modulus), Some(exponent), _, _) => {
            rsa_public_key_info(modulus, exponent).map(Some)
        }
        (_, _, Some(params), Some(point)) => {
            ec_public_key_info(params, point).map(Some)
        }
        _ => Ok(None),
    }
}


//------------ Mechanisms and Signatures -------------------------------------

/// PSS parameters with MGF1 over the same digest and a salt as long as
/// the digest.
fn pss_params(digest: DigestAlgorithm) -> PkcsPssParams {
    let (hash_alg, mgf) = match digest {
        DigestAlgorithm::Sha1 => {
            (MechanismType::SHA1, PkcsMgfType::MGF1_SHA1)
        }
        DigestAlgorithm::Sha256 => {
            (MechanismType::SHA256, PkcsMgfType::MGF1_SHA256)
        }
        DigestAlgorithm::Sha384 => {
            (MechanismType::SHA384, PkcsMgfType::MGF1_SHA384)
        }
        DigestAlgorithm::Sha512 => {
            (MechanismType::SHA512, PkcsMgfType::MGF1_SHA512)
        }
    };
    PkcsPssParams {
        hash_alg,
        mgf,
        s_len: (digest.digest_len() as u64).into(),
    }
}

/// Converts the raw `r || s` signature of CKM_ECDSA into DER.
fn ecdsa_signature_to_der(raw: &[u8]) -> SignerResult<Vec<u8>> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(Error::crypto(format!(
            "malformed ECDSA signature of {} octets", raw.len()
        )))
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    let sig = EcdsaSig::from_private_components(
        BigNum::from_slice(r)?, BigNum::from_slice(s)?
    )?;
    Ok(sig.to_der()?)
}


//------------ Errors --------------------------------------------------------

impl From<Pkcs11Error> for Error {
    fn from(err: Pkcs11Error) -> Self {
        Error::device("PKCS#11", err)
    }
}

/// Converts a PKCS#11 error into a signer error.
fn device_error(
    token_id: &str, context: &'static str, err: Pkcs11Error
) -> Error {
    match err {
        Pkcs11Error::Pkcs11(RvError::PinIncorrect, _) => {
            Error::PinIncorrect(token_id.to_string())
        }
        Pkcs11Error::Pkcs11(RvError::TokenWriteProtected, _) => {
            Error::TokenReadOnly(token_id.to_string())
        }
        Pkcs11Error::Pkcs11(RvError::UserNotLoggedIn, _) => {
            Error::TokenNotActive(token_id.to_string())
        }
        err => {
            if is_transient_error(&err) {
                warn!("[{token_id}] Device unavailable: {err}");
            }
            Error::device(context, err)
        }
    }
}

/// Returns the token status after a failed login.
fn login_status(err: &Pkcs11Error) -> Option<TokenStatus> {
    match err {
        Pkcs11Error::Pkcs11(rv, _) => match rv {
            RvError::PinIncorrect => Some(TokenStatus::UserPinIncorrect),
            RvError::PinLocked => Some(TokenStatus::UserPinLocked),
            RvError::PinExpired => Some(TokenStatus::UserPinExpired),
            RvError::PinInvalid | RvError::PinLenRange => {
                Some(TokenStatus::UserPinInvalid)
            }
            _ => None,
        },
        _ => None,
    }
}

/// Returns whether a status is derived from the token flags.
fn is_flag_status(status: TokenStatus) -> bool {
    matches!(
        status,
        TokenStatus::NotInitialized
            | TokenStatus::UserPinLocked
            | TokenStatus::UserPinFinalTry
            | TokenStatus::UserPinCountLow
    )
}

/// Returns whether an operation failing with this error may succeed when
/// tried again shortly.
///
/// Errors that need an operator to change something on the device are
/// not transient.
fn is_transient_error(err: &Pkcs11Error) -> bool {
    match err {
        Pkcs11Error::Pkcs11(rv, _) => matches!(
            rv,
            RvError::HostMemory
                | RvError::SlotIdInvalid
                | RvError::GeneralError
                | RvError::FunctionFailed
                | RvError::DeviceError
                | RvError::DeviceMemory
                | RvError::DeviceRemoved
                | RvError::OperationActive
                | RvError::SessionClosed
                | RvError::SessionCount
                | RvError::SessionReadOnlyExists
                | RvError::SessionReadWriteSoExists
                | RvError::TokenNotPresent
                | RvError::UserAnotherAlreadyLoggedIn
                | RvError::UserTooManyTypes
                | RvError::StateUnsaveable
        ),
        _ => false,
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::crypto::keys::parse_public_key_info;
    use crate::commons::test::ec_key;
    use cryptoki::context::Function;
    use openssl::ec::EcKey;

    fn rv(err: RvError) -> Pkcs11Error {
        Pkcs11Error::Pkcs11(err, Function::Login)
    }

    #[test]
    fn transient_errors() {
        assert!(is_transient_error(&rv(RvError::DeviceRemoved)));
        assert!(is_transient_error(&rv(RvError::SessionCount)));
        assert!(!is_transient_error(&rv(RvError::PinIncorrect)));
        assert!(!is_transient_error(&rv(RvError::KeyHandleInvalid)));
        assert!(!is_transient_error(&rv(RvError::TokenWriteProtected)));
    }

    #[test]
    fn device_errors_map_to_signer_errors() {
        assert!(matches!(
            device_error("t", "login", rv(RvError::PinIncorrect)),
            Error::PinIncorrect(id) if id == "t"
        ));
        assert!(matches!(
            device_error("t", "x", rv(RvError::TokenWriteProtected)),
            Error::TokenReadOnly(_)
        ));
        assert!(matches!(
            device_error("t", "x", rv(RvError::UserNotLoggedIn)),
            Error::TokenNotActive(_)
        ));
        assert!(matches!(
            device_error("t", "sign", rv(RvError::DeviceError)),
            Error::Device { .. }
        ));
    }

    #[test]
    fn failed_logins_set_status() {
        assert_eq!(
            login_status(&rv(RvError::PinIncorrect)),
            Some(TokenStatus::UserPinIncorrect)
        );
        assert_eq!(
            login_status(&rv(RvError::PinLocked)),
            Some(TokenStatus::UserPinLocked)
        );
        assert_eq!(
            login_status(&rv(RvError::PinLenRange)),
            Some(TokenStatus::UserPinInvalid)
        );
        assert_eq!(login_status(&rv(RvError::DeviceError)), None);
    }

    #[test]
    fn raw_ecdsa_signature_becomes_der() {
        let key = ec_key();
        let digest = DigestAlgorithm::Sha256.digest(b"data").unwrap();
        let sig = EcdsaSig::sign(&digest, &key.ec_key().unwrap()).unwrap();

        // Fixed width r || s as returned by CKM_ECDSA.
        let mut raw = sig.r().to_vec_padded(32).unwrap();
        raw.extend(sig.s().to_vec_padded(32).unwrap());

        let der = ecdsa_signature_to_der(&raw).unwrap();
        let public = parse_public_key_info(
            &key.public_key_to_der().unwrap()
        ).unwrap();
        let public: EcKey<_> = public.ec_key().unwrap();
        let parsed = EcdsaSig::from_der(&der).unwrap();
        assert!(parsed.verify(&digest, &public).unwrap());

        assert!(ecdsa_signature_to_der(&raw[1..]).is_err());
        assert!(ecdsa_signature_to_der(&[]).is_err());
    }

    #[test]
    fn public_keys_from_attributes() {
        let key = ec_key();
        let ec = key.ec_key().unwrap();
        let mut ctx = openssl::bn::BigNumContext::new().unwrap();
        let point = ec.public_key().to_bytes(
            ec.group(),
            openssl::ec::PointConversionForm::UNCOMPRESSED,
            &mut ctx,
        ).unwrap();
        let attrs = vec![
            Attribute::Id(vec![0xab, 0xcd]),
            Attribute::Label(b"signing ".to_vec()),
            Attribute::EcParams(
                params_for_curve(Nid::X9_62_PRIME256V1).unwrap().to_vec()
            ),
            Attribute::EcPoint(point),
        ];
        assert_eq!(object_id(&attrs).as_deref(), Some("abcd"));
        assert_eq!(object_label(&attrs).as_deref(), Some("signing"));
        assert_eq!(
            public_key_info(&attrs).unwrap().unwrap().as_ref(),
            key.public_key_to_der().unwrap().as_slice()
        );
        assert_eq!(public_key_info(&attrs[..2]).unwrap(), None);
    }
}
