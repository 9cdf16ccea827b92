//! Token PINs held in memory.
//!
//! PINs only ever live in [`SecretString`]s. They are never written to
//! disk and never appear in log output.

use std::collections::HashMap;
use std::sync::RwLock;

use log::debug;
use secrecy::{ExposeSecret, SecretString};

use crate::commons::error::Error;
use crate::commons::SignerEmptyResult;


//------------ PinVault ------------------------------------------------------

/// The PINs of the currently logged in tokens.
#[derive(Debug, Default)]
pub struct PinVault {
    pins: RwLock<HashMap<String, SecretString>>,
}

impl PinVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token_id: &str, pin: SecretString) {
        debug!("Storing PIN for token '{token_id}'");
        self.pins.write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(token_id.to_string(), pin);
    }

    pub fn get(&self, token_id: &str) -> Option<SecretString> {
        self.pins.read()
            .unwrap_or_else(|err| err.into_inner())
            .get(token_id)
            .map(|pin| SecretString::new(pin.expose_secret().clone()))
    }

    pub fn contains(&self, token_id: &str) -> bool {
        self.pins.read()
            .unwrap_or_else(|err| err.into_inner())
            .contains_key(token_id)
    }

    /// Forgets the PIN of a token. The secret is zeroed on drop.
    pub fn clear(&self, token_id: &str) {
        if self.pins.write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(token_id)
            .is_some()
        {
            debug!("Cleared PIN for token '{token_id}'");
        }
    }
}


//------------ TokenPinPolicy ------------------------------------------------

/// The requirements for a new software token PIN.
///
/// A PIN must consist of printable ASCII characters only, be at least
/// [`MIN_LENGTH`](Self::MIN_LENGTH) characters long and contain at least
/// three of: lower case letters, upper case letters, digits, and other
/// characters.
#[derive(Clone, Copy, Debug)]
pub struct TokenPinPolicy;

impl TokenPinPolicy {
    pub const MIN_LENGTH: usize = 10;
    pub const MIN_CHAR_CLASSES: usize = 3;

    pub fn check(pin: &SecretString) -> SignerEmptyResult {
        let pin = pin.expose_secret();

        if !pin.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
            return Err(Error::PinPolicyViolation(
                "only printable ASCII characters are allowed".into()
            ))
        }
        if pin.chars().count() < Self::MIN_LENGTH {
            return Err(Error::PinPolicyViolation(format!(
                "must be at least {} characters long", Self::MIN_LENGTH
            )))
        }

        let classes = [
            pin.chars().any(|c| c.is_ascii_lowercase()),
            pin.chars().any(|c| c.is_ascii_uppercase()),
            pin.chars().any(|c| c.is_ascii_digit()),
            pin.chars().any(|c| !c.is_ascii_alphanumeric()),
        ];
        if classes.iter().filter(|used| **used).count()
            < Self::MIN_CHAR_CLASSES
        {
            return Err(Error::PinPolicyViolation(format!(
                "must contain characters from at least {} of the classes \
                 lower case, upper case, digits and other",
                Self::MIN_CHAR_CLASSES
            )))
        }
        Ok(())
    }
}


//------------ Tests ---------------------------------------------------------
