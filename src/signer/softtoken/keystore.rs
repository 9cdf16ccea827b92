//! The encrypted on-disk storage of the software token.
//!
//! Every key lives in its own PKCS#12 file `<key-id>.p12`, encrypted with
//! the token PIN. A further file, `.softtoken.p12`, holds a throw-away
//! key encrypted the same way and is used to check a PIN.
//!
//! Changing the PIN rewrites every file. This happens in steps that each
//! leave a recoverable state behind: the new files are first written into
//! a staging directory next to the key directory, the key directory is
//! then renamed to a backup, the staging directory takes its place, and
//! finally the backup is removed. [`KeyStore::open`] repairs whatever an
//! interrupted rotation left behind.

use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info, warn};
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, PKeyRef, Private};
use secrecy::{ExposeSecret, SecretString};

use crate::commons::error::Error;
use crate::commons::util::file;
use crate::commons::{SignerEmptyResult, SignerResult};
use crate::constants::{
    SOFT_TOKEN_BACKUP_DIR, SOFT_TOKEN_ID, SOFT_TOKEN_KEY_ALIAS,
    SOFT_TOKEN_KEY_EXT, SOFT_TOKEN_PIN_FILE, SOFT_TOKEN_TMP_PREFIX,
};


//------------ KeyStore ------------------------------------------------------

#[derive(Clone, Debug)]
pub struct KeyStore {
    /// The key directory.
    dir: PathBuf,

    /// The directory holding the key directory and its backups.
    parent: PathBuf,
}

impl KeyStore {
    /// Opens the key store in `dir`, recovering from an interrupted PIN
    /// rotation.
    pub fn open(dir: PathBuf) -> SignerResult<Self> {
        let parent = dir.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        file::create_dir(&parent)?;
        let store = KeyStore { dir, parent };
        store.recover()?;
        Ok(store)
    }

    fn recover(&self) -> SignerEmptyResult {
        let backup = self.backup_dir();
        if backup.exists() {
            if self.dir.exists() {
                warn!(
                    "Software token backup '{}' exists next to the key \
                     directory, leaving it untouched",
                    backup.display()
                );
            }
            else {
                warn!(
                    "Software token key directory missing, restoring \
                     backup '{}'",
                    backup.display()
                );
                file::rename(&backup, &self.dir)?;
            }
        }
        for tmp in file::list_with_prefix(&self.parent, SOFT_TOKEN_TMP_PREFIX)? {
            info!("Removing stale staging directory '{}'", tmp.display());
            file::remove_dir_all(&tmp)?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn backup_dir(&self) -> PathBuf {
        self.parent.join(SOFT_TOKEN_BACKUP_DIR)
    }

    fn key_path(dir: &Path, key_id: &str) -> PathBuf {
        dir.join(format!("{key_id}.{SOFT_TOKEN_KEY_EXT}"))
    }

    pub fn is_initialized(&self) -> bool {
        self.dir.join(SOFT_TOKEN_PIN_FILE).is_file()
    }
}

/// # PIN handling
impl KeyStore {
    /// Initializes the key store with a PIN.
    pub fn init_pin(&self, pin: &SecretString) -> SignerEmptyResult {
        if self.is_initialized() {
            return Err(Error::other("Software token already initialized"))
        }
        file::create_dir(&self.dir)?;
        Self::write_pin_file(&self.dir, pin)?;
        info!("Initialized software token in '{}'", self.dir.display());
        Ok(())
    }

    /// Checks that `pin` opens the key store.
    pub fn verify_pin(&self, pin: &SecretString) -> SignerEmptyResult {
        if !self.is_initialized() {
            return Err(Error::TokenNotInitialized(SOFT_TOKEN_ID.into()))
        }
        let der = file::read(&self.dir.join(SOFT_TOKEN_PIN_FILE))?;
        decrypt(&der, pin).map(|_| ())
    }

    fn write_pin_file(dir: &Path, pin: &SecretString) -> SignerEmptyResult {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let key = PKey::from_ec_key(EcKey::generate(&group)?)?;
        let der = encrypt(&key, pin)?;
        file::save_atomic(&der, &dir.join(SOFT_TOKEN_PIN_FILE))
    }
}

/// # Keys
impl KeyStore {
    pub fn write_key(
        &self, key_id: &str, key: &PKeyRef<Private>, pin: &SecretString
    ) -> SignerEmptyResult {
        let der = encrypt(key, pin)?;
        file::save_atomic(&der, &Self::key_path(&self.dir, key_id))?;
        debug!("Stored software key '{key_id}'");
        Ok(())
    }

    pub fn read_key(
        &self, key_id: &str, pin: &SecretString
    ) -> SignerResult<PKey<Private>> {
        let path = Self::key_path(&self.dir, key_id);
        let der = file::read_opt(&path)?.ok_or_else(|| {
            Error::KeyNotAvailable(key_id.to_string())
        })?;
        decrypt(&der, pin)
    }

    pub fn has_key(&self, key_id: &str) -> bool {
        Self::key_path(&self.dir, key_id).is_file()
    }

    pub fn delete_key(&self, key_id: &str) -> SignerEmptyResult {
        file::delete_file(&Self::key_path(&self.dir, key_id))
    }

    /// Returns the ids of all keys in the store.
    pub fn list_key_ids(&self) -> SignerResult<Vec<String>> {
        file::list_stems_with_ext(&self.dir, SOFT_TOKEN_KEY_EXT)
    }
}

/// # PIN rotation
impl KeyStore {
    /// Re-encrypts the whole key store under a new PIN.
    ///
    /// Once the new key store is in place, the rotation has succeeded
    /// even if the backup cannot be removed. On failure before that, the
    /// old key store is put back or, if that fails too, left as a backup
    /// for [`KeyStore::open`] to restore.
    pub fn rotate_pin(
        &self, old_pin: &SecretString, new_pin: &SecretString
    ) -> SignerEmptyResult {
        self.verify_pin(old_pin)?;
        let staged = self.stage(old_pin, new_pin)?;
        self.backup()?;
        self.commit(&staged, Self::finish)
    }

    /// Swaps in the staged key store and removes the backup.
    fn commit(
        &self,
        staged: &Path,
        finish: impl FnOnce(&Self) -> SignerEmptyResult,
    ) -> SignerEmptyResult {
        if let Err(err) = self.swap(staged) {
            if let Err(restore) = file::rename(&self.backup_dir(), &self.dir) {
                warn!("Cannot restore software token backup: {restore}");
            }
            let _ = file::remove_dir_all(staged);
            return Err(err)
        }
        info!("Software token PIN changed");
        if let Err(err) = finish(self) {
            warn!("Cannot remove software token backup: {err}");
        }
        Ok(())
    }

    /// Writes all files encrypted with the new PIN to a staging directory.
    ///
    /// The staging directory is removed again if this fails.
    pub fn stage(
        &self, old_pin: &SecretString, new_pin: &SecretString
    ) -> SignerResult<PathBuf> {
        let staged = self.parent.join(format!(
            "{SOFT_TOKEN_TMP_PREFIX}{}", uuid::Uuid::new_v4()
        ));
        let res = file::create_dir(&staged).and_then(|_| {
            for key_id in self.list_key_ids()? {
                let key = self.read_key(&key_id, old_pin)?;
                let der = encrypt(&key, new_pin)?;
                file::save_atomic(&der, &Self::key_path(&staged, &key_id))?;
            }
            Self::write_pin_file(&staged, new_pin)
        });
        match res {
            Ok(()) => Ok(staged),
            Err(err) => {
                let _ = file::remove_dir_all(&staged);
                Err(err)
            }
        }
    }

    /// Moves the current key directory to the backup location.
    ///
    /// A backup left over from an earlier rotation is kept under a time
    /// stamped name.
    pub fn backup(&self) -> SignerEmptyResult {
        let backup = self.backup_dir();
        if backup.exists() {
            let old = self.parent.join(format!(
                "{SOFT_TOKEN_BACKUP_DIR}-{}",
                Utc::now().format("%Y%m%d%H%M%S")
            ));
            warn!(
                "Moving existing software token backup to '{}'",
                old.display()
            );
            file::rename(&backup, &old)?;
        }
        file::rename(&self.dir, &backup)
    }

    /// Moves the staging directory into place of the key directory.
    pub fn swap(&self, staged: &Path) -> SignerEmptyResult {
        file::rename(staged, &self.dir)
    }

    /// Removes the backup after a completed rotation.
    pub fn finish(&self) -> SignerEmptyResult {
        file::remove_dir_all(&self.backup_dir())
    }
}

fn encrypt(
    key: &PKeyRef<Private>, pin: &SecretString
) -> SignerResult<Vec<u8>> {
    let mut builder = Pkcs12::builder();
    builder.name(SOFT_TOKEN_KEY_ALIAS).pkey(key);
    Ok(builder.build2(pin.expose_secret())?.to_der()?)
}

fn decrypt(der: &[u8], pin: &SecretString) -> SignerResult<PKey<Private>> {
    let parsed = Pkcs12::from_der(der)
        .map_err(|err| Error::crypto(format!("invalid keystore: {err}")))?
        .parse2(pin.expose_secret())
        .map_err(|_| Error::PinIncorrect(SOFT_TOKEN_ID.into()))?;
    parsed.pkey.ok_or_else(|| Error::crypto("keystore holds no key"))
}


//------------ Tests ---------------------------------------------------------
