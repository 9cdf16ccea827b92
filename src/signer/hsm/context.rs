use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use cryptoki::context::{CInitializeArgs, Pkcs11};
use lazy_static::lazy_static;
use log::{error, info};

use crate::commons::error::Error;
use crate::commons::SignerResult;


lazy_static! {
    /// The loaded PKCS#11 libraries by file name.
    ///
    /// A library must be initialized only once per process, however many
    /// modules refer to it. Two paths with the same file name are taken to
    /// be the same library, so that different copies of a library are
    /// never loaded side by side.
    static ref CONTEXTS: RwLock<HashMap<String, Arc<Pkcs11Context>>> = {
        RwLock::new(HashMap::new())
    };
}


//------------ Pkcs11Context -------------------------------------------------

/// A loaded and initialized PKCS#11 library.
#[derive(Debug)]
pub struct Pkcs11Context {
    lib_file_name: String,
    pkcs11: Pkcs11,
}

impl Pkcs11Context {
    /// Returns the context for a library, loading it if necessary.
    pub fn get_or_load(lib_path: &Path) -> SignerResult<Arc<Self>> {
        let lib_file_name = lib_path.file_name()
            .ok_or_else(|| Error::device(
                "load library",
                format!(
                    "PKCS#11 library path '{}' does not point to a file",
                    lib_path.display()
                ),
            ))?
            .to_string_lossy()
            .to_string();

        let mut contexts = CONTEXTS.write()
            .unwrap_or_else(|err| err.into_inner());
        if let Some(ctx) = contexts.get(&lib_file_name) {
            return Ok(ctx.clone())
        }

        let pkcs11 = Pkcs11::new(lib_path).map_err(|err| {
            error!(
                "Failed to load PKCS#11 library '{}': {}",
                lib_path.display(), err
            );
            Error::device("load library", err)
        })?;
        pkcs11.initialize(CInitializeArgs::OsThreads).map_err(|err| {
            error!(
                "Failed to initialize PKCS#11 library '{}': {}",
                lib_file_name, err
            );
            Error::device("initialize library", err)
        })?;
        info!("Loaded PKCS#11 library '{}'", lib_path.display());

        let ctx = Arc::new(Pkcs11Context {
            lib_file_name: lib_file_name.clone(),
            pkcs11,
        });
        contexts.insert(lib_file_name, ctx.clone());
        Ok(ctx)
    }

    pub fn lib_file_name(&self) -> &str {
        &self.lib_file_name
    }

    pub fn pkcs11(&self) -> &Pkcs11 {
        &self.pkcs11
    }
}
