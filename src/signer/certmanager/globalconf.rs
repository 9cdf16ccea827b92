//! Access to the trust settings of the federation.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use log::info;
use openssl::x509::X509;

use crate::commons::error::Error;
use crate::commons::util::file;
use crate::commons::SignerResult;
use crate::daemon::config::Config;


//------------ GlobalConf ----------------------------------------------------

/// The parts of the global configuration needed to verify certificates.
pub trait GlobalConf: fmt::Debug + Send + Sync {
    fn instance_identifier(&self) -> &str;

    /// The certificates trusted as roots of certificate chains.
    fn trust_anchors(&self) -> &[X509];

    /// Intermediate CA certificates that may be needed to build a chain.
    fn intermediate_cas(&self) -> &[X509];

    /// How old the `thisUpdate` of an OCSP response may be.
    fn ocsp_freshness(&self) -> Duration;

    /// Whether an OCSP response past its `nextUpdate` is rejected.
    fn verify_ocsp_next_update(&self) -> bool;
}


//------------ StaticGlobalConf ----------------------------------------------

/// A global configuration fixed at startup.
pub struct StaticGlobalConf {
    instance_identifier: String,
    trust_anchors: Vec<X509>,
    intermediate_cas: Vec<X509>,
    ocsp_freshness: Duration,
    verify_ocsp_next_update: bool,
}

impl StaticGlobalConf {
    pub fn new(
        instance_identifier: &str,
        trust_anchors: Vec<X509>,
        intermediate_cas: Vec<X509>,
        ocsp_freshness: Duration,
        verify_ocsp_next_update: bool,
    ) -> Self {
        StaticGlobalConf {
            instance_identifier: instance_identifier.to_string(),
            trust_anchors,
            intermediate_cas,
            ocsp_freshness,
            verify_ocsp_next_update,
        }
    }

    /// Loads the certificates named in the configuration.
    pub fn from_config(config: &Config) -> SignerResult<Self> {
        let conf = &config.globalconf;
        let trust_anchors = load_certs(&conf.trust_anchors)?;
        let intermediate_cas = load_certs(&conf.intermediate_cas)?;
        info!(
            "Loaded {} trust anchors and {} intermediate CAs for instance \
             '{}'",
            trust_anchors.len(),
            intermediate_cas.len(),
            conf.instance_identifier
        );
        Ok(Self::new(
            &conf.instance_identifier,
            trust_anchors,
            intermediate_cas,
            config.ocsp_freshness(),
            config.verify_ocsp_next_update,
        ))
    }
}

/// Loads PEM or DER certificates, a PEM file may hold several.
fn load_certs<P: AsRef<Path>>(paths: &[P]) -> SignerResult<Vec<X509>> {
    let mut res = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let bytes = file::read(path)?;
        match X509::stack_from_pem(&bytes) {
            Ok(certs) if !certs.is_empty() => res.extend(certs),
            _ => {
                let cert = X509::from_der(&bytes).map_err(|err| {
                    Error::invalid_cert(format!(
                        "cannot read '{}': {err}", path.display()
                    ))
                })?;
                res.push(cert);
            }
        }
    }
    Ok(res)
}

impl GlobalConf for StaticGlobalConf {
    fn instance_identifier(&self) -> &str {
        &self.instance_identifier
    }

    fn trust_anchors(&self) -> &[X509] {
        &self.trust_anchors
    }

    fn intermediate_cas(&self) -> &[X509] {
        &self.intermediate_cas
    }

    fn ocsp_freshness(&self) -> Duration {
        self.ocsp_freshness
    }

    fn verify_ocsp_next_update(&self) -> bool {
        self.verify_ocsp_next_update
    }
}

impl fmt::Debug for StaticGlobalConf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StaticGlobalConf")
            .field("instance_identifier", &self.instance_identifier)
            .field("trust_anchors", &self.trust_anchors.len())
            .field("intermediate_cas", &self.intermediate_cas.len())
            .field("ocsp_freshness", &self.ocsp_freshness)
            .finish()
    }
}


//------------ Tests ---------------------------------------------------------
