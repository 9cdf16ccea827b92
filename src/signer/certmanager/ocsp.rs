//! OCSP responses and certificate chain verification.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bytes::Bytes;
use log::{debug, info, warn};
use openssl::hash::MessageDigest;
use openssl::ocsp::{
    OcspCertId, OcspCertStatus, OcspFlag, OcspResponse, OcspResponseStatus,
};
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::{X509, X509Ref, X509StoreContext};

use crate::commons::crypto::x509::{cert_der, cert_hash};
use crate::commons::error::Error;
use crate::commons::util::file;
use crate::commons::{SignerEmptyResult, SignerResult};

use super::globalconf::GlobalConf;

/// The allowed clock difference to OCSP responders.
const MAX_CLOCK_SKEW_SECS: u32 = 300;

/// Leeway that effectively disables the `nextUpdate` check.
const IGNORE_NEXT_UPDATE_SECS: u32 = 10 * 365 * 86_400;


//------------ OcspCache -----------------------------------------------------

/// Holds the latest OCSP response per certificate.
///
/// Responses are keyed by the hex encoded SHA-1 hash of the certificate.
pub trait OcspCache: fmt::Debug + Send + Sync {
    fn get(&self, cert_hash: &str) -> Option<Bytes>;

    fn set(&self, cert_hash: &str, response: Bytes) -> SignerEmptyResult;
}


//------------ OcspResponseCache ---------------------------------------------

#[derive(Debug, Default)]
pub struct OcspResponseCache {
    responses: RwLock<HashMap<String, Bytes>>,

    /// Where responses are kept across restarts, if anywhere.
    dir: Option<PathBuf>,
}

impl OcspResponseCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a cache backed by `<hash>.der` files in `dir`.
    pub fn open(dir: &Path) -> SignerResult<Self> {
        file::create_dir(dir)?;
        let mut responses = HashMap::new();
        for hash in file::list_stems_with_ext(dir, "der")? {
            let path = dir.join(format!("{hash}.der"));
            responses.insert(hash, file::read(&path)?);
        }
        info!(
            "Loaded {} cached OCSP responses from '{}'",
            responses.len(), dir.display()
        );
        Ok(OcspResponseCache {
            responses: RwLock::new(responses),
            dir: Some(dir.to_path_buf()),
        })
    }
}

impl OcspCache for OcspResponseCache {
    fn get(&self, cert_hash: &str) -> Option<Bytes> {
        self.responses.read()
            .unwrap_or_else(|err| err.into_inner())
            .get(&cert_hash.to_ascii_lowercase())
            .cloned()
    }

    fn set(&self, cert_hash: &str, response: Bytes) -> SignerEmptyResult {
        let cert_hash = cert_hash.to_ascii_lowercase();
        if OcspResponse::from_der(&response).is_err() {
            return Err(Error::other(format!(
                "Invalid OCSP response for certificate '{cert_hash}'"
            )))
        }
        if let Some(dir) = self.dir.as_ref() {
            file::save_atomic(&response, &dir.join(format!("{cert_hash}.der")))?;
        }
        debug!("Cached OCSP response for certificate '{cert_hash}'");
        self.responses.write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(cert_hash, response);
        Ok(())
    }
}


//------------ Verification --------------------------------------------------

/// Builds and verifies the chain of a certificate up to a trust anchor.
///
/// Returns the chain starting with the certificate itself and ending
/// with the trust anchor.
pub fn verify_chain(
    conf: &dyn GlobalConf, cert: &X509Ref
) -> SignerResult<Vec<X509>> {
    let store = trust_store(conf.trust_anchors())?;
    let mut untrusted = Stack::new()?;
    for ca in conf.intermediate_cas() {
        untrusted.push(ca.clone())?;
    }

    let mut ctx = X509StoreContext::new()?;
    ctx.init(&store, cert, &untrusted, |ctx| {
        if !ctx.verify_cert()? {
            return Ok(Err(Error::invalid_cert(format!(
                "chain verification failed: {}",
                ctx.error().error_string()
            ))))
        }
        Ok(Ok(ctx.chain()
            .map(|chain| chain.iter().map(X509Ref::to_owned).collect())
            .unwrap_or_default()))
    })?
}

/// Verifies OCSP responses for every certificate of a chain but the root.
///
/// The chain must have been built by [`verify_chain`].
pub fn verify_chain_ocsp(
    conf: &dyn GlobalConf, cache: &dyn OcspCache, chain: &[X509]
) -> SignerEmptyResult {
    for pair in chain.windows(2) {
        let (subject, issuer) = (&pair[0], &pair[1]);
        let hash = cert_hash(&cert_der(subject)?)?;
        let response = cache.get(&hash).ok_or_else(|| {
            Error::invalid_cert(format!(
                "no OCSP response for certificate '{hash}'"
            ))
        })?;
        verify_ocsp(conf, subject, issuer, &response).map_err(|err| {
            Error::invalid_cert(format!(
                "OCSP verification failed for certificate '{hash}': {err}"
            ))
        })?;
    }
    Ok(())
}

/// Verifies that an OCSP response is signed by the issuer, current and
/// says the certificate is good.
pub fn verify_ocsp(
    conf: &dyn GlobalConf,
    subject: &X509Ref,
    issuer: &X509Ref,
    response: &[u8],
) -> Result<(), String> {
    let response = OcspResponse::from_der(response)
        .map_err(|err| format!("cannot parse response: {err}"))?;
    if response.status() != OcspResponseStatus::SUCCESSFUL {
        return Err(format!("response status {}", response.status().as_raw()))
    }
    let basic = response.basic()
        .map_err(|err| format!("no basic response: {err}"))?;

    let mut certs = Stack::new().map_err(|err| err.to_string())?;
    certs.push(issuer.to_owned()).map_err(|err| err.to_string())?;
    let mut trusted: Vec<X509> = conf.trust_anchors().to_vec();
    trusted.push(issuer.to_owned());
    let store = trust_store(&trusted).map_err(|err| err.to_string())?;
    basic.verify(&certs, &store, OcspFlag::empty())
        .map_err(|err| format!("invalid signature: {err}"))?;

    let id = OcspCertId::from_cert(MessageDigest::sha1(), subject, issuer)
        .map_err(|err| err.to_string())?;
    let status = basic.find_status(&id)
        .ok_or_else(|| "response does not cover the certificate".to_string())?;

    let freshness = u32::try_from(conf.ocsp_freshness().as_secs())
        .unwrap_or(u32::MAX);
    let leeway = if conf.verify_ocsp_next_update() {
        MAX_CLOCK_SKEW_SECS
    }
    else {
        IGNORE_NEXT_UPDATE_SECS
    };
    status.check_validity(leeway, Some(freshness))
        .map_err(|_| "response is not current".to_string())?;

    if status.status == OcspCertStatus::GOOD {
        Ok(())
    }
    else if status.status == OcspCertStatus::REVOKED {
        Err("certificate is revoked".into())
    }
    else {
        Err("certificate status is unknown".into())
    }
}

fn trust_store(anchors: &[X509]) -> Result<X509Store, Error> {
    let mut builder = X509StoreBuilder::new()?;
    for anchor in anchors {
        if let Err(err) = builder.add_cert(anchor.clone()) {
            warn!("Ignoring unusable trust anchor: {err}");
        }
    }
    Ok(builder.build())
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::api::KeyUsage;
    use crate::commons::test::{ocsp_cache, rsa_key, test_under_tmp, TestCa};

    fn member_cert(ca: &TestCa) -> X509 {
        let der = ca.issue(&rsa_key(), "CN=member", Some(KeyUsage::Signing));
        X509::from_der(&der).unwrap()
    }

    #[test]
    fn chain_to_trust_anchor() {
        let ca = TestCa::new("C=EE, O=Test, CN=Root");
        let cert = member_cert(&ca);
        let chain = verify_chain(ca.global_conf().as_ref(), &cert).unwrap();
        assert_eq!(chain.len(), 2);

        let other = TestCa::new("CN=Other");
        let err = verify_chain(other.global_conf().as_ref(), &cert);
        assert!(err.is_err());
    }

    #[test]
    fn fresh_good_response_verifies() {
        let ca = TestCa::new("CN=Root");
        let conf = ca.global_conf();
        let cert = member_cert(&ca);
        let der = cert.to_der().unwrap();

        let fresh = ca.ocsp_fresh(&der);
        verify_ocsp(conf.as_ref(), &cert, &ca.cert, &fresh).unwrap();

        let expired = ca.ocsp_expired(&der);
        assert!(verify_ocsp(conf.as_ref(), &cert, &ca.cert, &expired).is_err());

        let other = member_cert(&ca);
        assert!(verify_ocsp(conf.as_ref(), &other, &ca.cert, &fresh).is_err());
    }

    #[test]
    fn chain_ocsp_needs_cached_response() {
        let ca = TestCa::new("CN=Root");
        let conf = ca.global_conf();
        let cache = ocsp_cache();
        let cert = member_cert(&ca);
        let der = cert.to_der().unwrap();
        let chain = verify_chain(conf.as_ref(), &cert).unwrap();

        assert!(
            verify_chain_ocsp(conf.as_ref(), cache.as_ref(), &chain).is_err()
        );
        cache.set(&cert_hash(&der).unwrap(), ca.ocsp_fresh(&der)).unwrap();
        verify_chain_ocsp(conf.as_ref(), cache.as_ref(), &chain).unwrap();
    }

    #[test]
    fn disk_cache_survives_reopen() {
        test_under_tmp(|dir| {
            let ca = TestCa::new("CN=Root");
            let der = member_cert(&ca).to_der().unwrap();
            let hash = cert_hash(&der).unwrap();

            let cache = OcspResponseCache::open(&dir).unwrap();
            assert!(cache.set(&hash, Bytes::from_static(b"junk")).is_err());
            cache.set(&hash, ca.ocsp_fresh(&der)).unwrap();

            let cache = OcspResponseCache::open(&dir).unwrap();
            assert!(cache.get(&hash.to_ascii_uppercase()).is_some());
        })
    }
}
