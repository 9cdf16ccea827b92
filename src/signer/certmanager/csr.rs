//! Building PKCS#10 certification requests for token keys.

use bytes::Bytes;
use log::debug;
use openssl::x509::X509Req;

use crate::commons::api::{CertRequestFormat, KeyUsage};
use crate::commons::crypto::asn1;
use crate::commons::crypto::x509::parse_name;
use crate::commons::crypto::SignAlgorithm;
use crate::commons::error::Error;
use crate::commons::SignerResult;


//------------ CertRequestBuilder --------------------------------------------

/// Builds a certification request over the public key of a token key.
///
/// The private key never passes through here. The builder computes the
/// digest of the request and leaves the signature to a closure, which
/// hands it to the token.
#[derive(Clone, Debug)]
pub struct CertRequestBuilder<'a> {
    subject_name: &'a str,
    subject_alt_name: Option<&'a str>,
    usage: KeyUsage,
    public_key_info: &'a [u8],
}

impl<'a> CertRequestBuilder<'a> {
    pub fn new(
        subject_name: &'a str, usage: KeyUsage, public_key_info: &'a [u8]
    ) -> Self {
        CertRequestBuilder {
            subject_name,
            subject_alt_name: None,
            usage,
            public_key_info,
        }
    }

    pub fn subject_alt_name(mut self, name: Option<&'a str>) -> Self {
        self.subject_alt_name = name.filter(|name| !name.is_empty());
        self
    }

    /// Creates the DER encoded request.
    ///
    /// `sign` receives the digest of the CertificationRequestInfo and
    /// must return the signature over it using `algorithm`.
    pub fn build<F>(
        &self, algorithm: SignAlgorithm, sign: F
    ) -> SignerResult<Bytes>
    where
        F: FnOnce(&[u8]) -> SignerResult<Vec<u8>>,
    {
        let subject = parse_name(self.subject_name)?;
        let mut extensions = vec![asn1::key_usage_extension(self.usage)];
        if let Some(name) = self.subject_alt_name {
            extensions.push(asn1::subject_alt_name_extension(name));
        }

        let info = asn1::certification_request_info(
            asn1::capture(&subject.to_der()?)?,
            asn1::capture(self.public_key_info)?,
            extensions,
        );
        let digest = algorithm.digest().digest(info.as_slice())?;
        let signature = sign(&digest)?;
        debug!(
            "Built {} certification request for '{}'",
            self.usage, self.subject_name
        );
        Ok(asn1::signed_structure(info, algorithm, signature))
    }
}

/// Converts a DER encoded request into the requested format.
pub fn encode_request(
    der: &[u8], format: CertRequestFormat
) -> SignerResult<Bytes> {
    match format {
        CertRequestFormat::Der => Ok(Bytes::copy_from_slice(der)),
        CertRequestFormat::Pem => {
            let req = X509Req::from_der(der).map_err(|err| {
                Error::crypto(format!("invalid certification request: {err}"))
            })?;
            Ok(Bytes::from(req.to_pem()?))
        }
    }
}


//------------ Tests ---------------------------------------------------------
