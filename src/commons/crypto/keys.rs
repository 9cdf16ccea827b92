//! Public keys as they come out of tokens.

use bcder::{Mode, OctetString};
use bytes::Bytes;
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private, Public};
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::{Padding, Rsa};
use openssl::sign::RsaPssSaltlen;

use crate::commons::error::Error;
use super::algorithm::{KeyAlgorithm, SignAlgorithm};


/// DER encoded named curve identifiers as found in CKA_EC_PARAMS.
const PRIME256V1_PARAMS: &[u8] =
    &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
const SECP384R1_PARAMS: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22];
const SECP521R1_PARAMS: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x23];


/// Creates a random key identifier, hex encoded.
pub fn random_key_id() -> Result<String, Error> {
    let mut id = [0u8; 20];
    openssl::rand::rand_bytes(&mut id)?;
    Ok(hex::encode(id))
}

/// Builds the SubjectPublicKeyInfo of an RSA key from its components.
pub fn rsa_public_key_info(
    modulus: &[u8], exponent: &[u8]
) -> Result<Bytes, Error> {
    let rsa = Rsa::from_public_components(
        BigNum::from_slice(modulus)?, BigNum::from_slice(exponent)?
    )?;
    Ok(Bytes::from(PKey::from_rsa(rsa)?.public_key_to_der()?))
}

/// Returns the named curve for DER encoded EC parameters.
pub fn curve_for_params(params: &[u8]) -> Result<Nid, Error> {
    match params {
        PRIME256V1_PARAMS => Ok(Nid::X9_62_PRIME256V1),
        SECP384R1_PARAMS => Ok(Nid::SECP384R1),
        SECP521R1_PARAMS => Ok(Nid::SECP521R1),
        _ => Err(Error::crypto(format!(
            "unsupported EC parameters {}", hex::encode(params)
        ))),
    }
}

/// Returns the DER encoded parameters for a named curve.
pub fn params_for_curve(curve: Nid) -> Result<&'static [u8], Error> {
    match curve {
        Nid::X9_62_PRIME256V1 => Ok(PRIME256V1_PARAMS),
        Nid::SECP384R1 => Ok(SECP384R1_PARAMS),
        Nid::SECP521R1 => Ok(SECP521R1_PARAMS),
        _ => Err(Error::crypto("unsupported EC curve")),
    }
}

/// Builds the SubjectPublicKeyInfo of an EC key from CKA_EC_PARAMS and
/// CKA_EC_POINT.
///
/// Devices return the point wrapped into a DER OCTET STRING. Some return
/// it raw, which is accepted too.
pub fn ec_public_key_info(
    params: &[u8], point: &[u8]
) -> Result<Bytes, Error> {
    let group = EcGroup::from_curve_name(curve_for_params(params)?)?;
    let mut ctx = BigNumContext::new()?;
    let wrapped = Mode::Der.decode(
        Bytes::copy_from_slice(point), OctetString::take_from
    ).ok().and_then(|octets| {
        EcPoint::from_bytes(&group, &octets.to_bytes(), &mut ctx).ok()
    });
    let point = match wrapped {
        Some(point) => point,
        None => EcPoint::from_bytes(&group, point, &mut ctx)?,
    };
    let key = EcKey::from_public_key(&group, &point)?;
    Ok(Bytes::from(PKey::from_ec_key(key)?.public_key_to_der()?))
}

/// Parses a DER encoded SubjectPublicKeyInfo.
pub fn parse_public_key_info(der: &[u8]) -> Result<PKey<Public>, Error> {
    PKey::public_key_from_der(der).map_err(|err| {
        Error::crypto(format!("invalid public key: {err}"))
    })
}

/// Returns the algorithm of a DER encoded SubjectPublicKeyInfo.
pub fn public_key_algorithm(der: &[u8]) -> Result<KeyAlgorithm, Error> {
    let key = parse_public_key_info(der)?;
    KeyAlgorithm::of_key(&key)
}

/// Signs a precomputed digest with a private key.
///
/// RSA signatures are PKCS#1 v1.5 or PSS with MGF1 and a salt as long as
/// the digest, EC signatures are DER encoded. The caller has to make sure
/// key and algorithm match.
pub fn sign_digest(
    key: &PKeyRef<Private>, algorithm: SignAlgorithm, digest: &[u8]
) -> Result<Vec<u8>, Error> {
    let md = algorithm.digest().md();
    let mut ctx = PkeyCtx::new(key)?;
    ctx.sign_init()?;
    if algorithm.key_algorithm() == KeyAlgorithm::Rsa {
        if algorithm.is_pss() {
            ctx.set_rsa_padding(Padding::PKCS1_PSS)?;
            ctx.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
            ctx.set_rsa_mgf1_md(md)?;
        }
        else {
            ctx.set_rsa_padding(Padding::PKCS1)?;
        }
    }
    ctx.set_signature_md(md)?;
    let mut signature = Vec::new();
    ctx.sign_to_vec(digest, &mut signature)?;
    Ok(signature)
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bcder::encode::Values;
    use openssl::ec::PointConversionForm;

    #[test]
    fn rsa_info_from_components() {
        let rsa = Rsa::generate(2048).unwrap();
        let info = rsa_public_key_info(
            &rsa.n().to_vec(), &rsa.e().to_vec()
        ).unwrap();
        let expected = PKey::from_rsa(rsa).unwrap()
            .public_key_to_der().unwrap();
        assert_eq!(info.as_ref(), expected.as_slice());
        assert_eq!(public_key_algorithm(&info).unwrap(), KeyAlgorithm::Rsa);
    }

    #[test]
    fn ec_info_from_wrapped_and_raw_point() {
        let group = EcGroup::from_curve_name(Nid::SECP384R1).unwrap();
        let key = EcKey::generate(&group).unwrap();
        let mut ctx = BigNumContext::new().unwrap();
        let raw = key.public_key().to_bytes(
            &group, PointConversionForm::UNCOMPRESSED, &mut ctx
        ).unwrap();
        let wrapped = OctetString::new(Bytes::from(raw.clone()))
            .encode().to_captured(Mode::Der);

        let expected = PKey::from_ec_key(key).unwrap()
            .public_key_to_der().unwrap();
        let params = params_for_curve(Nid::SECP384R1).unwrap();
        assert_eq!(
            ec_public_key_info(params, wrapped.as_slice()).unwrap().as_ref(),
            expected.as_slice()
        );
        assert_eq!(
            ec_public_key_info(params, &raw).unwrap().as_ref(),
            expected.as_slice()
        );
    }

    #[test]
    fn signatures_over_digests_verify() {
        use openssl::sign::Verifier;
        use crate::commons::test::{ec_key, rsa_key};

        let data = b"to be signed";
        for (key, alg) in [
            (rsa_key(), SignAlgorithm::Sha256WithRsa),
            (rsa_key(), SignAlgorithm::Sha384WithRsaMgf1),
            (ec_key(), SignAlgorithm::Sha256WithEcdsa),
        ] {
            let digest = alg.digest().digest(data).unwrap();
            let signature = sign_digest(&key, alg, &digest).unwrap();

            let md = alg.digest().message_digest();
            let mut verifier = Verifier::new(md, &key).unwrap();
            if alg.is_pss() {
                verifier.set_rsa_padding(Padding::PKCS1_PSS).unwrap();
                verifier.set_rsa_pss_saltlen(
                    RsaPssSaltlen::DIGEST_LENGTH
                ).unwrap();
                verifier.set_rsa_mgf1_md(md).unwrap();
            }
            verifier.update(data).unwrap();
            assert!(verifier.verify(&signature).unwrap(), "{alg}");
        }
    }

    #[test]
    fn key_ids_are_unique_hex() {
        let a = random_key_id().unwrap();
        let b = random_key_id().unwrap();
        assert_eq!(a.len(), 40);
        assert_ne!(a, b);
    }
}
