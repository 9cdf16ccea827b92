//! DER encoding of the structures signed through a token.
//!
//! Keys on a token never leave it, so certificate requests and
//! certificates are assembled here and only the final signature is made
//! by the token.

use bcder::encode::{self, Constructed, PrimitiveContent, Values};
use bcder::{BitString, Captured, Mode, OctetString, Oid, Tag};
use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};

use crate::commons::api::KeyUsage;
use crate::commons::error::Error;
use super::algorithm::{DigestAlgorithm, KeyAlgorithm, SignAlgorithm};


//------------ Object Identifiers --------------------------------------------

pub mod oid {
    use bcder::Oid;

    pub const SHA1_WITH_RSA: Oid<&[u8]> =
        Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 5]);
    pub const SHA256_WITH_RSA: Oid<&[u8]> =
        Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 11]);
    pub const SHA384_WITH_RSA: Oid<&[u8]> =
        Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 12]);
    pub const SHA512_WITH_RSA: Oid<&[u8]> =
        Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 13]);
    pub const RSASSA_PSS: Oid<&[u8]> =
        Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 10]);
    pub const MGF1: Oid<&[u8]> = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 8]);

    pub const ECDSA_WITH_SHA1: Oid<&[u8]> = Oid(&[42, 134, 72, 206, 61, 4, 1]);
    pub const ECDSA_WITH_SHA256: Oid<&[u8]> =
        Oid(&[42, 134, 72, 206, 61, 4, 3, 2]);
    pub const ECDSA_WITH_SHA384: Oid<&[u8]> =
        Oid(&[42, 134, 72, 206, 61, 4, 3, 3]);
    pub const ECDSA_WITH_SHA512: Oid<&[u8]> =
        Oid(&[42, 134, 72, 206, 61, 4, 3, 4]);

    pub const SHA1: Oid<&[u8]> = Oid(&[43, 14, 3, 2, 26]);
    pub const SHA256: Oid<&[u8]> = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 1]);
    pub const SHA384: Oid<&[u8]> = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 2]);
    pub const SHA512: Oid<&[u8]> = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 3]);

    pub const CE_KEY_USAGE: Oid<&[u8]> = Oid(&[85, 29, 15]);
    pub const CE_SUBJECT_ALT_NAME: Oid<&[u8]> = Oid(&[85, 29, 17]);

    pub const EXTENSION_REQUEST: Oid<&[u8]> =
        Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 14]);

    pub const OCSP_BASIC: Oid<&[u8]> = Oid(&[43, 6, 1, 5, 5, 7, 48, 1, 1]);
}


//------------ Algorithm Identifiers -----------------------------------------

fn signature_oid(alg: SignAlgorithm) -> Oid<&'static [u8]> {
    use SignAlgorithm::*;

    match alg {
        Sha1WithRsa => oid::SHA1_WITH_RSA,
        Sha256WithRsa => oid::SHA256_WITH_RSA,
        Sha384WithRsa => oid::SHA384_WITH_RSA,
        Sha512WithRsa => oid::SHA512_WITH_RSA,
        Sha256WithRsaMgf1 | Sha384WithRsaMgf1 | Sha512WithRsaMgf1 => {
            oid::RSASSA_PSS
        }
        Sha1WithEcdsa => oid::ECDSA_WITH_SHA1,
        Sha256WithEcdsa => oid::ECDSA_WITH_SHA256,
        Sha384WithEcdsa => oid::ECDSA_WITH_SHA384,
        Sha512WithEcdsa => oid::ECDSA_WITH_SHA512,
    }
}

/// Encodes the AlgorithmIdentifier of a digest algorithm.
pub fn digest_algorithm_identifier(digest: DigestAlgorithm) -> Captured {
    encode::sequence((digest.oid().encode(), ().encode())).to_captured(Mode::Der)
}

/// Encodes the AlgorithmIdentifier of a signature algorithm.
///
/// RSA with PKCS#1 padding carries a NULL parameter, ECDSA none, and
/// RSASSA-PSS the hash, MGF1 and salt length parameters of RFC 4055.
pub fn signature_algorithm_identifier(alg: SignAlgorithm) -> Captured {
    let id = signature_oid(alg);
    if alg.is_pss() {
        let digest = alg.digest();
        encode::sequence((
            id.encode(),
            encode::sequence((
                Constructed::new(
                    Tag::CTX_0, digest_algorithm_identifier(digest)
                ),
                Constructed::new(
                    Tag::CTX_1,
                    encode::sequence((
                        oid::MGF1.encode(),
                        digest_algorithm_identifier(digest),
                    ))
                ),
                Constructed::new(
                    Tag::CTX_2, (digest.digest_len() as u64).encode()
                ),
            )),
        )).to_captured(Mode::Der)
    }
    else if alg.key_algorithm() == KeyAlgorithm::Ec {
        encode::sequence(id.encode()).to_captured(Mode::Der)
    }
    else {
        encode::sequence((id.encode(), ().encode())).to_captured(Mode::Der)
    }
}


//------------ DigestInfo ----------------------------------------------------

/// Wraps a digest into the DER DigestInfo signed with RSA PKCS#1 v1.5.
pub fn digest_info(digest_alg: DigestAlgorithm, digest: &[u8]) -> Bytes {
    encode::sequence((
        digest_algorithm_identifier(digest_alg),
        OctetString::new(Bytes::copy_from_slice(digest)).encode(),
    )).to_captured(Mode::Der).into_bytes()
}


//------------ Extensions ----------------------------------------------------

fn extension(
    id: Oid<&'static [u8]>, critical: bool, value: impl Values
) -> Captured {
    encode::sequence((
        id.encode(),
        if critical { Some(true.encode()) } else { None },
        OctetString::encode_wrapped(Mode::Der, value),
    )).to_captured(Mode::Der)
}

/// The key usage bits requested for keys of the given usage.
///
/// Signing keys get nonRepudiation and keyCertSign, authentication keys
/// digitalSignature, keyEncipherment and dataEncipherment.
pub fn key_usage_bits(usage: KeyUsage) -> BitString {
    match usage {
        KeyUsage::Signing => {
            BitString::new(2, Bytes::from_static(&[0x44]))
        }
        KeyUsage::Authentication => {
            BitString::new(4, Bytes::from_static(&[0xB0]))
        }
    }
}

/// Encodes the critical key usage extension.
pub fn key_usage_extension(usage: KeyUsage) -> Captured {
    extension(oid::CE_KEY_USAGE, true, key_usage_bits(usage).encode())
}

/// Encodes a subject alternative name extension with one DNS name.
pub fn subject_alt_name_extension(dns_name: &str) -> Captured {
    extension(
        oid::CE_SUBJECT_ALT_NAME,
        false,
        encode::sequence(
            OctetString::new(
                Bytes::copy_from_slice(dns_name.as_bytes())
            ).encode_as(Tag::CTX_2)
        ),
    )
}


//------------ Certification Requests ----------------------------------------

/// Encodes a PKCS#10 CertificationRequestInfo.
///
/// The subject and public key are DER as produced elsewhere, the
/// extensions end up in an extensionRequest attribute.
pub fn certification_request_info(
    subject: Captured,
    public_key_info: Captured,
    extensions: Vec<Captured>,
) -> Captured {
    encode::sequence((
        0u8.encode(),
        subject,
        public_key_info,
        Constructed::new(
            Tag::CTX_0,
            encode::sequence((
                oid::EXTENSION_REQUEST.encode(),
                encode::set(encode::sequence(concat(extensions))),
            ))
        ),
    )).to_captured(Mode::Der)
}


//------------ Certificates --------------------------------------------------

/// The fields of a certificate to be signed by a token key.
pub struct TbsCertificate {
    pub serial: u64,
    pub algorithm: SignAlgorithm,
    pub issuer: Captured,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject: Captured,
    pub public_key_info: Captured,
    pub extensions: Vec<Captured>,
}

impl TbsCertificate {
    pub fn encode(self) -> Captured {
        encode::sequence((
            Constructed::new(Tag::CTX_0, 2u8.encode()),
            self.serial.encode(),
            signature_algorithm_identifier(self.algorithm),
            self.issuer,
            encode::sequence((
                encode_time(self.not_before),
                encode_time(self.not_after),
            )),
            self.subject,
            self.public_key_info,
            Constructed::new(
                Tag::CTX_3, encode::sequence(concat(self.extensions))
            ),
        )).to_captured(Mode::Der)
    }
}

/// Encodes an X.509 time, UTCTime before 2050 and GeneralizedTime after.
pub fn encode_time(time: DateTime<Utc>) -> impl Values {
    let (text, tag) = if time.year() < 2050 {
        (time.format("%y%m%d%H%M%SZ").to_string(), Tag::UTC_TIME)
    }
    else {
        (time.format("%Y%m%d%H%M%SZ").to_string(), Tag::GENERALIZED_TIME)
    };
    OctetString::new(Bytes::from(text)).encode_as(tag)
}

/// Encodes a GeneralizedTime.
pub fn generalized_time(time: DateTime<Utc>) -> impl Values {
    OctetString::new(Bytes::from(
        time.format("%Y%m%d%H%M%SZ").to_string()
    )).encode_as(Tag::GENERALIZED_TIME)
}


//------------ Signed Structures ---------------------------------------------

/// Wraps signed content into SEQUENCE { content, algorithm, signature }.
///
/// This is the outer shape of both certificates and certification
/// requests.
pub fn signed_structure(
    content: Captured, algorithm: SignAlgorithm, signature: Vec<u8>
) -> Bytes {
    encode::sequence((
        content,
        signature_algorithm_identifier(algorithm),
        BitString::new(0, Bytes::from(signature)).encode(),
    )).to_captured(Mode::Der).into_bytes()
}


//------------ Helpers -------------------------------------------------------

/// Captures a complete DER value produced by another library.
pub fn capture(der: &[u8]) -> Result<Captured, Error> {
    Mode::Der.decode(Bytes::copy_from_slice(der), |cons| {
        cons.capture_one()
    }).map_err(|err| Error::crypto(format!("invalid DER value: {err}")))
}

/// Concatenates already encoded values.
fn concat(values: Vec<Captured>) -> Captured {
    let mut bytes = Vec::new();
    for value in values {
        bytes.extend_from_slice(value.as_slice());
    }
    Captured::from_values(Mode::Der, Raw(Bytes::from(bytes)))
}

/// Pre-encoded octets written as they are.
struct Raw(Bytes);

impl Values for Raw {
    fn encoded_len(&self, _mode: Mode) -> usize {
        self.0.len()
    }

    fn write_encoded<W: std::io::Write>(
        &self, _mode: Mode, target: &mut W
    ) -> Result<(), std::io::Error> {
        target.write_all(self.0.as_ref())
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_usage_bit_layout() {
        let signing = key_usage_extension(KeyUsage::Signing);
        let auth = key_usage_extension(KeyUsage::Authentication);
        assert!(signing.as_slice().ends_with(&[0x03, 0x02, 0x02, 0x44]));
        assert!(auth.as_slice().ends_with(&[0x03, 0x02, 0x04, 0xB0]));
    }

    #[test]
    fn digest_info_for_sha256() {
        let digest = [0u8; 32];
        let info = digest_info(DigestAlgorithm::Sha256, &digest);
        let prefix = [
            0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01,
            0x65, 0x03, 0x04, 0x02, 0x01, 0x05, 0x00, 0x04, 0x20,
        ];
        assert_eq!(&info[..prefix.len()], &prefix);
        assert_eq!(info.len(), prefix.len() + 32);
    }

    #[test]
    fn ecdsa_identifier_has_no_parameters() {
        let id = signature_algorithm_identifier(
            SignAlgorithm::Sha256WithEcdsa
        );
        assert_eq!(
            id.as_slice(),
            &[0x30, 0x0a, 0x06, 0x08, 42, 134, 72, 206, 61, 4, 3, 2]
        );
    }

    #[test]
    fn times_switch_encoding_in_2050() {
        let early = Utc.with_ymd_and_hms(2049, 12, 31, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2050, 1, 1, 0, 0, 0).unwrap();
        let early = encode_time(early).to_captured(Mode::Der);
        let late = encode_time(late).to_captured(Mode::Der);
        assert_eq!(early.as_slice()[0], 0x17);
        assert_eq!(&early.as_slice()[2..], b"491231235959Z");
        assert_eq!(late.as_slice()[0], 0x18);
        assert_eq!(&late.as_slice()[2..], b"20500101000000Z");
    }
}
