//! Digest, key and signature algorithms.

use std::fmt;
use std::str::FromStr;

use bcder::Oid;
use openssl::hash::{hash, MessageDigest};
use openssl::md::{Md, MdRef};
use openssl::pkey::{HasPublic, Id, PKeyRef};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::commons::error::Error;
use super::asn1::oid;


//------------ DigestAlgorithm -----------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn message_digest(self) -> MessageDigest {
        match self {
            DigestAlgorithm::Sha1 => MessageDigest::sha1(),
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }

    pub fn md(self) -> &'static MdRef {
        match self {
            DigestAlgorithm::Sha1 => Md::sha1(),
            DigestAlgorithm::Sha256 => Md::sha256(),
            DigestAlgorithm::Sha384 => Md::sha384(),
            DigestAlgorithm::Sha512 => Md::sha512(),
        }
    }

    /// The length of a digest in octets.
    pub fn digest_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    pub fn oid(self) -> Oid<&'static [u8]> {
        match self {
            DigestAlgorithm::Sha1 => oid::SHA1,
            DigestAlgorithm::Sha256 => oid::SHA256,
            DigestAlgorithm::Sha384 => oid::SHA384,
            DigestAlgorithm::Sha512 => oid::SHA512,
        }
    }

    pub fn digest(self, data: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(hash(self.message_digest(), data)?.to_vec())
    }
}


//------------ KeyAlgorithm --------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum KeyAlgorithm {
    #[default]
    Rsa,
    Ec,
}

impl KeyAlgorithm {
    pub fn of_key<T: HasPublic>(key: &PKeyRef<T>) -> Result<Self, Error> {
        match key.id() {
            Id::RSA => Ok(KeyAlgorithm::Rsa),
            Id::EC => Ok(KeyAlgorithm::Ec),
            other => Err(Error::crypto(format!(
                "unsupported key type {}", other.as_raw()
            ))),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa => f.write_str("rsa"),
            KeyAlgorithm::Ec => f.write_str("ec"),
        }
    }
}

impl FromStr for KeyAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(KeyAlgorithm::Rsa),
            "ec" | "ecdsa" => Ok(KeyAlgorithm::Ec),
            _ => Err(format!("unknown key algorithm '{s}'")),
        }
    }
}

impl<'de> Deserialize<'de> for KeyAlgorithm {
    fn deserialize<D>(d: D) -> Result<KeyAlgorithm, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        KeyAlgorithm::from_str(&string).map_err(de::Error::custom)
    }
}

impl Serialize for KeyAlgorithm {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(s)
    }
}


//------------ SignAlgorithm -------------------------------------------------

/// A signature algorithm as requested by clients.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SignAlgorithm {
    Sha1WithRsa,
    Sha256WithRsa,
    Sha384WithRsa,
    Sha512WithRsa,
    Sha256WithRsaMgf1,
    Sha384WithRsaMgf1,
    Sha512WithRsaMgf1,
    Sha1WithEcdsa,
    Sha256WithEcdsa,
    Sha384WithEcdsa,
    Sha512WithEcdsa,
}

impl SignAlgorithm {
    const ALL: [SignAlgorithm; 11] = [
        SignAlgorithm::Sha1WithRsa,
        SignAlgorithm::Sha256WithRsa,
        SignAlgorithm::Sha384WithRsa,
        SignAlgorithm::Sha512WithRsa,
        SignAlgorithm::Sha256WithRsaMgf1,
        SignAlgorithm::Sha384WithRsaMgf1,
        SignAlgorithm::Sha512WithRsaMgf1,
        SignAlgorithm::Sha1WithEcdsa,
        SignAlgorithm::Sha256WithEcdsa,
        SignAlgorithm::Sha384WithEcdsa,
        SignAlgorithm::Sha512WithEcdsa,
    ];

    pub fn digest(self) -> DigestAlgorithm {
        use SignAlgorithm::*;

        match self {
            Sha1WithRsa | Sha1WithEcdsa => DigestAlgorithm::Sha1,
            Sha256WithRsa | Sha256WithRsaMgf1 | Sha256WithEcdsa => {
                DigestAlgorithm::Sha256
            }
            Sha384WithRsa | Sha384WithRsaMgf1 | Sha384WithEcdsa => {
                DigestAlgorithm::Sha384
            }
            Sha512WithRsa | Sha512WithRsaMgf1 | Sha512WithEcdsa => {
                DigestAlgorithm::Sha512
            }
        }
    }

    pub fn key_algorithm(self) -> KeyAlgorithm {
        use SignAlgorithm::*;

        match self {
            Sha1WithEcdsa | Sha256WithEcdsa | Sha384WithEcdsa
            | Sha512WithEcdsa => KeyAlgorithm::Ec,
            _ => KeyAlgorithm::Rsa,
        }
    }

    pub fn is_pss(self) -> bool {
        matches!(
            self,
            SignAlgorithm::Sha256WithRsaMgf1
                | SignAlgorithm::Sha384WithRsaMgf1
                | SignAlgorithm::Sha512WithRsaMgf1
        )
    }

    pub fn name(self) -> &'static str {
        use SignAlgorithm::*;

        match self {
            Sha1WithRsa => "SHA1withRSA",
            Sha256WithRsa => "SHA256withRSA",
            Sha384WithRsa => "SHA384withRSA",
            Sha512WithRsa => "SHA512withRSA",
            Sha256WithRsaMgf1 => "SHA256withRSAandMGF1",
            Sha384WithRsaMgf1 => "SHA384withRSAandMGF1",
            Sha512WithRsaMgf1 => "SHA512withRSAandMGF1",
            Sha1WithEcdsa => "SHA1withECDSA",
            Sha256WithEcdsa => "SHA256withECDSA",
            Sha384WithEcdsa => "SHA384withECDSA",
            Sha512WithEcdsa => "SHA512withECDSA",
        }
    }

    /// The dotted object identifier, if it names this algorithm alone.
    ///
    /// All PSS variants share one identifier and carry the digest in the
    /// parameters, so they have none here.
    pub fn dotted_oid(self) -> Option<&'static str> {
        use SignAlgorithm::*;

        match self {
            Sha1WithRsa => Some("1.2.840.113549.1.1.5"),
            Sha256WithRsa => Some("1.2.840.113549.1.1.11"),
            Sha384WithRsa => Some("1.2.840.113549.1.1.12"),
            Sha512WithRsa => Some("1.2.840.113549.1.1.13"),
            Sha1WithEcdsa => Some("1.2.840.10045.4.1"),
            Sha256WithEcdsa => Some("1.2.840.10045.4.3.2"),
            Sha384WithEcdsa => Some("1.2.840.10045.4.3.3"),
            Sha512WithEcdsa => Some("1.2.840.10045.4.3.4"),
            Sha256WithRsaMgf1 | Sha384WithRsaMgf1 | Sha512WithRsaMgf1 => {
                None
            }
        }
    }

    /// Returns the default algorithm for signing with a key of this type.
    pub fn default_for(key: KeyAlgorithm) -> Self {
        match key {
            KeyAlgorithm::Rsa => SignAlgorithm::Sha256WithRsa,
            KeyAlgorithm::Ec => SignAlgorithm::Sha256WithEcdsa,
        }
    }
}

impl fmt::Display for SignAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SignAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        SignAlgorithm::ALL.iter().copied().find(|alg| {
            alg.name().eq_ignore_ascii_case(s)
                || alg.dotted_oid() == Some(s)
        }).ok_or_else(|| format!("unknown signature algorithm '{s}'"))
    }
}

impl<'de> Deserialize<'de> for SignAlgorithm {
    fn deserialize<D>(d: D) -> Result<SignAlgorithm, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        SignAlgorithm::from_str(&string).map_err(de::Error::custom)
    }
}

impl Serialize for SignAlgorithm {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.name().serialize(s)
    }
}


//------------ SignMechanism -------------------------------------------------

/// The PKCS#11 mechanism used to sign with a key.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SignMechanism {
    #[default]
    RsaPkcs,
    RsaPkcsPss,
    Ecdsa,
}

impl SignMechanism {
    pub fn name(self) -> &'static str {
        match self {
            SignMechanism::RsaPkcs => "CKM_RSA_PKCS",
            SignMechanism::RsaPkcsPss => "CKM_RSA_PKCS_PSS",
            SignMechanism::Ecdsa => "CKM_ECDSA",
        }
    }

    /// Returns the mechanism signing with the given algorithm.
    ///
    /// RSA keys use the mechanism configured for their module, which then
    /// limits the usable algorithms to PKCS#1 v1.5 or PSS ones. EC keys
    /// always use ECDSA.
    pub fn for_algorithm(
        rsa_mechanism: SignMechanism, algorithm: SignAlgorithm
    ) -> Option<SignMechanism> {
        match algorithm.key_algorithm() {
            KeyAlgorithm::Ec => Some(SignMechanism::Ecdsa),
            KeyAlgorithm::Rsa => match rsa_mechanism {
                SignMechanism::RsaPkcs if !algorithm.is_pss() => {
                    Some(SignMechanism::RsaPkcs)
                }
                SignMechanism::RsaPkcsPss
                    if algorithm.is_pss()
                        && algorithm.digest() != DigestAlgorithm::Sha1 =>
                {
                    Some(SignMechanism::RsaPkcsPss)
                }
                _ => None,
            },
        }
    }

    /// Returns the mechanism recorded for keys of the given algorithm.
    pub fn for_key(
        rsa_mechanism: SignMechanism, key: KeyAlgorithm
    ) -> SignMechanism {
        match key {
            KeyAlgorithm::Ec => SignMechanism::Ecdsa,
            KeyAlgorithm::Rsa => rsa_mechanism,
        }
    }
}

impl fmt::Display for SignMechanism {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SignMechanism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "CKM_RSA_PKCS" => Ok(SignMechanism::RsaPkcs),
            "CKM_RSA_PKCS_PSS" => Ok(SignMechanism::RsaPkcsPss),
            "CKM_ECDSA" => Ok(SignMechanism::Ecdsa),
            _ => Err(format!("unsupported sign mechanism '{s}'")),
        }
    }
}

impl<'de> Deserialize<'de> for SignMechanism {
    fn deserialize<D>(d: D) -> Result<SignMechanism, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        SignMechanism::from_str(&string).map_err(de::Error::custom)
    }
}

impl Serialize for SignMechanism {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.name().serialize(s)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanism_mapping() {
        use SignMechanism::*;

        assert_eq!(
            SignMechanism::for_algorithm(RsaPkcs, SignAlgorithm::Sha1WithRsa),
            Some(RsaPkcs)
        );
        assert_eq!(
            SignMechanism::for_algorithm(
                RsaPkcs, SignAlgorithm::Sha256WithRsaMgf1
            ),
            None
        );
        assert_eq!(
            SignMechanism::for_algorithm(
                RsaPkcsPss, SignAlgorithm::Sha512WithRsaMgf1
            ),
            Some(RsaPkcsPss)
        );
        assert_eq!(
            SignMechanism::for_algorithm(
                RsaPkcsPss, SignAlgorithm::Sha256WithRsa
            ),
            None
        );
        assert_eq!(
            SignMechanism::for_algorithm(
                RsaPkcsPss, SignAlgorithm::Sha1WithEcdsa
            ),
            Some(Ecdsa)
        );
        assert!(SignMechanism::from_str("CKM_DSA").is_err());
    }

    #[test]
    fn parse_by_name_and_oid() {
        assert_eq!(
            SignAlgorithm::from_str("sha256withrsa"),
            Ok(SignAlgorithm::Sha256WithRsa)
        );
        assert_eq!(
            SignAlgorithm::from_str("1.2.840.10045.4.3.3"),
            Ok(SignAlgorithm::Sha384WithEcdsa)
        );
        assert_eq!(
            SignAlgorithm::from_str("SHA512withRSAandMGF1"),
            Ok(SignAlgorithm::Sha512WithRsaMgf1)
        );
        assert!(SignAlgorithm::from_str("1.2.840.113549.1.1.10").is_err());
        assert!(SignAlgorithm::from_str("MD5withRSA").is_err());
    }

    #[test]
    fn algorithm_parts() {
        let alg = SignAlgorithm::Sha384WithRsaMgf1;
        assert_eq!(alg.digest(), DigestAlgorithm::Sha384);
        assert_eq!(alg.key_algorithm(), KeyAlgorithm::Rsa);
        assert!(alg.is_pss());
        assert_eq!(
            SignAlgorithm::Sha1WithEcdsa.key_algorithm(), KeyAlgorithm::Ec
        );
    }

    #[test]
    fn digest_lengths_match() {
        for alg in [
            DigestAlgorithm::Sha1, DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384, DigestAlgorithm::Sha512,
        ] {
            assert_eq!(alg.digest(b"abc").unwrap().len(), alg.digest_len());
        }
    }
}
