//! Cryptographic building blocks shared by the software and hardware
//! tokens.
pub mod algorithm;
pub mod asn1;
pub mod keys;
pub mod x509;

pub use self::algorithm::{
    DigestAlgorithm, KeyAlgorithm, SignAlgorithm, SignMechanism
};
