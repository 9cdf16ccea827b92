//! The _tokensigner_ library crate.
//!
//! Owns the private keys of a security server, held either in a software
//! keystore or on PKCS#11 tokens, and mediates every signature made with
//! them.

pub mod commons;
pub mod constants;
pub mod daemon;
pub mod signer;
