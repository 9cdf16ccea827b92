//! Tokens, their workers and everything done with their keys.

pub mod certmanager;
pub mod dispatch;
#[cfg(feature = "hsm")]
pub mod hsm;
pub mod manager;
pub mod pins;
pub mod registry;
pub mod softtoken;
pub mod worker;
