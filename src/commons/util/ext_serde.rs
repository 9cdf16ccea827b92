//! Defines helper methods for Serializing and Deserializing external types.

use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use log::LevelFilter;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};


//------------ Bytes ---------------------------------------------------------

pub fn de_bytes<'de, D>(d: D) -> Result<Bytes, D::Error>
where
    D: Deserializer<'de>,
{
    let some = String::deserialize(d)?;
    let dec = BASE64.decode(&some).map_err(de::Error::custom)?;
    Ok(Bytes::from(dec))
}

pub fn ser_bytes<S>(b: &Bytes, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    BASE64.encode(b).serialize(s)
}

pub fn de_bytes_opt<'de, D>(d: D) -> Result<Option<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(d)? {
        Some(some) => {
            let dec = BASE64.decode(&some).map_err(de::Error::custom)?;
            Ok(Some(Bytes::from(dec)))
        }
        None => Ok(None),
    }
}

pub fn ser_bytes_opt<S>(b: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    b.as_ref().map(|b| BASE64.encode(b)).serialize(s)
}

pub fn de_bytes_vec<'de, D>(d: D) -> Result<Vec<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(d)?
        .into_iter()
        .map(|some| {
            BASE64.decode(&some).map(Bytes::from).map_err(de::Error::custom)
        })
        .collect()
}

pub fn ser_bytes_vec<S>(b: &[Bytes], s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    b.iter()
        .map(|b| BASE64.encode(b))
        .collect::<Vec<_>>()
        .serialize(s)
}

/// Encodes bytes as base64 for use outside of serde.
pub fn to_base64(b: &[u8]) -> String {
    BASE64.encode(b)
}


//------------ LevelFilter ---------------------------------------------------

pub fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}
