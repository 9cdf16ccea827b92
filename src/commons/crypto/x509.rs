//! Helpers for X.509 certificates and names.

use bcder::{BitString, Mode, OctetString, Oid, Tag};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::hash::{hash, MessageDigest};
use openssl::nid::Nid;
use openssl::x509::{X509, X509Name, X509NameBuilder, X509Ref, X509VerifyResult};

use crate::commons::api::KeyUsage;
use crate::commons::error::Error;
use super::asn1::oid;


/// Returns the hex encoded SHA-1 hash of a DER encoded certificate.
pub fn cert_hash(der: &[u8]) -> Result<String, Error> {
    Ok(hex::encode(hash(MessageDigest::sha1(), der)?))
}

/// Parses a certificate given in DER or PEM.
pub fn parse_cert(bytes: &[u8]) -> Result<X509, Error> {
    X509::from_der(bytes)
        .or_else(|_| X509::from_pem(bytes))
        .map_err(|err| Error::invalid_cert(format!("cannot parse: {err}")))
}

/// Returns the DER encoding of a certificate.
pub fn cert_der(cert: &X509Ref) -> Result<Bytes, Error> {
    Ok(Bytes::from(cert.to_der()?))
}

/// Returns the DER encoded SubjectPublicKeyInfo of a certificate.
pub fn cert_public_key_info(cert: &X509Ref) -> Result<Bytes, Error> {
    Ok(Bytes::from(cert.public_key()?.public_key_to_der()?))
}

/// Returns whether the certificate is issued by itself with its own key.
pub fn is_self_signed(cert: &X509Ref) -> bool {
    if cert.issued(cert) != X509VerifyResult::OK {
        return false
    }
    match cert.public_key() {
        Ok(key) => cert.verify(&key).unwrap_or(false),
        Err(_) => false,
    }
}

/// Returns the end of the validity period of a certificate.
pub fn not_after(cert: &X509Ref) -> Result<DateTime<Utc>, Error> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(cert.not_after())?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        Error::invalid_cert("validity end out of range")
    })
}

/// Determines which usage a certificate is meant for.
///
/// A certificate with the nonRepudiation bit is a signing certificate,
/// one with the digitalSignature bit an authentication certificate.
/// Having both or neither is rejected.
pub fn cert_usage(der: &[u8]) -> Result<KeyUsage, Error> {
    let bits = match key_usage(der)? {
        Some(bits) => bits,
        None => {
            return Err(Error::wrong_usage(
                "Certificate has no key usage extension"
            ))
        }
    };
    let digital_signature = bits.bit(0);
    let non_repudiation = bits.bit(1);
    match (non_repudiation, digital_signature) {
        (true, false) => Ok(KeyUsage::Signing),
        (false, true) => Ok(KeyUsage::Authentication),
        (true, true) => Err(Error::wrong_usage(
            "Certificate cannot be used both for signing and \
             authentication"
        )),
        (false, false) => Err(Error::wrong_usage(
            "Certificate is neither a signing nor an authentication \
             certificate"
        )),
    }
}

/// Extracts the key usage extension from a DER encoded certificate.
pub fn key_usage(der: &[u8]) -> Result<Option<BitString>, Error> {
    let value = Mode::Der.decode(Bytes::copy_from_slice(der), |cons| {
        cons.take_sequence(|cons| {
            let value = cons.take_sequence(|cons| {
                cons.take_opt_constructed_if(Tag::CTX_0, |c| c.skip_all())?;
                cons.skip_one()?; // serialNumber
                cons.skip_one()?; // signature
                cons.skip_one()?; // issuer
                cons.skip_one()?; // validity
                cons.skip_one()?; // subject
                cons.skip_one()?; // subjectPublicKeyInfo
                cons.take_opt_primitive_if(Tag::CTX_1, |p| p.skip_all())?;
                cons.take_opt_primitive_if(Tag::CTX_2, |p| p.skip_all())?;
                let value = cons.take_opt_constructed_if(Tag::CTX_3, |cons| {
                    cons.take_sequence(|cons| {
                        let mut found = None;
                        while let Some(value) = cons.take_opt_sequence(|cons| {
                            let id = Oid::take_from(cons)?;
                            cons.take_opt_bool()?;
                            let value = OctetString::take_from(cons)?;
                            Ok(if id == oid::CE_KEY_USAGE {
                                Some(value)
                            } else {
                                None
                            })
                        })? {
                            if value.is_some() {
                                found = value
                            }
                        }
                        Ok(found)
                    })
                })?;
                Ok(value.flatten())
            })?;
            cons.skip_all()?;
            Ok(value)
        })
    }).map_err(|err| Error::invalid_cert(format!("cannot decode: {err}")))?;

    match value {
        Some(value) => {
            Mode::Der.decode(value.to_bytes(), BitString::take_from)
                .map(Some)
                .map_err(|err| {
                    Error::invalid_cert(format!("invalid key usage: {err}"))
                })
        }
        None => Ok(None),
    }
}

/// Parses a distinguished name such as `C=EE, O=Org, CN=Name`.
///
/// Components are separated by commas or plus signs. Values may be
/// quoted or escape special characters with a backslash, either directly
/// or as two hex digits. Attribute types are case insensitive.
pub fn parse_name(name: &str) -> Result<X509Name, Error> {
    let components = name_components(name)?;
    if components.is_empty() {
        return Err(Error::other("Subject name must not be empty"))
    }
    let mut builder = X509NameBuilder::new()?;
    for (field, value) in components {
        let res = match attribute_nid(&field) {
            Some(nid) => builder.append_entry_by_nid(nid, &value),
            None => builder.append_entry_by_text(&field, &value),
        };
        res.map_err(|err| {
            Error::other(format!(
                "Invalid subject name component '{field}={value}': {err}"
            ))
        })?;
    }
    Ok(builder.build())
}

/// Splits a distinguished name into attribute types and values.
fn name_components(name: &str) -> Result<Vec<(String, String)>, Error> {
    let invalid = |reason: &str| {
        Error::other(format!("Invalid subject name '{name}': {reason}"))
    };

    let mut components = Vec::new();
    let mut current = Vec::new();
    let mut separator = None;
    let mut quoted = false;
    let mut bytes = name.bytes().peekable();
    loop {
        match bytes.next() {
            Some(b'\\') => {
                let first = bytes.next().ok_or_else(|| {
                    invalid("trailing backslash")
                })?;
                let high = char::from(first).to_digit(16);
                let low = bytes.peek().and_then(|next| {
                    char::from(*next).to_digit(16)
                });
                match (high, low) {
                    (Some(high), Some(low)) => {
                        bytes.next();
                        current.push((high * 16 + low) as u8);
                    }
                    _ => current.push(first),
                }
            }
            Some(b'"') => quoted = !quoted,
            Some(b'=') if !quoted && separator.is_none() => {
                separator = Some(current.len());
                current.push(b'=');
            }
            Some(b',' | b'+') if !quoted => {
                push_component(&mut components, &current, separator)
                    .map_err(|reason| invalid(reason))?;
                current.clear();
                separator = None;
            }
            Some(byte) => current.push(byte),
            None => {
                if quoted {
                    return Err(invalid("unterminated quote"))
                }
                push_component(&mut components, &current, separator)
                    .map_err(|reason| invalid(reason))?;
                return Ok(components)
            }
        }
    }
}

fn push_component(
    components: &mut Vec<(String, String)>,
    raw: &[u8],
    separator: Option<usize>,
) -> Result<(), &'static str> {
    let Some(separator) = separator else {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(())
        }
        return Err("component without '='")
    };
    let text = |bytes: &[u8]| {
        std::str::from_utf8(bytes)
            .map(|text| text.trim().to_string())
            .map_err(|_| "value is not UTF-8")
    };
    let field = text(&raw[..separator])?;
    let value = text(&raw[separator + 1..])?;
    if field.is_empty() {
        return Err("missing attribute type")
    }
    if value.is_empty() {
        return Err("missing attribute value")
    }
    components.push((field, value));
    Ok(())
}

/// Returns the NID for the common attribute type names.
fn attribute_nid(field: &str) -> Option<Nid> {
    let nid = match field.to_ascii_uppercase().as_str() {
        "CN" | "COMMONNAME" => Nid::COMMONNAME,
        "SERIALNUMBER" => Nid::SERIALNUMBER,
        "E" | "EMAIL" | "EMAILADDRESS" => Nid::PKCS9_EMAILADDRESS,
        "O" => Nid::ORGANIZATIONNAME,
        "OU" => Nid::ORGANIZATIONALUNITNAME,
        "C" => Nid::COUNTRYNAME,
        "L" => Nid::LOCALITYNAME,
        "ST" | "S" => Nid::STATEORPROVINCENAME,
        "STREET" => Nid::STREETADDRESS,
        "DC" => Nid::DOMAINCOMPONENT,
        "UID" => Nid::USERID,
        "SN" | "SURNAME" => Nid::SURNAME,
        "GIVENNAME" => Nid::GIVENNAME,
        "T" | "TITLE" => Nid::TITLE,
        _ => return None,
    };
    Some(nid)
}


//------------ Tests ---------------------------------------------------------
