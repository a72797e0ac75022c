//! Request and callback signing for the payment gateway.
//!
//! The gateway signs every message over a canonical form of its flat
//! parameter map: empty values and the `sign` field itself are dropped,
//! the remaining keys are sorted byte-lexicographically, joined as
//! `k1=v1&k2=v2`, and `&key=<merchant key>` is appended before hashing.
//! The canonicalization is part of the wire contract; any deviation
//! breaks interoperability with the gateway.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Flat string parameter map used by every gateway message.
pub type Params = BTreeMap<String, String>;

/// Signature algorithm declared in the `sign_type` field.
///
/// MD5 is the gateway default and what this service sends; HMAC-SHA256
/// uses the identical canonical string and is accepted on inbound
/// callbacks that declare it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignType {
    #[default]
    Md5,
    HmacSha256,
}

impl SignType {
    pub fn as_wire(self) -> &'static str {
        match self {
            SignType::Md5 => "MD5",
            SignType::HmacSha256 => "HMAC-SHA256",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "MD5" => Some(SignType::Md5),
            "HMAC-SHA256" => Some(SignType::HmacSha256),
            _ => None,
        }
    }
}

/// Canonical `k1=v1&k2=v2&...&key=<secret>` string for a parameter map.
///
/// `BTreeMap` iteration already yields keys in byte order, which is
/// exactly the ordering the gateway requires.
fn canonical_string(params: &Params, key: &str) -> String {
    let mut joined = String::new();
    for (name, value) in params {
        if name == "sign" || value.is_empty() {
            continue;
        }
        joined.push_str(name);
        joined.push('=');
        joined.push_str(value);
        joined.push('&');
    }
    joined.push_str("key=");
    joined.push_str(key);
    joined
}

/// Sign a parameter map with the merchant key using the default MD5
/// sign type.
pub fn sign(params: &Params, key: &str) -> String {
    sign_with(params, key, SignType::Md5)
}

/// Sign a parameter map with an explicit sign type.
pub fn sign_with(params: &Params, key: &str, sign_type: SignType) -> String {
    let canonical = canonical_string(params, key);
    match sign_type {
        SignType::Md5 => {
            let digest = md5::compute(canonical.as_bytes());
            hex::encode(*digest).to_uppercase()
        }
        SignType::HmacSha256 => {
            let mut mac = HmacSha256::new_from_slice(key.as_bytes())
                .expect("HMAC accepts keys of any length");
            mac.update(canonical.as_bytes());
            hex::encode(mac.finalize().into_bytes()).to_uppercase()
        }
    }
}

/// Verify the `sign` field of a parameter map.
///
/// The sign type is taken from the map's `sign_type` field when present
/// (an unrecognized value fails verification), otherwise MD5. The digest
/// comparison does not short-circuit.
pub fn verify(params: &Params, key: &str) -> bool {
    let claimed = match params.get("sign") {
        Some(value) if !value.is_empty() => value,
        _ => return false,
    };
    let sign_type = match params.get("sign_type").map(String::as_str) {
        Some(declared) => match SignType::from_wire(declared) {
            Some(sign_type) => sign_type,
            None => return false,
        },
        None => SignType::Md5,
    };
    constant_time_eq(&sign_with(params, key, sign_type), claimed)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, &str)]) -> Params {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn md5_signature_matches_known_vector() {
        // Reference vector from the gateway's signing documentation.
        let p = params(&[
            ("appid", "wxd930ea5d5a258f4f"),
            ("mch_id", "10000100"),
            ("device_info", "1000"),
            ("body", "test"),
            ("nonce_str", "ibuaiVcKdpRxkhJA"),
        ]);
        let key = "192006250b4c09247ec02edce69f6a2d";
        assert_eq!(sign(&p, key), "9A0A8659F005D6984697E2CA0A9CF3B7");
    }

    #[test]
    fn empty_values_and_sign_field_are_excluded() {
        let mut p = params(&[
            ("out_trade_no", "PT1"),
            ("total_fee", "3001"),
            ("attach", "ORD-1"),
        ]);
        let base = sign(&p, "testkey");
        assert_eq!(base, "5FA2E84EB7296A235AACBE3EFE251544");

        p.insert("device_info".to_string(), String::new());
        p.insert("sign".to_string(), "IGNORED".to_string());
        assert_eq!(sign(&p, "testkey"), base);
    }

    #[test]
    fn verify_roundtrip_and_tamper_detection() {
        let mut p = params(&[
            ("out_trade_no", "PT20260101A"),
            ("total_fee", "3001"),
            ("transaction_id", "42000001"),
        ]);
        let signature = sign(&p, "merchantkey");
        p.insert("sign".to_string(), signature);
        assert!(verify(&p, "merchantkey"));

        p.insert("total_fee".to_string(), "1".to_string());
        assert!(!verify(&p, "merchantkey"));
    }

    #[test]
    fn verify_fails_without_signature_or_with_wrong_key() {
        let mut p = params(&[("out_trade_no", "PT1")]);
        assert!(!verify(&p, "key"));

        let signature = sign(&p, "key");
        p.insert("sign".to_string(), signature);
        assert!(verify(&p, "key"));
        assert!(!verify(&p, "other-key"));
    }

    #[test]
    fn hmac_sign_type_is_honored_on_verify() {
        let mut p = params(&[("out_trade_no", "PT1"), ("total_fee", "100")]);
        p.insert("sign_type".to_string(), "HMAC-SHA256".to_string());
        let signature = sign_with(&p, "key", SignType::HmacSha256);
        assert_eq!(signature.len(), 64);
        p.insert("sign".to_string(), signature);
        assert!(verify(&p, "key"));
    }

    #[test]
    fn unrecognized_sign_type_fails_verification() {
        let mut p = params(&[("out_trade_no", "PT1")]);
        p.insert("sign_type".to_string(), "SHA1".to_string());
        let signature = sign(&p, "key");
        p.insert("sign".to_string(), signature);
        assert!(!verify(&p, "key"));
    }
}
