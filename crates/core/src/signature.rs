use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

/// HMAC digest used to authenticate inbound payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureAlgorithm {
    #[default]
    HmacSha256,
    HmacSha512,
}

impl SignatureAlgorithm {
    /// Resolves the algorithm from its configuration name (`sha256` / `sha512`).
    pub fn from_name(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sha256" | "hmac-sha256" => Some(Self::HmacSha256),
            "sha512" | "hmac-sha512" => Some(Self::HmacSha512),
            _ => None,
        }
    }

    /// Prefix used in the `<prefix>=<hex>` header form.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::HmacSha256 => "sha256",
            Self::HmacSha512 => "sha512",
        }
    }

    fn digest(self, secret: &[u8], payload: &[u8]) -> Option<Vec<u8>> {
        match self {
            Self::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret).ok()?;
                mac.update(payload);
                Some(mac.finalize().into_bytes().to_vec())
            }
            Self::HmacSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(secret).ok()?;
                mac.update(payload);
                Some(mac.finalize().into_bytes().to_vec())
            }
        }
    }
}

/// Verifies `provided` against an HMAC of the exact raw payload bytes.
///
/// Accepts either `<algo>=<hex>` or bare hex. Any missing or malformed input
/// yields `false`; the function never panics.
pub fn verify(
    raw_payload: &[u8],
    provided: Option<&str>,
    secret: Option<&[u8]>,
    algorithm: SignatureAlgorithm,
) -> bool {
    let Some(secret) = secret.filter(|secret| !secret.is_empty()) else {
        return false;
    };
    let Some(provided) = provided.map(str::trim).filter(|value| !value.is_empty()) else {
        return false;
    };

    let hex_part = match provided.split_once('=') {
        Some((prefix, hex_part)) if prefix.eq_ignore_ascii_case(algorithm.prefix()) => hex_part,
        Some(_) => return false,
        None => provided,
    };
    let Ok(provided_bytes) = hex::decode(hex_part) else {
        return false;
    };
    let Some(expected) = algorithm.digest(secret, raw_payload) else {
        return false;
    };

    if expected.len() != provided_bytes.len() {
        return false;
    }
    expected.as_slice().ct_eq(provided_bytes.as_slice()).into()
}

/// Produces the `<algo>=<hex>` signature for a payload.
pub fn sign(raw_payload: &[u8], secret: &[u8], algorithm: SignatureAlgorithm) -> String {
    let digest = algorithm.digest(secret, raw_payload).unwrap_or_default();
    format!("{}={}", algorithm.prefix(), hex::encode(digest))
}
