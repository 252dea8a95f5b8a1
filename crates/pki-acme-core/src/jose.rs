//! JOSE primitives: flattened JWS parsing, JWK signature verification and
//! RFC 7638 thumbprints.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use ring::signature::{self, RsaPublicKeyComponents, UnparsedPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AcmeError, AcmeResult};

/// Algorithms accepted on ACME requests
pub const SUPPORTED_ALGORITHMS: &[&str] = &["ES256", "ES384", "RS256", "EdDSA"];

/// JWS signature algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwsAlgorithm {
    Es256,
    Es384,
    Rs256,
    EdDsa,
}

impl JwsAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ES256" => Some(JwsAlgorithm::Es256),
            "ES384" => Some(JwsAlgorithm::Es384),
            "RS256" => Some(JwsAlgorithm::Rs256),
            "EdDSA" => Some(JwsAlgorithm::EdDsa),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JwsAlgorithm::Es256 => "ES256",
            JwsAlgorithm::Es384 => "ES384",
            JwsAlgorithm::Rs256 => "RS256",
            JwsAlgorithm::EdDsa => "EdDSA",
        }
    }
}

/// Flattened JWS JSON serialization (RFC 7515 section 7.2.2)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlattenedJws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

impl FlattenedJws {
    pub fn parse(body: &[u8]) -> AcmeResult<Self> {
        serde_json::from_slice(body)
            .map_err(|e| AcmeError::malformed(format!("Request body is not a flattened JWS: {}", e)))
    }

    pub fn protected_header(&self) -> AcmeResult<ProtectedHeader> {
        let raw = decode_b64url(&self.protected, "protected header")?;
        serde_json::from_slice(&raw)
            .map_err(|e| AcmeError::malformed(format!("Invalid protected header: {}", e)))
    }

    /// `ASCII(BASE64URL(protected) || '.' || BASE64URL(payload))`
    pub fn signing_input(&self) -> Vec<u8> {
        format!("{}.{}", self.protected, self.payload).into_bytes()
    }

    pub fn signature_bytes(&self) -> AcmeResult<Vec<u8>> {
        decode_b64url(&self.signature, "signature")
    }

    /// Decoded payload; `None` for the empty payload of a POST-as-GET
    pub fn payload_json(&self) -> AcmeResult<Option<serde_json::Value>> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        let raw = decode_b64url(&self.payload, "payload")?;
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| AcmeError::malformed(format!("Payload is not valid JSON: {}", e)))
    }
}

/// Protected header members ACME cares about
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtectedHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// Public JSON Web Key
///
/// Only public members are kept; anything else in the client's JWK is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "EC")]
    Ec { crv: String, x: String, y: String },
    #[serde(rename = "RSA")]
    Rsa { n: String, e: String },
    #[serde(rename = "OKP")]
    Okp { crv: String, x: String },
}

impl Jwk {
    pub fn from_json(value: &serde_json::Value) -> AcmeResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| AcmeError::bad_public_key(format!("Unsupported JWK: {}", e)))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Canonical JSON of the required members in lexicographic order (RFC 7638)
    fn canonical_json(&self) -> String {
        let q = |s: &str| serde_json::Value::String(s.to_string()).to_string();
        match self {
            Jwk::Ec { crv, x, y } => format!(
                r#"{{"crv":{},"kty":"EC","x":{},"y":{}}}"#,
                q(crv),
                q(x),
                q(y)
            ),
            Jwk::Rsa { n, e } => format!(r#"{{"e":{},"kty":"RSA","n":{}}}"#, q(e), q(n)),
            Jwk::Okp { crv, x } => format!(r#"{{"crv":{},"kty":"OKP","x":{}}}"#, q(crv), q(x)),
        }
    }

    /// RFC 7638 SHA-256 thumbprint, base64url encoded
    pub fn thumbprint(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.canonical_json().as_bytes()))
    }

    /// Verify `signature` over `message` with this key
    ///
    /// The key type and curve must match `alg`; a mismatch or an undecodable
    /// key is `badPublicKey`, as is a signature that does not verify.
    pub fn verify(&self, alg: JwsAlgorithm, message: &[u8], signature: &[u8]) -> AcmeResult<()> {
        let result = match (alg, self) {
            (JwsAlgorithm::Es256, Jwk::Ec { crv, x, y }) if crv == "P-256" => {
                let point = ec_point(x, y, 32)?;
                UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_FIXED, point)
                    .verify(message, signature)
            }
            (JwsAlgorithm::Es384, Jwk::Ec { crv, x, y }) if crv == "P-384" => {
                let point = ec_point(x, y, 48)?;
                UnparsedPublicKey::new(&signature::ECDSA_P384_SHA384_FIXED, point)
                    .verify(message, signature)
            }
            (JwsAlgorithm::Rs256, Jwk::Rsa { n, e }) => {
                let n = decode_b64url(n, "RSA modulus")?;
                let e = decode_b64url(e, "RSA exponent")?;
                let components = RsaPublicKeyComponents {
                    n: strip_leading_zeros(&n),
                    e: strip_leading_zeros(&e),
                };
                components.verify(&signature::RSA_PKCS1_2048_8192_SHA256, message, signature)
            }
            (JwsAlgorithm::EdDsa, Jwk::Okp { crv, x }) if crv == "Ed25519" => {
                let key = decode_b64url(x, "Ed25519 key")?;
                UnparsedPublicKey::new(&signature::ED25519, key).verify(message, signature)
            }
            _ => {
                return Err(AcmeError::bad_public_key(format!(
                    "Key type does not match algorithm {}",
                    alg.as_str()
                )))
            }
        };

        result.map_err(|_| AcmeError::bad_public_key("JWS signature verification failed"))
    }
}

fn ec_point(x: &str, y: &str, coordinate_len: usize) -> AcmeResult<Vec<u8>> {
    let x = decode_b64url(x, "EC x coordinate")?;
    let y = decode_b64url(y, "EC y coordinate")?;
    if x.len() != coordinate_len || y.len() != coordinate_len {
        return Err(AcmeError::bad_public_key("EC coordinates have the wrong length"));
    }

    let mut point = Vec::with_capacity(1 + 2 * coordinate_len);
    point.push(0x04);
    point.extend_from_slice(&x);
    point.extend_from_slice(&y);
    Ok(point)
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

pub fn decode_b64url(value: &str, what: &str) -> AcmeResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|_| AcmeError::malformed(format!("Invalid base64url in {}", what)))
}

pub fn encode_b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `len` random bytes, base64url encoded
pub fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Key authorization: `<token>.<thumbprint>`
pub fn key_authorization(token: &str, jwk: &Jwk) -> String {
    format!("{}.{}", token, jwk.thumbprint())
}

/// DNS-01 TXT record value: `base64url(SHA-256(key_authorization))`
pub fn dns01_txt_value(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}
