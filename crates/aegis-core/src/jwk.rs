//! JSON Web Key wire types (RFC 7517).
//!
//! Shared between the issuer (which publishes EC keys) and the client
//! library (which consumes the published set, and may also encounter RSA
//! keys from upstream providers).

use serde::{Deserialize, Serialize};

/// JSON Web Key Set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwks {
    /// The keys in this set.
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Finds a key by its `kid`.
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys
            .iter()
            .find(|key| key.kid.as_deref() == Some(kid))
    }
}

/// JSON Web Key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type ("EC" or "RSA").
    pub kty: String,

    /// Key ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Key use ("sig").
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,

    /// Algorithm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// EC curve name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// EC x coordinate (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// EC y coordinate (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,

    /// RSA modulus (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA exponent (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_by_kid() {
        let jwks = Jwks {
            keys: vec![Jwk {
                kty: "EC".to_string(),
                kid: Some("k1".to_string()),
                use_: Some("sig".to_string()),
                alg: Some("ES256".to_string()),
                crv: Some("P-256".to_string()),
                x: Some("x".to_string()),
                y: Some("y".to_string()),
                n: None,
                e: None,
            }],
        };
        assert!(jwks.find("k1").is_some());
        assert!(jwks.find("k2").is_none());
    }

    #[test]
    fn test_ec_jwk_serialization_omits_rsa_fields() {
        let jwk = Jwk {
            kty: "EC".to_string(),
            kid: Some("k1".to_string()),
            use_: Some("sig".to_string()),
            alg: Some("ES256".to_string()),
            crv: Some("P-256".to_string()),
            x: Some("xv".to_string()),
            y: Some("yv".to_string()),
            n: None,
            e: None,
        };
        let json = serde_json::to_string(&jwk).unwrap();
        assert!(json.contains("\"use\":\"sig\""));
        assert!(!json.contains("\"n\":"));
        assert!(!json.contains("\"e\":"));
    }
}
