use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// Server-side key used to sign and verify peer tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey([u8; 32]);

impl AuthKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self(key)
    }

    pub fn from_hex(s: &str) -> ProtocolResult<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| ProtocolError::InvalidToken(e.to_string()))?;
        let key: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            ProtocolError::InvalidToken(format!("auth key must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthKey(..)")
    }
}

/// Identity carried by a peer token.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default, rename = "routeid", skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(default, rename = "blockid", skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default, rename = "tabid", skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn: Option<String>,
    /// Domain socket the peer should dial.
    #[serde(default, rename = "sock", skip_serializing_if = "Option::is_none")]
    pub sock_name: Option<String>,
    /// Issued-at, unix seconds.
    #[serde(default)]
    pub iat: i64,
    /// Expiry, unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl TokenClaims {
    pub fn new() -> Self {
        Self {
            iat: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
    }

    pub fn is_expired(&self) -> bool {
        self.exp
            .is_some_and(|exp| chrono::Utc::now().timestamp() >= exp)
    }
}

/// Token codec: `hex(json claims) "." hex(blake3 keyed mac)`.
///
/// The claims half is readable without the key so that a peer can find its
/// socket and route id before it has talked to anyone.
pub struct AuthToken;

impl AuthToken {
    pub fn sign(claims: &TokenClaims, key: &AuthKey) -> ProtocolResult<String> {
        let payload =
            serde_json::to_vec(claims).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let mac = blake3::keyed_hash(&key.0, &payload);
        Ok(format!("{}.{}", hex::encode(&payload), mac.to_hex()))
    }

    /// Read the claims without checking the signature.
    pub fn peek(token: &str) -> ProtocolResult<TokenClaims> {
        let (payload, _) = split(token)?;
        parse_claims(&payload)
    }

    /// Check the signature and expiry and return the claims.
    pub fn verify(token: &str, key: &AuthKey) -> ProtocolResult<TokenClaims> {
        let (payload, mac_hex) = split(token)?;
        let mac: [u8; 32] = hex::decode(mac_hex)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| ProtocolError::InvalidToken("malformed signature".into()))?;
        // blake3::Hash equality is constant-time.
        if blake3::Hash::from(mac) != blake3::keyed_hash(&key.0, &payload) {
            return Err(ProtocolError::InvalidToken("bad signature".into()));
        }
        let claims = parse_claims(&payload)?;
        if claims.is_expired() {
            return Err(ProtocolError::InvalidToken("token expired".into()));
        }
        Ok(claims)
    }
}

fn split(token: &str) -> ProtocolResult<(Vec<u8>, &str)> {
    let (payload_hex, mac_hex) = token
        .trim()
        .split_once('.')
        .ok_or_else(|| ProtocolError::InvalidToken("missing signature".into()))?;
    let payload =
        hex::decode(payload_hex).map_err(|e| ProtocolError::InvalidToken(e.to_string()))?;
    Ok((payload, mac_hex))
}

fn parse_claims(payload: &[u8]) -> ProtocolResult<TokenClaims> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::InvalidToken(e.to_string()))
}
