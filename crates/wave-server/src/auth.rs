use async_trait::async_trait;

use wave_protocol::{AuthKey, AuthToken, TokenClaims};
use wave_rpc::{conn_route, proc_route};

use crate::error::{ServerError, ServerResult};

/// Turns the token a peer presents into verified claims.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, token: &str) -> ServerResult<TokenClaims>;
}

/// Accepts tokens signed with the server's key.
pub struct TokenAuth {
    key: AuthKey,
}

impl TokenAuth {
    pub fn new(key: AuthKey) -> Self {
        Self { key }
    }

    /// Mint a token this provider will accept.
    pub fn issue(&self, claims: &TokenClaims) -> ServerResult<String> {
        Ok(AuthToken::sign(claims, &self.key)?)
    }
}

#[async_trait]
impl AuthProvider for TokenAuth {
    async fn authenticate(&self, token: &str) -> ServerResult<TokenClaims> {
        AuthToken::verify(token, &self.key).map_err(|e| ServerError::AuthFailed(e.to_string()))
    }
}

/// Route an authenticated peer is registered under, and whether the
/// registration is exclusive.
///
/// An explicit route id wins, then the block's process route, then the
/// connection route. Connection routes are exclusive.
pub fn route_for_claims(claims: &TokenClaims) -> ServerResult<(String, bool)> {
    if let Some(route) = claims.route_id.as_deref().filter(|r| !r.is_empty()) {
        return Ok((route.to_string(), route.starts_with("conn:")));
    }
    if let Some(block) = claims.block_id.as_deref().filter(|b| !b.is_empty()) {
        return Ok((proc_route(block), false));
    }
    if let Some(conn) = claims.conn.as_deref().filter(|c| !c.is_empty()) {
        return Ok((conn_route(conn), true));
    }
    Err(ServerError::AuthFailed("token names no route".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signed_tokens_are_accepted() {
        let auth = TokenAuth::new(AuthKey::generate());
        let mut claims = TokenClaims::new();
        claims.block_id = Some("b1".into());
        let token = auth.issue(&claims).unwrap();
        let verified = auth.authenticate(&token).await.unwrap();
        assert_eq!(verified.block_id.as_deref(), Some("b1"));
    }

    #[tokio::test]
    async fn foreign_tokens_are_rejected() {
        let auth = TokenAuth::new(AuthKey::generate());
        let other = TokenAuth::new(AuthKey::generate());
        let token = other.issue(&TokenClaims::new()).unwrap();
        assert!(matches!(
            auth.authenticate(&token).await,
            Err(ServerError::AuthFailed(_))
        ));
    }

    #[test]
    fn route_selection() {
        let mut claims = TokenClaims::new();
        assert!(route_for_claims(&claims).is_err());

        claims.conn = Some("ssh-host".into());
        assert_eq!(route_for_claims(&claims).unwrap(), ("conn:ssh-host".into(), true));

        claims.block_id = Some("b7".into());
        assert_eq!(route_for_claims(&claims).unwrap(), ("proc:b7".into(), false));

        claims.route_id = Some("controller:b7".into());
        assert_eq!(route_for_claims(&claims).unwrap(), ("controller:b7".into(), false));
    }
}
