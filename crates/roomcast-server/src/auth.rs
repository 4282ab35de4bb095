//! Bearer token authentication for the management API and WebSocket upgrades.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use roomcast_core::AuthError;
use tracing::debug;

use crate::api::error::ApiError;
use crate::websocket::connection::Principal;

/// The set of accepted bearer tokens.
#[derive(Clone, Default)]
pub struct TokenSet {
    tokens: Arc<[String]>,
}

impl TokenSet {
    /// Build from configured tokens; blank entries are ignored.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens
            .into_iter()
            .map(Into::into)
            .filter(|t| !t.trim().is_empty())
            .collect();
        Self {
            tokens: tokens.into(),
        }
    }

    /// Whether no tokens are configured.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Check `candidate` against every configured token.
    pub fn verify(&self, candidate: &str) -> Result<(), AuthError> {
        if self.tokens.is_empty() {
            return Err(AuthError::NotConfigured);
        }
        // Compare against all tokens so timing does not reveal which matched.
        let matched = self
            .tokens
            .iter()
            .fold(false, |acc, t| acc | constant_time_eq(t.as_bytes(), candidate.as_bytes()));
        if matched {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingCredential)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?;
    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MalformedHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MalformedHeader);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MalformedHeader);
    }
    Ok(token)
}

/// Middleware rejecting requests without a configured bearer token.
pub async fn require_bearer(
    State(tokens): State<TokenSet>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let verdict = bearer_token(request.headers()).and_then(|token| tokens.verify(token));
    match verdict {
        Ok(()) => next.run(request).await,
        Err(e) => {
            debug!(path = %request.uri().path(), error = %e, "management request rejected");
            ApiError::Unauthorized(e).into_response()
        }
    }
}

/// Decide the principal for a WebSocket upgrade.
///
/// The token may come from the `Authorization` header or the `token` query
/// parameter. A presented token must be valid. Without one the client is
/// anonymous, unless `require_auth` is set.
pub fn authenticate_upgrade(
    tokens: &TokenSet,
    headers: &HeaderMap,
    query_token: Option<&str>,
    require_auth: bool,
) -> Result<Principal, AuthError> {
    let presented = match bearer_token(headers) {
        Ok(token) => Some(token),
        Err(AuthError::MissingCredential) => query_token.filter(|t| !t.is_empty()),
        Err(e) => return Err(e),
    };

    match presented {
        Some(token) => tokens.verify(token).map(|()| Principal::Bearer),
        None if require_auth => Err(AuthError::MissingCredential),
        None => Ok(Principal::Anonymous),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;

    fn headers(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        let _ = h.insert(AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        h
    }

    fn tokens() -> TokenSet {
        TokenSet::new(["secret", "other"])
    }

    #[test]
    fn verify_accepts_any_configured_token() {
        assert!(tokens().verify("secret").is_ok());
        assert!(tokens().verify("other").is_ok());
        assert_eq!(tokens().verify("nope"), Err(AuthError::InvalidToken));
        assert_eq!(tokens().verify("secre"), Err(AuthError::InvalidToken));
    }

    #[test]
    fn verify_without_tokens_is_not_configured() {
        let empty = TokenSet::new(["", "  "]);
        assert!(empty.is_empty());
        assert_eq!(empty.verify("anything"), Err(AuthError::NotConfigured));
    }

    #[test]
    fn bearer_token_parsing() {
        assert_eq!(bearer_token(&headers("Bearer abc")), Ok("abc"));
        assert_eq!(bearer_token(&headers("bearer abc")), Ok("abc"));
        assert_eq!(bearer_token(&headers("Basic abc")), Err(AuthError::MalformedHeader));
        assert_eq!(bearer_token(&headers("Bearer ")), Err(AuthError::MalformedHeader));
        assert_eq!(bearer_token(&headers("abc")), Err(AuthError::MalformedHeader));
        assert_eq!(bearer_token(&HeaderMap::new()), Err(AuthError::MissingCredential));
    }

    #[test]
    fn upgrade_anonymous_when_optional() {
        let p = authenticate_upgrade(&tokens(), &HeaderMap::new(), None, false).unwrap();
        assert_eq!(p, Principal::Anonymous);
    }

    #[test]
    fn upgrade_with_header_or_query() {
        let p = authenticate_upgrade(&tokens(), &headers("Bearer secret"), None, true).unwrap();
        assert_eq!(p, Principal::Bearer);
        let p = authenticate_upgrade(&tokens(), &HeaderMap::new(), Some("other"), true).unwrap();
        assert_eq!(p, Principal::Bearer);
    }

    #[test]
    fn upgrade_rejects_invalid_token_even_when_optional() {
        assert_matches!(
            authenticate_upgrade(&tokens(), &HeaderMap::new(), Some("bad"), false),
            Err(AuthError::InvalidToken)
        );
        assert_matches!(
            authenticate_upgrade(&tokens(), &headers("Bearer bad"), None, false),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn upgrade_required_without_token() {
        assert_matches!(
            authenticate_upgrade(&tokens(), &HeaderMap::new(), None, true),
            Err(AuthError::MissingCredential)
        );
    }

    #[test]
    fn debug_hides_tokens() {
        let s = format!("{:?}", tokens());
        assert!(!s.contains("secret"));
    }
}
