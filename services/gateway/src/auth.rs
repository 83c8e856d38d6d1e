use axum::http::HeaderMap;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

use crate::collaborators::AuthValidator;
use crate::error::{GatewayError, GatewayResult};

/// Claims expected on the gateway's own JWTs. `exp`/`sub` are checked by
/// `jsonwebtoken` itself; the rest ride along for the application to use.
#[derive(Debug, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub exp: usize,
}

/// Decodes and verifies a JWT against `secret`, returning the subject
/// (`sub`) claim as the user id.
pub struct JwtAuthValidator {
    secret: String,
}

impl JwtAuthValidator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

#[async_trait::async_trait]
impl AuthValidator for JwtAuthValidator {
    async fn validate(&self, token: &str) -> GatewayResult<String> {
        let claims = decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| GatewayError::AuthFailed(e.to_string()))?
        .claims;
        Ok(claims.sub)
    }
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

/// Pulls a bearer token out of the `Authorization` header, the first auth
/// path the handshake tries.
pub fn extract_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(ToOwned::to_owned)
}

/// Decodes a `jwt.<base64url>` subprotocol entry into the raw token it
/// carries. The client is expected to offer `jwt-auth, jwt.<encoded>` as its
/// `Sec-WebSocket-Protocol` list; `jwt-auth` itself carries no token and is
/// skipped.
pub fn decode_subprotocol_token(protocols: &str) -> GatewayResult<String> {
    let encoded = protocols
        .split(',')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("jwt."))
        .ok_or_else(|| GatewayError::AuthFailed("no jwt subprotocol entry present".to_owned()))?;

    let decoded = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| GatewayError::AuthFailed(format!("invalid base64 in jwt subprotocol: {e}")))?;

    String::from_utf8(decoded).map_err(|_| GatewayError::AuthFailed("jwt subprotocol payload was not utf-8".to_owned()))
}

/// Encodes a raw JWT for the subprotocol scheme
/// (`jwt-auth, jwt.<base64url-no-pad(token)>`). Exposed for tests and for
/// any client-facing helper that needs to build the header itself.
pub fn encode_subprotocol_token(token: &str) -> String {
    format!("jwt-auth, jwt.{}", URL_SAFE_NO_PAD.encode(token))
}

/// Extracts a token from whichever auth path the handshake offers: the
/// `Authorization` header takes priority, falling back to the
/// `Sec-WebSocket-Protocol` subprotocol scheme.
pub fn extract_token(headers: &HeaderMap) -> GatewayResult<String> {
    if let Some(token) = extract_token_from_headers(headers) {
        return Ok(token);
    }
    let protocols = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::AuthFailed("no authorization header or websocket subprotocol present".to_owned()))?;
    decode_subprotocol_token(protocols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn sign(secret: &str, sub: &str) -> String {
        let claims = TokenClaims {
            sub: sub.to_owned(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn extract_token_from_headers_handles_missing_malformed_and_valid_bearer() {
        let missing = HeaderMap::new();
        assert_eq!(extract_token_from_headers(&missing), None);

        let mut malformed = HeaderMap::new();
        malformed.insert("authorization", HeaderValue::from_static("Basic abc123"));
        assert_eq!(extract_token_from_headers(&malformed), None);

        let mut valid = HeaderMap::new();
        valid.insert("authorization", HeaderValue::from_static("Bearer token-123"));
        assert_eq!(extract_token_from_headers(&valid), Some("token-123".to_owned()));
    }

    #[test]
    fn subprotocol_round_trips_through_encode_and_decode() {
        let header = encode_subprotocol_token("my-jwt-token");
        assert!(header.starts_with("jwt-auth, jwt."));
        assert_eq!(decode_subprotocol_token(&header).unwrap(), "my-jwt-token");
    }

    #[test]
    fn subprotocol_decode_rejects_a_list_with_no_jwt_entry() {
        assert!(decode_subprotocol_token("chat.v1, chat.v2").is_err());
    }

    #[test]
    fn subprotocol_decode_rejects_invalid_base64() {
        assert!(decode_subprotocol_token("jwt-auth, jwt.not-valid-base64!@#$").is_err());
    }

    #[test]
    fn extract_token_prefers_the_authorization_header_over_the_subprotocol() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer header-token"));
        headers.insert(
            "sec-websocket-protocol",
            HeaderValue::from_str(&encode_subprotocol_token("subprotocol-token")).unwrap(),
        );
        assert_eq!(extract_token(&headers).unwrap(), "header-token");
    }

    #[test]
    fn extract_token_falls_back_to_the_subprotocol_when_no_header_is_present() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "sec-websocket-protocol",
            HeaderValue::from_str(&encode_subprotocol_token("subprotocol-token")).unwrap(),
        );
        assert_eq!(extract_token(&headers).unwrap(), "subprotocol-token");
    }

    #[tokio::test]
    async fn jwt_auth_validator_accepts_a_correctly_signed_token_and_rejects_a_tampered_one() {
        let validator = JwtAuthValidator::new("test-secret");
        let token = sign("test-secret", "user-123");
        assert_eq!(validator.validate(&token).await.unwrap(), "user-123");

        let wrong_secret_token = sign("wrong-secret", "user-123");
        assert!(validator.validate(&wrong_secret_token).await.is_err());
    }
}
