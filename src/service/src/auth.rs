// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Bearer-token metadata handling shared by panel and node.
//!
//! The panel attaches `authorization: Bearer <token>` to every outbound RPC
//! via [`BearerInterceptor`]; the node extracts and validates the token
//! before any handler runs.

use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tonic::service::Interceptor;
use tonic::{Request, Status};

/// Metadata key carrying the node auth token.
pub const AUTHORIZATION_KEY: &str = "authorization";

/// Issued tokens are 32 random bytes, URL-safe base64 encoded (43 chars).
/// Validation accepts a slightly wider window so that older token formats
/// keep working during rotation.
const MIN_TOKEN_LEN: usize = 20;
const MAX_TOKEN_LEN: usize = 100;

/// A gRPC interceptor that attaches a bearer token to each request.
#[derive(Debug, Clone)]
pub struct BearerInterceptor {
    value: AsciiMetadataValue,
}

impl BearerInterceptor {
    /// Creates an interceptor for the given raw token.
    ///
    /// Fails if the token is not a valid ASCII metadata value or does not
    /// look like an issued token.
    pub fn new(token: &str) -> Result<Self, InvalidTokenFormat> {
        if !is_valid_token_format(token) {
            return Err(InvalidTokenFormat);
        }
        let value = format!("Bearer {token}")
            .parse::<AsciiMetadataValue>()
            .map_err(|_| InvalidTokenFormat)?;
        Ok(BearerInterceptor { value })
    }
}

impl Interceptor for BearerInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request
            .metadata_mut()
            .insert(AUTHORIZATION_KEY, self.value.clone());
        Ok(request)
    }
}

/// Error returned when a token cannot be used as a bearer credential.
#[derive(Debug, thiserror::Error)]
#[error("token is not a valid bearer credential")]
pub struct InvalidTokenFormat;

/// Extracts the bearer token from request metadata.
///
/// Accepts `Bearer <token>`, `bearer <token>`, and a bare token for
/// compatibility with older agents.
pub fn bearer_token(metadata: &MetadataMap) -> Option<&str> {
    let value = metadata.get(AUTHORIZATION_KEY)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value);
    (!token.is_empty()).then_some(token)
}

/// Cheap syntactic validation applied before any lookup: URL-safe base64
/// alphabet, bounded length.
pub fn is_valid_token_format(token: &str) -> bool {
    if token.len() < MIN_TOKEN_LEN || token.len() > MAX_TOKEN_LEN {
        return false;
    }
    token
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// The `UNAUTHENTICATED` status used when a request carries no usable token.
pub fn missing_token_status() -> Status {
    Status::unauthenticated("authentication required: missing or invalid authorization header")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_format_rules() {
        assert!(is_valid_token_format(
            "wX3rT9yUv-bQ7sK1mN5pL2aZ8cD4eF6g"
        ));
        // Too short.
        assert!(!is_valid_token_format("short"));
        // Illegal characters.
        assert!(!is_valid_token_format("token with spaces token with"));
        assert!(!is_valid_token_format("token+with/standard=base64chars"));
        // Too long.
        assert!(!is_valid_token_format(&"a".repeat(101)));
    }

    #[test]
    fn bearer_extraction() {
        let mut metadata = MetadataMap::new();
        assert_eq!(bearer_token(&metadata), None);

        metadata.insert(
            AUTHORIZATION_KEY,
            "Bearer sometoken-1234567890".parse().unwrap(),
        );
        assert_eq!(bearer_token(&metadata), Some("sometoken-1234567890"));

        metadata.insert(
            AUTHORIZATION_KEY,
            "bearer sometoken-1234567890".parse().unwrap(),
        );
        assert_eq!(bearer_token(&metadata), Some("sometoken-1234567890"));

        metadata.insert(AUTHORIZATION_KEY, "raw-token-1234567890".parse().unwrap());
        assert_eq!(bearer_token(&metadata), Some("raw-token-1234567890"));
    }

    #[test]
    fn interceptor_attaches_header() {
        let mut interceptor = BearerInterceptor::new("wX3rT9yUv-bQ7sK1mN5pL2aZ8cD4eF6g").unwrap();
        let request = interceptor.call(Request::new(())).unwrap();
        let token = bearer_token(request.metadata()).unwrap();
        assert_eq!(token, "wX3rT9yUv-bQ7sK1mN5pL2aZ8cD4eF6g");
    }

    #[test]
    fn interceptor_rejects_malformed_tokens() {
        assert!(BearerInterceptor::new("bad token").is_err());
    }
}
