//! Pluggable per-connection authentication.
//!
//! The listener evaluates the configured [`Authenticator`] once per accepted
//! connection, before the peer is registered. A rejection is reflected to
//! the client as close code 4001 with the authenticator's reason.

use std::net::SocketAddr;

use async_trait::async_trait;
use subtle::ConstantTimeEq;

/// Close code sent to a rejected connection.
pub const AUTH_REJECT_CLOSE_CODE: u16 = 4001;

/// What the listener knows about a connection before it is admitted.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub remote_addr: SocketAddr,
    /// Request path of the WebSocket upgrade. The bridge accepts any path;
    /// it is exposed here only for the authenticator's benefit.
    pub path: String,
    /// Raw `Authorization` header, if the client sent one.
    pub authorization: Option<String>,
}

/// Outcome of an authentication check.
#[derive(Debug, Clone)]
pub enum AuthDecision {
    Accept {
        /// Label of the mechanism that admitted the peer, for logs.
        method: Option<String>,
    },
    Reject {
        reason: String,
    },
}

impl AuthDecision {
    pub fn accept() -> Self {
        Self::Accept { method: None }
    }
}

/// Per-connection accept/reject hook.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, attempt: &ConnectionAttempt) -> AuthDecision;
}

/// Admits every connection. The default when no authenticator is configured.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _attempt: &ConnectionAttempt) -> AuthDecision {
        AuthDecision::accept()
    }
}

/// Validates a shared bearer token from the `Authorization` header
/// (constant-time comparison).
pub struct TokenAuthenticator {
    token: String,
}

impl TokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, attempt: &ConnectionAttempt) -> AuthDecision {
        let presented = attempt
            .authorization
            .as_deref()
            .and_then(|value| value.strip_prefix("Bearer "));
        match presented {
            Some(token) if bool::from(token.as_bytes().ct_eq(self.token.as_bytes())) => {
                AuthDecision::Accept {
                    method: Some("token".to_string()),
                }
            }
            Some(_) => AuthDecision::Reject {
                reason: "invalid token".to_string(),
            },
            None => AuthDecision::Reject {
                reason: "missing bearer token".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(authorization: Option<&str>) -> ConnectionAttempt {
        ConnectionAttempt {
            remote_addr: "127.0.0.1:40000".parse().expect("addr"),
            path: "/".to_string(),
            authorization: authorization.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn allow_all_admits_anything() {
        let decision = AllowAll.authenticate(&attempt(None)).await;
        assert!(matches!(decision, AuthDecision::Accept { .. }));
    }

    #[tokio::test]
    async fn token_authenticator_checks_the_bearer_token() {
        let auth = TokenAuthenticator::new("s3cret");

        let ok = auth.authenticate(&attempt(Some("Bearer s3cret"))).await;
        assert!(matches!(ok, AuthDecision::Accept { .. }));

        let bad = auth.authenticate(&attempt(Some("Bearer nope"))).await;
        assert!(matches!(bad, AuthDecision::Reject { .. }));

        let missing = auth.authenticate(&attempt(None)).await;
        assert!(matches!(missing, AuthDecision::Reject { .. }));
    }
}
