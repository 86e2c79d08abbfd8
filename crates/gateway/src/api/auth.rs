//! Identity middleware.
//!
//! The core consults an [`IdentityVerifier`] on every request; the
//! bundled implementation is static bearer tokens (values read from env
//! vars once at startup, compared as SHA-256 digests in constant time).
//! A real deployment swaps in a JWT-backed verifier behind the same
//! trait.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use fl_domain::config::AuthConfig;
use fl_domain::{Error, Result};

use crate::state::AppState;

use super::error::ApiError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identity types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The authenticated caller and the workspaces they may act in.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub workspace_ids: Vec<String>,
}

impl AuthContext {
    /// Pick the request's workspace: the `X-Workspace-Id` header when
    /// present (must be in the grant set), else the caller's first
    /// workspace.
    pub fn resolve_workspace(&self, requested: Option<&str>) -> Result<String> {
        match requested {
            Some(ws) => {
                if self.workspace_ids.iter().any(|w| w == ws) {
                    Ok(ws.to_owned())
                } else {
                    Err(Error::AuthZ)
                }
            }
            None => self
                .workspace_ids
                .first()
                .cloned()
                .ok_or(Error::AuthZ),
        }
    }
}

/// The workspace resolved for this request (stored as an extension).
#[derive(Debug, Clone)]
pub struct Workspace(pub String);

pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, bearer: Option<&str>) -> Result<AuthContext>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Static token verifier
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TokenEntry {
    token_hash: [u8; 32],
    user_id: String,
    workspace_ids: Vec<String>,
}

pub struct StaticTokenVerifier {
    entries: Vec<TokenEntry>,
    dev_workspace: String,
}

impl StaticTokenVerifier {
    /// Resolve token env vars once at startup. Entries whose env var is
    /// unset are skipped with a warning; with no entries at all the
    /// verifier runs in dev mode.
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut entries = Vec::new();
        for binding in &config.tokens {
            match std::env::var(&binding.token_env) {
                Ok(token) if !token.is_empty() => {
                    entries.push(TokenEntry {
                        token_hash: Sha256::digest(token.as_bytes()).into(),
                        user_id: binding.user_id.clone(),
                        workspace_ids: binding.workspace_ids.clone(),
                    });
                }
                _ => {
                    tracing::warn!(
                        env = %binding.token_env,
                        user_id = %binding.user_id,
                        "auth token env var unset; binding skipped"
                    );
                }
            }
        }
        if entries.is_empty() {
            tracing::warn!(
                workspace = %config.dev_workspace,
                "no auth tokens active; running in dev mode"
            );
        }
        Self {
            entries,
            dev_workspace: config.dev_workspace.clone(),
        }
    }
}

impl IdentityVerifier for StaticTokenVerifier {
    fn verify(&self, bearer: Option<&str>) -> Result<AuthContext> {
        if self.entries.is_empty() {
            return Ok(AuthContext {
                user_id: "dev".into(),
                workspace_ids: vec![self.dev_workspace.clone()],
            });
        }

        let token = bearer.ok_or(Error::AuthN)?;
        let provided: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        for entry in &self.entries {
            if bool::from(provided.ct_eq(&entry.token_hash)) {
                return Ok(AuthContext {
                    user_id: entry.user_id.clone(),
                    workspace_ids: entry.workspace_ids.clone(),
                });
            }
        }
        Err(Error::AuthN)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Middleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Attach the verified [`AuthContext`] and resolved [`Workspace`] to
/// the request, or reject it.
pub async fn require_identity(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let auth = match state.verifier.verify(bearer) {
        Ok(ctx) => ctx,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let requested = req
        .headers()
        .get("x-workspace-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let workspace = match auth.resolve_workspace(requested.as_deref()) {
        Ok(ws) => ws,
        Err(e) => return ApiError::from(e).into_response(),
    };

    req.extensions_mut().insert(auth);
    req.extensions_mut().insert(Workspace(workspace));
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fl_domain::config::TokenBinding;

    #[test]
    fn dev_mode_with_no_tokens() {
        let verifier = StaticTokenVerifier::from_config(&AuthConfig::default());
        let ctx = verifier.verify(None).unwrap();
        assert_eq!(ctx.user_id, "dev");
        assert_eq!(ctx.workspace_ids, vec!["dev".to_string()]);
    }

    #[test]
    fn token_round_trip() {
        std::env::set_var("FL_TEST_TOKEN_A", "s3cret-token-value");
        let config = AuthConfig {
            tokens: vec![TokenBinding {
                token_env: "FL_TEST_TOKEN_A".into(),
                user_id: "u-1".into(),
                workspace_ids: vec!["ws-a".into(), "ws-b".into()],
            }],
            dev_workspace: "dev".into(),
        };
        let verifier = StaticTokenVerifier::from_config(&config);

        let ctx = verifier.verify(Some("s3cret-token-value")).unwrap();
        assert_eq!(ctx.user_id, "u-1");

        assert!(verifier.verify(Some("wrong")).is_err());
        assert!(verifier.verify(None).is_err());
    }

    #[test]
    fn workspace_resolution_enforces_membership() {
        let ctx = AuthContext {
            user_id: "u".into(),
            workspace_ids: vec!["ws-a".into(), "ws-b".into()],
        };
        assert_eq!(ctx.resolve_workspace(None).unwrap(), "ws-a");
        assert_eq!(ctx.resolve_workspace(Some("ws-b")).unwrap(), "ws-b");
        assert!(ctx.resolve_workspace(Some("ws-c")).is_err());
    }
}
