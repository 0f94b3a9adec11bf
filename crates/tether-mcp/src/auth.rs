//! Auth boundary adapter.
//!
//! The engine asks an injected [`Authenticator`] for an [`AuthContext`] before
//! running a handler whose method was marked with `require_auth`. How tokens
//! are issued or stored is up to the adapter.

use crate::protocol::RpcError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use subtle::ConstantTimeEq;

/// Identity attached to an authenticated inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub subject_id: String,
    pub client_id: String,
    pub scopes: BTreeSet<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthContext {
    pub fn new(subject_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            client_id: client_id.into(),
            scopes: BTreeSet::new(),
            expires_at: None,
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes.extend(scopes.into_iter().map(Into::into));
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

/// What the authenticator gets to look at.
#[derive(Debug, Clone)]
pub struct AuthRequest<'a> {
    pub method: &'a str,
    pub params: Option<&'a Value>,
    /// Credentials reported by the transport.
    pub credentials: Option<&'a str>,
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthDenial {
    /// No valid identity was presented.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// The identity lacks permission.
    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl AuthDenial {
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            AuthDenial::Unauthorized(msg) => RpcError::unauthorized(msg.clone()),
            AuthDenial::Forbidden(msg) => RpcError::forbidden(msg.clone()),
        }
    }
}

/// Verifies inbound requests.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest<'_>) -> Result<AuthContext, AuthDenial>;
}

/// Methods that require authentication, with the scopes each one needs.
#[derive(Debug, Clone, Default)]
pub struct AuthRequirements {
    methods: HashMap<String, BTreeSet<String>>,
}

impl AuthRequirements {
    pub fn require<I, S>(&mut self, method: impl Into<String>, scopes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods
            .insert(method.into(), scopes.into_iter().map(Into::into).collect());
    }

    pub fn scopes_for(&self, method: &str) -> Option<&BTreeSet<String>> {
        self.methods.get(method)
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Check an authenticated context against the scopes a method needs.
pub fn authorize(context: &AuthContext, required: &BTreeSet<String>) -> Result<(), AuthDenial> {
    if context.is_expired() {
        return Err(AuthDenial::Unauthorized("token expired".to_string()));
    }
    let missing: Vec<&str> = required
        .iter()
        .filter(|scope| !context.has_scope(scope))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AuthDenial::Forbidden(format!(
            "missing scope(s): {}",
            missing.join(", ")
        )))
    }
}

/// Accepts a fixed set of bearer tokens, each mapped to an identity.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: Vec<(String, AuthContext)>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, context: AuthContext) -> Self {
        self.tokens.push((token.into(), context));
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, request: &AuthRequest<'_>) -> Result<AuthContext, AuthDenial> {
        let presented = request
            .credentials
            .ok_or_else(|| AuthDenial::Unauthorized("missing credentials".to_string()))?;

        // Compare against every token so timing does not reveal which one matched.
        let mut matched = None;
        for (token, context) in &self.tokens {
            if constant_time_eq(presented, token) && matched.is_none() {
                matched = Some(context);
            }
        }
        matched
            .cloned()
            .ok_or_else(|| AuthDenial::Unauthorized("invalid token".to_string()))
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
