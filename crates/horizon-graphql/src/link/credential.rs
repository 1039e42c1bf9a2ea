//! Credential attachment.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;

use crate::error::Result;
use crate::link::{Link, NextLink, OperationOutcome};
use crate::operation::Operation;

/// Source of the bearer credential attached to outgoing operations.
///
/// Consulted once per operation dispatch and once per streaming connection
/// attempt, so a rotated token is picked up without rebuilding the client.
pub trait CredentialProvider: Send + Sync + 'static {
    /// The current bearer token, or `None` when the session is anonymous.
    fn bearer_token(&self) -> BoxFuture<'static, Option<String>>;
}

/// A fixed token, or a permanently anonymous session.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: Option<String>,
}

impl StaticToken {
    /// A provider that always yields the given token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// A provider that never yields a token.
    pub fn anonymous() -> Self {
        Self { token: None }
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> BoxFuture<'static, Option<String>> {
        let token = self.token.clone();
        Box::pin(async move { token })
    }
}

/// A token slot that can be rotated while the client is live.
///
/// Clones share the slot, so one handle can sit inside the client while
/// another belongs to whatever refreshes the session.
#[derive(Debug, Clone, Default)]
pub struct SharedToken {
    slot: Arc<RwLock<Option<String>>>,
}

impl SharedToken {
    /// An empty (anonymous) slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current token.
    pub fn set(&self, token: impl Into<String>) {
        *self.slot.write() = Some(token.into());
    }

    /// Clears the slot, returning the session to anonymous.
    pub fn clear(&self) {
        *self.slot.write() = None;
    }

    /// The token currently in the slot.
    pub fn current(&self) -> Option<String> {
        self.slot.read().clone()
    }
}

impl CredentialProvider for SharedToken {
    fn bearer_token(&self) -> BoxFuture<'static, Option<String>> {
        let token = self.current();
        Box::pin(async move { token })
    }
}

/// Pipeline stage that attaches the bearer credential.
///
/// When the provider yields a token, an `Authorization: Bearer <token>`
/// header is set on the operation context. An anonymous provider leaves the
/// operation untouched; an unauthenticated request then surfaces as an
/// authorization failure from the server rather than a client-side error.
pub struct CredentialLink {
    provider: Arc<dyn CredentialProvider>,
}

impl CredentialLink {
    /// Creates the stage around a credential provider.
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self { provider }
    }
}

impl Link for CredentialLink {
    fn request(
        &self,
        mut operation: Operation,
        next: NextLink,
    ) -> BoxFuture<'static, Result<OperationOutcome>> {
        let provider = Arc::clone(&self.provider);
        Box::pin(async move {
            if let Some(token) = provider.bearer_token().await {
                operation
                    .context_mut()
                    .headers
                    .insert("Authorization".to_string(), format!("Bearer {token}"));
            }
            next.run(operation).await
        })
    }
}
