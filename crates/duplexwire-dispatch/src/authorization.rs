//! Per-operation authorization, run before invocation.

use async_trait::async_trait;
use duplexwire_session::Principal;

use crate::descriptor::OperationDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationDecision {
    Allow,
    Deny(String),
}

/// Decides whether a caller may invoke an operation.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        principal: Option<&Principal>,
        operation: &OperationDescriptor,
    ) -> AuthorizationDecision;
}

/// Allows every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(
        &self,
        _principal: Option<&Principal>,
        _operation: &OperationDescriptor,
    ) -> AuthorizationDecision {
        AuthorizationDecision::Allow
    }
}

/// Denies calls without an authenticated principal.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireAuthenticated;

#[async_trait]
impl Authorizer for RequireAuthenticated {
    async fn authorize(
        &self,
        principal: Option<&Principal>,
        operation: &OperationDescriptor,
    ) -> AuthorizationDecision {
        match principal {
            Some(principal) if principal.authenticated => AuthorizationDecision::Allow,
            _ => AuthorizationDecision::Deny(format!(
                "operation '{}' requires an authenticated caller",
                operation.name
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op() -> OperationDescriptor {
        OperationDescriptor::request_reply("Echo", "echo")
    }

    #[tokio::test]
    async fn allow_all_allows_anonymous() {
        assert_eq!(
            AllowAll.authorize(None, &op()).await,
            AuthorizationDecision::Allow
        );
    }

    #[tokio::test]
    async fn require_authenticated() {
        let alice = Principal::authenticated("alice");
        assert_eq!(
            RequireAuthenticated.authorize(Some(&alice), &op()).await,
            AuthorizationDecision::Allow
        );
        assert!(matches!(
            RequireAuthenticated.authorize(None, &op()).await,
            AuthorizationDecision::Deny(_)
        ));
        assert!(matches!(
            RequireAuthenticated
                .authorize(Some(&Principal::anonymous()), &op())
                .await,
            AuthorizationDecision::Deny(_)
        ));
    }
}
