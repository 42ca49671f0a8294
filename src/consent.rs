//! Consent oracle seam.
//!
//! AI processing of a user's messages requires an affirmative consent
//! record. The backing store is a collaborator; the in-memory
//! implementation covers single-process deployments and tests.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::chat::UserId;
use crate::errors::Result;

/// Consent kind gating AI summarization.
pub const CONSENT_AI_PROCESSING: &str = "ai_processing";

#[async_trait]
pub trait ConsentOracle: Send + Sync {
    async fn has_consent(&self, user: UserId, kind: &str) -> Result<bool>;
}

#[derive(Default)]
pub struct InMemoryConsentOracle {
    grants: Mutex<HashSet<(UserId, String)>>,
}

impl InMemoryConsentOracle {
    pub fn grant(&self, user: UserId, kind: &str) {
        self.grants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((user, kind.to_string()));
    }

    pub fn revoke(&self, user: UserId, kind: &str) {
        self.grants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(user, kind.to_string()));
    }
}

#[async_trait]
impl ConsentOracle for InMemoryConsentOracle {
    async fn has_consent(&self, user: UserId, kind: &str) -> Result<bool> {
        Ok(self
            .grants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(user, kind.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn consent_is_per_user_and_kind() {
        let oracle = InMemoryConsentOracle::default();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        oracle.grant(alice, CONSENT_AI_PROCESSING);
        assert!(oracle.has_consent(alice, CONSENT_AI_PROCESSING).await.unwrap());
        assert!(!oracle.has_consent(bob, CONSENT_AI_PROCESSING).await.unwrap());
        assert!(!oracle.has_consent(alice, "marketing").await.unwrap());

        oracle.revoke(alice, CONSENT_AI_PROCESSING);
        assert!(!oracle.has_consent(alice, CONSENT_AI_PROCESSING).await.unwrap());
    }
}
