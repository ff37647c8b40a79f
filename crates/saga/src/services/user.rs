//! User profile collaborator.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::UserId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::SagaError;

/// Identity and contact data of a customer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl UserProfile {
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: email.into(),
        }
    }
}

/// Trait for user profile lookups.
#[async_trait]
pub trait UserService: Send + Sync {
    async fn get_profile(&self, user_id: UserId) -> Result<UserProfile, SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryUserState {
    profiles: HashMap<UserId, UserProfile>,
    fail_on_get: bool,
}

/// In-memory user service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryUserService {
    state: Arc<RwLock<InMemoryUserState>>,
}

impl InMemoryUserService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a profile.
    pub async fn insert(&self, user_id: UserId, profile: UserProfile) {
        self.state.write().await.profiles.insert(user_id, profile);
    }

    /// Configures the service to fail on profile lookups.
    pub async fn set_fail_on_get(&self, fail: bool) {
        self.state.write().await.fail_on_get = fail;
    }
}

#[async_trait]
impl UserService for InMemoryUserService {
    async fn get_profile(&self, user_id: UserId) -> Result<UserProfile, SagaError> {
        let state = self.state.read().await;
        if state.fail_on_get {
            return Err(SagaError::collaborator("user", "user service unavailable"));
        }
        state
            .profiles
            .get(&user_id)
            .cloned()
            .ok_or_else(|| {
                SagaError::collaborator("user", format!("no profile for user {user_id}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_profile_lookup() {
        let service = InMemoryUserService::new();
        let user = UserId::new(3);
        service
            .insert(user, UserProfile::new("Ada", "Lovelace", "ada@example.com"))
            .await;

        let profile = service.get_profile(user).await.unwrap();
        assert_eq!(profile.email, "ada@example.com");
        assert!(service.get_profile(UserId::new(4)).await.is_err());
    }
}
