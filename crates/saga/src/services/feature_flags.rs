//! Feature flag service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::ServiceError;

/// Trait for the feature flag collaborator.
#[async_trait]
pub trait FeatureFlagService: Send + Sync {
    /// Returns whether the named flag is on. Unknown flags are `NotFound`.
    async fn is_enabled(&self, name: &str) -> Result<bool, ServiceError>;
}

/// In-memory feature flags for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFeatureFlagService {
    flags: Arc<RwLock<HashMap<String, bool>>>,
}

impl InMemoryFeatureFlagService {
    /// Creates a new in-memory flag service with no flags defined.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines or updates a flag.
    pub async fn set_flag(&self, name: impl Into<String>, enabled: bool) {
        self.flags.write().await.insert(name.into(), enabled);
    }
}

#[async_trait]
impl FeatureFlagService for InMemoryFeatureFlagService {
    async fn is_enabled(&self, name: &str) -> Result<bool, ServiceError> {
        self.flags
            .read()
            .await
            .get(name)
            .copied()
            .ok_or_else(|| ServiceError::NotFound(format!("feature flag '{name}'")))
    }
}
