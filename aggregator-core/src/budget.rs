use async_trait::async_trait;
use dashmap::DashMap;

use crate::{error::BoxError, report::PrivacyBudgetKey};

/// Result of asking the budget service for one unit of budget.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BudgetOutcome {
    Granted,
    Exhausted,
}

/// The budget service could not answer. The worker cannot guarantee budget
/// correctness without it, so this fails the whole job.
#[derive(Debug, thiserror::Error)]
#[error("privacy budget service unavailable: {0}")]
pub struct BudgetUnavailableError(#[source] pub BoxError);

/// External collaborator that meters privacy budget. Called once per eligible
/// report, after its budget key fields passed validation and before any of
/// its contributions are counted.
///
/// Implementations must be linearizable per key: concurrent calls for the
/// same key must never hand out more budget than the key has left.
#[async_trait]
pub trait PrivacyBudgetingServiceBridge: Send + Sync {
    /// Consumes one unit of budget for `key` if any is left.
    ///
    /// ## Errors
    /// If the budget service cannot be reached or gives no authoritative
    /// answer.
    async fn consume_budget(
        &self,
        key: &PrivacyBudgetKey,
    ) -> Result<BudgetOutcome, BudgetUnavailableError>;
}

/// Grants every request. For local runs and tests where budget enforcement
/// is out of scope.
pub struct UnlimitedPrivacyBudget;

#[async_trait]
impl PrivacyBudgetingServiceBridge for UnlimitedPrivacyBudget {
    async fn consume_budget(
        &self,
        _key: &PrivacyBudgetKey,
    ) -> Result<BudgetOutcome, BudgetUnavailableError> {
        Ok(BudgetOutcome::Granted)
    }
}

/// In-memory budget with a fixed per-key capacity. The spend counter is
/// updated under the map's per-key entry lock, so two concurrent requests
/// for the last unit resolve to exactly one `Granted`.
pub struct InMemoryPrivacyBudget {
    capacity: u32,
    spent: DashMap<PrivacyBudgetKey, u32>,
}

impl InMemoryPrivacyBudget {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            spent: DashMap::new(),
        }
    }

    #[must_use]
    pub fn spent(&self, key: &PrivacyBudgetKey) -> u32 {
        self.spent.get(key).map_or(0, |v| *v)
    }
}

#[async_trait]
impl PrivacyBudgetingServiceBridge for InMemoryPrivacyBudget {
    async fn consume_budget(
        &self,
        key: &PrivacyBudgetKey,
    ) -> Result<BudgetOutcome, BudgetUnavailableError> {
        let mut spent = self.spent.entry(key.clone()).or_insert(0);
        if *spent < self.capacity {
            *spent += 1;
            Ok(BudgetOutcome::Granted)
        } else {
            Ok(BudgetOutcome::Exhausted)
        }
    }
}
