use chrono::{DateTime, Utc};

use crate::{AccountingError, ProductCategoryId, ResultAccounting, ScanOutcome};

use super::AccountingService;

impl AccountingService {
    /// Runs the lifecycle scan over one category.
    pub fn scan_allocations(
        &self,
        category: &ProductCategoryId,
        now: DateTime<Utc>,
    ) -> ResultAccounting<ScanOutcome> {
        let bucket = self
            .bucket(category)
            .ok_or_else(|| AccountingError::KeyNotFound(category.to_string()))?;
        let outcome = bucket.write().scan_allocations(now);
        Ok(outcome)
    }

    /// Runs the lifecycle scan over every category, one bucket at a time in
    /// category order.
    pub fn scan_all(&self, now: DateTime<Utc>) -> ScanOutcome {
        let mut total = ScanOutcome::default();
        for bucket in self.all_buckets() {
            total += bucket.write().scan_allocations(now);
        }
        if !total.is_empty() {
            tracing::info!(
                "Scan activated {} and retired {} allocations",
                total.activated,
                total.retired
            );
        }
        total
    }
}
