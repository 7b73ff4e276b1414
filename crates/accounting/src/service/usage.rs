use chrono::{DateTime, Utc};

use crate::{AccountingError, ReportUsageRequest, ResultAccounting, ScopedUsage};

use super::{AccountingService, wallet_or_init};

impl AccountingService {
    /// Applies a usage report. Returns `false` when the wallet is locked
    /// afterwards.
    ///
    /// Absolute reports are turned into a delta against the last value of
    /// their scope, or against the wallet's local usage when unscoped. A
    /// lower absolute value gives back usage that never propagated past the
    /// wallet; what its parents already absorbed stays recorded there.
    pub fn report_usage(
        &self,
        now: DateTime<Utc>,
        request: &ReportUsageRequest,
    ) -> ResultAccounting<bool> {
        if request.usage < 0 {
            return Err(AccountingError::InvalidUsage(format!(
                "usage must not be negative, got {}",
                request.usage
            )));
        }

        let bucket = self
            .bucket(&request.category)
            .ok_or_else(|| AccountingError::KeyNotFound("unknown category".to_string()))?;
        let owner = self.owner(&request.owner)?;

        let scope = request
            .description
            .scope
            .as_deref()
            .map(|scope| self.scope_or_init(ScopedUsage::key(owner, scope)));

        let mut bucket = bucket.write();
        let mut scope = scope.as_ref().map(|scope| scope.lock());

        let existing = bucket.wallet_by_owner(owner);
        let current = match (&scope, existing) {
            (Some(scope), _) => scope.usage,
            (None, Some(wallet)) => bucket.wallet(wallet).map_or(0, |w| w.local_usage),
            (None, None) => 0,
        };
        let reported = if request.is_delta_charge {
            current.checked_add(request.usage).ok_or_else(|| {
                AccountingError::InvalidUsage(format!("usage of {} would overflow", request.owner))
            })?
        } else {
            request.usage
        };
        let delta = reported - current;

        let wallet = wallet_or_init(&mut bucket, now, owner);
        let locked = if delta < 0 {
            bucket.release(wallet, -delta)?;
            bucket.wallet(wallet).is_some_and(|w| w.was_locked)
        } else {
            bucket.charge(now, wallet, delta)?.locked
        };

        if let Some(scope) = scope.as_mut()
            && delta != 0
        {
            scope.usage = reported;
            scope.dirty = true;
        }

        Ok(!locked)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{AllocateCmd, ProductCategoryId};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn service_with_quota(quota: i64) -> (AccountingService, ProductCategoryId) {
        let service = AccountingService::new();
        let category = ProductCategoryId::new("cpu", "hpc");
        let wallet = service.wallet_by_owner(at(0), &category, "alice").unwrap();
        service
            .allocate(at(0), &AllocateCmd::new(category.clone(), wallet, quota, at(0), at(100)))
            .unwrap();
        (service, category)
    }

    #[test]
    fn unknown_category_is_not_found() {
        let service = AccountingService::new();
        let request = ReportUsageRequest::delta("alice", ProductCategoryId::new("gpu", "hpc"), 1);
        let err = service.report_usage(at(1), &request).unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn absolute_report_becomes_delta() {
        let (service, category) = service_with_quota(100);
        assert!(service
            .report_usage(at(1), &ReportUsageRequest::absolute("alice", category.clone(), 30))
            .unwrap());
        assert!(service
            .report_usage(at(2), &ReportUsageRequest::absolute("alice", category.clone(), 45))
            .unwrap());

        let wallet = service.wallet_by_owner(at(2), &category, "alice").unwrap();
        assert_eq!(service.max_usable(at(2), wallet), Some(55));

        // All 45 already went to the root group, nothing can be given back.
        assert!(service
            .report_usage(at(3), &ReportUsageRequest::absolute("alice", category, 40))
            .unwrap());
        let snapshot = service.wallet_snapshot(at(3), wallet, false).unwrap();
        assert_eq!(snapshot.local_usage, 45);
        assert_eq!(snapshot.propagated_usage, 45);
        assert_eq!(service.max_usable(at(3), wallet), Some(55));
    }

    #[test]
    fn lower_absolute_report_releases_excess() {
        let (service, category) = service_with_quota(50);
        let report = |usage| ReportUsageRequest::absolute("alice", category.clone(), usage);
        assert!(!service.report_usage(at(1), &report(500)).unwrap());

        assert!(!service.report_usage(at(2), &report(450)).unwrap());
        let wallet = service.wallet_by_owner(at(2), &category, "alice").unwrap();
        let snapshot = service.wallet_snapshot(at(2), wallet, false).unwrap();
        assert_eq!(snapshot.local_usage, 450);
        assert_eq!(snapshot.total_usage, 450);
        assert_eq!(snapshot.propagated_usage, 50);

        // Going below what propagated stops at the propagated amount.
        service.report_usage(at(3), &report(10)).unwrap();
        let snapshot = service.wallet_snapshot(at(3), wallet, false).unwrap();
        assert_eq!(snapshot.local_usage, 50);
        assert_eq!(snapshot.propagated_usage, 50);
        assert!(snapshot.locked);

        // The next report is again relative to the local usage.
        service.report_usage(at(4), &report(60)).unwrap();
        let snapshot = service.wallet_snapshot(at(4), wallet, false).unwrap();
        assert_eq!(snapshot.local_usage, 60);
    }

    #[test]
    fn lower_scoped_report_moves_the_scope() {
        let (service, category) = service_with_quota(10);
        let job = |usage| ReportUsageRequest::absolute("alice", category.clone(), usage).scope("job");
        service.report_usage(at(1), &job(30)).unwrap();
        service.report_usage(at(2), &job(25)).unwrap();

        let wallet = service.wallet_by_owner(at(2), &category, "alice").unwrap();
        assert_eq!(service.wallet_snapshot(at(2), wallet, false).unwrap().local_usage, 25);
        let scopes = service.collect_changes().scopes;
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].usage, 25);
    }

    #[test]
    fn scoped_reports_track_each_scope() {
        let (service, category) = service_with_quota(100);
        let job = |usage| ReportUsageRequest::absolute("alice", category.clone(), usage);

        service.report_usage(at(1), &job(10).scope("job-1")).unwrap();
        service.report_usage(at(1), &job(20).scope("job-2")).unwrap();
        service.report_usage(at(2), &job(15).scope("job-1")).unwrap();

        let wallet = service.wallet_by_owner(at(2), &category, "alice").unwrap();
        let snapshot = service.wallet_snapshot(at(2), wallet, false).unwrap();
        assert_eq!(snapshot.local_usage, 35);

        let scopes = service.collect_changes().scopes;
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes.iter().map(|s| s.usage).sum::<i64>(), 35);
    }

    #[test]
    fn over_quota_report_fails_softly() {
        let (service, category) = service_with_quota(10);
        let ok = service
            .report_usage(at(1), &ReportUsageRequest::delta("alice", category, 11))
            .unwrap();
        assert!(!ok);
    }

    #[test]
    fn charge_without_wallet_creates_one() {
        let (service, category) = service_with_quota(10);
        let ok = service
            .report_usage(at(1), &ReportUsageRequest::delta("bob", category.clone(), 0))
            .unwrap();
        assert!(!ok);
        let wallet = service.wallet_by_owner(at(1), &category, "bob").unwrap();
        assert_eq!(service.max_usable(at(1), wallet), Some(0));
    }

    #[test]
    fn empty_owner_is_rejected() {
        let (service, category) = service_with_quota(10);
        let err = service
            .report_usage(at(1), &ReportUsageRequest::delta("  ", category, 1))
            .unwrap_err();
        assert!(matches!(err, AccountingError::InvalidOwner(_)));
    }
}
