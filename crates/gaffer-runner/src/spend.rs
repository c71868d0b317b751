// SPDX-License-Identifier: MIT OR Apache-2.0
//! Spend governor: aggregate-ledger checks at every cost-incurring stage
//! boundary. All comparisons are strict (`>`), so equality at a cap passes,
//! and the calendar windows are UTC.

use chrono::{Datelike, Utc};
use gaffer_config::Settings;
use gaffer_store::JobStore;
use gaffer_telemetry::Metrics;
use uuid::Uuid;

use crate::error::StageError;

/// Re-evaluate the daily, monthly, and per-job caps against the ledger.
pub fn check_spend_caps(
    store: &JobStore,
    settings: &Settings,
    metrics: &Metrics,
    job_id: Uuid,
) -> Result<(), StageError> {
    let job = store
        .get_job(job_id)?
        .ok_or_else(|| StageError::code("JOB_NOT_FOUND"))?;

    let now = Utc::now();
    let daily = store.daily_cost(now.date_naive())?;
    let monthly = store.monthly_cost(now.year(), now.month())?;
    metrics.spend_daily.set(daily);
    metrics.spend_monthly.set(monthly);

    if daily > settings.max_usd_per_day {
        return Err(StageError::code("CAP_DAILY_BUDGET_EXCEEDED"));
    }
    if monthly > settings.max_usd_per_month {
        return Err(StageError::code("CAP_MONTHLY_BUDGET_EXCEEDED"));
    }
    if job.cost_usd > job.caps.max_usd {
        return Err(StageError::code("CAP_COST_EXCEEDED"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaffer_core::JobSpec;

    fn fixture() -> (JobStore, Settings, Metrics, Uuid) {
        let store = JobStore::open(":memory:").unwrap();
        store.init_schema().unwrap();
        let job = store.create_job(&JobSpec::new("acme/repo", 1)).unwrap();
        (store, Settings::default(), Metrics::new(), job.id)
    }

    #[test]
    fn missing_job_is_fatal() {
        let (store, settings, metrics, _) = fixture();
        let err = check_spend_caps(&store, &settings, &metrics, Uuid::new_v4()).unwrap_err();
        assert_eq!(err.reason(), "JOB_NOT_FOUND");
    }

    #[test]
    fn within_caps_passes_and_updates_gauges() {
        let (store, settings, metrics, job_id) = fixture();
        store.add_cost(job_id, "m", 10, 10, 0.5).unwrap();
        check_spend_caps(&store, &settings, &metrics, job_id).unwrap();
        assert!((metrics.spend_daily.get() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn daily_cap_uses_strict_comparison() {
        let store = JobStore::open(":memory:").unwrap();
        store.init_schema().unwrap();
        let mut spec = JobSpec::new("acme/repo", 1);
        spec.caps.max_usd = 50.0;
        let job = store.create_job(&spec).unwrap();
        let metrics = Metrics::new();
        let mut settings = Settings::default();
        settings.max_usd_per_day = 40.0;
        settings.max_usd_per_month = 1000.0;

        // Equality at the cap is allowed.
        store.add_cost(job.id, "m", 1, 1, 40.0).unwrap();
        check_spend_caps(&store, &settings, &metrics, job.id).unwrap();

        // One cent over trips the daily check first.
        store.add_cost(job.id, "m", 1, 1, 0.01).unwrap();
        let err = check_spend_caps(&store, &settings, &metrics, job.id).unwrap_err();
        assert_eq!(err.reason(), "CAP_DAILY_BUDGET_EXCEEDED");
    }

    #[test]
    fn monthly_cap_breach() {
        let (store, mut settings, metrics, job_id) = fixture();
        settings.max_usd_per_day = 1000.0;
        settings.max_usd_per_month = 10.0;
        store.add_cost(job_id, "m", 1, 1, 10.01).unwrap();
        let err = check_spend_caps(&store, &settings, &metrics, job_id).unwrap_err();
        assert_eq!(err.reason(), "CAP_MONTHLY_BUDGET_EXCEEDED");
    }

    #[test]
    fn job_cap_breach() {
        let (store, settings, metrics, job_id) = fixture();
        // Default per-job cap is 3.0; cluster caps are far higher.
        store.add_cost(job_id, "m", 1, 1, 3.01).unwrap();
        let err = check_spend_caps(&store, &settings, &metrics, job_id).unwrap_err();
        assert_eq!(err.reason(), "CAP_COST_EXCEEDED");
    }
}
