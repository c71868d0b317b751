// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pre-execution approval gate. Elevated risk classes block on a specific
//! recorded action; code and deps run straight through (their `merge`
//! approval is an out-of-band concern tracked in job metadata).

use gaffer_core::{ApprovalAction, RiskClass};
use gaffer_store::{JobStore, StoreError};
use uuid::Uuid;

/// The approval action a risk class requires before dispatch, if any.
pub fn required_pregate_action(risk: RiskClass) -> Option<ApprovalAction> {
    match risk {
        RiskClass::Infra => Some(ApprovalAction::Infra),
        RiskClass::Secrets => Some(ApprovalAction::Secrets),
        RiskClass::Destructive => Some(ApprovalAction::Destructive),
        RiskClass::Code | RiskClass::Deps => None,
    }
}

/// Whether the job may proceed past the pre-gate.
pub fn pregate_satisfied(
    store: &JobStore,
    job_id: Uuid,
    risk: RiskClass,
) -> Result<bool, StoreError> {
    match required_pregate_action(risk) {
        None => Ok(true),
        Some(action) => store.has_approval(job_id, action),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaffer_core::JobSpec;

    #[test]
    fn code_and_deps_have_no_pregate() {
        assert_eq!(required_pregate_action(RiskClass::Code), None);
        assert_eq!(required_pregate_action(RiskClass::Deps), None);
    }

    #[test]
    fn elevated_risks_map_to_their_action() {
        assert_eq!(
            required_pregate_action(RiskClass::Infra),
            Some(ApprovalAction::Infra)
        );
        assert_eq!(
            required_pregate_action(RiskClass::Secrets),
            Some(ApprovalAction::Secrets)
        );
        assert_eq!(
            required_pregate_action(RiskClass::Destructive),
            Some(ApprovalAction::Destructive)
        );
    }

    #[test]
    fn gate_opens_only_on_the_matching_action() {
        let store = JobStore::open(":memory:").unwrap();
        store.init_schema().unwrap();
        let mut spec = JobSpec::new("acme/repo", 5);
        spec.risk_class = RiskClass::Destructive;
        let job = store.create_job(&spec).unwrap();

        assert!(!pregate_satisfied(&store, job.id, RiskClass::Destructive).unwrap());

        // The wrong action does not open the gate.
        store
            .add_approval(job.id, ApprovalAction::Merge, "op", true, None)
            .unwrap();
        assert!(!pregate_satisfied(&store, job.id, RiskClass::Destructive).unwrap());

        store
            .add_approval(job.id, ApprovalAction::Destructive, "op", true, None)
            .unwrap();
        assert!(pregate_satisfied(&store, job.id, RiskClass::Destructive).unwrap());
    }
}
