use crate::crd::Store;
use crate::reconcile::SyncOutcome;
use crate::replication::MIN_FAILOVER_SIZE;

use storeop_operator::controller::Context;
use storeop_operator::error::Result;

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

#[allow(async_fn_in_trait)]
pub trait PodDisruptionBudgetExt {
    fn generate_pod_disruption_budget(&self) -> PodDisruptionBudget;
    async fn sync_pod_disruption_budget(&self, ctx: &Context<Store>) -> Result<SyncOutcome>;
}

impl PodDisruptionBudgetExt for Store {
    /// Voluntary disruptions must leave the failover quorum intact.
    fn generate_pod_disruption_budget(&self) -> PodDisruptionBudget {
        PodDisruptionBudget {
            metadata: self.child_meta(self.resource_name()),
            spec: Some(PodDisruptionBudgetSpec {
                min_available: Some(IntOrString::Int(MIN_FAILOVER_SIZE as i32)),
                selector: Some(LabelSelector {
                    match_labels: Some(self.selector_labels()),
                    ..LabelSelector::default()
                }),
                ..PodDisruptionBudgetSpec::default()
            }),
            ..PodDisruptionBudget::default()
        }
    }

    async fn sync_pod_disruption_budget(&self, ctx: &Context<Store>) -> Result<SyncOutcome> {
        let desired = self.generate_pod_disruption_budget();
        // the spec cannot be updated in place on the targeted API version, so
        // only label drift is reconciled
        self.sync_resource(
            ctx,
            desired,
            |current, desired| current.metadata.labels != desired.metadata.labels,
            |current, desired| {
                current.metadata.labels = desired.metadata.labels;
            },
        )
        .await
    }
}
