mod configmap;
mod pdb;
mod secret;
mod service;
mod statefulset;

use crate::crd::{Store, StoreStatus};
use crate::reconcile::configmap::{ConfigMapExt, ConfigOptions};
use crate::reconcile::pdb::PodDisruptionBudgetExt;
use crate::reconcile::secret::SecretExt;
use crate::reconcile::service::{ServiceExt, ServiceVariant};
use crate::reconcile::statefulset::StatefulSetExt;
use crate::replication::error::ReplicationError;
use crate::replication::{Address, DEFAULT_FAILOVER_TIMEOUT, Replication};

use storeop_k8s_util::pods::{is_running_and_ready, pod_ip};
use storeop_k8s_util::types::short_type_name;
use storeop_operator::controller::{Context, DEFAULT_RECONCILE_INTERVAL};
use storeop_operator::error::{Error, Result};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Label keyed to the cluster name, applied to every owned object and used as
/// the member pod selector.
pub const STORE_LABEL_KEY: &str = "store";
/// Per-pod replication role label, assigned after reconfiguration.
pub const ROLE_LABEL_KEY: &str = "role";
pub const ROLE_PRIMARY: &str = "primary";
pub const ROLE_SECONDARY: &str = "secondary";
pub const SERVICE_TYPE_LABEL_KEY: &str = "service-type";

pub(crate) const DATA_PATH: &str = "/data";
pub(crate) const CONFIG_MOUNT_PATH: &str = "/etc/store";
pub(crate) const AUTH_MOUNT_PATH: &str = "/etc/store-auth";
pub(crate) const AUTH_FILE: &str = "auth.conf";
pub(crate) const CONFIG_KEY: &str = "conf";

static STOREOP_MANAGER: &str = "stores.storeop.rs";

/// Requeue interval after an applied change or a transient replication
/// condition; convergence usually needs another pass shortly after.
const SHORT_REQUEUE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncOutcome {
    Unchanged,
    Applied,
}

impl SyncOutcome {
    pub(crate) fn applied(self) -> bool {
        self == SyncOutcome::Applied
    }
}

enum PatchFailure {
    Conflict,
    Other(Error),
}

#[instrument(skip(ctx, store))]
pub async fn reconcile_store(store: Arc<Store>, ctx: Arc<Context<Store>>) -> Result<Action> {
    let _timer = ctx.metrics.reconcile_count_and_measure();
    info!(msg = "reconciling Store");

    if store.metadata.deletion_timestamp.is_some() {
        // children are collected through their owner references
        return Ok(Action::await_change());
    }

    // the credential is read on every cycle and lives only on this stack
    let password = store.fetch_password(ctx.as_ref()).await?;

    if store
        .sync_children(ctx.as_ref(), password.as_deref())
        .await?
        .applied()
    {
        return Ok(Action::requeue(SHORT_REQUEUE_INTERVAL));
    }

    let pods = store.list_ready_pods(ctx.as_ref()).await?;
    let addresses = pods
        .iter()
        .filter_map(|pod| pod_ip(pod).map(Address::from_ip))
        .collect::<Vec<_>>();
    let mut engine = match Replication::connect(addresses, password.as_deref()).await {
        Ok(engine) => engine,
        Err(e) => {
            debug!(msg = "replication engine unavailable, requeueing", %e);
            let _ignore_errors = ctx
                .recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "ReplicationUnavailable".to_string(),
                        note: Some(e.to_string()),
                        action: "EngineConstruction".to_string(),
                        secondary: None,
                    },
                    &store.object_ref(&()),
                )
                .await
                .map_err(|e| debug!(msg = "failed to publish event", %e));
            return Ok(Action::requeue(SHORT_REQUEUE_INTERVAL));
        }
    };

    let result = store
        .reconcile_members(ctx.as_ref(), &mut engine, &pods, password.is_some())
        .await;
    engine.disconnect();
    result
}

impl Store {
    #[inline]
    pub(crate) fn get_namespace(&self) -> String {
        // safe unwrap: Store is namespace scoped
        self.namespace().unwrap()
    }

    /// All child names derive from this.
    #[inline]
    pub(crate) fn resource_name(&self) -> String {
        format!("store-{}", self.name_any())
    }

    /// Stable identifier of the cluster, used to salt the credential hash.
    #[inline]
    pub(crate) fn cluster_id(&self) -> String {
        format!("{}/{}", self.get_namespace(), self.name_any())
    }

    #[inline]
    pub(crate) fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(STORE_LABEL_KEY.to_string(), self.name_any())])
    }

    /// The default label joined with the user's labels; user labels are never
    /// removed.
    #[inline]
    pub(crate) fn get_labels(&self) -> BTreeMap<String, String> {
        self.labels()
            .clone()
            .into_iter()
            .chain(self.selector_labels())
            .collect()
    }

    pub(crate) fn child_meta(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: self.namespace(),
            labels: Some(self.get_labels()),
            owner_references: self.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        }
    }

    /// Idempotent create-or-update of one child.
    ///
    /// A missing child is created with the controller owner reference; an
    /// existing one is compared with the kind-specific rule and updated only
    /// on a difference. Losing the optimistic-concurrency race is not an
    /// error: the change is reported as applied and the reconcile requeues.
    pub(crate) async fn sync_resource<K>(
        &self,
        ctx: &Context<Store>,
        desired: K,
        needs_update: impl FnOnce(&K, &K) -> bool,
        merge: impl FnOnce(&mut K, K),
    ) -> Result<SyncOutcome>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Serialize
            + DeserializeOwned
            + Clone
            + std::fmt::Debug,
    {
        let namespace = self.get_namespace();
        let name = desired.name_any();
        let kind = short_type_name::<K>().unwrap_or("resource");
        let api = Api::<K>::namespaced(ctx.client.clone(), &namespace);
        let current = api.get_opt(&name).await.map_err(|e| {
            Error::KubeError(format!("failed to get {kind}: {namespace}/{name}"), e)
        })?;
        match current {
            None => {
                debug!(msg = format!("creating {kind}"), namespace, name);
                match api.create(&PostParams::default(), &desired).await {
                    Ok(_) => Ok(SyncOutcome::Applied),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(SyncOutcome::Applied),
                    Err(e) => Err(Error::KubeError(
                        format!("failed to create {kind}: {namespace}/{name}"),
                        e,
                    )),
                }
            }
            Some(mut current) => {
                if !needs_update(&current, &desired) {
                    return Ok(SyncOutcome::Unchanged);
                }
                debug!(msg = format!("updating {kind}"), namespace, name);
                merge(&mut current, desired);
                match api.replace(&name, &PostParams::default(), &current).await {
                    Ok(_) => Ok(SyncOutcome::Applied),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {
                        debug!(msg = format!("conflicting {kind} update"), namespace, name);
                        Ok(SyncOutcome::Applied)
                    }
                    Err(e) => Err(Error::KubeError(
                        format!("failed to update {kind}: {namespace}/{name}"),
                        e,
                    )),
                }
            }
        }
    }

    /// Walk the child kinds in fixed order; the first applied change wins and
    /// the caller requeues so every pass starts from observed state.
    async fn sync_children(
        &self,
        ctx: &Context<Store>,
        password: Option<&str>,
    ) -> Result<SyncOutcome> {
        for variant in [
            ServiceVariant::AllMembers,
            ServiceVariant::Headless,
            ServiceVariant::PrimaryOnly,
        ] {
            if self.sync_service(ctx, variant).await?.applied() {
                return Ok(SyncOutcome::Applied);
            }
        }
        if let Some(password) = password {
            if self.sync_credential_secret(ctx, password).await?.applied() {
                return Ok(SyncOutcome::Applied);
            }
        }
        let opts = ConfigOptions {
            include_credential: password.is_some(),
            primary: None,
        };
        if self.sync_configmap(ctx, opts).await?.applied() {
            return Ok(SyncOutcome::Applied);
        }
        if self.sync_pod_disruption_budget(ctx).await?.applied() {
            return Ok(SyncOutcome::Applied);
        }
        if self.sync_statefulset(ctx, password).await?.applied() {
            return Ok(SyncOutcome::Applied);
        }
        Ok(SyncOutcome::Unchanged)
    }

    async fn list_ready_pods(&self, ctx: &Context<Store>) -> Result<Vec<Pod>> {
        let namespace = self.get_namespace();
        let pod_api = Api::<Pod>::namespaced(ctx.client.clone(), &namespace);
        let params =
            ListParams::default().labels(&format!("{STORE_LABEL_KEY}={}", self.name_any()));
        let pods = pod_api.list(&params).await.map_err(|e| {
            Error::KubeError(format!("failed to list pods in {namespace}"), e)
        })?;
        Ok(pods.items.into_iter().filter(is_running_and_ready).collect())
    }

    /// Steps after the children are settled: reconfigure replication, wait
    /// for the primary, publish its identity through pod labels, the
    /// configuration child and the status subresource.
    async fn reconcile_members(
        &self,
        ctx: &Context<Store>,
        engine: &mut Replication,
        pods: &[Pod],
        with_credential: bool,
    ) -> Result<Action> {
        if let Err(e) = engine.reconfigure().await {
            return match e {
                ReplicationError::Parse => Err(Error::ReplicationError(
                    "malformed replication report".to_string(),
                    Box::new(e),
                )),
                // partial failure is normal operation; observe again shortly
                _ => {
                    warn!(msg = "replication reconfiguration incomplete, requeueing", %e);
                    Ok(Action::requeue(SHORT_REQUEUE_INTERVAL))
                }
            };
        }

        let Some(primary) = settle_primary(engine).await else {
            warn!(msg = "primary did not settle in time, requeueing");
            return Ok(Action::requeue(SHORT_REQUEUE_INTERVAL));
        };
        info!(msg = "replication converged", primary = %primary);

        let (primary_pod, label_conflicts) = self.apply_role_labels(ctx, pods, &primary).await?;

        // the configuration now names the observed primary, so freshly
        // started members replicate from it immediately
        let opts = ConfigOptions {
            include_credential: with_credential,
            primary: Some(&primary),
        };
        self.sync_configmap(ctx, opts).await?;

        let status = StoreStatus {
            primary: primary_pod.unwrap_or_default(),
            replicas: pods.len() as i32,
        };
        let previous_primary = self
            .status
            .as_ref()
            .map(|s| s.primary.as_str())
            .unwrap_or_default();
        if !status.primary.is_empty() && status.primary != previous_primary {
            let _ignore_errors = ctx
                .recorder
                .publish(
                    &Event {
                        type_: EventType::Normal,
                        reason: "PrimaryElected".to_string(),
                        note: Some(format!(
                            "pod {} is now the replication primary",
                            status.primary
                        )),
                        action: "Failover".to_string(),
                        secondary: None,
                    },
                    &self.object_ref(&()),
                )
                .await
                .map_err(|e| debug!(msg = "failed to publish event", %e));
        }
        let status_conflict = self.update_status(ctx, status).await?;

        if label_conflicts || status_conflict {
            return Ok(Action::requeue(SHORT_REQUEUE_INTERVAL));
        }
        Ok(Action::requeue(DEFAULT_RECONCILE_INTERVAL))
    }

    /// Patch the role label on every pod in parallel. A single slot captures
    /// the first pod claiming the primary address; a second claimant is
    /// reported as an address conflict naming both pods. Conflicting patches
    /// are not errors, they translate to a requeue.
    async fn apply_role_labels(
        &self,
        ctx: &Context<Store>,
        pods: &[Pod],
        primary: &Address,
    ) -> Result<(Option<String>, bool)> {
        let pod_api = Api::<Pod>::namespaced(ctx.client.clone(), &self.get_namespace());
        let primary_claim: Mutex<Option<String>> = Mutex::new(None);
        let (error_tx, mut error_rx) = mpsc::channel::<PatchFailure>(pods.len().max(1));

        join_all(pods.iter().map(|pod| {
            let pod_api = pod_api.clone();
            let primary_claim = &primary_claim;
            let error_tx = error_tx.clone();
            async move {
                let name = pod.name_any();
                let role = match pod_ip(pod) == Some(primary.host.as_str()) {
                    true => ROLE_PRIMARY,
                    false => ROLE_SECONDARY,
                };
                if role == ROLE_PRIMARY {
                    // safe unwrap: the lock is held only for this check and
                    // no task panics while holding it
                    let mut claim = primary_claim.lock().unwrap();
                    match claim.as_ref() {
                        Some(first) => {
                            let _ = error_tx.try_send(PatchFailure::Other(Error::IpConflict(
                                first.clone(),
                                name,
                            )));
                            return;
                        }
                        None => *claim = Some(name.clone()),
                    }
                }
                if pod.labels().get(ROLE_LABEL_KEY).map(String::as_str) == Some(role) {
                    return;
                }
                debug!(msg = "labelling pod", pod = %name, role);
                let patch = json!({"metadata": {"labels": {ROLE_LABEL_KEY: role}}});
                match pod_api
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {
                        let _ = error_tx.try_send(PatchFailure::Conflict);
                    }
                    Err(e) => {
                        let _ = error_tx.try_send(PatchFailure::Other(Error::KubeError(
                            format!("failed to patch pod {name}"),
                            e,
                        )));
                    }
                }
            }
        }))
        .await;
        drop(error_tx);

        let mut conflicts = false;
        let mut failures = Vec::new();
        while let Some(failure) = error_rx.recv().await {
            match failure {
                PatchFailure::Conflict => conflicts = true,
                PatchFailure::Other(e) => failures.push(e),
            }
        }
        if failures.len() == 1 {
            return Err(failures.remove(0));
        }
        if !failures.is_empty() {
            return Err(Error::AggregateError(
                failures
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            ));
        }
        // safe unwrap: every task holding the lock has completed
        Ok((primary_claim.into_inner().unwrap(), conflicts))
    }

    /// Write the status subresource when it no longer reflects observed
    /// reality. Returns whether a conflicting writer won the race.
    async fn update_status(&self, ctx: &Context<Store>, status: StoreStatus) -> Result<bool> {
        if self.status.as_ref() == Some(&status) {
            return Ok(false);
        }
        let namespace = self.get_namespace();
        let name = self.name_any();
        debug!(msg = "updating Store status", namespace, name);
        let patch = Patch::Apply(json!({
            "apiVersion": "storeop.rs/v1beta1",
            "kind": "Store",
            "status": status,
        }));
        let store_api = Api::<Store>::namespaced(ctx.client.clone(), &namespace);
        match store_api
            .patch_status(&name, &PatchParams::apply(STOREOP_MANAGER).force(), &patch)
            .await
        {
            Ok(_) => Ok(false),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(true),
            Err(e) => {
                ctx.metrics.status_update_errors_inc();
                Err(Error::KubeError(
                    format!("failed to patch Store/status {namespace}/{name}"),
                    e,
                ))
            }
        }
    }
}

/// Poll the engine with exponential backoff until a primary address is
/// observable, bounded by [`DEFAULT_FAILOVER_TIMEOUT`].
async fn settle_primary(engine: &mut Replication) -> Option<Address> {
    let mut backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(1))
        .without_max_times()
        .build();
    tokio::time::timeout(DEFAULT_FAILOVER_TIMEOUT, async {
        loop {
            if engine.refresh().await.is_ok() {
                if let Some(address) = engine.primary_address() {
                    return address.clone();
                }
            }
            // safe unwrap: without_max_times yields delays indefinitely
            tokio::time::sleep(backoff.next().unwrap()).await;
        }
    })
    .await
    .ok()
}
