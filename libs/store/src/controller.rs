use crate::crd::Store;
use crate::reconcile::{STORE_LABEL_KEY, reconcile_store};

use storeop_operator::backoff_reconciler;
use storeop_operator::controller::{ControllerId, State, check_api_queryable, error_policy};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::client::Client;
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher;
use tokio::time::Duration;
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "store";

/// Initialize the Store controller from shared state
pub async fn run(state: State, client: Client) {
    let store = check_api_queryable::<Store>(client.clone()).await;
    let statefulset = check_api_queryable::<StatefulSet>(client.clone()).await;
    let service = check_api_queryable::<Service>(client.clone()).await;
    let configmap = check_api_queryable::<ConfigMap>(client.clone()).await;
    let secret = check_api_queryable::<Secret>(client.clone()).await;
    let pdb = check_api_queryable::<PodDisruptionBudget>(client.clone()).await;

    let ctx = state.to_context::<Store>(client, CONTROLLER_ID);

    // children carry the cluster label; watching on it keeps the streams
    // scoped to owned objects
    let owned = || watcher::Config::default().labels(STORE_LABEL_KEY);

    info!(msg = "starting store controller");
    ctx.metrics.ready_set(1);
    Controller::new(store, watcher::Config::default().any_semantic())
        // debounce to filter out reconcile calls in quick succession (only taking the latest)
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .owns(statefulset, owned())
        .owns(service, owned())
        .owns(configmap, owned())
        .owns(secret, owned())
        .owns(pdb, owned())
        .shutdown_on_signal()
        .run(backoff_reconciler!(reconcile_store), error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
