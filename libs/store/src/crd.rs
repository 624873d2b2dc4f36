use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, EmptyDirVolumeSource, LocalObjectReference, PersistentVolumeClaim,
    PodSecurityContext, ResourceRequirements, SecretKeySelector, SecurityContext, Toleration,
};
use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of the desired behavior of the Store cluster. More info:
/// https://github.com/kubernetes/community/blob/master/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
// workaround: '`' character is not allowed in the kube `doc` attribute during doctests
#[cfg_attr(
    not(doctest),
    kube(
        doc = r#"The `Store` custom resource definition (CRD) defines a desired highly available
    replicated deployment of an in-memory key-value store. The operator deploys the requested
    number of members as a StatefulSet, keeps the supporting Secret, ConfigMap,
    PodDisruptionBudget and Services in shape, and supervises the replication topology the
    members advertise: it elects a primary, promotes a secondary when the primary is lost, and
    publishes the primary through a dedicated Service selector.
    "#
    )
)]
#[kube(
    group = "storeop.rs",
    version = "v1beta1",
    kind = "Store",
    plural = "stores",
    singular = "store",
    shortname = "kvs",
    namespaced,
    status = "StoreStatus",
    printcolumn = r#"{"name":"Primary","type":"string","description":"Pod currently serving writes","jsonPath":".status.primary"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","description":"The number of observed replication members","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","description":"The number of desired replicas","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    /// Number of replication members to deploy. Automatic failover needs a
    /// quorum of live members, so fewer than 3 is rejected.
    #[serde(default = "default_replicas")]
    #[schemars(range(min = 3))]
    pub replicas: i32,

    /// Free-form store configuration directives rendered into the managed
    /// ConfigMap as `key value` lines. Directives the operator owns
    /// (replication targets, authentication, network binding) are filtered
    /// out; see the deny-list in the ConfigMap generator.
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    /// Reference to a Secret key holding the authentication password for the
    /// store members. The password is read on every reconciliation and is
    /// never cached; rotating it rolls the member pods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<SecretKeySelector>,

    /// Container image name for the store container.
    /// More info: https://kubernetes.io/docs/concepts/containers/images
    #[serde(default = "default_image")]
    pub image: String,

    /// Image pull policy. One of Always, Never, IfNotPresent. Defaults to Always if :latest tag
    /// is specified, or IfNotPresent otherwise.
    /// More info: https://kubernetes.io/docs/concepts/containers/images#updating-images
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Defines the resources requests and limits of the store container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Metrics exporter sidecar. If set, an exporter container is added to
    /// every member pod and its port is exposed on the Services.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exporter: Option<StoreExporter>,

    /// StorageSpec defines the configured storage for the member pods. If no
    /// storage option is specified, an
    /// [EmptyDir](https://kubernetes.io/docs/concepts/storage/volumes/#emptydir) will be used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StoreStorage>,

    /// InitContainers allows injecting initContainers to the member pod definition, e.g. to tune
    /// kernel parameters before the store starts.
    /// More info: https://kubernetes.io/docs/concepts/workloads/pods/init-containers/
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_containers: Option<Vec<Container>>,

    /// Annotations added to the member pods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_annotations: Option<BTreeMap<String, String>>,

    /// Defines on which Nodes the member pods are scheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Defines the member pods' affinity scheduling rules if specified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Defines the member pods' tolerations if specified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    /// Priority class assigned to the member pods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// ServiceAccount the member pods run under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// References to Secrets for pulling the container images.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,

    /// SecurityContext holds pod-level security attributes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,

    /// SecurityContext applied to the store container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_security_context: Option<SecurityContext>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct StoreExporter {
    /// Container image name for the exporter sidecar.
    #[serde(default = "default_exporter_image")]
    pub image: String,

    /// Image pull policy for the exporter sidecar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Defines the resources requests and limits of the exporter container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct StoreStorage {
    /// EmptyDirVolumeSource to be used by the member pods. If specified, it takes precedence
    /// over `volumeClaimTemplate`. Data does not survive pod rescheduling.
    /// More info: https://kubernetes.io/docs/concepts/storage/volumes/#emptydir
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,

    /// Defines the PVC spec to be used by the member StatefulSet. The easiest way to use a
    /// volume that cannot be automatically provisioned is to use a label selector alongside
    /// manually created PersistentVolumes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<PersistentVolumeClaim>,
}

/// Most recent observed status of the Store cluster. Read-only.
/// More info:
/// https://github.com/kubernetes/community/blob/master/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    /// Name of the pod currently elected as replication primary.
    #[serde(default)]
    pub primary: String,

    /// Number of replication members observed during the last reconciliation.
    #[serde(default)]
    pub replicas: i32,
}

fn default_replicas() -> i32 {
    3
}

fn default_image() -> String {
    "redis:7-alpine".to_string()
}

fn default_exporter_image() -> String {
    "oliver006/redis_exporter:latest".to_string()
}

#[cfg(test)]
impl Store {
    /// A minimal cluster in the default namespace, spec defaults applied.
    pub fn test() -> Self {
        use kube::Resource;

        let mut store = Store::new(
            "test",
            serde_json::from_value(serde_json::json!({})).unwrap(),
        );
        store.meta_mut().namespace = Some("default".into());
        store.meta_mut().uid = Some("9e6d8cd7-85bf-44f9-a6a0-0c8c6581e0d5".into());
        store
    }

    pub fn with_password_secret(mut self, name: &str, key: &str) -> Self {
        self.spec.password_secret = Some(SecretKeySelector {
            name: name.to_string(),
            key: key.to_string(),
            optional: Some(false),
        });
        self
    }
}
