use crate::crd::Store;
use crate::hash::credential_hash;
use crate::reconcile::service::{ServiceExt, ServiceVariant};
use crate::reconcile::{
    AUTH_MOUNT_PATH, CONFIG_KEY, CONFIG_MOUNT_PATH, DATA_PATH, SyncOutcome,
};
use crate::replication::STORE_PORT;

use storeop_k8s_util::contains::{contains, deep_equal};
use storeop_operator::controller::Context;
use storeop_operator::error::Result;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ExecAction, PersistentVolumeClaim, PodSpec, PodTemplateSpec, Probe, SecretKeySelector,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use sha2::{Digest, Sha256};
use tracing::warn;

const CONTAINER_NAME: &str = "store";
const EXPORTER_CONTAINER_NAME: &str = "exporter";
pub(crate) const EXPORTER_PORT: i32 = 9121;

const VOLUME_DATA_NAME: &str = "store-data";
const VOLUME_CONFIG_NAME: &str = "store-config";
const VOLUME_AUTH_NAME: &str = "store-auth";

/// Content-addressed digest of the generated workload; any template-affecting
/// change rolls the pods.
pub(crate) const REVISION_HASH_ANNOTATION: &str = "storeop.rs/revision-hash";
/// Digest of the credential; rotating the credential rolls the pods.
pub(crate) const CREDENTIAL_HASH_ANNOTATION: &str = "storeop.rs/revision-hash-of-credential";

#[allow(async_fn_in_trait)]
pub trait StatefulSetExt {
    fn generate_statefulset(&self, password: Option<&str>) -> StatefulSet;
    async fn sync_statefulset(
        &self,
        ctx: &Context<Store>,
        password: Option<&str>,
    ) -> Result<SyncOutcome>;
}

trait StatefulSetExtPrivate {
    fn generate_containers(&self, with_credential: bool) -> Vec<Container>;
    fn generate_volumes(
        &self,
        with_credential: bool,
    ) -> (Vec<Volume>, Option<Vec<PersistentVolumeClaim>>);
}

impl StatefulSetExt for Store {
    fn generate_statefulset(&self, password: Option<&str>) -> StatefulSet {
        let pod_labels = self.get_labels();
        let mut annotations = self.spec.pod_annotations.clone().unwrap_or_default();
        if let Some(password) = password {
            let digest = match credential_hash(password, &self.cluster_id()) {
                Ok(digest) => digest,
                // the annotation still changes with the input, so the
                // workload update is not lost
                Err(e) => {
                    warn!(msg = "credential hash failed", %e);
                    e.to_string()
                }
            };
            annotations.insert(CREDENTIAL_HASH_ANNOTATION.to_string(), digest);
        }

        let containers = self.generate_containers(password.is_some());
        let (volumes, volume_claim_templates) = self.generate_volumes(password.is_some());

        let mut statefulset = StatefulSet {
            metadata: self.child_meta(self.resource_name()),
            spec: Some(StatefulSetSpec {
                replicas: Some(self.spec.replicas),
                service_name: Some(self.service_name(ServiceVariant::Headless)),
                selector: LabelSelector {
                    match_expressions: None,
                    match_labels: Some(self.selector_labels()),
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        annotations: Some(annotations),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        containers,
                        init_containers: self.spec.init_containers.clone(),
                        volumes: Some(volumes),
                        node_selector: self.spec.node_selector.clone(),
                        affinity: self.spec.affinity.clone(),
                        tolerations: self.spec.tolerations.clone(),
                        priority_class_name: self.spec.priority_class_name.clone(),
                        service_account_name: self.spec.service_account_name.clone(),
                        image_pull_secrets: self.spec.image_pull_secrets.clone(),
                        security_context: self.spec.security_context.clone(),
                        ..PodSpec::default()
                    }),
                },
                volume_claim_templates,
                ..StatefulSetSpec::default()
            }),
            ..StatefulSet::default()
        };

        let revision = revision_hash(&statefulset);
        statefulset
            .spec
            .as_mut()
            // safe unwrap: the template metadata and annotations were just set
            .unwrap()
            .template
            .metadata
            .as_mut()
            .unwrap()
            .annotations
            .as_mut()
            .unwrap()
            .insert(REVISION_HASH_ANNOTATION.to_string(), revision);
        statefulset
    }

    async fn sync_statefulset(
        &self,
        ctx: &Context<Store>,
        password: Option<&str>,
    ) -> Result<SyncOutcome> {
        let desired = self.generate_statefulset(password);
        self.sync_resource(ctx, desired, statefulset_needs_update, statefulset_merge)
            .await
    }
}

impl StatefulSetExtPrivate for Store {
    fn generate_containers(&self, with_credential: bool) -> Vec<Container> {
        let probe = Probe {
            exec: Some(ExecAction {
                command: Some(vec!["redis-cli".to_string(), "ping".to_string()]),
            }),
            ..Probe::default()
        };

        let volume_mounts = [
            VolumeMount {
                name: VOLUME_DATA_NAME.to_string(),
                mount_path: DATA_PATH.to_string(),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: VOLUME_CONFIG_NAME.to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
        ]
        .into_iter()
        .chain(with_credential.then(|| VolumeMount {
            name: VOLUME_AUTH_NAME.to_string(),
            mount_path: AUTH_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        }))
        .collect();

        let store_container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(self.spec.image.clone()),
            image_pull_policy: self.spec.image_pull_policy.clone(),
            command: Some(vec![
                "redis-server".to_string(),
                format!("{CONFIG_MOUNT_PATH}/{CONFIG_KEY}"),
            ]),
            ports: Some(vec![ContainerPort {
                name: Some("store".to_string()),
                container_port: i32::from(STORE_PORT),
                ..ContainerPort::default()
            }]),
            volume_mounts: Some(volume_mounts),
            resources: self.spec.resources.clone(),
            security_context: self.spec.container_security_context.clone(),
            readiness_probe: Some(probe.clone()),
            liveness_probe: Some(probe),
            ..Container::default()
        };

        std::iter::once(store_container)
            .chain(self.spec.exporter.iter().map(|exporter| {
                let env = std::iter::once(EnvVar {
                    name: "REDIS_ADDR".to_string(),
                    value: Some(format!("redis://localhost:{STORE_PORT}")),
                    ..EnvVar::default()
                })
                .chain(self.spec.password_secret.iter().map(|selector| EnvVar {
                    name: "REDIS_PASSWORD".to_string(),
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: selector.name.clone(),
                            key: selector.key.clone(),
                            optional: Some(false),
                        }),
                        ..EnvVarSource::default()
                    }),
                    ..EnvVar::default()
                }))
                .collect();
                Container {
                    name: EXPORTER_CONTAINER_NAME.to_string(),
                    image: Some(exporter.image.clone()),
                    image_pull_policy: exporter.image_pull_policy.clone(),
                    env: Some(env),
                    ports: Some(vec![ContainerPort {
                        name: Some("exporter".to_string()),
                        container_port: EXPORTER_PORT,
                        ..ContainerPort::default()
                    }]),
                    resources: exporter.resources.clone(),
                    ..Container::default()
                }
            }))
            .collect()
    }

    fn generate_volumes(
        &self,
        with_credential: bool,
    ) -> (Vec<Volume>, Option<Vec<PersistentVolumeClaim>>) {
        let base: Vec<Volume> = std::iter::once(Volume {
            name: VOLUME_CONFIG_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: self.resource_name(),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        })
        .chain(with_credential.then(|| Volume {
            name: VOLUME_AUTH_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(self.resource_name()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        }))
        .collect();

        let data_empty_dir = |empty_dir: EmptyDirVolumeSource, volumes: Vec<Volume>| {
            (
                volumes
                    .into_iter()
                    .chain(std::iter::once(Volume {
                        name: VOLUME_DATA_NAME.to_string(),
                        empty_dir: Some(empty_dir),
                        ..Volume::default()
                    }))
                    .collect(),
                None,
            )
        };

        match self.spec.storage.clone() {
            Some(storage) => {
                if let Some(empty_dir) = storage.empty_dir {
                    data_empty_dir(empty_dir, base)
                } else if let Some(mut claim) = storage.volume_claim_template {
                    claim.metadata.name = Some(VOLUME_DATA_NAME.to_string());
                    (base, Some(vec![claim]))
                } else {
                    data_empty_dir(EmptyDirVolumeSource::default(), base)
                }
            }
            None => data_empty_dir(EmptyDirVolumeSource::default(), base),
        }
    }
}

fn revision_hash(statefulset: &StatefulSet) -> String {
    match serde_json::to_vec(statefulset) {
        Ok(bytes) => hex::encode(Sha256::digest(bytes)),
        // the message still changes with the input, so updates are not lost
        Err(e) => e.to_string(),
    }
}

/// Replica count, pod-template structural subset, resource deep-equality and
/// label set. The template subset also covers the revision annotations: a new
/// digest is absent from the applied template and forces the update.
fn statefulset_needs_update(current: &StatefulSet, desired: &StatefulSet) -> bool {
    if current.metadata.labels != desired.metadata.labels {
        return true;
    }
    let (Some(current_spec), Some(desired_spec)) = (current.spec.as_ref(), desired.spec.as_ref())
    else {
        return true;
    };
    if current_spec.replicas != desired_spec.replicas {
        return true;
    }
    if !contains(&current_spec.template, &desired_spec.template) {
        return true;
    }
    !resources_equal(&current_spec.template, &desired_spec.template)
}

/// Resource requirements compared by deep equality as a separate check: the
/// quantity strings must not drift once the user pinned them. Containers the
/// user left unconstrained accept whatever limit ranges inject.
fn resources_equal(current: &PodTemplateSpec, desired: &PodTemplateSpec) -> bool {
    let containers = |template: &PodTemplateSpec| {
        template
            .spec
            .as_ref()
            .map(|s| s.containers.clone())
            .unwrap_or_default()
    };
    let current_containers = containers(current);
    containers(desired).iter().all(|desired_container| {
        let Some(desired_resources) = desired_container.resources.as_ref() else {
            return true;
        };
        current_containers
            .iter()
            .find(|c| c.name == desired_container.name)
            .and_then(|c| c.resources.as_ref())
            .is_some_and(|current_resources| deep_equal(current_resources, desired_resources))
    })
}

fn statefulset_merge(current: &mut StatefulSet, desired: StatefulSet) {
    current.metadata.labels = desired.metadata.labels;
    if let (Some(current_spec), Some(desired_spec)) = (current.spec.as_mut(), desired.spec) {
        current_spec.replicas = desired_spec.replicas;
        current_spec.template = desired_spec.template;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::crd::{StoreExporter, StoreStorage};

    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn pod_spec(statefulset: &StatefulSet) -> &PodSpec {
        statefulset
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
    }

    fn template_annotations(statefulset: &StatefulSet) -> &BTreeMap<String, String> {
        statefulset
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .annotations
            .as_ref()
            .unwrap()
    }

    #[test]
    fn test_generated_workload_shape() {
        let store = Store::test();
        let statefulset = store.generate_statefulset(None);
        let spec = statefulset.spec.as_ref().unwrap();

        assert_eq!(statefulset.metadata.name.as_deref(), Some("store-test"));
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name.as_deref(), Some("store-test-headless"));
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap().get("store"),
            Some(&"test".to_string())
        );

        let containers = &pod_spec(&statefulset).containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, CONTAINER_NAME);
        assert_eq!(
            containers[0].command.as_ref().unwrap(),
            &vec!["redis-server".to_string(), "/etc/store/conf".to_string()]
        );
        assert_eq!(
            containers[0].ports.as_ref().unwrap()[0].container_port,
            6379
        );
        let probe = containers[0].liveness_probe.as_ref().unwrap();
        assert_eq!(
            probe.exec.as_ref().unwrap().command.as_ref().unwrap(),
            &vec!["redis-cli".to_string(), "ping".to_string()]
        );

        let volumes = pod_spec(&statefulset).volumes.as_ref().unwrap();
        assert!(volumes.iter().any(|v| v.name == VOLUME_CONFIG_NAME));
        assert!(
            volumes
                .iter()
                .any(|v| v.name == VOLUME_DATA_NAME && v.empty_dir.is_some())
        );
        assert!(!volumes.iter().any(|v| v.name == VOLUME_AUTH_NAME));
    }

    #[test]
    fn test_credential_mounts_auth_volume_and_annotation() {
        let store = Store::test();
        let statefulset = store.generate_statefulset(Some("hunter2hunter2"));

        let volumes = pod_spec(&statefulset).volumes.as_ref().unwrap();
        assert!(volumes.iter().any(|v| v.name == VOLUME_AUTH_NAME));

        let annotations = template_annotations(&statefulset);
        assert!(annotations.contains_key(CREDENTIAL_HASH_ANNOTATION));
        assert!(annotations.contains_key(REVISION_HASH_ANNOTATION));
        assert!(!annotations[CREDENTIAL_HASH_ANNOTATION].contains("hunter2"));
    }

    #[test]
    fn test_credential_rotation_changes_annotation() {
        let store = Store::test();
        let old = store.generate_statefulset(Some("old-password"));
        let new = store.generate_statefulset(Some("new-password"));

        assert_ne!(
            template_annotations(&old)[CREDENTIAL_HASH_ANNOTATION],
            template_annotations(&new)[CREDENTIAL_HASH_ANNOTATION]
        );
        // the workload comparison picks the rotation up
        assert!(statefulset_needs_update(&old, &new));
    }

    #[test]
    fn test_revision_hash_tracks_template_changes() {
        let store = Store::test();
        let a = store.generate_statefulset(None);
        let b = store.generate_statefulset(None);
        assert_eq!(
            template_annotations(&a)[REVISION_HASH_ANNOTATION],
            template_annotations(&b)[REVISION_HASH_ANNOTATION]
        );

        let mut changed = Store::test();
        changed.spec.image = "redis:8-alpine".to_string();
        let c = changed.generate_statefulset(None);
        assert_ne!(
            template_annotations(&a)[REVISION_HASH_ANNOTATION],
            template_annotations(&c)[REVISION_HASH_ANNOTATION]
        );
    }

    #[test]
    fn test_exporter_sidecar() {
        let mut store = Store::test();
        store.spec.exporter = Some(StoreExporter {
            image: "oliver006/redis_exporter:v1.62".to_string(),
            ..StoreExporter::default()
        });
        let statefulset = store.generate_statefulset(None);
        let containers = &pod_spec(&statefulset).containers;

        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1].name, EXPORTER_CONTAINER_NAME);
        assert_eq!(
            containers[1].ports.as_ref().unwrap()[0].container_port,
            EXPORTER_PORT
        );
        assert!(
            containers[1]
                .env
                .as_ref()
                .unwrap()
                .iter()
                .any(|e| e.name == "REDIS_ADDR")
        );
    }

    #[test]
    fn test_volume_claim_template_replaces_empty_dir() {
        let mut store = Store::test();
        store.spec.storage = Some(StoreStorage {
            empty_dir: None,
            volume_claim_template: Some(PersistentVolumeClaim::default()),
        });
        let statefulset = store.generate_statefulset(None);
        let spec = statefulset.spec.as_ref().unwrap();

        let claims = spec.volume_claim_templates.as_ref().unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].metadata.name.as_deref(), Some(VOLUME_DATA_NAME));
        assert!(
            !pod_spec(&statefulset)
                .volumes
                .as_ref()
                .unwrap()
                .iter()
                .any(|v| v.name == VOLUME_DATA_NAME)
        );
    }

    #[test]
    fn test_injected_defaults_do_not_trigger_update() {
        let store = Store::test();
        let desired = store.generate_statefulset(None);
        let mut current = desired.clone();
        // fields the API server defaults after creation
        let current_spec = current.spec.as_mut().unwrap();
        current_spec.pod_management_policy = Some("OrderedReady".to_string());
        let template_spec = current_spec.template.spec.as_mut().unwrap();
        template_spec.restart_policy = Some("Always".to_string());
        template_spec.dns_policy = Some("ClusterFirst".to_string());
        template_spec.containers[0].termination_message_path =
            Some("/dev/termination-log".to_string());

        assert!(!statefulset_needs_update(&current, &desired));
    }

    #[test]
    fn test_image_change_triggers_update() {
        let store = Store::test();
        let current = store.generate_statefulset(None);
        let mut changed = Store::test();
        changed.spec.image = "redis:8-alpine".to_string();
        let desired = changed.generate_statefulset(None);

        assert!(statefulset_needs_update(&current, &desired));
    }

    #[test]
    fn test_replica_change_triggers_update() {
        let store = Store::test();
        let current = store.generate_statefulset(None);
        let mut scaled = Store::test();
        scaled.spec.replicas = 5;
        let desired = scaled.generate_statefulset(None);

        assert!(statefulset_needs_update(&current, &desired));
    }

    #[test]
    fn test_pinned_resources_must_match_exactly() {
        let mut with_resources = Store::test();
        with_resources.spec.resources = Some(ResourceRequirements {
            limits: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity("1Gi".to_string()),
            )])),
            ..ResourceRequirements::default()
        });
        let desired = with_resources.generate_statefulset(None);

        // a limit range injecting an extra cpu limit passes the template
        // subset but fails the separate deep-equality check
        let mut current = desired.clone();
        current
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers[0]
            .resources
            .as_mut()
            .unwrap()
            .limits
            .as_mut()
            .unwrap()
            .insert("cpu".to_string(), Quantity("500m".to_string()));
        let current_template = &current.spec.as_ref().unwrap().template;
        let desired_template = &desired.spec.as_ref().unwrap().template;
        assert!(contains(current_template, desired_template));
        assert!(!resources_equal(current_template, desired_template));
        assert!(statefulset_needs_update(&current, &desired));
    }

    #[test]
    fn test_unconstrained_resources_accept_injected_limits() {
        let store = Store::test();
        let desired = store.generate_statefulset(None);
        let mut current = desired.clone();
        current
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers[0]
            .resources = Some(ResourceRequirements {
            limits: Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity("500m".to_string()),
            )])),
            ..ResourceRequirements::default()
        });

        assert!(!statefulset_needs_update(&current, &desired));
    }
}
