use crate::crd::Store;
use crate::reconcile::{
    ROLE_LABEL_KEY, ROLE_PRIMARY, SERVICE_TYPE_LABEL_KEY, SyncOutcome,
};
use crate::reconcile::statefulset::EXPORTER_PORT;
use crate::replication::STORE_PORT;

use storeop_k8s_util::contains::contains;
use storeop_operator::controller::Context;
use storeop_operator::error::Result;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};

/// The three service shapes kept per cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceVariant {
    /// ClusterIP across every member.
    AllMembers,
    /// Headless, used as the StatefulSet governing service.
    Headless,
    /// Selects only the pod labelled as replication primary.
    PrimaryOnly,
}

#[allow(async_fn_in_trait)]
pub trait ServiceExt {
    fn service_name(&self, variant: ServiceVariant) -> String;
    fn generate_service(&self, variant: ServiceVariant) -> Service;
    async fn sync_service(
        &self,
        ctx: &Context<Store>,
        variant: ServiceVariant,
    ) -> Result<SyncOutcome>;
}

impl ServiceExt for Store {
    #[inline]
    fn service_name(&self, variant: ServiceVariant) -> String {
        match variant {
            ServiceVariant::AllMembers => self.resource_name(),
            ServiceVariant::Headless => format!("{}-headless", self.resource_name()),
            ServiceVariant::PrimaryOnly => format!("{}-primary", self.resource_name()),
        }
    }

    fn generate_service(&self, variant: ServiceVariant) -> Service {
        let mut metadata = self.child_meta(self.service_name(variant));
        if variant == ServiceVariant::Headless {
            // safe unwrap: child_meta always sets labels
            metadata.labels.as_mut().unwrap().insert(
                SERVICE_TYPE_LABEL_KEY.to_string(),
                "headless".to_string(),
            );
        }

        let mut selector = self.selector_labels();
        if variant == ServiceVariant::PrimaryOnly {
            selector.insert(ROLE_LABEL_KEY.to_string(), ROLE_PRIMARY.to_string());
        }

        let ports = std::iter::once(ServicePort {
            name: Some("store".to_string()),
            port: i32::from(STORE_PORT),
            ..ServicePort::default()
        })
        .chain(self.spec.exporter.iter().map(|_| ServicePort {
            name: Some("exporter".to_string()),
            port: EXPORTER_PORT,
            ..ServicePort::default()
        }))
        .collect();

        Service {
            metadata,
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(ports),
                cluster_ip: (variant == ServiceVariant::Headless)
                    .then(|| "None".to_string()),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    async fn sync_service(
        &self,
        ctx: &Context<Store>,
        variant: ServiceVariant,
    ) -> Result<SyncOutcome> {
        let desired = self.generate_service(variant);
        self.sync_resource(ctx, desired, service_needs_update, |current, desired| {
            current.metadata.labels = desired.metadata.labels;
            if let (Some(current_spec), Some(desired_spec)) =
                (current.spec.as_mut(), desired.spec)
            {
                current_spec.selector = desired_spec.selector;
                current_spec.ports = desired_spec.ports;
            }
        })
        .await
    }
}

/// Labels and selector by equality, ports as a deep subset: the API server
/// fills protocols, node ports and target ports after creation.
fn service_needs_update(current: &Service, desired: &Service) -> bool {
    if current.metadata.labels != desired.metadata.labels {
        return true;
    }
    let (Some(current_spec), Some(desired_spec)) = (current.spec.as_ref(), desired.spec.as_ref())
    else {
        return true;
    };
    if current_spec.selector != desired_spec.selector {
        return true;
    }
    !contains(&current_spec.ports, &desired_spec.ports)
}
