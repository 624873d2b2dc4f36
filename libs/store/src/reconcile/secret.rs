use crate::crd::Store;
use crate::reconcile::{AUTH_FILE, SyncOutcome};

use storeop_operator::controller::Context;
use storeop_operator::error::{Error, Result};

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::Resource;
use kube::api::Api;
use kube::runtime::events::{Event, EventType};
use tracing::{debug, warn};

#[allow(async_fn_in_trait)]
pub trait SecretExt {
    fn credential_secret_name(&self) -> String;
    fn generate_credential_secret(&self, password: &str) -> Secret;
    async fn fetch_password(&self, ctx: &Context<Store>) -> Result<Option<String>>;
    async fn sync_credential_secret(
        &self,
        ctx: &Context<Store>,
        password: &str,
    ) -> Result<SyncOutcome>;
}

impl SecretExt for Store {
    #[inline]
    fn credential_secret_name(&self) -> String {
        self.resource_name()
    }

    /// The only child that carries the credential: one `auth.conf` file with
    /// the server password and the password used towards the primary.
    fn generate_credential_secret(&self, password: &str) -> Secret {
        Secret {
            metadata: self.child_meta(self.credential_secret_name()),
            string_data: Some(BTreeMap::from([(
                AUTH_FILE.to_string(),
                format!("requirepass {password}\nmasterauth {password}\n"),
            )])),
            ..Secret::default()
        }
    }

    /// Read the referenced credential on every cycle; it is never cached.
    /// A missing referenced secret is a configuration error and surfaces.
    async fn fetch_password(&self, ctx: &Context<Store>) -> Result<Option<String>> {
        let Some(selector) = self.spec.password_secret.as_ref() else {
            return Ok(None);
        };
        let namespace = self.get_namespace();
        let secret_api = Api::<Secret>::namespaced(ctx.client.clone(), &namespace);
        let secret = secret_api
            .get_opt(&selector.name)
            .await
            .map_err(|e| {
                Error::KubeError(
                    format!("failed to get secret: {namespace}/{}", selector.name),
                    e,
                )
            })?
            .ok_or_else(|| {
                Error::MissingData(format!(
                    "referenced credential secret not found: {namespace}/{}",
                    selector.name
                ))
            })?;
        let data = secret.data.ok_or_else(|| {
            Error::MissingData(format!(
                "no data in credential secret: {namespace}/{}",
                selector.name
            ))
        })?;
        let password_bytes = data.get(&selector.key).ok_or_else(|| {
            Error::MissingData(format!(
                "missing key {} in credential secret: {namespace}/{}",
                selector.key, selector.name
            ))
        })?;
        let password = std::str::from_utf8(&password_bytes.0)
            .map_err(|e| Error::Utf8Error("credential is not valid UTF-8".to_string(), e))?;
        if password.len() < 8 && password.chars().all(|c| c.is_ascii_alphanumeric()) {
            warn!(
                msg = "credential is shorter than 8 alphanumeric characters",
                namespace,
                secret = %selector.name
            );
            let _ignore_errors = ctx
                .recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "WeakCredential".to_string(),
                        note: Some(format!(
                            "credential in secret {namespace}/{} is shorter than 8 alphanumeric characters",
                            selector.name
                        )),
                        action: "CredentialFetching".to_string(),
                        secondary: None,
                    },
                    &self.object_ref(&()),
                )
                .await
                .map_err(|e| debug!(msg = "failed to publish event", %e));
        }
        Ok(Some(password.to_string()))
    }

    async fn sync_credential_secret(
        &self,
        ctx: &Context<Store>,
        password: &str,
    ) -> Result<SyncOutcome> {
        let desired = self.generate_credential_secret(password);
        self.sync_resource(ctx, desired, credential_needs_update, |current, desired| {
            current.metadata.labels = desired.metadata.labels;
            current.string_data = desired.string_data;
        })
        .await
    }
}

/// Label set equality and data equality; anything else on the secret is left
/// to the API server.
fn credential_needs_update(current: &Secret, desired: &Secret) -> bool {
    if current.metadata.labels != desired.metadata.labels {
        return true;
    }
    let desired_data = desired.string_data.clone().unwrap_or_default();
    let current_data = current.data.clone().unwrap_or_default();
    if current_data.len() != desired_data.len() {
        return true;
    }
    desired_data.iter().any(|(key, value)| {
        current_data
            .get(key)
            .is_none_or(|current_value| current_value.0 != value.as_bytes())
    })
}
