use crate::crd::Store;
use crate::reconcile::{AUTH_FILE, AUTH_MOUNT_PATH, CONFIG_KEY, DATA_PATH, SyncOutcome};
use crate::replication::Address;

use storeop_operator::controller::Context;
use storeop_operator::error::Result;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use tracing::debug;

/// Directives the operator owns; user-supplied pairs naming them are dropped.
const DENY_LIST: [&str; 12] = [
    "include",
    "bind",
    "protected-mode",
    "port",
    "daemonize",
    "dir",
    "replica-announce-ip",
    "replica-announce-port",
    "replicaof",
    "masterauth",
    "requirepass",
    "rename-command",
];

/// Inputs the configuration generator takes besides the Store itself.
#[derive(Default, Clone, Copy)]
pub(crate) struct ConfigOptions<'a> {
    pub include_credential: bool,
    pub primary: Option<&'a Address>,
}

#[allow(async_fn_in_trait)]
pub trait ConfigMapExt {
    fn generate_config(&self, opts: &ConfigOptions) -> String;
    fn generate_configmap(&self, opts: &ConfigOptions) -> ConfigMap;
    async fn sync_configmap(
        &self,
        ctx: &Context<Store>,
        opts: ConfigOptions<'_>,
    ) -> Result<SyncOutcome>;
}

impl ConfigMapExt for Store {
    fn generate_config(&self, opts: &ConfigOptions) -> String {
        let mut conf = format!("dir {DATA_PATH}\n");
        if opts.include_credential {
            conf.push_str(&format!("include {AUTH_MOUNT_PATH}/{AUTH_FILE}\n"));
        }
        for (key, value) in &self.spec.config {
            if DENY_LIST.contains(&key.as_str()) {
                debug!(msg = "dropping reserved configuration directive", key);
                continue;
            }
            conf.push_str(&format!("{key} {value}\n"));
        }
        if let Some(primary) = opts.primary {
            conf.push_str(&format!("replicaof {} {}\n", primary.host, primary.port));
        }
        conf
    }

    fn generate_configmap(&self, opts: &ConfigOptions) -> ConfigMap {
        ConfigMap {
            metadata: self.child_meta(self.resource_name()),
            data: Some(BTreeMap::from([(
                CONFIG_KEY.to_string(),
                self.generate_config(opts),
            )])),
            ..ConfigMap::default()
        }
    }

    async fn sync_configmap(
        &self,
        ctx: &Context<Store>,
        opts: ConfigOptions<'_>,
    ) -> Result<SyncOutcome> {
        let desired = self.generate_configmap(&opts);
        self.sync_resource(ctx, desired, configmap_needs_update, |current, desired| {
            current.metadata.labels = desired.metadata.labels;
            current.data = desired.data;
        })
        .await
    }
}

/// Label set equality, but the configuration body is compared as "generated
/// is a substring of current": operators may append directives by hand and
/// those survive.
fn configmap_needs_update(current: &ConfigMap, desired: &ConfigMap) -> bool {
    if current.metadata.labels != desired.metadata.labels {
        return true;
    }
    let desired_conf = desired
        .data
        .as_ref()
        .and_then(|d| d.get(CONFIG_KEY))
        .cloned()
        .unwrap_or_default();
    !current
        .data
        .as_ref()
        .and_then(|d| d.get(CONFIG_KEY))
        .is_some_and(|current_conf| current_conf.contains(&desired_conf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_config_starts_with_working_directory() {
        let store = Store::test();
        let conf = store.generate_config(&ConfigOptions::default());
        assert!(conf.starts_with("dir /data\n"));
        assert!(!conf.contains("include"));
        assert!(!conf.contains("replicaof"));
    }

    #[test]
    fn test_credential_include_points_at_auth_file() {
        let store = Store::test();
        let conf = store.generate_config(&ConfigOptions {
            include_credential: true,
            primary: None,
        });
        assert!(conf.contains("include /etc/store-auth/auth.conf\n"));
    }

    #[test]
    fn test_user_pairs_rendered_and_deny_list_filtered() {
        let mut store = Store::test();
        store.spec.config = BTreeMap::from([
            ("maxmemory".to_string(), "1gb".to_string()),
            ("maxmemory-policy".to_string(), "allkeys-lru".to_string()),
            // every reserved directive must be dropped
            ("requirepass".to_string(), "sneaky".to_string()),
            ("replicaof".to_string(), "10.0.0.1 6379".to_string()),
            ("bind".to_string(), "0.0.0.0".to_string()),
            ("rename-command".to_string(), "FLUSHALL x".to_string()),
        ]);
        let conf = store.generate_config(&ConfigOptions::default());

        assert!(conf.contains("maxmemory 1gb\n"));
        assert!(conf.contains("maxmemory-policy allkeys-lru\n"));
        assert!(!conf.contains("sneaky"));
        assert!(!conf.contains("bind"));
        assert!(!conf.contains("rename-command"));
        // the only replicaof line is the controller-managed one, absent here
        assert!(!conf.contains("replicaof"));
    }

    #[test]
    fn test_primary_address_renders_replicaof_directive() {
        let store = Store::test();
        let primary = Address::from_ip("10.0.0.10");
        let conf = store.generate_config(&ConfigOptions {
            include_credential: false,
            primary: Some(&primary),
        });
        assert!(conf.ends_with("replicaof 10.0.0.10 6379\n"));
    }

    #[test]
    fn test_manually_appended_directives_do_not_trigger_update() {
        let store = Store::test();
        let desired = store.generate_configmap(&ConfigOptions::default());
        let mut current = desired.clone();
        let conf = current.data.as_mut().unwrap().get_mut(CONFIG_KEY).unwrap();
        conf.push_str("appendonly yes\n");

        assert!(!configmap_needs_update(&current, &desired));
    }

    #[test]
    fn test_new_replicaof_target_triggers_update() {
        let store = Store::test();
        let current = store.generate_configmap(&ConfigOptions::default());
        let primary = Address::from_ip("10.0.0.10");
        let desired = store.generate_configmap(&ConfigOptions {
            include_credential: false,
            primary: Some(&primary),
        });

        assert!(configmap_needs_update(&current, &desired));
    }

    #[test]
    fn test_missing_config_key_triggers_update() {
        let store = Store::test();
        let desired = store.generate_configmap(&ConfigOptions::default());
        let mut current = desired.clone();
        current.data = None;

        assert!(configmap_needs_update(&current, &desired));
    }
}
