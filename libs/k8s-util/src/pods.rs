use k8s_openapi::api::core::v1::Pod;

/// A pod is a usable replication member once it is running, has an assigned
/// IP, and every container reports ready.
pub fn is_running_and_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") || status.pod_ip.is_none() {
        return false;
    }
    status
        .container_statuses
        .as_ref()
        .is_some_and(|statuses| !statuses.is_empty() && statuses.iter().all(|s| s.ready))
}

pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.pod_ip.as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;

    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};

    fn pod(phase: &str, ip: Option<&str>, ready: &[bool]) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: ip.map(String::from),
                container_statuses: Some(
                    ready
                        .iter()
                        .map(|&ready| ContainerStatus {
                            ready,
                            ..ContainerStatus::default()
                        })
                        .collect(),
                ),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn test_running_with_ip_and_ready_containers() {
        assert!(is_running_and_ready(&pod(
            "Running",
            Some("10.0.0.10"),
            &[true, true]
        )));
    }

    #[test]
    fn test_pending_pod_is_not_ready() {
        assert!(!is_running_and_ready(&pod("Pending", None, &[])));
    }

    #[test]
    fn test_running_without_ip_is_not_ready() {
        assert!(!is_running_and_ready(&pod("Running", None, &[true])));
    }

    #[test]
    fn test_one_unready_container_excludes_pod() {
        assert!(!is_running_and_ready(&pod(
            "Running",
            Some("10.0.0.10"),
            &[true, false]
        )));
    }

    #[test]
    fn test_no_status_is_not_ready() {
        assert!(!is_running_and_ready(&Pod::default()));
        assert_eq!(pod_ip(&Pod::default()), None);
    }
}
