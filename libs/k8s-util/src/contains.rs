use serde::Serialize;
use serde_json::Value;

/// Structural one-directional subset check between two values of the same
/// Kubernetes type: "does the applied state cover everything the generator
/// asked for".
///
/// The API server and its admission plugins inject defaults into every object
/// after creation, so an equality check against a freshly generated object
/// would flag a difference on every cycle and update forever. Containment
/// accepts injected defaults: fields the generator left empty are
/// unconstrained, fields it set must match.
pub fn contains<T: Serialize>(current: &T, desired: &T) -> bool {
    match (serde_json::to_value(current), serde_json::to_value(desired)) {
        (Ok(current), Ok(desired)) => value_contains(&current, &desired),
        _ => false,
    }
}

/// Deep equality over the serialized views. Used where containment is too
/// weak, e.g. resource requirements whose quantities must not drift.
pub fn deep_equal<T: Serialize>(current: &T, desired: &T) -> bool {
    match (serde_json::to_value(current), serde_json::to_value(desired)) {
        (Ok(current), Ok(desired)) => current == desired,
        _ => false,
    }
}

/// Containment over serialized JSON views:
///
/// - an empty desired value is unconstrained;
/// - mappings: every non-empty desired key must be present in current with a
///   contained value, current may carry extra keys;
/// - sequences: same length, element-wise containment, order-sensitive;
/// - scalars: equality;
/// - operands of different shapes never contain one another.
pub fn value_contains(current: &Value, desired: &Value) -> bool {
    if is_empty(desired) {
        return true;
    }
    match (current, desired) {
        (Value::Object(current), Value::Object(desired)) => desired.iter().all(|(key, value)| {
            is_empty(value)
                || current
                    .get(key)
                    .is_some_and(|current_value| value_contains(current_value, value))
        }),
        (Value::Array(current), Value::Array(desired)) => {
            current.len() == desired.len()
                && current
                    .iter()
                    .zip(desired.iter())
                    .all(|(current_value, value)| value_contains(current_value, value))
        }
        (current, desired) => current == desired,
    }
}

/// Empty-value predicate: null, empty string, zero number, false, zero-length
/// sequence, and mappings whose entries are all empty (a struct of defaults
/// serializes to one of those).
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f == 0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(m) => m.values().all(is_empty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use k8s_openapi::api::core::v1::{Container, PodSpec, Service, ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use serde_json::json;

    fn sample_service() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("store-test".to_string()),
                namespace: Some("default".to_string()),
                labels: Some([("store".to_string(), "test".to_string())].into()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                selector: Some([("store".to_string(), "test".to_string())].into()),
                ports: Some(vec![ServicePort {
                    name: Some("store".to_string()),
                    port: 6379,
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    #[test]
    fn test_contains_is_reflexive() {
        let service = sample_service();
        assert!(contains(&service, &service));

        let pod_spec = PodSpec {
            containers: vec![Container {
                name: "store".to_string(),
                image: Some("redis:7-alpine".to_string()),
                ..Container::default()
            }],
            ..PodSpec::default()
        };
        assert!(contains(&pod_spec, &pod_spec));
    }

    #[test]
    fn test_contains_accepts_injected_defaults() {
        let desired = sample_service();
        let mut current = desired.clone();
        // the API server fills these in after creation
        let spec = current.spec.as_mut().unwrap();
        spec.cluster_ip = Some("10.96.0.17".to_string());
        spec.type_ = Some("ClusterIP".to_string());
        spec.ports.as_mut().unwrap()[0].protocol = Some("TCP".to_string());
        spec.ports.as_mut().unwrap()[0].target_port = Some(IntOrString::Int(6379));

        assert!(contains(&current, &desired));
        assert!(!contains(&desired, &current));
    }

    #[test]
    fn test_contains_detects_changed_scalar() {
        let desired = sample_service();
        let mut current = desired.clone();
        current.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].port = 6380;

        assert!(!contains(&current, &desired));
    }

    #[test]
    fn test_empty_desired_is_unconstrained() {
        assert!(value_contains(&json!("anything"), &Value::Null));
        assert!(value_contains(&json!(42), &json!(0)));
        assert!(value_contains(&json!(true), &json!(false)));
        assert!(value_contains(&json!({"a": 1}), &json!({})));
        assert!(value_contains(&json!([1, 2]), &json!([])));
        // a struct of defaults serializes to all-empty entries
        assert!(value_contains(&json!({"a": 1}), &json!({"a": 0, "b": ""})));
    }

    #[test]
    fn test_explicit_desired_empty_does_not_force_current_empty() {
        // the one-directional guarantee: desired "" means "don't care",
        // so an operator-set value survives
        assert!(value_contains(
            &json!({"key": "operator-set"}),
            &json!({"key": ""})
        ));
    }

    #[test]
    fn test_sequences_require_same_length_and_order() {
        assert!(value_contains(&json!([1, 2, 3]), &json!([1, 2, 3])));
        assert!(!value_contains(&json!([1, 2, 3]), &json!([1, 2])));
        assert!(!value_contains(&json!([2, 1]), &json!([1, 2])));
    }

    #[test]
    fn test_mappings_allow_extra_current_keys() {
        let current = json!({"a": 1, "b": 2, "injected": true});
        let desired = json!({"a": 1, "b": 2});
        assert!(value_contains(&current, &desired));
        assert!(!value_contains(&desired, &json!({"a": 1, "c": 3})));
    }

    #[test]
    fn test_differently_shaped_operands_never_contain() {
        assert!(!value_contains(&json!({"a": 1}), &json!([1])));
        assert!(!value_contains(&json!([1]), &json!({"a": 1})));
        assert!(!value_contains(&json!("1"), &json!(1)));
        assert!(!value_contains(&json!(1), &json!(true)));
    }

    #[test]
    fn test_contains_is_transitive_on_nested_objects() {
        let a = json!({"spec": {"x": 1, "y": "v", "injected": {"d": 1}, "more": 2}});
        let b = json!({"spec": {"x": 1, "y": "v", "more": 2}});
        let c = json!({"spec": {"x": 1, "y": "v"}});
        assert!(value_contains(&a, &b));
        assert!(value_contains(&b, &c));
        assert!(value_contains(&a, &c));
    }

    #[test]
    fn test_deep_equal_rejects_injected_defaults() {
        let desired = sample_service();
        let mut current = desired.clone();
        current.spec.as_mut().unwrap().cluster_ip = Some("10.96.0.17".to_string());

        assert!(deep_equal(&desired, &desired));
        assert!(!deep_equal(&current, &desired));
    }
}
