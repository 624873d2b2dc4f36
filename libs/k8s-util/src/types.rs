use std::any::type_name;

/// Last path segment of a type name, e.g. `StatefulSet` for
/// `k8s_openapi::api::apps::v1::StatefulSet`. Used in log lines.
#[inline]
pub fn short_type_name<K>() -> Option<&'static str> {
    type_name::<K>().split("::").last()
}
