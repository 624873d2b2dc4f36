use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} (kube error: {1})")]
    KubeError(String, #[source] kube::Error),

    #[error("{0}: {1}")]
    FormattingError(String, #[source] std::fmt::Error),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("{0}: {1}")]
    Utf8Error(String, #[source] std::str::Utf8Error),

    #[error("{0}")]
    MissingData(String),

    #[error("{0}: {1}")]
    ReplicationError(String, #[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("pods {0} and {1} both claim the primary address")]
    IpConflict(String, String),

    #[error("parallel operations failed: [{0}]")]
    AggregateError(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;
