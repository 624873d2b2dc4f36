use thiserror::Error;
use tokio::time::Duration;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("no role marker in replication report")]
    Parse,

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("authentication rejected by {addr}: {source}")]
    Auth {
        addr: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("topology query against {addr} failed: {source}")]
    TopologyQuery {
        addr: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("reassign command against {addr} failed: {source}")]
    Reassign {
        addr: String,
        #[source]
        source: redis::RedisError,
    },

    #[error(
        "{0} live instances, at least {min} required for failover",
        min = super::MIN_FAILOVER_SIZE
    )]
    InsufficientQuorum(usize),

    #[error("promoted instance did not settle as primary within {0:?}")]
    PromotionTimeout(Duration),

    #[error(
        "{} parallel operations failed: [{}]",
        .0.len(),
        .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    )]
    Aggregate(Vec<ReplicationError>),
}

/// Fold the errors collected behind a barrier into one. A single failure
/// keeps its own kind so callers can still match on it.
pub(crate) fn aggregate(mut errors: Vec<ReplicationError>) -> ReplicationError {
    if errors.len() == 1 {
        errors.remove(0)
    } else {
        ReplicationError::Aggregate(errors)
    }
}
