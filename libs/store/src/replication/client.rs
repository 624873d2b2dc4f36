use super::error::ReplicationError;
use super::{Address, STORE_PORT};

use redis::aio::MultiplexedConnection;
use redis::{Client, ConnectionAddr, ConnectionInfo, ErrorKind, RedisConnectionInfo, RedisError};
use tracing::trace;

/// Client for a single store instance.
///
/// Holds one multiplexed connection for the duration of a reconciliation
/// cycle; the engine owns these in a flat sequence and drops them on a single
/// exit path.
pub struct StoreClient {
    address: Address,
    conn: MultiplexedConnection,
}

impl StoreClient {
    pub async fn connect(
        address: Address,
        password: Option<&str>,
    ) -> Result<Self, ReplicationError> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(
                address.host.clone(),
                address.port.parse().unwrap_or(STORE_PORT),
            ),
            redis: RedisConnectionInfo {
                password: password.map(str::to_string),
                ..RedisConnectionInfo::default()
            },
        };
        let client =
            Client::open(info).map_err(|e| connect_error(&address, e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| connect_error(&address, e))?;
        trace!(msg = "connected to instance", address = %address);
        Ok(Self { address, conn })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn ping(&mut self) -> Result<(), ReplicationError> {
        redis::cmd("PING")
            .query_async::<String>(&mut self.conn)
            .await
            .map(drop)
            .map_err(|e| connect_error(&self.address, e))
    }

    /// Fetch the replication section of the INFO report.
    pub async fn query_topology(&mut self) -> Result<String, ReplicationError> {
        redis::cmd("INFO")
            .arg("replication")
            .query_async::<String>(&mut self.conn)
            .await
            .map_err(|e| ReplicationError::TopologyQuery {
                addr: self.address.to_string(),
                source: e,
            })
    }

    /// Point this instance at a new primary, or promote it when `new_primary`
    /// is `None`.
    ///
    /// Both commands run in one MULTI/EXEC transaction: the role change and
    /// the disconnect of every attached normal-type client become visible at
    /// the same instant, so an application already attached here re-resolves
    /// the primary on its next contact. Replies are not inspected; the effect
    /// is re-observed by the next topology query.
    pub async fn reassign(
        &mut self,
        new_primary: Option<&Address>,
    ) -> Result<(), ReplicationError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        match new_primary {
            Some(primary) => pipe
                .cmd("REPLICAOF")
                .arg(&primary.host)
                .arg(&primary.port)
                .ignore(),
            None => pipe.cmd("REPLICAOF").arg("NO").arg("ONE").ignore(),
        };
        pipe.cmd("CLIENT").arg("KILL").arg("TYPE").arg("normal").ignore();
        trace!(
            msg = "reassigning instance",
            address = %self.address,
            new_primary = %new_primary.map(ToString::to_string).unwrap_or_else(|| "none".to_string()),
        );
        pipe.query_async::<()>(&mut self.conn)
            .await
            .map_err(|e| ReplicationError::Reassign {
                addr: self.address.to_string(),
                source: e,
            })
    }
}

fn connect_error(address: &Address, source: RedisError) -> ReplicationError {
    let addr = address.to_string();
    if source.kind() == ErrorKind::AuthenticationFailed {
        ReplicationError::Auth { addr, source }
    } else {
        ReplicationError::Connect { addr, source }
    }
}
