pub mod client;
pub mod error;
pub mod info;

use client::StoreClient;
use error::{ReplicationError, aggregate};
use info::{ReplicationState, Role, parse_report};

use std::fmt;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::future::join_all;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Standard client port of the managed store.
pub const STORE_PORT: u16 = 6379;

/// Minimum number of live instances below which the engine refuses to issue
/// any reassignment.
pub const MIN_FAILOVER_SIZE: usize = 2;

/// Upper bound on the exponential-backoff polls waiting for a primary to
/// settle.
pub const DEFAULT_FAILOVER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: String,
}

impl Address {
    pub fn new(host: &str, port: &str) -> Self {
        Self {
            host: host.to_string(),
            port: port.to_string(),
        }
    }

    /// Address of a member pod: its IP on the standard port.
    pub fn from_ip(ip: &str) -> Self {
        Self::new(ip, &STORE_PORT.to_string())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One live instance as observed during the current cycle. Plain data;
/// records are rebuilt on every refresh and discarded with the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub address: Address,
    pub state: ReplicationState,
}

pub(crate) enum PrimarySelection {
    /// Index of the working primary, or of the bootstrap fallback.
    Found(usize),
    /// No working primary, but an electable secondary exists: promote.
    Lost,
    Empty,
}

/// Election rule over the instance set.
///
/// A primary with at least one connected secondary wins outright. Otherwise
/// the presence of any secondary with a non-zero priority is authoritative
/// evidence that a primary existed and was lost: promotion is preferred over
/// trusting a stale self-reported primary. Only when neither exists — every
/// instance reports itself a standalone primary, the fresh-cluster case — is
/// the first instance picked.
pub(crate) fn select_primary(instances: &[Instance]) -> PrimarySelection {
    if let Some(working) = instances
        .iter()
        .position(|i| i.state.role == Role::Primary && i.state.connected_secondaries > 0)
    {
        return PrimarySelection::Found(working);
    }
    if instances
        .iter()
        .any(|i| i.state.role == Role::Secondary && i.state.secondary_priority != 0)
    {
        return PrimarySelection::Lost;
    }
    match instances.is_empty() {
        false => PrimarySelection::Found(0),
        true => PrimarySelection::Empty,
    }
}

/// Indices of the promotion candidates, best first: lower priority dominates,
/// ties broken by higher replication offset. Priority zero disqualifies.
pub(crate) fn promotion_candidates(instances: &[Instance]) -> Vec<usize> {
    let mut candidates: Vec<usize> = instances
        .iter()
        .enumerate()
        .filter(|(_, i)| i.state.role == Role::Secondary && i.state.secondary_priority != 0)
        .map(|(idx, _)| idx)
        .collect();
    candidates.sort_by(|&a, &b| {
        let (a, b) = (&instances[a].state, &instances[b].state);
        a.secondary_priority
            .cmp(&b.secondary_priority)
            .then(b.replication_offset.cmp(&a.replication_offset))
    });
    candidates
}

/// Indices of every instance the primary does not know about: address differs
/// from the primary's and is absent from its advertised secondary list.
pub(crate) fn orphans(instances: &[Instance], primary: usize) -> Vec<usize> {
    let primary_address = &instances[primary].address;
    let known: Vec<&Address> = instances[primary]
        .state
        .secondaries
        .iter()
        .map(|s| &s.address)
        .collect();
    instances
        .iter()
        .enumerate()
        .filter(|(_, i)| i.address != *primary_address && !known.contains(&&i.address))
        .map(|(idx, _)| idx)
        .collect()
}

/// The replication engine: the set of live instances of one cluster and the
/// connections to them. Rebuilt from scratch every reconciliation; all truth
/// is re-derived from the instances themselves.
pub struct Replication {
    instances: Vec<Instance>,
    clients: Vec<StoreClient>,
}

impl Replication {
    /// Connect to every address and keep the instances that answer ping.
    ///
    /// Fails with `InsufficientQuorum` when fewer than [`MIN_FAILOVER_SIZE`]
    /// remain, and performs an initial [`refresh`](Self::refresh) before
    /// returning. Connections opened by a failed construction are released.
    pub async fn connect(
        addresses: Vec<Address>,
        password: Option<&str>,
    ) -> Result<Self, ReplicationError> {
        let results = join_all(addresses.into_iter().map(|address| async move {
            let mut client = StoreClient::connect(address, password).await?;
            client.ping().await?;
            Ok::<StoreClient, ReplicationError>(client)
        }))
        .await;

        let mut clients = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(client) => clients.push(client),
                Err(e) => debug!(msg = "dropping unreachable instance", %e),
            }
        }

        let mut engine = Self {
            instances: Vec::new(),
            clients,
        };
        if engine.clients.len() < MIN_FAILOVER_SIZE {
            let live = engine.clients.len();
            engine.disconnect();
            return Err(ReplicationError::InsufficientQuorum(live));
        }
        if let Err(e) = engine.refresh().await {
            engine.disconnect();
            return Err(e);
        }
        Ok(engine)
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Query every instance's topology in parallel and rebuild the records.
    ///
    /// This is a barrier, not a stream: it returns once every task has
    /// completed, and any task failure fails the whole refresh with the
    /// collected errors.
    pub async fn refresh(&mut self) -> Result<(), ReplicationError> {
        let results = join_all(self.clients.iter_mut().map(|client| async move {
            let body = client.query_topology().await?;
            let state = parse_report(&body)?;
            Ok::<Instance, ReplicationError>(Instance {
                address: client.address().clone(),
                state,
            })
        }))
        .await;

        let mut instances = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(instance) => instances.push(instance),
                Err(e) => errors.push(e),
            }
        }
        if !errors.is_empty() {
            return Err(aggregate(errors));
        }
        self.instances = instances;
        Ok(())
    }

    /// Address of the currently selected primary, if the set has one.
    pub fn primary_address(&self) -> Option<&Address> {
        match select_primary(&self.instances) {
            PrimarySelection::Found(idx) => Some(&self.instances[idx].address),
            _ => None,
        }
    }

    /// Restore a single-primary fanout.
    ///
    /// Elects the primary (promoting a secondary when the primary was lost)
    /// and reassigns every orphan secondary to it in parallel. Individual
    /// reassign failures never abort the others; they are joined into one
    /// error after the barrier.
    pub async fn reconfigure(&mut self) -> Result<(), ReplicationError> {
        let primary = match select_primary(&self.instances) {
            PrimarySelection::Empty => return Ok(()),
            PrimarySelection::Found(idx) => idx,
            PrimarySelection::Lost => {
                // safe unwrap: Lost is only reported when an electable secondary exists
                let candidate = *promotion_candidates(&self.instances).first().unwrap();
                self.promote(candidate).await?;
                candidate
            }
        };

        let primary_address = self.instances[primary].address.clone();
        let orphan_indices = orphans(&self.instances, primary);
        if orphan_indices.is_empty() {
            return Ok(());
        }
        info!(
            msg = "reassigning orphan secondaries",
            primary = %primary_address,
            orphans = orphan_indices.len(),
        );

        let errors: Vec<ReplicationError> = join_all(
            self.clients
                .iter_mut()
                .enumerate()
                .filter(|(idx, _)| orphan_indices.contains(idx))
                .map(|(_, client)| {
                    let primary_address = primary_address.clone();
                    async move { client.reassign(Some(&primary_address)).await }
                }),
        )
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(aggregate(errors))
        }
    }

    /// Promote the candidate to primary and poll its topology until it
    /// reports the new role, bounded by [`DEFAULT_FAILOVER_TIMEOUT`].
    async fn promote(&mut self, candidate: usize) -> Result<(), ReplicationError> {
        let address = self.instances[candidate].address.clone();
        warn!(msg = "promoting secondary to primary", instance = %address);
        self.clients[candidate].reassign(None).await?;

        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .without_max_times()
            .build();
        let client = &mut self.clients[candidate];
        let settled = tokio::time::timeout(DEFAULT_FAILOVER_TIMEOUT, async {
            loop {
                let state = match client.query_topology().await {
                    Ok(body) => parse_report(&body)?,
                    Err(e) => {
                        debug!(msg = "promotion poll failed, retrying", %e);
                        ReplicationState::new(Role::Secondary)
                    }
                };
                if state.role == Role::Primary {
                    return Ok::<ReplicationState, ReplicationError>(state);
                }
                // safe unwrap: without_max_times yields delays indefinitely
                tokio::time::sleep(backoff.next().unwrap()).await;
            }
        })
        .await
        .map_err(|_| ReplicationError::PromotionTimeout(DEFAULT_FAILOVER_TIMEOUT))??;

        info!(msg = "secondary settled as primary", instance = %address);
        self.instances[candidate].state = settled;
        Ok(())
    }

    /// Release every held connection. Idempotent; called on the error path of
    /// every engine operation and at the end of each reconciliation.
    pub fn disconnect(&mut self) {
        // multiplexed connections close once the last handle is dropped
        self.clients.clear();
        self.instances.clear();
    }
}
