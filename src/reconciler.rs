//! Reconciler: bootstrap, per-Service events and the healing pass
//!
//! The reconciler is built once at startup with an injected
//! [`CommandRunner`] (through [`Iptables`]) and an injected
//! [`ClusterSource`]. [`Reconciler::bootstrap`] must complete before any
//! event is handled; the runtime only starts dispatching after it returns.
//!
//! The [`ServiceCache`] remembers the last record rules were created from.
//! It is the only source of truth when a Service disappears, since a delete
//! event carries no spec or status.

use crate::config::AgentConfig;
use crate::core::error::{Error, Result};
use crate::core::iptables::{Family, Iptables};
use crate::core::runner::CommandRunner;
use crate::policy::NetworkSettings;
use crate::policy::drop_invalid::DropInvalidInput;
use crate::policy::external_cluster::ExternalClusterNat;
use crate::policy::not_track_dns::NotTrackDns;
use crate::service::{ServiceKey, ServiceRecord};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Read access to Services in the cluster.
pub trait ClusterSource: Send + Sync + 'static {
    /// Current record for `key`, or `None` if the Service does not exist.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the API call fails.
    fn get_service(
        &self,
        key: &ServiceKey,
    ) -> impl Future<Output = Result<Option<ServiceRecord>>> + Send;

    /// Every Service in the cluster.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the API call fails.
    fn list_services(&self) -> impl Future<Output = Result<Vec<ServiceRecord>>> + Send;
}

/// Lifecycle of a [`Reconciler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Phase {
    Uninitialized,
    Bootstrapping,
    Steady,
}

/// Last-applied record per Service
#[derive(Debug, Default)]
pub struct ServiceCache {
    inner: Mutex<HashMap<ServiceKey, ServiceRecord>>,
}

impl ServiceCache {
    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<ServiceKey, ServiceRecord>> {
        // Entries are whole records written after success; a poisoned map is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &ServiceKey) -> Option<ServiceRecord> {
        self.map().get(key).cloned()
    }

    pub fn insert(&self, record: ServiceRecord) {
        self.map().insert(record.key.clone(), record);
    }

    pub fn remove(&self, key: &ServiceKey) -> Option<ServiceRecord> {
        self.map().remove(key)
    }

    /// Keeps only the entries whose key passes `keep`. Returns how many were dropped.
    pub fn retain(&self, mut keep: impl FnMut(&ServiceKey) -> bool) -> usize {
        let mut map = self.map();
        let before = map.len();
        map.retain(|key, _| keep(key));
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

pub struct Reconciler<R, C> {
    cluster: C,
    config: AgentConfig,
    drop_invalid: DropInvalidInput<R>,
    not_track: NotTrackDns<R>,
    external: ExternalClusterNat<R>,
    cache: ServiceCache,
    phase: Mutex<Phase>,
    /// Shared by events, exclusive for drift passes
    pass: RwLock<()>,
}

impl<R: CommandRunner, C: ClusterSource> Reconciler<R, C> {
    pub fn new(ipt: Arc<Iptables<R>>, cluster: C, config: AgentConfig, net: NetworkSettings) -> Self {
        Self {
            cluster,
            drop_invalid: DropInvalidInput::new(ipt.clone(), net),
            not_track: NotTrackDns::new(ipt.clone(), net),
            external: ExternalClusterNat::new(ipt, net),
            config,
            cache: ServiceCache::default(),
            phase: Mutex::new(Phase::Uninitialized),
            pass: RwLock::new(()),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
        debug!(phase = %phase, "reconciler phase");
    }

    pub fn cache(&self) -> &ServiceCache {
        &self.cache
    }

    /// Installs or tears down every policy per configuration, then runs the
    /// initial drift pass and DNS not-track augmentation.
    ///
    /// # Errors
    ///
    /// Any error is fatal: policy state would be undefined.
    pub async fn bootstrap(&self) -> Result<()> {
        if self.phase() != Phase::Uninitialized {
            return Err(Error::Internal("bootstrap already ran".to_string()));
        }
        self.set_phase(Phase::Bootstrapping);

        if self.config.drop_invalid_input {
            self.drop_invalid.ensure().await?;
        } else {
            self.drop_invalid.teardown().await?;
        }
        if self.config.not_track_dns {
            self.not_track.ensure().await?;
        } else {
            self.not_track.teardown().await?;
        }
        if self.config.external_cluster {
            self.external.ensure_chains().await?;
        } else {
            self.external.teardown().await?;
        }

        self.resync().await?;

        self.set_phase(Phase::Steady);
        info!("bootstrap complete");
        Ok(())
    }

    /// Reconciles one Service.
    ///
    /// # Errors
    ///
    /// Returns `Err` on API or command failure; the caller requeues.
    pub async fn handle(&self, key: &ServiceKey) -> Result<()> {
        if self.phase() != Phase::Steady {
            return Err(Error::Internal(format!(
                "event for {key} before bootstrap completed"
            )));
        }

        let _pass = self.pass.read().await;
        self.ensure_base().await?;
        let record = self.cluster.get_service(key).await?;

        if self.config.not_track_dns && self.config.dns_services.contains(key) {
            if let Some(record) = &record {
                self.add_dns_cluster_ips(record).await?;
            }
        }

        if !self.config.external_cluster {
            return Ok(());
        }

        match record {
            Some(record) if record.wants_nat() => self.apply(record).await,
            _ => self.withdraw(key).await,
        }
    }

    /// Timer tick: re-asserts drop-invalid-input and, with drift resync on,
    /// everything else including a full drift pass.
    ///
    /// # Errors
    ///
    /// Returns `Err` on API or command failure; the next tick retries.
    pub async fn heal(&self) -> Result<()> {
        if self.config.drop_invalid_input {
            self.drop_invalid.ensure().await?;
        }
        if self.config.drift_resync {
            self.ensure_base().await?;
            self.resync().await?;
        }
        Ok(())
    }

    /// Chains and JumpLinks of enabled policies.
    async fn ensure_base(&self) -> Result<()> {
        if self.config.drop_invalid_input {
            self.drop_invalid.ensure().await?;
        }
        if self.config.not_track_dns {
            self.not_track.ensure().await?;
        }
        if self.config.external_cluster {
            self.external.ensure_chains().await?;
        }
        Ok(())
    }

    /// Drift pass against a fresh Service list, plus DNS augmentation.
    async fn resync(&self) -> Result<()> {
        if !self.config.external_cluster && !self.config.not_track_dns {
            return Ok(());
        }

        let _pass = self.pass.write().await;
        let services = self.cluster.list_services().await?;

        if self.config.external_cluster {
            let deleted = self.external.cleanup(&services).await?;
            if deleted > 0 {
                info!(deleted, "drift cleanup removed stale rules");
            }

            // Rules of vanished or non-LB Services are gone now; so are their entries.
            let live: HashSet<&ServiceKey> = services
                .iter()
                .filter(|s| s.wants_nat())
                .map(|s| &s.key)
                .collect();
            let pruned = self.cache.retain(|key| live.contains(key));
            if pruned > 0 {
                debug!(pruned, "dropped cache entries of withdrawn Services");
            }
        }

        if self.config.not_track_dns {
            for record in services
                .iter()
                .filter(|s| self.config.dns_services.contains(&s.key))
            {
                self.add_dns_cluster_ips(record).await?;
            }
        }
        Ok(())
    }

    async fn add_dns_cluster_ips(&self, record: &ServiceRecord) -> Result<()> {
        for family in [Family::V4, Family::V6] {
            if let Some(ip) = record.cluster_ip(family) {
                self.not_track.add_dns_cluster_ip(ip).await?;
            }
        }
        Ok(())
    }

    /// Creates rules for `record`, first deleting pairs the cached record had
    /// that `record` no longer has. The cache is written last.
    async fn apply(&self, record: ServiceRecord) -> Result<()> {
        let wanted = nat_pairs(&record);

        if let Some(previous) = self.cache.get(&record.key) {
            for (ext, cluster) in nat_pairs(&previous)
                .into_iter()
                .filter(|p| !wanted.contains(p))
            {
                self.external.delete(&record.key, ext, cluster).await?;
            }
        }

        for (ext, cluster) in &wanted {
            self.external.create(&record.key, *ext, *cluster).await?;
        }

        debug!(service = %record.key, pairs = wanted.len(), "applied");
        self.cache.insert(record);
        Ok(())
    }

    /// Deletes the rules of the cached record. The entry is dropped only
    /// after every delete succeeded, so a retry still knows what to remove.
    async fn withdraw(&self, key: &ServiceKey) -> Result<()> {
        let Some(previous) = self.cache.get(key) else {
            debug!(service = %key, "nothing cached, nothing to delete");
            return Ok(());
        };

        for (ext, cluster) in nat_pairs(&previous) {
            self.external.delete(key, ext, cluster).await?;
        }

        self.cache.remove(key);
        info!(service = %key, "withdrew external-cluster rules");
        Ok(())
    }
}

/// Pairs of both families.
fn nat_pairs(record: &ServiceRecord) -> Vec<(IpAddr, IpAddr)> {
    let mut pairs = record.nat_pairs(Family::V4);
    pairs.extend(record.nat_pairs(Family::V6));
    if pairs.is_empty() && record.wants_nat() {
        warn!(service = %record.key, "LoadBalancer Service has no usable external IP");
    }
    pairs
}
