//! In-process implementations of the cluster collaborators.
//!
//! Every group runs a single replica whose storage, schema catalog and
//! consensus log live in memory; the oracle, membership view and id lease
//! are shared by the whole cluster. Used by the admin service for a
//! standalone node and by the scenario tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use super::peers::PeerRegistry;
use super::{
    ConsensusLog, GroupId, IdLease, KvRecord, LeaseKind, MembershipService, Oracle, Proposal,
    ProposalApplier, SchemaCatalog, Storage,
};
use crate::config::Config;
use crate::destination::{HandlerFactory, UriHandlerFactory};
use crate::manifest::{DropOp, DropOperation};
use crate::membership::{MembershipState, Tablet};
use crate::worker::{Worker, WorkerDeps};
use crate::{Result, WorkerError};

/// Timestamp oracle where every issued timestamp is immediately visible.
pub struct MemOracle {
    ts: watch::Sender<u64>,
}

impl Default for MemOracle {
    fn default() -> Self {
        let (ts, _) = watch::channel(0);
        Self { ts }
    }
}

impl MemOracle {
    /// Issue the next commit timestamp.
    pub fn advance(&self) -> u64 {
        let mut next = 0;
        self.ts.send_modify(|ts| {
            *ts += 1;
            next = *ts;
        });
        next
    }

    pub fn current(&self) -> u64 {
        *self.ts.borrow()
    }
}

#[async_trait]
impl Oracle for MemOracle {
    async fn read_only_timestamp(&self) -> Result<u64> {
        Ok(self.current())
    }

    async fn next_timestamp(&self) -> Result<u64> {
        Ok(self.advance())
    }

    async fn wait_for_ts(&self, ts: u64) -> Result<()> {
        let mut rx = self.ts.subscribe();
        rx.wait_for(|current| *current >= ts)
            .await
            .map_err(|_| WorkerError::WaitForTs {
                ts,
                reason: "oracle shut down".to_string(),
            })?;
        Ok(())
    }
}

struct LogState {
    entries: Vec<(u64, Proposal)>,
    last_index: u64,
}

/// Single-replica consensus log: an entry is committed once every registered
/// applier has applied it. An entry that fails to apply is not committed.
pub struct LocalLog {
    group: GroupId,
    leader: AtomicBool,
    initialized: AtomicBool,
    appliers: RwLock<Vec<Weak<dyn ProposalApplier>>>,
    state: Mutex<LogState>,
    applied: watch::Sender<u64>,
    snapshot: watch::Sender<u64>,
}

impl LocalLog {
    pub fn new(group: GroupId) -> Self {
        let (applied, _) = watch::channel(0);
        let (snapshot, _) = watch::channel(0);
        Self {
            group,
            leader: AtomicBool::new(true),
            initialized: AtomicBool::new(true),
            appliers: RwLock::new(Vec::new()),
            state: Mutex::new(LogState {
                entries: Vec::new(),
                last_index: 0,
            }),
            applied,
            snapshot,
        }
    }

    pub fn register_applier(&self, applier: Weak<dyn ProposalApplier>) {
        self.appliers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(applier);
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    pub fn applied_index(&self) -> u64 {
        *self.applied.borrow()
    }

    /// Entries not yet covered by a snapshot.
    pub async fn retained_entries(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn wait_for_snapshot(&self, index: u64) {
        let mut rx = self.snapshot.subscribe();
        let _ = rx.wait_for(|snapshot| *snapshot >= index).await;
    }

    /// Re-apply every retained entry, as a restarting replica would.
    /// Returns the number of entries applied.
    pub async fn replay(&self) -> Result<usize> {
        let state = self.state.lock().await;
        for (index, proposal) in &state.entries {
            self.apply_entry(proposal, *index).await?;
        }
        Ok(state.entries.len())
    }

    async fn apply_entry(&self, proposal: &Proposal, index: u64) -> Result<()> {
        let appliers: Vec<Arc<dyn ProposalApplier>> = self
            .appliers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for applier in appliers {
            applier.apply(proposal, index).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConsensusLog for LocalLog {
    async fn propose(&self, proposal: Proposal) -> Result<u64> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(WorkerError::ConsensusNotInitialized);
        }
        if !self.am_leader() {
            return Err(WorkerError::Rpc(format!(
                "not the leader of group {}",
                self.group
            )));
        }

        let mut state = self.state.lock().await;
        let index = state.last_index + 1;
        self.apply_entry(&proposal, index).await?;
        state.last_index = index;
        state.entries.push((index, proposal));
        self.applied.send_replace(index);
        debug!(group = self.group, index, "Log entry applied");
        Ok(index)
    }

    fn am_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    async fn wait_for_applied_index(&self, index: u64) -> Result<()> {
        let mut rx = self.applied.subscribe();
        rx.wait_for(|applied| *applied >= index)
            .await
            .map_err(|e| WorkerError::Rpc(e.to_string()))?;
        Ok(())
    }

    async fn propose_snapshot(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let upto = state.last_index;
        state.entries.retain(|(index, _)| *index > upto);
        self.snapshot.send_replace(upto);
        info!(group = self.group, index = upto, "Log truncated at snapshot");
        Ok(())
    }
}

type RecordKey = (String, u64, u64);

#[derive(Default)]
struct StorageState {
    /// Committed values of each key, by commit timestamp
    versions: BTreeMap<RecordKey, BTreeMap<u64, Vec<u8>>>,
    drops: Vec<DropOperation>,
}

/// Multi-version key-value store.
#[derive(Default)]
pub struct MemStorage {
    state: RwLock<StorageState>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StorageState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StorageState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put(&self, predicate: &str, namespace: u64, uid: u64, value: &[u8], ts: u64) {
        self.write()
            .versions
            .entry((predicate.to_string(), namespace, uid))
            .or_default()
            .insert(ts, value.to_vec());
    }

    /// Latest committed value of a key.
    pub fn get(&self, predicate: &str, namespace: u64, uid: u64) -> Option<Vec<u8>> {
        self.read()
            .versions
            .get(&(predicate.to_string(), namespace, uid))?
            .values()
            .next_back()
            .cloned()
    }

    /// Remove the data `drop` covers and record it in the drop history.
    pub fn apply_drop(&self, drop: DropOperation) {
        let mut state = self.write();
        state
            .versions
            .retain(|(predicate, namespace, _), _| !drop.invalidates(predicate, *namespace));
        state.drops.push(drop);
    }

    pub fn predicates(&self) -> BTreeSet<String> {
        self.read()
            .versions
            .keys()
            .map(|(predicate, _, _)| predicate.clone())
            .collect()
    }

    /// Remove every version of `predicate`, e.g. when its tablet moves away.
    pub fn export_predicate(&self, predicate: &str) -> Vec<KvRecord> {
        let mut state = self.write();
        let keys: Vec<RecordKey> = state
            .versions
            .keys()
            .filter(|(pred, _, _)| pred == predicate)
            .cloned()
            .collect();

        let mut records = Vec::new();
        for key in keys {
            if let Some(versions) = state.versions.remove(&key) {
                for (version, value) in versions {
                    records.push(KvRecord {
                        predicate: key.0.clone(),
                        namespace: key.1,
                        uid: key.2,
                        value,
                        version,
                    });
                }
            }
        }
        records
    }

    /// Insert records at their own commit timestamps.
    pub fn import(&self, records: Vec<KvRecord>) {
        let mut state = self.write();
        for record in records {
            state
                .versions
                .entry((record.predicate, record.namespace, record.uid))
                .or_default()
                .insert(record.version, record.value);
        }
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn scan(
        &self,
        predicates: &[String],
        since_ts: u64,
        read_ts: u64,
    ) -> Result<Vec<KvRecord>> {
        let wanted: BTreeSet<&str> = predicates.iter().map(String::as_str).collect();
        let state = self.read();

        let mut records = Vec::new();
        for ((predicate, namespace, uid), versions) in &state.versions {
            if !wanted.contains(predicate.as_str()) {
                continue;
            }
            if let Some((version, value)) = versions.range(..=read_ts).next_back() {
                if *version > since_ts {
                    records.push(KvRecord {
                        predicate: predicate.clone(),
                        namespace: *namespace,
                        uid: *uid,
                        value: value.clone(),
                        version: *version,
                    });
                }
            }
        }
        Ok(records)
    }

    async fn drop_history(&self, since_ts: u64, read_ts: u64) -> Result<Vec<DropOperation>> {
        Ok(self
            .read()
            .drops
            .iter()
            .filter(|drop| drop.ts > since_ts && drop.ts <= read_ts)
            .cloned()
            .collect())
    }

    async fn write_batch(&self, records: Vec<KvRecord>, ts: u64) -> Result<()> {
        let mut state = self.write();
        for record in records {
            state
                .versions
                .entry((record.predicate, record.namespace, record.uid))
                .or_default()
                .insert(ts, record.value);
        }
        Ok(())
    }

    async fn drop_all(&self, ts: u64) -> Result<()> {
        self.apply_drop(DropOperation {
            op: DropOp::All,
            value: String::new(),
            ts,
        });
        Ok(())
    }
}

/// Schema derived from the predicates present in storage.
pub struct MemCatalog {
    storage: Arc<MemStorage>,
    schema: RwLock<BTreeSet<String>>,
    acl_resets: AtomicU64,
}

impl MemCatalog {
    pub fn new(storage: Arc<MemStorage>) -> Self {
        Self {
            storage,
            schema: RwLock::new(BTreeSet::new()),
            acl_resets: AtomicU64::new(0),
        }
    }

    pub fn schema(&self) -> BTreeSet<String> {
        self.schema.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn acl_resets(&self) -> u64 {
        self.acl_resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchemaCatalog for MemCatalog {
    async fn reload_schema(&self) -> Result<()> {
        let predicates = self.storage.predicates();
        *self.schema.write().unwrap_or_else(|e| e.into_inner()) = predicates;
        Ok(())
    }

    fn reset_acl_cache(&self) {
        self.acl_resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// The control plane's membership record.
#[derive(Default)]
pub struct MemMembership {
    state: RwLock<MembershipState>,
}

impl MemMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&self, group: GroupId) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.groups.entry(group).or_default();
        state.recompute_checksums();
    }

    pub fn set_tablet(&self, predicate: &str, group: GroupId) -> Tablet {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let tablet = state.assign(predicate, group, false);
        state.recompute_checksums();
        tablet
    }
}

#[async_trait]
impl MembershipService for MemMembership {
    async fn update_membership_state(&self) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.counter += 1;
        state.recompute_checksums();
        Ok(())
    }

    fn membership_state(&self) -> MembershipState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn force_tablet(&self, predicate: &str, group: GroupId) -> Result<Tablet> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let previous = state.owner_of(predicate);
        let tablet = state.assign(predicate, group, true);
        debug!(predicate, group, ?previous, "Tablet ownership forced");
        Ok(tablet)
    }
}

#[derive(Default)]
pub struct MemIdLease {
    max_uid: AtomicU64,
    max_namespace: AtomicU64,
}

impl MemIdLease {
    pub fn max_uid(&self) -> u64 {
        self.max_uid.load(Ordering::SeqCst)
    }

    pub fn max_namespace(&self) -> u64 {
        self.max_namespace.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdLease for MemIdLease {
    async fn assign_ids(&self, value: u64, kind: LeaseKind) -> Result<()> {
        let counter = match kind {
            LeaseKind::Uid => &self.max_uid,
            LeaseKind::NamespaceId => &self.max_namespace,
        };
        counter.fetch_max(value, Ordering::SeqCst);
        Ok(())
    }
}

/// Collaborators shared by every group of a cluster.
#[derive(Clone)]
pub struct SharedServices {
    pub oracle: Arc<MemOracle>,
    pub membership: Arc<MemMembership>,
    pub id_lease: Arc<MemIdLease>,
    pub peers: Arc<PeerRegistry>,
    pub handlers: Arc<dyn HandlerFactory>,
}

impl Default for SharedServices {
    fn default() -> Self {
        Self {
            oracle: Arc::new(MemOracle::default()),
            membership: Arc::new(MemMembership::new()),
            id_lease: Arc::new(MemIdLease::default()),
            peers: Arc::new(PeerRegistry::new()),
            handlers: Arc::new(UriHandlerFactory),
        }
    }
}

impl SharedServices {
    pub fn control_plane(&self) -> ControlPlane {
        ControlPlane {
            oracle: self.oracle.clone(),
            membership: self.membership.clone(),
            id_lease: self.id_lease.clone(),
        }
    }
}

/// The cluster-wide authorities a group talks to. In-process for a
/// [`LocalCluster`], possibly remote for a node of a multi-process cluster.
#[derive(Clone)]
pub struct ControlPlane {
    pub oracle: Arc<dyn Oracle>,
    pub membership: Arc<dyn MembershipService>,
    pub id_lease: Arc<dyn IdLease>,
}

/// One group: its worker and the replica state behind it.
pub struct LocalGroup {
    pub worker: Arc<Worker>,
    pub log: Arc<LocalLog>,
    pub storage: Arc<MemStorage>,
    pub catalog: Arc<MemCatalog>,
}

impl LocalGroup {
    /// Build the group named by `config.node.group_id` and register it with
    /// the shared services.
    pub fn start(config: &Config, shared: &SharedServices) -> Result<Self> {
        let started = Self::start_with(
            config,
            shared.control_plane(),
            &shared.peers,
            Arc::clone(&shared.handlers),
        )?;
        shared.membership.add_group(config.node.group_id);
        Ok(started)
    }

    /// Build a group against an arbitrary control plane. The caller makes
    /// the group known to the membership service.
    pub fn start_with(
        config: &Config,
        control: ControlPlane,
        peers: &Arc<PeerRegistry>,
        handlers: Arc<dyn HandlerFactory>,
    ) -> Result<Self> {
        let group = config.node.group_id;
        let storage = Arc::new(MemStorage::new());
        let catalog = Arc::new(MemCatalog::new(Arc::clone(&storage)));
        let log = Arc::new(LocalLog::new(group));

        let deps = WorkerDeps {
            oracle: control.oracle,
            log: log.clone(),
            storage: storage.clone(),
            catalog: catalog.clone(),
            membership: control.membership,
            id_lease: control.id_lease,
            handlers,
            peers: peers.clone(),
        };
        let worker = Arc::new(Worker::new(config, deps)?);

        let weak = Arc::downgrade(&worker);
        let applier: Weak<dyn ProposalApplier> = weak;
        log.register_applier(applier);
        peers.register_local(&worker);

        info!(group, node = %worker.node_id(), "Started local group");
        Ok(Self {
            worker,
            log,
            storage,
            catalog,
        })
    }
}

/// A whole cluster in one process.
pub struct LocalCluster {
    pub oracle: Arc<MemOracle>,
    pub membership: Arc<MemMembership>,
    pub id_lease: Arc<MemIdLease>,
    pub peers: Arc<PeerRegistry>,
    groups: BTreeMap<GroupId, LocalGroup>,
}

impl LocalCluster {
    /// Defaults with a short restore backoff.
    pub fn local_config() -> Config {
        let mut config = Config::default();
        config.restore.retry_backoff_ms = 10;
        config
    }

    pub fn new(groups: &[GroupId]) -> Result<Self> {
        Self::with_config(groups, Self::local_config())
    }

    pub fn with_config(groups: &[GroupId], config: Config) -> Result<Self> {
        let shared = SharedServices::default();

        let mut started = BTreeMap::new();
        for group in groups {
            let mut group_config = config.clone();
            group_config.node.id = format!("alpha-{}", group);
            group_config.node.group_id = *group;
            started.insert(*group, LocalGroup::start(&group_config, &shared)?);
        }

        Ok(Self {
            oracle: shared.oracle,
            membership: shared.membership,
            id_lease: shared.id_lease,
            peers: shared.peers,
            groups: started,
        })
    }

    pub fn group(&self, group: GroupId) -> Option<&LocalGroup> {
        self.groups.get(&group)
    }

    pub fn worker(&self, group: GroupId) -> Option<Arc<Worker>> {
        self.groups.get(&group).map(|g| Arc::clone(&g.worker))
    }

    pub fn set_tablet(&self, predicate: &str, group: GroupId) -> Tablet {
        self.membership.set_tablet(predicate, group)
    }

    fn owner(&self, predicate: &str) -> Result<&LocalGroup> {
        let owner = self
            .membership
            .membership_state()
            .owner_of(predicate)
            .ok_or_else(|| {
                WorkerError::Storage(format!("predicate {} is not served by any group", predicate))
            })?;
        self.groups
            .get(&owner)
            .ok_or(WorkerError::NoConnection(owner))
    }

    /// Commit one value on the group owning `predicate`. Returns its timestamp.
    pub fn commit(&self, predicate: &str, namespace: u64, uid: u64, value: &[u8]) -> Result<u64> {
        let group = self.owner(predicate)?;
        let ts = self.oracle.advance();
        group.storage.put(predicate, namespace, uid, value, ts);
        Ok(ts)
    }

    /// Hand `predicate` and its data over to `group`.
    pub fn move_tablet(&self, predicate: &str, group: GroupId) -> Result<()> {
        let target = self
            .groups
            .get(&group)
            .ok_or(WorkerError::NoConnection(group))?;
        if let Ok(source) = self.owner(predicate) {
            target.storage.import(source.storage.export_predicate(predicate));
        }
        self.membership.set_tablet(predicate, group);
        Ok(())
    }

    pub fn drop_predicate(&self, predicate: &str) -> Result<u64> {
        let group = self.owner(predicate)?;
        let ts = self.oracle.advance();
        group.storage.apply_drop(DropOperation {
            op: DropOp::Attr,
            value: predicate.to_string(),
            ts,
        });
        Ok(ts)
    }

    pub fn drop_all(&self) -> Result<u64> {
        let ts = self.oracle.advance();
        for group in self.groups.values() {
            group.storage.apply_drop(DropOperation {
                op: DropOp::All,
                value: String::new(),
                ts,
            });
        }
        Ok(ts)
    }
}
