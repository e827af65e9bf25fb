//! Coordinator dividing partitions across every process sharing a consumer
//! name.
//!
//! Per event type the process joins a membership group once, computes its
//! candidate partitions with [`rebalance`](crate::coordination::rebalance)
//! and contests one leader election per candidate partition. Winning an
//! election assigns the partition; losing or relinquishing it revokes it.
//! Broker topology changes (via `rebalance`) and membership changes (via a
//! watcher task) both trigger a recomputation, serialized per event type by
//! the elections lock.

use super::{CoordinatorCore, ErrorAction, PartitionCoordinator, ProcessingFailure};
use crate::config::ConsumerConfig;
use crate::coordination::{
    CoordinationConfig, CoordinationStore, GroupMembership, KeySpace, LeaderElection,
    LeadershipListener, MembershipEvent, rebalance,
};
use crate::error::{ConsumerError, ConsumerResult};
use crate::model::{EventType, EventTypePartition, GroupMember, NakadiPartition};
use crate::offsets::CoordinatedOffsetStore;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Topology = Arc<RwLock<BTreeMap<String, NakadiPartition>>>;

pub struct LeaderElectionCoordinator {
    core: Arc<CoordinatorCore>,
    store: Arc<dyn CoordinationStore>,
    config: CoordinationConfig,
    member: GroupMember,
    groups: Mutex<HashMap<EventType, Arc<EventTypeGroup>>>,
}

impl LeaderElectionCoordinator {
    /// Offsets are kept in the same coordination store as membership and
    /// leadership.
    pub fn new(
        consumer: &ConsumerConfig,
        config: CoordinationConfig,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        let offsets = CoordinatedOffsetStore::new(store.clone(), config.key_space());
        Self {
            core: Arc::new(CoordinatorCore::new(
                consumer.consumer_name.clone(),
                consumer.start_offset,
                consumer.delete_unavailable_cursors,
                Some(Arc::new(offsets)),
            )),
            store,
            config,
            member: GroupMember::local(),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Use a fixed identity instead of a random member id.
    pub fn with_member(mut self, member: GroupMember) -> Self {
        self.member = member;
        self
    }

    pub fn member_id(&self) -> &str {
        &self.member.member_id
    }

    /// Group for `event_type`, joining it on first use.
    async fn group(&self, event_type: &EventType) -> ConsumerResult<Arc<EventTypeGroup>> {
        let mut groups = self.groups.lock().await;
        if let Some(group) = groups.get(event_type) {
            return Ok(group.clone());
        }

        let membership = GroupMembership::new(
            self.store.clone(),
            self.config.clone(),
            event_type.clone(),
            self.core.consumer(),
            self.member.clone(),
        )?;
        let topology: Topology = Arc::default();
        let group = Arc::new(EventTypeGroup {
            event_type: event_type.clone(),
            core: self.core.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            keys: self.config.key_space(),
            leadership: Arc::new(GroupLeadership {
                core: self.core.clone(),
                event_type: event_type.clone(),
                topology: topology.clone(),
            }),
            membership,
            topology,
            elections: Mutex::new(BTreeMap::new()),
            watcher: std::sync::Mutex::new(None),
            closing: AtomicBool::new(false),
        });

        let events = group.membership.join().await?;
        let watcher = tokio::spawn(watch_membership(Arc::downgrade(&group), events));
        if let Ok(mut slot) = group.watcher.lock() {
            *slot = Some(watcher);
        }

        groups.insert(event_type.clone(), group.clone());
        Ok(group)
    }
}

#[async_trait]
impl PartitionCoordinator for LeaderElectionCoordinator {
    fn core(&self) -> &CoordinatorCore {
        &self.core
    }

    async fn init(&self) -> ConsumerResult<()> {
        self.store.ping().await?;
        info!(
            consumer = %self.core.consumer(),
            member_id = %self.member.member_id,
            host = %self.member.host,
            "Leader election coordinator ready"
        );
        Ok(())
    }

    async fn close(&self) -> ConsumerResult<()> {
        let groups: Vec<Arc<EventTypeGroup>> = self.groups.lock().await.drain().map(|(_, g)| g).collect();

        let mut first_error = None;
        for group in groups {
            if let Err(e) = group.close().await {
                warn!(event_type = %group.event_type, error = %e, "Failed to leave consumer group");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn rebalance(
        &self,
        event_type: &EventType,
        owned: &BTreeSet<String>,
        partitions: &[NakadiPartition],
    ) -> ConsumerResult<()> {
        let reported: BTreeSet<&str> = partitions.iter().map(|p| p.partition.as_str()).collect();
        let vanished: Vec<String> = owned
            .iter()
            .filter(|id| !reported.contains(id.as_str()))
            .cloned()
            .collect();

        let group = self.group(event_type).await?;

        // New acquisitions see the new topology before anything is revoked,
        // and relinquishing waits out an acquisition already in flight, so
        // its assign always precedes the revoke below.
        group.update_topology(partitions);

        let mut elections = group.elections.lock().await;
        for id in &vanished {
            if let Some(election) = elections.remove(id) {
                election.relinquish(false).await;
            }
        }

        if !vanished.is_empty() {
            info!(
                event_type = %event_type,
                partitions = ?vanished,
                "Partitions no longer reported by the broker"
            );
            self.core.emit_revoke(
                event_type,
                vanished
                    .iter()
                    .map(|id| EventTypePartition::new(event_type.clone(), id.as_str()))
                    .collect(),
            );
        }

        let changed = group.recompute(&mut elections).await;
        drop(elections);

        if vanished.is_empty() && !changed {
            self.core.emit_health_check(event_type);
        }
        Ok(())
    }

    async fn error(&self, failure: ProcessingFailure) -> ConsumerResult<()> {
        let ErrorAction::Revoke(partition) = self.core.route_error(failure).await? else {
            return Ok(());
        };

        let group = self.groups.lock().await.get(partition.event_type()).cloned();
        let election = match &group {
            Some(group) => group.elections.lock().await.remove(partition.partition()),
            None => None,
        };

        match election {
            // Giving up leadership emits the revocation
            Some(election) if election.is_leader() => election.relinquish(true).await,
            Some(election) => {
                election.relinquish(false).await;
                self.core
                    .emit_revoke(partition.event_type(), vec![partition.clone()]);
            }
            None => self
                .core
                .emit_revoke(partition.event_type(), vec![partition.clone()]),
        }
        Ok(())
    }
}

/// Membership, topology and elections of one event type
struct EventTypeGroup {
    event_type: EventType,
    core: Arc<CoordinatorCore>,
    store: Arc<dyn CoordinationStore>,
    config: CoordinationConfig,
    keys: KeySpace,
    membership: GroupMembership,
    topology: Topology,
    elections: Mutex<BTreeMap<String, LeaderElection>>,
    leadership: Arc<GroupLeadership>,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl EventTypeGroup {
    fn update_topology(&self, partitions: &[NakadiPartition]) {
        if let Ok(mut topology) = self.topology.write() {
            *topology = partitions
                .iter()
                .map(|p| (p.partition.clone(), p.clone()))
                .collect();
        }
    }

    fn partition_ids(&self) -> Vec<String> {
        self.topology
            .read()
            .map(|topology| topology.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Contest every candidate partition and drop every other election.
    /// Returns whether the set of contested partitions changed.
    async fn recompute(&self, elections: &mut BTreeMap<String, LeaderElection>) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            return false;
        }

        let partitions = self.partition_ids();
        let members = self.membership.members();
        let Some(decision) = rebalance(
            self.membership.member_id(),
            partitions.iter().map(String::as_str),
            members.iter().map(String::as_str),
        ) else {
            debug!(
                event_type = %self.event_type,
                partitions = partitions.len(),
                members = members.len(),
                "Not enough information to rebalance yet"
            );
            return false;
        };

        let dropped: Vec<String> = elections
            .keys()
            .filter(|id| !decision.assign.contains(*id))
            .cloned()
            .collect();
        for id in &dropped {
            if let Some(election) = elections.remove(id) {
                election.relinquish(true).await;
            }
        }

        let mut started = 0;
        for id in &decision.assign {
            if elections.contains_key(id) {
                continue;
            }
            let key = self
                .keys
                .leader(&EventTypePartition::new(self.event_type.clone(), id.as_str()), self.core.consumer());
            let election = LeaderElection::start(
                self.store.clone(),
                &self.config,
                key,
                id.as_str(),
                self.membership.payload(),
                self.leadership.clone(),
            );
            elections.insert(id.clone(), election);
            started += 1;
        }

        let changed = started > 0 || !dropped.is_empty();
        if changed {
            info!(
                event_type = %self.event_type,
                member_id = %self.membership.member_id(),
                members = members.len(),
                candidates = ?decision.assign,
                relinquished = ?dropped,
                "Rebalanced candidate partitions"
            );
            self.core.record_rebalance(&self.event_type, started, dropped.len());
        }
        changed
    }

    async fn relinquish_all(&self, notify: bool) {
        let mut elections = self.elections.lock().await;
        for (_, election) in std::mem::take(&mut *elections) {
            election.relinquish(notify).await;
        }
    }

    async fn close(&self) -> ConsumerResult<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.relinquish_all(true).await;
        let left = self.membership.leave().await;

        let watcher = self.watcher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(watcher) = watcher {
            watcher.abort();
            let _ = watcher.await;
        }
        left
    }
}

async fn watch_membership(
    group: Weak<EventTypeGroup>,
    mut events: mpsc::UnboundedReceiver<MembershipEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(group) = group.upgrade() else {
            break;
        };
        if group.closing.load(Ordering::SeqCst) {
            break;
        }

        match event {
            MembershipEvent::Changed(members) => {
                debug!(event_type = %group.event_type, members = ?members, "Group membership changed");
                let mut elections = group.elections.lock().await;
                group.recompute(&mut elections).await;
            }
            MembershipEvent::SessionLost => {
                warn!(
                    event_type = %group.event_type,
                    member_id = %group.membership.member_id(),
                    "Group session lost, relinquishing every partition"
                );
                group.relinquish_all(true).await;
            }
        }
    }
}

/// Turns leadership transitions into assign and revoke notifications.
///
/// Runs on election tasks; must not touch the elections lock.
struct GroupLeadership {
    core: Arc<CoordinatorCore>,
    event_type: EventType,
    topology: Topology,
}

#[async_trait]
impl LeadershipListener for GroupLeadership {
    async fn take_leadership(&self, partition: &str) -> ConsumerResult<()> {
        let reported = self
            .topology
            .read()
            .ok()
            .and_then(|topology| topology.get(partition).cloned());
        let Some(reported) = reported else {
            return Err(ConsumerError::coordination(format!(
                "partition {partition} of {} is not reported by the broker",
                self.event_type
            )));
        };

        let cursor = self.core.start_cursor(&self.event_type, &reported).await?;
        self.core.emit_assign(&self.event_type, vec![cursor]);
        Ok(())
    }

    async fn leadership_lost(&self, partition: &str) {
        self.core.emit_revoke(
            &self.event_type,
            vec![EventTypePartition::new(self.event_type.clone(), partition)],
        );
    }
}
