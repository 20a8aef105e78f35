//! Static peer registry: the members of each group this node can reach.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use super::{GroupId, PeerRouter, WorkerClient};
use crate::worker::Worker;

enum Member {
    /// A worker running in this process
    Local(Weak<Worker>),
    /// A worker reached over the network
    Remote {
        client: Arc<dyn WorkerClient>,
        leader: bool,
    },
}

impl Member {
    fn client(&self) -> Option<Arc<dyn WorkerClient>> {
        match self {
            Member::Local(worker) => worker
                .upgrade()
                .map(|worker| worker as Arc<dyn WorkerClient>),
            Member::Remote { client, .. } => Some(Arc::clone(client)),
        }
    }

    fn is_leader(&self) -> bool {
        match self {
            Member::Local(worker) => worker.upgrade().is_some_and(|w| w.is_leader()),
            Member::Remote { leader, .. } => *leader,
        }
    }
}

#[derive(Default)]
pub struct PeerRegistry {
    members: RwLock<BTreeMap<GroupId, Vec<Member>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<GroupId, Vec<Member>>> {
        self.members.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<GroupId, Vec<Member>>> {
        self.members.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_local(&self, worker: &Arc<Worker>) {
        self.write()
            .entry(worker.group_id())
            .or_default()
            .push(Member::Local(Arc::downgrade(worker)));
    }

    pub fn register_remote(&self, group: GroupId, client: Arc<dyn WorkerClient>, leader: bool) {
        self.write()
            .entry(group)
            .or_default()
            .push(Member::Remote { client, leader });
    }

    pub fn remove_group(&self, group: GroupId) {
        self.write().remove(&group);
    }
}

impl PeerRouter for PeerRegistry {
    fn any_server(&self, group: GroupId) -> Option<Arc<dyn WorkerClient>> {
        self.read().get(&group)?.iter().find_map(Member::client)
    }

    fn leader(&self, group: GroupId) -> Option<Arc<dyn WorkerClient>> {
        self.read()
            .get(&group)?
            .iter()
            .filter(|member| member.is_leader())
            .find_map(Member::client)
    }
}
