//! Replication queue identity and the in-memory WAL index.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::Bound;

use osprey_common::error::ReplicationError;
use osprey_common::types::ServerName;

use crate::wal::wal_prefix;

// ---------------------------------------------------------------------------
// QueueId
// ---------------------------------------------------------------------------

/// Identity of a replication queue.
///
/// A *normal* queue is named after its peer and lives as long as the peer
/// does. A *recovered* queue additionally carries the chain of dead servers
/// it was claimed from, appended with `-`:
/// `p1-node_3001` is peer `p1`'s queue claimed once, from `node_3001`.
/// The peer id is always recoverable from the rendered string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId {
    peer_id: String,
    dead_servers: Vec<ServerName>,
}

impl QueueId {
    pub fn normal(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            dead_servers: Vec::new(),
        }
    }

    /// Parse a rendered queue id. The first `-`-separated token is the peer
    /// id, the rest the dead-server chain.
    pub fn parse(s: &str) -> Result<Self, ReplicationError> {
        let mut parts = s.split('-');
        let peer_id = match parts.next() {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => return Err(ReplicationError::InvalidQueueId(s.to_string())),
        };
        let dead_servers = parts.map(ServerName::from).collect();
        Ok(Self {
            peer_id,
            dead_servers,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn dead_servers(&self) -> &[ServerName] {
        &self.dead_servers
    }

    pub fn is_recovered(&self) -> bool {
        !self.dead_servers.is_empty()
    }

    /// The id this queue takes after being claimed from `dead_server`.
    pub fn claimed_from(&self, dead_server: &ServerName) -> Self {
        let mut claimed = self.clone();
        claimed.dead_servers.push(dead_server.clone());
        claimed
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.peer_id)?;
        for server in &self.dead_servers {
            write!(f, "-{server}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WalIndex
// ---------------------------------------------------------------------------

/// In-memory model of the WALs each queue still has to ship, grouped by WAL
/// prefix (log group). Names within a group are kept in ascending order;
/// cleanup only ever removes a prefix of a group, so a source never observes
/// a gap.
///
/// Pure data structure: all locking is the owner's responsibility.
#[derive(Debug, Default)]
pub struct WalIndex {
    by_queue: HashMap<QueueId, HashMap<String, BTreeSet<String>>>,
}

impl WalIndex {
    /// Start tracking `queue` with no WALs.
    pub fn init_queue(&mut self, queue: QueueId) {
        self.by_queue.entry(queue).or_default();
    }

    pub fn remove_queue(&mut self, queue: &QueueId) {
        self.by_queue.remove(queue);
    }

    pub fn contains_queue(&self, queue: &QueueId) -> bool {
        self.by_queue.contains_key(queue)
    }

    pub fn groups(&self, queue: &QueueId) -> Option<&HashMap<String, BTreeSet<String>>> {
        self.by_queue.get(queue)
    }

    /// Add one WAL under `queue`, deriving its group from the name.
    pub fn insert(&mut self, queue: &QueueId, wal: &str) {
        if let Some(groups) = self.by_queue.get_mut(queue) {
            groups
                .entry(wal_prefix(wal).to_string())
                .or_default()
                .insert(wal.to_string());
        }
    }

    /// Apply a log roll of `wal` to every tracked queue.
    ///
    /// With `clear_existing` set (no live consumer), pre-existing group
    /// contents are dropped first: there is nobody left to ship the history,
    /// and a future peer is seeded from the latest path only.
    pub fn record_roll(&mut self, wal: &str, clear_existing: bool) {
        let prefix = wal_prefix(wal);
        for groups in self.by_queue.values_mut() {
            let mut existing_prefix = false;
            for (group, wals) in groups.iter_mut() {
                if clear_existing {
                    wals.clear();
                }
                if group == prefix {
                    wals.insert(wal.to_string());
                    existing_prefix = true;
                }
            }
            if !existing_prefix {
                groups
                    .entry(prefix.to_string())
                    .or_default()
                    .insert(wal.to_string());
            }
        }
    }

    /// Snapshot of every WAL under `(queue, prefix(log))` that is `<= log`
    /// (`< log` when not inclusive). Empty when the queue or group is
    /// untracked.
    pub fn head_set(&self, queue: &QueueId, log: &str, inclusive: bool) -> BTreeSet<String> {
        let upper = if inclusive {
            Bound::Included(log.to_string())
        } else {
            Bound::Excluded(log.to_string())
        };
        self.by_queue
            .get(queue)
            .and_then(|groups| groups.get(wal_prefix(log)))
            .map(|wals| {
                wals.range((Bound::Unbounded, upper))
                    .cloned()
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default()
    }

    /// Remove `wals` from `(queue, prefix)`.
    pub fn subtract(&mut self, queue: &QueueId, prefix: &str, wals: &BTreeSet<String>) {
        if let Some(group) = self
            .by_queue
            .get_mut(queue)
            .and_then(|groups| groups.get_mut(prefix))
        {
            for wal in wals {
                group.remove(wal);
            }
        }
    }

    pub fn snapshot(&self) -> HashMap<QueueId, HashMap<String, BTreeSet<String>>> {
        self.by_queue.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wals(index: &WalIndex, queue: &QueueId, prefix: &str) -> Vec<String> {
        index
            .groups(queue)
            .and_then(|g| g.get(prefix))
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_queue_id_normal_roundtrip() {
        let id = QueueId::normal("p1");
        assert_eq!(id.to_string(), "p1");
        assert!(!id.is_recovered());
        assert_eq!(QueueId::parse("p1").unwrap(), id);
    }

    #[test]
    fn test_queue_id_recovered_roundtrip() {
        let id = QueueId::normal("p1")
            .claimed_from(&ServerName::from("node_3001"))
            .claimed_from(&ServerName::from("node_3002"));
        assert_eq!(id.to_string(), "p1-node_3001-node_3002");
        assert!(id.is_recovered());
        let parsed = QueueId::parse("p1-node_3001-node_3002").unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.peer_id(), "p1");
        assert_eq!(parsed.dead_servers().len(), 2);
    }

    #[test]
    fn test_queue_id_parse_rejects_empty() {
        assert!(QueueId::parse("").is_err());
        assert!(QueueId::parse("-node_3001").is_err());
    }

    #[test]
    fn test_insert_groups_by_prefix() {
        let mut index = WalIndex::default();
        let q = QueueId::normal("p1");
        index.init_queue(q.clone());
        index.insert(&q, "w.100");
        index.insert(&q, "w.101");
        index.insert(&q, "meta.7");
        assert_eq!(wals(&index, &q, "w"), vec!["w.100", "w.101"]);
        assert_eq!(wals(&index, &q, "meta"), vec!["meta.7"]);
    }

    #[test]
    fn test_record_roll_appends_and_creates_groups() {
        let mut index = WalIndex::default();
        let q = QueueId::normal("p1");
        index.init_queue(q.clone());
        index.record_roll("w.100", false);
        index.record_roll("w.101", false);
        index.record_roll("meta.7", false);
        assert_eq!(wals(&index, &q, "w"), vec!["w.100", "w.101"]);
        assert_eq!(wals(&index, &q, "meta"), vec!["meta.7"]);
    }

    #[test]
    fn test_record_roll_clears_history_without_consumers() {
        let mut index = WalIndex::default();
        let q = QueueId::normal("p1");
        index.init_queue(q.clone());
        index.record_roll("w.100", false);
        index.record_roll("w.101", true);
        assert_eq!(wals(&index, &q, "w"), vec!["w.101"]);
    }

    #[test]
    fn test_head_set_bounds() {
        let mut index = WalIndex::default();
        let q = QueueId::normal("p1");
        index.init_queue(q.clone());
        for wal in ["w.100", "w.101", "w.102"] {
            index.insert(&q, wal);
        }
        let inclusive = index.head_set(&q, "w.101", true);
        assert_eq!(
            inclusive.iter().collect::<Vec<_>>(),
            vec!["w.100", "w.101"]
        );
        let exclusive = index.head_set(&q, "w.101", false);
        assert_eq!(exclusive.iter().collect::<Vec<_>>(), vec!["w.100"]);
        assert!(index.head_set(&q, "w.100", false).is_empty());
        assert!(index
            .head_set(&QueueId::normal("absent"), "w.101", true)
            .is_empty());
    }

    #[test]
    fn test_subtract_removes_only_named_wals() {
        let mut index = WalIndex::default();
        let q = QueueId::normal("p1");
        index.init_queue(q.clone());
        for wal in ["w.100", "w.101", "w.102"] {
            index.insert(&q, wal);
        }
        let doomed = index.head_set(&q, "w.101", true);
        index.subtract(&q, "w", &doomed);
        assert_eq!(wals(&index, &q, "w"), vec!["w.102"]);
    }
}
