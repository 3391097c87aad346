//! The slot table: which node owns which slot.
//!
//! The table is rebuilt wholesale from a `CLUSTER SLOTS` reply and exposed
//! to routing decisions as an immutable snapshot that is swapped atomically.
//! A `MOVED` redirection produces a new snapshot differing in exactly one
//! slot; nothing is ever mutated in place under readers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arcstr::ArcStr;
use rand::seq::SliceRandom;

use crate::cluster::routing::SLOT_COUNT;
use crate::errors::{ErrorKind, RedioxResult};
use crate::types::Value;

/// Translation of advertised node addresses to externally reachable ones,
/// for deployments behind NAT or port forwarding.
#[derive(Clone, Debug, Default)]
pub struct NatMap {
    entries: HashMap<String, (String, u16)>,
}

impl NatMap {
    /// Maps the advertised `host:port` to an external `(host, port)`.
    pub fn insert(
        &mut self,
        advertised: impl Into<String>,
        external_host: impl Into<String>,
        external_port: u16,
    ) {
        self.entries
            .insert(advertised.into(), (external_host.into(), external_port));
    }

    /// Translates an advertised address, returning it unchanged when no
    /// mapping exists.
    pub fn translate(&self, host: &str, port: u16) -> (String, u16) {
        match self.entries.get(&format!("{host}:{port}")) {
            Some((host, port)) => (host.clone(), *port),
            None => (host.to_string(), port),
        }
    }

    /// True when no translations are configured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The owner of one slot plus its replicas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotNodes {
    /// The master serving the slot.
    pub master: ArcStr,
    /// Replicas of the master, eligible for read distribution.
    pub replicas: Vec<ArcStr>,
}

/// A full slot-to-node mapping.
#[derive(Clone, Debug, Default)]
pub struct SlotTable {
    entries: Vec<Option<Arc<SlotNodes>>>,
}

impl SlotTable {
    /// An empty table; every lookup misses.
    pub fn empty() -> SlotTable {
        SlotTable {
            entries: vec![None; SLOT_COUNT as usize],
        }
    }

    /// Looks up the nodes serving `slot`.
    pub fn lookup(&self, slot: u16) -> Option<&Arc<SlotNodes>> {
        self.entries.get(slot as usize).and_then(|e| e.as_ref())
    }

    /// True when no slot has an owner.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_none())
    }

    /// Returns a copy of the table where exactly `slot` is owned by `addr`.
    /// Every other slot's mapping is untouched.
    pub fn with_slot_owner(&self, slot: u16, addr: ArcStr) -> SlotTable {
        let mut entries = self.entries.clone();
        if let Some(entry) = entries.get_mut(slot as usize) {
            *entry = Some(Arc::new(SlotNodes {
                master: addr,
                replicas: vec![],
            }));
        }
        SlotTable { entries }
    }

    /// Every node address the table references, masters and replicas alike.
    pub fn node_addresses(&self) -> HashSet<ArcStr> {
        let mut out = HashSet::new();
        for entry in self.entries.iter().flatten() {
            out.insert(entry.master.clone());
            out.extend(entry.replicas.iter().cloned());
        }
        out
    }

    /// A uniformly random known node, for keyless commands and lazy
    /// bootstrap.
    pub fn random_node(&self) -> Option<ArcStr> {
        let addrs: Vec<ArcStr> = self.node_addresses().into_iter().collect();
        addrs.choose(&mut rand::thread_rng()).cloned()
    }

    /// Builds a table from a `CLUSTER SLOTS` reply. `reporter_host`
    /// substitutes for nodes that advertise an empty host, which means
    /// "the address you asked".
    pub fn from_cluster_slots(
        reply: &Value,
        nat: &NatMap,
        reporter_host: &str,
    ) -> RedioxResult<SlotTable> {
        let ranges = match reply.as_sequence() {
            Some(ranges) => ranges,
            None => fail!((
                ErrorKind::ProtocolError,
                "CLUSTER SLOTS reply is not an array"
            )),
        };
        let mut table = SlotTable::empty();
        for range in ranges {
            let items = match range.as_sequence() {
                Some(items) if items.len() >= 3 => items,
                _ => fail!((
                    ErrorKind::ProtocolError,
                    "CLUSTER SLOTS range entry is malformed"
                )),
            };
            let start = slot_bound(&items[0])?;
            let end = slot_bound(&items[1])?;
            if start > end {
                fail!((ErrorKind::ProtocolError, "CLUSTER SLOTS range is inverted"));
            }
            let master = node_addr(&items[2], nat, reporter_host)?;
            let replicas = items[3..]
                .iter()
                .map(|node| node_addr(node, nat, reporter_host))
                .collect::<RedioxResult<Vec<_>>>()?;
            let nodes = Arc::new(SlotNodes { master, replicas });
            for slot in start..=end {
                table.entries[slot as usize] = Some(nodes.clone());
            }
        }
        Ok(table)
    }
}

fn slot_bound(value: &Value) -> RedioxResult<u16> {
    match value {
        Value::Int(n) if (0..SLOT_COUNT as i64).contains(n) => Ok(*n as u16),
        _ => fail!((
            ErrorKind::ProtocolError,
            "CLUSTER SLOTS slot bound out of range"
        )),
    }
}

fn node_addr(value: &Value, nat: &NatMap, reporter_host: &str) -> RedioxResult<ArcStr> {
    let items = match value.as_sequence() {
        Some(items) if items.len() >= 2 => items,
        _ => fail!((
            ErrorKind::ProtocolError,
            "CLUSTER SLOTS node entry is malformed"
        )),
    };
    let host = match &items[0] {
        Value::BulkString(bytes) if !bytes.is_empty() => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        Value::SimpleString(s) if !s.is_empty() => s.clone(),
        Value::BulkString(_) | Value::SimpleString(_) | Value::Nil => reporter_host.to_string(),
        _ => fail!((
            ErrorKind::ProtocolError,
            "CLUSTER SLOTS node host is malformed"
        )),
    };
    let port = match &items[1] {
        Value::Int(port) if (0..=u16::MAX as i64).contains(port) => *port as u16,
        _ => fail!((
            ErrorKind::ProtocolError,
            "CLUSTER SLOTS node port is malformed"
        )),
    };
    let (host, port) = nat.translate(&host, port);
    Ok(ArcStr::from(format!("{host}:{port}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(host: &str, port: i64) -> Value {
        Value::Array(vec![
            Value::BulkString(host.as_bytes().to_vec()),
            Value::Int(port),
            Value::BulkString(b"nodeid".to_vec()),
        ])
    }

    fn slots_reply() -> Value {
        Value::Array(vec![
            Value::Array(vec![
                Value::Int(0),
                Value::Int(8191),
                node("10.0.0.1", 7000),
                node("10.0.0.2", 7001),
            ]),
            Value::Array(vec![
                Value::Int(8192),
                Value::Int(16383),
                node("10.0.0.3", 7002),
            ]),
        ])
    }

    #[test]
    fn builds_full_coverage_from_reply() {
        let table = SlotTable::from_cluster_slots(&slots_reply(), &NatMap::default(), "seed")
            .unwrap();
        for slot in 0..SLOT_COUNT {
            let nodes = table.lookup(slot).expect("every slot covered");
            if slot < 8192 {
                assert_eq!(&*nodes.master, "10.0.0.1:7000");
                assert_eq!(nodes.replicas.len(), 1);
            } else {
                assert_eq!(&*nodes.master, "10.0.0.3:7002");
            }
        }
        assert_eq!(table.node_addresses().len(), 3);
    }

    #[test]
    fn empty_host_falls_back_to_reporter() {
        let reply = Value::Array(vec![Value::Array(vec![
            Value::Int(0),
            Value::Int(16383),
            node("", 7000),
        ])]);
        let table =
            SlotTable::from_cluster_slots(&reply, &NatMap::default(), "203.0.113.9").unwrap();
        assert_eq!(&*table.lookup(42).unwrap().master, "203.0.113.9:7000");
    }

    #[test]
    fn nat_map_rewrites_advertised_addresses() {
        let mut nat = NatMap::default();
        nat.insert("10.0.0.1:7000", "external.example", 17000);
        let table = SlotTable::from_cluster_slots(&slots_reply(), &nat, "seed").unwrap();
        assert_eq!(&*table.lookup(0).unwrap().master, "external.example:17000");
        assert_eq!(&*table.lookup(9000).unwrap().master, "10.0.0.3:7002");
    }

    #[test]
    fn with_slot_owner_changes_exactly_one_slot() {
        let table = SlotTable::from_cluster_slots(&slots_reply(), &NatMap::default(), "seed")
            .unwrap();
        let updated = table.with_slot_owner(100, ArcStr::from("10.0.0.9:7009"));
        assert_eq!(&*updated.lookup(100).unwrap().master, "10.0.0.9:7009");
        for slot in 0..SLOT_COUNT {
            if slot == 100 {
                continue;
            }
            assert_eq!(
                updated.lookup(slot).unwrap().master,
                table.lookup(slot).unwrap().master
            );
        }
    }

    #[test]
    fn malformed_replies_are_rejected() {
        assert!(
            SlotTable::from_cluster_slots(&Value::Nil, &NatMap::default(), "seed").is_err()
        );
        let bad = Value::Array(vec![Value::Array(vec![Value::Int(0)])]);
        assert!(SlotTable::from_cluster_slots(&bad, &NatMap::default(), "seed").is_err());
        let inverted = Value::Array(vec![Value::Array(vec![
            Value::Int(10),
            Value::Int(5),
            node("h", 1),
        ])]);
        assert!(SlotTable::from_cluster_slots(&inverted, &NatMap::default(), "seed").is_err());
    }
}
