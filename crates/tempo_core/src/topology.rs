//! Forwarding topology
//!
//! Every handler and stream owns a node here. Edges point from an upstream
//! node to the node it forwards into; the graph is kept acyclic by checking
//! reachability before an edge is added.

use crate::error::{Result, TopologyError};
use rustc_hash::FxHashSet;
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;

new_key_type! {
    /// Identity of a handler or stream in the forwarding graph
    pub struct NodeId;
}

#[derive(Default)]
struct NodeEntry {
    /// Downstream nodes, one entry per subscription (duplicates allowed)
    downstream: SmallVec<[NodeId; 4]>,
}

/// Directed graph of subscriptions
#[derive(Default)]
pub struct Topology {
    nodes: SlotMap<NodeId, NodeEntry>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(&mut self) -> NodeId {
        self.nodes.insert(NodeEntry::default())
    }

    /// Remove a node and every edge pointing at it
    pub fn remove_node(&mut self, id: NodeId) {
        if self.nodes.remove(id).is_none() {
            return;
        }
        for (_, entry) in self.nodes.iter_mut() {
            entry.downstream.retain(|d| *d != id);
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Add `upstream -> downstream`, rejecting self loops and cycles
    pub fn add_edge(&mut self, upstream: NodeId, downstream: NodeId) -> Result<()> {
        if upstream == downstream {
            return Err(TopologyError::SelfLoop(upstream));
        }
        if self.reaches(downstream, upstream) {
            return Err(TopologyError::Cycle {
                upstream,
                downstream,
            });
        }
        if let Some(entry) = self.nodes.get_mut(upstream) {
            entry.downstream.push(downstream);
        }
        Ok(())
    }

    /// Add an edge into a node that has no downstream yet, which can never
    /// close a cycle
    pub(crate) fn link_fresh(&mut self, upstream: NodeId, downstream: NodeId) {
        debug_assert!(self.downstream(downstream).is_empty());
        if let Some(entry) = self.nodes.get_mut(upstream) {
            entry.downstream.push(downstream);
        }
    }

    /// Remove one `upstream -> downstream` edge. Returns false if none existed.
    pub fn remove_edge(&mut self, upstream: NodeId, downstream: NodeId) -> bool {
        let Some(entry) = self.nodes.get_mut(upstream) else {
            return false;
        };
        match entry.downstream.iter().position(|d| *d == downstream) {
            Some(pos) => {
                entry.downstream.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Whether `to` is reachable from `from` by following edges
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut visited = FxHashSet::default();
        let mut stack: SmallVec<[NodeId; 16]> = SmallVec::new();
        stack.push(from);

        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            let Some(entry) = self.nodes.get(node) else {
                continue;
            };
            for &next in &entry.downstream {
                if next == to {
                    return true;
                }
                stack.push(next);
            }
        }
        false
    }

    pub fn downstream(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|entry| entry.downstream.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_rejects_back_edge() {
        let mut graph = Topology::new();
        let a = graph.insert_node();
        let b = graph.insert_node();
        let c = graph.insert_node();

        graph.add_edge(a, b).unwrap();
        graph.add_edge(b, c).unwrap();

        assert!(graph.reaches(a, c));
        assert!(!graph.reaches(c, a));
        assert_eq!(
            graph.add_edge(c, a),
            Err(TopologyError::Cycle {
                upstream: c,
                downstream: a
            })
        );
    }

    #[test]
    fn test_self_loop() {
        let mut graph = Topology::new();
        let a = graph.insert_node();
        assert_eq!(graph.add_edge(a, a), Err(TopologyError::SelfLoop(a)));
    }

    #[test]
    fn test_diamond_is_allowed() {
        let mut graph = Topology::new();
        let a = graph.insert_node();
        let b = graph.insert_node();
        let c = graph.insert_node();
        let d = graph.insert_node();

        graph.add_edge(a, b).unwrap();
        graph.add_edge(a, c).unwrap();
        graph.add_edge(b, d).unwrap();
        graph.add_edge(c, d).unwrap();

        assert!(graph.reaches(a, d));
        assert_eq!(graph.downstream(a).len(), 2);
    }

    #[test]
    fn test_remove_edge_and_node() {
        let mut graph = Topology::new();
        let a = graph.insert_node();
        let b = graph.insert_node();

        graph.add_edge(a, b).unwrap();
        assert!(graph.remove_edge(a, b));
        assert!(!graph.remove_edge(a, b));
        assert!(!graph.reaches(a, b));

        graph.add_edge(a, b).unwrap();
        graph.remove_node(b);
        assert!(graph.downstream(a).is_empty());
        assert!(!graph.contains(b));
        assert_eq!(graph.len(), 1);
    }
}
