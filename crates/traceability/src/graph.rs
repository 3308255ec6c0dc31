//! Arena genealogy graph.
//!
//! Nodes live in a `Vec` and are addressed by [`NodeIndex`]; each node keeps
//! outgoing and incoming edge lists in insertion order. Links are never
//! removed, and parallel links between the same pair stay distinct.
//!
//! Walks are lazy breadth-first iterators. Before a walk starts, the
//! reachable subgraph is checked for cycles so that corrupted data surfaces
//! as `GraphCycle` instead of an endless traversal.
//!
//! `record_link` itself does not look for cycles. Writers that must keep the
//! graph acyclic call [`TraceGraph::check_acyclic`] first.

use std::collections::{HashMap, HashSet, VecDeque};

use lonerp_core::{LedgerError, LedgerResult, Quantity};

use crate::cancel::CancelToken;
use crate::link::{TraceLink, TraceNode};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

impl NodeIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Source lot towards products and shipments.
    Forward,
    /// Shipment or product back towards its source lots.
    Backward,
}

#[derive(Debug, Copy, Clone)]
struct Edge {
    from: NodeIndex,
    to: NodeIndex,
}

#[derive(Debug, Clone, Default)]
pub struct TraceGraph {
    nodes: Vec<TraceNode>,
    lookup: HashMap<TraceNode, NodeIndex>,
    links: Vec<TraceLink>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl TraceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn links(&self) -> &[TraceLink] {
        &self.links
    }

    pub fn node_index(&self, node: &TraceNode) -> Option<NodeIndex> {
        self.lookup.get(node).copied()
    }

    pub fn node(&self, index: NodeIndex) -> &TraceNode {
        &self.nodes[index.0]
    }

    fn intern(&mut self, node: TraceNode) -> NodeIndex {
        if let Some(&index) = self.lookup.get(&node) {
            return index;
        }
        let index = NodeIndex(self.nodes.len());
        self.nodes.push(node.clone());
        self.lookup.insert(node, index);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        index
    }

    /// Check a link without recording it.
    pub fn check_link(link: &TraceLink) -> LedgerResult<(TraceNode, TraceNode)> {
        let source = link.source.node()?;
        let target = link.target.node()?;
        if source == target {
            return Err(LedgerError::validation(format!(
                "trace link cannot point {source} at itself"
            )));
        }
        if link.quantity.is_negative() {
            return Err(LedgerError::validation("trace link quantity cannot be negative"));
        }
        Ok((source, target))
    }

    /// Fail with `Validation` if recording `links` in order would close a
    /// cycle. The graph is left untouched.
    pub fn check_acyclic<'a>(&'a self, links: &'a [(TraceNode, TraceNode)]) -> LedgerResult<()> {
        let mut pending: HashMap<&'a TraceNode, Vec<&'a TraceNode>> = HashMap::new();
        for (source, target) in links {
            if self.reaches(target, source, &pending) {
                return Err(LedgerError::validation(format!(
                    "trace link {source} -> {target} would close a genealogy cycle"
                )));
            }
            pending.entry(source).or_default().push(target);
        }
        Ok(())
    }

    /// Whether `to` can be reached from `from` over recorded edges plus `extra`.
    fn reaches<'a>(
        &'a self,
        from: &'a TraceNode,
        to: &TraceNode,
        extra: &HashMap<&'a TraceNode, Vec<&'a TraceNode>>,
    ) -> bool {
        let mut seen: HashSet<&'a TraceNode> = HashSet::new();
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(index) = self.node_index(node) {
                stack.extend(
                    self.neighbours(index, Direction::Forward)
                        .map(move |next| self.node(next)),
                );
            }
            if let Some(targets) = extra.get(node) {
                stack.extend(targets.iter().copied());
            }
        }
        false
    }

    /// Append a directed edge. Parallel edges are kept separate.
    pub fn record_link(&mut self, link: TraceLink) -> LedgerResult<&TraceLink> {
        let (source, target) = Self::check_link(&link)?;
        let from = self.intern(source);
        let to = self.intern(target);

        let edge = self.edges.len();
        self.edges.push(Edge { from, to });
        self.outgoing[from.0].push(edge);
        self.incoming[to.0].push(edge);
        self.links.push(link);
        Ok(&self.links[edge])
    }

    /// Direct edges leaving `node`, in insertion order.
    pub fn links_from(&self, node: &TraceNode) -> Vec<&TraceLink> {
        self.node_index(node)
            .map(|i| self.outgoing[i.0].iter().map(|&e| &self.links[e]).collect())
            .unwrap_or_default()
    }

    /// Direct edges entering `node`, in insertion order.
    pub fn links_to(&self, node: &TraceNode) -> Vec<&TraceLink> {
        self.node_index(node)
            .map(|i| self.incoming[i.0].iter().map(|&e| &self.links[e]).collect())
            .unwrap_or_default()
    }

    /// Sum of every parallel edge `source -> target`.
    pub fn quantity_between(&self, source: &TraceNode, target: &TraceNode) -> Quantity {
        let (Some(from), Some(to)) = (self.node_index(source), self.node_index(target)) else {
            return Quantity::ZERO;
        };
        self.outgoing[from.0]
            .iter()
            .filter(|&&e| self.edges[e].to == to)
            .map(|&e| self.links[e].quantity)
            .sum()
    }

    pub fn trace_forward<'a>(
        &'a self,
        start: &TraceNode,
        cancel: &CancelToken,
    ) -> LedgerResult<TraceWalk<'a>> {
        self.walk(start, Direction::Forward, cancel)
    }

    pub fn trace_backward<'a>(
        &'a self,
        start: &TraceNode,
        cancel: &CancelToken,
    ) -> LedgerResult<TraceWalk<'a>> {
        self.walk(start, Direction::Backward, cancel)
    }

    /// Start a lazy walk from `start`.
    ///
    /// Fails with `NotFound` for an unknown node and `GraphCycle` if a cycle
    /// is reachable in the walk's direction.
    pub fn walk<'a>(
        &'a self,
        start: &TraceNode,
        direction: Direction,
        cancel: &CancelToken,
    ) -> LedgerResult<TraceWalk<'a>> {
        let origin = self
            .node_index(start)
            .ok_or_else(|| LedgerError::not_found("trace node", start))?;
        if let Some(on_cycle) = self.find_cycle(origin, direction) {
            return Err(LedgerError::GraphCycle {
                node: self.nodes[on_cycle.0].to_string(),
            });
        }

        let mut visited = vec![false; self.nodes.len()];
        visited[origin.0] = true;
        let mut queue = VecDeque::new();
        queue.push_back((origin, 0));

        Ok(TraceWalk {
            graph: self,
            direction,
            cancel: cancel.clone(),
            visited,
            queue,
            pending: VecDeque::new(),
        })
    }

    fn neighbours(
        &self,
        node: NodeIndex,
        direction: Direction,
    ) -> impl Iterator<Item = NodeIndex> + '_ {
        let edges = match direction {
            Direction::Forward => &self.outgoing[node.0],
            Direction::Backward => &self.incoming[node.0],
        };
        edges.iter().map(move |&e| match direction {
            Direction::Forward => self.edges[e].to,
            Direction::Backward => self.edges[e].from,
        })
    }

    /// Iterative three-colour DFS over the subgraph reachable from `origin`.
    /// Returns a node on a cycle, if any.
    fn find_cycle(&self, origin: NodeIndex, direction: Direction) -> Option<NodeIndex> {
        #[derive(Copy, Clone, PartialEq, Eq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        let mut colour = vec![Colour::White; self.nodes.len()];
        // (node, position in its edge list)
        let mut stack: Vec<(NodeIndex, usize)> = vec![(origin, 0)];
        colour[origin.0] = Colour::Grey;

        while let Some(top) = stack.last_mut() {
            let (node, position) = *top;
            let edges = match direction {
                Direction::Forward => &self.outgoing[node.0],
                Direction::Backward => &self.incoming[node.0],
            };
            let Some(&edge) = edges.get(position) else {
                colour[node.0] = Colour::Black;
                stack.pop();
                continue;
            };
            top.1 += 1;
            let child = match direction {
                Direction::Forward => self.edges[edge].to,
                Direction::Backward => self.edges[edge].from,
            };
            match colour[child.0] {
                Colour::Grey => return Some(child),
                Colour::White => {
                    colour[child.0] = Colour::Grey;
                    stack.push((child, 0));
                }
                Colour::Black => {}
            }
        }
        None
    }
}

/// One node reached by a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceStep<'a> {
    pub node: &'a TraceNode,
    /// Edges from the origin (1 for direct neighbours).
    pub depth: usize,
}

/// Lazy breadth-first walk; each reachable node is yielded once, level by
/// level, in edge-insertion order. Stops early once cancelled.
#[derive(Debug)]
pub struct TraceWalk<'a> {
    graph: &'a TraceGraph,
    direction: Direction,
    cancel: CancelToken,
    visited: Vec<bool>,
    queue: VecDeque<(NodeIndex, usize)>,
    pending: VecDeque<(NodeIndex, usize)>,
}

impl TraceWalk<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<'a> Iterator for TraceWalk<'a> {
    type Item = TraceStep<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some((node, depth)) = self.pending.pop_front() {
                self.queue.push_back((node, depth));
                return Some(TraceStep {
                    node: self.graph.node(node),
                    depth,
                });
            }
            let (node, depth) = self.queue.pop_front()?;
            for child in self.graph.neighbours(node, self.direction) {
                if !self.visited[child.0] {
                    self.visited[child.0] = true;
                    self.pending.push_back((child, depth + 1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::TraceEndpoint;
    use chrono::Utc;
    use lonerp_core::{BatchNumber, DocumentRef, ItemId, Mrn};
    use proptest::prelude::*;

    fn batch(code: &str) -> TraceNode {
        TraceNode::Batch(BatchNumber::new(code).unwrap())
    }

    fn mrn(code: &str) -> TraceNode {
        TraceNode::Mrn(Mrn::new(code).unwrap())
    }

    fn endpoint(node: &TraceNode) -> TraceEndpoint {
        match node {
            TraceNode::Batch(b) => TraceEndpoint::batch(b.clone()),
            TraceNode::Mrn(m) => TraceEndpoint::mrn(m.clone()),
            TraceNode::Document(d) => TraceEndpoint::document(d.clone()),
        }
    }

    fn link(graph: &mut TraceGraph, from: &TraceNode, to: &TraceNode, qty: i64) {
        graph
            .record_link(TraceLink::new(
                endpoint(from),
                endpoint(to),
                ItemId::new(),
                Quantity::units(qty),
                Utc::now(),
            ))
            .unwrap();
    }

    fn names(walk: TraceWalk<'_>) -> Vec<String> {
        walk.map(|s| s.node.to_string()).collect()
    }

    #[test]
    fn forward_walk_is_breadth_first_in_insertion_order() {
        let mut graph = TraceGraph::new();
        let root = mrn("MRN-001");
        link(&mut graph, &root, &batch("B2"), 5);
        link(&mut graph, &root, &batch("B1"), 5);
        link(&mut graph, &batch("B2"), &batch("P1"), 5);
        link(&mut graph, &batch("B1"), &batch("P2"), 5);
        link(&mut graph, &batch("B1"), &batch("P1"), 5);

        let walk = graph.trace_forward(&root, &CancelToken::new()).unwrap();
        assert_eq!(
            names(walk),
            vec!["batch B2", "batch B1", "batch P1", "batch P2"]
        );
    }

    #[test]
    fn backward_walk_reaches_sources() {
        let mut graph = TraceGraph::new();
        let shipment = TraceNode::Document(DocumentRef::new("shipment", uuid::Uuid::nil()));
        link(&mut graph, &mrn("MRN-001"), &batch("B1"), 10);
        link(&mut graph, &batch("B1"), &batch("P1"), 10);
        link(&mut graph, &batch("P1"), &shipment, 4);

        let steps: Vec<(String, usize)> = graph
            .trace_backward(&shipment, &CancelToken::new())
            .unwrap()
            .map(|s| (s.node.to_string(), s.depth))
            .collect();
        assert_eq!(
            steps,
            vec![
                ("batch P1".to_string(), 1),
                ("batch B1".to_string(), 2),
                ("MRN MRN-001".to_string(), 3)
            ]
        );
    }

    #[test]
    fn parallel_links_are_kept_and_summed() {
        let mut graph = TraceGraph::new();
        link(&mut graph, &mrn("MRN-001"), &batch("B1"), 3);
        link(&mut graph, &mrn("MRN-001"), &batch("B1"), 4);

        assert_eq!(graph.link_count(), 2);
        assert_eq!(graph.links_from(&mrn("MRN-001")).len(), 2);
        assert_eq!(graph.links_to(&batch("B1")).len(), 2);
        assert_eq!(
            graph.quantity_between(&mrn("MRN-001"), &batch("B1")),
            Quantity::units(7)
        );
        assert_eq!(
            graph.quantity_between(&batch("B1"), &mrn("MRN-001")),
            Quantity::ZERO
        );
    }

    #[test]
    fn endpoint_resolves_batch_before_mrn_before_document() {
        let doc = DocumentRef::new("receipt", uuid::Uuid::nil());
        let endpoint = TraceEndpoint::document(doc.clone())
            .with_mrn(Mrn::new("MRN-9").unwrap());
        assert_eq!(endpoint.node().unwrap(), mrn("MRN-9"));
        assert_eq!(
            TraceEndpoint::document(doc.clone()).node().unwrap(),
            TraceNode::Document(doc)
        );
        assert!(TraceEndpoint::default().node().is_err());
    }

    #[test]
    fn self_links_are_rejected() {
        let mut graph = TraceGraph::new();
        let b = batch("B1");
        let result = graph.record_link(TraceLink::new(
            endpoint(&b),
            endpoint(&b),
            ItemId::new(),
            Quantity::units(1),
            Utc::now(),
        ));
        assert!(matches!(result, Err(LedgerError::Validation(_))));
        assert_eq!(graph.link_count(), 0);
    }

    #[test]
    fn unknown_start_is_not_found() {
        let graph = TraceGraph::new();
        let err = graph
            .trace_forward(&mrn("MRN-404"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }

    #[test]
    fn injected_cycle_is_reported() {
        let mut graph = TraceGraph::new();
        link(&mut graph, &mrn("MRN-001"), &batch("B1"), 1);
        link(&mut graph, &batch("B1"), &batch("B2"), 1);
        link(&mut graph, &batch("B2"), &batch("B3"), 1);
        link(&mut graph, &batch("B3"), &batch("B1"), 1);

        let err = graph
            .trace_forward(&mrn("MRN-001"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, LedgerError::GraphCycle { .. }));

        // A walk that cannot reach the cycle is unaffected.
        link(&mut graph, &mrn("MRN-002"), &batch("X1"), 1);
        assert!(graph.trace_forward(&mrn("MRN-002"), &CancelToken::new()).is_ok());
    }

    #[test]
    fn closing_links_fail_the_acyclic_check() {
        let mut graph = TraceGraph::new();
        link(&mut graph, &mrn("MRN-001"), &batch("A"), 1);
        link(&mut graph, &batch("A"), &batch("B"), 1);

        let closing = [(batch("B"), mrn("MRN-001"))];
        assert!(matches!(
            graph.check_acyclic(&closing),
            Err(LedgerError::Validation(_))
        ));
        // Pending links count too: C -> D then D -> C in one batch.
        let pair = [(batch("C"), batch("D")), (batch("D"), batch("C"))];
        assert!(graph.check_acyclic(&pair).is_err());
        // Extending the chain or adding a parallel edge is fine.
        let fine = [(batch("B"), batch("C")), (mrn("MRN-001"), batch("B"))];
        assert!(graph.check_acyclic(&fine).is_ok());
        assert_eq!(graph.link_count(), 2);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = TraceGraph::new();
        link(&mut graph, &mrn("MRN-001"), &batch("A"), 1);
        link(&mut graph, &mrn("MRN-001"), &batch("B"), 1);
        link(&mut graph, &batch("A"), &batch("C"), 1);
        link(&mut graph, &batch("B"), &batch("C"), 1);

        let walk = graph.trace_forward(&mrn("MRN-001"), &CancelToken::new()).unwrap();
        assert_eq!(names(walk).len(), 3);
    }

    #[test]
    fn thousands_of_edges_terminate() {
        let mut graph = TraceGraph::new();
        let root = mrn("MRN-001");
        let mut previous = root.clone();
        for i in 0..3_000 {
            let next = batch(&format!("B{i}"));
            link(&mut graph, &previous, &next, 1);
            // Fan-out leaf on every chain node.
            link(&mut graph, &next, &batch(&format!("L{i}")), 1);
            previous = next;
        }

        let walk = graph.trace_forward(&root, &CancelToken::new()).unwrap();
        assert_eq!(walk.count(), 6_000);
    }

    #[test]
    fn cancellation_stops_the_walk() {
        let mut graph = TraceGraph::new();
        let root = mrn("MRN-001");
        for i in 0..100 {
            link(&mut graph, &root, &batch(&format!("B{i}")), 1);
        }

        let cancel = CancelToken::new();
        let mut walk = graph.trace_forward(&root, &cancel).unwrap();
        assert!(walk.next().is_some());
        cancel.cancel();
        assert!(walk.next().is_none());
        assert!(walk.is_cancelled());
    }

    proptest! {
        #[test]
        fn acyclic_graphs_visit_each_reachable_node_once(
            edges in prop::collection::vec((0usize..40, 0usize..40), 0..200)
        ) {
            // Only forward edges (low -> high) so the graph is a DAG.
            let mut graph = TraceGraph::new();
            let root = batch("N0");
            for (a, b) in edges {
                let (lo, hi) = if a < b { (a, b) } else if b < a { (b, a) } else { continue };
                link(&mut graph, &batch(&format!("N{lo}")), &batch(&format!("N{hi}")), 1);
            }
            if graph.node_index(&root).is_none() {
                return Ok(());
            }

            let steps: Vec<TraceStep<'_>> = graph.trace_forward(&root, &CancelToken::new()).unwrap().collect();
            let mut seen = std::collections::HashSet::new();
            for step in &steps {
                prop_assert!(seen.insert(step.node.clone()));
                prop_assert!(step.node != &root);
            }
            prop_assert!(steps.windows(2).all(|w| w[0].depth <= w[1].depth));
        }
    }
}
