// SPDX-License-Identifier: MPL-2.0

//! Thin wrapper over `petgraph` providing the graph operations the dependency
//! solver needs: node dedup-by-value, DFS-based subgraph extraction (for
//! reverse-dependency closures) and topological ordering — including a
//! cycle-breaking variant that preserves input order rather than failing
//! (spec.md §4.4 step 4: "Cycles are broken by preserving relative order of
//! the input and logging the cycle").

use std::collections::{HashSet, VecDeque};

use petgraph::{
    prelude::DiGraph,
    visit::{Dfs, Topo, Walker},
};

use self::subgraph::subgraph;

mod subgraph;

/// `NodeIndex` as used throughout this crate's callers.
pub type NodeIndex = petgraph::prelude::NodeIndex<u32>;

/// A node that took part in a broken dependency cycle, paired with the node
/// it could not be ordered before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenEdge<N> {
    pub from: N,
    pub to: N,
}

/// Simple encapsulation of petgraph APIs suitable for the solver's
/// forward/reverse closure and ordering needs.
#[derive(Debug, Clone)]
pub struct Dag<N>(DiGraph<N, (), u32>);

impl<N> Default for Dag<N> {
    fn default() -> Self {
        Self(DiGraph::default())
    }
}

impl<N> Dag<N>
where
    N: Clone + PartialEq,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds node N to the graph and returns the index. If N already exists,
    /// returns the index of that node instead of duplicating it.
    pub fn add_node_or_get_index(&mut self, node: N) -> NodeIndex {
        if let Some(index) = self.get_index(&node) {
            index
        } else {
            self.0.add_node(node)
        }
    }

    pub fn node_exists(&self, node: &N) -> bool {
        self.get_index(node).is_some()
    }

    pub fn remove_node(&mut self, node: &N) -> Option<N> {
        let index = self.get_index(node)?;
        self.0.remove_node(index)
    }

    /// Add an edge from `a` to `b` unless it would create a cycle or
    /// already exists. Returns whether the edge was added.
    pub fn add_edge(&mut self, a: NodeIndex, b: NodeIndex) -> bool {
        let a_node = &self.0[a];

        if self.dfs(b).any(|n| n == a_node) {
            return false;
        }
        if self.0.find_edge(a, b).is_some() {
            return false;
        }

        self.0.add_edge(a, b, ());
        true
    }

    /// Add an edge even if it would create a cycle; used by callers (the
    /// solver) that want to detect and break cycles themselves rather than
    /// have them silently rejected.
    pub fn add_edge_allow_cycle(&mut self, a: NodeIndex, b: NodeIndex) {
        if self.0.find_edge(a, b).is_none() {
            self.0.add_edge(a, b, ());
        }
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &'_ N> {
        self.0.node_indices().map(|i| &self.0[i])
    }

    pub fn dfs(&self, start: NodeIndex) -> impl Iterator<Item = &'_ N> {
        Dfs::new(&self.0, start).iter(&self.0).map(|i| &self.0[i])
    }

    /// Topological ordering. Fails (returns the cyclic node) if the graph
    /// isn't a DAG; see [`Self::toposort_breaking_cycles`] for a variant
    /// that always succeeds.
    pub fn topo(&self) -> impl Iterator<Item = &'_ N> {
        Topo::new(&self.0).iter(&self.0).map(|i| &self.0[i])
    }

    pub fn transpose(&self) -> Self {
        let mut transposed = self.0.clone();
        transposed.reverse();
        Self(transposed)
    }

    pub fn subgraph(&self, starting_nodes: &[N]) -> Self {
        Self(subgraph(&self.0, starting_nodes))
    }

    pub fn get_index(&self, node: &N) -> Option<NodeIndex> {
        self.0.node_indices().find(|i| self.0[*i] == *node)
    }

    /// Kahn's algorithm, breaking ties by `insertion_order` (so the result is
    /// deterministic and stable for equal-priority nodes) and breaking any
    /// remaining cycle by peeling off the earliest-inserted node still stuck
    /// with unresolved predecessors, recording each edge dropped this way.
    ///
    /// Never fails: a malformed repository graph with cycles still produces
    /// a total order, with the violated edges reported for logging.
    pub fn toposort_breaking_cycles(&self, insertion_order: &[N]) -> (Vec<N>, Vec<BrokenEdge<N>>) {
        let mut indegree = vec![0usize; self.0.node_count()];
        for edge in self.0.edge_indices() {
            if let Some((_, target)) = self.0.edge_endpoints(edge) {
                indegree[target.index()] += 1;
            }
        }

        let priority = |idx: NodeIndex| -> usize {
            insertion_order
                .iter()
                .position(|n| *n == self.0[idx])
                .unwrap_or(usize::MAX)
        };

        let mut ready: VecDeque<NodeIndex> = self
            .0
            .node_indices()
            .filter(|i| indegree[i.index()] == 0)
            .collect();
        sort_by_priority(&mut ready, &priority);

        let mut ordered = Vec::with_capacity(self.0.node_count());
        let mut visited = HashSet::new();
        let mut broken = Vec::new();

        loop {
            while let Some(node) = ready.pop_front() {
                if !visited.insert(node) {
                    continue;
                }
                ordered.push(self.0[node].clone());

                let mut newly_ready = Vec::new();
                for neighbor in self.0.neighbors_directed(node, petgraph::Direction::Outgoing) {
                    if visited.contains(&neighbor) {
                        continue;
                    }
                    indegree[neighbor.index()] -= 1;
                    if indegree[neighbor.index()] == 0 {
                        newly_ready.push(neighbor);
                    }
                }
                newly_ready.sort_by_key(|n| priority(*n));
                ready.extend(newly_ready);
            }

            if visited.len() == self.0.node_count() {
                break;
            }

            // Remaining nodes form one or more cycles. Pick the
            // earliest-inserted unvisited node and force it ready, dropping
            // its unresolved incoming edges (the cycle-causing ones).
            let Some(pick) = self
                .0
                .node_indices()
                .filter(|i| !visited.contains(i))
                .min_by_key(|i| priority(*i))
            else {
                break;
            };

            for source in self.0.neighbors_directed(pick, petgraph::Direction::Incoming) {
                if !visited.contains(&source) {
                    broken.push(BrokenEdge {
                        from: self.0[source].clone(),
                        to: self.0[pick].clone(),
                    });
                }
            }
            indegree[pick.index()] = 0;
            ready.push_back(pick);
        }

        (ordered, broken)
    }
}

fn sort_by_priority(queue: &mut VecDeque<NodeIndex>, priority: &impl Fn(NodeIndex) -> usize) {
    let mut items: Vec<_> = queue.drain(..).collect();
    items.sort_by_key(|n| priority(*n));
    queue.extend(items);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaks_cycles_preserving_input_order() {
        let mut dag = Dag::new();
        let a = dag.add_node_or_get_index("a");
        let b = dag.add_node_or_get_index("b");
        let c = dag.add_node_or_get_index("c");

        dag.add_edge_allow_cycle(a, b);
        dag.add_edge_allow_cycle(b, c);
        dag.add_edge_allow_cycle(c, a);

        let (order, broken) = dag.toposort_breaking_cycles(&["a", "b", "c"]);

        assert_eq!(order.len(), 3);
        assert_eq!(broken.len(), 1);
    }

    #[test]
    fn acyclic_orders_dependencies_before_dependents() {
        let mut dag = Dag::new();
        let a = dag.add_node_or_get_index("a");
        let b = dag.add_node_or_get_index("b");
        dag.add_edge(a, b);

        let (order, broken) = dag.toposort_breaking_cycles(&["a", "b"]);
        assert!(broken.is_empty());
        assert_eq!(order, vec!["a", "b"]);
    }
}
