//! The feature pack dependency graph backing a layout.

use std::collections::{HashMap, HashSet};
use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use caravel_core::location::Fpid;

/// A node in the resolved dependency graph.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LayoutNode {
    pub fpid: Fpid,
    /// Declared at the root of the provisioning configuration.
    pub direct: bool,
}

impl LayoutNode {
    /// Producer identity this node occupies; one node per producer.
    pub fn key(&self) -> String {
        self.fpid.producer_key()
    }
}

impl fmt::Display for LayoutNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fpid)
    }
}

/// The dependency graph of one layout, backed by petgraph.
pub struct LayoutGraph {
    graph: DiGraph<LayoutNode, ()>,
    /// Lookup from producer key to the node holding its resolved build.
    index: HashMap<String, NodeIndex>,
}

impl LayoutGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Add or retrieve the node for a producer. An existing node keeps its
    /// index; callers update its build through [`LayoutGraph::node_mut`].
    pub fn add_node(&mut self, node: LayoutNode) -> NodeIndex {
        let key = node.key();
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.graph.add_node(node);
        self.index.insert(key, idx);
        idx
    }

    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) {
        if !self.graph.edges(from).any(|e| e.target() == to) {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn find(&self, key: &str) -> Option<NodeIndex> {
        self.index.get(key).copied()
    }

    pub fn node(&self, idx: NodeIndex) -> &LayoutNode {
        &self.graph[idx]
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut LayoutNode {
        &mut self.graph[idx]
    }

    /// Direct dependencies of a node.
    pub fn dependencies_of(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| e.target())
            .collect()
    }

    /// Reverse dependencies (who depends on this node).
    pub fn dependents_of(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| e.source())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Print the dependency tree rooted at the direct feature packs.
    pub fn print_tree(&self) -> String {
        let mut output = String::new();
        let mut visited = HashSet::new();
        let roots: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&idx| self.graph[idx].direct)
            .collect();
        let count = roots.len();
        for (i, root) in roots.iter().enumerate() {
            output.push_str(&format!("{}\n", self.graph[*root]));
            let deps = self.dependencies_of(*root);
            let dep_count = deps.len();
            visited.insert(*root);
            for (j, dep) in deps.iter().enumerate() {
                let is_last = j == dep_count - 1 && i == count - 1;
                self.print_subtree(&mut output, *dep, "", is_last, &mut visited);
            }
            visited.remove(root);
        }
        output
    }

    fn print_subtree(
        &self,
        output: &mut String,
        idx: NodeIndex,
        prefix: &str,
        is_last: bool,
        visited: &mut HashSet<NodeIndex>,
    ) {
        let connector = if is_last { "└── " } else { "├── " };
        output.push_str(&format!("{prefix}{connector}{}\n", self.graph[idx]));

        if !visited.insert(idx) {
            return;
        }
        let child_prefix = format!("{prefix}{}", if is_last { "    " } else { "│   " });
        let deps = self.dependencies_of(idx);
        let count = deps.len();
        for (i, dep) in deps.iter().enumerate() {
            self.print_subtree(output, *dep, &child_prefix, i == count - 1, visited);
        }
        visited.remove(&idx);
    }
}

impl Default for LayoutGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LayoutGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutGraph")
            .field("len", &self.len())
            .finish()
    }
}
