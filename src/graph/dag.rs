//! Directed dependency graph over resource keys.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{GraphError, Result};
use crate::planner::ActionType;

/// Edge direction for a dependency between two resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The dependency runs before its dependent.
    Deploy,
    /// The dependent runs before its dependency.
    Destroy,
}

impl Direction {
    /// Returns the direction used for a node with the given action. Deleted
    /// resources must be torn down before whatever they reference.
    #[must_use]
    pub const fn for_action(action: ActionType) -> Self {
        match action {
            ActionType::Delete => Self::Destroy,
            _ => Self::Deploy,
        }
    }
}

/// A directed graph with labeled edges. Nodes and edges iterate in key order.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeSet<String>,
    /// from -> (to -> label)
    out: BTreeMap<String, BTreeMap<String, String>>,
    /// to -> (from -> label)
    inc: BTreeMap<String, BTreeMap<String, String>>,
}

impl Graph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node. Adding an existing node is a no-op.
    pub fn add_node(&mut self, key: impl Into<String>) {
        self.nodes.insert(key.into());
    }

    /// Returns true if the node exists.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains(key)
    }

    /// Adds an edge `from -> to`. The first label recorded for a pair wins.
    ///
    /// # Errors
    ///
    /// Returns an error if either node is missing.
    pub fn add_edge(&mut self, from: &str, to: &str, label: &str) -> Result<()> {
        if !self.contains(from) || !self.contains(to) {
            return Err(GraphError::UnknownNode {
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }
        self.out
            .entry(from.to_string())
            .or_default()
            .entry(to.to_string())
            .or_insert_with(|| label.to_string());
        self.inc
            .entry(to.to_string())
            .or_default()
            .entry(from.to_string())
            .or_insert_with(|| label.to_string());
        Ok(())
    }

    /// Records that `dependent` references `dependency`, oriented by `direction`.
    ///
    /// # Errors
    ///
    /// Returns an error if either node is missing.
    pub fn add_dependency(
        &mut self,
        dependent: &str,
        dependency: &str,
        label: &str,
        direction: Direction,
    ) -> Result<()> {
        match direction {
            Direction::Deploy => self.add_edge(dependency, dependent, label),
            Direction::Destroy => self.add_edge(dependent, dependency, label),
        }
    }

    /// Returns all nodes in key order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the outgoing edges of a node as `(to, label)`.
    pub fn successors(&self, key: &str) -> impl Iterator<Item = (&str, &str)> {
        self.out
            .get(key)
            .into_iter()
            .flatten()
            .map(|(to, label)| (to.as_str(), label.as_str()))
    }

    /// Returns the incoming edges of a node as `(from, label)`.
    pub fn predecessors(&self, key: &str) -> impl Iterator<Item = (&str, &str)> {
        self.inc
            .get(key)
            .into_iter()
            .flatten()
            .map(|(from, label)| (from.as_str(), label.as_str()))
    }

    /// Returns the first cycle found, as a closed path (`a`, `b`, `a`).
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut done = BTreeSet::new();
        let mut path = Vec::new();
        for node in &self.nodes {
            if let Some(cycle) = self.visit(node, &mut path, &mut done) {
                return Some(cycle);
            }
        }
        None
    }

    /// Checks that the graph has no cycle.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] naming the cycle.
    pub fn check_acyclic(&self) -> Result<()> {
        match self.find_cycle() {
            Some(cycle) => Err(GraphError::Cycle {
                cycle: cycle.join(" -> "),
            }
            .into()),
            None => Ok(()),
        }
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut BTreeSet<&'a str>,
    ) -> Option<Vec<String>> {
        if done.contains(node) {
            return None;
        }
        if let Some(start) = path.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = path[start..].iter().map(ToString::to_string).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }

        path.push(node);
        for (next, _) in self.successors(node) {
            if let Some(cycle) = self.visit(next, path, done) {
                return Some(cycle);
            }
        }
        path.pop();
        done.insert(node);
        None
    }
}
