//! Resource dependency graph.
//!
//! Nodes are resource addresses; an edge `a -> b` means `a` depends on `b`
//! and must be applied after it. Edges come from typed references in
//! attribute expressions plus explicit `depends_on`.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::declaration::Declarations;
use crate::error::{PlanError, Result};
use crate::state::StateRecord;

/// Dependency graph over resource addresses.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Addresses by node index, in insertion order.
    nodes: Vec<String>,
    /// Node index by address.
    index: HashMap<String, usize>,
    /// For each node, the nodes it depends on.
    dependencies: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node if absent and returns its index.
    pub fn add_node(&mut self, address: &str) -> usize {
        if let Some(&i) = self.index.get(address) {
            return i;
        }
        let i = self.nodes.len();
        self.nodes.push(address.to_string());
        self.index.insert(address.to_string(), i);
        self.dependencies.push(BTreeSet::new());
        i
    }

    /// Records that `from` depends on `on`.
    ///
    /// # Errors
    ///
    /// Returns an error if either address is not a node.
    pub fn add_dependency(&mut self, from: &str, on: &str) -> Result<()> {
        let (Some(&f), Some(&o)) = (self.index.get(from), self.index.get(on)) else {
            return Err(PlanError::DependencyResolutionFailed {
                message: format!("{from} depends on unknown resource {on}"),
            }
            .into());
        };
        self.dependencies[f].insert(o);
        Ok(())
    }

    /// Builds the graph of desired resources, in declaration order.
    ///
    /// # Errors
    ///
    /// Returns an error if a dependency names an undeclared resource.
    pub fn from_declarations(declarations: &Declarations) -> Result<Self> {
        let mut graph = Self::new();
        for resource in &declarations.resources {
            graph.add_node(&resource.address);
        }
        for resource in &declarations.resources {
            for dep in resource.dependencies() {
                graph.add_dependency(&resource.address, &dep)?;
            }
        }
        Ok(graph)
    }

    /// Builds the graph over desired and recorded resources.
    ///
    /// Declared resources come first with their declared dependencies;
    /// resources only present in state follow in address order with their
    /// recorded dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if a declared dependency names an undeclared resource.
    pub fn for_plan(declarations: &Declarations, state: &StateRecord) -> Result<Self> {
        let mut graph = Self::from_declarations(declarations)?;

        let recorded_only: Vec<_> = state
            .resources
            .values()
            .filter(|r| declarations.get(&r.address).is_none())
            .collect();
        for record in &recorded_only {
            graph.add_node(&record.address);
        }
        for record in &recorded_only {
            for dep in &record.dependencies {
                if graph.contains(dep) {
                    graph.add_dependency(&record.address, dep)?;
                }
            }
        }
        Ok(graph)
    }

    /// Builds the graph of recorded resources only.
    #[must_use]
    pub fn from_state(state: &StateRecord) -> Self {
        let mut graph = Self::new();
        for address in state.resources.keys() {
            graph.add_node(address);
        }
        for record in state.resources.values() {
            for dep in &record.dependencies {
                if let (Some(&f), Some(&o)) = (graph.index.get(&record.address), graph.index.get(dep)) {
                    graph.dependencies[f].insert(o);
                }
            }
        }
        graph
    }

    /// Returns true if the address is a node.
    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.index.contains_key(address)
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

    /// Returns the direct dependencies of an address.
    #[must_use]
    pub fn dependencies_of(&self, address: &str) -> Vec<&str> {
        self.index.get(address).map_or_else(Vec::new, |&i| {
            self.dependencies[i]
                .iter()
                .map(|&d| self.nodes[d].as_str())
                .collect()
        })
    }

    /// Returns the direct dependents of an address.
    #[must_use]
    pub fn dependents_of(&self, address: &str) -> Vec<&str> {
        let Some(&target) = self.index.get(address) else {
            return Vec::new();
        };
        self.dependencies
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.contains(&target))
            .map(|(i, _)| self.nodes[i].as_str())
            .collect()
    }

    /// Returns the addresses in dependency order.
    ///
    /// Ties are broken by insertion order, so identical input always yields
    /// the identical order.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` with the cycle path if the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        match kahn_order(&self.dependencies) {
            Ok(order) => Ok(order.into_iter().map(|i| self.nodes[i].clone()).collect()),
            Err(remaining) => {
                let cycle = find_cycle(&self.dependencies, &remaining)
                    .into_iter()
                    .map(|i| self.nodes[i].clone())
                    .collect();
                Err(PlanError::CyclicDependency { cycle }.into())
            }
        }
    }
}

/// Kahn's algorithm over a dependency list, lowest index first among ready nodes.
///
/// Returns the order, or the nodes left unprocessed when a cycle blocks
/// progress.
pub(crate) fn kahn_order(dependencies: &[BTreeSet<usize>]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let n = dependencies.len();
    let mut pending: Vec<usize> = dependencies.iter().map(BTreeSet::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (node, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(node);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| pending[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);

    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &dependent in &dependents[node] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err((0..n).filter(|&i| pending[i] > 0).collect())
    }
}

/// Walks dependencies among the blocked nodes until one repeats.
///
/// Every blocked node has at least one blocked dependency, so the walk
/// always closes a loop. The result starts and ends on the same node.
fn find_cycle(dependencies: &[BTreeSet<usize>], remaining: &[usize]) -> Vec<usize> {
    let blocked: BTreeSet<usize> = remaining.iter().copied().collect();
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = dependencies[current].iter().find(|d| blocked.contains(d)) else {
            return path;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle = path.split_off(pos);
            cycle.push(next);
            return cycle;
        }
        path.push(next);
        current = next;
    }
}
