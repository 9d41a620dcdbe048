// src/graph.rs

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{EngineError, Result};

/// Dependency relation between installed manifolds.
///
/// Only the declared inputs of each installed name are stored; dependents
/// are derived from them, so a manifold may name an input that is installed
/// later and still be found as its dependent.
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    inputs: HashMap<String, Vec<String>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inputs.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Declared inputs of `name`.
    pub fn inputs_of(&self, name: &str) -> &[String] {
        self.inputs.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Installed names that list `name` as an input, sorted.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .inputs
            .iter()
            .filter(|(_, inputs)| inputs.iter().any(|input| input == name))
            .map(|(dependent, _)| dependent.clone())
            .collect();
        dependents.sort();
        dependents
    }

    /// Everything that depends on `name`, directly or not, in breadth-first
    /// order.
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<String> = self.dependents_of(name).into();

        while let Some(next) = queue.pop_front() {
            if next == name || !seen.insert(next.clone()) {
                continue;
            }
            queue.extend(self.dependents_of(&next));
            order.push(next);
        }

        order
    }

    /// Check that adding `name` with `inputs` keeps the graph acyclic.
    pub fn check_insert(&self, name: &str, inputs: &[String]) -> Result<()> {
        if inputs.iter().any(|input| input == name) {
            return Err(EngineError::SelfDependency(name.to_string()));
        }

        let mut candidate = self.clone();
        candidate.insert(name, inputs);
        candidate.topological_order().map(|_| ())
    }

    pub fn insert(&mut self, name: &str, inputs: &[String]) {
        self.inputs.insert(name.to_string(), inputs.to_vec());
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.inputs.remove(name).is_some()
    }

    /// Installed names ordered so every name comes after its installed
    /// inputs. Fails if the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let edges = self
            .inputs
            .iter()
            .map(|(name, inputs)| (name.as_str(), inputs.as_slice()));
        order_edges(edges, |name| self.contains(name))
    }
}

/// Order a batch of `(name, inputs)` declarations, inputs first.
///
/// Inputs outside the batch are ignored for ordering purposes; they are
/// either already installed or will be checked separately.
pub fn order_batch(batch: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>> {
    let edges = batch
        .iter()
        .map(|(name, inputs)| (name.as_str(), inputs.as_slice()));
    order_edges(edges, |name| batch.contains_key(name))
}

fn order_edges<'a, I, F>(edges: I, known: F) -> Result<Vec<String>>
where
    I: Iterator<Item = (&'a str, &'a [String])>,
    F: Fn(&str) -> bool,
{
    // Edge direction: input -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    let mut edges: Vec<(&str, &[String])> = edges.collect();
    edges.sort_by_key(|(name, _)| *name);

    for (name, _) in edges.iter() {
        graph.add_node(*name);
    }

    for (name, inputs) in edges.iter() {
        for input in inputs.iter().filter(|input| known(input)) {
            graph.add_edge(input.as_str(), *name, ());
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(cycle) => Err(EngineError::Cycle(cycle.node_id().to_string())),
    }
}
