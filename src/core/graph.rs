//! KL-004: Graph — catalog plus a `Kind::name` index.
//!
//! Construction rejects duplicate keys and empty names. `validate` reports
//! unknown predecessor keys and ordering cycles. `execution_order` computes
//! a topological order over afterOk ∪ afterFail edges using Kahn's algorithm
//! with alphabetical tie-breaking.

use super::catalog::Catalog;
use super::error::{Error, Result};
use crate::resources::SharedResource;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// A resource catalog indexed by identity key. The index is read-only once built.
#[derive(Debug)]
pub struct Graph {
    resources: Vec<SharedResource>,
    index: IndexMap<String, usize>,
}

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Graph {
    /// Index a catalog. Fails before anything runs on duplicate keys.
    pub fn new(catalog: Catalog) -> Result<Self> {
        let mut index = IndexMap::with_capacity(catalog.len());
        for (i, resource) in catalog.resources.iter().enumerate() {
            if resource.name().is_empty() {
                return Err(Error::InvalidSpec(format!(
                    "resource #{} ({}) has an empty name",
                    i,
                    resource.kind()
                )));
            }
            let key = resource.identity_key();
            if index.contains_key(&key) {
                return Err(Error::InvalidSpec(format!(
                    "key {} already set in graph; check catalog for duplicated resources",
                    key
                )));
            }
            debug!(resource = %key, "indexed");
            index.insert(key, i);
        }
        Ok(Self {
            resources: catalog.resources,
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resources in catalog order.
    pub fn resources(&self) -> &[SharedResource] {
        &self.resources
    }

    /// Identity keys in catalog order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.index.keys()
    }

    pub fn get(&self, key: &str) -> Option<&SharedResource> {
        self.index.get(key).map(|&i| &self.resources[i])
    }

    /// Static checks on ordering constraints. Empty means valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (key, &i) in &self.index {
            let ordering = &self.resources[i].metadata().ordering;
            for pred in ordering.predecessors() {
                if pred == key {
                    errors.push(ValidationError {
                        message: format!("resource '{}' depends on itself", key),
                    });
                } else if !self.index.contains_key(pred) {
                    errors.push(ValidationError {
                        message: format!("resource '{}' depends on unknown resource '{}'", key, pred),
                    });
                }
            }
        }

        if errors.is_empty() {
            if let Err(e) = self.execution_order() {
                errors.push(ValidationError {
                    message: e.to_string(),
                });
            }
        }
        errors
    }

    /// Topological order of identity keys. Unknown predecessors are ignored here;
    /// `validate` reports them.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

        for key in self.index.keys() {
            in_degree.insert(key.as_str(), 0);
            adjacency.insert(key.as_str(), Vec::new());
        }

        for (key, &i) in &self.index {
            for pred in self.resources[i].metadata().ordering.predecessors() {
                if let Some(successors) = adjacency.get_mut(pred.as_str()) {
                    successors.push(key.as_str());
                    *in_degree.entry(key.as_str()).or_default() += 1;
                }
            }
        }

        let mut zero_degree: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&k, _)| k)
            .collect();
        zero_degree.sort_unstable();
        let mut queue: VecDeque<&str> = zero_degree.into();

        let mut order = Vec::with_capacity(self.index.len());
        while let Some(current) = queue.pop_front() {
            order.push(current.to_string());

            let mut next_ready: Vec<&str> = Vec::new();
            for &succ in adjacency.get(current).map(Vec::as_slice).unwrap_or_default() {
                if let Some(degree) = in_degree.get_mut(succ) {
                    *degree -= 1;
                    if *degree == 0 {
                        next_ready.push(succ);
                    }
                }
            }
            next_ready.sort_unstable();
            queue.extend(next_ready);
        }

        if order.len() != self.index.len() {
            let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
            let mut members: Vec<&str> = self
                .index
                .keys()
                .map(String::as_str)
                .filter(|k| !ordered.contains(k))
                .collect();
            members.sort_unstable();
            return Err(Error::InvalidSpec(format!(
                "ordering cycle detected involving: {}",
                members.join(", ")
            )));
        }

        Ok(order)
    }
}
