//! Dependency resolution.
//!
//! Given the installed descriptors and the set a project enables, produce a
//! deterministic activation order. Ties between plugins whose dependencies are
//! all satisfied break by id ascending. Plugins that cannot be resolved, and
//! everything that depends on them, are reported as failures instead.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::RuntimeError;
use crate::loader::PluginDescriptor;

#[derive(Debug, Default)]
pub struct Resolution {
    /// Resolvable plugins in activation order.
    pub order: Vec<String>,
    /// Enabled plugins that cannot be activated, with the reason.
    pub failures: BTreeMap<String, RuntimeError>,
    /// Enabled ids with no installed bundle.
    pub missing: Vec<String>,
}

impl Resolution {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.missing.is_empty()
    }
}

pub fn resolve(
    descriptors: &BTreeMap<String, PluginDescriptor>,
    enabled: &BTreeSet<String>,
) -> Resolution {
    let mut resolution = Resolution::default();

    let candidates: BTreeSet<&str> = enabled
        .iter()
        .filter(|id| descriptors.contains_key(id.as_str()))
        .map(String::as_str)
        .collect();
    resolution.missing = enabled
        .iter()
        .filter(|id| !descriptors.contains_key(id.as_str()))
        .cloned()
        .collect();

    // Direct checks: presence, enablement, version range.
    for id in &candidates {
        let manifest = &descriptors[*id].manifest;
        for dep in &manifest.dependencies {
            let failure = match descriptors.get(&dep.id) {
                None => Some(missing(id, &dep.id, "not installed")),
                Some(_) if !enabled.contains(&dep.id) => Some(missing(id, &dep.id, "disabled")),
                Some(found) if !dep.version_range.matches(found.version()) => {
                    Some(RuntimeError::DependencyVersionMismatch {
                        plugin: id.to_string(),
                        dependency: dep.id.clone(),
                        required: dep.version_range.to_string(),
                        found: found.version().to_string(),
                    })
                }
                Some(_) => None,
            };
            if let Some(failure) = failure {
                resolution.failures.entry(id.to_string()).or_insert(failure);
            }
        }
    }

    // Cycles among candidates.
    let edges: BTreeMap<&str, Vec<&str>> = candidates
        .iter()
        .map(|id| {
            let deps = descriptors[*id]
                .manifest
                .dependencies
                .iter()
                .map(|d| d.id.as_str())
                .filter(|d| candidates.contains(d))
                .collect();
            (*id, deps)
        })
        .collect();
    for component in strongly_connected(&edges) {
        if component.len() < 2 {
            continue;
        }
        let members: Vec<String> = component.iter().map(|s| s.to_string()).collect();
        for member in &component {
            resolution.failures.insert(
                member.to_string(),
                RuntimeError::DependencyCycle {
                    members: members.clone(),
                },
            );
        }
    }

    // Anything depending on a failed plugin cannot activate either.
    loop {
        let mut newly_blocked = Vec::new();
        for id in &candidates {
            if resolution.failures.contains_key(*id) {
                continue;
            }
            if let Some(dep) = edges[id].iter().find(|d| resolution.failures.contains_key(**d)) {
                newly_blocked.push((id.to_string(), missing(id, dep, "unavailable")));
            }
        }
        if newly_blocked.is_empty() {
            break;
        }
        resolution.failures.extend(newly_blocked);
    }

    // Kahn's algorithm over the remaining set; the ready queue is ordered by id.
    let remaining: BTreeSet<&str> = candidates
        .iter()
        .copied()
        .filter(|id| !resolution.failures.contains_key(*id))
        .collect();
    let mut pending: BTreeMap<&str, usize> = remaining
        .iter()
        .map(|id| (*id, edges[id].iter().filter(|d| remaining.contains(*d)).count()))
        .collect();
    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();

    while let Some(next) = ready.pop_first() {
        pending.remove(next);
        resolution.order.push(next.to_string());
        for (id, count) in pending.iter_mut() {
            if edges[id].contains(&next) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*id);
                }
            }
        }
    }

    resolution
}

fn missing(plugin: &str, dependency: &str, reason: &str) -> RuntimeError {
    RuntimeError::DependencyMissing {
        plugin: plugin.to_string(),
        dependency: dependency.to_string(),
        reason: reason.to_string(),
    }
}

/// Tarjan's algorithm. Each component is returned sorted by id.
fn strongly_connected<'a>(edges: &BTreeMap<&'a str, Vec<&'a str>>) -> Vec<Vec<&'a str>> {
    struct State<'a> {
        index: usize,
        indices: BTreeMap<&'a str, usize>,
        lowlink: BTreeMap<&'a str, usize>,
        stack: Vec<&'a str>,
        on_stack: BTreeSet<&'a str>,
        components: Vec<Vec<&'a str>>,
    }

    fn visit<'a>(node: &'a str, edges: &BTreeMap<&'a str, Vec<&'a str>>, state: &mut State<'a>) {
        state.indices.insert(node, state.index);
        state.lowlink.insert(node, state.index);
        state.index += 1;
        state.stack.push(node);
        state.on_stack.insert(node);

        for &next in edges.get(node).map(Vec::as_slice).unwrap_or_default() {
            if !state.indices.contains_key(next) {
                visit(next, edges, state);
                let low = state.lowlink[next].min(state.lowlink[node]);
                state.lowlink.insert(node, low);
            } else if state.on_stack.contains(next) {
                let low = state.indices[next].min(state.lowlink[node]);
                state.lowlink.insert(node, low);
            }
        }

        if state.lowlink[node] == state.indices[node] {
            let mut component = Vec::new();
            while let Some(member) = state.stack.pop() {
                state.on_stack.remove(member);
                component.push(member);
                if member == node {
                    break;
                }
            }
            component.sort_unstable();
            state.components.push(component);
        }
    }

    let mut state = State {
        index: 0,
        indices: BTreeMap::new(),
        lowlink: BTreeMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        components: Vec::new(),
    };
    for &node in edges.keys() {
        if !state.indices.contains_key(node) {
            visit(node, edges, &mut state);
        }
    }
    state.components
}
