//! Dependency graph resolution: cycle detection, topological order, levels.
//!
//! Every traversal walks nodes and dependency lists in input order, and the
//! ready set is a min-heap over input indices, so identical input always
//! yields identical output.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::SchedulerError;
use crate::util::types::NodeId;

/// A node as submitted by a task source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec<P> {
    /// Node identifier, unique within the graph.
    pub id: NodeId,
    /// Ids this node depends on.
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    /// Opaque payload handed to the work function.
    pub payload: P,
}

impl<P> NodeSpec<P> {
    /// Node without dependencies.
    pub fn new(id: impl Into<NodeId>, payload: P) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            payload,
        }
    }

    /// Add dependencies.
    #[must_use]
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }
}

/// Result of resolving a graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Best-effort topological order; cycle members are appended at the end.
    pub order: Vec<NodeId>,
    /// Groups of mutually independent nodes, level 0 first.
    pub levels: Vec<Vec<NodeId>>,
    /// Cycles found, each listed along its dependency edges.
    pub cycles: Vec<Vec<NodeId>>,
}

impl Resolution {
    /// Whether any cycle was found.
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }

    /// Level of a node.
    pub fn level_of(&self, id: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|node| node == id))
    }

    /// `CycleDetected` when cycles exist, for callers that refuse to run
    /// with a violated dependency contract.
    pub fn cycle_error(&self) -> Option<SchedulerError> {
        self.has_cycles()
            .then(|| SchedulerError::CycleDetected(self.cycles.clone()))
    }
}

/// Index-based adjacency over a node list.
#[derive(Debug, Clone)]
pub struct GraphIndex {
    ids: Vec<NodeId>,
    positions: HashMap<NodeId, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl GraphIndex {
    /// Build the index from `(id, dependencies)` pairs.
    ///
    /// Duplicate ids and dependencies on unknown ids are rejected; repeated
    /// dependency entries collapse into one edge.
    pub fn build<'a, I>(entries: I) -> Result<Self, SchedulerError>
    where
        I: IntoIterator<Item = (&'a str, &'a [NodeId])>,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        let mut positions = HashMap::with_capacity(entries.len());
        for (index, (id, _)) in entries.iter().enumerate() {
            if positions.insert((*id).to_string(), index).is_some() {
                return Err(SchedulerError::DuplicateNode((*id).to_string()));
            }
        }

        let mut dependencies = Vec::with_capacity(entries.len());
        let mut dependents = vec![Vec::new(); entries.len()];
        for (index, (id, deps)) in entries.iter().enumerate() {
            let mut seen = HashSet::new();
            let mut resolved = Vec::with_capacity(deps.len());
            for dep in *deps {
                let Some(&dep_index) = positions.get(dep.as_str()) else {
                    return Err(SchedulerError::UnknownDependency {
                        node: (*id).to_string(),
                        dependency: dep.clone(),
                    });
                };
                if seen.insert(dep_index) {
                    resolved.push(dep_index);
                    dependents[dep_index].push(index);
                }
            }
            dependencies.push(resolved);
        }

        Ok(Self {
            ids: entries.iter().map(|(id, _)| (*id).to_string()).collect(),
            positions,
            dependencies,
            dependents,
        })
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Id at an index.
    pub fn id(&self, index: usize) -> &str {
        &self.ids[index]
    }

    /// Index of an id.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Direct dependencies of a node.
    pub fn dependencies(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Direct dependents of a node (reverse edges).
    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Depth-first cycle search.
    ///
    /// Returns each cycle as the stack slice from the revisited node, plus
    /// the set of back edges `(node, dependency)` that closed them.
    fn find_cycles(&self) -> (Vec<Vec<usize>>, HashSet<(usize, usize)>) {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.len()];
        let mut cycles = Vec::new();
        let mut back_edges = HashSet::new();
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for root in 0..self.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            marks[root] = Mark::OnStack;
            stack.push((root, 0));

            while let Some(frame) = stack.last_mut() {
                let (node, cursor) = *frame;
                let Some(&dep) = self.dependencies[node].get(cursor) else {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                };
                frame.1 += 1;
                match marks[dep] {
                    Mark::Unvisited => {
                        marks[dep] = Mark::OnStack;
                        stack.push((dep, 0));
                    }
                    Mark::OnStack => {
                        if let Some(start) = stack.iter().position(|(n, _)| *n == dep) {
                            cycles.push(stack[start..].iter().map(|(n, _)| *n).collect());
                        }
                        back_edges.insert((node, dep));
                    }
                    Mark::Done => {}
                }
            }
        }
        (cycles, back_edges)
    }

    /// Kahn's algorithm with an input-order tie break. Nodes never released
    /// are appended in input order.
    fn topological_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| Reverse(index))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        let mut emitted = vec![false; self.len()];
        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);
            emitted[index] = true;
            for &dependent in &self.dependents[index] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }
        order.extend((0..self.len()).filter(|index| !emitted[*index]));
        order
    }

    /// Longest-path levels with back edges ignored, so cyclic graphs still
    /// get a level for every node.
    fn levels(&self, back_edges: &HashSet<(usize, usize)>) -> Vec<usize> {
        let mut in_degree: Vec<usize> = (0..self.len())
            .map(|index| {
                self.dependencies[index]
                    .iter()
                    .filter(|dep| !back_edges.contains(&(index, **dep)))
                    .count()
            })
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| Reverse(index))
            .collect();

        let mut level = vec![0usize; self.len()];
        while let Some(Reverse(index)) = ready.pop() {
            level[index] = self.dependencies[index]
                .iter()
                .filter(|dep| !back_edges.contains(&(index, **dep)))
                .map(|dep| level[*dep] + 1)
                .max()
                .unwrap_or(0);
            for &dependent in &self.dependents[index] {
                if back_edges.contains(&(dependent, index)) {
                    continue;
                }
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }
        level
    }

    /// Full resolution as index lists: `(order, levels, cycles)`.
    pub(crate) fn resolve_indices(&self) -> (Vec<usize>, Vec<Vec<usize>>, Vec<Vec<usize>>) {
        let (cycles, back_edges) = self.find_cycles();
        let order = self.topological_order();
        let level = self.levels(&back_edges);

        let depth = level.iter().copied().max().map_or(0, |max| max + 1);
        let mut levels = vec![Vec::new(); depth];
        for (index, l) in level.iter().enumerate() {
            levels[*l].push(index);
        }
        (order, levels, cycles)
    }

    /// Resolve into node ids.
    pub fn resolve(&self) -> Resolution {
        let (order, levels, cycles) = self.resolve_indices();
        let name = |indices: Vec<usize>| -> Vec<NodeId> {
            indices.into_iter().map(|i| self.ids[i].clone()).collect()
        };
        Resolution {
            order: name(order),
            levels: levels.into_iter().map(name).collect(),
            cycles: cycles.into_iter().map(name).collect(),
        }
    }
}

/// Resolve `(id, dependencies)` pairs in one call.
pub fn resolve<'a, I>(entries: I) -> Result<Resolution, SchedulerError>
where
    I: IntoIterator<Item = (&'a str, &'a [NodeId])>,
{
    Ok(GraphIndex::build(entries)?.resolve())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(edges: &[(&str, &[&str])]) -> Vec<(String, Vec<NodeId>)> {
        edges
            .iter()
            .map(|(id, deps)| ((*id).to_string(), deps.iter().map(|d| (*d).to_string()).collect()))
            .collect()
    }

    fn run(edges: &[(&str, &[&str])]) -> Resolution {
        let owned = specs(edges);
        resolve(owned.iter().map(|(id, deps)| (id.as_str(), deps.as_slice()))).unwrap()
    }

    #[test]
    fn linear_chain() {
        let r = run(&[("build", &[]), ("test", &["build"]), ("deploy", &["test"])]);
        assert_eq!(r.order, vec!["build", "test", "deploy"]);
        assert_eq!(r.levels, vec![vec!["build"], vec!["test"], vec!["deploy"]]);
        assert!(r.cycles.is_empty());
    }

    #[test]
    fn ties_follow_input_order() {
        let r = run(&[("c", &[]), ("a", &[]), ("b", &["c"]), ("d", &["a"])]);
        assert_eq!(r.order, vec!["c", "a", "b", "d"]);
        assert_eq!(r.levels, vec![vec!["c", "a"], vec!["b", "d"]]);
    }

    #[test]
    fn diamond_levels_use_longest_path() {
        let r = run(&[
            ("root", &[]),
            ("left", &["root"]),
            ("right", &["root"]),
            ("deep", &["left"]),
            ("join", &["right", "deep"]),
        ]);
        assert_eq!(r.level_of("join"), Some(3));
        assert_eq!(r.level_of("right"), Some(1));
        assert_eq!(r.levels[1], vec!["left", "right"]);
    }

    #[test]
    fn three_cycle_is_reported_once_and_kept_in_order() {
        let r = run(&[("A", &["C"]), ("B", &["A"]), ("C", &["B"])]);
        assert_eq!(r.cycles.len(), 1);
        let mut members = r.cycles[0].clone();
        members.sort();
        assert_eq!(members, vec!["A", "B", "C"]);
        assert_eq!(r.order, vec!["A", "B", "C"]);
        assert_eq!(r.levels.iter().map(Vec::len).sum::<usize>(), 3);
        assert!(r.cycle_error().is_some());
    }

    #[test]
    fn disjoint_cycles_each_reported() {
        let r = run(&[
            ("a", &["b"]),
            ("b", &["a"]),
            ("free", &[]),
            ("x", &["y"]),
            ("y", &["x"]),
        ]);
        assert_eq!(r.cycles.len(), 2);
        assert_eq!(r.order[0], "free");
        assert_eq!(r.order.len(), 5);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let r = run(&[("loop", &["loop"]), ("after", &["loop"])]);
        assert_eq!(r.cycles, vec![vec!["loop".to_string()]]);
        assert_eq!(r.order, vec!["loop", "after"]);
        assert!(r.level_of("after").unwrap() > r.level_of("loop").unwrap());
    }

    #[test]
    fn duplicate_dependencies_collapse() {
        let r = run(&[("a", &[]), ("b", &["a", "a"])]);
        assert_eq!(r.order, vec!["a", "b"]);
        assert_eq!(r.level_of("b"), Some(1));
    }

    #[test]
    fn unknown_and_duplicate_ids_are_rejected() {
        let owned = specs(&[("a", &["ghost"])]);
        let err = resolve(owned.iter().map(|(id, deps)| (id.as_str(), deps.as_slice())));
        assert!(matches!(err, Err(SchedulerError::UnknownDependency { .. })));

        let owned = specs(&[("a", &[]), ("a", &[])]);
        let err = resolve(owned.iter().map(|(id, deps)| (id.as_str(), deps.as_slice())));
        assert_eq!(err, Err(SchedulerError::DuplicateNode("a".into())));
    }

    #[test]
    fn empty_graph_resolves_to_nothing() {
        let r = run(&[]);
        assert!(r.order.is_empty());
        assert!(r.levels.is_empty());
    }
}
