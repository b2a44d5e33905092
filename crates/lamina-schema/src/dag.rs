//! Directed acyclic graph of named vertices.
//!
//! An edge `from -> to` records that `from` depends on `to`: a sorted
//! traversal always yields `to` before `from`. The edge set is kept acyclic
//! after every mutation; a rejected mutation leaves the graph untouched.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("vertex '{0}' already exists")]
    Duplicate(String),
    #[error("vertex '{0}' does not exist")]
    Unknown(String),
    #[error("edge from '{from}' to '{to}' makes a cycle")]
    Cycle { from: String, to: String },
}

#[derive(Debug, Clone)]
pub struct Dag<V> {
    vertices: Vec<(String, V)>,
    edges: Vec<(String, String)>,
}

impl<V> Default for Dag<V> {
    fn default() -> Self {
        Self {
            vertices: Vec::new(),
            edges: Vec::new(),
        }
    }
}

impl<V> Dag<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.vertices.iter().position(|(n, _)| n == name)
    }

    pub fn add_vertex(&mut self, name: impl Into<String>, value: V) -> Result<(), DagError> {
        let name = name.into();
        if self.contains(&name) {
            return Err(DagError::Duplicate(name));
        }
        self.vertices.push((name, value));
        Ok(())
    }

    /// Remove a vertex and every edge touching it, returning its value.
    pub fn remove_vertex(&mut self, name: &str) -> Result<V, DagError> {
        let idx = self
            .position(name)
            .ok_or_else(|| DagError::Unknown(name.to_owned()))?;
        self.edges.retain(|(from, to)| from != name && to != name);
        Ok(self.vertices.remove(idx).1)
    }

    /// Record that `from` depends on `to`.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), DagError> {
        for endpoint in [from, to] {
            if !self.contains(endpoint) {
                return Err(DagError::Unknown(endpoint.to_owned()));
            }
        }
        if from == to || self.reaches(to, from) {
            return Err(DagError::Cycle {
                from: from.to_owned(),
                to: to.to_owned(),
            });
        }
        if !self.edges.iter().any(|(f, t)| f == from && t == to) {
            self.edges.push((from.to_owned(), to.to_owned()));
        }
        Ok(())
    }

    /// True when `start` depends on `target`, directly or transitively.
    fn reaches(&self, start: &str, target: &str) -> bool {
        let mut stack = vec![start];
        let mut seen: Vec<&str> = Vec::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if seen.contains(&current) {
                continue;
            }
            seen.push(current);
            stack.extend(
                self.edges
                    .iter()
                    .filter(|(f, _)| f == current)
                    .map(|(_, t)| t.as_str()),
            );
        }
        false
    }

    pub fn get_value(&self, name: &str) -> Option<&V> {
        self.vertices
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn set_value(&mut self, name: &str, value: V) -> Result<(), DagError> {
        let slot = self
            .vertices
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| DagError::Unknown(name.to_owned()))?;
        slot.1 = value;
        Ok(())
    }

    /// Direct dependencies of `name`, in the order the edges were added.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(f, _)| f == name)
            .map(|(_, t)| t.as_str())
            .collect()
    }

    /// Vertices that depend directly on `name`, in the order the edges were added.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, t)| t == name)
            .map(|(f, _)| f.as_str())
            .collect()
    }

    /// Topological order: every vertex appears after all of its dependencies.
    ///
    /// Vertices are visited depth-first in insertion order, following
    /// dependents in edge insertion order, and emitted in reverse finishing
    /// order. The result depends only on the sequence of mutations.
    pub fn sort(&self) -> Vec<(&str, &V)> {
        let n = self.vertices.len();
        let mut visited = vec![false; n];
        let mut finished: Vec<usize> = Vec::with_capacity(n);

        for root in 0..n {
            if visited[root] {
                continue;
            }
            visited[root] = true;
            // (vertex, dependents, next dependent to visit)
            let mut stack: Vec<(usize, Vec<usize>, usize)> =
                vec![(root, self.dependent_indices(root), 0)];
            while let Some(frame) = stack.last_mut() {
                if frame.2 < frame.1.len() {
                    let next = frame.1[frame.2];
                    frame.2 += 1;
                    if !visited[next] {
                        visited[next] = true;
                        let children = self.dependent_indices(next);
                        stack.push((next, children, 0));
                    }
                } else {
                    finished.push(frame.0);
                    stack.pop();
                }
            }
        }

        finished
            .into_iter()
            .rev()
            .map(|i| {
                let (name, value) = &self.vertices[i];
                (name.as_str(), value)
            })
            .collect()
    }

    fn dependent_indices(&self, idx: usize) -> Vec<usize> {
        let name = &self.vertices[idx].0;
        self.edges
            .iter()
            .filter(|(_, t)| t == name)
            .filter_map(|(f, _)| self.position(f))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wardrobe() -> Dag<u32> {
        let mut dag = Dag::new();
        for (name, value) in [("shirt", 1), ("tie", 2), ("belt", 3), ("pants", 4), ("jacket", 5)] {
            dag.add_vertex(name, value).unwrap();
        }
        dag.add_edge("tie", "shirt").unwrap();
        dag.add_edge("jacket", "tie").unwrap();
        dag.add_edge("jacket", "belt").unwrap();
        dag.add_edge("belt", "pants").unwrap();
        dag
    }

    fn order<V: Copy>(dag: &Dag<V>) -> Vec<(String, V)> {
        dag.sort()
            .into_iter()
            .map(|(n, v)| (n.to_owned(), *v))
            .collect()
    }

    #[test]
    fn wardrobe_sorts_dependencies_first() {
        let dag = wardrobe();
        let sorted = order(&dag);
        let expected = [("pants", 4), ("belt", 3), ("shirt", 1), ("tie", 2), ("jacket", 5)];
        assert_eq!(sorted.len(), expected.len());
        for ((name, value), (en, ev)) in sorted.iter().zip(expected) {
            assert_eq!(name, en);
            assert_eq!(*value, ev);
        }
    }

    #[test]
    fn cycle_is_rejected_and_graph_unchanged() {
        let mut dag = wardrobe();
        let before = order(&dag);
        let err = dag.add_edge("shirt", "jacket").unwrap_err();
        assert!(matches!(err, DagError::Cycle { .. }));
        assert_eq!(order(&dag), before);
        assert!(dag.dependencies("shirt").is_empty());
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let mut dag = wardrobe();
        assert!(matches!(
            dag.add_edge("tie", "tie"),
            Err(DagError::Cycle { .. })
        ));
    }

    #[test]
    fn duplicate_vertex_rejected() {
        let mut dag = wardrobe();
        assert_eq!(
            dag.add_vertex("tie", 9),
            Err(DagError::Duplicate("tie".to_owned()))
        );
        assert_eq!(dag.get_value("tie"), Some(&2));
    }

    #[test]
    fn unknown_endpoint_rejected() {
        let mut dag = wardrobe();
        assert_eq!(
            dag.add_edge("hat", "shirt"),
            Err(DagError::Unknown("hat".to_owned()))
        );
        assert_eq!(
            dag.add_edge("shirt", "hat"),
            Err(DagError::Unknown("hat".to_owned()))
        );
        assert!(dag.set_value("hat", 1).is_err());
        assert!(dag.remove_vertex("hat").is_err());
    }

    #[test]
    fn set_value_is_visible_in_sort() {
        let mut dag = wardrobe();
        dag.set_value("shirt", 9).unwrap();
        let sorted = order(&dag);
        assert!(sorted.contains(&("shirt".to_owned(), 9)));
    }

    #[test]
    fn remove_vertex_drops_its_edges() {
        let mut dag = wardrobe();
        assert_eq!(dag.remove_vertex("tie"), Ok(2));
        assert!(!dag.contains("tie"));
        assert_eq!(dag.dependencies("jacket"), vec!["belt"]);
        assert!(dag.dependents("shirt").is_empty());
        assert_eq!(dag.sort().len(), 4);
    }

    #[test]
    fn every_edge_respected_for_arbitrary_insertions() {
        let mut dag: Dag<()> = Dag::new();
        let names: Vec<String> = (0..12).map(|i| format!("v{i}")).collect();
        for name in &names {
            dag.add_vertex(name.clone(), ()).unwrap();
        }
        // Deterministic pseudo-random edge attempts; cycles are simply refused.
        let mut seed: u32 = 7;
        for _ in 0..80 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let a = (seed >> 8) as usize % names.len();
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let b = (seed >> 8) as usize % names.len();
            let _ = dag.add_edge(&names[a], &names[b]);
        }

        let sorted: Vec<&str> = dag.sort().into_iter().map(|(n, _)| n).collect();
        assert_eq!(sorted.len(), names.len());
        let index = |n: &str| sorted.iter().position(|s| *s == n).unwrap();
        for name in &names {
            for dep in dag.dependencies(name) {
                assert!(index(dep) < index(name), "{dep} must precede {name}");
            }
        }
    }
}
