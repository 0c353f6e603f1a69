use crate::error::ResolveError;
use std::collections::{btree_set, BTreeMap, BTreeSet};

/// Directed graph over indicator names: `a -> b` when `a` reads `b`.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

/// Topological order with dependencies first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyOrder {
    pub order: Vec<String>,
    /// Position of each indicator in `order`.
    pub rank: BTreeMap<String, usize>,
    /// Indicators that read no other indicator.
    pub leaves: BTreeSet<String>,
    /// Longest dependency chain below each indicator; equal levels never depend on each other.
    pub levels: BTreeMap<String, usize>,
}

impl DependencyOrder {
    #[inline]
    pub fn rank_of(&self, name: &str) -> Option<usize> {
        self.rank.get(name).copied()
    }

    #[inline]
    pub fn level_of(&self, name: &str) -> Option<usize> {
        self.levels.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str) {
        self.edges.entry(name.to_string()).or_default();
    }

    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    pub fn from_edges<'a, I, D>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, D)>,
        D: IntoIterator<Item = &'a str>,
    {
        let mut graph = Self::new();
        for (name, deps) in nodes {
            graph.add_node(name);
            for dep in deps {
                graph.add_edge(name, dep);
            }
        }
        graph
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(name)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Indicators that read `name` directly.
    pub fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        self.edges
            .iter()
            .filter(|(from, deps)| from.as_str() != name && deps.contains(name))
            .map(|(from, _)| from.clone())
            .collect()
    }

    /// Everything `name` reads, directly or through other indicators.
    pub fn transitive_dependencies(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependencies_of(name).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.to_string()) {
                stack.extend(self.dependencies_of(next));
            }
        }
        seen
    }

    /// Everything that reads `name`, directly or transitively.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(next) = stack.pop() {
            for dependent in self.dependents_of(&next) {
                if seen.insert(dependent.clone()) {
                    stack.push(dependent);
                }
            }
        }
        seen.remove(name);
        seen
    }

    /// Depth-first topological sort with a three-color marker. A back edge to a
    /// node on the current path is reported with the full cycle.
    pub fn resolve(&self) -> Result<DependencyOrder, ResolveError> {
        let mut color: BTreeMap<&str, Color> =
            self.edges.keys().map(|k| (k.as_str(), Color::White)).collect();
        let mut order = Vec::with_capacity(self.edges.len());
        let mut path: Vec<&str> = Vec::new();

        for start in self.edges.keys() {
            let start = start.as_str();
            if color[start] != Color::White {
                continue;
            }
            // Explicit stack of (node, remaining children) to avoid deep recursion.
            let mut stack: Vec<(&str, btree_set::Iter<'_, String>)> = Vec::new();
            color.insert(start, Color::Gray);
            path.push(start);
            stack.push((start, self.edges[start].iter()));

            while let Some((node, children)) = stack.last_mut() {
                let node = *node;
                match children.next() {
                    Some(child) => {
                        let child = child.as_str();
                        match color.get(child).copied() {
                            None => {
                                return Err(ResolveError::UnknownIndicator {
                                    from: node.to_string(),
                                    name: child.to_string(),
                                })
                            }
                            Some(Color::Gray) => {
                                let begin = path.iter().position(|n| *n == child).unwrap_or(0);
                                let mut cycle: Vec<String> =
                                    path[begin..].iter().map(|n| n.to_string()).collect();
                                cycle.push(child.to_string());
                                return Err(ResolveError::CyclicDependency { path: cycle });
                            }
                            Some(Color::Black) => {}
                            Some(Color::White) => {
                                color.insert(child, Color::Gray);
                                path.push(child);
                                stack.push((child, self.edges[child].iter()));
                            }
                        }
                    }
                    None => {
                        color.insert(node, Color::Black);
                        path.pop();
                        stack.pop();
                        order.push(node.to_string());
                    }
                }
            }
        }

        let rank = order
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        let mut levels: BTreeMap<String, usize> = BTreeMap::new();
        let mut leaves = BTreeSet::new();
        for name in &order {
            let level = self
                .dependencies_of(name)
                .filter_map(|dep| levels.get(dep).map(|l| l + 1))
                .max()
                .unwrap_or(0);
            if self.edges[name].is_empty() {
                leaves.insert(name.clone());
            }
            levels.insert(name.clone(), level);
        }

        Ok(DependencyOrder {
            order,
            rank,
            leaves,
            levels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(pairs: &[(&'static str, &[&'static str])]) -> DependencyGraph {
        DependencyGraph::from_edges(pairs.iter().map(|(n, deps)| (*n, deps.iter().copied())))
    }

    #[test]
    fn orders_dependencies_before_dependents() {
        let g = graph(&[
            ("macd", &["ema_fast", "ema_slow"]),
            ("ema_fast", &[]),
            ("ema_slow", &[]),
            ("signal", &["macd"]),
        ]);
        let order = g.resolve().expect("acyclic");
        assert!(order.rank_of("ema_fast") < order.rank_of("macd"));
        assert!(order.rank_of("ema_slow") < order.rank_of("macd"));
        assert!(order.rank_of("macd") < order.rank_of("signal"));
        assert_eq!(
            order.leaves,
            ["ema_fast", "ema_slow"].iter().map(|s| s.to_string()).collect()
        );
        assert_eq!(order.level_of("signal"), Some(2));
    }

    #[test]
    fn reports_full_cycle_path() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        match g.resolve() {
            Err(ResolveError::CyclicDependency { path }) => {
                assert_eq!(path, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let g = graph(&[("a", &["a"])]);
        assert_eq!(
            g.resolve(),
            Err(ResolveError::CyclicDependency {
                path: vec!["a".to_string(), "a".to_string()]
            })
        );
    }

    #[test]
    fn edge_to_missing_node_is_rejected() {
        let g = graph(&[("a", &["ghost"])]);
        assert!(matches!(
            g.resolve(),
            Err(ResolveError::UnknownIndicator { .. })
        ));
    }

    #[test]
    fn transitive_queries_follow_edges() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        assert_eq!(
            g.transitive_dependencies("c"),
            ["a", "b"].iter().map(|s| s.to_string()).collect()
        );
        assert_eq!(
            g.transitive_dependents("a"),
            ["b", "c"].iter().map(|s| s.to_string()).collect()
        );
    }
}
