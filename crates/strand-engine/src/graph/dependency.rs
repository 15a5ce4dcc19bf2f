use std::collections::{BTreeSet, HashMap, VecDeque};

use strand_core::config::WorkflowConfig;
use strand_core::error::{Result, StrandError};

use super::node::AgentDescriptor;

/// Immutable, validated dependency graph.
///
/// Nodes keep their declaration order, which is also the tie-break order for
/// anything the scheduler has to choose between. Edges point from a
/// prerequisite to its dependents.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<AgentDescriptor>,
    index: HashMap<String, usize>,
    prerequisites: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    /// Build and validate a graph.
    ///
    /// Fails with `StrandError::Graph` on duplicate ids, self-dependencies,
    /// dangling references or cycles.
    pub fn new(nodes: Vec<AgentDescriptor>) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if node.id.is_empty() {
                return Err(StrandError::Graph(format!("Node #{} has an empty id", i)));
            }
            if index.insert(node.id.clone(), i).is_some() {
                return Err(StrandError::Graph(format!("Duplicate node id '{}'", node.id)));
            }
        }

        let mut prerequisites = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            let mut seen = BTreeSet::new();
            for dep in &node.depends_on {
                if dep == &node.id {
                    return Err(StrandError::Graph(format!(
                        "Node '{}' depends on itself",
                        node.id
                    )));
                }
                let &p = index.get(dep).ok_or_else(|| {
                    StrandError::Graph(format!(
                        "Node '{}' depends on unknown node '{}'",
                        node.id, dep
                    ))
                })?;
                if seen.insert(p) {
                    prerequisites[i].push(p);
                    dependents[p].push(i);
                }
            }
        }
        for list in prerequisites.iter_mut().chain(dependents.iter_mut()) {
            list.sort_unstable();
        }

        let graph = Self {
            nodes,
            index,
            prerequisites,
            dependents,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Build the graph declared in a workflow file.
    pub fn from_config(config: &WorkflowConfig) -> Result<Self> {
        Self::new(config.nodes.iter().map(AgentDescriptor::from_config).collect())
    }

    /// Depth-first search with an explicit stack, so long chains cannot
    /// exhaust the thread stack.
    fn check_acyclic(&self) -> Result<()> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        // (node, next dependent to look at); the stack doubles as the path.
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for start in 0..self.nodes.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            marks[start] = Mark::InProgress;
            stack.push((start, 0));

            while let Some(top) = stack.last_mut() {
                let (node, cursor) = *top;
                let Some(&next) = self.dependents[node].get(cursor) else {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                };
                top.1 += 1;
                match marks[next] {
                    Mark::InProgress => return Err(self.cycle_error(&stack, next)),
                    Mark::Unvisited => {
                        marks[next] = Mark::InProgress;
                        stack.push((next, 0));
                    }
                    Mark::Done => {}
                }
            }
        }
        Ok(())
    }

    fn cycle_error(&self, stack: &[(usize, usize)], closing: usize) -> StrandError {
        let from = stack.iter().position(|&(n, _)| n == closing).unwrap_or(0);
        let cycle: Vec<&str> = stack[from..]
            .iter()
            .map(|&(n, _)| n)
            .chain(std::iter::once(closing))
            .map(|n| self.nodes[n].id.as_str())
            .collect();
        StrandError::Graph(format!("Cycle detected: {}", cycle.join(" -> ")))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Descriptors in declaration order.
    pub fn nodes(&self) -> &[AgentDescriptor] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &AgentDescriptor {
        &self.nodes[idx]
    }

    pub fn get(&self, id: &str) -> Option<&AgentDescriptor> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn prerequisites(&self, idx: usize) -> &[usize] {
        &self.prerequisites[idx]
    }

    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Nodes with no prerequisites.
    pub fn roots(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.prerequisites[i].is_empty())
            .collect()
    }

    /// Every node reachable from `idx` along dependency edges, in
    /// declaration order.
    pub fn transitive_dependents(&self, idx: usize) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = self.dependents[idx].clone();
        while let Some(n) = stack.pop() {
            if seen.insert(n) {
                stack.extend_from_slice(&self.dependents[n]);
            }
        }
        seen.into_iter().collect()
    }

    /// Topological order, preferring earlier-declared nodes.
    pub fn topological_order(&self) -> Vec<usize> {
        self.levels().into_iter().flatten().collect()
    }

    /// Layers of nodes whose prerequisites all sit in earlier layers.
    /// Nodes within a layer could run in parallel.
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut remaining: Vec<usize> = self.prerequisites.iter().map(|p| p.len()).collect();
        let mut current: Vec<usize> = self.roots();
        let mut levels = Vec::new();
        let mut queue = VecDeque::new();

        while !current.is_empty() {
            for &n in &current {
                for &d in &self.dependents[n] {
                    remaining[d] -= 1;
                    if remaining[d] == 0 {
                        queue.push_back(d);
                    }
                }
            }
            levels.push(std::mem::take(&mut current));
            current = queue.drain(..).collect();
            current.sort_unstable();
        }
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, deps: &[&str]) -> AgentDescriptor {
        AgentDescriptor::new(id, "noop").depends_on(deps.iter().copied())
    }

    fn diamond() -> DependencyGraph {
        DependencyGraph::new(vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("d", &["b", "c"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_graph_construction() {
        let g = diamond();
        assert_eq!(g.len(), 4);
        assert_eq!(g.roots(), vec![0]);
        assert_eq!(g.prerequisites(3), &[1, 2]);
        assert_eq!(g.dependents(0), &[1, 2]);
        assert_eq!(g.get("d").map(|n| n.id.as_str()), Some("d"));
        assert_eq!(g.index_of("c"), Some(2));
        assert_eq!(g.index_of("zzz"), None);
    }

    #[test]
    fn test_levels_and_order() {
        let g = diamond();
        assert_eq!(g.levels(), vec![vec![0], vec![1, 2], vec![3]]);
        assert_eq!(g.topological_order(), vec![0, 1, 2, 3]);
        assert_eq!(g.transitive_dependents(1), vec![3]);
        assert_eq!(g.transitive_dependents(0), vec![1, 2, 3]);
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let g = DependencyGraph::new(vec![
            node("late", &["root"]),
            node("root", &[]),
            node("early", &[]),
        ])
        .unwrap();
        assert_eq!(g.levels(), vec![vec![1, 2], vec![0]]);
    }

    #[test]
    fn test_cycle_rejected() {
        let err = DependencyGraph::new(vec![node("d", &["a"]), node("a", &["d"])]).unwrap_err();
        assert!(matches!(err, StrandError::Graph(_)));
        let msg = err.to_string();
        assert!(msg.contains("Cycle detected"), "{}", msg);
        assert!(msg.contains("a -> d -> a") || msg.contains("d -> a -> d"), "{}", msg);
    }

    #[test]
    fn test_long_cycle_rejected() {
        let err = DependencyGraph::new(vec![
            node("a", &["c"]),
            node("b", &["a"]),
            node("c", &["b"]),
            node("x", &[]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("Cycle detected"));
    }

    #[test]
    fn test_deep_chain_accepted() {
        let n = 200_000;
        let ids: Vec<String> = (0..n).map(|i| format!("n{}", i)).collect();
        let nodes: Vec<AgentDescriptor> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let deps: Vec<&str> = if i == 0 { vec![] } else { vec![ids[i - 1].as_str()] };
                node(id, &deps)
            })
            .collect();
        let g = DependencyGraph::new(nodes).unwrap();
        assert_eq!(g.len(), n);
        assert_eq!(g.levels().len(), n);
    }

    #[test]
    fn test_deep_chain_closing_cycle_rejected() {
        let n = 200_000;
        let ids: Vec<String> = (0..n).map(|i| format!("n{}", i)).collect();
        let nodes: Vec<AgentDescriptor> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let prev = if i == 0 { n - 1 } else { i - 1 };
                node(id, &[ids[prev].as_str()])
            })
            .collect();
        let err = DependencyGraph::new(nodes).unwrap_err();
        assert!(matches!(err, StrandError::Graph(_)));
        assert!(err.to_string().starts_with("Graph error: Cycle detected: n0 -> n1"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = DependencyGraph::new(vec![node("a", &["a"])]).unwrap_err();
        assert!(err.to_string().contains("depends on itself"));
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let err = DependencyGraph::new(vec![node("a", &["ghost"])]).unwrap_err();
        assert!(err.to_string().contains("unknown node 'ghost'"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = DependencyGraph::new(vec![node("a", &[]), node("a", &[])]).unwrap_err();
        assert!(err.to_string().contains("Duplicate node id 'a'"));
    }

    #[test]
    fn test_repeated_dependency_collapses() {
        let g = DependencyGraph::new(vec![node("a", &[]), node("b", &["a", "a"])]).unwrap();
        assert_eq!(g.prerequisites(1), &[0]);
        assert_eq!(g.dependents(0), &[1]);
    }

    #[test]
    fn test_empty_graph() {
        let g = DependencyGraph::new(vec![]).unwrap();
        assert!(g.is_empty());
        assert!(g.levels().is_empty());
    }
}
