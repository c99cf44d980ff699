/*!
# Dependency Graph

Tracks task predecessor/successor edges and maintains readiness incrementally,
so the scheduler never needs a global sweep to find runnable work.
*/

use crate::error::{CoordinationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Node status within the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Waiting on predecessors
    Pending,
    /// All predecessors completed
    Ready,
    /// Executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
}

/// A node: the task's edges plus its graph-local status
#[derive(Debug, Clone)]
struct Node {
    deps: HashSet<String>,
    dependents: HashSet<String>,
    status: NodeStatus,
}

/// Dependency graph over task ids
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, Node>,
    completed: HashSet<String>,
}

impl DependencyGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task with its dependencies.
    ///
    /// Fails with `DependencyMissing` when a listed dependency is neither in
    /// the graph nor in the completed set. The node starts `Ready` iff every
    /// dependency has already completed.
    pub fn add(&mut self, task_id: &str, dependencies: &[String]) -> Result<NodeStatus> {
        let missing: Vec<String> = dependencies
            .iter()
            .filter(|dep| !self.nodes.contains_key(*dep) && !self.completed.contains(*dep))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(CoordinationError::DependencyMissing {
                task_id: task_id.to_string(),
                missing,
            });
        }

        let open_deps: HashSet<String> = dependencies
            .iter()
            .filter(|dep| !self.completed.contains(*dep))
            .cloned()
            .collect();

        let status = if open_deps.is_empty() {
            NodeStatus::Ready
        } else {
            NodeStatus::Pending
        };

        for dep in &open_deps {
            if let Some(node) = self.nodes.get_mut(dep) {
                node.dependents.insert(task_id.to_string());
            }
        }

        self.nodes.insert(
            task_id.to_string(),
            Node {
                deps: open_deps,
                dependents: HashSet::new(),
                status,
            },
        );

        Ok(status)
    }

    /// Move a task to the completed set and return the dependents that became
    /// ready. Calling this on an already-completed id is a no-op.
    pub fn mark_completed(&mut self, task_id: &str) -> Vec<String> {
        if self.completed.contains(task_id) {
            return Vec::new();
        }
        let node = match self.nodes.remove(task_id) {
            Some(node) => node,
            None => return Vec::new(),
        };
        self.completed.insert(task_id.to_string());

        let mut newly_ready = Vec::new();
        for dependent in node.dependents {
            if let Some(next) = self.nodes.get_mut(&dependent) {
                next.deps.remove(task_id);
                if next.deps.is_empty() && next.status == NodeStatus::Pending {
                    next.status = NodeStatus::Ready;
                    newly_ready.push(dependent);
                }
            }
        }
        newly_ready.sort();
        newly_ready
    }

    /// Mark a task failed and return its transitive dependents, which the
    /// caller is expected to cancel.
    pub fn mark_failed(&mut self, task_id: &str) -> Vec<String> {
        if let Some(node) = self.nodes.get_mut(task_id) {
            node.status = NodeStatus::Failed;
        }
        let mut affected = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = self
            .nodes
            .get(task_id)
            .map(|n| n.dependents.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                for dependent in &node.dependents {
                    queue.push_back(dependent.clone());
                }
            }
            affected.push(id);
        }
        affected.sort();
        affected
    }

    /// Mark a node as executing
    pub fn mark_running(&mut self, task_id: &str) {
        if let Some(node) = self.nodes.get_mut(task_id) {
            node.status = NodeStatus::Running;
        }
    }

    /// Put a node back to ready, used when an attempt is retried
    pub fn mark_ready(&mut self, task_id: &str) {
        if let Some(node) = self.nodes.get_mut(task_id) {
            if node.deps.is_empty() {
                node.status = NodeStatus::Ready;
            }
        }
    }

    /// Remove a node entirely, detaching its edges
    pub fn remove(&mut self, task_id: &str) {
        if let Some(node) = self.nodes.remove(task_id) {
            for dep in node.deps {
                if let Some(pred) = self.nodes.get_mut(&dep) {
                    pred.dependents.remove(task_id);
                }
            }
            for dependent in node.dependents {
                if let Some(succ) = self.nodes.get_mut(&dependent) {
                    succ.deps.remove(task_id);
                }
            }
        }
    }

    /// Graph-local status of a node
    pub fn status(&self, task_id: &str) -> Option<NodeStatus> {
        self.nodes.get(task_id).map(|n| n.status)
    }

    /// Whether the id is in the completed set
    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed.contains(task_id)
    }

    /// Seed the completed set directly, used when restoring from a snapshot
    pub fn insert_completed(&mut self, task_id: &str) {
        self.completed.insert(task_id.to_string());
    }

    /// Ids currently ready
    pub fn ready_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.status == NodeStatus::Ready)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of live (non-completed) nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether there are no live nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Find all dependency cycles via DFS with a recursion stack
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = Vec::new();
        let mut on_stack: HashSet<String> = HashSet::new();

        let mut ids: Vec<&String> = self.nodes.keys().collect();
        ids.sort();

        for id in ids {
            if !visited.contains(id) {
                self.dfs_cycles(id, &mut visited, &mut stack, &mut on_stack, &mut cycles);
            }
        }
        cycles
    }

    fn dfs_cycles(
        &self,
        id: &str,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
        on_stack: &mut HashSet<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(id.to_string());
        stack.push(id.to_string());
        on_stack.insert(id.to_string());

        if let Some(node) = self.nodes.get(id) {
            for dep in &node.deps {
                if !visited.contains(dep) {
                    self.dfs_cycles(dep, visited, stack, on_stack, cycles);
                } else if on_stack.contains(dep) {
                    let start = stack.iter().position(|s| s == dep).unwrap_or(0);
                    cycles.push(stack[start..].to_vec());
                }
            }
        }

        stack.pop();
        on_stack.remove(id);
    }

    /// Kahn's algorithm; `None` when the graph has a cycle
    pub fn topological_sort(&self) -> Option<Vec<String>> {
        let mut in_degree: HashMap<&String, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (id, node.deps.len()))
            .collect();

        let mut queue: VecDeque<&String> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            if let Some(node) = self.nodes.get(id) {
                for dependent in &node.dependents {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            if let Some((key, _)) = self.nodes.get_key_value(dependent) {
                                queue.push_back(key);
                            }
                        }
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Some(order)
        } else {
            None
        }
    }
}
