// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Project graph: validation, topological ranks, and traversal helpers.

use crate::error::{EngineError, Result};
use crate::model::{Edge, ProjectDefinition};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Validated graph view over a [`ProjectDefinition`].
///
/// Nodes are *units*: plain steps and block groups alike. Edges may
/// connect steps to groups (a group is entered through edges into it and
/// left through its `out` / `error` ports), so both id spaces share one
/// graph.
#[derive(Debug, Clone)]
pub struct ProjectGraph {
    graph: DiGraph<Uuid, ()>,
    nodes: HashMap<Uuid, NodeIndex>,
    ranks: HashMap<Uuid, usize>,
    edges: Vec<Edge>,
}

impl ProjectGraph {
    /// Builds and validates the graph for a definition.
    ///
    /// Checks the definition shape, edge endpoints, and acyclicity.
    pub fn build(definition: &ProjectDefinition) -> Result<Self> {
        definition.validate_shape()?;

        let mut graph = DiGraph::new();
        let mut nodes =
            HashMap::with_capacity(definition.steps.len() + definition.groups.len());
        for step in &definition.steps {
            nodes.insert(step.id, graph.add_node(step.id));
        }
        for group in &definition.groups {
            nodes.insert(group.id, graph.add_node(group.id));
        }

        for edge in &definition.edges {
            let source = nodes.get(&edge.source_step_id).ok_or_else(|| {
                EngineError::validation(format!(
                    "edge {} references unknown source step {}",
                    edge.id, edge.source_step_id
                ))
            })?;
            let target = nodes.get(&edge.target_step_id).ok_or_else(|| {
                EngineError::validation(format!(
                    "edge {} references unknown target step {}",
                    edge.id, edge.target_step_id
                ))
            })?;
            graph.add_edge(*source, *target, ());
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            let step = graph[cycle.node_id()];
            EngineError::validation(format!("project graph has a cycle involving step {}", step))
        })?;
        let ranks = order
            .iter()
            .enumerate()
            .map(|(rank, idx)| (graph[*idx], rank))
            .collect();

        Ok(Self {
            graph,
            nodes,
            ranks,
            edges: definition.edges.clone(),
        })
    }

    /// Topological rank of a step; used to order fan-in merges
    /// deterministically.
    pub fn rank(&self, step_id: Uuid) -> usize {
        self.ranks.get(&step_id).copied().unwrap_or(usize::MAX)
    }

    /// Edges leaving a step.
    pub fn outgoing(&self, step_id: Uuid) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| e.source_step_id == step_id)
            .collect()
    }

    /// Edges entering a step.
    pub fn incoming(&self, step_id: Uuid) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| e.target_step_id == step_id)
            .collect()
    }

    /// Every step reachable from `start`, inclusive.
    pub fn reachable_from(&self, start: Uuid) -> HashSet<Uuid> {
        let mut reachable = HashSet::new();
        let Some(&start_idx) = self.nodes.get(&start) else {
            return reachable;
        };
        let mut bfs = Bfs::new(&self.graph, start_idx);
        while let Some(idx) = bfs.next(&self.graph) {
            reachable.insert(self.graph[idx]);
        }
        reachable
    }

    /// Steps with no outgoing edges among `candidates`, ordered by rank.
    pub fn terminals(&self, candidates: &HashSet<Uuid>) -> Vec<Uuid> {
        let mut terminals: Vec<Uuid> = candidates
            .iter()
            .filter(|id| {
                self.outgoing(**id)
                    .iter()
                    .all(|e| !candidates.contains(&e.target_step_id))
            })
            .copied()
            .collect();
        terminals.sort_by_key(|id| self.rank(*id));
        terminals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Position, Project, ProjectStatus, Step, StepType, TriggerType};
    use serde_json::json;

    fn step(project_id: Uuid, name: &str, step_type: StepType) -> Step {
        let trigger_type = if step_type == StepType::Start {
            Some(TriggerType::Manual)
        } else {
            None
        };
        Step {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            step_type,
            config: json!({}),
            trigger_type,
            trigger_config: None,
            block_group_id: None,
            position: Position::default(),
            block_definition_id: None,
            retry: None,
            timeout_ms: None,
        }
    }

    fn edge(project_id: Uuid, source: Uuid, target: Uuid) -> Edge {
        Edge {
            id: Uuid::new_v4(),
            project_id,
            source_step_id: source,
            target_step_id: target,
            source_port: None,
            condition: None,
        }
    }

    fn definition(steps: Vec<Step>, edges: Vec<Edge>) -> ProjectDefinition {
        let project_id = steps.first().map(|s| s.project_id).unwrap_or_else(Uuid::new_v4);
        ProjectDefinition {
            project: Project {
                id: project_id,
                tenant_id: Uuid::new_v4(),
                name: "demo".into(),
                status: ProjectStatus::Published,
                version: 1,
                variables: json!({}),
                run_timeout_ms: None,
            },
            steps,
            edges,
            groups: vec![],
        }
    }

    #[test]
    fn test_linear_chain_ranks() {
        let project_id = Uuid::new_v4();
        let a = step(project_id, "a", StepType::Start);
        let b = step(project_id, "b", StepType::Code);
        let c = step(project_id, "c", StepType::Code);
        let edges = vec![
            edge(project_id, a.id, b.id),
            edge(project_id, b.id, c.id),
        ];
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        let graph = ProjectGraph::build(&definition(vec![a, b, c], edges)).unwrap();
        assert!(graph.rank(a_id) < graph.rank(b_id));
        assert!(graph.rank(b_id) < graph.rank(c_id));
    }

    #[test]
    fn test_cycle_rejected() {
        let project_id = Uuid::new_v4();
        let a = step(project_id, "a", StepType::Start);
        let b = step(project_id, "b", StepType::Code);
        let edges = vec![
            edge(project_id, a.id, b.id),
            edge(project_id, b.id, a.id),
        ];
        let err = ProjectGraph::build(&definition(vec![a, b], edges)).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let project_id = Uuid::new_v4();
        let a = step(project_id, "a", StepType::Start);
        let edges = vec![edge(project_id, a.id, Uuid::new_v4())];
        assert!(ProjectGraph::build(&definition(vec![a], edges)).is_err());
    }

    #[test]
    fn test_reachability_ignores_disconnected() {
        let project_id = Uuid::new_v4();
        let a = step(project_id, "a", StepType::Start);
        let b = step(project_id, "b", StepType::Code);
        let island = step(project_id, "island", StepType::Code);
        let edges = vec![edge(project_id, a.id, b.id)];
        let (a_id, b_id, island_id) = (a.id, b.id, island.id);
        let graph = ProjectGraph::build(&definition(vec![a, b, island], edges)).unwrap();
        let reachable = graph.reachable_from(a_id);
        assert!(reachable.contains(&a_id));
        assert!(reachable.contains(&b_id));
        assert!(!reachable.contains(&island_id));
    }

    #[test]
    fn test_terminals() {
        let project_id = Uuid::new_v4();
        let a = step(project_id, "a", StepType::Start);
        let b = step(project_id, "b", StepType::Code);
        let c = step(project_id, "c", StepType::Code);
        let edges = vec![
            edge(project_id, a.id, b.id),
            edge(project_id, a.id, c.id),
        ];
        let (b_id, c_id) = (b.id, c.id);
        let graph = ProjectGraph::build(&definition(vec![a, b, c], edges)).unwrap();
        let all: HashSet<Uuid> = graph.reachable_from(graph.edges[0].source_step_id);
        let terminals = graph.terminals(&all);
        assert_eq!(terminals.len(), 2);
        assert!(terminals.contains(&b_id));
        assert!(terminals.contains(&c_id));
    }
}
