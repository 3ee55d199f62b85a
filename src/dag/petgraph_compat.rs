//! Optional conversion from a [`super::Dag`] to a `petgraph` graph, for
//! embedders that want petgraph's algorithm library (cycle detection,
//! condensation, etc.) or a DOT export for visualization.
//!
//! Gated behind the `petgraph-compat` feature so the dependency is not
//! carried by default.

use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::FxHashMap;

use super::Dag;
use crate::step::StepRegistry;
use crate::types::StepId;

/// Edge weight distinguishing which edge set a petgraph edge came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    Success,
    Failure,
}

pub type StepDiGraph = DiGraph<StepId, EdgeKind>;

/// A converted graph plus the `StepId -> NodeIndex` lookup needed to run
/// petgraph algorithms against specific steps.
#[derive(Debug, Clone)]
pub struct PetgraphConversion {
    pub graph: StepDiGraph,
    pub index_map: FxHashMap<StepId, NodeIndex>,
}

impl PetgraphConversion {
    #[must_use]
    pub fn index_of(&self, step: StepId) -> Option<NodeIndex> {
        self.index_map.get(&step).copied()
    }
}

impl Dag {
    /// Convert to a petgraph `DiGraph`, with both success and failure edges
    /// present (distinguished by [`EdgeKind`]). Steps from `all_steps` with
    /// no edges at all still get a node, so isolated roots are not dropped.
    #[must_use]
    pub fn to_petgraph(&self, all_steps: &[StepId]) -> PetgraphConversion {
        let mut graph = StepDiGraph::new();
        let mut index_map = FxHashMap::default();

        let mut ordered = all_steps.to_vec();
        ordered.sort();
        for step in ordered {
            let idx = graph.add_node(step);
            index_map.insert(step, idx);
        }

        for (from, to) in &self.success_edges {
            let from_idx = *index_map.entry(*from).or_insert_with(|| graph.add_node(*from));
            let to_idx = *index_map.entry(*to).or_insert_with(|| graph.add_node(*to));
            graph.add_edge(from_idx, to_idx, EdgeKind::Success);
        }
        for (from, to) in &self.failure_edges {
            let from_idx = *index_map.entry(*from).or_insert_with(|| graph.add_node(*from));
            let to_idx = *index_map.entry(*to).or_insert_with(|| graph.add_node(*to));
            graph.add_edge(from_idx, to_idx, EdgeKind::Failure);
        }

        PetgraphConversion { graph, index_map }
    }

    /// Export to DOT, labeling nodes by step name (via `registry`) and
    /// styling failure edges distinctly from success edges so the rendered
    /// graph reads the same way the rule table treats them.
    #[must_use]
    pub fn to_dot(&self, registry: &StepRegistry) -> String {
        let all_steps = registry.ids_in_order();
        let conversion = self.to_petgraph(all_steps);
        let mut out = String::from("digraph {\n");
        for step in all_steps {
            let name = registry.get(*step).map(|d| d.name.clone()).unwrap_or_default();
            out.push_str(&format!("    {} [ label = \"{name}\" ]\n", step.value()));
        }
        for edge in conversion.graph.edge_indices() {
            let (from, to) = conversion.graph.edge_endpoints(edge).unwrap();
            let kind = conversion.graph[edge];
            let from_step = conversion.graph[from];
            let to_step = conversion.graph[to];
            let style = match kind {
                EdgeKind::Success => "",
                EdgeKind::Failure => " [ style = dashed, color = red ]",
            };
            out.push_str(&format!("    {} -> {}{style}\n", from_step.value(), to_step.value()));
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepContext, StepFn, StepOutcome};
    use async_trait::async_trait;
    use serde_json::json;

    struct Noop;
    #[async_trait]
    impl StepFn for Noop {
        async fn call(&self, _ctx: StepContext) -> StepOutcome {
            Ok(json!(null))
        }
    }

    #[test]
    fn converts_edges_and_preserves_kind() {
        let mut registry = StepRegistry::new();
        let a = registry.add_step("a", Noop);
        let b = registry.add_step("b", Noop);
        let c = registry.add_step("c", Noop);
        let dag = Dag::new(vec![(a, b)], vec![(a, c)]);

        let conversion = dag.to_petgraph(&[a, b, c]);
        assert_eq!(conversion.graph.node_count(), 3);
        assert_eq!(conversion.graph.edge_count(), 2);

        let dot = dag.to_dot(&registry);
        assert!(dot.contains("label = \"a\""));
        assert!(dot.contains("style = dashed"));
    }
}
