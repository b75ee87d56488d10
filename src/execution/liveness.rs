use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{Error, Result};
use crate::model::NetDef;

/// Per-step tensor liveness of a compiled net.
///
/// Built once per graph: the step at which each tensor is last read decides
/// when it can be removed. Constants and the net's declared inputs and
/// outputs are never reported dead.
#[derive(Debug, Clone)]
pub struct LivenessPlan {
    /// Operator indices (into `NetDef::ops`) in execution order
    order: Vec<usize>,
    /// Last step at which each tensor is used
    last_use: HashMap<String, usize>,
    always_live: HashSet<String>,
}

impl LivenessPlan {
    pub fn from_net(net: &NetDef) -> Result<Self> {
        let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(net.ops.len(), 0);
        let nodes: Vec<NodeIndex> = (0..net.ops.len()).map(|i| graph.add_node(i)).collect();

        let mut producers: HashMap<&str, usize> = HashMap::new();
        for (index, op) in net.ops.iter().enumerate() {
            for output in &op.outputs {
                if let Some(previous) = producers.insert(output.as_str(), index) {
                    return Err(Error::InvalidGraph(format!(
                        "Tensor '{}' is produced by both '{}' and '{}'",
                        output, net.ops[previous].name, op.name
                    )));
                }
            }
        }

        for (index, op) in net.ops.iter().enumerate() {
            for input in op.inputs.iter().filter(|i| !i.is_empty()) {
                if let Some(&producer) = producers.get(input.as_str()) {
                    graph.update_edge(nodes[producer], nodes[index], ());
                }
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            let op = &net.ops[graph[cycle.node_id()]];
            Error::InvalidGraph(format!("Cycle detected in graph at operator '{}'", op.name))
        })?;

        // Keep the compiler's order when it is already valid
        let declared_is_valid = net.ops.iter().enumerate().all(|(index, op)| {
            op.inputs
                .iter()
                .filter_map(|input| producers.get(input.as_str()))
                .all(|&producer| producer < index)
        });
        let order: Vec<usize> = if declared_is_valid {
            (0..net.ops.len()).collect()
        } else {
            sorted.into_iter().map(|node| graph[node]).collect()
        };

        let mut last_use = HashMap::new();
        for (step, &index) in order.iter().enumerate() {
            let op = &net.ops[index];
            for input in op.inputs.iter().filter(|i| !i.is_empty()) {
                last_use.insert(input.clone(), step);
            }
            for output in &op.outputs {
                last_use.entry(output.clone()).or_insert(step);
            }
        }

        let always_live = net
            .tensors
            .iter()
            .map(|t| t.name.clone())
            .chain(net.input_info.iter().map(|i| i.name.clone()))
            .chain(net.output_info.iter().map(|o| o.name.clone()))
            .collect();

        Ok(Self {
            order,
            last_use,
            always_live,
        })
    }

    /// Operator indices in execution order
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn num_steps(&self) -> usize {
        self.order.len()
    }

    /// Step at which a tensor is last read
    pub fn last_use(&self, tensor: &str) -> Option<usize> {
        self.last_use.get(tensor).copied()
    }

    pub fn is_always_live(&self, tensor: &str) -> bool {
        self.always_live.contains(tensor)
    }

    /// Graph tensors still needed once `step` has run
    pub fn live_after(&self, step: usize) -> HashSet<String> {
        self.last_use
            .iter()
            .filter(|(_, last)| **last > step)
            .map(|(name, _)| name.clone())
            .chain(self.always_live.iter().cloned())
            .collect()
    }
}
