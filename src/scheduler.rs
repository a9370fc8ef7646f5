//! Tier-based scheduling.
//!
//! Tasks carry a tier; tier N+1 starts only after every tier N task of the
//! run is done. Within a tier there is no ordering.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::task::{Task, TaskId};
use crate::{Error, Result};

/// Tasks that may start now.
///
/// A task that is not yet in `completed` is runnable iff every task of a
/// strictly lower tier is in `completed`. Untiered tasks count as tier 0.
pub fn runnable<'a>(tasks: &'a [Task], completed: &HashSet<TaskId>) -> Vec<&'a Task> {
    let Some(barrier) = tasks
        .iter()
        .filter(|t| !completed.contains(&t.id))
        .map(Task::effective_tier)
        .min()
    else {
        return Vec::new();
    };

    tasks
        .iter()
        .filter(|t| !completed.contains(&t.id) && t.effective_tier() <= barrier)
        .collect()
}

/// Tier assignment for a set of tasks.
///
/// Explicit tiers are kept. Tasks without one are placed one tier after
/// their deepest dependency (or tier 0). Dependencies on tasks outside the
/// set are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierPlan {
    tiers: BTreeMap<u32, Vec<TaskId>>,
    assigned: HashMap<TaskId, u32>,
}

impl TierPlan {
    /// # Errors
    /// `Error::DependencyCycle` when dependencies form a cycle, and
    /// `Error::Validation` when an explicit tier does not sit above the
    /// tiers of its dependencies.
    pub fn build(tasks: &[Task]) -> Result<Self> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut index: HashMap<&TaskId, NodeIndex> = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            index.insert(&task.id, graph.add_node(i));
        }
        for task in tasks {
            for dep in &task.depends_on {
                match index.get(dep) {
                    Some(&from) => {
                        graph.add_edge(from, index[&task.id], ());
                    }
                    None => debug!(task = %task.id, dep = %dep, "dependency outside run ignored"),
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            let id = graph
                .node_weight(cycle.node_id())
                .map(|&i| tasks[i].id.to_string())
                .unwrap_or_default();
            Error::DependencyCycle(id)
        })?;

        let mut assigned: HashMap<TaskId, u32> = HashMap::new();
        for node in order {
            let task = &tasks[graph[node]];
            let deepest = graph
                .neighbors_directed(node, petgraph::Direction::Incoming)
                .filter_map(|dep| assigned.get(&tasks[graph[dep]].id).copied())
                .max();

            let tier = match (task.tier, deepest) {
                (Some(explicit), Some(dep_tier)) if explicit <= dep_tier => {
                    return Err(Error::Validation(format!(
                        "task {} is in tier {} but depends on a task in tier {}",
                        task.id, explicit, dep_tier
                    )));
                }
                (Some(explicit), _) => explicit,
                (None, Some(dep_tier)) => dep_tier + 1,
                (None, None) => 0,
            };
            assigned.insert(task.id.clone(), tier);
        }

        // Group in store order so each tier lists tasks as the backlog does
        let mut tiers: BTreeMap<u32, Vec<TaskId>> = BTreeMap::new();
        for task in tasks {
            if let Some(&tier) = assigned.get(&task.id) {
                tiers.entry(tier).or_default().push(task.id.clone());
            }
        }

        Ok(Self { tiers, assigned })
    }

    pub fn tier_of(&self, id: &TaskId) -> Option<u32> {
        self.assigned.get(id).copied()
    }

    pub fn tiers(&self) -> &BTreeMap<u32, Vec<TaskId>> {
        &self.tiers
    }

    /// All task ids ordered by (tier, store order).
    pub fn ordered_ids(&self) -> Vec<TaskId> {
        self.tiers.values().flatten().cloned().collect()
    }

    /// Write the planned tiers into `tasks`.
    pub fn apply(&self, tasks: &mut [Task]) {
        for task in tasks.iter_mut() {
            if let Some(tier) = self.tier_of(&task.id) {
                task.tier = Some(tier);
            }
        }
    }
}
