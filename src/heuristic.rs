use std::collections::HashMap;

use tracing::debug;

use crate::common::{Agent, Cost};
use crate::graph::NodeId;
use crate::problem::ProblemInstance;
use crate::solver::astar::BreadthFirstSearch;

/// Per-goal true-distance lookup. For every distinct goal in a problem
/// instance one outward uniform-cost sweep is run from the goal with no goal
/// test, and every reached node's exact cost is recorded; lookups are then
/// O(1). Move costs are symmetric, so the reverse sweep yields forward
/// distances, making the table an exact (and therefore admissible) bound
/// under the terrain-weighted cost model.
#[derive(Debug)]
pub struct TDHeuristic {
    tables: HashMap<NodeId, Vec<Cost>>,
}

impl TDHeuristic {
    pub fn new(problem: &ProblemInstance) -> Self {
        let mut tables = HashMap::new();
        let mut sweep = BreadthFirstSearch::new();
        for agent in problem.agents() {
            if tables.contains_key(&agent.goal) {
                continue;
            }
            let rooted = ProblemInstance::new(
                problem.graph().clone(),
                vec![Agent {
                    start: agent.goal,
                    goal: agent.goal,
                    id: 0,
                }],
            )
            .expect("single-agent sweep problem is always valid");
            tables.insert(agent.goal, sweep.sweep(&rooted));
        }
        debug!("computed true-distance tables for {} goals", tables.len());
        TDHeuristic { tables }
    }

    /// Exact cost from `node` to `goal`, [`costs::UNREACHABLE`] when no path
    /// exists. Panics if the table was never computed for `goal`; sub-problems
    /// must only reuse tables whose goal set covers theirs.
    pub fn true_distance(&self, node: NodeId, goal: NodeId) -> Cost {
        let table = self
            .tables
            .get(&goal)
            .unwrap_or_else(|| panic!("no true-distance table for goal {goal}"));
        table[node]
    }

    pub fn covers(&self, goal: NodeId) -> bool {
        self.tables.contains_key(&goal)
    }
}
