use serde::{Deserialize, Serialize};

use crate::graph::NodeId;

/// Search costs are kept in fixed integer units so state ordering is exact.
/// An orthogonal move costs [`costs::ADJACENT`]; everything else scales off
/// that.
pub type Cost = u64;

pub mod costs {
    use super::Cost;

    pub const ADJACENT: Cost = 10;
    pub const DIAGONAL: Cost = 14;
    pub const STAY: Cost = 10;
    /// One joint time step under the makespan objective.
    pub const MAKESPAN_STEP: Cost = 10;
    /// Multiplier applied when either endpoint of a move is water.
    pub const WATER_PENALTY: Cost = 4;
    /// Multiplier applied when either endpoint of a move is a tree and
    /// neither is water.
    pub const TREE_PENALTY: Cost = 2;
    pub const UNREACHABLE: Cost = Cost::MAX;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostFunction {
    SumOfCosts,
    Makespan,
}

/// A location paired with the time step it is occupied at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coordinate {
    pub time_step: usize,
    pub node: NodeId,
}

impl Coordinate {
    pub fn new(time_step: usize, node: NodeId) -> Self {
        Coordinate { time_step, node }
    }

    /// The same location one step earlier, if there is one. Adjacency tests
    /// work on these shifted copies; a coordinate is never mutated in place.
    pub fn earlier(self) -> Option<Coordinate> {
        self.time_step
            .checked_sub(1)
            .map(|t| Coordinate::new(t, self.node))
    }

    /// The same location one step later.
    pub fn later(self) -> Coordinate {
        Coordinate::new(self.time_step + 1, self.node)
    }
}

/// An entity to route from `start` to `goal`. The id is the agent's position
/// in its problem instance and is re-issued as 0..n-1 whenever a sub-problem
/// is carved out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Agent {
    pub start: NodeId,
    pub goal: NodeId,
    pub id: usize,
}

/// One agent's slice of a joint state: where it is and what it has paid to
/// get there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentState {
    pub coord: Coordinate,
    pub g: Cost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConflictKind {
    Collision,
    Transposition,
    Destination,
}

/// Interference between two groups' plans. `node_1`/`node_2` are the
/// per-group locations involved; for a collision both are the shared node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub time_step: usize,
    pub group_1: usize,
    pub group_2: usize,
    pub node_1: Option<NodeId>,
    pub node_2: Option<NodeId>,
    pub kind: ConflictKind,
}

/// A time-indexed joint plan: the step at index t holds every agent's state
/// at time step t. Agents that have reached their goal are considered parked
/// on it for all later steps.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Path {
    steps: Vec<Vec<AgentState>>,
    cost: Cost,
}

impl Path {
    pub(crate) fn from_steps(steps: Vec<Vec<AgentState>>, cost: Cost) -> Self {
        Path { steps, cost }
    }

    /// Cost of the goal state this path ends in.
    pub fn cost(&self) -> Cost {
        self.cost
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn agent_count(&self) -> usize {
        self.steps.first().map_or(0, Vec::len)
    }

    pub fn step(&self, time_step: usize) -> &[AgentState] {
        &self.steps[time_step]
    }

    /// The step at `time_step`, or the final step once the path has ended.
    pub fn step_or_last(&self, time_step: usize) -> &[AgentState] {
        let clamped = time_step.min(self.steps.len() - 1);
        &self.steps[clamped]
    }

    pub fn last_step(&self) -> &[AgentState] {
        self.steps.last().expect("empty path")
    }

    /// Node occupied by the path's `agent_pos`-th agent at `time_step`,
    /// parking it at its final location past the end.
    pub fn node_at(&self, agent_pos: usize, time_step: usize) -> NodeId {
        self.step_or_last(time_step)[agent_pos].coord.node
    }

    pub fn steps(&self) -> &[Vec<AgentState>] {
        &self.steps
    }
}

/// Scan a set of paths for the earliest conflict, lowest pair index first on
/// ties. Parked agents keep occupying their final node.
pub fn first_conflict(paths: &[Path]) -> Option<Conflict> {
    let horizon = paths.iter().map(Path::len).max().unwrap_or(0);
    for time_step in 1..horizon {
        for i in 0..paths.len() {
            for j in (i + 1)..paths.len() {
                if let Some(conflict) = conflict_at(paths, i, j, time_step) {
                    return Some(conflict);
                }
            }
        }
    }
    None
}

/// Earliest conflict involving the path at `index`, for the independence
/// detection scan loop.
pub(crate) fn first_conflict_with(paths: &[Path], index: usize) -> Option<Conflict> {
    let horizon = paths.iter().map(Path::len).max().unwrap_or(0);
    for time_step in 1..horizon {
        for other in 0..paths.len() {
            if other == index {
                continue;
            }
            let (i, j) = (index.min(other), index.max(other));
            if let Some(conflict) = conflict_at(paths, i, j, time_step) {
                return Some(conflict);
            }
        }
    }
    None
}

fn conflict_at(paths: &[Path], i: usize, j: usize, time_step: usize) -> Option<Conflict> {
    let step_i = paths[i].step_or_last(time_step);
    let step_j = paths[j].step_or_last(time_step);

    for a in step_i {
        for b in step_j {
            if a.coord.node == b.coord.node {
                let parked = time_step >= paths[i].len() || time_step >= paths[j].len();
                return Some(Conflict {
                    time_step,
                    group_1: i,
                    group_2: j,
                    node_1: Some(a.coord.node),
                    node_2: Some(b.coord.node),
                    kind: if parked {
                        ConflictKind::Destination
                    } else {
                        ConflictKind::Collision
                    },
                });
            }
        }
    }

    let prev_i = paths[i].step_or_last(time_step - 1);
    let prev_j = paths[j].step_or_last(time_step - 1);
    for (ai, a) in step_i.iter().enumerate() {
        for (bj, b) in step_j.iter().enumerate() {
            let a_prev = prev_i[ai].coord.node;
            let b_prev = prev_j[bj].coord.node;
            if a.coord.node == b_prev && b.coord.node == a_prev && a.coord.node != a_prev {
                return Some(Conflict {
                    time_step,
                    group_1: i,
                    group_2: j,
                    node_1: Some(a.coord.node),
                    node_2: Some(b.coord.node),
                    kind: ConflictKind::Transposition,
                });
            }
        }
    }

    None
}

/// Merge per-group paths into one joint path, padding shorter paths with
/// their parked final states. Step coordinates are re-stamped so the entry
/// at index t carries time step t.
pub fn merge_paths(paths: &[Path]) -> Path {
    let horizon = paths.iter().map(Path::len).max().unwrap_or(0);
    let mut steps = Vec::with_capacity(horizon);
    for time_step in 0..horizon {
        let mut joint = Vec::new();
        for path in paths {
            for agent in path.step_or_last(time_step) {
                joint.push(AgentState {
                    coord: Coordinate::new(time_step, agent.coord.node),
                    g: agent.g,
                });
            }
        }
        steps.push(joint);
    }
    let cost = paths.iter().map(Path::cost).sum();
    Path::from_steps(steps, cost)
}

/// Test assertion shared across the solver suites: every step is properly
/// time-stamped, every per-agent move is a legal graph step or a wait, and
/// no two agents collide or swap.
#[cfg(test)]
pub(crate) fn assert_joint_path_valid(path: &Path, graph: &crate::graph::Graph) {
    for (time_step, step) in path.steps().iter().enumerate() {
        for (i, a) in step.iter().enumerate() {
            assert_eq!(a.coord.time_step, time_step, "mis-stamped step");
            for b in &step[i + 1..] {
                assert_ne!(
                    a.coord.node, b.coord.node,
                    "two agents share node {} at t={time_step}",
                    a.coord.node
                );
            }
        }
        if time_step == 0 {
            continue;
        }
        let previous = path.step(time_step - 1);
        for (i, a) in step.iter().enumerate() {
            let from = previous[i].coord.node;
            let to = a.coord.node;
            let legal = from == to || graph.node(from).neighbors().any(|n| n == to);
            assert!(legal, "illegal move {from} -> {to} at t={time_step}");
            for (j, b) in step.iter().enumerate().skip(i + 1) {
                let swapped =
                    a.coord.node == previous[j].coord.node && b.coord.node == from;
                assert!(!swapped, "agents {i} and {j} swap at t={time_step}");
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn single_path(nodes: &[NodeId]) -> Path {
    let steps = nodes
        .iter()
        .enumerate()
        .map(|(t, &node)| {
            vec![AgentState {
                coord: Coordinate::new(t, node),
                g: (t as Cost) * costs::ADJACENT,
            }]
        })
        .collect();
    let cost = (nodes.len() as Cost - 1) * costs::ADJACENT;
    Path::from_steps(steps, cost)
}
