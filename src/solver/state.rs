use crate::common::{costs, AgentState, Coordinate, Cost, CostFunction};
use crate::graph::{positions, Graph, NodeId, Terrain};
use crate::heuristic::TDHeuristic;
use crate::problem::ProblemInstance;

/// Handle into a [`StateArena`]. States form a persistent backpointer tree;
/// many successors may share one predecessor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct StateId(pub usize);

/// Joint agent configuration at one time step, dispatched by tag.
#[derive(Debug, Clone)]
pub(crate) enum StateKind {
    /// One agent's coordinate; used by single-agent search and the
    /// heuristic sweep.
    Single(AgentState),
    /// Every agent's state for one joint time step.
    Multi(Vec<AgentState>),
    /// A joint step mid-assignment: agents before `move_next` have already
    /// moved this step, the rest still sit at the previous one.
    Od {
        agents: Vec<AgentState>,
        move_next: usize,
    },
}

impl StateKind {
    pub fn agent_states(&self) -> &[AgentState] {
        match self {
            StateKind::Single(agent) => std::slice::from_ref(agent),
            StateKind::Multi(agents) | StateKind::Od { agents, .. } => agents,
        }
    }

    pub fn time_step(&self) -> usize {
        self.agent_states()[0].coord.time_step
    }

    /// Operator-decomposition intermediates never enter the closed list.
    pub fn closed_eligible(&self) -> bool {
        !matches!(self, StateKind::Od { move_next, .. } if *move_next != 0)
    }

    pub fn goal_test(&self, problem: &ProblemInstance) -> bool {
        match self {
            StateKind::Od { move_next, .. } if *move_next != 0 => false,
            _ => self
                .agent_states()
                .iter()
                .enumerate()
                .all(|(pos, agent)| agent.coord.node == problem.goal_node(pos)),
        }
    }

    /// Sum of the agents' true-distance estimates.
    pub fn heuristic(&self, problem: &ProblemInstance, table: &TDHeuristic) -> Cost {
        self.agent_states()
            .iter()
            .enumerate()
            .fold(0, |acc: Cost, (pos, agent)| {
                acc.saturating_add(table.true_distance(agent.coord.node, problem.goal_node(pos)))
            })
    }

    /// Closed-list identity: per-agent coordinates, with the time component
    /// dropped once past the reservation horizon so each node keeps a single
    /// permanent post-horizon entry.
    pub fn closed_key(&self, horizon: usize) -> ClosedKey {
        let cells = self
            .agent_states()
            .iter()
            .map(|agent| {
                let time = (agent.coord.time_step <= horizon).then_some(agent.coord.time_step);
                (agent.coord.node, time)
            })
            .collect();
        let committed = match self {
            StateKind::Od { move_next, .. } => *move_next,
            _ => 0,
        };
        ClosedKey { cells, committed }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ClosedKey {
    cells: Vec<(NodeId, Option<usize>)>,
    committed: usize,
}

impl ClosedKey {
    /// The node of a single-agent key, for reading a sweep's results back
    /// out of the closed list.
    pub fn single_node(&self) -> Option<NodeId> {
        (self.cells.len() == 1).then(|| self.cells[0].0)
    }
}

#[derive(Debug)]
pub(crate) struct StateEntry {
    pub pred: Option<StateId>,
    pub g: Cost,
    pub h: Cost,
    pub violations: usize,
    pub kind: StateKind,
}

/// Arena backing one solve. Predecessors are stored as handles, so path
/// reconstruction is a handle walk and no state ever owns another.
#[derive(Debug, Default)]
pub(crate) struct StateArena {
    entries: Vec<StateEntry>,
}

impl StateArena {
    pub fn alloc(&mut self, entry: StateEntry) -> StateId {
        self.entries.push(entry);
        StateId(self.entries.len() - 1)
    }

    pub fn get(&self, id: StateId) -> &StateEntry {
        &self.entries[id.0]
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A successor produced by expansion, not yet admitted to the arena. The
/// `moves` are the (predecessor, coordinate) pairs the engine validates
/// against the reservation and scores against the avoidance table.
#[derive(Debug)]
pub(crate) struct Candidate {
    pub kind: StateKind,
    pub g: Cost,
    pub pred: Option<StateId>,
    pub moves: Vec<(Option<Coordinate>, Coordinate)>,
}

pub(crate) fn agent_root(problem: &ProblemInstance, agent_pos: usize) -> AgentState {
    AgentState {
        coord: Coordinate::new(0, problem.agents()[agent_pos].start),
        g: 0,
    }
}

/// Cost of stepping between two adjacent nodes through the given
/// directional slot.
pub(crate) fn move_cost(graph: &Graph, from: NodeId, to: NodeId, position: usize) -> Cost {
    let base = if positions::is_diagonal(position) {
        costs::DIAGONAL
    } else {
        costs::ADJACENT
    };
    match (graph.node(from).terrain(), graph.node(to).terrain()) {
        (Terrain::Water, _) | (_, Terrain::Water) => base * costs::WATER_PENALTY,
        (Terrain::Tree, _) | (_, Terrain::Tree) => base * costs::TREE_PENALTY,
        _ => base,
    }
}

/// Wait-in-place plus every reachable neighbor. Waiting is free once the
/// agent sits on its goal; everything else pays the terrain-weighted move
/// cost.
fn agent_successors(
    problem: &ProblemInstance,
    agent_pos: usize,
    current: AgentState,
) -> Vec<AgentState> {
    let graph = problem.graph();
    let node = graph.node(current.coord.node);
    let goal = problem.goal_node(agent_pos);

    let wait_cost = if current.coord.node == goal {
        0
    } else {
        costs::STAY
    };
    let mut result = vec![AgentState {
        coord: current.coord.later(),
        g: current.g + wait_cost,
    }];

    for position in 0..graph.connectedness().degree() {
        if !graph.is_reachable(current.coord.node, position) {
            continue;
        }
        let neighbor = node
            .neighbor(position)
            .expect("reachable neighbor must exist");
        result.push(AgentState {
            coord: Coordinate::new(current.coord.time_step + 1, neighbor),
            g: current.g + move_cost(graph, current.coord.node, neighbor, position),
        });
    }
    result
}

/// Expand a state into its legal successors. Reservation filtering happens
/// in the engine; this only enforces the joint-state rules (no two agents on
/// one node, no swaps within the step).
pub(crate) fn expand(
    arena: &StateArena,
    id: StateId,
    problem: &ProblemInstance,
    cost_function: CostFunction,
) -> Vec<Candidate> {
    let entry = arena.get(id);
    match &entry.kind {
        StateKind::Single(agent) => agent_successors(problem, 0, *agent)
            .into_iter()
            .map(|successor| Candidate {
                moves: vec![(Some(agent.coord), successor.coord)],
                kind: StateKind::Single(successor),
                g: successor.g,
                pred: Some(id),
            })
            .collect(),
        StateKind::Multi(agents) => expand_multi(agents, problem, cost_function, entry.g, id),
        StateKind::Od { agents, move_next } => {
            expand_od(arena, entry, agents, *move_next, problem, id)
        }
    }
}

fn expand_multi(
    current: &[AgentState],
    problem: &ProblemInstance,
    cost_function: CostFunction,
    current_g: Cost,
    id: StateId,
) -> Vec<Candidate> {
    let per_agent: Vec<Vec<AgentState>> = (0..current.len())
        .map(|pos| agent_successors(problem, pos, current[pos]))
        .collect();

    let mut result = Vec::new();
    let mut branch: Vec<AgentState> = Vec::with_capacity(current.len());
    assemble(current, &per_agent, &mut branch, &mut |assignment| {
        let g = match cost_function {
            CostFunction::SumOfCosts => assignment.iter().map(|a| a.g).sum(),
            CostFunction::Makespan => current_g + costs::MAKESPAN_STEP,
        };
        let moves = current
            .iter()
            .zip(assignment.iter())
            .map(|(before, after)| (Some(before.coord), after.coord))
            .collect();
        result.push(Candidate {
            kind: StateKind::Multi(assignment.to_vec()),
            g,
            pred: Some(id),
            moves,
        });
    });
    result
}

/// Depth-first Cartesian join over per-agent successors, pruning a branch as
/// soon as an assignment collides or swaps with an earlier one.
fn assemble(
    current: &[AgentState],
    per_agent: &[Vec<AgentState>],
    branch: &mut Vec<AgentState>,
    emit: &mut impl FnMut(&[AgentState]),
) {
    let agent_pos = branch.len();
    if agent_pos == per_agent.len() {
        emit(branch);
        return;
    }
    'candidates: for candidate in &per_agent[agent_pos] {
        for (other_pos, other) in branch.iter().enumerate() {
            if other.coord.node == candidate.coord.node {
                continue 'candidates;
            }
            let swapped = candidate.coord.node == current[other_pos].coord.node
                && other.coord.node == current[agent_pos].coord.node;
            if swapped {
                continue 'candidates;
            }
        }
        branch.push(*candidate);
        assemble(current, per_agent, branch, emit);
        branch.pop();
    }
}

/// Commit one agent's move, producing intermediate states until every agent
/// in the step has moved. Backpointers skip intermediates so reconstructed
/// paths contain only full states.
fn expand_od(
    arena: &StateArena,
    entry: &StateEntry,
    agents: &[AgentState],
    move_next: usize,
    problem: &ProblemInstance,
    id: StateId,
) -> Vec<Candidate> {
    let moving = agents[move_next];

    // If an already-moved agent now occupies our current node, stepping into
    // the node it came from would be a swap.
    let restricted: Option<NodeId> = agents
        .iter()
        .position(|a| a.coord.node == moving.coord.node)
        .filter(|&idx| idx < move_next)
        .and_then(|idx| {
            entry.pred.map(|pred| {
                arena.get(pred).kind.agent_states()[idx].coord.node
            })
        });

    let backpointer = if move_next != 0 { entry.pred } else { Some(id) };
    let next_move = (move_next + 1) % agents.len();

    let mut result = Vec::new();
    for successor in agent_successors(problem, move_next, moving) {
        if restricted == Some(successor.coord.node) {
            continue;
        }
        // Already-moved agents may not be collided with; not-yet-moved ones
        // will vacate (or clash when they commit).
        let occupied = agents
            .iter()
            .position(|a| a.coord.node == successor.coord.node)
            .is_some_and(|idx| idx < move_next);
        if occupied {
            continue;
        }

        let mut assignment = agents.to_vec();
        assignment[move_next] = successor;
        let g = assignment.iter().map(|a| a.g).sum();
        result.push(Candidate {
            kind: StateKind::Od {
                agents: assignment,
                move_next: next_move,
            },
            g,
            pred: backpointer,
            moves: vec![(Some(moving.coord), successor.coord)],
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Agent;
    use crate::graph::{grids, Connectedness};
    use std::rc::Rc;

    fn problem(graph: Rc<crate::graph::Graph>, agents: Vec<Agent>) -> ProblemInstance {
        ProblemInstance::new(graph, agents).unwrap()
    }

    fn single_problem(start: NodeId, goal: NodeId) -> ProblemInstance {
        problem(
            grids::open_grid(3, 3, Connectedness::Four),
            vec![Agent { start, goal, id: 0 }],
        )
    }

    #[test]
    fn test_wait_is_free_only_at_goal() {
        let at_goal = single_problem(1, 0);
        let parked = AgentState {
            coord: Coordinate::new(2, 0),
            g: costs::ADJACENT,
        };
        let successors = agent_successors(&at_goal, 0, parked);
        assert_eq!(successors[0].coord, Coordinate::new(3, 0));
        assert_eq!(successors[0].g, costs::ADJACENT);

        let wandering = AgentState {
            coord: Coordinate::new(2, 4),
            g: costs::ADJACENT,
        };
        let successors = agent_successors(&at_goal, 0, wandering);
        assert_eq!(successors[0].g, costs::ADJACENT + costs::STAY);
    }

    #[test]
    fn test_corner_has_wait_plus_two_moves() {
        let corner = single_problem(0, 8);
        let root = agent_root(&corner, 0);
        let successors = agent_successors(&corner, 0, root);
        assert_eq!(successors.len(), 3);
    }

    #[test]
    fn test_multi_expansion_prunes_collisions_and_swaps() {
        // Two agents facing each other on a 2x1 corridor: the only legal
        // joint move is both waiting; swapping and stacking are pruned.
        let graph = grids::open_grid(2, 1, Connectedness::Four);
        let p = problem(
            graph,
            vec![
                Agent {
                    start: 0,
                    goal: 1,
                    id: 0,
                },
                Agent {
                    start: 1,
                    goal: 0,
                    id: 1,
                },
            ],
        );
        let mut arena = StateArena::default();
        let roots = vec![agent_root(&p, 0), agent_root(&p, 1)];
        let id = arena.alloc(StateEntry {
            pred: None,
            g: 0,
            h: 0,
            violations: 0,
            kind: StateKind::Multi(roots),
        });
        let candidates = expand(&arena, id, &p, CostFunction::SumOfCosts);
        assert_eq!(candidates.len(), 1);
        let nodes: Vec<NodeId> = candidates[0]
            .kind
            .agent_states()
            .iter()
            .map(|a| a.coord.node)
            .collect();
        assert_eq!(nodes, vec![0, 1]);
    }

    #[test]
    fn test_od_commits_one_agent_at_a_time() {
        let graph = grids::open_grid(3, 1, Connectedness::Four);
        let p = problem(
            graph,
            vec![
                Agent {
                    start: 0,
                    goal: 2,
                    id: 0,
                },
                Agent {
                    start: 2,
                    goal: 0,
                    id: 1,
                },
            ],
        );
        let mut arena = StateArena::default();
        let roots = vec![agent_root(&p, 0), agent_root(&p, 1)];
        let id = arena.alloc(StateEntry {
            pred: None,
            g: 0,
            h: 0,
            violations: 0,
            kind: StateKind::Od {
                agents: roots,
                move_next: 0,
            },
        });
        let intermediates = expand(&arena, id, &p, CostFunction::SumOfCosts);
        // Only agent 0 moved; results are intermediates awaiting agent 1.
        for candidate in &intermediates {
            assert!(!candidate.kind.closed_eligible());
            assert!(matches!(
                candidate.kind,
                StateKind::Od { move_next: 1, .. }
            ));
            assert_eq!(candidate.kind.agent_states()[1].coord.time_step, 0);
        }
    }

    #[test]
    fn test_closed_key_drops_time_past_horizon() {
        let state = StateKind::Single(AgentState {
            coord: Coordinate::new(5, 3),
            g: 0,
        });
        assert_eq!(state.closed_key(9), state.closed_key(5));
        assert_ne!(state.closed_key(9), state.closed_key(4));
        // Past the horizon every time step keys identically.
        let later = StateKind::Single(AgentState {
            coord: Coordinate::new(8, 3),
            g: 0,
        });
        assert_eq!(state.closed_key(4), later.closed_key(4));
    }
}
