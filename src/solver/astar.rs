use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use tracing::{debug, instrument, trace};

use crate::common::{costs, Cost, CostFunction, Path};
use crate::problem::ProblemInstance;
use crate::solver::state::{
    agent_root, expand, Candidate, ClosedKey, StateArena, StateEntry, StateId, StateKind,
};
use crate::solver::{ConstrainedSolver, Solver, TableContext};
use crate::stat::Stats;

/// Which root, goal test and expansion rule the engine runs with. The
/// engine itself only sequences the open/closed lists and the table checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    /// A* over one agent's time-expanded coordinates.
    SingleAgent,
    /// A* over full joint states under the given cost function.
    MultiAgent(CostFunction),
    /// Joint A* committing one agent at a time per step.
    OperatorDecomposition,
    /// Exhaustive uniform-cost sweep with no goal test; backs the
    /// true-distance heuristic.
    BreadthFirst,
}

/// Open-list ordering: f first, then fewer soft conflicts, then deeper
/// states, with the insertion sequence as the final stable tie-break.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct OpenEntry {
    f: Cost,
    violations: usize,
    depth: Reverse<Cost>,
    seq: u64,
    id: StateId,
}

#[derive(Debug, Default)]
struct ClosedList {
    map: HashMap<ClosedKey, Cost>,
}

impl ClosedList {
    /// Whether the state may enter the search. A state strictly cheaper than
    /// the recorded one re-opens its slot.
    fn admit(&mut self, key: ClosedKey, g: Cost) -> bool {
        match self.map.entry(key) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(g);
                true
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                if g < *slot.get() {
                    slot.insert(g);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn clear(&mut self) {
        self.map.clear();
    }
}

/// Best-first search engine shared by every low-level solver. Successors are
/// filtered through the bound reservation before the closed-list check, and
/// a goal is only accepted once the reservation's last constrained time step
/// has passed. An emptied open list is a normal `false`.
pub struct GenericAStar {
    strategy: SearchStrategy,
    tables: TableContext,
    arena: StateArena,
    open: BTreeSet<OpenEntry>,
    closed: ClosedList,
    goal: Option<StateId>,
    seq: u64,
    pub stats: Stats,
}

impl GenericAStar {
    pub fn new(strategy: SearchStrategy) -> Self {
        Self::with_tables(strategy, TableContext::new())
    }

    /// Bind the engine to an existing table context, sharing a parent
    /// solver's reservations and avoidance data.
    pub fn with_tables(strategy: SearchStrategy, tables: TableContext) -> Self {
        GenericAStar {
            strategy,
            tables,
            arena: StateArena::default(),
            open: BTreeSet::new(),
            closed: ClosedList::default(),
            goal: None,
            seq: 0,
            stats: Stats::default(),
        }
    }

    pub fn strategy(&self) -> SearchStrategy {
        self.strategy
    }

    fn init(&mut self) {
        self.goal = None;
        self.seq = 0;
        self.arena.clear();
        self.open.clear();
        self.closed.clear();
    }

    fn root_kind(&self, problem: &ProblemInstance) -> StateKind {
        assert!(!problem.agents().is_empty(), "problem has no agents");
        match self.strategy {
            SearchStrategy::SingleAgent | SearchStrategy::BreadthFirst => {
                assert!(
                    problem.agents().len() == 1,
                    "single-agent engine given a problem with {} agents",
                    problem.agents().len()
                );
                StateKind::Single(agent_root(problem, 0))
            }
            SearchStrategy::MultiAgent(_) => StateKind::Multi(
                (0..problem.agents().len())
                    .map(|pos| agent_root(problem, pos))
                    .collect(),
            ),
            SearchStrategy::OperatorDecomposition => StateKind::Od {
                agents: (0..problem.agents().len())
                    .map(|pos| agent_root(problem, pos))
                    .collect(),
                move_next: 0,
            },
        }
    }

    fn cost_function(&self) -> CostFunction {
        match self.strategy {
            SearchStrategy::MultiAgent(cost_function) => cost_function,
            _ => CostFunction::SumOfCosts,
        }
    }

    fn is_goal(&self, problem: &ProblemInstance, kind: &StateKind) -> bool {
        match self.strategy {
            SearchStrategy::BreadthFirst => false,
            _ => kind.goal_test(problem),
        }
    }

    fn push_open(&mut self, id: StateId) {
        let entry = self.arena.get(id);
        let item = OpenEntry {
            f: entry.g.saturating_add(entry.h),
            violations: entry.violations,
            depth: Reverse(entry.g),
            seq: self.seq,
            id,
        };
        self.open.insert(item);
        self.seq += 1;
    }

    fn admit_candidate(&mut self, candidate: Candidate, h: Cost) {
        let violations = {
            let pred_violations = candidate
                .pred
                .map_or(0, |pred| self.arena.get(pred).violations);
            let cat = self.tables.cat();
            pred_violations
                + candidate
                    .moves
                    .iter()
                    .map(|(previous, coord)| cat.total_violations(*previous, *coord, None))
                    .sum::<usize>()
        };
        let id = self.arena.alloc(StateEntry {
            pred: candidate.pred,
            g: candidate.g,
            h,
            violations,
            kind: candidate.kind,
        });
        self.push_open(id);
    }

    /// Closed-list costs keyed by single nodes; the heuristic sweep reads
    /// its result out of this.
    pub(crate) fn closed_costs(&self) -> impl Iterator<Item = (&ClosedKey, Cost)> {
        self.closed.map.iter().map(|(key, &g)| (key, g))
    }
}

impl Solver for GenericAStar {
    #[instrument(skip_all, name = "a_star", fields(strategy = ?self.strategy, agents = problem.agents().len()), level = "debug")]
    fn solve(&mut self, problem: &ProblemInstance) -> bool {
        self.init();
        let horizon = self.tables.reservation().last_time_step();
        let heuristic = match self.strategy {
            SearchStrategy::BreadthFirst => None,
            _ => Some(problem.heuristic()),
        };
        let cost_function = self.cost_function();

        let root = self.root_kind(problem);
        let root_h = heuristic
            .as_ref()
            .map_or(0, |table| root.heuristic(problem, table));
        let root_key = root.closed_key(horizon);
        let root_id = self.arena.alloc(StateEntry {
            pred: None,
            g: 0,
            h: root_h,
            violations: 0,
            kind: root,
        });
        self.closed.admit(root_key, 0);
        self.push_open(root_id);

        while let Some(current) = self.open.pop_first() {
            self.stats.low_level_expanded += 1;
            let entry = self.arena.get(current.id);
            trace!("expand state: g {:?} h {:?} {:?}", entry.g, entry.h, entry.kind);

            if self.is_goal(problem, &entry.kind) && entry.kind.time_step() >= horizon {
                self.goal = Some(current.id);
                self.stats.costs = entry.g;
                return true;
            }

            for candidate in expand(&self.arena, current.id, problem, cost_function) {
                let valid = {
                    let reservation = self.tables.reservation();
                    candidate
                        .moves
                        .iter()
                        .all(|(previous, coord)| reservation.is_valid_move(*previous, *coord))
                };
                if !valid {
                    continue;
                }
                if candidate.kind.closed_eligible()
                    && !self
                        .closed
                        .admit(candidate.kind.closed_key(horizon), candidate.g)
                {
                    continue;
                }
                let h = heuristic
                    .as_ref()
                    .map_or(0, |table| candidate.kind.heuristic(problem, table));
                if h == costs::UNREACHABLE {
                    continue;
                }
                self.admit_candidate(candidate, h);
            }
        }

        debug!("open list exhausted without reaching a goal");
        false
    }

    fn path(&self) -> Path {
        let Some(goal) = self.goal else {
            return Path::default();
        };
        let mut ids = Vec::new();
        let mut current = Some(goal);
        while let Some(id) = current {
            ids.push(id);
            current = self.arena.get(id).pred;
        }
        ids.reverse();
        let steps = ids
            .iter()
            .map(|&id| self.arena.get(id).kind.agent_states().to_vec())
            .collect();
        Path::from_steps(steps, self.arena.get(goal).g)
    }
}

impl ConstrainedSolver for GenericAStar {
    fn tables(&self) -> &TableContext {
        &self.tables
    }
}

/// Exhaustive sweep specialization: solve the whole reachable graph with no
/// goal test and read the per-node optimal costs out of the closed list.
pub(crate) struct BreadthFirstSearch {
    engine: GenericAStar,
}

impl BreadthFirstSearch {
    pub fn new() -> Self {
        BreadthFirstSearch {
            engine: GenericAStar::new(SearchStrategy::BreadthFirst),
        }
    }

    /// Exact cost from the problem's single agent's start to every node,
    /// [`costs::UNREACHABLE`] where no path exists.
    pub fn sweep(&mut self, problem: &ProblemInstance) -> Vec<Cost> {
        let solved = self.engine.solve(problem);
        debug_assert!(!solved, "sweep has no goal to reach");
        let mut table = vec![costs::UNREACHABLE; problem.graph().size()];
        for (key, g) in self.engine.closed_costs() {
            if let Some(node) = key.single_node() {
                table[node] = table[node].min(g);
            }
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Agent, Coordinate};
    use crate::graph::{grids, Connectedness};
    use std::rc::Rc;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
    }

    fn problem(graph: Rc<crate::graph::Graph>, agents: Vec<Agent>) -> ProblemInstance {
        ProblemInstance::new(graph, agents).unwrap()
    }

    fn agent(start: usize, goal: usize, id: usize) -> Agent {
        Agent { start, goal, id }
    }

    #[test]
    fn test_single_agent_shortest_path() {
        init_tracing();
        let p = problem(
            grids::open_grid(3, 3, Connectedness::Four),
            vec![agent(0, 8, 0)],
        );
        let mut solver = GenericAStar::new(SearchStrategy::SingleAgent);
        assert!(solver.solve(&p));
        let path = solver.path();
        assert_eq!(path.len(), 5);
        assert_eq!(path.cost(), 4 * costs::ADJACENT);
        assert_eq!(path.step(0)[0].coord, Coordinate::new(0, 0));
        assert_eq!(path.step(4)[0].coord, Coordinate::new(4, 8));
    }

    #[test]
    fn test_start_equals_goal_is_trivial() {
        let p = problem(
            grids::open_grid(3, 3, Connectedness::Four),
            vec![agent(4, 4, 0)],
        );
        let mut solver = GenericAStar::new(SearchStrategy::SingleAgent);
        assert!(solver.solve(&p));
        let path = solver.path();
        assert_eq!(path.len(), 1);
        assert_eq!(path.cost(), 0);
    }

    #[test]
    fn test_unreachable_goal_fails_normally() {
        let p = problem(
            grids::from_ascii(&[".@."], Connectedness::Four),
            vec![agent(0, 1, 0)],
        );
        let mut solver = GenericAStar::new(SearchStrategy::SingleAgent);
        assert!(!solver.solve(&p));
        assert!(solver.path().is_empty());
    }

    #[test]
    fn test_reserved_coordinate_forces_detour() {
        init_tracing();
        let p = problem(
            grids::open_grid(3, 1, Connectedness::Four),
            vec![agent(0, 2, 0)],
        );
        let mut solver = GenericAStar::new(SearchStrategy::SingleAgent);
        assert!(solver.solve(&p));
        let unconstrained = solver.path().cost();

        // Block the middle cell at the moment the direct path crosses it.
        solver
            .tables()
            .reservation()
            .reserve_coordinate(Coordinate::new(1, 1), None);
        assert!(solver.solve(&p));
        let detoured = solver.path();
        assert!(detoured.cost() > unconstrained);
        // The only detour on a corridor is waiting out the reservation.
        assert_eq!(detoured.step(1)[0].coord.node, 0);
    }

    #[test]
    fn test_no_detour_means_failure() {
        // Both cells of a 2x1 corridor blocked at t=1: nowhere to go.
        let p = problem(
            grids::open_grid(2, 1, Connectedness::Four),
            vec![agent(0, 1, 0)],
        );
        let mut solver = GenericAStar::new(SearchStrategy::SingleAgent);
        solver
            .tables()
            .reservation()
            .reserve_coordinate(Coordinate::new(1, 0), None);
        solver
            .tables()
            .reservation()
            .reserve_coordinate(Coordinate::new(1, 1), None);
        assert!(!solver.solve(&p));
    }

    #[test]
    fn test_goal_not_accepted_before_horizon() {
        let p = problem(
            grids::open_grid(2, 1, Connectedness::Four),
            vec![agent(0, 1, 0)],
        );
        let mut solver = GenericAStar::new(SearchStrategy::SingleAgent);
        // A reservation far in the future keeps the goal from being accepted
        // early even though the goal cell itself is never blocked.
        solver
            .tables()
            .reservation()
            .reserve_coordinate(Coordinate::new(4, 0), None);
        assert!(solver.solve(&p));
        let path = solver.path();
        assert!(path.len() >= 5);
        assert_eq!(path.step(path.len() - 1)[0].coord.node, 1);
    }

    #[test]
    fn test_multi_agent_joint_solve() {
        init_tracing();
        let p = problem(
            grids::open_grid(3, 3, Connectedness::Four),
            vec![agent(0, 2, 0), agent(2, 0, 1)],
        );
        let mut solver = GenericAStar::new(SearchStrategy::MultiAgent(CostFunction::SumOfCosts));
        assert!(solver.solve(&p));
        let path = solver.path();
        assert_eq!(path.agent_count(), 2);
        // Crossing agents must dodge through the middle row once.
        assert!(path.cost() >= 4 * costs::ADJACENT);
        crate::common::assert_joint_path_valid(&path, p.graph());
    }

    #[test]
    fn test_od_matches_joint_cost() {
        init_tracing();
        let p = problem(
            grids::open_grid(3, 3, Connectedness::Four),
            vec![agent(0, 2, 0), agent(2, 0, 1)],
        );
        let mut joint = GenericAStar::new(SearchStrategy::MultiAgent(CostFunction::SumOfCosts));
        let mut od = GenericAStar::new(SearchStrategy::OperatorDecomposition);
        assert!(joint.solve(&p));
        assert!(od.solve(&p));
        assert_eq!(joint.path().cost(), od.path().cost());
        // OD paths contain only full states.
        for step in od.path().steps() {
            assert_eq!(step.len(), 2);
        }
    }

    #[test]
    fn test_makespan_counts_steps() {
        let p = problem(
            grids::open_grid(3, 1, Connectedness::Four),
            vec![agent(0, 2, 0)],
        );
        let mut solver = GenericAStar::new(SearchStrategy::MultiAgent(CostFunction::Makespan));
        assert!(solver.solve(&p));
        let path = solver.path();
        assert_eq!(path.len(), 3);
        assert_eq!(path.cost(), 2 * costs::MAKESPAN_STEP);
    }

    #[test]
    fn test_determinism_with_cleared_tables() {
        let p = problem(
            grids::open_grid(4, 4, Connectedness::Four),
            vec![agent(0, 15, 0)],
        );
        let mut solver = GenericAStar::new(SearchStrategy::SingleAgent);
        assert!(solver.solve(&p));
        let first = solver.path();
        solver.tables().reservation().clear();
        assert!(solver.solve(&p));
        assert_eq!(solver.path().cost(), first.cost());
        assert_eq!(solver.path(), first);
    }

    #[test]
    #[should_panic(expected = "single-agent engine")]
    fn test_single_agent_engine_rejects_multi_problem() {
        let p = problem(
            grids::open_grid(3, 3, Connectedness::Four),
            vec![agent(0, 8, 0), agent(1, 7, 1)],
        );
        let mut solver = GenericAStar::new(SearchStrategy::SingleAgent);
        solver.solve(&p);
    }

    #[test]
    fn test_sweep_covers_reachable_component() {
        let p = problem(
            grids::from_ascii(&["..@."], Connectedness::Four),
            vec![agent(0, 0, 0)],
        );
        let mut sweep = BreadthFirstSearch::new();
        let table = sweep.sweep(&p);
        assert_eq!(table[0], 0);
        assert_eq!(table[1], costs::ADJACENT);
        assert_eq!(table[2], costs::UNREACHABLE);
    }
}
