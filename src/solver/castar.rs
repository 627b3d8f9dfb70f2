use std::time::Instant;

use tracing::{debug, instrument};

use crate::common::{merge_paths, Path};
use crate::problem::ProblemInstance;
use crate::solver::astar::{GenericAStar, SearchStrategy};
use crate::solver::{ConstrainedSolver, Solver, TableContext};
use crate::stat::Stats;

/// Cooperative A*: plan agents one at a time in priority (list) order,
/// reserving each finished path so later agents route around it. Fast and
/// simple, but not optimal and not complete — an unlucky priority order can
/// wall a later agent in, which is a normal `false`.
pub struct CooperativeAStar {
    tables: TableContext,
    engine: GenericAStar,
    paths: Vec<Path>,
    solved: bool,
    pub stats: Stats,
}

impl Default for CooperativeAStar {
    fn default() -> Self {
        Self::new()
    }
}

impl CooperativeAStar {
    pub fn new() -> Self {
        let tables = TableContext::new();
        CooperativeAStar {
            engine: GenericAStar::with_tables(SearchStrategy::SingleAgent, tables.clone()),
            tables,
            paths: Vec::new(),
            solved: false,
            stats: Stats::default(),
        }
    }
}

impl Solver for CooperativeAStar {
    #[instrument(skip_all, name = "ca_star", fields(agents = problem.agents().len()), level = "debug")]
    fn solve(&mut self, problem: &ProblemInstance) -> bool {
        let start = Instant::now();
        self.paths.clear();
        self.solved = false;
        self.stats = Stats::default();
        self.tables.reservation().clear();

        problem.heuristic();
        for agent_pos in 0..problem.agents().len() {
            let singleton = problem.singleton(agent_pos);
            if !self.engine.solve(&singleton) {
                debug!("agent {agent_pos} is walled in by higher-priority paths");
                return false;
            }
            let path = self.engine.path();
            self.tables.reservation().reserve_path(&path);
            self.paths.push(path);
        }

        self.solved = true;
        self.stats.costs = self.paths.iter().map(Path::cost).sum();
        self.stats.time_us = start.elapsed().as_micros();
        self.stats.log("ca_star");
        true
    }

    fn path(&self) -> Path {
        if !self.solved {
            return Path::default();
        }
        merge_paths(&self.paths)
    }
}

impl ConstrainedSolver for CooperativeAStar {
    fn tables(&self) -> &TableContext {
        &self.tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{assert_joint_path_valid, costs, Agent};
    use crate::graph::{grids, Connectedness};
    use std::rc::Rc;

    fn problem(graph: Rc<crate::graph::Graph>, agents: Vec<Agent>) -> ProblemInstance {
        ProblemInstance::new(graph, agents).unwrap()
    }

    fn agent(start: usize, goal: usize, id: usize) -> Agent {
        Agent { start, goal, id }
    }

    #[test]
    fn test_later_agent_routes_around_reserved_path() {
        let graph = grids::open_grid(3, 3, Connectedness::Four);
        let p = problem(graph.clone(), vec![agent(1, 7, 0), agent(3, 5, 1)]);
        let mut castar = CooperativeAStar::new();
        assert!(castar.solve(&p));
        let path = castar.path();
        assert_joint_path_valid(&path, &graph);
        // The first agent keeps its optimum; the second pays the detour.
        assert!(path.cost() > 4 * costs::ADJACENT);
    }

    #[test]
    fn test_priority_solution_is_never_cheaper_than_optimal() {
        use crate::solver::cbs::ConflictBasedSearch;
        let graph = grids::open_grid(3, 3, Connectedness::Four);
        let p = problem(graph, vec![agent(1, 7, 0), agent(3, 5, 1)]);
        let mut castar = CooperativeAStar::new();
        let mut cbs = ConflictBasedSearch::new();
        assert!(castar.solve(&p));
        assert!(cbs.solve(&p));
        assert!(castar.path().cost() >= cbs.path().cost());
    }

    #[test]
    fn test_walled_in_agent_fails_normally() {
        // Agent 0 parks on the junction of a T; agent 1 can never cross.
        let graph = grids::from_ascii(&["...", "@.@"], Connectedness::Four);
        let p = problem(graph, vec![agent(0, 1, 0), agent(2, 3, 1)]);
        let mut castar = CooperativeAStar::new();
        assert!(!castar.solve(&p));
        assert!(castar.path().is_empty());
    }

    #[test]
    fn test_reservations_rebuilt_between_solves() {
        let graph = grids::open_grid(3, 3, Connectedness::Four);
        let p = problem(graph, vec![agent(0, 2, 0), agent(6, 8, 1)]);
        let mut castar = CooperativeAStar::new();
        assert!(castar.solve(&p));
        let first = castar.path();
        assert!(castar.solve(&p));
        assert_eq!(castar.path(), first);
    }
}
