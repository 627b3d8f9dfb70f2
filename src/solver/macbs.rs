use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use tracing::{debug, instrument};

use crate::common::{first_conflict, merge_paths, Cost, Path};
use crate::problem::ProblemInstance;
use crate::solver::astar::{GenericAStar, SearchStrategy};
use crate::solver::cbs::{constraint_for, CbsNode};
use crate::solver::{ConstrainedSolver, Solver, TableContext};
use crate::stat::Stats;

enum TreeOutcome {
    Solved(usize),
    Merge(usize, usize),
    Exhausted,
}

/// Meta-agent CBS. Runs the usual constraint-tree search at group
/// granularity, counting how often each pair of groups conflicts; once a
/// pair's count passes the merge threshold the two groups fuse into one
/// meta-agent and planning restarts with the coarser partition. Counters
/// persist across restarts, so repeat offenders keep fusing until the
/// instance decomposes cleanly.
pub struct MetaAgentCbs {
    merge_threshold: usize,
    low_level: SearchStrategy,
    tables: TableContext,
    partition: Vec<Vec<usize>>,
    subproblems: Vec<ProblemInstance>,
    engines: Vec<GenericAStar>,
    nodes: Vec<CbsNode>,
    open: BTreeSet<(Cost, usize)>,
    conflict_counts: HashMap<(usize, usize), usize>,
    goal: Option<usize>,
    pub stats: Stats,
}

impl MetaAgentCbs {
    /// `merge_threshold` is the number of observed conflicts a group pair
    /// tolerates before it is fused. Zero merges on first contact.
    pub fn new(merge_threshold: usize) -> Self {
        Self::with_low_level(merge_threshold, SearchStrategy::OperatorDecomposition)
    }

    pub fn with_low_level(merge_threshold: usize, low_level: SearchStrategy) -> Self {
        assert!(
            matches!(
                low_level,
                SearchStrategy::MultiAgent(_) | SearchStrategy::OperatorDecomposition
            ),
            "group replanning needs a multi-agent capable strategy"
        );
        MetaAgentCbs {
            merge_threshold,
            low_level,
            tables: TableContext::new(),
            partition: Vec::new(),
            subproblems: Vec::new(),
            engines: Vec::new(),
            nodes: Vec::new(),
            open: BTreeSet::new(),
            conflict_counts: HashMap::new(),
            goal: None,
            stats: Stats::default(),
        }
    }

    /// Smallest original agent in each group, the stable key conflict
    /// counters survive merges under.
    fn pair_key(&self, group_1: usize, group_2: usize) -> (usize, usize) {
        let a = *self.partition[group_1].iter().min().expect("empty group");
        let b = *self.partition[group_2].iter().min().expect("empty group");
        (a.min(b), a.max(b))
    }

    fn push_node(&mut self, node: CbsNode) {
        let index = self.nodes.len();
        self.open.insert((node.cost, index));
        self.nodes.push(node);
    }

    fn make_root(&mut self) -> Option<CbsNode> {
        let mut solutions = Vec::with_capacity(self.partition.len());
        for group in 0..self.partition.len() {
            let engine = &mut self.engines[group];
            engine.tables().reservation().clear();
            if !engine.solve(&self.subproblems[group]) {
                debug!("group {group} has no solution even unconstrained");
                return None;
            }
            solutions.push(engine.path());
        }

        let conflict = {
            let _level = self.tables.cat_level();
            let mut cat = self.tables.cat();
            for (group, path) in solutions.iter().enumerate() {
                cat.add_path(path, group);
            }
            cat.earliest_conflict()
        };
        let cost = solutions.iter().map(Path::cost).sum();
        Some(CbsNode {
            parent: None,
            constraint: None,
            solutions,
            cost,
            conflict,
        })
    }

    fn make_child(&mut self, parent_index: usize, group: usize) -> Option<CbsNode> {
        let conflict = self.nodes[parent_index]
            .conflict
            .expect("only conflicted nodes are expanded");
        let constraint =
            constraint_for(&self.nodes[parent_index].solutions[group], &conflict, group);

        {
            let mut reservation = self.tables.reservation();
            reservation.clear();
            reservation.reserve_coordinate(constraint.coord, constraint.previous);
            let mut cursor = Some(parent_index);
            while let Some(index) = cursor {
                if let Some(inherited) = &self.nodes[index].constraint {
                    if inherited.group == group {
                        reservation.reserve_coordinate(inherited.coord, inherited.previous);
                    }
                }
                cursor = self.nodes[index].parent;
            }
        }

        // The other groups' paths bias the replan away from soft conflicts
        // and afterwards tell us the earliest conflict the new path keeps.
        let level = self.tables.cat_level();
        {
            let mut cat = self.tables.cat();
            for (other, path) in self.nodes[parent_index].solutions.iter().enumerate() {
                if other != group {
                    cat.add_path(path, other);
                }
            }
        }

        if !self.engines[group].solve(&self.subproblems[group]) {
            debug!("group {group} inconsistent under inherited constraints");
            return None;
        }
        let replanned = self.engines[group].path();
        let simulated = self.tables.cat().simulate_path(&replanned, group);
        drop(level);

        let mut solutions = self.nodes[parent_index].solutions.clone();
        solutions[group] = replanned;
        let cost = solutions.iter().map(Path::cost).sum();
        let conflict = simulated.or_else(|| first_conflict(&solutions));
        Some(CbsNode {
            parent: Some(parent_index),
            constraint: Some(constraint),
            solutions,
            cost,
            conflict,
        })
    }

    fn run_tree(&mut self, problem: &ProblemInstance) -> Option<TreeOutcome> {
        self.nodes.clear();
        self.open.clear();
        self.subproblems = self
            .partition
            .iter()
            .map(|group| problem.subproblem(group))
            .collect();
        self.engines = (0..self.partition.len())
            .map(|_| GenericAStar::with_tables(self.low_level, self.tables.clone()))
            .collect();

        let root = self.make_root()?;
        self.push_node(root);

        while let Some((_, index)) = self.open.pop_first() {
            let Some(conflict) = self.nodes[index].conflict else {
                return Some(TreeOutcome::Solved(index));
            };

            let key = self.pair_key(conflict.group_1, conflict.group_2);
            let seen = self.conflict_counts.entry(key).or_insert(0);
            *seen += 1;
            if *seen > self.merge_threshold {
                return Some(TreeOutcome::Merge(conflict.group_1, conflict.group_2));
            }

            for group in [conflict.group_1, conflict.group_2] {
                if let Some(child) = self.make_child(index, group) {
                    self.stats.high_level_expanded += 1;
                    self.push_node(child);
                }
            }
        }
        Some(TreeOutcome::Exhausted)
    }

    fn merge_groups(&mut self, group_1: usize, group_2: usize) {
        let (keep, absorb) = (group_1.min(group_2), group_1.max(group_2));
        let absorbed = self.partition.remove(absorb);
        self.partition[keep].extend(absorbed);
        self.stats.merges += 1;
        debug!(
            "merged groups {group_1} and {group_2}; partition now {:?}",
            self.partition
        );
    }
}

impl Solver for MetaAgentCbs {
    #[instrument(skip_all, name = "macbs", fields(agents = problem.agents().len()), level = "debug")]
    fn solve(&mut self, problem: &ProblemInstance) -> bool {
        let start = Instant::now();
        self.partition = (0..problem.agents().len()).map(|pos| vec![pos]).collect();
        self.conflict_counts.clear();
        self.goal = None;
        self.stats = Stats::default();
        problem.heuristic();

        loop {
            match self.run_tree(problem) {
                None | Some(TreeOutcome::Exhausted) => return false,
                Some(TreeOutcome::Solved(index)) => {
                    self.goal = Some(index);
                    self.stats.costs = self.nodes[index].cost;
                    self.stats.time_us = start.elapsed().as_micros();
                    self.stats.log("macbs");
                    return true;
                }
                Some(TreeOutcome::Merge(group_1, group_2)) => {
                    self.merge_groups(group_1, group_2);
                }
            }
        }
    }

    /// Groups appear in partition order; each step still enumerates every
    /// agent's coordinate.
    fn path(&self) -> Path {
        let Some(goal) = self.goal else {
            return Path::default();
        };
        merge_paths(&self.nodes[goal].solutions)
    }
}

impl ConstrainedSolver for MetaAgentCbs {
    fn tables(&self) -> &TableContext {
        &self.tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{assert_joint_path_valid, costs, Agent};
    use crate::graph::{grids, Connectedness};
    use crate::solver::cbs::ConflictBasedSearch;
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
    fn test_high_threshold_behaves_like_cbs() {
        init_tracing();
        let graph = grids::open_grid(3, 3, Connectedness::Four);
        let p = problem(graph.clone(), vec![agent(1, 7, 0), agent(3, 5, 1)]);
        let mut macbs = MetaAgentCbs::new(usize::MAX);
        let mut cbs = ConflictBasedSearch::new();
        assert!(macbs.solve(&p));
        assert!(cbs.solve(&p));
        assert_eq!(macbs.path().cost(), cbs.path().cost());
        assert_eq!(macbs.stats.merges, 0);
        assert_joint_path_valid(&macbs.path(), &graph);
    }

    #[test]
    fn test_zero_threshold_merges_on_first_conflict() {
        init_tracing();
        let graph = grids::open_grid(3, 3, Connectedness::Four);
        let p = problem(graph.clone(), vec![agent(1, 7, 0), agent(3, 5, 1)]);
        let mut macbs = MetaAgentCbs::new(0);
        assert!(macbs.solve(&p));
        assert_eq!(macbs.stats.merges, 1);
        // The fused meta-agent is planned jointly and optimally.
        assert_eq!(macbs.path().cost(), 4 * costs::ADJACENT + costs::STAY);
        assert_joint_path_valid(&macbs.path(), &graph);
    }

    #[test]
    fn test_partial_merge_leaves_independent_agents_alone() {
        let graph = grids::open_grid(4, 3, Connectedness::Four);
        // Two crossing agents in the left column block, one loner far right.
        let p = problem(
            graph.clone(),
            vec![agent(1, 9, 0), agent(4, 6, 1), agent(3, 11, 2)],
        );
        let mut macbs = MetaAgentCbs::new(0);
        assert!(macbs.solve(&p));
        assert_eq!(macbs.partition.len(), 2);
        assert_joint_path_valid(&macbs.path(), &graph);
    }

    #[test]
    fn test_unsolvable_group_fails() {
        let graph = grids::from_ascii(&["..@."], Connectedness::Four);
        let p = problem(graph, vec![agent(0, 2, 0)]);
        let mut macbs = MetaAgentCbs::new(1);
        assert!(!macbs.solve(&p));
        assert!(macbs.path().is_empty());
    }

    #[test]
    fn test_macbs_is_deterministic() {
        let graph = grids::open_grid(4, 4, Connectedness::Four);
        let p = problem(
            graph,
            vec![agent(0, 15, 0), agent(3, 12, 1), agent(12, 3, 2)],
        );
        let mut macbs = MetaAgentCbs::new(1);
        assert!(macbs.solve(&p));
        let first = macbs.path();
        assert!(macbs.solve(&p));
        assert_eq!(macbs.path(), first);
    }
}
