use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{debug, instrument};

use crate::common::{first_conflict, merge_paths, Conflict, Coordinate, Cost, Path};
use crate::problem::ProblemInstance;
use crate::solver::astar::{GenericAStar, SearchStrategy};
use crate::solver::cat::ConflictAvoidanceTable;
use crate::solver::{ConstrainedSolver, Solver};
use crate::stat::Stats;

/// One inherited constraint: the group may not occupy `coord`, and (through
/// the predecessor linkage) may not swap across the edge it arrived by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CbsConstraint {
    pub group: usize,
    pub coord: Coordinate,
    pub previous: Option<Coordinate>,
}

/// Constraint-tree node: a full set of per-group paths plus the one
/// constraint added on top of its parent.
#[derive(Debug)]
pub(crate) struct CbsNode {
    pub parent: Option<usize>,
    pub constraint: Option<CbsConstraint>,
    pub solutions: Vec<Path>,
    pub cost: Cost,
    pub conflict: Option<Conflict>,
}

/// Derive the constraint forbidding `group` from its side of a conflict:
/// its own coordinate at the conflict step, with the predecessor it came
/// from.
pub(crate) fn constraint_for(path: &Path, conflict: &Conflict, group: usize) -> CbsConstraint {
    let time_step = conflict.time_step;
    let conflict_node = if group == conflict.group_1 {
        conflict.node_1
    } else {
        conflict.node_2
    };
    // The offending agent within the group is the one sitting on the
    // conflict node; single-agent groups have exactly one candidate.
    let agent_pos = conflict_node
        .and_then(|node| {
            path.step_or_last(time_step)
                .iter()
                .position(|a| a.coord.node == node)
        })
        .unwrap_or(0);
    let coord = Coordinate::new(time_step, path.node_at(agent_pos, time_step));
    let previous = time_step
        .checked_sub(1)
        .map(|t| Coordinate::new(t, path.node_at(agent_pos, t)));
    CbsConstraint {
        group,
        coord,
        previous,
    }
}

/// Optimal conflict-based search: branch-and-bound over per-agent
/// constraints, replanning a single agent per node with the generic engine.
pub struct ConflictBasedSearch {
    engines: Vec<GenericAStar>,
    nodes: Vec<CbsNode>,
    open: BTreeSet<(Cost, usize)>,
    goal: Option<usize>,
    pub stats: Stats,
}

impl Default for ConflictBasedSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictBasedSearch {
    pub fn new() -> Self {
        ConflictBasedSearch {
            engines: Vec::new(),
            nodes: Vec::new(),
            open: BTreeSet::new(),
            goal: None,
            stats: Stats::default(),
        }
    }

    fn init(&mut self, problem: &ProblemInstance) {
        self.engines = (0..problem.agents().len())
            .map(|_| GenericAStar::new(SearchStrategy::SingleAgent))
            .collect();
        self.nodes.clear();
        self.open.clear();
        self.goal = None;
        self.stats = Stats::default();
    }

    fn push_node(&mut self, node: CbsNode) {
        let index = self.nodes.len();
        self.open.insert((node.cost, index));
        self.nodes.push(node);
    }

    /// Solve every agent independently and take the earliest conflict from
    /// the avoidance table the root paths are folded into.
    fn make_root(&mut self, problem: &ProblemInstance) -> bool {
        let mut solutions = Vec::with_capacity(problem.agents().len());
        for agent_pos in 0..problem.agents().len() {
            let singleton = problem.singleton(agent_pos);
            let engine = &mut self.engines[agent_pos];
            engine.tables().reservation().clear();
            if !engine.solve(&singleton) {
                debug!("agent {agent_pos} cannot reach its goal alone");
                return false;
            }
            solutions.push(engine.path());
        }

        let mut cat = ConflictAvoidanceTable::default();
        for (group, path) in solutions.iter().enumerate() {
            cat.add_path(path, group);
        }
        let conflict = cat.earliest_conflict();
        let cost = solutions.iter().map(Path::cost).sum();
        self.push_node(CbsNode {
            parent: None,
            constraint: None,
            solutions,
            cost,
            conflict,
        });
        true
    }

    /// Replan one side of the parent's conflict under the accumulated
    /// constraints for that agent. `None` marks an inconsistent child.
    fn make_child(
        &mut self,
        problem: &ProblemInstance,
        parent_index: usize,
        group: usize,
    ) -> Option<CbsNode> {
        let conflict = self.nodes[parent_index]
            .conflict
            .expect("only conflicted nodes are expanded");
        let constraint = constraint_for(&self.nodes[parent_index].solutions[group], &conflict, group);

        {
            let engine = &self.engines[group];
            let mut reservation = engine.tables().reservation();
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

        let singleton = problem.singleton(group);
        if !self.engines[group].solve(&singleton) {
            debug!("child for group {group} is inconsistent, discarding");
            return None;
        }
        let replanned = self.engines[group].path();

        let parent = &self.nodes[parent_index];
        let mut solutions = parent.solutions.clone();
        solutions[group] = replanned;
        let cost = solutions.iter().map(Path::cost).sum();
        let conflict = first_conflict(&solutions);
        Some(CbsNode {
            parent: Some(parent_index),
            constraint: Some(constraint),
            solutions,
            cost,
            conflict,
        })
    }
}

impl Solver for ConflictBasedSearch {
    #[instrument(skip_all, name = "cbs", fields(agents = problem.agents().len()), level = "debug")]
    fn solve(&mut self, problem: &ProblemInstance) -> bool {
        let start = Instant::now();
        self.init(problem);
        // Compute the shared heuristic once; every singleton inherits it.
        problem.heuristic();

        if !self.make_root(problem) {
            return false;
        }

        while let Some((cost, index)) = self.open.pop_first() {
            let Some(conflict) = self.nodes[index].conflict else {
                self.goal = Some(index);
                self.stats.costs = cost;
                self.stats.time_us = start.elapsed().as_micros();
                self.stats.log("cbs");
                return true;
            };
            debug!("conflict: {conflict:?}");

            for group in [conflict.group_1, conflict.group_2] {
                if let Some(child) = self.make_child(problem, index, group) {
                    self.stats.high_level_expanded += 1;
                    self.push_node(child);
                }
            }
        }
        false
    }

    fn path(&self) -> Path {
        let Some(goal) = self.goal else {
            return Path::default();
        };
        merge_paths(&self.nodes[goal].solutions)
    }
}
