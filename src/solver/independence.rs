use std::time::Instant;

use tracing::{debug, instrument};

use crate::common::{first_conflict_with, merge_paths, Path};
use crate::problem::ProblemInstance;
use crate::solver::{ConstrainedSolver, Solver};
use crate::stat::Stats;

/// Simple independence detection: plan every agent alone, then repeatedly
/// merge the sub-problems of the first conflicting pair and re-plan them
/// jointly with the supplied multi-agent solver.
pub struct IndependenceDetection<S: ConstrainedSolver> {
    solver: S,
    problems: Vec<ProblemInstance>,
    paths: Vec<Path>,
    solved: bool,
    pub stats: Stats,
}

impl<S: ConstrainedSolver> IndependenceDetection<S> {
    pub fn new(solver: S) -> Self {
        IndependenceDetection {
            solver,
            problems: Vec::new(),
            paths: Vec::new(),
            solved: false,
            stats: Stats::default(),
        }
    }

    /// Solve every agent alone. Any failure fails the whole solve.
    pub(crate) fn populate_paths(&mut self, problem: &ProblemInstance) -> bool {
        self.problems.clear();
        self.paths.clear();
        self.solved = false;
        self.stats = Stats::default();
        self.solver.tables().reservation().clear();

        // Compute the shared heuristic once so every sub-problem inherits it.
        problem.heuristic();
        for agent_pos in 0..problem.agents().len() {
            self.problems.push(problem.singleton(agent_pos));
        }
        for sub in &self.problems {
            if !self.solver.solve(sub) {
                debug!("agent {:?} cannot reach its goal alone", sub.agents()[0]);
                return false;
            }
            self.paths.push(self.solver.path());
        }
        true
    }

    /// Merge the sub-problems at `index` and `other` into one joint problem
    /// (agents re-indexed 0..k-1), solve it, and shrink the lists. Returns
    /// the merged group's new position, or `None` when the joint solve
    /// fails.
    pub(crate) fn merge_groups(
        &mut self,
        root: &ProblemInstance,
        index: usize,
        other: usize,
    ) -> Option<usize> {
        let joined = match self.problems[index].join(&self.problems[other]) {
            Ok(joined) => joined,
            Err(error) => {
                debug!("sub-problem merge rejected: {error}");
                return None;
            }
        };
        joined.adopt_heuristic(root);
        debug!(
            "merging groups {index} and {other} into a {}-agent problem",
            joined.agents().len()
        );

        if !self.solver.solve(&joined) {
            return None;
        }
        let merged_path = self.solver.path();
        self.stats.merges += 1;

        self.problems[index] = joined;
        self.problems.remove(other);
        self.paths.remove(other);
        let landing = index - usize::from(other < index);
        self.paths[landing] = merged_path;
        Some(landing)
    }

    fn finish(&mut self, start: Instant, name: &str) {
        self.solved = true;
        self.stats.costs = self.paths.iter().map(Path::cost).sum();
        self.stats.time_us = start.elapsed().as_micros();
        self.stats.log(name);
    }
}

impl<S: ConstrainedSolver> Solver for IndependenceDetection<S> {
    #[instrument(skip_all, name = "id", fields(agents = problem.agents().len()), level = "debug")]
    fn solve(&mut self, problem: &ProblemInstance) -> bool {
        let start = Instant::now();
        if !self.populate_paths(problem) {
            return false;
        }

        let mut index = 0;
        while index < self.paths.len() {
            match first_conflict_with(&self.paths, index) {
                Some(conflict) => {
                    let other = if conflict.group_1 == index {
                        conflict.group_2
                    } else {
                        conflict.group_1
                    };
                    debug!("groups {index} and {other} conflict: {conflict:?}");
                    match self.merge_groups(problem, index, other) {
                        Some(landing) => index = landing,
                        None => return false,
                    }
                }
                None => index += 1,
            }
        }

        self.finish(start, "id");
        true
    }

    fn path(&self) -> Path {
        if !self.solved {
            return Path::default();
        }
        merge_paths(&self.paths)
    }
}

/// Enhanced independence detection: before merging a freshly conflicting
/// pair, try to re-plan each side alone at unchanged cost while the other
/// side's path is reserved. Only when both one-sided attempts fail, or the
/// pair has conflicted before, does it fall back to the joint merge. The
/// pairwise conflict history is kept consistent across merges.
pub struct EnhancedId<S: ConstrainedSolver> {
    inner: IndependenceDetection<S>,
    conflicted_before: Vec<Vec<bool>>,
}

impl<S: ConstrainedSolver> EnhancedId<S> {
    pub fn new(solver: S) -> Self {
        EnhancedId {
            inner: IndependenceDetection::new(solver),
            conflicted_before: Vec::new(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    /// Re-plan `replan` with `keep`'s path reserved on a scoped level. Only
    /// an equal-cost replacement counts; anything dearer would trade global
    /// optimality for locality.
    fn one_sided(&mut self, keep: usize, replan: usize) -> bool {
        let cost_limit = self.inner.paths[replan].cost();
        let tables = self.inner.solver.tables().clone();
        let _guard = tables.reservation_level();
        tables.reservation().reserve_path(&self.inner.paths[keep]);

        let sub = self.inner.problems[replan].clone();
        if !self.inner.solver.solve(&sub) {
            return false;
        }
        let replacement = self.inner.solver.path();
        if replacement.cost() != cost_limit {
            debug!(
                "one-sided replan for group {replan} costs {} > {cost_limit}, rejected",
                replacement.cost()
            );
            return false;
        }
        self.inner.paths[replan] = replacement;
        true
    }

    /// Drop the removed group's row and column and reset the merged group's
    /// history so the coarser group starts fresh against everyone else.
    fn shrink_history(&mut self, landing: usize, removed: usize) {
        self.conflicted_before.remove(removed);
        for row in &mut self.conflicted_before {
            row.remove(removed);
        }
        let groups = self.conflicted_before.len();
        self.conflicted_before[landing] = vec![false; groups];
        for row in &mut self.conflicted_before {
            row[landing] = false;
        }
    }
}

impl<S: ConstrainedSolver> Solver for EnhancedId<S> {
    #[instrument(skip_all, name = "enhanced_id", fields(agents = problem.agents().len()), level = "debug")]
    fn solve(&mut self, problem: &ProblemInstance) -> bool {
        let start = Instant::now();
        if !self.inner.populate_paths(problem) {
            return false;
        }
        let groups = self.inner.paths.len();
        self.conflicted_before = vec![vec![false; groups]; groups];

        let mut index = 0;
        while index < self.inner.paths.len() {
            let Some(conflict) = first_conflict_with(&self.inner.paths, index) else {
                index += 1;
                continue;
            };
            let other = if conflict.group_1 == index {
                conflict.group_2
            } else {
                conflict.group_1
            };
            debug!("groups {index} and {other} conflict: {conflict:?}");

            if !self.conflicted_before[index][other] {
                self.conflicted_before[index][other] = true;
                self.conflicted_before[other][index] = true;
                if self.one_sided(index, other) || self.one_sided(other, index) {
                    index = index.min(other);
                    continue;
                }
                debug!("both one-sided attempts failed, merging");
            }

            match self.inner.merge_groups(problem, index, other) {
                Some(landing) => {
                    self.shrink_history(landing, other);
                    index = landing;
                }
                None => return false,
            }
        }

        self.inner.finish(start, "enhanced_id");
        true
    }

    fn path(&self) -> Path {
        self.inner.path()
    }
}
