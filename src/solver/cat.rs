use std::collections::HashMap;

use crate::common::{Conflict, ConflictKind, Coordinate, Path};
use crate::graph::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Occupant {
    previous: Option<Coordinate>,
    group: usize,
}

/// Soft conflict bookkeeping. Unlike a [`super::Reservation`] it never
/// rejects a state; it answers which group a state would collide with and
/// remembers the single earliest conflict seen while paths were added
/// (strictly earlier conflicts replace it, so the first-inserted one wins
/// ties).
#[derive(Debug, Clone, Default)]
pub struct ConflictAvoidanceTable {
    occupants: HashMap<Coordinate, Vec<Occupant>>,
    destinations: HashMap<NodeId, (usize, usize)>,
    earliest_conflict: Option<Conflict>,
}

impl ConflictAvoidanceTable {
    /// Group a move would conflict with, if any. `own_group` is never
    /// reported against itself.
    pub fn violation(
        &self,
        previous: Option<Coordinate>,
        coord: Coordinate,
        own_group: Option<usize>,
    ) -> Option<usize> {
        self.probe(previous, coord, own_group).map(|(group, _)| group)
    }

    fn probe(
        &self,
        previous: Option<Coordinate>,
        coord: Coordinate,
        own_group: Option<usize>,
    ) -> Option<(usize, ConflictKind)> {
        let foreign = |group: usize| own_group != Some(group);

        if let Some(occupants) = self.occupants.get(&coord) {
            if let Some(occupant) = occupants.iter().find(|o| foreign(o.group)) {
                return Some((occupant.group, ConflictKind::Collision));
            }
        }

        if let (Some(previous), Some(arriving)) = (previous, coord.earlier()) {
            let vacated = previous.later();
            if let Some(occupants) = self.occupants.get(&vacated) {
                if let Some(occupant) = occupants
                    .iter()
                    .find(|o| o.previous == Some(arriving) && foreign(o.group))
                {
                    return Some((occupant.group, ConflictKind::Transposition));
                }
            }
        }

        if let Some(&(arrival, group)) = self.destinations.get(&coord.node) {
            if arrival <= coord.time_step && foreign(group) {
                return Some((group, ConflictKind::Destination));
            }
        }

        None
    }

    /// Record every coordinate of a path under the given group id, updating
    /// the earliest conflict as collisions with previously added paths are
    /// discovered.
    pub fn add_path(&mut self, path: &Path, group: usize) {
        for (time_step, step) in path.steps().iter().enumerate() {
            for (agent_pos, agent) in step.iter().enumerate() {
                let previous =
                    (time_step > 0).then(|| path.step(time_step - 1)[agent_pos].coord);
                self.add_coordinate(agent.coord, previous, group);
            }
        }
        for agent in path.last_step() {
            self.destinations
                .insert(agent.coord.node, (agent.coord.time_step, group));
        }
    }

    fn add_coordinate(&mut self, coord: Coordinate, previous: Option<Coordinate>, group: usize) {
        let candidate = self
            .probe(previous, coord, Some(group))
            .map(|(other, kind)| self.build_conflict(coord, previous, other, group, kind));
        self.occupants
            .entry(coord)
            .or_default()
            .push(Occupant { previous, group });

        if let Some(candidate) = candidate {
            let earlier = self
                .earliest_conflict
                .map_or(true, |held| candidate.time_step < held.time_step);
            if earlier {
                self.earliest_conflict = Some(candidate);
            }
        }
    }

    fn build_conflict(
        &self,
        coord: Coordinate,
        previous: Option<Coordinate>,
        other_group: usize,
        group: usize,
        kind: ConflictKind,
    ) -> Conflict {
        let other_node = match kind {
            ConflictKind::Transposition => previous.map(|p| p.node),
            _ => Some(coord.node),
        };
        Conflict {
            time_step: coord.time_step,
            group_1: other_group,
            group_2: group,
            node_1: other_node,
            node_2: Some(coord.node),
            kind,
        }
    }

    /// Earliest conflict a candidate path would introduce, folded with the
    /// conflict already held; the table itself is left untouched.
    pub fn simulate_path(&self, path: &Path, group: usize) -> Option<Conflict> {
        let mut candidate = None;
        'scan: for (time_step, step) in path.steps().iter().enumerate() {
            for (agent_pos, agent) in step.iter().enumerate() {
                let previous =
                    (time_step > 0).then(|| path.step(time_step - 1)[agent_pos].coord);
                if let Some((other, kind)) = self.probe(previous, agent.coord, Some(group)) {
                    candidate =
                        Some(self.build_conflict(agent.coord, previous, other, group, kind));
                    break 'scan;
                }
            }
        }

        match (self.earliest_conflict, candidate) {
            (Some(held), Some(new)) if new.time_step < held.time_step => Some(new),
            (Some(held), _) => Some(held),
            (None, new) => new,
        }
    }

    pub fn earliest_conflict(&self) -> Option<Conflict> {
        self.earliest_conflict
    }

    pub fn clear(&mut self) {
        self.occupants.clear();
        self.destinations.clear();
        self.earliest_conflict = None;
    }
}

/// Stack of independent conflict-avoidance levels for nested solvers. Most
/// calls act on the top level; violation counting looks through every level
/// so a nested solver still steers around its ancestors' paths.
#[derive(Debug, Clone)]
pub struct MultiLevelCat {
    levels: Vec<ConflictAvoidanceTable>,
}

impl Default for MultiLevelCat {
    fn default() -> Self {
        MultiLevelCat {
            levels: vec![ConflictAvoidanceTable::default()],
        }
    }
}

impl MultiLevelCat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_level(&mut self) {
        self.levels.push(ConflictAvoidanceTable::default());
    }

    pub fn remove_level(&mut self) {
        assert!(self.levels.len() > 1, "cannot pop the base avoidance level");
        self.levels.pop();
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    fn top(&self) -> &ConflictAvoidanceTable {
        self.levels.last().expect("avoidance stack is never empty")
    }

    fn top_mut(&mut self) -> &mut ConflictAvoidanceTable {
        self.levels.last_mut().expect("avoidance stack is never empty")
    }

    pub fn violation(
        &self,
        previous: Option<Coordinate>,
        coord: Coordinate,
        own_group: Option<usize>,
    ) -> Option<usize> {
        self.top().violation(previous, coord, own_group)
    }

    /// Number of distinct groups, across all levels, a move conflicts with.
    pub fn total_violations(
        &self,
        previous: Option<Coordinate>,
        coord: Coordinate,
        own_group: Option<usize>,
    ) -> usize {
        let mut groups = Vec::new();
        for level in &self.levels {
            if let Some(group) = level.violation(previous, coord, own_group) {
                if !groups.contains(&group) {
                    groups.push(group);
                }
            }
        }
        groups.len()
    }

    pub fn add_path(&mut self, path: &Path, group: usize) {
        self.top_mut().add_path(path, group);
    }

    pub fn simulate_path(&self, path: &Path, group: usize) -> Option<Conflict> {
        self.top().simulate_path(path, group)
    }

    pub fn earliest_conflict(&self) -> Option<Conflict> {
        self.top().earliest_conflict()
    }

    pub fn clear(&mut self) {
        self.top_mut().clear();
    }
}
