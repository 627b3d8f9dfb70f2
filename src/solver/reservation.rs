use std::collections::HashMap;

use crate::common::{Coordinate, Path};
use crate::graph::NodeId;

/// Hard-exclusion table consulted by the search engine before a successor is
/// admitted. Holds explicitly reserved coordinates (with the reserving
/// move's predecessor, so swaps can be detected) and destinations occupied
/// forever at/after an arrival time.
#[derive(Debug, Clone, Default)]
pub struct Reservation {
    coordinates: HashMap<Coordinate, Option<Coordinate>>,
    destinations: HashMap<NodeId, usize>,
    last_time_step: usize,
}

impl Reservation {
    pub fn reserve_coordinate(&mut self, coord: Coordinate, previous: Option<Coordinate>) {
        self.coordinates.insert(coord, previous);
        self.last_time_step = self.last_time_step.max(coord.time_step);
    }

    pub fn free_coordinate(&mut self, coord: Coordinate) {
        self.coordinates.remove(&coord);
        self.destinations.remove(&coord.node);
        self.recompute_last_time_step();
    }

    /// Block a node forever at/after the given arrival time.
    pub fn reserve_destination(&mut self, coord: Coordinate) {
        self.destinations.insert(coord.node, coord.time_step);
        self.last_time_step = self.last_time_step.max(coord.time_step);
    }

    /// Reserve every coordinate a path occupies, plus each agent's final
    /// location as a destination.
    pub fn reserve_path(&mut self, path: &Path) {
        for (time_step, step) in path.steps().iter().enumerate() {
            for (agent_pos, agent) in step.iter().enumerate() {
                let previous = (time_step > 0)
                    .then(|| path.step(time_step - 1)[agent_pos].coord);
                self.reserve_coordinate(agent.coord, previous);
            }
        }
        for agent in path.last_step() {
            self.reserve_destination(agent.coord);
        }
    }

    /// Remove every reservation a path created.
    pub fn free_path(&mut self, path: &Path) {
        for step in path.steps() {
            for agent in step {
                self.coordinates.remove(&agent.coord);
            }
        }
        for agent in path.last_step() {
            self.destinations.remove(&agent.coord.node);
        }
        self.recompute_last_time_step();
    }

    /// Whether a move ending at `coord` is admissible: the coordinate is not
    /// reserved, not blocked by a stationary agent parked on its goal, and
    /// does not swap with an adjacent-time reservation.
    pub fn is_valid_move(&self, previous: Option<Coordinate>, coord: Coordinate) -> bool {
        !(self.coordinates.contains_key(&coord)
            || self.blocked_by_parked(coord)
            || self.transposition(previous, coord))
    }

    pub fn blocked_by_parked(&self, coord: Coordinate) -> bool {
        self.destinations
            .get(&coord.node)
            .is_some_and(|&arrival| arrival <= coord.time_step)
    }

    /// A reserved move into our previous cell whose own predecessor is our
    /// next cell one step earlier is a swap. Tested on shifted copies of the
    /// coordinates.
    fn transposition(&self, previous: Option<Coordinate>, coord: Coordinate) -> bool {
        let Some(previous) = previous else {
            return false;
        };
        let Some(arriving) = coord.earlier() else {
            return false;
        };
        let vacated = previous.later();
        matches!(
            self.coordinates.get(&vacated),
            Some(Some(reserved_prev)) if *reserved_prev == arriving
        )
    }

    /// Last explicitly constrained time step; goal states earlier than this
    /// must not be accepted.
    pub fn last_time_step(&self) -> usize {
        self.last_time_step
    }

    pub fn clear(&mut self) {
        self.coordinates.clear();
        self.destinations.clear();
        self.last_time_step = 0;
    }

    fn recompute_last_time_step(&mut self) {
        let coords = self.coordinates.keys().map(|c| c.time_step);
        let dests = self.destinations.values().copied();
        self.last_time_step = coords.chain(dests).max().unwrap_or(0);
    }
}

/// Stack of independent reservation levels. All calls act on the top level;
/// outer levels keep their contents for when the top is popped again.
#[derive(Debug, Clone)]
pub struct MultiLevelReservation {
    levels: Vec<Reservation>,
}

impl Default for MultiLevelReservation {
    fn default() -> Self {
        MultiLevelReservation {
            levels: vec![Reservation::default()],
        }
    }
}

impl MultiLevelReservation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_level(&mut self) {
        self.levels.push(Reservation::default());
    }

    pub fn remove_level(&mut self) {
        assert!(self.levels.len() > 1, "cannot pop the base reservation level");
        self.levels.pop();
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    fn top(&self) -> &Reservation {
        self.levels.last().expect("reservation stack is never empty")
    }

    fn top_mut(&mut self) -> &mut Reservation {
        self.levels.last_mut().expect("reservation stack is never empty")
    }

    pub fn reserve_coordinate(&mut self, coord: Coordinate, previous: Option<Coordinate>) {
        self.top_mut().reserve_coordinate(coord, previous);
    }

    pub fn free_coordinate(&mut self, coord: Coordinate) {
        self.top_mut().free_coordinate(coord);
    }

    pub fn reserve_destination(&mut self, coord: Coordinate) {
        self.top_mut().reserve_destination(coord);
    }

    pub fn reserve_path(&mut self, path: &Path) {
        self.top_mut().reserve_path(path);
    }

    pub fn free_path(&mut self, path: &Path) {
        self.top_mut().free_path(path);
    }

    pub fn is_valid_move(&self, previous: Option<Coordinate>, coord: Coordinate) -> bool {
        self.top().is_valid_move(previous, coord)
    }

    pub fn blocked_by_parked(&self, coord: Coordinate) -> bool {
        self.top().blocked_by_parked(coord)
    }

    pub fn last_time_step(&self) -> usize {
        self.top().last_time_step()
    }

    pub fn clear(&mut self) {
        self.top_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::single_path;

    #[test]
    fn test_reserved_coordinate_is_invalid() {
        let mut table = Reservation::default();
        table.reserve_coordinate(Coordinate::new(2, 5), Some(Coordinate::new(1, 4)));
        assert!(!table.is_valid_move(Some(Coordinate::new(1, 5)), Coordinate::new(2, 5)));
        assert!(table.is_valid_move(Some(Coordinate::new(1, 5)), Coordinate::new(2, 6)));
        assert_eq!(table.last_time_step(), 2);
    }

    #[test]
    fn test_swap_with_reserved_move_is_invalid() {
        let mut table = Reservation::default();
        // Reserved agent moves 4 -> 5 between t=1 and t=2.
        table.reserve_coordinate(Coordinate::new(2, 5), Some(Coordinate::new(1, 4)));
        // Moving 5 -> 4 over the same edge swaps with it.
        assert!(!table.is_valid_move(Some(Coordinate::new(1, 5)), Coordinate::new(2, 4)));
        // The same move one step later does not.
        assert!(table.is_valid_move(Some(Coordinate::new(2, 5)), Coordinate::new(3, 4)));
    }

    #[test]
    fn test_destination_blocks_at_and_after_arrival() {
        let mut table = Reservation::default();
        table.reserve_destination(Coordinate::new(3, 9));
        assert!(table.is_valid_move(None, Coordinate::new(2, 9)));
        assert!(!table.is_valid_move(None, Coordinate::new(3, 9)));
        assert!(!table.is_valid_move(None, Coordinate::new(7, 9)));
    }

    #[test]
    fn test_reserve_and_free_path_round_trip() {
        let mut table = Reservation::default();
        let path = single_path(&[0, 1, 2]);
        table.reserve_path(&path);
        assert!(!table.is_valid_move(None, Coordinate::new(1, 1)));
        // Final node blocked forever after arrival.
        assert!(!table.is_valid_move(None, Coordinate::new(9, 2)));
        assert_eq!(table.last_time_step(), 2);

        table.free_path(&path);
        assert!(table.is_valid_move(None, Coordinate::new(1, 1)));
        assert!(table.is_valid_move(None, Coordinate::new(9, 2)));
        assert_eq!(table.last_time_step(), 0);
    }

    #[test]
    fn test_levels_restore_outer_reservations() {
        let mut stack = MultiLevelReservation::new();
        stack.reserve_coordinate(Coordinate::new(1, 0), None);
        stack.add_level();
        assert!(stack.is_valid_move(None, Coordinate::new(1, 0)));
        stack.reserve_coordinate(Coordinate::new(4, 2), None);
        stack.remove_level();
        assert!(!stack.is_valid_move(None, Coordinate::new(1, 0)));
        assert!(stack.is_valid_move(None, Coordinate::new(4, 2)));
    }
}
