pub mod astar;
pub mod castar;
pub mod cat;
pub mod cbs;
pub mod independence;
pub mod macbs;
pub mod reservation;
pub(crate) mod state;

pub use astar::{GenericAStar, SearchStrategy};
pub use castar::CooperativeAStar;
pub use cat::{ConflictAvoidanceTable, MultiLevelCat};
pub use cbs::ConflictBasedSearch;
pub use independence::{EnhancedId, IndependenceDetection};
pub use macbs::MetaAgentCbs;
pub use reservation::{MultiLevelReservation, Reservation};

use std::cell::{RefCell, RefMut};
use std::rc::Rc;

use crate::common::Path;
use crate::problem::ProblemInstance;

/// Contract every solver exposes: a run-to-completion `solve` whose failure
/// is a normal `false`, and the merged time-indexed path after success.
pub trait Solver {
    fn solve(&mut self, problem: &ProblemInstance) -> bool;

    /// The path found by the last successful solve; empty before one.
    fn path(&self) -> Path;
}

/// A solver bound to reservation and conflict-avoidance tables. Nested
/// solvers either share the parent's context (cheap `Clone` of the handles)
/// or push a fresh level onto it for the duration of a sub-solve.
pub trait ConstrainedSolver: Solver {
    fn tables(&self) -> &TableContext;
}

/// Shared handle to one reservation stack and one conflict-avoidance stack.
/// Cloning shares the underlying tables; execution is single-threaded, so
/// borrows are method-scoped and never held across solver calls.
#[derive(Debug, Clone, Default)]
pub struct TableContext {
    reservation: Rc<RefCell<MultiLevelReservation>>,
    cat: Rc<RefCell<MultiLevelCat>>,
}

impl TableContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reservation(&self) -> RefMut<'_, MultiLevelReservation> {
        self.reservation.borrow_mut()
    }

    pub fn cat(&self) -> RefMut<'_, MultiLevelCat> {
        self.cat.borrow_mut()
    }

    /// Push a fresh reservation level, popped again when the guard drops —
    /// including on early returns out of a failed sub-solve.
    pub fn reservation_level(&self) -> LevelGuard {
        self.reservation.borrow_mut().add_level();
        LevelGuard {
            reservation: Some(self.reservation.clone()),
            cat: None,
        }
    }

    /// Push a fresh conflict-avoidance level, popped when the guard drops.
    pub fn cat_level(&self) -> LevelGuard {
        self.cat.borrow_mut().add_level();
        LevelGuard {
            reservation: None,
            cat: Some(self.cat.clone()),
        }
    }
}

/// Scoped level acquisition for the multi-level tables; see
/// [`TableContext::reservation_level`].
#[derive(Debug)]
pub struct LevelGuard {
    reservation: Option<Rc<RefCell<MultiLevelReservation>>>,
    cat: Option<Rc<RefCell<MultiLevelCat>>>,
}

impl Drop for LevelGuard {
    fn drop(&mut self) {
        if let Some(reservation) = &self.reservation {
            reservation.borrow_mut().remove_level();
        }
        if let Some(cat) = &self.cat {
            cat.borrow_mut().remove_level();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Coordinate;

    #[test]
    fn test_level_guard_pops_on_drop() {
        let tables = TableContext::new();
        tables
            .reservation()
            .reserve_coordinate(Coordinate::new(2, 0), None);
        {
            let _guard = tables.reservation_level();
            assert_eq!(tables.reservation().depth(), 2);
            // The fresh level hides nothing below but starts empty.
            assert_eq!(tables.reservation().last_time_step(), 0);
        }
        assert_eq!(tables.reservation().depth(), 1);
        assert_eq!(tables.reservation().last_time_step(), 2);
    }

    #[test]
    fn test_level_guard_pops_on_early_exit() {
        let tables = TableContext::new();
        let failing = || -> anyhow::Result<()> {
            let _guard = tables.cat_level();
            anyhow::bail!("sub-solve failed");
        };
        assert!(failing().is_err());
        assert_eq!(tables.cat().depth(), 1);
    }

    #[test]
    fn test_cloned_context_shares_tables() {
        let tables = TableContext::new();
        let shared = tables.clone();
        shared
            .reservation()
            .reserve_coordinate(Coordinate::new(1, 3), None);
        assert_eq!(tables.reservation().last_time_step(), 1);
    }
}
