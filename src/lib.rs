pub mod common;
pub mod graph;
pub mod heuristic;
pub mod problem;
pub mod solver;
pub mod stat;

pub use common::{Agent, Conflict, ConflictKind, Coordinate, Cost, CostFunction, Path};
pub use graph::{Connectedness, Graph, NodeId, Terrain};
pub use heuristic::TDHeuristic;
pub use problem::ProblemInstance;
pub use solver::{
    ConflictBasedSearch, ConstrainedSolver, CooperativeAStar, EnhancedId, GenericAStar,
    IndependenceDetection, MetaAgentCbs, SearchStrategy, Solver, TableContext,
};
pub use stat::Stats;
