mod cache;
mod engine;
mod solver;
mod types;

pub use cache::{ResultCache, cache_key};
pub use engine::{
    EngineConfig, MarketRegime, MarketRegimeModel, SeededRng, SimulationEngine, SimulationError,
    derive_optimized_input,
};
pub use solver::{ABSOLUTE_RATE_CEILING, SolverConfig, solve_required_savings_rate};
pub use types::{
    ConfidenceInterval, Goal, GoalProjection, Horizon, HorizonValues, MAX_GOALS, NormalizedGoal,
    OptimizedPathResult, PathResult, ResolvedParams, RunMetadata, SIMULATION_MONTHS,
    SimulationInput, SimulationOutput, months_until,
};
