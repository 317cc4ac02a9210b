mod config;
mod engine;
mod error;
mod history;
mod results;
mod scenario;
mod solver;
mod strategy;
mod tax;
mod types;

pub use config::{AccumulationConfig, CombinedConfig, StrategyPlan, WithdrawalConfig};
pub use engine::{RunOptions, Simulator};
pub use error::{ErrorKind, SimError, SimResult};
pub use history::{
    DEFAULT_DATA_DIR, HistoricalDataLoader, HistoricalDataset, available_countries,
};
pub use results::{
    AccumulationResult, CombinedResult, MultiStrategyResult, PercentileBand, ResultSummary,
    StrategySummary, WithdrawalResult, YearBand,
};
pub use scenario::{
    HistoricalConfig, MonteCarloConfig, ScenarioConfig, ScenarioSource, derive_seed,
};
pub use solver::{SolverParams, solve_gross_for_net};
pub use strategy::{
    CashBufferConfig, ConstantDollarConfig, FixedSwrConfig, HebelerAutopilotConfig,
    StrategyConfig, StrategyDecision, StrategyState,
};
pub use tax::{Bracket, RegionTables, TaxConfig, TaxEngine, TaxRegistry, TaxResult};
pub use types::{
    Allocation, MarketData, Portfolio, Scenario, SimulationReport, YearRecord, YearReturns,
    deflate,
};

#[cfg(test)]
pub(crate) use history::tests::write_fixture as write_history_fixture;
