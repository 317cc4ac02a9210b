use serde::{Deserialize, Serialize};

use super::error::{SimError, SimResult};
use super::scenario::ScenarioConfig;
use super::strategy::StrategyConfig;
use super::tax::TaxConfig;
use super::types::Portfolio;

fn default_num_simulations() -> usize {
    1
}

/// Retirement drawdown over `simulation_years`, one report set per strategy.
///
/// Accepts either `strategy_config` or `strategy_configs` on input; the
/// list wins when both are present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWithdrawalConfig")]
pub struct WithdrawalConfig {
    pub initial_portfolio: Portfolio,
    pub rebalance: bool,
    pub scenario_config: ScenarioConfig,
    pub strategy_configs: Vec<StrategyConfig>,
    pub tax_config: TaxConfig,
    pub simulation_years: usize,
    pub num_simulations: usize,
    /// Treat each strategy amount as desired net income and gross it up.
    pub net_withdrawals: bool,
    pub seed: Option<u64>,
}

#[derive(Deserialize)]
struct RawWithdrawalConfig {
    initial_portfolio: Portfolio,
    #[serde(default)]
    rebalance: bool,
    scenario_config: ScenarioConfig,
    #[serde(default)]
    strategy_config: Option<StrategyConfig>,
    #[serde(default)]
    strategy_configs: Option<Vec<StrategyConfig>>,
    #[serde(default = "TaxConfig::none")]
    tax_config: TaxConfig,
    simulation_years: usize,
    #[serde(default = "default_num_simulations")]
    num_simulations: usize,
    #[serde(default)]
    net_withdrawals: bool,
    #[serde(default)]
    seed: Option<u64>,
}

impl TryFrom<RawWithdrawalConfig> for WithdrawalConfig {
    type Error = SimError;

    fn try_from(raw: RawWithdrawalConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            initial_portfolio: raw.initial_portfolio,
            rebalance: raw.rebalance,
            scenario_config: raw.scenario_config,
            strategy_configs: normalize_strategies(raw.strategy_config, raw.strategy_configs)?,
            tax_config: raw.tax_config,
            simulation_years: raw.simulation_years,
            num_simulations: raw.num_simulations,
            net_withdrawals: raw.net_withdrawals,
            seed: raw.seed,
        })
    }
}

fn normalize_strategies(
    single: Option<StrategyConfig>,
    many: Option<Vec<StrategyConfig>>,
) -> SimResult<Vec<StrategyConfig>> {
    match (many, single) {
        (Some(many), _) => Ok(many),
        (None, Some(single)) => Ok(vec![single]),
        (None, None) => Err(SimError::InvalidConfig(
            "one of strategy_config or strategy_configs is required".to_string(),
        )),
    }
}

impl WithdrawalConfig {
    /// First configured strategy, for single-strategy callers.
    pub fn strategy_config(&self) -> Option<&StrategyConfig> {
        self.strategy_configs.first()
    }

    pub fn validate(&self) -> SimResult<()> {
        validate_horizon(self.simulation_years, self.num_simulations)?;
        validate_strategies(&self.strategy_configs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccumulationConfig {
    pub monthly_savings: f64,
    /// Nominal yearly growth of the savings amount.
    #[serde(default)]
    pub annual_increase: f64,
    /// Real (year-0 money) portfolio value that counts as success.
    pub target_value: f64,
    pub initial_portfolio: Portfolio,
    #[serde(default)]
    pub rebalance: bool,
    pub scenario_config: ScenarioConfig,
    #[serde(default = "TaxConfig::none")]
    pub tax_config: TaxConfig,
    pub simulation_years: usize,
    #[serde(default = "default_num_simulations")]
    pub num_simulations: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl AccumulationConfig {
    pub fn validate(&self) -> SimResult<()> {
        validate_horizon(self.simulation_years, self.num_simulations)?;
        if self.monthly_savings < 0.0 {
            return Err(SimError::InvalidConfig(
                "monthly_savings cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Saving for `accumulation_years`, then withdrawing for the rest of
/// `simulation_years` from whatever was built up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCombinedConfig")]
pub struct CombinedConfig {
    pub initial_portfolio: Portfolio,
    pub rebalance: bool,
    pub scenario_config: ScenarioConfig,
    pub tax_config: TaxConfig,
    pub simulation_years: usize,
    pub num_simulations: usize,
    pub seed: Option<u64>,
    pub monthly_savings: f64,
    pub annual_increase: f64,
    pub accumulation_years: usize,
    /// Optional real target checked during the saving years.
    pub target_value: Option<f64>,
    pub strategy_configs: Vec<StrategyConfig>,
    pub net_withdrawals: bool,
}

#[derive(Deserialize)]
struct RawCombinedConfig {
    initial_portfolio: Portfolio,
    #[serde(default)]
    rebalance: bool,
    scenario_config: ScenarioConfig,
    #[serde(default = "TaxConfig::none")]
    tax_config: TaxConfig,
    simulation_years: usize,
    #[serde(default = "default_num_simulations")]
    num_simulations: usize,
    #[serde(default)]
    seed: Option<u64>,
    monthly_savings: f64,
    #[serde(default)]
    annual_increase: f64,
    accumulation_years: usize,
    #[serde(default)]
    target_value: Option<f64>,
    #[serde(default)]
    strategy_config: Option<StrategyConfig>,
    #[serde(default)]
    strategy_configs: Option<Vec<StrategyConfig>>,
    #[serde(default)]
    net_withdrawals: bool,
}

impl TryFrom<RawCombinedConfig> for CombinedConfig {
    type Error = SimError;

    fn try_from(raw: RawCombinedConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            initial_portfolio: raw.initial_portfolio,
            rebalance: raw.rebalance,
            scenario_config: raw.scenario_config,
            tax_config: raw.tax_config,
            simulation_years: raw.simulation_years,
            num_simulations: raw.num_simulations,
            seed: raw.seed,
            monthly_savings: raw.monthly_savings,
            annual_increase: raw.annual_increase,
            accumulation_years: raw.accumulation_years,
            target_value: raw.target_value,
            strategy_configs: normalize_strategies(raw.strategy_config, raw.strategy_configs)?,
            net_withdrawals: raw.net_withdrawals,
        })
    }
}

impl CombinedConfig {
    pub fn validate(&self) -> SimResult<()> {
        validate_horizon(self.simulation_years, self.num_simulations)?;
        validate_strategies(&self.strategy_configs)?;
        if self.accumulation_years >= self.simulation_years {
            return Err(SimError::InvalidConfig(format!(
                "accumulation_years ({}) must be below simulation_years ({})",
                self.accumulation_years, self.simulation_years
            )));
        }
        if self.monthly_savings < 0.0 {
            return Err(SimError::InvalidConfig(
                "monthly_savings cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared by the result types that carry one report set per strategy.
pub trait StrategyPlan {
    fn strategy_configs(&self) -> &[StrategyConfig];
    fn simulation_years(&self) -> usize;
}

impl StrategyPlan for WithdrawalConfig {
    fn strategy_configs(&self) -> &[StrategyConfig] {
        &self.strategy_configs
    }

    fn simulation_years(&self) -> usize {
        self.simulation_years
    }
}

impl StrategyPlan for CombinedConfig {
    fn strategy_configs(&self) -> &[StrategyConfig] {
        &self.strategy_configs
    }

    fn simulation_years(&self) -> usize {
        self.simulation_years
    }
}

fn validate_horizon(simulation_years: usize, num_simulations: usize) -> SimResult<()> {
    if simulation_years == 0 {
        return Err(SimError::InvalidConfig(
            "simulation_years must be at least 1".to_string(),
        ));
    }
    if num_simulations == 0 {
        return Err(SimError::InvalidConfig(
            "num_simulations must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_strategies(strategies: &[StrategyConfig]) -> SimResult<()> {
    if strategies.is_empty() {
        return Err(SimError::InvalidConfig(
            "at least one strategy is required".to_string(),
        ));
    }
    Ok(())
}
