use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::config::{AccumulationConfig, CombinedConfig, WithdrawalConfig};
use super::error::{SimError, SimResult};
use super::history::HistoricalDataLoader;
use super::results::{AccumulationResult, CombinedResult, WithdrawalResult};
use super::scenario::{ScenarioSource, run_rng};
use super::solver::{SolverParams, solve_gross_for_net};
use super::strategy::{StrategyConfig, StrategyState};
use super::tax::{TaxEngine, TaxRegistry};
use super::types::{
    Allocation, MarketData, Portfolio, Scenario, SimulationReport, YearRecord, deflate,
};

const GOAL_EPSILON: f64 = 1e-6;

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub parallel: bool,
    /// Checked before each run starts.
    pub cancel: Option<Arc<AtomicBool>>,
    pub solver: SolverParams,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            cancel: None,
            solver: SolverParams::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Simulator {
    loader: Arc<HistoricalDataLoader>,
    taxes: Arc<TaxRegistry>,
    options: RunOptions,
}

impl Simulator {
    pub fn new(loader: Arc<HistoricalDataLoader>, taxes: Arc<TaxRegistry>) -> Self {
        Self {
            loader,
            taxes,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn loader(&self) -> &HistoricalDataLoader {
        &self.loader
    }

    pub fn taxes(&self) -> &TaxRegistry {
        &self.taxes
    }

    pub fn run_withdrawal(&self, config: &WithdrawalConfig) -> SimResult<WithdrawalResult> {
        config.validate()?;
        let source = ScenarioSource::prepare(&config.scenario_config, &self.loader)?;
        let years = config.scenario_config.years_for(config.simulation_years)?;
        let tax = TaxEngine::from_config(&config.tax_config, &self.taxes)?;
        let plan = WithdrawalPlan {
            tax: &tax,
            net_withdrawals: config.net_withdrawals,
            solver: self.options.solver,
        };
        let start = PhaseStart {
            portfolio: config.initial_portfolio,
            rebalance: config.rebalance,
        };

        info!(
            runs = config.num_simulations,
            years,
            strategies = config.strategy_configs.len(),
            "starting withdrawal simulation"
        );
        let per_run = self.run_set(config.num_simulations, config.seed, |rng| {
            let scenario = source.generate(years, rng);
            config
                .strategy_configs
                .iter()
                .map(|strategy| simulate_withdrawal(&start, &scenario, strategy, &plan))
                .collect::<SimResult<Vec<_>>>()
        })?;

        let result = WithdrawalResult {
            config: config.clone(),
            all_strategy_reports: by_strategy(per_run, config.strategy_configs.len()),
        };
        info!(success_rate = result.success_rate(), "withdrawal simulation finished");
        Ok(result)
    }

    pub fn run_accumulation(&self, config: &AccumulationConfig) -> SimResult<AccumulationResult> {
        config.validate()?;
        let source = ScenarioSource::prepare(&config.scenario_config, &self.loader)?;
        let years = config.scenario_config.years_for(config.simulation_years)?;
        let tax = TaxEngine::from_config(&config.tax_config, &self.taxes)?;
        let savings = SavingsPlan {
            monthly_savings: config.monthly_savings,
            annual_increase: config.annual_increase,
            target_value: Some(config.target_value),
        };
        let start = PhaseStart {
            portfolio: config.initial_portfolio,
            rebalance: config.rebalance,
        };

        info!(runs = config.num_simulations, years, "starting accumulation simulation");
        let reports = self.run_set(config.num_simulations, config.seed, |rng| {
            let scenario = source.generate(years, rng);
            simulate_accumulation(&start, &scenario, &savings, &tax)
        })?;

        let result = AccumulationResult {
            config: config.clone(),
            reports,
        };
        info!(success_rate = result.success_rate(), "accumulation simulation finished");
        Ok(result)
    }

    pub fn run_combined(&self, config: &CombinedConfig) -> SimResult<CombinedResult> {
        config.validate()?;
        let source = ScenarioSource::prepare(&config.scenario_config, &self.loader)?;
        let years = config.scenario_config.years_for(config.simulation_years)?;
        let tax = TaxEngine::from_config(&config.tax_config, &self.taxes)?;
        let savings = SavingsPlan {
            monthly_savings: config.monthly_savings,
            annual_increase: config.annual_increase,
            target_value: config.target_value,
        };
        let plan = WithdrawalPlan {
            tax: &tax,
            net_withdrawals: config.net_withdrawals,
            solver: self.options.solver,
        };
        let start = PhaseStart {
            portfolio: config.initial_portfolio,
            rebalance: config.rebalance,
        };

        info!(
            runs = config.num_simulations,
            years,
            accumulation_years = config.accumulation_years,
            strategies = config.strategy_configs.len(),
            "starting combined simulation"
        );
        let per_run = self.run_set(config.num_simulations, config.seed, |rng| {
            let scenario = source.generate(years, rng);
            config
                .strategy_configs
                .iter()
                .map(|strategy| {
                    simulate_combined(
                        &start,
                        &scenario,
                        config.accumulation_years,
                        &savings,
                        strategy,
                        &plan,
                    )
                })
                .collect::<SimResult<Vec<_>>>()
        })?;

        let result = CombinedResult {
            config: config.clone(),
            all_strategy_reports: by_strategy(per_run, config.strategy_configs.len()),
        };
        info!(success_rate = result.success_rate(), "combined simulation finished");
        Ok(result)
    }

    fn run_set<T, F>(&self, runs: usize, seed: Option<u64>, run: F) -> SimResult<Vec<T>>
    where
        T: Send,
        F: Fn(&mut ChaCha8Rng) -> SimResult<T> + Sync,
    {
        let master_seed = seed.unwrap_or_else(rand::random);
        debug!(master_seed, runs, parallel = self.options.parallel, "run set");

        let one = |index: usize| -> SimResult<T> {
            if self.is_cancelled() {
                return Err(SimError::Cancelled);
            }
            let mut rng = run_rng(master_seed, index as u64);
            let outcome = run(&mut rng)?;
            debug!(run = index, "run finished");
            Ok(outcome)
        };

        let outcome: SimResult<Vec<T>> = if self.options.parallel {
            (0..runs).into_par_iter().map(one).collect()
        } else {
            (0..runs).map(one).collect()
        };
        if matches!(outcome, Err(SimError::Cancelled)) {
            warn!(runs, "simulation cancelled");
        }
        outcome
    }

    fn is_cancelled(&self) -> bool {
        self.options
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

// [run][strategy] -> [strategy][run]
fn by_strategy(
    per_run: Vec<Vec<SimulationReport>>,
    strategies: usize,
) -> Vec<Vec<SimulationReport>> {
    let mut out: Vec<Vec<SimulationReport>> = (0..strategies)
        .map(|_| Vec::with_capacity(per_run.len()))
        .collect();
    for run in per_run {
        for (slot, report) in out.iter_mut().zip(run) {
            slot.push(report);
        }
    }
    out
}

struct PhaseStart {
    portfolio: Portfolio,
    rebalance: bool,
}

struct WithdrawalPlan<'a> {
    tax: &'a TaxEngine,
    net_withdrawals: bool,
    solver: SolverParams,
}

struct SavingsPlan {
    monthly_savings: f64,
    annual_increase: f64,
    /// Real value that counts as reaching the goal.
    target_value: Option<f64>,
}

impl SavingsPlan {
    fn contribution(&self, year_index: usize) -> f64 {
        self.monthly_savings * 12.0 * (1.0 + self.annual_increase).powi(year_index as i32)
    }
}

struct YearOutcome {
    portfolio: Portfolio,
    gross_income: f64,
    net_income: f64,
    contribution: f64,
    capital_gains_tax: f64,
    wealth_tax: f64,
    goal_achieved: bool,
}

fn apply_returns(
    portfolio: &Portfolio,
    market: &MarketData,
    target: Allocation,
    rebalance: bool,
) -> SimResult<Portfolio> {
    let [stocks, bonds, cash] = portfolio.asset_values();
    let [stock_return, bond_return, cash_return] = market.asset_returns();
    let stocks = (stocks * (1.0 + stock_return)).max(0.0);
    let bonds = (bonds * (1.0 + bond_return)).max(0.0);
    let cash = (cash * (1.0 + cash_return)).max(0.0);
    if rebalance {
        Portfolio::new(stocks + bonds + cash, target)
    } else {
        Portfolio::from_values(stocks, bonds, cash)
    }
}

fn withdrawal_year(
    portfolio: &Portfolio,
    scenario: &Scenario,
    year_index: usize,
    start: &PhaseStart,
    strategy: &StrategyConfig,
    state: &mut StrategyState,
    plan: &WithdrawalPlan<'_>,
) -> SimResult<YearOutcome> {
    let history = scenario.history(year_index);
    let market = &scenario.years()[year_index];
    let cum = market.cumulative_inflation;

    let grown = apply_returns(portfolio, market, start.portfolio.allocation(), start.rebalance)?;
    let decision = strategy.decide(portfolio, &grown, history, state)?;
    let remaining = decision.portfolio;

    let (gross_income, net_income, tax, portfolio) = if plan.net_withdrawals {
        // Wealth tax is charged on what is left after the grossed-up
        // withdrawal, so the base shrinks as the guess grows.
        let desired = decision.withdrawal;
        let available = remaining.value();
        let tax_at = |gross: f64| {
            let extra = (gross - desired).clamp(0.0, available);
            plan.tax.calculate(gross, available - extra, Some(cum))
        };
        let solved = solve_gross_for_net(&tax_at, desired, plan.solver)?;
        let wanted_extra = (solved.gross_income - desired).max(0.0);
        let extra = wanted_extra.min(available);
        let gross = desired + extra;
        let tax = if extra < wanted_extra {
            tax_at(gross)
        } else {
            solved
        };
        let portfolio = Portfolio::new((available - extra).max(0.0), remaining.allocation())?;
        (gross, tax.net_income, tax, portfolio)
    } else {
        let gross = decision.withdrawal;
        let tax = plan.tax.calculate(gross, remaining.value(), Some(cum));
        let wealth_tax = tax.wealth_tax.min(remaining.value());
        let portfolio =
            Portfolio::new((remaining.value() - wealth_tax).max(0.0), remaining.allocation())?;
        (gross, gross - tax.capital_gains_tax, tax, portfolio)
    };

    // Net spend is only as exact as the reverse solver.
    let (spend, slack) = if plan.net_withdrawals {
        (net_income, GOAL_EPSILON + plan.solver.tolerance)
    } else {
        (gross_income, GOAL_EPSILON)
    };
    let goal_achieved =
        spend + slack >= strategy.spend_target(market) && portfolio.value() > 0.0;

    Ok(YearOutcome {
        portfolio,
        gross_income,
        net_income,
        contribution: 0.0,
        capital_gains_tax: tax.capital_gains_tax,
        wealth_tax: tax.wealth_tax,
        goal_achieved,
    })
}

fn accumulation_year(
    portfolio: &Portfolio,
    market: &MarketData,
    contribution_index: usize,
    start: &PhaseStart,
    savings: &SavingsPlan,
    tax: &TaxEngine,
) -> SimResult<YearOutcome> {
    let target = start.portfolio.allocation();
    let grown = apply_returns(portfolio, market, target, start.rebalance)?;
    let contribution = savings.contribution(contribution_index);

    // A depleted portfolio carries a placeholder allocation; new money
    // follows the plan instead.
    let allocation = if grown.value() > 0.0 {
        grown.allocation()
    } else {
        target
    };
    let funded = grown.value() + contribution;

    let tax = tax.calculate(0.0, funded, Some(market.cumulative_inflation));
    let wealth_tax = tax.wealth_tax.min(funded);
    let portfolio = Portfolio::new((funded - wealth_tax).max(0.0), allocation)?;

    let real_value = deflate(portfolio.value(), market.cumulative_inflation);
    let goal_achieved = savings
        .target_value
        .is_none_or(|target| real_value + GOAL_EPSILON >= target);

    Ok(YearOutcome {
        portfolio,
        gross_income: 0.0,
        net_income: 0.0,
        contribution,
        capital_gains_tax: 0.0,
        wealth_tax,
        goal_achieved,
    })
}

fn year_record(market: &MarketData, outcome: &YearOutcome) -> YearRecord {
    let cum = market.cumulative_inflation;
    YearRecord {
        year: market.year_index as u32 + 1,
        portfolio_value: outcome.portfolio.value(),
        real_portfolio_value: deflate(outcome.portfolio.value(), cum),
        gross_income: outcome.gross_income,
        real_gross_income: deflate(outcome.gross_income, cum),
        net_income: outcome.net_income,
        real_net_income: deflate(outcome.net_income, cum),
        contribution: outcome.contribution,
        real_contribution: deflate(outcome.contribution, cum),
        capital_gains_tax: outcome.capital_gains_tax,
        real_capital_gains_tax: deflate(outcome.capital_gains_tax, cum),
        wealth_tax: outcome.wealth_tax,
        real_wealth_tax: deflate(outcome.wealth_tax, cum),
        stock_return: market.stock_return,
        bond_return: market.bond_return,
        cash_return: market.cash_return,
        inflation_rate: market.inflation_rate,
        cumulative_inflation: cum,
        goal_achieved: outcome.goal_achieved,
    }
}

fn finish_report(
    start: &Portfolio,
    yearly_records: Vec<YearRecord>,
    goal_achieved: bool,
    years_to_target: Option<u32>,
) -> SimulationReport {
    let (final_portfolio_value, final_real_portfolio_value) = yearly_records
        .last()
        .map_or((start.value(), start.value()), |r| {
            (r.portfolio_value, r.real_portfolio_value)
        });
    SimulationReport {
        yearly_records,
        goal_achieved,
        final_portfolio_value,
        final_real_portfolio_value,
        years_to_target,
    }
}

fn simulate_withdrawal(
    start: &PhaseStart,
    scenario: &Scenario,
    strategy: &StrategyConfig,
    plan: &WithdrawalPlan<'_>,
) -> SimResult<SimulationReport> {
    let mut portfolio = start.portfolio;
    let mut state = StrategyState::default();
    let mut records = Vec::with_capacity(scenario.len());
    for (year_index, market) in scenario.years().iter().enumerate() {
        let outcome = withdrawal_year(
            &portfolio, scenario, year_index, start, strategy, &mut state, plan,
        )?;
        records.push(year_record(market, &outcome));
        portfolio = outcome.portfolio;
    }
    let goal = records.iter().all(|r| r.goal_achieved);
    Ok(finish_report(&start.portfolio, records, goal, None))
}

fn simulate_accumulation(
    start: &PhaseStart,
    scenario: &Scenario,
    savings: &SavingsPlan,
    tax: &TaxEngine,
) -> SimResult<SimulationReport> {
    let mut portfolio = start.portfolio;
    let mut records = Vec::with_capacity(scenario.len());
    for (year_index, market) in scenario.years().iter().enumerate() {
        let outcome = accumulation_year(&portfolio, market, year_index, start, savings, tax)?;
        records.push(year_record(market, &outcome));
        portfolio = outcome.portfolio;
    }
    let years_to_target = records.iter().find(|r| r.goal_achieved).map(|r| r.year);
    Ok(finish_report(
        &start.portfolio,
        records,
        years_to_target.is_some(),
        years_to_target,
    ))
}

fn simulate_combined(
    start: &PhaseStart,
    scenario: &Scenario,
    accumulation_years: usize,
    savings: &SavingsPlan,
    strategy: &StrategyConfig,
    plan: &WithdrawalPlan<'_>,
) -> SimResult<SimulationReport> {
    let mut portfolio = start.portfolio;
    let mut state = StrategyState::default();
    let mut records = Vec::with_capacity(scenario.len());
    let mut years_to_target = None;
    for (year_index, market) in scenario.years().iter().enumerate() {
        let outcome = if year_index < accumulation_years {
            let outcome =
                accumulation_year(&portfolio, market, year_index, start, savings, plan.tax)?;
            if savings.target_value.is_some() && outcome.goal_achieved && years_to_target.is_none()
            {
                years_to_target = Some(year_index as u32 + 1);
            }
            outcome
        } else {
            withdrawal_year(
                &portfolio, scenario, year_index, start, strategy, &mut state, plan,
            )?
        };
        records.push(year_record(market, &outcome));
        portfolio = outcome.portfolio;
    }
    let goal = records
        .iter()
        .skip(accumulation_years)
        .all(|r| r.goal_achieved);
    Ok(finish_report(&start.portfolio, records, goal, years_to_target))
}
