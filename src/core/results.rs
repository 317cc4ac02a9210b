use serde::Serialize;

use super::config::{AccumulationConfig, StrategyPlan};
use super::types::SimulationReport;

/// Reports for one run-set with one report collection per strategy, all
/// strategies having seen the same scenario in run `i`.
#[derive(Clone, Debug)]
pub struct MultiStrategyResult<C> {
    pub config: C,
    pub all_strategy_reports: Vec<Vec<SimulationReport>>,
}

pub type WithdrawalResult = MultiStrategyResult<super::config::WithdrawalConfig>;
pub type CombinedResult = MultiStrategyResult<super::config::CombinedConfig>;

#[derive(Clone, Debug)]
pub struct AccumulationResult {
    pub config: AccumulationConfig,
    pub reports: Vec<SimulationReport>,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct PercentileBand {
    pub p10: f64,
    pub median: f64,
    pub p90: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct YearBand {
    pub year: u32,
    pub real_portfolio_value: PercentileBand,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StrategySummary {
    pub strategy_index: usize,
    pub strategy_type: &'static str,
    pub success_rate: f64,
    pub num_simulations: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultSummary {
    pub num_simulations: usize,
    pub success_rate: f64,
    pub simulation_years: usize,
    /// 95% normal-approximation half-width of `success_rate`.
    pub success_ci_half_width: f64,
    pub final_real_portfolio_value: PercentileBand,
    pub yearly_real_portfolio_value: Vec<YearBand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub median_years_to_target: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_summaries: Option<Vec<StrategySummary>>,
}

impl<C: StrategyPlan> MultiStrategyResult<C> {
    /// Reports of the first strategy, or nothing when none ran.
    pub fn reports(&self) -> &[SimulationReport] {
        self.all_strategy_reports
            .first()
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn success_rate(&self) -> f64 {
        success_rate(self.reports())
    }

    pub fn success_rate_for(&self, strategy_index: usize) -> f64 {
        self.all_strategy_reports
            .get(strategy_index)
            .map_or(0.0, |reports| success_rate(reports))
    }

    pub fn summary(&self) -> ResultSummary {
        let mut summary = summarize(self.reports(), self.config.simulation_years());
        if self.all_strategy_reports.len() > 1 {
            summary.strategy_summaries = Some(
                self.all_strategy_reports
                    .iter()
                    .zip(self.config.strategy_configs())
                    .enumerate()
                    .map(|(strategy_index, (reports, strategy))| StrategySummary {
                        strategy_index,
                        strategy_type: strategy.strategy_type(),
                        success_rate: success_rate(reports),
                        num_simulations: reports.len(),
                    })
                    .collect(),
            );
        }
        summary
    }
}

impl AccumulationResult {
    pub fn success_rate(&self) -> f64 {
        success_rate(&self.reports)
    }

    pub fn summary(&self) -> ResultSummary {
        summarize(&self.reports, self.config.simulation_years)
    }
}

pub fn success_rate(reports: &[SimulationReport]) -> f64 {
    if reports.is_empty() {
        return 0.0;
    }
    reports.iter().filter(|r| r.goal_achieved).count() as f64 / reports.len() as f64
}

fn summarize(reports: &[SimulationReport], simulation_years: usize) -> ResultSummary {
    let rate = success_rate(reports);

    let mut finals: Vec<f64> = reports.iter().map(|r| r.final_real_portfolio_value).collect();

    let mut yearly = YearlyValues::new(simulation_years, reports.len());
    for report in reports {
        for (idx, record) in report.yearly_records.iter().enumerate() {
            yearly.push(idx, record.real_portfolio_value);
        }
    }

    let mut years_to_target: Vec<f64> = reports
        .iter()
        .filter_map(|r| r.years_to_target.map(f64::from))
        .collect();

    ResultSummary {
        num_simulations: reports.len(),
        success_rate: rate,
        simulation_years,
        success_ci_half_width: binomial_ci_half_width(rate, reports.len()),
        final_real_portfolio_value: band(&mut finals),
        yearly_real_portfolio_value: yearly.into_bands(),
        median_years_to_target: (!years_to_target.is_empty())
            .then(|| percentile(&mut years_to_target, 50.0)),
        strategy_summaries: None,
    }
}

struct YearlyValues {
    values: Vec<Vec<f64>>,
}

impl YearlyValues {
    fn new(years: usize, expected_samples: usize) -> Self {
        Self {
            values: (0..years)
                .map(|_| Vec::with_capacity(expected_samples))
                .collect(),
        }
    }

    fn push(&mut self, index: usize, value: f64) {
        if let Some(samples) = self.values.get_mut(index) {
            samples.push(value);
        }
    }

    fn into_bands(self) -> Vec<YearBand> {
        self.values
            .into_iter()
            .enumerate()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(idx, mut samples)| YearBand {
                year: idx as u32 + 1,
                real_portfolio_value: band(&mut samples),
            })
            .collect()
    }
}

fn band(values: &mut [f64]) -> PercentileBand {
    PercentileBand {
        p10: percentile(values, 10.0),
        median: percentile(values, 50.0),
        p90: percentile(values, 90.0),
    }
}

fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}

fn binomial_ci_half_width(p: f64, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::WithdrawalConfig;
    use crate::core::types::YearRecord;

    fn record(year: u32, real_value: f64) -> YearRecord {
        YearRecord {
            year,
            portfolio_value: real_value,
            real_portfolio_value: real_value,
            gross_income: 0.0,
            real_gross_income: 0.0,
            net_income: 0.0,
            real_net_income: 0.0,
            contribution: 0.0,
            real_contribution: 0.0,
            capital_gains_tax: 0.0,
            real_capital_gains_tax: 0.0,
            wealth_tax: 0.0,
            real_wealth_tax: 0.0,
            stock_return: 0.0,
            bond_return: 0.0,
            cash_return: 0.0,
            inflation_rate: 0.0,
            cumulative_inflation: 1.0,
            goal_achieved: true,
        }
    }

    fn report(goal_achieved: bool, values: &[f64]) -> SimulationReport {
        let yearly_records: Vec<YearRecord> = values
            .iter()
            .enumerate()
            .map(|(i, v)| record(i as u32 + 1, *v))
            .collect();
        let last = values.last().copied().unwrap_or(0.0);
        SimulationReport {
            yearly_records,
            goal_achieved,
            final_portfolio_value: last,
            final_real_portfolio_value: last,
            years_to_target: None,
        }
    }

    fn config(strategies: usize) -> WithdrawalConfig {
        let strategy = r#"{"strategy_type":"fixed_swr"}"#;
        serde_json::from_str(&format!(
            r#"{{"initial_portfolio":{{"portfolio_value":1000,
                    "allocation":{{"stocks":1,"bonds":0,"cash":0}}}},
                "scenario_config":{{"scenario_type":"monte_carlo"}},
                "strategy_configs":[{}],
                "simulation_years":3}}"#,
            vec![strategy; strategies].join(",")
        ))
        .unwrap()
    }

    #[test]
    fn reports_are_first_strategy_or_empty() {
        let r1 = vec![report(true, &[1.0, 2.0, 3.0])];
        let result = WithdrawalResult {
            config: config(1),
            all_strategy_reports: vec![r1.clone()],
        };
        assert_eq!(result.reports(), r1.as_slice());

        let empty = WithdrawalResult {
            config: config(1),
            all_strategy_reports: vec![],
        };
        assert!(empty.reports().is_empty());
        assert_eq!(empty.success_rate(), 0.0);
    }

    #[test]
    fn success_rates_per_strategy() {
        let result = WithdrawalResult {
            config: config(2),
            all_strategy_reports: vec![
                vec![report(true, &[1.0; 3]), report(true, &[1.0; 3])],
                vec![report(true, &[1.0; 3]), report(false, &[1.0; 3])],
            ],
        };
        assert_eq!(result.success_rate(), 1.0);
        assert_eq!(result.success_rate_for(0), 1.0);
        assert_eq!(result.success_rate_for(1), 0.5);
        assert_eq!(result.success_rate_for(7), 0.0);

        let summary = result.summary();
        let strategies = summary.strategy_summaries.expect("multi-strategy breakdown");
        assert_eq!(strategies.len(), 2);
        assert_eq!(strategies[1].strategy_index, 1);
        assert_eq!(strategies[1].success_rate, 0.5);
        assert_eq!(strategies[1].num_simulations, 2);
        assert_eq!(strategies[0].strategy_type, "fixed_swr");
    }

    #[test]
    fn single_strategy_summary_has_no_breakdown() {
        let result = WithdrawalResult {
            config: config(1),
            all_strategy_reports: vec![vec![report(true, &[1.0; 3]), report(false, &[1.0; 3])]],
        };
        let summary = result.summary();
        assert_eq!(summary.num_simulations, 2);
        assert_eq!(summary.success_rate, 0.5);
        assert_eq!(summary.simulation_years, 3);
        assert!(summary.strategy_summaries.is_none());
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("strategy_summaries").is_none());
    }

    #[test]
    fn yearly_bands_interpolate_across_runs() {
        let reports: Vec<_> = (0..11)
            .map(|i| report(true, &[i as f64 * 10.0, i as f64 * 20.0]))
            .collect();
        let summary = summarize(&reports, 2);
        assert_eq!(summary.yearly_real_portfolio_value.len(), 2);
        let second = &summary.yearly_real_portfolio_value[1];
        assert_eq!(second.year, 2);
        assert_eq!(second.real_portfolio_value.p10, 20.0);
        assert_eq!(second.real_portfolio_value.median, 100.0);
        assert_eq!(second.real_portfolio_value.p90, 180.0);
        assert_eq!(summary.final_real_portfolio_value.median, 100.0);
        assert_eq!(summary.success_ci_half_width, 0.0);
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0];
        assert_eq!(percentile(&mut values, 50.0), 2.5);
        assert_eq!(percentile(&mut [], 50.0), 0.0);
    }
}
