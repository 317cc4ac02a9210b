use std::ops::Range;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use super::error::{SimError, SimResult};
use super::history::{HistoricalDataLoader, HistoricalDataset};
use super::types::{Scenario, YearReturns};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scenario_type", rename_all = "snake_case")]
pub enum ScenarioConfig {
    Historical(HistoricalConfig),
    MonteCarlo(MonteCarloConfig),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoricalConfig {
    #[serde(default = "default_country")]
    pub country: String,
    /// Block length. `None` or 0 uses the whole dataset as one block.
    #[serde(default = "default_chunk_years")]
    pub chunk_years: Option<usize>,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Cash return for historical years.
    #[serde(default)]
    pub cash_return: f64,
    #[serde(default)]
    pub scenario_years: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloConfig {
    #[serde(default = "default_mean_stock")]
    pub mean_stock_return: f64,
    #[serde(default = "default_std_stock")]
    pub std_stock_return: f64,
    #[serde(default = "default_mean_bond")]
    pub mean_bond_return: f64,
    #[serde(default = "default_std_bond")]
    pub std_bond_return: f64,
    #[serde(default = "default_mean_inflation")]
    pub mean_inflation: f64,
    #[serde(default = "default_std_inflation")]
    pub std_inflation: f64,
    #[serde(default)]
    pub cash_return: f64,
    #[serde(default)]
    pub scenario_years: Option<usize>,
}

fn default_country() -> String {
    "spain".to_string()
}

fn default_chunk_years() -> Option<usize> {
    Some(1)
}

fn default_true() -> bool {
    true
}

fn default_mean_stock() -> f64 {
    0.07
}

fn default_std_stock() -> f64 {
    0.15
}

fn default_mean_bond() -> f64 {
    0.03
}

fn default_std_bond() -> f64 {
    0.05
}

fn default_mean_inflation() -> f64 {
    0.025
}

fn default_std_inflation() -> f64 {
    0.01
}

impl Default for HistoricalConfig {
    fn default() -> Self {
        Self {
            country: default_country(),
            chunk_years: default_chunk_years(),
            shuffle: true,
            cash_return: 0.0,
            scenario_years: None,
        }
    }
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            mean_stock_return: default_mean_stock(),
            std_stock_return: default_std_stock(),
            mean_bond_return: default_mean_bond(),
            std_bond_return: default_std_bond(),
            mean_inflation: default_mean_inflation(),
            std_inflation: default_std_inflation(),
            cash_return: 0.0,
            scenario_years: None,
        }
    }
}

impl ScenarioConfig {
    fn scenario_years(&self) -> Option<usize> {
        match self {
            Self::Historical(c) => c.scenario_years,
            Self::MonteCarlo(c) => c.scenario_years,
        }
    }

    /// Length of each generated path. An explicit `scenario_years` must cover
    /// the whole simulation; extra years are never consumed.
    pub fn years_for(&self, simulation_years: usize) -> SimResult<usize> {
        match self.scenario_years() {
            Some(years) if years < simulation_years => Err(SimError::InvalidConfig(format!(
                "scenario_years ({years}) is shorter than simulation_years ({simulation_years})"
            ))),
            _ => Ok(simulation_years),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ScenarioSource {
    Historical {
        dataset: Arc<HistoricalDataset>,
        blocks: Vec<Range<usize>>,
        shuffle: bool,
        cash_return: f64,
    },
    MonteCarlo {
        stock: Normal<f64>,
        bond: Normal<f64>,
        inflation: Normal<f64>,
        cash_return: f64,
    },
}

impl ScenarioSource {
    pub fn prepare(config: &ScenarioConfig, loader: &HistoricalDataLoader) -> SimResult<Self> {
        match config {
            ScenarioConfig::Historical(c) => Ok(Self::historical(
                loader.load(&c.country)?,
                c.chunk_years,
                c.shuffle,
                c.cash_return,
            )),
            ScenarioConfig::MonteCarlo(c) => Ok(Self::MonteCarlo {
                stock: normal("stock return", c.mean_stock_return, c.std_stock_return)?,
                bond: normal("bond return", c.mean_bond_return, c.std_bond_return)?,
                inflation: normal("inflation", c.mean_inflation, c.std_inflation)?,
                cash_return: c.cash_return,
            }),
        }
    }

    pub fn historical(
        dataset: Arc<HistoricalDataset>,
        chunk_years: Option<usize>,
        shuffle: bool,
        cash_return: f64,
    ) -> Self {
        let n = dataset.len();
        let chunk = match chunk_years {
            Some(chunk) if chunk > 0 => chunk,
            _ => n.max(1),
        };
        let blocks = (0..n)
            .step_by(chunk)
            .map(|start| start..(start + chunk).min(n))
            .collect();
        Self::Historical {
            dataset,
            blocks,
            shuffle,
            cash_return,
        }
    }

    pub fn generate<R: Rng + ?Sized>(&self, years: usize, rng: &mut R) -> Scenario {
        match self {
            Self::Historical {
                dataset,
                blocks,
                shuffle,
                cash_return,
            } => {
                let indices = assemble_indices(blocks, *shuffle, years, rng);
                Scenario::from_returns(indices.into_iter().map(|i| YearReturns {
                    stock: dataset.stock_returns[i],
                    bond: dataset.bond_returns[i],
                    cash: *cash_return,
                    inflation: dataset.inflation_rates[i],
                }))
            }
            Self::MonteCarlo {
                stock,
                bond,
                inflation,
                cash_return,
            } => Scenario::from_returns((0..years).map(|_| YearReturns {
                stock: stock.sample(rng),
                bond: bond.sample(rng),
                cash: *cash_return,
                inflation: inflation.sample(rng),
            })),
        }
    }
}

fn normal(name: &'static str, mean: f64, std_dev: f64) -> SimResult<Normal<f64>> {
    // rand_distr mirrors a negative std instead of rejecting it
    if !mean.is_finite() || !std_dev.is_finite() || std_dev < 0.0 {
        return Err(SimError::InvalidDistribution {
            name,
            message: format!("mean {mean}, std {std_dev}: std must be finite and >= 0"),
        });
    }
    Normal::new(mean, std_dev).map_err(|e| SimError::InvalidDistribution {
        name,
        message: format!("mean {mean}, std {std_dev}: {e}"),
    })
}

/// Whole blocks are appended until `years` indices exist, then the tail is cut.
fn assemble_indices<R: Rng + ?Sized>(
    blocks: &[Range<usize>],
    shuffle: bool,
    years: usize,
    rng: &mut R,
) -> Vec<usize> {
    let mut indices = Vec::with_capacity(years + blocks.first().map_or(0, |b| b.len()));
    if blocks.is_empty() {
        return indices;
    }

    let mut next_block = 0;
    while indices.len() < years {
        let block = if shuffle {
            &blocks[rng.random_range(0..blocks.len())]
        } else {
            let block = &blocks[next_block % blocks.len()];
            next_block += 1;
            block
        };
        indices.extend(block.clone());
    }
    indices.truncate(years);
    indices
}

pub fn derive_seed(master_seed: u64, run: u64) -> u64 {
    splitmix64(master_seed ^ splitmix64(run))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

pub fn run_rng(master_seed: u64, run: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(derive_seed(master_seed, run))
}
