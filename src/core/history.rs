use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tracing::debug;

use super::error::{SimError, SimResult};

pub const DEFAULT_DATA_DIR: &str = "data/historical";
const INFLATION_FILE: &str = "inflation/consumer_price_index.json";

struct CountrySources {
    country: &'static str,
    stocks: &'static str,
    bonds: &'static str,
    inflation_key: &'static str,
}

const COUNTRY_REGISTRY: &[CountrySources] = &[CountrySources {
    country: "spain",
    stocks: "stocks/msci_world_eur.json",
    bonds: "bonds/euro_gov.json",
    inflation_key: "spain",
}];

pub fn available_countries() -> Vec<&'static str> {
    COUNTRY_REGISTRY.iter().map(|c| c.country).collect()
}

/// Calendar-aligned annual series. All vectors share one index.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoricalDataset {
    pub start_year: i32,
    pub end_year: i32,
    pub years: Vec<i32>,
    pub stock_returns: Vec<f64>,
    pub bond_returns: Vec<f64>,
    pub inflation_rates: Vec<f64>,
}

impl HistoricalDataset {
    /// Keeps only the years present in all three series, ascending.
    pub fn align(
        country: &str,
        stocks: &BTreeMap<i32, f64>,
        bonds: &BTreeMap<i32, f64>,
        inflation: &BTreeMap<i32, f64>,
    ) -> SimResult<Self> {
        let years: Vec<i32> = stocks
            .keys()
            .filter(|year| bonds.contains_key(year) && inflation.contains_key(year))
            .copied()
            .collect();
        let (Some(&start_year), Some(&end_year)) = (years.first(), years.last()) else {
            return Err(SimError::NoOverlap(country.to_string()));
        };

        Ok(Self {
            start_year,
            end_year,
            stock_returns: years.iter().map(|y| stocks[y]).collect(),
            bond_returns: years.iter().map(|y| bonds[y]).collect(),
            inflation_rates: years.iter().map(|y| inflation[y]).collect(),
            years,
        })
    }

    pub fn len(&self) -> usize {
        self.years.len()
    }

    pub fn is_empty(&self) -> bool {
        self.years.is_empty()
    }
}

#[derive(Deserialize)]
struct StockFile {
    data: Vec<StockRow>,
}

#[derive(Deserialize)]
struct StockRow {
    year: i32,
    #[serde(rename = "return")]
    value: f64,
}

#[derive(Deserialize)]
struct BondFile {
    data: Vec<BondRow>,
}

#[derive(Deserialize)]
struct BondRow {
    date: String,
    #[serde(rename = "return")]
    value: f64,
}

#[derive(Deserialize)]
struct InflationFile {
    data: HashMap<String, Vec<InflationRow>>,
}

#[derive(Deserialize)]
struct InflationRow {
    year: i32,
    indicator: f64,
}

/// Percent figures per year, converted to decimals.
pub fn parse_stock_returns(path: &Path, raw: &str) -> SimResult<BTreeMap<i32, f64>> {
    let file: StockFile = serde_json::from_str(raw).map_err(|e| format_error(path, e))?;
    Ok(file
        .data
        .into_iter()
        .map(|row| (row.year, row.value / 100.0))
        .collect())
}

/// Monthly yields averaged per calendar year. Years without all twelve
/// months are dropped.
pub fn parse_bond_yields(path: &Path, raw: &str) -> SimResult<BTreeMap<i32, f64>> {
    let file: BondFile = serde_json::from_str(raw).map_err(|e| format_error(path, e))?;
    let mut months: BTreeMap<i32, Vec<f64>> = BTreeMap::new();
    for row in file.data {
        let year = row
            .date
            .get(..4)
            .and_then(|y| y.parse::<i32>().ok())
            .ok_or_else(|| SimError::DatasetFormat {
                path: path.to_path_buf(),
                message: format!("bad date '{}'", row.date),
            })?;
        months.entry(year).or_default().push(row.value);
    }

    Ok(months
        .into_iter()
        .filter(|(_, values)| values.len() == 12)
        .map(|(year, values)| (year, values.iter().sum::<f64>() / 12.0 / 100.0))
        .collect())
}

pub fn parse_inflation(path: &Path, raw: &str, key: &str) -> SimResult<BTreeMap<i32, f64>> {
    let mut file: InflationFile = serde_json::from_str(raw).map_err(|e| format_error(path, e))?;
    let Some(rows) = file.data.remove(key) else {
        let mut available: Vec<_> = file.data.keys().cloned().collect();
        available.sort();
        return Err(SimError::DatasetFormat {
            path: path.to_path_buf(),
            message: format!("no inflation series '{key}' (available: {})", available.join(", ")),
        });
    };
    Ok(rows
        .into_iter()
        .map(|row| (row.year, row.indicator / 100.0))
        .collect())
}

fn format_error(path: &Path, e: serde_json::Error) -> SimError {
    SimError::DatasetFormat {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Reads historical series from disk once per country and hands out the
/// same shared dataset afterwards.
#[derive(Debug)]
pub struct HistoricalDataLoader {
    root: PathBuf,
    cache: Mutex<HashMap<String, Arc<HistoricalDataset>>>,
}

impl HistoricalDataLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load(&self, country: &str) -> SimResult<Arc<HistoricalDataset>> {
        let key = country.to_lowercase();
        let sources = COUNTRY_REGISTRY
            .iter()
            .find(|c| c.country == key)
            .ok_or_else(|| SimError::UnknownCountry {
                country: country.to_string(),
                available: available_countries().join(", "),
            })?;

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(dataset) = cache.get(&key) {
            return Ok(Arc::clone(dataset));
        }

        let dataset = Arc::new(self.read_country(sources)?);
        debug!(
            country = %key,
            start_year = dataset.start_year,
            end_year = dataset.end_year,
            years = dataset.len(),
            "loaded historical dataset"
        );
        cache.insert(key, Arc::clone(&dataset));
        Ok(dataset)
    }

    fn read_country(&self, sources: &CountrySources) -> SimResult<HistoricalDataset> {
        let stocks_path = self.root.join(sources.stocks);
        let bonds_path = self.root.join(sources.bonds);
        let inflation_path = self.root.join(INFLATION_FILE);

        let stocks = parse_stock_returns(&stocks_path, &read(&stocks_path)?)?;
        let bonds = parse_bond_yields(&bonds_path, &read(&bonds_path)?)?;
        let inflation =
            parse_inflation(&inflation_path, &read(&inflation_path)?, sources.inflation_key)?;

        HistoricalDataset::align(sources.country, &stocks, &bonds, &inflation)
    }
}

impl Default for HistoricalDataLoader {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}

fn read(path: &Path) -> SimResult<String> {
    fs::read_to_string(path).map_err(|source| SimError::DatasetIo {
        path: path.to_path_buf(),
        source,
    })
}
