use axum::{
    Router,
    extract::{Json, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::core::{
    AccumulationConfig, CombinedConfig, ErrorKind, ResultSummary, SimError, SimulationReport,
    Simulator, WithdrawalConfig, available_countries,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationMode {
    Withdrawal,
    Accumulation,
    Combined,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    Body(String),
    #[error(transparent)]
    Simulation(#[from] SimError),
    #[error("failed to encode response: {0}")]
    Encode(serde_json::Error),
    #[error("simulation task failed: {0}")]
    Task(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Body(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Simulation(err) => match err.kind() {
                ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Encode(_) | Self::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct SimulateResponse<'a> {
    summary: ResultSummary,
    reports: &'a [SimulationReport],
    #[serde(skip_serializing_if = "Option::is_none")]
    all_strategy_reports: Option<&'a [Vec<SimulationReport>]>,
}

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    #[serde(default = "default_mode")]
    mode: SimulationMode,
    config: Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum CountryInfo {
    Loaded {
        country: &'static str,
        start_year: i32,
        end_year: i32,
        num_years: usize,
    },
    Unavailable {
        country: &'static str,
        error: String,
    },
}

fn default_mode() -> SimulationMode {
    SimulationMode::Withdrawal
}

fn parse<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::Body(e.to_string()))
}

fn encode<T: Serialize>(body: &T) -> Result<Value, ApiError> {
    serde_json::to_value(body).map_err(ApiError::Encode)
}

fn multi_strategy_response(
    summary: ResultSummary,
    all: &[Vec<SimulationReport>],
) -> Result<Value, ApiError> {
    let reports = all.first().map(Vec::as_slice).unwrap_or(&[]);
    encode(&SimulateResponse {
        summary,
        reports,
        all_strategy_reports: (all.len() > 1).then_some(all),
    })
}

pub fn withdrawal_payload(sim: &Simulator, body: Value) -> Result<Value, ApiError> {
    let config: WithdrawalConfig = parse(body)?;
    let result = sim.run_withdrawal(&config)?;
    multi_strategy_response(result.summary(), &result.all_strategy_reports)
}

pub fn accumulation_payload(sim: &Simulator, body: Value) -> Result<Value, ApiError> {
    let config: AccumulationConfig = parse(body)?;
    let result = sim.run_accumulation(&config)?;
    encode(&SimulateResponse {
        summary: result.summary(),
        reports: &result.reports,
        all_strategy_reports: None,
    })
}

pub fn combined_payload(sim: &Simulator, body: Value) -> Result<Value, ApiError> {
    let config: CombinedConfig = parse(body)?;
    let result = sim.run_combined(&config)?;
    multi_strategy_response(result.summary(), &result.all_strategy_reports)
}

pub fn run_mode(sim: &Simulator, mode: SimulationMode, body: Value) -> Result<Value, ApiError> {
    match mode {
        SimulationMode::Withdrawal => withdrawal_payload(sim, body),
        SimulationMode::Accumulation => accumulation_payload(sim, body),
        SimulationMode::Combined => combined_payload(sim, body),
    }
}

pub fn validate_payload(body: Value) -> Result<Value, ApiError> {
    let request: ValidateRequest = parse(body)?;
    match request.mode {
        SimulationMode::Withdrawal => parse::<WithdrawalConfig>(request.config)?.validate()?,
        SimulationMode::Accumulation => parse::<AccumulationConfig>(request.config)?.validate()?,
        SimulationMode::Combined => parse::<CombinedConfig>(request.config)?.validate()?,
    }
    Ok(serde_json::json!({ "valid": true, "mode": request.mode }))
}

pub fn tax_regions_payload(sim: &Simulator) -> Result<Value, ApiError> {
    encode(&sim.taxes().regions())
}

pub fn countries_payload(sim: &Simulator) -> Result<Value, ApiError> {
    let countries: Vec<CountryInfo> = available_countries()
        .into_iter()
        .map(|country| match sim.loader().load(country) {
            Ok(dataset) => CountryInfo::Loaded {
                country,
                start_year: dataset.start_year,
                end_year: dataset.end_year,
                num_years: dataset.len(),
            },
            Err(err) => {
                warn!(country, error = %err, "historical data unavailable");
                CountryInfo::Unavailable {
                    country,
                    error: err.to_string(),
                }
            }
        })
        .collect();
    encode(&countries)
}

pub fn router(sim: Arc<Simulator>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/validate", post(validate_handler))
        .route("/api/simulate", post(simulate_handler))
        .route("/api/accumulate", post(accumulate_handler))
        .route("/api/combined", post(combined_handler))
        .route("/api/tax-regions", get(tax_regions_handler))
        .route("/api/scenarios/countries", get(countries_handler))
        .fallback(not_found_handler)
        .with_state(sim)
}

pub async fn run_http_server(port: u16, sim: Simulator) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(Arc::new(sim));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "simulation HTTP API listening");

    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn validate_handler(body: Result<Json<Value>, JsonRejection>) -> Response {
    match body {
        Ok(Json(body)) => respond(validate_payload(body)),
        Err(rejection) => error_response(StatusCode::UNPROCESSABLE_ENTITY, &rejection.body_text()),
    }
}

async fn simulate_handler(
    State(sim): State<Arc<Simulator>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    run_blocking(sim, body, SimulationMode::Withdrawal).await
}

async fn accumulate_handler(
    State(sim): State<Arc<Simulator>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    run_blocking(sim, body, SimulationMode::Accumulation).await
}

async fn combined_handler(
    State(sim): State<Arc<Simulator>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    run_blocking(sim, body, SimulationMode::Combined).await
}

async fn tax_regions_handler(State(sim): State<Arc<Simulator>>) -> Response {
    respond(tax_regions_payload(&sim))
}

async fn countries_handler(State(sim): State<Arc<Simulator>>) -> Response {
    let outcome = tokio::task::spawn_blocking(move || countries_payload(&sim))
        .await
        .unwrap_or_else(|e| Err(ApiError::Task(e.to_string())));
    respond(outcome)
}

async fn run_blocking(
    sim: Arc<Simulator>,
    body: Result<Json<Value>, JsonRejection>,
    mode: SimulationMode,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, &rejection.body_text());
        }
    };
    let outcome = tokio::task::spawn_blocking(move || run_mode(&sim, mode, body))
        .await
        .unwrap_or_else(|e| Err(ApiError::Task(e.to_string())));
    respond(outcome)
}

fn respond(outcome: Result<Value, ApiError>) -> Response {
    match outcome {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => {
            let status = err.status();
            if status.is_server_error() {
                error!(error = %err, "request failed");
            }
            error_response(status, &err.to_string())
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HistoricalDataLoader, TaxRegistry, write_history_fixture};
    use serde_json::json;

    fn simulator() -> Simulator {
        Simulator::new(
            Arc::new(HistoricalDataLoader::new("does/not/exist")),
            Arc::new(TaxRegistry::embedded().unwrap()),
        )
    }

    fn withdrawal_body() -> Value {
        json!({
            "initial_portfolio": {
                "portfolio_value": 1_000_000.0,
                "allocation": {"stocks": 0.6, "bonds": 0.3, "cash": 0.1}
            },
            "rebalance": true,
            "scenario_config": {
                "scenario_type": "monte_carlo",
                "std_stock_return": 0.0,
                "std_bond_return": 0.0,
                "std_inflation": 0.0,
                "mean_inflation": 0.02,
                "cash_return": 0.01
            },
            "strategy_config": {"strategy_type": "fixed_swr", "withdrawal_rate": 0.04},
            "simulation_years": 5,
            "num_simulations": 3,
            "seed": 42
        })
    }

    #[test]
    fn withdrawal_payload_returns_summary_and_first_strategy_reports() {
        let body = withdrawal_payload(&simulator(), withdrawal_body()).unwrap();

        assert_eq!(body["summary"]["num_simulations"], json!(3));
        assert_eq!(body["summary"]["success_rate"], json!(1.0));
        assert_eq!(body["reports"].as_array().unwrap().len(), 3);
        assert_eq!(
            body["reports"][0]["yearly_records"].as_array().unwrap().len(),
            5
        );
        assert!(body.get("all_strategy_reports").is_none());
        assert!(body["summary"].get("strategy_summaries").is_none());
        let gross = body["reports"][0]["yearly_records"][0]["gross_income"]
            .as_f64()
            .unwrap();
        assert!((gross - 42_080.0).abs() < 1e-6);
    }

    #[test]
    fn several_strategies_add_the_full_breakdown() {
        let mut body = withdrawal_body();
        body["strategy_configs"] = json!([
            {"strategy_type": "fixed_swr"},
            {"strategy_type": "constant_dollar", "withdrawal_amount": 30_000.0},
            {"strategy_type": "hebeler_autopilot_ii"},
            {
                "strategy_type": "cash_buffer",
                "withdrawal_rate_buffer": 0.01,
                "subsistence_withdrawal": 20_000.0,
                "standard_withdrawal": 35_000.0,
                "maximum_withdrawal": 50_000.0,
                "buffer_target": 40_000.0
            }
        ]);
        let body = withdrawal_payload(&simulator(), body).unwrap();

        assert_eq!(body["all_strategy_reports"].as_array().unwrap().len(), 4);
        let summaries = body["summary"]["strategy_summaries"].as_array().unwrap();
        assert_eq!(summaries.len(), 4);
        assert_eq!(summaries[2]["strategy_type"], json!("hebeler_autopilot_ii"));
    }

    #[test]
    fn malformed_and_invalid_configs_are_client_errors() {
        let err = withdrawal_payload(&simulator(), json!({"rebalance": "yes"})).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let mut body = withdrawal_body();
        body["initial_portfolio"]["allocation"] = json!({"stocks": 0.7, "bonds": 0.7, "cash": 0.0});
        let err = withdrawal_payload(&simulator(), body).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let mut body = withdrawal_body();
        body["strategy_config"] = json!({"strategy_type": "yolo"});
        let err = withdrawal_payload(&simulator(), body).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let mut body = withdrawal_body();
        body["tax_config"] = json!({"country": "spain", "region": "nowhere"});
        let err = withdrawal_payload(&simulator(), body).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn missing_historical_files_are_server_errors() {
        let mut body = withdrawal_body();
        body["scenario_config"] = json!({"scenario_type": "historical"});
        let err = withdrawal_payload(&simulator(), body).unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn accumulation_payload_reports_years_to_target() {
        let body = json!({
            "monthly_savings": 1_000.0,
            "target_value": 1_050_000.0,
            "initial_portfolio": {
                "portfolio_value": 1_000_000.0,
                "allocation": {"stocks": 0.6, "bonds": 0.3, "cash": 0.1}
            },
            "scenario_config": {
                "scenario_type": "monte_carlo",
                "mean_stock_return": 0.05,
                "std_stock_return": 0.0,
                "mean_bond_return": 0.0,
                "std_bond_return": 0.0,
                "mean_inflation": 0.0,
                "std_inflation": 0.0
            },
            "simulation_years": 4,
            "num_simulations": 2
        });
        let body = accumulation_payload(&simulator(), body).unwrap();
        // 1,030,000 + 12,000 after one year, past the target after two
        assert_eq!(body["reports"][0]["years_to_target"], json!(2));
        assert_eq!(body["summary"]["median_years_to_target"], json!(2.0));
        assert!(body.get("all_strategy_reports").is_none());
    }

    #[test]
    fn combined_payload_rejects_an_empty_withdrawal_phase() {
        let mut body = withdrawal_body();
        body["monthly_savings"] = json!(500.0);
        body["accumulation_years"] = json!(5);
        let err = combined_payload(&simulator(), body.clone()).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        body["accumulation_years"] = json!(2);
        let ok = combined_payload(&simulator(), body).unwrap();
        let records = ok["reports"][0]["yearly_records"].as_array().unwrap();
        assert_eq!(records[0]["contribution"], json!(6_000.0));
        assert_eq!(records[4]["contribution"], json!(0.0));
    }

    #[test]
    fn validate_checks_without_running() {
        let ok = validate_payload(json!({"config": withdrawal_body()})).unwrap();
        assert_eq!(ok, json!({"valid": true, "mode": "withdrawal"}));

        let mut bad = withdrawal_body();
        bad["simulation_years"] = json!(0);
        let err = validate_payload(json!({"mode": "withdrawal", "config": bad})).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let err = validate_payload(json!({"mode": "accumulation", "config": withdrawal_body()}))
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn tax_regions_lists_embedded_tables() {
        let body = tax_regions_payload(&simulator()).unwrap();
        let spain = body["spain"].as_array().unwrap();
        for region in ["general", "madrid", "biscay"] {
            assert!(spain.contains(&json!(region)));
        }
    }

    #[test]
    fn countries_reports_loaded_and_missing_data() {
        let body = countries_payload(&simulator()).unwrap();
        assert_eq!(body[0]["country"], json!("spain"));
        assert!(body[0].get("error").is_some());

        let dir = tempfile::tempdir().unwrap();
        write_history_fixture(dir.path());
        let sim = Simulator::new(
            Arc::new(HistoricalDataLoader::new(dir.path())),
            Arc::new(TaxRegistry::embedded().unwrap()),
        );
        let body = countries_payload(&sim).unwrap();
        assert_eq!(
            body,
            json!([{"country": "spain", "start_year": 2000, "end_year": 2003, "num_years": 4}])
        );
    }

    #[test]
    fn cancelled_runs_map_to_unavailable() {
        let err = ApiError::from(SimError::Cancelled);
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        let err = ApiError::from(SimError::DidNotConverge {
            net_income: 1.0,
            iterations: 100,
        });
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn error_responses_are_not_cached() {
        let response = error_response(StatusCode::UNPROCESSABLE_ENTITY, "bad");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );
    }
}
