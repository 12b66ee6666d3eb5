use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::core::{Goal, MAX_GOALS, SimulationEngine, SimulationInput};

/// Caller-level bound on one whole simulation call; the result of a run that
/// outlives it is discarded, not interrupted.
const SIMULATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalPayload {
    pub id: Option<String>,
    pub name: Option<String>,
    pub amount: f64,
    pub deadline: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulatePayload {
    pub user_id: Option<String>,
    pub savings_rate: Option<f64>,
    pub monthly_income: Option<f64>,
    pub monthly_expenses: Option<f64>,
    pub net_worth: Option<f64>,
    pub goals: Option<Vec<GoalPayload>>,
    pub goal_amount: Option<f64>,
    pub goal_deadline: Option<String>,
    pub return_rate: Option<f64>,
    pub inflation_rate: Option<f64>,
    pub income_growth_rate: Option<f64>,
    pub expense_growth_rate: Option<f64>,
    pub tax_rate: Option<f64>,
    pub monthly_withdrawal: Option<f64>,
    pub enable_market_regimes: Option<bool>,
    pub seed: Option<u64>,
    pub currency: Option<String>,
}

#[derive(Debug)]
pub struct ApiRequest {
    pub user_id: String,
    pub input: SimulationInput,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Upstream validation: structurally invalid payloads are rejected here so
/// the engine only ever sees well-formed numbers. Numerically degenerate
/// what-if scenarios (zero income, past deadlines) pass through untouched.
pub fn build_simulation_request(payload: SimulatePayload) -> Result<ApiRequest, String> {
    let user_id = payload
        .user_id
        .unwrap_or_else(|| "anonymous".to_string());

    let Some(savings_rate) = payload.savings_rate else {
        return Err("savingsRate is required".to_string());
    };
    let Some(monthly_income) = payload.monthly_income else {
        return Err("monthlyIncome is required".to_string());
    };
    let Some(net_worth) = payload.net_worth else {
        return Err("netWorth is required".to_string());
    };
    let Some(return_rate) = payload.return_rate else {
        return Err("returnRate is required".to_string());
    };
    let Some(inflation_rate) = payload.inflation_rate else {
        return Err("inflationRate is required".to_string());
    };

    for (name, value) in [
        ("savingsRate", Some(savings_rate)),
        ("monthlyIncome", Some(monthly_income)),
        ("netWorth", Some(net_worth)),
        ("returnRate", Some(return_rate)),
        ("inflationRate", Some(inflation_rate)),
        ("monthlyExpenses", payload.monthly_expenses),
        ("incomeGrowthRate", payload.income_growth_rate),
        ("expenseGrowthRate", payload.expense_growth_rate),
        ("taxRate", payload.tax_rate),
        ("monthlyWithdrawal", payload.monthly_withdrawal),
        ("goalAmount", payload.goal_amount),
    ] {
        if value.is_some_and(|v| !v.is_finite()) {
            return Err(format!("{name} must be a finite number"));
        }
    }

    if !(0.0..=1.0).contains(&savings_rate) {
        return Err("savingsRate must be between 0 and 1".to_string());
    }
    for (name, value) in [
        ("returnRate", Some(return_rate)),
        ("inflationRate", Some(inflation_rate)),
        ("taxRate", payload.tax_rate),
        ("incomeGrowthRate", payload.income_growth_rate),
        ("expenseGrowthRate", payload.expense_growth_rate),
    ] {
        if value.is_some_and(|v| !(0.0..=1.0).contains(&v)) {
            return Err(format!("{name} must be a fraction between 0 and 1"));
        }
    }
    if monthly_income < 0.0 {
        return Err("monthlyIncome must be >= 0".to_string());
    }
    if payload.monthly_expenses.is_some_and(|v| v < 0.0) {
        return Err("monthlyExpenses must be >= 0".to_string());
    }
    if payload.monthly_withdrawal.is_some_and(|v| v < 0.0) {
        return Err("monthlyWithdrawal must be >= 0".to_string());
    }
    if payload.goal_amount.is_some_and(|v| v <= 0.0) {
        return Err("goalAmount must be > 0".to_string());
    }

    let goals = match payload.goals {
        Some(goal_payloads) => {
            if goal_payloads.len() > MAX_GOALS {
                return Err(format!("at most {MAX_GOALS} goals are supported"));
            }
            let mut goals = Vec::with_capacity(goal_payloads.len());
            for (idx, g) in goal_payloads.into_iter().enumerate() {
                if !g.amount.is_finite() || g.amount <= 0.0 {
                    return Err("goal amounts must be finite and > 0".to_string());
                }
                let deadline = parse_date("goal deadline", &g.deadline)?;
                let id = g.id.unwrap_or_else(|| format!("goal-{}", idx + 1));
                let name = g.name.unwrap_or_else(|| id.clone());
                goals.push(Goal {
                    id,
                    name,
                    amount: g.amount,
                    deadline,
                    priority: g.priority,
                });
            }
            goals
        }
        None => Vec::new(),
    };

    let goal_deadline = payload
        .goal_deadline
        .as_deref()
        .map(|raw| parse_date("goalDeadline", raw))
        .transpose()?;

    if goals.is_empty() && (payload.goal_amount.is_none() || goal_deadline.is_none()) {
        return Err(
            "at least one goal is required: goals, or goalAmount with goalDeadline".to_string(),
        );
    }

    Ok(ApiRequest {
        user_id,
        input: SimulationInput {
            savings_rate,
            monthly_income,
            monthly_expenses: payload.monthly_expenses,
            net_worth,
            goals,
            goal_amount: payload.goal_amount,
            goal_deadline,
            expected_return_rate: return_rate,
            inflation_rate,
            income_growth_rate: payload.income_growth_rate,
            expense_growth_rate: payload.expense_growth_rate,
            tax_rate: payload.tax_rate,
            monthly_withdrawal: payload.monthly_withdrawal,
            enable_market_regimes: payload.enable_market_regimes.unwrap_or(false),
            seed: payload.seed,
            currency: payload.currency.unwrap_or_else(|| "USD".to_string()),
        },
    })
}

fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| format!("{field} must be a YYYY-MM-DD date, got '{raw}'"))
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let engine = Arc::new(SimulationEngine::new());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("wealthpath HTTP API listening on http://{addr}");
    axum::serve(listener, router(engine)).await
}

pub fn router(engine: Arc<SimulationEngine>) -> Router {
    Router::new()
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .fallback(not_found_handler)
        .with_state(engine)
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(
    State(engine): State<Arc<SimulationEngine>>,
    Query(payload): Query<SimulatePayload>,
) -> Response {
    simulate_handler_impl(engine, payload).await
}

async fn simulate_post_handler(
    State(engine): State<Arc<SimulationEngine>>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    simulate_handler_impl(engine, payload).await
}

async fn simulate_handler_impl(engine: Arc<SimulationEngine>, payload: SimulatePayload) -> Response {
    let request = match build_simulation_request(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    let worker =
        tokio::task::spawn_blocking(move || engine.simulate(&request.user_id, &request.input));
    match tokio::time::timeout(SIMULATION_TIMEOUT, worker).await {
        Err(_) => error_response(StatusCode::GATEWAY_TIMEOUT, "simulation timed out"),
        Ok(Err(_)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "simulation worker failed"),
        Ok(Ok(Err(err))) => error_response(StatusCode::UNPROCESSABLE_ENTITY, &err.to_string()),
        Ok(Ok(Ok(output))) => json_response(StatusCode::OK, output),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
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
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    build_simulation_request(payload)
}
