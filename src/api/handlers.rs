use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::criteria::Outcome;
use crate::engine::{AlertEngine, EngineStats};
use crate::rules::{AlertRule, InvalidRuleError, RuleViolation};
use crate::state::{AlertState, NotificationEvent, RuleState};

/// Application state shared across handlers
pub struct AppState {
    pub engine: Arc<AlertEngine>,
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Rules
// ============================================================================

#[derive(Serialize)]
pub struct RulesResponse {
    pub rules: Vec<AlertRule>,
    pub version: u64,
}

pub async fn list_rules(State(state): State<Arc<AppState>>) -> Json<RulesResponse> {
    let snapshot = state.engine.snapshot();

    Json(RulesResponse {
        rules: snapshot.iter().map(|rule| AlertRule::clone(rule)).collect(),
        version: snapshot.version(),
    })
}

#[derive(Serialize)]
pub struct UpsertRuleResponse {
    pub name: String,
    pub created: bool,
    /// Target channels that are not registered
    pub unknown_channels: Vec<String>,
}

pub async fn upsert_rule(
    State(state): State<Arc<AppState>>,
    Json(rule): Json<AlertRule>,
) -> Result<(StatusCode, Json<UpsertRuleResponse>), ApiError> {
    let dispatcher = state.engine.dispatcher();
    let unknown_channels: Vec<String> = rule
        .channels
        .iter()
        .filter(|id| !dispatcher.has_channel(id))
        .cloned()
        .collect();

    let name = rule.name.clone();
    let previous = state.engine.upsert(rule)?;
    let created = previous.is_none();
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        Json(UpsertRuleResponse {
            name,
            created,
            unknown_channels,
        }),
    ))
}

pub async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<AlertRule>, ApiError> {
    state
        .engine
        .rule(&name)
        .map(|rule| Json(AlertRule::clone(&rule)))
        .ok_or_else(|| unknown_rule(&name))
}

pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    let removed = state.engine.remove(&name).is_some();
    Json(serde_json::json!({ "name": name, "removed": removed }))
}

pub async fn enable_rule(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    set_enabled(&state, name, true)
}

pub async fn disable_rule(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    set_enabled(&state, name, false)
}

fn set_enabled(
    state: &AppState,
    name: String,
    enabled: bool,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.engine.set_enabled(&name, enabled)? {
        return Err(unknown_rule(&name));
    }
    Ok(Json(serde_json::json!({ "name": name, "enabled": enabled })))
}

// ============================================================================
// Rule State
// ============================================================================

#[derive(Serialize)]
pub struct RuleStateResponse {
    pub name: String,
    pub state: AlertState,
    pub history: Vec<Outcome>,
    pub met: usize,
    pub evaluation_periods: u32,
    pub min_failing_periods: u32,
    pub last_transition: Option<DateTime<Utc>>,
    pub last_notified: Option<AlertState>,
    pub last_evaluated: Option<DateTime<Utc>>,
    pub last_outcome: Option<Outcome>,
    pub last_value: Option<f64>,
    pub transitions: u64,
}

impl RuleStateResponse {
    fn new(rule: &AlertRule, state: Option<RuleState>) -> Self {
        let policy = rule.failing_periods;
        let state = state.unwrap_or_else(|| RuleState::new(policy.evaluation_periods));

        Self {
            name: rule.name.clone(),
            state: state.state,
            history: state.history.iter().copied().collect(),
            met: state.history.met_in_last(policy.evaluation_periods as usize),
            evaluation_periods: policy.evaluation_periods,
            min_failing_periods: policy.min_failing_periods,
            last_transition: state.last_transition,
            last_notified: state.last_notified,
            last_evaluated: state.last_evaluated,
            last_outcome: state.last_outcome,
            last_value: state.last_value,
            transitions: state.transitions,
        }
    }
}

pub async fn rule_state(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<RuleStateResponse>, ApiError> {
    let rule = state.engine.rule(&name).ok_or_else(|| unknown_rule(&name))?;
    Ok(Json(RuleStateResponse::new(&rule, state.engine.state(&name))))
}

#[derive(Serialize)]
pub struct ClearResponse {
    pub name: String,
    /// The Resolved transition, if the rule was not already resolved
    pub event: Option<NotificationEvent>,
}

pub async fn clear_rule(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ClearResponse>, ApiError> {
    let event = state
        .engine
        .clear(&name, Utc::now())
        .await
        .map_err(|e| ApiError::NotFound(e.to_string()))?;

    Ok(Json(ClearResponse { name, event }))
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub engine: EngineStats,
    pub channels: Vec<String>,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        engine: state.engine.stats(),
        channels: state.engine.dispatcher().channel_ids(),
    })
}

// ============================================================================
// Error Handling
// ============================================================================

fn unknown_rule(name: &str) -> ApiError {
    ApiError::NotFound(format!("Rule '{}' not found", name))
}

#[derive(Debug)]
pub enum ApiError {
    InvalidRule(InvalidRuleError),
    NotFound(String),
}

impl From<InvalidRuleError> for ApiError {
    fn from(e: InvalidRuleError) -> Self {
        ApiError::InvalidRule(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match self {
            ApiError::InvalidRule(e) => {
                let violations: Vec<String> =
                    e.violations.iter().map(RuleViolation::to_string).collect();
                (
                    StatusCode::BAD_REQUEST,
                    serde_json::json!({ "error": e.to_string(), "violations": violations }),
                )
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
        };

        (status, Json(body)).into_response()
    }
}
