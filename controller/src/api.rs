use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use vtherm_common::{
    FleetError, HvacMode, Preset, RequestSource, SafetyConfig, Schedule, Thermostat,
    ThermostatError,
};

use crate::host::{execute_outcome, now_in_timezone, AppState};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    timezone: String,
    now_epoch: i64,
    local_time: Option<String>,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/thermostats", get(handle_list_thermostats))
        .route("/api/thermostats/{name}", get(handle_get_thermostat))
        .route("/api/thermostats/{name}/hvac_mode", post(handle_set_hvac_mode))
        .route("/api/thermostats/{name}/preset", post(handle_set_preset))
        .route(
            "/api/thermostats/{name}/temperature",
            post(handle_set_temperature),
        )
        .route(
            "/api/thermostats/{name}/timed_preset",
            post(handle_set_timed_preset).delete(handle_cancel_timed_preset),
        )
        .route("/api/thermostats/{name}/safety", post(handle_set_safety))
        .route(
            "/api/thermostats/{name}/window_bypass",
            post(handle_set_window_bypass),
        )
        .route("/api/thermostats/{name}/lock", post(handle_lock))
        .route("/api/thermostats/{name}/unlock", post(handle_unlock))
        .route(
            "/api/thermostats/{name}/schedule",
            get(handle_get_schedule).put(handle_put_schedule),
        )
        .route("/api/central/power", get(handle_get_central))
        .route("/api/time", get(handle_get_time))
        .with_state(state)
}

async fn handle_list_thermostats(State(state): State<AppState>) -> impl IntoResponse {
    let fleet = state.fleet.lock().await;
    let all: Vec<serde_json::Value> = fleet
        .names()
        .filter_map(|name| fleet.attributes(name))
        .collect();
    Json(all)
}

async fn handle_get_thermostat(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> axum::response::Response {
    let fleet = state.fleet.lock().await;
    match fleet.attributes(&name) {
        Some(attributes) => Json(attributes).into_response(),
        None => fleet_error_response(&FleetError::UnknownThermostat(name)),
    }
}

async fn handle_set_hvac_mode(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(mode) = HvacMode::parse(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid mode. Use 'off', 'heat', 'cool' or 'fan_only'",
        );
    };

    run_command(&state, &name, |thermostat| {
        thermostat.set_hvac_mode(mode, RequestSource::User)
    })
    .await
}

async fn handle_set_preset(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(preset) = Preset::parse(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Unknown preset");
    };

    run_command(&state, &name, |thermostat| {
        thermostat.set_preset(preset, RequestSource::User)
    })
    .await
}

async fn handle_set_temperature(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(target) = value.parse::<f64>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };

    run_command(&state, &name, |thermostat| {
        thermostat.set_target_temperature(target, RequestSource::User)
    })
    .await
}

async fn handle_set_timed_preset(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(preset) = params.get("preset").and_then(|value| Preset::parse(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or unknown 'preset' parameter");
    };
    let Some(minutes) = params.get("minutes").and_then(|value| value.parse::<i64>().ok()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or invalid 'minutes' parameter");
    };

    run_command(&state, &name, |thermostat| {
        thermostat.set_timed_preset(preset, minutes, RequestSource::User)
    })
    .await
}

async fn handle_cancel_timed_preset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    run_command(&state, &name, |thermostat| {
        thermostat.cancel_timed_preset(RequestSource::User)
    })
    .await
}

async fn handle_set_safety(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let current = {
        let fleet = state.fleet.lock().await;
        match fleet.get(&name) {
            Some(thermostat) => thermostat.config().safety.clone(),
            None => return fleet_error_response(&FleetError::UnknownThermostat(name)),
        }
    };

    let parameters = match safety_from_params(&params, current) {
        Ok(parameters) => parameters,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };

    run_command(&state, &name, |thermostat| {
        thermostat.set_safety_parameters(parameters, RequestSource::User)
    })
    .await
}

/// Missing query parameters keep their current value.
fn safety_from_params(
    params: &HashMap<String, String>,
    mut safety: SafetyConfig,
) -> Result<SafetyConfig, String> {
    if let Some(value) = params.get("delay_min") {
        safety.delay_min = value
            .parse()
            .map_err(|_| format!("Invalid 'delay_min' value '{value}'"))?;
    }
    if let Some(value) = params.get("min_on_percent") {
        safety.min_on_percent = value
            .parse()
            .map_err(|_| format!("Invalid 'min_on_percent' value '{value}'"))?;
    }
    if let Some(value) = params.get("default_on_percent") {
        safety.default_on_percent = value
            .parse()
            .map_err(|_| format!("Invalid 'default_on_percent' value '{value}'"))?;
    }
    Ok(safety)
}

async fn handle_set_window_bypass(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let bypass = match params.get("value").map(|value| value.to_ascii_lowercase()) {
        Some(value) if value == "true" || value == "on" => true,
        Some(value) if value == "false" || value == "off" => false,
        _ => return error_response(StatusCode::BAD_REQUEST, "Use value=true or value=false"),
    };

    run_command(&state, &name, |thermostat| {
        thermostat.set_window_bypass(bypass, RequestSource::User)
    })
    .await
}

async fn handle_lock(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let code = params.get("code").cloned();
    run_command(&state, &name, |thermostat| thermostat.lock(code.as_deref())).await
}

async fn handle_unlock(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let code = params.get("code").cloned();
    run_command(&state, &name, |thermostat| thermostat.unlock(code.as_deref())).await
}

async fn handle_get_schedule(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> axum::response::Response {
    let fleet = state.fleet.lock().await;
    if fleet.get(&name).is_none() {
        return fleet_error_response(&FleetError::UnknownThermostat(name));
    }
    Json(fleet.schedule(&name).cloned().unwrap_or_default()).into_response()
}

async fn handle_put_schedule(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(schedule): Json<Schedule>,
) -> axum::response::Response {
    let stored = {
        let mut fleet = state.fleet.lock().await;
        if let Err(err) = fleet.set_schedule(&name, schedule) {
            return fleet_error_response(&err);
        }
        fleet.schedule(&name).cloned().unwrap_or_default()
    };

    if let Err(err) = state.store.save_schedule(&name, &stored).await {
        warn!(name = %name, "failed to persist schedule update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist schedule",
        );
    }
    info!(name = %name, entries = stored.entries.len(), "schedule updated");

    Json(stored).into_response()
}

async fn handle_get_central(State(state): State<AppState>) -> impl IntoResponse {
    let fleet = state.fleet.lock().await;
    Json(fleet.central_attributes())
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    Json(TimeStatus {
        timezone: state.timezone.as_ref().clone(),
        now_epoch: Utc::now().timestamp(),
        local_time: now_in_timezone(&state.timezone).map(|now| now.to_rfc3339()),
    })
}

/// Runs one user command against a thermostat, executes its outcome and
/// answers with the refreshed attributes.
async fn run_command<F>(state: &AppState, name: &str, command: F) -> axum::response::Response
where
    F: FnOnce(&mut Thermostat) -> Result<vtherm_common::Outcome, ThermostatError>,
{
    let outcome = {
        let mut fleet = state.fleet.lock().await;
        fleet.command(name, command)
    };

    match outcome {
        Ok(outcome) => {
            execute_outcome(state, outcome).await;
            let fleet = state.fleet.lock().await;
            match fleet.attributes(name) {
                Some(attributes) => Json(attributes).into_response(),
                None => fleet_error_response(&FleetError::UnknownThermostat(name.to_string())),
            }
        }
        Err(err) => {
            info!(name = %name, "command refused: {err}");
            fleet_error_response(&err)
        }
    }
}

fn fleet_error_response(err: &FleetError) -> axum::response::Response {
    let status = match err {
        FleetError::UnknownThermostat(_) => StatusCode::NOT_FOUND,
        FleetError::Thermostat(
            ThermostatError::Locked
            | ThermostatError::WrongLockCode
            | ThermostatError::NotStarted
            | ThermostatError::RejectedBy(_),
        ) => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    };
    error_response(status, &err.to_string())
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use vtherm_common::features::FeatureKind;

    use super::*;

    #[test]
    fn safety_params_override_only_what_is_given() {
        let current = SafetyConfig {
            delay_min: 60,
            min_on_percent: 0.5,
            default_on_percent: 0.1,
        };
        let params = HashMap::from([("delay_min".to_string(), "30".to_string())]);

        let updated = safety_from_params(&params, current).unwrap();

        assert_eq!(updated.delay_min, 30);
        assert_eq!(updated.min_on_percent, 0.5);
        assert_eq!(updated.default_on_percent, 0.1);
    }

    #[test]
    fn safety_params_reject_garbage() {
        let params = HashMap::from([("min_on_percent".to_string(), "lots".to_string())]);
        assert!(safety_from_params(&params, SafetyConfig::default()).is_err());
    }

    #[test]
    fn refused_commands_map_to_http_status() {
        let cases = [
            (FleetError::UnknownThermostat("x".into()), StatusCode::NOT_FOUND),
            (FleetError::Thermostat(ThermostatError::Locked), StatusCode::CONFLICT),
            (FleetError::Thermostat(ThermostatError::NotStarted), StatusCode::CONFLICT),
            (
                FleetError::Thermostat(ThermostatError::RejectedBy(FeatureKind::Safety)),
                StatusCode::CONFLICT,
            ),
            (
                FleetError::Thermostat(ThermostatError::NoTimedPreset),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(fleet_error_response(&err).status(), status);
        }
    }
}
