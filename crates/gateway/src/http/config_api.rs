use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{ApiResult, AppState, bad_request, ok, store_error};

/// Values are stored as strings; anything that parses as a finite number is
/// returned numeric.
pub(super) async fn get_config(State(state): State<AppState>) -> ApiResult {
    let rows = state.store.config_all().await.map_err(store_error)?;

    let mut data = serde_json::Map::new();
    for row in rows {
        data.insert(row.config_key, parse_config_value(&row.config_value));
    }
    Ok(ok(serde_json::Value::Object(data)))
}

fn parse_config_value(value: &str) -> serde_json::Value {
    let trimmed = value.trim();
    if let Ok(int) = trimmed.parse::<i64>() {
        return json!(int);
    }
    if let Ok(float) = trimmed.parse::<f64>()
        && float.is_finite()
    {
        return json!(float);
    }
    json!(value)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct UpdateConfigRequest {
    config_key: String,
    config_value: String,
}

pub(super) async fn update_config(
    State(state): State<AppState>,
    req: Result<Json<UpdateConfigRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;

    let key = req.config_key.trim();
    if key.is_empty() {
        return Err(bad_request("config_key must be non-empty"));
    }

    let updated = state
        .store
        .config_set(key, req.config_value.trim())
        .await
        .map_err(store_error)?;

    if !updated {
        return Err(bad_request(format!("Unknown config key `{}`", key)));
    }

    tracing::info!(config_key = %key, "config.updated");

    Ok(ok(json!({
        "config_key": key,
        "config_value": req.config_value.trim(),
    })))
}

#[cfg(test)]
mod tests {
    use super::parse_config_value;
    use serde_json::json;

    #[test]
    fn numeric_strings_come_back_numeric() {
        assert_eq!(parse_config_value("100"), json!(100));
        assert_eq!(parse_config_value("1.5"), json!(1.5));
        assert_eq!(parse_config_value("0.5"), json!(0.5));
    }

    #[test]
    fn non_numeric_strings_stay_strings() {
        assert_eq!(
            parse_config_value("progression.write"),
            json!("progression.write")
        );
        assert_eq!(parse_config_value("NaN"), json!("NaN"));
        assert_eq!(parse_config_value("inf"), json!("inf"));
    }
}
