//! The HTTP surface: a thin collaborator that forwards client requests
//! into the registry and otherwise stays out of the core's way.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Json, Path, State};
use axum::routing::{get, post};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::KPInfo;
use crate::error::ThrottleError;
use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub http_client: Client,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/register/:kp_id", post(register))
        .route("/unregister/:kp_id", get(unregister))
        .route("/:kp_id/query", post(query))
        .route("/:kp_id/meta_knowledge_graph", get(meta_knowledge_graph))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    url: String,
    #[serde(default)]
    request_qty: u32,
    request_duration: RequestDuration,
    /// Per-KP upstream dispatch timeout, overriding the shared client's
    /// default when set.
    #[serde(default)]
    timeout: Option<RequestDuration>,
}

/// Accepts either a bare number of seconds or an ISO-8601 duration string
/// such as `"PT1S"`, per the registration route's documented body shape.
#[derive(Debug)]
struct RequestDuration(Duration);

impl<'de> Deserialize<'de> for RequestDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Number(n) => {
                let secs = n.as_f64().ok_or_else(|| {
                    serde::de::Error::custom("request_duration must be a positive number")
                })?;
                Ok(RequestDuration(Duration::from_secs_f64(secs)))
            }
            Value::String(s) => parse_iso8601_seconds(&s)
                .map(RequestDuration)
                .map_err(serde::de::Error::custom),
            _ => Err(serde::de::Error::custom(
                "request_duration must be a number of seconds or an ISO-8601 duration string",
            )),
        }
    }
}

/// Parses the small subset of ISO-8601 durations this service accepts:
/// `PT<seconds>S`, e.g. `"PT1S"`, `"PT0.5S"`.
fn parse_iso8601_seconds(s: &str) -> Result<Duration, String> {
    let trimmed = s
        .strip_prefix("PT")
        .and_then(|rest| rest.strip_suffix('S'))
        .ok_or_else(|| format!("unsupported duration format: {s}"))?;
    let secs: f64 = trimmed
        .parse()
        .map_err(|_| format!("unsupported duration format: {s}"))?;
    Ok(Duration::from_secs_f64(secs))
}

async fn register(
    State(state): State<AppState>,
    Path(kp_id): Path<String>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<Value>, ThrottleError> {
    let info = KPInfo {
        url: body.url,
        request_qty: body.request_qty,
        request_duration: body.request_duration.0,
        timeout: body.timeout.map(|d| d.0),
    };
    state.registry.register(kp_id, info).await?;
    Ok(Json(json!({"status": "created"})))
}

async fn unregister(
    State(state): State<AppState>,
    Path(kp_id): Path<String>,
) -> Result<Json<Value>, ThrottleError> {
    state.registry.unregister(&kp_id).await?;
    Ok(Json(json!({"status": "removed"})))
}

async fn query(
    State(state): State<AppState>,
    Path(kp_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ThrottleError> {
    let message = state.registry.query(&kp_id, body, None).await?;
    Ok(Json(message))
}

/// Passthrough: fetches `/meta_knowledge_graph` from the KP's own host.
/// Not a core responsibility; errors are mapped the same way dispatch
/// errors are.
async fn meta_knowledge_graph(
    State(state): State<AppState>,
    Path(kp_id): Path<String>,
) -> Result<Json<Value>, ThrottleError> {
    let base_url = state.registry.kp_url(&kp_id).await?;
    let mkg_url = base_url
        .rsplit_once('/')
        .map(|(prefix, _)| format!("{prefix}/meta_knowledge_graph"))
        .unwrap_or_else(|| format!("{base_url}/meta_knowledge_graph"));

    let response = state
        .http_client
        .get(&mkg_url)
        .send()
        .await
        .map_err(|e| ThrottleError::KPUnreachable {
            kp_id: kp_id.clone(),
            message: e.to_string(),
            request: json!({ "url": mkg_url.clone() }),
        })?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ThrottleError::KPStatusError {
            kp_id,
            status,
            body,
        });
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| ThrottleError::KPMalformedResponse {
            kp_id,
            reason: e.to_string(),
            request: json!({ "url": mkg_url }),
        })?;

    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iso8601_seconds() {
        assert_eq!(parse_iso8601_seconds("PT1S").unwrap(), Duration::from_secs(1));
        assert_eq!(
            parse_iso8601_seconds("PT0.5S").unwrap(),
            Duration::from_millis(500)
        );
        assert!(parse_iso8601_seconds("garbage").is_err());
    }
}
