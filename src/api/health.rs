use crate::sources::SubscriptionState;
use crate::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct StreamStatus {
    stream: String,
    #[serde(flatten)]
    state: SubscriptionState,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    streams: Vec<StreamStatus>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let streams = state
        .supervisor
        .active()
        .await
        .into_iter()
        .map(|(key, state)| StreamStatus {
            stream: key.to_string(),
            state,
        })
        .collect();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        streams,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/health", get(health))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok",
            version: "1.0.0",
            streams: vec![StreamStatus {
                stream: "BTCUSDT@1m".to_string(),
                state: SubscriptionState::Backoff { attempt: 2 },
            }],
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"version\":\"1.0.0\""));
        assert!(json.contains("\"stream\":\"BTCUSDT@1m\""));
        assert!(json.contains("\"state\":\"backoff\""));
        assert!(json.contains("\"attempt\":2"));
    }

    #[test]
    fn test_health_response_without_streams() {
        let response = HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            streams: vec![],
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["streams"], serde_json::json!([]));
        assert!(!response.version.is_empty());
    }
}
