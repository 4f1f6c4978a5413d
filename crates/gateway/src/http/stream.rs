use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::response::sse::{Event, Sse};
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use pik_contracts::EventRecord;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use crate::metrics;

use super::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

struct ClientGauge;

impl ClientGauge {
    fn connect() -> Self {
        metrics::sse_client_connected();
        ClientGauge
    }
}

impl Drop for ClientGauge {
    fn drop(&mut self) {
        metrics::sse_client_disconnected();
    }
}

/// Live ledger fan-out. Every subscriber gets a `connected` preamble, each
/// committed event as `event: <type>`, and a heartbeat comment every 30
/// seconds. Closing the connection drops the receiver, which unsubscribes it.
pub(super) async fn stream(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.bus.subscribe();
    let guard = ClientGauge::connect();

    let connected = Event::default().event("connected").data(
        json!({
            "clients": state.bus.subscriber_count(),
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string(),
    );

    let heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );

    let live = stream::unfold(
        (rx, heartbeat, guard),
        |(mut rx, mut heartbeat, guard)| async move {
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => {
                            return Some((Ok(ledger_event(&event)), (rx, heartbeat, guard)));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "sse.subscriber_lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => return None,
                    },
                    _ = heartbeat.tick() => {
                        let comment = format!("heartbeat {}", Utc::now().to_rfc3339());
                        return Some((Ok(Event::default().comment(comment)), (rx, heartbeat, guard)));
                    }
                }
            }
        },
    );

    let events = stream::once(async move { Ok::<_, Infallible>(connected) }).chain(live);

    (
        [
            ("cache-control", "no-cache"),
            ("connection", "keep-alive"),
            ("x-accel-buffering", "no"),
        ],
        Sse::new(events),
    )
}

fn ledger_event(event: &EventRecord) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.event_type.clone()).data(data)
}
