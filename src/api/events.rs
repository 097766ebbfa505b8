//! `GET /ui/sse`: live audit updates for dashboards.

use crate::api::handlers::AppState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

/// Interval between keep-alive comments on idle connections.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Open an event stream for one subscriber.
///
/// The first frame is `{"eventType":"init","clientID":...}`; every audit
/// insert and update follows until the client disconnects or the server
/// shuts down.
pub async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let mut subscription = state.hub.subscribe();

    let stream = async_stream::stream! {
        let init = json!({ "eventType": "init", "clientID": subscription.id() });
        yield Ok(Event::default().data(init.to_string()));

        while let Some(event) = subscription.recv().await {
            match serde_json::to_string(&*event) {
                Ok(data) => yield Ok(Event::default().data(data)),
                Err(e) => tracing::warn!("Failed to serialize event: {}", e),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("ping"))
}
