use async_stream::stream;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::{convert::Infallible, time::Duration};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::routes::auth::AuthSession;
use crate::state::AppState;

// GET /api/events
pub async fn sse_invalidations(
    State(app_state): State<AppState>,
    auth: AuthSession,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let user_id = auth.user_id;
    let mut rx = app_state.invalidation.subscribe();

    let s = stream! {
        loop {
            match rx.recv().await {
                Ok(signal) if signal.user_id() == user_id => {
                    match Event::default().event("invalidate").json_data(&signal) {
                        Ok(ev) => yield Ok::<Event, Infallible>(ev),
                        Err(err) => warn!(?err, "failed to encode invalidation"),
                    }
                }
                Ok(_) => {}
                // Missed signals: ask the client to refetch everything.
                Err(RecvError::Lagged(skipped)) => {
                    debug!(%user_id, skipped, "invalidation stream lagged");
                    yield Ok::<Event, Infallible>(Event::default().event("resync").data("{}"));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(s).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    )
}
