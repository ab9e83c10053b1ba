use std::convert::Infallible;

use axum::{
  extract::Path,
  response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt, stream};
use tokio_stream::wrappers::BroadcastStream;

use crate::state::app_state;

/// SSE stream of one operation's progress events. The stream ends
/// after the terminal event; late subscribers receive the cached
/// terminal immediately.
pub async fn stream(
  Path(operation_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
  let state = app_state();
  let (cached, receiver) = state.events.subscribe(&operation_id);

  let initial = stream::iter(cached);
  let live = BroadcastStream::new(receiver)
    // Lagged subscribers skip dropped events and keep going.
    .filter_map(|result| async move { result.ok() });

  let events = initial
    .chain(live)
    .scan(false, |done, event| {
      let next = if *done {
        None
      } else {
        if event.is_terminal() {
          *done = true;
        }
        Some(event)
      };
      futures::future::ready(next)
    })
    .map(|event| {
      Ok(
        Event::default()
          .event(event.kind.to_string())
          .json_data(&event)
          .unwrap_or_else(|_| Event::default()),
      )
    });

  Sse::new(events).keep_alive(KeepAlive::default())
}
