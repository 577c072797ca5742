use crate::types::{EventStream, GatewayError};
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::fmt;

/// Parses a `text/event-stream` byte stream into JSON events, in arrival
/// order. The first transport or decode error is yielded and ends the stream.
pub fn parse_events<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let mut events = Box::pin(bytes.eventsource());

    Box::pin(async_stream::stream! {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    let data = event.data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    match serde_json::from_str::<Value>(data) {
                        Ok(value) => yield Ok(value),
                        Err(e) => {
                            yield Err(GatewayError::Streaming(format!("Malformed stream event: {}", e)));
                            break;
                        }
                    }
                }
                Err(e) => {
                    yield Err(GatewayError::Streaming(e.to_string()));
                    break;
                }
            }
        }
    })
}
