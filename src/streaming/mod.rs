pub mod cancellable;
pub mod sse;

pub use cancellable::CancellableStream;
pub use sse::parse_events;
