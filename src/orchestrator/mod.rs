pub mod handler;
pub mod router;

pub use handler::{ChunkStream, GatewayReply, GenerateRequest, RequestOrchestrator};
pub use router::ModelRouter;
