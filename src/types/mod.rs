pub mod errors;
pub mod gateway;

pub use errors::{AuthError, ErrorClass, GatewayError, Result};
pub use gateway::{
    BackendOutcome, BackendRequest, BackendResponse, EventStream, FailureDetail,
    FailureKind, Operation, ResponsePayload,
};
