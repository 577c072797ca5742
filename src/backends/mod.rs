pub mod classify;
pub mod google;
pub mod traits;

pub use google::GoogleBackend;
pub use traits::BackendClient;
