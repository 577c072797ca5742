pub mod loader;
pub mod models;

pub use loader::{config_from_env, load_config};
pub use models::*;
