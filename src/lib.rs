pub mod agency;
pub mod config;
pub mod error;
pub mod health;
pub mod ids;
pub mod jobs;
pub mod paths;
pub mod reconcile;
pub mod snapshot;
pub mod supervisor;

pub use config::SupervisionConfig;
pub use error::{Result, SupervisionError};
pub use supervisor::Supervisor;
