//! Release coordination for the versa deployment engine.
//!
//! [`Deployer`] owns the full deployment state machine; [`ops`] carries the
//! rollback and status entry points that bypass the local pipeline.

pub mod deployer;
pub mod ops;
pub mod paths;

pub use deployer::{
    DeployOptions, DeployOutcome, Deployer, ProgressFactory, RELEASES_TO_KEEP,
};
pub use ops::{rollback, status, StatusReport};
pub use paths::RemoteLayout;
