pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod provisioner;
pub mod runner;
pub mod secret;
pub mod wait;

pub use self::config::Settings;
pub use error::{ConfigError, LifecycleError, LifecycleResult, ToolError, ToolResult};
pub use lifecycle::{Lifecycle, Plan, RunReport, Stage};
pub use runner::{CommandRunner, StepCli};
pub use wait::{CancelSource, OperatorInput, WaitOutcome};
