//! Task executor for remote device automation.
//!
//! Provides:
//! - `TaskExecutor` - Sequential command execution with per-command retry
//! - `CommandRegistry` - Type tag -> command implementation lookup
//! - Built-in commands (`shell`, `wake`, `power_off`, `launch_app`, `wait`)

pub mod builtin;
pub mod executor;
pub mod registry;
pub mod retry;

pub use builtin::{KeyEventCommand, LaunchAppCommand, ShellCommand, WaitCommand};
pub use executor::TaskExecutor;
pub use registry::CommandRegistry;
pub use retry::RetryPolicy;
