//! Command implementations looked up by type tag.

use std::{collections::HashMap, sync::Arc};

use remote_device_core::DeviceCommand;

use crate::builtin::{KeyEventCommand, LaunchAppCommand, ShellCommand, WaitCommand};

/// Name -> implementation lookup used by the executor.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn DeviceCommand>>,
}

impl CommandRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in commands.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ShellCommand);
        registry.register(KeyEventCommand::WAKE);
        registry.register(KeyEventCommand::POWER_OFF);
        registry.register(LaunchAppCommand);
        registry.register(WaitCommand);
        registry
    }

    /// Register an implementation under its own name, replacing any previous one.
    pub fn register(&mut self, command: impl DeviceCommand + 'static) {
        self.register_arc(Arc::new(command));
    }

    pub fn register_arc(&mut self, command: Arc<dyn DeviceCommand>) {
        self.commands.insert(command.name().to_string(), command);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn DeviceCommand>> {
        self.commands.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }
}
