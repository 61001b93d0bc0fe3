use std::collections::HashMap;

use tracing::{debug, info};

/// Seam through which scripts invoke host-defined commands by identifier.
pub trait CommandDispatch: Send + Sync {
    /// Runs the command. Returns false if it is unknown or disabled.
    fn invoke(&self, id: &str) -> bool;
    fn is_enabled(&self, id: &str) -> bool;
    fn is_checked(&self, id: &str) -> bool;
}

type Handler = Box<dyn Fn() -> bool + Send + Sync>;
type Predicate = Box<dyn Fn() -> bool + Send + Sync>;

struct Command {
    handler: Handler,
    enabled: Predicate,
    checked: Predicate,
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Command>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.commands.keys().collect();
        ids.sort();
        f.debug_struct("CommandRegistry").field("commands", &ids).finish()
    }
}

impl CommandRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an always-enabled, never-checked command.
    pub fn register<F>(&mut self, id: impl Into<String>, handler: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.register_with_state(id, handler, || true, || false);
    }

    pub fn register_with_state<F, E, C>(
        &mut self,
        id: impl Into<String>,
        handler: F,
        enabled: E,
        checked: C,
    ) where
        F: Fn() -> bool + Send + Sync + 'static,
        E: Fn() -> bool + Send + Sync + 'static,
        C: Fn() -> bool + Send + Sync + 'static,
    {
        let id = id.into();
        debug!(command = %id, "command registered");
        self.commands.insert(
            id,
            Command {
                handler: Box::new(handler),
                enabled: Box::new(enabled),
                checked: Box::new(checked),
            },
        );
    }

    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.commands.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl CommandDispatch for CommandRegistry {
    fn invoke(&self, id: &str) -> bool {
        let Some(command) = self.commands.get(id) else {
            debug!(command = %id, "unknown command");
            return false;
        };
        if !(command.enabled)() {
            debug!(command = %id, "command disabled");
            return false;
        }
        let handled = (command.handler)();
        info!(command = %id, handled, "command invoked");
        handled
    }

    fn is_enabled(&self, id: &str) -> bool {
        self.commands
            .get(id)
            .is_some_and(|command| (command.enabled)())
    }

    fn is_checked(&self, id: &str) -> bool {
        self.commands
            .get(id)
            .is_some_and(|command| (command.checked)())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn unknown_commands_report_false() {
        let registry = CommandRegistry::new();
        assert!(!registry.invoke("file.save"));
        assert!(!registry.is_enabled("file.save"));
        assert!(!registry.is_checked("file.save"));
    }

    #[test]
    fn disabled_commands_are_not_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let enabled = Arc::new(AtomicBool::new(false));
        let mut registry = CommandRegistry::new();
        {
            let runs = Arc::clone(&runs);
            let enabled = Arc::clone(&enabled);
            registry.register_with_state(
                "edit.copy",
                move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    true
                },
                move || enabled.load(Ordering::SeqCst),
                || true,
            );
        }

        assert!(!registry.invoke("edit.copy"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(registry.is_checked("edit.copy"));

        enabled.store(true, Ordering::SeqCst);
        assert!(registry.invoke("edit.copy"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
