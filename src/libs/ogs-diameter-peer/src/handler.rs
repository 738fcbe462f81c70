//! Inbound message handler registry

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::connection::Connection;
use crate::message::{CommandId, DiameterMessage};

/// Callback invoked synchronously on the connection's reader task
pub type Handler = Arc<dyn Fn(&Connection, DiameterMessage) + Send + Sync>;

/// Command → handler map shared by every connection of a client.
///
/// Registering a command twice replaces the earlier handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<CommandId, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `command`, returning the handler it replaced
    pub fn register<F>(&self, command: CommandId, handler: F) -> Option<Handler>
    where
        F: Fn(&Connection, DiameterMessage) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let previous = handlers.insert(command, Arc::new(handler));
        if previous.is_some() {
            log::debug!("Handler for {command} replaced");
        }
        previous
    }

    pub fn unregister(&self, command: CommandId) -> Option<Handler> {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&command)
    }

    pub fn get(&self, command: CommandId) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&command)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut commands: Vec<_> = handlers.keys().copied().collect();
        commands.sort();
        f.debug_struct("HandlerRegistry")
            .field("commands", &commands)
            .finish()
    }
}
