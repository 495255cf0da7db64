use std::sync::Arc;

use super::handler::{ConnectionContext, MessageHandler};

/// Builds one handler instance for a new connection.
pub type HandlerFactory =
    Box<dyn Fn(Arc<ConnectionContext>) -> Box<dyn MessageHandler> + Send + Sync>;

/// Ordered table of handler factories, assembled before the listener starts.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<(String, HandlerFactory)>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a factory under `name`. A duplicate name is refused and logged.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> bool
    where
        F: Fn(Arc<ConnectionContext>) -> Box<dyn MessageHandler> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.entries.iter().any(|(existing, _)| *existing == name) {
            tracing::warn!(handler = %name, "handler already registered");
            return false;
        }
        self.entries.push((name, Box::new(factory)));
        true
    }

    /// Entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HandlerFactory)> {
        self.entries.iter().map(|(name, factory)| (name.as_str(), factory))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handler::HandlerError;
    use crate::wire::{Endpoint, Header};

    struct Nop(Endpoint);

    impl MessageHandler for Nop {
        fn endpoint(&self) -> Endpoint {
            self.0
        }

        fn handle(&mut self, _: &Header, _: &[u8]) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_names_are_refused() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.register("default", |_| Box::new(Nop(Endpoint::Default))));
        assert!(!registry.register("default", |_| Box::new(Nop(Endpoint::PixelData))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn iteration_keeps_insertion_order() {
        let mut registry = HandlerRegistry::new();
        for name in ["b", "a", "c"] {
            registry.register(name, |_| Box::new(Nop(Endpoint::Default)));
        }
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["b", "a", "c"]);
        let (ctx, _) = crate::server::handler::tests::context();
        let endpoints: Vec<_> = registry
            .iter()
            .map(|(_, factory)| factory(ctx.clone()).endpoint())
            .collect();
        assert_eq!(endpoints.len(), 3);
    }
}
