//! Route table: named handlers invokable by peer request.
//!
//! A handler is an opaque async computation over a keyword mapping. The
//! table is populated during setup and shared immutably (`Arc`) once the
//! session reader starts.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::error::ZonisError;
use crate::packet::Arguments;

/// Error type handlers may fail with; stringified before it crosses the wire.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler resolves to.
pub type HandlerResult = Result<Value, HandlerError>;

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// A registered route handler.
pub type Handler = Box<dyn Fn(Arguments) -> HandlerFuture + Send + Sync>;

/// Mapping from route name to handler.
#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<String, Handler>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`.
    ///
    /// Fails with [`ZonisError::DuplicateRoute`] if the name is taken; the
    /// table is left unchanged.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> Result<(), ZonisError>
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        match self.routes.entry(name.into()) {
            Entry::Occupied(occupied) => Err(ZonisError::DuplicateRoute(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(Box::new(move |arguments| Box::pin(handler(arguments))));
                Ok(())
            }
        }
    }

    /// Exact-match lookup.
    pub fn lookup(&self, name: &str) -> Option<&Handler> {
        self.routes.get(name)
    }

    /// Invoke the handler registered under `name`.
    ///
    /// No such route fails with [`ZonisError::UnknownRoute`]; a failing
    /// handler is captured as [`ZonisError::Handler`] carrying the
    /// stringified cause, never swallowed.
    pub async fn dispatch(&self, name: &str, arguments: Arguments) -> Result<Value, ZonisError> {
        let handler = self
            .lookup(name)
            .ok_or_else(|| ZonisError::UnknownRoute(name.to_owned()))?;
        handler(arguments)
            .await
            .map_err(|e| ZonisError::Handler(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dispatch_invokes_registered_handler() {
        let mut table = RouteTable::new();
        table
            .register("double", |arguments: Arguments| async move {
                let n = arguments.get("n").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(n * 2))
            })
            .unwrap();

        let mut arguments = Arguments::new();
        arguments.insert("n".to_owned(), json!(21));
        assert_eq!(table.dispatch("double", arguments).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn duplicate_registration_leaves_table_unchanged() {
        let mut table = RouteTable::new();
        table
            .register("ping", |_| async { Ok(json!("pong")) })
            .unwrap();
        let err = table
            .register("ping", |_| async { Ok(json!("other")) })
            .unwrap_err();
        assert_eq!(err, ZonisError::DuplicateRoute("ping".to_owned()));

        assert_eq!(table.len(), 1);
        let value = table.dispatch("ping", Arguments::new()).await.unwrap();
        assert_eq!(value, json!("pong"));
    }

    #[tokio::test]
    async fn unknown_route_is_reported() {
        let table = RouteTable::new();
        assert_eq!(
            table.dispatch("nope", Arguments::new()).await.unwrap_err(),
            ZonisError::UnknownRoute("nope".to_owned())
        );
    }

    #[tokio::test]
    async fn handler_failure_is_captured_not_swallowed() {
        let mut table = RouteTable::new();
        table
            .register("boom", |_| async { Err::<Value, HandlerError>("no".into()) })
            .unwrap();

        match table.dispatch("boom", Arguments::new()).await.unwrap_err() {
            ZonisError::Handler(cause) => assert_eq!(cause, "no"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn lookup_is_exact_match() {
        let mut table = RouteTable::new();
        table
            .register("ping", |_| async { Ok(json!("pong")) })
            .unwrap();
        assert!(table.lookup("ping").is_some());
        assert!(table.lookup("Ping").is_none());
        assert!(table.lookup("pin").is_none());
    }
}
