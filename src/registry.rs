//! Registry mapping callable names to executable handlers.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Everything a handler receives for one attempt.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Decoded job parameters.
    pub params: Value,
    /// Decoded receiver state, for instance-method callables.
    pub instance: Option<Value>,
    /// Decoded captured environment, for closure callables.
    pub captured: Option<Value>,
}

/// Boxed async handler stored in the registry.
pub type Handler = Arc<dyn Fn(Invocation) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Maps registry keys (`name`, `Class::method`, closure name) to handlers.
///
/// Workers can only run what their process has registered; a job whose key
/// is absent fails as a user error and consumes retry budget normally.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Handler>,
}

impl JobRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named function.
    pub fn register_function<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.insert(name.to_string(), handler);
    }

    /// Register a (class, method) pair, static or instance-bound. Instance
    /// state arrives on [`Invocation::instance`].
    pub fn register_method<F, Fut>(&mut self, class: &str, method: &str, handler: F)
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.insert(format!("{class}::{method}"), handler);
    }

    /// Register a named closure. The captured environment arrives on
    /// [`Invocation::captured`].
    pub fn register_closure<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.insert(name.to_string(), handler);
    }

    fn insert<F, Fut>(&mut self, key: String, handler: F)
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.handlers
            .insert(key, Arc::new(move |invocation| handler(invocation).boxed()));
    }

    /// Look up a handler by registry key.
    pub fn get(&self, key: &str) -> Option<&Handler> {
        self.handlers.get(key)
    }

    /// All registered keys.
    pub fn keys(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("keys", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::assert_some;
    use serde_json::json;

    #[tokio::test]
    async fn registered_function_is_invocable() {
        let mut registry = JobRegistry::new();
        registry.register_function("add", |inv| async move {
            let a = inv.params["a"].as_i64().unwrap_or(0);
            let b = inv.params["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });

        let handler = assert_some!(registry.get("add")).clone();
        let result = handler(Invocation {
            params: json!({"a": 2, "b": 3}),
            instance: None,
            captured: None,
        })
        .await
        .unwrap();
        assert_eq!(result, json!(5));
    }

    #[tokio::test]
    async fn methods_are_keyed_by_class_and_method() {
        let mut registry = JobRegistry::new();
        registry.register_method("Mailer", "send", |_inv| async move { Ok(Value::Null) });

        assert_some!(registry.get("Mailer::send"));
        assert!(registry.get("send").is_none());
        assert_eq!(registry.len(), 1);
    }
}
