//! Remediation actions attached to policy flows.
//!
//! An [`Action`] is declarative data inside a policy (`{ name, args }`);
//! the behavior lives in a registered [`ActionHandler`]. When an access
//! check denies or grants conditionally, the actions of the consulted
//! flows travel with the decision so the caller can apply them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::context::Context;
use crate::error::{Error, Result};

/// A declared remediation step, e.g. `{ "name": "log", "args": [...] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// The registered handler name.
    pub name: String,
    /// Handler arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

impl Action {
    /// Build an action for the given handler name and arguments.
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Apply this action to `data`, resolving the handler from the
    /// configured registry.
    pub async fn apply(
        &self,
        registry: &ActionRegistry,
        data: &Value,
        context: &Context,
    ) -> Result<Value> {
        let handler = registry.get(&self.name)?;
        handler.apply(self, data, context).await
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

/// Behavior contract for a registered action handler.
#[async_trait]
pub trait ActionHandler: fmt::Debug + Send + Sync {
    /// Apply the action to a piece of data, returning the (possibly
    /// transformed) data.
    async fn apply(&self, action: &Action, data: &Value, context: &Context) -> Result<Value>;
}

/// Write-once registry mapping action names to their handlers.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    handlers: BTreeMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Register a handler under the given name.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Result<()> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(Error::validation(format!(
                "'{}' is already a registered action",
                name
            )));
        }
        debug!(name = %name, "action registered");
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Resolve a handler by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn ActionHandler>> {
        if self.handlers.is_empty() {
            return Err(Error::NotInitialized(
                "no action handlers registered".to_string(),
            ));
        }
        self.handlers.get(name).cloned().ok_or_else(|| {
            Error::validation(format!("action '{}' does not exist", name))
        })
    }

    /// All registered names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

/// The built-in `log` action: records the flow and passes the data through
/// unchanged.
#[derive(Debug)]
pub struct LogHandler;

#[async_trait]
impl ActionHandler for LogHandler {
    async fn apply(&self, action: &Action, data: &Value, context: &Context) -> Result<Value> {
        let args = Value::Array(action.args.clone());
        info!(
            sender = %context.sender().etype,
            receiver = %context.receiver().etype,
            args = %args,
            "policy log action"
        );
        Ok(data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EntityInfo;
    use serde_json::json;

    fn ctx() -> Context {
        Context::new(
            EntityInfo::new("/user", json!({ "id": "1" })),
            EntityInfo::new("/client", json!({ "id": "9" })),
            None,
        )
    }

    #[test]
    fn test_registry_rejects_duplicates_and_unknowns() {
        let mut registry = ActionRegistry::default();
        registry.register("log", Arc::new(LogHandler)).unwrap();
        assert!(registry.register("log", Arc::new(LogHandler)).is_err());
        assert!(registry.get("drop").is_err());
        assert!(registry.get("log").is_ok());
    }

    #[test]
    fn test_empty_registry_reports_not_initialized() {
        let registry = ActionRegistry::default();
        assert!(matches!(
            registry.get("log"),
            Err(Error::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn test_log_action_passes_data_through() {
        let mut registry = ActionRegistry::default();
        registry.register("log", Arc::new(LogHandler)).unwrap();

        let action = Action::new("log", vec![json!("audit")]);
        let data = json!({ "value": 42 });
        let out = action.apply(&registry, &data, &ctx()).await.unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_serialization_shape() {
        let action = Action::new("log", vec![json!("audit")]);
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({ "name": "log", "args": ["audit"] })
        );

        let bare: Action = serde_json::from_value(json!({ "name": "delete" })).unwrap();
        assert!(bare.args.is_empty());
    }
}
