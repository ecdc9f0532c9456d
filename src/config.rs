//! Engine configuration: type hierarchy, operation table, and registries.
//!
//! The original framework populated process-wide registries from plugin
//! directories at startup. Here all of that is an explicit, immutable
//! [`Config`] built once before the first evaluation; the engine holds no
//! ambient mutable state.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::action::{ActionHandler, ActionRegistry, LogHandler};
use crate::error::{Error, Result};
use crate::lock::{LockPredicate, LockRegistry};
use crate::locks::has_id::HasIdPredicate;
use crate::locks::sentinel::{ClosedPredicate, OpenPredicate};
use crate::locks::time_period::TimePeriodPredicate;

/// Direction code of an operation relative to the entity owning a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Data flows into the entity (write-like operations).
    FlowFrom,
    /// Data flows out of the entity (read-like operations).
    FlowTo,
}

/// Immutable engine configuration.
///
/// Holds the entity type hierarchy, the operation direction table, lock
/// argument metadata, and the lock/action registries. Must be fully
/// populated before the first access check; it cannot be mutated after
/// construction.
#[derive(Debug)]
pub struct Config {
    entity_types: BTreeMap<String, u32>,
    op_types: BTreeMap<String, Direction>,
    arg_types: BTreeMap<String, String>,
    locks: LockRegistry,
    actions: ActionRegistry,
}

impl Config {
    /// Start building a configuration.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// The standard configuration: the default entity hierarchy and
    /// operation table, with the built-in lock predicates and the `log`
    /// action registered.
    pub fn standard() -> Self {
        let mut builder = Self::builder()
            .entity_type("/any", 0)
            .entity_type("/group", 1)
            .entity_type("/user", 2)
            .entity_type("/sensor", 3)
            .entity_type("/client", 4)
            .entity_type("/msg", 5)
            .entity_type("/api", 5)
            .entity_type("/const", 6)
            .entity_type("/attr", 6)
            .entity_type("/prop", 6)
            .entity_type("/var", 6)
            .op("write", Direction::FlowFrom)
            .op("read", Direction::FlowTo)
            .op("execute", Direction::FlowFrom)
            .op("create", Direction::FlowFrom)
            .op("delete", Direction::FlowFrom)
            .arg_type("id", "id")
            .arg_type("time", "time")
            .arg_type("user", "user")
            .arg_type("group", "group")
            .arg_type("value", "value")
            .action("log", Arc::new(LogHandler));

        for predicate in [
            Arc::new(TimePeriodPredicate) as Arc<dyn LockPredicate>,
            Arc::new(HasIdPredicate),
            Arc::new(OpenPredicate),
            Arc::new(ClosedPredicate),
        ] {
            builder = builder.lock(predicate);
        }

        builder.build()
    }

    /// Resolve the rank of a registered entity type.
    pub fn entity_rank(&self, type_name: &str) -> Result<u32> {
        if self.entity_types.is_empty() {
            return Err(Error::NotInitialized(
                "entity type hierarchy is empty".to_string(),
            ));
        }
        self.entity_types.get(type_name).copied().ok_or_else(|| {
            Error::validation(format!("'{}' is not a registered entity type", type_name))
        })
    }

    /// The most general (minimal rank) entity type.
    pub fn wildcard_type(&self) -> Result<(String, u32)> {
        self.entity_types
            .iter()
            .min_by_key(|(_, rank)| **rank)
            .map(|(name, rank)| (name.clone(), *rank))
            .ok_or_else(|| Error::NotInitialized("entity type hierarchy is empty".to_string()))
    }

    /// Resolve the direction code of a registered operation.
    pub fn op_direction(&self, op: &str) -> Result<Direction> {
        if self.op_types.is_empty() {
            return Err(Error::NotInitialized(
                "operation table is empty".to_string(),
            ));
        }
        self.op_types.get(op).copied().ok_or_else(|| {
            Error::validation(format!("'{}' is not a registered operation", op))
        })
    }

    /// All configured operation tags.
    pub fn operations(&self) -> impl Iterator<Item = (&str, Direction)> {
        self.op_types.iter().map(|(op, dir)| (op.as_str(), *dir))
    }

    /// Human-readable description of a lock argument type, if configured.
    pub fn arg_type(&self, name: &str) -> Option<&str> {
        self.arg_types.get(name).map(String::as_str)
    }

    /// The lock predicate registry.
    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    /// The remediation action registry.
    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }
}

/// Builder for [`Config`].
#[derive(Default)]
pub struct ConfigBuilder {
    entity_types: BTreeMap<String, u32>,
    op_types: BTreeMap<String, Direction>,
    arg_types: BTreeMap<String, String>,
    locks: LockRegistry,
    actions: ActionRegistry,
}

impl ConfigBuilder {
    /// Register an entity type at the given hierarchy rank.
    pub fn entity_type(mut self, name: impl Into<String>, rank: u32) -> Self {
        self.entity_types.insert(name.into(), rank);
        self
    }

    /// Register an operation tag with its direction code.
    pub fn op(mut self, name: impl Into<String>, direction: Direction) -> Self {
        self.op_types.insert(name.into(), direction);
        self
    }

    /// Register lock argument metadata.
    pub fn arg_type(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.arg_types.insert(name.into(), description.into());
        self
    }

    /// Register a lock predicate. Re-registering a kind is a programming
    /// error and panics, matching the write-once registry contract.
    pub fn lock(mut self, predicate: Arc<dyn LockPredicate>) -> Self {
        if let Err(e) = self.locks.register(predicate) {
            panic!("lock registration failed: {}", e);
        }
        self
    }

    /// Register a remediation action handler under the given name.
    pub fn action(mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        if let Err(e) = self.actions.register(name, handler) {
            panic!("action registration failed: {}", e);
        }
        self
    }

    /// Finish building the configuration.
    pub fn build(self) -> Config {
        Config {
            entity_types: self.entity_types,
            op_types: self.op_types,
            arg_types: self.arg_types,
            locks: self.locks,
            actions: self.actions,
        }
    }
}
