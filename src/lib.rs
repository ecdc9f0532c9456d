//! # flowlock
//!
//! An information-flow / usage-control policy engine. It decides, for a
//! data flow between two entities in a type hierarchy, whether the flow is
//! permitted, under what residual conditions, and which remediation
//! actions apply when it is not.
//!
//! ## Model
//!
//! - An [`Entity`] is a typed, attribute-refined address of a principal or
//!   object; more general entities *dominate* more specific ones.
//! - A [`Lock`] is a named, possibly negated predicate evaluated in a
//!   [`Context`]; predicate kinds are pluggable via [`LockPredicate`].
//! - A [`Flow`] is an operation-tagged bag of locks: "data may move this
//!   way while all of these are open".
//! - A [`Policy`] collects flows per operation and forms a lattice under
//!   `le`/`lub`/`glb`, with [`Policy::top`] (nothing granted) and
//!   [`Policy::bot`] (everything granted) as its extremes.
//!
//! Access checks evaluate the relevant flows concurrently and fold the
//! verdicts into an [`AccessDecision`]: grant, conditional grant, or
//! denial carrying the set of blocking locks.
//!
//! The registries (entity types, operations, lock predicates, actions)
//! live in an explicit, immutable [`Config`] built once before the first
//! evaluation; the engine holds no global state.
//!
//! ## Quick Start
//!
//! ```rust
//! use flowlock::{Config, Policy};
//! use serde_json::json;
//!
//! # fn main() -> flowlock::Result<()> {
//! let config = Config::standard();
//! let policy = Policy::from_value(&config, &json!({
//!     "flows": [
//!         { "op": "read", "locks": [{ "lock": "inTimePeriod", "args": ["08:00", "18:00"] }] }
//!     ]
//! }), None)?;
//!
//! let bot = Policy::bot(&config)?;
//! assert!(bot.le(&policy, "read")?);
//! assert!(policy.le(&Policy::top(), "read")?);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod action;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod flow;
pub mod lock;
pub mod locks;
pub mod policy;

pub use action::{Action, ActionHandler, ActionRegistry};
pub use config::{Config, ConfigBuilder, Direction};
pub use context::{Context, EntityInfo, Viewpoint};
pub use entity::{Entity, EntityType};
pub use error::{Error, Result};
pub use flow::{Flow, FlowEval, FlowLocks, FlowSpec};
pub use lock::{Arg, Lock, LockPredicate, LockRegistry, LockSpec, LockState};
pub use policy::{
    process_conflicts, AccessDecision, Conflict, FlowDirection, GlbOutcome, OpFlows, Policy,
};
