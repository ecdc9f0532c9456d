//! The lock abstraction: named, optionally negated, context-evaluated
//! predicates gating a flow.
//!
//! A [`Lock`] carries the shared base fields (kind, arguments, negation);
//! its behavior comes from the [`LockPredicate`] attached at construction
//! from the registry. Predicates implement `is_open` and, where the kind
//! supports an ordering, `lub`/`le`; evaluation never caches internally —
//! memoization is the [`Context`]'s job.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::context::Context;
use crate::entity::Entity;
use crate::error::{Error, Result};

/// A lock argument: a plain value or an entity reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// A literal argument value.
    Value(Value),
    /// An entity-typed argument.
    Entity(Entity),
}

impl Arg {
    /// The argument as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Value(v) => v.as_str(),
            Arg::Entity(_) => None,
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Value(v) => write!(f, "{}", v),
            Arg::Entity(e) => write!(f, "{}", e),
        }
    }
}

impl Serialize for Arg {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Arg::Value(v) => v.serialize(serializer),
            Arg::Entity(e) => e.serialize(serializer),
        }
    }
}

/// The outcome of evaluating one lock in a context.
#[derive(Debug, Clone, PartialEq)]
pub struct LockState {
    /// Whether the lock is open.
    pub open: bool,
    /// Whether the verdict depends on time-varying state and must not be
    /// cached across evaluations.
    pub conditional: bool,
    /// The lock that contributed to a denial or caveat, for conflict
    /// reporting.
    pub lock: Option<Lock>,
}

impl LockState {
    /// An unconditional open verdict.
    pub fn open() -> Self {
        Self {
            open: true,
            conditional: false,
            lock: None,
        }
    }

    /// An unconditional closed verdict blamed on `lock`.
    pub fn closed(lock: &Lock) -> Self {
        Self {
            open: false,
            conditional: false,
            lock: Some(lock.clone()),
        }
    }

    /// A conditional verdict blamed on `lock`.
    pub fn conditional(open: bool, lock: &Lock) -> Self {
        Self {
            open,
            conditional: true,
            lock: Some(lock.clone()),
        }
    }
}

/// Serialized form of a lock, as found in policy JSON.
///
/// Both `"lock"` and the legacy `"path"` field name the kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSpec {
    /// The registered predicate kind.
    #[serde(alias = "path")]
    pub lock: String,
    /// Predicate arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    /// Whether the predicate is negated.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub not: bool,
}

impl LockSpec {
    /// Build a spec for the given kind and arguments.
    pub fn new(kind: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            lock: kind.into(),
            args,
            not: false,
        }
    }

    /// Negate the spec.
    pub fn negated(mut self) -> Self {
        self.not = true;
        self
    }
}

/// Behavior contract every registered predicate kind implements.
///
/// `lub` and `le` default to [`Error::UnsupportedOperation`]: a kind that
/// participates in flow comparison without overriding them has a
/// registration bug, and the engine fails fast rather than guessing.
#[async_trait]
pub trait LockPredicate: fmt::Debug + Send + Sync {
    /// The kind name this predicate registers under.
    fn kind(&self) -> &str;

    /// Declared number of arguments.
    fn arity(&self) -> usize {
        0
    }

    /// Entity-type scopes this predicate applies to. Empty means any.
    fn scopes(&self) -> &[&str] {
        &[]
    }

    /// Human-readable description, used for validation tooling.
    fn description(&self) -> &str {
        ""
    }

    /// Validate a lock of this kind at construction time.
    fn validate(&self, lock: &Lock) -> Result<()> {
        if lock.args().len() != self.arity() {
            return Err(Error::validation(format!(
                "lock '{}' expects {} argument(s), got {}",
                self.kind(),
                self.arity(),
                lock.args().len()
            )));
        }
        Ok(())
    }

    /// Evaluate the lock in the given context and scope.
    ///
    /// May suspend (e.g. to query an external attribute source). Must not
    /// cache internally.
    async fn is_open(&self, lock: &Lock, context: &Context, scope: &str) -> Result<LockState>;

    /// Merge two locks of this kind into the tightest lock implying both.
    ///
    /// Returns `Ok(None)` when the locks are contradictory and no merge
    /// exists; that is a first-class outcome, not an error.
    fn lub(&self, lock: &Lock, other: &Lock) -> Result<Option<Lock>> {
        let _ = (lock, other);
        Err(Error::UnsupportedOperation {
            kind: self.kind().to_string(),
            method: "lub",
        })
    }

    /// Whether `lock` is at least as permissive as `other`: `lock` opens
    /// for a superset of the contexts `other` opens for.
    fn le(&self, lock: &Lock, other: &Lock) -> Result<bool> {
        let _ = (lock, other);
        Err(Error::UnsupportedOperation {
            kind: self.kind().to_string(),
            method: "le",
        })
    }
}

/// A named, possibly negated predicate with typed arguments.
///
/// Immutable value object apart from [`Lock::neg`], which toggles the
/// negation flag in place as a combinator step. Equality is structural:
/// kind, negation, and each argument.
#[derive(Clone)]
pub struct Lock {
    kind: String,
    args: Vec<Arg>,
    negated: bool,
    predicate: Arc<dyn LockPredicate>,
}

impl Lock {
    /// Build a lock from its serialized form, resolving the predicate from
    /// the configured registry and validating arity.
    pub fn from_spec(config: &Config, spec: &LockSpec) -> Result<Self> {
        let predicate = config.locks().get(&spec.lock)?;

        let mut args = Vec::with_capacity(spec.args.len());
        for raw in &spec.args {
            if raw.get("type").is_some() {
                args.push(Arg::Entity(Entity::from_value(config, raw)?));
            } else {
                args.push(Arg::Value(raw.clone()));
            }
        }

        let lock = Self {
            kind: spec.lock.clone(),
            args,
            negated: spec.not,
            predicate,
        };
        lock.predicate.validate(&lock)?;
        Ok(lock)
    }

    /// Build a lock directly from its parts, bypassing the registry.
    ///
    /// Used by predicates that synthesize result locks during `lub`.
    pub(crate) fn from_parts(
        kind: impl Into<String>,
        args: Vec<Arg>,
        negated: bool,
        predicate: Arc<dyn LockPredicate>,
    ) -> Self {
        Self {
            kind: kind.into(),
            args,
            negated,
            predicate,
        }
    }

    /// The predicate kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The lock's arguments.
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Whether the predicate is negated.
    pub fn negated(&self) -> bool {
        self.negated
    }

    /// Toggle negation in place and return the lock for chaining.
    pub fn neg(&mut self) -> &mut Self {
        self.negated = !self.negated;
        self
    }

    /// Evaluate the lock in a context.
    pub async fn is_open(&self, context: &Context, scope: &str) -> Result<LockState> {
        self.predicate.is_open(self, context, scope).await
    }

    /// Merge with another lock; see [`LockPredicate::lub`].
    pub fn lub(&self, other: &Lock) -> Result<Option<Lock>> {
        debug!(this = %self, other = %other, "lock lub");
        self.predicate.lub(self, other)
    }

    /// Whether this lock is at least as permissive as `other`.
    pub fn le(&self, other: &Lock) -> Result<bool> {
        debug!(this = %self, other = %other, "lock le");
        self.predicate.le(self, other)
    }
}

impl PartialEq for Lock {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.negated == other.negated && self.args == other.args
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("kind", &self.kind)
            .field("args", &self.args)
            .field("negated", &self.negated)
            .finish()
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[[ ")?;
        if self.negated {
            write!(f, "not ")?;
        }
        write!(f, "{}", self.kind)?;
        if !self.args.is_empty() {
            write!(f, "(")?;
            for (i, arg) in self.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", arg)?;
            }
            write!(f, ")")?;
        }
        write!(f, " ]]")
    }
}

impl Serialize for Lock {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut fields = 1;
        if !self.args.is_empty() {
            fields += 1;
        }
        if self.negated {
            fields += 1;
        }
        let mut state = serializer.serialize_struct("Lock", fields)?;
        state.serialize_field("lock", &self.kind)?;
        if !self.args.is_empty() {
            state.serialize_field("args", &self.args)?;
        }
        if self.negated {
            state.serialize_field("not", &self.negated)?;
        }
        state.end()
    }
}

/// Write-once registry mapping predicate kinds to their implementations.
///
/// Populated while building the [`Config`]; read-only afterwards.
#[derive(Debug, Default)]
pub struct LockRegistry {
    predicates: BTreeMap<String, Arc<dyn LockPredicate>>,
}

impl LockRegistry {
    /// Register a predicate under its declared kind.
    pub fn register(&mut self, predicate: Arc<dyn LockPredicate>) -> Result<()> {
        let kind = predicate.kind().to_string();
        if self.predicates.contains_key(&kind) {
            return Err(Error::validation(format!(
                "'{}' is already a registered lock",
                kind
            )));
        }
        debug!(kind = %kind, "lock registered");
        self.predicates.insert(kind, predicate);
        Ok(())
    }

    /// Resolve a predicate by kind.
    pub fn get(&self, kind: &str) -> Result<Arc<dyn LockPredicate>> {
        if self.predicates.is_empty() {
            return Err(Error::NotInitialized(
                "no lock predicates registered".to_string(),
            ));
        }
        self.predicates.get(kind).cloned().ok_or_else(|| {
            Error::validation(format!("lock '{}' does not exist", kind))
        })
    }

    /// All registered kinds.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.predicates.keys().map(String::as_str)
    }
}
