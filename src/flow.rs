//! Flows: operation-tagged lock sets and their ordering.
//!
//! A flow says "data may move in the direction of operation `op`, provided
//! all of these locks are open". Locks are grouped by kind; a flow without
//! locks applies unconditionally. Flows compare by restrictiveness (`le`)
//! and merge into their tightest common form (`lub`); evaluation fans out
//! over all locks concurrently and folds the verdicts into a [`FlowEval`].

use std::collections::BTreeMap;
use std::fmt;

use futures::future::try_join_all;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use tracing::debug;

use crate::action::Action;
use crate::config::{Config, Direction};
use crate::context::Context;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::lock::{Lock, LockSpec, LockState};
use crate::locks::sentinel::closed_lock;

/// Serialized lock sets: a flat sequence (legacy) or grouped by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlowLocks {
    /// Legacy flat form.
    Flat(Vec<LockSpec>),
    /// Grouped-by-kind form.
    Grouped(BTreeMap<String, Vec<LockSpec>>),
}

impl Default for FlowLocks {
    fn default() -> Self {
        FlowLocks::Flat(Vec::new())
    }
}

impl FlowLocks {
    /// Whether no locks are specified at all.
    pub fn is_empty(&self) -> bool {
        match self {
            FlowLocks::Flat(specs) => specs.is_empty(),
            FlowLocks::Grouped(groups) => groups.values().all(Vec::is_empty),
        }
    }
}

/// Serialized form of a flow, as found in policy JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSpec {
    /// The operation tag.
    pub op: String,
    /// The lock sets gating the flow.
    #[serde(default, skip_serializing_if = "FlowLocks::is_empty")]
    pub locks: FlowLocks,
    /// Remediation actions; lifted to the owning policy's operation entry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

impl FlowSpec {
    /// Build a spec from an operation tag and a flat lock sequence.
    pub fn new(op: impl Into<String>, locks: Vec<LockSpec>) -> Self {
        Self {
            op: op.into(),
            locks: FlowLocks::Flat(locks),
            actions: Vec::new(),
        }
    }
}

/// Aggregated outcome of evaluating one flow's locks in a context.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowEval {
    /// Whether every lock was open.
    pub open: bool,
    /// Whether any verdict was conditional.
    pub conditional: bool,
    /// Merged set of locks that blocked or caveated the flow.
    pub locks: Vec<Lock>,
    /// The entity blamed for the verdict, where the caller attributes one.
    pub entity: Option<Entity>,
}

impl FlowEval {
    /// An unconditional, unobstructed verdict.
    pub fn open() -> Self {
        Self {
            open: true,
            conditional: false,
            locks: Vec::new(),
            entity: None,
        }
    }
}

/// An operation-tagged bag of locks grouped by kind.
///
/// Kind groups are never empty; pruning happens at construction. The
/// direction is resolved from the configured operation table once, so the
/// algebra needs no configuration afterwards.
#[derive(Debug, Clone)]
pub struct Flow {
    op: String,
    direction: Direction,
    locks: BTreeMap<String, Vec<Lock>>,
}

impl Flow {
    /// Build a flow from its serialized form.
    ///
    /// Fails with a validation error if the operation is not configured, a
    /// lock kind is unregistered, or a grouped entry is keyed under the
    /// wrong kind.
    pub fn from_spec(config: &Config, spec: &FlowSpec) -> Result<Self> {
        let direction = config.op_direction(&spec.op)?;

        let mut locks: BTreeMap<String, Vec<Lock>> = BTreeMap::new();
        match &spec.locks {
            FlowLocks::Flat(specs) => {
                for lock_spec in specs {
                    let lock = Lock::from_spec(config, lock_spec)?;
                    locks.entry(lock.kind().to_string()).or_default().push(lock);
                }
            }
            FlowLocks::Grouped(groups) => {
                for (kind, group) in groups {
                    for lock_spec in group {
                        let lock = Lock::from_spec(config, lock_spec)?;
                        if lock.kind() != kind {
                            return Err(Error::validation(format!(
                                "lock '{}' grouped under kind '{}'",
                                lock.kind(),
                                kind
                            )));
                        }
                        locks.entry(kind.clone()).or_default().push(lock);
                    }
                }
            }
        }
        locks.retain(|_, group| !group.is_empty());

        Ok(Self {
            op: spec.op.clone(),
            direction,
            locks,
        })
    }

    /// An always-applicable flow for the given operation.
    pub fn unconstrained(config: &Config, op: &str) -> Result<Self> {
        Self::from_spec(config, &FlowSpec::new(op, Vec::new()))
    }

    /// The operation tag.
    pub fn op(&self) -> &str {
        &self.op
    }

    /// The resolved direction of the operation.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether this flow describes data entering the policy's entity.
    pub fn has_src(&self) -> bool {
        self.direction == Direction::FlowFrom
    }

    /// Whether this flow describes data leaving the policy's entity.
    pub fn has_trg(&self) -> bool {
        self.direction == Direction::FlowTo
    }

    /// The lock groups, keyed by kind.
    pub fn locks_by_kind(&self) -> &BTreeMap<String, Vec<Lock>> {
        &self.locks
    }

    /// All locks across all kinds.
    pub fn locks(&self) -> impl Iterator<Item = &Lock> {
        self.locks.values().flatten()
    }

    /// Whether this flow applies unconditionally.
    pub fn is_unconstrained(&self) -> bool {
        self.locks.is_empty()
    }

    /// Locks on either side without a structural counterpart on the other.
    /// An empty result means the flows are equal.
    pub fn eq_conflicts(&self, other: &Flow) -> Vec<Lock> {
        let mut conflicts = Vec::new();

        for (kind, group) in &self.locks {
            let counterpart = other.locks.get(kind);
            for lock in group {
                let matched = counterpart
                    .map(|locks| locks.iter().any(|l| l == lock))
                    .unwrap_or(false);
                if !matched {
                    conflicts.push(lock.clone());
                }
            }
        }
        for (kind, group) in &other.locks {
            let counterpart = self.locks.get(kind);
            for lock in group {
                let matched = counterpart
                    .map(|locks| locks.iter().any(|l| l == lock))
                    .unwrap_or(false);
                if !matched {
                    conflicts.push(lock.clone());
                }
            }
        }
        conflicts
    }

    /// Whether this flow is less-or-equally restrictive than `other`.
    pub fn le(&self, other: &Flow) -> Result<bool> {
        self.le_eval(other).map(|(le, _)| le)
    }

    /// Like [`Flow::le`], but also reports the locks left uncovered on
    /// either side when the comparison reaches lock matching.
    pub fn le_conflicts(&self, other: &Flow) -> Result<Vec<Lock>> {
        self.le_eval(other).map(|(_, conflicts)| conflicts)
    }

    fn le_eval(&self, other: &Flow) -> Result<(bool, Vec<Lock>)> {
        debug!(this = %self, other = %other, "flow le");

        if self.op != other.op {
            return Ok((false, Vec::new()));
        }
        // a flow without locks always applies
        if self.locks.is_empty() {
            return Ok((true, Vec::new()));
        }
        if other.locks.is_empty() {
            return Ok((false, Vec::new()));
        }
        // an extra lock kind is an extra condition to satisfy
        if self.locks.len() > other.locks.len() {
            return Ok((false, Vec::new()));
        }
        if self.locks.len() < other.locks.len() {
            return Ok((true, Vec::new()));
        }

        let mut conflicts = Vec::new();
        for (kind, theirs) in &other.locks {
            match self.locks.get(kind) {
                None => conflicts.extend(theirs.iter().cloned()),
                Some(ours) => {
                    let mut covered = vec![false; theirs.len()];
                    for lock in ours {
                        let mut found = false;
                        for (i, counterpart) in theirs.iter().enumerate() {
                            if lock.le(counterpart)? {
                                found = true;
                                covered[i] = true;
                            }
                        }
                        if !found {
                            conflicts.push(lock.clone());
                        }
                    }
                    for (i, counterpart) in theirs.iter().enumerate() {
                        if !covered[i] {
                            conflicts.push(counterpart.clone());
                        }
                    }
                }
            }
        }

        Ok((conflicts.is_empty(), conflicts))
    }

    /// Merge two flows of the same operation into their tightest common
    /// form. Returns `Ok(None)` on an operation mismatch.
    ///
    /// When two same-kind locks turn out contradictory, the merged flow
    /// gains a `closed` sentinel and can never open.
    pub fn lub(&self, other: &Flow) -> Result<Option<Flow>> {
        debug!(this = %self, other = %other, "flow lub");

        if self.op != other.op {
            return Ok(None);
        }
        let mut merged = self.clone();
        for lock in other.locks() {
            merge_lock(&mut merged.locks, lock)?;
        }
        Ok(Some(merged))
    }

    /// Evaluate every lock of this flow in `context`, concurrently, and
    /// aggregate the verdicts.
    ///
    /// `open` is the conjunction of per-lock verdicts; `conditional` is the
    /// disjunction of caveats; `locks` holds the blocking or caveating
    /// locks, reduced by iterative `lub` so same-kind offenders collapse.
    /// Non-conditional verdicts are memoized on the context.
    pub async fn get_closed_locks(&self, context: &Context, scope: &str) -> Result<FlowEval> {
        if self.locks.is_empty() {
            return Ok(FlowEval::open());
        }

        let subject = context.entity().cloned();
        let states: Vec<LockState> = try_join_all(self.locks().map(|lock| {
            let subject = subject.clone();
            async move {
                if let Some(open) = context.get_lock_state(lock, subject.as_ref()) {
                    return Ok::<_, Error>(LockState {
                        open,
                        conditional: false,
                        lock: (!open).then(|| lock.clone()),
                    });
                }
                let state = lock.is_open(context, scope).await?;
                if !state.conditional {
                    context.add_lock_state(lock, subject.as_ref(), state.open);
                }
                Ok(state)
            }
        }))
        .await?;

        let mut open = true;
        let mut conditional = false;
        let mut obstacles = Vec::new();
        for state in states {
            open = open && state.open;
            conditional = conditional || state.conditional;
            if !state.open || state.conditional {
                if let Some(lock) = state.lock {
                    obstacles.push(lock);
                }
            }
        }

        let mut reduced = Vec::new();
        for lock in &obstacles {
            fold_lock(&mut reduced, lock)?;
        }

        debug!(flow = %self, open, conditional, "flow evaluated");
        Ok(FlowEval {
            open,
            conditional,
            locks: reduced,
            entity: None,
        })
    }
}

/// Merge `incoming` into a kind-grouped lock map.
///
/// Contradictory same-kind locks degrade the map with a `closed` sentinel
/// instead of keeping an unsatisfiable conjunction. A merge may also
/// produce a lock of another kind (identity locks collapse to `closed`);
/// such results are re-filed under their own kind so every group stays
/// keyed by its locks' kind.
fn merge_lock(locks: &mut BTreeMap<String, Vec<Lock>>, incoming: &Lock) -> Result<()> {
    let key = incoming.kind().to_string();
    let mut refiled: Vec<Lock> = Vec::new();
    let mut contradiction = false;
    {
        let group = locks.entry(key.clone()).or_default();
        if group.is_empty() {
            group.push(incoming.clone());
        } else {
            let mut merged = false;
            let mut next = Vec::with_capacity(group.len());
            for existing in group.iter() {
                match existing.lub(incoming)? {
                    Some(m) => {
                        merged = true;
                        if m.kind() == key {
                            next.push(m);
                        } else {
                            refiled.push(m);
                        }
                    }
                    None => next.push(existing.clone()),
                }
            }
            *group = next;
            contradiction = !merged;
        }
    }
    if locks.get(&key).is_some_and(Vec::is_empty) {
        locks.remove(&key);
    }

    for lock in refiled {
        let group = locks.entry(lock.kind().to_string()).or_default();
        if !group.contains(&lock) {
            group.push(lock);
        }
    }
    if contradiction {
        let closed = closed_lock();
        let group = locks.entry(closed.kind().to_string()).or_default();
        if group.is_empty() {
            group.push(closed);
        }
    }
    Ok(())
}

/// Merge `incoming` into a flat lock set: replace mergeable entries with
/// their `lub`, append otherwise. Used to reduce conflict sets.
fn fold_lock(set: &mut Vec<Lock>, incoming: &Lock) -> Result<()> {
    let mut merged = false;
    let mut next = Vec::with_capacity(set.len());
    for existing in set.iter() {
        match existing.lub(incoming)? {
            Some(m) => {
                next.push(m);
                merged = true;
            }
            None => next.push(existing.clone()),
        }
    }
    if !merged {
        next.push(incoming.clone());
    }
    *set = next;
    Ok(())
}

impl PartialEq for Flow {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op && self.eq_conflicts(other).is_empty()
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}: ", self.op)?;
        if self.locks.is_empty() {
            write!(f, "always")?;
        } else {
            let mut first = true;
            for lock in self.locks() {
                if !first {
                    write!(f, " ^ ")?;
                }
                write!(f, "{}", lock)?;
                first = false;
            }
        }
        write!(f, "}}")
    }
}

impl Serialize for Flow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let fields = if self.locks.is_empty() { 1 } else { 2 };
        let mut state = serializer.serialize_struct("Flow", fields)?;
        state.serialize_field("op", &self.op)?;
        if !self.locks.is_empty() {
            state.serialize_field("locks", &self.locks)?;
        }
        state.end()
    }
}
