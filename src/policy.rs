//! Policies: entity-scoped flow collections forming a lattice.
//!
//! A policy groups flows by operation and either names the entity it
//! governs or, entity-free, travels with the data itself ("data policy").
//! Policies compare by restrictiveness (`le`), generalize (`lub`), tighten
//! (`glb`), and answer access checks by evaluating the relevant flows and
//! folding their verdicts through the conflict algebra
//! ([`process_conflicts`]).

use std::collections::BTreeSet;
use std::collections::BTreeMap;
use std::fmt;

use futures::future::try_join_all;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tracing::debug;

use crate::action::Action;
use crate::config::{Config, Direction};
use crate::context::Context;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowEval, FlowSpec};
use crate::lock::Lock;

/// Direction of a data flow relative to a node, for [`Policy::check_flow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    /// Data entering the node.
    Incoming,
    /// Data leaving the node.
    Outgoing,
}

/// One obstacle reported by an access decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Conflict {
    /// A lock that blocked or caveated the decision.
    Lock(Lock),
    /// An entity blamed for the denial.
    Entity(Entity),
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::Lock(lock) => write!(f, "{}", lock),
            Conflict::Entity(entity) => write!(f, "{}", entity),
        }
    }
}

/// The outcome of an access check.
///
/// `conflicts` is populated on denial (everything that blocked) and on a
/// conditional grant (the caveats that still apply); `actions` carries the
/// policy's remediation steps for the checked operation in those cases.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessDecision {
    /// Whether the access is granted.
    pub grant: bool,
    /// Whether the grant depends on time-varying state.
    pub conditional: bool,
    /// The obstacles behind a denial or caveat.
    pub conflicts: Vec<Conflict>,
    /// Remediation actions to apply.
    pub actions: Vec<Action>,
}

/// Fold per-flow evaluation results into one decision.
///
/// Within one side, flows combine disjunctively: any open flow grants, and
/// the grant is conditional only if every open flow is. Across the two
/// sides the grant is conjunctive: both must permit independently. An
/// absent second side permits unconditionally; a present-but-empty side
/// denies. Conflicts from both sides are pooled and deduplicated.
pub fn process_conflicts(side1: &[FlowEval], side2: Option<&[FlowEval]>) -> AccessDecision {
    fn fold(evals: &[FlowEval], conflicts: &mut Vec<Conflict>) -> (bool, bool) {
        let mut grant = false;
        let mut cond = true;
        for eval in evals {
            if !eval.locks.is_empty() {
                for lock in &eval.locks {
                    conflicts.push(Conflict::Lock(lock.clone()));
                }
            } else if let Some(entity) = &eval.entity {
                conflicts.push(Conflict::Entity(entity.clone()));
            }
            // one open flow is enough
            grant = grant || eval.open;
            if eval.open {
                cond = cond && eval.conditional;
            }
        }
        (grant, cond)
    }

    let mut conflicts = Vec::new();
    let (grant1, cond1) = fold(side1, &mut conflicts);
    let (grant2, cond2) = match side2 {
        Some(evals) => fold(evals, &mut conflicts),
        None => (true, false),
    };

    let mut reduced: Vec<Conflict> = Vec::new();
    for conflict in conflicts {
        if !reduced.contains(&conflict) {
            reduced.push(conflict);
        }
    }

    let cond1 = grant1 && cond1;
    let cond2 = grant2 && cond2;
    let grant = grant1 && grant2;
    let conditional = grant && (cond1 || cond2);

    if conditional {
        AccessDecision {
            grant: true,
            conditional: true,
            conflicts: reduced,
            actions: Vec::new(),
        }
    } else if grant {
        AccessDecision {
            grant: true,
            conditional: false,
            conflicts: Vec::new(),
            actions: Vec::new(),
        }
    } else {
        AccessDecision {
            grant: false,
            conditional: false,
            conflicts: reduced,
            actions: Vec::new(),
        }
    }
}

/// The flows and remediation actions registered for one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OpFlows {
    /// The operation's flows, kept minimal by [`Policy::add_flow`].
    pub flows: Vec<Flow>,
    /// Remediation actions attached to the operation.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

#[derive(Deserialize)]
struct OpEntrySpec {
    #[serde(default)]
    flows: Vec<FlowSpec>,
    #[serde(default)]
    actions: Vec<Action>,
}

/// The result of [`Policy::glb`] over possibly unrelated entities.
#[derive(Debug, Clone, PartialEq)]
pub enum GlbOutcome {
    /// A single tightened policy.
    Policy(Policy),
    /// No single tighter policy exists; treat as a policy set.
    Set(Vec<Policy>),
}

/// An entity-scoped (or data-scoped) collection of flows indexed by
/// operation.
///
/// The algebraic operators always produce a new policy; neither operand is
/// mutated.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    entity: Option<Entity>,
    ops: BTreeMap<String, OpFlows>,
}

impl Policy {
    /// The most restrictive policy: no flows, nothing is ever granted.
    pub fn top() -> Self {
        Self {
            entity: None,
            ops: BTreeMap::new(),
        }
    }

    /// The least restrictive policy: an unconstrained flow for every
    /// configured operation, attached to the wildcard entity.
    pub fn bot(config: &Config) -> Result<Self> {
        let mut policy = Self {
            entity: Some(Entity::wildcard(config)?),
            ops: BTreeMap::new(),
        };
        let ops: Vec<String> = config.operations().map(|(op, _)| op.to_string()).collect();
        for op in ops {
            policy.add_flow(Flow::unconstrained(config, &op)?)?;
        }
        Ok(policy)
    }

    /// Build a policy from a sequence of flow specs and an optional entity.
    pub fn new(config: &Config, flows: Vec<FlowSpec>, entity: Option<Entity>) -> Result<Self> {
        let mut policy = Self {
            entity,
            ops: BTreeMap::new(),
        };
        for spec in flows {
            policy.add_spec(config, spec)?;
        }
        Ok(policy)
    }

    /// Build a policy from its serialized JSON form.
    ///
    /// Accepts either a full descriptor `{ entity?, flows: <map or array> }`
    /// (in which case `entity` must not be passed separately) or a bare
    /// flow array combined with an optional entity descriptor.
    pub fn from_value(config: &Config, value: &Value, entity: Option<&Value>) -> Result<Self> {
        if let Some(list) = value.as_array() {
            let entity = entity
                .map(|spec| Entity::from_value(config, spec))
                .transpose()?;
            let mut policy = Self {
                entity,
                ops: BTreeMap::new(),
            };
            for item in list {
                let spec: FlowSpec = serde_json::from_value(item.clone())
                    .map_err(|e| Error::validation(format!("malformed flow: {}", e)))?;
                policy.add_spec(config, spec)?;
            }
            return Ok(policy);
        }

        let obj = value
            .as_object()
            .ok_or_else(|| Error::validation("policy must be an object or a flow array"))?;
        if entity.is_some() {
            return Err(Error::validation(
                "entity must be absent when constructing from a policy descriptor",
            ));
        }

        let entity = obj
            .get("entity")
            .map(|spec| Entity::from_value(config, spec))
            .transpose()?;
        let mut policy = Self {
            entity,
            ops: BTreeMap::new(),
        };

        match obj.get("flows") {
            None => {}
            Some(Value::Array(list)) => {
                for item in list {
                    let spec: FlowSpec = serde_json::from_value(item.clone())
                        .map_err(|e| Error::validation(format!("malformed flow: {}", e)))?;
                    policy.add_spec(config, spec)?;
                }
            }
            Some(Value::Object(by_op)) => {
                for (op, entry) in by_op {
                    let entry: OpEntrySpec = serde_json::from_value(entry.clone()).map_err(|e| {
                        Error::validation(format!("malformed flows for '{}': {}", op, e))
                    })?;

                    for spec in entry.flows {
                        if spec.op != *op {
                            return Err(Error::validation(format!(
                                "flow for operation '{}' filed under '{}'",
                                spec.op, op
                            )));
                        }
                        policy.add_spec(config, spec)?;
                    }
                    for action in entry.actions {
                        policy.add_action(op, action);
                    }
                }
            }
            Some(_) => {
                return Err(Error::validation("policy flows must be an array or a map"));
            }
        }

        Ok(policy)
    }

    fn add_spec(&mut self, config: &Config, spec: FlowSpec) -> Result<()> {
        let actions = spec.actions.clone();
        let flow = Flow::from_spec(config, &spec)?;
        let op = flow.op().to_string();
        self.add_flow(flow)?;
        for action in actions {
            self.add_action(&op, action);
        }
        Ok(())
    }

    /// The entity this policy governs; `None` for a data policy.
    pub fn entity(&self) -> Option<&Entity> {
        self.entity.as_ref()
    }

    /// Whether the policy travels with the data rather than an entity.
    pub fn is_data_policy(&self) -> bool {
        self.entity.is_none()
    }

    /// Insert a flow unless an existing flow for the same operation
    /// already covers it, keeping each operation's flow list minimal.
    pub fn add_flow(&mut self, flow: Flow) -> Result<()> {
        let entry = self.ops.entry(flow.op().to_string()).or_default();
        for existing in &entry.flows {
            if flow.le(existing)? {
                return Ok(());
            }
        }
        entry.flows.push(flow);
        Ok(())
    }

    /// Attach a remediation action to an operation, ignoring duplicates.
    pub fn add_action(&mut self, op: &str, action: Action) {
        let entry = self.ops.entry(op.to_string()).or_default();
        if !entry.actions.contains(&action) {
            entry.actions.push(action);
        }
    }

    /// Merge another policy's flows into this one.
    ///
    /// Both policies must govern the same entity.
    pub fn add(&mut self, other: &Policy) -> Result<()> {
        if self.entity != other.entity {
            return Err(Error::validation(
                "cannot add policies specified over different entities",
            ));
        }
        for entry in other.ops.values() {
            for flow in &entry.flows {
                self.add_flow(flow.clone())?;
            }
        }
        for (op, entry) in &other.ops {
            for action in &entry.actions {
                self.add_action(op, action.clone());
            }
        }
        Ok(())
    }

    /// The flows registered for one operation.
    pub fn flows_for(&self, op: &str) -> &[Flow] {
        self.ops.get(op).map(|e| e.flows.as_slice()).unwrap_or(&[])
    }

    /// All flows across all operations.
    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.ops.values().flat_map(|e| e.flows.iter())
    }

    /// The remediation actions registered for one operation.
    pub fn actions_for(&self, op: &str) -> &[Action] {
        self.ops
            .get(op)
            .map(|e| e.actions.as_slice())
            .unwrap_or(&[])
    }

    /// Whether this policy is less-or-equally restrictive than `other` for
    /// the given operation.
    ///
    /// A policy with no flows for `op` grants nothing, so every policy is
    /// `le` it; conversely it is `le` nothing but another empty one.
    pub fn le(&self, other: &Policy, op: &str) -> Result<bool> {
        let theirs = other.flows_for(op);
        if theirs.is_empty() {
            return Ok(true);
        }
        let ours = self.flows_for(op);
        if ours.is_empty() {
            return Ok(false);
        }

        for flow in ours {
            let mut covered = false;
            for counterpart in theirs {
                if flow.le(counterpart)? {
                    covered = true;
                    break;
                }
            }
            if !covered {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Least upper bound: the least restrictive policy at least as
    /// restrictive as both.
    ///
    /// Policies over unrelated entities have no common generalization and
    /// collapse to [`Policy::top`]. Otherwise the more specific entity is
    /// adopted and same-operation flows are pairwise merged; actions do not
    /// survive generalization.
    pub fn lub(&self, other: &Policy) -> Result<Policy> {
        debug!(this = %self, other = %other, "policy lub");

        let entity = match (&self.entity, &other.entity) {
            (Some(ours), Some(theirs)) => {
                let we_dominate = ours.dominates(theirs);
                let they_dominate = theirs.dominates(ours);
                if !we_dominate && !they_dominate {
                    return Ok(Policy::top());
                }
                Some(if we_dominate {
                    theirs.clone()
                } else {
                    ours.clone()
                })
            }
            _ => None,
        };

        let mut result = Policy {
            entity,
            ops: BTreeMap::new(),
        };
        for (op, ours) in &self.ops {
            if let Some(theirs) = other.ops.get(op) {
                for flow in &ours.flows {
                    for counterpart in &theirs.flows {
                        if let Some(merged) = flow.lub(counterpart)? {
                            result.add_flow(merged)?;
                        }
                    }
                }
            }
        }
        Ok(result)
    }

    /// Greatest lower bound: tighten this policy with `other`.
    ///
    /// Unrelated entities cannot be tightened into one policy; the pair is
    /// returned as a set. Otherwise the more specific entity is adopted and
    /// `other`'s flows are unioned in unless already subsumed.
    pub fn glb(&self, other: &Policy) -> Result<GlbOutcome> {
        debug!(this = %self, other = %other, "policy glb");

        let mut result = self.clone();
        match (&self.entity, &other.entity) {
            (Some(ours), Some(theirs)) => {
                let we_dominate = ours.dominates(theirs);
                let they_dominate = theirs.dominates(ours);
                if !we_dominate && !they_dominate {
                    return Ok(GlbOutcome::Set(vec![self.clone(), other.clone()]));
                }
                if we_dominate {
                    result.entity = Some(theirs.clone());
                }
            }
            (None, Some(theirs)) => {
                result.entity = Some(theirs.clone());
            }
            _ => {}
        }

        for (op, theirs) in &other.ops {
            for flow in &theirs.flows {
                let mut subsumed = false;
                for existing in result.flows_for(op) {
                    if existing == flow || existing.le(flow)? {
                        subsumed = true;
                        break;
                    }
                }
                if !subsumed {
                    result.add_flow(flow.clone())?;
                }
            }
            for action in &theirs.actions {
                result.add_action(op, action.clone());
            }
        }
        Ok(GlbOutcome::Policy(result))
    }

    /// Decide whether the subject governed by `subject_policy` may perform
    /// `op` against this policy's entity.
    ///
    /// Dispatches on the configured direction of the operation: write-like
    /// operations check the inbound flows, read-like ones the outbound.
    pub async fn check_access(
        &self,
        config: &Config,
        subject_policy: &Policy,
        op: &str,
        context: &Context,
    ) -> Result<AccessDecision> {
        match config.op_direction(op)? {
            Direction::FlowFrom => self.check_write(subject_policy, context, op).await,
            Direction::FlowTo => self.check_read(subject_policy, context, op).await,
        }
    }

    /// Check whether a writer may perform `op` on this policy's entity.
    ///
    /// The writer's own policy is not consulted yet; it is part of the
    /// interface for dual-sided checks.
    pub async fn check_write(
        &self,
        _writer_policy: &Policy,
        context: &Context,
        op: &str,
    ) -> Result<AccessDecision> {
        debug!(policy = %self, op, "check write access");
        let evals = self.evaluate_flows(op, context, &context.sender().etype).await?;
        Ok(self.decide(op, &evals, None))
    }

    /// Check whether a reader may perform `op` on this policy's entity.
    pub async fn check_read(
        &self,
        _reader_policy: &Policy,
        context: &Context,
        op: &str,
    ) -> Result<AccessDecision> {
        debug!(policy = %self, op, "check read access");
        let evals = self.evaluate_flows(op, context, &context.sender().etype).await?;
        Ok(self.decide(op, &evals, None))
    }

    /// Check a data flow against both the data's policy (`self`) and the
    /// policy of the node it enters or leaves.
    pub async fn check_flow(
        &self,
        other: &Policy,
        direction: FlowDirection,
        context: &Context,
    ) -> Result<AccessDecision> {
        match direction {
            FlowDirection::Incoming => self.check_incoming(other, context).await,
            FlowDirection::Outgoing => self.check_outgoing(other, context).await,
        }
    }

    /// Dual-sided admission of data entering a node: the data policy's
    /// outbound flows are judged from the receiver's viewpoint, the node
    /// policy's inbound flows from the message's viewpoint; both sides
    /// must permit.
    async fn check_incoming(
        &self,
        target_policy: &Policy,
        context: &Context,
    ) -> Result<AccessDecision> {
        let mut receiver_ctx = context.clone();
        receiver_ctx.set_receiver_context();
        let mut msg_ctx = context.clone();
        msg_ctx.set_msg_context();

        let item_evals = try_join_all(
            self.flows()
                .filter(|f| f.has_trg())
                .map(|f| f.get_closed_locks(&receiver_ctx, &context.receiver().etype)),
        )
        .await?;

        let entity_evals = try_join_all(
            target_policy
                .flows()
                .filter(|f| f.has_src())
                .map(|f| f.get_closed_locks(&msg_ctx, "msg")),
        )
        .await?;

        Ok(process_conflicts(&item_evals, Some(&entity_evals)))
    }

    /// Dual-sided release of data leaving a node, mirroring
    /// [`Policy::check_incoming`]: the data policy's outbound flows are
    /// judged from the sender's viewpoint, the source node's outbound
    /// flows from the message's viewpoint.
    async fn check_outgoing(
        &self,
        source_policy: &Policy,
        context: &Context,
    ) -> Result<AccessDecision> {
        let mut sender_ctx = context.clone();
        sender_ctx.set_sender_context();
        let mut msg_ctx = context.clone();
        msg_ctx.set_msg_context();

        let item_evals = try_join_all(
            self.flows()
                .filter(|f| f.has_trg())
                .map(|f| f.get_closed_locks(&sender_ctx, &context.sender().etype)),
        )
        .await?;

        let entity_evals = try_join_all(
            source_policy
                .flows()
                .filter(|f| f.has_trg())
                .map(|f| f.get_closed_locks(&msg_ctx, "msg")),
        )
        .await?;

        Ok(process_conflicts(&item_evals, Some(&entity_evals)))
    }

    async fn evaluate_flows(
        &self,
        op: &str,
        context: &Context,
        scope: &str,
    ) -> Result<Vec<FlowEval>> {
        try_join_all(
            self.flows_for(op)
                .iter()
                .map(|flow| flow.get_closed_locks(context, scope)),
        )
        .await
    }

    fn decide(&self, op: &str, evals: &[FlowEval], side2: Option<&[FlowEval]>) -> AccessDecision {
        let mut decision = process_conflicts(evals, side2);
        if !decision.grant || decision.conditional {
            decision.actions = self.actions_for(op).to_vec();
        }
        decision
    }
}

impl PartialEq for Policy {
    fn eq(&self, other: &Self) -> bool {
        if self.entity != other.entity {
            return false;
        }

        let ops: BTreeSet<&str> = self
            .ops
            .keys()
            .chain(other.ops.keys())
            .map(String::as_str)
            .collect();

        for op in ops {
            let ours = self.flows_for(op);
            let theirs = other.flows_for(op);
            if ours.iter().any(|f| !theirs.contains(f))
                || theirs.iter().any(|f| !ours.contains(f))
            {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "<flows for {}: [", entity)?,
            None => write!(f, "<flows: [")?,
        }
        let mut first = true;
        for flow in self.flows() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", flow)?;
            first = false;
        }
        write!(f, "]>")
    }
}

impl Serialize for Policy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let fields = if self.entity.is_some() { 2 } else { 1 };
        let mut state = serializer.serialize_struct("Policy", fields)?;
        if let Some(entity) = &self.entity {
            state.serialize_field("entity", entity)?;
        }
        state.serialize_field("flows", &self.ops)?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EntityInfo;
    use crate::lock::LockSpec;
    use serde_json::json;

    fn cfg() -> Config {
        Config::standard()
    }

    fn time_flow(op: &str, start: &str, end: &str) -> FlowSpec {
        FlowSpec::new(
            op,
            vec![LockSpec::new("inTimePeriod", vec![json!(start), json!(end)])],
        )
    }

    fn id_flow(op: &str, id: &str) -> FlowSpec {
        FlowSpec::new(op, vec![LockSpec::new("hasId", vec![json!(id)])])
    }

    fn ctx(sender_id: &str) -> Context {
        Context::new(
            EntityInfo::new("/user", json!({ "id": sender_id })),
            EntityInfo::new("/client", json!({ "id": "9" })),
            Some(json!({ "id": "m1" })),
        )
    }

    #[test]
    fn test_bot_le_everything() {
        let config = cfg();
        let bot = Policy::bot(&config).unwrap();
        let restricted = Policy::new(&config, vec![time_flow("read", "08:00", "11:00")], None).unwrap();

        for (op, _) in config.operations() {
            assert!(bot.le(&bot, op).unwrap());
            assert!(bot.le(&Policy::top(), op).unwrap());
        }
        assert!(bot.le(&restricted, "read").unwrap());
    }

    #[test]
    fn test_everything_le_top() {
        let config = cfg();
        let top = Policy::top();
        let bot = Policy::bot(&config).unwrap();
        let restricted = Policy::new(&config, vec![id_flow("write", "1")], None).unwrap();

        assert!(restricted.le(&top, "write").unwrap());
        assert!(bot.le(&top, "read").unwrap());
        // top grants nothing, so it covers no non-empty policy
        assert!(!top.le(&bot, "read").unwrap());
    }

    #[test]
    fn test_add_flow_keeps_antichain() {
        let config = cfg();
        let mut policy = Policy::new(&config, vec![time_flow("read", "08:00", "11:00")], None).unwrap();

        // a wider window is less restrictive than the existing flow and is
        // dropped by the covering rule
        let wider = Flow::from_spec(&config, &time_flow("read", "07:00", "12:00")).unwrap();
        policy.add_flow(wider).unwrap();
        assert_eq!(policy.flows_for("read").len(), 1);

        let disjoint = Flow::from_spec(&config, &time_flow("read", "14:00", "15:00")).unwrap();
        policy.add_flow(disjoint).unwrap();
        assert_eq!(policy.flows_for("read").len(), 2);
    }

    #[test]
    fn test_lub_unrelated_entities_collapses_to_top() {
        let config = cfg();
        let for_msg = Policy::from_value(
            &config,
            &json!([{ "op": "read" }]),
            Some(&json!({ "type": "/msg" })),
        )
        .unwrap();
        let for_api = Policy::from_value(
            &config,
            &json!([{ "op": "read" }]),
            Some(&json!({ "type": "/api" })),
        )
        .unwrap();

        assert_eq!(for_msg.lub(&for_api).unwrap(), Policy::top());
    }

    #[test]
    fn test_lub_adopts_more_specific_entity() {
        let config = cfg();
        let general = Policy::from_value(
            &config,
            &json!([{ "op": "read" }]),
            Some(&json!({ "type": "/any" })),
        )
        .unwrap();
        let specific = Policy::from_value(
            &config,
            &json!([{ "op": "read" }]),
            Some(&json!({ "type": "/user", "id": "1" })),
        )
        .unwrap();

        let merged = general.lub(&specific).unwrap();
        assert_eq!(
            merged.entity().unwrap(),
            specific.entity().unwrap()
        );
    }

    #[test]
    fn test_lub_intersects_matching_flows() {
        let config = cfg();
        let p1 = Policy::new(&config, vec![time_flow("read", "10:00", "18:00")], None).unwrap();
        let p2 = Policy::new(&config, vec![time_flow("read", "16:00", "20:00")], None).unwrap();

        let merged = p1.lub(&p2).unwrap();
        let expected = Policy::new(&config, vec![time_flow("read", "16:00", "18:00")], None).unwrap();
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_lub_with_top_is_top() {
        let config = cfg();
        let p = Policy::new(&config, vec![time_flow("read", "10:00", "18:00")], None).unwrap();
        assert_eq!(p.lub(&Policy::top()).unwrap(), Policy::top());
    }

    #[test]
    fn test_glb_unions_flows() {
        let config = cfg();
        let p1 = Policy::new(&config, vec![time_flow("read", "08:00", "09:00")], None).unwrap();
        let p2 = Policy::new(&config, vec![time_flow("read", "14:00", "15:00")], None).unwrap();

        match p1.glb(&p2).unwrap() {
            GlbOutcome::Policy(merged) => {
                assert_eq!(merged.flows_for("read").len(), 2);
            }
            GlbOutcome::Set(_) => panic!("related policies must merge"),
        }
    }

    #[test]
    fn test_glb_unrelated_entities_stays_a_set() {
        let config = cfg();
        let for_msg = Policy::from_value(
            &config,
            &json!([{ "op": "read" }]),
            Some(&json!({ "type": "/msg" })),
        )
        .unwrap();
        let for_api = Policy::from_value(
            &config,
            &json!([{ "op": "read" }]),
            Some(&json!({ "type": "/api" })),
        )
        .unwrap();

        match for_msg.glb(&for_api).unwrap() {
            GlbOutcome::Set(pair) => assert_eq!(pair.len(), 2),
            GlbOutcome::Policy(_) => panic!("unrelated policies must not merge"),
        }
    }

    #[test]
    fn test_eq_ignores_flow_order() {
        let config = cfg();
        let p1 = Policy::new(
            &config,
            vec![
                time_flow("read", "08:00", "09:00"),
                time_flow("read", "14:00", "15:00"),
            ],
            None,
        )
        .unwrap();
        let p2 = Policy::new(
            &config,
            vec![
                time_flow("read", "14:00", "15:00"),
                time_flow("read", "08:00", "09:00"),
            ],
            None,
        )
        .unwrap();

        assert_eq!(p1, p2);
        assert_ne!(p1, Policy::top());
    }

    #[tokio::test]
    async fn test_check_access_grants_matching_writer() {
        let config = cfg();
        let policy = Policy::new(&config, vec![id_flow("write", "1")], None).unwrap();
        let subject = Policy::bot(&config).unwrap();

        let decision = policy
            .check_access(&config, &subject, "write", &ctx("1"))
            .await
            .unwrap();
        assert!(decision.grant);
        assert!(!decision.conditional);
        assert!(decision.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_check_access_denies_with_conflicts() {
        let config = cfg();
        let policy = Policy::new(&config, vec![id_flow("write", "1")], None).unwrap();
        let subject = Policy::bot(&config).unwrap();

        let decision = policy
            .check_access(&config, &subject, "write", &ctx("2"))
            .await
            .unwrap();
        assert!(!decision.grant);
        assert!(!decision.conditional);
        assert_eq!(decision.conflicts.len(), 1);
        match &decision.conflicts[0] {
            Conflict::Lock(lock) => assert_eq!(lock.kind(), "hasId"),
            Conflict::Entity(_) => panic!("expected the blocking lock"),
        }
    }

    #[tokio::test]
    async fn test_check_access_attaches_actions_on_denial() {
        let config = cfg();
        let mut policy = Policy::new(&config, vec![id_flow("write", "1")], None).unwrap();
        policy.add_action("write", Action::new("log", vec![json!("denied")]));

        let subject = Policy::bot(&config).unwrap();
        let denied = policy
            .check_access(&config, &subject, "write", &ctx("2"))
            .await
            .unwrap();
        assert_eq!(denied.actions.len(), 1);

        let granted = policy
            .check_access(&config, &subject, "write", &ctx("1"))
            .await
            .unwrap();
        assert!(granted.actions.is_empty());
    }

    #[tokio::test]
    async fn test_check_access_validates_operation() {
        let config = cfg();
        let policy = Policy::bot(&config).unwrap();
        let subject = Policy::bot(&config).unwrap();
        assert!(policy
            .check_access(&config, &subject, "rename", &ctx("1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_top_denies_everything() {
        let config = cfg();
        let subject = Policy::bot(&config).unwrap();
        let decision = Policy::top()
            .check_access(&config, &subject, "write", &ctx("1"))
            .await
            .unwrap();
        assert!(!decision.grant);
    }

    #[tokio::test]
    async fn test_check_flow_requires_both_sides() {
        let config = cfg();
        // 00:00-00:00 is the empty window; negated it is the full clock
        let always = FlowSpec::new(
            "write",
            vec![LockSpec::new("inTimePeriod", vec![json!("00:00"), json!("00:00")]).negated()],
        );
        let never = FlowSpec::new(
            "write",
            vec![LockSpec::new("inTimePeriod", vec![json!("00:00"), json!("00:00")])],
        );

        let data_policy = Policy::from_value(&config, &json!([{ "op": "read" }]), None).unwrap();
        let node_policy = Policy::new(&config, vec![always], None).unwrap();

        let decision = data_policy
            .check_flow(&node_policy, FlowDirection::Incoming, &ctx("1"))
            .await
            .unwrap();
        assert!(decision.grant);

        // the data side still permits, but the node side never opens
        let strict_node = Policy::new(&config, vec![never], None).unwrap();
        let denied = data_policy
            .check_flow(&strict_node, FlowDirection::Incoming, &ctx("1"))
            .await
            .unwrap();
        assert!(!denied.grant);
    }

    #[test]
    fn test_process_conflicts_is_disjunctive_within_a_side() {
        let open = FlowEval::open();
        let closed = FlowEval {
            open: false,
            conditional: false,
            locks: Vec::new(),
            entity: None,
        };

        let decision = process_conflicts(&[closed.clone(), open.clone()], None);
        assert!(decision.grant);

        let decision = process_conflicts(&[closed.clone(), closed], None);
        assert!(!decision.grant);
    }

    #[test]
    fn test_process_conflicts_is_conjunctive_across_sides() {
        let open = FlowEval::open();
        let closed = FlowEval {
            open: false,
            conditional: false,
            locks: Vec::new(),
            entity: None,
        };

        let decision = process_conflicts(&[open.clone()], Some(&[closed]));
        assert!(!decision.grant);

        let decision = process_conflicts(&[open.clone()], Some(&[open.clone()]));
        assert!(decision.grant);

        // an empty second side denies
        let decision = process_conflicts(&[open], Some(&[]));
        assert!(!decision.grant);
    }

    #[test]
    fn test_process_conflicts_conditionality() {
        let open = FlowEval::open();
        let conditional = FlowEval {
            open: true,
            conditional: true,
            locks: Vec::new(),
            entity: None,
        };

        // a single unconditionally open flow removes the caveat
        let decision = process_conflicts(&[conditional.clone(), open], None);
        assert!(decision.grant);
        assert!(!decision.conditional);

        let decision = process_conflicts(&[conditional], None);
        assert!(decision.grant);
        assert!(decision.conditional);
    }

    #[test]
    fn test_serialization_round_trips() {
        let config = cfg();
        let policy = Policy::from_value(
            &config,
            &json!({
                "entity": { "type": "/user", "id": "1" },
                "flows": {
                    "read": { "flows": [{ "op": "read", "locks": [
                        { "lock": "inTimePeriod", "args": ["08:00", "11:00"] }
                    ]}]},
                    "write": { "flows": [{ "op": "write", "locks": [
                        { "lock": "hasId", "args": ["1"] }
                    ]}], "actions": [{ "name": "log" }]}
                }
            }),
            None,
        )
        .unwrap();

        let value = serde_json::to_value(&policy).unwrap();
        let again = Policy::from_value(&config, &value, None).unwrap();
        assert_eq!(policy, again);
        assert_eq!(again.actions_for("write").len(), 1);
    }

    #[test]
    fn test_descriptor_mode_rejects_separate_entity() {
        let config = cfg();
        let result = Policy::from_value(
            &config,
            &json!({ "flows": [] }),
            Some(&json!({ "type": "/user" })),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_legacy_flat_array_accepted() {
        let config = cfg();
        let policy = Policy::from_value(
            &config,
            &json!([
                { "op": "read", "locks": [{ "path": "inTimePeriod", "args": ["08:00", "11:00"] }] }
            ]),
            Some(&json!({ "type": "/user", "id": "1" })),
        )
        .unwrap();

        assert_eq!(policy.flows_for("read").len(), 1);
        assert!(policy.entity().is_some());
    }
}
