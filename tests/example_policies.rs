//! End-to-end tests over realistic policy documents: parsing both JSON
//! forms, serialization round-trips, lattice relations between concrete
//! policies, and full access checks.

use flowlock::{
    AccessDecision, Config, Conflict, Context, EntityInfo, FlowDirection, GlbOutcome, Policy,
};
use serde_json::json;

fn cfg() -> Config {
    Config::standard()
}

fn ctx(sender_id: &str) -> Context {
    Context::new(
        EntityInfo::new("/user", json!({ "id": sender_id })),
        EntityInfo::new("/client", json!({ "id": "c1" })),
        Some(json!({ "id": "m1" })),
    )
}

/// A document policy for a named user: reads only during office hours,
/// writes only by the owner, denials logged.
fn document_policy(config: &Config) -> Policy {
    Policy::from_value(
        config,
        &json!({
            "entity": { "type": "/user", "id": "1" },
            "flows": {
                "read": {
                    "flows": [
                        { "op": "read", "locks": [
                            { "lock": "inTimePeriod", "args": ["08:00", "18:00"] }
                        ]}
                    ]
                },
                "write": {
                    "flows": [
                        { "op": "write", "locks": [
                            { "lock": "hasId", "args": ["1"] }
                        ]}
                    ],
                    "actions": [{ "name": "log", "args": ["write denied"] }]
                }
            }
        }),
        None,
    )
    .unwrap()
}

#[test]
fn test_parses_descriptor_and_legacy_forms_identically() {
    let config = cfg();

    let descriptor = Policy::from_value(
        &config,
        &json!({
            "entity": { "type": "/user", "id": "1" },
            "flows": [
                { "op": "read", "locks": [
                    { "lock": "inTimePeriod", "args": ["08:00", "18:00"] }
                ]}
            ]
        }),
        None,
    )
    .unwrap();

    // the legacy form spells the lock kind "path" and passes the entity
    // separately
    let legacy = Policy::from_value(
        &config,
        &json!([
            { "op": "read", "locks": [
                { "path": "inTimePeriod", "args": ["08:00", "18:00"] }
            ]}
        ]),
        Some(&json!({ "type": "/user", "id": "1" })),
    )
    .unwrap();

    assert_eq!(descriptor, legacy);
}

#[test]
fn test_serialization_round_trips_through_json() {
    let config = cfg();
    let policy = document_policy(&config);

    let value = serde_json::to_value(&policy).unwrap();
    let again = Policy::from_value(&config, &value, None).unwrap();

    assert_eq!(policy, again);
    assert_eq!(again.actions_for("write").len(), 1);
    assert_eq!(again.entity(), policy.entity());
}

#[test]
fn test_bot_is_strictly_below_a_real_policy() {
    let config = cfg();
    let bot = Policy::bot(&config).unwrap();
    let policy = document_policy(&config);

    assert!(bot.le(&policy, "read").unwrap());
    assert!(bot.le(&policy, "write").unwrap());
    assert!(!policy.le(&bot, "read").unwrap());
    assert!(!policy.le(&bot, "write").unwrap());
}

#[test]
fn test_bot_lub_with_a_data_policy_yields_that_policy() {
    let config = cfg();
    let bot = Policy::bot(&config).unwrap();
    let data_policy = Policy::from_value(
        &config,
        &json!([
            { "op": "read", "locks": [
                { "lock": "inTimePeriod", "args": ["08:00", "18:00"] }
            ]},
            { "op": "write", "locks": [
                { "lock": "hasId", "args": ["1"] }
            ]}
        ]),
        None,
    )
    .unwrap();

    let merged = bot.lub(&data_policy).unwrap();
    assert_eq!(merged, data_policy);
}

#[test]
fn test_lub_narrows_overlapping_reading_windows() {
    let config = cfg();
    let morning = Policy::from_value(
        &config,
        &json!([{ "op": "read", "locks": [
            { "lock": "inTimePeriod", "args": ["06:00", "12:00"] }
        ]}]),
        None,
    )
    .unwrap();
    let office = Policy::from_value(
        &config,
        &json!([{ "op": "read", "locks": [
            { "lock": "inTimePeriod", "args": ["09:00", "17:00"] }
        ]}]),
        None,
    )
    .unwrap();

    let merged = morning.lub(&office).unwrap();
    let expected = Policy::from_value(
        &config,
        &json!([{ "op": "read", "locks": [
            { "lock": "inTimePeriod", "args": ["09:00", "12:00"] }
        ]}]),
        None,
    )
    .unwrap();
    assert_eq!(merged, expected);
}

#[test]
fn test_lub_of_unrelated_entity_policies_is_top() {
    let config = cfg();
    // /msg and /api sit at the same rank, so neither dominates the other
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
fn test_glb_keeps_both_alternatives() {
    let config = cfg();
    let owner_writes = Policy::from_value(
        &config,
        &json!([{ "op": "write", "locks": [{ "lock": "hasId", "args": ["1"] }] }]),
        Some(&json!({ "type": "/user", "id": "1" })),
    )
    .unwrap();
    let anyone_reads = Policy::from_value(
        &config,
        &json!([{ "op": "read" }]),
        Some(&json!({ "type": "/any" })),
    )
    .unwrap();

    match anyone_reads.glb(&owner_writes).unwrap() {
        GlbOutcome::Policy(merged) => {
            // the more specific entity wins and both flows survive
            assert_eq!(merged.entity(), owner_writes.entity());
            assert_eq!(merged.flows_for("read").len(), 1);
            assert_eq!(merged.flows_for("write").len(), 1);
        }
        GlbOutcome::Set(_) => panic!("related policies must tighten into one"),
    }
}

#[tokio::test]
async fn test_owner_may_write_others_may_not() {
    let config = cfg();
    let policy = document_policy(&config);
    let subject = Policy::bot(&config).unwrap();

    let owner = policy
        .check_access(&config, &subject, "write", &ctx("1"))
        .await
        .unwrap();
    assert!(owner.grant);
    assert!(owner.conflicts.is_empty());
    assert!(owner.actions.is_empty());

    let stranger = policy
        .check_access(&config, &subject, "write", &ctx("2"))
        .await
        .unwrap();
    assert!(!stranger.grant);
    assert!(stranger
        .conflicts
        .iter()
        .any(|c| matches!(c, Conflict::Lock(lock) if lock.kind() == "hasId")));
    // the denial carries the policy's log action
    assert_eq!(stranger.actions.len(), 1);
    assert_eq!(stranger.actions[0].name, "log");
}

#[tokio::test]
async fn test_static_evaluation_reports_time_locks_as_conditions() {
    let config = cfg();
    let policy = Policy::from_value(
        &config,
        &json!([{ "op": "read", "locks": [
            { "lock": "inTimePeriod", "args": ["08:00", "18:00"] }
        ]}]),
        None,
    )
    .unwrap();
    let subject = Policy::bot(&config).unwrap();
    let static_ctx = ctx("1").with_static(true);

    let decision: AccessDecision = policy
        .check_access(&config, &subject, "read", &static_ctx)
        .await
        .unwrap();
    assert!(decision.grant);
    assert!(decision.conditional);
    assert!(decision
        .conflicts
        .iter()
        .any(|c| matches!(c, Conflict::Lock(lock) if lock.kind() == "inTimePeriod")));
}

#[tokio::test]
async fn test_incoming_flow_needs_data_and_node_agreement() {
    let config = cfg();

    // 00:00-00:00 is the empty window; negated it covers the whole clock
    let open_node = Policy::from_value(
        &config,
        &json!([{ "op": "write", "locks": [
            { "lock": "inTimePeriod", "args": ["00:00", "00:00"], "not": true }
        ]}]),
        None,
    )
    .unwrap();
    let closed_node = Policy::from_value(
        &config,
        &json!([{ "op": "write", "locks": [
            { "lock": "inTimePeriod", "args": ["00:00", "00:00"] }
        ]}]),
        None,
    )
    .unwrap();
    let data_policy = Policy::from_value(&config, &json!([{ "op": "read" }]), None).unwrap();

    let admitted = data_policy
        .check_flow(&open_node, FlowDirection::Incoming, &ctx("1"))
        .await
        .unwrap();
    assert!(admitted.grant);

    let rejected = data_policy
        .check_flow(&closed_node, FlowDirection::Incoming, &ctx("1"))
        .await
        .unwrap();
    assert!(!rejected.grant);
    assert!(!rejected.conflicts.is_empty());
}

#[tokio::test]
async fn test_data_without_outbound_flows_is_never_released() {
    let config = cfg();
    let silent_data = Policy::from_value(
        &config,
        &json!([{ "op": "write", "locks": [
            { "lock": "inTimePeriod", "args": ["00:00", "00:00"], "not": true }
        ]}]),
        None,
    )
    .unwrap();
    let open_node = silent_data.clone();

    // the data policy has no read-direction flows, so its side denies
    let decision = silent_data
        .check_flow(&open_node, FlowDirection::Incoming, &ctx("1"))
        .await
        .unwrap();
    assert!(!decision.grant);
}
