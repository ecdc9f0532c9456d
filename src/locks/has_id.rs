//! The `hasId` lock: opens when the entity under evaluation carries a
//! specific identifier.
//!
//! Identity locks have no useful ordering beyond structural equality, so
//! `le` only accepts an identical lock and `lub` collapses two different
//! identity requirements into the closed sentinel.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::lock::{Arg, Lock, LockPredicate, LockState};
use crate::locks::sentinel::closed_lock;

const KIND: &str = "hasId";

/// The `hasId` predicate.
#[derive(Debug)]
pub struct HasIdPredicate;

fn required_id(lock: &Lock) -> Result<&Value> {
    match &lock.args()[0] {
        Arg::Value(v) => Ok(v),
        Arg::Entity(_) => Err(Error::validation(
            "hasId expects a plain identifier argument",
        )),
    }
}

fn id_matches(lock: &Lock, data: &Value) -> Result<bool> {
    Ok(data.get("id") == Some(required_id(lock)?))
}

#[async_trait]
impl LockPredicate for HasIdPredicate {
    fn kind(&self) -> &str {
        KIND
    }

    fn arity(&self) -> usize {
        1
    }

    fn scopes(&self) -> &[&str] {
        &["/any", "/user", "/sensor"]
    }

    fn description(&self) -> &str {
        "open when the entity in view has the given identifier"
    }

    async fn is_open(&self, lock: &Lock, context: &Context, scope: &str) -> Result<LockState> {
        if context.is_static() {
            return Err(Error::evaluation(
                "hasId cannot be decided during static analysis",
            ));
        }

        let subject = context
            .entity()
            .ok_or_else(|| Error::evaluation("hasId requires an entity in view"))?;

        let matches = match scope {
            "/user" => subject.etype == "/user" && id_matches(lock, &subject.data)?,
            "/sensor" => subject.etype == "/sensor" && id_matches(lock, &subject.data)?,
            "/any" => {
                (subject.etype == "/user" || subject.etype == "/sensor")
                    && id_matches(lock, &subject.data)?
            }
            other => {
                return Err(Error::evaluation(format!(
                    "hasId does not apply to scope '{}'",
                    other
                )))
            }
        };

        if matches != lock.negated() {
            Ok(LockState::open())
        } else {
            Ok(LockState::closed(lock))
        }
    }

    fn lub(&self, lock: &Lock, other: &Lock) -> Result<Option<Lock>> {
        if other.kind() != KIND {
            return Ok(None);
        }
        if lock == other {
            return Ok(Some(lock.clone()));
        }
        // Two different identity requirements can never hold at once.
        Ok(Some(closed_lock()))
    }

    fn le(&self, lock: &Lock, other: &Lock) -> Result<bool> {
        Ok(other.kind() == KIND && lock == other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::EntityInfo;
    use crate::lock::LockSpec;
    use serde_json::json;

    fn id_lock(id: &str) -> Lock {
        let config = Config::standard();
        Lock::from_spec(&config, &LockSpec::new(KIND, vec![json!(id)])).unwrap()
    }

    fn ctx(sender_id: &str) -> Context {
        Context::new(
            EntityInfo::new("/user", json!({ "id": sender_id })),
            EntityInfo::new("/client", json!({ "id": "9" })),
            None,
        )
    }

    #[tokio::test]
    async fn test_open_for_matching_id() {
        let lock = id_lock("1");
        let state = lock.is_open(&ctx("1"), "/user").await.unwrap();
        assert!(state.open);
        assert!(!state.conditional);
    }

    #[tokio::test]
    async fn test_closed_for_other_id() {
        let lock = id_lock("1");
        let state = lock.is_open(&ctx("2"), "/user").await.unwrap();
        assert!(!state.open);
        assert_eq!(state.lock, Some(lock));
    }

    #[tokio::test]
    async fn test_negation_flips_verdict() {
        let mut lock = id_lock("1");
        lock.neg();
        assert!(!lock.is_open(&ctx("1"), "/user").await.unwrap().open);
        assert!(lock.is_open(&ctx("2"), "/user").await.unwrap().open);
    }

    #[tokio::test]
    async fn test_any_scope_accepts_users_and_sensors() {
        let lock = id_lock("7");
        let user = ctx("7");
        assert!(lock.is_open(&user, "/any").await.unwrap().open);

        let sensor = Context::new(
            EntityInfo::new("/sensor", json!({ "id": "7" })),
            EntityInfo::new("/client", json!({ "id": "9" })),
            None,
        );
        assert!(lock.is_open(&sensor, "/any").await.unwrap().open);
    }

    #[tokio::test]
    async fn test_wrong_type_stays_closed() {
        // a client with the right id is not a user
        let lock = id_lock("9");
        let context = Context::new(
            EntityInfo::new("/client", json!({ "id": "9" })),
            EntityInfo::new("/user", json!({ "id": "1" })),
            None,
        );
        assert!(!lock.is_open(&context, "/user").await.unwrap().open);
    }

    #[tokio::test]
    async fn test_static_context_rejected() {
        let lock = id_lock("1");
        let context = ctx("1").with_static(true);
        assert!(lock.is_open(&context, "/user").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_scope_rejected() {
        let lock = id_lock("1");
        assert!(lock.is_open(&ctx("1"), "/document").await.is_err());
    }

    #[test]
    fn test_le_is_structural() {
        let a = id_lock("1");
        let b = id_lock("1");
        let c = id_lock("2");
        assert!(a.le(&b).unwrap());
        assert!(!a.le(&c).unwrap());
    }

    #[test]
    fn test_lub_of_distinct_ids_is_closed() {
        let a = id_lock("1");
        let b = id_lock("2");
        let merged = a.lub(&b).unwrap().unwrap();
        assert_eq!(merged.kind(), "closed");

        assert_eq!(a.lub(&a).unwrap(), Some(a.clone()));
    }
}
