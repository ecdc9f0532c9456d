//! The `inTimePeriod` lock: time-of-day interval containment.
//!
//! The interval `[start, end)` is an arc on the 24h clock, measured in
//! minutes since midnight. `end < start` wraps midnight (`18:00`–`07:00`
//! means "from 18:00 through 07:00 the next day"). A negated lock's open
//! set is the complementary arc, so negation folds into arc form and the
//! ordering and merge reduce to circular-arc containment and intersection.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveTime, Timelike, Utc};
use serde_json::json;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::lock::{Arg, Lock, LockPredicate, LockState};

const KIND: &str = "inTimePeriod";
const MINUTES_PER_DAY: i64 = 24 * 60;

/// A clockwise arc on the 24h clock: `len` minutes starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimeArc {
    start: i64,
    len: i64,
}

impl TimeArc {
    fn end(&self) -> i64 {
        (self.start + self.len).rem_euclid(MINUTES_PER_DAY)
    }

    fn contains_point(&self, minute: i64) -> bool {
        (minute - self.start).rem_euclid(MINUTES_PER_DAY) < self.len
    }

    /// Whether `other` lies entirely within this arc, walking clockwise
    /// from this arc's start.
    fn contains_arc(&self, other: &TimeArc) -> bool {
        if other.len == 0 || self.len == MINUTES_PER_DAY {
            return true;
        }
        other.len <= self.len
            && (other.start - self.start).rem_euclid(MINUTES_PER_DAY) + other.len <= self.len
    }
}

fn parse_minutes(arg: &Arg) -> Result<i64> {
    let text = arg
        .as_str()
        .ok_or_else(|| Error::validation("inTimePeriod arguments must be \"HH:MM\" strings"))?;
    let time = NaiveTime::parse_from_str(text, "%H:%M")
        .map_err(|e| Error::validation(format!("invalid time '{}': {}", text, e)))?;
    Ok(i64::from(time.hour()) * 60 + i64::from(time.minute()))
}

/// The lock's open set as an arc; negation becomes the complement arc.
fn open_arc(lock: &Lock) -> Result<TimeArc> {
    let start = parse_minutes(&lock.args()[0])?;
    let end = parse_minutes(&lock.args()[1])?;
    let len = (end - start).rem_euclid(MINUTES_PER_DAY);
    if lock.negated() {
        Ok(TimeArc {
            start: end,
            len: MINUTES_PER_DAY - len,
        })
    } else {
        Ok(TimeArc { start, len })
    }
}

fn format_minutes(minute: i64) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

fn lock_from_arc(start: i64, end: i64) -> Lock {
    Lock::from_parts(
        KIND,
        vec![
            Arg::Value(json!(format_minutes(start))),
            Arg::Value(json!(format_minutes(end))),
        ],
        false,
        Arc::new(TimePeriodPredicate),
    )
}

/// The `inTimePeriod` predicate.
#[derive(Debug)]
pub struct TimePeriodPredicate;

#[async_trait]
impl LockPredicate for TimePeriodPredicate {
    fn kind(&self) -> &str {
        KIND
    }

    fn arity(&self) -> usize {
        2
    }

    fn description(&self) -> &str {
        "open while the time of day lies in the given period"
    }

    fn validate(&self, lock: &Lock) -> Result<()> {
        if lock.args().len() != self.arity() {
            return Err(Error::validation(format!(
                "lock '{}' expects a start and an end time",
                KIND
            )));
        }
        open_arc(lock).map(|_| ())
    }

    async fn is_open(&self, lock: &Lock, context: &Context, _scope: &str) -> Result<LockState> {
        if context.is_static() {
            // Static analysis cannot fix the clock; the verdict stays a caveat.
            return Ok(LockState::conditional(true, lock));
        }

        let now = Utc::now().time();
        let minute = i64::from(now.hour()) * 60 + i64::from(now.minute());
        if open_arc(lock)?.contains_point(minute) {
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

        let a = open_arc(lock)?;
        let b = open_arc(other)?;

        if a.contains_arc(&b) {
            return Ok(Some(other.clone()));
        }
        if b.contains_arc(&a) {
            return Ok(Some(lock.clone()));
        }
        // Arcs overlapping at both ends intersect in two pieces; no single
        // period expresses that.
        if a.contains_point(b.start) && b.contains_point(a.start) {
            return Ok(None);
        }
        // Overlapping arcs: the tightest shared open window.
        if a.contains_point(b.start) {
            return Ok(Some(lock_from_arc(b.start, a.end())));
        }
        if b.contains_point(a.start) {
            return Ok(Some(lock_from_arc(a.start, b.end())));
        }
        // Disjoint open sets: no merge exists.
        Ok(None)
    }

    fn le(&self, lock: &Lock, other: &Lock) -> Result<bool> {
        if other.kind() != KIND {
            return Ok(false);
        }
        Ok(open_arc(lock)?.contains_arc(&open_arc(other)?))
    }
}
