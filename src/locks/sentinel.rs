//! The `open` and `closed` sentinel locks.
//!
//! `open` is always satisfied and is the neutral element under `lub`;
//! `closed` is never satisfied and absorbs any merge. The flow algebra
//! inserts `closed` when two locks of the same kind turn out to be
//! contradictory.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;
use crate::lock::{Lock, LockPredicate, LockState};

/// The always-open sentinel predicate.
#[derive(Debug)]
pub struct OpenPredicate;

/// The permanently-closed sentinel predicate.
#[derive(Debug)]
pub struct ClosedPredicate;

/// Construct an always-open sentinel lock.
pub fn open_lock() -> Lock {
    Lock::from_parts("open", Vec::new(), false, Arc::new(OpenPredicate))
}

/// Construct a permanently-closed sentinel lock.
pub fn closed_lock() -> Lock {
    Lock::from_parts("closed", Vec::new(), false, Arc::new(ClosedPredicate))
}

#[async_trait]
impl LockPredicate for OpenPredicate {
    fn kind(&self) -> &str {
        "open"
    }

    fn description(&self) -> &str {
        "always open"
    }

    async fn is_open(&self, _lock: &Lock, _context: &Context, _scope: &str) -> Result<LockState> {
        Ok(LockState::open())
    }

    fn lub(&self, _lock: &Lock, other: &Lock) -> Result<Option<Lock>> {
        // open implies nothing; the merge is whatever the other lock requires
        Ok(Some(other.clone()))
    }

    fn le(&self, _lock: &Lock, _other: &Lock) -> Result<bool> {
        // the open set of `open` is everything
        Ok(true)
    }
}

#[async_trait]
impl LockPredicate for ClosedPredicate {
    fn kind(&self) -> &str {
        "closed"
    }

    fn description(&self) -> &str {
        "never open"
    }

    async fn is_open(&self, lock: &Lock, _context: &Context, _scope: &str) -> Result<LockState> {
        Ok(LockState::closed(lock))
    }

    fn lub(&self, lock: &Lock, _other: &Lock) -> Result<Option<Lock>> {
        Ok(Some(lock.clone()))
    }

    fn le(&self, _lock: &Lock, other: &Lock) -> Result<bool> {
        // closed opens for nothing, so it only covers another closed lock
        Ok(other.kind() == "closed")
    }
}
