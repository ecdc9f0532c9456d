//! Built-in lock predicate realizations.
//!
//! Each predicate is a small unit struct implementing
//! [`LockPredicate`](crate::lock::LockPredicate); the shared fields live
//! in [`Lock`](crate::lock::Lock), not in the predicate.

pub mod has_id;
pub mod sentinel;
pub mod time_period;
