//! Evaluation context: the sender/receiver/message frame for lock evaluation.
//!
//! A message flows from a sender to a receiver. A lock may need attributes
//! of either side, or of the message itself, so the context tracks which
//! view is active; `entity()` returns the descriptor under evaluation.
//! The context also memoizes lock states computed during one access check.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::lock::Lock;

/// The `{ type, data }` descriptor of an entity participating in a flow.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInfo {
    /// The entity's configured type name (or `"msg"` for message frames).
    pub etype: String,
    /// Arbitrary metadata used during lock evaluation.
    pub data: Value,
}

impl EntityInfo {
    /// Create a descriptor from a type name and metadata.
    pub fn new(etype: impl Into<String>, data: Value) -> Self {
        Self {
            etype: etype.into(),
            data,
        }
    }
}

/// The view a context is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Viewpoint {
    /// Default view; the sender is the entity under evaluation.
    #[default]
    Normal,
    /// The sender is the entity under evaluation.
    Sender,
    /// The receiver is the entity under evaluation.
    Receiver,
    /// The message itself is the entity under evaluation.
    Message,
}

/// Per-access-check evaluation frame.
///
/// Owned by one access check; never shared across concurrent checks, so
/// the lock-state memo table needs no external synchronization.
#[derive(Debug)]
pub struct Context {
    sender: EntityInfo,
    receiver: EntityInfo,
    msg: Option<EntityInfo>,
    viewpoint: Viewpoint,
    is_static: bool,
    lock_states: Mutex<HashMap<String, bool>>,
}

impl Clone for Context {
    fn clone(&self) -> Self {
        let states = self
            .lock_states
            .lock()
            .map(|map| map.clone())
            .unwrap_or_default();
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            msg: self.msg.clone(),
            viewpoint: self.viewpoint,
            is_static: self.is_static,
            lock_states: Mutex::new(states),
        }
    }
}

impl Context {
    /// Build a normal-viewpoint context for a sender/receiver pair, with an
    /// optional message descriptor.
    pub fn new(sender: EntityInfo, receiver: EntityInfo, msg: Option<Value>) -> Self {
        Self {
            sender,
            receiver,
            msg: msg.map(|data| EntityInfo::new("msg", data)),
            viewpoint: Viewpoint::Normal,
            is_static: false,
            lock_states: Mutex::new(HashMap::new()),
        }
    }

    /// Mark this context as a static-analysis frame.
    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    /// Whether evaluation happens during static analysis.
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// The sender descriptor.
    pub fn sender(&self) -> &EntityInfo {
        &self.sender
    }

    /// The receiver descriptor.
    pub fn receiver(&self) -> &EntityInfo {
        &self.receiver
    }

    /// The message descriptor, if any.
    pub fn msg(&self) -> Option<&EntityInfo> {
        self.msg.as_ref()
    }

    /// The active viewpoint.
    pub fn viewpoint(&self) -> Viewpoint {
        self.viewpoint
    }

    /// The entity currently under evaluation, per the active viewpoint.
    pub fn entity(&self) -> Option<&EntityInfo> {
        match self.viewpoint {
            Viewpoint::Normal | Viewpoint::Sender => Some(&self.sender),
            Viewpoint::Receiver => Some(&self.receiver),
            Viewpoint::Message => self.msg.as_ref(),
        }
    }

    /// The non-active side of the flow, if the view has one.
    pub fn other_entity(&self) -> Option<&EntityInfo> {
        match self.viewpoint {
            Viewpoint::Normal | Viewpoint::Sender => Some(&self.receiver),
            Viewpoint::Receiver => Some(&self.sender),
            Viewpoint::Message => None,
        }
    }

    /// Switch to the normal view.
    pub fn set_normal_context(&mut self) {
        self.viewpoint = Viewpoint::Normal;
    }

    /// Switch to the sender view.
    pub fn set_sender_context(&mut self) {
        self.viewpoint = Viewpoint::Sender;
    }

    /// Switch to the receiver view.
    pub fn set_receiver_context(&mut self) {
        self.viewpoint = Viewpoint::Receiver;
    }

    /// Switch to the message view.
    pub fn set_msg_context(&mut self) {
        self.viewpoint = Viewpoint::Message;
    }

    /// Look up a memoized lock state for the given subject.
    ///
    /// The permanently closed sentinel short-circuits to `false` without a
    /// cache lookup. Returns `None` when the state has not been computed or
    /// the subject is not cacheable (no identifying attribute).
    pub fn get_lock_state(&self, lock: &Lock, subject: Option<&EntityInfo>) -> Option<bool> {
        if lock.kind() == "closed" {
            return Some(false);
        }
        let key = Self::state_key(lock, subject)?;
        self.lock_states
            .lock()
            .ok()
            .and_then(|states| states.get(&key).copied())
    }

    /// Memoize a lock state for the given subject.
    ///
    /// Conditional (time-varying) verdicts must not be passed here; the
    /// cache only holds stable results for the duration of one check.
    pub fn add_lock_state(&self, lock: &Lock, subject: Option<&EntityInfo>, open: bool) {
        if lock.kind() == "closed" {
            return;
        }
        if let Some(key) = Self::state_key(lock, subject) {
            if let Ok(mut states) = self.lock_states.lock() {
                states.insert(key, open);
            }
        }
    }

    // Cache key: subject scope, lock kind, serialized arguments.
    fn state_key(lock: &Lock, subject: Option<&EntityInfo>) -> Option<String> {
        let scope = match subject {
            None => "global".to_string(),
            Some(info) if info.etype == "msg" || info.etype == "/msg" => "msg".to_string(),
            Some(info) => {
                let id = info.data.get("id")?;
                format!("{}{}", info.etype, id)
            }
        };

        let mut args = String::new();
        for arg in lock.args() {
            args.push_str(&arg.to_string());
            args.push(',');
        }

        Some(format!("{}|{}|{}", scope, lock.kind(), args))
    }
}
