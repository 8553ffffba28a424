//! Cancellation: one shared atomic stop flag per running download item.
//!
//! Segment workers and the streaming delegate poll their item's flag per
//! chunk/line; setting it causes a prompt, graceful stop (§5 "Cancellation").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Error returned when a download is stopped by user request (pause/cancel),
/// as opposed to a network or disk failure.
#[derive(Debug)]
pub struct JobAborted;

impl std::fmt::Display for JobAborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job aborted by user")
    }
}

impl std::error::Error for JobAborted {}

/// Shared registry of item id -> abort token. The scheduler registers a
/// token when it dispatches an item and hands the `Arc<AtomicBool>` to the
/// worker (segment downloader or streaming delegate); the registry or
/// ingress layer calls `request_abort` to stop it from outside.
#[derive(Default)]
pub struct JobControl {
    items: RwLock<HashMap<String, Arc<AtomicBool>>>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running item; returns the abort token to pass to the worker.
    pub fn register(&self, item_id: &str) -> Arc<AtomicBool> {
        let token = Arc::new(AtomicBool::new(false));
        self.items
            .write()
            .unwrap()
            .insert(item_id.to_string(), Arc::clone(&token));
        token
    }

    /// Unregister an item (call when the worker returns, success or failure).
    pub fn unregister(&self, item_id: &str) {
        self.items.write().unwrap().remove(item_id);
    }

    /// Request abort for a running item. No-op if the item isn't running.
    pub fn request_abort(&self, item_id: &str) {
        if let Some(token) = self.items.read().unwrap().get(item_id) {
            token.store(true, Ordering::Relaxed);
        }
    }

    /// True if an abort has been requested (and not yet cleared by unregister).
    pub fn is_running(&self, item_id: &str) -> bool {
        self.items.read().unwrap().contains_key(item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_abort_sets_token() {
        let ctl = JobControl::new();
        let token = ctl.register("abc123");
        assert!(!token.load(Ordering::Relaxed));
        ctl.request_abort("abc123");
        assert!(token.load(Ordering::Relaxed));
    }

    #[test]
    fn abort_unknown_item_is_noop() {
        let ctl = JobControl::new();
        ctl.request_abort("nonexistent");
    }

    #[test]
    fn unregister_removes_item() {
        let ctl = JobControl::new();
        ctl.register("x");
        assert!(ctl.is_running("x"));
        ctl.unregister("x");
        assert!(!ctl.is_running("x"));
    }
}
