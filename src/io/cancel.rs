//! Cooperative cancellation shared across a run.
//!
//! A single token is threaded through the run context; the CLI flips it from
//! a Ctrl-C handler. Every external wait point (agent subprocess, verifier
//! command, between batches) polls the token, so no new checkpoint is created
//! and no new agent invocation begins once it is set.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
