//! Compiled artifacts

use crate::cache::clock::duration_ms;
use std::sync::Arc;
use std::time::Duration;

/// A fully buffered, immutable compiled bundle.
///
/// Cloning shares the body, so one output can be handed to any number of
/// concurrent readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    body: Arc<[u8]>,
    mime_type: &'static str,
    created_time: u64,
    ttl: Duration,
}

impl Output {
    pub fn new(body: Vec<u8>, mime_type: &'static str, created_time: u64, ttl: Duration) -> Self {
        Self {
            body: body.into(),
            mime_type,
            created_time,
            ttl,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body handle that shares the underlying buffer
    pub fn shared_body(&self) -> Arc<[u8]> {
        Arc::clone(&self.body)
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn mime_type(&self) -> &'static str {
        self.mime_type
    }

    pub fn created_time(&self) -> u64 {
        self.created_time
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn expiry_time(&self) -> u64 {
        self.created_time.saturating_add(duration_ms(self.ttl))
    }

    /// Lifetime left at `now_ms`; zero once expired
    pub fn remaining_ttl(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expiry_time().saturating_sub(now_ms))
    }
}
