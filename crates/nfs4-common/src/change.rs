//! Directory change counters
//!
//! Every mutable directory owns a counter that advances on each successful
//! mutation. A mutation runs under the directory's async mutex so the
//! before/after pair it reports brackets exactly that change.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::filehandle::ObjectId;

/// `change_info4` contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeInfo {
    /// Before/after were captured under the directory's mutation lock
    pub atomic: bool,
    /// Counter before the change
    pub before: u64,
    /// Counter after the change
    pub after: u64,
}

#[derive(Debug)]
struct ChangeScope {
    serial: Mutex<()>,
    value: AtomicU64,
}

impl ChangeScope {
    fn new(base: u64) -> Self {
        Self {
            serial: Mutex::new(()),
            value: AtomicU64::new(base),
        }
    }

    fn bump(&self, before: u64) -> ChangeInfo {
        let after = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        ChangeInfo {
            atomic: true,
            before,
            after,
        }
    }
}

/// Process-wide change counters keyed by directory id
#[derive(Debug)]
pub struct ChangeCounter {
    base: u64,
    scopes: DashMap<ObjectId, Arc<ChangeScope>>,
}

impl ChangeCounter {
    /// Create counters that start at `base`
    pub fn new(base: u64) -> Self {
        Self {
            base,
            scopes: DashMap::new(),
        }
    }

    fn scope(&self, id: ObjectId) -> Arc<ChangeScope> {
        self.scopes
            .entry(id)
            .or_insert_with(|| Arc::new(ChangeScope::new(self.base)))
            .clone()
    }

    /// Current counter value of a directory
    pub fn current(&self, scope: ObjectId) -> u64 {
        self.scopes
            .get(&scope)
            .map(|s| s.value.load(Ordering::SeqCst))
            .unwrap_or(self.base)
    }

    /// Run a mutation of `scope`. The counter advances only when `op`
    /// succeeds.
    pub async fn mutate<T, E, F, Fut>(&self, scope: ObjectId, op: F) -> Result<(T, ChangeInfo), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let scope = self.scope(scope);
        let _serial = scope.serial.lock().await;
        let before = scope.value.load(Ordering::SeqCst);
        let value = op().await?;
        Ok((value, scope.bump(before)))
    }

    /// Run a mutation that touches two directories (RENAME). Returns the
    /// change info of `a` then `b`; when both name the same directory the
    /// counter advances once and both infos are equal.
    pub async fn mutate_pair<T, E, F, Fut>(
        &self,
        a: ObjectId,
        b: ObjectId,
        op: F,
    ) -> Result<(T, ChangeInfo, ChangeInfo), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if a == b {
            let (value, info) = self.mutate(a, op).await?;
            return Ok((value, info, info));
        }

        let scope_a = self.scope(a);
        let scope_b = self.scope(b);
        // Lock in id order
        let (first, second) = if a < b {
            (&scope_a, &scope_b)
        } else {
            (&scope_b, &scope_a)
        };
        let _first = first.serial.lock().await;
        let _second = second.serial.lock().await;

        let before_a = scope_a.value.load(Ordering::SeqCst);
        let before_b = scope_b.value.load(Ordering::SeqCst);
        let value = op().await?;
        Ok((value, scope_a.bump(before_a), scope_b.bump(before_b)))
    }

    /// Drop the counter of a removed directory
    pub fn forget(&self, scope: ObjectId) {
        self.scopes.remove(&scope);
    }
}

impl Default for ChangeCounter {
    fn default() -> Self {
        Self::new(1)
    }
}
