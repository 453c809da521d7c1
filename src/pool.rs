//! HandlePool (C3): per-database pool of handles, keyed by category.
//!
//! Exclusive categories (everything but `Normal`) get a one-slot queue and
//! serialize access; `Normal` handles are checked out up to the pool's
//! configured maximum. Handles are returned to callers as [`Recyclable`]
//! borrows: the pool holds the only strong ownership, and dropping the
//! borrow returns the handle to idle (or closes it, during a purge).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::{reconfigure, ConfigRegistry, InvokedSet};
use crate::error::{Error, Result};
use crate::handle::{HandleBase, HandleCategory};
use crate::observability;

struct Slot {
    handle: HandleBase,
    invoked: InvokedSet,
}

struct PoolState {
    idle: HashMap<HandleCategory, VecDeque<Slot>>,
    checked_out: HashMap<HandleCategory, usize>,
    alive_count: usize,
    blockade_count: u32,
    purging: bool,
}

struct PoolInner {
    path: String,
    max_handles: usize,
    registry: Mutex<ConfigRegistry>,
    state: Mutex<PoolState>,
    cond: Condvar,
}

/// Per-path collection of handles.
#[derive(Clone)]
pub struct HandlePool {
    inner: Arc<PoolInner>,
}

impl HandlePool {
    pub fn new(path: &str, max_handles: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                path: path.to_string(),
                max_handles,
                registry: Mutex::new(ConfigRegistry::new()),
                state: Mutex::new(PoolState {
                    idle: HashMap::new(),
                    checked_out: HashMap::new(),
                    alive_count: 0,
                    blockade_count: 0,
                    purging: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Replaces the registry every new and idle handle is reconfigured
    /// against. Does not retroactively reconfigure handles already checked
    /// out; they catch up on their next checkout or return.
    pub fn set_registry(&self, registry: ConfigRegistry) {
        *self.inner.registry.lock().unwrap() = registry;
    }

    pub fn with_registry<R>(&self, f: impl FnOnce(&mut ConfigRegistry) -> R) -> R {
        let mut registry = self.inner.registry.lock().unwrap();
        f(&mut registry)
    }

    pub fn number_of_alive_handles(&self) -> usize {
        self.inner.state.lock().unwrap().alive_count
    }

    pub fn blockade(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.blockade_count += 1;
    }

    pub fn unblockade(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.blockade_count = state.blockade_count.saturating_sub(1);
        if state.blockade_count == 0 {
            self.inner.cond.notify_all();
        }
    }

    /// Closes every idle handle now. Active (checked-out) handles are left
    /// alone; they will be closed instead of recycled on their next return.
    pub fn purge(&self) {
        let mut state = self.inner.state.lock().unwrap();
        let mut closed = 0;
        for (_, queue) in state.idle.iter_mut() {
            closed += queue.len();
            queue.clear();
        }
        state.alive_count -= closed;
        state.purging = true;
        info!("pool purge: path={} closed_idle={}", self.inner.path, closed);
    }

    /// Checks out a handle of the given category, creating one if the pool
    /// has headroom, or parking until one is returned or unblockaded.
    pub fn checkout(&self, category: HandleCategory, write_hint: bool) -> Result<Recyclable> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut state = self.inner.state.lock().unwrap();

        loop {
            if state.blockade_count == 0 {
                break;
            }
            let (guard, timeout) = self
                .inner
                .cond
                .wait_timeout(state, deadline.saturating_duration_since(Instant::now()))
                .unwrap();
            state = guard;
            if timeout.timed_out() && state.blockade_count > 0 {
                return Err(Error::busy("checkout blocked: pool is blockaded").with_info("path", self.inner.path.clone()));
            }
        }

        if category.is_exclusive() {
            loop {
                let in_use = *state.checked_out.get(&category).unwrap_or(&0);
                if in_use == 0 {
                    break;
                }
                let (guard, timeout) = self
                    .inner
                    .cond
                    .wait_timeout(state, deadline.saturating_duration_since(Instant::now()))
                    .unwrap();
                state = guard;
                if timeout.timed_out() {
                    return Err(Error::busy("checkout blocked: exclusive category in use")
                        .with_info("path", self.inner.path.clone()));
                }
            }
        }

        state.purging = false;

        if let Some(slot) = state.idle.entry(category).or_default().pop_front() {
            *state.checked_out.entry(category).or_insert(0) += 1;
            debug!("checkout: path={} category={:?} reused idle handle", self.inner.path, category);
            observability::global().trace_operation(
                &self.inner.path,
                "checkout_reuse",
                &BTreeMap::from([("alive".to_string(), state.alive_count as i64)]),
            );
            return Ok(Recyclable::new(self.clone(), category, slot, write_hint));
        }

        if state.alive_count >= self.inner.max_handles {
            return Err(Error::busy("pool exhausted").with_info("path", self.inner.path.clone()));
        }

        let mut handle = HandleBase::open(&self.inner.path, category)?;
        let mut invoked = InvokedSet::new();
        {
            let registry = self.inner.registry.lock().unwrap();
            reconfigure(&mut handle, &mut invoked, &registry)?;
        }
        state.alive_count += 1;
        *state.checked_out.entry(category).or_insert(0) += 1;
        info!(
            "checkout: path={} category={:?} created handle (alive={})",
            self.inner.path, category, state.alive_count
        );
        observability::global().trace_operation(
            &self.inner.path,
            "checkout_create",
            &BTreeMap::from([("alive".to_string(), state.alive_count as i64)]),
        );
        Ok(Recyclable::new(self.clone(), category, Slot { handle, invoked }, write_hint))
    }

    fn release(&self, category: HandleCategory, mut slot: Slot) {
        let mut state = self.inner.state.lock().unwrap();
        *state.checked_out.entry(category).or_insert(1) -= 1;

        if state.purging {
            state.alive_count = state.alive_count.saturating_sub(1);
            debug!("release: path={} category={:?} closed during purge", self.inner.path, category);
            let alive = state.alive_count as i64;
            drop(state);
            observability::global().trace_operation(
                &self.inner.path,
                "release_close_purge",
                &BTreeMap::from([("alive".to_string(), alive)]),
            );
            self.inner.cond.notify_all();
            return;
        }

        if slot.handle.depth() > 0 {
            if let Err(e) = slot.handle.rollback() {
                warn!("release: rollback of returned handle failed: {e}");
                state.alive_count = state.alive_count.saturating_sub(1);
                let alive = state.alive_count as i64;
                drop(state);
                observability::global().trace_operation(
                    &self.inner.path,
                    "release_close_rollback_failed",
                    &BTreeMap::from([("alive".to_string(), alive)]),
                );
                self.inner.cond.notify_all();
                return;
            }
        }
        slot.handle.clear_error();
        state.idle.entry(category).or_default().push_back(slot);
        let alive = state.alive_count as i64;
        drop(state);
        observability::global().trace_operation(
            &self.inner.path,
            "release_idle",
            &BTreeMap::from([("alive".to_string(), alive)]),
        );
        self.inner.cond.notify_all();
    }
}

/// A borrowed handle, checked out from a [`HandlePool`]. Dropping it returns
/// the handle to idle (unless the pool is purging, in which case it's
/// closed instead).
pub struct Recyclable {
    pool: HandlePool,
    category: HandleCategory,
    slot: Option<Slot>,
    pub write_hint: bool,
}

impl Recyclable {
    fn new(pool: HandlePool, category: HandleCategory, slot: Slot, write_hint: bool) -> Self {
        Self {
            pool,
            category,
            slot: Some(slot),
            write_hint,
        }
    }

    pub fn invoked(&mut self) -> &mut InvokedSet {
        &mut self.slot.as_mut().unwrap().invoked
    }
}

impl Deref for Recyclable {
    type Target = HandleBase;

    fn deref(&self) -> &Self::Target {
        &self.slot.as_ref().unwrap().handle
    }
}

impl DerefMut for Recyclable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slot.as_mut().unwrap().handle
    }
}

impl Drop for Recyclable {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(self.category, slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn tmp_pool(max: usize) -> (tempfile::TempDir, HandlePool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.db").to_str().unwrap().to_string();
        (dir, HandlePool::new(&path, max))
    }

    #[test]
    fn checkout_creates_up_to_max_then_fails_busy() {
        let (_dir, pool) = tmp_pool(1);
        let h1 = pool.checkout(HandleCategory::Normal, true).unwrap();
        assert_eq!(pool.number_of_alive_handles(), 1);
        let err = pool.checkout(HandleCategory::Normal, true);
        assert!(err.is_err());
        drop(h1);
    }

    #[test]
    fn returned_handle_is_reused() {
        let (_dir, pool) = tmp_pool(2);
        {
            let _h = pool.checkout(HandleCategory::Normal, true).unwrap();
        }
        assert_eq!(pool.number_of_alive_handles(), 1);
        let _h2 = pool.checkout(HandleCategory::Normal, true).unwrap();
        assert_eq!(pool.number_of_alive_handles(), 1);
    }

    #[test]
    fn purge_drops_idle_handles() {
        let (_dir, pool) = tmp_pool(2);
        {
            let _h = pool.checkout(HandleCategory::Normal, true).unwrap();
        }
        assert_eq!(pool.number_of_alive_handles(), 1);
        pool.purge();
        assert_eq!(pool.number_of_alive_handles(), 0);
    }

    #[test]
    fn exclusive_category_serializes_across_threads() {
        let (_dir, pool) = tmp_pool(4);
        let pool2 = pool.clone();
        let h = pool.checkout(HandleCategory::Migrate, true).unwrap();
        let handle = thread::spawn(move || {
            // Should time out quickly in this test's shortened scenario; we
            // just assert it eventually succeeds once released below.
            pool2.checkout(HandleCategory::Migrate, true)
        });
        drop(h);
        assert!(handle.join().unwrap().is_ok());
    }
}
