//! ConfigRegistry (C2): ordered, reversible configuration of a handle, and
//! the superset-restart reconfiguration protocol (§4.2).

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::OpenFlags;
use crate::error::Result;
use crate::handle::HandleBase;

/// The name `ConfigRegistry` reserves for the reconfiguration protocol's
/// read-only retry rule (§4.2).
pub const BASIC_CONFIG_NAME: &str = "basic";

/// Priority bucket. Lower is applied first; cipher/tracing installers are
/// always `Highest` so they sit outermost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOWEST: Priority = Priority(-100);
    pub const LOW: Priority = Priority(-50);
    pub const DEFAULT: Priority = Priority(0);
    pub const HIGH: Priority = Priority(50);
    pub const HIGHEST: Priority = Priority(100);
}

pub type InvokeFn = Arc<dyn Fn(&mut HandleBase) -> Result<()> + Send + Sync>;
pub type UninvokeFn = Arc<dyn Fn(&mut HandleBase) -> Result<()> + Send + Sync>;

/// A single named, reversible operation applied to every handle in a pool.
#[derive(Clone)]
pub struct Config {
    pub name: String,
    pub priority: Priority,
    pub invoke: InvokeFn,
    pub uninvoke: Option<UninvokeFn>,
    seq: u64,
}

impl Config {
    fn key(&self) -> String {
        self.name.to_lowercase()
    }
}

/// Mapping name -> (priority, invoke, uninvoke), ordered by
/// (priority ascending, insertion order ascending).
#[derive(Clone, Default)]
pub struct ConfigRegistry {
    entries: HashMap<String, Config>,
    next_seq: u64,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, priority: Priority, invoke: InvokeFn, uninvoke: Option<UninvokeFn>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let config = Config {
            name: name.to_string(),
            priority,
            invoke,
            uninvoke,
            seq,
        };
        self.entries.insert(config.key(), config);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(&name.to_lowercase()).is_some()
    }

    /// Configs in applied order: priority ascending, then insertion order.
    pub fn ordered(&self) -> Vec<&Config> {
        let mut v: Vec<&Config> = self.entries.values().collect();
        v.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.seq.cmp(&b.seq)));
        v
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialEq for ConfigRegistry {
    fn eq(&self, other: &Self) -> bool {
        let a = self.ordered();
        let b = other.ordered();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b.iter()).all(|(x, y)| {
            x.name.eq_ignore_ascii_case(&y.name)
                && x.priority == y.priority
                && Arc::ptr_eq(&x.invoke, &y.invoke)
                && match (&x.uninvoke, &y.uninvoke) {
                    (Some(xu), Some(yu)) => Arc::ptr_eq(xu, yu),
                    (None, None) => true,
                    _ => false,
                }
        })
    }
}

/// The set of configs currently invoked on one handle, tracked separately
/// from the registry so a handle can lag behind a database-wide config
/// change until its next reconfigure pass.
#[derive(Clone, Default)]
pub struct InvokedSet {
    applied: Vec<Config>,
}

impl InvokedSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(&self, pending: &ConfigRegistry) -> bool {
        let pending_ordered = pending.ordered();
        if self.applied.len() != pending_ordered.len() {
            return false;
        }
        self.applied.iter().zip(pending_ordered.iter()).all(|(a, b)| {
            a.name.eq_ignore_ascii_case(&b.name)
                && a.priority == b.priority
                && Arc::ptr_eq(&a.invoke, &b.invoke)
        })
    }
}

/// Runs the superset-restart reconfiguration protocol (§4.2) against a
/// handle, bringing `invoked` in line with `pending`. No-op if already equal.
pub fn reconfigure(handle: &mut HandleBase, invoked: &mut InvokedSet, pending: &ConfigRegistry) -> Result<()> {
    if invoked.matches(pending) {
        return Ok(());
    }
    reconfigure_inner(handle, invoked, pending, true)
}

fn reconfigure_inner(
    handle: &mut HandleBase,
    invoked: &mut InvokedSet,
    pending: &ConfigRegistry,
    allow_retry: bool,
) -> Result<()> {
    // 1. Uninvoke the current set in reverse applied order. Abort on first
    // failure: the handle is left in whatever state the failed uninvoke left it.
    for config in invoked.applied.iter().rev() {
        if let Some(uninvoke) = &config.uninvoke {
            uninvoke(handle)?;
        }
    }
    invoked.applied.clear();

    // 2. Invoke the pending set in applied order.
    for config in pending.ordered() {
        match (config.invoke)(handle) {
            Ok(()) => invoked.applied.push(config.clone()),
            Err(_e) if allow_retry && config.key() == BASIC_CONFIG_NAME && handle.is_readonly() => {
                handle.reopen_with_flags(OpenFlags::READ_WRITE.with_no_mutex())?;
                return reconfigure_inner(handle, invoked, pending, false);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
