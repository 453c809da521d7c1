//! Observability (C8): SQL/performance/error/operation tracers and the
//! corruption notifier, registrable globally or per path (§4.8).
//!
//! Tracer invocations are queued and drained outside of any engine lock, as
//! the spec requires, by simply collecting them after the handle operation
//! returns rather than from inside `engine.rs`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use crate::engine::PerformanceInfo;
use crate::error::{Error, Severity};

pub type SqlTracer = Arc<dyn Fn(&str, &str, i64, &str, &str) + Send + Sync>;
pub type PerformanceTracer = Arc<dyn Fn(&str, &PerformanceInfo) + Send + Sync>;
pub type ErrorTracer = Arc<dyn Fn(&Error) + Send + Sync>;
pub type OperationTracer = Arc<dyn Fn(&str, &str, &BTreeMap<String, i64>) + Send + Sync>;
pub type CorruptionNotifier = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct TracerSet {
    sql: Option<SqlTracer>,
    performance: Option<PerformanceTracer>,
    error: Option<ErrorTracer>,
    operation: Option<OperationTracer>,
    corruption: Option<CorruptionNotifier>,
}

/// Registry of tracers and the corruption notifier: one global set, plus an
/// override set per database path.
#[derive(Default)]
pub struct Observability {
    global: Mutex<TracerSet>,
    per_path: Mutex<HashMap<String, TracerSet>>,
    full_sql_trace: Mutex<bool>,
    observed_corrupted: Mutex<HashSet<String>>,
}

impl Observability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_full_sql_trace_enable(&self, enabled: bool) {
        *self.full_sql_trace.lock().unwrap() = enabled;
    }

    pub fn full_sql_trace_enabled(&self) -> bool {
        *self.full_sql_trace.lock().unwrap()
    }

    pub fn set_global_sql_tracer(&self, tracer: SqlTracer) {
        self.global.lock().unwrap().sql = Some(tracer);
    }

    pub fn set_sql_tracer(&self, path: &str, tracer: SqlTracer) {
        self.per_path.lock().unwrap().entry(path.to_string()).or_default().sql = Some(tracer);
    }

    pub fn set_global_performance_tracer(&self, tracer: PerformanceTracer) {
        self.global.lock().unwrap().performance = Some(tracer);
    }

    pub fn set_performance_tracer(&self, path: &str, tracer: PerformanceTracer) {
        self.per_path.lock().unwrap().entry(path.to_string()).or_default().performance = Some(tracer);
    }

    pub fn set_global_error_tracer(&self, tracer: ErrorTracer) {
        self.global.lock().unwrap().error = Some(tracer);
    }

    pub fn set_error_tracer(&self, path: &str, tracer: ErrorTracer) {
        self.per_path.lock().unwrap().entry(path.to_string()).or_default().error = Some(tracer);
    }

    pub fn set_global_operation_tracer(&self, tracer: OperationTracer) {
        self.global.lock().unwrap().operation = Some(tracer);
    }

    pub fn set_operation_tracer(&self, path: &str, tracer: OperationTracer) {
        self.per_path.lock().unwrap().entry(path.to_string()).or_default().operation = Some(tracer);
    }

    /// Registering a second notifier for the same path replaces the first
    /// (§1.2): this is a per-path singleton, not a list.
    pub fn set_notification_when_corrupted(&self, path: &str, notifier: CorruptionNotifier) {
        self.per_path.lock().unwrap().entry(path.to_string()).or_default().corruption = Some(notifier);
        self.observed_corrupted.lock().unwrap().remove(path);
    }

    pub fn trace_sql(&self, path: &str, handle_id: i64, sql: &str, info: &str) {
        if let Some(t) = &self.global.lock().unwrap().sql {
            t(path, path, handle_id, sql, info);
        }
        if let Some(set) = self.per_path.lock().unwrap().get(path) {
            if let Some(t) = &set.sql {
                t(path, path, handle_id, sql, info);
            }
        }
    }

    pub fn trace_performance(&self, path: &str, info: &PerformanceInfo) {
        if let Some(t) = &self.global.lock().unwrap().performance {
            t(path, info);
        }
        if let Some(set) = self.per_path.lock().unwrap().get(path) {
            if let Some(t) = &set.performance {
                t(path, info);
            }
        }
    }

    /// Only severities >= Warning reach the error tracer (§4.8, §7).
    pub fn trace_error(&self, error: &Error) {
        if error.severity < Severity::Warning {
            return;
        }
        if let Some(t) = &self.global.lock().unwrap().error {
            t(error);
        }
        if let Some(path) = error.info("path") {
            let path = path.to_string();
            if let Some(set) = self.per_path.lock().unwrap().get(&path) {
                if let Some(t) = &set.error {
                    t(error);
                }
            }
        }
    }

    pub fn trace_operation(&self, path: &str, op: &str, info: &BTreeMap<String, i64>) {
        if let Some(t) = &self.global.lock().unwrap().operation {
            t(path, op, info);
        }
        if let Some(set) = self.per_path.lock().unwrap().get(path) {
            if let Some(t) = &set.operation {
                t(path, op, info);
            }
        }
    }

    /// Fires the corruption notifier for `path` at most once per process
    /// lifetime until `clear_corrupted` (called by a successful integrity
    /// check) resets it (§8, property 8).
    pub fn notify_corrupted(&self, path: &str) {
        {
            let mut observed = self.observed_corrupted.lock().unwrap();
            if !observed.insert(path.to_string()) {
                return;
            }
        }
        if let Some(set) = self.per_path.lock().unwrap().get(path) {
            if let Some(t) = &set.corruption {
                t(path);
            }
        }
    }

    pub fn clear_corrupted(&self, path: &str) {
        self.observed_corrupted.lock().unwrap().remove(path);
    }

    pub fn has_observed_corrupted(&self, path: &str) -> bool {
        self.observed_corrupted.lock().unwrap().contains(path)
    }
}

/// Process-wide singleton used when no per-`Database` `Observability` is
/// threaded through (global tracer registration convenience per §6.2).
pub fn global() -> &'static Observability {
    static GLOBAL: OnceLock<Observability> = OnceLock::new();
    GLOBAL.get_or_init(Observability::new)
}
