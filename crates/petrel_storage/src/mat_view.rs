//! Directed dependency graph of materialized views on base tables.
//!
//! Views reference their base tables by token value, never by handle, so
//! dropping a base table does not have to traverse view internals to
//! detach. When mat views are disabled a no-op graph is installed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use petrel_common::types::{TableToken, TimestampMicros};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatViewDefinition {
    pub base_table_name: String,
    pub query: String,
}

/// Refresh state of one view. Invalid views take no refresh tasks until
/// revalidated.
#[derive(Debug, Default)]
pub struct MatViewState {
    invalid: AtomicBool,
    invalidation_reason: Mutex<Option<String>>,
    last_refresh_base_txn: AtomicI64,
    last_refresh_timestamp: AtomicI64,
}

impl MatViewState {
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    pub fn invalidation_reason(&self) -> Option<String> {
        self.invalidation_reason.lock().clone()
    }

    pub fn set_invalid(&self, invalid: bool, reason: Option<String>) {
        self.invalid.store(invalid, Ordering::Release);
        *self.invalidation_reason.lock() = reason;
    }

    pub fn last_refresh_base_txn(&self) -> i64 {
        self.last_refresh_base_txn.load(Ordering::Acquire)
    }

    pub fn last_refresh_timestamp(&self) -> TimestampMicros {
        self.last_refresh_timestamp.load(Ordering::Acquire)
    }

    pub fn record_refresh(&self, base_txn: i64, timestamp: TimestampMicros) {
        self.last_refresh_base_txn.store(base_txn, Ordering::Release);
        self.last_refresh_timestamp.store(timestamp, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct MatViewRefreshTask {
    pub view: TableToken,
    pub base_seq_txn: i64,
}

pub trait MatViewGraph: Send + Sync {
    /// Registers a view under its base table; returns the view's state.
    fn add_view(
        &self,
        view: TableToken,
        base: &TableToken,
        definition: MatViewDefinition,
    ) -> Arc<MatViewState>;

    /// Detaches `token` whether it is a view or a base table. True when
    /// anything was removed.
    fn drop_view_if_exists(&self, token: &TableToken) -> bool;

    fn dependent_views(&self, base: &TableToken) -> Vec<TableToken>;

    fn view_state(&self, view: &TableToken) -> Option<Arc<MatViewState>>;

    /// Enqueues refresh tasks for the base table's valid dependent views.
    fn notify_txn_applied(&self, base: &TableToken, seq_txn: i64);

    /// Next refresh task for a worker, if any.
    fn take_refresh_task(&self) -> Option<MatViewRefreshTask>;
}

struct ViewRecord {
    token: TableToken,
    base_dir: String,
    definition: MatViewDefinition,
    state: Arc<MatViewState>,
}

#[derive(Default)]
pub struct MatViewGraphImpl {
    views: DashMap<String, ViewRecord>,
    by_base: DashMap<String, Vec<String>>,
    tasks: Mutex<VecDeque<MatViewRefreshTask>>,
}

impl MatViewGraphImpl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn definition(&self, view: &TableToken) -> Option<MatViewDefinition> {
        self.views.get(view.dir_name()).map(|v| v.definition.clone())
    }
}

impl MatViewGraph for MatViewGraphImpl {
    fn add_view(
        &self,
        view: TableToken,
        base: &TableToken,
        definition: MatViewDefinition,
    ) -> Arc<MatViewState> {
        let state = Arc::new(MatViewState::default());
        self.by_base
            .entry(base.dir_name().to_string())
            .or_default()
            .push(view.dir_name().to_string());
        self.views.insert(
            view.dir_name().to_string(),
            ViewRecord {
                token: view,
                base_dir: base.dir_name().to_string(),
                definition,
                state: Arc::clone(&state),
            },
        );
        state
    }

    fn drop_view_if_exists(&self, token: &TableToken) -> bool {
        let mut removed = false;
        if let Some((_, record)) = self.views.remove(token.dir_name()) {
            if let Some(mut deps) = self.by_base.get_mut(&record.base_dir) {
                deps.retain(|d| d.as_str() != token.dir_name());
            }
            removed = true;
        }
        // Dropping a base table orphans its views; they stay registered but
        // invalid so readers get a definite answer.
        if let Some((_, deps)) = self.by_base.remove(token.dir_name()) {
            for dir in deps {
                if let Some(view) = self.views.get(&dir) {
                    view.state
                        .set_invalid(true, Some(format!("base table dropped [table={token}]")));
                }
            }
            removed = true;
        }
        removed
    }

    fn dependent_views(&self, base: &TableToken) -> Vec<TableToken> {
        self.by_base
            .get(base.dir_name())
            .map(|deps| {
                deps.iter()
                    .filter_map(|d| self.views.get(d).map(|v| v.token.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn view_state(&self, view: &TableToken) -> Option<Arc<MatViewState>> {
        self.views.get(view.dir_name()).map(|v| Arc::clone(&v.state))
    }

    fn notify_txn_applied(&self, base: &TableToken, seq_txn: i64) {
        let Some(deps) = self.by_base.get(base.dir_name()) else {
            return;
        };
        let mut tasks = self.tasks.lock();
        for dir in deps.iter() {
            if let Some(view) = self.views.get(dir) {
                if !view.state.is_invalid() {
                    tasks.push_back(MatViewRefreshTask {
                        view: view.token.clone(),
                        base_seq_txn: seq_txn,
                    });
                }
            }
        }
    }

    fn take_refresh_task(&self) -> Option<MatViewRefreshTask> {
        self.tasks.lock().pop_front()
    }
}

/// Installed when materialized views are disabled.
#[derive(Default)]
pub struct NoOpMatViewGraph;

impl MatViewGraph for NoOpMatViewGraph {
    fn add_view(
        &self,
        _view: TableToken,
        _base: &TableToken,
        _definition: MatViewDefinition,
    ) -> Arc<MatViewState> {
        Arc::new(MatViewState::default())
    }

    fn drop_view_if_exists(&self, _token: &TableToken) -> bool {
        false
    }

    fn dependent_views(&self, _base: &TableToken) -> Vec<TableToken> {
        Vec::new()
    }

    fn view_state(&self, _view: &TableToken) -> Option<Arc<MatViewState>> {
        None
    }

    fn notify_txn_applied(&self, _base: &TableToken, _seq_txn: i64) {}

    fn take_refresh_task(&self) -> Option<MatViewRefreshTask> {
        None
    }
}
