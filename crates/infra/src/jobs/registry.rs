//! Dispatcher contract and the startup-time registry.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;

use asyncjob_core::JobStatus;

use super::control::JobControl;
use super::error::RegistryError;
use super::types::{Job, result_code};

/// Error returned by a dispatcher; the job is completed as FAILED.
pub type DispatchError = Box<dyn std::error::Error + Send + Sync>;

/// What a dispatcher wants done with its job after `run` returns.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Complete the job with this terminal status.
    Completed {
        status: JobStatus,
        result_code: i32,
        result: Option<JsonValue>,
    },
    /// Leave the job IN_PROGRESS and release it; a join wakeup (or another
    /// path) will bring it back.
    Parked,
}

impl DispatchOutcome {
    pub fn succeeded(result: Option<JsonValue>) -> Self {
        Self::Completed {
            status: JobStatus::Succeeded,
            result_code: result_code::SUCCESS,
            result,
        }
    }

    pub fn failed(result_code: i32, result: Option<JsonValue>) -> Self {
        Self::Completed {
            status: JobStatus::Failed,
            result_code,
            result,
        }
    }
}

/// Per-run context handed to a dispatcher.
pub struct DispatchContext<'a> {
    control: &'a dyn JobControl,
    wakeup: bool,
}

impl<'a> DispatchContext<'a> {
    pub fn new(control: &'a dyn JobControl, wakeup: bool) -> Self {
        Self { control, wakeup }
    }

    /// Manager operations available to the dispatcher (submit, join, ...).
    pub fn control(&self) -> &dyn JobControl {
        self.control
    }

    /// Whether this run was triggered by a join wakeup.
    pub fn is_wakeup(&self) -> bool {
        self.wakeup
    }
}

/// Executes the actual work behind a job.
///
/// Panics are caught by the dispatch loop and treated like an `Err`.
pub trait JobDispatcher: Send + Sync {
    fn run(&self, job: &Job, ctx: &DispatchContext<'_>) -> Result<DispatchOutcome, DispatchError>;
}

impl<F> JobDispatcher for F
where
    F: Fn(&Job, &DispatchContext<'_>) -> Result<DispatchOutcome, DispatchError> + Send + Sync,
{
    fn run(&self, job: &Job, ctx: &DispatchContext<'_>) -> Result<DispatchOutcome, DispatchError> {
        self(job, ctx)
    }
}

/// Which worker pool a dispatcher's jobs run on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Jobs triggered by API calls.
    Api,
    /// Background work.
    Worker,
}

#[derive(Clone)]
struct Registration {
    pool: PoolKind,
    dispatcher: Arc<dyn JobDispatcher>,
}

/// Immutable name → dispatcher mapping, built once at process start.
#[derive(Clone, Default)]
pub struct DispatcherRegistry {
    entries: HashMap<String, Registration>,
}

impl DispatcherRegistry {
    pub fn builder() -> DispatcherRegistryBuilder {
        DispatcherRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobDispatcher>> {
        self.entries.get(name).map(|r| r.dispatcher.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Pool a dispatcher was registered on; unknown names fall back to the worker pool.
    pub fn pool_kind(&self, name: &str) -> PoolKind {
        self.entries
            .get(name)
            .map(|r| r.pool)
            .unwrap_or(PoolKind::Worker)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for DispatcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherRegistry")
            .field("dispatchers", &self.names())
            .finish()
    }
}

#[derive(Default)]
pub struct DispatcherRegistryBuilder {
    entries: HashMap<String, Registration>,
    duplicate: Option<String>,
}

impl DispatcherRegistryBuilder {
    pub fn register<D>(mut self, name: impl Into<String>, pool: PoolKind, dispatcher: D) -> Self
    where
        D: JobDispatcher + 'static,
    {
        let name = name.into();
        if self.entries.contains_key(&name) {
            self.duplicate.get_or_insert(name);
            return self;
        }
        self.entries.insert(
            name,
            Registration {
                pool,
                dispatcher: Arc::new(dispatcher),
            },
        );
        self
    }

    pub fn build(self) -> Result<DispatcherRegistry, RegistryError> {
        match self.duplicate {
            Some(name) => Err(RegistryError::Duplicate(name)),
            None => Ok(DispatcherRegistry {
                entries: self.entries,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_job: &Job, _ctx: &DispatchContext<'_>) -> Result<DispatchOutcome, DispatchError> {
        Ok(DispatchOutcome::succeeded(None))
    }

    #[test]
    fn duplicate_names_fail_the_build() {
        let err = DispatcherRegistry::builder()
            .register("vm", PoolKind::Worker, noop)
            .register("vm", PoolKind::Api, noop)
            .build()
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("vm".into()));
    }

    #[test]
    fn pool_kind_follows_registration() {
        let registry = DispatcherRegistry::builder()
            .register("api", PoolKind::Api, noop)
            .register("bg", PoolKind::Worker, noop)
            .build()
            .unwrap();
        assert_eq!(registry.pool_kind("api"), PoolKind::Api);
        assert_eq!(registry.pool_kind("bg"), PoolKind::Worker);
        assert_eq!(registry.pool_kind("nope"), PoolKind::Worker);
        assert_eq!(registry.names(), vec!["api", "bg"]);
    }
}
