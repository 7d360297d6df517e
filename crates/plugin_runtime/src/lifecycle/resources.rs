//! Resources a plugin acquires while loaded or active.
//!
//! Cleanups and background tasks registered through a [`ResourceScope`] are
//! released in reverse registration order whenever the instance deactivates,
//! fails or unloads. A cleanup that errors or panics is reported and the rest
//! still run.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::PluginError;

type Cleanup = Box<dyn FnOnce() -> Result<(), PluginError> + Send>;

enum Release {
    Cleanup(Cleanup),
    Task(JoinHandle<()>),
}

struct Resource {
    name: String,
    release: Release,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseReport {
    pub name: String,
    pub released: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Default)]
pub struct ResourceScope {
    resources: Arc<Mutex<Vec<Resource>>>,
}

impl ResourceScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, resource: Resource) {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resource);
    }

    pub fn register_cleanup<F>(&self, name: impl Into<String>, cleanup: F)
    where
        F: FnOnce() -> Result<(), PluginError> + Send + 'static,
    {
        self.push(Resource {
            name: name.into(),
            release: Release::Cleanup(Box::new(cleanup)),
        });
    }

    /// Spawns a task that is aborted when the scope is released.
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.push(Resource {
            name: name.into(),
            release: Release::Task(tokio::spawn(task)),
        });
    }

    pub fn len(&self) -> usize {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases everything, newest first.
    pub fn release_all(&self) -> Vec<ReleaseReport> {
        let drained = std::mem::take(&mut *self.resources.lock().unwrap_or_else(PoisonError::into_inner));
        drained
            .into_iter()
            .rev()
            .map(|resource| {
                let outcome = match resource.release {
                    Release::Task(handle) => {
                        handle.abort();
                        Ok(())
                    }
                    Release::Cleanup(cleanup) => match catch_unwind(AssertUnwindSafe(cleanup)) {
                        Ok(result) => result.map_err(|e| e.to_string()),
                        Err(_) => Err("cleanup panicked".to_string()),
                    },
                };
                if let Err(error) = &outcome {
                    warn!(resource = %resource.name, error = %error, "resource not released");
                }
                ReleaseReport {
                    name: resource.name,
                    released: outcome.is_ok(),
                    error: outcome.err(),
                }
            })
            .collect()
    }
}
