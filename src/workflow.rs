//! Per-instance workflow scratch state in the object store.
//!
//! Long-running pipelines (the federal per-title workflow in particular)
//! persist each step's result under
//! `workflows/{workflow}/{instance}/{step}.json` so an interrupted run
//! resumes at the first incomplete step instead of repeating work.
//! [`WorkflowState::run_step`] is the memoizer: a saved step returns its
//! stored result without re-executing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::object_store::{keys, ObjectStore};

pub struct WorkflowState {
    store: Arc<ObjectStore>,
    workflow: String,
    instance: String,
}

impl WorkflowState {
    pub fn new(store: Arc<ObjectStore>, workflow: &str, instance: &str) -> Self {
        Self {
            store,
            workflow: workflow.to_string(),
            instance: instance.to_string(),
        }
    }

    fn step_key(&self, step: &str) -> String {
        keys::workflow_step(&self.workflow, &self.instance, step)
    }

    pub async fn load_step<T: DeserializeOwned>(&self, step: &str) -> Result<Option<T>> {
        self.store.get_json(&self.step_key(step)).await
    }

    pub async fn save_step<T: Serialize>(&self, step: &str, value: &T) -> Result<()> {
        self.store
            .put_json(&self.step_key(step), value, &Default::default())
            .await
    }

    /// Run `step` at most once per instance: a previously saved result is
    /// returned without re-executing `work`.
    pub async fn run_step<T, F, Fut>(&self, step: &str, work: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(saved) = self.load_step(step).await? {
            debug!(workflow = %self.workflow, instance = %self.instance, step, "step already complete");
            return Ok(saved);
        }
        let value = work().await?;
        self.save_step(step, &value).await?;
        Ok(value)
    }

    /// Drop every step of this instance. Called when the workflow
    /// completes so the next run starts clean.
    pub async fn clear(&self) -> Result<()> {
        let prefix = format!("workflows/{}/{}/", self.workflow, self.instance);
        for key in self.store.list(&prefix).await? {
            self.store.delete(&key).await?;
        }
        Ok(())
    }
}
