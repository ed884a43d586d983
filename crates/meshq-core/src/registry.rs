use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::QueueConfig;
use crate::engine::BuildEngine;
use crate::execution::TokioProcessExecutor;
use crate::models::{CoreError, CoreErrorKind};
use crate::notify::NotificationSink;
use crate::orchestration::{EnvelopeConfig, ExecutionEnvelope, OrchestrationResult};
use crate::persistence::StoreGateway;
use crate::workers::photomesh::PHOTOMESH_TASK_TYPE;
use crate::workers::script::QUEUE_TASK_TYPE;
use crate::workers::{PhotoMeshWorker, ScriptWorker, TaskWorker};

pub type WorkerFactory = Box<dyn Fn() -> Arc<dyn TaskWorker> + Send + Sync>;

/// Maps a task type to its worker. Workers are built on first use and reused for the
/// lifetime of the registry, each behind its own execution envelope.
pub struct WorkerRegistry {
    factories: HashMap<String, WorkerFactory>,
    envelopes: Mutex<HashMap<String, Arc<ExecutionEnvelope>>>,
    engine: Arc<dyn BuildEngine>,
    gateway: StoreGateway,
    notifier: Arc<dyn NotificationSink>,
    config: EnvelopeConfig,
}

impl WorkerRegistry {
    pub fn new(
        engine: Arc<dyn BuildEngine>,
        gateway: StoreGateway,
        notifier: Arc<dyn NotificationSink>,
        config: EnvelopeConfig,
    ) -> Self {
        Self {
            factories: HashMap::new(),
            envelopes: Mutex::new(HashMap::new()),
            engine,
            gateway,
            notifier,
            config,
        }
    }

    /// Registry with the `PhotoMesh` and `Queue` workers.
    pub fn standard(
        engine: Arc<dyn BuildEngine>,
        gateway: StoreGateway,
        notifier: Arc<dyn NotificationSink>,
        config: &QueueConfig,
    ) -> Self {
        let photomesh_engine = engine.clone();
        let photo_load_delay = config.photo_load_delay;
        let script_config = config.script.clone();

        Self::new(engine, gateway, notifier, config.envelope)
            .with_worker(PHOTOMESH_TASK_TYPE, move || {
                Arc::new(
                    PhotoMeshWorker::new(photomesh_engine.clone())
                        .with_photo_load_delay(photo_load_delay),
                )
            })
            .with_worker(QUEUE_TASK_TYPE, move || {
                Arc::new(ScriptWorker::new(
                    Arc::new(TokioProcessExecutor),
                    script_config.clone(),
                ))
            })
    }

    pub fn with_worker<F, W>(mut self, task_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<W> + Send + Sync + 'static,
        W: TaskWorker + 'static,
    {
        self.factories.insert(
            task_type.into(),
            Box::new(move || -> Arc<dyn TaskWorker> { factory() }),
        );
        self
    }

    pub fn registered_types(&self) -> Vec<&str> {
        let mut types = self
            .factories
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>();
        types.sort_unstable();
        types
    }

    /// Returns the memoized envelope for `task_type`, creating its worker on first use.
    pub fn resolve(&self, task_type: &str) -> OrchestrationResult<Arc<ExecutionEnvelope>> {
        let mut envelopes = self
            .envelopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(envelope) = envelopes.get(task_type) {
            return Ok(envelope.clone());
        }

        let factory = self.factories.get(task_type).ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::UnknownTaskType,
                format!("Unknown task type: {task_type}"),
            )
        })?;

        tracing::debug!(task_type, "creating worker");
        let envelope = Arc::new(ExecutionEnvelope::new(
            factory(),
            self.engine.clone(),
            self.gateway.clone(),
            self.notifier.clone(),
            self.config,
        ));
        envelopes.insert(task_type.to_string(), envelope.clone());
        Ok(envelope)
    }

    /// Envelopes created so far.
    pub fn instantiated(&self) -> Vec<Arc<ExecutionEnvelope>> {
        self.envelopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }
}
