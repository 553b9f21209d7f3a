pub mod config;
pub mod db;
pub mod pipeline;
pub mod ports;
pub mod work_item;

use std::sync::Arc;

use crate::config::{AppConfig, ExecutorMode};
use crate::db::{SqliteStore, StoreError};
use crate::pipeline::dispatcher::{
    InlineThreadExecutor, RunDispatcher, SharedExecutor, TaskQueueExecutor,
};
use crate::pipeline::engine::PipelineEngine;
use crate::pipeline::PipelineSettings;
use crate::ports::CapabilityPorts;

const QUEUE_CAPACITY_PER_WORKER: usize = 64;

pub fn open_store(config: &AppConfig) -> Result<Arc<SqliteStore>, StoreError> {
    let store = SqliteStore::new(config.storage.db_path.clone());
    store.initialize()?;
    Ok(Arc::new(store))
}

/// Engine wired to the production adapters.
pub fn build_engine(config: &Arc<AppConfig>, store: Arc<SqliteStore>) -> Arc<PipelineEngine> {
    Arc::new(PipelineEngine::new(
        store.clone(),
        store,
        CapabilityPorts::from_config(config),
        PipelineSettings::from_config(config),
    ))
}

/// The queue executor spawns tokio workers, so `Queue` mode must be built
/// inside a runtime.
pub fn build_executor(config: &AppConfig, engine: Arc<PipelineEngine>) -> SharedExecutor {
    match config.dispatcher.executor {
        ExecutorMode::Inline => Arc::new(InlineThreadExecutor::new(engine)),
        ExecutorMode::Queue => {
            let workers = config.dispatcher.queue_workers;
            Arc::new(TaskQueueExecutor::start(
                engine,
                workers,
                workers * QUEUE_CAPACITY_PER_WORKER,
            ))
        }
    }
}

pub fn build_dispatcher(
    store: Arc<SqliteStore>,
    executor: SharedExecutor,
) -> RunDispatcher {
    RunDispatcher::new(store.clone(), store, executor)
}
