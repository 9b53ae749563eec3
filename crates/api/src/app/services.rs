use std::sync::Arc;

use taskwatch_core::SystemClock;
use taskwatch_infra::{
    InMemoryQueue, InMemoryTaskStore, PostgresTaskStore, TaskService, TaskStore, TaskStoreError,
    TaskwatchConfig,
};

/// Store behind the API; chosen at startup.
pub type SharedTaskStore = Arc<dyn TaskStore>;

pub type AppTaskService = TaskService<SharedTaskStore, Arc<InMemoryQueue>, SystemClock>;

/// Everything the HTTP handlers need.
pub struct AppServices {
    pub tasks: AppTaskService,
    /// The in-process broker; exposed so local tooling and tests can drive
    /// remote states.
    pub queue: Arc<InMemoryQueue>,
}

impl AppServices {
    pub fn new(store: SharedTaskStore, config: &TaskwatchConfig) -> Self {
        let queue = InMemoryQueue::arc(SystemClock, config.remote_retention());
        let tasks = TaskService::new(store, queue.clone(), SystemClock, config.timeout_policy());
        Self { tasks, queue }
    }

    /// In-memory store, for tests and local development.
    pub fn in_memory(config: &TaskwatchConfig) -> Self {
        Self::new(InMemoryTaskStore::arc(), config)
    }
}

/// Postgres when `database_url` is set, in-memory otherwise.
pub async fn build_services(config: &TaskwatchConfig) -> Result<AppServices, TaskStoreError> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresTaskStore::connect(url).await?;
            store.migrate().await?;
            tracing::info!("using postgres task store");
            Ok(AppServices::new(Arc::new(store), config))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory task store");
            Ok(AppServices::in_memory(config))
        }
    }
}
