use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

use wave_pubsub::{EventBroker, WaveEvent};
use wave_rpc::RpcRouter;
use wave_store::WaveStore;
use wave_types::MetaMap;

use crate::auth::AuthProvider;
use crate::config::ServerConfig;
use crate::controllers::{
    BlockControllers, ConnControllers, InMemoryBlockControllers, InMemoryConnControllers,
};
use crate::tasks::TaskPool;

/// Events buffered for in-process observers before the slowest one lags.
const LOCAL_EVENT_BUFFER: usize = 256;

/// Everything a command handler can reach.
pub struct ServerState {
    pub config: ServerConfig,
    pub store: WaveStore,
    pub broker: Arc<EventBroker>,
    pub router: Arc<RpcRouter>,
    pub auth: Arc<dyn AuthProvider>,
    pub blocks: Arc<dyn BlockControllers>,
    pub conns: Arc<dyn ConnControllers>,
    pub tasks: TaskPool,
    settings: RwLock<MetaMap>,
    local_events: broadcast::Sender<WaveEvent>,
}

impl ServerState {
    /// State over `store` with in-memory controllers.
    pub fn new(config: ServerConfig, store: WaveStore, auth: Arc<dyn AuthProvider>) -> Self {
        let broker = Arc::new(EventBroker::new(config.broker_config()));
        let router = RpcRouter::new(broker.clone());
        let (local_events, _) = broadcast::channel(LOCAL_EVENT_BUFFER);
        Self {
            tasks: TaskPool::new(config.background_workers),
            blocks: Arc::new(InMemoryBlockControllers::new(broker.clone())),
            conns: Arc::new(InMemoryConnControllers::new(broker.clone())),
            config,
            store,
            broker,
            router,
            auth,
            settings: RwLock::new(MetaMap::default()),
            local_events,
        }
    }

    pub fn with_block_controllers(mut self, blocks: Arc<dyn BlockControllers>) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn with_conn_controllers(mut self, conns: Arc<dyn ConnControllers>) -> Self {
        self.conns = conns;
        self
    }

    /// Base user settings as last written through `setconfig`.
    pub fn settings(&self) -> MetaMap {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Merge `update` into the settings; null values remove keys.
    pub(crate) fn update_settings(&self, update: &MetaMap) -> MetaMap {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        *settings = settings.merged(update, true);
        settings.clone()
    }

    /// Events delivered to the in-process default route.
    pub fn subscribe_local(&self) -> broadcast::Receiver<WaveEvent> {
        self.local_events.subscribe()
    }

    pub(crate) fn deliver_local(&self, event: WaveEvent) {
        // no receivers is fine
        let _ = self.local_events.send(event);
    }
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("router", &self.router)
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}
