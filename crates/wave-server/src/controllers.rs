//! Seams to the process-level collaborators of the backend.
//!
//! Block controllers own the shell or view process behind a block;
//! connection controllers own remote connections. The server drives them
//! through these traits and never looks inside. Status changes reach
//! clients as ordinary events (`controllerstatus`, `connchange`) published
//! on the broker.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use wave_protocol::methods::{BlockControllerStatus, ConnStatus};
use wave_pubsub::{events, EventBroker, WaveEvent};
use wave_rpc::RpcError;
use wave_types::{ORef, RuntimeOpts, TermSize};

use crate::error::{ServerError, ServerResult};

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_DONE: &str = "done";

pub const CONN_CONNECTING: &str = "connecting";
pub const CONN_CONNECTED: &str = "connected";
pub const CONN_DISCONNECTED: &str = "disconnected";

/// Name of the always-present local connection.
pub const LOCAL_CONN: &str = "local";

/// Decoded input for a block's controller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockInput {
    pub data: Vec<u8>,
    pub sig_name: Option<String>,
    pub term_size: Option<TermSize>,
}

#[async_trait]
pub trait BlockControllers: Send + Sync {
    /// Stop the block's controller. Stopping a block without one is a no-op.
    async fn stop(&self, block_id: &str) -> ServerResult<()>;

    /// Start the controller if it is not running, or bring it in line with
    /// `rt_opts`.
    async fn resync(
        &self,
        tab_id: &str,
        block_id: &str,
        rt_opts: Option<RuntimeOpts>,
    ) -> ServerResult<()>;

    async fn status(&self, block_id: &str) -> Option<BlockControllerStatus>;

    /// Hand input to the block's running controller. Fails if the block
    /// has none.
    async fn send_input(&self, block_id: &str, input: BlockInput) -> ServerResult<()>;
}

#[async_trait]
pub trait ConnControllers: Send + Sync {
    async fn status(&self) -> Vec<ConnStatus>;

    /// Connect `conn`, creating it first if it is not known yet.
    async fn ensure(&self, conn: &str) -> ServerResult<()>;

    /// Connect a known connection.
    async fn connect(&self, conn: &str) -> ServerResult<()>;

    async fn disconnect(&self, conn: &str) -> ServerResult<()>;

    /// Reinstall the remote helper on a known connection.
    async fn reinstall_wsh(&self, conn: &str) -> ServerResult<()>;

    /// Names of the remote connections, excluding the local one.
    async fn list(&self) -> ServerResult<Vec<String>>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn publish(broker: &EventBroker, event: WaveEvent) {
    if let Err(e) = broker.publish(event) {
        warn!(error = %e, "status event not published");
    }
}

/// What a controller has been sent since it last started.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InputTally {
    pub bytes: usize,
    pub last_signal: Option<String>,
    pub term_size: Option<TermSize>,
}

/// Block controllers that track status only, for embedding and tests.
pub struct InMemoryBlockControllers {
    statuses: Mutex<HashMap<String, BlockControllerStatus>>,
    inputs: Mutex<HashMap<String, InputTally>>,
    broker: Arc<EventBroker>,
}

impl InMemoryBlockControllers {
    pub fn new(broker: Arc<EventBroker>) -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            inputs: Mutex::new(HashMap::new()),
            broker,
        }
    }

    pub fn input_tally(&self, block_id: &str) -> Option<InputTally> {
        lock(&self.inputs).get(block_id).cloned()
    }

    fn is_running(&self, block_id: &str) -> bool {
        lock(&self.statuses)
            .get(block_id)
            .is_some_and(|s| s.shell_proc_status == STATUS_RUNNING)
    }

    fn set_status(&self, block_id: &str, status: &str) -> BlockControllerStatus {
        let current = {
            let mut statuses = lock(&self.statuses);
            let entry = statuses
                .entry(block_id.to_string())
                .or_insert_with(|| BlockControllerStatus {
                    block_id: block_id.to_string(),
                    shell_proc_status: String::new(),
                    version: 0,
                });
            entry.shell_proc_status = status.to_string();
            entry.version += 1;
            entry.clone()
        };
        let data = serde_json::to_value(&current).unwrap_or_else(|_| json!({}));
        publish(
            &self.broker,
            WaveEvent::new(events::CONTROLLER_STATUS)
                .with_scope(ORef::block(block_id).to_string())
                .with_data(data),
        );
        current
    }
}

#[async_trait]
impl BlockControllers for InMemoryBlockControllers {
    async fn stop(&self, block_id: &str) -> ServerResult<()> {
        if self.is_running(block_id) {
            lock(&self.inputs).remove(block_id);
            self.set_status(block_id, STATUS_DONE);
        } else {
            debug!(block = %block_id, "no running controller to stop");
        }
        Ok(())
    }

    async fn resync(
        &self,
        tab_id: &str,
        block_id: &str,
        _rt_opts: Option<RuntimeOpts>,
    ) -> ServerResult<()> {
        if !self.is_running(block_id) {
            debug!(tab = %tab_id, block = %block_id, "starting controller");
            self.set_status(block_id, STATUS_RUNNING);
        }
        Ok(())
    }

    async fn status(&self, block_id: &str) -> Option<BlockControllerStatus> {
        lock(&self.statuses).get(block_id).cloned()
    }

    async fn send_input(&self, block_id: &str, input: BlockInput) -> ServerResult<()> {
        if !self.is_running(block_id) {
            return Err(RpcError::NotFound(format!("no controller running for block {block_id}")).into());
        }
        let mut inputs = lock(&self.inputs);
        let tally = inputs.entry(block_id.to_string()).or_default();
        tally.bytes += input.data.len();
        if input.sig_name.is_some() {
            tally.last_signal = input.sig_name;
        }
        if input.term_size.is_some() {
            tally.term_size = input.term_size;
        }
        Ok(())
    }
}

/// Connection table without real connections behind it.
pub struct InMemoryConnControllers {
    conns: Mutex<BTreeMap<String, ConnStatus>>,
    broker: Arc<EventBroker>,
}

impl InMemoryConnControllers {
    /// Starts with the local connection connected.
    pub fn new(broker: Arc<EventBroker>) -> Self {
        let local = ConnStatus {
            connection: LOCAL_CONN.into(),
            status: "connected".into(),
            connected: true,
            error: None,
        };
        Self {
            conns: Mutex::new(BTreeMap::from([(LOCAL_CONN.to_string(), local)])),
            broker,
        }
    }

    fn known(&self, conn: &str) -> ServerResult<ConnStatus> {
        if conn.is_empty() {
            return Err(ServerError::Rpc(RpcError::BadRequest("empty connection name".into())));
        }
        lock(&self.conns)
            .get(conn)
            .cloned()
            .ok_or_else(|| RpcError::NotFound(format!("connection not found: {conn}")).into())
    }

    fn set(&self, conn: &str, status: &str, connected: bool) {
        self.update(ConnStatus {
            connection: conn.to_string(),
            status: status.to_string(),
            connected,
            error: None,
        });
    }

    fn bring_up(&self, conn: &str) {
        self.set(conn, CONN_CONNECTING, false);
        self.set(conn, CONN_CONNECTED, true);
    }

    /// Record a connection's new status and announce it.
    pub fn update(&self, status: ConnStatus) {
        let name = status.connection.clone();
        let data = serde_json::to_value(&status).unwrap_or_else(|_| json!({}));
        lock(&self.conns).insert(name.clone(), status);
        publish(
            &self.broker,
            WaveEvent::new(events::CONN_CHANGE)
                .with_scope(format!("connection:{name}"))
                .with_data(data),
        );
    }
}

#[async_trait]
impl ConnControllers for InMemoryConnControllers {
    async fn status(&self) -> Vec<ConnStatus> {
        lock(&self.conns).values().cloned().collect()
    }

    async fn ensure(&self, conn: &str) -> ServerResult<()> {
        if conn.is_empty() {
            return Err(ServerError::Rpc(RpcError::BadRequest("empty connection name".into())));
        }
        let connected = lock(&self.conns).get(conn).is_some_and(|s| s.connected);
        if !connected {
            self.bring_up(conn);
        }
        Ok(())
    }

    async fn connect(&self, conn: &str) -> ServerResult<()> {
        if !self.known(conn)?.connected {
            self.bring_up(conn);
        }
        Ok(())
    }

    async fn disconnect(&self, conn: &str) -> ServerResult<()> {
        if conn == LOCAL_CONN {
            return Err(ServerError::Rpc(RpcError::BadRequest(
                "the local connection cannot be disconnected".into(),
            )));
        }
        if self.known(conn)?.connected {
            self.set(conn, CONN_DISCONNECTED, false);
        }
        Ok(())
    }

    async fn reinstall_wsh(&self, conn: &str) -> ServerResult<()> {
        if conn == LOCAL_CONN {
            return Err(ServerError::Rpc(RpcError::BadRequest(
                "nothing to install on the local connection".into(),
            )));
        }
        self.known(conn)?;
        debug!(conn = %conn, "helper reinstall requested");
        Ok(())
    }

    async fn list(&self) -> ServerResult<Vec<String>> {
        Ok(lock(&self.conns)
            .keys()
            .filter(|name| name.as_str() != LOCAL_CONN)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wave_pubsub::BrokerConfig;

    fn broker() -> Arc<EventBroker> {
        Arc::new(EventBroker::new(BrokerConfig::default()))
    }

    #[tokio::test]
    async fn resync_then_stop() {
        let broker = broker();
        let ctl = InMemoryBlockControllers::new(broker.clone());
        assert!(ctl.status("b1").await.is_none());

        ctl.resync("t1", "b1", None).await.unwrap();
        let s = ctl.status("b1").await.unwrap();
        assert_eq!(s.shell_proc_status, STATUS_RUNNING);
        assert_eq!(s.version, 1);

        // resync of a running controller changes nothing
        ctl.resync("t1", "b1", None).await.unwrap();
        assert_eq!(ctl.status("b1").await.unwrap().version, 1);

        ctl.stop("b1").await.unwrap();
        let s = ctl.status("b1").await.unwrap();
        assert_eq!(s.shell_proc_status, STATUS_DONE);
        assert_eq!(s.version, 2);

        let history = broker.read_event_history(events::CONTROLLER_STATUS, "block:b1", 10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].data["shellprocstatus"], STATUS_DONE);
    }

    #[tokio::test]
    async fn stop_without_controller_is_noop() {
        let broker = broker();
        let ctl = InMemoryBlockControllers::new(broker.clone());
        ctl.stop("missing").await.unwrap();
        assert_eq!(broker.history_len(events::CONTROLLER_STATUS), 0);
    }

    #[tokio::test]
    async fn conn_updates_are_announced() {
        let broker = broker();
        let conns = InMemoryConnControllers::new(broker.clone());
        assert_eq!(conns.status().await.len(), 1);

        conns.update(ConnStatus {
            connection: "user@host".into(),
            status: "connecting".into(),
            connected: false,
            error: None,
        });
        let all = conns.status().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].connection, "user@host");
        let history = broker.read_event_history(events::CONN_CHANGE, "connection:user@host", 5);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn input_needs_a_running_controller() {
        let ctl = InMemoryBlockControllers::new(broker());
        let input = BlockInput {
            data: b"ls\n".to_vec(),
            ..BlockInput::default()
        };
        let err = ctl.send_input("b1", input.clone()).await.unwrap_err();
        assert!(matches!(RpcError::from(err), RpcError::NotFound(_)));

        ctl.resync("t1", "b1", None).await.unwrap();
        ctl.send_input("b1", input).await.unwrap();
        ctl.send_input(
            "b1",
            BlockInput {
                sig_name: Some("SIGINT".into()),
                term_size: Some(TermSize { rows: 24, cols: 80 }),
                ..BlockInput::default()
            },
        )
        .await
        .unwrap();
        let tally = ctl.input_tally("b1").unwrap();
        assert_eq!(tally.bytes, 3);
        assert_eq!(tally.last_signal.as_deref(), Some("SIGINT"));
        assert_eq!(tally.term_size, Some(TermSize { rows: 24, cols: 80 }));

        ctl.stop("b1").await.unwrap();
        assert!(ctl.input_tally("b1").is_none());
    }

    #[tokio::test]
    async fn conn_lifecycle() {
        let broker = broker();
        let conns = InMemoryConnControllers::new(broker.clone());

        let err = conns.connect("user@host").await.unwrap_err();
        assert!(matches!(RpcError::from(err), RpcError::NotFound(_)));

        conns.ensure("user@host").await.unwrap();
        assert_eq!(conns.list().await.unwrap(), vec!["user@host".to_string()]);
        let history = broker.read_event_history(events::CONN_CHANGE, "connection:user@host", 5);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].data["status"], CONN_CONNECTED);
        assert_eq!(history[1].data["status"], CONN_CONNECTING);

        // already connected, nothing new announced
        conns.ensure("user@host").await.unwrap();
        assert_eq!(broker.history_len(events::CONN_CHANGE), 2);

        conns.disconnect("user@host").await.unwrap();
        let status = conns.status().await;
        let remote = status.iter().find(|s| s.connection == "user@host").unwrap();
        assert!(!remote.connected);
        assert_eq!(remote.status, CONN_DISCONNECTED);

        conns.connect("user@host").await.unwrap();
        conns.reinstall_wsh("user@host").await.unwrap();
        assert!(conns.disconnect(LOCAL_CONN).await.is_err());
        assert!(conns.ensure("").await.is_err());
    }
}
