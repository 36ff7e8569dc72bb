//! Panel - connect/disconnect lifecycle around a driver task
//!
//! At most one session is live at a time. The driver runs on its own task;
//! the panel keeps the handle for commands and the join handle for teardown.

use super::driver::{
    CommandOutcome, DriverCommand, DriverConfig, PanelDriver, PanelEmitter, PanelError,
    PanelHandle, SessionEnd,
};
use super::transport::Connector;
use crate::ConnectionStatus;
use std::sync::Arc;
use tokio::task::JoinHandle;

struct ActiveSession {
    handle: PanelHandle,
    task: JoinHandle<SessionEnd>,
}

pub struct Panel {
    config: DriverConfig,
    emitter: Arc<dyn PanelEmitter>,
    active: Option<ActiveSession>,
}

impl Panel {
    pub fn new(config: DriverConfig, emitter: Arc<dyn PanelEmitter>) -> Self {
        Self {
            config,
            emitter,
            active: None,
        }
    }

    /// True while a driver task is running.
    pub fn is_connected(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    pub async fn connect(&mut self, connector: &dyn Connector) -> Result<(), PanelError> {
        if self.is_connected() {
            return Err(PanelError::AlreadyConnected);
        }
        self.reap().await;

        let (mut driver, handle) = match PanelDriver::connect(connector, self.config.clone()).await
        {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("[panel] failed to connect to {}: {}", connector.describe(), e);
                self.emitter.emit_error(e.to_string());
                self.emitter.emit_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };

        let emitter = Arc::clone(&self.emitter);
        let task = tokio::spawn(async move { driver.run(emitter.as_ref()).await });
        self.active = Some(ActiveSession { handle, task });
        Ok(())
    }

    /// Stop the running session and wait for its teardown to finish.
    ///
    /// Returns `None` if nothing was connected.
    pub async fn disconnect(&mut self) -> Option<SessionEnd> {
        let active = self.active.take()?;
        active.handle.request_stop();
        Self::join(active, self.emitter.as_ref()).await
    }

    /// Collect a session that ended on its own. Returns why it ended.
    pub async fn reap(&mut self) -> Option<SessionEnd> {
        match &self.active {
            Some(active) if active.task.is_finished() => {}
            _ => return None,
        }
        let active = self.active.take()?;
        Self::join(active, self.emitter.as_ref()).await
    }

    pub async fn send(&self, command: DriverCommand) -> Result<CommandOutcome, PanelError> {
        let active = self.active.as_ref().ok_or(PanelError::NotConnected)?;
        active.handle.send(command).await
    }

    pub fn handle(&self) -> Option<PanelHandle> {
        self.active.as_ref().map(|active| active.handle.clone())
    }

    async fn join(active: ActiveSession, emitter: &dyn PanelEmitter) -> Option<SessionEnd> {
        match active.task.await {
            Ok(end) => Some(end),
            Err(e) => {
                log::error!("[panel] driver task failed: {}", e);
                emitter.emit_status(ConnectionStatus::Disconnected);
                None
            }
        }
    }
}
