//! The [`Host`] facade: services, dispatcher and sessions in one handle.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::HostConfig;
use crate::error::Result;
use crate::handlers::standard_handlers;
use crate::registry::{Dispatcher, HandlerRegistry};
use crate::services::Services;
use crate::session::Session;

/// Everything sandboxed code can reach through `host_invoke`.
pub struct Host {
    config: HostConfig,
    services: Arc<Services>,
    dispatcher: Arc<Dispatcher>,
}

impl Host {
    /// Build services and the standard handler set from `config`.
    pub fn new(config: HostConfig) -> Result<Self> {
        Self::with_handlers(config, |_| Ok(()))
    }

    /// Like [`new`](Self::new), letting `customize` swap handlers before the
    /// registry is frozen.
    pub fn with_handlers<F>(config: HostConfig, customize: F) -> Result<Self>
    where
        F: FnOnce(&mut HandlerRegistry) -> Result<()>,
    {
        let services = Arc::new(Services::new(&config)?);
        let mut registry = standard_handlers(&services)?;
        customize(&mut registry)?;
        let dispatcher = Arc::new(registry.into_dispatcher(
            Arc::clone(&services.transactions),
            config.sandbox.max_frame_len,
        )?);
        info!(
            max_frame_len = config.sandbox.max_frame_len,
            persistent = config.database.path.is_some(),
            "host ready"
        );
        Ok(Self {
            config,
            services,
            dispatcher,
        })
    }

    /// Host with default settings and an in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::new(HostConfig::default())
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Start a session for one sandbox invocation.
    pub fn open_session(&self) -> Arc<Session> {
        Arc::new(Session::new())
    }

    /// Close `session`, rolling back any transaction it left open.
    ///
    /// Returns how many transactions were rolled back.
    pub fn end_session(&self, session: &Session) -> usize {
        let rolled_back = self.services.transactions.rollback_session(session.id());
        if rolled_back > 0 {
            warn!(session = session.id(), rolled_back, "session ended with open transactions");
        }
        rolled_back
    }

    /// Serve one raw host call for `session`.
    pub fn dispatch(&self, op: u32, request: &[u8], session: &Session) -> Vec<u8> {
        self.dispatcher.dispatch(op, request, session)
    }
}
