use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::{
    config::RconSettings,
    error::RconError,
    instance::{InstanceId, RconEndpoint},
};

use super::RconClient;

type Session = Arc<AsyncMutex<Option<RconClient>>>;

/// Lazily connected RCON sessions, one per instance.
///
/// A session is opened on the first command and kept until [`disconnect`] or
/// until a command fails in a way that leaves the connection unusable. There is
/// no retry inside a call; the next call reconnects.
///
/// [`disconnect`]: RconConsole::disconnect
#[derive(Debug, Clone)]
pub struct RconConsole {
    settings: RconSettings,
    sessions: Arc<Mutex<HashMap<InstanceId, Session>>>,
}

impl RconConsole {
    pub fn new(settings: RconSettings) -> Self {
        Self {
            settings,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn session(&self, id: &InstanceId) -> Session {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.clone())
            .or_default()
            .clone()
    }

    pub async fn command(
        &self,
        id: &InstanceId,
        endpoint: &RconEndpoint,
        text: &str,
    ) -> Result<String, RconError> {
        let session = self.session(id);
        let mut session = session.lock().await;

        // Checked out for the exchange; a call dropped mid-frame takes the
        // half-read connection with it and the next call reconnects.
        let mut client = match session.take() {
            Some(client) => client,
            None => {
                let client = RconClient::connect(endpoint, &self.settings).await?;
                info!(instance = %id, addr = %endpoint.address(), "rcon session established");
                client
            }
        };

        let result = client.command(text).await;
        match &result {
            Err(err) if err.poisons_session() => {
                warn!(instance = %id, error = %err, "rcon session torn down");
            }
            _ => *session = Some(client),
        }
        result
    }

    pub async fn is_connected(&self, id: &InstanceId) -> bool {
        let session = self.session(id);
        let connected = session.lock().await.is_some();
        connected
    }

    /// Closes the session if one is open.
    pub async fn disconnect(&self, id: &InstanceId) -> bool {
        let session = self.session(id);
        let closed = session.lock().await.take().is_some();
        if closed {
            info!(instance = %id, "rcon session closed");
        }
        closed
    }
}
