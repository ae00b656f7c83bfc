use std::time::Duration;

use tokio::{
    io::BufStream,
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, trace};

use crate::{config::RconSettings, error::RconError, instance::RconEndpoint};

use super::Packet;

/// One authenticated RCON connection.
///
/// Requests are strictly sequential; a response only completes the request
/// whose id it carries, anything else on the wire is skipped.
#[derive(Debug)]
pub struct RconClient {
    stream: BufStream<TcpStream>,
    next_id: i32,
    authenticated: bool,
    timeout: Duration,
}

impl RconClient {
    /// Connects and authenticates.
    pub async fn connect(
        endpoint: &RconEndpoint,
        settings: &RconSettings,
    ) -> Result<Self, RconError> {
        let addr = endpoint.address();
        let stream = match timeout(settings.connect_timeout(), TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(RconError::Connect { addr, source }),
            Err(_) => return Err(RconError::Timeout(settings.connect_timeout())),
        };
        _ = stream.set_nodelay(true);

        let mut client = Self {
            stream: BufStream::new(stream),
            next_id: 0,
            authenticated: false,
            timeout: settings.timeout(),
        };
        client.authenticate(&endpoint.password).await?;
        debug!(addr = %addr, "rcon authenticated");
        Ok(client)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn fresh_id(&mut self) -> i32 {
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        self.next_id
    }

    async fn authenticate(&mut self, password: &str) -> Result<(), RconError> {
        let id = self.fresh_id();
        Packet::new(id, Packet::AUTH, password)
            .write_to(&mut self.stream)
            .await?;

        let wait = self.timeout;
        let stream = &mut self.stream;
        let outcome = timeout(wait, async {
            loop {
                let packet = Packet::read_from(stream).await?;
                if packet.kind != Packet::AUTH_RESPONSE {
                    // Some servers send an empty response value ahead of the auth result.
                    trace!(id = packet.id, kind = packet.kind, "skipping pre-auth packet");
                    continue;
                }
                if packet.id == Packet::AUTH_FAILED_ID {
                    return Err(RconError::AuthenticationFailed);
                }
                if packet.id == id {
                    return Ok(());
                }
            }
        })
        .await
        .map_err(|_| RconError::Timeout(wait))?;

        outcome?;
        self.authenticated = true;
        Ok(())
    }

    /// Runs one command and returns the server's response body.
    pub async fn command(&mut self, text: &str) -> Result<String, RconError> {
        let id = self.fresh_id();
        Packet::new(id, Packet::EXEC_COMMAND, text)
            .write_to(&mut self.stream)
            .await?;
        trace!(id, command = text, "rcon request sent");

        let wait = self.timeout;
        let stream = &mut self.stream;
        timeout(wait, async {
            loop {
                let packet = Packet::read_from(stream).await?;
                if packet.id == id && packet.kind == Packet::RESPONSE_VALUE {
                    return Ok(packet.body);
                }
                debug!(
                    expected = id,
                    id = packet.id,
                    kind = packet.kind,
                    "ignoring unmatched rcon packet"
                );
            }
        })
        .await
        .map_err(|_| RconError::Timeout(wait))?
    }
}
