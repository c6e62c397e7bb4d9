use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::component::{EventBus, HostEvent};
use crate::config::Config;
use crate::sandbox::Sandbox;
use crate::server::{ServerCommand, ServerEvent};

/// The host runtime — core of the script host.
///
/// Boots the configured entry script inside the sandbox, then bridges the
/// transport to the component event bus: connection lifecycle and inbound
/// client messages become [`HostEvent`]s any bound component can observe.
pub struct HostRuntime {
    config: Config,
    sandbox: Sandbox,
    bus: EventBus,
}

impl HostRuntime {
    pub fn new(config: Config, sandbox: Sandbox, bus: EventBus) -> Self {
        Self {
            config,
            sandbox,
            bus,
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Runs the configured entry script, if any, as a top-level execution:
    /// its exports accumulate into the sandbox for later scripts to build on.
    ///
    /// A faulting game script is a content problem, not a host problem: the
    /// failure is logged and the host keeps serving.
    pub async fn boot(&self) -> Result<()> {
        let Some(entry) = self.config.sandbox.entry.clone() else {
            info!("No entry script configured");
            return Ok(());
        };

        info!("Booting entry script {entry}");
        let source = match self.sandbox.file_access().read_to_string(&entry).await {
            Ok(source) => source,
            Err(e) => {
                warn!("Entry script {entry} unavailable: {e}");
                return Ok(());
            }
        };
        let outcome = self
            .sandbox
            .compiler()
            .compile(&source, Some(entry.as_str()))
            .and_then(|unit| self.sandbox.compiler().execute(&unit));
        match outcome {
            Ok(_) => info!("Entry script completed"),
            Err(e) => warn!("Entry script failed: {e}"),
        }
        Ok(())
    }

    /// Main host loop
    pub async fn run(
        &self,
        mut event_rx: mpsc::Receiver<ServerEvent>,
        cmd_tx: mpsc::UnboundedSender<ServerCommand>,
    ) -> Result<()> {
        info!("Host runtime started — waiting for clients...");

        while let Some(event) = event_rx.recv().await {
            match event {
                ServerEvent::Connected { client } => {
                    info!("Client {client} connected");
                    // Hand the client its session id as the first message
                    let _ = cmd_tx.send(ServerCommand::Send {
                        client: client.clone(),
                        message: serde_json::json!({
                            "type": "sessionID",
                            "data": client,
                        }),
                    });
                    self.bus.publish(HostEvent::ClientConnected { client });
                }
                ServerEvent::Message {
                    msg_type,
                    data,
                    source,
                } => {
                    self.bus.publish(HostEvent::ClientMessage {
                        msg_type,
                        data,
                        source,
                    });
                }
                ServerEvent::Disconnected { client } => {
                    info!("Client {client} disconnected");
                    self.bus.publish(HostEvent::ClientDisconnected { client });
                }
            }
        }

        Ok(())
    }
}
