//! Built-in host components and the registrations that expose them.

use std::any::Any;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Component, ComponentBase, EventBus, HostEvent};
use crate::config::ComponentDescriptor;
use crate::sandbox::fs::ConfinedFileAccess;
use crate::sandbox::registry::{ComponentRegistry, HostContext};
use crate::server::ServerCommand;

pub const FILESYSTEM_LOADER: &str = "system/filesystem";
pub const MESSAGING_LOADER: &str = "system/messaging";

/// Confined filesystem access as a mountable component.
///
/// The confinement base defaults to the host context's base path; a
/// descriptor may narrow it further with a relative `base` setting, never
/// widen it.
pub struct FileSystemComponent {
    base: ComponentBase,
    access: ConfinedFileAccess,
}

impl FileSystemComponent {
    fn build(descriptor: &ComponentDescriptor, ctx: &HostContext) -> Arc<Self> {
        let root = ConfinedFileAccess::new(&ctx.base_path);
        let access = match descriptor.config.get("base").and_then(Value::as_str) {
            Some(sub) => match root.resolve(sub) {
                Ok(path) => ConfinedFileAccess::new(path),
                Err(_) => root,
            },
            None => root,
        };
        Arc::new(Self {
            base: ComponentBase::new(
                &descriptor.name,
                "system.filesystem",
                descriptor.config.clone(),
            ),
            access,
        })
    }

    pub fn access(&self) -> &ConfinedFileAccess {
        &self.access
    }
}

impl Component for FileSystemComponent {
    fn base(&self) -> &ComponentBase {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Outbound messaging to connected clients, plus inbound delivery while
/// attached to an entity.
pub struct MessagingComponent {
    base: ComponentBase,
    outbound: mpsc::UnboundedSender<ServerCommand>,
    bus: EventBus,
}

impl MessagingComponent {
    fn build(descriptor: &ComponentDescriptor, ctx: &HostContext) -> Arc<Self> {
        Arc::new(Self {
            base: ComponentBase::new(
                &descriptor.name,
                "system.messaging",
                descriptor.config.clone(),
            ),
            outbound: ctx.outbound.clone(),
            bus: ctx.bus.clone(),
        })
    }

    /// Broadcasts a message to every connected client. Best effort: if the
    /// transport is gone the message is dropped with a diagnostic.
    pub fn send(&self, message: Value) {
        if self
            .outbound
            .send(ServerCommand::Broadcast { message })
            .is_err()
        {
            warn!(component = %self.base.name(), "transport closed, message dropped");
        }
    }
}

impl Component for MessagingComponent {
    fn base(&self) -> &ComponentBase {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn bind_events(&self) {
        let name = self.base.name().to_string();
        self.base.hold(self.bus.subscribe_with(move |event| {
            if let HostEvent::ClientMessage {
                msg_type, source, ..
            } = event
            {
                debug!(component = %name, %msg_type, %source, "inbound message delivered");
            }
        }));
    }
}

/// Registers the factories for every built-in component kind.
pub fn register_builtins(registry: &mut ComponentRegistry) {
    registry.register(
        FILESYSTEM_LOADER,
        Box::new(|descriptor, ctx| {
            let component: Arc<dyn Component> = FileSystemComponent::build(descriptor, ctx);
            Ok(component)
        }),
    );
    registry.register(
        MESSAGING_LOADER,
        Box::new(|descriptor, ctx| {
            let component: Arc<dyn Component> = MessagingComponent::build(descriptor, ctx);
            Ok(component)
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn context(base: PathBuf) -> (HostContext, mpsc::UnboundedReceiver<ServerCommand>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            HostContext {
                base_path: base,
                bus: EventBus::new(8),
                outbound,
            },
            rx,
        )
    }

    fn descriptor(name: &str, loader: &str, config: Value) -> ComponentDescriptor {
        ComponentDescriptor {
            name: name.to_string(),
            loader: loader.to_string(),
            config,
        }
    }

    #[tokio::test]
    async fn test_filesystem_component_narrows_base() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _rx) = context(dir.path().to_path_buf());

        let plain = FileSystemComponent::build(
            &descriptor("System.FileSystem", FILESYSTEM_LOADER, Value::Null),
            &ctx,
        );
        assert_eq!(plain.access().base(), dir.path());

        let narrowed = FileSystemComponent::build(
            &descriptor(
                "System.FileSystem",
                FILESYSTEM_LOADER,
                serde_json::json!({ "base": "saves" }),
            ),
            &ctx,
        );
        assert_eq!(narrowed.access().base(), dir.path().join("saves"));
    }

    #[tokio::test]
    async fn test_messaging_send_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = context(dir.path().to_path_buf());

        let messaging = MessagingComponent::build(
            &descriptor("System.Messaging", MESSAGING_LOADER, Value::Null),
            &ctx,
        );
        messaging.send(serde_json::json!({ "type": "tick", "data": 1 }));

        match rx.recv().await {
            Some(ServerCommand::Broadcast { message }) => {
                assert_eq!(message["type"], "tick");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_messaging_send_survives_closed_transport() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, rx) = context(dir.path().to_path_buf());
        drop(rx);

        let messaging = MessagingComponent::build(
            &descriptor("System.Messaging", MESSAGING_LOADER, Value::Null),
            &ctx,
        );
        // Must not panic
        messaging.send(serde_json::json!({ "type": "tick" }));
    }
}
