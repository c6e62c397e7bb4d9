use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::namespace::NamespaceNode;
use crate::component::{Component, EventBus};
use crate::config::ComponentDescriptor;
use crate::error::SandboxError;
use crate::server::ServerCommand;

/// Host-side collaborators handed to component factories at build time.
/// Components never construct these themselves; the runtime wires one
/// context and every sandbox built from it shares the same bus and
/// outbound channel.
#[derive(Clone)]
pub struct HostContext {
    pub base_path: PathBuf,
    pub bus: EventBus,
    pub outbound: mpsc::UnboundedSender<ServerCommand>,
}

/// Builds one component instance from its descriptor.
pub type ComponentFactory = Box<
    dyn Fn(&ComponentDescriptor, &HostContext) -> Result<Arc<dyn Component>, SandboxError>
        + Send
        + Sync,
>;

/// Maps loader identifiers to component factories.
///
/// The registry is the only place loader strings mean anything; a sandbox
/// load resolves each descriptor's loader here and nowhere else.
#[derive(Default)]
pub struct ComponentRegistry {
    factories: HashMap<String, ComponentFactory>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under a loader id, replacing any previous one.
    pub fn register(&mut self, loader: impl Into<String>, factory: ComponentFactory) {
        let loader = loader.into();
        debug!(%loader, "registering component factory");
        self.factories.insert(loader, factory);
    }

    pub fn contains(&self, loader: &str) -> bool {
        self.factories.contains_key(loader)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Instantiates every descriptor, in order, into a namespace tree.
    ///
    /// All-or-nothing: an unknown loader, a factory failure or a namespace
    /// conflict aborts the whole load and the partial tree is discarded.
    pub fn load(
        &self,
        descriptors: &[ComponentDescriptor],
        ctx: &HostContext,
    ) -> Result<NamespaceNode, SandboxError> {
        let mut root = NamespaceNode::root();
        for descriptor in descriptors {
            let factory = self.factories.get(&descriptor.loader).ok_or_else(|| {
                SandboxError::component_load(
                    &descriptor.name,
                    format!("unknown loader '{}'", descriptor.loader),
                )
            })?;
            let component = factory(descriptor, ctx)?;
            info!(name = %descriptor.name, loader = %descriptor.loader, "component loaded");
            root.insert(&descriptor.name, component)?;
        }
        Ok(root)
    }
}
