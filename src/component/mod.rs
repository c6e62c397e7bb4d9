pub mod builtin;
pub mod events;

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;

use events::SubscriptionHandle;

pub use events::{EventBus, HostEvent};

static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

/// A host-side entity a component can be attached to.
#[derive(Debug)]
pub struct Entity {
    pub id: u64,
    pub name: String,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
        })
    }
}

/// Shared state every component carries: identity, immutable settings, the
/// (non-owning) entity back-reference and the event subscriptions held while
/// attached.
pub struct ComponentBase {
    name: String,
    kind: String,
    settings: Value,
    entity: RwLock<Option<Weak<Entity>>>,
    subscriptions: RwLock<Vec<SubscriptionHandle>>,
}

impl ComponentBase {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, settings: Value) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            settings,
            entity: RwLock::new(None),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn settings(&self) -> &Value {
        &self.settings
    }

    /// The owning entity, if still alive. The component holds only a weak
    /// link — it never keeps the entity's lifetime going.
    pub fn entity(&self) -> Option<Arc<Entity>> {
        self.entity.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn is_attached(&self) -> bool {
        self.entity.read().is_some()
    }

    /// Parks a subscription handle for the duration of the attachment.
    pub fn hold(&self, handle: SubscriptionHandle) {
        self.subscriptions.write().push(handle);
    }

    fn release_subscriptions(&self) {
        self.subscriptions.write().clear();
    }

    fn store_entity(&self, entity: &Arc<Entity>) {
        *self.entity.write() = Some(Arc::downgrade(entity));
    }

    fn clear_entity(&self) {
        *self.entity.write() = None;
    }
}

/// The contract every pluggable component obeys.
///
/// `bind_events`/`unbind_events` are extension points with no default
/// behavior — concrete components override them to wire and unwire host
/// event subscriptions (parking handles on the base via
/// [`ComponentBase::hold`]). The attach/detach state machine itself lives in
/// the provided `set_entity` and is the same for everyone:
/// `Unattached -> Attached -> Unattached`, re-entrant.
pub trait Component: Send + Sync {
    fn base(&self) -> &ComponentBase;

    /// Escape hatch for capability dispatch on a shared `dyn Component`.
    fn as_any(&self) -> &dyn Any;

    fn bind_events(&self) {}

    fn unbind_events(&self) {}

    fn name(&self) -> &str {
        self.base().name()
    }

    fn kind(&self) -> &str {
        self.base().kind()
    }

    fn settings(&self) -> &Value {
        self.base().settings()
    }

    /// Attaches the component to an entity, or detaches it with `None`.
    ///
    /// If already attached, `unbind_events` runs (and held subscriptions are
    /// released) before the old entity reference is dropped. A new entity is
    /// stored weakly, then `bind_events` runs.
    fn set_entity(&self, entity: Option<Arc<Entity>>) {
        let base = self.base();
        if base.is_attached() {
            self.unbind_events();
            base.release_subscriptions();
        }
        base.clear_entity();

        if let Some(entity) = entity {
            base.store_entity(&entity);
            self.bind_events();
        }
    }
}

/// Script-facing reference to a registered component.
///
/// Cloning shares the same instance, so a script holding the result of
/// `require("#System.FileSystem")` has the exact component the registry
/// created — reference identity, observable via [`ComponentRef::ptr_eq`].
#[derive(Clone)]
pub struct ComponentRef(pub Arc<dyn Component>);

impl ComponentRef {
    pub fn ptr_eq(&self, other: &ComponentRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Script-facing reference to a host entity.
#[derive(Clone)]
pub struct EntityRef(pub Arc<Entity>);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        base: ComponentBase,
        binds: AtomicUsize,
        unbinds: AtomicUsize,
    }

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                base: ComponentBase::new("counting", "test", Value::Null),
                binds: AtomicUsize::new(0),
                unbinds: AtomicUsize::new(0),
            })
        }
    }

    impl Component for Counting {
        fn base(&self) -> &ComponentBase {
            &self.base
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn bind_events(&self) {
            self.binds.fetch_add(1, Ordering::SeqCst);
        }

        fn unbind_events(&self) {
            self.unbinds.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_attach_detach_cycle() {
        let component = Counting::new();
        let entity = Entity::new("player");

        component.set_entity(Some(entity.clone()));
        assert!(component.base().is_attached());
        assert_eq!(component.binds.load(Ordering::SeqCst), 1);
        assert_eq!(component.unbinds.load(Ordering::SeqCst), 0);

        component.set_entity(None);
        assert!(!component.base().is_attached());
        assert_eq!(component.unbinds.load(Ordering::SeqCst), 1);

        // Re-entrant: attach again
        component.set_entity(Some(entity));
        assert_eq!(component.binds.load(Ordering::SeqCst), 2);
        assert_eq!(component.unbinds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detach_when_unattached_skips_unbind() {
        let component = Counting::new();
        component.set_entity(None);
        assert_eq!(component.unbinds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reattach_unbinds_old_entity_first() {
        let component = Counting::new();
        let b = Entity::new("b");
        component.set_entity(Some(Entity::new("a")));
        component.set_entity(Some(b.clone()));

        assert_eq!(component.binds.load(Ordering::SeqCst), 2);
        assert_eq!(component.unbinds.load(Ordering::SeqCst), 1);
        // The link is weak, so the entity must still be held by the caller
        assert_eq!(component.base().entity().unwrap().name, b.name);
    }

    #[test]
    fn test_entity_link_is_non_owning() {
        let component = Counting::new();
        let entity = Entity::new("ghost");
        component.set_entity(Some(entity.clone()));
        drop(entity);

        // The weak link does not keep the entity alive
        assert!(component.base().entity().is_none());
        // ...but the component still counts as attached until detached
        assert!(component.base().is_attached());
    }
}
