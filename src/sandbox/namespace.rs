use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rhai::Dynamic;

use crate::component::{Component, ComponentRef};
use crate::error::SandboxError;

/// One node of the namespace tree.
///
/// The tree maps dotted paths (`System.FileSystem`) to component instances.
/// Interior vs. leaf is a tagged variant: a leaf holds exactly one component,
/// an interior node holds named children. The tree is built once, during
/// sandbox construction, and never mutated afterwards — lookups at require
/// time need no lock.
pub enum NamespaceNode {
    Interior(BTreeMap<String, NamespaceNode>),
    Leaf(Arc<dyn Component>),
}

impl NamespaceNode {
    /// An empty interior node, used as the tree root.
    pub fn root() -> Self {
        NamespaceNode::Interior(BTreeMap::new())
    }

    /// Inserts a component at a dotted path, creating interior nodes on
    /// demand. Walking through an existing leaf is a structural conflict and
    /// is reported, never silently overwritten. Re-inserting at an exact leaf
    /// path replaces that leaf (last descriptor wins, matching descriptor
    /// order determinism); replacing an interior node would orphan its
    /// children and is also a conflict.
    pub fn insert(
        &mut self,
        path: &str,
        component: Arc<dyn Component>,
    ) -> Result<(), SandboxError> {
        let segments: Vec<&str> = path.split('.').collect();
        if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(SandboxError::component_load(
                path,
                "namespace path must be non-empty dot-separated segments",
            ));
        }

        let mut node = self;
        for segment in &segments[..segments.len() - 1] {
            let map = match node {
                NamespaceNode::Interior(map) => map,
                NamespaceNode::Leaf(_) => {
                    return Err(SandboxError::component_load(
                        path,
                        format!("cannot extend leaf component at segment '{segment}'"),
                    ));
                }
            };
            node = map
                .entry((*segment).to_string())
                .or_insert_with(NamespaceNode::root);
        }

        let last = segments[segments.len() - 1];
        let map = match node {
            NamespaceNode::Interior(map) => map,
            NamespaceNode::Leaf(_) => {
                return Err(SandboxError::component_load(
                    path,
                    format!("cannot extend leaf component at segment '{last}'"),
                ));
            }
        };
        if let Some(NamespaceNode::Interior(_)) = map.get(last) {
            return Err(SandboxError::component_load(
                path,
                format!("segment '{last}' already holds a namespace subtree"),
            ));
        }
        map.insert(last.to_string(), NamespaceNode::Leaf(component));
        Ok(())
    }

    /// Walks child links segment by segment. A missing or non-interior node
    /// along the way yields `None` — never an error.
    pub fn lookup(&self, path: &str) -> Option<&NamespaceNode> {
        let mut node = self;
        for segment in path.split('.') {
            match node {
                NamespaceNode::Interior(map) => node = map.get(segment)?,
                NamespaceNode::Leaf(_) => return None,
            }
        }
        Some(node)
    }

    /// The component held by this node, if it is a leaf.
    pub fn component(&self) -> Option<&Arc<dyn Component>> {
        match self {
            NamespaceNode::Leaf(component) => Some(component),
            NamespaceNode::Interior(_) => None,
        }
    }

    /// Converts this node into a value a script can hold: a leaf becomes a
    /// component reference (same instance the registry created), an interior
    /// node becomes a read-only map snapshot of its children. Scripts can
    /// read the tree through these values but cannot replace any part of it.
    pub fn to_script_value(&self) -> Dynamic {
        match self {
            NamespaceNode::Leaf(component) => Dynamic::from(ComponentRef(component.clone())),
            NamespaceNode::Interior(map) => {
                let mut out = rhai::Map::new();
                for (key, child) in map {
                    out.insert(key.as_str().into(), child.to_script_value());
                }
                Dynamic::from(out)
            }
        }
    }
}

// Component trait objects carry no Debug; show the tree shape and leaf names.
impl fmt::Debug for NamespaceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceNode::Interior(map) => f.debug_map().entries(map.iter()).finish(),
            NamespaceNode::Leaf(component) => write!(f, "Leaf({})", component.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentBase;

    struct Dummy {
        base: ComponentBase,
    }

    impl Dummy {
        fn new(name: &str) -> Arc<dyn Component> {
            Arc::new(Dummy {
                base: ComponentBase::new(name, "dummy", serde_json::Value::Null),
            })
        }
    }

    impl Component for Dummy {
        fn base(&self) -> &ComponentBase {
            &self.base
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn test_insert_then_lookup() {
        let mut root = NamespaceNode::root();
        let component = Dummy::new("b");
        root.insert("a.b", component.clone()).unwrap();

        let found = root.lookup("a.b").and_then(|n| n.component()).unwrap();
        assert!(Arc::ptr_eq(found, &component));
        assert!(root.lookup("a.c").is_none());
    }

    #[test]
    fn test_lookup_missing_root_segment() {
        let mut root = NamespaceNode::root();
        root.insert("a.b", Dummy::new("b")).unwrap();
        assert!(root.lookup("x.y").is_none());
    }

    #[test]
    fn test_intermediate_nodes_created_on_demand() {
        let mut root = NamespaceNode::root();
        root.insert("a.b.c", Dummy::new("c")).unwrap();
        root.insert("a.b.d", Dummy::new("d")).unwrap();

        // Siblings coexist under the shared interior node
        assert!(root.lookup("a.b.c").is_some());
        assert!(root.lookup("a.b.d").is_some());
        assert!(matches!(
            root.lookup("a.b"),
            Some(NamespaceNode::Interior(_))
        ));
    }

    #[test]
    fn test_extending_leaf_is_conflict() {
        let mut root = NamespaceNode::root();
        root.insert("a.b", Dummy::new("b")).unwrap();

        let err = root.insert("a.b.c", Dummy::new("c")).unwrap_err();
        assert!(matches!(err, SandboxError::ComponentLoad { .. }));
        // The original leaf survives untouched
        assert!(root.lookup("a.b").and_then(|n| n.component()).is_some());
    }

    #[test]
    fn test_replacing_subtree_is_conflict() {
        let mut root = NamespaceNode::root();
        root.insert("a.b", Dummy::new("b")).unwrap();

        let err = root.insert("a", Dummy::new("a")).unwrap_err();
        assert!(matches!(err, SandboxError::ComponentLoad { .. }));
        assert!(root.lookup("a.b").is_some());
    }

    #[test]
    fn test_empty_segment_rejected() {
        let mut root = NamespaceNode::root();
        assert!(root.insert("", Dummy::new("x")).is_err());
        assert!(root.insert("a..b", Dummy::new("x")).is_err());
    }

    #[test]
    fn test_lookup_through_leaf_is_not_found() {
        let mut root = NamespaceNode::root();
        root.insert("a", Dummy::new("a")).unwrap();
        assert!(root.lookup("a.b").is_none());
    }
}
