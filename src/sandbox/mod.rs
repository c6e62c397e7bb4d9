//! The execution sandbox: an isolated script context plus the namespace and
//! capabilities it exposes to game code.
//!
//! A [`Sandbox`] owns one namespace tree built from a component descriptor
//! list, the `exports` object scripts populate, and a [`ScriptCompiler`]
//! that runs code in fresh contexts derived from it. Scripts reach the host
//! exclusively through `require` — there is no ambient authority.

pub mod compiler;
pub mod fs;
pub mod namespace;
pub mod registry;

use std::sync::Arc;

use parking_lot::RwLock;
use rhai::{Dynamic, Map};

use crate::config::SandboxSettings;
use crate::error::SandboxError;
use compiler::ScriptCompiler;
use fs::ConfinedFileAccess;
use namespace::NamespaceNode;
use registry::{ComponentRegistry, HostContext};

/// State shared between the sandbox handle and every execution context
/// derived from it. The namespace tree and settings are fixed at
/// construction; only `exports` changes, and only through a successful
/// script run committing its result.
pub struct SandboxCore {
    pub(crate) settings: SandboxSettings,
    pub(crate) namespace: NamespaceNode,
    pub(crate) fs: ConfinedFileAccess,
    exports: RwLock<Map>,
}

impl SandboxCore {
    pub fn exports_snapshot(&self) -> Map {
        self.exports.read().clone()
    }

    pub(crate) fn commit_exports(&self, run_exports: &Map) {
        *self.exports.write() = run_exports.clone();
    }
}

/// An isolated execution session for game scripts.
///
/// Created once per session from a descriptor list; scripts executed inside
/// it share the accumulated `exports` across repeated `require` calls.
/// Exclusively owned by whatever created it — running scripts see the
/// namespace and capabilities but can replace neither.
pub struct Sandbox {
    core: Arc<SandboxCore>,
    compiler: ScriptCompiler,
}

impl Sandbox {
    /// Builds a sandbox by instantiating each descriptor, in order, into the
    /// namespace tree. Any failure aborts the whole load: the caller gets an
    /// error and no partially-populated sandbox ever exists.
    pub fn new(
        settings: SandboxSettings,
        registry: &ComponentRegistry,
        ctx: &HostContext,
    ) -> Result<Self, SandboxError> {
        let namespace = registry.load(&settings.components, ctx)?;
        let fs = ConfinedFileAccess::new(&settings.base_path);
        let core = Arc::new(SandboxCore {
            settings,
            namespace,
            fs,
            exports: RwLock::new(Map::new()),
        });
        Ok(Self {
            compiler: ScriptCompiler::new(core.clone()),
            core,
        })
    }

    pub fn compiler(&self) -> &ScriptCompiler {
        &self.compiler
    }

    /// Snapshot of the accumulated `exports` object.
    pub fn exports(&self) -> Map {
        self.core.exports_snapshot()
    }

    pub fn file_access(&self) -> &ConfinedFileAccess {
        &self.core.fs
    }

    /// Resolves a module id to a value.
    ///
    /// - empty id: contract violation, [`SandboxError::InvalidModuleId`];
    /// - `#dot.path`: synchronous namespace lookup, `Ok(None)` when any
    ///   segment is missing — never an error, never touches the filesystem;
    /// - anything else: confined file path, read + compiled + executed, the
    ///   module's exports returned through the async path. The module runs
    ///   against its own empty `exports`; loading it never mutates the
    ///   sandbox's accumulated exports.
    pub async fn require(&self, module_id: &str) -> Result<Option<Dynamic>, SandboxError> {
        if module_id.is_empty() {
            return Err(SandboxError::InvalidModuleId);
        }
        if let Some(path) = module_id.strip_prefix('#') {
            return Ok(self
                .core
                .namespace
                .lookup(path)
                .map(NamespaceNode::to_script_value));
        }
        let exports = compiler::require_file(&self.core, module_id).await?;
        Ok(Some(Dynamic::from(exports)))
    }
}

/// Shallow-copies every key of each source map onto `target`, sources
/// applied in order so a later source overwrites an earlier one. Pure.
pub fn merge(mut target: Map, sources: &[Map]) -> Map {
    for source in sources {
        for (key, value) in source.iter() {
            target.insert(key.clone(), value.clone());
        }
    }
    target
}
