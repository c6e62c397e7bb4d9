use std::sync::Arc;

use rhai::{Dynamic, Engine, EvalAltResult, Map, Position, Scope, AST};
use tracing::{info, warn};

use super::SandboxCore;
use crate::component::{ComponentRef, Entity, EntityRef};
use crate::error::SandboxError;

/// Origin label for script text compiled without a filename.
pub const ANONYMOUS_ORIGIN: &str = "[anonymous]";

/// Prefix tagged onto caller-supplied origins so diagnostics distinguish
/// sandboxed game files from host-side sources.
pub const GAME_ORIGIN_PREFIX: &str = "[game]";

/// An opaque, named, executable representation of source text.
///
/// Immutable once compiled; running it never mutates it, so a unit may be
/// executed any number of times, each run in a fresh context.
#[derive(Debug)]
pub struct CompiledUnit {
    ast: AST,
    origin: String,
}

impl CompiledUnit {
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// Compiles and runs game script text in the context of a sandbox.
///
/// Compile-time failure and run-time failure are separate typed results;
/// neither crosses the component boundary as a panic.
pub struct ScriptCompiler {
    core: Arc<SandboxCore>,
}

impl ScriptCompiler {
    pub(super) fn new(core: Arc<SandboxCore>) -> Self {
        Self { core }
    }

    /// Compiles source text into a [`CompiledUnit`] bound to an origin label.
    /// An omitted origin becomes `[anonymous]`.
    pub fn compile(
        &self,
        source: &str,
        origin: Option<&str>,
    ) -> Result<CompiledUnit, SandboxError> {
        compile_source(source, origin)
    }

    /// Runs a compiled unit inside a fresh execution context derived from
    /// the sandbox. On success the sandbox's `exports` is updated and
    /// returned as it stood after the run; on any fault `exports` is left
    /// exactly as it was.
    pub fn execute(&self, unit: &CompiledUnit) -> Result<Map, SandboxError> {
        execute_unit(&self.core, unit)
    }
}

pub(super) fn compile_source(
    source: &str,
    origin: Option<&str>,
) -> Result<CompiledUnit, SandboxError> {
    let origin = match origin {
        Some(name) => format!("{GAME_ORIGIN_PREFIX}{name}"),
        None => ANONYMOUS_ORIGIN.to_string(),
    };

    // Parsing needs no capability bindings; those are resolved at run time.
    let engine = Engine::new();
    match engine.compile(source) {
        Ok(mut ast) => {
            ast.set_source(origin.as_str());
            Ok(CompiledUnit { ast, origin })
        }
        Err(e) => {
            warn!(%origin, "script failed to compile: {e}");
            Err(SandboxError::Compile {
                origin,
                message: e.to_string(),
            })
        }
    }
}

pub(super) fn execute_unit(
    core: &Arc<SandboxCore>,
    unit: &CompiledUnit,
) -> Result<Map, SandboxError> {
    // Top-level execution: the scope is seeded with a copy of the sandbox's
    // accumulated exports, and the copy is committed back only on success.
    // Module loads triggered by the running script never touch the sandbox's
    // exports (see require_file), so a fault at any point during the run,
    // nested requires included, leaves the sandbox exactly as it was.
    let exports = run_in_fresh_context(core, unit, core.exports_snapshot())?;
    core.commit_exports(&exports);
    Ok(exports)
}

/// Loads, compiles and runs a confined script file, returning its exports.
/// The module's exports are genuinely handed back through the async path.
///
/// A module runs against its own empty `exports`: its result is the return
/// value of `require` and nothing else. The sandbox's accumulated exports
/// belong to top-level executions alone.
pub(super) async fn require_file(
    core: &Arc<SandboxCore>,
    module_id: &str,
) -> Result<Map, SandboxError> {
    if !core.fs.exists(module_id).await? {
        warn!(module = module_id, "require: module not found");
        return Err(SandboxError::ModuleNotFound(module_id.to_string()));
    }
    let source = core.fs.read_to_string(module_id).await?;
    let unit = compile_source(&source, Some(module_id))?;
    run_in_fresh_context(core, &unit, Map::new())
}

/// One execution context per call: a fresh engine with the sandbox's
/// capabilities bound, and a scope whose `exports` starts as `seed`. Returns
/// the scope's `exports` as it stood after the run; commits nothing.
fn run_in_fresh_context(
    core: &Arc<SandboxCore>,
    unit: &CompiledUnit,
    seed: Map,
) -> Result<Map, SandboxError> {
    let engine = build_engine(core.clone());
    let mut scope = Scope::new();
    scope.push("exports", seed);

    match engine.run_ast_with_scope(&mut scope, &unit.ast) {
        Ok(()) => Ok(scope.get_value::<Map>("exports").unwrap_or_default()),
        Err(e) => {
            warn!(origin = %unit.origin, "script faulted at run time: {e}");
            Err(SandboxError::Runtime {
                origin: unit.origin.clone(),
                message: e.to_string(),
            })
        }
    }
}

/// Builds the execution engine a script sees: the namespace and capability
/// functions, and nothing else. A default rhai engine has no filesystem,
/// network or process surface, so this list *is* the script's entire world.
fn build_engine(core: Arc<SandboxCore>) -> Engine {
    let mut engine = Engine::new();
    if core.settings.max_operations > 0 {
        engine.set_max_operations(core.settings.max_operations);
    }

    engine.register_type_with_name::<ComponentRef>("Component");
    engine.register_get("name", |c: &mut ComponentRef| c.0.name().to_string());
    engine.register_get("kind", |c: &mut ComponentRef| c.0.kind().to_string());
    engine.register_fn("is_same", |a: &mut ComponentRef, b: ComponentRef| a.ptr_eq(&b));

    engine.register_type_with_name::<EntityRef>("Entity");
    engine.register_get("id", |e: &mut EntityRef| e.0.id as i64);
    engine.register_get("name", |e: &mut EntityRef| e.0.name.clone());
    engine.register_fn("entity", |name: &str| EntityRef(Entity::new(name)));

    engine.register_fn(
        "set_entity",
        |c: &mut ComponentRef, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
            if value.is_unit() {
                c.0.set_entity(None);
                Ok(())
            } else if let Some(entity) = value.clone().try_cast::<EntityRef>() {
                c.0.set_entity(Some(entity.0));
                Ok(())
            } else {
                let err = SandboxError::ComponentType(format!(
                    "set_entity expects an entity or (), got {}",
                    value.type_name()
                ));
                warn!("{err}");
                Err(script_error(&err))
            }
        },
    );

    engine.register_fn(
        "send",
        |c: &mut ComponentRef, message: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let messaging = c
                .0
                .as_any()
                .downcast_ref::<crate::component::builtin::MessagingComponent>()
                .ok_or_else(|| {
                    script_error(&SandboxError::ComponentType(format!(
                        "component '{}' does not support send",
                        c.0.name()
                    )))
                })?;
            let value: serde_json::Value = rhai::serde::from_dynamic(&message)
                .map_err(|e| script_error(&SandboxError::ComponentType(e.to_string())))?;
            messaging.send(value);
            Ok(())
        },
    );

    // File operations, dispatched through a filesystem component the script
    // acquired via require. The same confinement that applies to module
    // loading applies here.
    engine.register_fn(
        "exists",
        |c: &mut ComponentRef, path: &str| -> Result<bool, Box<EvalAltResult>> {
            let fs = filesystem_capability(c)?;
            block_on_fs(fs.access().exists(path))
        },
    );
    engine.register_fn(
        "read_text",
        |c: &mut ComponentRef, path: &str| -> Result<String, Box<EvalAltResult>> {
            let fs = filesystem_capability(c)?;
            block_on_fs(fs.access().read_to_string(path))
        },
    );
    engine.register_fn(
        "write_text",
        |c: &mut ComponentRef, path: &str, text: &str| -> Result<(), Box<EvalAltResult>> {
            let fs = filesystem_capability(c)?;
            block_on_fs(fs.access().write(path, text.as_bytes()))
        },
    );
    engine.register_fn(
        "list_dir",
        |c: &mut ComponentRef, path: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let fs = filesystem_capability(c)?;
            let entries = block_on_fs(fs.access().list_directory(path))?;
            Ok(match entries {
                Some(entries) => Dynamic::from(
                    entries
                        .into_iter()
                        .map(Dynamic::from)
                        .collect::<rhai::Array>(),
                ),
                None => Dynamic::UNIT,
            })
        },
    );

    engine.register_fn("merge", |target: Map, source: Map| {
        super::merge(target, &[source])
    });
    engine.register_fn("merge", |target: Map, s1: Map, s2: Map| {
        super::merge(target, &[s1, s2])
    });

    engine.register_fn("log", |message: &str| {
        info!(target: "script", "{message}");
    });

    {
        let core = core.clone();
        engine.register_fn(
            "require",
            move |module_id: &str| -> Result<Dynamic, Box<EvalAltResult>> {
                script_require(&core, module_id)
            },
        );
    }

    engine
}

/// The sandbox's sole capability-acquisition primitive, as scripts see it.
///
/// `#`-prefixed ids resolve synchronously against the namespace tree; plain
/// ids are confined file paths and suspend the calling script while the file
/// is read, compiled and executed. A module that cannot be loaded yields `()`
/// plus a diagnostic — only an empty id is a contract violation the script
/// itself observes as an error.
fn script_require(
    core: &Arc<SandboxCore>,
    module_id: &str,
) -> Result<Dynamic, Box<EvalAltResult>> {
    if module_id.is_empty() {
        return Err(script_error(&SandboxError::InvalidModuleId));
    }

    if let Some(path) = module_id.strip_prefix('#') {
        return Ok(core
            .namespace
            .lookup(path)
            .map(|node| node.to_script_value())
            .unwrap_or(Dynamic::UNIT));
    }

    let outcome = tokio::task::block_in_place(|| {
        tokio::runtime::Handle::current().block_on(require_file(core, module_id))
    });
    match outcome {
        Ok(exports) => Ok(Dynamic::from(exports)),
        Err(SandboxError::InvalidModuleId) => Err(script_error(&SandboxError::InvalidModuleId)),
        Err(err) => {
            // Compile/runtime/not-found diagnostics were already emitted at
            // their boundary; i/o and confinement faults get one here.
            if matches!(
                err,
                SandboxError::Io(_) | SandboxError::PathTraversalRejected(_)
            ) {
                warn!(module = module_id, "require failed: {err}");
            }
            Ok(Dynamic::UNIT)
        }
    }
}

fn filesystem_capability(
    c: &ComponentRef,
) -> Result<&crate::component::builtin::FileSystemComponent, Box<EvalAltResult>> {
    c.0.as_any()
        .downcast_ref::<crate::component::builtin::FileSystemComponent>()
        .ok_or_else(|| {
            script_error(&SandboxError::ComponentType(format!(
                "component '{}' does not support file access",
                c.0.name()
            )))
        })
}

/// Runs a confined filesystem future to completion on behalf of a script,
/// mapping failures into script errors.
fn block_on_fs<T>(
    fut: impl std::future::Future<Output = Result<T, SandboxError>>,
) -> Result<T, Box<EvalAltResult>> {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
        .map_err(|e| script_error(&e))
}

fn script_error(err: &SandboxError) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        err.to_string().into(),
        Position::NONE,
    ))
}
