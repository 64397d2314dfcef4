//! Public entry points: read a binary from storage, classify it, dispatch
//! to the Preview-1 or Preview-2 path, and normalize every outcome into a
//! module handle plus an eventual exit code.

use crate::asyncify;
use crate::ctx::HostCtx;
use crate::introspect::{self, WasiAbi};
use crate::preview1;
use crate::preview2;
use crate::stdio::Stdio;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::oneshot;
use wasmtime::{Caller, Config, Engine, Extern, Instance, Linker, Module, Store, TypedFunc};
use wasmtime_wasi::I32Exit;

/// A loaded module as remembered by the registry: the compiled module (for
/// core modules; components are compiled by their own engine) and its
/// export names. Kept for introspection and debugging; entries are never
/// evicted in this single-session host.
#[derive(Clone)]
pub struct LoadedModule {
    pub module: Option<Module>,
    pub exports: Vec<String>,
}

/// A running guest: the compiled module handle plus the pending exit code.
///
/// The store backing the live instance is owned by the background driver
/// task, so the handle carries the module and its export-name snapshot
/// rather than the instance itself.
#[derive(Debug)]
pub struct Execution {
    pub module: Option<Module>,
    pub exports: Vec<String>,
    exit: oneshot::Receiver<i32>,
}

impl Execution {
    /// Resolves to the process-style exit code: 0 for normal completion,
    /// nonzero for traps, explicit nonzero exits, and fatal errors. Never
    /// rejects.
    pub async fn exit_code(self) -> i32 {
        match self.exit.await {
            Ok(code) => code,
            Err(_) => {
                tracing::error!("execution driver vanished without reporting an exit code");
                1
            }
        }
    }
}

/// A module loaded outside the WASI contract: raw instantiation result with
/// its store, so the caller can poke exports directly.
pub struct PlainModule {
    pub module: Module,
    pub instance: Instance,
    pub store: Store<()>,
}

/// The WASI execution host. Owns the engine used for core modules and the
/// registry of everything instantiated through it.
pub struct Host {
    engine: Engine,
    registry: Mutex<HashMap<PathBuf, LoadedModule>>,
}

impl Host {
    pub fn new() -> Result<Self> {
        let engine = Engine::new(&Config::new())?;
        Ok(Host {
            engine,
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// Load and run a command module with stream-backed standard I/O. This
    /// is the entry point most callers use.
    ///
    /// The binary is read, classified, and instantiated before this
    /// returns, so setup failures (unreadable file, bad imports, engine
    /// rejection) surface here; execution then proceeds on a background
    /// task whose outcome is the returned [`Execution`]'s exit code.
    pub async fn load_component(
        &self,
        path: impl AsRef<Path>,
        stdio: Stdio,
        args: &[String],
    ) -> Result<Execution> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read module at `{}`", path.display()))?;

        let abi = introspect::classify_abi(&bytes);
        tracing::info!(?abi, "loading `{}`", path.display());

        if introspect::is_component(&bytes) {
            return self.load_component_binary(path, &bytes, stdio, args).await;
        }
        if abi == Some(WasiAbi::Preview2) {
            // a core module speaking `wasi:` interfaces cannot be linked
            // against this host's import surface; let instantiation report
            // exactly which import is unsatisfied
            tracing::warn!(
                "`{}` imports component-model interfaces from a core module",
                path.display()
            );
        }
        self.load_core_module(path, &bytes, stdio, args).await
    }

    /// Load a module with no WASI wiring at all: a minimal import object
    /// (a console-log function under the `env` namespace) and the raw
    /// instantiation result. No stream plumbing, no exit-code contract.
    pub async fn load_module(&self, path: impl AsRef<Path>) -> Result<PlainModule> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read module at `{}`", path.display()))?;
        let module = Module::new(&self.engine, &bytes)
            .with_context(|| format!("failed to compile `{}`", path.display()))?;

        let mut store = Store::new(&self.engine, ());
        let mut linker: Linker<()> = Linker::new(&self.engine);
        linker.func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, ()>, ptr: i32, len: i32| {
                let text = caller
                    .get_export("memory")
                    .and_then(Extern::into_memory)
                    .map(|memory| {
                        let data = memory.data(&caller);
                        let start = ptr as u32 as usize;
                        let end = start.saturating_add(len as u32 as usize);
                        data.get(start..end)
                            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                            .unwrap_or_default()
                    })
                    .unwrap_or_default();
                tracing::info!(target: "guest", "{text}");
            },
        )?;
        let instance = linker
            .instantiate(&mut store, &module)
            .with_context(|| format!("failed to instantiate `{}`", path.display()))?;

        let exports: Vec<String> = module.exports().map(|e| e.name().to_string()).collect();
        self.register(path, Some(&module), exports);
        Ok(PlainModule {
            module,
            instance,
            store,
        })
    }

    /// Registry lookup by path.
    pub fn loaded_module(&self, path: impl AsRef<Path>) -> Option<LoadedModule> {
        self.registry.lock().unwrap().get(path.as_ref()).cloned()
    }

    /// Every path instantiated through this host so far.
    pub fn loaded_paths(&self) -> Vec<PathBuf> {
        self.registry.lock().unwrap().keys().cloned().collect()
    }

    fn register(&self, path: &Path, module: Option<&Module>, exports: Vec<String>) {
        self.registry.lock().unwrap().insert(
            path.to_path_buf(),
            LoadedModule {
                module: module.cloned(),
                exports,
            },
        );
    }

    async fn load_core_module(
        &self,
        path: &Path,
        bytes: &[u8],
        stdio: Stdio,
        args: &[String],
    ) -> Result<Execution> {
        let support = introspect::detect_asyncify(bytes);
        let limits = introspect::detect_memory_import(bytes, "env");
        let asyncified = support.in_exports();
        tracing::debug!(asyncified, ?limits, "preparing preview1 instantiation");

        let module = Module::new(&self.engine, bytes)
            .with_context(|| format!("failed to compile `{}`", path.display()))?;
        let ctx = HostCtx::new(stdio, args, asyncified)?;
        let mut store = Store::new(&self.engine, ctx);
        let mut linker = Linker::new(&self.engine);
        preview1::add_to_linker(&mut linker)?;
        preview1::create_memory(&mut store, &mut linker, limits.as_ref())?;

        let instance = linker
            .instantiate(&mut store, &module)
            .with_context(|| format!("failed to instantiate `{}`", path.display()))?;

        // some binaries export their own memory instead of importing the
        // host's; all bindings must follow it from here on
        if let Some(exported) = instance.get_memory(&mut store, "memory") {
            store.data_mut().set_memory(exported);
        }

        let exports: Vec<String> = module.exports().map(|e| e.name().to_string()).collect();
        self.register(path, Some(&module), exports.clone());

        let (tx, rx) = oneshot::channel();
        tokio::spawn(run_core(store, instance, asyncified, tx));
        Ok(Execution {
            module: Some(module),
            exports,
            exit: rx,
        })
    }

    async fn load_component_binary(
        &self,
        path: &Path,
        bytes: &[u8],
        stdio: Stdio,
        args: &[String],
    ) -> Result<Execution> {
        let exec = preview2::instantiate(bytes, stdio, args)
            .await
            .with_context(|| format!("failed to load component `{}`", path.display()))?;
        self.register(path, None, Vec::new());

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(preview2::run(exec).await);
        });
        Ok(Execution {
            module: None,
            exports: Vec::new(),
            exit: rx,
        })
    }
}

async fn run_core(
    mut store: Store<HostCtx>,
    instance: Instance,
    asyncified: bool,
    exit: oneshot::Sender<i32>,
) {
    let code = match resolve_entry(&mut store, &instance) {
        Some(entry) if asyncified => match asyncify::drive(&mut store, instance, entry).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("asyncify trampoline failed: {e:#}");
                1
            }
        },
        Some(entry) => match entry.call(&mut store, ()) {
            Ok(()) => 0,
            Err(err) => match err.downcast_ref::<I32Exit>() {
                Some(status) => status.0,
                None => {
                    tracing::error!("guest trapped: {err:#}");
                    1
                }
            },
        },
        None => {
            tracing::warn!("module exports neither `_start` nor `_initialize`; nothing to run");
            0
        }
    };
    // let queued output drain before the exit code becomes observable
    store.data().flush().await;
    let _ = exit.send(code);
}

fn resolve_entry(store: &mut Store<HostCtx>, instance: &Instance) -> Option<TypedFunc<(), ()>> {
    instance
        .get_typed_func::<(), ()>(&mut *store, "_start")
        .or_else(|_| instance.get_typed_func::<(), ()>(&mut *store, "_initialize"))
        .ok()
}
