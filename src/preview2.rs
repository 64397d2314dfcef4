//! Bridge to the second-generation WASI shim for component-model binaries.
//!
//! The shim (`wasmtime-wasi`) owns the ABI mechanics; this module's only
//! job is to hand it the caller's byte streams in the shape it wants,
//! pass the command-line arguments through, and normalize the outcome of
//! `wasi:cli/run` into the host's exit-code contract. Stream teardown rides
//! on ownership: the shim's stream workers stop when the store drops, on
//! every outcome.

use crate::stdio::Stdio;
use anyhow::{Context, Result};
use wasmtime::component::{Component, Linker, ResourceTable};
use wasmtime::{Config, Engine, Store};
use wasmtime_wasi::bindings::Command;
use wasmtime_wasi::pipe::{AsyncReadStream, AsyncWriteStream};
use wasmtime_wasi::{
    add_to_linker_async, AsyncStdinStream, AsyncStdoutStream, I32Exit, WasiCtx, WasiCtxBuilder,
    WasiView,
};

const WRITE_BUDGET: usize = 64 * 1024;

struct BridgeCtx {
    wasi: WasiCtx,
    table: ResourceTable,
}

impl WasiView for BridgeCtx {
    fn table(&mut self) -> &mut ResourceTable {
        &mut self.table
    }
    fn ctx(&mut self) -> &mut WasiCtx {
        &mut self.wasi
    }
}

pub(crate) struct ComponentExec {
    store: Store<BridgeCtx>,
    command: Command,
}

/// Compile and instantiate a component against the shim, with the caller's
/// streams spliced in as its standard I/O.
pub(crate) async fn instantiate(
    bytes: &[u8],
    stdio: Stdio,
    args: &[String],
) -> Result<ComponentExec> {
    let mut config = Config::new();
    config.async_support(true);
    let engine = Engine::new(&config)?;
    let component = Component::new(&engine, bytes).context("failed to compile component")?;

    let mut linker = Linker::new(&engine);
    add_to_linker_async(&mut linker)?;

    let mut builder = WasiCtxBuilder::new();
    builder.args(args);
    builder.stdin(AsyncStdinStream::new(AsyncReadStream::new(stdio.stdin)));
    builder.stdout(AsyncStdoutStream::new(AsyncWriteStream::new(
        WRITE_BUDGET,
        stdio.stdout,
    )));
    builder.stderr(AsyncStdoutStream::new(AsyncWriteStream::new(
        WRITE_BUDGET,
        stdio.stderr,
    )));

    let mut store = Store::new(
        &engine,
        BridgeCtx {
            wasi: builder.build(),
            table: ResourceTable::new(),
        },
    );
    let command = Command::instantiate_async(&mut store, &component, &linker)
        .await
        .context("failed to instantiate component")?;
    Ok(ComponentExec { store, command })
}

/// Invoke the shim's run entry point and map its outcome to an exit code.
pub(crate) async fn run(mut exec: ComponentExec) -> i32 {
    match exec
        .command
        .wasi_cli_run()
        .call_run(&mut exec.store)
        .await
    {
        Ok(Ok(())) => 0,
        Ok(Err(())) => 1,
        Err(err) => match err.downcast_ref::<I32Exit>() {
            Some(exit) => exit.0,
            None => {
                tracing::error!("component trapped: {err:#}");
                1
            }
        },
    }
}
