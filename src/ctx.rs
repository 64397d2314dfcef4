use crate::clocks::HostClocks;
use crate::random::{GetRandom, WasiRandom};
use crate::stdio::{OrderedWriter, Stdio, StdinPump, StdinQueue};
use crate::string_array::{StringArray, StringArrayError};
use std::sync::Arc;
use wasmtime::Memory;

/// Tracks whether the guest is suspended awaiting input and where its
/// unwind/rewind scratch buffer lives in linear memory.
#[derive(Default)]
pub(crate) struct AsyncifyState {
    /// The binary carries the transformation's exports.
    pub enabled: bool,
    /// Set by `fd_read` when it triggers an unwind; cleared by the
    /// trampoline once input has arrived.
    pub pending: bool,
    /// Scratch buffer address, fixed once allocated. Zero means "not yet".
    pub data_addr: u32,
}

/// Per-execution store data for the Preview-1 path: the guest's arguments,
/// the injected ambient capabilities, the stream bridges, and the state the
/// Asyncify trampoline shares with the I/O bindings.
///
/// Constructing one starts the stdin pump immediately, decoupling the
/// guest's synchronous reads from the asynchronous stream underneath.
pub struct HostCtx {
    pub(crate) args: StringArray,
    pub(crate) env: StringArray,
    pub(crate) clocks: HostClocks,
    pub(crate) random: Box<dyn WasiRandom>,
    pub(crate) stdin: Arc<StdinQueue>,
    pub(crate) stdout: OrderedWriter,
    pub(crate) stderr: OrderedWriter,
    /// The memory host functions operate on. Starts as the host-created
    /// import; swapped to the instance's own exported memory when present.
    pub(crate) memory: Option<Memory>,
    pub(crate) asyncify: AsyncifyState,
    _stdin_pump: StdinPump,
}

impl HostCtx {
    pub fn new(
        stdio: Stdio,
        args: &[String],
        asyncify_enabled: bool,
    ) -> Result<Self, StringArrayError> {
        let mut argv = StringArray::new();
        for arg in args {
            argv.push(arg.clone())?;
        }
        let pump = StdinPump::start(stdio.stdin);
        Ok(HostCtx {
            args: argv,
            env: StringArray::new(),
            clocks: HostClocks::default(),
            random: Box::new(GetRandom),
            stdin: pump.queue(),
            stdout: OrderedWriter::new("stdout", stdio.stdout),
            stderr: OrderedWriter::new("stderr", stdio.stderr),
            memory: None,
            asyncify: AsyncifyState {
                enabled: asyncify_enabled,
                ..AsyncifyState::default()
            },
            _stdin_pump: pump,
        })
    }

    /// Replace the system clocks, e.g. with a fixed pair in tests.
    pub fn with_clocks(mut self, clocks: HostClocks) -> Self {
        self.clocks = clocks;
        self
    }

    /// Replace the randomness source, e.g. with a deterministic one.
    pub fn with_random(mut self, random: Box<dyn WasiRandom>) -> Self {
        self.random = random;
        self
    }

    pub(crate) fn set_memory(&mut self, memory: Memory) {
        self.memory = Some(memory);
    }

    pub(crate) fn stdin_queue(&self) -> Arc<StdinQueue> {
        Arc::clone(&self.stdin)
    }

    /// Await both output queues; resolves once everything the guest wrote
    /// has drained to the underlying streams.
    pub async fn flush(&self) {
        self.stdout.flush().await;
        self.stderr.flush().await;
    }
}
