//! Hook runtime.
//!
//! [`HookRuntime`] is the entry point for loading and running sandboxed hook
//! modules.  It owns the wasmtime [`Engine`], the [`SandboxConfig`] limits,
//! the [`ModuleRegistry`], the [`Host`] every module calls into, and the
//! [`InvocationMetrics`] every invocation reports to.
//!
//! [`HookRuntime::prepare`] hands out a [`PreparedHook`] that owns cheap
//! clones of the engine and the compiled module, so the runtime can be
//! locked only long enough to look a module up.  Each invocation gets a
//! fresh [`Store`] whose [`HostState`] carries its own host session, memory
//! limiter and in-flight flag, so no mutable state is shared between
//! concurrent invocations.

use std::sync::Arc;
use std::time::Instant;

use hookbridge_protocol::frame::{self, FRAME_HEADER_LEN};
use hookbridge_protocol::{ErrorKind, HostResponse};
use serde::Serialize;
use serde_json::Value;
use wasmtime::{
    Caller, Engine, Extern, Instance, Linker, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder, Trap, TypedFunc,
};

use crate::config::SandboxConfig;
use crate::error::{HostError, Result};
use crate::host::Host;
use crate::metrics::{InvocationMetrics, Outcome};
use crate::modules::{
    ALLOC_EXPORT, FREE_EXPORT, MEMORY_EXPORT, ModuleInfo, ModuleRegistry, RUN_EXPORT,
};
use crate::registry::Dispatcher;
use crate::session::Session;
use crate::trigger::Trigger;

/// Per-invocation state stored in the wasmtime [`Store`].
struct HostState {
    module: String,
    session: Arc<Session>,
    dispatcher: Arc<Dispatcher>,
    limits: StoreLimits,
    /// Set while `host_invoke` is serving a call.
    in_flight: bool,
}

/// Result of one hook invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookOutput {
    /// The `ok` payload the hook returned.
    pub value: Value,
    pub fuel_consumed: u64,
    /// Host calls the hook made, including rejected ones.
    pub host_calls: u64,
}

/// Rolls back whatever the session left open, however the invocation ends.
struct SessionGuard<'a> {
    host: &'a Host,
    session: Arc<Session>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.host.end_session(&self.session);
    }
}

struct HookExports {
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
    run: TypedFunc<(i32, i32), i32>,
}

/// The WebAssembly hook runtime.
pub struct HookRuntime {
    engine: Engine,
    config: SandboxConfig,
    modules: ModuleRegistry,
    host: Arc<Host>,
    metrics: Arc<InvocationMetrics>,
}

impl HookRuntime {
    /// Create a runtime whose limits come from the host's `[sandbox]` config.
    pub fn new(host: Arc<Host>) -> Result<Self> {
        let config = host.config().sandbox.clone();
        let mut wasm_config = wasmtime::Config::new();
        wasm_config.consume_fuel(true);
        wasm_config.wasm_memory64(false);

        let engine = Engine::new(&wasm_config)
            .map_err(|e| HostError::Compilation(format!("failed to create wasm engine: {e}")))?;

        tracing::info!(
            max_fuel = config.max_fuel,
            max_memory = config.max_memory,
            "hook runtime initialized"
        );

        Ok(Self {
            engine,
            config,
            modules: ModuleRegistry::new(),
            host,
            metrics: Arc::new(InvocationMetrics::new()),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Invocation counters, overall and per module.
    pub fn metrics(&self) -> &Arc<InvocationMetrics> {
        &self.metrics
    }

    /// Compile and register a module.
    pub fn load_module(&mut self, name: &str, wasm_bytes: &[u8]) -> Result<&ModuleInfo> {
        self.modules.load(name, wasm_bytes, &self.engine)
    }

    pub fn list_modules(&self) -> Vec<&ModuleInfo> {
        self.modules.list()
    }

    pub fn unload_module(&mut self, name: &str) -> Result<()> {
        self.modules.unload(name)?;
        self.metrics.forget(name);
        Ok(())
    }

    /// Owned handle for invoking module `name` without borrowing the runtime.
    pub fn prepare(&self, name: &str) -> Result<PreparedHook> {
        let loaded = self
            .modules
            .get_loaded(name)
            .ok_or_else(|| HostError::Module {
                reason: format!("module '{name}' not found"),
            })?;
        Ok(PreparedHook {
            name: name.to_owned(),
            engine: self.engine.clone(),
            module: loaded.module.clone(),
            config: self.config.clone(),
            host: Arc::clone(&self.host),
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Run module `name` for `trigger`.
    pub fn invoke_trigger(&self, name: &str, trigger: &Trigger) -> Result<HookOutput> {
        self.prepare(name)?.invoke_trigger(trigger)
    }

    /// Run module `name` with `input` as its trigger JSON.
    pub fn invoke(&self, name: &str, input: &Value) -> Result<HookOutput> {
        self.prepare(name)?.invoke(input)
    }
}

/// A loaded module ready to run, detached from the [`HookRuntime`].
#[derive(Clone)]
pub struct PreparedHook {
    name: String,
    engine: Engine,
    module: Module,
    config: SandboxConfig,
    host: Arc<Host>,
    metrics: Arc<InvocationMetrics>,
}

impl PreparedHook {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke_trigger(&self, trigger: &Trigger) -> Result<HookOutput> {
        tracing::debug!(module = %self.name, trigger = trigger.kind(), "dispatching trigger");
        self.invoke(&serde_json::to_value(trigger)?)
    }

    /// Run the hook with `input` as its trigger JSON and record the outcome.
    ///
    /// 1. Instantiate the module in a fresh store with fuel and a memory cap.
    /// 2. Copy the input into a guest buffer from `hookbridge_alloc`.
    /// 3. Call `hookbridge_run` and read the length-prefixed response.
    /// 4. Free both buffers and end the session, rolling back any transaction
    ///    the hook left open.
    pub fn invoke(&self, input: &Value) -> Result<HookOutput> {
        let started = Instant::now();
        let session = self.host.open_session();
        let result = {
            let _guard = SessionGuard {
                host: &self.host,
                session: Arc::clone(&session),
            };
            self.run(&session, input)
        };

        let fuel_consumed = match &result {
            Ok(output) => output.fuel_consumed,
            Err(HostError::OutOfFuel { limit }) => *limit,
            Err(_) => 0,
        };
        self.metrics.record(
            &self.name,
            Outcome::of(&result),
            started.elapsed(),
            fuel_consumed,
            session.calls(),
        );
        result
    }

    fn run(&self, session: &Arc<Session>, input: &Value) -> Result<HookOutput> {
        let name = self.name.as_str();
        tracing::debug!(module = name, session = session.id(), "invoking hook");

        let state = HostState {
            module: name.to_owned(),
            session: Arc::clone(session),
            dispatcher: Arc::clone(self.host.dispatcher()),
            limits: StoreLimitsBuilder::new()
                .memory_size(self.config.max_memory)
                .build(),
            in_flight: false,
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(self.config.max_fuel)
            .map_err(|e| HostError::Execution(e.to_string()))?;

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        Self::define_host_functions(&mut linker)?;
        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| self.classify(e, HostError::Instantiation))?;
        let exports = Self::exports(&mut store, &instance)?;

        let input = serde_json::to_vec(input)?;
        let input_len = i32::try_from(input.len()).map_err(|_| {
            HostError::Execution(format!("trigger of {} bytes is too large", input.len()))
        })?;
        let input_ptr = exports
            .alloc
            .call(&mut store, input_len)
            .map_err(|e| self.classify(e, HostError::Trap))?;
        if input_ptr == 0 {
            return Err(HostError::Execution(
                "guest could not allocate the trigger buffer".into(),
            ));
        }
        exports
            .memory
            .write(&mut store, input_ptr as u32 as usize, &input)
            .map_err(|e| HostError::Execution(format!("trigger buffer out of bounds: {e}")))?;

        let output_ptr = exports
            .run
            .call(&mut store, (input_ptr, input_len))
            .map_err(|e| self.classify(e, HostError::Trap))?;
        exports
            .free
            .call(&mut store, input_ptr)
            .map_err(|e| self.classify(e, HostError::Trap))?;
        if output_ptr == 0 {
            return Err(HostError::Execution(
                "hook returned no response buffer".into(),
            ));
        }

        let body = self.read_frame(&store, &exports.memory, output_ptr as u32 as usize)?;
        exports
            .free
            .call(&mut store, output_ptr)
            .map_err(|e| self.classify(e, HostError::Trap))?;

        let fuel_consumed = self
            .config
            .max_fuel
            .saturating_sub(store.get_fuel().unwrap_or(0));
        let host_calls = session.calls();
        let response = HostResponse::decode(&body).map_err(|e| {
            HostError::Execution(format!("hook returned a malformed envelope: {e}"))
        })?;

        match response.into_result() {
            Ok(value) => {
                tracing::info!(module = name, fuel_consumed, host_calls, "hook completed");
                Ok(HookOutput {
                    value,
                    fuel_consumed,
                    host_calls,
                })
            }
            Err(body) => {
                tracing::warn!(
                    module = name,
                    kind = %body.kind,
                    error = %body.message,
                    "hook failed"
                );
                Err(HostError::Guest(body))
            }
        }
    }

    fn exports(store: &mut Store<HostState>, instance: &Instance) -> Result<HookExports> {
        let missing = |what: &str, e: wasmtime::Error| HostError::Module {
            reason: format!("missing {what} export: {e}"),
        };
        Ok(HookExports {
            memory: instance
                .get_memory(&mut *store, MEMORY_EXPORT)
                .ok_or_else(|| HostError::Execution("module has no exported memory".into()))?,
            alloc: instance
                .get_typed_func(&mut *store, ALLOC_EXPORT)
                .map_err(|e| missing(ALLOC_EXPORT, e))?,
            free: instance
                .get_typed_func(&mut *store, FREE_EXPORT)
                .map_err(|e| missing(FREE_EXPORT, e))?,
            run: instance
                .get_typed_func(&mut *store, RUN_EXPORT)
                .map_err(|e| missing(RUN_EXPORT, e))?,
        })
    }

    fn read_frame(
        &self,
        store: &Store<HostState>,
        memory: &Memory,
        ptr: usize,
    ) -> Result<Vec<u8>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        memory
            .read(store, ptr, &mut header)
            .map_err(|e| HostError::Execution(format!("response header out of bounds: {e}")))?;
        let len = frame::body_len(header);
        frame::check_len(len, self.config.max_frame_len)
            .map_err(|e| HostError::Execution(e.to_string()))?;
        let mut body = vec![0u8; len];
        memory
            .read(store, ptr + FRAME_HEADER_LEN, &mut body)
            .map_err(|e| HostError::Execution(format!("response body out of bounds: {e}")))?;
        Ok(body)
    }

    /// Map a wasmtime error, recognising fuel exhaustion.
    fn classify(&self, err: wasmtime::Error, otherwise: fn(String) -> HostError) -> HostError {
        match err.downcast_ref::<Trap>() {
            Some(Trap::OutOfFuel) => HostError::OutOfFuel {
                limit: self.config.max_fuel,
            },
            _ => otherwise(format!("{err:#}")),
        }
    }

    /// Define the `env` imports hook modules call.
    fn define_host_functions(linker: &mut Linker<HostState>) -> Result<()> {
        linker
            .func_wrap(
                "env",
                "host_invoke",
                |mut caller: Caller<'_, HostState>,
                 op: i32,
                 ptr: i32,
                 len: i32|
                 -> wasmtime::Result<i32> {
                    host_invoke(&mut caller, op as u32, ptr as u32, len as u32).map(|p| p as i32)
                },
            )
            .map_err(|e| HostError::Instantiation(e.to_string()))?;

        linker
            .func_wrap(
                "env",
                "host_log",
                |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
                    let Some(memory) = guest_memory(&mut caller) else {
                        return;
                    };
                    let data = memory.data(&caller);
                    let start = ptr as u32 as usize;
                    let Some(bytes) = start
                        .checked_add(len as u32 as usize)
                        .and_then(|end| data.get(start..end))
                    else {
                        return;
                    };
                    let msg = String::from_utf8_lossy(bytes);
                    let module = caller.data().module.as_str();
                    match level {
                        0 => tracing::trace!(module, hook_msg = %msg),
                        1 => tracing::debug!(module, hook_msg = %msg),
                        2 => tracing::info!(module, hook_msg = %msg),
                        3 => tracing::warn!(module, hook_msg = %msg),
                        _ => tracing::error!(module, hook_msg = %msg),
                    }
                },
            )
            .map_err(|e| HostError::Instantiation(e.to_string()))?;

        Ok(())
    }
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    match caller.get_export(MEMORY_EXPORT) {
        Some(Extern::Memory(m)) => Some(m),
        _ => None,
    }
}

/// Serve one `host_invoke` call and return the guest pointer of the framed
/// response, or `0` when the guest could not allocate it.
fn host_invoke(
    caller: &mut Caller<'_, HostState>,
    op: u32,
    ptr: u32,
    len: u32,
) -> wasmtime::Result<u32> {
    let memory = guest_memory(caller)
        .ok_or_else(|| wasmtime::Error::msg("hook module has no exported memory"))?;

    if caller.data().in_flight {
        // Nested call from inside the guest allocator.  The outer call keeps
        // the flag; this one only gets a rejection.
        caller.data().session.record_call();
        tracing::warn!(module = %caller.data().module, op, "reentrant host_invoke rejected");
        let body = HostResponse::error(
            ErrorKind::Reentrancy,
            "host_invoke called while another host call is in flight",
        )
        .encode()?;
        return write_response(caller, &memory, &body);
    }

    caller.data_mut().in_flight = true;
    let outcome = serve(caller, &memory, op, ptr, len);
    caller.data_mut().in_flight = false;
    outcome
}

fn serve(
    caller: &mut Caller<'_, HostState>,
    memory: &Memory,
    op: u32,
    ptr: u32,
    len: u32,
) -> wasmtime::Result<u32> {
    let start = ptr as usize;
    let request = start
        .checked_add(len as usize)
        .and_then(|end| memory.data(&*caller).get(start..end))
        .map(<[u8]>::to_vec);

    let body = match request {
        Some(request) => {
            let dispatcher = Arc::clone(&caller.data().dispatcher);
            let session = Arc::clone(&caller.data().session);
            dispatcher.dispatch(op, &request, &session)
        }
        None => {
            caller.data().session.record_call();
            HostResponse::invalid_argument(
                "$frame",
                format!(
                    "request [{ptr}, {ptr}+{len}) is outside linear memory of {} bytes",
                    memory.data_size(&*caller)
                ),
            )
            .encode()?
        }
    };
    write_response(caller, memory, &body)
}

/// Frame `body`, place it in a buffer from the guest allocator, and return its pointer.
fn write_response(
    caller: &mut Caller<'_, HostState>,
    memory: &Memory,
    body: &[u8],
) -> wasmtime::Result<u32> {
    let framed = frame::encode_frame(body)?;
    let size = i32::try_from(framed.len())?;
    let alloc = match caller.get_export(ALLOC_EXPORT) {
        Some(Extern::Func(f)) => f.typed::<i32, i32>(&*caller)?,
        _ => return Err(wasmtime::Error::msg("hook module has no allocator export")),
    };
    let ptr = alloc.call(&mut *caller, size)? as u32;
    if ptr == 0 {
        tracing::warn!(module = %caller.data().module, size, "guest allocator exhausted");
        return Ok(0);
    }
    memory.write(&mut *caller, ptr as usize, &framed)?;
    Ok(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> HookRuntime {
        HookRuntime::new(Arc::new(Host::in_memory().unwrap())).unwrap()
    }

    #[test]
    fn limits_come_from_host_config() {
        let host = Host::new(crate::HostConfig::new().with_max_fuel(42)).unwrap();
        let rt = HookRuntime::new(Arc::new(host)).unwrap();
        assert_eq!(rt.config().max_fuel, 42);
    }

    #[test]
    fn invoke_missing_module_is_error() {
        let rt = runtime();
        let err = rt.invoke("nonexistent", &Value::Null).unwrap_err();
        assert!(matches!(err, HostError::Module { .. }));
    }

    #[test]
    fn prepare_detaches_from_the_runtime() {
        let wasm = wat::parse_str(
            r#"(module
                 (memory (export "memory") 1)
                 (func (export "hookbridge_alloc") (param i32) (result i32) i32.const 8)
                 (func (export "hookbridge_free") (param i32))
                 (func (export "hookbridge_run") (param i32 i32) (result i32) unreachable))"#,
        )
        .unwrap();
        let mut rt = runtime();
        rt.load_module("trap", &wasm).unwrap();
        let hook = rt.prepare("trap").unwrap();
        rt.unload_module("trap").unwrap();

        assert_eq!(hook.name(), "trap");
        assert!(matches!(hook.invoke(&Value::Null), Err(HostError::Trap(_))));
        assert_eq!(rt.metrics().overall().trap, 1);
        assert!(matches!(rt.prepare("trap"), Err(HostError::Module { .. })));
    }

    #[test]
    fn load_invalid_wasm() {
        let mut rt = runtime();
        assert!(rt.load_module("bad", b"garbage bytes").is_err());
        assert!(rt.list_modules().is_empty());
    }
}
