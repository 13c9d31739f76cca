//! The raw linear-memory ABI between a sandboxed script and the host.
//!
//! [`SandboxAbi`] is the seam every higher layer is written against: it can
//! allocate and free buffers in sandbox memory, copy bytes in and out, and
//! invoke the single host entrypoint.  On `wasm32` the [`wasm`] module binds
//! it to the real `env.host_invoke` import; elsewhere the
//! [`LoopbackAbi`](crate::loopback::LoopbackAbi) simulates it in-process.

/// Primitive operations on sandbox linear memory.
///
/// Pointers are 32-bit offsets into the sandbox's memory; `0` is never a
/// valid allocation and signals failure.
pub trait SandboxAbi {
    /// Allocate `size` bytes, returning the offset or `0` if memory is exhausted.
    fn alloc(&mut self, size: u32) -> u32;

    /// Release a buffer previously returned by [`alloc`](Self::alloc) or by
    /// the host entrypoint.
    fn free(&mut self, ptr: u32);

    /// Current size of linear memory in bytes.
    fn memory_size(&self) -> usize;

    /// Copy `bytes` into memory at `ptr`.  The caller has bounds-checked.
    fn copy_in(&mut self, ptr: u32, bytes: &[u8]);

    /// Copy `out.len()` bytes from `ptr`.  The caller has bounds-checked.
    fn copy_out(&self, ptr: u32, out: &mut [u8]);

    /// Call the host entrypoint with an op code and a request buffer.
    ///
    /// Returns the offset of a length-prefixed response buffer that the
    /// caller now owns, or `0` if the host could not allocate one.
    fn invoke(&mut self, op: u32, ptr: u32, len: u32) -> u32;
}

/// Bindings used when the crate is compiled into a WebAssembly hook module.
#[cfg(target_arch = "wasm32")]
pub mod wasm {
    use std::alloc::{Layout, alloc, dealloc};

    use hookbridge_protocol::frame;
    use serde_json::Value;

    use super::SandboxAbi;
    use crate::error::BridgeError;
    use crate::invocation::Invocation;

    #[link(wasm_import_module = "env")]
    unsafe extern "C" {
        fn host_invoke(op: u32, ptr: u32, len: u32) -> u32;
        fn host_log(level: u32, ptr: u32, len: u32);
    }

    /// Each block stores its total size in front of the returned pointer.
    const HEADER: usize = 8;
    const ALIGN: usize = 8;
    const PAGE: usize = 65_536;

    fn raw_alloc(size: u32) -> u32 {
        let Some(total) = (size as usize).checked_add(HEADER) else {
            return 0;
        };
        let Ok(layout) = Layout::from_size_align(total, ALIGN) else {
            return 0;
        };
        // SAFETY: `layout` has a non-zero size (at least HEADER bytes).
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            return 0;
        }
        // SAFETY: `base` is valid for `total >= HEADER` bytes and 8-aligned.
        unsafe { base.cast::<u64>().write(total as u64) };
        (base as usize + HEADER) as u32
    }

    fn raw_free(ptr: u32) {
        if (ptr as usize) < HEADER {
            return;
        }
        let base = (ptr as usize - HEADER) as *mut u8;
        // SAFETY: `ptr` came from `raw_alloc`, which wrote the size header.
        let total = unsafe { base.cast::<u64>().read() } as usize;
        if let Ok(layout) = Layout::from_size_align(total, ALIGN) {
            // SAFETY: same pointer and layout that `raw_alloc` used.
            unsafe { dealloc(base, layout) };
        }
    }

    /// Exported allocator the host uses to place response buffers.
    #[unsafe(no_mangle)]
    pub extern "C" fn hookbridge_alloc(size: u32) -> u32 {
        raw_alloc(size)
    }

    /// Exported counterpart of [`hookbridge_alloc`].
    #[unsafe(no_mangle)]
    pub extern "C" fn hookbridge_free(ptr: u32) {
        raw_free(ptr)
    }

    /// [`SandboxAbi`] over the module's own linear memory.
    #[derive(Debug, Default)]
    pub struct WasmAbi;

    impl SandboxAbi for WasmAbi {
        fn alloc(&mut self, size: u32) -> u32 {
            raw_alloc(size)
        }

        fn free(&mut self, ptr: u32) {
            raw_free(ptr)
        }

        fn memory_size(&self) -> usize {
            core::arch::wasm32::memory_size::<0>() * PAGE
        }

        fn copy_in(&mut self, ptr: u32, bytes: &[u8]) {
            // SAFETY: the marshaler checked `ptr + bytes.len()` against memory size.
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as usize as *mut u8, bytes.len())
            }
        }

        fn copy_out(&self, ptr: u32, out: &mut [u8]) {
            // SAFETY: the marshaler checked `ptr + out.len()` against memory size.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    ptr as usize as *const u8,
                    out.as_mut_ptr(),
                    out.len(),
                )
            }
        }

        fn invoke(&mut self, op: u32, ptr: u32, len: u32) -> u32 {
            // SAFETY: plain integer arguments; the host validates the range.
            unsafe { host_invoke(op, ptr, len) }
        }
    }

    /// Forward a message to the host's structured log.
    ///
    /// Levels: 0 trace, 1 debug, 2 info, 3 warn, 4 error.
    pub fn log(level: u32, message: &str) {
        // SAFETY: the slice lives for the duration of the call.
        unsafe { host_log(level, message.as_ptr() as u32, message.len() as u32) }
    }

    /// Body of an exported `hookbridge_run(ptr, len) -> ptr` entrypoint.
    ///
    /// Decodes the trigger JSON at `ptr`, runs `hook` inside a fresh
    /// [`Invocation`], and returns a framed response envelope that the host
    /// reads and frees.  Returns `0` only when the response itself cannot be
    /// allocated.
    pub fn run_hook<F>(ptr: u32, len: u32, hook: F) -> u32
    where
        F: FnOnce(&Invocation<WasmAbi>, Value) -> Result<Value, BridgeError>,
    {
        let mut input = vec![0u8; len as usize];
        WasmAbi.copy_out(ptr, &mut input);

        let response = match serde_json::from_slice::<Value>(&input) {
            Ok(trigger) => {
                let invocation = Invocation::new(WasmAbi);
                let outcome = hook(&invocation, trigger);
                let cleanup = invocation.finish();
                match (outcome, cleanup) {
                    (Ok(value), Ok(())) => hookbridge_protocol::HostResponse::ok(value),
                    (Err(err), _) | (Ok(_), Err(err)) => err.to_response(),
                }
            }
            Err(e) => hookbridge_protocol::HostResponse::invalid_argument(
                "$",
                format!("trigger is not JSON: {e}"),
            ),
        };

        let Ok(body) = response.encode() else {
            return 0;
        };
        let Ok(framed) = frame::encode_frame(&body) else {
            return 0;
        };
        let Ok(size) = u32::try_from(framed.len()) else {
            return 0;
        };
        let out = raw_alloc(size);
        if out != 0 {
            WasmAbi.copy_in(out, &framed);
        }
        out
    }
}

/// Export a hook function as the module's `hookbridge_run` entrypoint.
///
/// ```ignore
/// fn on_request(inv: &Invocation<WasmAbi>, trigger: Value) -> Result<Value, BridgeError> {
///     inv.call(OpCode::KvGet, payload)
/// }
/// hookbridge_guest::export_hook!(on_request);
/// ```
#[macro_export]
macro_rules! export_hook {
    ($hook:path) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn hookbridge_run(ptr: u32, len: u32) -> u32 {
            $crate::abi::wasm::run_hook(ptr, len, $hook)
        }
    };
}
