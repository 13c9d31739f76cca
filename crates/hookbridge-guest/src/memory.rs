//! Buffer marshaling over sandbox linear memory.
//!
//! [`Marshaler`] wraps a [`SandboxAbi`] with bounds checks and allocation
//! accounting.  Every buffer it hands out is a [`MemoryHandle`] that frees
//! itself on drop, so each call path (success or any failure) releases
//! exactly the buffers it allocated or adopted.

use std::cell::{Cell, Ref, RefCell};

use hookbridge_protocol::frame::{self, FRAME_HEADER_LEN};
use hookbridge_protocol::{DEFAULT_MAX_FRAME_LEN, OpCode};

use crate::abi::SandboxAbi;
use crate::error::{BridgeError, Result};

/// Running allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Buffers allocated by the marshaler or adopted from the host.
    pub allocations: u64,
    /// Buffers released.
    pub frees: u64,
}

impl MemoryStats {
    /// Buffers not yet released.
    pub fn outstanding(&self) -> u64 {
        self.allocations - self.frees
    }
}

/// Bounds-checked access to sandbox memory.
pub struct Marshaler<A: SandboxAbi> {
    abi: RefCell<A>,
    max_frame_len: usize,
    stats: Cell<MemoryStats>,
}

/// An owned buffer in sandbox memory, released on drop.
pub struct MemoryHandle<'m, A: SandboxAbi> {
    owner: &'m Marshaler<A>,
    ptr: u32,
    len: u32,
}

impl<A: SandboxAbi> MemoryHandle<'_, A> {
    /// Offset of the buffer.
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    /// Usable length of the buffer in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the buffer has zero usable bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<A: SandboxAbi> Drop for MemoryHandle<'_, A> {
    fn drop(&mut self) {
        self.owner.release(self.ptr);
    }
}

impl<A: SandboxAbi> Marshaler<A> {
    /// Wrap `abi` with the default frame size cap.
    pub fn new(abi: A) -> Self {
        Self {
            abi: RefCell::new(abi),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            stats: Cell::new(MemoryStats::default()),
        }
    }

    /// Override the largest response body accepted from the host.
    #[must_use]
    pub fn with_max_frame_len(mut self, limit: usize) -> Self {
        self.max_frame_len = limit;
        self
    }

    /// Largest response body accepted from the host.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Snapshot of the allocation counters.
    pub fn stats(&self) -> MemoryStats {
        self.stats.get()
    }

    /// Borrow the underlying ABI.
    ///
    /// Panics if called while a host call is in flight.
    pub fn abi(&self) -> Ref<'_, A> {
        self.abi.borrow()
    }

    /// Allocate a buffer of `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<MemoryHandle<'_, A>> {
        let len = u32::try_from(size).map_err(|_| {
            BridgeError::OutOfMemory(format!("{size} bytes exceeds the 32-bit address space"))
        })?;
        let ptr = self.abi.borrow_mut().alloc(len);
        if ptr == 0 {
            return Err(BridgeError::OutOfMemory(format!(
                "could not allocate {size} bytes in sandbox memory"
            )));
        }
        let handle = self.adopt(ptr, len);
        if !self.in_bounds(ptr, size) {
            return Err(BridgeError::OutOfMemory(format!(
                "allocator returned {ptr:#x} for {size} bytes outside linear memory"
            )));
        }
        Ok(handle)
    }

    /// Copy `bytes` into the start of `handle`.
    pub fn write(&self, handle: &MemoryHandle<'_, A>, bytes: &[u8]) -> Result<()> {
        if bytes.len() > handle.len as usize {
            return Err(BridgeError::invalid(
                "$",
                format!(
                    "{} bytes do not fit a {}-byte buffer",
                    bytes.len(),
                    handle.len
                ),
            ));
        }
        self.abi.borrow_mut().copy_in(handle.ptr, bytes);
        Ok(())
    }

    /// Copy `len` bytes out of memory starting at `ptr`.
    pub fn read(&self, ptr: u32, len: usize) -> Result<Vec<u8>> {
        if !self.in_bounds(ptr, len) {
            return Err(BridgeError::MalformedResponse(format!(
                "read of {len} bytes at {ptr:#x} is outside linear memory"
            )));
        }
        let mut out = vec![0u8; len];
        self.abi.borrow().copy_out(ptr, &mut out);
        Ok(out)
    }

    /// Invoke the host with `request` and adopt the returned response buffer.
    pub fn invoke(&self, op: OpCode, request: &MemoryHandle<'_, A>) -> Result<MemoryHandle<'_, A>> {
        let ptr = self
            .abi
            .borrow_mut()
            .invoke(op.code(), request.ptr, request.len);
        if ptr == 0 {
            return Err(BridgeError::OutOfMemory(
                "host could not allocate a response buffer".into(),
            ));
        }

        // A header outside memory means the pointer is not ours to free.
        let header = self.read(ptr, FRAME_HEADER_LEN)?;
        let mut raw = [0u8; FRAME_HEADER_LEN];
        raw.copy_from_slice(&header);
        let body_len = frame::body_len(raw);

        let total = FRAME_HEADER_LEN.saturating_add(body_len);
        let handle = self.adopt(ptr, u32::try_from(total).unwrap_or(u32::MAX));
        Ok(handle)
    }

    /// Read the body of a length-prefixed response buffer.
    pub fn read_frame(&self, handle: &MemoryHandle<'_, A>) -> Result<Vec<u8>> {
        let body_len = (handle.len as usize).saturating_sub(FRAME_HEADER_LEN);
        frame::check_len(body_len, self.max_frame_len)?;
        let body_ptr = handle.ptr.checked_add(FRAME_HEADER_LEN as u32).ok_or_else(|| {
            BridgeError::MalformedResponse("response buffer overflows address space".into())
        })?;
        self.read(body_ptr, body_len)
    }

    fn adopt(&self, ptr: u32, len: u32) -> MemoryHandle<'_, A> {
        let mut stats = self.stats.get();
        stats.allocations += 1;
        self.stats.set(stats);
        MemoryHandle {
            owner: self,
            ptr,
            len,
        }
    }

    fn release(&self, ptr: u32) {
        self.abi.borrow_mut().free(ptr);
        let mut stats = self.stats.get();
        stats.frees += 1;
        self.stats.set(stats);
    }

    fn in_bounds(&self, ptr: u32, len: usize) -> bool {
        (ptr as usize)
            .checked_add(len)
            .is_some_and(|end| end <= self.abi.borrow().memory_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackAbi;

    fn echo(_op: u32, request: &[u8]) -> Vec<u8> {
        request.to_vec()
    }

    #[test]
    fn allocate_and_drop_balances() {
        let memory = Marshaler::new(LoopbackAbi::new(1024, echo));
        {
            let a = memory.allocate(16).unwrap();
            let b = memory.allocate(32).unwrap();
            assert_ne!(a.ptr(), b.ptr());
            assert_eq!(memory.stats().outstanding(), 2);
        }
        assert_eq!(memory.stats().outstanding(), 0);
        assert_eq!(memory.abi().heap().live(), 0);
    }

    #[test]
    fn allocation_failure_is_out_of_memory() {
        let memory = Marshaler::new(LoopbackAbi::new(64, echo));
        let err = memory.allocate(4096).err().unwrap();
        assert!(matches!(err, BridgeError::OutOfMemory(_)));
        assert_eq!(memory.stats().allocations, 0);
    }

    #[test]
    fn write_then_read() {
        let memory = Marshaler::new(LoopbackAbi::new(1024, echo));
        let buf = memory.allocate(5).unwrap();
        memory.write(&buf, b"hello").unwrap();
        assert_eq!(memory.read(buf.ptr(), 5).unwrap(), b"hello");
    }

    #[test]
    fn write_larger_than_buffer_is_rejected() {
        let memory = Marshaler::new(LoopbackAbi::new(1024, echo));
        let buf = memory.allocate(2).unwrap();
        assert!(memory.write(&buf, b"hello").is_err());
    }

    #[test]
    fn out_of_bounds_read_is_malformed() {
        let memory = Marshaler::new(LoopbackAbi::new(128, echo));
        let err = memory.read(120, 64).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedResponse(_)));
    }

    #[test]
    fn invoke_adopts_response_frame() {
        let memory = Marshaler::new(LoopbackAbi::new(1024, echo));
        let request = memory.allocate(3).unwrap();
        memory.write(&request, b"abc").unwrap();
        let response = memory.invoke(OpCode::Utils, &request).unwrap();
        assert_eq!(memory.read_frame(&response).unwrap(), b"abc");
        drop(response);
        drop(request);
        assert_eq!(memory.stats().outstanding(), 0);
        assert_eq!(memory.abi().heap().live(), 0);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let memory = Marshaler::new(LoopbackAbi::new(1024, echo)).with_max_frame_len(2);
        let request = memory.allocate(3).unwrap();
        memory.write(&request, b"abc").unwrap();
        let response = memory.invoke(OpCode::Utils, &request).unwrap();
        assert!(memory.read_frame(&response).is_err());
    }
}
