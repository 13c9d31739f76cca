//! In-process stand-in for a sandbox's linear memory.
//!
//! [`LoopbackAbi`] owns a byte vector that plays the part of linear memory
//! and a [`GuestHeap`] allocator over it.  Its `invoke` hands the request
//! bytes to a host closure and places the framed response back into the
//! heap exactly as a real host would.  It backs the unit tests, the host's
//! end-to-end tests, and the CLI's `call` command.

use std::collections::BTreeMap;

use hookbridge_protocol::HostResponse;
use hookbridge_protocol::frame;

use crate::abi::SandboxAbi;

/// Boxed host closure, for callers that need to name the ABI type.
pub type BoxedHost = Box<dyn FnMut(u32, &[u8]) -> Vec<u8>>;

const ALIGN: u32 = 8;
/// Offsets below this are never handed out so that `0` stays the null pointer.
const HEAP_BASE: u32 = 8;

/// First-fit allocator that tracks every live block.
#[derive(Debug)]
pub struct GuestHeap {
    capacity: u32,
    blocks: BTreeMap<u32, u32>,
    bad_frees: u64,
}

impl GuestHeap {
    /// A heap spanning `capacity` bytes.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            blocks: BTreeMap::new(),
            bad_frees: 0,
        }
    }

    /// Allocate `size` bytes, or return `0` if no gap is large enough.
    pub fn alloc(&mut self, size: u32) -> u32 {
        let size = size.max(1);
        let mut cursor = HEAP_BASE;
        for (&start, &len) in &self.blocks {
            if start.saturating_sub(cursor) >= size {
                break;
            }
            cursor = align_up(start + len);
        }
        match cursor.checked_add(size) {
            Some(end) if end <= self.capacity => {
                self.blocks.insert(cursor, size);
                cursor
            }
            _ => 0,
        }
    }

    /// Release the block starting at `ptr`.  Unknown pointers are counted, not honoured.
    pub fn free(&mut self, ptr: u32) {
        if self.blocks.remove(&ptr).is_none() {
            self.bad_frees += 1;
        }
    }

    /// Number of live blocks.
    pub fn live(&self) -> usize {
        self.blocks.len()
    }

    /// Frees of pointers that were not live (double frees or stray pointers).
    pub fn bad_frees(&self) -> u64 {
        self.bad_frees
    }
}

fn align_up(n: u32) -> u32 {
    n.div_ceil(ALIGN) * ALIGN
}

/// [`SandboxAbi`] over a `Vec<u8>` with a closure playing the host.
pub struct LoopbackAbi<H> {
    memory: Vec<u8>,
    heap: GuestHeap,
    host: H,
    invocations: u64,
}

impl<H> LoopbackAbi<H>
where
    H: FnMut(u32, &[u8]) -> Vec<u8>,
{
    /// Simulated memory of `capacity` bytes served by `host`.
    ///
    /// `host` receives the op code and request envelope bytes and returns
    /// response envelope bytes (unframed).
    pub fn new(capacity: u32, host: H) -> Self {
        Self {
            memory: vec![0; capacity as usize],
            heap: GuestHeap::new(capacity),
            host,
            invocations: 0,
        }
    }

    /// The allocator, for leak assertions.
    pub fn heap(&self) -> &GuestHeap {
        &self.heap
    }

    /// How many times the host entrypoint was called.
    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    fn slice(&self, ptr: u32, len: u32) -> Option<&[u8]> {
        let start = ptr as usize;
        self.memory.get(start..start.checked_add(len as usize)?)
    }
}

impl<H> SandboxAbi for LoopbackAbi<H>
where
    H: FnMut(u32, &[u8]) -> Vec<u8>,
{
    fn alloc(&mut self, size: u32) -> u32 {
        self.heap.alloc(size)
    }

    fn free(&mut self, ptr: u32) {
        self.heap.free(ptr)
    }

    fn memory_size(&self) -> usize {
        self.memory.len()
    }

    fn copy_in(&mut self, ptr: u32, bytes: &[u8]) {
        let start = ptr as usize;
        self.memory[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn copy_out(&self, ptr: u32, out: &mut [u8]) {
        let start = ptr as usize;
        out.copy_from_slice(&self.memory[start..start + out.len()]);
    }

    fn invoke(&mut self, op: u32, ptr: u32, len: u32) -> u32 {
        self.invocations += 1;
        let response = match self.slice(ptr, len).map(<[u8]>::to_vec) {
            Some(request) => (self.host)(op, &request),
            None => {
                HostResponse::invalid_argument("$frame", "request buffer is outside linear memory")
                    .encode()
                    .unwrap_or_default()
            }
        };
        let Ok(framed) = frame::encode_frame(&response) else {
            return 0;
        };
        let Ok(size) = u32::try_from(framed.len()) else {
            return 0;
        };
        let out = self.heap.alloc(size);
        if out != 0 {
            self.copy_in(out, &framed);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_first_fit_reuses_gaps() {
        let mut heap = GuestHeap::new(256);
        let a = heap.alloc(16);
        let b = heap.alloc(16);
        let c = heap.alloc(16);
        assert_eq!(a, HEAP_BASE);
        assert!(a < b && b < c);
        heap.free(b);
        assert_eq!(heap.alloc(8), b);
        assert_eq!(heap.live(), 3);
    }

    #[test]
    fn heap_exhaustion_returns_null() {
        let mut heap = GuestHeap::new(64);
        assert_ne!(heap.alloc(40), 0);
        assert_eq!(heap.alloc(40), 0);
    }

    #[test]
    fn double_free_is_counted() {
        let mut heap = GuestHeap::new(64);
        let p = heap.alloc(4);
        heap.free(p);
        heap.free(p);
        assert_eq!(heap.bad_frees(), 1);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn invoke_frames_host_output() {
        let mut abi = LoopbackAbi::new(512, |op, req: &[u8]| {
            assert_eq!(op, 13);
            req.iter().rev().copied().collect()
        });
        let p = abi.alloc(3);
        abi.copy_in(p, b"abc");
        let r = abi.invoke(13, p, 3);
        assert_ne!(r, 0);
        let mut out = [0u8; 7];
        abi.copy_out(r, &mut out);
        assert_eq!(&out, &[3, 0, 0, 0, b'c', b'b', b'a']);
        assert_eq!(abi.invocations(), 1);
    }

    #[test]
    fn invoke_reports_out_of_bounds_request() {
        let mut abi = LoopbackAbi::new(256, |_, _: &[u8]| unreachable!());
        let r = abi.invoke(3, 250, 100);
        let mut header = [0u8; 4];
        abi.copy_out(r, &mut header);
        let mut body = vec![0u8; frame::body_len(header)];
        abi.copy_out(r + 4, &mut body);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("invalid_argument"));
    }
}
