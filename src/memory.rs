// Executable memory for linked code. JitMemory maps anonymous read/write pages with mmap,
// lets the linker copy section contents and patch relocations, then flips the code prefix to
// read/execute with mprotect. Data that follows the code stays writable. MemoryManager owns
// every mapping on behalf of the resource tracker that caused it, so removing the tracker
// unmaps the code it produced.

//! Page-granular executable memory and its per-tracker bookkeeping.

use crate::core::error::{JitError, JitResult};
use crate::orc::tracker::{ResourceManager, TrackerKey};
use hashbrown::HashMap;
use parking_lot::Mutex;

/// Host page size.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

pub fn align_to_page(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// An mmap'd region. Writable until [`make_executable`](Self::make_executable).
pub struct JitMemory {
    ptr: *mut u8,
    size: usize,
    executable_len: usize,
}

// The region is only written before it is published; afterwards it is
// read and executed concurrently.
unsafe impl Send for JitMemory {}
unsafe impl Sync for JitMemory {}

impl JitMemory {
    /// Map at least `size` bytes of read/write memory.
    pub fn allocate(size: usize) -> JitResult<Self> {
        let aligned_size = align_to_page(size.max(1));

        #[cfg(unix)]
        {
            use libc::{mmap, MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};

            let ptr = unsafe {
                mmap(
                    std::ptr::null_mut(),
                    aligned_size,
                    PROT_READ | PROT_WRITE,
                    MAP_ANONYMOUS | MAP_PRIVATE,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(JitError::Io {
                    path: "<jit memory>".to_string(),
                    message: format!("mmap of {aligned_size} bytes failed"),
                });
            }

            log::trace!("mapped {} bytes at {:p}", aligned_size, ptr);
            Ok(Self {
                ptr: ptr as *mut u8,
                size: aligned_size,
                executable_len: 0,
            })
        }

        #[cfg(not(unix))]
        {
            Err(JitError::Io {
                path: "<jit memory>".to_string(),
                message: format!(
                    "executable memory is not supported on this platform ({aligned_size} bytes requested)"
                ),
            })
        }
    }

    pub fn base(&self) -> u64 {
        self.ptr as usize as u64
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_executable(&self) -> bool {
        self.executable_len > 0
    }

    /// Copy `bytes` to `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> JitResult<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.size)
            .ok_or_else(|| JitError::Io {
                path: "<jit memory>".to_string(),
                message: format!(
                    "write of {} bytes at offset {} exceeds region of {} bytes",
                    bytes.len(),
                    offset,
                    self.size
                ),
            })?;
        if offset < self.executable_len {
            return Err(JitError::Io {
                path: "<jit memory>".to_string(),
                message: "write into executable pages".to_string(),
            });
        }
        debug_assert!(end <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    /// Read back a little-endian u64, used to check patched slots.
    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        if offset + 8 > self.size {
            return None;
        }
        let mut buf = [0u8; 8];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), buf.as_mut_ptr(), 8);
        }
        Some(u64::from_le_bytes(buf))
    }

    /// Make the first `code_len` bytes (rounded up to pages) read/execute.
    pub fn make_executable(&mut self, code_len: usize) -> JitResult<()> {
        let len = align_to_page(code_len).min(self.size);
        if len == 0 {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use libc::{mprotect, PROT_EXEC, PROT_READ};

            let result = unsafe { mprotect(self.ptr as *mut libc::c_void, len, PROT_READ | PROT_EXEC) };
            if result != 0 {
                return Err(JitError::Io {
                    path: "<jit memory>".to_string(),
                    message: format!("mprotect of {len} bytes failed"),
                });
            }
            self.executable_len = len;
            Ok(())
        }

        #[cfg(not(unix))]
        {
            Err(JitError::Io {
                path: "<jit memory>".to_string(),
                message: "making memory executable is not supported on this platform".to_string(),
            })
        }
    }
}

impl Drop for JitMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
        log::trace!("unmapped {} bytes at {:p}", self.size, self.ptr);
    }
}

/// Owns linked memory on behalf of resource trackers.
#[derive(Default)]
pub struct MemoryManager {
    allocations: Mutex<HashMap<TrackerKey, Vec<JitMemory>>>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `memory` to `key`, returning a token to undo the attachment.
    pub fn record(&self, key: TrackerKey, memory: JitMemory) -> u64 {
        let base = memory.base();
        self.allocations.lock().entry(key).or_default().push(memory);
        base
    }

    /// Detach and free a mapping recorded with [`record`](Self::record).
    pub fn discard(&self, key: TrackerKey, base: u64) {
        let mut allocations = self.allocations.lock();
        if let Some(list) = allocations.get_mut(&key) {
            list.retain(|m| m.base() != base);
            if list.is_empty() {
                allocations.remove(&key);
            }
        }
    }

    /// Bytes mapped for `key`.
    pub fn bytes_for(&self, key: TrackerKey) -> usize {
        self.allocations
            .lock()
            .get(&key)
            .map(|list| list.iter().map(JitMemory::len).sum())
            .unwrap_or(0)
    }

    pub fn total_bytes(&self) -> usize {
        self.allocations
            .lock()
            .values()
            .flat_map(|list| list.iter().map(JitMemory::len))
            .sum()
    }
}

impl ResourceManager for MemoryManager {
    fn release(&self, key: TrackerKey) {
        let released = self.allocations.lock().remove(&key);
        if let Some(list) = released {
            log::debug!("releasing {} mapping(s) for tracker {}", list.len(), key);
        }
    }

    fn release_all(&self) {
        let all: Vec<_> = self.allocations.lock().drain().collect();
        log::debug!("releasing memory of {} tracker(s)", all.len());
    }
}
