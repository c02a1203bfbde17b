//! POSIX shared memory management.
//!
//! Thin wrapper around `shm_open` + `mmap` with owner-side unlink on drop.
//! The gateway creates the object; workers open the existing one.

use memmap2::MmapMut;
use nix::fcntl::OFlag;
use nix::sys::mman::shm_unlink;
use nix::sys::stat::Mode;
use spindle_common::{Result, SpindleError};
use std::fs::File;

/// A named region of shared memory mapped read-write.
pub struct SharedMemory {
    name: String,
    mmap: MmapMut,
    is_owner: bool,
}

// The mapping is shared between processes by design; all intra-process
// aliasing goes through atomics or protocol-serialized windows.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new shared memory object and map it.
    ///
    /// Fails if the name already exists; callers are expected to have
    /// unlinked stale objects first. The creator owns the name and unlinks
    /// it on drop.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let fd = nix::sys::mman::shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| SpindleError::ipc(format!("shm_open({}) failed: {}", name, e)))?;

        nix::unistd::ftruncate(&fd, size as i64).map_err(|e| {
            let _ = shm_unlink(name);
            SpindleError::ipc(format!("ftruncate({}) failed: {}", name, e))
        })?;

        let file = File::from(fd);
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
            let _ = shm_unlink(name);
            SpindleError::ipc(format!("mmap({}) failed: {}", name, e))
        })?;

        Ok(Self {
            name: name.to_string(),
            mmap,
            is_owner: true,
        })
    }

    /// Open and map an existing shared memory object.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        let fd = nix::sys::mman::shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| SpindleError::ipc(format!("shm_open({}) failed: {}", name, e)))?;

        let file = File::from(fd);
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| SpindleError::ipc(format!("mmap({}) failed: {}", name, e)))?;

        if mmap.len() < size {
            return Err(SpindleError::ipc(format!(
                "shared memory {} is {} bytes, expected at least {}",
                name,
                mmap.len(),
                size
            )));
        }

        Ok(Self {
            name: name.to_string(),
            mmap,
            is_owner: false,
        })
    }

    /// Remove a leftover object from a previous run. Missing names are fine.
    pub fn unlink_stale(name: &str) {
        let _ = shm_unlink(name);
    }

    /// Base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Whether the mapping is empty (never true for a mapped region).
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if self.is_owner {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_open() {
        let name = format!("/spindle_shm_test_{}", std::process::id());
        let size = 4096;

        let owner = SharedMemory::create(&name, size).unwrap();
        assert!(owner.len() >= size);

        unsafe { std::ptr::write_volatile(owner.as_ptr(), 42u8) };

        let other = SharedMemory::open(&name, size).unwrap();
        let value = unsafe { std::ptr::read_volatile(other.as_ptr()) };
        assert_eq!(value, 42u8);

        drop(other);
        drop(owner);

        // The owner unlinked the name on drop.
        assert!(SharedMemory::open(&name, size).is_err());
    }

    #[test]
    fn test_create_refuses_existing_name() {
        let name = format!("/spindle_shm_dup_{}", std::process::id());
        let owner = SharedMemory::create(&name, 4096).unwrap();
        assert!(SharedMemory::create(&name, 4096).is_err());
        drop(owner);
    }

    #[test]
    fn test_unlink_stale_is_idempotent() {
        let name = format!("/spindle_shm_stale_{}", std::process::id());
        SharedMemory::unlink_stale(&name);

        let owner = SharedMemory::create(&name, 4096).unwrap();
        drop(owner);
        SharedMemory::unlink_stale(&name);
    }
}
