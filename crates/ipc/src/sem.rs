//! Named POSIX counting semaphores.
//!
//! `libc` is used directly because `sem_open` and friends have no safe
//! wrapper in the ecosystem crates this workspace already carries. Every
//! syscall result is translated into an error value; nothing here panics.

use spindle_common::{Result, SpindleError};
use std::ffi::CString;
use std::time::Duration;

/// A named counting semaphore shared between processes.
///
/// The creator owns the kernel name and unlinks it on drop; openers only
/// close their handle.
pub struct NamedSemaphore {
    name: CString,
    sem: *mut libc::sem_t,
    is_owner: bool,
}

// sem_t handles are process-shared kernel objects; the raw pointer is only
// non-Send by default because it is a pointer.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a new semaphore with the given initial value.
    ///
    /// Fails if the name already exists.
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let cname = to_cstring(name)?;
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(SpindleError::ipc_os(&format!("sem_open({})", name)));
        }
        Ok(Self {
            name: cname,
            sem,
            is_owner: true,
        })
    }

    /// Open an existing semaphore.
    pub fn open(name: &str) -> Result<Self> {
        let cname = to_cstring(name)?;
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(SpindleError::ipc_os(&format!("sem_open({})", name)));
        }
        Ok(Self {
            name: cname,
            sem,
            is_owner: false,
        })
    }

    /// Remove a leftover name from a previous run. Missing names are fine.
    pub fn unlink_stale(name: &str) {
        if let Ok(cname) = to_cstring(name) {
            unsafe { libc::sem_unlink(cname.as_ptr()) };
        }
    }

    /// Increment the semaphore, waking one waiter.
    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem) } == 0 {
            Ok(())
        } else {
            Err(SpindleError::ipc_os("sem_post"))
        }
    }

    /// Block until the semaphore can be decremented.
    ///
    /// A signal-interrupted wait surfaces as [`SpindleError::Interrupted`]
    /// so the caller can re-check its shutdown flags before retrying.
    pub fn wait(&self) -> Result<()> {
        if unsafe { libc::sem_wait(self.sem) } == 0 {
            return Ok(());
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => Err(SpindleError::Interrupted),
            _ => Err(SpindleError::ipc_os("sem_wait")),
        }
    }

    /// Wait with a timeout. Returns `Ok(true)` when the semaphore was
    /// decremented, `Ok(false)` on timeout or signal interruption.
    pub fn timed_wait(&self, timeout: Duration) -> Result<bool> {
        let deadline = absolute_deadline(timeout)?;
        if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
            return Ok(true);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ETIMEDOUT) | Some(libc::EINTR) => Ok(false),
            _ => Err(SpindleError::ipc_os("sem_timedwait")),
        }
    }

    /// Decrement without blocking. Returns `Ok(false)` if the value was zero.
    pub fn try_wait(&self) -> Result<bool> {
        if unsafe { libc::sem_trywait(self.sem) } == 0 {
            return Ok(true);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(false),
            _ => Err(SpindleError::ipc_os("sem_trywait")),
        }
    }

    /// Current semaphore value (never negative on Linux).
    pub fn value(&self) -> Result<i32> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem, &mut value) } == 0 {
            Ok(value.max(0))
        } else {
            Err(SpindleError::ipc_os("sem_getvalue"))
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
            if self.is_owner {
                libc::sem_unlink(self.name.as_ptr());
            }
        }
    }
}

fn to_cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| SpindleError::ipc(format!("semaphore name {:?} contains NUL", name)))
}

/// CLOCK_REALTIME deadline `timeout` from now, as `sem_timedwait` expects.
fn absolute_deadline(timeout: Duration) -> Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(SpindleError::ipc_os("clock_gettime"));
    }

    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn unique_name(tag: &str) -> String {
        format!("/spindle_sem_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_post_and_wait() {
        let name = unique_name("basic");
        let sem = NamedSemaphore::create(&name, 0).unwrap();

        sem.post().unwrap();
        sem.wait().unwrap();
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn test_initial_value_and_try_wait() {
        let name = unique_name("initial");
        let sem = NamedSemaphore::create(&name, 2).unwrap();

        assert_eq!(sem.value().unwrap(), 2);
        assert!(sem.try_wait().unwrap());
        assert!(sem.try_wait().unwrap());
        assert!(!sem.try_wait().unwrap());
    }

    #[test]
    fn test_timed_wait_times_out() {
        let name = unique_name("timeout");
        let sem = NamedSemaphore::create(&name, 0).unwrap();

        let start = Instant::now();
        let got = sem.timed_wait(Duration::from_millis(50)).unwrap();
        assert!(!got);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wait_wakes_across_threads() {
        let name = unique_name("threads");
        let sem = Arc::new(NamedSemaphore::create(&name, 0).unwrap());

        let waiter = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || sem.wait())
        };

        std::thread::sleep(Duration::from_millis(20));
        sem.post().unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_open_sees_creator_posts() {
        let name = unique_name("open");
        let creator = NamedSemaphore::create(&name, 0).unwrap();
        let opener = NamedSemaphore::open(&name).unwrap();

        creator.post().unwrap();
        assert!(opener.timed_wait(Duration::from_millis(100)).unwrap());
    }
}
