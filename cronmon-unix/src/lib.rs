//! Low-level Unix process plumbing for cronmon.
//!
//! Everything here is a thin wrapper over `libc` with per-platform
//! feature detection. Callers treat `Ok(false)` / `ErrorKind::Unsupported`
//! as "this platform has no equivalent" and degrade to best-effort
//! supervision.

use std::io;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use std::os::fd::{FromRawFd, OwnedFd};
#[cfg(not(target_os = "linux"))]
use std::os::fd::OwnedFd;

/// Mark the calling process as a child subreaper, so that orphaned
/// grandchildren reparent to it instead of escaping to init.
///
/// Returns `Ok(true)` if the flag was applied, `Ok(false)` if the platform
/// has no equivalent (no-op).
#[cfg(target_os = "linux")]
pub fn set_child_subreaper() -> io::Result<bool> {
    let ret = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    if ret == 0 {
        Ok(true)
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_child_subreaper() -> io::Result<bool> {
    Ok(false)
}

/// Arrange for the calling process to receive `signal` when its parent
/// dies. Intended to be called from a `pre_exec` hook: `prctl` is
/// async-signal-safe.
///
/// Returns `Ok(true)` if the flag was applied, `Ok(false)` if the platform
/// has no equivalent.
#[cfg(target_os = "linux")]
pub fn set_parent_death_signal(signal: libc::c_int) -> io::Result<bool> {
    let ret = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, signal, 0, 0, 0) };
    if ret == 0 {
        Ok(true)
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_parent_death_signal(_signal: libc::c_int) -> io::Result<bool> {
    Ok(false)
}

/// Whether this platform can deliver a parent-death signal at all.
pub fn parent_death_signal_supported() -> bool {
    cfg!(target_os = "linux")
}

/// Open a pidfd for `pid`. The descriptor polls readable once the process
/// exits, which works for processes we did not spawn ourselves.
///
/// Uses `libc::syscall` directly: `pidfd_open` has no libc wrapper on older
/// glibc versions.
#[cfg(target_os = "linux")]
pub fn pidfd_open(pid: i32) -> io::Result<OwnedFd> {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0u32) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pidfd_open returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as libc::c_int) })
}

#[cfg(not(target_os = "linux"))]
pub fn pidfd_open(_pid: i32) -> io::Result<OwnedFd> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "pidfd_open is only available on Linux",
    ))
}

/// Probe whether a process with `pid` exists, via `kill(pid, 0)`.
///
/// EPERM counts as alive: the process exists, we just may not signal it.
pub fn process_alive(pid: i32) -> bool {
    let ret = unsafe { libc::kill(pid, 0) };
    if ret == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Resolve the path behind file descriptor `fd` of process `pid` through
/// `/proc`. Unlinked targets come back with a ` (deleted)` suffix.
///
/// Platforms without a `/proc` fd table report `Unsupported`; callers that
/// rely on this (takeover) must then treat the descriptor as gone.
#[cfg(target_os = "linux")]
pub fn fd_path(pid: i32, fd: i32) -> io::Result<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/fd/{fd}"))
}

#[cfg(not(target_os = "linux"))]
pub fn fd_path(_pid: i32, _fd: i32) -> io::Result<PathBuf> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "per-process fd inspection requires /proc",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id() as i32));
    }

    #[test]
    fn absurd_pid_is_dead() {
        // PIDs are capped well below this on every supported platform.
        assert!(!process_alive(i32::MAX - 1));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn pidfd_of_own_process_opens() {
        let fd = pidfd_open(std::process::id() as i32).unwrap();
        drop(fd);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn fd_path_resolves_for_open_descriptor() {
        let file = std::fs::File::open("/proc/self/stat").unwrap();
        let fd = {
            use std::os::fd::AsRawFd;
            file.as_raw_fd()
        };
        let path = fd_path(std::process::id() as i32, fd).unwrap();
        assert!(path.to_string_lossy().ends_with("stat"));
    }
}
