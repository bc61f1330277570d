//! Process liveness checks.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Whether a process with this id currently exists.
///
/// Signal 0 performs the permission and existence checks without
/// delivering anything. `EPERM` means the process exists but belongs to
/// another user.
pub fn is_process_running(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn test_invalid_pids() {
        assert!(!is_process_running(0));
        assert!(!is_process_running(u32::MAX));
    }

    #[test]
    fn test_exited_child_is_not_running() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_process_running(pid));
    }
}
