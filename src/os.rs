//! Thin wrappers over the handful of process-level syscalls the job needs.

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    // kill(pid, 0) probes existence without delivering a signal. EPERM means
    // the process exists but belongs to someone else.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    pid != 0
}

/// Sends SIGTERM. Returns false when the process was already gone.
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
pub fn terminate_process(_pid: u32) -> bool {
    false
}

/// Raises the nice value of `pid` (0 = the calling process). Best effort.
#[cfg(unix)]
pub fn lower_priority(pid: u32, niceness: i32) {
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, niceness) };
    if result != 0 {
        tracing::debug!(
            pid,
            niceness,
            error = %std::io::Error::last_os_error(),
            "failed to lower scheduling priority"
        );
    }
}

#[cfg(not(unix))]
pub fn lower_priority(_pid: u32, _niceness: i32) {}

pub fn signal_name(signal: i32) -> String {
    match signal {
        2 => "SIGINT".to_string(),
        15 => "SIGTERM".to_string(),
        1 => "SIGHUP".to_string(),
        other => format!("signal {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!is_process_alive(0));
    }

    #[cfg(unix)]
    #[test]
    fn reaped_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn signal_names_match_conventional_spelling() {
        assert_eq!(signal_name(2), "SIGINT");
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(9), "signal 9");
    }
}
