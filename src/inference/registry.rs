//! Process-wide list of spawned inference servers, so none outlives us.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::debug;

use super::server::ServerRole;
use crate::os::terminate_process;

static LIVE_SERVERS: Lazy<Mutex<HashMap<u32, ServerRole>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn register(pid: u32, role: ServerRole) {
    let mut servers = LIVE_SERVERS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    servers.insert(pid, role);
}

pub fn unregister(pid: u32) {
    let mut servers = LIVE_SERVERS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    servers.remove(&pid);
}

#[cfg(test)]
pub fn live_servers() -> Vec<(u32, ServerRole)> {
    let servers = LIVE_SERVERS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut out = servers
        .iter()
        .map(|(pid, role)| (*pid, *role))
        .collect::<Vec<_>>();
    out.sort();
    out
}

/// Sends SIGTERM to every registered server and forgets them.
pub fn terminate_all() -> usize {
    let drained = {
        let mut servers = match LIVE_SERVERS.try_lock() {
            Ok(servers) => servers,
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(std::sync::TryLockError::WouldBlock) => return 0,
        };
        servers.drain().collect::<Vec<(u32, ServerRole)>>()
    };

    let mut terminated = 0;
    for (pid, role) in drained {
        if terminate_process(pid) {
            debug!(pid, role = role.as_str(), "terminated inference server");
            terminated += 1;
        }
    }
    terminated
}
