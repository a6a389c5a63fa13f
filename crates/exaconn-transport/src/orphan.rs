use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[cfg(unix)]
pub fn current_parent_pid() -> Option<u32> {
    Some(std::os::unix::process::parent_id())
}

#[cfg(not(unix))]
pub fn current_parent_pid() -> Option<u32> {
    None
}

/// True when the process has been re-parented away from `original_ppid`.
pub fn is_orphaned(original_ppid: u32) -> bool {
    match current_parent_pid() {
        Some(ppid) => ppid != original_ppid,
        None => false,
    }
}

/// Resolves once the parent captured at start-up has gone away.
pub async fn wait_for_orphaning(original_ppid: u32, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if is_orphaned(original_ppid) {
            warn!(
                original_ppid,
                current_ppid = ?current_parent_pid(),
                "parent process is gone"
            );
            return;
        }
    }
}
