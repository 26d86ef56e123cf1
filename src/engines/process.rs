//! Subprocess plumbing shared by the external-engine adapters.
//!
//! Office suites and browsers fork helpers of their own, so killing the
//! direct child is not enough. Every process is started as the leader of a
//! fresh process group, and [`ProcessGroup`] kills the whole group when it
//! goes out of scope.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Kills every process in a spawned child's group on drop.
pub(crate) struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    leader: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { leader: child.id() }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let Some(leader) = self.leader else { return };
            match killpg(Pid::from_raw(leader as i32), Signal::SIGKILL) {
                // Nothing left in the group.
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to kill process group {}: {}", leader, e),
            }
        }
    }
}

/// Spawn `command` as the leader of its own process group.
pub(crate) fn spawn_grouped(command: &mut Command) -> std::io::Result<(Child, ProcessGroup)> {
    #[cfg(unix)]
    command.process_group(0);
    command.kill_on_drop(true);

    let child = command.spawn()?;
    let group = ProcessGroup::of(&child);
    Ok((child, group))
}

/// Run a `--version` style check. Anything but a clean exit within `limit`
/// counts as unavailable, and the process group is killed either way.
pub(crate) async fn check_version(mut command: Command, limit: Duration) -> bool {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let (mut child, _group) = match spawn_grouped(&mut command) {
        Ok(spawned) => spawned,
        Err(e) => {
            debug!("Version check could not start: {}", e);
            return false;
        }
    };

    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            debug!("Version check failed: {}", e);
            false
        }
        Err(_) => {
            warn!("Version check did not finish within {:?}", limit);
            false
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);
        command
    }

    #[tokio::test]
    async fn version_check_reports_exit_status() {
        assert!(check_version(shell("exit 0"), Duration::from_secs(5)).await);
        assert!(!check_version(shell("exit 3"), Duration::from_secs(5)).await);
        assert!(!check_version(Command::new("/nonexistent/binary"), Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn stalled_version_check_is_bounded() {
        let started = std::time::Instant::now();
        assert!(!check_version(shell("sleep 30"), Duration::from_millis(200)).await);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn dropping_the_group_kills_forked_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let mut command = shell(&format!("sh -c 'sleep 1; touch {}' & wait", marker.display()));
        let (child, group) = spawn_grouped(&mut command).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(group);
        drop(child);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "forked child outlived its group");
    }
}
