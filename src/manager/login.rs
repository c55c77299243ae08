//! Login / command replay, run once per successful (re)connect.
//!
//! The sequence is a small state machine: a grace wait for the banner, a
//! bounded wait for a login prompt, the callsign credential, the
//! configured command list with comments stripped, and a final blank
//! line. Timing is injectable so the whole sequence stays testable.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, warn};

use crate::event::ClusterEvent;
use crate::transport::ClusterConnection;

use super::ClusterManager;

// ============================================================================
// ReplayTiming
// ============================================================================

/// Delays governing the replay sequence.
///
/// Production uses the defaults; tests shrink them so a full replay runs
/// in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct ReplayTiming {
    /// Settle time after connect before looking for the prompt.
    pub grace: Duration,
    /// Upper bound on waiting for a login prompt; the credential is sent
    /// either way once it elapses.
    pub prompt_wait: Duration,
    /// Pause between successive replayed lines.
    pub step_delay: Duration,
}

impl Default for ReplayTiming {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
            prompt_wait: Duration::from_secs(3),
            step_delay: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Replay Guard
// ============================================================================

/// Clears the cluster's replay-in-flight flag on drop, so the gate
/// reopens even when the replay task is aborted mid-sequence.
struct ReplayGuard {
    manager: Arc<ClusterManager>,
    cluster: String,
}

impl Drop for ReplayGuard {
    fn drop(&mut self) {
        let mut state = self.manager.state.lock();
        if let Some(rec) = state.records.get_mut(&self.cluster) {
            rec.replaying = false;
            rec.replay = None;
        }
    }
}

// ============================================================================
// Replay Sequence
// ============================================================================

/// Runs the full replay for one cluster.
///
/// The caller has already claimed the replay gate and subscribed
/// `events` before this connection's first lines were broadcast; this
/// task owns the gate until the guard drops.
pub(crate) async fn run_replay(
    manager: Arc<ClusterManager>,
    cluster: String,
    force_login: bool,
    mut events: broadcast::Receiver<ClusterEvent>,
) {
    let _guard = ReplayGuard {
        manager: Arc::clone(&manager),
        cluster: cluster.clone(),
    };

    let Some(conn) = manager.connection(&cluster) else {
        return;
    };
    let Some(def) = manager.cluster_def(&cluster) else {
        return;
    };

    let timing = manager.timing;

    // Hold fire until the node says something, bounded by the grace
    // window.
    let prompt_seen = wait_for_activity(&mut events, &cluster, timing.grace).await;

    let login = (def.auto_login || force_login)
        .then(|| def.login_call.as_deref())
        .flatten()
        .filter(|call| !call.is_empty());

    if let Some(call) = login {
        if !prompt_seen {
            wait_for_prompt(&mut events, &cluster, timing.prompt_wait).await;
        }

        debug!(cluster = %cluster, "sending login credential");
        send_step(&conn, &cluster, call).await;
        sleep(timing.step_delay).await;

        for command in &def.default_commands {
            let Some(command) = strip_comment(command) else {
                continue;
            };
            debug!(cluster = %cluster, %command, "replaying command");
            send_step(&conn, &cluster, command).await;
            sleep(timing.step_delay).await;
        }
    } else {
        debug!(cluster = %cluster, "auto-login disabled, skipping replay");
    }

    // Completion flush: a trailing blank line coaxes a fresh prompt out
    // of the node whether or not we logged in.
    send_step(&conn, &cluster, "").await;
}

/// Waits for the first inbound line from the cluster (banner or prompt),
/// bounded by the grace window. Returns `true` when that line already
/// was a login prompt, so the caller can skip the prompt wait.
async fn wait_for_activity(
    events: &mut broadcast::Receiver<ClusterEvent>,
    cluster: &str,
    wait: Duration,
) -> bool {
    let deadline = Instant::now() + wait;

    loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Ok(ClusterEvent::Line { cluster: from, line })) if from == cluster => {
                debug!(cluster = %cluster, %line, "inbound activity, grace wait over");
                return is_login_prompt(&line);
            }
            Ok(Ok(_)) => {}
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return false,
        }
    }
}

/// Waits until the cluster prints a login prompt, or the deadline.
///
/// The credential is sent regardless afterwards; this only avoids
/// racing ahead of a slow banner.
async fn wait_for_prompt(
    events: &mut broadcast::Receiver<ClusterEvent>,
    cluster: &str,
    wait: Duration,
) {
    let deadline = Instant::now() + wait;

    loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Ok(ClusterEvent::Line { cluster: from, line })) if from == cluster => {
                if is_login_prompt(&line) {
                    debug!(cluster = %cluster, %line, "login prompt detected");
                    return;
                }
            }
            Ok(Ok(_)) => {}
            // Dropped events are fine, the deadline bounds us anyway.
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                debug!(cluster = %cluster, "no login prompt before deadline");
                return;
            }
        }
    }
}

/// Sends one replay line; a failed step is logged and skipped rather
/// than aborting the sequence, since the connection's own fault path
/// already handles a dead socket.
async fn send_step(conn: &ClusterConnection, cluster: &str, line: &str) {
    if let Err(e) = conn.send_line(line).await {
        warn!(cluster = %cluster, error = %e, "replay step failed");
    }
}

/// Returns the sendable part of a configured command, or `None` when
/// nothing is left after stripping the `#` comment and whitespace.
fn strip_comment(command: &str) -> Option<&str> {
    let command = match command.find('#') {
        Some(idx) => &command[..idx],
        None => command,
    };
    let command = command.trim();
    (!command.is_empty()).then_some(command)
}

/// Cluster software variously prompts `login:`, `Please enter your
/// call:`, etc.; match loosely.
fn is_login_prompt(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("login") || lower.contains("call")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comment() {
        assert_eq!(strip_comment("SH/FILTER"), Some("SH/FILTER"));
        assert_eq!(strip_comment("SH/FILTER # keep filters"), Some("SH/FILTER"));
        assert_eq!(strip_comment("  set/page 0  "), Some("set/page 0"));
        assert_eq!(strip_comment("# pure comment"), None);
        assert_eq!(strip_comment("   "), None);
        assert_eq!(strip_comment(""), None);
    }

    #[test]
    fn test_login_prompt_detection() {
        assert!(is_login_prompt("login: "));
        assert!(is_login_prompt("Please enter your call:"));
        assert!(is_login_prompt("LOGIN REQUIRED"));
        assert!(!is_login_prompt("Welcome to the AR-Cluster node"));
        assert!(!is_login_prompt("DX de W3LPL: 14025.0"));
    }
}
