//! Supervises the singleton forwarding-client process.
//!
//! The client is launched as `<binary> -c <configPath>` and reads its config
//! only at startup, so every change to the running-mapping set goes through
//! [`Supervisor::restart`]. Stdout and stderr are forwarded line-by-line to
//! the observer feed; the text is opaque log material, never parsed for
//! control decisions.
//!
//! An exit that was not requested via [`Supervisor::stop`] is a fault: the
//! exit watcher sends a [`TunnelNotice`] to the connection manager, which
//! marks the affected mappings `Error`. There is no auto-respawn — relaunch
//! is a user-initiated `start`.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::events::{Event, EventSender};

/// Sent to the connection manager when the client exits without a stop
/// request. `generation` identifies which spawn exited so a stale notice
/// (raced by a newer restart) can be discarded.
#[derive(Debug)]
pub struct TunnelNotice {
    pub generation: u64,
    pub status: String,
}

/// Owns the forwarding-client child process, if one is running.
pub struct Supervisor {
    binary: String,
    grace: Duration,
    events: EventSender,
    notice_tx: mpsc::UnboundedSender<TunnelNotice>,
    generation: u64,
    running: Option<RunningClient>,
}

struct RunningClient {
    pid: u32,
    /// Set before SIGTERM so the exit watcher can tell an intentional stop
    /// from a crash.
    stopping: Arc<AtomicBool>,
    /// Exit code, recorded by the exit watcher.
    exited: Arc<Mutex<Option<i32>>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        binary: impl Into<String>,
        grace: Duration,
        events: EventSender,
        notice_tx: mpsc::UnboundedSender<TunnelNotice>,
    ) -> Self {
        Self {
            binary: binary.into(),
            grace,
            events,
            notice_tx,
            generation: 0,
            running: None,
        }
    }

    /// Spawn generation of the currently running client, for discarding
    /// stale exit notices.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Stop any running instance, then launch a new one against
    /// `config_path`.
    pub async fn restart(&mut self, config_path: &Path) -> Result<(), Error> {
        self.stop().await;

        let mut child = Command::new(&self.binary)
            .arg("-c")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::SpawnFailed(format!("{}: {e}", self.binary)))?;

        self.generation += 1;
        let generation = self.generation;
        let pid = child.id().unwrap_or(0);
        let stopping = Arc::new(AtomicBool::new(false));
        let exited: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));
        let mut tasks = Vec::with_capacity(3);

        if let Some(stdout) = child.stdout.take() {
            tasks.push(tokio::spawn(forward_output(stdout, self.events.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            tasks.push(tokio::spawn(forward_output(stderr, self.events.clone())));
        }

        // Exit watcher
        let watch_stopping = Arc::clone(&stopping);
        let watch_exited = Arc::clone(&exited);
        let notice_tx = self.notice_tx.clone();
        let events = self.events.clone();
        tasks.push(tokio::spawn(async move {
            let (code, text) = match child.wait().await {
                Ok(status) => (status.code().unwrap_or(-1), status.to_string()),
                Err(e) => (-1, format!("wait error: {e}")),
            };
            *watch_exited.lock().await = Some(code);
            if watch_stopping.load(Ordering::SeqCst) {
                info!("Tunnel client exited after stop request ({text})");
            } else {
                warn!("Tunnel client exited unexpectedly ({text})");
                let _ = events.send(Event::Log {
                    line: format!("forwarding client exited unexpectedly ({text})"),
                });
                let _ = notice_tx.send(TunnelNotice {
                    generation,
                    status: text,
                });
            }
        }));

        self.running = Some(RunningClient {
            pid,
            stopping,
            exited,
            tasks,
        });
        info!(
            "Tunnel client started (pid {pid}, config {})",
            config_path.display()
        );
        Ok(())
    }

    /// Graceful terminate: SIGTERM, wait up to the grace period, then
    /// SIGKILL. Idempotent and safe when nothing is running.
    pub async fn stop(&mut self) {
        let Some(client) = self.running.take() else {
            return;
        };
        client.stopping.store(true, Ordering::SeqCst);

        if client.exited.lock().await.is_none() {
            #[allow(clippy::cast_possible_wrap)]
            let pid = client.pid as i32;
            if pid > 0 {
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
            }

            let deadline = tokio::time::Instant::now() + self.grace;
            loop {
                if client.exited.lock().await.is_some() {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(
                        "Tunnel client did not exit within {:?}, sending SIGKILL",
                        self.grace
                    );
                    if pid > 0 {
                        unsafe {
                            libc::kill(pid, libc::SIGKILL);
                        }
                    }
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        // Readers end on pipe EOF, the watcher ends after wait().
        for task in client.tasks {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
        info!("Tunnel client stopped");
    }
}

/// Forward one output stream to the observer feed, line by line.
async fn forward_output<R>(stream: R, events: EventSender)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("frpc: {line}");
        let _ = events.send(Event::Log { line });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn stub_client(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("frpc-stub");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn stub_config(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("frpc.ini");
        std::fs::write(&path, "[common]\n").unwrap();
        path
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_spawn_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _rx) = events::channel();
        let (tx, _rx2) = mpsc::unbounded_channel();
        let mut sup = Supervisor::new(
            "/portgate-test/no-such-binary",
            Duration::from_millis(500),
            events,
            tx,
        );
        match sup.restart(&stub_config(&dir)).await {
            Err(Error::SpawnFailed(_)) => {}
            other => panic!("expected SpawnFailed, got {other:?}"),
        }
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn unexpected_exit_sends_a_notice() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _rx) = events::channel();
        let (tx, mut notices) = mpsc::unbounded_channel();
        let mut sup = Supervisor::new(
            stub_client(&dir, "exit 3"),
            Duration::from_millis(500),
            events,
            tx,
        );
        sup.restart(&stub_config(&dir)).await.unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .expect("notice in time")
            .expect("channel open");
        assert_eq!(notice.generation, sup.generation());
    }

    #[tokio::test]
    async fn intentional_stop_sends_no_notice() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _rx) = events::channel();
        let (tx, mut notices) = mpsc::unbounded_channel();
        let mut sup = Supervisor::new(
            stub_client(&dir, "exec sleep 30"),
            Duration::from_millis(1500),
            events,
            tx,
        );
        sup.restart(&stub_config(&dir)).await.unwrap();
        assert!(sup.is_running());

        sup.stop().await;
        assert!(!sup.is_running());
        // safe to call again
        sup.stop().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn client_output_reaches_the_observer_feed() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = events::channel();
        let (tx, _notices) = mpsc::unbounded_channel();
        let mut sup = Supervisor::new(
            stub_client(&dir, "echo start proxy success; exec sleep 30"),
            Duration::from_millis(500),
            events,
            tx,
        );
        sup.restart(&stub_config(&dir)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("log line in time")
                .expect("feed open");
            if let Event::Log { line } = event {
                if line == "start proxy success" {
                    break;
                }
            }
        }
        sup.stop().await;
    }
}
