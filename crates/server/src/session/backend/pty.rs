//! Local pseudo-terminal backend.
//!
//! Spawns the command vector on a fresh PTY with the requested working
//! directory. Output is read on a blocking task and forwarded to the
//! session task; the child's wait status is collected once the PTY reaches
//! EOF. A normal exit reports its status, death by signal N reports `128 + N`.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};

use super::{BackendStream, SessionBackend, OUTPUT_CHANNEL_CAPACITY};
use crate::session::model::{BackendKind, Geometry, SessionError};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// A command running on a local pseudo-terminal.
pub struct LocalPty {
    command: Vec<String>,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    master: Option<Mutex<Box<dyn MasterPty + Send>>>,
    writer: Option<SharedWriter>,
    pid: Option<u32>,
}

impl LocalPty {
    /// Prepare a backend for `command` in `working_dir`. Nothing is spawned
    /// until [`SessionBackend::start`].
    pub fn new(command: Vec<String>, working_dir: PathBuf, env: Vec<(String, String)>) -> Self {
        Self {
            command,
            working_dir,
            env,
            master: None,
            writer: None,
            pid: None,
        }
    }

    fn writer(&self) -> Result<SharedWriter, SessionError> {
        self.writer
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| SessionError::BackendError("PTY not started".to_string()))
    }
}

fn pty_size(geometry: Geometry) -> PtySize {
    PtySize {
        rows: geometry.rows(),
        cols: geometry.cols(),
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[async_trait]
impl SessionBackend for LocalPty {
    fn kind(&self) -> BackendKind {
        BackendKind::Pty
    }

    async fn start(&mut self, geometry: Geometry) -> Result<BackendStream, SessionError> {
        let Some(program) = self.command.first().cloned() else {
            return Err(SessionError::InvalidRequest("command is empty".to_string()));
        };

        let pair = native_pty_system()
            .openpty(pty_size(geometry))
            .map_err(|e| SessionError::BackendError(format!("failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&self.command[1..]);
        cmd.cwd(&self.working_dir);
        if !self.env.iter().any(|(k, _)| k == "TERM") {
            cmd.env("TERM", "xterm-256color");
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::BackendError(format!("failed to spawn {}: {}", program, e)))?;
        // Keeping the slave open would hide EOF from the reader.
        drop(pair.slave);

        let pid = child.process_id();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::BackendError(format!("failed to get PTY reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::BackendError(format!("failed to get PTY writer: {}", e)))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::task::spawn_blocking(move || read_until_exit(reader, child, output_tx, exit_tx, pid));

        self.master = Some(Mutex::new(pair.master));
        self.writer = Some(Arc::new(Mutex::new(writer)));
        self.pid = pid;

        tracing::info!(
            pid = ?pid,
            program = %program,
            cwd = %self.working_dir.display(),
            geometry = %geometry,
            "Spawned PTY process"
        );

        Ok(BackendStream {
            output: output_rx,
            exit: exit_rx,
        })
    }

    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let writer = self.writer()?;
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(|e| SessionError::BackendError(format!("write task failed: {}", e)))?
        .map_err(|e| SessionError::BackendError(format!("failed to write to PTY: {}", e)))
    }

    async fn resize(&self, geometry: Geometry) -> Result<(), SessionError> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| SessionError::BackendError("PTY not started".to_string()))?;
        master
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resize(pty_size(geometry))
            .map_err(|e| SessionError::BackendError(format!("failed to resize PTY: {}", e)))?;

        tracing::debug!(pid = ?self.pid, geometry = %geometry, "Resized PTY");
        Ok(())
    }

    async fn kill(&self, signal: Signal) -> Result<(), SessionError> {
        let Some(pid) = self.pid else {
            return Err(SessionError::BackendError("no process to signal".to_string()));
        };
        let pid = Pid::from_raw(pid as i32);

        // The child leads its own session, so signal the whole group first.
        match killpg(pid, signal).or_else(|_| kill(pid, signal)) {
            Ok(()) | Err(Errno::ESRCH) => {
                tracing::info!(pid = %pid, signal = %signal, "Signalled PTY process");
                Ok(())
            }
            Err(e) => Err(SessionError::BackendError(format!(
                "failed to send {} to {}: {}",
                signal, pid, e
            ))),
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

fn read_until_exit(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    output_tx: mpsc::Sender<Bytes>,
    exit_tx: oneshot::Sender<Option<i32>>,
    pid: Option<u32>,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if output_tx
                    .blocking_send(Bytes::copy_from_slice(&buffer[..n]))
                    .is_err()
                {
                    tracing::debug!(pid = ?pid, "Output receiver gone, stopping PTY reader");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO once the slave side is closed.
            Err(e) => {
                tracing::debug!(pid = ?pid, error = %e, "PTY read ended");
                break;
            }
        }
    }
    drop(output_tx);

    let code = match pid {
        Some(raw) => wait_for_exit(Pid::from_raw(raw as i32)),
        // No pid to wait on; portable-pty folds signal deaths into 1 here.
        None => match child.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(e) => {
                tracing::error!(error = %e, "Failed to collect exit status");
                None
            }
        },
    };
    drop(child);

    tracing::info!(pid = ?pid, code = ?code, "PTY process exited");
    let _ = exit_tx.send(code);
}

/// Block until `pid` terminates and return its exit code.
fn wait_for_exit(pid: Pid) -> Option<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(code) = exit_code_from_status(status) {
                    return Some(code);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::error!(pid = %pid, error = %e, "Failed to collect exit status");
                return None;
            }
        }
    }
}

/// Exit code for a terminal wait status: the status itself, or `128 + N`
/// for death by signal N. `None` for stop/continue notifications.
fn exit_code_from_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    async fn drain(stream: BackendStream) -> (Vec<u8>, Option<i32>) {
        let BackendStream { mut output, exit } = stream;
        let mut collected = Vec::new();
        while let Some(chunk) = timeout(Duration::from_secs(10), output.recv())
            .await
            .expect("output timed out")
        {
            collected.extend_from_slice(&chunk);
        }
        let code = timeout(Duration::from_secs(10), exit)
            .await
            .expect("exit timed out")
            .expect("exit sender dropped");
        (collected, code)
    }

    #[tokio::test]
    async fn test_echo_output_and_exit_code() {
        let dir = tempdir().unwrap();
        let mut pty = LocalPty::new(
            vec!["echo".to_string(), "hello".to_string()],
            dir.path().to_path_buf(),
            Vec::new(),
        );

        let stream = pty.start(Geometry::default()).await.unwrap();
        assert!(pty.pid().is_some());

        let (output, code) = drain(stream).await;
        assert!(String::from_utf8_lossy(&output).contains("hello"));
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let dir = tempdir().unwrap();
        let mut pty = LocalPty::new(sh("exit 3"), dir.path().to_path_buf(), Vec::new());
        let stream = pty.start(Geometry::default()).await.unwrap();

        let (_, code) = drain(stream).await;
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn test_working_directory_is_applied() {
        let dir = tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let mut pty = LocalPty::new(sh("pwd -P"), canonical.clone(), Vec::new());
        let stream = pty.start(Geometry::default()).await.unwrap();

        let (output, _) = drain(stream).await;
        assert!(String::from_utf8_lossy(&output).contains(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_write_is_echoed() {
        let dir = tempdir().unwrap();
        let mut pty = LocalPty::new(
            sh("read line; echo got:$line"),
            dir.path().to_path_buf(),
            Vec::new(),
        );
        let stream = pty.start(Geometry::default()).await.unwrap();

        pty.write(b"ping\n").await.unwrap();

        let (output, code) = drain(stream).await;
        assert!(String::from_utf8_lossy(&output).contains("got:ping"));
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn test_kill_reports_signal_code() {
        let dir = tempdir().unwrap();
        let mut pty = LocalPty::new(sh("sleep 30"), dir.path().to_path_buf(), Vec::new());
        let stream = pty.start(Geometry::default()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        pty.kill(Signal::SIGKILL).await.unwrap();

        let (_, code) = drain(stream).await;
        assert_eq!(code, Some(128 + Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_external_signal_reports_signal_code() {
        let dir = tempdir().unwrap();
        let mut pty = LocalPty::new(sh("kill -9 $$"), dir.path().to_path_buf(), Vec::new());
        let stream = pty.start(Geometry::default()).await.unwrap();

        let (_, code) = drain(stream).await;
        assert_eq!(code, Some(137));
    }

    #[tokio::test]
    async fn test_trapped_signal_reports_real_status() {
        let dir = tempdir().unwrap();
        let mut pty = LocalPty::new(
            sh("trap 'exit 2' TERM; while true; do sleep 0.1; done"),
            dir.path().to_path_buf(),
            Vec::new(),
        );
        let stream = pty.start(Geometry::default()).await.unwrap();

        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(300)).await;
        pty.kill(Signal::SIGTERM).await.unwrap();

        let (_, code) = drain(stream).await;
        assert_eq!(code, Some(2));
    }

    #[test]
    fn test_exit_code_from_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(exit_code_from_status(WaitStatus::Exited(pid, 0)), Some(0));
        assert_eq!(exit_code_from_status(WaitStatus::Exited(pid, 2)), Some(2));
        assert_eq!(
            exit_code_from_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            Some(143)
        );
        assert_eq!(
            exit_code_from_status(WaitStatus::Signaled(pid, Signal::SIGKILL, true)),
            Some(137)
        );
        assert_eq!(exit_code_from_status(WaitStatus::StillAlive), None);
    }

    #[tokio::test]
    async fn test_resize() {
        let dir = tempdir().unwrap();
        let mut pty = LocalPty::new(sh("sleep 1"), dir.path().to_path_buf(), Vec::new());
        let _stream = pty.start(Geometry::default()).await.unwrap();

        pty.resize(Geometry::new(132, 50).unwrap()).await.unwrap();
        pty.kill(Signal::SIGKILL).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_fails_synchronously() {
        let dir = tempdir().unwrap();
        let mut pty = LocalPty::new(
            vec!["/definitely/not/a/binary".to_string()],
            dir.path().to_path_buf(),
            Vec::new(),
        );

        let result = pty.start(Geometry::default()).await;
        assert!(matches!(result, Err(SessionError::BackendError(_))));
    }

    #[tokio::test]
    async fn test_write_before_start_fails() {
        let pty = LocalPty::new(sh("true"), PathBuf::from("/"), Vec::new());
        assert!(pty.write(b"x").await.is_err());
        assert!(pty.kill(Signal::SIGTERM).await.is_err());
    }
}
