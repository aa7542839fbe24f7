//! Subprocess supervisor: OS-pipe wiring between paired children, and
//! asynchronous exit reporting.
//!
//! Grounded on `examples/original_source/src/recstation/cmds.go`
//! (`PipeCmds`, `RunAndReportCmd`). The supervisor never kills a child
//! itself — per spec.md §4.B that is the owner's responsibility (the audio
//! source kills the sibling capture/encode process, the preview kills its
//! decoder) — so [`run_and_report`] hands back a [`Supervised`] handle the
//! owner can call [`Supervised::kill`] on, while the wait itself runs on a
//! detached task that owns the `tokio::process::Child`.

use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::{RecError, Result};

/// Reported when a supervised child terminates.
#[derive(Debug)]
pub struct CmdExit {
    /// Caller-supplied label identifying which child exited (e.g. `"capture"`).
    pub label: &'static str,
    /// The `wait()` result: `Ok(status)` on a normal exit, `Err` if the
    /// child couldn't be waited on at all.
    pub result: std::io::Result<std::process::ExitStatus>,
}

/// A handle to a running supervised child, for killing by its owner.
#[derive(Debug, Clone, Copy)]
pub struct Supervised {
    pid: u32,
}

impl Supervised {
    /// Sends `SIGKILL` to the child. Idempotent in practice: killing an
    /// already-exited pid returns an error that callers are expected to log
    /// and ignore, since by the time the owner reacts to one sibling's exit
    /// the other may already be dying on its own.
    pub fn kill(&self) -> Result<()> {
        signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL)
            .map_err(|e| RecError::Process(format!("kill pid {}: {}", self.pid, e)))
    }
}

/// Creates a real OS pipe and wires `left`'s stdout into `right`'s stdin,
/// before either is spawned.
pub fn pipe(left: &mut Command, right: &mut Command) -> Result<()> {
    let (read_end, write_end) =
        nix::unistd::pipe().map_err(|e| RecError::Process(format!("pipe: {}", e)))?;

    left.stdout(Stdio::from(write_end));
    right.stdin(Stdio::from(read_end));

    Ok(())
}

/// Spawns `cmd` and reports its exit on `report` once it terminates. The
/// wait runs on its own task; the returned handle can kill the child from
/// the caller's own loop without blocking on it.
pub fn run_and_report(
    mut cmd: Command,
    label: &'static str,
    report: mpsc::Sender<CmdExit>,
) -> Result<Supervised> {
    let mut child = cmd
        .spawn()
        .map_err(|e| RecError::Process(format!("spawn {}: {}", label, e)))?;

    let pid = child
        .id()
        .ok_or_else(|| RecError::Process(format!("{} exited before it could be supervised", label)))?;

    tokio::spawn(async move {
        let result = child.wait().await;
        let _ = report.send(CmdExit { label, result }).await;
    });

    Ok(Supervised { pid })
}

/// As [`run_and_report`], but also returns the child's captured stdout.
/// Used where the owner both supervises the child and needs to read its
/// output directly (the audio source's encoder, the preview decoder).
pub fn run_and_report_piped(
    mut cmd: Command,
    label: &'static str,
    report: mpsc::Sender<CmdExit>,
) -> Result<(Supervised, tokio::process::ChildStdout)> {
    cmd.stdout(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| RecError::Process(format!("spawn {}: {}", label, e)))?;

    let pid = child
        .id()
        .ok_or_else(|| RecError::Process(format!("{} exited before it could be supervised", label)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RecError::Process(format!("{} missing stdout", label)))?;

    tokio::spawn(async move {
        let result = child.wait().await;
        let _ = report.send(CmdExit { label, result }).await;
    });

    Ok((Supervised { pid }, stdout))
}

/// As [`run_and_report_piped`], but also captures stdin. Used by the
/// preview decoder, which is both fed MPEG-TS on stdin and read for raw
/// frames on stdout by the same owner.
pub fn run_and_report_duplex(
    mut cmd: Command,
    label: &'static str,
    report: mpsc::Sender<CmdExit>,
) -> Result<(Supervised, tokio::process::ChildStdin, tokio::process::ChildStdout)> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| RecError::Process(format!("spawn {}: {}", label, e)))?;

    let pid = child
        .id()
        .ok_or_else(|| RecError::Process(format!("{} exited before it could be supervised", label)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RecError::Process(format!("{} missing stdin", label)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RecError::Process(format!("{} missing stdout", label)))?;

    tokio::spawn(async move {
        let result = child.wait().await;
        let _ = report.send(CmdExit { label, result }).await;
    });

    Ok((Supervised { pid }, stdin, stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_exit_of_a_trivial_child() {
        let (tx, mut rx) = mpsc::channel(1);
        let cmd = Command::new("true");
        let supervised = run_and_report(cmd, "true", tx).expect("spawn should succeed");
        let exit = rx.recv().await.expect("exit should be reported");
        assert_eq!(exit.label, "true");
        assert!(exit.result.unwrap().success());
        // killing an already-exited process is expected to fail harmlessly.
        let _ = supervised.kill();
    }

    #[tokio::test]
    async fn kill_terminates_a_long_running_child() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut cmd = Command::new("sleep");
        cmd.arg("30").stdout(Stdio::null()).stdin(Stdio::null()).stderr(Stdio::null());
        let supervised = run_and_report(cmd, "sleeper", tx).expect("spawn should succeed");
        supervised.kill().expect("kill should succeed");
        let exit = rx.recv().await.expect("exit should be reported");
        assert!(!exit.result.unwrap().success());
    }

    #[tokio::test]
    async fn pipe_wires_stdout_to_stdin() {
        let mut left = Command::new("printf");
        left.arg("hello");
        let mut right = Command::new("cat");
        pipe(&mut left, &mut right).expect("pipe should succeed");

        let (tx, mut rx) = mpsc::channel(2);
        let right_output = right.stdout(Stdio::piped());
        let mut right_child = right_output.spawn().expect("cat should spawn");
        let mut out = right_child.stdout.take().unwrap();

        run_and_report(left, "printf", tx.clone()).expect("printf should spawn");

        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        out.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");

        let _ = right_child.wait().await;
        drop(rx.recv().await);
    }

    #[tokio::test]
    async fn duplex_child_echoes_stdin_to_stdout() {
        let (tx, mut rx) = mpsc::channel(1);
        let cmd = Command::new("cat");
        let (supervised, mut stdin, mut stdout) =
            run_and_report_duplex(cmd, "cat", tx).expect("spawn should succeed");

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stdin.write_all(b"hello").await.unwrap();
        drop(stdin);

        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");

        let exit = rx.recv().await.expect("exit should be reported");
        assert!(exit.result.unwrap().success());
        let _ = supervised.kill();
    }
}
