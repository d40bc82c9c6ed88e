//! Command transports.
//!
//! Every driver verb boils down to running host tools (`virsh`, `qemu-img`,
//! `ip`, `iptables`, `genisoimage`). A [`Transport`] runs one shell command
//! line on the host and returns its output; the local variant execs through
//! `sh -c`, the SSH variant through `ssh(1)` with connection sharing. Both
//! honor the verb context's timeout and cancellation token.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use anyhow::{format_err, Context as _, Error};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use vdc_api_types::api_err;

use crate::VerbContext;

/// Collected output of a finished command.
#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A live byte-duplex stream to a process, used for serial consoles.
pub struct ConsoleStream {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ConsoleStream {
    fn new(mut child: Child) -> Result<Self, Error> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| format_err!("console child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| format_err!("console child has no stdout"))?;
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }
}

impl Drop for ConsoleStream {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl AsyncRead for ConsoleStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ConsoleStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

/// Runs commands on one host.
pub trait Transport: Send + Sync + 'static {
    /// Run a shell command line, feeding `stdin` if given, and collect its
    /// output. Must respect the context's timeout and cancellation.
    fn run(
        &self,
        ctx: &VerbContext,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> impl Future<Output = Result<CommandOutput, Error>> + Send;

    /// Spawn a long-running command and hand back its stdio as a duplex
    /// byte stream.
    fn open_stream(&self, command: &str) -> impl Future<Output = Result<ConsoleStream, Error>> + Send;
}

/// Quote a string for POSIX `sh`.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | ':' | '=' | ','))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

async fn drive_child(
    ctx: &VerbContext,
    mut child: Child,
    stdin: Option<&[u8]>,
    what: &str,
) -> Result<CommandOutput, Error> {
    if let Some(data) = stdin {
        let mut handle = child
            .stdin
            .take()
            .ok_or_else(|| format_err!("child has no stdin"))?;
        handle.write_all(data).await?;
        handle.shutdown().await?;
        drop(handle);
    } else {
        drop(child.stdin.take());
    }

    let wait = child.wait_with_output();
    tokio::pin!(wait);

    let output = tokio::select! {
        output = &mut wait => output.with_context(|| format!("failed to run {what}"))?,
        _ = tokio::time::sleep(ctx.timeout) => {
            return Err(api_err!(DriverTimeout, "{what} timed out after {:?}", ctx.timeout));
        }
        _ = ctx.cancel.cancelled() => {
            return Err(format_err!("{what} cancelled"));
        }
    };

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Direct execution on the control-plane machine itself.
pub struct LocalExec;

impl Transport for LocalExec {
    async fn run(
        &self,
        ctx: &VerbContext,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, Error> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn sh")?;
        drive_child(ctx, child, stdin, command).await
    }

    async fn open_stream(&self, command: &str) -> Result<ConsoleStream, Error> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn sh")?;
        ConsoleStream::new(child)
    }
}

/// Execution on a remote host through `ssh(1)`.
///
/// Connections are shared via `ControlMaster=auto` sockets under
/// `control_dir`, so concurrent verbs multiplex over a small number of TCP
/// connections instead of handshaking each time.
pub struct SshExec {
    pub user: String,
    pub address: String,
    pub port: u16,
    pub identity: Option<PathBuf>,
    pub control_dir: PathBuf,
}

impl SshExec {
    fn base_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o").arg("BatchMode=yes");
        cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
        cmd.arg("-o").arg("ConnectTimeout=10");
        cmd.arg("-o").arg("ControlMaster=auto");
        cmd.arg("-o").arg(format!(
            "ControlPath={}/ssh-%r@%h:%p",
            self.control_dir.display()
        ));
        cmd.arg("-o").arg("ControlPersist=60");
        if let Some(identity) = &self.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg("-p").arg(self.port.to_string());
        cmd.arg(format!("{}@{}", self.user, self.address));
        cmd
    }
}

impl Transport for SshExec {
    async fn run(
        &self,
        ctx: &VerbContext,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, Error> {
        let mut cmd = self.base_command();
        cmd.arg("--").arg(command);
        let child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn ssh")?;
        drive_child(ctx, child, stdin, command).await
    }

    async fn open_stream(&self, command: &str) -> Result<ConsoleStream, Error> {
        let mut cmd = self.base_command();
        cmd.arg("--").arg(command);
        let child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn ssh")?;
        ConsoleStream::new(child)
    }
}

/// The production transport: one enum so a fleet can mix a local hypervisor
/// with SSH-attached ones behind a single driver type.
pub enum ExecTransport {
    Local(LocalExec),
    Ssh(SshExec),
}

impl Transport for ExecTransport {
    async fn run(
        &self,
        ctx: &VerbContext,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, Error> {
        match self {
            ExecTransport::Local(t) => t.run(ctx, command, stdin).await,
            ExecTransport::Ssh(t) => t.run(ctx, command, stdin).await,
        }
    }

    async fn open_stream(&self, command: &str) -> Result<ConsoleStream, Error> {
        match self {
            ExecTransport::Local(t) => t.open_stream(command).await,
            ExecTransport::Ssh(t) => t.open_stream(command).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/var/lib/vdc/x.qcow2"), "/var/lib/vdc/x.qcow2");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn local_exec_collects_output() {
        let ctx = VerbContext::default();
        let out = LocalExec
            .run(&ctx, "echo out; echo err >&2; exit 3", None)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn local_exec_feeds_stdin() {
        let ctx = VerbContext::default();
        let out = LocalExec.run(&ctx, "cat", Some(b"ping")).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "ping");
    }

    #[tokio::test]
    async fn timeouts_are_classified() {
        let ctx = VerbContext {
            timeout: std::time::Duration::from_millis(50),
            ..Default::default()
        };
        let err = LocalExec.run(&ctx, "sleep 5", None).await.unwrap_err();
        assert_eq!(
            vdc_api_types::error_code(&err),
            vdc_api_types::ErrorCode::DriverTimeout
        );
    }
}
