//! External tool invocations.
//!
//! Everything the controller needs from the outside world goes through
//! [`CommandRunner`]. [`StepCli`] is the real implementation, driving
//! `step-cli` for the CA and `gpg` for decryption.

use async_trait::async_trait;
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{ToolError, ToolResult};
use crate::provisioner::{AdminCredential, ProvisionerName};

/// Bytes of tool stderr kept for error reports.
const DIAGNOSTIC_TAIL: usize = 4096;

/// Arguments of a JWK provisioner registration.
#[derive(Debug, Clone, Copy)]
pub struct AddJwk<'a> {
    pub name: &'a ProvisionerName,
    pub public_key: &'a Path,
    /// Plaintext private key; only valid for the duration of the call.
    pub private_key: &'a Path,
    pub admin: &'a AdminCredential,
}

/// The operations the lifecycle needs from the CA tool and the decryption utility.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Raw provisioner listing from the CA.
    async fn list(&self) -> ToolResult<String>;

    /// Register a JWK provisioner.
    async fn add(&self, request: AddJwk<'_>) -> ToolResult<()>;

    /// Remove a provisioner by name.
    async fn remove(&self, name: &ProvisionerName, admin: &AdminCredential) -> ToolResult<()>;

    /// Decrypt `encrypted`, writing the plaintext into `sink`.
    async fn decrypt(&self, encrypted: &Path, sink: File) -> ToolResult<()>;
}

/// `step-cli` and `gpg` as child processes.
#[derive(Debug, Clone)]
pub struct StepCli {
    step_bin: PathBuf,
    gpg_bin: PathBuf,
}

impl StepCli {
    pub fn new<S: Into<PathBuf>, G: Into<PathBuf>>(step_bin: S, gpg_bin: G) -> Self {
        Self {
            step_bin: step_bin.into(),
            gpg_bin: gpg_bin.into(),
        }
    }

    fn admin_args(admin: &AdminCredential) -> [OsString; 4] {
        [
            "--admin-provisioner".into(),
            admin.provisioner.clone().into(),
            "--admin-subject".into(),
            admin.subject.clone().into(),
        ]
    }

    fn provisioner_args<I>(args: I) -> Vec<OsString>
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        ["ca", "provisioner"]
            .into_iter()
            .map(OsString::from)
            .chain(args.into_iter().map(Into::into))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for StepCli {
    async fn list(&self) -> ToolResult<String> {
        let args = Self::provisioner_args(["list"]);
        exec(&self.step_bin, &args, Stdio::piped()).await
    }

    async fn add(&self, request: AddJwk<'_>) -> ToolResult<()> {
        let mut args = Self::provisioner_args([
            OsString::from("add"),
            OsString::from("--type"),
            OsString::from("jwk"),
            OsString::from("--public-key"),
            request.public_key.into(),
            OsString::from("--private-key"),
            request.private_key.into(),
            request.name.as_str().into(),
        ]);
        args.extend(Self::admin_args(request.admin));
        exec(&self.step_bin, &args, Stdio::inherit()).await?;
        Ok(())
    }

    async fn remove(&self, name: &ProvisionerName, admin: &AdminCredential) -> ToolResult<()> {
        let mut args = Self::provisioner_args([OsString::from("remove"), name.as_str().into()]);
        args.extend(Self::admin_args(admin));
        exec(&self.step_bin, &args, Stdio::inherit()).await?;
        Ok(())
    }

    async fn decrypt(&self, encrypted: &Path, sink: File) -> ToolResult<()> {
        let args = [OsString::from("--decrypt"), encrypted.into()];
        exec(&self.gpg_bin, &args, Stdio::from(sink)).await?;
        Ok(())
    }
}

/// Run `program` to completion.
///
/// Stdin stays attached to the terminal so the tools can prompt. Stderr is
/// streamed through to ours and its tail kept for the error. When `stdout` is
/// piped the captured output is returned, otherwise an empty string.
async fn exec(program: &Path, args: &[OsString], stdout: Stdio) -> ToolResult<String> {
    let name = program.display().to_string();
    trace!(program = %name, args = ?args, "Executing command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(stdout)
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ToolError::Launch {
            program: name.clone(),
            source,
        })?;

    let tee = tokio::spawn(tee_stderr(child.stderr.take(), tokio::io::stderr()));

    let mut captured = String::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_string(&mut captured)
            .await
            .map_err(|e| ToolError::io("failed to read tool output", e))?;
    }

    let status = child
        .wait()
        .await
        .map_err(|e| ToolError::io("failed to wait for tool", e))?;
    let diagnostic = tee.await.unwrap_or_default();

    if !status.success() {
        return Err(ToolError::exit(name, status, diagnostic));
    }
    debug!(program = %name, "Command succeeded");
    Ok(captured)
}

/// Copy a child's stderr to `sink` as it arrives, returning the tail.
///
/// Forwarding stops at the first write error; the tail is still collected.
async fn tee_stderr<R, W>(stream: Option<R>, mut sink: W) -> String
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut forward = true;
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if forward {
                    if let Err(e) = forward_chunk(&mut sink, &buf[..n]).await {
                        trace!("Stopped forwarding tool stderr: {}", e);
                        forward = false;
                    }
                }
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > DIAGNOSTIC_TAIL {
                    tail.drain(..tail.len() - DIAGNOSTIC_TAIL);
                }
            }
        }
    }

    String::from_utf8_lossy(&tail).into_owned()
}

async fn forward_chunk<W>(sink: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(chunk).await?;
    sink.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioner_args_prefix_subcommand() {
        let args = StepCli::provisioner_args(["remove", "tempjwk"]);
        assert_eq!(args, ["ca", "provisioner", "remove", "tempjwk"]);
    }

    #[test]
    fn admin_args_pair_flags_with_values() {
        let admin = AdminCredential::new("KumiDC", "admin");
        let args = StepCli::admin_args(&admin);
        assert_eq!(
            args,
            ["--admin-provisioner", "KumiDC", "--admin-subject", "admin"]
        );
    }

    #[tokio::test]
    async fn tee_keeps_only_the_tail() {
        let noise = vec![b'x'; DIAGNOSTIC_TAIL * 2];
        let mut input = noise.clone();
        input.extend_from_slice(b"decryption failed: No secret key");
        let mut forwarded = Vec::new();
        let tail = tee_stderr(Some(&input[..]), &mut forwarded).await;
        assert_eq!(tail.len(), DIAGNOSTIC_TAIL);
        assert!(tail.ends_with("decryption failed: No secret key"));
        assert_eq!(forwarded, input);
    }

    /// Stderr that is already closed.
    struct Closed;

    impl AsyncWrite for Closed {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn closed_stderr_still_keeps_the_tail() {
        let input = b"gpg: decryption failed: No secret key\n";
        let tail = tee_stderr(Some(&input[..]), Closed).await;
        assert_eq!(tail, "gpg: decryption failed: No secret key\n");
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let err = exec(
            Path::new("/nonexistent/tempjwk-step"),
            &[OsString::from("ca")],
            Stdio::piped(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Launch { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let args = [
            OsString::from("-c"),
            OsString::from("echo 'token is expired' >&2; exit 3"),
        ];
        let err = exec(Path::new("/bin/sh"), &args, Stdio::piped())
            .await
            .unwrap_err();
        assert_eq!(err.diagnostic(), Some("token is expired"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn piped_stdout_is_captured() {
        let args = [OsString::from("-c"), OsString::from("printf '[]'")];
        let out = exec(Path::new("/bin/sh"), &args, Stdio::piped()).await.unwrap();
        assert_eq!(out, "[]");
    }
}
