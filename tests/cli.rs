//! The `tempjwk` binary driven against shell-script stand-ins for
//! `step-cli` and `gpg`.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::io::Write;
use std::process::{Command, Output, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Scripts are written and executed one test at a time; a script still open
/// for writing in another thread's fork cannot be executed (ETXTBSY).
static SERIAL: Mutex<()> = Mutex::new(());

struct Sandbox {
    dir: TempDir,
    scratch: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join("key.pub"), r#"{"kty":"EC","crv":"P-256"}"#).unwrap();
        std::fs::write(root.join("key.priv.gpg"), "ciphertext").unwrap();
        std::fs::write(root.join("bad.priv.gpg"), "garbage").unwrap();

        script(
            &root.join("step-cli"),
            &format!(
                r#"#!/bin/sh
echo "$*" >> {log}
case "$3" in
  list)
    if [ -f {slow} ]; then sleep 5; fi
    if [ -f {state} ]; then printf '[{{"type":"JWK","name":"tempjwk"}}]'; else printf '[]'; fi ;;
  add)
    while [ $# -gt 0 ]; do
      if [ "$1" = "--private-key" ]; then cat "$2" > {seen}; fi
      shift
    done
    touch {state} ;;
  remove)
    rm -f {state} ;;
esac
"#,
                log = root.join("step.log").display(),
                state = root.join("registered").display(),
                seen = root.join("seen.key").display(),
                slow = root.join("slow").display(),
            ),
        );
        script(
            &root.join("gpg"),
            r#"#!/bin/sh
case "$2" in
  *bad*) printf 'partial'; echo "gpg: decryption failed: No secret key" >&2; exit 2 ;;
esac
printf 'PLAINTEXT-JWK'
"#,
        );

        Self {
            dir,
            scratch: TempDir::new().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn command(&self, timeout: u64) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_tempjwk"));
        command
            .arg("--key-dir")
            .arg(self.dir.path())
            .arg("--scratch-dir")
            .arg(self.scratch.path())
            .arg("--step-bin")
            .arg(self.path("step-cli"))
            .arg("--gpg-bin")
            .arg(self.path("gpg"))
            .arg("--timeout")
            .arg(timeout.to_string())
            .env("RUST_LOG", "off")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    fn run(&self, extra: &[&str]) -> Output {
        self.command(1).args(extra).output().unwrap()
    }

    /// Block until the CA stand-in has logged a `verb` call.
    fn wait_for_call(&self, verb: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.verbs().iter().any(|v| v == verb) {
            assert!(Instant::now() < deadline, "no {verb} call: {}", self.step_log());
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn verbs(&self) -> Vec<String> {
        self.step_log()
            .lines()
            .map(|l| l.split_whitespace().nth(2).unwrap_or_default().to_string())
            .collect()
    }

    fn step_log(&self) -> String {
        std::fs::read_to_string(self.path("step.log")).unwrap_or_default()
    }

    fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.scratch.path()).unwrap().next().is_none()
    }
}

fn script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[test]
fn full_run_adds_then_revokes() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let sandbox = Sandbox::new();

    let output = sandbox.run(&[]);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{:?}", output);
    assert!(stdout.contains("Provisioner tempjwk added."));
    assert!(stdout.contains("Press any key to delete it (up to 1 seconds)"));
    assert!(stdout.contains("Provisioner tempjwk deleted."));

    let log = sandbox.step_log();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 3, "{log}");
    assert_eq!(lines[0], "ca provisioner list");
    assert!(lines[1].starts_with("ca provisioner add --type jwk --public-key "));
    assert!(lines[1].ends_with("tempjwk --admin-provisioner KumiDC --admin-subject admin"));
    assert_eq!(
        lines[2],
        "ca provisioner remove tempjwk --admin-provisioner KumiDC --admin-subject admin"
    );

    assert_eq!(std::fs::read(sandbox.path("seen.key")).unwrap(), b"PLAINTEXT-JWK");
    assert!(!sandbox.path("registered").exists());
    assert!(sandbox.scratch_is_empty());
}

#[test]
fn existing_provisioner_is_removed_first() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let sandbox = Sandbox::new();
    std::fs::write(sandbox.path("registered"), "").unwrap();

    let output = sandbox.run(&["--admin-subject", "ops@example.com"]);

    assert!(output.status.success(), "{:?}", output);
    let log = sandbox.step_log();
    assert_eq!(sandbox.verbs(), ["list", "remove", "add", "remove"]);
    assert!(log.contains("--admin-subject ops@example.com"));
    assert!(!sandbox.path("registered").exists());
}

#[test]
fn missing_public_key_exits_with_one() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let sandbox = Sandbox::new();

    let output = sandbox.run(&["--public-key", "absent.pub"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("public key file does not exist"));
    assert!(sandbox.step_log().is_empty());
}

#[test]
fn failed_decryption_exits_with_one_and_cleans_up() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let sandbox = Sandbox::new();

    let output = sandbox.run(&["--private-key", "bad.priv.gpg"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to decrypt private key"), "{stderr}");
    assert!(stderr.contains("No secret key"), "{stderr}");
    assert_eq!(sandbox.step_log().trim(), "ca provisioner list");
    assert!(sandbox.scratch_is_empty());
}

#[test]
fn any_byte_on_stdin_revokes_early() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let sandbox = Sandbox::new();
    let started = Instant::now();

    let mut child = sandbox.command(30).stdin(Stdio::piped()).spawn().unwrap();
    let mut stdin = child.stdin.take().unwrap();
    sandbox.wait_for_call("add");
    stdin.write_all(b"x").unwrap();
    stdin.flush().unwrap();
    let output = child.wait_with_output().unwrap();
    drop(stdin);

    assert!(output.status.success(), "{:?}", output);
    assert!(started.elapsed() < Duration::from_secs(15), "{:?}", started.elapsed());
    assert_eq!(sandbox.verbs(), ["list", "add", "remove"]);
    assert!(!sandbox.path("registered").exists());
}

#[test]
fn closed_stdin_waits_for_the_timeout() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let sandbox = Sandbox::new();
    let started = Instant::now();

    let mut child = sandbox.command(2).stdin(Stdio::piped()).spawn().unwrap();
    drop(child.stdin.take());
    let output = child.wait_with_output().unwrap();

    assert!(output.status.success(), "{:?}", output);
    assert!(started.elapsed() >= Duration::from_secs(2), "{:?}", started.elapsed());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Provisioner tempjwk deleted."));
    assert_eq!(sandbox.verbs(), ["list", "add", "remove"]);
}

#[test]
fn termination_before_the_add_registers_nothing() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let sandbox = Sandbox::new();
    std::fs::write(sandbox.path("slow"), "").unwrap();
    let started = Instant::now();

    let child = sandbox.command(30).spawn().unwrap();
    sandbox.wait_for_call("list");
    let killed = Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .status()
        .unwrap();
    assert!(killed.success());
    let output = child.wait_with_output().unwrap();

    assert_eq!(output.status.code(), Some(1), "{:?}", output);
    assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("interrupted during check existing provisioner"), "{stderr}");
    assert_eq!(sandbox.verbs(), ["list"]);
    assert!(!sandbox.path("registered").exists());
    assert!(sandbox.scratch_is_empty());
}

#[test]
fn unreadable_settings_are_reported_once() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let sandbox = Sandbox::new();
    let missing = sandbox.path("missing.toml");

    let output = sandbox.run(&["--config", missing.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(stderr.matches("failed to load settings").count(), 1, "{stderr}");
    assert!(sandbox.step_log().is_empty());
}
