//! Cross-Process Tests
//!
//! These tests verify, using the real binaries:
//! - Data written by one process is read by another
//! - Data survives the host being killed and restarted
//! - Connections of killed processes are reclaimed by maintenance
//! - The host's stdin command channel

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Output, Stdio};
use std::thread;

use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// A running `memkv-host`; killed on drop
struct HostProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl HostProcess {
    fn spawn(data_dir: &Path, name: &str) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_memkv-host"))
            .arg("-n")
            .arg(name)
            .arg("-d")
            .arg(data_dir)
            .args(["--max-blocks-per-segment", "64"])
            .args(["--max-segment-count", "4"])
            .args(["--refresh-interval-ms", "50"])
            .args(["-l", "off"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let stdin = child.stdin.take();
        let stdout = BufReader::new(child.stdout.take().unwrap());
        let mut host = Self {
            child,
            stdin,
            stdout,
        };
        assert_eq!(host.read_line(), format!("ready {}", name));
        host
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.stdout.read_line(&mut line).unwrap();
        line.trim_end().to_string()
    }

    fn command(&mut self, command: &str) -> String {
        let stdin = self.stdin.as_mut().unwrap();
        writeln!(stdin, "{}", command).unwrap();
        stdin.flush().unwrap();
        self.read_line()
    }

    fn kill(mut self) {
        self.child.kill().unwrap();
        self.child.wait().unwrap();
    }
}

impl Drop for HostProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn cli(data_dir: &Path, name: &str, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_memkv-cli"))
        .arg("-d")
        .arg(data_dir)
        .arg("-n")
        .arg(name)
        .args(args)
        .output()
        .unwrap()
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim_end().to_string()
}

// =============================================================================
// Data Sharing Tests
// =============================================================================

#[test]
fn test_cli_reads_what_cli_wrote() {
    let temp_dir = TempDir::new().unwrap();
    let _host = HostProcess::spawn(temp_dir.path(), "shared");

    let put = cli(temp_dir.path(), "shared", &["put", "greeting", "hello"]);
    assert!(put.status.success());
    assert_eq!(stdout_of(&put), "OK");

    let get = cli(temp_dir.path(), "shared", &["get", "greeting"]);
    assert!(get.status.success());
    assert_eq!(stdout_of(&get), "hello");

    let missing = cli(temp_dir.path(), "shared", &["get", "nothing"]);
    assert_eq!(missing.status.code(), Some(2));
    assert_eq!(stdout_of(&missing), "(nil)");
}

#[test]
fn test_cli_remove() {
    let temp_dir = TempDir::new().unwrap();
    let _host = HostProcess::spawn(temp_dir.path(), "shared");

    cli(temp_dir.path(), "shared", &["put", "k", "v"]);

    let removed = cli(temp_dir.path(), "shared", &["remove", "k"]);
    assert!(removed.status.success());

    let again = cli(temp_dir.path(), "shared", &["remove", "k"]);
    assert_eq!(again.status.code(), Some(2));
    assert_eq!(stdout_of(&again), "(nil)");
}

#[test]
fn test_concurrent_cli_processes() {
    let temp_dir = TempDir::new().unwrap();
    let _host = HostProcess::spawn(temp_dir.path(), "busy");
    let data_dir = temp_dir.path().to_path_buf();

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let data_dir = data_dir.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    let key = format!("w{}_{}", w, i);
                    let output = cli(&data_dir, "busy", &["put", &key, &key]);
                    assert!(output.status.success());
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for w in 0..4 {
        for i in 0..10 {
            let key = format!("w{}_{}", w, i);
            assert_eq!(stdout_of(&cli(&data_dir, "busy", &["get", &key])), key);
        }
    }
}

#[test]
fn test_missing_store_fails() {
    let temp_dir = TempDir::new().unwrap();

    let output = cli(temp_dir.path(), "ghost", &["get", "k"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).starts_with("error:"));
}

// =============================================================================
// Crash Tests
// =============================================================================

#[test]
fn test_data_survives_host_kill() {
    let temp_dir = TempDir::new().unwrap();
    let host = HostProcess::spawn(temp_dir.path(), "durable");

    for i in 0..20 {
        let key = format!("key{}", i);
        assert!(cli(temp_dir.path(), "durable", &["put", &key, "value"])
            .status
            .success());
    }

    host.kill();
    let _host = HostProcess::spawn(temp_dir.path(), "durable");

    for i in 0..20 {
        let key = format!("key{}", i);
        assert_eq!(
            stdout_of(&cli(temp_dir.path(), "durable", &["get", &key])),
            "value"
        );
    }
}

#[test]
fn test_killed_host_connection_reaped() {
    let temp_dir = TempDir::new().unwrap();
    let host = HostProcess::spawn(temp_dir.path(), "reaped");
    host.kill();

    let output = cli(temp_dir.path(), "reaped", &["maintain"]);

    assert!(output.status.success());
    assert!(stdout_of(&output).contains("reaped_connections: 1"));

    let stats = stdout_of(&cli(temp_dir.path(), "reaped", &["stats"]));
    assert!(stats.contains("connections: 1/"));
    assert!(stats.contains("(dead)"));
}

#[test]
fn test_destroy_after_host_exit() {
    let temp_dir = TempDir::new().unwrap();
    let mut host = HostProcess::spawn(temp_dir.path(), "temp");

    let refused = cli(temp_dir.path(), "temp", &["destroy"]);
    assert_eq!(refused.status.code(), Some(1));

    assert_eq!(host.command("exit"), "bye (1 stopped)");
    host.child.wait().unwrap();

    let destroyed = cli(temp_dir.path(), "temp", &["destroy"]);
    assert_eq!(stdout_of(&destroyed), "destroyed");
    assert!(!temp_dir.path().join("temp").exists());
}

// =============================================================================
// Command Channel Tests
// =============================================================================

#[test]
fn test_host_command_channel() {
    let temp_dir = TempDir::new().unwrap();
    let mut host = HostProcess::spawn(temp_dir.path(), "s1");

    assert_eq!(host.command("list"), "s1");
    assert_eq!(host.command("stats s1"), "name: s1");
    // Drain the rest of the multi-line stats reply
    while !host.read_line().starts_with("created_at_ms") {}

    assert_eq!(host.command("stop s1"), "stopped s1");
    assert_eq!(host.command("stop s1"), "not running s1");
    assert_eq!(host.command("stats s1"), "not running s1");

    assert_eq!(
        host.command("start s2 --max-blocks-per-segment 16"),
        "started s2"
    );
    assert_eq!(host.command("start s2"), "already running s2");
    assert_eq!(host.command("list"), "s2");
    assert!(host.command("bogus").starts_with("error:"));

    assert_eq!(host.command("exit"), "bye (1 stopped)");
    assert!(host.child.wait().unwrap().success());
}
