//! CLI integration tests for the Skein command-line interface.
//!
//! Parsing and config tests need nothing else. Client tests point `skein`
//! at another `skein stdio` process, so the whole stack runs end to end.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Isolated config dir and working directory.
struct Sandbox {
    config: TempDir,
    cwd: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            config: TempDir::new().unwrap(),
            cwd: TempDir::new().unwrap(),
        }
    }

    /// A `skein` command that only sees this sandbox's config.
    fn skein(&self) -> Command {
        let mut cmd = Command::cargo_bin("skein").unwrap();
        cmd.current_dir(self.cwd.path())
            .env("SKEIN_CONFIG_DIR", self.config.path())
            .env_remove("SKEIN_SERVER_URL")
            .env_remove("RUST_LOG");
        cmd
    }

    fn write_config(&self, contents: &str) {
        std::fs::write(self.config.path().join("config.toml"), contents).unwrap();
    }
}

fn skein_bin() -> String {
    env!("CARGO_BIN_EXE_skein").to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    Sandbox::new()
        .skein()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("MCP session gateway"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("stdio"))
        .stdout(predicate::str::contains("tools"))
        .stdout(predicate::str::contains("call"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_displays() {
    Sandbox::new()
        .skein()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("skein"));
}

#[test]
fn test_global_flags_accepted() {
    Sandbox::new()
        .skein()
        .args(["--verbose", "--json", "--server", "http://localhost:9999/mcp", "--help"])
        .assert()
        .success();
}

#[test]
fn test_unknown_subcommand_rejected() {
    Sandbox::new()
        .skein()
        .arg("frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_target_flags_conflict() {
    Sandbox::new()
        .skein()
        .args(["tools", "--name", "a", "--url", "http://localhost:1/mcp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Config Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_config_path_uses_config_dir() {
    let sandbox = Sandbox::new();
    let expected = sandbox.config.path().join("config.toml");
    sandbox
        .skein()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(expected.display().to_string()));
}

#[test]
fn test_config_init_then_show() {
    let sandbox = Sandbox::new();
    sandbox
        .skein()
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));
    assert!(sandbox.config.path().join("config.toml").is_file());

    sandbox
        .skein()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("bind = \"127.0.0.1:8099\""))
        .stdout(predicate::str::contains("request_timeout_secs = 30"));
}

#[test]
fn test_config_show_merges_project_file() {
    let sandbox = Sandbox::new();
    sandbox.write_config("[client]\nname = \"from-user\"\n");
    std::fs::write(
        sandbox.cwd.path().join("skein.toml"),
        "[server]\nbind = \"127.0.0.1:7777\"\n",
    )
    .unwrap();

    let output = sandbox
        .skein()
        .args(["--json", "config", "show"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let shown: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(shown["effective"]["client"]["name"], "from-user");
    assert_eq!(shown["effective"]["server"]["bind"], "127.0.0.1:7777");
    assert_eq!(shown["sources"].as_array().unwrap().len(), 2);
}

#[test]
fn test_config_show_redacts_tokens_and_reports_warnings() {
    let sandbox = Sandbox::new();
    sandbox.write_config(
        r#"
[[servers]]
name = "remote"
transport = "http"
url = "https://mcp.example.com/mcp"
bearer_token = "super-secret"

[[servers]]
name = "incomplete"
transport = "http"
"#,
    );

    sandbox
        .skein()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("super-secret").not())
        .stdout(predicate::str::contains("****"))
        .stdout(predicate::str::contains("# warning:"));
}

#[test]
fn test_config_add_and_remove_server() {
    let sandbox = Sandbox::new();
    sandbox
        .skein()
        .args(["config", "add-server", "files", "mcp-files", "-e", "DEBUG=1", "--", "/srv"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added server 'files'"));

    let written =
        std::fs::read_to_string(sandbox.config.path().join("config.toml")).unwrap();
    assert!(written.contains("name = \"files\""));
    assert!(written.contains("/srv"));

    sandbox
        .skein()
        .args(["config", "add-server", "files", "other"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    sandbox
        .skein()
        .args(["config", "remove-server", "files"])
        .assert()
        .success();
    sandbox
        .skein()
        .args(["config", "remove-server", "files"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Client Tests (against `skein stdio`)
// ─────────────────────────────────────────────────────────────────────────────

fn tool_names(stdout: &[u8]) -> Vec<String> {
    let listed: serde_json::Value = serde_json::from_slice(stdout).unwrap();
    listed["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn test_tools_over_stdio() {
    let sandbox = Sandbox::new();
    let output = sandbox
        .skein()
        .args(["--json", "tools", "--command", &skein_bin(), "--", "stdio"])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(tool_names(&output.stdout), vec!["echo", "env"]);

    let listed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(listed["server"]["name"], "skein");
}

#[test]
fn test_call_over_stdio() {
    Sandbox::new()
        .skein()
        .args([
            "call",
            "echo",
            "--args",
            r#"{"message":"hello through the gateway"}"#,
            "--command",
            &skein_bin(),
            "--",
            "stdio",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello through the gateway"));
}

#[test]
fn test_failed_tool_exits_nonzero() {
    Sandbox::new()
        .skein()
        .args([
            "call",
            "env",
            "--args",
            r#"{"key":"NOPE"}"#,
            "--command",
            &skein_bin(),
            "--",
            "stdio",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("NOPE is not set"));
}

#[test]
fn test_unknown_tool_exits_nonzero() {
    Sandbox::new()
        .skein()
        .args(["call", "missing", "--command", &skein_bin(), "--", "stdio"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown tool missing"));
}

#[test]
fn test_invalid_arguments_rejected_before_connecting() {
    Sandbox::new()
        .skein()
        .args(["call", "echo", "--args", "[1,2]", "--command", "/nonexistent"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--args must be a JSON object"));
}

#[test]
fn test_call_without_target_fails() {
    Sandbox::new()
        .skein()
        .args(["call", "echo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no server to talk to"));
}

/// The gateway re-exports an upstream server's tools under `<name>__<tool>`.
fn write_upstream_config(sandbox: &Sandbox, inner_config: &Path) {
    sandbox.write_config(&format!(
        r#"
[[servers]]
name = "inner"
command = {bin:?}
args = ["stdio", "--no-upstream"]
env = {{ SKEIN_CONFIG_DIR = {dir:?} }}
"#,
        bin = skein_bin(),
        dir = inner_config.display().to_string(),
    ));
}

#[test]
fn test_gateway_proxies_upstream_tools() {
    let sandbox = Sandbox::new();
    let inner = TempDir::new().unwrap();
    write_upstream_config(&sandbox, inner.path());

    let output = sandbox
        .skein()
        .args(["--json", "tools", "--command", &skein_bin(), "--", "stdio"])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(
        tool_names(&output.stdout),
        vec!["echo", "env", "inner__echo", "inner__env"]
    );

    sandbox
        .skein()
        .args([
            "call",
            "inner__echo",
            "--args",
            r#"{"message":"two hops"}"#,
            "--command",
            &skein_bin(),
            "--",
            "stdio",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("two hops"));
}

#[test]
fn test_single_configured_server_is_default_target() {
    let sandbox = Sandbox::new();
    let inner = TempDir::new().unwrap();
    write_upstream_config(&sandbox, inner.path());

    sandbox
        .skein()
        .args(["call", "echo", "--args", r#"{"message":"by default"}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("by default"));
}
