use skynet_core::{Database, SessionFilter, SessionStatus};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");
        fs::create_dir_all(&xdg_runtime).expect("failed to create XDG_RUNTIME_DIR");

        seed_claude_fixture(&home);

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("skynet/state.db")
    }
}

fn seed_claude_fixture(home: &Path) {
    let source = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../skynet-core/tests/fixtures/claude-code/three-line.jsonl");
    let target = home
        .join(".claude/projects/-home-me-webapp")
        .join("test-session-001.jsonl");

    fs::create_dir_all(target.parent().expect("missing fixture parent"))
        .expect("failed to create claude fixture directories");
    fs::copy(source, target).expect("failed to copy claude fixture");
}

fn run_bin(env: &CliTestEnv, bin_name: &str, args: &[&str]) -> Output {
    let bin_path = match bin_name {
        "skynet-sync" => PathBuf::from(assert_cmd::cargo::cargo_bin!("skynet-sync")),
        "skynet-query" => PathBuf::from(assert_cmd::cargo::cargo_bin!("skynet-query")),
        _ => panic!("unsupported binary in test harness: {bin_name}"),
    };

    let mut command = Command::new(bin_path);

    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute {bin_name}: {e}"))
}

fn assert_success(bin_name: &str, args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "{bin_name} {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

#[test]
fn sync_ingests_claude_fixture_and_populates_db() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, "skynet-sync", &[]);
    assert_success("skynet-sync", &[], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Sync complete:"));
    assert!(
        stdout.contains("Messages applied:  3"),
        "expected sync summary in stdout, got:\n{stdout}"
    );

    let db_path = env.db_path();
    assert!(
        db_path.exists(),
        "database file should exist at {}",
        db_path.display()
    );

    let db = Database::open_read_only(&db_path).expect("failed to open db");
    let sessions = db
        .list_sessions(&SessionFilter::default())
        .expect("failed to list sessions");
    assert_eq!(sessions.len(), 1, "expected one synced session");
    assert_eq!(sessions[0].id, "test-session-001");
    assert_eq!(sessions[0].status, SessionStatus::Completed);

    let message_count = db
        .count_session_messages(&sessions[0].id)
        .expect("failed to count messages");
    assert_eq!(message_count, 3);

    // A second run finds nothing new
    let again = run_bin(&env, "skynet-sync", &[]);
    assert_success("skynet-sync", &[], &again);
    let stdout = String::from_utf8_lossy(&again.stdout);
    assert!(stdout.contains("Lines read:        0"), "got:\n{stdout}");
}

#[test]
fn query_reads_what_sync_wrote() {
    let env = CliTestEnv::new();

    let sync_output = run_bin(&env, "skynet-sync", &[]);
    assert_success("skynet-sync", &[], &sync_output);

    let args = ["sessions", "--json"];
    let sessions = run_bin(&env, "skynet-query", &args);
    assert_success("skynet-query", &args, &sessions);
    let parsed: serde_json::Value =
        serde_json::from_slice(&sessions.stdout).expect("sessions output should be JSON");
    let list = parsed.as_array().expect("expected a JSON array");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], "test-session-001");
    assert_eq!(list[0]["status"], "completed");

    let args = ["sessions", "--status", "active"];
    let active = run_bin(&env, "skynet-query", &args);
    assert_success("skynet-query", &args, &active);
    assert!(String::from_utf8_lossy(&active.stdout).contains("No sessions found."));

    // Unique prefix is enough
    let args = ["messages", "test-session"];
    let messages = run_bin(&env, "skynet-query", &args);
    assert_success("skynet-query", &args, &messages);
    let stdout = String::from_utf8_lossy(&messages.stdout);
    assert!(stdout.contains("Session test-session-001 (3 message(s))"));
    assert!(stdout.contains("tool-invocation"));
    assert!(stdout.contains(r#"Bash {"command":"ls"}"#));

    let args = ["notifications"];
    let notifications = run_bin(&env, "skynet-query", &args);
    assert_success("skynet-query", &args, &notifications);
    // Sync never notifies
    assert!(String::from_utf8_lossy(&notifications.stdout).contains("No notifications recorded."));
}

#[test]
fn sync_dry_run_discovers_without_ingesting() {
    let env = CliTestEnv::new();

    let args = ["--dry-run", "-v"];
    let output = run_bin(&env, "skynet-sync", &args);
    assert_success("skynet-sync", &args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Found 1 transcript(s)"), "got:\n{stdout}");
    assert!(stdout.contains("-home-me-webapp/test-session-001.jsonl"));
    assert!(stdout.contains("Dry run - no sync performed"));

    let db = Database::open_read_only(&env.db_path()).expect("failed to open db");
    assert!(db
        .list_sessions(&SessionFilter::default())
        .expect("failed to list sessions")
        .is_empty());
}

#[test]
fn query_without_database_fails() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, "skynet-query", &["sessions"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "got:\n{stderr}");
}

#[test]
fn sync_rejects_missing_sessions_root() {
    let env = CliTestEnv::new();
    let missing = env.home.join("no-such-root");
    let missing = missing.to_string_lossy().into_owned();

    let output = run_bin(&env, "skynet-sync", &["--root", &missing]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not accessible"), "got:\n{stderr}");
}
