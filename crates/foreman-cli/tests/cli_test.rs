//! Integration tests for the `foreman` binary.
//!
//! Each test points the binary at its own temporary data directory and
//! config home, so nothing touches the real `~/.config/foreman`.

use std::path::Path;
use std::process::{Command, Output};

fn foreman(config_home: &Path, data_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_foreman"))
        .args(["--data-dir", data_dir.to_str().unwrap()])
        .args(args)
        .env("XDG_CONFIG_HOME", config_home)
        .env_remove("FOREMAN_DATABASE_URL")
        .env_remove("FOREMAN_DATA_DIR")
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run foreman binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn init_writes_a_private_config_once() {
    let home = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();

    let output = foreman(home.path(), data.path(), &["init"]);
    assert!(output.status.success(), "{output:?}");
    let path = home.path().join("foreman").join("config.toml");
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("encryption_key"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let again = foreman(home.path(), data.path(), &["init"]);
    assert!(!again.status.success());
    assert!(String::from_utf8_lossy(&again.stderr).contains("--force"));

    let forced = foreman(home.path(), data.path(), &["init", "--force"]);
    assert!(forced.status.success());
    assert_ne!(std::fs::read_to_string(&path).unwrap(), text);
}

#[test]
fn db_init_creates_the_schema() {
    let home = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();

    let output = foreman(home.path(), data.path(), &["db-init"]);
    assert!(output.status.success(), "{output:?}");
    let out = stdout(&output);
    assert!(out.contains("work_items: 0 rows"), "{out}");
    assert!(data.path().join("foreman.db").exists());
}

#[test]
fn dispatch_of_unknown_item_fails() {
    let home = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();

    let output = foreman(home.path(), data.path(), &["dispatch", "404"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("work item 404 not found"));
}

#[test]
fn completions_are_generated() {
    let home = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();

    let output = foreman(home.path(), data.path(), &["completions", "bash"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("foreman"));
}
