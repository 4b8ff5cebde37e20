use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn mimic_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("mimic");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("deploy.md"),
        "# Deploying\n\nRun the release pipeline from the main branch.\n\n## Rollback\n\nUse the previous tag to roll back a bad deploy.",
    )
    .unwrap();
    fs::write(
        files_dir.join("lunch.txt"),
        "The office cafeteria serves lunch from noon until two.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/mimic.sqlite"

[embedding]
provider = "hash"
dims = 64

[rerank]
provider = "disabled"
"#,
        root.display()
    );
    let config_path = config_dir.join("mimic.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_mimic(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = mimic_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run mimic binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_mimic(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_mimic(&config_path, &["init"]);
    assert!(success, "second init failed");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_mimic(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_index_file_then_search() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("files/deploy.md");

    run_mimic(&config_path, &["init"]);
    let (_, stderr, success) = run_mimic(&config_path, &["org", "add", "acme"]);
    assert!(success, "org add failed: {}", stderr);
    let (_, stderr, success) = run_mimic(&config_path, &["user", "add", "alice", "--org", "acme"]);
    assert!(success, "user add failed: {}", stderr);

    let (stdout, stderr, success) = run_mimic(
        &config_path,
        &["index-file", file.to_str().unwrap(), "--org", "acme"],
    );
    assert!(success, "index-file failed: {}", stderr);
    assert!(stdout.contains("new documents: 1"));

    let (stdout, stderr, success) = run_mimic(
        &config_path,
        &["search", "--user", "alice", "rollback previous tag"],
    );
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("1. ["), "no results: {}", stdout);
    assert!(stdout.contains("deploy.md"));

    // Re-indexing the same file adds no documents.
    let (stdout, _, _) = run_mimic(
        &config_path,
        &["index-file", file.to_str().unwrap(), "--org", "acme"],
    );
    assert!(stdout.contains("new documents: 0"));
}

#[test]
fn test_user_requires_known_org() {
    let (_tmp, config_path) = setup_test_env();
    run_mimic(&config_path, &["init"]);
    let (_, stderr, success) = run_mimic(&config_path, &["user", "add", "bob", "--org", "ghost"]);
    assert!(!success);
    assert!(stderr.contains("Unknown organization"));
}

#[test]
fn test_file_connector_run_once() {
    let (tmp, config_path) = setup_test_env();
    run_mimic(&config_path, &["init"]);
    run_mimic(&config_path, &["org", "add", "acme"]);

    let config_json = format!(
        r#"{{"root": "{}"}}"#,
        tmp.path().join("files").display()
    );
    let (stdout, stderr, success) = run_mimic(
        &config_path,
        &[
            "connector", "add", "handbook", "--org", "acme", "--source", "file", "--config-json",
            &config_json,
        ],
    );
    assert!(success, "connector add failed: {}", stderr);
    assert!(stdout.contains("connector 1 created"));

    let (_, stderr, success) = run_mimic(&config_path, &["credential", "add", "--public"]);
    assert!(success, "credential add failed: {}", stderr);
    let (_, stderr, success) = run_mimic(
        &config_path,
        &["pair", "link", "--connector", "1", "--credential", "1"],
    );
    assert!(success, "pair link failed: {}", stderr);

    let (stdout, stderr, success) = run_mimic(&config_path, &["run", "--once"]);
    assert!(success, "run failed: {}", stderr);
    assert!(stdout.contains("created: 1"));
    assert!(stdout.contains("succeeded: 1"));

    let (stdout, _, success) = run_mimic(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("docs 2"), "status: {}", stdout);
}
