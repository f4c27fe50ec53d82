use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn denrich_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("denrich");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("input")).unwrap();

    let config_content = format!(
        r#"[paths]
input_dir = "{root}/input"
output_dir = "{root}/output"
progress_file = "{root}/progress.json"
status_file = "{root}/status.json"

[store]
path = "{root}/data/denrich.sqlite"

[geocoder]
base_url = "http://127.0.0.1:9"

[vendors]
defaults = "samsung,apple"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("denrich.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_denrich(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = denrich_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run denrich binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_store() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_denrich(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Store initialized"));
    assert!(tmp.path().join("data/denrich.sqlite").exists());

    let (_, stderr, success) = run_denrich(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_vendors_seed_and_add() {
    let (_tmp, config_path) = setup_test_env();
    run_denrich(&config_path, &["init"]);

    let (stdout, stderr, success) = run_denrich(&config_path, &["vendors", "add", "Xiaomi"]);
    assert!(success, "vendors add failed: {}", stderr);
    assert!(stdout.contains("added xiaomi"));

    let (stdout, _, success) = run_denrich(&config_path, &["vendors", "add", "xiaomi"]);
    assert!(success);
    assert!(stdout.contains("already known"));

    let (stdout, stderr, success) = run_denrich(&config_path, &["vendors", "list"]);
    assert!(success, "vendors list failed: {}", stderr);
    let listed: Vec<&str> = stdout.lines().collect();
    assert_eq!(listed, vec!["samsung", "xiaomi", "apple"]);
}

#[test]
fn test_models_set_get_and_stats() {
    let (_tmp, config_path) = setup_test_env();
    run_denrich(&config_path, &["init"]);

    let (stdout, stderr, success) = run_denrich(
        &config_path,
        &[
            "models", "set", "Galaxy S9", "--vendor", "Samsung", "--height", "2960", "--width",
            "1440",
        ],
    );
    assert!(success, "models set failed: {}", stderr);
    assert!(stdout.contains("updated galaxy s9"));

    let (stdout, _, success) = run_denrich(
        &config_path,
        &[
            "models", "set", "galaxy s9", "--vendor", "samsung", "--height", "2960", "--width",
            "1440",
        ],
    );
    assert!(success);
    assert!(stdout.contains("unchanged"));

    let (stdout, _, success) = run_denrich(&config_path, &["models", "get", "GALAXY S9"]);
    assert!(success);
    assert!(stdout.contains("\"vendor\": \"samsung\""));

    let (stdout, stderr, success) = run_denrich(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Models:      1"));
    assert!(stdout.contains("Checkpoint:  none"));
}

#[test]
fn test_run_with_missing_input_dir_fails() {
    let (tmp, config_path) = setup_test_env();
    run_denrich(&config_path, &["init"]);
    fs::remove_dir_all(tmp.path().join("input")).unwrap();

    let (_, stderr, success) = run_denrich(&config_path, &["run"]);
    assert!(!success);
    assert!(stderr.contains("Input directory does not exist"));
}

#[test]
fn test_bad_config_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let content = fs::read_to_string(&config_path).unwrap();
    fs::write(
        &config_path,
        content.replace("http://127.0.0.1:9", "ftp://example.com"),
    )
    .unwrap();

    let (_, stderr, success) = run_denrich(&config_path, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("geocoder.base_url"));
}
