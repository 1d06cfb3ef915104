use std::path::PathBuf;
use std::process::Command;

use serde_json::Value;

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_bridge_sim"))
}

fn run_json(args: &[&str]) -> Value {
    let output = cli().args(args).output().expect("failed to run bridge_sim");
    assert!(
        output.status.success(),
        "bridge_sim exited with {:?}: {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout).expect("stdout UTF-8");
    serde_json::from_str(stdout.trim()).expect("report JSON payload")
}

fn bridge_named<'a>(report: &'a Value, name: &str) -> &'a Value {
    report["snapshot"]["bridges"]
        .as_array()
        .expect("bridges array")
        .iter()
        .find(|b| b["name"] == name)
        .unwrap_or_else(|| panic!("no bridge named {name}"))
}

#[test]
fn test_merged_streams_share_one_bridge() {
    let report = run_json(&["--args", "merge=binary", "--streams", "3", "--cycles", "10"]);
    let bridges = report["snapshot"]["bridges"].as_array().unwrap();
    assert_eq!(bridges.len(), 2, "default bridge plus the merged one");

    let player = bridge_named(&report, "player");
    assert_eq!(player["merge_key"], "player");
    assert_eq!(player["output_streams"].as_array().unwrap().len(), 3);
    assert_eq!(player["output_channels"], 2);
    assert_eq!(report["overruns"], 0);
}

#[test]
fn test_per_pid_merge_creates_one_bridge_per_stream() {
    let report = run_json(&["--streams", "2", "--cycles", "5"]);
    assert_eq!(report["snapshot"]["bridges"].as_array().unwrap().len(), 3);
    assert_eq!(report["client_cycles"], 15);
}

#[test]
fn test_outage_recovers_before_the_run_ends() {
    let report = run_json(&["--cycles", "400", "--outage-at", "10", "--outage-ms", "500"]);
    assert_eq!(report["outage"], true);
    assert_eq!(report["snapshot"]["connected"], true);
    assert_eq!(report["snapshot"]["epoch"], 1);

    let events: Vec<&str> = report["lifecycle"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["event"].as_str())
        .collect();
    assert!(events.contains(&"graph_disconnected"));
    assert!(events.contains(&"graph_reconnected"));
}

#[test]
fn test_idle_bridges_are_unloaded_after_streams_leave() {
    let report = run_json(&["--cycles", "1200", "--unlink-at", "5"]);
    let bridges = report["snapshot"]["bridges"].as_array().unwrap();
    assert_eq!(bridges.len(), 1, "only the default bridge remains");
    assert_eq!(bridges[0]["persistent"], true);
}

#[test]
fn test_capture_wav_is_written() {
    let path = std::env::temp_dir().join(format!("bridge_sim_{}.wav", std::process::id()));
    let report = run_json(&[
        "--cycles",
        "8",
        "--capture-wav",
        path.to_str().unwrap(),
    ]);
    let frames = report["captured_frames"].as_u64().unwrap();
    assert_eq!(frames, 8 * 256);

    let reader = hound::WavReader::open(&path).expect("wav readable");
    assert_eq!(reader.spec().channels, 2);
    assert_eq!(reader.len() as u64, frames * 2);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_invalid_arguments_fail() {
    let output = cli()
        .args(["--args", "merge=sideways"])
        .output()
        .expect("failed to run bridge_sim");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr).expect("stderr UTF-8");
    assert!(stderr.contains("merge"), "expected the bad key in stderr, got {stderr}");
}

#[test]
fn test_config_file_is_loaded() {
    let path: PathBuf =
        std::env::temp_dir().join(format!("bridge_sim_{}.json", std::process::id()));
    std::fs::write(&path, r#"{ "merge_mode": "by-binary", "default_bridge_name": "main" }"#)
        .unwrap();
    let report = run_json(&["--config", path.to_str().unwrap(), "--streams", "2", "--cycles", "2"]);
    let _ = std::fs::remove_file(&path);

    assert!(bridge_named(&report, "main")["persistent"].as_bool().unwrap());
    assert_eq!(
        bridge_named(&report, "player")["output_streams"]
            .as_array()
            .unwrap()
            .len(),
        2
    );
}
