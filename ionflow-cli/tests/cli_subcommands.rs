use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "ionflow_cli_{label}_{}_{}",
        std::process::id(),
        nanos
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn ionflow(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ionflow"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("run ionflow")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    assert_eq!(lines.len(), 1, "expected one JSON line on stdout, got: {stdout}");
    serde_json::from_str(lines[0]).expect("stdout is JSON")
}

fn assert_envelope(value: &serde_json::Value, command: &str, ok: bool) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
    assert_eq!(value["command"], command);
    assert_eq!(value["ok"], ok);
}

#[test]
fn help_lists_subcommands() {
    let output = ionflow(&["help"]);
    assert!(
        output.status.success(),
        "ionflow help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    for sub in ["run", "formats", "validate"] {
        assert!(stdout.contains(sub), "missing {sub} in help output");
    }
}

#[test]
fn run_help_lists_scale_flags() {
    let output = ionflow(&["run", "--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in ["--scale-width", "--scale-height", "--frames", "--cancel-after-ms"] {
        assert!(stdout.contains(flag), "missing {flag} in run help");
    }
}

#[test]
fn formats_reports_device_codes() {
    let output = ionflow(&["formats"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_envelope(&value, "formats", true);

    let formats = value["pixel_formats"].as_array().expect("pixel_formats array");
    let find = |name: &str| {
        formats
            .iter()
            .find(|f| f["name"] == name)
            .unwrap_or_else(|| panic!("{name} listed"))
            .clone()
    };
    assert_eq!(find("nv21")["engine_code"], 0x11);
    assert_eq!(find("nv21")["decode_output"], true);
    assert!(find("nv12")["engine_code"].is_null());
    assert_eq!(find("gray")["engine_code"], 0x2020_3859u32);
    assert_eq!(value["codecs"].as_array().map(Vec::len), Some(10));
}

#[test]
fn scaled_run_reports_frames_and_stable_checksum() {
    let args = [
        "run",
        "--codec",
        "h264",
        "--width",
        "64",
        "--height",
        "48",
        "--frames",
        "6",
        "--scale-width",
        "iw/2",
        "--scale-height",
        "-2",
    ];
    let first = ionflow(&args);
    assert!(
        first.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&first.stderr)
    );
    let first = stdout_json(&first);
    assert_envelope(&first, "run", true);
    assert_eq!(first["report"]["outcome"], "end_of_stream");
    assert_eq!(first["report"]["frames_delivered"], 6);
    assert_eq!(first["report"]["scale"]["output_width"], 32);
    assert_eq!(first["report"]["scale"]["output_height"], 24);

    let second = stdout_json(&ionflow(&args));
    assert_eq!(first["checksum"], second["checksum"]);
}

#[test]
fn validate_previews_scale_geometry_from_config_file() {
    let dir = unique_temp_dir("validate");
    let path = dir.join("pipeline.json");
    fs::write(
        &path,
        r#"{
            "config_schema_version": 1,
            "decoder": { "codec": "hevc", "width": 1920, "height": 1080 },
            "scale": { "width": "1280", "height": "-2" }
        }"#,
    )
    .expect("write config");

    let output = ionflow(&["validate", "--config", path.to_str().expect("utf8 path")]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_envelope(&value, "validate", true);
    assert_eq!(value["codec"], "hevc");
    assert_eq!(value["scale"]["width"], 1280);
    assert_eq!(value["scale"]["height"], 720);
    assert_eq!(value["scale"]["format"], "nv21");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn validate_rejects_schema_mismatch() {
    let dir = unique_temp_dir("schema");
    let path = dir.join("pipeline.json");
    fs::write(
        &path,
        r#"{"config_schema_version": 7, "decoder": {"codec": "h264", "width": 64, "height": 64}}"#,
    )
    .expect("write config");

    let output = ionflow(&["validate", "--config", path.to_str().expect("utf8 path")]);
    assert!(!output.status.success());
    let value = stdout_json(&output);
    assert_envelope(&value, "validate", false);
    assert_eq!(value["code"], 405);
    assert!(
        value["error"]
            .as_str()
            .is_some_and(|e| e.contains("Config schema mismatch"))
    );

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn run_rejects_non_decoder_output_format() {
    let output = ionflow(&["run", "--output-format", "rgba", "--frames", "1"]);
    assert!(!output.status.success());
    let value = stdout_json(&output);
    assert_envelope(&value, "run", false);
    assert_eq!(value["code"], 401);
}
