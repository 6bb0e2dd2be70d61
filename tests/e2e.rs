use std::process::Command;

const FAST: &[(&str, &str)] = &[
    ("TICKETFLOW_GATEWAY_MIN_LATENCY_MS", "0"),
    ("TICKETFLOW_GATEWAY_MAX_LATENCY_MS", "0"),
    ("TICKETFLOW_GATEWAY_FAILURE_RATE", "0"),
    ("TICKETFLOW_SETTLEMENT_BACKOFF_MS", "1"),
    ("TICKETFLOW_SETTLEMENT_BACKOFF_MAX_MS", "5"),
    ("TICKETFLOW_LOCK_POLL_MS", "5"),
];

fn run_with(fixture: &str, env: &[(&str, &str)]) -> (String, String, bool) {
    let path = format!("tests/fixtures/{fixture}");
    let output = Command::new(env!("CARGO_BIN_EXE_ticketflow"))
        .arg(&path)
        .env("RUST_LOG", "warn")
        .envs(FAST.iter().copied())
        .envs(env.iter().copied())
        .output()
        .expect("failed to run binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn run(fixture: &str) -> (String, String, bool) {
    run_with(fixture, &[])
}

#[test]
fn sells_out_without_overselling() {
    let (stdout, stderr, success) = run("sold_out.csv");

    assert!(success);
    assert!(stderr.is_empty(), "unexpected stderr: {stderr}");

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], "resource,total,available,confirmed,cancelled,revenue");
    assert_eq!(lines[1], "concert,100,90,10,0,450.0000");
    assert_eq!(lines[2], "theater,3,0,3,0,60.0000");
    assert_eq!(lines.len(), 3);
}

#[test]
fn duplicate_requests_buy_once() {
    let (stdout, _, success) = run("duplicates.csv");

    assert!(success);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[1], "concert,10,7,3,0,37.5000");
}

#[test]
fn declined_settlements_return_inventory() {
    let (stdout, stderr, success) = run_with(
        "declined.csv",
        &[
            ("TICKETFLOW_GATEWAY_FAILURE_RATE", "1"),
            ("TICKETFLOW_SETTLEMENT_ATTEMPTS", "2"),
        ],
    );

    assert!(success);
    assert!(stderr.contains("job exhausted its attempts"));
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[1], "concert,10,10,0,3,0.0000");
}

#[test]
fn errors_warn_but_do_not_block() {
    let (stdout, stderr, success) = run("with_errors.csv");

    assert!(success);
    assert!(stderr.contains("unrecognized row type"));
    assert!(stderr.contains("missing price"));

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], "resource,total,available,confirmed,cancelled,revenue");
    assert_eq!(lines[1], "concert,10,9,1,0,10.0000");
    assert_eq!(lines.len(), 2);
}

#[test]
fn missing_argument_is_a_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_ticketflow"))
        .output()
        .expect("failed to run binary");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("usage"));
}
