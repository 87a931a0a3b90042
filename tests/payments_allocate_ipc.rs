use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_libraryd");
    let mut child = Command::new(exe)
        .env_remove("LIBRARYD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn libraryd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn amounts(result: &serde_json::Value) -> Vec<(String, f64)> {
    result["allocations"]
        .as_array()
        .expect("allocations")
        .iter()
        .map(|a| {
            (
                a["componentId"].as_str().expect("componentId").to_string(),
                a["amount"].as_f64().expect("amount"),
            )
        })
        .collect()
}

fn components() -> serde_json::Value {
    json!([
        { "id": "tuition", "name": "Tuition", "balance": 100, "priority": 2 },
        { "id": "library", "name": "Library fine", "balance": 12.5, "priority": 3, "overdue": true },
        { "id": "exam", "name": "Exam fee", "balance": 40, "priority": 1 }
    ])
}

#[test]
fn greedy_strategies_follow_their_ordering() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "payments.allocate",
        json!({ "amount": 60, "strategy": "overdue_first", "components": components() }),
    );
    assert_eq!(
        amounts(&res),
        vec![
            ("library".to_string(), 12.5),
            ("exam".to_string(), 40.0),
            ("tuition".to_string(), 7.5)
        ]
    );
    assert_eq!(res["unallocated"].as_f64(), Some(0.0));
    assert_eq!(res["allocations"][0]["name"].as_str(), Some("Library fine"));
    assert_eq!(res["allocations"][0]["remainingBalance"].as_f64(), Some(0.0));

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "payments.allocate",
        json!({ "amount": 200, "strategy": "priority", "components": components() }),
    );
    assert_eq!(
        amounts(&res),
        vec![
            ("exam".to_string(), 40.0),
            ("tuition".to_string(), 100.0),
            ("library".to_string(), 12.5)
        ]
    );
    assert_eq!(res["allocatedTotal"].as_f64(), Some(152.5));
    assert_eq!(res["unallocated"].as_f64(), Some(47.5));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn proportional_split_adds_up_to_the_payment() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "payments.allocate",
        json!({
            "amount": 100,
            "strategy": "proportional",
            "components": [
                { "id": "a", "balance": 100 },
                { "id": "b", "balance": 100 },
                { "id": "c", "balance": 100 }
            ]
        }),
    );
    // 33.333... each; the spare cent goes to the first.
    assert_eq!(
        amounts(&res),
        vec![
            ("a".to_string(), 33.34),
            ("b".to_string(), 33.33),
            ("c".to_string(), 33.33)
        ]
    );
    assert_eq!(res["allocatedTotal"].as_f64(), Some(100.0));

    let bad = request(
        &mut stdin,
        &mut reader,
        "2",
        "payments.allocate",
        json!({ "amount": 0, "strategy": "proportional", "components": components() }),
    );
    assert_eq!(error_code(&bad), "bad_params");
    let bad = request(
        &mut stdin,
        &mut reader,
        "3",
        "payments.allocate",
        json!({ "amount": 10, "strategy": "largest_first", "components": components() }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn validation_reports_errors_and_warnings() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "payments.validate",
        json!({
            "amount": 50,
            "components": components(),
            "allocations": [
                { "componentId": "exam", "amount": 40 },
                { "componentId": "library", "amount": 5 }
            ]
        }),
    );
    let report = &res["report"];
    assert_eq!(report["isValid"].as_bool(), Some(true));
    assert_eq!(report["errors"].as_array().map(|a| a.len()), Some(0));
    assert_eq!(report["warnings"].as_array().map(|a| a.len()), Some(1));

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "payments.validate",
        json!({
            "amount": 20,
            "components": components(),
            "allocations": [
                { "componentId": "library", "amount": 15 },
                { "componentId": "unknown", "amount": 10 }
            ]
        }),
    );
    let report = &res["report"];
    assert_eq!(report["isValid"].as_bool(), Some(false));
    let errors: Vec<&str> = report["errors"]
        .as_array()
        .expect("errors")
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(errors.iter().any(|e| e.contains("exceeds its balance")), "{:?}", errors);
    assert!(errors.iter().any(|e| e.contains("unknown component")), "{:?}", errors);
    assert!(errors.iter().any(|e| e.contains("exceeds payment")), "{:?}", errors);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn validation_separates_malformed_amounts_from_bad_payments() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let malformed = request(
        &mut stdin,
        &mut reader,
        "1",
        "payments.validate",
        json!({ "amount": "abc", "components": components(), "allocations": [] }),
    );
    assert_eq!(error_code(&malformed), "bad_params");

    let missing = request(
        &mut stdin,
        &mut reader,
        "2",
        "payments.validate",
        json!({ "components": components(), "allocations": [] }),
    );
    assert_eq!(error_code(&missing), "bad_params");

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "payments.validate",
        json!({ "amount": -5, "components": components(), "allocations": [] }),
    );
    let report = &res["report"];
    assert_eq!(report["isValid"].as_bool(), Some(false));
    let errors: Vec<&str> = report["errors"]
        .as_array()
        .expect("errors")
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(errors.iter().any(|e| e.contains("must be positive")), "{:?}", errors);

    drop(stdin);
    let _ = child.wait();
}
