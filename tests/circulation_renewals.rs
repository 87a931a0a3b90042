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

fn open_school(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> String {
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = request_ok(
        stdin,
        reader,
        "school",
        "schools.create",
        json!({ "name": "Northside Secondary" }),
    );
    school["schoolId"].as_str().expect("schoolId").to_string()
}

fn add_book(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    school_id: &str,
    title: &str,
    copies: i64,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        "book",
        "books.create",
        json!({
            "schoolId": school_id,
            "title": title,
            "author": "A. Writer",
            "totalCopies": copies
        }),
    );
    res["book"]["id"].as_str().expect("book id").to_string()
}

fn add_member(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    school_id: &str,
    member_type: &str,
    person_id: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        "member",
        "members.create",
        json!({
            "schoolId": school_id,
            "memberType": member_type,
            "personId": person_id,
            "displayName": format!("Person {}", person_id)
        }),
    );
    res["member"]["id"].as_str().expect("member id").to_string()
}

fn issue(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    school_id: &str,
    book_id: &str,
    member_id: &str,
    on: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        "issue",
        "circulation.issue",
        json!({ "schoolId": school_id, "bookId": book_id, "memberId": member_id, "issueDate": on }),
    );
    res["transaction"]["id"].as_str().expect("transaction id").to_string()
}

#[test]
fn renewal_extends_from_as_of_until_max_renewals() {
    let workspace = temp_dir("libraryd-renew-max");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school_id = open_school(&mut stdin, &mut reader, &workspace);
    let book_id = add_book(&mut stdin, &mut reader, &school_id, "Middlemarch", 1);
    let member = add_member(&mut stdin, &mut reader, &school_id, "student", "s-1");
    let txn = issue(&mut stdin, &mut reader, &school_id, &book_id, &member, "2026-01-01");

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "circulation.renew",
        json!({ "schoolId": school_id, "transactionId": txn, "asOf": "2026-01-10" }),
    );
    assert_eq!(res["transaction"]["dueDate"].as_str(), Some("2026-01-24"));
    assert_eq!(res["transaction"]["renewalCount"].as_i64(), Some(1));

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "circulation.renew",
        json!({ "schoolId": school_id, "transactionId": txn, "asOf": "2026-01-20" }),
    );
    assert_eq!(res["transaction"]["dueDate"].as_str(), Some("2026-02-03"));
    assert_eq!(res["transaction"]["renewalCount"].as_i64(), Some(2));

    let refused = request(
        &mut stdin,
        &mut reader,
        "3",
        "circulation.renew",
        json!({ "schoolId": school_id, "transactionId": txn, "asOf": "2026-02-01" }),
    );
    assert_eq!(error_code(&refused), "max_renewals_exceeded");

    let loan = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "circulation.list",
        json!({ "schoolId": school_id, "memberId": member }),
    );
    let rows = loan["transactions"].as_array().expect("transactions");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["dueDate"].as_str(), Some("2026-02-03"));
    assert_eq!(rows[0]["renewalCount"].as_i64(), Some(2));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn renewal_is_blocked_by_another_members_reservation() {
    let workspace = temp_dir("libraryd-renew-reserved");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school_id = open_school(&mut stdin, &mut reader, &workspace);
    let book_id = add_book(&mut stdin, &mut reader, &school_id, "Persuasion", 1);
    let borrower = add_member(&mut stdin, &mut reader, &school_id, "teacher", "t-1");
    let waiting = add_member(&mut stdin, &mut reader, &school_id, "student", "s-1");
    let txn = issue(&mut stdin, &mut reader, &school_id, &book_id, &borrower, "2026-01-01");

    let own = request(
        &mut stdin,
        &mut reader,
        "1",
        "reservations.create",
        json!({ "schoolId": school_id, "bookId": book_id, "memberId": borrower }),
    );
    assert_eq!(error_code(&own), "already_borrowed");

    let reservation = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reservations.create",
        json!({ "schoolId": school_id, "bookId": book_id, "memberId": waiting, "reservationDate": "2026-01-05" }),
    );
    let reservation_id = reservation["reservation"]["id"]
        .as_str()
        .expect("reservation id")
        .to_string();

    let refused = request(
        &mut stdin,
        &mut reader,
        "3",
        "circulation.renew",
        json!({ "schoolId": school_id, "transactionId": txn, "asOf": "2026-01-20" }),
    );
    assert_eq!(error_code(&refused), "reserved_for_another_member");

    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reservations.transition",
        json!({ "schoolId": school_id, "reservationId": reservation_id, "status": "cancelled" }),
    );
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "circulation.renew",
        json!({ "schoolId": school_id, "transactionId": txn, "asOf": "2026-01-20" }),
    );
    // Teachers keep books for 30 days.
    assert_eq!(res["transaction"]["dueDate"].as_str(), Some("2026-02-19"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn overdue_sweep_flags_past_due_loans_and_renewal_clears_it() {
    let workspace = temp_dir("libraryd-overdue-sweep");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school_id = open_school(&mut stdin, &mut reader, &workspace);
    let book_id = add_book(&mut stdin, &mut reader, &school_id, "Kim", 2);
    let a = add_member(&mut stdin, &mut reader, &school_id, "student", "s-1");
    let b = add_member(&mut stdin, &mut reader, &school_id, "teacher", "t-1");
    let late = issue(&mut stdin, &mut reader, &school_id, &book_id, &a, "2026-01-01");
    let _fresh = issue(&mut stdin, &mut reader, &school_id, &book_id, &b, "2026-01-01");

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "circulation.markOverdue",
        json!({ "schoolId": school_id, "asOf": "2026-01-20" }),
    );
    let ids: Vec<&str> = res["overdueTransactionIds"]
        .as_array()
        .expect("ids")
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(ids, vec![late.as_str()]);

    let overdue = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "circulation.list",
        json!({ "schoolId": school_id, "status": "overdue" }),
    );
    assert_eq!(overdue["transactions"].as_array().map(|a| a.len()), Some(1));

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "circulation.renew",
        json!({ "schoolId": school_id, "transactionId": late, "asOf": "2026-01-20" }),
    );
    assert_eq!(res["transaction"]["status"].as_str(), Some("issued"));

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "circulation.markOverdue",
        json!({ "schoolId": school_id, "asOf": "2026-01-21" }),
    );
    assert_eq!(res["overdueTransactionIds"].as_array().map(|a| a.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
