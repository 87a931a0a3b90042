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
fn late_return_derives_fine_after_grace_and_cap() {
    let workspace = temp_dir("libraryd-return-fine");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school_id = open_school(&mut stdin, &mut reader, &workspace);

    request_ok(
        &mut stdin,
        &mut reader,
        "cfg",
        "librarySettings.update",
        json!({
            "schoolId": school_id,
            "patch": { "finePerDay": "1.25", "gracePeriodDays": 2, "maxFineAmount": 10 }
        }),
    );
    let book_id = add_book(&mut stdin, &mut reader, &school_id, "Ivanhoe", 1);
    let member = add_member(&mut stdin, &mut reader, &school_id, "student", "s-1");

    // Due 2026-03-15; five days late, two of them forgiven.
    let txn = issue(&mut stdin, &mut reader, &school_id, &book_id, &member, "2026-03-01");
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "circulation.return",
        json!({ "schoolId": school_id, "transactionId": txn, "returnDate": "2026-03-20" }),
    );
    assert_eq!(res["daysLate"].as_i64(), Some(5));
    assert_eq!(res["fineAmount"].as_f64(), Some(3.75));
    assert_eq!(res["transaction"]["status"].as_str(), Some("returned"));
    assert_eq!(res["transaction"]["returnDate"].as_str(), Some("2026-03-20"));
    assert_eq!(res["transaction"]["finePaid"].as_bool(), Some(false));

    let again = request(
        &mut stdin,
        &mut reader,
        "2",
        "circulation.return",
        json!({ "schoolId": school_id, "transactionId": txn, "returnDate": "2026-03-21" }),
    );
    assert_eq!(error_code(&again), "already_returned");

    // 45 days late would be 53.75 before the cap.
    let txn2 = issue(&mut stdin, &mut reader, &school_id, &book_id, &member, "2026-04-01");
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "circulation.return",
        json!({ "schoolId": school_id, "transactionId": txn2, "returnDate": "2026-05-30" }),
    );
    assert_eq!(res["daysLate"].as_i64(), Some(45));
    assert_eq!(res["fineAmount"].as_f64(), Some(10.0));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "members.get",
        json!({ "schoolId": school_id, "memberId": member }),
    );
    assert_eq!(summary["outstandingFines"].as_f64(), Some(13.75));

    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "circulation.payFine",
        json!({ "schoolId": school_id, "transactionId": txn }),
    );
    assert_eq!(paid["amountPaid"].as_f64(), Some(3.75));
    let twice = request(
        &mut stdin,
        &mut reader,
        "6",
        "circulation.payFine",
        json!({ "schoolId": school_id, "transactionId": txn }),
    );
    assert_eq!(error_code(&twice), "no_fine_due");

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "members.get",
        json!({ "schoolId": school_id, "memberId": member }),
    );
    assert_eq!(summary["outstandingFines"].as_f64(), Some(10.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn on_time_and_overridden_returns_record_no_debt() {
    let workspace = temp_dir("libraryd-return-override");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school_id = open_school(&mut stdin, &mut reader, &workspace);
    let book_id = add_book(&mut stdin, &mut reader, &school_id, "Walden", 1);
    let member = add_member(&mut stdin, &mut reader, &school_id, "staff", "st-1");

    // Staff default is 21 days.
    let txn = issue(&mut stdin, &mut reader, &school_id, &book_id, &member, "2026-02-01");
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "circulation.return",
        json!({ "schoolId": school_id, "transactionId": txn, "returnDate": "2026-02-22" }),
    );
    assert_eq!(res["daysLate"].as_i64(), Some(0));
    assert_eq!(res["fineAmount"].as_f64(), Some(0.0));
    assert_eq!(res["transaction"]["finePaid"].as_bool(), Some(true));

    let txn = issue(&mut stdin, &mut reader, &school_id, &book_id, &member, "2026-03-01");
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "circulation.return",
        json!({
            "schoolId": school_id,
            "transactionId": txn,
            "returnDate": "2026-04-30",
            "fineAmount": 0
        }),
    );
    assert_eq!(res["fineAmount"].as_f64(), Some(0.0));
    assert_eq!(res["transaction"]["finePaid"].as_bool(), Some(true));

    let txn = issue(&mut stdin, &mut reader, &school_id, &book_id, &member, "2026-05-01");
    let bad = request(
        &mut stdin,
        &mut reader,
        "3",
        "circulation.return",
        json!({ "schoolId": school_id, "transactionId": txn, "fineAmount": -1 }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    let book = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "books.get",
        json!({ "schoolId": school_id, "bookId": book_id }),
    );
    assert_eq!(book["book"]["availableCopies"].as_i64(), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn return_hands_copy_to_earliest_pending_reservation() {
    let workspace = temp_dir("libraryd-return-promote");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school_id = open_school(&mut stdin, &mut reader, &workspace);
    let book_id = add_book(&mut stdin, &mut reader, &school_id, "Beloved", 1);
    let holder = add_member(&mut stdin, &mut reader, &school_id, "student", "s-1");
    let first = add_member(&mut stdin, &mut reader, &school_id, "student", "s-2");
    let second = add_member(&mut stdin, &mut reader, &school_id, "student", "s-3");

    let txn = issue(&mut stdin, &mut reader, &school_id, &book_id, &holder, "2026-06-01");
    for (id, member, on) in [("r1", &first, "2026-06-02"), ("r2", &second, "2026-06-03")] {
        let res = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "reservations.create",
            json!({ "schoolId": school_id, "bookId": book_id, "memberId": member, "reservationDate": on }),
        );
        assert_eq!(res["reservation"]["status"].as_str(), Some("pending"));
    }

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "circulation.return",
        json!({ "schoolId": school_id, "transactionId": txn, "returnDate": "2026-06-10" }),
    );
    let promoted = &res["promotedReservation"];
    assert_eq!(promoted["memberId"].as_str(), Some(first.as_str()));
    assert_eq!(promoted["status"].as_str(), Some("available"));
    assert_eq!(promoted["availableDate"].as_str(), Some("2026-06-10"));
    assert_eq!(promoted["expiryDate"].as_str(), Some("2026-06-13"));

    // The only shelf copy is now held.
    let blocked = request(
        &mut stdin,
        &mut reader,
        "2",
        "circulation.issue",
        json!({ "schoolId": school_id, "bookId": book_id, "memberId": second, "issueDate": "2026-06-11" }),
    );
    assert_eq!(error_code(&blocked), "reserved_for_another_member");

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "circulation.issue",
        json!({ "schoolId": school_id, "bookId": book_id, "memberId": first, "issueDate": "2026-06-11" }),
    );
    assert_eq!(
        res["fulfilledReservationId"].as_str(),
        promoted["id"].as_str()
    );

    let book = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "books.get",
        json!({ "schoolId": school_id, "bookId": book_id }),
    );
    assert_eq!(book["book"]["availableCopies"].as_i64(), Some(0));
    assert_eq!(book["heldCopies"].as_i64(), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
