//! Native Output Parser (C6): turns the structured output of native runners
//! (`go test -json`, `cargo test`'s libtest text output) into the same
//! normalized events IPC-based adapters emit.
//!
//! There is no real per-runner detection in this implementation (§A5), so
//! rather than pick one grammar up front, [`NativeParser::feed_line`] tries
//! each line as `go test -json` first and falls back to libtest text. Lines
//! matching neither are ignored, mirroring the codec's resilience rule for
//! unrecognized input (spec.md §4.1 parser rule iii, generalized to this
//! producer).
//!
//! Polling is used to read `output.log` (rather than a watch primitive)
//! specifically because this process is the one writing that file: watching
//! our own writes would be a feedback loop. spec.md §5 fixes the poll
//! interval at ≤10 ms.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

use crate::event::{
    CollectionFinishPayload, Event, GroupOutputPayload, GroupPath, GroupResultPayload, Totals,
    TestCasePayload, WireStatus,
};

#[derive(Debug, Deserialize)]
struct GoTestRecord {
    #[serde(rename = "Action")]
    action: String,
    #[serde(rename = "Package")]
    package: Option<String>,
    #[serde(rename = "Test")]
    test: Option<String>,
    #[serde(rename = "Output")]
    output: Option<String>,
    #[serde(rename = "Elapsed")]
    elapsed: Option<f64>,
}

/// Incremental parser state. One instance per run; lines are fed in stdout
/// order across both `go test -json` and `cargo test` formats (only one is
/// ever actually present for a given child, but the parser doesn't need to
/// know which up front).
#[derive(Default)]
pub struct NativeParser {
    /// Per Go package, the name of the most recently started test — used to
    /// attribute bare `Output` records that carry no `Test` field of their
    /// own, per spec.md §9's "best-effort" attribution rule.
    go_running: HashMap<String, String>,
    /// The crate name established by the most recent `Running ... (...)`
    /// header line in cargo's libtest output.
    cargo_current_crate: Option<String>,
    cargo_started_crates: std::collections::HashSet<String>,
}

fn group_path(package: &str) -> GroupPath {
    GroupPath {
        group_name: package.to_string(),
        parent_names: vec![],
    }
}

impl NativeParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line of output and returns zero or more normalized events.
    pub fn feed_line(&mut self, line: &str) -> Vec<Event> {
        if line.trim().is_empty() {
            return vec![];
        }
        if let Ok(record) = serde_json::from_str::<GoTestRecord>(line) {
            return self.handle_go_record(record);
        }
        self.handle_cargo_line(line)
    }

    fn handle_go_record(&mut self, record: GoTestRecord) -> Vec<Event> {
        let Some(package) = record.package.clone() else {
            return vec![];
        };

        match record.action.as_str() {
            "start" => vec![Event::GroupStart(group_path(&package))],
            "run" => {
                if let Some(test) = &record.test {
                    self.go_running.insert(package.clone(), test.clone());
                }
                vec![]
            }
            "output" => {
                let Some(chunk) = record.output else { return vec![] };
                let test_name = record.test.or_else(|| self.go_running.get(&package).cloned());
                match test_name {
                    Some(test) => {
                        let (parents, name) = split_go_subtest(&package, &test);
                        vec![Event::GroupStdout(GroupOutputPayload {
                            group_name: name,
                            parent_names: parents,
                            chunk,
                        })]
                    }
                    None => vec![Event::GroupStdout(GroupOutputPayload {
                        group_name: package,
                        parent_names: vec![],
                        chunk,
                    })],
                }
            }
            "pass" | "fail" | "skip" => {
                let status = match record.action.as_str() {
                    "pass" => WireStatus::Pass,
                    "fail" => WireStatus::Fail,
                    _ => WireStatus::Skip,
                };
                let duration = record.elapsed.map(|s| (s * 1000.0).round() as u64);

                match &record.test {
                    Some(test) => {
                        self.go_running.remove(&package);
                        let (parents, name) = split_go_subtest(&package, test);
                        vec![Event::TestCase(TestCasePayload {
                            test_name: name,
                            parent_names: parents,
                            status,
                            duration,
                            error: None,
                            stdout: None,
                            stderr: None,
                        })]
                    }
                    None => vec![Event::GroupResult(GroupResultPayload {
                        group_name: package,
                        parent_names: vec![],
                        status,
                        duration,
                        totals: None,
                    })],
                }
            }
            _ => vec![],
        }
    }

    fn handle_cargo_line(&mut self, line: &str) -> Vec<Event> {
        let trimmed = line.trim();

        if let Some(crate_name) = parse_cargo_running_header(trimmed) {
            self.cargo_current_crate = Some(crate_name.clone());
            let mut events = vec![];
            if self.cargo_started_crates.insert(crate_name.clone()) {
                events.push(Event::GroupStart(group_path(&crate_name)));
            }
            return events;
        }

        if let Some((name, status)) = parse_cargo_test_line(trimmed) {
            let Some(crate_name) = self.cargo_current_crate.clone() else {
                return vec![];
            };
            let (parents, test_name) = split_module_path(&crate_name, &name);
            return vec![Event::TestCase(TestCasePayload {
                test_name,
                parent_names: parents,
                status,
                duration: None,
                error: None,
                stdout: None,
                stderr: None,
            })];
        }

        if let Some(summary) = parse_cargo_summary(trimmed) {
            let Some(crate_name) = self.cargo_current_crate.take() else {
                return vec![];
            };
            return vec![Event::GroupResult(GroupResultPayload {
                group_name: crate_name,
                parent_names: vec![],
                status: summary.status,
                duration: summary.duration_ms,
                totals: Some(summary.totals),
            })];
        }

        if trimmed == "running 0 tests" {
            if let Some(crate_name) = self.cargo_current_crate.clone() {
                return vec![Event::CollectionFinish(CollectionFinishPayload { collected: 0 }), Event::GroupResult(GroupResultPayload {
                    group_name: crate_name,
                    parent_names: vec![],
                    status: WireStatus::Skip,
                    duration: None,
                    totals: None,
                })];
            }
        }

        vec![]
    }
}

/// Go subtests use `/` to separate nested levels in the test name
/// (`TestFoo/bar/baz`). Translates that into a normalized group path rooted
/// at the package: `parents = [package, TestFoo, bar]`, `name = baz`.
fn split_go_subtest(package: &str, test: &str) -> (Vec<String>, String) {
    let mut segments: Vec<String> = vec![package.to_string()];
    let mut parts: Vec<&str> = test.split('/').collect();
    let name = parts.pop().unwrap_or(test).to_string();
    segments.extend(parts.into_iter().map(str::to_string));
    (segments, name)
}

/// `cargo test` has no native subgroup separator; a test's `::`-delimited
/// module path is used to build nested groups instead, the Rust-native
/// equivalent of Go's package/test hierarchy (per DESIGN.md).
fn split_module_path(crate_name: &str, full_name: &str) -> (Vec<String>, String) {
    let mut segments: Vec<String> = vec![crate_name.to_string()];
    let mut parts: Vec<&str> = full_name.split("::").collect();
    let name = parts.pop().unwrap_or(full_name).to_string();
    segments.extend(parts.into_iter().map(str::to_string));
    (segments, name)
}

/// Parses `     Running unittests src/lib.rs (target/debug/deps/foo-a1b2c3d4)`
/// into `foo`, stripping the cargo-assigned content hash suffix.
fn parse_cargo_running_header(line: &str) -> Option<String> {
    if !line.starts_with("Running ") {
        return None;
    }
    let open = line.rfind('(')?;
    let close = line.rfind(')')?;
    if close <= open {
        return None;
    }
    let path = &line[open + 1..close];
    let basename = path.rsplit('/').next().unwrap_or(path);
    Some(strip_hash_suffix(basename))
}

fn strip_hash_suffix(name: &str) -> String {
    if let Some(idx) = name.rfind('-') {
        let suffix = &name[idx + 1..];
        if suffix.len() >= 7 && suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return name[..idx].to_string();
        }
    }
    name.to_string()
}

/// Parses `test module::tests::it_works ... ok` (or `FAILED`/`ignored`).
fn parse_cargo_test_line(line: &str) -> Option<(String, WireStatus)> {
    let rest = line.strip_prefix("test ")?;
    let (name, outcome) = rest.rsplit_once(" ... ")?;
    let status = match outcome.trim() {
        "ok" => WireStatus::Pass,
        "FAILED" => WireStatus::Fail,
        "ignored" => WireStatus::Skip,
        _ => return None,
    };
    Some((name.trim().to_string(), status))
}

struct CargoSummary {
    status: WireStatus,
    totals: Totals,
    duration_ms: Option<u64>,
}

/// Parses the libtest summary line:
/// `test result: ok. 3 passed; 0 failed; 1 ignored; 0 measured; 0 filtered out; finished in 0.12s`
fn parse_cargo_summary(line: &str) -> Option<CargoSummary> {
    let rest = line.strip_prefix("test result: ")?;
    let (verdict, rest) = rest.split_once('.')?;
    let status = match verdict.trim() {
        "ok" => WireStatus::Pass,
        "FAILED" => WireStatus::Fail,
        _ => return None,
    };

    let mut passed = 0u32;
    let mut failed = 0u32;
    let mut ignored = 0u32;
    let mut duration_ms = None;

    for field in rest.split(';') {
        let field = field.trim();
        if let Some(n) = field.strip_suffix(" passed") {
            passed = n.trim().parse().unwrap_or(0);
        } else if let Some(n) = field.strip_suffix(" failed") {
            failed = n.trim().parse().unwrap_or(0);
        } else if let Some(n) = field.strip_suffix(" ignored") {
            ignored = n.trim().parse().unwrap_or(0);
        } else if let Some(rest) = field.strip_prefix("finished in ") {
            if let Some(secs_str) = rest.strip_suffix('s') {
                if let Ok(secs) = secs_str.parse::<f64>() {
                    duration_ms = Some((secs * 1000.0).round() as u64);
                }
            }
        }
    }

    let total = passed + failed + ignored;
    let status = if failed > 0 { WireStatus::Fail } else { status };

    Some(CargoSummary {
        status,
        totals: Totals {
            passed,
            failed,
            skipped: ignored,
            total,
        },
        duration_ms,
    })
}

/// Polls `output.log` at `poll_interval`, feeding each complete line to a
/// [`NativeParser`] and forwarding the resulting events. Exits when
/// `shutdown` fires, after one final pass to pick up trailing bytes.
pub async fn run(
    path: PathBuf,
    poll_interval: Duration,
    events: mpsc::Sender<Event>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut parser = NativeParser::new();
    let mut cursor: u64 = 0;
    let mut line_buffer: Vec<u8> = Vec::new();
    let mut ticker = interval(poll_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cursor = poll_once(&path, cursor, &mut line_buffer, &mut parser, &events).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    poll_once(&path, cursor, &mut line_buffer, &mut parser, &events).await;
                    break;
                }
            }
        }
    }
}

async fn poll_once(
    path: &std::path::Path,
    cursor: u64,
    line_buffer: &mut Vec<u8>,
    parser: &mut NativeParser,
    events: &mpsc::Sender<Event>,
) -> u64 {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return cursor;
    };
    let Ok(metadata) = file.metadata().await else {
        return cursor;
    };
    let len = metadata.len();
    if len <= cursor {
        return cursor;
    }
    if file.seek(SeekFrom::Start(cursor)).await.is_err() {
        return cursor;
    }

    let mut buf = Vec::with_capacity((len - cursor) as usize);
    if file.read_to_end(&mut buf).await.is_err() {
        return cursor;
    }
    let new_cursor = cursor + buf.len() as u64;

    line_buffer.extend_from_slice(&buf);
    while let Some(pos) = line_buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = line_buffer.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line[..line.len() - 1]);
        for event in parser.feed_line(&text) {
            if events.send(event).await.is_err() {
                return new_cursor;
            }
        }
    }

    new_cursor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_package_start_and_pass() {
        let mut parser = NativeParser::new();
        let events = parser.feed_line(r#"{"Action":"start","Package":"example.com/foo"}"#);
        assert!(matches!(events[0], Event::GroupStart(_)));

        let events = parser.feed_line(
            r#"{"Action":"pass","Package":"example.com/foo","Test":"TestAdd","Elapsed":0.01}"#,
        );
        match &events[0] {
            Event::TestCase(p) => {
                assert_eq!(p.test_name, "TestAdd");
                assert_eq!(p.status, WireStatus::Pass);
                assert_eq!(p.duration, Some(10));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn go_package_level_result_with_no_test() {
        let mut parser = NativeParser::new();
        let events =
            parser.feed_line(r#"{"Action":"pass","Package":"example.com/foo","Elapsed":0.5}"#);
        match &events[0] {
            Event::GroupResult(p) => {
                assert_eq!(p.group_name, "example.com/foo");
                assert_eq!(p.status, WireStatus::Pass);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn go_subtest_nesting_splits_on_slash() {
        let mut parser = NativeParser::new();
        let events = parser.feed_line(
            r#"{"Action":"fail","Package":"pkg","Test":"TestSuite/case_one","Elapsed":0.1}"#,
        );
        match &events[0] {
            Event::TestCase(p) => {
                assert_eq!(p.parent_names, vec!["pkg".to_string(), "TestSuite".to_string()]);
                assert_eq!(p.test_name, "case_one");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn go_output_attributed_to_running_test() {
        let mut parser = NativeParser::new();
        parser.feed_line(r#"{"Action":"run","Package":"pkg","Test":"TestX"}"#);
        let events =
            parser.feed_line(r#"{"Action":"output","Package":"pkg","Test":"TestX","Output":"hi\n"}"#);
        match &events[0] {
            Event::GroupStdout(p) => {
                assert_eq!(p.group_name, "TestX");
                assert_eq!(p.parent_names, vec!["pkg".to_string()]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn cargo_header_and_test_lines() {
        let mut parser = NativeParser::new();
        let events = parser.feed_line(
            "     Running unittests src/lib.rs (target/debug/deps/mycrate-a1b2c3d4e5)",
        );
        assert!(matches!(events[0], Event::GroupStart(_)));

        let events = parser.feed_line("test module::tests::it_works ... ok");
        match &events[0] {
            Event::TestCase(p) => {
                assert_eq!(p.test_name, "it_works");
                assert_eq!(p.parent_names, vec!["mycrate".to_string(), "module".to_string(), "tests".to_string()]);
                assert_eq!(p.status, WireStatus::Pass);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn cargo_failed_test_line() {
        let mut parser = NativeParser::new();
        parser.feed_line("     Running unittests src/lib.rs (target/debug/deps/mycrate-a1b2c3d4e5)");
        let events = parser.feed_line("test bad_test ... FAILED");
        match &events[0] {
            Event::TestCase(p) => assert_eq!(p.status, WireStatus::Fail),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn cargo_summary_line_produces_group_result_with_totals() {
        let mut parser = NativeParser::new();
        parser.feed_line("     Running unittests src/lib.rs (target/debug/deps/mycrate-a1b2c3d4e5)");
        let events = parser.feed_line(
            "test result: ok. 3 passed; 0 failed; 1 ignored; 0 measured; 0 filtered out; finished in 0.12s",
        );
        match &events[0] {
            Event::GroupResult(p) => {
                assert_eq!(p.group_name, "mycrate");
                assert_eq!(p.status, WireStatus::Pass);
                let totals = p.totals.as_ref().unwrap();
                assert_eq!(totals.passed, 3);
                assert_eq!(totals.skipped, 1);
                assert_eq!(totals.total, 4);
                assert_eq!(p.duration, Some(120));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn strip_hash_suffix_removes_cargo_content_hash() {
        assert_eq!(strip_hash_suffix("mycrate-a1b2c3d4e5"), "mycrate");
        assert_eq!(strip_hash_suffix("not-a-hash"), "not-a-hash");
    }
}
