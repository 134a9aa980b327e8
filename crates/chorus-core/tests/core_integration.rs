#![allow(clippy::unwrap_used, clippy::expect_used)]

use chorus_core::{write_atomic, ChorusError, SignalParser, SignalType};

#[test]
fn test_transcript_with_mixed_signals() {
    let transcript = "\
Reading src/login.rs
<chorus>PROGRESS:30</chorus>
<chorus>WHATEVER:ignored</chorus>
Tests pass. <chorus>PROGRESS:100</chorus> <chorus>COMPLETE</chorus>
";
    let parser = SignalParser::new();
    let signals = parser.parse_all(transcript);
    let kinds: Vec<SignalType> = signals.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![SignalType::Progress, SignalType::Progress, SignalType::Complete]
    );
    assert_eq!(signals[0].progress(), Some(30));
    assert_eq!(signals[2].progress(), None);
    assert!(parser.is_complete(transcript));
    assert!(!parser.is_blocked(transcript));
}

#[test]
fn test_blocked_reason_and_bad_progress() {
    let parser = SignalParser::new();
    let line = "<chorus>PROGRESS:140</chorus><chorus>BLOCKED:need DATABASE_URL</chorus>";
    assert_eq!(parser.parse(line).unwrap().progress(), None);
    assert_eq!(parser.blocked_reason(line).as_deref(), Some("need DATABASE_URL"));
    assert_eq!(parser.blocked_reason("<chorus>BLOCKED</chorus>").as_deref(), Some(""));
}

#[test]
fn test_error_classes() {
    assert!(ChorusError::SlotUnderflow.is_programming_error());
    assert!(!ChorusError::TaskNotFound("ch-9".into()).is_programming_error());
    let io: ChorusError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(io.to_string().contains("gone"));
}

#[tokio::test]
async fn test_write_atomic_replaces_and_leaves_no_temp() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("nested/state.json");
    write_atomic(&path, b"{\"v\":1}").await.unwrap();
    write_atomic(&path, b"{\"v\":2}").await.unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"v\":2}");

    let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("nested"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers.len(), 1);
}
