use std::collections::BTreeMap;
use std::time;

use httpmock::prelude::*;
use serde_json::json;

use testkit::changes::{LongPollOptions, PollMode};
use testkit::error::ChangesFeedError;
use testkit::{ChangesFeedTracker, FeedStatus, Sequence};

fn tracker(server: &MockServer) -> ChangesFeedTracker {
    ChangesFeedTracker::new(&server.base_url(), "db")
        .expect("failed to build tracker")
        .with_credentials("alice", "pass")
        .with_poll_delay(time::Duration::ZERO)
}

fn change(seq: u64, id: &str, rev: &str) -> serde_json::Value {
    json!({"seq": seq, "id": id, "changes": [{"rev": rev}]})
}

#[tokio::test]
async fn test_long_poll_until_termination_doc() {
    let server = MockServer::start();
    let first = server.mock(|when, then| {
        when.method(POST)
            .path("/db/_changes")
            .header_exists("authorization")
            .json_body_partial(r#"{"feed": "longpoll", "since": "0"}"#);
        then.status(200).json_body(json!({
            "results": [change(1, "doc-1", "1-a")],
            "last_seq": 1,
        }));
    });
    let second = server.mock(|when, then| {
        when.method(POST)
            .path("/db/_changes")
            .json_body_partial(r#"{"since": 1}"#);
        then.status(200).json_body(json!({
            "results": [
                change(2, "_user/alice", "1-u"),
                change(3, "doc-2", "1-b"),
                change(4, "terminator", "1-t"),
                change(5, "doc-3", "1-c"),
            ],
            "last_seq": 5,
        }));
    });

    let outcome = tracker(&server)
        .with_termination_doc("terminator")
        .long_poll(&LongPollOptions::default())
        .await;

    first.assert();
    second.assert();
    assert!(matches!(outcome.status, FeedStatus::Completed));
    assert_eq!(outcome.last_sequence, Sequence::Number(5));
    assert_eq!(
        outcome.docs(),
        BTreeMap::from([
            ("doc-1".to_owned(), "1-a".to_owned()),
            ("doc-2".to_owned(), "1-b".to_owned()),
            ("doc-3".to_owned(), "1-c".to_owned()),
        ])
    );
}

#[tokio::test]
async fn test_long_poll_failure_keeps_partial_results() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST)
            .path("/db/_changes")
            .json_body_partial(r#"{"since": "0"}"#);
        then.status(200).json_body(json!({
            "results": [change(1, "doc-1", "1-a")],
            "last_seq": 1,
        }));
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/db/_changes")
            .json_body_partial(r#"{"since": 1}"#);
        then.status(500).body("internal error");
    });

    let tracker = tracker(&server).with_termination_doc("terminator");
    let outcome = tracker.long_poll(&LongPollOptions::default()).await;

    match &outcome.status {
        FeedStatus::Failed(error) => {
            assert_eq!(error.status(), Some(http::StatusCode::INTERNAL_SERVER_ERROR))
        }
        other => panic!("unexpected status: {:?}", other),
    }
    assert_eq!(outcome.events.len(), 1);
    assert_eq!(outcome.events[0].doc_id, "doc-1");
    assert_eq!(tracker.last_sequence(), Sequence::Number(1));
}

#[tokio::test]
async fn test_single_shot_returns_after_first_changes() {
    let server = MockServer::start();
    let poll = server.mock(|when, then| {
        when.method(POST).path("/db/_changes");
        then.status(200).json_body(json!({
            "results": [change(7, "doc-1", "2-b")],
            "last_seq": 7,
        }));
    });

    let outcome = tracker(&server)
        .long_poll(&LongPollOptions {
            timeout: time::Duration::from_secs(1),
            mode: PollMode::SingleShot,
        })
        .await;

    poll.assert_hits(1);
    assert!(matches!(outcome.status, FeedStatus::Completed));
    assert_eq!(outcome.events[0].sequence, Some(Sequence::Number(7)));
}

#[tokio::test]
async fn test_single_shot_zero_timeout_returns_empty() {
    let server = MockServer::start();
    let poll = server.mock(|when, then| {
        when.method(POST)
            .path("/db/_changes")
            .json_body_partial(r#"{"timeout": 0}"#);
        then.status(200)
            .json_body(json!({"results": [], "last_seq": "12:3"}));
    });

    let outcome = tracker(&server)
        .long_poll(&LongPollOptions {
            timeout: time::Duration::ZERO,
            mode: PollMode::SingleShot,
        })
        .await;

    poll.assert_hits(1);
    assert!(matches!(outcome.status, FeedStatus::Completed));
    assert!(outcome.events.is_empty());
    assert_eq!(outcome.last_sequence, Sequence::Text("12:3".to_owned()));
}

#[tokio::test]
async fn test_continuous_closed_by_server() {
    let server = MockServer::start();
    let feed = server.mock(|when, then| {
        when.method(POST)
            .path("/db/_changes")
            .json_body_partial(r#"{"feed": "continuous"}"#);
        then.status(200).body(format!(
            "{}\n\n{}\n{}\n{}\n",
            change(1, "doc-1", "1-a"),
            json!({"seq": 2, "id": "doc-2", "deleted": true, "changes": [{"rev": "2-d"}]}),
            change(3, "_user/alice", "1-u"),
            json!({"last_seq": 3}),
        ));
    });

    let outcome = tracker(&server).continuous().await;

    feed.assert();
    assert!(matches!(outcome.status, FeedStatus::Closed));
    assert_eq!(outcome.events.len(), 2);
    assert!(outcome.events[1].deleted);
    assert_eq!(outcome.last_sequence, Sequence::Number(3));
}

#[tokio::test]
async fn test_continuous_stops_at_termination_doc() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/db/_changes");
        then.status(200).body(format!(
            "{}\n{}\n{}",
            change(1, "doc-1", "1-a"),
            change(2, "terminator", "1-t"),
            change(3, "doc-3", "1-c"),
        ));
    });

    let outcome = tracker(&server)
        .with_termination_doc("terminator")
        .continuous()
        .await;

    assert!(matches!(outcome.status, FeedStatus::Completed));
    assert_eq!(
        outcome.docs(),
        BTreeMap::from([("doc-1".to_owned(), "1-a".to_owned())])
    );
}

#[tokio::test]
async fn test_continuous_rejected() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/db/_changes");
        then.status(401).body("login required");
    });

    let outcome = tracker(&server).continuous().await;

    assert!(matches!(
        outcome.status,
        FeedStatus::Failed(ChangesFeedError::Status { .. })
    ));
    assert!(outcome.events.is_empty());
}

#[tokio::test]
async fn test_sessions_reset_state() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/db/_changes");
        then.status(200)
            .body(format!("{}\n", change(1, "doc-1", "1-a")));
    });

    let tracker = tracker(&server);
    let first = tracker.continuous().await;
    let second = tracker.continuous().await;

    assert_eq!(first.events.len(), 1);
    assert_eq!(second.events.len(), 1);
    assert_eq!(tracker.docs().len(), 1);
}

#[tokio::test]
async fn test_single_shot_returns_on_quiet_feed() {
    let server = MockServer::start();
    let poll = server.mock(|when, then| {
        when.method(POST)
            .path("/db/_changes")
            .json_body_partial(r#"{"timeout": 1000}"#);
        then.status(200)
            .json_body(json!({"results": [], "last_seq": 4}));
    });

    let outcome = tokio::time::timeout(
        time::Duration::from_secs(5),
        tracker(&server).long_poll(&LongPollOptions {
            timeout: time::Duration::from_secs(1),
            mode: PollMode::SingleShot,
        }),
    )
    .await
    .expect("single shot poll returns");

    poll.assert_hits(1);
    assert!(matches!(outcome.status, FeedStatus::Completed));
    assert!(outcome.events.is_empty());
    assert_eq!(outcome.last_sequence, Sequence::Number(4));
}

#[tokio::test]
async fn test_single_shot_skips_bookkeeping_only_responses() {
    let server = MockServer::start();
    let bookkeeping = server.mock(|when, then| {
        when.method(POST)
            .path("/db/_changes")
            .json_body_partial(r#"{"since": "0"}"#);
        then.status(200).json_body(json!({
            "results": [change(1, "_user/alice", "1-u")],
            "last_seq": 1,
        }));
    });
    let changes = server.mock(|when, then| {
        when.method(POST)
            .path("/db/_changes")
            .json_body_partial(r#"{"since": 1}"#);
        then.status(200).json_body(json!({
            "results": [change(2, "doc-1", "1-a")],
            "last_seq": 2,
        }));
    });

    let outcome = tracker(&server)
        .long_poll(&LongPollOptions {
            timeout: time::Duration::from_secs(1),
            mode: PollMode::SingleShot,
        })
        .await;

    bookkeeping.assert_hits(1);
    changes.assert_hits(1);
    assert_eq!(
        outcome.docs(),
        BTreeMap::from([("doc-1".to_owned(), "1-a".to_owned())])
    );
}

#[tokio::test]
async fn test_duplicate_doc_in_one_response_does_not_fail() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/db/_changes");
        then.status(200).json_body(json!({
            "results": [
                change(1, "doc-1", "1-a"),
                change(2, "doc-1", "1-a"),
                change(3, "terminator", "1-t"),
            ],
            "last_seq": 3,
        }));
    });

    let outcome = tracker(&server)
        .with_termination_doc("terminator")
        .long_poll(&LongPollOptions::default())
        .await;

    assert!(matches!(outcome.status, FeedStatus::Completed));
    assert_eq!(outcome.events.len(), 1);
    assert_eq!(outcome.events[0].doc_id, "doc-1");
}
