mod common;

use common::*;
use std::sync::atomic::Ordering;
use timeline_sync::{AbortReason, FeedApiError, FeedCursorWalker, PostAction, Result, SessionState, WalkTermination};

fn walker(harness: &Harness) -> FeedCursorWalker {
    FeedCursorWalker::new(harness.api.clone(), 50, 10, 1000)
}

#[tokio::test]
async fn test_walks_to_exhaustion_without_checkpoint() -> Result<()> {
    init_tracing();
    let api = ScriptedFeedApi::with_pages(vec![
        Ok(page(vec![item_at("third", ts(2024, 3, 6, 12)), item_at("second", ts(2024, 3, 5, 12))], Some("c1"))),
        Ok(page(vec![item_at("first", ts(2024, 3, 4, 12))], None)),
    ]);
    let harness = Harness::new(api);
    let mut session = harness.sessions.create("alice", &credential()).await?;

    let outcome = walker(&harness).walk(&harness.sessions, &mut session, &credential(), None).await;

    assert_eq!(outcome.termination, WalkTermination::Exhausted);
    assert_eq!(outcome.posts.iter().map(|p| p.text.as_str()).collect::<Vec<_>>(), vec!["third", "second", "first"]);
    assert_eq!(outcome.pages_fetched, 2);
    assert_eq!(outcome.previous_checkpoint, None);
    assert_eq!(outcome.checkpoint, Some(ts(2024, 3, 6, 12)));
    assert_eq!(harness.api.requested_cursors(), vec![None, Some("c1".to_string())]);
    Ok(())
}

#[tokio::test]
async fn test_stops_at_first_post_not_newer_than_checkpoint() -> Result<()> {
    init_tracing();
    let api = ScriptedFeedApi::with_pages(vec![
        Ok(page(vec![item_at("new", ts(2024, 3, 6, 12))], Some("c1"))),
        Ok(page(
            vec![item_at("boundary", ts(2024, 3, 5, 12)), item_at("old", ts(2024, 3, 4, 12))],
            Some("c2"),
        )),
        Ok(page(vec![item_at("never fetched", ts(2024, 3, 1, 12))], None)),
    ]);
    let harness = Harness::new(api);
    let mut session = harness.sessions.create("alice", &credential()).await?;
    let checkpoint = Some(ts(2024, 3, 5, 12));

    let outcome = walker(&harness).walk(&harness.sessions, &mut session, &credential(), checkpoint).await;

    assert_eq!(outcome.termination, WalkTermination::CaughtUp);
    assert_eq!(outcome.posts.len(), 1);
    assert_eq!(outcome.posts[0].text, "new");
    assert_eq!(outcome.checkpoint, Some(ts(2024, 3, 6, 12)));
    assert_eq!(outcome.pages_fetched, 2);
    Ok(())
}

#[tokio::test]
async fn test_items_without_usable_timestamp_are_skipped() -> Result<()> {
    init_tracing();
    let api = ScriptedFeedApi::with_pages(vec![Ok(page(
        vec![
            item("bob.bsky.social", "no time", None),
            item("bob.bsky.social", "bad time", Some("tuesday")),
            item_at("good", ts(2024, 3, 6, 12)),
        ],
        None,
    ))]);
    let harness = Harness::new(api);
    let mut session = harness.sessions.create("alice", &credential()).await?;

    let outcome = walker(&harness).walk(&harness.sessions, &mut session, &credential(), None).await;

    assert_eq!(outcome.posts.len(), 1);
    assert_eq!(outcome.posts[0].text, "good");
    Ok(())
}

#[tokio::test]
async fn test_empty_feed_keeps_checkpoint() -> Result<()> {
    init_tracing();
    let harness = Harness::new(ScriptedFeedApi::default());
    let mut session = harness.sessions.create("alice", &credential()).await?;
    let checkpoint = Some(ts(2024, 3, 5, 12));

    let outcome = walker(&harness).walk(&harness.sessions, &mut session, &credential(), checkpoint).await;

    assert!(outcome.posts.is_empty());
    assert_eq!(outcome.termination, WalkTermination::Exhausted);
    assert_eq!(outcome.checkpoint, checkpoint);
    Ok(())
}

#[tokio::test]
async fn test_post_cap_ends_walk_and_advances_checkpoint() -> Result<()> {
    init_tracing();
    let items = (0..5).map(|i| item_at(&format!("post {}", i), ts(2024, 3, 10 - i, 12))).collect();
    let harness = Harness::new(ScriptedFeedApi::with_pages(vec![Ok(page(items, Some("more")))]));
    let mut session = harness.sessions.create("alice", &credential()).await?;

    let outcome = FeedCursorWalker::new(harness.api.clone(), 50, 10, 3)
        .walk(&harness.sessions, &mut session, &credential(), None)
        .await;

    assert_eq!(outcome.termination, WalkTermination::CapReached);
    assert_eq!(outcome.posts.len(), 3);
    assert_eq!(outcome.checkpoint, Some(ts(2024, 3, 10, 12)));
    Ok(())
}

#[tokio::test]
async fn test_page_cap_ends_walk() -> Result<()> {
    init_tracing();
    let pages = (0..4)
        .map(|i| Ok(page(vec![item_at(&format!("post {}", i), ts(2024, 3, 10 - i, 12))], Some("more"))))
        .collect();
    let harness = Harness::new(ScriptedFeedApi::with_pages(pages));
    let mut session = harness.sessions.create("alice", &credential()).await?;

    let outcome = FeedCursorWalker::new(harness.api.clone(), 50, 2, 1000)
        .walk(&harness.sessions, &mut session, &credential(), None)
        .await;

    assert_eq!(outcome.termination, WalkTermination::CapReached);
    assert_eq!(outcome.pages_fetched, 2);
    assert_eq!(outcome.posts.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_auth_error_refreshes_once_and_retries_same_page() -> Result<()> {
    init_tracing();
    let api = ScriptedFeedApi::with_pages(vec![
        Ok(page(vec![item_at("first page", ts(2024, 3, 6, 12))], Some("c1"))),
        Err(unauthorized("ExpiredToken")),
        Ok(page(vec![item_at("second page", ts(2024, 3, 5, 12))], None)),
    ]);
    let harness = Harness::new(api);
    let mut session = harness.sessions.create("alice", &credential()).await?;

    let outcome = walker(&harness).walk(&harness.sessions, &mut session, &credential(), None).await;

    assert_eq!(outcome.termination, WalkTermination::Exhausted);
    assert_eq!(outcome.refreshes, 1);
    assert_eq!(outcome.posts.len(), 2);
    assert_eq!(
        harness.api.requested_cursors(),
        vec![None, Some("c1".to_string()), Some("c1".to_string())]
    );
    let tokens = harness.api.access_tokens.lock().unwrap().clone();
    assert_eq!(tokens.last().map(String::as_str), Some("access-refresh1"));
    Ok(())
}

#[tokio::test]
async fn test_second_auth_error_aborts_and_keeps_checkpoint() -> Result<()> {
    init_tracing();
    let api = ScriptedFeedApi::with_pages(vec![
        Ok(page(vec![item_at("kept", ts(2024, 3, 6, 12))], Some("c1"))),
        Err(unauthorized("ExpiredToken")),
        Err(unauthorized("InvalidToken")),
    ]);
    let harness = Harness::new(api);
    let mut session = harness.sessions.create("alice", &credential()).await?;
    let checkpoint = Some(ts(2024, 3, 1, 0));

    let outcome = walker(&harness).walk(&harness.sessions, &mut session, &credential(), checkpoint).await;

    assert_eq!(outcome.termination, WalkTermination::Aborted(AbortReason::SessionExpired));
    assert_eq!(outcome.posts.len(), 1);
    assert_eq!(outcome.checkpoint, checkpoint);
    assert_eq!(harness.api.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), SessionState::Expired);
    Ok(())
}

#[tokio::test]
async fn test_failed_refresh_aborts_walk() -> Result<()> {
    init_tracing();
    let api = ScriptedFeedApi::with_pages(vec![Err(unauthorized("ExpiredToken"))]);
    api.push_refresh(Err(unauthorized("ExpiredToken")));
    let harness = Harness::new(api);
    let mut session = harness.sessions.create("alice", &credential()).await?;
    harness.api.push_login(Err(unauthorized("AuthenticationRequired")));

    let outcome = walker(&harness).walk(&harness.sessions, &mut session, &credential(), None).await;

    assert!(matches!(outcome.termination, WalkTermination::Aborted(AbortReason::Unauthenticated(_))));
    assert!(outcome.posts.is_empty());
    assert_eq!(outcome.checkpoint, None);
    assert_eq!(session.state(), SessionState::Failed);
    Ok(())
}

#[tokio::test]
async fn test_transient_error_returns_partial_results() -> Result<()> {
    init_tracing();
    let api = ScriptedFeedApi::with_pages(vec![
        Ok(page(vec![item_at("partial", ts(2024, 3, 6, 12))], Some("c1"))),
        Err(FeedApiError::Transient("connection reset".to_string())),
    ]);
    let harness = Harness::new(api);
    let mut session = harness.sessions.create("alice", &credential()).await?;
    let checkpoint = Some(ts(2024, 3, 1, 0));

    let outcome = walker(&harness).walk(&harness.sessions, &mut session, &credential(), checkpoint).await;

    assert!(matches!(outcome.termination, WalkTermination::Aborted(AbortReason::Transient(ref reason)) if reason.contains("connection reset")));
    assert_eq!(outcome.posts.len(), 1);
    assert_eq!(outcome.checkpoint, checkpoint);
    Ok(())
}

#[tokio::test]
async fn test_reposts_and_authors_are_mapped() -> Result<()> {
    init_tracing();
    let mut repost = item_at("shared", ts(2024, 3, 6, 12));
    repost.reposted_by = Some("carol.bsky.social".to_string());
    let mut anonymous = item_at("plain", ts(2024, 3, 5, 12));
    anonymous.author_display_name = Some("  ".to_string());

    let harness = Harness::new(ScriptedFeedApi::with_pages(vec![Ok(page(vec![repost, anonymous], None))]));
    let mut session = harness.sessions.create("alice", &credential()).await?;

    let outcome = walker(&harness).walk(&harness.sessions, &mut session, &credential(), None).await;

    assert_eq!(
        outcome.posts[0].action,
        PostAction::Repost {
            by: "carol.bsky.social".to_string()
        }
    );
    assert_eq!(outcome.posts[0].action.to_string(), "repost:carol.bsky.social");
    assert_eq!(outcome.posts[0].author, "BOB.BSKY.SOCIAL");
    assert_eq!(outcome.posts[1].action, PostAction::New);
    assert_eq!(outcome.posts[1].author, "bob.bsky.social");
    Ok(())
}

#[tokio::test]
async fn test_successive_walks_never_move_checkpoint_backwards() -> Result<()> {
    init_tracing();
    let api = ScriptedFeedApi::with_pages(vec![
        Ok(page(vec![item_at("a", ts(2024, 3, 6, 12))], None)),
        Ok(page(vec![item_at("a", ts(2024, 3, 6, 12))], None)),
    ]);
    let harness = Harness::new(api);
    let mut session = harness.sessions.create("alice", &credential()).await?;

    let first = walker(&harness).walk(&harness.sessions, &mut session, &credential(), None).await;
    let second = walker(&harness)
        .walk(&harness.sessions, &mut session, &credential(), first.checkpoint)
        .await;

    assert!(second.checkpoint >= first.checkpoint);
    assert_eq!(second.termination, WalkTermination::CaughtUp);
    assert!(second.posts.is_empty());
    Ok(())
}
