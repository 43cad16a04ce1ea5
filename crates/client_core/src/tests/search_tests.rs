use super::*;
use crate::test_support::{user, wait_for_event, FakeApi};

fn search_over(api: Arc<FakeApi>, quiet_ms: u64) -> (DirectorySearch, broadcast::Receiver<ClientEvent>) {
    let (events, rx) = broadcast::channel(64);
    let search = DirectorySearch::new(
        api,
        "token-1",
        UserId::from("me"),
        Duration::from_millis(quiet_ms),
        events,
    );
    (search, rx)
}

async fn api_with_users() -> Arc<FakeApi> {
    let api = Arc::new(FakeApi::new("me"));
    *api.users.lock().await = vec![user("me"), user("ann"), user("annabel"), user("bob")];
    api
}

fn is_results(event: &ClientEvent) -> bool {
    matches!(event, ClientEvent::SearchResults { .. })
}

#[tokio::test]
async fn rapid_typing_issues_a_single_request() {
    let api = api_with_users().await;
    let (search, mut events) = search_over(Arc::clone(&api), 50);

    for query in ["a", "an", "ann"] {
        search.update_query(query).await;
    }
    let event = wait_for_event(&mut events, is_results).await;

    let ClientEvent::SearchResults { query, users } = event else {
        unreachable!();
    };
    assert_eq!(query, "ann");
    assert_eq!(users.len(), 2);
    assert_eq!(api.calls_to("search:").await, 1);
    assert_eq!(search.results().await.len(), 2);
    assert!(!search.is_searching().await);
}

#[tokio::test]
async fn stale_responses_never_overwrite_newer_results() {
    let api = api_with_users().await;
    api.search_delays
        .lock()
        .await
        .insert("an".to_string(), Duration::from_millis(300));
    let (search, mut events) = search_over(Arc::clone(&api), 10);

    search.update_query("an").await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(search.is_searching().await);
    search.update_query("bob").await;

    let event = wait_for_event(&mut events, is_results).await;
    assert!(matches!(event, ClientEvent::SearchResults { ref query, .. } if query == "bob"));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let names: Vec<_> = search.results().await.into_iter().map(|u| u.username).collect();
    assert_eq!(names, vec!["bob"]);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn blank_query_clears_immediately_without_a_request() {
    let api = api_with_users().await;
    let (search, mut events) = search_over(Arc::clone(&api), 10);

    search.update_query("bob").await;
    wait_for_event(&mut events, is_results).await;
    assert_eq!(search.results().await.len(), 1);

    search.update_query("   ").await;
    assert!(search.results().await.is_empty());
    assert!(!search.is_searching().await);
    assert_eq!(
        events.try_recv().expect("cleared event"),
        ClientEvent::SearchResults {
            query: "   ".to_string(),
            users: Vec::new(),
        }
    );
    assert_eq!(api.calls_to("search:").await, 1);
}

#[tokio::test]
async fn local_user_is_excluded_from_results() {
    let api = api_with_users().await;
    let (search, mut events) = search_over(Arc::clone(&api), 10);

    search.update_query("e").await;
    wait_for_event(&mut events, is_results).await;

    let ids: Vec<_> = search.results().await.into_iter().map(|u| u.id).collect();
    assert!(!ids.contains(&UserId::from("me")));
    assert!(ids.contains(&UserId::from("annabel")));
}

#[tokio::test]
async fn reset_cancels_pending_search_silently() {
    let api = api_with_users().await;
    let (search, mut events) = search_over(Arc::clone(&api), 10);

    search.update_query("bob").await;
    wait_for_event(&mut events, is_results).await;
    search.update_query("ann").await;
    search.reset().await;

    assert_eq!(search.query().await, "");
    assert!(search.results().await.is_empty());
    assert!(!search.is_searching().await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(api.calls_to("search:").await, 1);
}
