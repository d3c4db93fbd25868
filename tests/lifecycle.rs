// Integration tests for cache lifecycle
// These tests verify eviction, staleness, retries and clearing over time.
// They run on a paused clock so timers fire deterministically.

use std::sync::Arc;

use futures::StreamExt;
use query_sync::mock::{MockRemote, RecordingUi};
use query_sync::{
    CallError, ClientConfig, Debouncer, EntryStatus, Mutation, Query, QueryClient, QueryConfig,
    RemoteError, RetryConfig, TransportKind, query_key,
};
use tokio::time::{Duration, Instant, sleep, timeout};

fn client(ui: &RecordingUi, retry: RetryConfig) -> QueryClient {
    QueryClient::builder(Arc::new(ui.clone()))
        .with_config(ClientConfig {
            query: QueryConfig::new(Duration::from_secs(30), Duration::from_secs(60)),
            retry,
            ..ClientConfig::default()
        })
        .build()
}

#[tokio::test(start_paused = true)]
async fn test_unobserved_entry_is_evicted_after_cache_time() -> color_eyre::Result<()> {
    let ui = RecordingUi::new();
    let client = client(&ui, RetryConfig::disabled());
    let key = query_key!["lesson", 1];
    let lesson = MockRemote::<(), String>::ok("Greetings".to_owned());
    client
        .fetch(&Query::from_procedure(key.clone(), lesson.procedure("getLesson"), ()))
        .await?;

    sleep(Duration::from_secs(59)).await;
    assert!(client.store().get(&key).is_some());

    sleep(Duration::from_secs(2)).await;
    assert!(client.store().get(&key).is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_observed_entry_outlives_cache_time() {
    let ui = RecordingUi::new();
    let client = client(&ui, RetryConfig::disabled());
    let key = query_key!["saved-words", "es"];
    let list = MockRemote::<(), Vec<String>>::ok(vec!["hola".to_owned()]);

    let mut watch = client.watch(Query::from_procedure(
        key.clone(),
        list.procedure("listSavedWords"),
        (),
    ));
    while !watch.next().await.is_some_and(|result| result.is_success()) {}

    sleep(Duration::from_secs(600)).await;
    assert!(client.store().get(&key).is_some_and(|entry| entry.subscriber_count == 1));

    drop(watch);
    sleep(Duration::from_secs(30)).await;
    assert!(client.store().get(&key).is_some());
    sleep(Duration::from_secs(31)).await;
    assert!(client.store().get(&key).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_resubscribing_cancels_pending_eviction() {
    let ui = RecordingUi::new();
    let client = client(&ui, RetryConfig::disabled());
    let key = query_key!["user-settings"];
    let settings = MockRemote::<(), u32>::ok(20);
    let query = Query::from_procedure(key.clone(), settings.procedure("getSettings"), ());

    let mut first = client.watch(query.clone());
    while !first.next().await.is_some_and(|result| result.is_success()) {}
    drop(first);

    sleep(Duration::from_secs(45)).await;
    let mut second = client.watch(query);
    let current = second.next().await.expect("current state");
    assert_eq!(current.data(), Some(&20));

    sleep(Duration::from_secs(45)).await;
    assert!(client.store().get(&key).is_some());
    drop(second);
}

#[tokio::test(start_paused = true)]
async fn test_stale_time_bounds_server_calls() -> color_eyre::Result<()> {
    let ui = RecordingUi::new();
    let client = client(&ui, RetryConfig::disabled());
    let streak = MockRemote::<(), u32>::ok(3);
    let query = Query::from_procedure(query_key!["streak"], streak.procedure("getStreak"), ());

    client.fetch(&query).await?;
    sleep(Duration::from_secs(10)).await;
    client.fetch(&query).await?;
    assert_eq!(streak.call_count(), 1);

    sleep(Duration::from_secs(21)).await;
    client.fetch(&query).await?;
    assert_eq!(streak.call_count(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transient_read_failures_are_retried_with_backoff() -> color_eyre::Result<()> {
    let ui = RecordingUi::new();
    let client = client(
        &ui,
        RetryConfig::new(3, Duration::from_secs(1), Duration::from_secs(30)),
    );
    let streak = MockRemote::<(), u32>::ok(3);
    streak.push(Err(TransportKind::Network.into()));
    streak.push(Err(TransportKind::ServiceUnavailable.into()));

    let started = Instant::now();
    let value = client
        .fetch(&Query::from_procedure(query_key!["streak"], streak.procedure("getStreak"), ()))
        .await?;
    let elapsed = started.elapsed();

    assert_eq!(*value, 3);
    assert_eq!(streak.call_count(), 3);
    assert!(elapsed >= Duration::from_secs(3), "waited {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "waited {elapsed:?}");
    assert!(ui.events().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_dispatch_once() {
    let ui = RecordingUi::new();
    let client = client(
        &ui,
        RetryConfig::new(2, Duration::from_secs(1), Duration::from_secs(30)),
    );
    let streak = MockRemote::<(), u32>::err(TransportKind::Timeout);

    let result = client
        .fetch(&Query::from_procedure(query_key!["streak"], streak.procedure("getStreak"), ()))
        .await;
    assert_eq!(result, Err(TransportKind::Timeout.into()));
    assert_eq!(streak.call_count(), 3);
    assert_eq!(ui.error_toasts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_caller_errors_are_not_retried() {
    let ui = RecordingUi::new();
    let client = client(&ui, RetryConfig::default());
    let word = MockRemote::<(), u32>::err(
        RemoteError::new(TransportKind::UnprocessableContent).with_message("Unknown language"),
    );

    let result = client
        .fetch(&Query::from_procedure(query_key!["word-count"], word.procedure("countWords"), ()))
        .await;
    assert!(result.is_err());
    assert_eq!(word.call_count(), 1);
    assert_eq!(ui.error_toasts(), vec!["Unknown language".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn test_writes_are_never_retried() {
    let ui = RecordingUi::new();
    let client = client(&ui, RetryConfig::default());
    let save = MockRemote::<String, ()>::err(TransportKind::Network);

    let result = Mutation::new(save.procedure("saveWord"), "hola".to_owned())
        .execute(&client)
        .await;
    assert!(result.is_err());
    assert_eq!(save.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_debounced_availability_check() {
    let ui = RecordingUi::new();
    let client = client(&ui, RetryConfig::disabled());
    let available = MockRemote::<String, bool>::ok(true);
    let debouncer = Debouncer::new(Duration::from_millis(300));

    let check = |name: &str| {
        let query = Query::from_procedure(
            query_key!["username-available", name],
            available.procedure("isUsernameAvailable"),
            name.to_owned(),
        );
        let debouncer = debouncer.clone();
        let client = client.clone();
        async move { debouncer.run(|| async move { client.fetch(&query).await }).await }
    };

    let typed = async {
        let mut results = Vec::new();
        for name in ["a", "al", "ali"] {
            results.push(tokio::spawn(check(name)));
            sleep(Duration::from_millis(100)).await;
        }
        results
    };
    let mut outcomes = Vec::new();
    for handle in typed.await {
        outcomes.push(handle.await.expect("check task"));
    }

    assert!(outcomes[0].is_none());
    assert!(outcomes[1].is_none());
    assert!(matches!(outcomes[2], Some(Ok(_))));
    assert_eq!(available.calls(), vec!["ali".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn test_clear_cancels_in_flight_reads() -> color_eyre::Result<()> {
    let ui = RecordingUi::new();
    let client = client(&ui, RetryConfig::disabled());
    let key = query_key!["streak"];
    let streak = MockRemote::<(), u32>::ok(3);
    streak.hold();

    let read = tokio::spawn({
        let client = client.clone();
        let query = Query::from_procedure(key.clone(), streak.procedure("getStreak"), ());
        async move { client.fetch(&query).await }
    });
    timeout(Duration::from_secs(5), async {
        while !client.store().is_fetching(&key) {
            tokio::task::yield_now().await;
        }
    })
    .await?;

    client.clear();
    streak.release();
    assert_eq!(read.await?, Err(CallError::Cancelled));
    assert!(client.store().is_empty());
    assert!(ui.events().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_clear_keeps_observed_entries_empty() {
    let ui = RecordingUi::new();
    let client = client(&ui, RetryConfig::disabled());
    let key = query_key!["saved-words", "es"];
    let list = MockRemote::<(), Vec<String>>::ok(vec!["hola".to_owned()]);

    let mut watch = client.watch(Query::from_procedure(
        key.clone(),
        list.procedure("listSavedWords"),
        (),
    ));
    while !watch.next().await.is_some_and(|result| result.is_success()) {}

    client.clear();
    let entry = client.store().get(&key).expect("observed entry survives");
    assert_eq!(entry.status, EntryStatus::Idle);
    assert!(entry.data.is_none());
    assert_eq!(entry.subscriber_count, 1);

    let cleared = watch.next().await.expect("watch should not end");
    assert!(cleared.data().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_aborted_read_still_settles() -> color_eyre::Result<()> {
    let ui = RecordingUi::new();
    let client = client(&ui, RetryConfig::disabled());
    let key = query_key!["streak"];
    let streak = MockRemote::<(), u32>::ok(3);
    streak.hold();

    let read = tokio::spawn({
        let client = client.clone();
        let query = Query::from_procedure(key.clone(), streak.procedure("getStreak"), ());
        async move { client.fetch(&query).await }
    });
    timeout(Duration::from_secs(5), async {
        while !client.store().is_fetching(&key) {
            tokio::task::yield_now().await;
        }
    })
    .await?;
    read.abort();
    assert!(read.await.is_err_and(|error| error.is_cancelled()));

    streak.release();
    timeout(Duration::from_secs(5), async {
        while client.store().is_fetching(&key) {
            tokio::task::yield_now().await;
        }
    })
    .await?;
    let entry = client.store().get(&key).expect("entry should exist");
    assert_eq!(entry.status, EntryStatus::Success);
    assert_eq!(entry.data::<u32>().as_deref(), Some(&3));
    assert_eq!(streak.call_count(), 1);
    Ok(())
}
