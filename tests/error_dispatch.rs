// Integration tests for failure side effects
// These tests verify what the user sees when reads and writes fail.
// Unit tests for classification are in src/taxonomy.rs

use std::sync::Arc;

use futures::StreamExt;
use query_sync::mock::{MockRemote, RecordingReporter, RecordingUi, UiEvent};
use query_sync::taxonomy::{INVALID_TOKEN, SUBSCRIPTION_REQUIRED};
use query_sync::{
    ClientConfig, DispatchConfig, ErrorTaxonomy, ModalId, Mutation, MutationMeta, Query,
    QueryClient, QueryMeta, QueryResult, QueryWatch, RemoteError, RetryConfig, ToastVariant,
    TransportKind, query_key,
};
use serde_json::json;
use tokio::time::{Duration, timeout};

fn client_with(ui: &RecordingUi, dispatch: DispatchConfig) -> (QueryClient, RecordingReporter) {
    let reporter = RecordingReporter::new();
    let client = QueryClient::builder(Arc::new(ui.clone()))
        .with_config(ClientConfig {
            retry: RetryConfig::disabled(),
            dispatch,
            ..ClientConfig::default()
        })
        .with_reporter(Arc::new(reporter.clone()))
        .build();
    (client, reporter)
}

fn client(ui: &RecordingUi) -> (QueryClient, RecordingReporter) {
    client_with(ui, DispatchConfig::web())
}

fn paywall() -> RemoteError {
    RemoteError::new(TransportKind::Forbidden).with_code(SUBSCRIPTION_REQUIRED)
}

async fn next_matching<T: Send + Sync + 'static>(
    watch: &mut QueryWatch<T>,
    pred: impl Fn(&QueryResult<T>) -> bool,
) -> QueryResult<T> {
    timeout(Duration::from_secs(5), async {
        loop {
            let result = watch.next().await.expect("watch should not end");
            if pred(&result) {
                return result;
            }
        }
    })
    .await
    .expect("expected state should be emitted")
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition should hold eventually");
}

#[tokio::test]
async fn test_paywall_on_read_reloads_after_dismissal() {
    let ui = RecordingUi::new();
    let (client, reporter) = client(&ui);
    let lesson = MockRemote::<(), String>::new();
    lesson.push(Err(paywall().into()));
    lesson.respond(Ok("Greetings".to_owned()));

    let mut watch = client.watch(Query::from_procedure(
        query_key!["lesson", 9],
        lesson.procedure("getLesson"),
        (),
    ));
    let failed = next_matching(&mut watch, QueryResult::is_error).await;
    assert_eq!(failed.error(), Some(&paywall().into()));

    assert_eq!(ui.opened_modals(), vec![ModalId::Paywall]);
    assert!(ui.toasts().is_empty());
    assert!(reporter.reports().is_empty());
    assert_eq!(lesson.call_count(), 1);

    assert!(ui.dismiss(ModalId::Paywall));
    let loaded = next_matching(&mut watch, QueryResult::is_success).await;
    assert_eq!(loaded.data().map(String::as_str), Some("Greetings"));
    assert_eq!(lesson.call_count(), 2);
    assert!(ui.toasts().is_empty());
}

#[tokio::test]
async fn test_paywall_on_write_invalidates_after_dismissal() -> color_eyre::Result<()> {
    let ui = RecordingUi::new();
    let (client, _) = client(&ui);
    let key = query_key!["lesson", 1];
    let lesson = MockRemote::<(), String>::ok("Greetings".to_owned());
    client
        .fetch(&Query::from_procedure(key.clone(), lesson.procedure("getLesson"), ()))
        .await?;

    let unlock = MockRemote::<u32, ()>::err(paywall());
    let result = Mutation::new(unlock.procedure("startLesson"), 2)
        .execute(&client)
        .await;
    assert_eq!(result, Err(paywall().into()));
    assert_eq!(ui.opened_modals(), vec![ModalId::Paywall]);
    assert!(ui.toasts().is_empty());

    let stale = || client.store().get(&key).is_some_and(|entry| entry.is_stale);
    assert!(!stale());
    assert!(ui.dismiss(ModalId::Paywall));
    eventually(stale).await;
    Ok(())
}

#[tokio::test]
async fn test_paywall_dismissal_reloads_patched_keys() -> color_eyre::Result<()> {
    let ui = RecordingUi::new();
    let (client, _) = client(&ui);
    let goal = query_key!["daily-goal"];
    let other = query_key!["lesson", 1];
    client.store().set(goal.clone(), 10_u32);
    client.store().set(other.clone(), "Greetings".to_owned());

    let set_goal = MockRemote::<u32, ()>::err(paywall());
    let result = Mutation::new(set_goal.procedure("setDailyGoal"), 50)
        .optimistic({
            let goal = goal.clone();
            move |patch| patch.set(goal, 50_u32)
        })
        .execute(&client)
        .await;
    assert!(result.is_err());
    assert_eq!(client.store().data::<u32>(&goal).as_deref(), Some(&10));

    assert!(ui.dismiss(ModalId::Paywall));
    eventually(|| client.store().get(&goal).is_some_and(|entry| entry.is_stale)).await;
    assert!(client.store().get(&other).is_some_and(|entry| !entry.is_stale));
    Ok(())
}

#[tokio::test]
async fn test_invalid_token_signs_out() {
    let ui = RecordingUi::new();
    let (client, reporter) = client(&ui);
    client.store().set(query_key!["user-settings"], 1_u32);
    let streak = MockRemote::<(), u32>::err(
        RemoteError::new(TransportKind::Unauthorized).with_code(INVALID_TOKEN),
    );

    let result = client
        .fetch(&Query::from_procedure(query_key!["streak"], streak.procedure("getStreak"), ()))
        .await;
    assert!(result.is_err());

    eventually(|| ui.signed_out()).await;
    assert!(client.store().is_empty());
    assert_eq!(
        ui.error_toasts(),
        vec![DispatchConfig::web().session_expired_message]
    );
    assert_eq!(reporter.reports().len(), 1);
    assert_eq!(reporter.reports()[0].taxonomy, ErrorTaxonomy::InvalidToken);
}

#[tokio::test]
async fn test_other_unauthorized_shows_generic_message() {
    let ui = RecordingUi::new();
    let (client, _) = client(&ui);
    let streak = MockRemote::<(), u32>::err(TransportKind::Unauthorized);

    let result = client
        .fetch(&Query::from_procedure(query_key!["streak"], streak.procedure("getStreak"), ()))
        .await;
    assert!(result.is_err());

    tokio::task::yield_now().await;
    assert!(!ui.signed_out());
    assert_eq!(
        ui.error_toasts(),
        vec![DispatchConfig::web().default_error_message]
    );
}

#[tokio::test]
async fn test_not_found_is_silent() {
    let ui = RecordingUi::new();
    let (client, _) = client(&ui);
    let word = MockRemote::<String, String>::err(TransportKind::NotFound);

    let result = client
        .fetch(&Query::from_procedure(
            query_key!["word", "xyz"],
            word.procedure("getWord"),
            "xyz".to_owned(),
        ))
        .await;
    assert_eq!(result, Err(TransportKind::NotFound.into()));
    assert!(ui.events().is_empty());
}

#[tokio::test]
async fn test_backend_message_is_shown_verbatim() {
    let ui = RecordingUi::new();
    let (client, reporter) = client(&ui);
    let save = MockRemote::<String, ()>::err(
        RemoteError::new(TransportKind::BadRequest).with_message("Word already saved"),
    );

    let result = Mutation::new(save.procedure("saveWord"), "hola".to_owned())
        .meta(MutationMeta::new().with_error_message("Could not save word"))
        .execute(&client)
        .await;
    assert!(result.is_err());
    assert_eq!(ui.error_toasts(), vec!["Word already saved".to_owned()]);
    assert!(reporter.reports().is_empty());
}

#[tokio::test]
async fn test_unexpected_failure_is_reported() {
    let ui = RecordingUi::new();
    let (client, reporter) = client(&ui);
    let save = MockRemote::<String, ()>::err(TransportKind::InternalServerError);

    let result = Mutation::new(save.procedure("saveWord"), "hola".to_owned())
        .execute(&client)
        .await;
    assert!(result.is_err());

    let reports = reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].operation, "mutation saveWord");
    assert_eq!(reports[0].taxonomy, ErrorTaxonomy::Generic);
    assert_eq!(
        ui.error_toasts(),
        vec![DispatchConfig::web().default_error_message]
    );
}

#[tokio::test]
async fn test_silent_read_shows_nothing() {
    let ui = RecordingUi::new();
    let (client, _) = client(&ui);
    let streak = MockRemote::<(), u32>::err(TransportKind::ServiceUnavailable);

    let result = client
        .fetch(
            &Query::from_procedure(query_key!["streak"], streak.procedure("getStreak"), ())
                .meta(QueryMeta::new().silent()),
        )
        .await;
    assert!(result.is_err());
    assert!(ui.events().is_empty());
}

#[tokio::test]
async fn test_native_client_uses_error_modal() {
    let ui = RecordingUi::new();
    let (client, _) = client_with(&ui, DispatchConfig::native());
    let save = MockRemote::<String, ()>::err(TransportKind::BadGateway);

    let result = Mutation::new(save.procedure("saveWord"), "hola".to_owned())
        .meta(MutationMeta::new().with_error_message("Could not save word"))
        .execute(&client)
        .await;
    assert!(result.is_err());
    assert_eq!(
        ui.events(),
        vec![UiEvent::ModalOpened {
            modal: ModalId::Error,
            payload: Some(json!({ "message": "Could not save word" })),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_notice_is_shown_once_per_window() {
    let ui = RecordingUi::new();
    let (client, _) = client(&ui);
    let limited = RemoteError::new(TransportKind::TooManyRequests)
        .with_data(json!({ "retryAfter": 30 }));
    let lessons = MockRemote::<u32, String>::err(limited);

    for id in [1, 2] {
        let result = client
            .fetch(&Query::from_procedure(
                query_key!["lesson", id],
                lessons.procedure("getLesson"),
                id,
            ))
            .await;
        assert!(result.is_err());
    }
    assert_eq!(
        ui.events(),
        vec![UiEvent::ModalOpened {
            modal: ModalId::TooManyRequests,
            payload: Some(json!({ "retryAfter": 30 })),
        }]
    );

    tokio::time::advance(Duration::from_secs(31)).await;
    let result = client
        .fetch(&Query::from_procedure(
            query_key!["lesson", 3],
            lessons.procedure("getLesson"),
            3,
        ))
        .await;
    assert!(result.is_err());
    assert_eq!(ui.opened_modals().len(), 2);
    assert!(ui.toasts().is_empty());
}

#[tokio::test]
async fn test_success_toast_is_opt_in() -> color_eyre::Result<()> {
    let ui = RecordingUi::new();
    let (client, _) = client(&ui);
    let save = MockRemote::<String, ()>::ok(());

    Mutation::new(save.procedure("saveWord"), "hola".to_owned())
        .execute(&client)
        .await?;
    assert!(ui.toasts().is_empty());

    Mutation::new(save.procedure("saveWord"), "adiós".to_owned())
        .meta(MutationMeta::new().with_success_toast(Some("Word saved".to_owned())))
        .execute(&client)
        .await?;
    assert_eq!(
        ui.toasts(),
        vec![("Word saved".to_owned(), ToastVariant::Success)]
    );
    Ok(())
}
