mod common;

use std::panic::AssertUnwindSafe;
use std::sync::mpsc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use common::{harness, member, service_with_timeout, state_for, token};
use xchange_api::error::MessagingError;
use xchange_api::routes::router;
use xchange_db::StoreResult;
use xchange_types::models::Role;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_timeout_surfaces_as_unavailable() {
    let h = harness();
    let conv = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", None)
        .await
        .unwrap()
        .conversation_id;

    // Hold the writer long enough for both calls below to give up.
    let (locked_tx, locked_rx) = mpsc::channel();
    let db = h.db.clone();
    let holder = std::thread::spawn(move || {
        db.with_conn_mut(|_| {
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(1500));
            Ok(())
        })
        .unwrap();
    });
    locked_rx.recv().unwrap();

    let impatient = service_with_timeout(&h, Duration::from_millis(50));
    let res = impatient.send_message(&conv, "alice", "anyone there?", None).await;
    assert!(matches!(res, Err(MessagingError::Unavailable(_))));

    let app = router(state_for(&h, impatient));
    let req = Request::builder()
        .method("POST")
        .uri(format!("/conversations/{}/messages", conv))
        .header(header::AUTHORIZATION, format!("Bearer {}", token("alice", Role::Member)))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"body":"hello?"}"#))
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["message"], "service temporarily unavailable, retry later");

    holder.join().unwrap();
}

#[tokio::test]
async fn transient_read_failure_is_retried() {
    let h = harness();

    // Poison one reader connection; every fourth read lands on it.
    let crashed = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = h.db.with_conn(|_| -> StoreResult<()> { panic!("reader crashed") });
    }));
    assert!(crashed.is_err());

    for _ in 0..8 {
        assert_eq!(h.service.unread_total("bob").await.unwrap(), 0);
    }
}

#[tokio::test]
async fn failed_write_surfaces_as_unavailable() {
    let h = harness();
    let conv = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", None)
        .await
        .unwrap()
        .conversation_id;

    let crashed = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = h.db.with_conn_mut(|_| -> StoreResult<()> { panic!("writer crashed") });
    }));
    assert!(crashed.is_err());

    let res = h.service.send_message(&conv, "alice", "hello", None).await;
    assert!(matches!(res, Err(MessagingError::Unavailable(_))));

    // Reads are unaffected and nothing was half-written.
    assert!(h.db.list_messages(&conv).unwrap().is_empty());
    assert_eq!(h.service.unread_total("bob").await.unwrap(), 0);
}
