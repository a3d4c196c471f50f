mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{admin, harness, member};
use xchange_api::error::MessagingError;
use xchange_types::events::RelayEvent;
use xchange_types::models::{MessageKind, ProductContext, Role};

#[tokio::test]
async fn product_inquiry_walkthrough() {
    let h = harness();

    let opened = h
        .service
        .get_or_create_conversation(&member("alice"), "bob@x.edu", Some("P1"))
        .await
        .unwrap();
    assert!(opened.is_new);
    let c1 = opened.conversation_id;

    let sent = h
        .service
        .send_message(&c1, "alice", "Is this still available?", None)
        .await
        .unwrap();
    assert_eq!(sent.sender_id, "alice");
    assert_eq!(sent.kind, MessageKind::User);

    let bob_view = h.service.list_conversations("bob").await.unwrap();
    assert_eq!(bob_view.len(), 1);
    assert_eq!(bob_view[0].conversation_id, c1);
    assert_eq!(bob_view[0].unread_count, 1);
    assert!(bob_view[0].unread);
    assert_eq!(bob_view[0].last_message_preview, "Is this still available?");
    assert_eq!(bob_view[0].other_party.id, "alice");
    assert_eq!(bob_view[0].product.as_ref().map(|p| p.name.as_str()), Some("Calculus textbook"));

    let thread = h.service.get_messages(&c1, "bob").await.unwrap();
    assert_eq!(thread.len(), 2);
    assert_eq!(thread[0].kind, MessageKind::System);
    assert!(thread[0].body.contains("Calculus textbook"));
    assert_eq!(
        thread[0].product_context.as_ref().and_then(|c| c.price),
        Some(25.0)
    );
    assert_eq!(thread[1].body, "Is this still available?");
    assert!(thread.iter().all(|m| m.read));

    let bob_view = h.service.list_conversations("bob").await.unwrap();
    assert_eq!(bob_view[0].unread_count, 0);
    assert!(!bob_view[0].unread);

    // Persisted, not just reflected in the response.
    let stored = h.db.list_messages(&c1).unwrap();
    assert!(stored.iter().all(|m| m.read));
}

#[tokio::test]
async fn reopening_returns_the_same_conversation() {
    let h = harness();
    let first = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", Some("P1"))
        .await
        .unwrap();
    let second = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", Some("P1"))
        .await
        .unwrap();
    // Either side may reopen it.
    let from_bob = h
        .service
        .get_or_create_conversation(&member("bob"), "alice@x.edu", Some("P1"))
        .await
        .unwrap();

    assert_eq!(first.conversation_id, second.conversation_id);
    assert_eq!(first.conversation_id, from_bob.conversation_id);
    assert!(!second.is_new);
    assert!(!from_bob.is_new);

    // The opening system message is not duplicated.
    assert_eq!(h.db.list_messages(&first.conversation_id).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_get_or_create_yields_one_conversation() {
    let h = harness();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let service = h.service.clone();
        tasks.push(tokio::spawn(async move {
            service
                .get_or_create_conversation(&member("alice"), "bob", Some("P1"))
                .await
                .unwrap()
        }));
    }

    let mut ids = HashSet::new();
    let mut created = 0;
    for task in tasks {
        let opened = task.await.unwrap();
        if opened.is_new {
            created += 1;
        }
        ids.insert(opened.conversation_id);
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(created, 1);
    assert_eq!(h.service.list_conversations("alice").await.unwrap().len(), 1);
    let id = ids.into_iter().next().unwrap();
    assert_eq!(h.db.list_messages(&id).unwrap().len(), 1);
}

#[tokio::test]
async fn product_scope_separates_threads() {
    let h = harness();
    let general = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", None)
        .await
        .unwrap();
    let about_p1 = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", Some("P1"))
        .await
        .unwrap();
    assert_ne!(general.conversation_id, about_p1.conversation_id);
    // A general conversation has no opening message.
    assert!(h.db.list_messages(&general.conversation_id).unwrap().is_empty());
}

#[tokio::test]
async fn unread_counts_follow_sends_and_reads() {
    let h = harness();
    let conv = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", None)
        .await
        .unwrap()
        .conversation_id;

    for body in ["one", "two", "three"] {
        h.service.send_message(&conv, "alice", body, None).await.unwrap();
    }
    assert_eq!(h.service.unread_total("bob").await.unwrap(), 3);
    assert_eq!(h.service.unread_total("alice").await.unwrap(), 0);

    // The sender's own fetch never marks their messages read.
    let alice_view = h.service.get_messages(&conv, "alice").await.unwrap();
    assert!(alice_view.iter().all(|m| !m.read));
    assert_eq!(h.service.unread_total("bob").await.unwrap(), 3);

    let bob_view = h.service.get_messages(&conv, "bob").await.unwrap();
    let bodies: Vec<&str> = bob_view.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["one", "two", "three"]);
    assert_eq!(h.service.unread_total("bob").await.unwrap(), 0);

    // Bob replies; only alice's counter moves.
    h.service.send_message(&conv, "bob", "yes", None).await.unwrap();
    assert_eq!(h.service.unread_total("alice").await.unwrap(), 1);
    assert_eq!(h.service.unread_total("bob").await.unwrap(), 0);
}

#[tokio::test]
async fn fetch_order_is_stable() {
    let h = harness();
    let conv = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", None)
        .await
        .unwrap()
        .conversation_id;
    for i in 0..10 {
        let sender = if i % 2 == 0 { "alice" } else { "bob" };
        h.service
            .send_message(&conv, sender, &format!("msg {}", i), None)
            .await
            .unwrap();
    }

    let first = h.service.get_messages(&conv, "carol").await;
    assert!(matches!(first, Err(MessagingError::Forbidden)));

    let a: Vec<i64> = h.db.list_messages(&conv).unwrap().iter().map(|m| m.sequence).collect();
    let b: Vec<i64> = h.db.list_messages(&conv).unwrap().iter().map(|m| m.sequence).collect();
    assert_eq!(a, b);
    assert!(a.windows(2).all(|w| w[0] < w[1]));

    let bodies: Vec<String> = h
        .service
        .get_messages(&conv, "alice")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.body)
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("msg {}", i)).collect();
    assert_eq!(bodies, expected);
}

#[tokio::test]
async fn offline_recipient_still_gets_the_message() {
    let h = harness();
    let conv = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", None)
        .await
        .unwrap()
        .conversation_id;

    assert!(!h.relay.is_connected("bob").await);
    let sent = h
        .service
        .send_message(&conv, "alice", "ping while you're away", None)
        .await
        .unwrap();

    let thread = h.service.get_messages(&conv, "bob").await.unwrap();
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].id, sent.id);
}

#[tokio::test]
async fn connected_recipient_is_pushed_the_message() {
    let h = harness();
    let conv = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", None)
        .await
        .unwrap()
        .conversation_id;

    let (_conn, mut bob_rx) = h.relay.connect("bob").await;
    let (_conn, mut alice_rx) = h.relay.connect("alice").await;
    let sent = h
        .service
        .send_message(&conv, "alice", "live!", None)
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), bob_rx.recv())
        .await
        .expect("relay push timed out")
        .expect("relay channel closed");
    match event {
        RelayEvent::Message(message) => assert_eq!(message.id, sent.id),
        other => panic!("unexpected event {:?}", other),
    }

    // The sender is not echoed.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), alice_rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn invalid_requests_are_typed_errors() {
    let h = harness();
    let conv = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", None)
        .await
        .unwrap()
        .conversation_id;

    let res = h.service.get_or_create_conversation(&member("alice"), "nobody", None).await;
    assert!(matches!(res, Err(MessagingError::NotFound(_))));

    let res = h.service.get_or_create_conversation(&member("alice"), "alice@x.edu", None).await;
    assert!(matches!(res, Err(MessagingError::InvalidArgument(_))));

    let res = h.service.send_message(&conv, "alice", "   ", None).await;
    assert!(matches!(res, Err(MessagingError::InvalidArgument(_))));

    let too_long = "x".repeat(4001);
    let res = h.service.send_message(&conv, "alice", &too_long, None).await;
    assert!(matches!(res, Err(MessagingError::InvalidArgument(_))));

    let res = h.service.send_message(&conv, "carol", "let me in", None).await;
    assert!(matches!(res, Err(MessagingError::Forbidden)));

    let res = h.service.get_messages("no-such-conversation", "alice").await;
    assert!(matches!(res, Err(MessagingError::NotFound(_))));

    // Nothing above left partial state behind.
    assert!(h.db.list_messages(&conv).unwrap().is_empty());
    assert_eq!(h.service.unread_total("bob").await.unwrap(), 0);
}

#[tokio::test]
async fn admin_can_be_a_participant() {
    let h = harness();
    let conv = h
        .service
        .get_or_create_conversation(&admin("staff"), "alice", None)
        .await
        .unwrap()
        .conversation_id;
    h.service
        .send_message(&conv, "staff", "Your listing needs a photo.", None)
        .await
        .unwrap();

    let alice_view = h.service.list_conversations("alice").await.unwrap();
    assert_eq!(alice_view.len(), 1);
    assert_eq!(alice_view[0].other_party.role, Role::Admin);
    assert_eq!(alice_view[0].other_party.email, "staff@x.edu");

    // Members can reach admins through the resolver's second lookup.
    let back = h
        .service
        .get_or_create_conversation(&member("alice"), "staff@x.edu", None)
        .await
        .unwrap();
    assert_eq!(back.conversation_id, conv);
}

#[tokio::test]
async fn missing_product_does_not_block_the_conversation() {
    let h = harness();
    let opened = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", Some("ghost"))
        .await
        .unwrap();
    assert!(opened.is_new);
    assert!(h.db.list_messages(&opened.conversation_id).unwrap().is_empty());

    h.service
        .send_message(&opened.conversation_id, "alice", "still selling?", None)
        .await
        .unwrap();
    let summary = &h.service.list_conversations("bob").await.unwrap()[0];
    assert!(summary.product.is_none());
    assert_eq!(summary.last_message_preview, "still selling?");
}

#[tokio::test]
async fn deleting_an_identity_removes_its_threads() {
    let h = harness();
    let with_bob = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", Some("P1"))
        .await
        .unwrap()
        .conversation_id;
    let with_carol = h
        .service
        .get_or_create_conversation(&member("carol"), "bob", None)
        .await
        .unwrap()
        .conversation_id;
    h.service.send_message(&with_bob, "alice", "hi", None).await.unwrap();

    let (conversations, messages) = h.service.delete_all_for_identity("alice").await.unwrap();
    assert_eq!(conversations, 1);
    assert_eq!(messages, 2);

    let bob_view = h.service.list_conversations("bob").await.unwrap();
    assert_eq!(bob_view.len(), 1);
    assert_eq!(bob_view[0].conversation_id, with_carol);
    assert!(matches!(
        h.service.get_messages(&with_bob, "bob").await,
        Err(MessagingError::NotFound(_))
    ));
    assert_eq!(h.service.unread_total("bob").await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opening_message_is_always_first() {
    for _ in 0..20 {
        let h = harness();

        let opener = {
            let service = h.service.clone();
            tokio::spawn(async move {
                service
                    .get_or_create_conversation(&member("alice"), "bob", Some("P1"))
                    .await
                    .unwrap()
                    .conversation_id
            })
        };
        let replier = {
            let service = h.service.clone();
            tokio::spawn(async move {
                let conv = service
                    .get_or_create_conversation(&member("bob"), "alice", Some("P1"))
                    .await
                    .unwrap()
                    .conversation_id;
                service
                    .send_message(&conv, "bob", "yes, still for sale", None)
                    .await
                    .unwrap();
                conv
            })
        };

        let conv = opener.await.unwrap();
        assert_eq!(conv, replier.await.unwrap());

        let thread = h.db.list_messages(&conv).unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].kind, MessageKind::System);
        assert!(thread[0].product_context.is_some());
        assert_eq!(thread[1].body, "yes, still for sale");
    }
}

#[tokio::test]
async fn product_context_only_rides_on_the_opening_message() {
    let h = harness();
    let ctx = ProductContext {
        name: "Calculus textbook".into(),
        price: Some(25.0),
        image_url: None,
    };

    let general = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", None)
        .await
        .unwrap()
        .conversation_id;
    let sent = h
        .service
        .send_message(&general, "alice", "about that book", Some(ctx.clone()))
        .await
        .unwrap();
    assert!(sent.product_context.is_none());
    assert!(h.db.list_messages(&general).unwrap()[0].product_context.is_none());

    let inquiry = h
        .service
        .get_or_create_conversation(&member("alice"), "bob", Some("P1"))
        .await
        .unwrap()
        .conversation_id;
    h.service
        .send_message(&inquiry, "alice", "is it used?", Some(ctx))
        .await
        .unwrap();

    let positions: Vec<usize> = h
        .db
        .list_messages(&inquiry)
        .unwrap()
        .iter()
        .enumerate()
        .filter(|(_, m)| m.product_context.is_some())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(positions, vec![0]);
}
