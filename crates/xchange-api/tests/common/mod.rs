#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use xchange_api::auth::{self, AppState, AppStateInner};
use xchange_api::service::{Caller, MessagingService, ServiceConfig};
use xchange_db::Database;
use xchange_db::models::ProductRow;
use xchange_gateway::relay::Relay;
use xchange_types::models::Role;

pub const SECRET: &str = "test-secret";

/// A seeded store: members alice, bob, carol; admin `staff`; product P1.
pub struct Harness {
    _dir: TempDir,
    pub db: Arc<Database>,
    pub relay: Relay,
    pub service: MessagingService,
    pub state: AppState,
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open(&dir.path().join("xchange.db")).unwrap());

    db.insert_member("alice", "Alice", "alice@x.edu").unwrap();
    db.insert_member("bob", "Bob", "bob@x.edu").unwrap();
    db.insert_member("carol", "Carol", "carol@x.edu").unwrap();
    db.insert_admin("staff", "Campus Staff", "staff@x.edu").unwrap();
    db.insert_product(&ProductRow {
        id: "P1".into(),
        name: "Calculus textbook".into(),
        price: Some(25.0),
        image_url: Some("https://img.example/p1.jpg".into()),
        seller_id: Some("bob".into()),
    })
    .unwrap();

    let relay = Relay::new();
    let service = MessagingService::new(db.clone(), relay.clone(), ServiceConfig::default());
    let state: AppState = Arc::new(AppStateInner {
        messaging: service.clone(),
        relay: relay.clone(),
        jwt_secret: SECRET.to_string(),
    });

    Harness {
        _dir: dir,
        db,
        relay,
        service,
        state,
    }
}

pub fn member(id: &str) -> Caller {
    Caller {
        id: id.to_string(),
        role: Role::Member,
    }
}

pub fn admin(id: &str) -> Caller {
    Caller {
        id: id.to_string(),
        role: Role::Admin,
    }
}

pub fn token(id: &str, role: Role) -> String {
    auth::issue_token(SECRET, id, role, chrono::Duration::hours(1)).unwrap()
}

/// A second service over the same store, with its own store timeout.
pub fn service_with_timeout(h: &Harness, store_timeout: Duration) -> MessagingService {
    MessagingService::new(
        h.db.clone(),
        h.relay.clone(),
        ServiceConfig {
            store_timeout,
            ..ServiceConfig::default()
        },
    )
}

pub fn state_for(h: &Harness, messaging: MessagingService) -> AppState {
    Arc::new(AppStateInner {
        messaging,
        relay: h.relay.clone(),
        jwt_secret: SECRET.to_string(),
    })
}
