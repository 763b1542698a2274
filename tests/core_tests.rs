mod helpers;

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use gortms::domain::schema::{FieldType, Schema};
use gortms::message::{Message, PredicateValue};
use gortms::queue::QueueConfig;
use gortms::routing::{Operator, Predicate};
use gortms::secure::{IncomingRequest, Permission, Role};
use helpers::setup_core;
use hmac::{Hmac, Mac};
use sha2::Sha256;

fn json_message(topic: &str, json: &str) -> Message {
    let mut headers = HashMap::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    Message::new(topic, Bytes::from(json.to_string())).with_headers(headers)
}

#[tokio::test]
async fn publish_and_consume_round_trips_through_a_consumer_group() {
    let (core, _dir) = setup_core();
    core.domains.create_domain("orders", None).unwrap();
    core.domains
        .create_queue("orders", "incoming", QueueConfig::from_defaults(&gortms::config::Config::default(), true))
        .unwrap();

    let msg = json_message("orders", r#"{"id":1}"#);
    let id = msg.id;
    core.domains.publish("orders", "incoming", msg).await.unwrap();

    core.groups.create("orders", "incoming", "workers", None);
    let cancellation = gortms::cancellation::Cancellation::root();
    let page = core
        .groups
        .consume("orders", "incoming", "workers", Some("c1"), 10, Duration::from_millis(200), &cancellation)
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].1.id, id);

    let fully_acked = core.groups.acknowledge("orders", "incoming", "workers", id).await.unwrap();
    assert!(fully_acked);
}

#[tokio::test]
async fn schema_mismatch_is_rejected_before_enqueue() {
    let (core, _dir) = setup_core();
    let mut fields = HashMap::new();
    fields.insert("age".to_string(), FieldType::Number);
    core.domains.create_domain("people", Some(Schema::new(fields))).unwrap();
    core.domains
        .create_queue("people", "q", QueueConfig::from_defaults(&gortms::config::Config::default(), false))
        .unwrap();

    let bad = json_message("people", r#"{"age":"not a number"}"#);
    let err = core.domains.publish("people", "q", bad).await.unwrap_err();
    assert!(matches!(err, gortms::error::CoreError::Validation(_)));

    assert_eq!(core.repository.queue_len("people", "q"), 0);
}

#[tokio::test]
async fn routed_message_is_forwarded_to_matching_downstream_queue() {
    let (core, _dir) = setup_core();
    core.domains.create_domain("orders", None).unwrap();
    let cfg = QueueConfig::from_defaults(&gortms::config::Config::default(), false);
    core.domains.create_queue("orders", "in", cfg.clone()).unwrap();
    core.domains.create_queue("orders", "high-value", cfg).unwrap();

    core.routing.install_rule(
        "orders",
        "in",
        "high-value",
        Predicate::new(Operator::Gt, "total", PredicateValue::Number(100.0)),
    );

    core.domains.publish("orders", "in", json_message("orders", r#"{"total":500}"#)).await.unwrap();
    core.domains.publish("orders", "in", json_message("orders", r#"{"total":1}"#)).await.unwrap();

    // Routing runs synchronously inside publish — no extra wait needed.
    assert_eq!(core.repository.queue_len("orders", "high-value"), 1);
}

#[tokio::test]
async fn deleting_a_domain_cascades_to_its_queues() {
    let (core, _dir) = setup_core();
    core.domains.create_domain("temp", None).unwrap();
    core.domains
        .create_queue("temp", "q", QueueConfig::from_defaults(&gortms::config::Config::default(), false))
        .unwrap();
    core.domains.publish("temp", "q", json_message("temp", "{}")).await.unwrap();

    core.domains.delete_domain("temp").await.unwrap();
    assert!(core.domains.publish("temp", "q", json_message("temp", "{}")).await.is_err());
}

#[tokio::test]
async fn account_request_approval_provisions_a_usable_login() {
    let (core, _dir) = setup_core();
    let request = core
        .account_requests
        .submit(&IncomingRequest {
            username: "grace".to_string(),
            requested_role: Role::User,
            password: "hunter2".to_string(),
        })
        .unwrap();

    assert!(core.account_requests.has_pending_for("grace"));
    core.account_requests.approve(request.id, "admin", &core.users).unwrap();
    assert!(core.users.verify("grace", "hunter2"));
}

#[tokio::test]
async fn service_account_secret_authenticates_a_signed_request() {
    let (core, _dir) = setup_core();
    let created = core
        .service_accounts
        .create("ingest-bot", vec![Permission::new("publish", "orders")], vec![])
        .unwrap();
    let secret = hex::decode(created.secret.unwrap()).unwrap();

    let timestamp = chrono::Utc::now().to_rfc3339();
    let canonical = format!("POST\n/publish/orders\n{{}}\n{timestamp}");
    let mut mac = Hmac::<Sha256>::new_from_slice(&secret).unwrap();
    mac.update(canonical.as_bytes());
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

    assert!(core.service_accounts.verify_signature(
        created.id,
        "POST",
        "/publish/orders",
        "{}",
        &timestamp,
        &signature,
        "127.0.0.1",
    ));
    assert!(core.service_accounts.has_permission(created.id, "publish:orders"));
}

#[tokio::test]
async fn snapshot_reports_stats_for_every_live_queue() {
    let (core, _dir) = setup_core();
    core.domains.create_domain("d", None).unwrap();
    core.domains
        .create_queue("d", "q", QueueConfig::from_defaults(&gortms::config::Config::default(), false))
        .unwrap();

    let snapshot = core.snapshot().await;
    // SYSTEM's bootstrapped queue plus the one just created.
    assert!(snapshot.queues.len() >= 2);
    assert!(snapshot.queues.iter().any(|s| s.name == "q"));
}
