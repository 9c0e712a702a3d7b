//! Auto-replay runs against an in-memory database with stub adapters.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use courier_core::{AutoReplayConfig, EventKind, ExportMode, ReplayPriority, UrlPolicyConfig};
use courier_database::{
    queries, AsyncDatabase, DeliveryStatus, ExportEvent, NewExportEvent, NewOutboxEvent, OutboxEvent,
};
use courier_outbox::{AdapterSet, HostResolver, UrlPolicy, WebhookReceipt, WebhookSender};
use dead_letter_auto_replay::{AutoReplayScheduler, ReplayReport, AUTO_REPLAY_ACTION, REPLAYED_BY};
use parking_lot::Mutex;
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use url::Url;

/// Every name resolves to one public address.
struct PublicDns;

#[async_trait]
impl HostResolver for PublicDns {
    async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        Ok(vec!["93.184.216.34".parse().unwrap()])
    }
}

/// Delivers, but another worker steals every live claim while the call is in flight.
struct ClaimStealingWebhook {
    db: AsyncDatabase,
    calls: Mutex<usize>,
}

#[async_trait]
impl WebhookSender for ClaimStealingWebhook {
    async fn send(&self, _: &Url, _: &serde_json::Value, _: std::time::Duration) -> WebhookReceipt {
        *self.calls.lock() += 1;
        self.db
            .call(|conn| {
                conn.execute("UPDATE outbox_events SET claim_token = 'other-worker' WHERE claim_token IS NOT NULL", [])?;
                Ok(())
            })
            .await
            .unwrap();
        WebhookReceipt::delivered()
    }
}

/// Succeeds unless the target path contains `fail`.
#[derive(Default)]
struct StubWebhook {
    calls: Mutex<Vec<String>>,
}

impl StubWebhook {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WebhookSender for StubWebhook {
    async fn send(&self, url: &Url, _: &serde_json::Value, _: std::time::Duration) -> WebhookReceipt {
        self.calls.lock().push(url.to_string());
        if url.path().contains("fail") {
            WebhookReceipt::failed("http_502", "HTTP 502 Bad Gateway")
        } else {
            WebhookReceipt::delivered()
        }
    }
}

struct Harness {
    db: AsyncDatabase,
    webhook: Arc<StubWebhook>,
    now: DateTime<Utc>,
}

impl Harness {
    async fn new() -> Self {
        Self {
            db: AsyncDatabase::open_in_memory().await.unwrap(),
            webhook: Arc::new(StubWebhook::default()),
            now: Utc::now(),
        }
    }

    fn scheduler(&self, config: AutoReplayConfig) -> AutoReplayScheduler {
        self.scheduler_with_policy(config, UrlPolicyConfig::default())
    }

    fn scheduler_with_policy(&self, config: AutoReplayConfig, policy: UrlPolicyConfig) -> AutoReplayScheduler {
        self.scheduler_with(config, policy, self.webhook.clone())
    }

    fn scheduler_with(
        &self,
        config: AutoReplayConfig,
        policy: UrlPolicyConfig,
        webhook: Arc<dyn WebhookSender>,
    ) -> AutoReplayScheduler {
        let policy = UrlPolicy::new(&policy).with_resolver(Arc::new(PublicDns));
        let adapters = AdapterSet::new(Arc::new(policy), std::time::Duration::from_secs(1)).with_webhook(webhook);
        AutoReplayScheduler::new(self.db.clone(), adapters, config, Duration::minutes(5))
    }

    /// Insert a dead outbox event created `age` ago with `attempts` recorded.
    async fn dead_event(&self, org: &str, kind: EventKind, path: &str, age: Duration, attempts: u32) -> String {
        let event_id = uuid::Uuid::new_v4().to_string();
        let payload = match kind {
            EventKind::Webhook => json!({"url": format!("https://hooks.example.com/{path}"), "body": {}}),
            EventKind::Email => json!({"recipient": "a@example.com", "subject": "s", "body": "b"}),
        };
        let event = NewOutboxEvent {
            event_id: event_id.clone(),
            org_id: org.to_string(),
            kind,
            payload,
            dedupe_key: event_id.clone(),
        };
        let created = self.now - age;
        let id = event_id.clone();
        self.db
            .call(move |conn| {
                queries::insert_outbox_event(conn, &event, created)?;
                conn.execute(
                    "UPDATE outbox_events SET status = 'dead', attempts = ?2, last_error = 'HTTP 500'
                     WHERE event_id = ?1",
                    rusqlite::params![id, attempts],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        event_id
    }

    async fn dead_export(&self, org: &str, mode: ExportMode, host: &str, age: Duration) -> String {
        let export_id = uuid::Uuid::new_v4().to_string();
        let export = NewExportEvent {
            export_id: export_id.clone(),
            org_id: org.to_string(),
            mode,
            target_url: format!("https://{host}/ingest"),
            target_url_host: host.to_string(),
            payload: json!({"lead": 1}),
            dedupe_key: export_id.clone(),
        };
        let created = self.now - age;
        let id = export_id.clone();
        self.db
            .call(move |conn| {
                queries::insert_export_event(conn, &export, created)?;
                conn.execute(
                    "UPDATE export_events SET status = 'dead', attempts = ?2, last_error = 'HTTP 500'
                     WHERE export_id = ?1",
                    rusqlite::params![id, 5],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        export_id
    }

    async fn exec(&self, sql: &'static str, id: &str) {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(sql, [&id])?;
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn event(&self, id: &str) -> OutboxEvent {
        let id = id.to_string();
        self.db
            .call(move |conn| queries::get_outbox_event(conn, &id))
            .await
            .unwrap()
            .unwrap()
    }

    async fn export(&self, id: &str) -> ExportEvent {
        let id = id.to_string();
        self.db
            .call(move |conn| queries::get_export_event(conn, &id))
            .await
            .unwrap()
            .unwrap()
    }

    async fn audit_count(&self, org: &str) -> usize {
        let org = org.to_string();
        self.db
            .call(move |conn| queries::list_audit_entries(conn, &org, Some(AUTO_REPLAY_ACTION)))
            .await
            .unwrap()
            .len()
    }
}

fn config() -> AutoReplayConfig {
    AutoReplayConfig::default()
}

#[tokio::test]
async fn test_replays_recoverable_event_once() {
    let h = Harness::new().await;
    let id = h.dead_event("org-a", EventKind::Webhook, "in", Duration::hours(2), 5).await;
    let scheduler = h.scheduler(config());

    let first = scheduler.run_auto_replay_at("org-a", h.now).await.unwrap();
    assert_eq!(first.sent, 1);
    assert_eq!(first.failed, 0);
    assert_eq!(first.depth_before, 1);
    assert_eq!(first.depth_after, 0);

    let event = h.event(&id).await;
    assert_eq!(event.status, DeliveryStatus::Sent);
    assert_eq!(event.attempts, 6);
    assert!(event.last_error.is_none());
    assert_eq!(h.audit_count("org-a").await, 1);

    let second = scheduler.run_auto_replay_at("org-a", h.now).await.unwrap();
    assert_eq!(second.sent, 0);
    assert_eq!(second.failed, 0);
    assert_eq!(second.processed, 0);
    assert_eq!(h.audit_count("org-a").await, 1);
    assert_eq!(h.webhook.calls().len(), 1);
}

#[tokio::test]
async fn test_run_is_scoped_to_one_org() {
    let h = Harness::new().await;
    h.dead_event("org-a", EventKind::Webhook, "in", Duration::hours(2), 5).await;
    let other = h.dead_event("org-b", EventKind::Webhook, "in", Duration::hours(2), 5).await;
    let before = h.event(&other).await;

    let report = h.scheduler(config()).run_auto_replay_at("org-a", h.now).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.depth_before, 1);

    let after = h.event(&other).await;
    assert_eq!(after.status, DeliveryStatus::Dead);
    assert_eq!(after.attempts, before.attempts);
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(h.audit_count("org-b").await, 0);
}

#[tokio::test]
async fn test_breaker_stops_after_failure_streak() {
    let h = Harness::new().await;
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            h.dead_event("org-a", EventKind::Webhook, "fail", Duration::hours(3) - Duration::minutes(i), 5)
                .await,
        );
    }
    let scheduler = h.scheduler(AutoReplayConfig {
        failure_streak_limit: 3,
        ..config()
    });

    let report = scheduler.run_auto_replay_at("org-a", h.now).await.unwrap();
    assert_eq!(
        report,
        ReplayReport {
            processed: 3,
            sent: 0,
            failed: 3,
            skipped: 0,
            lost: 0,
            depth_before: 5,
            depth_after: 5,
            breaker_tripped: true,
        }
    );
    assert_eq!(h.webhook.calls().len(), 3);

    for id in &ids[..3] {
        assert_eq!(h.event(id).await.attempts, 6);
    }
    for id in &ids[3..] {
        let untouched = h.event(id).await;
        assert_eq!(untouched.attempts, 5);
        assert_eq!(untouched.status, DeliveryStatus::Dead);
        assert!(untouched.claim_token.is_none(), "unattempted lease must be released");
    }
}

#[tokio::test]
async fn test_skips_do_not_reset_or_extend_streak() {
    let h = Harness::new().await;
    // fail, skip (no email adapter), fail: the breaker at 2 trips on the third row
    h.dead_event("org-a", EventKind::Webhook, "fail", Duration::hours(3), 5).await;
    let skipped = h.dead_event("org-a", EventKind::Email, "", Duration::minutes(170), 5).await;
    h.dead_event("org-a", EventKind::Webhook, "fail", Duration::minutes(160), 5).await;
    let untouched = h.dead_event("org-a", EventKind::Webhook, "in", Duration::minutes(150), 5).await;

    let scheduler = h.scheduler(AutoReplayConfig {
        failure_streak_limit: 2,
        allowed_outbox_kinds: vec![EventKind::Webhook, EventKind::Email],
        ..config()
    });
    let report = scheduler.run_auto_replay_at("org-a", h.now).await.unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(report.skipped, 1);
    assert!(report.breaker_tripped);

    let skipped = h.event(&skipped).await;
    assert_eq!(skipped.attempts, 5);
    assert_eq!(skipped.status, DeliveryStatus::Dead);
    assert!(skipped.last_error.unwrap().starts_with("adapter_missing"));
    assert_eq!(h.event(&untouched).await.status, DeliveryStatus::Dead);
}

#[tokio::test]
async fn test_eligibility_filters() {
    let h = Harness::new().await;
    let too_young = h.dead_event("org-a", EventKind::Webhook, "in", Duration::minutes(10), 5).await;
    let wrong_kind = h.dead_event("org-a", EventKind::Email, "", Duration::hours(2), 5).await;
    let at_ceiling = h.dead_event("org-a", EventKind::Webhook, "in", Duration::hours(2), 10).await;

    let report = h.scheduler(config()).run_auto_replay_at("org-a", h.now).await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.depth_before, 3);
    for id in [too_young, wrong_kind, at_ceiling] {
        assert_eq!(h.event(&id).await.status, DeliveryStatus::Dead);
    }
}

#[tokio::test]
async fn test_export_replay_respects_limit_and_cooldown() {
    let h = Harness::new().await;
    let exhausted = h.dead_export("org-a", ExportMode::Webhook, "crm.example.com", Duration::hours(5)).await;
    let cooling = h.dead_export("org-a", ExportMode::Webhook, "crm.example.com", Duration::hours(4)).await;
    let ready = h.dead_export("org-a", ExportMode::Webhook, "crm.example.com", Duration::hours(3)).await;
    let crm_mode = h.dead_export("org-a", ExportMode::Crm, "crm.example.com", Duration::hours(3)).await;

    h.exec("UPDATE export_events SET replay_count = 3 WHERE export_id = ?1", &exhausted).await;
    let recent = queries::format_datetime(h.now - Duration::minutes(10));
    let old = queries::format_datetime(h.now - Duration::hours(2));
    {
        let (cooling, ready) = (cooling.clone(), ready.clone());
        h.db.call(move |conn| {
            conn.execute(
                "UPDATE export_events SET replay_count = 1, last_replayed_at = ?2 WHERE export_id = ?1",
                [&cooling, &recent],
            )?;
            conn.execute(
                "UPDATE export_events SET replay_count = 1, last_replayed_at = ?2 WHERE export_id = ?1",
                [&ready, &old],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    let report = h.scheduler(config()).run_auto_replay_at("org-a", h.now).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.sent, 1);

    let replayed = h.export(&ready).await;
    assert_eq!(replayed.status, DeliveryStatus::Sent);
    assert_eq!(replayed.replay_count, 2);
    assert_eq!(replayed.last_replayed_by.as_deref(), Some(REPLAYED_BY));
    assert!(replayed.last_error_code.is_none());

    for id in [exhausted, cooling, crm_mode] {
        assert_eq!(h.export(&id).await.status, DeliveryStatus::Dead);
    }
}

#[tokio::test]
async fn test_failed_export_replay_is_recorded() {
    let h = Harness::new().await;
    let id = h.dead_export("org-a", ExportMode::Webhook, "crm.example.com", Duration::hours(2)).await;
    h.exec(
        "UPDATE export_events SET target_url = 'https://crm.example.com/fail' WHERE export_id = ?1",
        &id,
    )
    .await;

    let report = h.scheduler(config()).run_auto_replay_at("org-a", h.now).await.unwrap();
    assert_eq!(report.failed, 1);

    let export = h.export(&id).await;
    assert_eq!(export.status, DeliveryStatus::Dead);
    assert_eq!(export.replay_count, 1);
    assert_eq!(export.attempts, 6);
    assert_eq!(export.last_error_code.as_deref(), Some("http_502"));
    assert_eq!(export.last_replayed_by.as_deref(), Some(REPLAYED_BY));
    assert!(export.last_replayed_at.is_some());
}

#[tokio::test]
async fn test_export_target_revalidated_before_replay() {
    let h = Harness::new().await;
    let id = h.dead_export("org-a", ExportMode::Webhook, "crm.example.com", Duration::hours(2)).await;

    let scheduler = h.scheduler_with_policy(
        config(),
        UrlPolicyConfig {
            denied_hosts: vec!["crm.example.com".into()],
            ..Default::default()
        },
    );
    let report = scheduler.run_auto_replay_at("org-a", h.now).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert!(h.webhook.calls().is_empty());

    let export = h.export(&id).await;
    assert_eq!(export.status, DeliveryStatus::Dead);
    assert_eq!(export.replay_count, 0);
    assert_eq!(export.attempts, 5);
    assert_eq!(export.last_error_code.as_deref(), Some("url_blocked"));
}

#[tokio::test]
async fn test_policy_skips_cool_down_instead_of_burning_budget() {
    let h = Harness::new().await;
    let denied = [
        h.dead_export("org-a", ExportMode::Webhook, "crm.example.com", Duration::hours(5)).await,
        h.dead_export("org-a", ExportMode::Webhook, "crm.example.com", Duration::hours(4)).await,
    ];
    let valid = h.dead_export("org-a", ExportMode::Webhook, "api.example.com", Duration::hours(3)).await;

    let scheduler = h.scheduler_with_policy(
        AutoReplayConfig {
            max_per_org: 2,
            ..config()
        },
        UrlPolicyConfig {
            denied_hosts: vec!["crm.example.com".into()],
            ..Default::default()
        },
    );

    let first = scheduler.run_auto_replay_at("org-a", h.now).await.unwrap();
    assert_eq!((first.processed, first.skipped, first.sent), (2, 2, 0));
    for id in &denied {
        let export = h.export(id).await;
        assert_eq!(export.status, DeliveryStatus::Dead);
        assert!(export.next_attempt_at.unwrap() > h.now);
    }

    let second = scheduler
        .run_auto_replay_at("org-a", h.now + Duration::minutes(20))
        .await
        .unwrap();
    assert_eq!((second.processed, second.skipped, second.sent), (1, 0, 1));
    assert_eq!(h.export(&valid).await.status, DeliveryStatus::Sent);
    assert_eq!(h.audit_count("org-a").await, 3);

    let after_cooldown = scheduler
        .run_auto_replay_at("org-a", h.now + Duration::hours(5))
        .await
        .unwrap();
    assert_eq!(after_cooldown.skipped, 2);
    assert_eq!(h.webhook.calls().len(), 1);
}

#[tokio::test]
async fn test_lost_claims_are_not_counted_as_sent() {
    let h = Harness::new().await;
    let first = h.dead_event("org-a", EventKind::Webhook, "in", Duration::hours(3), 5).await;
    let second = h.dead_event("org-a", EventKind::Webhook, "in", Duration::hours(2), 5).await;

    let webhook = Arc::new(ClaimStealingWebhook {
        db: h.db.clone(),
        calls: Mutex::new(0),
    });
    let scheduler = h.scheduler_with(config(), UrlPolicyConfig::default(), webhook.clone());
    let report = scheduler.run_auto_replay_at("org-a", h.now).await.unwrap();

    assert_eq!(report.processed, 0);
    assert_eq!(report.sent, 0);
    assert_eq!(report.lost, 2);
    // the second row's lease was gone before its turn, so it was never sent
    assert_eq!(*webhook.calls.lock(), 1);

    for id in [&first, &second] {
        let event = h.event(id).await;
        assert_eq!(event.status, DeliveryStatus::Pending);
        assert_eq!(event.attempts, 5);
        assert_eq!(event.claim_token.as_deref(), Some("other-worker"));
    }

    let org = "org-a".to_string();
    let entries = h
        .db
        .call(move |conn| queries::list_audit_entries(conn, &org, Some(AUTO_REPLAY_ACTION)))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, "unrecorded:delivered");
}

#[tokio::test]
async fn test_shared_budget_and_priority() {
    let h = Harness::new().await;
    let events = [
        h.dead_event("org-a", EventKind::Webhook, "in", Duration::hours(2), 5).await,
        h.dead_event("org-a", EventKind::Webhook, "in", Duration::hours(2), 5).await,
    ];
    let exports = [
        h.dead_export("org-a", ExportMode::Webhook, "crm.example.com", Duration::hours(2)).await,
        h.dead_export("org-a", ExportMode::Webhook, "crm.example.com", Duration::hours(2)).await,
    ];

    let outbox_first = h.scheduler(AutoReplayConfig {
        max_per_org: 3,
        ..config()
    });
    let report = outbox_first.run_auto_replay_at("org-a", h.now).await.unwrap();
    assert_eq!(report.sent, 3);
    for id in &events {
        assert_eq!(h.event(id).await.status, DeliveryStatus::Sent);
    }
    let exports_sent = [h.export(&exports[0]).await.status, h.export(&exports[1]).await.status]
        .iter()
        .filter(|s| **s == DeliveryStatus::Sent)
        .count();
    assert_eq!(exports_sent, 1);

    let h = Harness::new().await;
    let event = h.dead_event("org-a", EventKind::Webhook, "in", Duration::hours(2), 5).await;
    let export = h.dead_export("org-a", ExportMode::Webhook, "crm.example.com", Duration::hours(2)).await;
    let export_first = h.scheduler(AutoReplayConfig {
        max_per_org: 1,
        priority: ReplayPriority::ExportFirst,
        ..config()
    });
    export_first.run_auto_replay_at("org-a", h.now).await.unwrap();
    assert_eq!(h.export(&export).await.status, DeliveryStatus::Sent);
    assert_eq!(h.event(&event).await.status, DeliveryStatus::Dead);
}

#[tokio::test]
async fn test_disabled_returns_empty_report() {
    let h = Harness::new().await;
    let id = h.dead_event("org-a", EventKind::Webhook, "in", Duration::hours(2), 5).await;

    let report = h
        .scheduler(AutoReplayConfig {
            auto_replay_enabled: false,
            ..config()
        })
        .run_auto_replay_at("org-a", h.now)
        .await
        .unwrap();
    assert_eq!(report, ReplayReport::default());
    assert_eq!(h.event(&id).await.status, DeliveryStatus::Dead);
}
