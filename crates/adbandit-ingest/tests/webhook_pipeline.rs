//! End-to-end intake tests: signed webhooks through the shared pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use chrono::{Duration, TimeZone, Utc};

use adbandit_ingest::{
    webhook, Ingestor, MetricValidator, PendingQueue, WebhookState,
};
use adbandit_models::{
    Arm, Campaign, CampaignStatus, Metric, MetricQuality, MetricSource, PrimaryKpi,
};
use adbandit_store::PosteriorStore;

const SECRET: &str = "webhook-test-secret";

struct Fixture {
    store: Arc<PosteriorStore>,
    state: Arc<WebhookState>,
    campaign_id: i64,
    arm_id: i64,
}

fn fixture() -> Fixture {
    let store = Arc::new(PosteriorStore::open_in_memory().unwrap());
    let campaign = Campaign {
        id: 0,
        name: "hooks".into(),
        total_budget: 5000.0,
        start: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        end: None,
        status: CampaignStatus::Active,
        primary_kpi: PrimaryKpi::Roas,
        risk_tolerance: 0.3,
        variance_limit: 0.1,
        cadence_ms: 900_000,
    };
    let campaign_id = store.create_campaign(&campaign).unwrap();
    let arm = Arm::new(campaign_id, "google", "Search", "Creative A", 1.0);
    let arm_id = store.add_arm(&arm).unwrap();

    let queue = Arc::new(PendingQueue::new(100));
    let ingestor = Arc::new(Ingestor::new(
        store.clone(),
        MetricValidator::default(),
        queue,
        1000,
        // High hint threshold so these tests exercise the non-hint path.
        1e9,
    ));
    let mut secrets = HashMap::new();
    secrets.insert("google".to_string(), SECRET.to_string());
    let state = Arc::new(WebhookState::new(ingestor, secrets));
    Fixture {
        store,
        state,
        campaign_id,
        arm_id,
    }
}

fn google_body() -> Vec<u8> {
    br#"{
        "conversion": {
            "creative": "Creative A",
            "bid": 1.0,
            "ts": "2026-02-01T10:00:00Z",
            "impressions": 1000,
            "clicks": 50,
            "conversions": 5,
            "cost": 25.0,
            "revenue": 100.0
        }
    }"#
    .to_vec()
}

async fn post(
    state: &Arc<WebhookState>,
    platform: &str,
    body: Vec<u8>,
    signature: Option<String>,
) -> StatusCode {
    let mut headers = HeaderMap::new();
    if let Some(sig) = signature {
        headers.insert(
            webhook::signature_header(platform),
            HeaderValue::from_str(&sig).unwrap(),
        );
    }
    let (status, _) = webhook::webhook_handler(
        State(state.clone()),
        Path(platform.to_string()),
        headers,
        Bytes::from(body),
    )
    .await;
    status
}

#[tokio::test]
async fn webhook_resubmission_is_idempotent() {
    let f = fixture();
    let body = google_body();
    let sig = webhook::sign_body(SECRET, &body);

    for _ in 0..3 {
        let status = post(&f.state, "google", body.clone(), Some(sig.clone())).await;
        assert_eq!(status, StatusCode::OK);
    }

    // Exactly one row for (arm, ts, source=webhook).
    let ts = Utc.with_ymd_and_hms(2026, 2, 1, 10, 0, 0).unwrap();
    let rows = f
        .store
        .metric_history(f.arm_id, ts - Duration::days(1))
        .unwrap();
    let webhook_rows: Vec<_> = rows
        .iter()
        .filter(|m| m.source == MetricSource::Webhook)
        .collect();
    assert_eq!(webhook_rows.len(), 1);
}

#[tokio::test]
async fn bad_signatures_are_rejected_and_counted() {
    let f = fixture();
    let body = google_body();

    assert_eq!(
        post(&f.state, "google", body.clone(), None).await,
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        post(&f.state, "google", body.clone(), Some("deadbeef".into())).await,
        StatusCode::UNAUTHORIZED
    );
    // Valid signature over a different body.
    let sig = webhook::sign_body(SECRET, b"other");
    assert_eq!(
        post(&f.state, "google", body, Some(sig)).await,
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        f.state
            .rejected_signatures
            .load(std::sync::atomic::Ordering::Relaxed),
        3
    );
}

#[tokio::test]
async fn malformed_and_unbound_payloads_get_400() {
    let f = fixture();

    let garbage = b"not json at all".to_vec();
    let sig = webhook::sign_body(SECRET, &garbage);
    assert_eq!(
        post(&f.state, "google", garbage, Some(sig)).await,
        StatusCode::BAD_REQUEST
    );

    // Well-formed payload for an arm nobody registered.
    let body = br#"{
        "conversion": {
            "creative": "Unknown Creative",
            "bid": 9.0,
            "ts": "2026-02-01T10:00:00Z",
            "clicks": 1,
            "impressions": 10
        }
    }"#
    .to_vec();
    let sig = webhook::sign_body(SECRET, &body);
    assert_eq!(
        post(&f.state, "google", body, Some(sig)).await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn unconfigured_platform_is_unauthorized() {
    let f = fixture();
    let body = google_body();
    let sig = webhook::sign_body(SECRET, &body);
    assert_eq!(
        post(&f.state, "meta", body, Some(sig)).await,
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn anomalous_roas_is_persisted_suspect_and_skips_the_posterior() {
    let f = fixture();

    // Build a 7-day baseline: ROAS ~2 with modest dispersion.
    for (day, roas) in [(1, 1.7), (2, 2.0), (3, 2.3), (4, 2.0), (5, 1.9)] {
        let m = Metric {
            arm_id: f.arm_id,
            ts: Utc.with_ymd_and_hms(2026, 1, 25 + day, 10, 0, 0).unwrap(),
            impressions: 1000,
            clicks: 50,
            conversions: 5,
            cost: 10.0,
            revenue: 10.0 * roas,
            source: MetricSource::Backfill,
            quality: MetricQuality::Ok,
        };
        f.store.record_metric(&m).unwrap();
    }

    // ROAS 500 against that baseline: flagged, kept, not applied.
    let body = br#"{
        "conversion": {
            "creative": "Creative A",
            "bid": 1.0,
            "ts": "2026-02-01T11:00:00Z",
            "impressions": 1000,
            "clicks": 50,
            "conversions": 40,
            "cost": 1.0,
            "revenue": 500.0
        }
    }"#
    .to_vec();
    let sig = webhook::sign_body(SECRET, &body);
    assert_eq!(
        post(&f.state, "google", body, Some(sig)).await,
        StatusCode::OK
    );

    let rows = f
        .store
        .metric_history(
            f.arm_id,
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].quality, MetricQuality::Suspect);

    // No posterior update happened.
    assert!(f.store.get_posterior(f.arm_id).unwrap().is_none());

    // The flag left an audit row in the change log.
    let changes = f
        .store
        .changes_range(
            f.campaign_id,
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();
    assert!(changes
        .iter()
        .any(|c| c.reason.starts_with("metric_flagged_suspect")));
}

#[tokio::test]
async fn big_webhook_delta_applies_posterior_out_of_cycle() {
    let store = Arc::new(PosteriorStore::open_in_memory().unwrap());
    let campaign = Campaign {
        id: 0,
        name: "hints".into(),
        total_budget: 5000.0,
        start: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        end: None,
        status: CampaignStatus::Active,
        primary_kpi: PrimaryKpi::Roas,
        risk_tolerance: 0.3,
        variance_limit: 0.1,
        cadence_ms: 900_000,
    };
    let cid = store.create_campaign(&campaign).unwrap();
    let arm = Arm::new(cid, "google", "Search", "Creative A", 1.0);
    let aid = store.add_arm(&arm).unwrap();

    let queue = Arc::new(PendingQueue::new(100));
    let ingestor = Arc::new(Ingestor::new(
        store.clone(),
        MetricValidator::default(),
        queue,
        1000,
        0.5, // low threshold: the delta below triggers the hint
    ));
    let mut secrets = HashMap::new();
    secrets.insert("google".to_string(), SECRET.to_string());
    let state = Arc::new(WebhookState::new(ingestor, secrets));

    let body = google_body();
    let sig = webhook::sign_body(SECRET, &body);
    assert_eq!(
        post(&state, "google", body, Some(sig)).await,
        StatusCode::OK
    );

    let posterior = store.get_posterior(aid).unwrap().expect("hint applied");
    assert_eq!(posterior.trials, 50);
    assert!((posterior.alpha - 6.0).abs() < 1e-9);
    assert!((posterior.beta - 46.0).abs() < 1e-9);
}
