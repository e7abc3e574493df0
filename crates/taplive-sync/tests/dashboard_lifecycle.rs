//! Integration tests for dashboard mount/unmount.
//!
//! Dashboards run against the in-memory push channel and a scripted snapshot
//! source, so every scenario is deterministic and offline.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taplive_core::{
    LiveConfig, LiveError, RankedProduct, ReconnectPolicy, Result, SalesTotals, SubjectId, Totals,
};
use taplive_sync::{
    ConnectionManager, DashboardMode, DashboardView, LiveDashboard, MemoryConnector, MemoryServer,
    SnapshotFetcher, SnapshotSource, SyncContext,
};
use tokio::sync::Notify;

fn totals(amount_cents: u64, units: u64, order_count: u64) -> Totals {
    Totals {
        sales: SalesTotals {
            amount_cents,
            units,
            order_count,
        },
        ..Totals::default()
    }
}

/// Snapshot source whose answers the test controls
#[derive(Default)]
struct ScriptedSource {
    totals: Mutex<Totals>,
    fail: AtomicBool,
    hold: AtomicBool,
    gate: Notify,
    totals_calls: AtomicUsize,
}

impl ScriptedSource {
    fn new(initial: Totals) -> Arc<Self> {
        let source = Self::default();
        *source.totals.lock().unwrap() = initial;
        Arc::new(source)
    }

    fn set_totals(&self, next: Totals) {
        *self.totals.lock().unwrap() = next;
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch_totals(&self, _subject: SubjectId) -> Result<Totals> {
        self.totals_calls.fetch_add(1, Ordering::SeqCst);
        if self.hold.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(LiveError::Fetch("503 Service Unavailable".to_string()));
        }
        Ok(self.totals.lock().unwrap().clone())
    }

    async fn fetch_top_products(
        &self,
        _subject: SubjectId,
        _limit: usize,
    ) -> Result<Vec<RankedProduct>> {
        Ok(vec![RankedProduct {
            product_id: 1,
            name: "Lager".to_string(),
            units: 40,
            amount_cents: 20_000,
        }])
    }
}

fn test_config(refresh_ms: u64) -> LiveConfig {
    let mut config = LiveConfig::default();
    config.refresh.totals_interval_ms = refresh_ms;
    config.refresh.top_products_interval_ms = refresh_ms;
    config.reconnect = ReconnectPolicy {
        max_attempts: 3,
        initial_delay_ms: 10,
        max_delay_ms: 40,
    };
    config
}

struct Harness {
    server: MemoryServer,
    source: Arc<ScriptedSource>,
    connections: Arc<ConnectionManager>,
    fetcher: SnapshotFetcher,
    config: LiveConfig,
}

impl Harness {
    fn new(config: LiveConfig) -> Self {
        let (connector, server) = MemoryConnector::pair();
        let source = ScriptedSource::new(totals(1000, 10, 2));
        Self {
            server,
            connections: Arc::new(ConnectionManager::new(
                Arc::new(connector),
                config.reconnect.clone(),
            )),
            fetcher: SnapshotFetcher::new(source.clone()),
            source,
            config,
        }
    }

    fn context(&self, token: Option<&str>) -> SyncContext {
        SyncContext::new(
            Arc::clone(&self.connections),
            self.fetcher.clone(),
            token.map(str::to_string),
            self.config.clone(),
        )
    }
}

async fn wait_view(
    dashboard: &LiveDashboard,
    what: &str,
    condition: impl FnMut(&DashboardView) -> bool,
) -> DashboardView {
    let mut rx = dashboard.view();
    let view = tokio::time::timeout(Duration::from_secs(3), rx.wait_for(condition))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
        .expect("view channel open");
    view.clone()
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn sale_frame(subject: SubjectId, sale_id: u64, amount_cents: u64) -> String {
    json!({
        "eventId": subject,
        "event": {
            "type": "sale:created",
            "saleId": sale_id,
            "barId": 3,
            "amountCents": amount_cents,
            "units": 1
        }
    })
    .to_string()
}

fn pos_sale_frame(subject: SubjectId, sale_id: u64, amount_cents: u64) -> String {
    json!({
        "eventId": subject,
        "event": {
            "type": "pos:sale:completed",
            "saleId": sale_id,
            "posId": 12,
            "barId": 3,
            "amountCents": amount_cents,
            "units": 1
        }
    })
    .to_string()
}

fn alert_frame(subject: SubjectId, alert_id: u64) -> String {
    json!({
        "eventId": subject,
        "event": {
            "type": "alert:created",
            "alertId": alert_id,
            "barId": 3,
            "message": "Low stock",
            "severity": "warning"
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_unmounting_one_view_keeps_the_other() {
    let harness = Harness::new(test_config(60_000));
    let context = harness.context(Some("token"));

    let mut x = context.mount(1);
    let mut y = context.mount(2);
    wait_view(&x, "x connected", |v| v.connected).await;
    wait_view(&y, "y connected", |v| v.connected).await;
    assert_eq!(harness.server.connects(), 1);
    assert_eq!(harness.connections.handle_count(), 2);

    x.stop().await;
    assert!(harness.connections.has_connection());
    assert_eq!(harness.connections.handle_count(), 1);
    assert!(harness.server.is_open());

    assert!(harness.server.push(sale_frame(2, 1, 150)));
    let view = wait_view(&y, "y sale", |v| v.recent_sales.len() == 1).await;
    assert!(view.connected);

    y.stop().await;
    assert!(!harness.connections.has_connection());
    eventually("session closed", || !harness.server.is_open()).await;
}

#[tokio::test]
async fn test_unmount_without_credential_is_idempotent() {
    let harness = Harness::new(test_config(60_000));
    let mut live = harness.context(Some("token")).mount(2);
    wait_view(&live, "connected", |v| v.connected).await;

    let mut offline = harness.context(None).mount(1);
    assert_eq!(offline.current().mode, DashboardMode::PullOnly);
    assert!(!offline.current().connected);

    offline.stop().await;
    offline.stop().await;
    assert!(!offline.is_running());

    assert_eq!(harness.connections.handle_count(), 1);
    assert!(harness.server.push(sale_frame(2, 5, 150)));
    wait_view(&live, "sale after other unmount", |v| v.recent_sales.len() == 1).await;

    live.stop().await;
}

#[tokio::test]
async fn test_events_accumulate_until_next_snapshot() {
    let harness = Harness::new(test_config(60_000));
    let mut dashboard = harness.context(Some("token")).mount(7);
    wait_view(&dashboard, "snapshot and connection", |v| {
        v.snapshot_at.is_some() && v.connected
    })
    .await;

    assert!(harness.server.push(sale_frame(7, 1, 150)));
    assert!(harness.server.push(sale_frame(7, 2, 150)));
    let view = wait_view(&dashboard, "two sales", |v| v.recent_sales.len() == 2).await;
    assert_eq!(view.totals.sales, totals(1300, 12, 4).sales);
    assert_eq!(view.pending.order_count, 2);

    // The POS sale nudges the pollers; the refreshed snapshot replaces the counters
    harness.source.set_totals(totals(1450, 13, 5));
    assert!(harness.server.push(pos_sale_frame(7, 3, 150)));
    let view = wait_view(&dashboard, "revalidated snapshot", |v| {
        v.pending.is_zero() && v.totals.sales.amount_cents == 1450
    })
    .await;
    assert_eq!(view.totals.sales, totals(1450, 13, 5).sales);
    assert_eq!(view.recent_sales.len(), 3);
    assert!(harness.source.totals_calls.load(Ordering::SeqCst) >= 2);

    dashboard.stop().await;
}

#[tokio::test]
async fn test_fetch_completing_after_unmount_is_discarded() {
    let harness = Harness::new(test_config(60_000));
    harness.source.hold.store(true, Ordering::SeqCst);

    let mut dashboard = harness.context(None).mount(4);
    eventually("fetch started", || {
        harness.source.totals_calls.load(Ordering::SeqCst) == 1
    })
    .await;

    dashboard.stop().await;
    harness.source.gate.notify_waiters();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let view = dashboard.current();
    assert!(view.snapshot_at.is_none());
    assert_eq!(view.totals, Totals::default());
    assert!(harness.fetcher.cached_totals(4).is_none());
}

#[tokio::test]
async fn test_alert_feed_keeps_most_recent() {
    let harness = Harness::new(test_config(60_000));
    let mut dashboard = harness.context(Some("token")).mount(9);
    wait_view(&dashboard, "connected", |v| v.connected).await;

    for id in 1..=20 {
        assert!(harness.server.push(alert_frame(9, id)));
    }
    let view = wait_view(&dashboard, "alerts", |v| {
        v.alerts.first().map(|a| a.id) == Some(20)
    })
    .await;
    assert_eq!(view.alerts.len(), 15);
    assert_eq!(view.alerts.last().map(|a| a.id), Some(6));
    assert_eq!(view.alerts[0].bar_label, "Bar #3");

    dashboard.update_names(HashMap::from([(3, "Main Bar".to_string())]));
    let view = wait_view(&dashboard, "relabelled", |v| {
        v.alerts.iter().all(|a| a.bar_label == "Main Bar")
    })
    .await;
    assert_eq!(view.alerts.len(), 15);

    dashboard.stop().await;
}

#[tokio::test]
async fn test_failed_refresh_keeps_displayed_totals() {
    let harness = Harness::new(test_config(20));
    let mut dashboard = harness.context(None).mount(5);
    wait_view(&dashboard, "snapshot", |v| v.snapshot_at.is_some()).await;

    harness.source.fail.store(true, Ordering::SeqCst);
    let view = wait_view(&dashboard, "stale", |v| v.stale).await;
    assert!(!view.is_loading);
    assert_eq!(view.totals.sales, totals(1000, 10, 2).sales);

    harness.source.fail.store(false, Ordering::SeqCst);
    wait_view(&dashboard, "recovered", |v| !v.stale).await;

    dashboard.stop().await;
}

#[tokio::test]
async fn test_new_mount_is_seeded_from_cache() {
    let harness = Harness::new(test_config(60_000));
    let context = harness.context(None);

    let mut first = context.mount(6);
    wait_view(&first, "ranking", |v| {
        v.snapshot_at.is_some() && !v.top_products.is_empty()
    })
    .await;
    first.stop().await;

    harness.source.hold.store(true, Ordering::SeqCst);
    let mut second = context.mount(6);
    let view = second.current();
    assert!(!view.is_loading);
    assert_eq!(view.totals.sales, totals(1000, 10, 2).sales);
    assert_eq!(view.top_products.len(), 1);

    second.stop().await;
}

#[tokio::test]
async fn test_settled_connection_shows_disconnected() {
    let harness = Harness::new(test_config(60_000));
    harness.server.set_refuse(true);

    let mut dashboard = harness.context(Some("token")).mount(8);
    assert_eq!(dashboard.current().mode, DashboardMode::Live);
    wait_view(&dashboard, "snapshot", |v| v.snapshot_at.is_some()).await;
    eventually("retry budget spent", || harness.server.connects() == 4).await;

    let view = dashboard.current();
    assert!(!view.connected);
    assert_eq!(view.totals.sales, totals(1000, 10, 2).sales);

    dashboard.stop().await;
    assert!(!harness.connections.has_connection());
}

#[tokio::test]
async fn test_two_views_of_one_subject_share_a_fetch() {
    let harness = Harness::new(test_config(60_000));
    harness.source.hold.store(true, Ordering::SeqCst);
    let context = harness.context(None);

    let mut a = context.mount(11);
    eventually("first fetch started", || {
        harness.source.totals_calls.load(Ordering::SeqCst) == 1
    })
    .await;

    // The second view ticks while the first fetch is still running
    let mut b = context.mount(11);
    assert!(b.current().is_loading);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.source.totals_calls.load(Ordering::SeqCst), 1);

    harness.source.hold.store(false, Ordering::SeqCst);
    harness.source.gate.notify_waiters();

    let view_b = wait_view(&b, "second view snapshot", |v| {
        v.snapshot_at.is_some() && !v.is_loading
    })
    .await;
    let view_a = wait_view(&a, "first view snapshot", |v| v.snapshot_at.is_some()).await;
    assert_eq!(view_b.totals.sales, totals(1000, 10, 2).sales);
    assert_eq!(view_a.totals.sales, view_b.totals.sales);
    assert_eq!(harness.source.totals_calls.load(Ordering::SeqCst), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_mount_after_settle_reconnects() {
    let harness = Harness::new(test_config(60_000));
    harness.server.set_refuse(true);
    let context = harness.context(Some("token"));

    let mut first = context.mount(8);
    eventually("retry budget spent", || harness.server.connects() == 4).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!first.current().connected);

    harness.server.set_refuse(false);
    let mut second = context.mount(9);
    wait_view(&second, "second connected", |v| v.connected).await;
    wait_view(&first, "first connected again", |v| v.connected).await;
    assert_eq!(harness.server.connects(), 5);
    assert_eq!(harness.connections.handle_count(), 2);

    assert!(harness.server.push(sale_frame(8, 1, 150)));
    wait_view(&first, "sale on first", |v| v.recent_sales.len() == 1).await;

    first.stop().await;
    second.stop().await;
    assert!(!harness.connections.has_connection());
}
