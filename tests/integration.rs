use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tg_relaybot::backup;
use tg_relaybot::courier::{Courier, DeliveryError, MessageRef};
use tg_relaybot::db;
use tg_relaybot::model::{Catalog, CatalogItem, ContentKind, ControlSignal, Quality, Rendition, RunPhase};
use tg_relaybot::resolver::{
    ChatGateway, DestinationError, DestinationResolver, ResolvedDestination,
};
use tg_relaybot::runner::{run_batch, BatchEngine, ControlError, RunError};
use tg_relaybot::source::{CatalogSource, SourceError};
use tokio::sync::{watch, Mutex};

const BATCH_ID: &str = "69204816dd258fd323a45956";
const DEST: i64 = -1001234567890;

async fn setup_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

async fn seed_batch(pool: &SqlitePool) {
    db::upsert_batch(pool, BATCH_ID, "Test Batch", 1).await.unwrap();
    db::set_destination(pool, BATCH_ID, DEST).await.unwrap();
}

fn video(name: &str) -> CatalogItem {
    CatalogItem::new(name, format!("https://cdn.example.com/{name}.mp4"), ContentKind::Video)
}

fn run_signal() -> (watch::Sender<ControlSignal>, watch::Receiver<ControlSignal>) {
    watch::channel(ControlSignal::Run)
}

#[derive(Clone)]
struct FakeSource {
    catalog: Arc<Mutex<Vec<CatalogItem>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl FakeSource {
    fn new(items: Vec<CatalogItem>) -> Self {
        Self {
            catalog: Arc::new(Mutex::new(items)),
            unavailable: Arc::new(Mutex::new(false)),
        }
    }

    async fn set_catalog(&self, items: Vec<CatalogItem>) {
        *self.catalog.lock().await = items;
    }

    async fn set_unavailable(&self, down: bool) {
        *self.unavailable.lock().await = down;
    }
}

#[async_trait]
impl CatalogSource for FakeSource {
    async fn fetch_catalog(&self, _batch_id: &str) -> Result<Catalog, SourceError> {
        if *self.unavailable.lock().await {
            return Err(SourceError::OriginUnavailable("origin down".into()));
        }
        Ok(Catalog {
            name: "Test Batch".into(),
            items: self.catalog.lock().await.clone(),
        })
    }
}

#[derive(Clone, Default)]
struct RecordingCourier {
    sent: Arc<Mutex<Vec<String>>>,
    fail_urls: Arc<Mutex<HashSet<String>>>,
    revoke_urls: Arc<Mutex<HashSet<String>>>,
    delay_ms: u64,
    counter: Arc<AtomicUsize>,
}

impl RecordingCourier {
    fn with_delay(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Default::default()
        }
    }

    async fn sent(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }

    async fn fail_url(&self, url: &str) {
        self.fail_urls.lock().await.insert(url.to_string());
    }

    async fn clear_failures(&self) {
        self.fail_urls.lock().await.clear();
    }

    async fn revoke_url(&self, url: &str) {
        self.revoke_urls.lock().await.insert(url.to_string());
    }
}

#[async_trait]
impl Courier for RecordingCourier {
    async fn deliver(
        &self,
        _destination: &ResolvedDestination,
        item: &CatalogItem,
        quality: Quality,
        _caption: &str,
    ) -> Result<MessageRef, DeliveryError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        // What a real courier would upload: the rendition matching the
        // batch's quality preference.
        let url = item.url_for(quality).to_string();
        if self.revoke_urls.lock().await.contains(&url) {
            return Err(DeliveryError::Revoked("bot was kicked".into()));
        }
        self.sent.lock().await.push(url.clone());
        if self.fail_urls.lock().await.contains(&url) {
            return Err(DeliveryError::Failed("upload error".into()));
        }
        Ok(MessageRef(self.counter.fetch_add(1, Ordering::SeqCst) as i64))
    }
}

struct OkGateway;

#[async_trait]
impl ChatGateway for OkGateway {
    async fn resolve_chat(&self, id: i64) -> Result<ResolvedDestination, DestinationError> {
        Ok(ResolvedDestination { chat_id: id, title: Some("Channel".into()) })
    }
    async fn check_post_permission(&self, _id: i64) -> Result<(), DestinationError> {
        Ok(())
    }
    async fn send_probe(&self, _id: i64) -> Result<(), DestinationError> {
        Ok(())
    }
}

struct DenyGateway;

#[async_trait]
impl ChatGateway for DenyGateway {
    async fn resolve_chat(&self, id: i64) -> Result<ResolvedDestination, DestinationError> {
        Ok(ResolvedDestination { chat_id: id, title: None })
    }
    async fn check_post_permission(&self, id: i64) -> Result<(), DestinationError> {
        Err(DestinationError::NotAdmin(id.to_string()))
    }
    async fn send_probe(&self, _id: i64) -> Result<(), DestinationError> {
        Ok(())
    }
}

fn resolver_ok() -> DestinationResolver {
    DestinationResolver::new(Arc::new(OkGateway))
}

#[tokio::test]
async fn full_run_then_noop_rerun() {
    let pool = setup_pool().await;
    seed_batch(&pool).await;
    let source = FakeSource::new(vec![video("a"), video("b"), video("c")]);
    let courier = RecordingCourier::default();
    let resolver = resolver_ok();
    let (_tx, rx) = run_signal();

    let report = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap();
    assert_eq!(report.phase, RunPhase::Idle);
    assert_eq!(report.delivered, 3);
    assert_eq!(db::count_deliveries(&pool, BATCH_ID).await.unwrap(), 3);

    // Second run over the unchanged catalog delivers nothing.
    let report = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(report.total, 0);
    assert_eq!(courier.sent().await.len(), 3);
}

#[tokio::test]
async fn reordered_catalog_delivers_only_new_item() {
    let pool = setup_pool().await;
    seed_batch(&pool).await;
    let source = FakeSource::new(vec![video("a"), video("b"), video("c")]);
    let courier = RecordingCourier::default();
    let resolver = resolver_ok();
    let (_tx, rx) = run_signal();

    run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap();

    // Origin reordered and added D.
    source.set_catalog(vec![video("b"), video("c"), video("d")]).await;
    let report = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(
        courier.sent().await.last().map(String::as_str),
        Some("https://cdn.example.com/d.mp4")
    );
    assert_eq!(db::count_deliveries(&pool, BATCH_ID).await.unwrap(), 4);
}

#[tokio::test]
async fn not_admin_prevents_any_delivery() {
    let pool = setup_pool().await;
    seed_batch(&pool).await;
    let source = FakeSource::new(vec![video("a")]);
    let courier = RecordingCourier::default();
    let resolver = DestinationResolver::new(Arc::new(DenyGateway));
    let (_tx, rx) = run_signal();

    let err = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap_err();
    assert!(matches!(err, RunError::Destination(DestinationError::NotAdmin(_))));
    assert!(courier.sent().await.is_empty());
    assert_eq!(db::count_deliveries(&pool, BATCH_ID).await.unwrap(), 0);
}

#[tokio::test]
async fn pause_then_resume_equals_uninterrupted_run() {
    let catalog = vec![video("a"), video("b"), video("c")];

    // Uninterrupted reference run.
    let ref_pool = setup_pool().await;
    seed_batch(&ref_pool).await;
    let ref_courier = RecordingCourier::default();
    let (_tx, rx) = run_signal();
    run_batch(&ref_pool, &FakeSource::new(catalog.clone()), &ref_courier, &resolver_ok(), BATCH_ID, &rx)
        .await
        .unwrap();
    let reference: HashSet<String> = db::delivered_hashes(&ref_pool, BATCH_ID, DEST).await.unwrap();

    // Interrupted run: pause signal already pending, observed after item 0.
    let pool = setup_pool().await;
    seed_batch(&pool).await;
    let source = FakeSource::new(catalog);
    let courier = RecordingCourier::default();
    let resolver = resolver_ok();

    let (tx, rx) = run_signal();
    tx.send(ControlSignal::Pause).unwrap();
    let report = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap();
    assert_eq!(report.phase, RunPhase::Paused);
    assert_eq!(report.delivered, 1);

    let progress = db::get_progress(&pool, BATCH_ID).await.unwrap().unwrap();
    assert_eq!(progress.current_index, 1);
    assert_eq!(progress.total_items, 3);

    // Resume: item 0 is not re-delivered, items 1-2 are attempted.
    let (_tx2, rx2) = run_signal();
    let report = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx2).await.unwrap();
    assert_eq!(report.phase, RunPhase::Idle);
    assert_eq!(report.delivered, 2);

    let resumed: HashSet<String> = db::delivered_hashes(&pool, BATCH_ID, DEST).await.unwrap();
    assert_eq!(resumed, reference);

    let sent = courier.sent().await;
    assert_eq!(sent.len(), 3);
    assert_eq!(sent.iter().filter(|u| u.ends_with("/a.mp4")).count(), 1);
}

#[tokio::test]
async fn stop_preserves_cursor() {
    let pool = setup_pool().await;
    seed_batch(&pool).await;
    let source = FakeSource::new(vec![video("a"), video("b"), video("c")]);
    let courier = RecordingCourier::default();
    let resolver = resolver_ok();

    let (tx, rx) = run_signal();
    tx.send(ControlSignal::Stop).unwrap();
    let report = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap();
    assert_eq!(report.phase, RunPhase::Stopped);
    assert_eq!(db::count_deliveries(&pool, BATCH_ID).await.unwrap(), 1);

    let progress = db::get_progress(&pool, BATCH_ID).await.unwrap().unwrap();
    assert_eq!(progress.current_index, 1);
}

#[tokio::test]
async fn failed_item_is_counted_and_retried_next_run() {
    let pool = setup_pool().await;
    seed_batch(&pool).await;
    let source = FakeSource::new(vec![video("a"), video("b"), video("c")]);
    let courier = RecordingCourier::default();
    courier.fail_url("https://cdn.example.com/b.mp4").await;
    let resolver = resolver_ok();
    let (_tx, rx) = run_signal();

    let report = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap();
    assert_eq!(report.phase, RunPhase::Idle);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(db::count_deliveries(&pool, BATCH_ID).await.unwrap(), 2);

    let progress = db::get_progress(&pool, BATCH_ID).await.unwrap().unwrap();
    assert_eq!(progress.items_failed, 1);
    assert_eq!(progress.current_index, 3);

    // The failure cleared up; only the failed item is re-attempted.
    courier.clear_failures().await;
    let report = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(db::count_deliveries(&pool, BATCH_ID).await.unwrap(), 3);
}

#[tokio::test]
async fn revoked_destination_aborts_run() {
    let pool = setup_pool().await;
    seed_batch(&pool).await;
    let source = FakeSource::new(vec![video("a"), video("b"), video("c")]);
    let courier = RecordingCourier::default();
    courier.revoke_url("https://cdn.example.com/b.mp4").await;
    let resolver = resolver_ok();
    let (_tx, rx) = run_signal();

    let err = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap_err();
    assert!(matches!(err, RunError::Revoked(_)));

    // Item a committed, b recorded as the failure point, c never attempted.
    assert_eq!(db::count_deliveries(&pool, BATCH_ID).await.unwrap(), 1);
    let progress = db::get_progress(&pool, BATCH_ID).await.unwrap().unwrap();
    assert_eq!(progress.current_index, 2);
    assert_eq!(
        progress.last_item_url.as_deref(),
        Some("https://cdn.example.com/b.mp4")
    );
    assert!(!resolver.is_cached(DEST).await);
}

#[tokio::test]
async fn origin_unavailable_is_resumable() {
    let pool = setup_pool().await;
    seed_batch(&pool).await;
    let source = FakeSource::new(vec![video("a")]);
    source.set_unavailable(true).await;
    let courier = RecordingCourier::default();
    let resolver = resolver_ok();
    let (_tx, rx) = run_signal();

    let err = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap_err();
    assert!(matches!(err, RunError::Origin(SourceError::OriginUnavailable(_))));
    assert_eq!(db::count_deliveries(&pool, BATCH_ID).await.unwrap(), 0);

    source.set_unavailable(false).await;
    let report = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap();
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn quality_preference_selects_the_delivered_rendition() {
    let pool = setup_pool().await;
    seed_batch(&pool).await;
    db::set_quality(&pool, BATCH_ID, Quality::Q480p).await.unwrap();

    let item = CatalogItem::new(
        "Lecture",
        "https://cdn.example.com/lecture-1080.mp4",
        ContentKind::Video,
    )
    .with_renditions(vec![
        Rendition {
            quality: "480p".into(),
            url: "https://cdn.example.com/lecture-480.mp4".into(),
        },
        Rendition {
            quality: "1080p".into(),
            url: "https://cdn.example.com/lecture-1080.mp4".into(),
        },
    ]);
    let source = FakeSource::new(vec![item]);
    let courier = RecordingCourier::default();
    let resolver = resolver_ok();
    let (_tx, rx) = run_signal();

    let report = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(
        courier.sent().await,
        vec!["https://cdn.example.com/lecture-480.mp4".to_string()]
    );

    // Dedup identity is the item, not the rendition: changing the preference
    // afterwards does not cause a re-send.
    db::set_quality(&pool, BATCH_ID, Quality::Q1080p).await.unwrap();
    let report = run_batch(&pool, &source, &courier, &resolver, BATCH_ID, &rx).await.unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(courier.sent().await.len(), 1);
}

#[tokio::test]
async fn restore_then_run_delivers_only_missing_items() {
    // Deliver a and b on one installation.
    let pool_a = setup_pool().await;
    seed_batch(&pool_a).await;
    let source = FakeSource::new(vec![video("a"), video("b")]);
    let courier_a = RecordingCourier::default();
    let (_tx, rx) = run_signal();
    run_batch(&pool_a, &source, &courier_a, &resolver_ok(), BATCH_ID, &rx).await.unwrap();
    let doc = backup::serialize_batch(&pool_a, BATCH_ID).await.unwrap();

    // Restore into a fresh installation; the origin grew by one item.
    let pool_b = setup_pool().await;
    let resolver = resolver_ok();
    backup::restore_batch(&pool_b, &resolver, &doc, Some(BATCH_ID)).await.unwrap();

    source.set_catalog(vec![video("a"), video("b"), video("c")]).await;
    let courier_b = RecordingCourier::default();
    let report = run_batch(&pool_b, &source, &courier_b, &resolver, BATCH_ID, &rx).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(
        courier_b.sent().await,
        vec!["https://cdn.example.com/c.mp4".to_string()]
    );
}

async fn wait_for_phase(engine: &BatchEngine, phase: RunPhase) {
    for _ in 0..200 {
        if engine.phase(BATCH_ID).await == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("batch never reached {phase:?}");
}

fn engine_with(pool: SqlitePool, source: FakeSource, courier: RecordingCourier) -> BatchEngine {
    BatchEngine::new(
        pool,
        Arc::new(source),
        Arc::new(courier),
        Arc::new(resolver_ok()),
    )
}

#[tokio::test]
async fn engine_rejects_concurrent_start() {
    let pool = setup_pool().await;
    seed_batch(&pool).await;
    let items: Vec<CatalogItem> = (0..5).map(|n| video(&format!("slow-{n}"))).collect();
    let engine = engine_with(
        pool,
        FakeSource::new(items),
        RecordingCourier::with_delay(100),
    );

    engine.start(BATCH_ID).await.unwrap();
    let err = engine.start(BATCH_ID).await.unwrap_err();
    assert!(matches!(err, ControlError::AlreadyRunning(_)));

    wait_for_phase(&engine, RunPhase::Idle).await;
    // The batch is restartable once the run completed.
    engine.start(BATCH_ID).await.unwrap();
    wait_for_phase(&engine, RunPhase::Idle).await;
}

#[tokio::test]
async fn engine_pause_and_resume_delivers_everything_once() {
    let pool = setup_pool().await;
    seed_batch(&pool).await;
    let items: Vec<CatalogItem> = (0..5).map(|n| video(&format!("page-{n}"))).collect();
    let source = FakeSource::new(items);
    let courier = RecordingCourier::with_delay(80);
    let engine = engine_with(pool.clone(), source, courier.clone());

    engine.start(BATCH_ID).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    engine.pause(BATCH_ID).await.unwrap();
    wait_for_phase(&engine, RunPhase::Paused).await;

    let paused_batch = db::get_batch(&pool, BATCH_ID).await.unwrap().unwrap();
    assert!(paused_batch.is_paused);
    let delivered_so_far = db::count_deliveries(&pool, BATCH_ID).await.unwrap();
    assert!(delivered_so_far < 5);

    engine.resume(BATCH_ID).await.unwrap();
    wait_for_phase(&engine, RunPhase::Idle).await;

    let resumed_batch = db::get_batch(&pool, BATCH_ID).await.unwrap().unwrap();
    assert!(!resumed_batch.is_paused);
    assert_eq!(db::count_deliveries(&pool, BATCH_ID).await.unwrap(), 5);

    // Every item went out exactly once across both segments.
    let sent = courier.sent().await;
    let unique: HashSet<&String> = sent.iter().collect();
    assert_eq!(sent.len(), 5);
    assert_eq!(unique.len(), 5);
}

#[tokio::test]
async fn engine_pause_requires_active_run() {
    let pool = setup_pool().await;
    seed_batch(&pool).await;
    let engine = engine_with(pool, FakeSource::new(vec![]), RecordingCourier::default());

    let err = engine.pause(BATCH_ID).await.unwrap_err();
    assert!(matches!(err, ControlError::NotRunning(_)));
}
