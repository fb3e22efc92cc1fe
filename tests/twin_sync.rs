//! End-to-end twin scenarios against in-memory seams.
//!
//! Timer-driven paths (resync throttling, drain scheduling) run under
//! tokio's paused clock, so the 2-minute sync period is exercised
//! deterministically.
//!
//! # Test Organization
//! - `reconnect_*` - resync and fanout after a connectivity gap
//! - `reported_*` - reported-property merge, drain, validation
//! - `desired_*` - desired-patch version arbitration

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use edge_gateway::{
    CloudSync, Collection, ConnectionRegistry, DeviceProxy, GatewayConfig, KvStore, MemoryKvStore,
    ProxyError, ReportedOutcome, SubscriptionTopic, Twin, TwinError, TwinManager, ValidationError,
};

// =============================================================================
// Fakes for the external seams
// =============================================================================

struct FakeCloud {
    twin: Mutex<Option<Twin>>,
    reachable: AtomicBool,
    get_calls: AtomicUsize,
    reported: Mutex<Vec<(String, Collection)>>,
}

impl FakeCloud {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            twin: Mutex::new(None),
            reachable: AtomicBool::new(true),
            get_calls: AtomicUsize::new(0),
            reported: Mutex::new(Vec::new()),
        })
    }

    fn set_desired(&self, version: i64, properties: Value) {
        let Value::Object(map) = properties else {
            panic!("expected object");
        };
        *self.twin.lock() = Some(Twin::new(
            Collection::new(version, map),
            Collection::default(),
        ));
    }

    fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn reported_calls(&self) -> usize {
        self.reported.lock().len()
    }
}

#[async_trait]
impl CloudSync for FakeCloud {
    async fn get_twin(&self, _id: &str) -> Option<Twin> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return None;
        }
        self.twin.lock().clone()
    }

    async fn update_reported(&self, id: &str, patch: &Collection) -> ReportedOutcome {
        self.reported.lock().push((id.to_string(), patch.clone()));
        ReportedOutcome::Ok
    }
}

#[derive(Default)]
struct RecordingProxy {
    received: Mutex<Vec<Collection>>,
}

impl RecordingProxy {
    fn received_count(&self) -> usize {
        self.received.lock().len()
    }
}

#[async_trait]
impl DeviceProxy for RecordingProxy {
    async fn on_desired_update(&self, patch: Collection) -> Result<(), ProxyError> {
        self.received.lock().push(patch);
        Ok(())
    }
}

#[derive(Default)]
struct FakeRegistry {
    subscribed: Mutex<HashSet<String>>,
    connected: Mutex<Vec<String>>,
    proxies: Mutex<HashMap<String, Arc<RecordingProxy>>>,
}

impl FakeRegistry {
    fn connect_subscribed(&self, id: &str) -> Arc<RecordingProxy> {
        let proxy = Arc::new(RecordingProxy::default());
        self.subscribed.lock().insert(id.to_string());
        self.connected.lock().push(id.to_string());
        self.proxies.lock().insert(id.to_string(), proxy.clone());
        proxy
    }
}

impl ConnectionRegistry for FakeRegistry {
    fn is_subscribed(&self, id: &str, topic: SubscriptionTopic) -> bool {
        topic == SubscriptionTopic::DesiredProperties && self.subscribed.lock().contains(id)
    }

    fn proxy(&self, id: &str) -> Option<Arc<dyn DeviceProxy>> {
        self.proxies
            .lock()
            .get(id)
            .cloned()
            .map(|proxy| proxy as Arc<dyn DeviceProxy>)
    }

    fn connected_clients(&self) -> Vec<String> {
        self.connected.lock().clone()
    }
}

fn setup() -> (
    Arc<TwinManager>,
    Arc<FakeCloud>,
    Arc<FakeRegistry>,
    Arc<MemoryKvStore>,
) {
    let cloud = FakeCloud::new();
    let registry = Arc::new(FakeRegistry::default());
    let store = Arc::new(MemoryKvStore::new());
    let manager = Arc::new(TwinManager::new(
        store.clone(),
        cloud.clone(),
        registry.clone(),
        GatewayConfig::default(),
    ));
    (manager, cloud, registry, store)
}

fn patch(version: i64, properties: Value) -> Collection {
    let Value::Object(map) = properties else {
        panic!("expected object");
    };
    Collection::new(version, map)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// =============================================================================
// Reconnect: resync and fanout
// =============================================================================

#[tokio::test(start_paused = true)]
async fn reconnect_resyncs_and_fans_out_missed_delta() {
    let (manager, cloud, registry, _store) = setup();
    let proxy = registry.connect_subscribed("d1");

    // device online, twin at v5
    cloud.set_desired(5, json!({"interval": 30}));
    let twin = manager.get_twin("d1").await.unwrap();
    assert_eq!(twin.properties.desired.version, 5);

    // device disconnects; cloud advances to v9
    cloud.set_desired(9, json!({"interval": 60, "unit": "s"}));
    tokio::time::advance(Duration::from_secs(121)).await;

    manager.on_device_connected().await;

    let stored = manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.properties.desired.version, 9);

    assert_eq!(proxy.received_count(), 1);
    let delta = proxy.received.lock()[0].clone();
    assert_eq!(delta.version, 9);
    assert_eq!(
        Value::Object(delta.properties),
        json!({"interval": 60, "unit": "s"})
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_burst_resyncs_once() {
    let (manager, cloud, registry, _store) = setup();
    let proxy = registry.connect_subscribed("d1");

    cloud.set_desired(5, json!({"interval": 30}));
    manager.get_twin("d1").await.unwrap();
    cloud.set_desired(6, json!({"interval": 45}));
    tokio::time::advance(Duration::from_secs(121)).await;

    // a burst of reconnects within the sync period
    manager.on_device_connected().await;
    manager.on_device_connected().await;
    manager.on_device_connected().await;

    assert_eq!(proxy.received_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn resync_aborts_silently_when_cloud_unreachable() {
    let (manager, cloud, registry, _store) = setup();
    let proxy = registry.connect_subscribed("d1");

    cloud.set_desired(5, json!({"interval": 30}));
    manager.get_twin("d1").await.unwrap();

    cloud.set_reachable(false);
    tokio::time::advance(Duration::from_secs(121)).await;
    manager.on_device_connected().await;

    // store keeps v5, nothing was pushed
    let stored = manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.properties.desired.version, 5);
    assert_eq!(proxy.received_count(), 0);
}

// =============================================================================
// Twin reads
// =============================================================================

#[tokio::test]
async fn read_falls_back_to_store_when_cloud_unreachable() {
    let (manager, cloud, _registry, _store) = setup();

    cloud.set_desired(3, json!({"interval": 30}));
    manager.get_twin("d1").await.unwrap();

    cloud.set_desired(9, json!({"interval": 60}));
    cloud.set_reachable(false);

    let twin = manager.get_twin("d1").await.unwrap();
    assert_eq!(twin.properties.desired.version, 3);
    assert_eq!(twin.properties.desired.properties["interval"], json!(30));
}

#[tokio::test]
async fn read_of_unknown_client_synthesizes_empty_twin() {
    let (manager, cloud, _registry, _store) = setup();
    cloud.set_reachable(false);

    let twin = manager.get_twin("never-seen").await.unwrap();
    assert_eq!(twin, Twin::default());
}

// =============================================================================
// Desired-patch arbitration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn desired_next_version_applies_without_cloud_round_trip() {
    let (manager, cloud, registry, _store) = setup();
    let proxy = registry.connect_subscribed("d1");

    manager.update_desired("d1", &patch(5, json!({"a": 1}))).await.unwrap();
    manager.update_desired("d1", &patch(6, json!({"b": 2}))).await.unwrap();

    assert_eq!(cloud.get_calls(), 0);
    let stored = manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.properties.desired.version, 6);
    assert_eq!(
        Value::Object(stored.properties.desired.properties),
        json!({"a": 1, "b": 2})
    );
    // both in-sequence patches were forwarded as-is
    assert_eq!(proxy.received_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn desired_stale_version_is_ignored() {
    let (manager, _cloud, registry, _store) = setup();
    let proxy = registry.connect_subscribed("d1");

    manager.update_desired("d1", &patch(5, json!({"a": 1}))).await.unwrap();
    manager.update_desired("d1", &patch(5, json!({"a": 99}))).await.unwrap();
    manager.update_desired("d1", &patch(4, json!({"a": 99}))).await.unwrap();

    let stored = manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.properties.desired.properties["a"], json!(1));
    assert_eq!(proxy.received_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn desired_version_gap_triggers_resync() {
    let (manager, cloud, registry, _store) = setup();
    let proxy = registry.connect_subscribed("d1");

    manager.update_desired("d1", &patch(5, json!({"a": 1}))).await.unwrap();
    assert_eq!(proxy.received_count(), 1);

    // v7 skips v6: the gateway pulls the authoritative twin instead
    cloud.set_desired(9, json!({"a": 2, "b": 3}));
    manager.update_desired("d1", &patch(7, json!({"a": 2}))).await.unwrap();

    assert_eq!(cloud.get_calls(), 1);
    let stored = manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.properties.desired.version, 9);
    assert_eq!(proxy.received_count(), 2);
    let delta = proxy.received.lock()[1].clone();
    assert_eq!(Value::Object(delta.properties), json!({"a": 2, "b": 3}));
}

#[tokio::test(start_paused = true)]
async fn desired_store_update_survives_missing_subscription() {
    let (manager, _cloud, _registry, _store) = setup();

    // nobody subscribed, nobody connected
    manager.update_desired("d1", &patch(1, json!({"a": 1}))).await.unwrap();

    let stored = manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.properties.desired.version, 1);
}

// =============================================================================
// Reported updates
// =============================================================================

#[tokio::test(start_paused = true)]
async fn reported_concurrent_updates_merge_and_drain_once() {
    let (manager, cloud, _registry, _store) = setup();

    let patch_a = patch(0, json!({"a": 1}));
    let patch_b = patch(0, json!({"b": 2}));
    let (first, second) = tokio::join!(
        manager.update_reported("d1", &patch_a),
        manager.update_reported("d1", &patch_b),
    );
    first.unwrap();
    second.unwrap();

    // both merged into the stored twin, one version bump each
    let stored = manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.properties.reported.version, 2);
    assert_eq!(
        Value::Object(stored.properties.reported.properties.clone()),
        json!({"a": 1, "b": 2})
    );

    // a single upstream call carries the merged pending patch
    wait_for(|| cloud.reported_calls() >= 1).await;
    assert_eq!(cloud.reported_calls(), 1);
    let (_, sent) = cloud.reported.lock()[0].clone();
    assert_eq!(Value::Object(sent.properties), json!({"a": 1, "b": 2}));
}

#[tokio::test(start_paused = true)]
async fn reported_update_visible_in_cache_before_drain() {
    let (manager, cloud, _registry, _store) = setup();

    manager.update_reported("d1", &patch(0, json!({"temp": 21}))).await.unwrap();

    // the cached twin reflects the update even though nothing has
    // drained upstream yet
    assert_eq!(cloud.reported_calls(), 0);
    let stored = manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.properties.reported.properties["temp"], json!(21));
}

#[tokio::test]
async fn reported_invalid_patch_mutates_nothing() {
    let (manager, cloud, _registry, store) = setup();

    let result = manager
        .update_reported("d1", &patch(0, json!({"bad.key": 1})))
        .await;
    assert!(matches!(
        result,
        Err(TwinError::Validation(ValidationError::MalformedKey(_)))
    ));

    let oversized = patch(0, json!({"blob": "x".repeat(9 * 1024)}));
    let result = manager.update_reported("d1", &oversized).await;
    assert!(matches!(
        result,
        Err(TwinError::Validation(ValidationError::PatchTooLarge(_)))
    ));

    assert!(manager.get_cached_twin("d1").await.unwrap().is_none());
    assert!(store.get("reported/d1").await.unwrap().is_none());
    assert_eq!(cloud.reported_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn restart_drains_reported_state_from_previous_run() {
    let cloud = FakeCloud::new();
    let registry = Arc::new(FakeRegistry::default());
    let store = Arc::new(MemoryKvStore::new());

    let pending = patch(0, json!({"temp": 21}));
    store
        .put("reported/d1", serde_json::to_vec(&pending).unwrap())
        .await
        .unwrap();

    let manager = Arc::new(TwinManager::new(
        store,
        cloud.clone(),
        registry,
        GatewayConfig::default(),
    ));
    let restored = manager.start().await.unwrap();
    assert_eq!(restored, 1);

    wait_for(|| cloud.reported_calls() == 1).await;
    let (id, sent) = cloud.reported.lock()[0].clone();
    assert_eq!(id, "d1");
    assert_eq!(sent.properties["temp"], json!(21));
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_in_flight_drain() {
    let (manager, cloud, _registry, store) = setup();

    manager.update_reported("d1", &patch(0, json!({"a": 1}))).await.unwrap();
    wait_for(|| cloud.reported_calls() == 1).await;

    manager.shutdown().await;

    // store was closed last
    assert!(store.get("twin/d1").await.is_err());
}
