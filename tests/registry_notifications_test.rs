use async_trait::async_trait;
use devfleet::config::ServiceMode;
use devfleet::registry::{
    ChangeKind, ChannelObserver, HealthStatus, LifecycleStatus, Registry, RegistryObserver,
    ServiceChange, ServiceEntry, ServiceUpdate,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn entry(name: &str) -> ServiceEntry {
    ServiceEntry::new(name, "/tmp/project", ServiceMode::Daemon)
}

/// Drain whatever arrives within `window`.
async fn collect(rx: &mut mpsc::Receiver<ServiceChange>, window: Duration) -> Vec<ServiceChange> {
    let mut out = Vec::new();
    while let Ok(Some(change)) = tokio::time::timeout(window, rx.recv()).await {
        out.push(change);
    }
    out
}

struct PanickingObserver {
    calls: AtomicUsize,
}

#[async_trait]
impl RegistryObserver for PanickingObserver {
    async fn on_change(&self, _change: ServiceChange) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("observer blew up");
    }
}

struct StuckObserver;

#[async_trait]
impl RegistryObserver for StuckObserver {
    async fn on_change(&self, _change: ServiceChange) {
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}

#[tokio::test]
async fn test_identical_update_is_silent() {
    let registry = Registry::default();
    let (observer, mut rx) = ChannelObserver::new(64);
    registry.subscribe(observer);

    registry.register(entry("api"));
    let changed = registry
        .update("api", ServiceUpdate::new().lifecycle(LifecycleStatus::Starting))
        .unwrap();
    assert!(!changed, "entries start in Starting");

    let changes = collect(&mut rx, Duration::from_millis(200)).await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, ChangeKind::Registered);
}

#[tokio::test]
async fn test_each_real_change_notifies_once() {
    let registry = Registry::default();
    let (observer, mut rx) = ChannelObserver::new(64);
    registry.subscribe(observer);
    registry.register(entry("api"));

    assert!(registry
        .update(
            "api",
            ServiceUpdate::new()
                .lifecycle(LifecycleStatus::Ready)
                .health(HealthStatus::Healthy)
        )
        .unwrap());
    assert!(!registry
        .update("api", ServiceUpdate::new().health(HealthStatus::Healthy))
        .unwrap());
    assert!(registry
        .update("api", ServiceUpdate::new().error("boom"))
        .unwrap());

    let changes = collect(&mut rx, Duration::from_millis(200)).await;
    let kinds: Vec<ChangeKind> = changes.iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![ChangeKind::Registered, ChangeKind::Updated, ChangeKind::Updated]
    );

    let first_update = &changes[1];
    assert_eq!(first_update.previous_lifecycle, Some(LifecycleStatus::Starting));
    assert_eq!(first_update.previous_health, Some(HealthStatus::Starting));
    assert_eq!(first_update.entry.lifecycle, LifecycleStatus::Ready);
    assert_eq!(changes[2].entry.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_concurrent_registration() {
    let registry = Arc::new(Registry::default());
    let (observer, mut rx) = ChannelObserver::new(256);
    registry.subscribe(observer);

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.register(entry(&format!("svc-{}", i))) })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(registry.len(), 50);
    let changes = collect(&mut rx, Duration::from_millis(300)).await;
    assert_eq!(changes.len(), 50);
    assert!(changes.iter().all(|c| c.kind == ChangeKind::Registered));
}

#[tokio::test]
async fn test_unregister_is_terminal() {
    let registry = Registry::default();
    let (observer, mut rx) = ChannelObserver::new(64);
    registry.subscribe(observer);
    registry.register(entry("api"));

    assert!(registry.unregister("api"));
    assert!(!registry.unregister("api"));
    assert!(registry.get_service("api").is_none());
    assert!(registry
        .update("api", ServiceUpdate::new().lifecycle(LifecycleStatus::Ready))
        .is_err());

    let changes = collect(&mut rx, Duration::from_millis(200)).await;
    let kinds: Vec<ChangeKind> = changes.iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![ChangeKind::Registered, ChangeKind::Removed]);
}

#[tokio::test]
async fn test_panicking_observer_does_not_affect_others() {
    let registry = Registry::new(2, Duration::from_secs(1));
    let panicking = Arc::new(PanickingObserver {
        calls: AtomicUsize::new(0),
    });
    registry.subscribe(panicking.clone());
    let (observer, mut rx) = ChannelObserver::new(64);
    registry.subscribe(observer);

    registry.register(entry("api"));
    registry
        .update("api", ServiceUpdate::new().lifecycle(LifecycleStatus::Ready))
        .unwrap();

    let changes = collect(&mut rx, Duration::from_millis(300)).await;
    assert_eq!(changes.len(), 2);
    assert_eq!(panicking.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stuck_observer_does_not_delay_others() {
    // The delivery timeout is far longer than the collection window, so the
    // healthy observer only gets its changes if it never waits on the stuck one.
    let registry = Registry::new(64, Duration::from_secs(30));
    registry.subscribe(Arc::new(StuckObserver));
    for _ in 0..3 {
        let (filler, _rx) = ChannelObserver::new(1);
        registry.subscribe(filler);
    }
    let (observer, mut rx) = ChannelObserver::new(64);
    registry.subscribe(observer);

    let started = Instant::now();
    for name in ["api", "web", "db"] {
        registry.register(entry(name));
    }

    let changes = collect(&mut rx, Duration::from_millis(300)).await;
    let names: Vec<&str> = changes.iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["api", "web", "db"]);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_full_observer_queue_drops_and_counts() {
    let registry = Registry::new(2, Duration::from_secs(30));
    registry.subscribe(Arc::new(StuckObserver));
    let (observer, mut rx) = ChannelObserver::new(64);
    registry.subscribe(observer);
    let ids = registry.observer_ids();

    for i in 0..10 {
        registry.register(entry(&format!("svc-{}", i)));
    }

    // The stuck drain holds one change and its queue holds two more.
    let stuck_dropped = registry.observer_dropped(ids[0]).unwrap();
    assert!((7..=8).contains(&stuck_dropped), "dropped {}", stuck_dropped);

    let changes = collect(&mut rx, Duration::from_millis(300)).await;
    let dropped = registry.observer_dropped(ids[1]).unwrap();
    assert_eq!(changes.len() as u64 + dropped, 10);
    let names: Vec<&str> = changes.iter().map(|c| c.name()).collect();
    let mut sorted = names.clone();
    sorted.sort_by_key(|n| n[4..].parse::<u32>().unwrap());
    assert_eq!(names, sorted, "changes arrived out of order");
    assert_eq!(registry.observer_dropped(999), None);
}

#[tokio::test]
async fn test_unsubscribed_observer_receives_nothing() {
    let registry = Registry::default();
    let (observer, mut rx) = ChannelObserver::new(64);
    let observer: Arc<dyn RegistryObserver> = observer;
    registry.subscribe(observer.clone());
    assert!(registry.unsubscribe(&observer));

    registry.register(entry("api"));
    assert!(collect(&mut rx, Duration::from_millis(150)).await.is_empty());
}
