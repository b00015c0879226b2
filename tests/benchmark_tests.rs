//! Performance benchmarks for critical server systems

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use realm_server::entity::{EntityArena, EntityHandle, EntityId};
use realm_server::physics::Vector2;
use realm_server::process::{ProcessKind, ProcessQueue, ProcessSpec};
use realm_server::session::Session;
use realm_server::session_registry::SessionRegistry;
use realm_server::time_system::{TimeContext, TimeSubscriber, TimeSystem};
use realm_server::world::{EntityKind, World};
use realm_server::ServerConfig;
use realm_shared::{encode_frame, Packet, FRAME_HEADER_LEN};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn midnight() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// Benchmarks handle resolution against a populated arena
#[test]
fn benchmark_handle_resolution() {
    let mut arena: EntityArena<u64> = EntityArena::new();
    let ids: Vec<EntityId> = (0..1000).map(|i| arena.insert_with(|_, _| i)).collect();
    let mut handles: Vec<EntityHandle> = ids
        .iter()
        .map(|id| EntityHandle::bind(&mut arena, *id).unwrap())
        .collect();

    let iterations = 100;
    let start = Instant::now();

    let mut sum = 0u64;
    for _ in 0..iterations {
        for handle in handles.iter_mut() {
            sum += *handle.resolve(&mut arena).unwrap();
        }
    }

    let duration = start.elapsed();
    let resolves = iterations * handles.len();
    println!(
        "Handle resolution: {} resolves in {:?} ({:.2} ns/resolve)",
        resolves,
        duration,
        duration.as_nanos() as f64 / resolves as f64
    );

    assert_eq!(sum, iterations as u64 * (0..1000u64).sum::<u64>());
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks stale-handle detection after mass despawn and slot reuse
#[test]
fn benchmark_stale_handle_churn() {
    let mut arena: EntityArena<u32> = EntityArena::new();
    let start = Instant::now();

    for round in 0..100u32 {
        let ids: Vec<EntityId> = (0..100).map(|i| arena.insert_with(|_, _| round * 100 + i)).collect();
        let mut handles: Vec<EntityHandle> = ids
            .iter()
            .map(|id| EntityHandle::bind(&mut arena, *id).unwrap())
            .collect();
        for id in &ids {
            arena.remove(*id);
        }
        for handle in handles.iter_mut() {
            assert!(handle.resolve(&mut arena).is_none());
        }
    }

    let duration = start.elapsed();
    println!("Stale handle churn: 10000 entities in {:?}", duration);

    assert!(arena.is_empty());
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks pumping a large, mixed-delay process queue
#[test]
fn benchmark_process_pump() {
    let mut queue = ProcessQueue::new();
    let t0 = Instant::now();
    let count = 50_000u64;

    let start = Instant::now();
    for i in 0..count {
        queue.enqueue(
            ProcessSpec::new(ProcessKind::MarketUpdate)
                .param(0, i as i64)
                .delay(Duration::from_millis(i % 1000)),
            t0,
        );
    }

    let mut dispatched = 0;
    let mut last_due = t0;
    for step in 0..=63u64 {
        for process in queue.pump(t0 + Duration::from_millis(step * 16)) {
            assert!(process.due_at >= last_due);
            last_due = process.due_at;
            dispatched += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Process queue: {} enqueued and pumped in {:?}",
        count, duration
    );

    assert_eq!(dispatched, count);
    assert!(queue.is_empty());
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks a full simulated day of minute boundaries with many subscribers
#[test]
fn benchmark_time_dispatch() {
    struct Counter(Arc<AtomicUsize>);
    impl TimeSubscriber for Counter {
        fn on_minute_changed(&mut self, _: NaiveDateTime, _: &mut TimeContext<'_>) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let mut time = TimeSystem::new(midnight());
    for _ in 0..100 {
        time.subscribe(Box::new(Counter(Arc::clone(&calls))));
    }
    let mut queue = ProcessQueue::new();
    let now = Instant::now();

    let start = Instant::now();
    for minute in 1..=1440 {
        time.update(midnight() + TimeDelta::minutes(minute), &mut queue, now);
    }
    let duration = start.elapsed();
    println!("Time dispatch: one day with 100 subscribers in {:?}", duration);

    assert_eq!(calls.load(Ordering::Relaxed), 1440 * 100);
    // One bucket change every 15 minutes.
    assert_eq!(queue.len(), 96);
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Stress tests registry churn
#[test]
fn stress_test_registry_churn() {
    let registry = SessionRegistry::new(10_000, Duration::from_secs(60));
    let addr = "127.0.0.1:9000".parse().unwrap();

    let start = Instant::now();
    let mut receivers = Vec::with_capacity(10_000);
    for _ in 0..10_000 {
        let id = registry.next_session_id();
        let (session, rx) = Session::new(id, addr, CancellationToken::new());
        registry.register(Arc::new(session)).unwrap();
        receivers.push(rx);
    }
    assert_eq!(registry.len(), 10_000);
    assert_eq!(registry.disconnect_all(), 10_000);

    let duration = start.elapsed();
    println!("Registry churn: 10000 sessions in {:?}", duration);

    assert!(registry.is_empty());
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks entity updates for a crowded world
#[test]
fn benchmark_world_update() {
    let registry = Arc::new(SessionRegistry::new(1, Duration::from_secs(60)));
    let mut world = World::initialize(
        &ServerConfig::default(),
        registry,
        CancellationToken::new(),
        midnight(),
    )
    .unwrap();

    for i in 0..5000 {
        let id = world.spawn(
            EntityKind::Monster,
            "Slime",
            Vector2::new((i % 100) as f32 * 10.0, (i / 100) as f32 * 10.0),
        );
        world.entity_mut(id).unwrap().velocity = Vector2::new(5.0, -3.0);
    }

    let ticks = 100;
    let start = Instant::now();
    let now = Instant::now();
    for _ in 0..ticks {
        world.update_entities(0.016, now);
    }
    let duration = start.elapsed();
    println!(
        "World update: {} ticks of 5000 entities in {:?} ({:.2} ms/tick)",
        ticks,
        duration,
        duration.as_secs_f64() * 1000.0 / ticks as f64
    );

    assert_eq!(world.entity_count(), 5000);
    // Should complete in under 3 seconds
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks frame encoding and decoding
#[test]
fn benchmark_frame_codec() {
    let packet = Packet::EntityState {
        entity_id: 123_456,
        x: 1024.5,
        y: 2048.25,
    };

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let frame = encode_frame(&packet).unwrap();
        let decoded: Packet = bincode::deserialize(&frame[FRAME_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, packet);
    }

    let duration = start.elapsed();
    println!(
        "Frame codec: {} round trips in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}
