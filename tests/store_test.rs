//! Integration tests for the buffer stores.

use daq_buffer::data::{
    build_store, wait_for_counts, BufferCounts, ByteOrder, DataStore, DataType, Event, Header,
    MemoryStore, SampleBlock, SavingStore, StoreGuard, StoreKind, WaitThreshold,
};
use daq_buffer::BufferError;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn float_header(nchans: u32) -> Header {
    Header::new(nchans, 256.0, DataType::Float32, ByteOrder::native())
}

#[test]
fn test_concurrent_appends_get_contiguous_indices() {
    let store = Arc::new(MemoryStore::unbounded());
    store.put_header(float_header(1)).expect("header");

    let writers: Vec<_> = (0..2)
        .map(|writer| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..1000 {
                    let value = (writer * 1000 + i) as f32;
                    store
                        .put_data(SampleBlock::from_f32(1, &[value]))
                        .expect("put_data");
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer thread panicked");
    }

    assert_eq!(store.counts().samples, 2000);
    let mut values = store
        .get_data(Some(0..2000))
        .expect("full read")
        .to_f32()
        .expect("float samples");
    values.sort_by(|a, b| a.partial_cmp(b).expect("no NaN"));
    let expected: Vec<f32> = (0..2000).map(|v| v as f32).collect();
    assert_eq!(values, expected, "every append stored exactly once");
}

#[test]
fn test_concurrent_event_appends() {
    let store = Arc::new(MemoryStore::ring(100, 5000).expect("ring"));
    store.put_header(float_header(1)).expect("header");

    let writers: Vec<_> = (0..4)
        .map(|writer| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..250 {
                    store
                        .put_event(Event::new("trigger", &format!("{writer}-{i}"), i))
                        .expect("put_event");
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer thread panicked");
    }

    let events = store.get_events(None).expect("events");
    assert_eq!(events.len(), 1000);
    assert_eq!(store.counts(), BufferCounts::new(0, 1000));
}

#[test]
fn test_wait_unblocks_when_samples_arrive() {
    let store = Arc::new(MemoryStore::unbounded());
    store.put_header(float_header(2)).expect("header");
    let counts = store.subscribe();

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            store
                .put_data(SampleBlock::from_f32(2, &[0.0; 20]))
                .expect("put_data");
        })
    };

    let started = Instant::now();
    let seen = tokio_test::block_on(wait_for_counts(
        counts,
        WaitThreshold {
            samples: 10,
            events: u64::MAX,
            timeout: Duration::from_secs(5),
        },
    ));
    writer.join().expect("writer thread panicked");

    assert_eq!(seen.samples, 10);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_wait_times_out_with_current_counts() {
    let store = MemoryStore::unbounded();
    store.put_header(float_header(1)).expect("header");
    store
        .put_data(SampleBlock::from_f32(1, &[1.0, 2.0]))
        .expect("put_data");

    let started = Instant::now();
    let seen = wait_for_counts(
        store.subscribe(),
        WaitThreshold {
            samples: 100,
            events: 100,
            timeout: Duration::from_millis(100),
        },
    )
    .await;

    assert_eq!(seen, BufferCounts::new(2, 0));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_ring_reads_outside_window_fail() {
    let store = build_store(&StoreKind::Ring {
        samples: 5,
        events: 2,
    })
    .expect("ring store");
    store.put_header(float_header(1)).expect("header");
    store
        .put_data(SampleBlock::from_f32(1, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]))
        .expect("put_data");

    match store.get_data(Some(1..3)) {
        Err(BufferError::Range { begin, end, .. }) => assert_eq!((begin, end), (1, 3)),
        other => panic!("expected range error, got {other:?}"),
    }
    let tail = store.get_data(Some(5..7)).expect("resident range");
    assert_eq!(tail.to_f32().expect("floats"), vec![5.0, 6.0]);
}

#[test]
fn test_saving_store_serves_evicted_range_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SavingStore::create(dir.path(), 4, 2).expect("saving store");
    store.put_header(float_header(2)).expect("header");

    let samples: Vec<f32> = (0..20).map(|v| v as f32).collect();
    store
        .put_data(SampleBlock::from_f32(2, &samples))
        .expect("put_data");
    for i in 0..5 {
        store
            .put_event(Event::new("marker", &i.to_string(), i))
            .expect("put_event");
    }

    let early = store.get_data(Some(0..3)).expect("disk read");
    assert_eq!(early.to_f32().expect("floats"), samples[..6].to_vec());

    let events = store.get_events(Some(0..2)).expect("disk events");
    assert_eq!(events[1].value.as_text().as_deref(), Some("1"));
}

#[test]
fn test_saving_store_rejects_reads_before_flush_generation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SavingStore::create(dir.path(), 2, 2).expect("saving store");
    store.put_header(float_header(1)).expect("header");
    store
        .put_data(SampleBlock::from_f32(1, &[1.0, 2.0, 3.0]))
        .expect("put_data");
    store.flush_data().expect("flush");

    assert_eq!(store.counts().samples, 0);
    assert!(store.get_data(Some(0..1)).is_err());
}

#[test]
fn test_big_endian_header_round_trips_through_store() {
    let store = MemoryStore::unbounded();
    store
        .put_header(Header::new(1, 100.0, DataType::Int32, ByteOrder::Big))
        .expect("header");
    let little = SampleBlock::new(1, 1, DataType::Int32, ByteOrder::Little, vec![1, 0, 0, 0]);
    store.put_data(little).expect("put_data");

    let stored = store.get_data(None).expect("read");
    assert_eq!(stored.byte_order, ByteOrder::Big);
    assert_eq!(stored.data, vec![0, 0, 0, 1]);
}

#[test]
fn test_store_guard_cleans_up_on_drop() {
    let store = build_store(&StoreKind::Simple).expect("store");
    {
        let guard = StoreGuard::new(Arc::clone(&store));
        guard.store().put_header(float_header(1)).expect("header");
    }
    assert!(matches!(
        store.put_data(SampleBlock::from_f32(1, &[1.0])),
        Err(BufferError::Persistence(_))
    ));
}
