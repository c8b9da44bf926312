use tempfile::tempdir;
use vanilla_chronicle::segment::{Segment, SegmentGeometry};
use vanilla_chronicle::{GlobalIndex, Store, StoreConfig};

fn config() -> StoreConfig {
    StoreConfig {
        segment_size_bytes: 128 * 1024,
        entries_per_segment: 256,
        ..StoreConfig::default()
    }
}

fn payloads(store: &Store) -> Vec<(GlobalIndex, Vec<u8>)> {
    let mut tailer = store.create_tailer();
    let mut out = Vec::new();
    while tailer.advance().expect("advance") {
        out.push((
            tailer.index().expect("index"),
            tailer.payload().expect("payload").to_vec(),
        ));
    }
    out
}

#[test]
fn abandoned_reservation_is_never_delivered() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("queue");

    let abandoned;
    let after;
    {
        let store = Store::open(&path, config()).expect("open");
        let mut appender = store.create_appender().expect("appender");
        for i in 0..5u8 {
            appender.append(&[i; 3]).expect("append");
        }
        assert_eq!(store.last_index().expect("last"), Some(GlobalIndex::new(0, 4)));

        // A producer that claims an index and dies before committing.
        let crashed = Segment::open(&path, 0).expect("segment");
        abandoned = crashed.reserve(32).expect("reserve").index;
        drop(crashed);

        after = appender.append(b"after").expect("append after");
        assert!(after > abandoned);
        assert_eq!(
            store.last_index().expect("last"),
            Some(GlobalIndex::new(0, 4)),
            "records behind an open reservation stay hidden"
        );
    }

    let store = Store::open(&path, config()).expect("reopen");
    assert_eq!(store.last_index().expect("last"), Some(after));

    let seen = payloads(&store);
    assert_eq!(seen.len(), 6);
    assert!(seen.iter().all(|(index, _)| *index != abandoned));
    for (i, (_, payload)) in seen.iter().take(5).enumerate() {
        assert_eq!(payload, &vec![i as u8; 3]);
    }
    assert_eq!(seen[5], (after, b"after".to_vec()));

    let mut tailer = store.create_tailer();
    assert!(!tailer.seek(abandoned).expect("seek"));

    let mut appender = store.create_appender().expect("appender");
    let next = appender.append(b"resumed").expect("append");
    assert!(next > after);
    assert_eq!(payloads(&store).len(), 7);
}

#[test]
fn unsealed_older_segments_are_sealed_on_open() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("queue");
    {
        let store = Store::open(&path, config()).expect("open");
        let mut appender = store.create_appender().expect("appender");
        appender.append(b"zero").expect("append");
        let crashed = Segment::open(&path, 0).expect("segment");
        crashed.reserve(16).expect("reserve");
    }
    // A successor exists although segment 0 was never sealed.
    let geometry = SegmentGeometry::new(128 * 1024, 256).expect("geometry");
    Segment::create(&path, 1, 0, geometry, 0).expect("segment 1");

    let store = Store::open(&path, config()).expect("reopen");
    assert!(Segment::open(&path, 0).expect("segment").is_sealed());
    let mut appender = store.create_appender().expect("appender");
    assert_eq!(
        appender.append(b"one").expect("append"),
        GlobalIndex::new(1, 0)
    );

    let seen = payloads(&store);
    assert_eq!(
        seen.iter().map(|(_, p)| p.as_slice()).collect::<Vec<_>>(),
        vec![&b"zero"[..], &b"one"[..]]
    );
    assert_eq!(seen[0].0, GlobalIndex::new(0, 0));
}
