//! Pinning semantics and conservative root regions.

use reclaim_gc::{CollectMode, Collector, CollectorConfig, CollectorError, ObjectAttributes};

fn collector() -> Collector {
    let config = CollectorConfig {
        background: false,
        auto_collect_bytes: 0,
        ..CollectorConfig::default()
    };
    Collector::with_config(config).expect("collector")
}

#[test]
fn test_pin_is_reference_counted() {
    let gc = collector();
    let p = gc.alloc(64, ObjectAttributes::NONE).unwrap();

    gc.pin_root(p).unwrap();
    gc.pin_root(p).unwrap();

    gc.unpin_root(p).unwrap();
    gc.collect_now(CollectMode::Exhaustive).unwrap();
    assert!(gc.is_live_object(p), "one pin still outstanding");

    gc.unpin_root(p).unwrap();
    gc.collect_now(CollectMode::Exhaustive).unwrap();
    assert!(!gc.is_live_object(p));
}

#[test]
fn test_unpin_without_pin() {
    let gc = collector();
    let p = gc.alloc(64, ObjectAttributes::NONE).unwrap();
    assert!(matches!(
        gc.unpin_root(p),
        Err(CollectorError::NotPinned { .. })
    ));
}

#[test]
fn test_pin_requires_live_object_start() {
    let gc = collector();
    let p = gc.alloc(64, ObjectAttributes::NONE).unwrap();

    // Interior addresses are not pinnable.
    let interior = std::ptr::NonNull::new(unsafe { p.as_ptr().add(8) }).unwrap();
    assert!(matches!(
        gc.pin_root(interior),
        Err(CollectorError::UnknownObject { .. })
    ));

    let bogus = std::ptr::NonNull::new(0x4000usize as *mut u8).unwrap();
    assert!(matches!(
        gc.pin_root(bogus),
        Err(CollectorError::UnknownObject { .. })
    ));
}

#[test]
fn test_root_region_is_scanned_conservatively() {
    let gc = collector();
    let a = gc.alloc(64, ObjectAttributes::NONE).unwrap();
    let b = gc.alloc(64, ObjectAttributes::NONE).unwrap();

    // A host-owned buffer holding one real pointer and assorted noise.
    let mut frame = [0usize; 8];
    frame[3] = a.as_ptr() as usize;
    frame[5] = 0xDEAD_BEEF;
    gc.register_root_region(frame.as_ptr().cast(), std::mem::size_of_val(&frame))
        .unwrap();

    gc.collect_now(CollectMode::Exhaustive).unwrap();
    assert!(gc.is_live_object(a), "region-held pointer is a root");
    assert!(!gc.is_live_object(b));

    gc.unregister_root_region(frame.as_ptr().cast(), std::mem::size_of_val(&frame))
        .unwrap();
    gc.collect_now(CollectMode::Exhaustive).unwrap();
    assert!(!gc.is_live_object(a));
}

#[test]
fn test_skip_root_regions_debug_collect() {
    let gc = collector();
    let a = gc.alloc(64, ObjectAttributes::NONE).unwrap();

    let frame = [a.as_ptr() as usize];
    gc.register_root_region(frame.as_ptr().cast(), std::mem::size_of_val(&frame))
        .unwrap();

    // The debug variant ignores registered regions, making reclamation
    // deterministic regardless of host frames.
    gc.collect_skip_root_regions(CollectMode::Exhaustive).unwrap();
    assert!(!gc.is_live_object(a));

    gc.unregister_root_region(frame.as_ptr().cast(), std::mem::size_of_val(&frame))
        .unwrap();
}

#[test]
fn test_unregister_unknown_region() {
    let gc = collector();
    assert!(matches!(
        gc.unregister_root_region(0x1000 as *const u8, 64),
        Err(CollectorError::UnknownObject { .. })
    ));
}

#[test]
fn test_pinned_large_object() {
    let gc = collector();
    let p = gc.alloc(40_000, ObjectAttributes::NONE).unwrap();
    gc.pin_root(p).unwrap();
    gc.collect_now(CollectMode::Exhaustive).unwrap();
    assert!(gc.is_live_object(p));
    gc.unpin_root(p).unwrap();
    gc.collect_now(CollectMode::Exhaustive).unwrap();
    assert!(!gc.is_live_object(p));
}
