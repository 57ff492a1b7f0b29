//! End-to-end test through `#[global_allocator]`.
//!
//! Kept in its own test binary: the process-wide tracker can only be
//! installed once.

use tagtrack::{default_tags, install_global, TrackerBuilder, TrackerConfig, TrackingAllocator};

#[global_allocator]
static ALLOCATOR: TrackingAllocator = TrackingAllocator::system();

#[test]
fn test_heap_allocations_are_charged_to_scopes() {
    let tracker = TrackerBuilder::new(TrackerConfig::default())
        .with_default_tags()
        .build()
        .unwrap();
    let tracker = install_global(tracker).unwrap();
    let audio = tracker.find_enum_tag(default_tags::AUDIO).unwrap();

    let buffer = {
        let _scope = tracker.scope(audio);
        vec![0u8; 10_000]
    };
    assert_eq!(tracker.thread_tag_size(audio), 10_000);

    // Freed outside the scope, still charged back to the allocating tag.
    drop(buffer);
    assert_eq!(tracker.thread_tag_size(audio), 0);

    let mut samples: Vec<u64> = {
        let _scope = tracker.scope(audio);
        Vec::with_capacity(16)
    };
    for i in 0..100 {
        samples.push(i);
    }
    assert_eq!(tracker.thread_tag_size(audio), (samples.capacity() * 8) as i64);
    drop(samples);
    assert_eq!(tracker.thread_tag_size(audio), 0);

    tracker.update();
    let report = tracker.report().unwrap();
    assert_eq!(report.tag("Audio").unwrap().own_size(), 0);
    assert!(report.tag("Tracker").unwrap().own_size() > 0);
    assert!(report.live_allocations.is_some());

    // A second install hands the tracker back.
    let other = TrackerBuilder::new(TrackerConfig::default()).build().unwrap();
    assert!(install_global(other).is_err());
}
