//! Fuzz target for inbound event decoding and unit normalization.
//!
//! Arbitrary JSON must never panic the decoder, and any event that does
//! decode must normalize to a unit with a stable dedup key.

#![no_main]

use channel_replication::dedup::DedupFilter;
use channel_replication::{InboundEvent, InboundUnit};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(event) = serde_json::from_slice::<InboundEvent>(data) else {
        return;
    };

    let unit = InboundUnit::from_event(&event);
    let again = InboundUnit::from_event(&event);
    assert_eq!(unit.dedup_key(), again.dedup_key());

    let filter = DedupFilter::new();
    assert!(filter.should_process(&unit));
    assert!(!filter.should_process(&again));
});
