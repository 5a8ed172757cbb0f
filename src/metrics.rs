use prometheus::{Encoder, IntCounter, IntCounterVec, TextEncoder};
use std::sync::Once;

lazy_static::lazy_static! {
    static ref TILES_IDENTIFIED: IntCounterVec = IntCounterVec::new(
        prometheus::opts!("tiles_identified_total", "Tiles resolved to a card, by cascade stage"),
        &["stage"]
    ).unwrap();

    static ref TILES_UNIDENTIFIED: IntCounter = IntCounter::new(
        "tiles_unidentified_total",
        "Tiles no cascade stage could resolve"
    ).unwrap();

    static ref LOOKUP_REQUESTS: IntCounterVec = IntCounterVec::new(
        prometheus::opts!("card_lookup_requests_total", "Fuzzy name lookups against the card service"),
        &["status"]
    ).unwrap();

    static ref PAGES_SCANNED: IntCounter = IntCounter::new(
        "pages_scanned_total",
        "Collection pages fully processed"
    ).unwrap();

    static ref LAYOUT_OBSTRUCTIONS: IntCounter = IntCounter::new(
        "layout_obstructions_total",
        "Frames where the calibrated grid was not visible"
    ).unwrap();
}

static INIT: Once = Once::new();

pub fn init_metrics() {
    INIT.call_once(|| {
        prometheus::register(Box::new(TILES_IDENTIFIED.clone())).unwrap();
        prometheus::register(Box::new(TILES_UNIDENTIFIED.clone())).unwrap();
        prometheus::register(Box::new(LOOKUP_REQUESTS.clone())).unwrap();
        prometheus::register(Box::new(PAGES_SCANNED.clone())).unwrap();
        prometheus::register(Box::new(LAYOUT_OBSTRUCTIONS.clone())).unwrap();
    });
}

/// Text exposition of every registered metric.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_identified(stage: &str) {
    TILES_IDENTIFIED.with_label_values(&[stage]).inc();
}

pub fn record_unidentified() {
    TILES_UNIDENTIFIED.inc();
}

pub fn record_lookup(found: bool) {
    let status = if found { "found" } else { "not_found" };
    LOOKUP_REQUESTS.with_label_values(&[status]).inc();
}

pub fn record_page_scanned() {
    PAGES_SCANNED.inc();
}

pub fn record_obstruction() {
    LAYOUT_OBSTRUCTIONS.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_counters_show_up_in_exposition() {
        init_metrics();
        init_metrics();
        record_page_scanned();
        record_identified("art_match");
        let text = render();
        assert!(text.contains("pages_scanned_total"));
        assert!(text.contains("tiles_identified_total{stage=\"art_match\"}"));
    }
}
