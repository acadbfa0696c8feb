use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::tempdir;

use sortie::coordinator::QueueReceipt;
use sortie::ingest::EventSink;
use sortie::transport::deliver;
use sortie::{
    Counters, DetectionEvent, EnqueueError, IngestError, IngestOutcome, Ingestor, Site,
    SiteRegistry, SqliteCooldownStore,
};

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<DetectionEvent>>,
}

impl EventSink for RecordingSink {
    fn enqueue(&self, event: DetectionEvent) -> Result<QueueReceipt, EnqueueError> {
        let mut events = self.events.lock().unwrap();
        events.push(event);
        Ok(QueueReceipt {
            position: events.len(),
            depth: events.len(),
        })
    }
}

const CHANNEL: &str = "cameratrap/pi-001";

fn registry() -> Arc<SiteRegistry> {
    Arc::new(
        SiteRegistry::from_sites([Site {
            site_id: "pi-001".to_string(),
            latitude: 40.0083,
            longitude: -83.0175,
            channel_key: CHANNEL.to_string(),
        }])
        .unwrap(),
    )
}

fn payload(confidence: f64) -> Vec<u8> {
    format!(
        r#"{{"channel_key":"{}","species":"red fox","confidence":{},"lat":40.0083,"lon":-83.0175,"timestamp":"2025-06-01T04:30:00Z"}}"#,
        CHANNEL, confidence
    )
    .into_bytes()
}

#[test]
fn cooldown_window_survives_restart() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("cooldown.db");
    let first_seen = Utc.with_ymd_and_hms(2025, 6, 1, 4, 30, 0).unwrap();
    let sink = Arc::new(RecordingSink::default());

    {
        let ingestor = Ingestor::new(
            registry(),
            Duration::from_secs(600),
            Box::new(SqliteCooldownStore::open(&db).unwrap()),
            sink.clone(),
            Arc::new(Counters::default()),
        );
        let outcome = ingestor.ingest(CHANNEL, &payload(0.9), first_seen).unwrap();
        assert!(matches!(outcome, IngestOutcome::Queued { .. }));
    }

    let counters = Arc::new(Counters::default());
    let ingestor = Ingestor::new(
        registry(),
        Duration::from_secs(600),
        Box::new(SqliteCooldownStore::open(&db).unwrap()),
        sink.clone(),
        counters.clone(),
    );
    let outcome = ingestor
        .ingest(CHANNEL, &payload(0.9), first_seen + ChronoDuration::seconds(60))
        .unwrap();
    assert_eq!(
        outcome,
        IngestOutcome::Suppressed {
            site_id: "pi-001".to_string(),
            retry_after_secs: 540,
        }
    );
    assert_eq!(counters.snapshot().events_suppressed, 1);

    let outcome = ingestor
        .ingest(CHANNEL, &payload(0.9), first_seen + ChronoDuration::seconds(600))
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Queued { .. }));
    assert_eq!(sink.events.lock().unwrap().len(), 2);
}

#[test]
fn broker_delivery_feeds_the_ingestor() {
    let sink = Arc::new(RecordingSink::default());
    let counters = Arc::new(Counters::default());
    let ingestor = Ingestor::new(
        registry(),
        Duration::from_secs(600),
        Box::new(sortie::InMemoryCooldownStore::new()),
        sink.clone(),
        counters.clone(),
    );

    let outcome = deliver(&ingestor, CHANNEL.as_bytes(), &payload(0.95));
    assert!(matches!(outcome, Some(IngestOutcome::Queued { .. })));

    assert!(deliver(&ingestor, b"cameratrap/unknown", &payload(0.95)).is_none());
    assert!(deliver(&ingestor, CHANNEL.as_bytes(), b"not json").is_none());
    assert!(deliver(&ingestor, &[0xff, 0xfe], &payload(0.95)).is_none());

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.events_unknown_source, 1);
    assert_eq!(snapshot.events_malformed, 1);

    let events = sink.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].site_id, "pi-001");
    assert_eq!(events[0].species_label.as_deref(), Some("red fox"));
}

#[test]
fn payload_from_wrong_position_is_malformed() {
    let ingestor = Ingestor::new(
        registry(),
        Duration::ZERO,
        Box::new(sortie::InMemoryCooldownStore::new()),
        Arc::new(RecordingSink::default()),
        Arc::new(Counters::default()),
    );
    let raw = format!(
        r#"{{"channel_key":"{}","confidence":0.9,"lat":41.5,"lon":-83.0175,"timestamp":"2025-06-01T04:30:00Z"}}"#,
        CHANNEL
    );
    let err = ingestor
        .ingest(CHANNEL, raw.as_bytes(), Utc::now())
        .unwrap_err();
    assert!(matches!(err, IngestError::MalformedEvent(_)));
    assert_eq!(err.kind(), "malformed_event");
}
