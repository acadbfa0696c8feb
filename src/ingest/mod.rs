//! Detection ingestion.
//!
//! Every inbound event is mapped to a registered site by its channel,
//! parsed against the site payload schema and passed through the per-site
//! cooldown window before it reaches the coordinator queue. Events inside
//! the window are suppressed and counted; that is not an error.

mod cooldown;
pub mod payload;

pub use cooldown::{CooldownStore, InMemoryCooldownStore, SqliteCooldownStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::coordinator::QueueReceipt;
use crate::counters::Counters;
use crate::error::{EnqueueError, IngestError};
use crate::registry::SiteRegistry;
use crate::{DetectionEvent, Site};

/// Largest accepted difference between reported and registered site
/// coordinates, in degrees (about 110 m).
const COORD_TOLERANCE_DEG: f64 = 1e-3;

/// Destination of normalized events; implemented by the coordinator.
pub trait EventSink: Send + Sync {
    fn enqueue(&self, event: DetectionEvent) -> Result<QueueReceipt, EnqueueError>;
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Queued {
        site_id: String,
        #[serde(flatten)]
        receipt: QueueReceipt,
    },
    Suppressed {
        site_id: String,
        retry_after_secs: u64,
    },
}

/// Detection submitted through the HTTP API rather than a site channel.
#[derive(Clone, Debug, Deserialize)]
pub struct DetectionReport {
    pub site_id: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    pub confidence: f64,
    #[serde(default)]
    pub species: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

pub struct Ingestor {
    registry: Arc<SiteRegistry>,
    cooldown: Duration,
    store: Mutex<Box<dyn CooldownStore>>,
    sink: Arc<dyn EventSink>,
    counters: Arc<Counters>,
}

impl Ingestor {
    pub fn new(
        registry: Arc<SiteRegistry>,
        cooldown: Duration,
        store: Box<dyn CooldownStore>,
        sink: Arc<dyn EventSink>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            registry,
            cooldown,
            store: Mutex::new(store),
            sink,
            counters,
        }
    }

    pub fn registry(&self) -> &SiteRegistry {
        &self.registry
    }

    /// Ingest a raw payload received on `channel_key`.
    pub fn ingest(
        &self,
        channel_key: &str,
        raw_payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        self.counters.events_received();
        let site = self.site_for_channel(channel_key)?;
        let payload = payload::parse(raw_payload).map_err(|err| self.malformed(&site.site_id, err))?;
        if payload.channel_key != channel_key {
            return Err(self.malformed(
                &site.site_id,
                IngestError::MalformedEvent(format!(
                    "payload channel '{}' does not match '{}'",
                    payload.channel_key, channel_key
                )),
            ));
        }
        self.check_position(site, Some(payload.lat), Some(payload.lon))?;

        let event = DetectionEvent {
            site_id: site.site_id.clone(),
            observed_at: payload.observed_at,
            received_at,
            confidence: payload.confidence,
            species_label: payload.species,
            raw_payload: String::from_utf8_lossy(raw_payload).into_owned(),
        };
        self.admit(event)
    }

    /// Ingest a detection reported through the API. Goes through the same
    /// validation and cooldown path as channel events.
    pub fn ingest_report(
        &self,
        report: &DetectionReport,
        received_at: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        self.counters.events_received();
        let site = match self.registry.lookup_site(&report.site_id) {
            Some(site) => site,
            None => {
                self.counters.events_unknown_source();
                log::warn!("report dropped: unknown site '{}'", report.site_id);
                return Err(IngestError::UnknownSource(report.site_id.clone()));
            }
        };
        payload::check_confidence(report.confidence).map_err(|err| self.malformed(&site.site_id, err))?;
        self.check_position(site, report.lat, report.lon)?;
        let observed_at = match report.timestamp.as_deref() {
            Some(ts) => payload::parse_timestamp(ts).map_err(|err| self.malformed(&site.site_id, err))?,
            None => received_at,
        };

        let event = DetectionEvent {
            site_id: site.site_id.clone(),
            observed_at,
            received_at,
            confidence: report.confidence,
            species_label: report
                .species
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            raw_payload: format!(
                "site_id={} confidence={} lat={:?} lon={:?}",
                report.site_id, report.confidence, report.lat, report.lon
            ),
        };
        self.admit(event)
    }

    /// Apply the cooldown window and forward to the sink.
    ///
    /// The store lock is held across the enqueue so two events from one
    /// site cannot both pass the window check.
    fn admit(&self, event: DetectionEvent) -> Result<IngestOutcome, IngestError> {
        let mut store = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !self.cooldown.is_zero() {
            let last = store
                .last_accepted(&event.site_id)
                .map_err(IngestError::Storage)?;
            if let Some(last) = last {
                if let Some(remaining) = self.remaining_window(last, event.received_at) {
                    self.counters.events_suppressed();
                    log::info!(
                        "detection from {} suppressed: inside cooldown ({}s left)",
                        event.site_id,
                        remaining.as_secs()
                    );
                    return Ok(IngestOutcome::Suppressed {
                        site_id: event.site_id,
                        retry_after_secs: remaining.as_secs().max(1),
                    });
                }
            }
        }

        let site_id = event.site_id.clone();
        let received_at = event.received_at;
        let receipt = self.sink.enqueue(event)?;
        if let Err(err) = store.record_accepted(&site_id, received_at) {
            log::error!("cooldown for {} not recorded: {:#}", site_id, err);
        }
        Ok(IngestOutcome::Queued { site_id, receipt })
    }

    /// Time left in the window, or `None` once it has elapsed. A `last`
    /// in the future counts as inside the window.
    fn remaining_window(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
        match now.signed_duration_since(last).to_std() {
            Ok(elapsed) if elapsed >= self.cooldown => None,
            Ok(elapsed) => Some(self.cooldown - elapsed),
            Err(_) => Some(self.cooldown),
        }
    }

    fn site_for_channel(&self, channel_key: &str) -> Result<&Site, IngestError> {
        match self.registry.lookup_channel(channel_key) {
            Some(site) => Ok(site),
            None => {
                self.counters.events_unknown_source();
                log::warn!("event dropped: no site registered for '{}'", channel_key);
                Err(IngestError::UnknownSource(channel_key.to_string()))
            }
        }
    }

    fn check_position(&self, site: &Site, lat: Option<f64>, lon: Option<f64>) -> Result<(), IngestError> {
        let off = |reported: Option<f64>, registered: f64| {
            reported.map_or(false, |v| !((v - registered).abs() <= COORD_TOLERANCE_DEG))
        };
        if off(lat, site.latitude) || off(lon, site.longitude) {
            return Err(self.malformed(
                &site.site_id,
                IngestError::MalformedEvent(format!(
                    "reported position ({:?}, {:?}) does not match site {} at ({}, {})",
                    lat, lon, site.site_id, site.latitude, site.longitude
                )),
            ));
        }
        Ok(())
    }

    fn malformed(&self, site_id: &str, err: IngestError) -> IngestError {
        self.counters.events_malformed();
        log::warn!("event from {} dropped: {}", site_id, err);
        err
    }
}
