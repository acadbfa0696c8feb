//! Detection payload schema published by ground sites.
//!
//! `{channel_key, species?, confidence, lat, lon, timestamp}` where
//! `confidence` is in `[0, 1]` and `timestamp` is ISO 8601. A timestamp
//! without an offset is taken as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::error::IngestError;
use crate::planner::valid_coordinate;

#[derive(Debug, Deserialize)]
struct WirePayload {
    channel_key: String,
    #[serde(default)]
    species: Option<String>,
    confidence: f64,
    lat: f64,
    lon: f64,
    timestamp: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SitePayload {
    pub channel_key: String,
    pub species: Option<String>,
    pub confidence: f64,
    pub lat: f64,
    pub lon: f64,
    pub observed_at: DateTime<Utc>,
}

pub fn parse(raw: &[u8]) -> Result<SitePayload, IngestError> {
    let wire: WirePayload = serde_json::from_slice(raw)
        .map_err(|err| IngestError::MalformedEvent(format!("invalid payload json: {}", err)))?;

    if wire.channel_key.trim().is_empty() {
        return Err(IngestError::MalformedEvent("channel_key is empty".to_string()));
    }
    check_confidence(wire.confidence)?;
    if !valid_coordinate(wire.lat, wire.lon) {
        return Err(IngestError::MalformedEvent(format!(
            "coordinates ({}, {}) out of range",
            wire.lat, wire.lon
        )));
    }
    let observed_at = parse_timestamp(&wire.timestamp)?;
    let species = wire
        .species
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    Ok(SitePayload {
        channel_key: wire.channel_key,
        species,
        confidence: wire.confidence,
        lat: wire.lat,
        lon: wire.lon,
        observed_at,
    })
}

pub(crate) fn check_confidence(confidence: f64) -> Result<(), IngestError> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(IngestError::MalformedEvent(format!(
            "confidence {} outside [0, 1]",
            confidence
        )));
    }
    Ok(())
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, IngestError> {
    let value = value.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(IngestError::MalformedEvent(format!(
        "timestamp '{}' is not ISO 8601",
        value
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_full_payload() {
        let raw = br#"{"channel_key":"cameratrap/pi-001","species":"white-tailed deer",
            "confidence":0.95,"lat":40.0083,"lon":-83.0175,"timestamp":"2025-06-01T12:00:00Z"}"#;
        let payload = parse(raw).unwrap();
        assert_eq!(payload.channel_key, "cameratrap/pi-001");
        assert_eq!(payload.species.as_deref(), Some("white-tailed deer"));
        assert_eq!(
            payload.observed_at,
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn species_is_optional_and_naive_time_is_utc() {
        let raw = br#"{"channel_key":"ct/a","confidence":0.5,"lat":1.0,"lon":2.0,
            "timestamp":"2025-06-01T08:30:15.250"}"#;
        let payload = parse(raw).unwrap();
        assert!(payload.species.is_none());
        assert_eq!(payload.observed_at.timestamp_millis() % 1000, 250);
    }

    #[test]
    fn rejects_schema_violations() {
        let cases: [&[u8]; 5] = [
            b"not json",
            br#"{"channel_key":"ct/a","confidence":0.5,"lat":1.0,"lon":2.0}"#,
            br#"{"channel_key":"ct/a","confidence":1.5,"lat":1.0,"lon":2.0,"timestamp":"2025-06-01T00:00:00Z"}"#,
            br#"{"channel_key":"ct/a","confidence":0.5,"lat":91.0,"lon":2.0,"timestamp":"2025-06-01T00:00:00Z"}"#,
            br#"{"channel_key":"ct/a","confidence":0.5,"lat":1.0,"lon":2.0,"timestamp":"yesterday"}"#,
        ];
        for raw in cases {
            let err = parse(raw).unwrap_err();
            assert!(
                matches!(err, IngestError::MalformedEvent(_)),
                "{:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }
}
