use std::collections::HashMap;

use crate::error::IngestError;
use crate::Site;

/// Registry of ground sites keyed by channel.
///
/// Built once at configuration load and then shared read-only; there is no
/// global topic map.
#[derive(Debug, Default)]
pub struct SiteRegistry {
    by_channel: HashMap<String, Site>,
    channel_by_id: HashMap<String, String>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured sites, failing on the first duplicate.
    pub fn from_sites(sites: impl IntoIterator<Item = Site>) -> Result<Self, IngestError> {
        let mut registry = Self::new();
        for site in sites {
            registry.register_site(site)?;
        }
        Ok(registry)
    }

    pub fn register_site(&mut self, site: Site) -> Result<(), IngestError> {
        if self.by_channel.contains_key(&site.channel_key) {
            return Err(IngestError::DuplicateSite(site.channel_key));
        }
        if self.channel_by_id.contains_key(&site.site_id) {
            return Err(IngestError::DuplicateSiteId(site.site_id));
        }
        log::debug!(
            "registered site {} on channel {} at ({}, {})",
            site.site_id,
            site.channel_key,
            site.latitude,
            site.longitude
        );
        self.channel_by_id
            .insert(site.site_id.clone(), site.channel_key.clone());
        self.by_channel.insert(site.channel_key.clone(), site);
        Ok(())
    }

    pub fn lookup_channel(&self, channel_key: &str) -> Option<&Site> {
        self.by_channel.get(channel_key)
    }

    pub fn lookup_site(&self, site_id: &str) -> Option<&Site> {
        self.channel_by_id
            .get(site_id)
            .and_then(|channel| self.by_channel.get(channel))
    }

    /// Channels to subscribe to, sorted for stable logging.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.by_channel.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn len(&self) -> usize {
        self.by_channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(id: &str, channel: &str) -> Site {
        Site {
            site_id: id.to_string(),
            latitude: 40.0083,
            longitude: -83.0175,
            channel_key: channel.to_string(),
        }
    }

    #[test]
    fn lookup_by_channel_and_id() {
        let registry = SiteRegistry::from_sites([site("pi-001", "cameratrap/pi-001")]).unwrap();
        assert_eq!(
            registry.lookup_channel("cameratrap/pi-001").unwrap().site_id,
            "pi-001"
        );
        assert_eq!(
            registry.lookup_site("pi-001").unwrap().channel_key,
            "cameratrap/pi-001"
        );
        assert!(registry.lookup_channel("cameratrap/pi-999").is_none());
    }

    #[test]
    fn duplicate_channel_is_rejected() {
        let mut registry = SiteRegistry::new();
        registry.register_site(site("pi-001", "ct/a")).unwrap();
        let err = registry.register_site(site("pi-002", "ct/a")).unwrap_err();
        assert!(matches!(err, IngestError::DuplicateSite(ref key) if key == "ct/a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_site_id_is_rejected() {
        let mut registry = SiteRegistry::new();
        registry.register_site(site("pi-001", "ct/a")).unwrap();
        let err = registry.register_site(site("pi-001", "ct/b")).unwrap_err();
        assert!(matches!(err, IngestError::DuplicateSiteId(_)));
    }
}
