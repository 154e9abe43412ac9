//! Devices seen by previous scans, keyed by `ip:port`.

use super::DeviceRecord;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// How long an offline device is remembered, in seconds
pub const OFFLINE_TTL_SECS: i64 = 5 * 60;

#[derive(Debug, Default)]
pub(crate) struct DeviceCache {
    devices: HashMap<String, DeviceRecord>,
}

impl DeviceCache {
    /// Merge one scan's findings.
    ///
    /// Every known device goes offline first; `found` comes back online with
    /// `last_seen = now`. Devices offline for longer than [`OFFLINE_TTL_SECS`] are dropped.
    pub(crate) fn replace(&mut self, found: &[DeviceRecord], now: DateTime<Utc>) {
        for device in self.devices.values_mut() {
            device.is_online = false;
        }
        self.merge(found, now);

        let ttl = Duration::seconds(OFFLINE_TTL_SECS);
        let before = self.devices.len();
        self.devices
            .retain(|_, d| d.is_online || now - d.last_seen <= ttl);
        let evicted = before - self.devices.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} stale devices from cache", evicted);
        }
    }

    /// Bring `found` online without touching devices a partial scan never reached.
    pub(crate) fn merge(&mut self, found: &[DeviceRecord], now: DateTime<Utc>) {
        for device in found {
            let mut device = device.clone();
            device.is_online = true;
            device.last_seen = now;
            self.devices.insert(device.key(), device);
        }
    }

    /// Update a single entry after a targeted refresh.
    pub(crate) fn upsert(&mut self, device: DeviceRecord) {
        self.devices.insert(device.key(), device);
    }

    /// Mark `key` offline without touching `last_seen`.
    pub(crate) fn mark_offline(&mut self, key: &str) {
        if let Some(device) = self.devices.get_mut(key) {
            device.is_online = false;
        }
    }

    pub(crate) fn all(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| (a.ip_address.as_str(), a.port).cmp(&(b.ip_address.as_str(), b.port)));
        devices
    }

    pub(crate) fn online(&self) -> Vec<DeviceRecord> {
        self.all().into_iter().filter(|d| d.is_online).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.devices.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(ip: &str, port: u16) -> DeviceRecord {
        DeviceRecord::candidate(ip, port, 1.0)
    }

    #[test]
    fn test_replace_marks_missing_offline() {
        let mut cache = DeviceCache::default();
        let t0 = Utc::now();
        cache.replace(&[device("10.0.0.1", 4045), device("10.0.0.2", 4045)], t0);
        assert_eq!(cache.online().len(), 2);

        cache.replace(&[device("10.0.0.2", 4045)], t0 + Duration::seconds(30));
        let all = cache.all();
        assert_eq!(all.len(), 2);
        assert!(!all[0].is_online);
        assert!(all[1].is_online);
        assert_eq!(all[0].last_seen, t0);
        assert_eq!(all[1].last_seen, t0 + Duration::seconds(30));
    }

    #[test]
    fn test_ttl_eviction() {
        let mut cache = DeviceCache::default();
        let t0 = Utc::now();
        cache.replace(&[device("10.0.0.1", 4045)], t0);
        cache.replace(&[device("10.0.0.2", 4045)], t0 + Duration::minutes(1));

        // 10.0.0.1 is four minutes stale: kept
        cache.replace(&[], t0 + Duration::minutes(4));
        assert_eq!(cache.len(), 2);
        assert!(cache.online().is_empty());

        // Now six minutes stale: gone; 10.0.0.2 at five minutes is kept
        cache.replace(&[], t0 + Duration::minutes(6));
        let keys: Vec<String> = cache.all().iter().map(DeviceRecord::key).collect();
        assert_eq!(keys, vec!["10.0.0.2:4045".to_string()]);
    }

    #[test]
    fn test_merge_leaves_unseen_devices_online() {
        let mut cache = DeviceCache::default();
        let t0 = Utc::now();
        cache.replace(&[device("10.0.0.1", 4045)], t0);

        cache.merge(&[device("10.0.0.2", 4045)], t0 + Duration::seconds(10));
        let all = cache.all();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|d| d.is_online));
        assert_eq!(all[0].last_seen, t0);
    }

    #[test]
    fn test_same_ip_different_ports_are_distinct() {
        let mut cache = DeviceCache::default();
        cache.replace(&[device("10.0.0.1", 4045), device("10.0.0.1", 4046)], Utc::now());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_mark_offline_and_clear() {
        let mut cache = DeviceCache::default();
        cache.replace(&[device("10.0.0.1", 4045)], Utc::now());
        cache.mark_offline("10.0.0.1:4045");
        cache.mark_offline("10.0.0.9:4045");
        assert!(cache.online().is_empty());
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
