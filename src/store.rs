use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};

use crate::{
    error::{Error, Result},
    key::Key,
    MAX_RECORD_SIZE,
};

/// A stored value together with its expiry and replication bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub value: Vec<u8>,
    pub expires: SystemTime,
    pub last_replicated: SystemTime,
    pub replication_interval: Duration,
}

impl Record {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires
    }

    pub fn is_due_for_replication(&self, now: SystemTime) -> bool {
        self.last_replicated
            .checked_add(self.replication_interval)
            .map_or(false, |deadline| now >= deadline)
    }
}

/// In-memory key/value cache. Expired entries are never handed out and are
/// dropped by [`RecordStore::remove_expired`].
#[derive(Debug, Default)]
pub struct RecordStore {
    records: HashMap<Key, Record>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live record for `key`.
    pub fn get(&self, key: &Key) -> Result<&Record> {
        let now = SystemTime::now();

        self.records
            .get(key)
            .filter(|record| !record.is_expired(now))
            .ok_or(Error::NotFound)
    }

    /// Inserts or overwrites the entry for `key`, marking it as replicated now.
    pub fn put(
        &mut self,
        key: Key,
        value: Vec<u8>,
        expires: SystemTime,
        replication_interval: Duration,
    ) -> Result<()> {
        if value.len() > MAX_RECORD_SIZE {
            return Err(Error::ValueTooLarge(value.len()));
        }

        let record = Record {
            value,
            expires,
            last_replicated: SystemTime::now(),
            replication_interval,
        };

        self.records.insert(key, record);
        Ok(())
    }

    pub fn remove(&mut self, key: &Key) -> Result<Record> {
        self.records.remove(key).ok_or(Error::NotFound)
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn remove_expired(&mut self) -> usize {
        let now = SystemTime::now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        before - self.records.len()
    }

    /// Live keys whose replication interval has elapsed since they were last replicated.
    pub fn keys_due_for_replication(&self) -> Vec<Key> {
        let now = SystemTime::now();

        self.records
            .iter()
            .filter(|(_, record)| {
                !record.is_expired(now) && record.is_due_for_replication(now)
            })
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn mark_replicated(&mut self, key: &Key) -> bool {
        match self.records.get_mut(key) {
            Some(record) => {
                record.last_replicated = SystemTime::now();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn in_a_minute() -> SystemTime {
        SystemTime::now() + Duration::from_secs(60)
    }

    fn a_minute_ago() -> SystemTime {
        SystemTime::now() - Duration::from_secs(60)
    }

    #[test]
    fn set_and_get() {
        let mut store = RecordStore::new();
        let data = b"some opaque payload".to_vec();
        let key = Key::from_content(data.as_slice());

        store.put(key, data.clone(), in_a_minute(), HOUR).unwrap();

        assert_eq!(store.get(&key).map(|r| r.value.clone()).unwrap(), data);
    }

    #[test]
    fn overwrite_replaces_value() {
        let mut store = RecordStore::new();
        let key = Key::random();

        store.put(key, b"one".to_vec(), in_a_minute(), HOUR).unwrap();
        store.put(key, b"two".to_vec(), in_a_minute(), HOUR).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key).unwrap().value, b"two".to_vec());
    }

    #[test]
    fn missing_key_is_not_found() {
        let store = RecordStore::new();
        assert!(store.get(&Key::random()).unwrap_err().is_not_found());
    }

    #[test]
    fn expired_entry_is_hidden_then_swept() {
        let mut store = RecordStore::new();
        let expired = Key::random();
        let live = Key::random();

        store.put(expired, b"old".to_vec(), a_minute_ago(), HOUR).unwrap();
        store.put(live, b"new".to_vec(), in_a_minute(), HOUR).unwrap();

        assert!(store.get(&expired).unwrap_err().is_not_found());
        assert_eq!(store.len(), 2);

        assert_eq!(store.remove_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(&live).is_ok());
    }

    #[test]
    fn delete() {
        let mut store = RecordStore::new();
        let key = Key::random();

        store.put(key, b"value".to_vec(), in_a_minute(), HOUR).unwrap();
        assert!(store.remove(&key).is_ok());
        assert!(store.remove(&key).unwrap_err().is_not_found());
        assert!(store.is_empty());
    }

    #[test]
    fn replication_bookkeeping() {
        let mut store = RecordStore::new();
        let due = Key::random();
        let fresh = Key::random();

        store.put(due, b"a".to_vec(), in_a_minute(), Duration::ZERO).unwrap();
        store.put(fresh, b"b".to_vec(), in_a_minute(), HOUR).unwrap();

        assert_eq!(store.keys_due_for_replication(), vec![due]);

        // A zero interval stays due, a long one becomes due only after it elapses.
        assert!(store.mark_replicated(&due));
        assert_eq!(store.keys_due_for_replication(), vec![due]);
        assert!(!store.mark_replicated(&Key::random()));
    }

    #[test]
    fn oversized_value_is_rejected() {
        let mut store = RecordStore::new();
        let value = vec![0u8; MAX_RECORD_SIZE + 1];

        let err = store.put(Key::random(), value, in_a_minute(), HOUR).unwrap_err();
        assert!(matches!(err, Error::ValueTooLarge(_)));
    }
}
