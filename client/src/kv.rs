//! Persistent key-value collaborator
//!
//! Values survive deep sleep and power loss. A store that fails is treated
//! as empty: reads return `None` and writes are logged and dropped.

use alloc::string::String;
use core::fmt::Debug;

use log::warn;

/// Every key the client persists
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Key {
    WifiSsid,
    WifiPassword,
    ApiKey,
    FriendlyId,
    RefreshRate,
    InvertDisplay,
    /// Filename of the last image shown
    LastImage,
}

impl Key {
    pub const ALL: [Key; 7] = [
        Key::WifiSsid,
        Key::WifiPassword,
        Key::ApiKey,
        Key::FriendlyId,
        Key::RefreshRate,
        Key::InvertDisplay,
        Key::LastImage,
    ];

    /// Stable name used by stores that key by string
    pub fn name(self) -> &'static str {
        match self {
            Key::WifiSsid => "wifi_ssid",
            Key::WifiPassword => "wifi_password",
            Key::ApiKey => "api_key",
            Key::FriendlyId => "friendly_id",
            Key::RefreshRate => "refresh_rate",
            Key::InvertDisplay => "invert_display",
            Key::LastImage => "last_image",
        }
    }

    /// Compact tag used by binary record formats
    pub fn tag(self) -> u8 {
        self as u8 + 1
    }

    pub fn from_tag(tag: u8) -> Option<Key> {
        Key::ALL.get(tag.checked_sub(1)? as usize).copied()
    }
}

/// Namespaced string/int/bool storage
pub trait KvStore {
    type Error: Debug;

    fn get_str(&mut self, key: Key) -> Result<Option<String>, Self::Error>;
    fn set_str(&mut self, key: Key, value: &str) -> Result<(), Self::Error>;
    fn get_u32(&mut self, key: Key) -> Result<Option<u32>, Self::Error>;
    fn set_u32(&mut self, key: Key, value: u32) -> Result<(), Self::Error>;
    fn get_bool(&mut self, key: Key) -> Result<Option<bool>, Self::Error>;
    fn set_bool(&mut self, key: Key, value: bool) -> Result<(), Self::Error>;
    fn remove(&mut self, key: Key) -> Result<(), Self::Error>;
    /// Remove every key
    fn clear(&mut self) -> Result<(), Self::Error>;
}

/// Error-absorbing view over a [`KvStore`]
pub struct Settings<K: KvStore> {
    store: K,
}

impl<K: KvStore> Settings<K> {
    pub fn new(store: K) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &K {
        &self.store
    }

    /// Non-empty string value
    pub fn string(&mut self, key: Key) -> Option<String> {
        match self.store.get_str(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                warn!("kv: read {} failed: {:?}", key.name(), e);
                None
            }
        }
    }

    pub fn number(&mut self, key: Key) -> Option<u32> {
        self.store.get_u32(key).unwrap_or_else(|e| {
            warn!("kv: read {} failed: {:?}", key.name(), e);
            None
        })
    }

    pub fn flag(&mut self, key: Key) -> Option<bool> {
        self.store.get_bool(key).unwrap_or_else(|e| {
            warn!("kv: read {} failed: {:?}", key.name(), e);
            None
        })
    }

    pub fn put_string(&mut self, key: Key, value: &str) {
        let result = if value.is_empty() {
            self.store.remove(key)
        } else {
            self.store.set_str(key, value)
        };
        if let Err(e) = result {
            warn!("kv: write {} failed: {:?}", key.name(), e);
        }
    }

    pub fn put_number(&mut self, key: Key, value: u32) {
        if let Err(e) = self.store.set_u32(key, value) {
            warn!("kv: write {} failed: {:?}", key.name(), e);
        }
    }

    pub fn put_flag(&mut self, key: Key, value: bool) {
        if let Err(e) = self.store.set_bool(key, value) {
            warn!("kv: write {} failed: {:?}", key.name(), e);
        }
    }

    pub fn remove(&mut self, key: Key) {
        if let Err(e) = self.store.remove(key) {
            warn!("kv: remove {} failed: {:?}", key.name(), e);
        }
    }

    pub fn clear(&mut self) {
        if let Err(e) = self.store.clear() {
            warn!("kv: clear failed: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryKv;

    #[test]
    fn test_tag_round_trip_covers_all_keys() {
        for key in Key::ALL {
            assert_eq!(Key::from_tag(key.tag()), Some(key));
        }
        assert_eq!(Key::from_tag(0), None);
        assert_eq!(Key::from_tag(8), None);
    }

    #[test]
    fn test_empty_string_is_absent() {
        let mut settings = Settings::new(MemoryKv::default());
        settings.put_string(Key::ApiKey, "abc");
        assert_eq!(settings.string(Key::ApiKey).as_deref(), Some("abc"));
        settings.put_string(Key::ApiKey, "");
        assert_eq!(settings.string(Key::ApiKey), None);
    }

    #[test]
    fn test_failing_store_reads_as_empty() {
        let mut settings = Settings::new(MemoryKv::failing());
        settings.put_number(Key::RefreshRate, 60);
        assert_eq!(settings.number(Key::RefreshRate), None);
        assert_eq!(settings.flag(Key::InvertDisplay), None);
    }
}
