//! Persistent settings in SPI flash
//!
//! All keys are held in RAM and written back as one record to the last
//! sector of a data partition on every change.
//!
//! Record layout (little endian):
//! `magic:u32 | version:u8 | count:u8 | len:u16 | entries | fnv1a:u32`,
//! where each entry is `tag:u8 | kind:u8 | len:u8 | value[len]`.

use alloc::string::String;

use embedded_storage::{ReadStorage, Storage};
use esp_bootloader_esp_idf::partitions::{
    DataPartitionSubType, PARTITION_TABLE_MAX_LEN, PartitionType, read_partition_table,
};
use esp_rom_sys::rom::spiflash::{
    ESP_ROM_SPIFLASH_RESULT_OK, esp_rom_spiflash_erase_sector, esp_rom_spiflash_read,
    esp_rom_spiflash_unlock, esp_rom_spiflash_write,
};
use heapless::Vec;
use log::{debug, info, warn};
use paperdink_client::kv::{Key, KvStore};

const FLASH_SECTOR_SIZE: u32 = 4096;
const DEFAULT_FLASH_CAPACITY_BYTES: usize = 4 * 1024 * 1024;

const RECORD_MAGIC: u32 = 0x314B_4450; // "PDK1"
const RECORD_VERSION: u8 = 1;
const HEADER_LEN: usize = 8;
/// Largest record we write; always within one sector
pub const RECORD_MAX: usize = 1024;
/// Longest string value
pub const VALUE_MAX: usize = 192;

const KIND_STR: u8 = 0;
const KIND_U32: u8 = 1;
const KIND_BOOL: u8 = 2;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SettingsError {
    PartitionTable,
    PartitionMissing,
    FlashOpFailed(i32),
    Corrupted,
    Unsupported,
    /// Value longer than [`VALUE_MAX`] or record full
    TooLarge,
}

/// Stored value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(heapless::String<VALUE_MAX>),
    U32(u32),
    Bool(bool),
}

/// In-memory copy of the settings record
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Record {
    entries: Vec<(Key, Value), { Key::ALL.len() }>,
}

impl Record {
    pub fn get(&self, key: Key) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn set(&mut self, key: Key, value: Value) -> Result<(), SettingsError> {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self
                .entries
                .push((key, value))
                .map_err(|_| SettingsError::TooLarge)?,
        }
        Ok(())
    }

    /// True when the key was present
    pub fn remove(&mut self, key: Key) -> bool {
        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(idx) => {
                self.entries.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Serialise into `buf`, returning the record length
    pub fn encode(&self, buf: &mut [u8; RECORD_MAX]) -> Result<usize, SettingsError> {
        let mut len = HEADER_LEN;
        for (key, value) in &self.entries {
            let mut scratch = [0u8; 4];
            let (kind, bytes): (u8, &[u8]) = match value {
                Value::Str(s) => (KIND_STR, s.as_bytes()),
                Value::U32(n) => {
                    scratch = n.to_le_bytes();
                    (KIND_U32, &scratch[..])
                }
                Value::Bool(b) => {
                    scratch[0] = *b as u8;
                    (KIND_BOOL, &scratch[..1])
                }
            };
            let end = len + 3 + bytes.len();
            if end + 4 > RECORD_MAX {
                return Err(SettingsError::TooLarge);
            }
            buf[len] = key.tag();
            buf[len + 1] = kind;
            buf[len + 2] = bytes.len() as u8;
            buf[len + 3..end].copy_from_slice(bytes);
            len = end;
        }

        buf[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf[4] = RECORD_VERSION;
        buf[5] = self.entries.len() as u8;
        buf[6..8].copy_from_slice(&((len - HEADER_LEN) as u16).to_le_bytes());
        let checksum = checksum32(&buf[..len]);
        buf[len..len + 4].copy_from_slice(&checksum.to_le_bytes());
        Ok(len + 4)
    }

    /// Parse a record. Erased or foreign data yields `Ok(None)`.
    pub fn decode(buf: &[u8]) -> Result<Option<Record>, SettingsError> {
        if buf.len() < HEADER_LEN || buf[..HEADER_LEN].iter().all(|b| *b == 0xFF) {
            return Ok(None);
        }
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != RECORD_MAGIC || buf[4] != RECORD_VERSION {
            return Ok(None);
        }

        let count = buf[5] as usize;
        let body_len = u16::from_le_bytes([buf[6], buf[7]]) as usize;
        let end = HEADER_LEN + body_len;
        if end + 4 > buf.len() {
            return Err(SettingsError::Corrupted);
        }
        let expected = u32::from_le_bytes([buf[end], buf[end + 1], buf[end + 2], buf[end + 3]]);
        if checksum32(&buf[..end]) != expected {
            return Err(SettingsError::Corrupted);
        }

        let mut record = Record::default();
        let mut pos = HEADER_LEN;
        for _ in 0..count {
            if pos + 3 > end {
                return Err(SettingsError::Corrupted);
            }
            let (tag, kind, len) = (buf[pos], buf[pos + 1], buf[pos + 2] as usize);
            let value = buf
                .get(pos + 3..pos + 3 + len)
                .filter(|_| pos + 3 + len <= end)
                .ok_or(SettingsError::Corrupted)?;
            pos += 3 + len;

            // Unknown tags come from a newer layout; skip them.
            let Some(key) = Key::from_tag(tag) else {
                continue;
            };
            let value = match (kind, value) {
                (KIND_STR, bytes) => {
                    let text = core::str::from_utf8(bytes).map_err(|_| SettingsError::Corrupted)?;
                    let mut s = heapless::String::new();
                    s.push_str(text).map_err(|_| SettingsError::Corrupted)?;
                    Value::Str(s)
                }
                (KIND_U32, &[a, b, c, d]) => Value::U32(u32::from_le_bytes([a, b, c, d])),
                (KIND_BOOL, &[b]) => Value::Bool(b != 0),
                _ => return Err(SettingsError::Corrupted),
            };
            record.set(key, value)?;
        }
        Ok(Some(record))
    }
}

fn checksum32(bytes: &[u8]) -> u32 {
    let mut hash = 0x811C9DC5u32;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Debug)]
struct RawFlash;

impl RawFlash {
    fn new() -> Result<Self, SettingsError> {
        let rc = unsafe { esp_rom_spiflash_unlock() };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(SettingsError::FlashOpFailed(rc));
        }
        Ok(Self)
    }

    fn erase_sector(&mut self, sector_addr: u32) -> Result<(), SettingsError> {
        if !sector_addr.is_multiple_of(FLASH_SECTOR_SIZE) {
            return Err(SettingsError::Unsupported);
        }
        let rc = unsafe { esp_rom_spiflash_erase_sector(sector_addr / FLASH_SECTOR_SIZE) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(SettingsError::FlashOpFailed(rc));
        }
        Ok(())
    }

    fn read_word(&mut self, addr: u32) -> Result<u32, SettingsError> {
        let mut word = 0u32;
        let rc = unsafe { esp_rom_spiflash_read(addr, &mut word as *mut u32 as *const u32, 4) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(SettingsError::FlashOpFailed(rc));
        }
        Ok(word)
    }

    /// Read from a word-aligned address; the tail may be partial
    fn read_bytes(&mut self, addr: u32, out: &mut [u8]) -> Result<(), SettingsError> {
        if !addr.is_multiple_of(4) {
            return Err(SettingsError::Unsupported);
        }
        for (i, chunk) in out.chunks_mut(4).enumerate() {
            let word = self.read_word(addr + 4 * i as u32)?.to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        Ok(())
    }

    /// Program an erased region, padding the tail word with 0xFF
    fn write_erased(&mut self, addr: u32, data: &[u8]) -> Result<(), SettingsError> {
        if !addr.is_multiple_of(4) {
            return Err(SettingsError::Unsupported);
        }
        for (i, chunk) in data.chunks(4).enumerate() {
            let mut bytes = [0xFFu8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            let word = u32::from_le_bytes(bytes);
            let rc = unsafe { esp_rom_spiflash_write(addr + 4 * i as u32, &word as *const u32, 4) };
            if rc != ESP_ROM_SPIFLASH_RESULT_OK {
                return Err(SettingsError::FlashOpFailed(rc));
            }
        }
        Ok(())
    }
}

impl ReadStorage for RawFlash {
    type Error = SettingsError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.read_bytes(offset, bytes)
    }

    fn capacity(&self) -> usize {
        DEFAULT_FLASH_CAPACITY_BYTES
    }
}

impl Storage for RawFlash {
    fn write(&mut self, _offset: u32, _bytes: &[u8]) -> Result<(), Self::Error> {
        Err(SettingsError::Unsupported)
    }
}

/// [`KvStore`] over one flash sector
#[derive(Debug)]
pub struct FlashKvStore {
    flash: RawFlash,
    sector_addr: u32,
    record: Record,
}

impl FlashKvStore {
    /// Locate the settings sector and load the record. A corrupt record is
    /// discarded and the store starts empty.
    pub fn new() -> Result<Self, SettingsError> {
        let mut flash = RawFlash::new()?;

        let mut table_buf = [0u8; PARTITION_TABLE_MAX_LEN];
        let table = read_partition_table(&mut flash, &mut table_buf)
            .map_err(|_| SettingsError::PartitionTable)?;

        let mut data_undefined: Option<(u32, u32)> = None;
        let mut nvs: Option<(u32, u32)> = None;
        for entry in table.iter() {
            if entry.is_read_only() || entry.len() < FLASH_SECTOR_SIZE {
                continue;
            }
            match entry.partition_type() {
                PartitionType::Data(DataPartitionSubType::Undefined) => {
                    data_undefined = Some((entry.offset(), entry.len()));
                    break;
                }
                PartitionType::Data(DataPartitionSubType::Nvs) if nvs.is_none() => {
                    nvs = Some((entry.offset(), entry.len()));
                }
                _ => {}
            }
        }

        let (offset, len) = data_undefined
            .or(nvs)
            .ok_or(SettingsError::PartitionMissing)?;
        let sector_addr = offset + len - FLASH_SECTOR_SIZE;
        info!("settings: sector at {:#x}", sector_addr);

        let mut buf = [0u8; RECORD_MAX];
        flash.read_bytes(sector_addr, &mut buf)?;
        let record = match Record::decode(&buf) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("settings: no record");
                Record::default()
            }
            Err(e) => {
                warn!("settings: discarding record: {:?}", e);
                Record::default()
            }
        };

        Ok(Self {
            flash,
            sector_addr,
            record,
        })
    }

    fn flush(&mut self) -> Result<(), SettingsError> {
        let mut buf = [0xFFu8; RECORD_MAX];
        let len = self.record.encode(&mut buf)?;
        self.flash.erase_sector(self.sector_addr)?;
        self.flash.write_erased(self.sector_addr, &buf[..len])?;
        debug!("settings: wrote {} bytes", len);
        Ok(())
    }

    fn update(&mut self, key: Key, value: Value) -> Result<(), SettingsError> {
        if self.record.get(key) == Some(&value) {
            return Ok(());
        }
        self.record.set(key, value)?;
        self.flush()
    }
}

impl KvStore for FlashKvStore {
    type Error = SettingsError;

    fn get_str(&mut self, key: Key) -> Result<Option<String>, Self::Error> {
        Ok(match self.record.get(key) {
            Some(Value::Str(s)) => Some(String::from(s.as_str())),
            _ => None,
        })
    }

    fn set_str(&mut self, key: Key, value: &str) -> Result<(), Self::Error> {
        let mut s = heapless::String::new();
        s.push_str(value).map_err(|_| SettingsError::TooLarge)?;
        self.update(key, Value::Str(s))
    }

    fn get_u32(&mut self, key: Key) -> Result<Option<u32>, Self::Error> {
        Ok(match self.record.get(key) {
            Some(Value::U32(n)) => Some(*n),
            _ => None,
        })
    }

    fn set_u32(&mut self, key: Key, value: u32) -> Result<(), Self::Error> {
        self.update(key, Value::U32(value))
    }

    fn get_bool(&mut self, key: Key) -> Result<Option<bool>, Self::Error> {
        Ok(match self.record.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        })
    }

    fn set_bool(&mut self, key: Key, value: bool) -> Result<(), Self::Error> {
        self.update(key, Value::Bool(value))
    }

    fn remove(&mut self, key: Key) -> Result<(), Self::Error> {
        if self.record.remove(key) {
            self.flush()?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), Self::Error> {
        self.record.clear();
        self.flash.erase_sector(self.sector_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Value {
        let mut v = heapless::String::new();
        v.push_str(s).unwrap();
        Value::Str(v)
    }

    #[test]
    fn test_record_survives_encoding() {
        let mut record = Record::default();
        record.set(Key::ApiKey, text("abc123")).unwrap();
        record.set(Key::RefreshRate, Value::U32(900)).unwrap();
        record.set(Key::InvertDisplay, Value::Bool(true)).unwrap();
        record.set(Key::ApiKey, text("def456")).unwrap();

        let mut buf = [0xFFu8; RECORD_MAX];
        let len = record.encode(&mut buf).unwrap();
        let decoded = Record::decode(&buf[..len]).unwrap().unwrap();
        assert_eq!(decoded.get(Key::ApiKey), Some(&text("def456")));
        assert_eq!(decoded.get(Key::RefreshRate), Some(&Value::U32(900)));
        assert_eq!(decoded.get(Key::InvertDisplay), Some(&Value::Bool(true)));
        assert_eq!(decoded.get(Key::WifiSsid), None);
    }

    #[test]
    fn test_erased_sector_is_empty() {
        assert_eq!(Record::decode(&[0xFF; 64]), Ok(None));
    }

    #[test]
    fn test_flipped_bit_is_corrupt() {
        let mut record = Record::default();
        record.set(Key::FriendlyId, text("ABC123")).unwrap();
        let mut buf = [0xFFu8; RECORD_MAX];
        let len = record.encode(&mut buf).unwrap();
        buf[HEADER_LEN + 4] ^= 0x01;
        assert_eq!(Record::decode(&buf[..len]), Err(SettingsError::Corrupted));
    }
}
