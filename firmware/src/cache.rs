//! SD card file store
//!
//! Backs the image cache with the card's FAT filesystem. Logical paths are
//! `dir/name`; FAT only offers 8.3 names, so each name is stored as the
//! FNV-1a hash of the logical name (`1A2B3C4D.BIN`) inside an upper-cased
//! directory. The logical names live in the client's manifest.

use core::fmt::Write as FmtWrite;

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiDevice;
use embedded_sdmmc::{Mode, SdCard, TimeSource, Timestamp, VolumeIdx, VolumeManager};
use heapless::String;
use log::{debug, info, warn};
use paperdink_client::cache::CacheStore;

/// Dummy time source (SD cards need timestamps but we don't care)
pub struct DummyTimesource;

impl TimeSource for DummyTimesource {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 56, // 2026
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

/// SD store error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    /// Card missing or failed to initialise
    SdCard,
    /// Path is not `dir/name`
    InvalidPath,
    /// File not found
    NotFound,
    /// Filesystem error
    Filesystem,
    /// Write error
    Write,
    /// Read error
    Read,
}

/// 8.3 short name for a logical file name
pub fn short_name(name: &str) -> String<12> {
    let mut hash = 0x811C_9DC5u32;
    for b in name.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    let mut short: String<12> = String::new();
    let _ = write!(short, "{:08X}.BIN", hash);
    short
}

/// FAT directory name for a logical directory
fn dir_name(dir: &str) -> Result<String<8>, SdError> {
    if dir.is_empty() || dir.len() > 8 || !dir.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(SdError::InvalidPath);
    }
    let mut name: String<8> = String::new();
    for c in dir.chars() {
        name.push(c.to_ascii_uppercase())
            .map_err(|_| SdError::InvalidPath)?;
    }
    Ok(name)
}

fn split(path: &str) -> Result<(String<8>, String<12>), SdError> {
    let (dir, name) = path.split_once('/').ok_or(SdError::InvalidPath)?;
    if name.is_empty() {
        return Err(SdError::InvalidPath);
    }
    Ok((dir_name(dir)?, short_name(name)))
}

/// SD card backed [`CacheStore`]
pub struct SdCache<SPI: SpiDevice, DELAY: DelayNs> {
    volume_mgr: VolumeManager<SdCard<SPI, DELAY>, DummyTimesource>,
    available: bool,
}

impl<SPI, DELAY> SdCache<SPI, DELAY>
where
    SPI: SpiDevice,
    DELAY: DelayNs,
{
    /// Probe the card. A missing card yields a store that reports unavailable.
    pub fn new(spi: SPI, delay: DELAY) -> Self {
        let sd_card = SdCard::new(spi, delay);

        let available = match sd_card.num_bytes() {
            Ok(size) => {
                info!("sd: card size {} MB", size / 1024 / 1024);
                true
            }
            Err(e) => {
                warn!("sd: no card: {:?}", e);
                false
            }
        };

        let mut cache = Self {
            volume_mgr: VolumeManager::new(sd_card, DummyTimesource),
            available,
        };
        if cache.available
            && let Err(e) = cache.check_volume()
        {
            warn!("sd: volume unusable: {:?}", e);
            cache.available = false;
        }
        cache
    }

    fn check_volume(&mut self) -> Result<(), SdError> {
        let mut volume = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(|_| SdError::Filesystem)?;
        volume.open_root_dir().map_err(|_| SdError::Filesystem)?;
        Ok(())
    }

    /// Run `f` on `dir`, creating the directory when `create` is set
    fn with_dir<R>(
        &mut self,
        dir: &str,
        create: bool,
        f: impl FnOnce(&mut embedded_sdmmc::Directory<'_, SdCard<SPI, DELAY>, DummyTimesource, 4, 4, 1>) -> Result<R, SdError>,
    ) -> Result<R, SdError> {
        if !self.available {
            return Err(SdError::SdCard);
        }
        let mut volume = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(|_| SdError::Filesystem)?;
        let mut root_dir = volume.open_root_dir().map_err(|_| SdError::Filesystem)?;

        if root_dir.open_dir(dir).is_err() {
            if !create {
                return Err(SdError::NotFound);
            }
            root_dir
                .make_dir_in_dir(dir)
                .map_err(|_| SdError::Filesystem)?;
            debug!("sd: created /{}", dir);
        }
        let mut sub_dir = root_dir.open_dir(dir).map_err(|_| SdError::Filesystem)?;
        f(&mut sub_dir)
    }
}

impl<SPI, DELAY> CacheStore for SdCache<SPI, DELAY>
where
    SPI: SpiDevice,
    DELAY: DelayNs,
{
    type Error = SdError;

    fn is_available(&self) -> bool {
        self.available
    }

    fn exists(&mut self, path: &str) -> bool {
        let Ok((dir, name)) = split(path) else {
            return false;
        };
        self.with_dir(&dir, false, |d| {
            Ok(d.find_directory_entry(name.as_str()).is_ok())
        })
        .unwrap_or(false)
    }

    fn size(&mut self, path: &str) -> Result<usize, Self::Error> {
        let (dir, name) = split(path)?;
        self.with_dir(&dir, false, |d| {
            let entry = d
                .find_directory_entry(name.as_str())
                .map_err(|_| SdError::NotFound)?;
            Ok(entry.size as usize)
        })
    }

    fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let (dir, name) = split(path)?;
        self.with_dir(&dir, false, |d| {
            let mut file = d
                .open_file_in_dir(name.as_str(), Mode::ReadOnly)
                .map_err(|_| SdError::NotFound)?;

            let mut total_read = 0;
            while total_read < buf.len() {
                match file.read(&mut buf[total_read..]) {
                    Ok(0) => break,
                    Ok(n) => total_read += n,
                    Err(_) => return Err(SdError::Read),
                }
            }
            debug!("sd: read {} bytes from {}", total_read, name);
            Ok(total_read)
        })
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), Self::Error> {
        let (dir, name) = split(path)?;
        self.with_dir(&dir, true, |d| {
            let mut file = d
                .open_file_in_dir(name.as_str(), Mode::ReadWriteCreateOrTruncate)
                .map_err(|_| SdError::Write)?;
            file.write(data).map_err(|_| SdError::Write)?;
            file.flush().map_err(|_| SdError::Write)?;
            debug!("sd: wrote {} bytes to {}", data.len(), name);
            Ok(())
        })
    }

    fn remove(&mut self, path: &str) -> Result<(), Self::Error> {
        let (dir, name) = split(path)?;
        self.with_dir(&dir, false, |d| {
            d.delete_file_in_dir(name.as_str())
                .map_err(|_| SdError::NotFound)
        })
    }

    fn clear_dir(&mut self, dir: &str) -> Result<usize, Self::Error> {
        let dir = dir_name(dir)?;
        let result = self.with_dir(&dir, false, |d| {
            let mut names: heapless::Vec<String<12>, 64> = heapless::Vec::new();
            d.iterate_dir(|entry| {
                if entry.attributes.is_directory() {
                    return;
                }
                let base = core::str::from_utf8(entry.name.base_name()).unwrap_or("");
                let ext = core::str::from_utf8(entry.name.extension()).unwrap_or("");
                let mut full: String<12> = String::new();
                let ok = if ext.trim().is_empty() {
                    write!(full, "{}", base.trim())
                } else {
                    write!(full, "{}.{}", base.trim(), ext.trim())
                };
                if ok.is_ok() && !full.is_empty() {
                    let _ = names.push(full);
                }
            })
            .map_err(|_| SdError::Filesystem)?;

            let mut removed = 0;
            for name in names.iter() {
                match d.delete_file_in_dir(name.as_str()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("sd: could not delete {}: {:?}", name, e),
                }
            }
            Ok(removed)
        });
        match result {
            Err(SdError::NotFound) => Ok(0),
            other => other,
        }
    }
}
