// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use core::util::SectorId;
use error::{ErrorKind, Result};

/// Size in bytes of one device sector.
pub const SECTOR_SIZE: usize = 512;

/// A sector-addressable storage device.
///
/// Every call transfers exactly one sector, blocks until the transfer is
/// done, and may fail. Failures are surfaced to the caller untouched; the
/// cache never retries on its own.
pub trait BlockDevice: Send + Sync + 'static {
    /// Number of sectors the device exposes.
    fn sector_count(&self) -> u64;

    /// Reads sector `sector` into `dst`.
    fn read_sector(&self, sector: SectorId, dst: &mut [u8; SECTOR_SIZE]) -> Result<()>;

    /// Writes `src` to sector `sector`.
    fn write_sector(&self, sector: SectorId, src: &[u8; SECTOR_SIZE]) -> Result<()>;
}

/// A volatile in-memory device.
///
/// Backs the benchmark driver and most of the test suite; contents start
/// zeroed.
pub struct RamDevice {
    sectors: Mutex<Vec<u8>>,
    count: u64,
}

impl RamDevice {
    pub fn new(sector_count: u64) -> RamDevice {
        RamDevice {
            sectors: Mutex::new(vec![0u8; sector_count as usize * SECTOR_SIZE]),
            count: sector_count,
        }
    }

    /// Overwrites every byte of every sector with `byte`.
    pub fn fill(&self, byte: u8) {
        let mut sectors = self.sectors.lock().unwrap();
        for b in sectors.iter_mut() {
            *b = byte;
        }
    }

    fn offset(&self, sector: SectorId) -> Result<usize> {
        if u64::from(sector) >= self.count {
            bail!(ErrorKind::DeviceIo(format!(
                "sector {} out of range, device has {} sectors",
                sector, self.count
            )));
        }
        Ok(sector as usize * SECTOR_SIZE)
    }
}

impl BlockDevice for RamDevice {
    fn sector_count(&self) -> u64 {
        self.count
    }

    fn read_sector(&self, sector: SectorId, dst: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        let offset = self.offset(sector)?;
        let sectors = self.sectors.lock()?;
        dst.copy_from_slice(&sectors[offset..offset + SECTOR_SIZE]);
        Ok(())
    }

    fn write_sector(&self, sector: SectorId, src: &[u8; SECTOR_SIZE]) -> Result<()> {
        let offset = self.offset(sector)?;
        let mut sectors = self.sectors.lock()?;
        sectors[offset..offset + SECTOR_SIZE].copy_from_slice(src);
        Ok(())
    }
}

/// A device backed by a regular file. Sector `i` lives at byte offset
/// `i * SECTOR_SIZE`.
pub struct FileDevice {
    file: Mutex<File>,
    count: u64,
}

impl FileDevice {
    /// Opens `path` read-write. The file length must be a whole number of
    /// sectors.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileDevice> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % SECTOR_SIZE as u64 != 0 {
            bail!(ErrorKind::DeviceIo(format!(
                "file length {} is not a multiple of the {} byte sector",
                len, SECTOR_SIZE
            )));
        }
        Ok(FileDevice {
            file: Mutex::new(file),
            count: len / SECTOR_SIZE as u64,
        })
    }

    fn offset(&self, sector: SectorId) -> Result<u64> {
        if u64::from(sector) >= self.count {
            bail!(ErrorKind::DeviceIo(format!(
                "sector {} out of range, device has {} sectors",
                sector, self.count
            )));
        }
        Ok(u64::from(sector) * SECTOR_SIZE as u64)
    }
}

impl BlockDevice for FileDevice {
    fn sector_count(&self) -> u64 {
        self.count
    }

    fn read_sector(&self, sector: SectorId, dst: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        let offset = self.offset(sector)?;
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(dst)?;
        Ok(())
    }

    fn write_sector(&self, sector: SectorId, src: &[u8; SECTOR_SIZE]) -> Result<()> {
        let offset = self.offset(sector)?;
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(src)?;
        Ok(())
    }
}

/// Wraps another device and records the traffic that reaches it.
///
/// `reads`/`writes` count attempts, successful or not; `written_sectors`
/// records the sectors that were actually written, in device order.
pub struct TrackingDevice<D: BlockDevice> {
    inner: D,
    reads: AtomicU64,
    writes: AtomicU64,
    written: Mutex<Vec<SectorId>>,
}

impl<D: BlockDevice> TrackingDevice<D> {
    pub fn new(inner: D) -> TrackingDevice<D> {
        TrackingDevice {
            inner,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn written_sectors(&self) -> Vec<SectorId> {
        self.written.lock().unwrap().clone()
    }
}

impl<D: BlockDevice> BlockDevice for TrackingDevice<D> {
    fn sector_count(&self) -> u64 {
        self.inner.sector_count()
    }

    fn read_sector(&self, sector: SectorId, dst: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_sector(sector, dst)
    }

    fn write_sector(&self, sector: SectorId, src: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_sector(sector, src)?;
        self.written.lock()?.push(sector);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    #[test]
    fn ram_device_round_trip() {
        let device = RamDevice::new(8);
        let mut buf = [0u8; SECTOR_SIZE];
        device.read_sector(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        let payload = [0x5Au8; SECTOR_SIZE];
        device.write_sector(3, &payload).unwrap();
        device.read_sector(3, &mut buf).unwrap();
        assert_eq!(&buf[..], &payload[..]);
    }

    #[test]
    fn ram_device_rejects_out_of_range_sectors() {
        let device = RamDevice::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(device.read_sector(4, &mut buf).is_err());
        assert!(device.write_sector(17, &buf).is_err());
    }

    #[test]
    fn tracking_device_counts_traffic() {
        let device = TrackingDevice::new(RamDevice::new(4));
        let mut buf = [0u8; SECTOR_SIZE];
        device.read_sector(0, &mut buf).unwrap();
        device.read_sector(1, &mut buf).unwrap();
        device.write_sector(2, &buf).unwrap();
        assert_eq!(device.reads(), 2);
        assert_eq!(device.writes(), 1);
        assert_eq!(device.written_sectors(), vec![2]);

        // a failed write is an attempt but not a completed one
        assert!(device.write_sector(100, &buf).is_err());
        assert_eq!(device.writes(), 2);
        assert_eq!(device.written_sectors(), vec![2]);
    }

    #[test]
    fn file_device_round_trip() {
        let path = env::temp_dir().join(format!("bufcache-filedev-{}.img", ::std::process::id()));
        {
            let file = fs::File::create(&path).unwrap();
            file.set_len(4 * SECTOR_SIZE as u64).unwrap();
        }

        let device = FileDevice::open(&path).unwrap();
        assert_eq!(device.sector_count(), 4);

        let payload = [0xC3u8; SECTOR_SIZE];
        device.write_sector(2, &payload).unwrap();
        let mut buf = [0u8; SECTOR_SIZE];
        device.read_sector(2, &mut buf).unwrap();
        assert_eq!(&buf[..], &payload[..]);

        device.read_sector(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert!(device.read_sector(4, &mut buf).is_err());

        let _ = fs::remove_file(&path);
    }
}
