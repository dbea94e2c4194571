//! Fixed-size block storage underneath the file system.

use alloc::vec::Vec;

use spin::Mutex;

use crate::common::{AlphaError, AlphaResult, BlockLoc};

/// A volume of `block_count` blocks of `block_size` bytes each.
///
/// Buffers passed to `read_blocks`/`write_blocks` are always a whole number
/// of blocks long; the number of blocks transferred is `buf.len() / block_size`.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> u32;
    fn block_count(&self) -> u64;
    fn read_blocks(&self, lba: BlockLoc, buf: &mut [u8]) -> AlphaResult<()>;
    fn write_blocks(&self, lba: BlockLoc, buf: &[u8]) -> AlphaResult<()>;
    fn flush(&self) -> AlphaResult<()> {
        Ok(())
    }
}

fn check_transfer(dev: &dyn BlockDevice, lba: BlockLoc, len: usize) -> AlphaResult<()> {
    let block_size = dev.block_size() as usize;
    if len % block_size != 0 {
        return Err(AlphaError::Io(alloc::format!(
            "transfer of {} bytes is not a multiple of the {} byte block",
            len, block_size
        )));
    }
    let end = lba + (len / block_size) as u64;
    if end > dev.block_count() {
        return Err(AlphaError::OutOfRange(lba, end));
    }
    Ok(())
}

/// Volume kept entirely in memory.
pub struct RamDisk {
    block_size: u32,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(block_count: u64, block_size: u32) -> Self {
        Self {
            block_size,
            data: Mutex::new(alloc::vec![0u8; block_count as usize * block_size as usize]),
        }
    }

    /// Wraps an existing image. Trailing bytes short of a whole block are dropped.
    pub fn from_image(mut data: Vec<u8>, block_size: u32) -> AlphaResult<Self> {
        if block_size == 0 {
            return Err(AlphaError::Geometry("block size must not be zero"));
        }
        let whole = data.len() - data.len() % block_size as usize;
        data.truncate(whole);
        Ok(Self {
            block_size,
            data: Mutex::new(data),
        })
    }

    /// Copy of the raw volume bytes.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.data
            .lock()
            .len()
            .checked_div(self.block_size as usize)
            .unwrap_or(0) as u64
    }

    fn read_blocks(&self, lba: BlockLoc, buf: &mut [u8]) -> AlphaResult<()> {
        check_transfer(self, lba, buf.len())?;
        let data = self.data.lock();
        let start = lba as usize * self.block_size as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_blocks(&self, lba: BlockLoc, buf: &[u8]) -> AlphaResult<()> {
        check_transfer(self, lba, buf.len())?;
        let mut data = self.data.lock();
        let start = lba as usize * self.block_size as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(feature = "std")]
pub use file_disk::FileDisk;

#[cfg(feature = "std")]
mod file_disk {
    use std::{
        fs::{File, OpenOptions},
        io::{Read, Seek, SeekFrom, Write},
        path::Path,
    };

    use log::info;
    use spin::Mutex;

    use super::{check_transfer, BlockDevice};
    use crate::common::{AlphaError, AlphaResult, BlockLoc};

    fn io_err(e: std::io::Error) -> AlphaError {
        AlphaError::Io(e.to_string())
    }

    /// Volume backed by a host image file.
    pub struct FileDisk {
        file: Mutex<File>,
        block_size: u32,
        block_count: u64,
    }

    impl FileDisk {
        /// Opens or creates the image at `path`. A new or empty image is sized
        /// to `volume_size` bytes; an existing image keeps its length.
        pub fn open<P: AsRef<Path>>(path: P, volume_size: u64, block_size: u32) -> AlphaResult<Self> {
            if block_size == 0 {
                return Err(AlphaError::Geometry("block size must not be zero"));
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path.as_ref())
                .map_err(io_err)?;
            let mut len = file.metadata().map_err(io_err)?.len();
            if len == 0 {
                file.set_len(volume_size).map_err(io_err)?;
                len = volume_size;
            }
            let block_count = len / block_size as u64;
            info!(
                "opened image {} with {} blocks of {} bytes",
                path.as_ref().display(),
                block_count,
                block_size
            );
            Ok(Self {
                file: Mutex::new(file),
                block_size,
                block_count,
            })
        }
    }

    impl BlockDevice for FileDisk {
        fn block_size(&self) -> u32 {
            self.block_size
        }

        fn block_count(&self) -> u64 {
            self.block_count
        }

        fn read_blocks(&self, lba: BlockLoc, buf: &mut [u8]) -> AlphaResult<()> {
            check_transfer(self, lba, buf.len())?;
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(lba * self.block_size as u64))
                .map_err(io_err)?;
            file.read_exact(buf).map_err(io_err)
        }

        fn write_blocks(&self, lba: BlockLoc, buf: &[u8]) -> AlphaResult<()> {
            check_transfer(self, lba, buf.len())?;
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(lba * self.block_size as u64))
                .map_err(io_err)?;
            file.write_all(buf).map_err(io_err)
        }

        fn flush(&self) -> AlphaResult<()> {
            let mut file = self.file.lock();
            file.flush().map_err(io_err)?;
            file.sync_all().map_err(io_err)
        }
    }
}
