//! Types shared by every layer of alphafs: errors, entry kinds,
//! permission levels and the clock used for timestamps.

use alloc::string::String;
use core::{fmt, str::FromStr};

use bitflags::bitflags;
use onlyerror::Error;

/// Index of a block on the volume. The only form of reference alphafs has.
pub type BlockLoc = u64;

pub type AlphaResult<T> = Result<T, AlphaError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlphaError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("directory at block {0} is full")]
    DirectoryFull(BlockLoc),
    #[error("entry at block {0} is read only")]
    ReadOnly(BlockLoc),
    #[error("block {0} does not hold a valid {1}")]
    Corrupt(BlockLoc, &'static str),
    #[error("out of space: no free run of {0} blocks")]
    OutOfSpace(u64),
    #[error("entry at block {0} is not a file")]
    NotAFile(BlockLoc),
    #[error("entry at block {0} is not a directory")]
    NotADirectory(BlockLoc),
    #[error("source and destination are the same: {0}")]
    SamePath(String),
    #[error("cannot copy a directory into itself: {0}")]
    IntoSelf(String),
    #[error("the root directory cannot be removed or moved")]
    RootEntry,
    #[error("block {0} is reserved for the system descriptor or root")]
    ReservedBlock(BlockLoc),
    #[error("blocks {0}..{1} lie outside the volume")]
    OutOfRange(BlockLoc, BlockLoc),
    #[error("bad volume geometry: {0}")]
    Geometry(&'static str),
    #[error("device error: {0}")]
    Io(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Two-bit discriminant stored in every tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    FileLink,
    DirectoryLink,
}

impl EntryKind {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => EntryKind::File,
            0b01 => EntryKind::Directory,
            0b10 => EntryKind::FileLink,
            _ => EntryKind::DirectoryLink,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            EntryKind::File => 0b00,
            EntryKind::Directory => 0b01,
            EntryKind::FileLink => 0b10,
            EntryKind::DirectoryLink => 0b11,
        }
    }

    /// Files and links keep their content in payload blocks; directories never do.
    pub fn has_payload(self) -> bool {
        !matches!(self, EntryKind::Directory)
    }

    pub fn is_link(self) -> bool {
        matches!(self, EntryKind::FileLink | EntryKind::DirectoryLink)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryKind::File => "File",
            EntryKind::Directory => "Directory",
            EntryKind::FileLink => "File Link",
            EntryKind::DirectoryLink => "Directory Link",
        };
        f.write_str(name)
    }
}

impl FromStr for EntryKind {
    type Err = AlphaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fl" => Ok(EntryKind::File),
            "dr" => Ok(EntryKind::Directory),
            "fllnk" => Ok(EntryKind::FileLink),
            "drlnk" => Ok(EntryKind::DirectoryLink),
            other => Err(AlphaError::InvalidName(alloc::format!(
                "unknown entry kind '{}'",
                other
            ))),
        }
    }
}

/// Escalating permission level: write implies read, execute implies both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Permission {
    Read,
    Write,
    Execute,
}

bitflags! {
    /// Capabilities granted by a permission level.
    pub struct Access: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
    }
}

impl Permission {
    /// Decodes the three permission bits. Levels compare numerically on
    /// disk, so any value is accepted and maps to the highest level it reaches.
    pub fn from_bits(bits: u8) -> Self {
        let bits = bits & 0b111;
        if bits >= Access::EXECUTE.bits() {
            Permission::Execute
        } else if bits >= Access::WRITE.bits() {
            Permission::Write
        } else {
            Permission::Read
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Permission::Read => Access::READ.bits(),
            Permission::Write => Access::WRITE.bits(),
            Permission::Execute => Access::EXECUTE.bits(),
        }
    }

    pub fn access(self) -> Access {
        match self {
            Permission::Read => Access::READ,
            Permission::Write => Access::READ | Access::WRITE,
            Permission::Execute => Access::all(),
        }
    }

    pub fn allows(self, wanted: Access) -> bool {
        self.access().contains(wanted)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Read => "Read",
            Permission::Write => "Read Write",
            Permission::Execute => "Read Write Execute",
        };
        f.write_str(name)
    }
}

impl FromStr for Permission {
    type Err = AlphaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "execute" => Ok(Permission::Execute),
            other => Err(AlphaError::InvalidName(alloc::format!(
                "unknown permission '{}'",
                other
            ))),
        }
    }
}

/// Source of wall-clock seconds for entry timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// A clock that always reports the same instant.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.0
    }
}

#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[cfg(feature = "std")]
impl Clock for SystemClock {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}
