//! Named shared-memory regions.
//!
//! A region is a file under the provider's root directory (by default on
//! tmpfs), mapped read-write into every process that opens it. The creator
//! fills it, the peer reads it, and whichever side enabled removal unlinks
//! the name when its handle is dropped.
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use faas_common::log;
use memmap2::MmapMut;
use thiserror::Error;

use crate::protocol::{RegionName, INLINE_DATA_SIZE};

pub const DEFAULT_ROOT_PATH: &str = "/dev/shm/faas_ipc";

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO: {0}.")]
    Io(#[from] io::Error),
    #[error("Invalid region name: {0:?}")]
    InvalidName(String),
    #[error("Region {0} already exists")]
    Exists(String),
    #[error("Region {0} not found")]
    NotFound(String),
}

fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty()
        || name.len() > INLINE_DATA_SIZE
        || name.contains('/')
        || name.contains('\0')
        || name == "."
        || name == ".."
    {
        return Err(Error::InvalidName(name.to_owned()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ShmProvider {
    root: Arc<PathBuf>,
}

impl ShmProvider {
    /// Creates the root directory if it does not exist.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, Error> {
        fs::create_dir_all(root.as_ref())?;
        Ok(ShmProvider {
            root: Arc::new(root.as_ref().to_path_buf()),
        })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a zero-filled region of `size` bytes. Fails if the name is
    /// taken. The region is kept after drop unless
    /// [`ShmRegion::enable_remove_on_drop`] is called.
    pub fn create(&self, name: &str, size: usize) -> Result<ShmRegion, Error> {
        validate_name(name)?;
        let path = self.root.join(name);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::Exists(name.to_owned()))
            }
            Err(e) => return Err(e.into()),
        };
        let mapped = file
            .set_len(size as u64)
            .map_err(Error::from)
            .and_then(|_| map(&file, size));
        match mapped {
            Ok(mmap) => Ok(ShmRegion {
                name: name.to_owned(),
                path,
                mmap,
                remove_on_drop: false,
            }),
            Err(e) => {
                let _ = fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Convenience for names carried in messages.
    #[inline]
    pub fn create_named(&self, name: &RegionName, size: usize) -> Result<ShmRegion, Error> {
        self.create(name.as_str(), size)
    }

    /// Maps an existing region.
    pub fn open(&self, name: &str) -> Result<ShmRegion, Error> {
        validate_name(name)?;
        let path = self.root.join(name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(name.to_owned()))
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata()?.len() as usize;
        let mmap = map(&file, size)?;
        Ok(ShmRegion {
            name: name.to_owned(),
            path,
            mmap,
            remove_on_drop: false,
        })
    }

    #[inline]
    pub fn open_named(&self, name: &RegionName) -> Result<ShmRegion, Error> {
        self.open(name.as_str())
    }

    /// Names of the regions currently present under the root, sorted.
    pub fn live_regions(&self) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.root.as_ref())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn map(file: &File, size: usize) -> Result<Option<MmapMut>, Error> {
    if size == 0 {
        // mmap(2) rejects empty mappings
        return Ok(None);
    }
    // SAFETY: region files are only resized by their creator, before the
    // name is handed to any peer.
    let mmap = unsafe { MmapMut::map_mut(file)? };
    Ok(Some(mmap))
}

pub struct ShmRegion {
    name: String,
    path: PathBuf,
    mmap: Option<MmapMut>,
    remove_on_drop: bool,
}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("remove_on_drop", &self.remove_on_drop)
            .finish()
    }
}

impl ShmRegion {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mmap.as_deref_mut().unwrap_or(&mut [])
    }

    /// Unlinks the name when this handle is dropped.
    #[inline]
    pub fn enable_remove_on_drop(&mut self) {
        self.remove_on_drop = true;
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if !self.remove_on_drop {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove shm region {}: {}", self.name, e),
        }
    }
}
