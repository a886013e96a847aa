//! Shared memory region management and operations
//!
//! A region is a file under the hugepage mount, named
//! `<huge_dir>/<file_prefix>_<object_name>`, mapped read-write into every
//! process that needs the object. The creating (primary) side owns the file
//! and unlinks it on drop; attaching (secondary) sides only map and unmap.
//! Name-based attachment is what makes two processes agree on an object.

use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    io::ErrorKind,
    os::fd::FromRawFd,
    path::{Path, PathBuf},
    sync::Arc,
};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Result, TransportError};

/// Locator for every backing file of one deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLocator {
    huge_dir: PathBuf,
    file_prefix: String,
}

impl SegmentLocator {
    pub fn new(huge_dir: impl Into<PathBuf>, file_prefix: impl Into<String>) -> Self {
        Self {
            huge_dir: huge_dir.into(),
            file_prefix: file_prefix.into(),
        }
    }

    /// Backing-file path for a materialized object name
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.huge_dir
            .join(format!("{}_{}", self.file_prefix, name))
    }

    pub fn huge_dir(&self) -> &Path {
        &self.huge_dir
    }

    pub fn file_prefix(&self) -> &str {
        &self.file_prefix
    }
}

/// How a region came into this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// This process created the backing file and owns its lifetime
    Created,
    /// This process attached to a pre-existing file
    Attached,
    /// Anonymous memfd region, private to this process tree
    Anonymous,
}

/// A mapped shared-memory region
#[derive(Debug)]
pub struct SharedMemoryRegion {
    name: String,
    path: Option<PathBuf>,
    mmap: MmapMut,
    _file: Option<File>,
    origin: Origin,
    len: usize,
}

impl SharedMemoryRegion {
    /// Create the backing file for `name` and map it.
    ///
    /// Fails with `Io` (kind `AlreadyExists`) when the file is already
    /// present; callers wanting create-or-found semantics attach on that
    /// error instead.
    pub fn create(locator: &SegmentLocator, name: &str, len: usize) -> Result<Arc<Self>> {
        if name.is_empty() {
            return Err(TransportError::invalid_name(name));
        }
        if len == 0 {
            return Err(TransportError::config("region length must be nonzero"));
        }
        let path = locator.path_for(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| TransportError::from_io(e, "create region file"))?;

        file.set_len(len as u64)
            .map_err(|e| TransportError::from_io(e, "size region file"))?;

        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(&file)
                .map_err(|e| TransportError::from_io(e, "map region"))?
        };

        Ok(Arc::new(Self {
            name: name.to_string(),
            path: Some(path),
            mmap,
            _file: Some(file),
            origin: Origin::Created,
            len,
        }))
    }

    /// Attach to a pre-existing backing file by name.
    ///
    /// A missing file is `NotFound`; a stale path (directory vanished,
    /// permissions) surfaces as `Io` and is always fatal to the attach,
    /// never a data-corruption path.
    pub fn attach(locator: &SegmentLocator, name: &str) -> Result<Arc<Self>> {
        if name.is_empty() {
            return Err(TransportError::invalid_name(name));
        }
        let path = locator.path_for(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    TransportError::not_found(name)
                } else {
                    TransportError::from_io(e, "open region file")
                }
            })?;

        let len = file
            .metadata()
            .map_err(|e| TransportError::from_io(e, "stat region file"))?
            .len() as usize;
        if len == 0 {
            return Err(TransportError::not_found(name));
        }

        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(&file)
                .map_err(|e| TransportError::from_io(e, "map region"))?
        };

        Ok(Arc::new(Self {
            name: name.to_string(),
            path: Some(path),
            mmap,
            _file: Some(file),
            origin: Origin::Attached,
            len,
        }))
    }

    /// Anonymous memfd region, reachable only through this handle.
    /// Used by tests and single-process backends.
    #[cfg(target_os = "linux")]
    pub fn anonymous(name: &str, len: usize) -> Result<Arc<Self>> {
        let name_cstr = CString::new(name)
            .map_err(|_| TransportError::invalid_name(name))?;

        let fd = unsafe { libc::memfd_create(name_cstr.as_ptr(), libc::MFD_CLOEXEC) };
        if fd == -1 {
            return Err(TransportError::from_io(
                std::io::Error::last_os_error(),
                "memfd_create",
            ));
        }
        let file = unsafe { File::from_raw_fd(fd) };

        file.set_len(len as u64)
            .map_err(|e| TransportError::from_io(e, "size memfd"))?;

        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(&file)
                .map_err(|e| TransportError::from_io(e, "map memfd"))?
        };

        Ok(Arc::new(Self {
            name: name.to_string(),
            path: None,
            mmap,
            _file: Some(file),
            origin: Origin::Anonymous,
            len,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when this process owns the backing file's lifetime
    pub fn is_owner(&self) -> bool {
        self.origin == Origin::Created
    }

    /// Base pointer of the mapping.
    ///
    /// The mapping is shared between processes; all mutation goes through
    /// atomics or externally synchronized offsets. Validity ends when the
    /// owning primary tears the segment down.
    pub fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Raw byte view (read-only)
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        if self.origin == Origin::Created {
            if let Some(path) = &self.path {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}
