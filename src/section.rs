//! Lazily-mappable, reference-counted byte providers backed by a file range.
use crate::error::{Error, Result};
use log::{debug, trace, warn};
use std::{
    cell::RefCell,
    fs::File,
    io,
    os::unix::prelude::*,
    path::{Path, PathBuf},
    ptr::{self, NonNull},
    rc::Rc,
};

/// A mapped byte window: the real `mmap()` result, plus the offset within it
/// at which the section's own `[file_offset, file_offset+size)` window
/// begins (mmap only guarantees page-aligned offsets, so `file_offset` is
/// rounded down before mapping and the remainder is skipped over here).
struct Mapping {
    base: NonNull<u8>,
    base_len: usize,
    data_offset: usize,
}

impl Mapping {
    #[inline]
    fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(self.data_offset), self.base_len - self.data_offset) }
    }
}

unsafe fn raw_munmap(base: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { libc::munmap(base.as_ptr() as *mut _, len) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

struct SectionInner {
    filename: PathBuf,
    file_offset: u64,
    size: u64,
    map_count: usize,
    mapping: Option<Mapping>,
}

impl Drop for SectionInner {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            if let Err(e) = unsafe { raw_munmap(mapping.base, mapping.base_len) } {
                warn!("munmap failed while dropping section {:?}: {e}", self.filename);
            }
        }
    }
}

/// A lazily-mappable, reference-counted byte provider backed by
/// `(filename, file_offset, size)`.
///
/// `Section` is a cheap handle: cloning it is `get()`, dropping it is
/// `put()`. The last clone to drop releases the underlying mapping, if any
/// is still held.
#[derive(Clone)]
pub struct Section(Rc<RefCell<SectionInner>>);

impl PartialEq for Section {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Section {}

impl Section {
    /// Constructs a new section with refcount 1, not mapped.
    ///
    /// Rejects `size == 0` with [`Error::Invalid`].
    pub fn make(filename: impl Into<PathBuf>, file_offset: u64, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::Invalid("section size must be non-zero"));
        }
        Ok(Self(Rc::new(RefCell::new(SectionInner {
            filename: filename.into(),
            file_offset,
            size,
            map_count: 0,
            mapping: None,
        }))))
    }

    /// Shares this section, incrementing its refcount (`Section::clone`).
    #[inline]
    pub fn get(&self) -> Self {
        self.clone()
    }

    /// The number of outstanding handles to this section.
    #[inline]
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    #[inline]
    pub fn filename(&self) -> PathBuf {
        self.0.borrow().filename.clone()
    }

    #[inline]
    pub fn file_offset(&self) -> u64 {
        self.0.borrow().file_offset
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.0.borrow().size
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.0.borrow().map_count > 0
    }

    /// Maps the section's byte window, idempotently (nested: a section
    /// mapped twice needs to be unmapped twice before the OS mapping is
    /// released).
    pub fn map(&self) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if inner.map_count > 0 {
            inner.map_count += 1;
            trace!("{:?}: nested map, count now {}", inner.filename, inner.map_count);
            return Ok(());
        }

        let file = File::open(&inner.filename)?;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        let aligned_offset = inner.file_offset - (inner.file_offset % page_size);
        let pad = (inner.file_offset - aligned_offset) as usize;
        let base_len = (inner.size as usize)
            .checked_add(pad)
            .ok_or(Error::NoMem)?;

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                base_len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                aligned_offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let base = match NonNull::new(addr as *mut u8) {
            Some(b) => b,
            None => return Err(Error::Internal("mmap returned a null address")),
        };

        inner.mapping = Some(Mapping { base, base_len, data_offset: pad });
        inner.map_count = 1;
        debug!("{:?}: mapped {} bytes at file offset {}", inner.filename, inner.size, inner.file_offset);
        Ok(())
    }

    /// Inverse of [`Section::map`]. Fails with [`Error::NotMapped`] if the
    /// section isn't currently mapped; otherwise decrements the nested map
    /// count, releasing the OS mapping once it reaches zero.
    pub fn unmap(&self) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if inner.map_count == 0 {
            return Err(Error::NotMapped);
        }
        if inner.map_count > 1 {
            inner.map_count -= 1;
            return Ok(());
        }
        if let Some(mapping) = inner.mapping.take() {
            if let Err(e) = unsafe { raw_munmap(mapping.base, mapping.base_len) } {
                // munmap failed: the OS mapping is still live, so put the
                // handle back rather than losing it. The section remains
                // mapped from the caller's point of view.
                inner.mapping = Some(mapping);
                return Err(e.into());
            }
            debug!("{:?}: unmapped", inner.filename);
        }
        inner.map_count = 0;
        Ok(())
    }

    /// Copies up to `len` bytes from `[file_off, file_off+len)` into `buf`,
    /// truncating at the section's end. `file_off` is an absolute file
    /// offset, not relative to the section's own window.
    ///
    /// Fails with [`Error::NotMapped`] if the section isn't currently
    /// mapped.
    pub fn read_mapped(&self, buf: &mut [u8], len: u16, file_off: u64) -> Result<u16> {
        let inner = self.0.borrow();
        let mapping = inner.mapping.as_ref().ok_or(Error::NotMapped)?;

        let section_end = inner.file_offset + inner.size;
        if file_off < inner.file_offset || file_off >= section_end {
            return Ok(0);
        }
        let avail = section_end - file_off;
        let n = (len as u64).min(avail) as usize;
        let n = n.min(buf.len());
        let rel = (file_off - inner.file_offset) as usize;

        let data = mapping.data();
        buf[..n].copy_from_slice(&data[rel..rel + n]);
        Ok(n as u16)
    }

    /// Builds a new, independent section over a sub-range of `parent`'s file.
    ///
    /// The clone does not share `parent`'s mapped-state: it carries its own
    /// copy of the filename and maps its own OS-level window on demand.
    pub fn clone_subrange(parent: &Section, new_offset: u64, new_size: u64) -> Result<Self> {
        let (filename, lo, hi) = {
            let inner = parent.0.borrow();
            (inner.filename.clone(), inner.file_offset, inner.file_offset + inner.size)
        };
        if new_offset < lo || new_offset.checked_add(new_size).map_or(true, |end| end > hi) {
            return Err(Error::Invalid("clone range is not a subrange of the parent section"));
        }
        Section::make(filename, new_offset, new_size)
    }
}

impl std::fmt::Debug for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("Section")
            .field("filename", &inner.filename)
            .field("file_offset", &inner.file_offset)
            .field("size", &inner.size)
            .field("mapped", &(inner.map_count > 0))
            .finish()
    }
}

#[inline]
pub(crate) fn path_eq(a: &Path, b: &Path) -> bool {
    a == b
}
