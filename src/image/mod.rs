//! The image: an ordered set of mapped sections modeling one or more traced
//! address spaces, with overlap-resolving insertion and a demand-mapping
//! LRU cache.
mod list;

use crate::asid::Asid;
use crate::callback::ReadMemoryFn;
use crate::error::{Error, Result};
use crate::msec::MappedSection;
use crate::section::{path_eq, Section};
use list::{Entry, EntryList};
use log::{debug, trace, warn};
use std::path::{Path, PathBuf};

/// Default cache capacity, per the spec.
pub const DEFAULT_CAPACITY: u16 = 10;

/// A container of mapped sections modeling one or more traced address
/// spaces.
///
/// `Image` exclusively owns its entries; each entry shares its [`Section`]
/// via refcount. Reads are served from a demand-mapping cache, bounded by
/// `capacity`, with LRU-style promotion (see `read`).
pub struct Image {
    name: Option<String>,
    entries: EntryList,
    capacity: u16,
    resident: u16,
    callback: Option<ReadMemoryFn>,
}

impl Image {
    /// Creates an empty image with the default cache capacity (10).
    pub fn new(name: Option<String>) -> Self {
        Self::with_capacity(name, DEFAULT_CAPACITY)
    }

    /// Creates an empty image with an explicit cache capacity.
    ///
    /// `capacity == 0` is legal and disables the residency cache entirely:
    /// every cold read maps, reads, and immediately unmaps again.
    pub fn with_capacity(name: Option<String>, capacity: u16) -> Self {
        Self { name, entries: EntryList::new(), capacity, resident: 0, callback: None }
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Current residency `R`: the number of entries with an active mapping.
    #[inline]
    pub fn resident(&self) -> u16 {
        self.resident
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }

    /// Changes the cache capacity, pruning immediately if the new capacity
    /// is lower than current residency.
    pub fn set_capacity(&mut self, capacity: u16) -> Result<()> {
        self.capacity = capacity;
        if self.resident > self.capacity {
            self.prune()
        } else {
            Ok(())
        }
    }

    /// Installs (or clears, with `None`) the fallback read callback.
    pub fn set_callback(&mut self, callback: Option<ReadMemoryFn>) {
        self.callback = callback;
    }

    /// Inserts `section` at `vaddr` within `asid`, resolving overlaps with
    /// existing entries by cutting/splitting/replacing them.
    ///
    /// Transactional: on any failure the image is left exactly as it was
    /// before the call.
    pub fn add(&mut self, section: &Section, asid: Asid, vaddr: u64) -> Result<()> {
        let end = vaddr
            .checked_add(section.size())
            .ok_or(Error::Invalid("vaddr + section size overflows"))?;
        let new_filename = section.filename();

        let mut pending = vec![Entry { msec: MappedSection::new(section.get(), asid, vaddr), mapped: false }];
        let mut removed: Vec<Entry> = Vec::new();

        for idx in self.entries.indices() {
            let (e_begin, e_end, e_mapped, e_asid_matches) = {
                let e = self.entries.get(idx);
                (e.msec.begin(), e.msec.end(), e.mapped, e.msec.matches_asid(&asid))
            };
            if !e_asid_matches {
                continue;
            }
            if e_end <= vaddr || end <= e_begin {
                continue;
            }

            if e_begin == vaddr && e_end == end && pending.len() == 1 && removed.is_empty() {
                let same_file = path_eq(&self.entries.get(idx).msec.section().filename(), &new_filename);
                if same_file {
                    trace!("add: identical overlap at {vaddr:#x}, deduping");
                    return Ok(());
                }
            }

            let mut entry = self.entries.remove(idx);
            if e_mapped {
                if let Err(e) = entry.msec.section().unmap() {
                    warn!("add: ignoring unmap failure on entry queued for removal: {e}");
                }
                entry.mapped = false;
                self.resident = self.resident.saturating_sub(1);
            }

            if e_begin < vaddr {
                match Section::clone_subrange(entry.msec.section(), entry.msec.section().file_offset(), vaddr - e_begin) {
                    Ok(left) => pending.push(Entry {
                        msec: MappedSection::new(left, *entry.msec.asid(), e_begin),
                        mapped: false,
                    }),
                    Err(err) => {
                        removed.push(entry);
                        self.rollback(pending, removed);
                        return Err(err);
                    }
                }
            }
            if end < e_end {
                let right_offset = entry.msec.section().file_offset() + (end - e_begin);
                match Section::clone_subrange(entry.msec.section(), right_offset, e_end - end) {
                    Ok(right) => pending.push(Entry {
                        msec: MappedSection::new(right, *entry.msec.asid(), end),
                        mapped: false,
                    }),
                    Err(err) => {
                        removed.push(entry);
                        self.rollback(pending, removed);
                        return Err(err);
                    }
                }
            }

            removed.push(entry);
        }

        drop(removed);
        debug!("add: inserting {} entr{} at {vaddr:#x}..{end:#x}", pending.len(), if pending.len() == 1 { "y" } else { "ies" });
        for entry in pending {
            self.entries.push_back(entry);
        }
        Ok(())
    }

    fn rollback(&mut self, pending: Vec<Entry>, removed: Vec<Entry>) {
        drop(pending);
        for entry in removed {
            self.entries.push_back(entry);
        }
    }

    /// Convenience: constructs a section over `path` and adds it.
    pub fn add_file(&mut self, path: impl Into<PathBuf>, file_offset: u64, size: u64, asid: Asid, vaddr: u64) -> Result<()> {
        let section = Section::make(path, file_offset, size)?;
        self.add(&section, asid, vaddr)
    }

    /// Removes the first entry whose section, vaddr, and ASID (under the
    /// wildcard relation) all match. `Err(Error::BadImage)` if none match.
    pub fn remove(&mut self, section: &Section, asid: Asid, vaddr: u64) -> Result<()> {
        for idx in self.entries.indices() {
            let e = self.entries.get(idx);
            if e.msec.section() == section && e.msec.vaddr() == vaddr && e.msec.matches_asid(&asid) {
                let entry = self.entries.remove(idx);
                self.release_entry(entry);
                return Ok(());
            }
        }
        Err(Error::BadImage)
    }

    /// Removes every entry whose filename matches and whose ASID is
    /// compatible with `asid`. Returns the number removed.
    pub fn remove_by_filename(&mut self, filename: &Path, asid: Asid) -> Result<u32> {
        let mut count = 0u32;
        for idx in self.entries.indices() {
            let matches = {
                let e = self.entries.get(idx);
                e.msec.matches_asid(&asid) && path_eq(&e.msec.section().filename(), filename)
            };
            if matches {
                let entry = self.entries.remove(idx);
                self.release_entry(entry);
                count += 1;
            }
        }
        Ok(count)
    }

    /// Removes every entry whose ASID is compatible with `asid`. Returns the
    /// number removed.
    pub fn remove_by_asid(&mut self, asid: Asid) -> Result<u32> {
        let mut count = 0u32;
        for idx in self.entries.indices() {
            let matches = self.entries.get(idx).msec.matches_asid(&asid);
            if matches {
                let entry = self.entries.remove(idx);
                self.release_entry(entry);
                count += 1;
            }
        }
        Ok(count)
    }

    fn release_entry(&mut self, mut entry: Entry) {
        if entry.mapped {
            if let Err(e) = entry.msec.section().unmap() {
                warn!("release: unmap failed: {e}");
            }
            entry.mapped = false;
            self.resident = self.resident.saturating_sub(1);
        }
    }

    /// Reads `len` bytes at virtual address `addr` within `asid`.
    ///
    /// Tries already-mapped entries first (phase A), then demand-maps
    /// further entries (phase B, promoting and pruning as needed), then
    /// falls back to the user callback (phase C). `Err(Error::NoMap)` if
    /// nothing answers.
    pub fn read(&mut self, buf: &mut [u8], len: u16, asid: Asid, addr: u64) -> Result<u16> {
        let mut cur = self.entries.head();

        // Phase A: hot scan.
        while let Some(idx) = cur {
            if !self.entries.get(idx).mapped {
                break;
            }
            let next = self.entries.next(idx);
            let result = self.entries.get(idx).msec.read_mapped(buf, len, &asid, addr);
            if let Ok(n) = result {
                trace!("read: hot hit at {addr:#x}");
                self.entries.move_to_front(idx);
                return Ok(n);
            }
            cur = next;
        }

        // Phase B: cold scan, demand-mapping as we go.
        while let Some(idx) = cur {
            let next = self.entries.next(idx);
            let was_mapped = self.entries.get(idx).mapped;
            if !was_mapped {
                let section = self.entries.get(idx).msec.section().clone();
                if let Err(e) = section.map() {
                    warn!("read: map failed for a cold entry, skipping it: {e}");
                    cur = next;
                    continue;
                }
            }

            let result = self.entries.get(idx).msec.read_mapped(buf, len, &asid, addr);
            match result {
                Ok(n) => {
                    trace!("read: cold hit at {addr:#x}");
                    self.entries.move_to_front(idx);
                    if !was_mapped {
                        if self.capacity == 0 {
                            let section = self.entries.get(idx).msec.section().clone();
                            if let Err(e) = section.unmap() {
                                warn!("read: unmap of uncached entry failed: {e}");
                            }
                        } else {
                            self.entries.get_mut(idx).mapped = true;
                            self.resident += 1;
                            if self.resident > self.capacity {
                                if let Err(e) = self.prune() {
                                    warn!("read: prune after demand-map failed, continuing: {e}");
                                }
                            }
                        }
                    }
                    return Ok(n);
                }
                Err(_) => {
                    if !was_mapped {
                        let section = self.entries.get(idx).msec.section().clone();
                        if let Err(e) = section.unmap() {
                            warn!("read: unmap of speculative map failed: {e}");
                        }
                    }
                    cur = next;
                }
            }
        }

        // Phase C: callback fallback.
        if let Some(callback) = self.callback.as_mut() {
            return callback(buf, len, &asid, addr);
        }
        Err(Error::NoMap)
    }

    /// Opportunistically restores `resident <= capacity`, unmapping the
    /// least-recently-used mapped entries first. Unmap failures are
    /// remembered (the first one is returned) but don't stop the pass.
    fn prune(&mut self) -> Result<()> {
        let mut first_err = None;
        let mut seen = 0u16;
        let mut to_unmap = Vec::new();

        for idx in self.entries.indices() {
            if self.entries.get(idx).mapped {
                seen += 1;
                if seen > self.capacity {
                    to_unmap.push(idx);
                }
            }
        }

        for idx in to_unmap {
            let section = self.entries.get(idx).msec.section().clone();
            if let Err(e) = section.unmap() {
                warn!("prune: unmap failed, continuing: {e}");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            self.entries.get_mut(idx).mapped = false;
            self.resident = self.resident.saturating_sub(1);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Copies every entry of `src` into `self` via [`Image::add`]. Returns
    /// the number of entries that failed to add; never fails as a whole.
    pub fn copy(&mut self, src: &Image) -> Result<u32> {
        let mut n_failed = 0u32;
        for idx in src.entries.indices() {
            let e = src.entries.get(idx);
            if self.add(e.msec.section(), *e.msec.asid(), e.msec.vaddr()).is_err() {
                n_failed += 1;
            }
        }
        Ok(n_failed)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        for idx in self.entries.indices() {
            if self.entries.get(idx).mapped {
                if let Err(e) = self.entries.get(idx).msec.section().unmap() {
                    warn!("image teardown: unmap failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("trace-image-itest-{}-{name}", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    fn has_region(img: &Image, filename: &Path, file_offset: u64, size: u64, vaddr: u64) -> bool {
        img.entries.indices().into_iter().any(|idx| {
            let e = img.entries.get(idx);
            path_eq(&e.msec.section().filename(), filename)
                && e.msec.section().file_offset() == file_offset
                && e.msec.section().size() == size
                && e.msec.vaddr() == vaddr
        })
    }

    #[test]
    fn overlap_split_produces_three_entries() {
        let a = temp_file("a", &vec![0u8; 0x1000]);
        let b = temp_file("b", &vec![0u8; 0x100]);
        let mut img = Image::new(None);

        img.add_file(&a, 0, 0x1000, Asid::any(), 0x10000).unwrap();
        img.add_file(&b, 0, 0x100, Asid::any(), 0x10400).unwrap();

        assert_eq!(img.len(), 3);
        assert!(has_region(&img, &a, 0, 0x400, 0x10000));
        assert!(has_region(&img, &b, 0, 0x100, 0x10400));
        assert!(has_region(&img, &a, 0x500, 0xB00, 0x10500));

        let _ = std::fs::remove_file(&a);
        let _ = std::fs::remove_file(&b);
    }

    #[test]
    fn identical_overlap_deduplicates() {
        let a = temp_file("dedup", &vec![1u8; 0x100]);
        let mut img = Image::new(None);

        img.add_file(&a, 0, 0x100, Asid::any(), 0).unwrap();
        img.add_file(&a, 0, 0x100, Asid::any(), 0).unwrap();

        assert_eq!(img.len(), 1);
        let _ = std::fs::remove_file(&a);
    }

    #[test]
    fn asid_isolation_keeps_both_entries_and_routes_reads() {
        let a_path = temp_file("asid-a", &[0xAAu8; 0x10]);
        let b_path = temp_file("asid-b", &[0xBBu8; 0x10]);
        let mut img = Image::new(None);

        let asid0 = Asid::new(1, 0);
        let asid1 = Asid::new(2, 0);
        img.add_file(&a_path, 0, 0x10, asid0, 0).unwrap();
        img.add_file(&b_path, 0, 0x10, asid1, 0).unwrap();
        assert_eq!(img.len(), 2);

        let mut buf = [0u8; 4];
        assert_eq!(img.read(&mut buf, 4, asid0, 0).unwrap(), 4);
        assert_eq!(buf, [0xAA; 4]);

        let mut buf = [0u8; 4];
        assert_eq!(img.read(&mut buf, 4, asid1, 0).unwrap(), 4);
        assert_eq!(buf, [0xBB; 4]);

        let _ = std::fs::remove_file(&a_path);
        let _ = std::fs::remove_file(&b_path);
    }

    #[test]
    fn lru_promotion_and_prune_evicts_oldest() {
        let s0 = temp_file("lru0", &[0u8; 16]);
        let s1 = temp_file("lru1", &[1u8; 16]);
        let s2 = temp_file("lru2", &[2u8; 16]);
        let mut img = Image::with_capacity(None, 2);

        img.add_file(&s0, 0, 16, Asid::any(), 0x1000).unwrap();
        img.add_file(&s1, 0, 16, Asid::any(), 0x2000).unwrap();
        img.add_file(&s2, 0, 16, Asid::any(), 0x3000).unwrap();

        let mut buf = [0u8; 4];
        img.read(&mut buf, 4, Asid::any(), 0x1000).unwrap();
        img.read(&mut buf, 4, Asid::any(), 0x2000).unwrap();
        img.read(&mut buf, 4, Asid::any(), 0x3000).unwrap();

        // s0 was the oldest residency and got pruned when s2 pushed R past
        // capacity; reading it again still succeeds, just demand-mapped
        // from scratch.
        assert_eq!(img.resident(), 2);
        let mut buf = [0u8; 4];
        assert_eq!(img.read(&mut buf, 4, Asid::any(), 0x1000).unwrap(), 4);

        let _ = std::fs::remove_file(&s0);
        let _ = std::fs::remove_file(&s1);
        let _ = std::fs::remove_file(&s2);
    }

    #[test]
    fn cold_scan_skips_entries_whose_backing_file_is_gone() {
        // Exercises the trace/warn logging from §10 under RUST_LOG=trace;
        // harmless if a logger is already installed elsewhere in the run.
        let _ = env_logger::try_init();

        let gone = temp_file("gone", &[0u8; 16]);
        let healthy = temp_file("healthy", &[0x42u8; 16]);
        let mut img = Image::new(None);

        img.add_file(&gone, 0, 16, Asid::any(), 0x1000).unwrap();
        img.add_file(&healthy, 0, 16, Asid::any(), 0x2000).unwrap();
        std::fs::remove_file(&gone).unwrap();

        let mut buf = [0u8; 4];
        let n = img.read(&mut buf, 4, Asid::any(), 0x2000).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [0x42; 4]);

        let _ = std::fs::remove_file(&healthy);
    }

    #[test]
    fn callback_fallback_answers_unmapped_addresses() {
        let mut img = Image::new(None);
        img.set_callback(Some(Box::new(|buf, _len, _asid, _addr| {
            buf[0] = 0xAB;
            Ok(1)
        })));

        let mut buf = [0u8; 4];
        let n = img.read(&mut buf, 4, Asid::any(), 0x1234).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], 0xAB);
    }

    #[test]
    fn read_with_no_callback_and_no_section_is_no_map() {
        let mut img = Image::new(None);
        let mut buf = [0u8; 4];
        assert!(matches!(img.read(&mut buf, 4, Asid::any(), 0x1234), Err(Error::NoMap)));
    }

    #[test]
    fn rollback_restores_removed_entries_and_discards_pending() {
        let a = temp_file("rollback-a", &vec![0u8; 0x100]);
        let b = temp_file("rollback-b", &vec![0u8; 0x10]);
        let mut img = Image::new(None);
        img.add_file(&a, 0, 0x100, Asid::any(), 0x1000).unwrap();

        let removed_entry = img.entries.remove(img.entries.head().unwrap());
        let pending_entry = Entry {
            msec: MappedSection::new(Section::make(&b, 0, 0x10).unwrap(), Asid::any(), 0x2000),
            mapped: false,
        };

        img.rollback(vec![pending_entry], vec![removed_entry]);

        assert_eq!(img.len(), 1, "pending must be discarded and removed must be restored");
        assert!(has_region(&img, &a, 0, 0x100, 0x1000));

        let _ = std::fs::remove_file(&a);
        let _ = std::fs::remove_file(&b);
    }

    #[test]
    fn overlap_in_different_asid_does_not_split() {
        let a = temp_file("diff-asid", &vec![0u8; 0x1000]);
        let mut img = Image::new(None);

        img.add_file(&a, 0, 0x1000, Asid::new(1, 1), 0x10000).unwrap();
        img.add_file(&a, 0, 0x100, Asid::new(2, 2), 0x10400).unwrap();

        assert_eq!(img.len(), 2, "overlapping ranges in different address spaces coexist untouched");
        let _ = std::fs::remove_file(&a);
    }

    #[test]
    fn remove_by_vaddr_round_trips() {
        let a = temp_file("roundtrip", &vec![0u8; 0x100]);
        let mut img = Image::new(None);
        let section = Section::make(&a, 0, 0x100).unwrap();

        img.add(&section, Asid::any(), 0x5000).unwrap();
        assert_eq!(img.len(), 1);
        img.remove(&section, Asid::any(), 0x5000).unwrap();
        assert_eq!(img.len(), 0);

        assert!(matches!(img.remove(&section, Asid::any(), 0x5000), Err(Error::BadImage)));
        let _ = std::fs::remove_file(&a);
    }

    #[test]
    fn remove_by_filename_removes_all_matching_entries() {
        let a = temp_file("by-filename", &vec![0u8; 0x1000]);
        let mut img = Image::new(None);
        img.add_file(&a, 0, 0x1000, Asid::any(), 0x10000).unwrap();
        img.add_file(&a, 0, 0x100, Asid::any(), 0x20000).unwrap();

        assert_eq!(img.len(), 2);
        let removed = img.remove_by_filename(&a, Asid::any()).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(img.len(), 0);
        let _ = std::fs::remove_file(&a);
    }

    #[test]
    fn remove_by_asid_scopes_to_matching_address_spaces() {
        let a = temp_file("by-asid-a", &vec![0u8; 0x100]);
        let b = temp_file("by-asid-b", &vec![0u8; 0x100]);
        let mut img = Image::new(None);
        img.add_file(&a, 0, 0x100, Asid::new(1, 1), 0).unwrap();
        img.add_file(&b, 0, 0x100, Asid::new(2, 2), 0x1000).unwrap();

        let removed = img.remove_by_asid(Asid::new(1, 1)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(img.len(), 1);

        let _ = std::fs::remove_file(&a);
        let _ = std::fs::remove_file(&b);
    }

    #[test]
    fn copy_counts_failures_without_failing_as_a_whole() {
        let a = temp_file("copy-a", &vec![0u8; 0x100]);
        let b = temp_file("copy-b", &vec![0u8; 0x100]);
        let mut src = Image::new(None);
        src.add_file(&a, 0, 0x100, Asid::any(), 0).unwrap();
        src.add_file(&b, 0, 0x100, Asid::any(), 0x1000).unwrap();

        let mut dst = Image::new(None);
        let n_failed = dst.copy(&src).unwrap();
        assert_eq!(n_failed, 0);
        assert_eq!(dst.len(), 2);

        let _ = std::fs::remove_file(&a);
        let _ = std::fs::remove_file(&b);
    }

    #[test]
    fn set_capacity_to_zero_disables_caching() {
        let a = temp_file("nocache", &vec![7u8; 16]);
        let mut img = Image::with_capacity(None, 0);
        img.add_file(&a, 0, 16, Asid::any(), 0x9000).unwrap();

        let mut buf = [0u8; 4];
        let n = img.read(&mut buf, 4, Asid::any(), 0x9000).unwrap();
        assert_eq!(n, 4);
        assert_eq!(img.resident(), 0, "capacity 0 must never hold residency");

        let _ = std::fs::remove_file(&a);
    }

    #[test]
    fn lowering_capacity_prunes_immediately() {
        let s0 = temp_file("shrink0", &[0u8; 16]);
        let s1 = temp_file("shrink1", &[1u8; 16]);
        let mut img = Image::with_capacity(None, 2);
        img.add_file(&s0, 0, 16, Asid::any(), 0x1000).unwrap();
        img.add_file(&s1, 0, 16, Asid::any(), 0x2000).unwrap();

        let mut buf = [0u8; 4];
        img.read(&mut buf, 4, Asid::any(), 0x1000).unwrap();
        img.read(&mut buf, 4, Asid::any(), 0x2000).unwrap();
        assert_eq!(img.resident(), 2);

        img.set_capacity(1).unwrap();
        assert_eq!(img.resident(), 1);

        let _ = std::fs::remove_file(&s0);
        let _ = std::fs::remove_file(&s1);
    }
}
