use crate::RavelError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Number of 32-bit entries in a page directory or page table.
pub const ENTRIES: usize = 1024;

const PAGE_MASK: u64 = 0xfff;
const LARGE_PAGE_MASK: u64 = 0x3f_ffff;

/// One decoded 32-bit x86 page directory or page table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// Set in a directory entry that maps a 4MiB page directly.
    pub large: bool,
    pub global: bool,
    /// Page frame number: the physical address shifted right by 12.
    pub address: u32,
}

impl From<u32> for PageEntry {
    fn from(raw: u32) -> Self {
        let bit = |n: u32| raw & (1 << n) != 0;
        Self {
            present: bit(0),
            writable: bit(1),
            user: bit(2),
            write_through: bit(3),
            cache_disabled: bit(4),
            accessed: bit(5),
            dirty: bit(6),
            large: bit(7),
            global: bit(8),
            address: raw >> 12,
        }
    }
}

impl PageEntry {
    fn frame(&self) -> u64 {
        (self.address as u64) << 12
    }
}

/// Decoded page tables keyed by their physical address.
///
/// Tables are only read from memory on a miss; a write to the page-table base or an
/// explicit invalidation drops them.
#[derive(Debug, Clone, Default)]
pub struct PageCache {
    tables: HashMap<u64, Arc<[PageEntry]>>,
}

impl PageCache {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    fn table<F>(&mut self, addr: u64, load: &mut F) -> Result<Arc<[PageEntry]>, RavelError>
    where
        F: FnMut(u64) -> Result<Vec<u32>, RavelError>,
    {
        if let Some(t) = self.tables.get(&addr) {
            return Ok(t.clone());
        }
        debug!("page table cache miss at {addr:#x}");
        let table: Arc<[PageEntry]> = load(addr)?.into_iter().map(PageEntry::from).collect();
        self.tables.insert(addr, table.clone());
        Ok(table)
    }

    /// Walks the two-level 32-bit page tables rooted at `cr3`. `load` reads the
    /// [`ENTRIES`] raw entries of the table at a physical address.
    pub fn translate<F>(&mut self, vaddr: u64, cr3: u64, mut load: F) -> Result<u64, RavelError>
    where
        F: FnMut(u64) -> Result<Vec<u32>, RavelError>,
    {
        let fault = RavelError::PageFault { vaddr };
        let directory = self.table(cr3 & !PAGE_MASK, &mut load)?;
        let pde = directory
            .get(((vaddr >> 22) & 0x3ff) as usize)
            .copied()
            .ok_or(RavelError::PageFault { vaddr })?;
        if !pde.present {
            return Err(fault);
        }
        if pde.large {
            let base = ((pde.address & !0x3ff) as u64) << 12;
            return Ok(base | (vaddr & LARGE_PAGE_MASK));
        }
        let table = self.table(pde.frame(), &mut load)?;
        let pte = table
            .get(((vaddr >> 12) & 0x3ff) as usize)
            .copied()
            .ok_or(RavelError::PageFault { vaddr })?;
        if !pte.present {
            return Err(fault);
        }
        Ok(pte.frame() | (vaddr & PAGE_MASK))
    }

    pub fn invalidate_all(&mut self) {
        if !self.tables.is_empty() {
            debug!("dropping {} cached page tables", self.tables.len());
        }
        self.tables.clear();
    }

    /// Drops the page table that maps `vaddr` under the directory at `cr3`. Does nothing
    /// when that directory was never loaded.
    pub fn invalidate_page(&mut self, vaddr: u64, cr3: u64) {
        let Some(directory) = self.tables.get(&(cr3 & !PAGE_MASK)) else {
            return;
        };
        if let Some(pde) = directory.get(((vaddr >> 22) & 0x3ff) as usize) {
            if pde.present && !pde.large {
                let frame = pde.frame();
                self.tables.remove(&frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIR: u64 = 0x1000;
    const TABLE: u64 = 0x2000;

    // vaddr 0x0040_1234 goes through TABLE to frame 0x5000; vaddr 0x0080_0000 and up is a
    // large page at 0x0c00_0000.
    fn tables(addr: u64) -> Result<Vec<u32>, RavelError> {
        let mut t = vec![0u32; ENTRIES];
        match addr {
            DIR => {
                t[1] = TABLE as u32 | 0x3;
                t[2] = 0x0c00_0000 | 0x83;
            }
            TABLE => t[1] = 0x5000 | 0x1,
            _ => panic!("unexpected table {addr:#x}"),
        }
        Ok(t)
    }

    #[test]
    fn decodes_entries() {
        let e = PageEntry::from(0x0000_5067);
        assert!(e.present && e.writable && e.user && e.accessed && e.dirty);
        assert!(!e.large && !e.global);
        assert_eq!(e.address, 5);
    }

    #[test]
    fn walks_small_and_large_pages() {
        let mut cache = PageCache::default();
        assert_eq!(cache.translate(0x0040_1234, DIR, tables).unwrap(), 0x5234);
        assert_eq!(
            cache.translate(0x0081_2345, DIR, tables).unwrap(),
            0x0c01_2345
        );
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn hits_do_not_reload() {
        let mut cache = PageCache::default();
        let mut loads = 0;
        for _ in 0..3 {
            cache
                .translate(0x0040_1000, DIR, |a| {
                    loads += 1;
                    tables(a)
                })
                .unwrap();
        }
        assert_eq!(loads, 2);
    }

    #[test]
    fn missing_entries_fault() {
        let mut cache = PageCache::default();
        assert!(matches!(
            cache.translate(0x0040_2000, DIR, tables),
            Err(RavelError::PageFault { vaddr: 0x0040_2000 })
        ));
        assert!(matches!(
            cache.translate(0x0, DIR, tables),
            Err(RavelError::PageFault { .. })
        ));
    }

    #[test]
    fn invalidation() {
        let mut cache = PageCache::default();
        cache.translate(0x0040_1234, DIR, tables).unwrap();
        cache.invalidate_page(0x0040_1234, DIR);
        assert_eq!(cache.len(), 1);
        // unknown directory is a no-op
        cache.invalidate_page(0x0040_1234, 0x9000);
        assert_eq!(cache.len(), 1);
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
