mod mmu;
#[cfg(test)]
mod tests;
mod zone;

use crate::{Config, RavelError};
use ravel_expr::{Endianness, Expr, ExprError, ExprKind};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use zone::{Piece, Zone};

pub use mmu::{ENTRIES, PageCache, PageEntry};

/// A byte address: an offset either in the absolute space (`base == None`) or relative to
/// a symbolic base such as the initial stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub base: Option<Expr>,
    pub offset: i64,
}

impl Address {
    pub fn absolute(addr: u64) -> Self {
        Self {
            base: None,
            offset: addr as i64,
        }
    }

    pub fn relative(base: Expr, offset: i64) -> Self {
        Self {
            base: Some(base),
            offset,
        }
    }

    /// Classifies an evaluated pointer. `None` means the address cannot be pinned to a
    /// single zone: it is a disjunction or depends on `Top`.
    pub fn from_ptr(ptr: &Expr) -> Option<Self> {
        let (base, disp) = match ptr.kind() {
            ExprKind::Ptr { base, disp, .. } => (*base, *disp),
            _ => ravel_expr::extract_offset(ptr),
        };
        if let Some(v) = base.as_u64() {
            let width = base.size();
            let addr = v.wrapping_add(disp as u64);
            let addr = if width < 64 {
                addr & ((1u64 << width) - 1)
            } else {
                addr
            };
            return Some(Self::absolute(addr));
        }
        if base.is_vec() || base.contains_top() {
            return None;
        }
        Some(Self::relative(base, disp))
    }

    pub fn is_absolute(&self) -> bool {
        self.base.is_none()
    }

    fn end(&self, len: u64) -> Result<i64, RavelError> {
        i64::try_from(len)
            .ok()
            .and_then(|l| self.offset.checked_add(l))
            .ok_or(RavelError::AddressOverflow {
                address: *self,
                len,
            })
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.base {
            None => write!(f, "{:#x}", self.offset as u64),
            Some(base) if self.offset < 0 => write!(f, "{}-{:#x}", base, self.offset.unsigned_abs()),
            Some(base) => write!(f, "{}+{:#x}", base, self.offset),
        }
    }
}

/// A piece of a [`MemoryMap::read_fragments`] result. `offset` is relative to the start of
/// the read; `data` is `None` where nothing was ever written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub offset: u64,
    pub len: u64,
    pub data: Option<Expr>,
}

fn byte_len(size: u32) -> Result<u64, RavelError> {
    if size == 0 || size % 8 != 0 {
        return Err(ExprError::SizeMismatch {
            expected: size.max(8).next_multiple_of(8),
            found: size,
        }
        .into());
    }
    Ok((size / 8) as u64)
}

/// The little-endian form of `data` and the end of the range it covers at `addr`.
fn prepare(addr: &Address, data: &Expr, endian: Endianness) -> Result<(Expr, i64), RavelError> {
    let len = byte_len(data.size())?;
    let end = addr.end(len)?;
    let stored = match endian {
        Endianness::Little => *data,
        Endianness::Big => data.byte_swap()?,
    };
    Ok((stored, end))
}

/// `Vec([a, b])`, or `Top` once it grows past `max` alternatives. Past
/// [`MAX_VEC`](ravel_expr::MAX_VEC) it is `Top` whatever `max` says.
pub(crate) fn disjunction(a: Expr, b: Expr, max: usize) -> Result<Expr, ExprError> {
    let v = Expr::vec([a, b])?;
    if v.alternatives().len() > max {
        debug!("disjunction of {} values exceeds {max}", v.alternatives().len());
        return Ok(Expr::top(v.size()));
    }
    Ok(v)
}

/// The contents of one memory segment.
///
/// Bytes live in zones: the absolute zone and one zone per symbolic base. Zones are shared
/// between clones until one of them writes.
///
/// Every stored object carries the epoch it was written in. A write through a symbolic
/// base may land anywhere outside its own zone, so it opens a new epoch and every older
/// byte of the other zones reads as `Top`, as do their never-written bytes. A write through
/// an unresolved address does the same to every zone.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    segment: Option<Expr>,
    zones: HashMap<Option<Expr>, Arc<Zone>>,
    regions: Vec<(i64, i64)>,
    epoch: u64,
    tainted_at: u64,
    symbolic_writes: HashMap<Expr, u64>,
    read_uninitialized_as_zero: bool,
    max_vec: usize,
    mmu: PageCache,
}

impl MemoryMap {
    pub fn new(config: &Config) -> Self {
        Self::for_segment(None, config)
    }

    /// A map whose never-written relative bytes read as memory references through `segment`.
    pub fn for_segment(segment: Option<Expr>, config: &Config) -> Self {
        Self {
            segment,
            zones: HashMap::new(),
            regions: Vec::new(),
            epoch: 0,
            tainted_at: 0,
            symbolic_writes: HashMap::new(),
            read_uninitialized_as_zero: config.read_uninitialized_as_zero,
            max_vec: config.max_vec,
            mmu: PageCache::default(),
        }
    }

    pub fn segment(&self) -> Option<Expr> {
        self.segment
    }

    /// Whether a write through an unresolved address has made older contents unknown.
    pub fn is_tainted(&self) -> bool {
        self.tainted_at > 0
    }

    /// The epoch before which the bytes of the zone for `base` may have been overwritten
    /// through an aliasing address.
    fn floor(&self, base: Option<Expr>) -> u64 {
        self.symbolic_writes
            .iter()
            .filter(|(b, _)| Some(**b) != base)
            .map(|(_, epoch)| *epoch)
            .fold(self.tainted_at, u64::max)
    }

    pub fn page_cache(&self) -> &PageCache {
        &self.mmu
    }

    pub fn page_cache_mut(&mut self) -> &mut PageCache {
        &mut self.mmu
    }

    /// Marks `[start, start + len)` of the absolute space as mapped.
    pub fn declare(&mut self, start: u64, len: u64) -> Result<(), RavelError> {
        let addr = Address::absolute(start);
        let end = addr.end(len)?;
        self.add_region(addr.offset, end);
        Ok(())
    }

    fn add_region(&mut self, start: i64, end: i64) {
        if start >= end {
            return;
        }
        self.regions.push((start, end));
        self.regions.sort_unstable();
        let mut merged: Vec<(i64, i64)> = Vec::with_capacity(self.regions.len());
        for &(s, e) in &self.regions {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.regions = merged;
    }

    fn is_declared(&self, start: i64, end: i64) -> bool {
        self.regions.iter().any(|&(s, e)| s < end && start < e)
    }

    fn check(&self, addr: &Address, len: u64) -> Result<i64, RavelError> {
        let end = addr.end(len)?;
        if addr.is_absolute() && !self.is_declared(addr.offset, end) {
            return Err(RavelError::MemoryMap { address: *addr });
        }
        Ok(end)
    }

    /// Stores `data` at `addr`, replacing whatever overlapped it. A write relative to a
    /// symbolic base also makes every other zone read as `Top` up to this point.
    pub fn write(&mut self, addr: &Address, data: &Expr, endian: Endianness) -> Result<(), RavelError> {
        let (stored, end) = prepare(addr, data, endian)?;
        if let Some(base) = addr.base {
            if self.zones.keys().any(|b| *b != addr.base) {
                debug!("write through {addr} may alias every other zone");
            }
            self.epoch += 1;
            self.symbolic_writes.insert(base, self.epoch);
        }
        self.place(addr, end, stored)?;
        trace!("{addr} <- {data}");
        Ok(())
    }

    fn place(&mut self, addr: &Address, end: i64, stored: Expr) -> Result<(), RavelError> {
        if addr.is_absolute() {
            self.add_region(addr.offset, end);
        }
        let epoch = self.epoch;
        let zone = self.zones.entry(addr.base).or_insert_with(|| {
            debug!("new memory zone for base {}", Address { offset: 0, ..*addr });
            Arc::new(Zone::default())
        });
        Arc::make_mut(zone).write(addr.offset, stored, epoch)?;
        Ok(())
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<(), RavelError> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.write(
            &Address::absolute(addr),
            &Expr::from_bytes_le(bytes),
            Endianness::Little,
        )
    }

    /// A write that may or may not have happened: afterwards `addr` holds either its old
    /// contents or `data`.
    pub fn write_weak(&mut self, addr: &Address, data: &Expr, endian: Endianness) -> Result<(), RavelError> {
        let old = match self.read(addr, data.size(), endian) {
            Ok(v) => v,
            Err(RavelError::MemoryMap { .. }) => Expr::top(data.size()),
            Err(e) => return Err(e),
        };
        debug!("weak update at {addr}");
        let merged = disjunction(old, *data, self.max_vec)?;
        self.write(addr, &merged, endian)
    }

    /// Records a write through an address nothing is known about. Every byte stored so
    /// far now reads as `Top`.
    pub fn taint(&mut self) {
        self.epoch += 1;
        self.tainted_at = self.epoch;
        warn!("write through an unresolved address, memory contents are now unknown");
    }

    fn pieces(&self, addr: &Address, len: u64) -> Result<Vec<Piece>, RavelError> {
        self.check(addr, len)?;
        let len = len as i64;
        match self.zones.get(&addr.base) {
            Some(zone) => Ok(zone.pieces(addr.offset, len)?),
            None => Ok(vec![Piece {
                start: addr.offset,
                len,
                data: None,
            }]),
        }
    }

    /// What `len` never-written bytes at `start` read as.
    fn unwritten(&self, base: Option<Expr>, start: i64, len: i64, endian: Endianness) -> Expr {
        let size = (len * 8) as u32;
        if self.floor(base) > 0 {
            return Expr::top(size);
        }
        match base {
            Some(b) => Expr::mem_with(&b, size, self.segment, start, endian),
            None if self.read_uninitialized_as_zero => Expr::zero(size),
            None => Expr::top(size),
        }
    }

    fn materialize(&self, base: Option<Expr>, floor: u64, piece: Piece) -> Expr {
        match piece.data {
            Some((data, epoch)) if epoch >= floor => data,
            Some((data, _)) => Expr::top(data.size()),
            None => self.unwritten(base, piece.start, piece.len, Endianness::Little),
        }
    }

    /// Reads `size` bits at `addr`.
    pub fn read(&self, addr: &Address, size: u32, endian: Endianness) -> Result<Expr, RavelError> {
        let len = byte_len(size)?;
        let pieces = self.pieces(addr, len)?;
        if let [Piece { data: None, .. }] = pieces.as_slice() {
            return Ok(self.unwritten(addr.base, addr.offset, len as i64, endian));
        }
        let floor = self.floor(addr.base);
        let value = Expr::composite(
            pieces
                .into_iter()
                .map(|p| self.materialize(addr.base, floor, p)),
        )?;
        Ok(match endian {
            Endianness::Little => value,
            Endianness::Big => value.byte_swap()?,
        })
    }

    /// The stored pieces of `[addr, addr + len)`, little-endian, with `None` for gaps.
    pub fn read_fragments(&self, addr: &Address, len: u64) -> Result<Vec<Fragment>, RavelError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let pieces = self.pieces(addr, len)?;
        let floor = self.floor(addr.base);
        Ok(pieces
            .into_iter()
            .map(|p| Fragment {
                offset: (p.start - addr.offset) as u64,
                len: p.len as u64,
                data: match p.data {
                    Some((data, epoch)) if epoch >= floor => Some(data),
                    Some((data, _)) => Some(Expr::top(data.size())),
                    None => None,
                },
            })
            .collect())
    }

    /// Every stored object with its little-endian contents. Stale objects read as `Top`.
    pub fn objects(&self) -> impl Iterator<Item = (Address, Expr)> + '_ {
        self.stamped_objects().map(|(_, addr, data)| (addr, data))
    }

    /// [`MemoryMap::objects`] with the epoch each object was written in.
    pub(crate) fn stamped_objects(&self) -> impl Iterator<Item = (u64, Address, Expr)> + '_ {
        self.zones.iter().flat_map(move |(base, zone)| {
            let floor = self.floor(*base);
            zone.objects().map(move |o| {
                let data = if o.epoch < floor {
                    Expr::top(o.data.size())
                } else {
                    o.data
                };
                let addr = Address {
                    base: *base,
                    offset: o.vaddr,
                };
                (o.epoch, addr, data)
            })
        })
    }

    /// Merges `other` into `self`. Every byte either side has written is rewritten with
    /// `merge(mine, theirs)` wherever the two disagree, and whatever either side lost to an
    /// aliasing write stays lost.
    pub fn join<F>(&mut self, other: &MemoryMap, mut merge: F) -> Result<(), RavelError>
    where
        F: FnMut(Expr, Expr) -> Result<Expr, RavelError>,
    {
        let read_or_top = |m: &MemoryMap, a: &Address, size: u32| match m.read(a, size, Endianness::Little) {
            Ok(v) => Ok(v),
            Err(RavelError::MemoryMap { .. }) => Ok(Expr::top(size)),
            Err(e) => Err(e),
        };
        let spans: Vec<(Address, u32)> = self
            .objects()
            .chain(other.objects())
            .map(|(a, d)| (a, d.size()))
            .collect();
        let mut merged = Vec::with_capacity(spans.len());
        for (addr, size) in spans {
            let mine = read_or_top(self, &addr, size)?;
            let theirs = read_or_top(other, &addr, size)?;
            let value = if mine == theirs {
                mine
            } else {
                merge(mine, theirs)?
            };
            merged.push((addr, value));
        }
        // the two epoch counters are unrelated after a clone, so every merged object is
        // restamped past both
        self.epoch = self.epoch.max(other.epoch);
        self.tainted_at = self.tainted_at.max(other.tainted_at);
        for (base, &epoch) in &other.symbolic_writes {
            let slot = self.symbolic_writes.entry(*base).or_default();
            *slot = (*slot).max(epoch);
        }
        for &(s, e) in &other.regions {
            self.add_region(s, e);
        }
        for (addr, value) in merged {
            let (stored, end) = prepare(&addr, &value, Endianness::Little)?;
            self.place(&addr, end, stored)?;
        }
        Ok(())
    }

    /// Translates a virtual address through the 32-bit page tables rooted at `cr3`.
    pub fn translate(&mut self, vaddr: u64, cr3: u64) -> Result<u64, RavelError> {
        let mut mmu = std::mem::take(&mut self.mmu);
        let result = mmu.translate(vaddr, cr3, |table| self.read_table(table));
        self.mmu = mmu;
        result
    }

    fn read_table(&self, table: u64) -> Result<Vec<u32>, RavelError> {
        (0..ENTRIES as u64)
            .map(|i| {
                let entry = self.read(&Address::absolute(table + 4 * i), 32, Endianness::Little)?;
                entry
                    .as_u64()
                    .map(|v| v as u32)
                    .ok_or(RavelError::SymbolicAddress(entry))
            })
            .collect()
    }

    /// Emulates `invlpg`.
    pub fn invalidate_page(&mut self, vaddr: u64, cr3: u64) {
        self.mmu.invalidate_page(vaddr, cr3);
    }
}
