mod location_map;

use crate::location::Location;
use crate::memory::{Address, MemoryMap, disjunction};
use crate::{ArchInfo, Config, RavelError, StubTable};
use itertools::Itertools;
use ravel_expr::{Endianness, Expr, ExprError, ExprKind, RegKind, Register};
use std::collections::{BTreeMap, HashMap};
use tracing::{instrument, trace, warn};

pub use location_map::LocationMap;

/// How [`Mapper::join`] reconciles two different values for the same location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeBehavior {
    /// Keep both as a bounded disjunction.
    #[default]
    Vec,
    /// Forget the value.
    Top,
}

/// A location whose address has been evaluated and is ready to be written.
#[derive(Debug, Clone)]
enum Target {
    Reg(Register),
    Slice {
        base: Box<Target>,
        pos: u32,
        size: u32,
    },
    Mem {
        seg: Option<Expr>,
        addr: Address,
        size: u32,
        endian: Endianness,
    },
    Weak {
        seg: Option<Expr>,
        addrs: Vec<Address>,
        size: u32,
        endian: Endianness,
    },
    Unresolved {
        seg: Option<Expr>,
        size: u32,
    },
}

/// Splits a memory pointer into its segment and its address within the segment.
fn split_segment(ptr: &Expr) -> (Option<Expr>, Expr) {
    match ptr.kind() {
        ExprKind::Ptr { base, seg, disp } => (*seg, Expr::ptr(*base, None, *disp)),
        _ => (None, *ptr),
    }
}

/// The addresses an evaluated pointer may denote. `None` when nothing is known.
fn addresses(ptr: &Expr) -> Option<Vec<Address>> {
    let (base, disp) = match ptr.kind() {
        ExprKind::Ptr { base, disp, .. } => (*base, *disp),
        _ => (*ptr, 0),
    };
    match base.kind() {
        ExprKind::Vec {
            alternatives,
            widened: false,
        } => alternatives
            .iter()
            .map(|b| Address::from_ptr(&Expr::ptr(*b, None, disp)))
            .collect(),
        _ => Address::from_ptr(ptr).map(|a| vec![a]),
    }
}

/// A functional machine state: what every register and memory byte holds, as expressions
/// over the initial state.
///
/// Unbound registers read as themselves and never-written relative memory reads as the
/// initial memory reference, so a fresh mapper is the identity.
#[derive(Debug, Clone)]
pub struct Mapper {
    arch: ArchInfo,
    config: Config,
    registers: LocationMap<Expr>,
    memory: HashMap<Option<Expr>, MemoryMap>,
    stubs: StubTable,
}

impl Mapper {
    pub fn new(arch: ArchInfo, config: Config) -> Self {
        Self {
            arch,
            config,
            registers: LocationMap::new(),
            memory: HashMap::new(),
            stubs: StubTable::default(),
        }
    }

    pub fn arch(&self) -> &ArchInfo {
        &self.arch
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stubs(&self) -> &StubTable {
        &self.stubs
    }

    pub fn register_stub<S, F>(&mut self, name: S, stub: F)
    where
        S: Into<String>,
        F: Fn(&str, u32) -> Option<Expr> + Send + Sync + 'static,
    {
        self.stubs.register(name, stub);
    }

    /// The memory of segment `seg`; `None` is the flat default space.
    pub fn memory(&self, seg: Option<Expr>) -> Option<&MemoryMap> {
        self.memory.get(&seg)
    }

    pub fn memory_mut(&mut self, seg: Option<Expr>) -> &mut MemoryMap {
        let config = &self.config;
        self.memory
            .entry(seg)
            .or_insert_with(|| MemoryMap::for_segment(seg, config))
    }

    /// Marks an absolute range of the default space as mapped.
    pub fn declare(&mut self, start: u64, len: u64) -> Result<(), RavelError> {
        self.memory_mut(None).declare(start, len)
    }

    /// Stores concrete bytes in the default space, e.g. a loaded binary image.
    pub fn load_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<(), RavelError> {
        self.memory_mut(None).write_bytes(addr, bytes)
    }

    /// A memory reference of `size` bits at `ptr` in the configured byte order.
    pub fn mem(&self, ptr: &Expr, size: u32) -> Expr {
        Expr::mem_with(ptr, size, None, 0, self.config.endianness)
    }

    /// The declared form of `reg`, carrying its kind.
    fn canonical(&self, reg: &Register) -> Register {
        match self.arch.declared(&reg.name) {
            Some(r) if r.size == reg.size => r.clone(),
            _ => reg.clone(),
        }
    }

    /// The value bound to `reg`, if it has been written.
    pub fn get(&self, reg: &Register) -> Option<Expr> {
        self.registers.get(self.canonical(reg)).copied()
    }

    /// Evaluates `expr` in this state: registers, memory references and external symbols
    /// are replaced by what the state holds for them, and the result is re-simplified.
    pub fn read(&self, expr: &Expr) -> Result<Expr, RavelError> {
        expr.try_rebuild(&mut |e: &Expr| -> Result<Option<Expr>, RavelError> {
            match e.kind() {
                ExprKind::Reg(r) => Ok(Some(self.get(r).unwrap_or(*e))),
                ExprKind::Mem { ptr, size, endian } => self.load(ptr, *size, *endian).map(Some),
                ExprKind::Ext { name, size } => Ok(self.stubs.resolve(name, *size)),
                _ => Ok(None),
            }
        })
    }

    fn load(&self, ptr: &Expr, size: u32, endian: Endianness) -> Result<Expr, RavelError> {
        let (seg, addr) = split_segment(ptr);
        let addr = self.read(&addr)?;
        let Some(addrs) = addresses(&addr) else {
            return Ok(Expr::top(size));
        };
        let fresh;
        let map = match self.memory.get(&seg) {
            Some(m) => m,
            None => {
                fresh = MemoryMap::for_segment(seg, &self.config);
                &fresh
            }
        };
        let values = addrs
            .iter()
            .map(|a| map.read(a, size, endian))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Expr::vec(values)?)
    }

    fn read_target(&self, target: &Target) -> Result<Expr, RavelError> {
        match target {
            Target::Reg(r) => Ok(self
                .registers
                .get(r)
                .copied()
                .unwrap_or_else(|| Expr::register(r.clone()))),
            Target::Slice { base, pos, size } => Ok(self.read_target(base)?.slice(*pos, *size)?),
            Target::Mem {
                seg,
                addr,
                size,
                endian,
            } => self.read_mem_or_top(*seg, addr, *size, *endian),
            Target::Weak {
                seg,
                addrs,
                size,
                endian,
            } => {
                let values = addrs
                    .iter()
                    .map(|a| self.read_mem_or_top(*seg, a, *size, *endian))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Expr::vec(values)?)
            }
            Target::Unresolved { size, .. } => Ok(Expr::top(*size)),
        }
    }

    fn read_mem_or_top(
        &self,
        seg: Option<Expr>,
        addr: &Address,
        size: u32,
        endian: Endianness,
    ) -> Result<Expr, RavelError> {
        let result = match self.memory.get(&seg) {
            Some(m) => m.read(addr, size, endian),
            None => MemoryMap::for_segment(seg, &self.config).read(addr, size, endian),
        };
        match result {
            Err(RavelError::MemoryMap { .. }) => Ok(Expr::top(size)),
            r => r,
        }
    }

    fn resolve_mem(&self, ptr: &Expr, size: u32, endian: Endianness) -> Result<Target, RavelError> {
        let (seg, addr) = split_segment(ptr);
        let addr = self.read(&addr)?;
        Ok(match addresses(&addr) {
            Some(mut addrs) if addrs.len() == 1 => Target::Mem {
                seg,
                addr: addrs.remove(0),
                size,
                endian,
            },
            Some(addrs) => Target::Weak {
                seg,
                addrs,
                size,
                endian,
            },
            None => Target::Unresolved { seg, size },
        })
    }

    /// Evaluates the address part of a location, pairing each resulting target with the
    /// part of `value` it receives.
    fn resolve(&self, loc: &Location, value: Expr, out: &mut Vec<(Target, Expr)>) -> Result<(), RavelError> {
        if let Some(size) = loc.size() {
            if size != value.size() {
                return Err(ExprError::SizeMismatch {
                    expected: size,
                    found: value.size(),
                }
                .into());
            }
        }
        match loc {
            Location::Composite(parts) => {
                let mut pos = 0;
                for part in parts {
                    let size = part.size().unwrap_or_default();
                    self.resolve(part, value.slice(pos, size)?, out)?;
                    pos += size;
                }
            }
            _ => out.push((self.resolve_target(loc, value.size())?, value)),
        }
        Ok(())
    }

    fn resolve_target(&self, loc: &Location, size: u32) -> Result<Target, RavelError> {
        match loc {
            Location::Reg(r) => Ok(Target::Reg(self.canonical(r))),
            Location::Slice { base, pos, size } => {
                let base_size = base.size().unwrap_or(*size);
                Ok(Target::Slice {
                    base: Box::new(self.resolve_target(base, base_size)?),
                    pos: *pos,
                    size: *size,
                })
            }
            Location::Mem { ptr, size, endian } => self.resolve_mem(ptr, *size, *endian),
            Location::Ptr(ptr) => self.resolve_mem(ptr, size, self.config.endianness),
            Location::Composite(_) => Err(RavelError::NotALocation(loc.to_expr()?)),
        }
    }

    /// Applies the complexity limit to a value about to be stored.
    fn bounded(&self, value: Expr) -> Expr {
        match self.config.complexity {
            Some(limit) if value.depth() > limit => {
                warn!("value deeper than {limit} replaced by top");
                Expr::top(value.size())
            }
            _ => value,
        }
    }

    fn commit(&mut self, target: &Target, value: Expr) -> Result<(), RavelError> {
        match target {
            Target::Reg(r) => {
                trace!("{} <- {}", r.name, value);
                if r.kind == RegKind::PageTableBase {
                    for m in self.memory.values_mut() {
                        m.page_cache_mut().invalidate_all();
                    }
                }
                self.registers.insert(r.clone(), value);
                Ok(())
            }
            Target::Slice { base, pos, .. } => {
                let current = self.read_target(base)?;
                let spliced = current.splice(*pos, &value)?;
                self.commit(base, spliced)
            }
            Target::Mem {
                seg, addr, endian, ..
            } => self.memory_mut(*seg).write(addr, &value, *endian),
            Target::Weak {
                seg, addrs, endian, ..
            } => {
                let m = self.memory_mut(*seg);
                for a in addrs {
                    m.write_weak(a, &value, *endian)?;
                }
                Ok(())
            }
            Target::Unresolved { seg, .. } => {
                self.memory_mut(*seg).taint();
                Ok(())
            }
        }
    }

    fn resolve_batch<'a, I>(&self, batch: I) -> Result<Vec<(Target, Expr)>, RavelError>
    where
        I: IntoIterator<Item = (&'a Expr, &'a Expr)>,
    {
        let mut resolved = Vec::new();
        for (loc, value) in batch {
            let value = self.bounded(self.read(value)?);
            self.resolve(&Location::try_from(loc)?, value, &mut resolved)?;
        }
        Ok(resolved)
    }

    /// Commits every resolved target on a copy and swaps it in only once all succeed.
    fn commit_all(&mut self, resolved: Vec<(Target, Expr)>) -> Result<(), RavelError> {
        let mut next = self.clone();
        for (target, value) in resolved {
            next.commit(&target, value)?;
        }
        *self = next;
        Ok(())
    }

    /// Stores `value`, evaluated in the current state, at `loc`. A composite location is
    /// written whole or not at all.
    pub fn write(&mut self, loc: &Expr, value: &Expr) -> Result<(), RavelError> {
        let resolved = self.resolve_batch([(loc, value)])?;
        self.commit_all(resolved)
    }

    /// Performs every `(location, value)` assignment as if simultaneously: all values and
    /// addresses are evaluated in the current state before anything is written. On error
    /// the state is left untouched.
    #[instrument(skip_all, fields(len = batch.len()))]
    pub fn apply(&mut self, batch: &[(Expr, Expr)]) -> Result<(), RavelError> {
        let resolved = self.resolve_batch(batch.iter().map(|(l, v)| (l, v)))?;
        self.commit_all(resolved)
    }

    fn register_bindings(&self) -> Vec<(Expr, Expr)> {
        self.registers
            .iter()
            .map(|(r, v)| (Expr::register(r.clone()), *v))
            .collect()
    }

    /// Stored memory objects as `(order, location, value)`. Ordering by `order` gives the
    /// sequence in which they can be rewritten without one clobbering a later one.
    fn memory_bindings(&self) -> Vec<((u64, bool), Expr, Expr)> {
        let width = self.arch.address_width();
        self.memory
            .iter()
            .flat_map(|(seg, m)| {
                m.stamped_objects().map(move |(epoch, addr, data)| {
                    let base = addr.base.unwrap_or_else(|| Expr::from_u64(0, width));
                    let loc =
                        Expr::mem_with(&base, data.size(), *seg, addr.offset, Endianness::Little);
                    ((epoch, addr.is_absolute()), loc, data)
                })
            })
            .collect()
    }

    /// Every location this state has written, paired with its value.
    pub fn bindings(&self) -> Vec<(Expr, Expr)> {
        let mut out = self.register_bindings();
        let mut mem = self.memory_bindings();
        mem.sort_by_cached_key(|(_, l, _)| l.to_string());
        out.extend(mem.into_iter().map(|(_, l, v)| (l, v)));
        out
    }

    /// The state reached by running `self` and then `other`: every binding of `other` is
    /// evaluated in `self` and written over it.
    pub fn compose(&self, other: &Mapper) -> Result<Mapper, RavelError> {
        let mut bindings = other.register_bindings();
        let mut mem = other.memory_bindings();
        mem.sort_by_key(|(order, _, _)| *order);
        bindings.extend(mem.into_iter().map(|(_, l, v)| (l, v)));
        let resolved = self.resolve_batch(bindings.iter().map(|(l, v)| (l, v)))?;
        let mut next = self.clone();
        for (seg, m) in &other.memory {
            if m.is_tainted() {
                next.memory_mut(*seg).taint();
            }
        }
        for (target, value) in resolved {
            next.commit(&target, value)?;
        }
        Ok(next)
    }

    /// Merges `other` into `self`, so that the result over-approximates both states.
    pub fn join(&mut self, other: &Mapper, merge: MergeBehavior) -> Result<(), RavelError> {
        let max_vec = self.config.max_vec;
        let combine = |a: Expr, b: Expr| -> Result<Expr, RavelError> {
            Ok(match merge {
                MergeBehavior::Vec => disjunction(a, b, max_vec)?,
                MergeBehavior::Top => Expr::top(a.size()),
            })
        };
        let regs: Vec<Register> = self
            .registers
            .keys()
            .merge(other.registers.keys())
            .dedup()
            .cloned()
            .collect();
        for r in regs {
            let identity = Expr::register(r.clone());
            let mine = self.registers.get(&r).copied().unwrap_or(identity);
            let theirs = other.registers.get(&r).copied().unwrap_or(identity);
            if mine != theirs {
                self.registers.insert(r, combine(mine, theirs)?);
            }
        }
        for (seg, theirs) in &other.memory {
            self.memory_mut(*seg).join(theirs, combine)?;
        }
        let only_mine: Vec<Option<Expr>> = self
            .memory
            .keys()
            .filter(|s| !other.memory.contains_key(*s))
            .copied()
            .collect();
        for seg in only_mine {
            let empty = MemoryMap::for_segment(seg, &self.config);
            self.memory_mut(seg).join(&empty, combine)?;
        }
        Ok(())
    }

    /// Locations of the initial state that the bindings depend on, sorted by name.
    pub fn inputs(&self) -> Vec<Expr> {
        let mut found = BTreeMap::new();
        for (loc, value) in self.bindings() {
            let mut collect = |e: &Expr| {
                if matches!(e.kind(), ExprKind::Reg(_) | ExprKind::Mem { .. } | ExprKind::Ext { .. }) {
                    found.entry(e.to_string()).or_insert(*e);
                }
                true
            };
            value.visit(&mut collect);
            // the address of a written memory location is read too
            if let Some((ptr, _, _)) = loc.as_mem() {
                ptr.visit(&mut collect);
            }
        }
        found.into_values().collect()
    }

    /// Locations this state writes, sorted by name.
    pub fn outputs(&self) -> Vec<Expr> {
        let mut out: Vec<Expr> = self.bindings().into_iter().map(|(l, _)| l).collect();
        out.sort_by_cached_key(|e| e.to_string());
        out
    }

    fn page_directory(&self) -> Result<u64, RavelError> {
        let pd = self
            .arch
            .page_directory()
            .ok_or_else(|| RavelError::UnknownRegister("page directory".to_string()))?;
        let value = self.read(&pd)?;
        value.as_u64().ok_or(RavelError::SymbolicAddress(value))
    }

    /// Translates a virtual address through the page tables the page-directory register
    /// points to.
    pub fn translate(&mut self, vaddr: u64) -> Result<u64, RavelError> {
        let cr3 = self.page_directory()?;
        self.memory_mut(None).translate(vaddr, cr3)
    }

    /// Emulates `invlpg`.
    pub fn invalidate_page(&mut self, vaddr: u64) -> Result<(), RavelError> {
        let cr3 = self.page_directory()?;
        self.memory_mut(None).invalidate_page(vaddr, cr3);
        Ok(())
    }
}
