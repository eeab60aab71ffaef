use crate::expr::{arith, BinOp, Endianness, Expr, ExprKind, UnOp};
use crate::ExprError;
use num_bigint::BigInt;

/// Splits an address-like expression into a base and a constant displacement.
///
/// `Ptr(base, disp)` gives `(base, disp)`, `x + c` gives `(x, c)`, anything else is its own
/// base with a zero displacement.
pub fn extract_offset(e: &Expr) -> (Expr, i64) {
    match e.kind() {
        ExprKind::Ptr { base, disp, .. } => (*base, *disp),
        ExprKind::Binary(BinOp::Add, x, c) => match c.as_i64() {
            Some(d) => (*x, d),
            None => (*e, 0),
        },
        _ => (*e, 0),
    }
}

impl Expr {
    // --- Addresses ------------------------------------------------------------------

    /// An address-valued expression. Nested pointers and `x + c` bases fold their constant
    /// into `disp`. A concrete base absorbs the displacement entirely.
    pub fn ptr(base: Expr, seg: Option<Expr>, disp: i64) -> Expr {
        match base.kind() {
            ExprKind::Ptr {
                base: inner,
                seg: inner_seg,
                disp: d,
            } => Expr::ptr(*inner, seg.or(*inner_seg), d.wrapping_add(disp)),
            ExprKind::Const { value, size, .. } if disp != 0 => {
                let value = arith::from_signed(
                    &(arith::to_signed(value, *size) + BigInt::from(disp)),
                    *size,
                );
                Expr::ptr(Expr::constant(value, *size), seg, 0)
            }
            ExprKind::Binary(BinOp::Add, x, c) if c.as_i64().is_some() => {
                let d = c.as_i64().unwrap_or_default();
                Expr::ptr(*x, seg, d.wrapping_add(disp))
            }
            _ => Expr::intern(ExprKind::Ptr { base, seg, disp }),
        }
    }

    /// A little-endian memory reference of `size` bits at `addr`.
    pub fn mem(addr: &Expr, size: u32) -> Expr {
        Expr::mem_with(addr, size, None, 0, Endianness::Little)
    }

    /// A memory reference at `addr + disp`, optionally through segment `seg`.
    ///
    /// A vec-valued address distributes into a vec of memory references.
    pub fn mem_with(
        addr: &Expr,
        size: u32,
        seg: Option<Expr>,
        disp: i64,
        endian: Endianness,
    ) -> Expr {
        let (base, seg, disp) = match addr.kind() {
            ExprKind::Ptr {
                base,
                seg: inner_seg,
                disp: d,
            } => (*base, seg.or(*inner_seg), d.wrapping_add(disp)),
            _ => (*addr, seg, disp),
        };
        Expr::mem_at(base, seg, disp, size, endian)
    }

    fn mem_at(base: Expr, seg: Option<Expr>, disp: i64, size: u32, endian: Endianness) -> Expr {
        let ptr = Expr::ptr(base, seg, disp);
        if let ExprKind::Ptr {
            base,
            seg,
            disp,
        } = ptr.kind()
        {
            if let ExprKind::Vec {
                alternatives,
                widened: false,
            } = base.kind()
            {
                return Expr::vec_of(
                    alternatives
                        .iter()
                        .map(|b| Expr::mem_at(*b, *seg, *disp, size, endian))
                        .collect(),
                    false,
                );
            }
        }
        Expr::intern(ExprKind::Mem { ptr, size, endian })
    }

    /// The pointer, width and byte order of a memory reference.
    pub fn as_mem(&self) -> Option<(Expr, u32, Endianness)> {
        match self.kind() {
            ExprKind::Mem { ptr, size, endian } => Some((*ptr, *size, *endian)),
            _ => None,
        }
    }

    // --- Slicing --------------------------------------------------------------------

    /// The bits `[pos, pos + size)` of this expression.
    pub fn slice(&self, pos: u32, size: u32) -> Result<Expr, ExprError> {
        let width = self.size();
        if size == 0 || pos.checked_add(size).is_none_or(|end| end > width) {
            return Err(ExprError::InvalidSlice { pos, size, width });
        }
        if pos == 0 && size == width {
            return Ok(*self);
        }
        let sliced = match self.kind() {
            ExprKind::Const { value, .. } => Expr::constant(value >> pos, size)
                .with_signed(self.is_signed() && pos + size == width),
            ExprKind::Top(_) => Expr::top(size),
            ExprKind::Slice { base, pos: p, .. } => base.slice(p + pos, size)?,
            ExprKind::Composite(parts) => {
                let end = pos + size;
                let mut covered = Vec::new();
                let mut offset = 0;
                for part in parts {
                    let part_end = offset + part.size();
                    if part_end > pos && offset < end {
                        let lo = pos.max(offset);
                        let hi = end.min(part_end);
                        covered.push(part.slice(lo - offset, hi - lo)?);
                    }
                    offset = part_end;
                }
                Expr::composite(covered)?
            }
            ExprKind::Extend {
                signed,
                expr,
                size: _,
            } => {
                let inner = expr.size();
                if pos + size <= inner {
                    expr.slice(pos, size)?
                } else if pos >= inner {
                    if *signed {
                        expr.slice(inner - 1, 1)?.sign_extend(size)?
                    } else {
                        Expr::zero(size)
                    }
                } else {
                    Expr::composite([
                        expr.slice(pos, inner - pos)?,
                        self.slice(inner, pos + size - inner)?,
                    ])?
                }
            }
            ExprKind::Binary(op @ (BinOp::And | BinOp::Or | BinOp::Xor), a, b) => {
                Expr::binary(*op, &a.slice(pos, size)?, &b.slice(pos, size)?)?
            }
            ExprKind::Binary(op @ (BinOp::Add | BinOp::Sub | BinOp::Mul), a, b) if pos == 0 => {
                Expr::binary(*op, &a.slice(0, size)?, &b.slice(0, size)?)?
            }
            ExprKind::Binary(BinOp::MulWide | BinOp::SMulWide, a, b)
                if pos == 0 && size <= a.size() =>
            {
                a.slice(0, size)?.mul(&b.slice(0, size)?)?
            }
            ExprKind::Unary(UnOp::Not, a) => a.slice(pos, size)?.not(),
            ExprKind::Unary(UnOp::Neg, a) if pos == 0 => a.slice(0, size)?.neg(),
            ExprKind::Test {
                cond,
                then,
                otherwise,
            } => Expr::test(cond, &then.slice(pos, size)?, &otherwise.slice(pos, size)?)?,
            ExprKind::Vec {
                alternatives,
                widened,
            } => {
                let alternatives = alternatives
                    .iter()
                    .map(|e| e.slice(pos, size))
                    .collect::<Result<Vec<_>, _>>()?;
                Expr::vec_of(alternatives, *widened)
            }
            ExprKind::Mem {
                ptr,
                size: width,
                endian,
            } if pos % 8 == 0 && size % 8 == 0 && width % 8 == 0 => {
                let skip = match endian {
                    Endianness::Little => pos / 8,
                    Endianness::Big => (width - pos - size) / 8,
                };
                Expr::mem_with(ptr, size, None, skip as i64, *endian)
            }
            _ => Expr::intern(ExprKind::Slice {
                base: *self,
                pos,
                size,
            }),
        };
        Ok(sliced)
    }

    /// Bytes `[start, end)` of this value, counted from the first byte in memory order.
    pub fn bytes(&self, start: u32, end: u32, endian: Endianness) -> Result<Expr, ExprError> {
        let width = self.size();
        if end <= start || end * 8 > width {
            return Err(ExprError::InvalidSlice {
                pos: start * 8,
                size: end.saturating_sub(start) * 8,
                width,
            });
        }
        let pos = match endian {
            Endianness::Little => start * 8,
            Endianness::Big => width - end * 8,
        };
        self.slice(pos, (end - start) * 8)
    }

    /// Reverses the byte order of a value whose width is a whole number of bytes.
    pub fn byte_swap(&self) -> Result<Expr, ExprError> {
        let width = self.size();
        if width % 8 != 0 {
            return Err(ExprError::SizeMismatch {
                expected: width.next_multiple_of(8),
                found: width,
            });
        }
        let n = width / 8;
        if n <= 1 {
            return Ok(*self);
        }
        let parts = (0..n)
            .rev()
            .map(|i| self.slice(i * 8, 8))
            .collect::<Result<Vec<_>, _>>()?;
        Expr::composite(parts)
    }

    // --- Concatenation --------------------------------------------------------------

    /// Concatenates `parts`, low-order first, merging neighbours that describe contiguous
    /// pieces of the same thing.
    pub fn composite<I: IntoIterator<Item = Expr>>(parts: I) -> Result<Expr, ExprError> {
        let mut out: Vec<Expr> = Vec::new();
        for part in parts {
            let pieces = match part.kind() {
                ExprKind::Composite(inner) => inner.clone(),
                _ => vec![part],
            };
            for piece in pieces {
                let mut current = piece;
                while let Some(last) = out.last() {
                    match merge_adjacent(last, &current)? {
                        Some(merged) => {
                            out.pop();
                            current = merged;
                        }
                        None => break,
                    }
                }
                out.push(current);
            }
        }
        match out.len() {
            0 => Err(ExprError::EmptyComposite),
            1 => Ok(out[0]),
            _ => Ok(Expr::intern(ExprKind::Composite(out))),
        }
    }

    /// `self` in the low bits, `high` above it.
    pub fn concat(&self, high: &Expr) -> Result<Expr, ExprError> {
        Expr::composite([*self, *high])
    }

    /// This value with bits `[pos, pos + value.size())` replaced by `value`.
    pub fn splice(&self, pos: u32, value: &Expr) -> Result<Expr, ExprError> {
        let width = self.size();
        let end = pos + value.size();
        if end > width {
            return Err(ExprError::InvalidSlice {
                pos,
                size: value.size(),
                width,
            });
        }
        let mut parts = Vec::with_capacity(3);
        if pos > 0 {
            parts.push(self.slice(0, pos)?);
        }
        parts.push(*value);
        if end < width {
            parts.push(self.slice(end, width - end)?);
        }
        Expr::composite(parts)
    }

    // --- Extension ------------------------------------------------------------------

    pub fn zero_extend(&self, size: u32) -> Result<Expr, ExprError> {
        let width = self.size();
        if size < width {
            return Err(ExprError::InvalidExtension {
                from: width,
                to: size,
            });
        }
        if size == width {
            return Ok(*self);
        }
        let extended = match self.kind() {
            ExprKind::Const { value, .. } => Expr::constant(value.clone(), size),
            ExprKind::Top(_) => Expr::composite([*self, Expr::zero(size - width)])?,
            ExprKind::Vec {
                alternatives,
                widened,
            } => Expr::vec_of(
                alternatives
                    .iter()
                    .map(|e| e.zero_extend(size))
                    .collect::<Result<Vec<_>, _>>()?,
                *widened,
            ),
            ExprKind::Extend {
                signed: false,
                expr,
                ..
            } => expr.zero_extend(size)?,
            _ => Expr::intern(ExprKind::Extend {
                signed: false,
                expr: *self,
                size,
            }),
        };
        Ok(extended)
    }

    pub fn sign_extend(&self, size: u32) -> Result<Expr, ExprError> {
        let width = self.size();
        if size < width {
            return Err(ExprError::InvalidExtension {
                from: width,
                to: size,
            });
        }
        if size == width {
            return Ok(*self);
        }
        let extended = match self.kind() {
            ExprKind::Const { value, .. } => Expr::intern(ExprKind::Const {
                value: arith::from_signed(&arith::to_signed(value, width), size),
                size,
            })
            .with_signed(self.is_signed()),
            ExprKind::Top(_) => Expr::top(size),
            ExprKind::Vec {
                alternatives,
                widened,
            } => Expr::vec_of(
                alternatives
                    .iter()
                    .map(|e| e.sign_extend(size))
                    .collect::<Result<Vec<_>, _>>()?,
                *widened,
            ),
            ExprKind::Extend {
                signed: true, expr, ..
            } => expr.sign_extend(size)?,
            // the sign bit of a zero extension is known to be clear
            ExprKind::Extend {
                signed: false,
                expr,
                ..
            } => expr.zero_extend(size)?,
            _ => Expr::intern(ExprKind::Extend {
                signed: true,
                expr: *self,
                size,
            }),
        };
        Ok(extended)
    }
}

/// Joins two neighbouring composite parts into one, if they describe contiguous bits of
/// the same source.
fn merge_adjacent(low: &Expr, high: &Expr) -> Result<Option<Expr>, ExprError> {
    let merged = match (low.kind(), high.kind()) {
        (
            ExprKind::Const {
                value: lo, size: s, ..
            },
            ExprKind::Const { value: hi, .. },
        ) => Some(Expr::constant(lo | (hi << *s), s + high.size())),
        (ExprKind::Top(a), ExprKind::Top(b)) => Some(Expr::top(a + b)),
        (
            ExprKind::Slice {
                base: b1,
                pos: p1,
                size: s1,
            },
            ExprKind::Slice {
                base: b2, pos: p2, ..
            },
        ) if b1 == b2 && p1 + s1 == *p2 => Some(b1.slice(*p1, s1 + high.size())?),
        (
            ExprKind::Mem {
                ptr: p1,
                size: s1,
                endian: e1,
            },
            ExprKind::Mem {
                ptr: p2,
                size: s2,
                endian: e2,
            },
        ) if e1 == e2 && s1 % 8 == 0 && s2 % 8 == 0 => {
            let (base1, seg1, d1) = ptr_parts(p1);
            let (base2, seg2, d2) = ptr_parts(p2);
            if base1 != base2 || seg1 != seg2 {
                return Ok(None);
            }
            let size = s1 + s2;
            match e1 {
                Endianness::Little if d1.checked_add(*s1 as i64 / 8) == Some(d2) => {
                    Some(Expr::mem_with(p1, size, None, 0, *e1))
                }
                Endianness::Big if d2.checked_add(*s2 as i64 / 8) == Some(d1) => {
                    Some(Expr::mem_with(p2, size, None, 0, *e1))
                }
                _ => None,
            }
        }
        _ => None,
    };
    Ok(merged)
}

fn ptr_parts(ptr: &Expr) -> (Expr, Option<Expr>, i64) {
    match ptr.kind() {
        ExprKind::Ptr { base, seg, disp } => (*base, *seg, *disp),
        _ => (*ptr, None, 0),
    }
}
