pub(crate) mod arith;
mod ops;
mod structure;
mod traits;


use crate::ExprError;
use internment::Intern;
use num_bigint::{BigInt, BigUint};
use num_traits::{ToPrimitive, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};

pub use structure::extract_offset;

/// Largest number of alternatives a [`ExprKind::Vec`] may carry before it degrades to
/// [`ExprKind::Top`]. Every disjunction is held to it, including the ones a caller builds
/// under a lower bound of its own.
pub const MAX_VEC: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// The role a register plays for the mapper.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum RegKind {
    #[default]
    Other,
    ProgramCounter,
    StackPointer,
    Flags,
    /// Writing a register of this kind flushes cached page tables (`cr0`, `cr3`, ...)
    PageTableBase,
}

/// A machine register. Two registers are the same register when their names and widths
/// match; `kind` is carried along for the mapper but does not take part in comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Register {
    pub name: String,
    pub size: u32,
    pub kind: RegKind,
}

impl PartialEq for Register {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.size == other.size
    }
}

impl Eq for Register {}

impl Hash for Register {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.size.hash(state);
    }
}

impl PartialOrd for Register {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Register {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.name, self.size).cmp(&(&other.name, other.size))
    }
}

impl Register {
    pub fn new<S: Into<String>>(name: S, size: u32) -> Self {
        Self {
            name: name.into(),
            size,
            kind: RegKind::Other,
        }
    }

    pub fn with_kind(mut self, kind: RegKind) -> Self {
        self.kind = kind;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// Unsigned multiply producing a result twice the operand width
    MulWide,
    /// Signed multiply producing a result twice the operand width
    SMulWide,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    Rol,
    Ror,
    Eq,
    Ne,
    Ult,
    Ule,
    Slt,
    Sle,
}

/// The shape of an expression node. Children are interned [`Expr`] handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExprKind {
    Const {
        value: BigUint,
        size: u32,
    },
    Reg(Register),
    Slice {
        base: Expr,
        pos: u32,
        size: u32,
    },
    /// Concatenation, low-order part first
    Composite(Vec<Expr>),
    Mem {
        ptr: Expr,
        size: u32,
        endian: Endianness,
    },
    Ptr {
        base: Expr,
        seg: Option<Expr>,
        disp: i64,
    },
    Ext {
        name: String,
        size: u32,
    },
    Test {
        cond: Expr,
        then: Expr,
        otherwise: Expr,
    },
    Vec {
        alternatives: Vec<Expr>,
        widened: bool,
    },
    Top(u32),
    Unary(UnOp, Expr),
    Binary(BinOp, Expr, Expr),
    Extend {
        signed: bool,
        expr: Expr,
        size: u32,
    },
}

impl ExprKind {
    /// The same node with the sign flag of every child cleared, so that the interned copy
    /// does not depend on which of several equal children was seen first.
    fn unflagged(self) -> ExprKind {
        let p = Expr::plain;
        match self {
            ExprKind::Slice { base, pos, size } => ExprKind::Slice {
                base: p(base),
                pos,
                size,
            },
            ExprKind::Composite(parts) => ExprKind::Composite(parts.into_iter().map(p).collect()),
            ExprKind::Mem { ptr, size, endian } => ExprKind::Mem {
                ptr: p(ptr),
                size,
                endian,
            },
            ExprKind::Ptr { base, seg, disp } => ExprKind::Ptr {
                base: p(base),
                seg: seg.map(p),
                disp,
            },
            ExprKind::Test {
                cond,
                then,
                otherwise,
            } => ExprKind::Test {
                cond: p(cond),
                then: p(then),
                otherwise: p(otherwise),
            },
            ExprKind::Vec {
                alternatives,
                widened,
            } => ExprKind::Vec {
                alternatives: alternatives.into_iter().map(p).collect(),
                widened,
            },
            ExprKind::Unary(op, e) => ExprKind::Unary(op, p(e)),
            ExprKind::Binary(op, a, b) => ExprKind::Binary(op, p(a), p(b)),
            ExprKind::Extend { signed, expr, size } => ExprKind::Extend {
                signed,
                expr: p(expr),
                size,
            },
            leaf @ (ExprKind::Const { .. }
            | ExprKind::Reg(_)
            | ExprKind::Ext { .. }
            | ExprKind::Top(_)) => leaf,
        }
    }
}

/// An immutable, interned bit-vector expression.
///
/// Every constructor applies local simplification before interning, so two expressions
/// compare equal exactly when their simplified forms are structurally identical.
///
/// A constant handle may carry a sign flag that makes it print as a negative number. The
/// flag is not part of the value: `-0x1` and `0xff` of 8 bits are the same expression.
#[derive(Clone, Copy)]
pub struct Expr {
    node: Intern<ExprKind>,
    signed: bool,
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.hash(state)
    }
}

impl Expr {
    pub(crate) fn intern(kind: ExprKind) -> Self {
        Expr {
            node: Intern::new(kind.unflagged()),
            signed: false,
        }
    }

    fn plain(self) -> Self {
        Expr {
            signed: false,
            ..self
        }
    }

    pub fn kind(&self) -> &ExprKind {
        self.node.as_ref()
    }

    /// Whether this is a constant that prints as a signed number.
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Width of this expression in bits.
    pub fn size(&self) -> u32 {
        match self.kind() {
            ExprKind::Const { size, .. }
            | ExprKind::Slice { size, .. }
            | ExprKind::Mem { size, .. }
            | ExprKind::Ext { size, .. }
            | ExprKind::Extend { size, .. }
            | ExprKind::Top(size) => *size,
            ExprKind::Reg(reg) => reg.size,
            ExprKind::Composite(parts) => parts.iter().map(Expr::size).sum(),
            ExprKind::Ptr { base, .. } => base.size(),
            ExprKind::Test { then, .. } => then.size(),
            ExprKind::Vec { alternatives, .. } => {
                alternatives.first().map(Expr::size).unwrap_or_default()
            }
            ExprKind::Unary(_, e) => e.size(),
            ExprKind::Binary(op, a, _) => op.result_size(a.size()),
        }
    }

    // --- Leaves ---------------------------------------------------------------------

    /// A constant, reduced modulo `2^size`.
    pub fn constant<V: Into<BigUint>>(value: V, size: u32) -> Self {
        Self::intern(ExprKind::Const {
            value: arith::reduce(value.into(), size),
            size,
        })
    }

    pub fn from_u64(value: u64, size: u32) -> Self {
        Self::constant(value, size)
    }

    /// A constant from a two's complement value. Negative inputs are flagged as signed so
    /// they display with a minus sign.
    pub fn from_i64(value: i64, size: u32) -> Self {
        Self::intern(ExprKind::Const {
            value: arith::from_signed(&BigInt::from(value), size),
            size,
        })
        .with_signed(value < 0)
    }

    /// A constant from little-endian bytes.
    pub fn from_bytes_le(bytes: &[u8]) -> Self {
        Self::constant(BigUint::from_bytes_le(bytes), bytes.len() as u32 * 8)
    }

    pub fn bit(value: bool) -> Self {
        Self::from_u64(value as u64, 1)
    }

    pub fn zero(size: u32) -> Self {
        Self::from_u64(0, size)
    }

    pub fn one(size: u32) -> Self {
        Self::from_u64(1, size)
    }

    /// The all-ones constant of the given width.
    pub fn ones(size: u32) -> Self {
        Self::constant(arith::mask(size), size)
    }

    pub fn reg<S: Into<String>>(name: S, size: u32) -> Self {
        Self::register(Register::new(name, size))
    }

    pub fn register(reg: Register) -> Self {
        Self::intern(ExprKind::Reg(reg))
    }

    /// An external symbol, resolved by stubs when the mapper reads it.
    pub fn ext<S: Into<String>>(name: S, size: u32) -> Self {
        Self::intern(ExprKind::Ext {
            name: name.into(),
            size,
        })
    }

    pub fn top(size: u32) -> Self {
        Self::intern(ExprKind::Top(size))
    }

    /// The same constant with its display sign flag replaced. Other expressions are
    /// returned unchanged.
    pub fn with_signed(&self, signed: bool) -> Self {
        Expr {
            signed: signed && self.is_const(),
            ..*self
        }
    }

    // --- Disjunctions ---------------------------------------------------------------

    /// A bounded disjunction of same-sized alternatives.
    ///
    /// Nested vecs are flattened and duplicates removed. A single alternative is returned
    /// as is. Any `Top` alternative, or more than [`MAX_VEC`] alternatives, yields `Top`.
    pub fn vec<I: IntoIterator<Item = Expr>>(alternatives: I) -> Result<Self, ExprError> {
        let alternatives: Vec<Expr> = alternatives.into_iter().collect();
        let first = alternatives.first().ok_or(ExprError::EmptyVec)?;
        let size = first.size();
        if let Some(bad) = alternatives.iter().find(|e| e.size() != size) {
            return Err(ExprError::SizeMismatch {
                expected: size,
                found: bad.size(),
            });
        }
        Ok(Self::vec_of(alternatives, false))
    }

    /// Builds a vec from alternatives already known to share one width.
    pub(crate) fn vec_of(alternatives: Vec<Expr>, widened: bool) -> Self {
        let Some(size) = alternatives.first().map(Expr::size) else {
            return Self::top(0);
        };
        let mut widened = widened;
        let mut seen = HashSet::new();
        let mut flat = Vec::with_capacity(alternatives.len());
        for alt in alternatives {
            match alt.kind() {
                ExprKind::Top(_) => return Self::top(size),
                ExprKind::Vec {
                    alternatives: inner,
                    widened: w,
                } => {
                    widened |= *w;
                    for e in inner {
                        if seen.insert(*e) {
                            flat.push(*e);
                        }
                    }
                }
                _ => {
                    if seen.insert(alt) {
                        flat.push(alt);
                    }
                }
            }
        }
        if flat.len() > MAX_VEC {
            tracing::debug!("{} alternatives exceed the vec bound, using top", flat.len());
            return Self::top(size);
        }
        if flat.len() == 1 && !widened {
            return flat[0];
        }
        Self::intern(ExprKind::Vec {
            alternatives: flat,
            widened,
        })
    }

    /// The widened form of this value. A widened vec absorbs any further arithmetic that
    /// keeps its width, which lets fixpoint iteration over loops terminate.
    pub fn widen(&self) -> Self {
        match self.kind() {
            ExprKind::Top(_) => *self,
            ExprKind::Vec { alternatives, .. } => Self::vec_of(alternatives.clone(), true),
            _ => Self::vec_of(vec![*self], true),
        }
    }

    /// The alternatives of a vec, or this expression alone.
    pub fn alternatives(&self) -> &[Expr] {
        match self.kind() {
            ExprKind::Vec { alternatives, .. } => alternatives,
            _ => std::slice::from_ref(self),
        }
    }

    // --- Queries --------------------------------------------------------------------

    pub fn as_const(&self) -> Option<&BigUint> {
        match self.kind() {
            ExprKind::Const { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_const().and_then(ToPrimitive::to_u64)
    }

    /// The two's complement reading of a constant, if it fits in an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self.kind() {
            ExprKind::Const { value, size, .. } => arith::to_signed(value, *size).to_i64(),
            _ => None,
        }
    }

    pub fn as_reg(&self) -> Option<&Register> {
        match self.kind() {
            ExprKind::Reg(reg) => Some(reg),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self.kind(), ExprKind::Const { .. })
    }

    pub fn is_top(&self) -> bool {
        matches!(self.kind(), ExprKind::Top(_))
    }

    pub fn is_vec(&self) -> bool {
        matches!(self.kind(), ExprKind::Vec { .. })
    }

    pub fn is_widened(&self) -> bool {
        matches!(self.kind(), ExprKind::Vec { widened: true, .. })
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self.kind(), ExprKind::Ptr { .. })
    }

    pub fn is_mem(&self) -> bool {
        matches!(self.kind(), ExprKind::Mem { .. })
    }

    pub fn is_zero(&self) -> bool {
        self.as_const().is_some_and(Zero::is_zero)
    }

    pub fn is_one(&self) -> bool {
        self.as_u64() == Some(1)
    }

    pub fn is_ones(&self) -> bool {
        self.as_const()
            .is_some_and(|v| *v == arith::mask(self.size()))
    }

    pub fn contains_top(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if e.is_top() {
                found = true;
            }
            !found
        });
        found
    }

    /// True for a value that is neither concrete nor unknown: it depends on some
    /// location or external symbol and carries no `Top`.
    pub fn is_symbolic(&self) -> bool {
        !self.is_const() && !self.contains_top()
    }

    /// Height of the expression tree. Widened vecs are unbounded.
    pub fn depth(&self) -> usize {
        match self.kind() {
            ExprKind::Vec { widened: true, .. } => usize::MAX,
            _ => {
                let children = self.children();
                children
                    .iter()
                    .map(Expr::depth)
                    .max()
                    .map_or(1, |d| d.saturating_add(1))
            }
        }
    }

    /// Direct sub-expressions, in a fixed order.
    pub fn children(&self) -> Vec<Expr> {
        match self.kind() {
            ExprKind::Const { .. }
            | ExprKind::Reg(_)
            | ExprKind::Ext { .. }
            | ExprKind::Top(_) => vec![],
            ExprKind::Slice { base, .. } => vec![*base],
            ExprKind::Composite(parts) => parts.clone(),
            ExprKind::Mem { ptr, .. } => vec![*ptr],
            ExprKind::Ptr { base, seg, .. } => {
                let mut v = vec![*base];
                v.extend(seg.iter().copied());
                v
            }
            ExprKind::Test {
                cond,
                then,
                otherwise,
            } => vec![*cond, *then, *otherwise],
            ExprKind::Vec { alternatives, .. } => alternatives.clone(),
            ExprKind::Unary(_, e) => vec![*e],
            ExprKind::Binary(_, a, b) => vec![*a, *b],
            ExprKind::Extend { expr, .. } => vec![*expr],
        }
    }

    /// Pre-order traversal. Returning `false` from `f` skips the children of that node.
    pub fn visit<F: FnMut(&Expr) -> bool>(&self, f: &mut F) {
        if f(self) {
            for child in self.children() {
                child.visit(f);
            }
        }
    }

    /// Rebuilds this expression bottom-up through the simplifying constructors.
    ///
    /// `f` is offered every node before its children; returning `Some` replaces that whole
    /// subtree. Nodes for which `f` returns `None` are reconstructed from their rewritten
    /// children.
    pub fn try_rebuild<E, F>(&self, f: &mut F) -> Result<Expr, E>
    where
        E: From<ExprError>,
        F: FnMut(&Expr) -> Result<Option<Expr>, E>,
    {
        if let Some(replacement) = f(self)? {
            return Ok(replacement);
        }
        let rebuilt = match self.kind() {
            ExprKind::Const { .. }
            | ExprKind::Reg(_)
            | ExprKind::Ext { .. }
            | ExprKind::Top(_) => *self,
            ExprKind::Slice { base, pos, size } => base.try_rebuild(f)?.slice(*pos, *size)?,
            ExprKind::Composite(parts) => {
                let parts = parts
                    .iter()
                    .map(|p| p.try_rebuild(f))
                    .collect::<Result<Vec<_>, E>>()?;
                Expr::composite(parts)?
            }
            ExprKind::Mem { ptr, size, endian } => {
                Expr::mem_with(&ptr.try_rebuild(f)?, *size, None, 0, *endian)
            }
            ExprKind::Ptr { base, seg, disp } => {
                let seg = match seg {
                    Some(s) => Some(s.try_rebuild(f)?),
                    None => None,
                };
                Expr::ptr(base.try_rebuild(f)?, seg, *disp)
            }
            ExprKind::Test {
                cond,
                then,
                otherwise,
            } => Expr::test(
                &cond.try_rebuild(f)?,
                &then.try_rebuild(f)?,
                &otherwise.try_rebuild(f)?,
            )?,
            ExprKind::Vec {
                alternatives,
                widened,
            } => {
                let alternatives = alternatives
                    .iter()
                    .map(|p| p.try_rebuild(f))
                    .collect::<Result<Vec<_>, E>>()?;
                Expr::vec_of(alternatives, *widened)
            }
            ExprKind::Unary(op, e) => Expr::unary(*op, &e.try_rebuild(f)?),
            ExprKind::Binary(op, a, b) => {
                Expr::binary(*op, &a.try_rebuild(f)?, &b.try_rebuild(f)?)?
            }
            ExprKind::Extend { signed, expr, size } => {
                let expr = expr.try_rebuild(f)?;
                if *signed {
                    expr.sign_extend(*size)?
                } else {
                    expr.zero_extend(*size)?
                }
            }
        };
        Ok(rebuilt)
    }
}

impl Debug for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl AsRef<ExprKind> for Expr {
    fn as_ref(&self) -> &ExprKind {
        self.kind()
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.kind().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        ExprKind::deserialize(deserializer).map(Expr::intern)
    }
}
