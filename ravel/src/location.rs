use crate::RavelError;
use ravel_expr::{Endianness, Expr, ExprError, ExprKind, Register};

/// An expression that can be written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Reg(Register),
    /// Bits `[pos, pos + size)` of another location.
    Slice {
        base: Box<Location>,
        pos: u32,
        size: u32,
    },
    Mem {
        ptr: Expr,
        size: u32,
        endian: Endianness,
    },
    /// A bare address, written with the width of the value stored through it.
    Ptr(Expr),
    /// Several locations written low-order first, each with its own slice of the value.
    Composite(Vec<Location>),
}

impl Location {
    /// Width in bits, or `None` for a bare pointer.
    pub fn size(&self) -> Option<u32> {
        match self {
            Location::Reg(r) => Some(r.size),
            Location::Slice { size, .. } | Location::Mem { size, .. } => Some(*size),
            Location::Ptr(_) => None,
            Location::Composite(parts) => parts.iter().map(Location::size).sum(),
        }
    }

    /// The expression this location was classified from.
    pub fn to_expr(&self) -> Result<Expr, ExprError> {
        match self {
            Location::Reg(r) => Ok(Expr::register(r.clone())),
            Location::Slice { base, pos, size } => base.to_expr()?.slice(*pos, *size),
            Location::Mem { ptr, size, endian } => Ok(Expr::mem_with(ptr, *size, None, 0, *endian)),
            Location::Ptr(ptr) => Ok(*ptr),
            Location::Composite(parts) => {
                Expr::composite(parts.iter().map(Location::to_expr).collect::<Result<Vec<_>, _>>()?)
            }
        }
    }
}

impl TryFrom<&Expr> for Location {
    type Error = RavelError;

    fn try_from(e: &Expr) -> Result<Self, Self::Error> {
        match e.kind() {
            ExprKind::Reg(r) => Ok(Location::Reg(r.clone())),
            ExprKind::Slice { base, pos, size } => Ok(Location::Slice {
                base: Box::new(Location::try_from(base)?),
                pos: *pos,
                size: *size,
            }),
            ExprKind::Mem { ptr, size, endian } => Ok(Location::Mem {
                ptr: *ptr,
                size: *size,
                endian: *endian,
            }),
            ExprKind::Ptr { .. } => Ok(Location::Ptr(*e)),
            ExprKind::Composite(parts) => parts
                .iter()
                .map(Location::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(Location::Composite),
            _ => Err(RavelError::NotALocation(*e)),
        }
    }
}

impl TryFrom<Expr> for Location {
    type Error = RavelError;

    fn try_from(e: Expr) -> Result<Self, Self::Error> {
        Location::try_from(&e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_locations() {
        let eax = Expr::reg("eax", 32);
        let esp = Expr::reg("esp", 32);
        assert!(matches!(Location::try_from(eax), Ok(Location::Reg(_))));
        assert!(matches!(
            Location::try_from(eax.slice(8, 8).unwrap()),
            Ok(Location::Slice { pos: 8, size: 8, .. })
        ));
        let m = Expr::mem(&esp, 32);
        assert_eq!(Location::try_from(m).unwrap().size(), Some(32));
        let pair = Expr::composite([eax, m]).unwrap();
        assert_eq!(Location::try_from(pair).unwrap().size(), Some(64));
        assert_eq!(
            Location::try_from(Expr::ptr(esp, None, 4)).unwrap().size(),
            None
        );
    }

    #[test]
    fn rejects_values() {
        let eax = Expr::reg("eax", 32);
        for e in [eax + 1, Expr::from_u64(3, 32), Expr::top(32), !eax] {
            assert!(matches!(
                Location::try_from(e),
                Err(RavelError::NotALocation(_))
            ));
        }
    }
}
