use crate::expr::arith;
use crate::expr::{BinOp, Expr, ExprKind, Register, UnOp};
use itertools::Itertools;
use std::fmt::{Display, Formatter};

/// Supplies display names for register slices, so `eax[0:8]` can print as `al`.
pub trait RegisterNames {
    fn slice_name(&self, reg: &Register, pos: u32, size: u32) -> Option<&str>;
}

struct NoNames;

impl RegisterNames for NoNames {
    fn slice_name(&self, _reg: &Register, _pos: u32, _size: u32) -> Option<&str> {
        None
    }
}

/// An [`Expr`] paired with the naming context used to print it.
pub struct NamedExpr<'a, N: ?Sized> {
    expr: &'a Expr,
    names: &'a N,
}

impl Expr {
    pub fn with_names<'a, N: RegisterNames + ?Sized>(&'a self, names: &'a N) -> NamedExpr<'a, N> {
        NamedExpr { expr: self, names }
    }
}

impl<N: RegisterNames + ?Sized> Display for NamedExpr<'_, N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write_expr(f, self.expr, self.names)
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write_expr(f, self, &NoNames)
    }
}

fn write_expr<N: RegisterNames + ?Sized>(
    f: &mut Formatter<'_>,
    e: &Expr,
    names: &N,
) -> std::fmt::Result {
    match e.kind() {
        ExprKind::Const { value, size } => {
            if e.is_signed() && arith::sign_bit(value, *size) {
                write!(f, "-{:#x}", arith::magnitude(value, *size))
            } else {
                write!(f, "{value:#x}")
            }
        }
        ExprKind::Reg(reg) => write!(f, "{}", reg.name),
        ExprKind::Slice { base, pos, size } => {
            if let Some(name) = base.as_reg().and_then(|r| names.slice_name(r, *pos, *size)) {
                return write!(f, "{name}");
            }
            write_expr(f, base, names)?;
            write!(f, "[{}:{}]", pos, pos + size)
        }
        ExprKind::Composite(parts) => {
            write!(f, "{{ ")?;
            let mut pos = 0;
            for part in parts {
                write!(f, "|[{}:{}]->", pos, pos + part.size())?;
                write_expr(f, part, names)?;
                pos += part.size();
            }
            write!(f, "| }}")
        }
        ExprKind::Mem { ptr, size, .. } => {
            write!(f, "M{size}(")?;
            write_expr(f, ptr, names)?;
            write!(f, ")")
        }
        ExprKind::Ptr { base, seg, disp } => {
            if let Some(seg) = seg {
                write_expr(f, seg, names)?;
                write!(f, ":")?;
            }
            write_expr(f, base, names)?;
            match disp.signum() {
                1 => write!(f, "+{disp:#x}"),
                -1 => write!(f, "-{:#x}", disp.unsigned_abs()),
                _ => Ok(()),
            }
        }
        ExprKind::Ext { name, .. } => write!(f, "@{name}"),
        ExprKind::Test {
            cond,
            then,
            otherwise,
        } => write!(
            f,
            "({} ? {} : {})",
            cond.with_names(names),
            then.with_names(names),
            otherwise.with_names(names)
        ),
        ExprKind::Vec {
            alternatives,
            widened,
        } => {
            let body = alternatives.iter().map(|a| a.with_names(names)).join(", ");
            if *widened {
                write!(f, "[{body}, ...]")
            } else {
                write!(f, "[{body}]")
            }
        }
        ExprKind::Top(size) => write!(f, "⊤{size}"),
        ExprKind::Unary(op, x) => {
            let symbol = match op {
                UnOp::Not => "~",
                UnOp::Neg => "-",
            };
            write!(f, "{symbol}")?;
            write_expr(f, x, names)
        }
        ExprKind::Binary(BinOp::Add, x, c)
            if c.as_const()
                .is_some_and(|v| arith::sign_bit(v, c.size())) =>
        {
            let magnitude = c
                .as_const()
                .map(|v| arith::magnitude(v, c.size()))
                .unwrap_or_default();
            write!(f, "({} - {magnitude:#x})", x.with_names(names))
        }
        ExprKind::Binary(op, a, b) => write!(
            f,
            "({} {} {})",
            a.with_names(names),
            op.symbol(),
            b.with_names(names)
        ),
        ExprKind::Extend { signed, expr, size } => {
            let tag = if *signed { "sx" } else { "zx" };
            write!(f, "{tag}{size}(")?;
            write_expr(f, expr, names)?;
            write!(f, ")")
        }
    }
}
