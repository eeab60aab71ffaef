//! Operator-trait sugar. These panic on width mismatch; use [`Expr::binary`] to get a
//! `Result` instead.

use crate::expr::{BinOp, Expr, UnOp};

fn operate(op: BinOp, a: &Expr, b: &Expr) -> Expr {
    match Expr::binary(op, a, b) {
        Ok(e) => e,
        Err(err) => panic!("cannot apply {} to {a} and {b}: {err}", op.symbol()),
    }
}

macro_rules! binary_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        /// # Panics
        ///
        /// Panics if the operands differ in width.
        impl std::ops::$trait<Expr> for Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                operate($op, &self, &rhs)
            }
        }

        impl std::ops::$trait<&Expr> for &Expr {
            type Output = Expr;

            fn $method(self, rhs: &Expr) -> Expr {
                operate($op, self, rhs)
            }
        }

        /// The integer is taken as a constant of the left operand's width.
        impl std::ops::$trait<u64> for Expr {
            type Output = Expr;

            fn $method(self, rhs: u64) -> Expr {
                operate($op, &self, &Expr::from_u64(rhs, self.size()))
            }
        }
    };
}

binary_operator!(Add, add, BinOp::Add);
binary_operator!(Sub, sub, BinOp::Sub);
binary_operator!(Mul, mul, BinOp::Mul);
binary_operator!(BitAnd, bitand, BinOp::And);
binary_operator!(BitOr, bitor, BinOp::Or);
binary_operator!(BitXor, bitxor, BinOp::Xor);

impl std::ops::Shl<u32> for Expr {
    type Output = Expr;

    fn shl(self, rhs: u32) -> Expr {
        operate(BinOp::Shl, &self, &Expr::from_u64(rhs as u64, 32))
    }
}

/// Logical shift right.
impl std::ops::Shr<u32> for Expr {
    type Output = Expr;

    fn shr(self, rhs: u32) -> Expr {
        operate(BinOp::LShr, &self, &Expr::from_u64(rhs as u64, 32))
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::unary(UnOp::Not, &self)
    }
}

impl std::ops::Not for &Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::unary(UnOp::Not, self)
    }
}

impl std::ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::unary(UnOp::Neg, &self)
    }
}

impl std::ops::Neg for &Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::unary(UnOp::Neg, self)
    }
}
