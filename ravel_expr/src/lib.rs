pub(crate) mod display;
pub(crate) mod error;
pub(crate) mod expr;

pub use display::{NamedExpr, RegisterNames};
pub use error::ExprError;
pub use expr::{
    extract_offset, BinOp, Endianness, Expr, ExprKind, RegKind, Register, UnOp, MAX_VEC,
};

