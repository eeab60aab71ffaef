use thiserror::Error;

/// An error raised while constructing or folding an [`Expr`](crate::Expr).
///
/// Size errors are construction bugs in the caller and should be propagated unchanged.
/// [`ExprError::DivisionByZero`] is the one variant a caller is expected to recover from,
/// usually by substituting [`Expr::top`](crate::Expr::top).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExprError {
    /// Two operands that must share a width did not
    #[error("operand size mismatch: expected {expected} bits, found {found} bits")]
    SizeMismatch { expected: u32, found: u32 },
    /// A bit range that does not fit inside its base expression
    #[error("slice [{pos}:{}] does not fit in a {width}-bit expression", pos + size)]
    InvalidSlice { pos: u32, size: u32, width: u32 },
    /// Zero/sign extension to a width narrower than the operand
    #[error("cannot extend a {from}-bit expression to {to} bits")]
    InvalidExtension { from: u32, to: u32 },
    /// Concrete division or modulo by a zero constant
    #[error("division by zero")]
    DivisionByZero,
    /// A composite was constructed with no parts
    #[error("a composite needs at least one part")]
    EmptyComposite,
    /// A vec was constructed with no alternatives
    #[error("a vec needs at least one alternative")]
    EmptyVec,
}

impl ExprError {
    /// Whether this error describes a property of the values involved rather than a
    /// malformed construction.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExprError::DivisionByZero)
    }
}

impl From<ExprError> for std::fmt::Error {
    fn from(_value: ExprError) -> Self {
        std::fmt::Error
    }
}
