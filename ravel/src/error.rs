use crate::memory::Address;
use ravel_expr::{Expr, ExprError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RavelError {
    #[error("Error building an expression")]
    Expr(#[from] ExprError),
    /// A concrete access fell outside every declared memory region. Emulation should stop.
    #[error("Memory access at {address} touches no declared region")]
    MemoryMap { address: Address },
    #[error("Expected a concrete address, found {0}")]
    SymbolicAddress(Expr),
    #[error("No register or alias named {0}")]
    UnknownRegister(String),
    #[error("{0} is not a writable location")]
    NotALocation(Expr),
    #[error("A {len}-byte access at {address} wraps around the address space")]
    AddressOverflow { address: Address, len: u64 },
    #[error("Page fault translating {vaddr:#x}")]
    PageFault { vaddr: u64 },
    #[cfg(feature = "confy")]
    #[error("Unable to load or store configuration")]
    Config(#[from] confy::ConfyError),
}

impl RavelError {
    /// Whether emulation of the current instruction can continue with a `Top` result.
    pub fn is_recoverable(&self) -> bool {
        match self {
            RavelError::Expr(e) => e.is_recoverable(),
            _ => false,
        }
    }
}
