mod arch;
mod config;
pub mod display;
mod error;
pub mod location;
pub mod mapper;
pub mod memory;
#[cfg(feature = "z3")]
pub mod smt;
pub mod stub;

pub use ravel_expr as expr;

pub use arch::{ArchInfo, ArchInfoBuilder, SubRef};
pub use config::Config;
pub use error::RavelError;
pub use mapper::{Mapper, MergeBehavior};
pub use memory::{Address, Fragment, MemoryMap};
pub use stub::StubTable;

#[cfg(test)]
pub(crate) fn test_log() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
