use ravel_expr::Expr;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// A process-wide stub: given the symbol name and its width, produce its value.
pub type StubFn = fn(&str, u32) -> Option<Expr>;

/// A factory wrapper used with `inventory` so each registration can provide
/// the pair `(symbol name, StubFn)` at runtime.
pub struct StubFactory(pub fn() -> (&'static str, StubFn));

inventory::collect!(StubFactory);

/// Registers a stub for an external symbol in every mapper of the process.
///
/// ```ignore
/// fn errno(_: &str, size: u32) -> Option<Expr> {
///     Some(Expr::zero(size))
/// }
/// ravel::register_stub!("errno", errno);
/// ```
#[macro_export]
macro_rules! register_stub {
    ($name:expr, $func:path) => {
        const _: () = {
            fn factory() -> (&'static str, $crate::stub::StubFn) {
                ($name, $func)
            }

            inventory::submit! {
                $crate::stub::StubFactory(factory)
            }
        };
    };
}

static STUB_REGISTRY: OnceLock<HashMap<&'static str, StubFn>> = OnceLock::new();

fn build_stub_registry() -> HashMap<&'static str, StubFn> {
    let mut m = HashMap::new();
    for f in inventory::iter::<StubFactory> {
        let (name, fun) = (f.0)();
        m.insert(name, fun);
    }
    m
}

fn global_lookup(name: &str) -> Option<StubFn> {
    STUB_REGISTRY
        .get_or_init(build_stub_registry)
        .get(name)
        .copied()
}

type LocalStub = Arc<dyn Fn(&str, u32) -> Option<Expr> + Send + Sync>;

/// Resolves external symbols. Stubs registered on the table take precedence over the
/// process-wide ones registered with [`register_stub!`](crate::register_stub).
#[derive(Clone, Default)]
pub struct StubTable {
    local: HashMap<String, LocalStub>,
}

impl StubTable {
    pub fn register<S, F>(&mut self, name: S, stub: F)
    where
        S: Into<String>,
        F: Fn(&str, u32) -> Option<Expr> + Send + Sync + 'static,
    {
        self.local.insert(name.into(), Arc::new(stub));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.local.contains_key(name) || global_lookup(name).is_some()
    }

    /// The value of `name`, or `None` when no stub knows it.
    pub fn resolve(&self, name: &str, size: u32) -> Option<Expr> {
        let value = match (self.local.get(name), global_lookup(name)) {
            (Some(stub), _) => stub(name, size),
            (None, Some(stub)) => stub(name, size),
            (None, None) => {
                debug!("no stub for @{name}");
                return None;
            }
        };
        match value {
            Some(v) if v.size() == size => Some(v),
            Some(v) => {
                warn!("stub for @{name} returned {} bits, expected {size}", v.size());
                None
            }
            None => {
                warn!("stub for @{name} declined to resolve it");
                None
            }
        }
    }
}

impl Debug for StubTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.local.keys().collect();
        names.sort();
        f.debug_struct("StubTable").field("local", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(_: &str, size: u32) -> Option<Expr> {
        Some(Expr::from_u64(42, size))
    }

    crate::register_stub!("answer", answer);

    #[test]
    fn global_stubs_are_found() {
        let table = StubTable::default();
        assert!(table.contains("answer"));
        assert_eq!(table.resolve("answer", 32), Some(Expr::from_u64(42, 32)));
        assert_eq!(table.resolve("question", 32), None);
    }

    #[test]
    fn local_stubs_shadow_global_ones() {
        let mut table = StubTable::default();
        table.register("answer", |_, size| Some(Expr::zero(size)));
        assert_eq!(table.resolve("answer", 8), Some(Expr::zero(8)));
        // a value of the wrong width is discarded
        table.register("bad", |_, _| Some(Expr::zero(1)));
        assert_eq!(table.resolve("bad", 8), None);
    }
}
