use crate::location::Location;
use crate::memory::Address;
use crate::{ArchInfo, Mapper};
use ravel_expr::Expr;
use std::fmt::{Display, Formatter};

/// Trait for rendering types with register alias names from an [`ArchInfo`].
pub trait RavelDisplay: Sized + Clone {
    fn fmt_ravel(&self, f: &mut Formatter<'_>, info: &ArchInfo) -> std::fmt::Result;

    fn display<T: AsRef<ArchInfo>>(&self, info: T) -> RavelDisplayWrapper<Self> {
        RavelDisplayWrapper {
            info: info.as_ref().clone(),
            inner: self.clone(),
        }
    }
}

/// Bundles a value with arch info so it implements `Display` by forwarding to
/// `fmt_ravel`.
#[derive(Clone)]
pub struct RavelDisplayWrapper<T> {
    info: ArchInfo,
    inner: T,
}

impl<T> RavelDisplayWrapper<T> {
    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn info(&self) -> &ArchInfo {
        &self.info
    }
}

impl<T: RavelDisplay> Display for RavelDisplayWrapper<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt_ravel(f, &self.info)
    }
}

impl RavelDisplay for Expr {
    fn fmt_ravel(&self, f: &mut Formatter<'_>, info: &ArchInfo) -> std::fmt::Result {
        write!(f, "{}", self.with_names(info))
    }
}

impl RavelDisplay for Address {
    fn fmt_ravel(&self, f: &mut Formatter<'_>, info: &ArchInfo) -> std::fmt::Result {
        match &self.base {
            None => write!(f, "{self}"),
            Some(base) if self.offset < 0 => {
                write!(f, "{}-{:#x}", base.display(info), self.offset.unsigned_abs())
            }
            Some(base) => write!(f, "{}+{:#x}", base.display(info), self.offset),
        }
    }
}

impl RavelDisplay for Location {
    fn fmt_ravel(&self, f: &mut Formatter<'_>, info: &ArchInfo) -> std::fmt::Result {
        let e = self.to_expr().map_err(std::fmt::Error::from)?;
        e.fmt_ravel(f, info)
    }
}

/// One binding per line, registers first.
impl RavelDisplay for Mapper {
    fn fmt_ravel(&self, f: &mut Formatter<'_>, info: &ArchInfo) -> std::fmt::Result {
        for (loc, value) in self.bindings() {
            writeln!(f, "{} = {}", loc.display(info), value.display(info))?;
        }
        Ok(())
    }
}

impl Display for Mapper {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.fmt_ravel(f, self.arch())
    }
}
