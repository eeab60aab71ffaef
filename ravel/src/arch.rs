use crate::RavelError;
use ravel_expr::{Expr, RegKind, Register, RegisterNames};
use std::collections::HashMap;
use std::sync::Arc;

/// A named bit range of an owning register, e.g. `al` is `eax[0:8]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubRef {
    pub name: String,
    pub pos: u32,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ArchInfoInner {
    pub(crate) registers: HashMap<String, Register>,
    pub(crate) aliases: HashMap<String, (String, SubRef)>,
    pub(crate) subrefs: HashMap<String, Vec<SubRef>>,
    pub(crate) order: Vec<String>,
    pub(crate) address_width: u32,
    pub(crate) page_directory: Option<String>,
}

/// The register file of an architecture: full registers, their named slices and roles.
///
/// Cheap to clone; the tables are shared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchInfo {
    pub(crate) info: Arc<ArchInfoInner>,
}

impl ArchInfo {
    pub fn builder(address_width: u32) -> ArchInfoBuilder {
        ArchInfoBuilder {
            inner: ArchInfoInner {
                registers: HashMap::new(),
                aliases: HashMap::new(),
                subrefs: HashMap::new(),
                order: Vec::new(),
                address_width,
                page_directory: None,
            },
            pending: Vec::new(),
        }
    }

    /// Width of a pointer in bits.
    pub fn address_width(&self) -> u32 {
        self.info.address_width
    }

    /// Declared registers, in declaration order.
    pub fn registers(&self) -> impl Iterator<Item = &Register> {
        self.info
            .order
            .iter()
            .filter_map(|name| self.info.registers.get(name))
    }

    pub fn register<T: AsRef<str>>(&self, name: T) -> Option<Expr> {
        self.declared(name).map(|r| Expr::register(r.clone()))
    }

    /// The declaration of the register called `name`, with its role.
    pub fn declared<T: AsRef<str>>(&self, name: T) -> Option<&Register> {
        self.info.registers.get(name.as_ref())
    }

    /// The slice of its owner that an alias names.
    pub fn alias<T: AsRef<str>>(&self, name: T) -> Option<Expr> {
        let (owner, sub) = self.info.aliases.get(name.as_ref())?;
        let owner = self.register(owner)?;
        owner.slice(sub.pos, sub.size).ok()
    }

    /// A register or an alias, whichever `name` refers to.
    pub fn location<T: AsRef<str>>(&self, name: T) -> Result<Expr, RavelError> {
        let name = name.as_ref();
        self.register(name)
            .or_else(|| self.alias(name))
            .ok_or_else(|| RavelError::UnknownRegister(name.to_string()))
    }

    /// The aliases declared over `reg`.
    pub fn subrefs(&self, reg: &Register) -> &[SubRef] {
        self.info
            .subrefs
            .get(&reg.name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn with_kind(&self, kind: RegKind) -> Option<Expr> {
        self.registers()
            .find(|r| r.kind == kind)
            .map(|r| Expr::register(r.clone()))
    }

    pub fn pc(&self) -> Option<Expr> {
        self.with_kind(RegKind::ProgramCounter)
    }

    pub fn sp(&self) -> Option<Expr> {
        self.with_kind(RegKind::StackPointer)
    }

    /// The register holding the physical address of the page directory (`cr3` on x86).
    pub fn page_directory(&self) -> Option<Expr> {
        self.info
            .page_directory
            .as_ref()
            .and_then(|name| self.register(name))
    }
}

impl AsRef<ArchInfo> for ArchInfo {
    fn as_ref(&self) -> &ArchInfo {
        self
    }
}

impl RegisterNames for ArchInfo {
    fn slice_name(&self, reg: &Register, pos: u32, size: u32) -> Option<&str> {
        self.subrefs(reg)
            .iter()
            .find(|s| s.pos == pos && s.size == size)
            .map(|s| s.name.as_str())
    }
}

pub struct ArchInfoBuilder {
    inner: ArchInfoInner,
    pending: Vec<(String, String, u32, u32)>,
}

impl ArchInfoBuilder {
    pub fn register<S: Into<String>>(mut self, name: S, size: u32, kind: RegKind) -> Self {
        let name = name.into();
        if !self.inner.registers.contains_key(&name) {
            self.inner.order.push(name.clone());
        }
        self.inner
            .registers
            .insert(name.clone(), Register::new(name, size).with_kind(kind));
        self
    }

    /// Declares `name` as bits `[pos, pos + size)` of `owner`. Checked by [`Self::build`].
    pub fn alias<S: Into<String>, O: Into<String>>(
        mut self,
        name: S,
        owner: O,
        pos: u32,
        size: u32,
    ) -> Self {
        self.pending.push((name.into(), owner.into(), pos, size));
        self
    }

    pub fn page_directory<S: Into<String>>(mut self, name: S) -> Self {
        self.inner.page_directory = Some(name.into());
        self
    }

    pub fn build(mut self) -> Result<ArchInfo, RavelError> {
        for (name, owner, pos, size) in self.pending {
            let reg = self
                .inner
                .registers
                .get(&owner)
                .ok_or_else(|| RavelError::UnknownRegister(owner.clone()))?;
            // validates the range against the owner
            Expr::register(reg.clone()).slice(pos, size)?;
            let sub = SubRef { name: name.clone(), pos, size };
            self.inner
                .subrefs
                .entry(owner.clone())
                .or_default()
                .push(sub.clone());
            self.inner.aliases.insert(name, (owner, sub));
        }
        if let Some(pd) = &self.inner.page_directory {
            if !self.inner.registers.contains_key(pd) {
                return Err(RavelError::UnknownRegister(pd.clone()));
            }
        }
        Ok(ArchInfo {
            info: Arc::new(self.inner),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A trimmed-down 32-bit x86 register file.
    pub(crate) fn x86() -> ArchInfo {
        let mut b = ArchInfo::builder(32);
        for r in ["eax", "ebx", "ecx", "edx", "esi", "edi", "ebp"] {
            b = b.register(r, 32, RegKind::Other);
        }
        b = b
            .register("esp", 32, RegKind::StackPointer)
            .register("eip", 32, RegKind::ProgramCounter)
            .register("eflags", 32, RegKind::Flags)
            .register("cr0", 32, RegKind::PageTableBase)
            .register("cr3", 32, RegKind::PageTableBase)
            .register("fs", 16, RegKind::Other)
            .page_directory("cr3");
        for (full, x, h, l) in [
            ("eax", "ax", "ah", "al"),
            ("ebx", "bx", "bh", "bl"),
            ("ecx", "cx", "ch", "cl"),
            ("edx", "dx", "dh", "dl"),
        ] {
            b = b
                .alias(x, full, 0, 16)
                .alias(h, full, 8, 8)
                .alias(l, full, 0, 8);
        }
        b.alias("cf", "eflags", 0, 1)
            .alias("zf", "eflags", 6, 1)
            .alias("sf", "eflags", 7, 1)
            .build()
            .unwrap()
    }

    #[test]
    fn aliases_are_slices_of_their_owner() {
        let arch = x86();
        let eax = arch.register("eax").unwrap();
        assert_eq!(arch.alias("al").unwrap(), eax.slice(0, 8).unwrap());
        assert_eq!(arch.location("ah").unwrap(), eax.slice(8, 8).unwrap());
        assert_eq!(arch.subrefs(eax.as_reg().unwrap()).len(), 3);
        assert!(arch.location("xmm0").is_err());
    }

    #[test]
    fn roles() {
        let arch = x86();
        assert_eq!(arch.pc(), arch.register("eip"));
        assert_eq!(arch.sp(), arch.register("esp"));
        assert_eq!(arch.page_directory(), arch.register("cr3"));
        assert_eq!(arch.address_width(), 32);
    }

    #[test]
    fn displays_alias_names() {
        let arch = x86();
        let zf = arch.alias("zf").unwrap();
        let ah = arch.alias("ah").unwrap();
        assert_eq!(zf.with_names(&arch).to_string(), "zf");
        assert_eq!((ah + 1).with_names(&arch).to_string(), "(ah + 0x1)");
    }

    #[test]
    fn bad_aliases_are_rejected() {
        let unknown = ArchInfo::builder(32).alias("al", "eax", 0, 8).build();
        assert!(matches!(unknown, Err(RavelError::UnknownRegister(_))));
        let too_wide = ArchInfo::builder(32)
            .register("eax", 32, RegKind::Other)
            .alias("big", "eax", 24, 16)
            .build();
        assert!(matches!(too_wide, Err(RavelError::Expr(_))));
    }
}
