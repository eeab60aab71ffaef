use ravel_expr::Register;
use std::borrow::Borrow;

/// A compact map keyed by `Register`.
///
/// Keys are kept sorted in `regs` with the value for `regs[i]` at `data[i]`, so iteration
/// order is deterministic regardless of insertion order.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct LocationMap<T> {
    regs: Vec<Register>,
    data: Vec<T>,
}

impl<T> LocationMap<T> {
    pub fn new() -> Self {
        Self {
            regs: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// `Ok(index)` if `reg` is present, or `Err(insertion_index)`.
    fn position_of<B: Borrow<Register>>(&self, reg: B) -> Result<usize, usize> {
        let key = reg.borrow();
        self.regs.binary_search_by(|r| r.cmp(key))
    }

    pub fn get<B: Borrow<Register>>(&self, reg: B) -> Option<&T> {
        self.position_of(reg).ok().and_then(|idx| self.data.get(idx))
    }

    /// Inserts or replaces the value for `reg`, returning the old one.
    pub fn insert(&mut self, reg: Register, value: T) -> Option<T> {
        match self.position_of(&reg) {
            Ok(idx) => Some(std::mem::replace(&mut self.data[idx], value)),
            Err(idx) => {
                self.regs.insert(idx, reg);
                self.data.insert(idx, value);
                None
            }
        }
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            regs: self.regs.iter(),
            data: self.data.iter(),
        }
    }

    pub fn keys(&self) -> impl DoubleEndedIterator<Item = &Register> {
        self.regs.iter()
    }
}

impl<T> Default for LocationMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<(Register, T)> for LocationMap<T> {
    fn from_iter<I: IntoIterator<Item = (Register, T)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (reg, value) in iter {
            map.insert(reg, value);
        }
        map
    }
}

/// An iterator over the entries of a `LocationMap`, in key order.
pub struct Iter<'a, T> {
    regs: std::slice::Iter<'a, Register>,
    data: std::slice::Iter<'a, T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (&'a Register, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        Some((self.regs.next()?, self.data.next()?))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.data.size_hint()
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {
    fn len(&self) -> usize {
        self.data.len()
    }
}

impl<T> DoubleEndedIterator for Iter<'_, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        Some((self.regs.next_back()?, self.data.next_back()?))
    }
}

impl<'a, T> IntoIterator for &'a LocationMap<T> {
    type Item = (&'a Register, &'a T);
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::LocationMap;
    use ravel_expr::{RegKind, Register};

    #[test]
    fn test_insert_and_get() {
        let mut m = LocationMap::new();
        let eax = Register::new("eax", 32);
        let ebx = Register::new("ebx", 32);

        assert!(m.get(&eax).is_none());
        assert!(m.insert(ebx.clone(), 100).is_none());
        assert!(m.insert(eax.clone(), 200).is_none());
        assert_eq!(m.get(&eax), Some(&200));
        assert_eq!(m.get(&ebx), Some(&100));
        assert_eq!(m.insert(eax.clone(), 300), Some(200));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_iteration_order_is_sorted() {
        let m: LocationMap<u32> = ["esp", "eax", "ecx"]
            .into_iter()
            .enumerate()
            .map(|(i, n)| (Register::new(n, 32), i as u32))
            .collect();
        let keys: Vec<&str> = m.iter().map(|(r, _)| r.name.as_str()).collect();
        assert_eq!(keys, vec!["eax", "ecx", "esp"]);
        let last = m.iter().next_back().map(|(r, v)| (r.name.as_str(), *v));
        assert_eq!(last, Some(("esp", 0)));
    }

    #[test]
    fn test_keys_ignore_register_kind() {
        let mut m = LocationMap::new();
        let cr3 = Register::new("cr3", 32).with_kind(RegKind::PageTableBase);
        m.insert(cr3.clone(), 1);
        assert_eq!(m.insert(Register::new("cr3", 32), 2), Some(1));
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&cr3), Some(&2));
        // the declared key is kept
        assert_eq!(m.keys().next().map(|r| r.kind), Some(RegKind::PageTableBase));
        assert!(m.get(Register::new("cr3", 64)).is_none());
    }
}
