use ravel_expr::{Endianness, Expr, ExprError};
use sorted_vec::SortedVec;
use std::cmp::Ordering;

/// A run of bytes stored at `vaddr`. `data` holds them in memory order, first byte in the
/// low bits. `epoch` is the taint epoch current when the bytes were written.
#[derive(Clone, Debug)]
pub(crate) struct MemObject {
    pub(crate) vaddr: i64,
    pub(crate) data: Expr,
    pub(crate) epoch: u64,
}

impl MemObject {
    pub(crate) fn len(&self) -> i64 {
        (self.data.size() / 8) as i64
    }

    pub(crate) fn end(&self) -> i64 {
        self.vaddr + self.len()
    }

    fn bytes(&self, from: i64, to: i64) -> Result<Expr, ExprError> {
        self.data.bytes(
            (from - self.vaddr) as u32,
            (to - self.vaddr) as u32,
            Endianness::Little,
        )
    }

    fn coalesces_with(&self, next: &MemObject) -> bool {
        self.end() == next.vaddr
            && self.epoch == next.epoch
            && self.data.is_const()
            && next.data.is_const()
    }
}

// Objects in a zone never overlap, so the start address identifies them.
impl PartialEq for MemObject {
    fn eq(&self, other: &Self) -> bool {
        self.vaddr == other.vaddr
    }
}

impl Eq for MemObject {}

impl PartialOrd for MemObject {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemObject {
    fn cmp(&self, other: &Self) -> Ordering {
        self.vaddr.cmp(&other.vaddr)
    }
}

/// Part of a zone read: either stored bytes or a gap.
#[derive(Clone, Debug)]
pub(crate) struct Piece {
    pub(crate) start: i64,
    pub(crate) len: i64,
    pub(crate) data: Option<(Expr, u64)>,
}

/// The objects stored relative to one base.
#[derive(Clone, Debug)]
pub(crate) struct Zone {
    objects: SortedVec<MemObject>,
}

impl Default for Zone {
    fn default() -> Self {
        Self {
            objects: SortedVec::new(),
        }
    }
}

impl Zone {
    pub(crate) fn objects(&self) -> impl Iterator<Item = &MemObject> {
        self.objects.iter()
    }

    fn first_overlapping(&self, vaddr: i64) -> usize {
        self.objects.partition_point(|o| o.end() <= vaddr)
    }

    /// Stores `data` at `vaddr`, cutting away whatever it overlaps.
    pub(crate) fn write(&mut self, vaddr: i64, data: Expr, epoch: u64) -> Result<(), ExprError> {
        let mut new = MemObject { vaddr, data, epoch };
        let end = new.end();

        let first = self.first_overlapping(vaddr);
        let mut last = first;
        while last < self.objects.len() && self.objects[last].vaddr < end {
            last += 1;
        }
        let mut remainders = Vec::new();
        for i in (first..last).rev() {
            let old = self.objects.remove_index(i);
            if old.vaddr < vaddr {
                remainders.push(MemObject {
                    vaddr: old.vaddr,
                    data: old.bytes(old.vaddr, vaddr)?,
                    epoch: old.epoch,
                });
            }
            if old.end() > end {
                remainders.push(MemObject {
                    vaddr: end,
                    data: old.bytes(end, old.end())?,
                    epoch: old.epoch,
                });
            }
        }
        for r in remainders {
            self.objects.insert(r);
        }

        let idx = self.objects.partition_point(|o| o.vaddr < vaddr);
        if idx > 0 && self.objects[idx - 1].coalesces_with(&new) {
            let left = self.objects.remove_index(idx - 1);
            new = MemObject {
                vaddr: left.vaddr,
                data: left.data.concat(&new.data)?,
                epoch,
            };
        }
        let idx = self.objects.partition_point(|o| o.vaddr < new.vaddr);
        if idx < self.objects.len() && new.coalesces_with(&self.objects[idx]) {
            let right = self.objects.remove_index(idx);
            new.data = new.data.concat(&right.data)?;
        }
        self.objects.insert(new);
        Ok(())
    }

    /// Splits `[vaddr, vaddr + len)` into stored pieces and gaps, in address order.
    pub(crate) fn pieces(&self, vaddr: i64, len: i64) -> Result<Vec<Piece>, ExprError> {
        let end = vaddr + len;
        let mut cursor = vaddr;
        let mut out = Vec::new();
        let first = self.first_overlapping(vaddr);
        for obj in self.objects[first..].iter().take_while(|o| o.vaddr < end) {
            if obj.vaddr > cursor {
                out.push(Piece {
                    start: cursor,
                    len: obj.vaddr - cursor,
                    data: None,
                });
            }
            let lo = cursor.max(obj.vaddr);
            let hi = end.min(obj.end());
            out.push(Piece {
                start: lo,
                len: hi - lo,
                data: Some((obj.bytes(lo, hi)?, obj.epoch)),
            });
            cursor = hi;
        }
        if cursor < end {
            out.push(Piece {
                start: cursor,
                len: end - cursor,
                data: None,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(v: &[u8]) -> Expr {
        Expr::from_bytes_le(v)
    }

    #[test]
    fn overwrite_splits_and_coalesces() {
        let mut zone = Zone::default();
        zone.write(0x10, bytes(&[1, 2, 3, 4]), 0).unwrap();
        zone.write(0x11, bytes(&[9, 9]), 0).unwrap();
        // everything is concrete and contiguous, so it is one object again
        assert_eq!(zone.objects().count(), 1);
        let pieces = zone.pieces(0x10, 4).unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].data.as_ref().unwrap().0, bytes(&[1, 9, 9, 4]));
    }

    #[test]
    fn symbolic_objects_stay_separate() {
        let mut zone = Zone::default();
        let eax = Expr::reg("eax", 32);
        zone.write(0, eax, 0).unwrap();
        zone.write(2, bytes(&[0xaa]), 0).unwrap();
        assert_eq!(zone.objects().count(), 3);
        let pieces = zone.pieces(0, 4).unwrap();
        let data: Vec<Expr> = pieces.iter().map(|p| p.data.as_ref().unwrap().0).collect();
        assert_eq!(
            data,
            vec![
                eax.slice(0, 16).unwrap(),
                Expr::from_u64(0xaa, 8),
                eax.slice(24, 8).unwrap()
            ]
        );
    }

    #[test]
    fn gaps_are_reported() {
        let mut zone = Zone::default();
        zone.write(4, bytes(&[1, 2]), 0).unwrap();
        let pieces = zone.pieces(2, 8).unwrap();
        let shape: Vec<(i64, i64, bool)> = pieces
            .iter()
            .map(|p| (p.start, p.len, p.data.is_some()))
            .collect();
        assert_eq!(shape, vec![(2, 2, false), (4, 2, true), (6, 4, false)]);
    }

    #[test]
    fn negative_offsets_sort_below_the_base() {
        let mut zone = Zone::default();
        zone.write(-4, bytes(&[1, 2, 3, 4]), 0).unwrap();
        zone.write(0, Expr::reg("eax", 32), 0).unwrap();
        let pieces = zone.pieces(-2, 4).unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].data.as_ref().unwrap().0, bytes(&[3, 4]));
    }
}
