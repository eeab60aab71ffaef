use num_bigint::BigUint;
use ravel_expr::{BinOp, Expr, ExprKind, UnOp};
use std::collections::HashMap;
use z3::ast::{Ast, BV, Bool};

/// The z3 constants created while exporting expressions. Exporting the same location
/// twice through one `SmtNames` yields the same constant.
#[derive(Debug, Default)]
pub struct SmtNames {
    consts: HashMap<String, BV>,
}

impl SmtNames {
    pub fn new() -> Self {
        Self::default()
    }

    fn named(&mut self, name: String, size: u32) -> BV {
        self.consts
            .entry(name)
            .or_insert_with_key(|n| BV::new_const(n.as_str(), size))
            .clone()
    }

    /// The constant standing for `name`, if one was created.
    pub fn get(&self, name: &str) -> Option<&BV> {
        self.consts.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.consts.keys().map(String::as_str)
    }
}

fn constant(value: &BigUint, size: u32) -> BV {
    let limbs = value.to_u64_digits();
    let count = size.div_ceil(64) as usize;
    let mut bv: Option<BV> = None;
    for i in (0..count).rev() {
        let limb = BV::from_u64(limbs.get(i).copied().unwrap_or_default(), 64);
        bv = Some(match bv {
            Some(high) => high.concat(&limb),
            None => limb,
        });
    }
    match bv {
        Some(bv) if size % 64 != 0 => bv.extract(size - 1, 0),
        Some(bv) => bv,
        None => BV::from_u64(0, size),
    }
}

fn bit(b: Bool) -> BV {
    b.ite(&BV::from_u64(1, 1), &BV::from_u64(0, 1))
}

/// Exports `e` as a z3 bit-vector of the same width.
///
/// Registers, external symbols and memory references become named constants; `Top`
/// becomes a fresh one and a vec selects among its alternatives with a fresh selector.
pub fn to_bv(e: &Expr, names: &mut SmtNames) -> BV {
    let size = e.size();
    match e.kind() {
        ExprKind::Const { value, size, .. } => constant(value, *size),
        ExprKind::Reg(r) => names.named(r.name.clone(), r.size),
        ExprKind::Ext { name, size } => names.named(format!("@{name}"), *size),
        ExprKind::Mem { .. } => names.named(e.to_string(), size),
        ExprKind::Top(size) => BV::fresh_const("top", *size),
        ExprKind::Slice { base, pos, size } => to_bv(base, names).extract(pos + size - 1, *pos),
        ExprKind::Composite(parts) => parts
            .iter()
            .map(|p| to_bv(p, names))
            .reduce(|low, high| high.concat(&low))
            .unwrap_or_else(|| BV::from_u64(0, size)),
        ExprKind::Ptr { base, disp, .. } => {
            let b = to_bv(base, names);
            if *disp == 0 {
                b
            } else {
                b.bvadd(&BV::from_i64(*disp, size))
            }
        }
        ExprKind::Test {
            cond,
            then,
            otherwise,
        } => to_bv(cond, names)
            ._eq(&BV::from_u64(1, 1))
            .ite(&to_bv(then, names), &to_bv(otherwise, names)),
        ExprKind::Vec { alternatives, .. } => {
            let selector = BV::fresh_const("choice", 32);
            let mut alts = alternatives.iter().rev();
            let last = alts
                .next()
                .map(|a| to_bv(a, names))
                .unwrap_or_else(|| BV::fresh_const("top", size));
            alts.enumerate().fold(last, |acc, (i, alt)| {
                let idx = (alternatives.len() - 2 - i) as u64;
                selector
                    ._eq(&BV::from_u64(idx, 32))
                    .ite(&to_bv(alt, names), &acc)
            })
        }
        ExprKind::Unary(op, a) => {
            let a = to_bv(a, names);
            match op {
                UnOp::Not => a.bvnot(),
                UnOp::Neg => a.bvneg(),
            }
        }
        ExprKind::Extend { signed, expr, size } => {
            let inner = to_bv(expr, names);
            let by = size - expr.size();
            if *signed {
                inner.sign_ext(by)
            } else {
                inner.zero_ext(by)
            }
        }
        ExprKind::Binary(op, a, b) => {
            let width = a.size();
            let a = to_bv(a, names);
            let b = to_bv(b, names);
            // shift amounts may be narrower than the shifted value
            let amount = |b: &BV| {
                let w = b.get_size();
                if w < width {
                    b.zero_ext(width - w)
                } else if w > width {
                    b.extract(width - 1, 0)
                } else {
                    b.clone()
                }
            };
            match op {
                BinOp::Add => a.bvadd(&b),
                BinOp::Sub => a.bvsub(&b),
                BinOp::Mul => a.bvmul(&b),
                BinOp::MulWide => a.zero_ext(width).bvmul(&b.zero_ext(width)),
                BinOp::SMulWide => a.sign_ext(width).bvmul(&b.sign_ext(width)),
                BinOp::UDiv => a.bvudiv(&b),
                BinOp::SDiv => a.bvsdiv(&b),
                BinOp::URem => a.bvurem(&b),
                BinOp::SRem => a.bvsrem(&b),
                BinOp::And => a.bvand(&b),
                BinOp::Or => a.bvor(&b),
                BinOp::Xor => a.bvxor(&b),
                BinOp::Shl => a.bvshl(&amount(&b)),
                BinOp::LShr => a.bvlshr(&amount(&b)),
                BinOp::AShr => a.bvashr(&amount(&b)),
                BinOp::Rol => a.bvrotl(&amount(&b)),
                BinOp::Ror => a.bvrotr(&amount(&b)),
                BinOp::Eq => bit(a._eq(&b)),
                BinOp::Ne => bit(a._eq(&b).not()),
                BinOp::Ult => bit(a.bvult(&b)),
                BinOp::Ule => bit(a.bvule(&b)),
                BinOp::Slt => bit(a.bvslt(&b)),
                BinOp::Sle => bit(a.bvsle(&b)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_and_arithmetic() {
        let mut names = SmtNames::new();
        let e = Expr::from_u64(0x1234, 16);
        assert_eq!(to_bv(&e, &mut names).simplify().as_u64(), Some(0x1234));
        let wide = Expr::from_bytes_le(&[0xff; 12]).slice(32, 64).unwrap();
        assert_eq!(
            to_bv(&wide, &mut names).simplify().as_u64(),
            Some(u64::MAX)
        );
    }

    #[test]
    fn registers_share_constants() {
        let mut names = SmtNames::new();
        let eax = Expr::reg("eax", 32);
        let x = to_bv(&(eax + 1), &mut names);
        let y = to_bv(&(eax + 1), &mut names);
        assert_eq!(x.to_string(), y.to_string());
        assert!(names.get("eax").is_some());
        let z = to_bv(&eax.slice(0, 8).unwrap(), &mut names);
        assert_eq!(z.get_size(), 8);
    }
}
