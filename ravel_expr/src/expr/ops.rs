use crate::expr::{arith, BinOp, Expr, ExprKind, UnOp, MAX_VEC};
use crate::ExprError;
use itertools::Itertools;

impl BinOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinOp::Add
                | BinOp::Mul
                | BinOp::MulWide
                | BinOp::SMulWide
                | BinOp::And
                | BinOp::Or
                | BinOp::Xor
                | BinOp::Eq
                | BinOp::Ne
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Ult | BinOp::Ule | BinOp::Slt | BinOp::Sle
        )
    }

    /// Shifts and rotates take an amount of any width.
    pub fn is_shift(self) -> bool {
        matches!(
            self,
            BinOp::Shl | BinOp::LShr | BinOp::AShr | BinOp::Rol | BinOp::Ror
        )
    }

    pub fn is_division(self) -> bool {
        matches!(self, BinOp::UDiv | BinOp::SDiv | BinOp::URem | BinOp::SRem)
    }

    pub fn result_size(self, operand: u32) -> u32 {
        match self {
            BinOp::MulWide | BinOp::SMulWide => operand * 2,
            op if op.is_comparison() => 1,
            _ => operand,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::MulWide => "**",
            BinOp::SMulWide => "**s",
            BinOp::UDiv => "/",
            BinOp::SDiv => "/s",
            BinOp::URem => "%",
            BinOp::SRem => "%s",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::Shl => "<<",
            BinOp::LShr => ">>",
            BinOp::AShr => ".>>",
            BinOp::Rol => "<<<",
            BinOp::Ror => ">>>",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Ult => "<",
            BinOp::Ule => "<=",
            BinOp::Slt => "<s",
            BinOp::Sle => "<=s",
        }
    }
}

impl Expr {
    /// Applies a binary operator, simplifying locally.
    ///
    /// The operands must share a width, except for the amount of a shift or rotate.
    pub fn binary(op: BinOp, a: &Expr, b: &Expr) -> Result<Expr, ExprError> {
        if !op.is_shift() && a.size() != b.size() {
            return Err(ExprError::SizeMismatch {
                expected: a.size(),
                found: b.size(),
            });
        }
        let size = op.result_size(a.size());
        if let Some(w) = [a, b].into_iter().find(|e| e.is_widened()) {
            return Ok(if w.size() == size { *w } else { Expr::top(size) });
        }
        if a == b {
            if let Some(e) = identical_operands(op, a, size) {
                return Ok(e);
            }
        }
        if a.is_vec() || b.is_vec() {
            return lift_binary(op, a, b, size);
        }
        if op.is_division() && b.is_zero() {
            return Err(ExprError::DivisionByZero);
        }
        if let Some(e) = annihilate(op, a, b, size) {
            return Ok(e);
        }
        if a.is_top() || b.is_top() {
            return Ok(Expr::top(size));
        }
        if let (ExprKind::Const { value: x, .. }, ExprKind::Const { value: y, .. }) =
            (a.kind(), b.kind())
        {
            let value = arith::fold(op, x, y, a.size())?;
            return Ok(Expr::intern(ExprKind::Const { value, size })
                .with_signed(a.is_signed() && !op.is_comparison()));
        }
        let (a, b) = normalize_commutative(op, *a, *b);
        match op {
            BinOp::Add => simplify_add(a, b),
            BinOp::Sub => simplify_sub(a, b),
            BinOp::Mul => simplify_mul(a, b),
            BinOp::And | BinOp::Or | BinOp::Xor => simplify_bitwise(op, a, b),
            BinOp::UDiv | BinOp::SDiv if b.is_one() => Ok(a),
            BinOp::URem | BinOp::SRem if b.is_one() => Ok(Expr::zero(size)),
            BinOp::Shl | BinOp::LShr | BinOp::AShr | BinOp::Rol | BinOp::Ror => {
                Ok(simplify_shift(op, a, b))
            }
            BinOp::Eq | BinOp::Ne | BinOp::Ult | BinOp::Ule => Ok(simplify_compare(op, a, b)),
            _ => Ok(node(op, a, b)),
        }
    }

    /// Applies a unary operator. Unary operators cannot fail.
    pub fn unary(op: UnOp, a: &Expr) -> Expr {
        match a.kind() {
            ExprKind::Top(_) | ExprKind::Vec { widened: true, .. } => *a,
            ExprKind::Vec { alternatives, .. } => Expr::vec_of(
                alternatives.iter().map(|e| Expr::unary(op, e)).collect(),
                false,
            ),
            ExprKind::Const { value, size } => {
                let value = match op {
                    UnOp::Not => value ^ arith::mask(*size),
                    UnOp::Neg => arith::negate(value, *size),
                };
                Expr::intern(ExprKind::Const { value, size: *size }).with_signed(a.is_signed())
            }
            ExprKind::Unary(inner, x) if *inner == op => *x,
            ExprKind::Binary(BinOp::Eq, x, y) if op == UnOp::Not => node(BinOp::Ne, *x, *y),
            ExprKind::Binary(BinOp::Ne, x, y) if op == UnOp::Not => node(BinOp::Eq, *x, *y),
            ExprKind::Binary(BinOp::Sub, x, y) if op == UnOp::Neg => node(BinOp::Sub, *y, *x),
            _ => Expr::intern(ExprKind::Unary(op, *a)),
        }
    }

    /// Ternary selection on a 1-bit condition.
    pub fn test(cond: &Expr, then: &Expr, otherwise: &Expr) -> Result<Expr, ExprError> {
        if cond.size() != 1 {
            return Err(ExprError::SizeMismatch {
                expected: 1,
                found: cond.size(),
            });
        }
        if then.size() != otherwise.size() {
            return Err(ExprError::SizeMismatch {
                expected: then.size(),
                found: otherwise.size(),
            });
        }
        if then == otherwise {
            return Ok(*then);
        }
        match cond.kind() {
            ExprKind::Const { value, .. } => {
                Ok(if value.bit(0) { *then } else { *otherwise })
            }
            ExprKind::Top(_) | ExprKind::Vec { widened: true, .. } => {
                Expr::vec([*then, *otherwise])
            }
            ExprKind::Vec { alternatives, .. } => {
                let alternatives = alternatives
                    .iter()
                    .map(|c| Expr::test(c, then, otherwise))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Expr::vec_of(alternatives, false))
            }
            ExprKind::Unary(UnOp::Not, c) => Expr::test(c, otherwise, then),
            _ => Ok(Expr::intern(ExprKind::Test {
                cond: *cond,
                then: *then,
                otherwise: *otherwise,
            })),
        }
    }

    pub fn add(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Add, self, other)
    }

    pub fn sub(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Sub, self, other)
    }

    pub fn mul(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Mul, self, other)
    }

    pub fn mul_wide(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::MulWide, self, other)
    }

    pub fn smul_wide(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::SMulWide, self, other)
    }

    pub fn udiv(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::UDiv, self, other)
    }

    pub fn sdiv(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::SDiv, self, other)
    }

    pub fn urem(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::URem, self, other)
    }

    pub fn srem(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::SRem, self, other)
    }

    pub fn and(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::And, self, other)
    }

    pub fn or(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Or, self, other)
    }

    pub fn xor(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Xor, self, other)
    }

    pub fn shl(&self, amount: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Shl, self, amount)
    }

    pub fn lshr(&self, amount: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::LShr, self, amount)
    }

    pub fn ashr(&self, amount: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::AShr, self, amount)
    }

    pub fn rol(&self, amount: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Rol, self, amount)
    }

    pub fn ror(&self, amount: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Ror, self, amount)
    }

    pub fn cmp_eq(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Eq, self, other)
    }

    pub fn cmp_ne(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Ne, self, other)
    }

    pub fn ult(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Ult, self, other)
    }

    pub fn ule(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Ule, self, other)
    }

    pub fn ugt(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Ult, other, self)
    }

    pub fn uge(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Ule, other, self)
    }

    pub fn slt(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Slt, self, other)
    }

    pub fn sle(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Sle, self, other)
    }

    pub fn sgt(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Slt, other, self)
    }

    pub fn sge(&self, other: &Expr) -> Result<Expr, ExprError> {
        Expr::binary(BinOp::Sle, other, self)
    }

    pub fn not(&self) -> Expr {
        Expr::unary(UnOp::Not, self)
    }

    pub fn neg(&self) -> Expr {
        Expr::unary(UnOp::Neg, self)
    }
}

fn node(op: BinOp, a: Expr, b: Expr) -> Expr {
    Expr::intern(ExprKind::Binary(op, a, b))
}

/// Rules that compare interned operands and therefore hold for any value, `Top` included.
fn identical_operands(op: BinOp, a: &Expr, size: u32) -> Option<Expr> {
    match op {
        BinOp::Xor | BinOp::Sub => Some(Expr::zero(size)),
        BinOp::And | BinOp::Or => Some(*a),
        BinOp::Eq | BinOp::Ule | BinOp::Sle => Some(Expr::bit(true)),
        BinOp::Ne | BinOp::Ult | BinOp::Slt => Some(Expr::bit(false)),
        _ => None,
    }
}

/// Results fixed by one constant operand, whatever the other one holds.
fn annihilate(op: BinOp, a: &Expr, b: &Expr, size: u32) -> Option<Expr> {
    match op {
        BinOp::And | BinOp::Mul | BinOp::MulWide | BinOp::SMulWide
            if a.is_zero() || b.is_zero() =>
        {
            Some(Expr::zero(size))
        }
        BinOp::Or if a.is_ones() || b.is_ones() => Some(Expr::ones(size)),
        BinOp::Shl | BinOp::LShr
            if b.as_u64().is_some_and(|n| n >= size as u64)
                || (b.is_const() && b.as_u64().is_none()) =>
        {
            Some(Expr::zero(size))
        }
        _ => None,
    }
}

fn lift_binary(op: BinOp, a: &Expr, b: &Expr, size: u32) -> Result<Expr, ExprError> {
    let xs = a.alternatives();
    let ys = b.alternatives();
    if xs.len() * ys.len() > MAX_VEC {
        return Ok(Expr::top(size));
    }
    let results = xs
        .iter()
        .cartesian_product(ys.iter())
        .map(|(x, y)| Expr::binary(op, x, y))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Expr::vec_of(results, false))
}

/// Constants (and pointers, for addition) go to the left of commutative operators'
/// right-hand side, so later rules only need to look at `b`.
fn normalize_commutative(op: BinOp, a: Expr, b: Expr) -> (Expr, Expr) {
    if !op.is_commutative() {
        return (a, b);
    }
    if a.is_const() && !b.is_const() {
        return (b, a);
    }
    if op == BinOp::Add && b.is_ptr() && !a.is_ptr() {
        return (b, a);
    }
    (a, b)
}

fn const_operand(e: &Expr, op: BinOp) -> Option<(Expr, Expr)> {
    match e.kind() {
        ExprKind::Binary(inner, x, c) if *inner == op && c.is_const() => Some((*x, *c)),
        _ => None,
    }
}

fn simplify_add(a: Expr, b: Expr) -> Result<Expr, ExprError> {
    if b.is_zero() {
        return Ok(a);
    }
    if let ExprKind::Ptr { base, seg, disp } = a.kind() {
        if let Some(d) = b.as_i64().and_then(|c| disp.checked_add(c)) {
            return Ok(Expr::ptr(*base, *seg, d));
        }
        return Ok(Expr::ptr(base.add(&b)?, *seg, *disp));
    }
    if b.is_const() {
        if let Some((x, c)) = const_operand(&a, BinOp::Add) {
            return x.add(&c.add(&b)?);
        }
    }
    match (a.kind(), b.kind()) {
        (ExprKind::Unary(UnOp::Neg, x), _) if *x == b => Ok(Expr::zero(a.size())),
        (_, ExprKind::Unary(UnOp::Neg, y)) if *y == a => Ok(Expr::zero(a.size())),
        (_, ExprKind::Unary(UnOp::Neg, y)) => a.sub(y),
        (ExprKind::Unary(UnOp::Neg, x), _) => b.sub(x),
        (ExprKind::Binary(BinOp::Sub, x, y), _) if *y == b => Ok(*x),
        (_, ExprKind::Binary(BinOp::Sub, x, y)) if *y == a => Ok(*x),
        _ => Ok(node(BinOp::Add, a, b)),
    }
}

fn simplify_sub(a: Expr, b: Expr) -> Result<Expr, ExprError> {
    if b.is_zero() {
        return Ok(a);
    }
    if b.is_const() {
        return a.add(&b.neg());
    }
    if a.is_zero() {
        return Ok(b.neg());
    }
    match (a.kind(), b.kind()) {
        (
            ExprKind::Ptr {
                base: b1,
                seg: s1,
                disp: d1,
            },
            ExprKind::Ptr {
                base: b2,
                seg: s2,
                disp: d2,
            },
        ) if b1 == b2 && s1 == s2 => Ok(Expr::from_i64(d1.wrapping_sub(*d2), a.size())),
        (ExprKind::Ptr { base, seg, disp }, _) => Ok(Expr::ptr(base.sub(&b)?, *seg, *disp)),
        (ExprKind::Binary(BinOp::Add, x, y), _) if *y == b => Ok(*x),
        (ExprKind::Binary(BinOp::Add, x, y), _) if *x == b => Ok(*y),
        (ExprKind::Binary(BinOp::Sub, x, y), _) if *x == b => Ok(y.neg()),
        (_, ExprKind::Unary(UnOp::Neg, y)) => a.add(y),
        _ => Ok(node(BinOp::Sub, a, b)),
    }
}

fn simplify_mul(a: Expr, b: Expr) -> Result<Expr, ExprError> {
    if b.is_one() {
        return Ok(a);
    }
    if b.is_ones() {
        return Ok(a.neg());
    }
    if b.is_const() {
        if let Some((x, c)) = const_operand(&a, BinOp::Mul) {
            return x.mul(&c.mul(&b)?);
        }
    }
    Ok(node(BinOp::Mul, a, b))
}

fn simplify_bitwise(op: BinOp, a: Expr, b: Expr) -> Result<Expr, ExprError> {
    let size = a.size();
    match op {
        BinOp::And if b.is_ones() => return Ok(a),
        BinOp::Or | BinOp::Xor if b.is_zero() => return Ok(a),
        BinOp::Xor if b.is_ones() => return Ok(a.not()),
        _ => {}
    }
    if b.is_const() {
        if let Some((x, c)) = const_operand(&a, op) {
            return Expr::binary(op, &x, &Expr::binary(op, &c, &b)?);
        }
    }
    let complementary = a.not() == b;
    match op {
        BinOp::And if complementary => Ok(Expr::zero(size)),
        BinOp::Or | BinOp::Xor if complementary => Ok(Expr::ones(size)),
        BinOp::Xor => match a.kind() {
            ExprKind::Binary(BinOp::Xor, x, y) if *y == b => Ok(*x),
            ExprKind::Binary(BinOp::Xor, x, y) if *x == b => Ok(*y),
            _ => Ok(node(op, a, b)),
        },
        _ => Ok(node(op, a, b)),
    }
}

fn simplify_shift(op: BinOp, a: Expr, b: Expr) -> Expr {
    let size = a.size() as u64;
    let Some(amount) = b.as_u64() else {
        return node(op, a, b);
    };
    if amount == 0 {
        return a;
    }
    match op {
        BinOp::Rol | BinOp::Ror => {
            let r = amount % size.max(1);
            if r == 0 {
                a
            } else if r == amount {
                node(op, a, b)
            } else {
                node(op, a, Expr::from_u64(r, b.size()))
            }
        }
        BinOp::AShr if amount >= size => node(op, a, Expr::from_u64(size - 1, b.size())),
        _ => node(op, a, b),
    }
}

fn simplify_compare(op: BinOp, a: Expr, b: Expr) -> Expr {
    match op {
        BinOp::Eq if a.size() == 1 && b.is_one() => a,
        BinOp::Eq if a.size() == 1 && b.is_zero() => a.not(),
        BinOp::Ne if a.size() == 1 && b.is_zero() => a,
        BinOp::Ne if a.size() == 1 && b.is_one() => a.not(),
        BinOp::Ult if b.is_zero() => Expr::bit(false),
        BinOp::Ule if a.is_zero() || b.is_ones() => Expr::bit(true),
        _ => node(op, a, b),
    }
}
