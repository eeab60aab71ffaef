//! Fixed-width integer arithmetic over `BigUint`, used for constant folding.

use crate::expr::BinOp;
use crate::ExprError;
use num_bigint::{BigInt, BigUint};
use num_traits::{One, ToPrimitive, Zero};

pub(crate) fn modulus(size: u32) -> BigUint {
    BigUint::one() << size
}

pub(crate) fn mask(size: u32) -> BigUint {
    modulus(size) - 1u32
}

pub(crate) fn reduce(value: BigUint, size: u32) -> BigUint {
    if value.bits() <= size as u64 {
        value
    } else {
        value & mask(size)
    }
}

pub(crate) fn sign_bit(value: &BigUint, size: u32) -> bool {
    size > 0 && value.bit(size as u64 - 1)
}

pub(crate) fn to_signed(value: &BigUint, size: u32) -> BigInt {
    if sign_bit(value, size) {
        BigInt::from(value.clone()) - BigInt::from(modulus(size))
    } else {
        BigInt::from(value.clone())
    }
}

pub(crate) fn from_signed(value: &BigInt, size: u32) -> BigUint {
    let m = BigInt::from(modulus(size));
    let r = ((value % &m) + &m) % &m;
    r.to_biguint().unwrap_or_default()
}

/// Absolute value of the two's complement reading.
pub(crate) fn magnitude(value: &BigUint, size: u32) -> BigUint {
    if sign_bit(value, size) {
        modulus(size) - value
    } else {
        value.clone()
    }
}

pub(crate) fn negate(value: &BigUint, size: u32) -> BigUint {
    if value.is_zero() {
        BigUint::zero()
    } else {
        modulus(size) - value
    }
}

fn shift_amount(value: &BigUint) -> u64 {
    value.to_u64().unwrap_or(u64::MAX)
}

fn from_bool(b: bool) -> BigUint {
    BigUint::from(b as u8)
}

/// Folds `op` over two constants of `size` bits (the shift amount may be any width). The
/// result is reduced to the operator's result width.
pub(crate) fn fold(op: BinOp, a: &BigUint, b: &BigUint, size: u32) -> Result<BigUint, ExprError> {
    let value = match op {
        BinOp::Add => reduce(a + b, size),
        BinOp::Sub => reduce(a + negate(b, size), size),
        BinOp::Mul => reduce(a * b, size),
        BinOp::MulWide => a * b,
        BinOp::SMulWide => from_signed(&(to_signed(a, size) * to_signed(b, size)), size * 2),
        BinOp::UDiv | BinOp::SDiv | BinOp::URem | BinOp::SRem if b.is_zero() => {
            return Err(ExprError::DivisionByZero);
        }
        BinOp::UDiv => a / b,
        BinOp::URem => a % b,
        BinOp::SDiv => from_signed(&(to_signed(a, size) / to_signed(b, size)), size),
        BinOp::SRem => from_signed(&(to_signed(a, size) % to_signed(b, size)), size),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => {
            let amount = shift_amount(b);
            if amount >= size as u64 {
                BigUint::zero()
            } else {
                reduce(a << amount, size)
            }
        }
        BinOp::LShr => {
            let amount = shift_amount(b);
            if amount >= size as u64 {
                BigUint::zero()
            } else {
                a >> amount
            }
        }
        BinOp::AShr => {
            let amount = shift_amount(b).min(size as u64);
            let shifted = if amount >= size as u64 {
                BigUint::zero()
            } else {
                a >> amount
            };
            if sign_bit(a, size) {
                let fill = mask(size) ^ (mask(size) >> amount);
                shifted | fill
            } else {
                shifted
            }
        }
        BinOp::Rol | BinOp::Ror => {
            if size == 0 {
                return Ok(BigUint::zero());
            }
            let amount = (b % size).to_u64().unwrap_or_default();
            let amount = if op == BinOp::Ror && amount != 0 {
                size as u64 - amount
            } else {
                amount
            };
            if amount == 0 {
                a.clone()
            } else {
                reduce((a << amount) | (a >> (size as u64 - amount)), size)
            }
        }
        BinOp::Eq => from_bool(a == b),
        BinOp::Ne => from_bool(a != b),
        BinOp::Ult => from_bool(a < b),
        BinOp::Ule => from_bool(a <= b),
        BinOp::Slt => from_bool(to_signed(a, size) < to_signed(b, size)),
        BinOp::Sle => from_bool(to_signed(a, size) <= to_signed(b, size)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big(v: u64) -> BigUint {
        BigUint::from(v)
    }

    #[test]
    fn wraps_at_width() {
        assert_eq!(fold(BinOp::Add, &big(0xff), &big(2), 8).unwrap(), big(1));
        assert_eq!(fold(BinOp::Sub, &big(1), &big(2), 8).unwrap(), big(0xff));
        assert_eq!(fold(BinOp::Mul, &big(0x10), &big(0x10), 8).unwrap(), big(0));
        assert_eq!(fold(BinOp::MulWide, &big(0x10), &big(0x10), 8).unwrap(), big(0x100));
    }

    #[test]
    fn signed_division_truncates() {
        // -7 / 2 == -3, -7 % 2 == -1
        let minus_seven = from_signed(&BigInt::from(-7), 8);
        assert_eq!(fold(BinOp::SDiv, &minus_seven, &big(2), 8).unwrap(), big(0xfd));
        assert_eq!(fold(BinOp::SRem, &minus_seven, &big(2), 8).unwrap(), big(0xff));
        assert_eq!(
            fold(BinOp::SMulWide, &big(0xff), &big(0xff), 8).unwrap(),
            big(1)
        );
    }

    #[test]
    fn division_by_zero() {
        assert_eq!(
            fold(BinOp::URem, &big(3), &big(0), 32),
            Err(ExprError::DivisionByZero)
        );
    }

    #[test]
    fn shifts_and_rotates() {
        assert_eq!(fold(BinOp::Shl, &big(1), &big(8), 8).unwrap(), big(0));
        assert_eq!(fold(BinOp::AShr, &big(0x80), &big(3), 8).unwrap(), big(0xf0));
        assert_eq!(fold(BinOp::AShr, &big(0x80), &big(100), 8).unwrap(), big(0xff));
        assert_eq!(fold(BinOp::AShr, &big(0x40), &big(100), 8).unwrap(), big(0));
        assert_eq!(fold(BinOp::Rol, &big(0x81), &big(1), 8).unwrap(), big(0x03));
        assert_eq!(fold(BinOp::Ror, &big(0x81), &big(1), 8).unwrap(), big(0xc0));
        assert_eq!(fold(BinOp::Ror, &big(0x81), &big(8), 8).unwrap(), big(0x81));
    }

    #[test]
    fn signed_comparison() {
        assert_eq!(fold(BinOp::Slt, &big(0xff), &big(0), 8).unwrap(), big(1));
        assert_eq!(fold(BinOp::Ult, &big(0xff), &big(0), 8).unwrap(), big(0));
        assert_eq!(magnitude(&big(0xfd), 8), big(3));
    }
}
