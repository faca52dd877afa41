//! Numeric tower: exact `i64`, exact arbitrary precision, and `f64`.
//!
//! Exact results are always stored in the narrowest form that holds them, so a
//! `BigInteger` never carries a value that fits in an `i64`.

use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone)]
pub enum Number {
    Integer(i64),
    BigInteger(BigInt),
    Float(f64),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumberError {
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Exponent {0} is out of range")]
    ExponentOutOfRange(String),
}

pub type NumberResult = Result<Number, NumberError>;

// Either both sides are exact (possibly widened to BigInt) or both are floats.
enum Promoted {
    Small(i64, i64),
    Big(BigInt, BigInt),
    Float(f64, f64),
}

impl Number {
    /// Parses literal syntax: sign, digits, optional `.digits`, optional
    /// exponent. Integers without a fraction or exponent stay exact.
    pub fn parse_literal(text: &str) -> Option<Number> {
        if text.contains(['.', 'e', 'E']) {
            return text.parse::<f64>().ok().map(Number::Float);
        }
        match text.parse::<i64>() {
            Ok(n) => Some(Number::Integer(n)),
            Err(_) => text
                .trim_start_matches('+')
                .parse::<BigInt>()
                .ok()
                .map(Number::from),
        }
    }

    pub fn is_exact(&self) -> bool {
        !matches!(self, Number::Float(_))
    }

    pub fn to_f64(&self) -> f64 {
        match self {
            Number::Integer(n) => *n as f64,
            Number::BigInteger(n) => n.to_f64().unwrap_or(f64::NAN),
            Number::Float(f) => *f,
        }
    }

    pub fn to_bigint(&self) -> Option<BigInt> {
        match self {
            Number::Integer(n) => Some(BigInt::from(*n)),
            Number::BigInteger(n) => Some(n.clone()),
            Number::Float(_) => None,
        }
    }

    fn promote(&self, other: &Number) -> Promoted {
        match (self, other) {
            (Number::Integer(a), Number::Integer(b)) => Promoted::Small(*a, *b),
            (Number::Float(_), _) | (_, Number::Float(_)) => {
                Promoted::Float(self.to_f64(), other.to_f64())
            }
            _ => match (self.to_bigint(), other.to_bigint()) {
                (Some(a), Some(b)) => Promoted::Big(a, b),
                _ => Promoted::Float(self.to_f64(), other.to_f64()),
            },
        }
    }

    pub fn add(&self, other: &Number) -> Number {
        match self.promote(other) {
            Promoted::Small(a, b) => a
                .checked_add(b)
                .map(Number::Integer)
                .unwrap_or_else(|| Number::from(BigInt::from(a) + b)),
            Promoted::Big(a, b) => Number::from(a + b),
            Promoted::Float(a, b) => Number::Float(a + b),
        }
    }

    pub fn sub(&self, other: &Number) -> Number {
        match self.promote(other) {
            Promoted::Small(a, b) => a
                .checked_sub(b)
                .map(Number::Integer)
                .unwrap_or_else(|| Number::from(BigInt::from(a) - b)),
            Promoted::Big(a, b) => Number::from(a - b),
            Promoted::Float(a, b) => Number::Float(a - b),
        }
    }

    pub fn mul(&self, other: &Number) -> Number {
        match self.promote(other) {
            Promoted::Small(a, b) => a
                .checked_mul(b)
                .map(Number::Integer)
                .unwrap_or_else(|| Number::from(BigInt::from(a) * b)),
            Promoted::Big(a, b) => Number::from(a * b),
            Promoted::Float(a, b) => Number::Float(a * b),
        }
    }

    /// Exact division stays exact when the divisor goes in evenly and falls
    /// back to a float otherwise. Exact division by zero is an error; float
    /// division follows IEEE rules.
    pub fn div(&self, other: &Number) -> NumberResult {
        match self.promote(other) {
            Promoted::Small(_, 0) => Err(NumberError::DivisionByZero),
            Promoted::Small(a, b) if a.wrapping_rem(b) == 0 => Ok(a
                .checked_div(b)
                .map(Number::Integer)
                .unwrap_or_else(|| Number::from(BigInt::from(a) / b))),
            Promoted::Small(a, b) => Ok(Number::Float(a as f64 / b as f64)),
            Promoted::Big(_, b) if b.is_zero() => Err(NumberError::DivisionByZero),
            Promoted::Big(a, b) if (&a % &b).is_zero() => Ok(Number::from(a / b)),
            Promoted::Big(a, b) => Ok(Number::Float(
                a.to_f64().unwrap_or(f64::NAN) / b.to_f64().unwrap_or(f64::NAN),
            )),
            Promoted::Float(a, b) => Ok(Number::Float(a / b)),
        }
    }

    pub fn neg(&self) -> Number {
        match self {
            Number::Integer(n) => n
                .checked_neg()
                .map(Number::Integer)
                .unwrap_or_else(|| Number::from(-BigInt::from(*n))),
            Number::BigInteger(n) => Number::from(-n.clone()),
            Number::Float(f) => Number::Float(-f),
        }
    }

    /// Raises to a power. An exact base with a non-negative exact exponent
    /// stays exact, growing into a `BigInteger` as needed.
    pub fn pow(&self, exponent: &Number) -> NumberResult {
        match (self.is_exact(), exponent) {
            (true, Number::Integer(e)) if *e >= 0 => {
                let e = u32::try_from(*e)
                    .map_err(|_| NumberError::ExponentOutOfRange(e.to_string()))?;
                match self.to_bigint() {
                    Some(base) => Ok(Number::from(num_traits::pow(base, e as usize))),
                    None => Ok(Number::Float(self.to_f64().powf(e as f64))),
                }
            }
            (true, Number::BigInteger(e)) if e.sign() != num_bigint::Sign::Minus => {
                Err(NumberError::ExponentOutOfRange(e.to_string()))
            }
            _ => Ok(Number::Float(self.to_f64().powf(exponent.to_f64()))),
        }
    }

    pub fn compare(&self, other: &Number) -> Option<Ordering> {
        match self.promote(other) {
            Promoted::Small(a, b) => Some(a.cmp(&b)),
            Promoted::Big(a, b) => Some(a.cmp(&b)),
            Promoted::Float(a, b) => a.partial_cmp(&b),
        }
    }
}

impl From<i64> for Number {
    fn from(n: i64) -> Self {
        Number::Integer(n)
    }
}

impl From<f64> for Number {
    fn from(f: f64) -> Self {
        Number::Float(f)
    }
}

impl From<BigInt> for Number {
    fn from(n: BigInt) -> Self {
        match n.to_i64() {
            Some(small) => Number::Integer(small),
            None => Number::BigInteger(n),
        }
    }
}

// Numeric equality across representations: 1 == 1.0.
impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other)
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Integer(n) => write!(f, "{}", n),
            Number::BigInteger(n) => write!(f, "{}", n),
            // `{:?}` keeps the `.0` on integral floats so they read back as floats.
            Number::Float(x) => write!(f, "{:?}", x),
        }
    }
}
