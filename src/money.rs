use std::fmt::{Display, Formatter};
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;
use anyhow::anyhow;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Serialize, Serializer};

/// Euro amount with two decimals, stored in the database as integer cents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn from_cents(cents: i64) -> Self {
        Self(Decimal::new(cents, 2))
    }
    /// `None` when the rounded amount does not fit the integer cents column.
    pub fn checked_cents(&self) -> Option<i64> {
        let mut d = self.0.round_dp(2);
        d.rescale(2);
        i64::try_from(d.mantissa()).ok()
    }
    /// Parsed amounts always fit; sums beyond the column range saturate.
    pub fn cents(&self) -> i64 {
        self.checked_cents()
            .unwrap_or(if self.0.is_sign_negative() { i64::MIN } else { i64::MAX })
    }
    /// Accepts `12`, `12.5`, `12,50` and surrounding blanks.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let s = s.trim().replace(',', ".");
        if s.is_empty() {
            return Err(anyhow!("empty amount"));
        }
        let d = Decimal::from_str(&s).map_err(|e| anyhow!("invalid amount '{s}': {e}"))?;
        let cents = Self(d).checked_cents().ok_or_else(|| anyhow!("amount '{s}' out of range"))?;
        Ok(Self::from_cents(cents))
    }
    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or_default()
    }
    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }
}

impl From<i64> for Money {
    fn from(cents: i64) -> Self {
        Self::from_cents(cents)
    }
}
impl Display for Money {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}
impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}
impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}
impl Sum for Money {
    fn sum<I: Iterator<Item=Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

#[cfg(test)]
mod test {
    use super::Money;

    #[test]
    fn parse_accepts_comma_and_short_scale() {
        assert_eq!(Money::parse("12").unwrap().cents(), 1200);
        assert_eq!(Money::parse(" 12.5 ").unwrap().cents(), 1250);
        assert_eq!(Money::parse("12,05").unwrap().cents(), 1205);
        assert_eq!(Money::parse("0.005").unwrap().cents(), 0);
        assert!(Money::parse("").is_err());
        assert!(Money::parse("abc").is_err());
    }

    #[test]
    fn parse_rejects_amounts_beyond_cents_range() {
        assert!(Money::parse("100000000000000000000").is_err());
        assert!(Money::parse("-100000000000000000000").is_err());
        let max = Money::parse("92233720368547758.07").unwrap();
        assert_eq!(max.cents(), i64::MAX);
        assert!(Money::parse("92233720368547758.08").is_err());
    }

    #[test]
    fn display_has_two_decimals() {
        assert_eq!(Money::from_cents(5000).to_string(), "50.00");
        assert_eq!(Money::from_cents(1205).to_string(), "12.05");
        assert_eq!(Money::from_cents(-250).to_string(), "-2.50");
        assert_eq!(serde_json::to_string(&Money::from_cents(99)).unwrap(), "\"0.99\"");
    }

    #[test]
    fn arithmetic_keeps_cents() {
        let total: Money = [1250, 4000, 5].into_iter().map(Money::from_cents).sum();
        assert_eq!(total.cents(), 5255);
        assert_eq!((Money::from_cents(5000) - Money::from_cents(750)).cents(), 4250);
        assert!((Money::from_cents(100) - Money::from_cents(200)).is_negative());
        assert!(!Money::ZERO.is_negative());
    }
}
