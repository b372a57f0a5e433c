//! Resource quantity normalisation
//!
//! The API server canonicalises quantities on write (`0.5` comes back as
//! `500m`, `1024Mi` as `1Gi`), so comparing the raw strings reports drift that
//! is not there. Quantities are reduced to an integer count of milli-units.

use std::fmt;

/// A quantity reduced to milli-units, or the raw string when it cannot be parsed
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CanonicalQuantity {
    Millis(i128),
    Raw(String),
}

impl CanonicalQuantity {
    pub fn parse(raw: &str) -> Self {
        match parse_millis(raw.trim()) {
            Some(m) => CanonicalQuantity::Millis(m),
            None => CanonicalQuantity::Raw(raw.trim().to_string()),
        }
    }
}

impl fmt::Display for CanonicalQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalQuantity::Millis(m) => write!(f, "{}m", m),
            CanonicalQuantity::Raw(s) => f.write_str(s),
        }
    }
}

/// Multiplier as (numerator, denominator) for a suffix
fn suffix_factor(suffix: &str) -> Option<(i128, i128)> {
    let factor = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        _ => return None,
    };
    Some(factor)
}

fn parse_millis(s: &str) -> Option<i128> {
    if s.is_empty() {
        return None;
    }

    let (negative, s) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let number_end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(number_end);
    if number.is_empty() || number == "." {
        return None;
    }

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if frac_part.contains('.') {
        return None;
    }

    let digits = format!("{}{}", int_part, frac_part);
    let mantissa: i128 = digits.parse().ok()?;
    let frac_scale = 10i128.checked_pow(u32::try_from(frac_part.len()).ok()?)?;

    let (mult, den) = match suffix_factor(suffix) {
        Some(f) => f,
        None => decimal_exponent(suffix)?,
    };

    let numerator = mantissa.checked_mul(mult)?.checked_mul(1000)?;
    let denominator = frac_scale.checked_mul(den)?;
    // Round up, as the API server does for sub-milli precision
    let value = numerator.checked_add(denominator - 1)? / denominator;

    Some(if negative { -value } else { value })
}

/// `e3`, `E-2` style suffixes
fn decimal_exponent(suffix: &str) -> Option<(i128, i128)> {
    let exp = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))?;
    let exp: i32 = exp.parse().ok()?;
    if exp.abs() > 18 {
        return None;
    }
    let pow = 10i128.pow(exp.unsigned_abs());
    Some(if exp >= 0 { (pow, 1) } else { (1, pow) })
}
