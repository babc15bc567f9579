//! The runtime operator library.
//!
//! Pure functions over scalars: arithmetic, string, comparison and bitwise
//! operators, plus `sprintf`/`split` and a small deterministic RNG for
//! `rand`. The interpreter and any native-compiled code path call the same
//! functions, so the two engines cannot drift on coercion behavior. The
//! interpreter itself never coerces; everything coercion-shaped is here or
//! in [`super::scalar`].

use std::cmp::Ordering;
use std::fmt::Write;

use crate::runtime::error::RunError;
use crate::runtime::scalar::{format_num, Scalar, ScalarCell};

/// Booleans as the source language spells them: 1 and the empty string.
#[inline]
#[must_use]
pub fn bool_scalar(b: bool) -> Scalar {
    if b {
        Scalar::Int(1)
    } else {
        Scalar::str("")
    }
}

// ============================================================================
// Arithmetic
// ============================================================================

/// True if both operands hold exact integers (no string/float coercion
/// needed), enabling the integer fast paths below.
fn both_int(a: &Scalar, b: &Scalar) -> Option<(i64, i64)> {
    match (a, b) {
        (Scalar::Int(x), Scalar::Int(y)) => Some((*x, *y)),
        _ => None,
    }
}

/// Converts an exact float result back to an integer scalar when lossless.
fn num_result(n: f64) -> Scalar {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Scalar::Int(n as i64)
    } else {
        Scalar::Num(n)
    }
}

pub fn add(a: &Scalar, b: &Scalar) -> Scalar {
    if let Some((x, y)) = both_int(a, b) {
        if let Some(sum) = x.checked_add(y) {
            return Scalar::Int(sum);
        }
    }
    num_result(a.to_num() + b.to_num())
}

pub fn subtract(a: &Scalar, b: &Scalar) -> Scalar {
    if let Some((x, y)) = both_int(a, b) {
        if let Some(diff) = x.checked_sub(y) {
            return Scalar::Int(diff);
        }
    }
    num_result(a.to_num() - b.to_num())
}

pub fn multiply(a: &Scalar, b: &Scalar) -> Scalar {
    if let Some((x, y)) = both_int(a, b) {
        if let Some(product) = x.checked_mul(y) {
            return Scalar::Int(product);
        }
    }
    num_result(a.to_num() * b.to_num())
}

pub fn divide(a: &Scalar, b: &Scalar) -> Result<Scalar, RunError> {
    let divisor = b.to_num();
    if divisor == 0.0 {
        return Err(RunError::msg("Illegal division by zero"));
    }
    Ok(num_result(a.to_num() / divisor))
}

/// Integer modulo with the sign of the right operand (floored division).
pub fn modulo(a: &Scalar, b: &Scalar) -> Result<Scalar, RunError> {
    let (x, y) = (a.to_int(), b.to_int());
    if y == 0 {
        return Err(RunError::msg("Illegal modulus zero"));
    }
    Ok(Scalar::Int(((x % y) + y) % y))
}

pub fn power(a: &Scalar, b: &Scalar) -> Scalar {
    num_result(a.to_num().powf(b.to_num()))
}

pub fn negate(a: &Scalar) -> Scalar {
    match a {
        Scalar::Int(i) => i.checked_neg().map_or(Scalar::Num(-(*i as f64)), Scalar::Int),
        other => num_result(-other.to_num()),
    }
}

pub fn abs_value(a: &Scalar) -> Scalar {
    match a {
        Scalar::Int(i) => i.checked_abs().map_or(Scalar::Num((*i as f64).abs()), Scalar::Int),
        other => num_result(other.to_num().abs()),
    }
}

/// Truncation toward zero (the `int` builtin).
pub fn int_value(a: &Scalar) -> Scalar {
    Scalar::Int(a.to_int())
}

// ============================================================================
// Bitwise (operator-library surface; dispatched through CALL_BUILTIN)
// ============================================================================

pub fn bit_and(a: &Scalar, b: &Scalar) -> Scalar {
    Scalar::Int(((a.to_int() as u64) & (b.to_int() as u64)) as i64)
}

pub fn bit_or(a: &Scalar, b: &Scalar) -> Scalar {
    Scalar::Int(((a.to_int() as u64) | (b.to_int() as u64)) as i64)
}

pub fn bit_xor(a: &Scalar, b: &Scalar) -> Scalar {
    Scalar::Int(((a.to_int() as u64) ^ (b.to_int() as u64)) as i64)
}

pub fn bit_not(a: &Scalar) -> Scalar {
    Scalar::Int(!(a.to_int() as u64) as i64)
}

pub fn shift_left(a: &Scalar, b: &Scalar) -> Scalar {
    Scalar::Int(((a.to_int() as u64) << (b.to_int() as u32 & 63)) as i64)
}

pub fn shift_right(a: &Scalar, b: &Scalar) -> Scalar {
    Scalar::Int(((a.to_int() as u64) >> (b.to_int() as u32 & 63)) as i64)
}

// ============================================================================
// String operators
// ============================================================================

pub fn concat(a: &Scalar, b: &Scalar) -> Scalar {
    let mut s = a.to_text();
    s.push_str(&b.to_text());
    Scalar::str(s)
}

/// String repetition (`x`). Negative counts produce the empty string.
pub fn repeat(a: &Scalar, count: &Scalar) -> Scalar {
    let n = count.to_int().max(0) as usize;
    Scalar::str(a.to_text().repeat(n))
}

/// Character length.
pub fn length(a: &Scalar) -> Scalar {
    if !a.defined() {
        return Scalar::Undef;
    }
    Scalar::Int(a.to_text().chars().count() as i64)
}

/// Substring extraction with the usual negative offset/length rules.
/// Offsets past the end yield undef.
pub fn substr(s: &Scalar, offset: &Scalar, len: Option<&Scalar>) -> Scalar {
    let text: Vec<char> = s.to_text().chars().collect();
    let total = text.len() as i64;

    let mut start = offset.to_int();
    if start < 0 {
        start += total;
    }
    if start < 0 || start > total {
        return Scalar::Undef;
    }

    let end = match len {
        None => total,
        Some(l) => {
            let l = l.to_int();
            if l < 0 {
                total + l
            } else {
                start + l
            }
        }
    };
    let end = end.clamp(start, total);
    Scalar::str(text[start as usize..end as usize].iter().collect::<String>())
}

/// Joins cell list elements with a separator.
pub fn join(sep: &Scalar, items: &[ScalarCell]) -> Scalar {
    let sep = sep.to_text();
    let mut out = String::new();
    for (n, item) in items.iter().enumerate() {
        if n > 0 {
            out.push_str(&sep);
        }
        out.push_str(&item.borrow().to_text());
    }
    Scalar::str(out)
}

/// Byte position of `needle` in `haystack` at or after `from`, or -1.
pub fn index_of(haystack: &Scalar, needle: &Scalar, from: Option<&Scalar>) -> Scalar {
    let hay = haystack.to_text();
    let needle = needle.to_text();
    let from = from.map_or(0, |f| f.to_int().max(0) as usize).min(hay.len());
    match hay[from..].find(&needle) {
        Some(pos) => Scalar::Int((from + pos) as i64),
        None => Scalar::Int(-1),
    }
}

/// Byte position of the last occurrence of `needle` at or before `from`.
pub fn rindex_of(haystack: &Scalar, needle: &Scalar, from: Option<&Scalar>) -> Scalar {
    let hay = haystack.to_text();
    let needle = needle.to_text();
    let limit = match from {
        Some(f) => (f.to_int().max(0) as usize).saturating_add(needle.len()).min(hay.len()),
        None => hay.len(),
    };
    match hay[..limit].rfind(&needle) {
        Some(pos) => Scalar::Int(pos as i64),
        None => Scalar::Int(-1),
    }
}

pub fn uppercase(a: &Scalar) -> Scalar {
    Scalar::str(a.to_text().to_uppercase())
}

pub fn lowercase(a: &Scalar) -> Scalar {
    Scalar::str(a.to_text().to_lowercase())
}

pub fn ucfirst(a: &Scalar) -> Scalar {
    let s = a.to_text();
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => Scalar::str(first.to_uppercase().chain(chars).collect::<String>()),
        None => Scalar::str(""),
    }
}

pub fn lcfirst(a: &Scalar) -> Scalar {
    let s = a.to_text();
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => Scalar::str(first.to_lowercase().chain(chars).collect::<String>()),
        None => Scalar::str(""),
    }
}

pub fn chr_of(a: &Scalar) -> Scalar {
    let code = a.to_int();
    match u32::try_from(code).ok().and_then(char::from_u32) {
        Some(c) => Scalar::str(c.to_string()),
        None => Scalar::str("\u{fffd}"),
    }
}

pub fn ord_of(a: &Scalar) -> Scalar {
    Scalar::Int(a.to_text().chars().next().map_or(0, |c| c as i64))
}

pub fn hex_of(a: &Scalar) -> Scalar {
    let s = a.to_text();
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    Scalar::Int(i64::from_str_radix(digits, 16).unwrap_or(0))
}

pub fn oct_of(a: &Scalar) -> Scalar {
    let s = a.to_text();
    let s = s.trim();
    let (radix, digits) = if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (16, rest)
    } else if let Some(rest) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        (2, rest)
    } else {
        (8, s.trim_start_matches('0'))
    };
    if digits.is_empty() {
        return Scalar::Int(0);
    }
    Scalar::Int(i64::from_str_radix(digits, radix).unwrap_or(0))
}

/// Splits on a literal separator. A single-space separator means
/// "split on whitespace runs, discarding leading whitespace"; the empty
/// separator splits into characters. Without a positive limit, trailing
/// empty fields are stripped.
pub fn split(sep: &Scalar, target: &Scalar, limit: Option<i64>) -> Vec<Scalar> {
    let text = target.to_text();
    let sep = sep.to_text();
    let limit = limit.filter(|&l| l > 0).map(|l| l as usize);

    let mut fields: Vec<String> = if sep == " " {
        text.split_whitespace().map(str::to_owned).collect()
    } else if sep.is_empty() {
        text.chars().map(|c| c.to_string()).collect()
    } else {
        match limit {
            Some(n) => text.splitn(n, &sep as &str).map(str::to_owned).collect(),
            None => text.split(&sep as &str).map(str::to_owned).collect(),
        }
    };

    if limit.is_none() {
        while fields.last().is_some_and(String::is_empty) {
            fields.pop();
        }
    } else if let Some(n) = limit {
        if sep == " " || sep.is_empty() {
            // Whitespace/char splits ignore splitn; apply the limit by
            // rejoining the tail.
            if fields.len() > n {
                let tail = fields.split_off(n - 1);
                let joiner = if sep.is_empty() { "" } else { " " };
                fields.push(tail.join(joiner));
            }
        }
    }

    fields.into_iter().map(Scalar::str).collect()
}

// ============================================================================
// Comparison
// ============================================================================

fn num_cmp(a: &Scalar, b: &Scalar) -> Ordering {
    a.to_num().partial_cmp(&b.to_num()).unwrap_or(Ordering::Equal)
}

pub fn num_eq(a: &Scalar, b: &Scalar) -> Scalar {
    bool_scalar(a.to_num() == b.to_num())
}

pub fn num_ne(a: &Scalar, b: &Scalar) -> Scalar {
    bool_scalar(a.to_num() != b.to_num())
}

pub fn num_lt(a: &Scalar, b: &Scalar) -> Scalar {
    bool_scalar(num_cmp(a, b) == Ordering::Less)
}

pub fn num_gt(a: &Scalar, b: &Scalar) -> Scalar {
    bool_scalar(num_cmp(a, b) == Ordering::Greater)
}

pub fn num_le(a: &Scalar, b: &Scalar) -> Scalar {
    bool_scalar(num_cmp(a, b) != Ordering::Greater)
}

pub fn num_ge(a: &Scalar, b: &Scalar) -> Scalar {
    bool_scalar(num_cmp(a, b) != Ordering::Less)
}

/// Numeric three-way comparison (`<=>`).
pub fn num_three_way(a: &Scalar, b: &Scalar) -> Scalar {
    Scalar::Int(match num_cmp(a, b) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}

pub fn str_eq(a: &Scalar, b: &Scalar) -> Scalar {
    bool_scalar(a.to_text() == b.to_text())
}

pub fn str_ne(a: &Scalar, b: &Scalar) -> Scalar {
    bool_scalar(a.to_text() != b.to_text())
}

pub fn str_lt(a: &Scalar, b: &Scalar) -> Scalar {
    bool_scalar(a.to_text() < b.to_text())
}

pub fn str_gt(a: &Scalar, b: &Scalar) -> Scalar {
    bool_scalar(a.to_text() > b.to_text())
}

pub fn str_le(a: &Scalar, b: &Scalar) -> Scalar {
    bool_scalar(a.to_text() <= b.to_text())
}

pub fn str_ge(a: &Scalar, b: &Scalar) -> Scalar {
    bool_scalar(a.to_text() >= b.to_text())
}

/// String three-way comparison (`cmp`).
pub fn str_three_way(a: &Scalar, b: &Scalar) -> Scalar {
    Scalar::Int(match a.to_text().cmp(&b.to_text()) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}

// ============================================================================
// sprintf
// ============================================================================

/// A minimal `sprintf`: `%% %c %s %d/%i %u %o %x %X %b %e %f %g` with
/// `-`/`0`/`+`/space flags, width, and precision.
pub fn sprintf(format: &Scalar, args: &[ScalarCell]) -> Result<Scalar, RunError> {
    let fmt = format.to_text();
    let mut out = String::new();
    let mut chars = fmt.chars().peekable();
    let mut next_arg = 0usize;

    let take_arg = |next_arg: &mut usize| -> Scalar {
        let value = args.get(*next_arg).map_or(Scalar::Undef, |c| c.borrow().clone());
        *next_arg += 1;
        value
    };

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        // Flags.
        let mut left = false;
        let mut zero = false;
        let mut plus = false;
        let mut space = false;
        while let Some(&f) = chars.peek() {
            match f {
                '-' => left = true,
                '0' => zero = true,
                '+' => plus = true,
                ' ' => space = true,
                _ => break,
            }
            chars.next();
        }

        // Width.
        let mut width = 0usize;
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            width = width * 10 + d as usize;
            chars.next();
        }

        // Precision.
        let mut precision: Option<usize> = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = 0usize;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                p = p * 10 + d as usize;
                chars.next();
            }
            precision = Some(p);
        }

        let Some(conv) = chars.next() else {
            return Err(RunError::msg("Invalid conversion in sprintf: trailing %"));
        };

        let body = match conv {
            '%' => "%".to_owned(),
            'c' => chr_of(&take_arg(&mut next_arg)).to_text(),
            's' => {
                let mut s = take_arg(&mut next_arg).to_text();
                if let Some(p) = precision {
                    s.truncate(p);
                }
                s
            }
            'd' | 'i' => {
                let n = take_arg(&mut next_arg).to_int();
                if plus && n >= 0 {
                    format!("+{n}")
                } else if space && n >= 0 {
                    format!(" {n}")
                } else {
                    format!("{n}")
                }
            }
            'u' => format!("{}", take_arg(&mut next_arg).to_int().max(0)),
            'o' => format!("{:o}", take_arg(&mut next_arg).to_int()),
            'x' => format!("{:x}", take_arg(&mut next_arg).to_int()),
            'X' => format!("{:X}", take_arg(&mut next_arg).to_int()),
            'b' => format!("{:b}", take_arg(&mut next_arg).to_int()),
            'e' => {
                let n = take_arg(&mut next_arg).to_num();
                format!("{:.*e}", precision.unwrap_or(6), n)
            }
            'f' => {
                let n = take_arg(&mut next_arg).to_num();
                format!("{:.*}", precision.unwrap_or(6), n)
            }
            'g' => format_num(take_arg(&mut next_arg).to_num()),
            other => {
                return Err(RunError::msg(format!("Invalid conversion in sprintf: \"%{other}\"")));
            }
        };

        // Apply width with the requested padding and alignment.
        if body.len() >= width {
            out.push_str(&body);
        } else if left {
            let _ = write!(out, "{body:<width$}");
        } else if zero && matches!(conv, 'd' | 'i' | 'u' | 'o' | 'x' | 'X' | 'b' | 'e' | 'f' | 'g') {
            if let Some(rest) = body.strip_prefix('-') {
                let _ = write!(out, "-{rest:0>pad$}", pad = width - 1);
            } else {
                let _ = write!(out, "{body:0>width$}");
            }
        } else {
            let _ = write!(out, "{body:>width$}");
        }
    }

    Ok(Scalar::str(out))
}

// ============================================================================
// rand
// ============================================================================

/// xorshift64* generator backing `rand`. Deterministic given a seed, which
/// keeps fuzz-style tests reproducible.
#[derive(Debug)]
pub struct Rng {
    state: u64,
}

impl Rng {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed | 1, // never zero
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Uniform value in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scalar::cell;

    #[test]
    fn test_integer_arithmetic_stays_integer() {
        assert!(matches!(add(&Scalar::Int(2), &Scalar::Int(3)), Scalar::Int(5)));
        assert!(matches!(multiply(&Scalar::Int(4), &Scalar::Int(5)), Scalar::Int(20)));
    }

    #[test]
    fn test_string_operands_coerce() {
        assert_eq!(add(&Scalar::str("10"), &Scalar::str("20")).to_int(), 30);
        assert_eq!(add(&Scalar::str("3abc"), &Scalar::Int(1)).to_int(), 4);
    }

    #[test]
    fn test_division_by_zero() {
        assert!(divide(&Scalar::Int(1), &Scalar::Int(0)).is_err());
        assert_eq!(divide(&Scalar::Int(7), &Scalar::Int(2)).unwrap().to_num(), 3.5);
        assert!(matches!(divide(&Scalar::Int(10), &Scalar::Int(2)).unwrap(), Scalar::Int(5)));
    }

    #[test]
    fn test_modulo_sign_follows_right_operand() {
        assert_eq!(modulo(&Scalar::Int(7), &Scalar::Int(3)).unwrap().to_int(), 1);
        assert_eq!(modulo(&Scalar::Int(-7), &Scalar::Int(3)).unwrap().to_int(), 2);
        assert_eq!(modulo(&Scalar::Int(7), &Scalar::Int(-3)).unwrap().to_int(), -2);
    }

    #[test]
    fn test_boolean_shape() {
        assert_eq!(num_eq(&Scalar::Int(1), &Scalar::Int(1)).to_int(), 1);
        assert_eq!(num_eq(&Scalar::Int(1), &Scalar::Int(2)).to_text(), "");
    }

    #[test]
    fn test_three_way() {
        assert_eq!(num_three_way(&Scalar::Int(1), &Scalar::Int(2)).to_int(), -1);
        assert_eq!(str_three_way(&Scalar::str("b"), &Scalar::str("a")).to_int(), 1);
    }

    #[test]
    fn test_substr_rules() {
        let s = Scalar::str("hello");
        assert_eq!(substr(&s, &Scalar::Int(1), Some(&Scalar::Int(3))).to_text(), "ell");
        assert_eq!(substr(&s, &Scalar::Int(-3), None).to_text(), "llo");
        assert_eq!(substr(&s, &Scalar::Int(0), Some(&Scalar::Int(-1))).to_text(), "hell");
        assert!(!substr(&s, &Scalar::Int(9), None).defined());
    }

    #[test]
    fn test_split_whitespace_and_literal() {
        let fields = split(&Scalar::str(" "), &Scalar::str("  a  b c "), None);
        let texts: Vec<String> = fields.iter().map(Scalar::to_text).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);

        let fields = split(&Scalar::str(","), &Scalar::str("a,b,,"), None);
        assert_eq!(fields.len(), 2, "trailing empty fields stripped");

        let fields = split(&Scalar::str(","), &Scalar::str("a,b,c"), Some(2));
        let texts: Vec<String> = fields.iter().map(Scalar::to_text).collect();
        assert_eq!(texts, vec!["a", "b,c"]);
    }

    #[test]
    fn test_sprintf_basics() {
        let args = vec![cell(Scalar::Int(42)), cell(Scalar::str("hi"))];
        let s = sprintf(&Scalar::str("[%05d] %s %% %x"), &args);
        // %x with no remaining args formats undef (0).
        assert_eq!(s.unwrap().to_text(), "[00042] hi % 0");
    }

    #[test]
    fn test_sprintf_width_alignment() {
        let args = vec![cell(Scalar::str("ab"))];
        assert_eq!(sprintf(&Scalar::str("<%5s>"), &args).unwrap().to_text(), "<   ab>");
        assert_eq!(sprintf(&Scalar::str("<%-5s>"), &args).unwrap().to_text(), "<ab   >");
    }

    #[test]
    fn test_rng_is_deterministic() {
        let mut a = Rng::new(12345);
        let mut b = Rng::new(12345);
        for _ in 0..10 {
            let x = a.next_f64();
            assert_eq!(x, b.next_f64());
            assert!((0.0..1.0).contains(&x));
        }
    }
}
