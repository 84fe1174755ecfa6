//! Named-placeholder rendering for command templates.
//!
//! Placeholders take the form `%(name)<flags><width>.<precision><conv>`, e.g.
//! `%(image)s` or `%(seeing)0.2f`. Supported conversions are `s`, `d`, `i`,
//! `f`, `F`, `e`, `E` and `x`; supported flags are `-`, `+`, space and `0`.
//! `%%` renders a literal percent sign. Anything else fails closed.

use std::collections::BTreeMap;

use serde_yaml::Value;

use crate::error::{HarnessError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    pub fn from_yaml(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Str(_) => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 => {
                write!(f, "{:.1}", v)
            }
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

pub type Namespace = BTreeMap<String, Scalar>;

#[derive(Debug, Default)]
struct FormatSpec {
    left: bool,
    zero: bool,
    plus: bool,
    space: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

pub fn render(template: &str, namespace: &Namespace) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((pos, c)) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some((_, '%')) => {
                out.push('%');
                continue;
            }
            Some((_, '(')) => {}
            Some(_) => {
                return Err(HarnessError::Interpolation(format!(
                    "positional placeholder at offset {}; use %(name)s",
                    pos
                )))
            }
            None => {
                return Err(HarnessError::Interpolation(
                    "template ends with a bare '%'".to_string(),
                ))
            }
        }

        let mut name = String::new();
        loop {
            match chars.next() {
                Some((_, ')')) => break,
                Some((_, ch)) => name.push(ch),
                None => {
                    return Err(HarnessError::Interpolation(format!(
                        "unterminated placeholder at offset {}",
                        pos
                    )))
                }
            }
        }

        let mut spec = FormatSpec::default();
        while let Some(&(_, ch)) = chars.peek() {
            match ch {
                '-' => spec.left = true,
                '0' => spec.zero = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                _ => break,
            }
            chars.next();
        }
        spec.width = take_number(&mut chars);
        if matches!(chars.peek(), Some((_, '.'))) {
            chars.next();
            spec.precision = Some(take_number(&mut chars).unwrap_or(0));
        }
        let conv = match chars.next() {
            Some((_, ch)) => ch,
            None => {
                return Err(HarnessError::Interpolation(format!(
                    "placeholder '{}' has no conversion",
                    name
                )))
            }
        };

        let value = namespace.get(&name).ok_or_else(|| {
            HarnessError::Interpolation(format!("unknown field '{}' in command template", name))
        })?;
        out.push_str(&format_value(&name, value, &spec, conv)?);
    }
    Ok(out)
}

fn take_number<I>(chars: &mut std::iter::Peekable<I>) -> Option<usize>
where
    I: Iterator<Item = (usize, char)>,
{
    let mut digits = String::new();
    while let Some(&(_, ch)) = chars.peek() {
        if !ch.is_ascii_digit() {
            break;
        }
        digits.push(ch);
        chars.next();
    }
    digits.parse().ok()
}

fn format_value(name: &str, value: &Scalar, spec: &FormatSpec, conv: char) -> Result<String> {
    let type_error = || {
        HarnessError::Interpolation(format!(
            "field '{}' is a string and cannot be formatted with %{}",
            name, conv
        ))
    };
    match conv {
        's' => {
            let mut text = value.to_string();
            if let Some(p) = spec.precision {
                text = text.chars().take(p).collect();
            }
            Ok(pad(String::new(), text, spec, false))
        }
        'd' | 'i' => {
            let v = value.as_i64().ok_or_else(type_error)?;
            Ok(pad(sign(v < 0, spec), v.unsigned_abs().to_string(), spec, true))
        }
        'x' => {
            let v = value.as_i64().ok_or_else(type_error)?;
            Ok(pad(sign(v < 0, spec), format!("{:x}", v.unsigned_abs()), spec, true))
        }
        'f' | 'F' => {
            let v = value.as_f64().ok_or_else(type_error)?;
            let body = format!("{:.*}", spec.precision.unwrap_or(6), v.abs());
            let body = if conv == 'F' { body.to_uppercase() } else { body };
            Ok(pad(sign(v.is_sign_negative() && v != 0.0, spec), body, spec, true))
        }
        'e' | 'E' => {
            let v = value.as_f64().ok_or_else(type_error)?;
            let body = exponent(v.abs(), spec.precision.unwrap_or(6));
            let body = if conv == 'E' { body.to_uppercase() } else { body };
            Ok(pad(sign(v.is_sign_negative() && v != 0.0, spec), body, spec, true))
        }
        other => Err(HarnessError::Interpolation(format!(
            "unsupported conversion '%{}' for field '{}'",
            other, name
        ))),
    }
}

fn sign(negative: bool, spec: &FormatSpec) -> String {
    if negative {
        "-".to_string()
    } else if spec.plus {
        "+".to_string()
    } else if spec.space {
        " ".to_string()
    } else {
        String::new()
    }
}

fn pad(sign: String, body: String, spec: &FormatSpec, numeric: bool) -> String {
    let len = sign.chars().count() + body.chars().count();
    let fill = spec.width.unwrap_or(0).saturating_sub(len);
    if fill == 0 {
        return sign + &body;
    }
    if spec.left {
        format!("{}{}{}", sign, body, " ".repeat(fill))
    } else if spec.zero && numeric {
        format!("{}{}{}", sign, "0".repeat(fill), body)
    } else {
        format!("{}{}{}", " ".repeat(fill), sign, body)
    }
}

/// `1.5e0` -> `1.500000e+00`: signed exponent with at least two digits.
fn exponent(v: f64, precision: usize) -> String {
    let raw = format!("{:.*e}", precision, v);
    match raw.split_once('e') {
        Some((mantissa, exp)) => {
            let (exp_sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, exp_sign, digits)
        }
        None => raw,
    }
}
