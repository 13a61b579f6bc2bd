//! Output size expressions.
//!
//! Width and height are arithmetic expressions over the input geometry:
//! numbers, `+ - * /`, parentheses, unary minus, the variables
//! `iw ih in_w in_h ow oh out_w out_h a sar dar hsub vsub` and the functions
//! `min(a, b)`, `max(a, b)`, `trunc(x)`, `round(x)`.
//!
//! [`evaluate_dimensions`] applies the usual scale-filter rules on top:
//! `0` keeps the input size, `-1` keeps the aspect ratio and `-n` keeps the
//! aspect ratio rounded to a multiple of `n`.

use ionflow_core::error::{EngineError, Result};
use ionflow_core::types::PixelFormat;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Var {
    InW,
    InH,
    OutW,
    OutH,
    Aspect,
    Sar,
    Dar,
    HSub,
    VSub,
}

impl Var {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "iw" | "in_w" => Self::InW,
            "ih" | "in_h" => Self::InH,
            "ow" | "out_w" => Self::OutW,
            "oh" | "out_h" => Self::OutH,
            "a" => Self::Aspect,
            "sar" => Self::Sar,
            "dar" => Self::Dar,
            "hsub" => Self::HSub,
            "vsub" => Self::VSub,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Func {
    Min,
    Max,
    Trunc,
    Round,
}

impl Func {
    fn lookup(name: &str) -> Option<(Self, usize)> {
        Some(match name {
            "min" => (Self::Min, 2),
            "max" => (Self::Max, 2),
            "trunc" => (Self::Trunc, 1),
            "round" => (Self::Round, 1),
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Node {
    Num(f64),
    Var(Var),
    Neg(Box<Node>),
    Add(Box<Node>, Box<Node>),
    Sub(Box<Node>, Box<Node>),
    Mul(Box<Node>, Box<Node>),
    Div(Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

/// Values the expression variables resolve to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleVars {
    pub in_w: f64,
    pub in_h: f64,
    /// `NaN` until known.
    pub out_w: f64,
    pub out_h: f64,
    pub sar: f64,
    pub hsub: f64,
    pub vsub: f64,
}

impl ScaleVars {
    pub fn for_input(width: u32, height: u32, format: PixelFormat) -> Self {
        let (h_shift, v_shift) = format.chroma_shift();
        Self {
            in_w: width as f64,
            in_h: height as f64,
            out_w: f64::NAN,
            out_h: f64::NAN,
            sar: 1.0,
            hsub: (1u32 << h_shift) as f64,
            vsub: (1u32 << v_shift) as f64,
        }
    }

    fn get(&self, var: Var) -> f64 {
        match var {
            Var::InW => self.in_w,
            Var::InH => self.in_h,
            Var::OutW => self.out_w,
            Var::OutH => self.out_h,
            Var::Aspect => self.in_w / self.in_h,
            Var::Sar => self.sar,
            Var::Dar => self.in_w / self.in_h * self.sar,
            Var::HSub => self.hsub,
            Var::VSub => self.vsub,
        }
    }
}

/// A parsed size expression.
#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    source: String,
    root: Node,
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self> {
        let mut parser = Parser {
            src: source,
            bytes: source.as_bytes(),
            pos: 0,
        };
        let root = parser.expr()?;
        parser.skip_ws();
        if parser.pos != parser.bytes.len() {
            return Err(parser.error(format!("unexpected '{}'", &source[parser.pos..])));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, vars: &ScaleVars) -> f64 {
        eval(&self.root, vars)
    }
}

fn eval(node: &Node, vars: &ScaleVars) -> f64 {
    match node {
        Node::Num(v) => *v,
        Node::Var(var) => vars.get(*var),
        Node::Neg(a) => -eval(a, vars),
        Node::Add(a, b) => eval(a, vars) + eval(b, vars),
        Node::Sub(a, b) => eval(a, vars) - eval(b, vars),
        Node::Mul(a, b) => eval(a, vars) * eval(b, vars),
        Node::Div(a, b) => eval(a, vars) / eval(b, vars),
        Node::Call(func, args) => {
            let x = eval(&args[0], vars);
            match func {
                Func::Min => x.min(eval(&args[1], vars)),
                Func::Max => x.max(eval(&args[1], vars)),
                Func::Trunc => x.trunc(),
                Func::Round => x.round(),
            }
        }
    }
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: String) -> EngineError {
        EngineError::InvalidExpression {
            expr: self.src.to_string(),
            reason,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<Node> {
        let mut lhs = self.term()?;
        loop {
            if self.eat(b'+') {
                lhs = Node::Add(Box::new(lhs), Box::new(self.term()?));
            } else if self.eat(b'-') {
                lhs = Node::Sub(Box::new(lhs), Box::new(self.term()?));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn term(&mut self) -> Result<Node> {
        let mut lhs = self.unary()?;
        loop {
            if self.eat(b'*') {
                lhs = Node::Mul(Box::new(lhs), Box::new(self.unary()?));
            } else if self.eat(b'/') {
                lhs = Node::Div(Box::new(lhs), Box::new(self.unary()?));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn unary(&mut self) -> Result<Node> {
        if self.eat(b'-') {
            return Ok(Node::Neg(Box::new(self.unary()?)));
        }
        if self.eat(b'+') {
            return self.unary();
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let inner = self.expr()?;
                if !self.eat(b')') {
                    return Err(self.error("missing ')'".into()));
                }
                Ok(inner)
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.ident(),
            Some(c) => Err(self.error(format!("unexpected '{}'", c as char))),
            None => Err(self.error("unexpected end of expression".into())),
        }
    }

    fn number(&mut self) -> Result<Node> {
        let start = self.pos;
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_digit() || self.bytes[self.pos] == b'.')
        {
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];
        text.parse::<f64>()
            .map(Node::Num)
            .map_err(|_| self.error(format!("invalid number '{text}'")))
    }

    fn ident(&mut self) -> Result<Node> {
        let start = self.pos;
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        let name = &self.src[start..self.pos];

        if self.peek() == Some(b'(') {
            let (func, arity) = Func::lookup(name)
                .ok_or_else(|| self.error(format!("unknown function '{name}'")))?;
            self.pos += 1;
            let mut args = vec![self.expr()?];
            while self.eat(b',') {
                args.push(self.expr()?);
            }
            if !self.eat(b')') {
                return Err(self.error(format!("missing ')' after {name} arguments")));
            }
            if args.len() != arity {
                return Err(self.error(format!(
                    "{name} takes {arity} argument(s), got {}",
                    args.len()
                )));
            }
            return Ok(Node::Call(func, args));
        }

        Var::lookup(name)
            .map(Node::Var)
            .ok_or_else(|| self.error(format!("unknown variable '{name}'")))
    }
}

/// Round-to-nearest `a * b / c` for non-negative operands; `None` on overflow.
fn rescale(a: i64, b: i64, c: i64) -> Option<i64> {
    if c == 0 {
        return Some(0);
    }
    a.checked_mul(b)?.checked_add(c / 2).map(|n| n / c)
}

/// Truncate an evaluated size into `i32` range.
fn to_size(expr: &Expr, value: f64) -> Result<i64> {
    let value = value.trunc();
    if value < i32::MIN as f64 || value > i32::MAX as f64 {
        return Err(EngineError::InvalidExpression {
            expr: expr.source().to_string(),
            reason: format!("size {value} out of range"),
        });
    }
    Ok(value as i64)
}

fn finite(expr: &Expr, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EngineError::InvalidExpression {
            expr: expr.source().to_string(),
            reason: format!("evaluates to {value}"),
        })
    }
}

/// Resolve output size from width/height expressions for an input of
/// `in_w`×`in_h` in `format`.
///
/// Width is evaluated first (it may not reference the height), then height,
/// then width again so that each may refer to the other.
pub fn evaluate_dimensions(
    width: &Expr,
    height: &Expr,
    in_w: u32,
    in_h: u32,
    format: PixelFormat,
) -> Result<(u32, u32)> {
    let mut vars = ScaleVars::for_input(in_w, in_h, format);
    vars.out_w = width.eval(&vars);
    vars.out_h = finite(height, height.eval(&vars))?;
    vars.out_w = finite(width, width.eval(&vars))?;

    let (in_w, in_h) = (in_w as i64, in_h as i64);
    let mut w = to_size(width, vars.out_w)?;
    let mut h = to_size(height, vars.out_h)?;

    let factor_w = if w < -1 { -w } else { 1 };
    let factor_h = if h < -1 { -h } else { 1 };
    if w < 0 && h < 0 {
        w = 0;
        h = 0;
    }
    if w == 0 {
        w = in_w;
    }
    if h == 0 {
        h = in_h;
    }
    let overflow = |expr: &Expr| EngineError::InvalidExpression {
        expr: expr.source().to_string(),
        reason: "aspect-preserving size overflows".into(),
    };
    if w < 0 {
        w = in_h
            .checked_mul(factor_w)
            .and_then(|den| rescale(h, in_w, den))
            .and_then(|v| v.checked_mul(factor_w))
            .ok_or_else(|| overflow(width))?;
    }
    if h < 0 {
        h = in_w
            .checked_mul(factor_h)
            .and_then(|den| rescale(w, in_h, den))
            .and_then(|v| v.checked_mul(factor_h))
            .ok_or_else(|| overflow(height))?;
    }

    let clamp = |v: i64| v.clamp(0, u32::MAX as i64) as u32;
    Ok((clamp(w), clamp(h)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(w: &str, h: &str, in_w: u32, in_h: u32) -> Result<(u32, u32)> {
        evaluate_dimensions(
            &Expr::parse(w)?,
            &Expr::parse(h)?,
            in_w,
            in_h,
            PixelFormat::Nv21,
        )
    }

    #[test]
    fn identity_is_the_default() {
        assert_eq!(dims("iw", "ih", 1920, 1080).expect("dims"), (1920, 1080));
        assert_eq!(dims("in_w", "in_h", 640, 480).expect("dims"), (640, 480));
    }

    #[test]
    fn arithmetic_and_functions() {
        assert_eq!(dims("iw/2", "ih/2", 1920, 1080).expect("dims"), (960, 540));
        assert_eq!(dims("min(iw,1280)", "-(-ih) * 2/3", 1920, 1080).expect("dims"), (1280, 720));
        assert_eq!(dims("round(iw/3)", "trunc(ih/7)", 100, 100).expect("dims"), (33, 14));
        assert_eq!(dims("max(2*hsub, 8)", "vsub+1", 64, 64).expect("dims"), (8, 3));
    }

    #[test]
    fn width_and_height_may_reference_each_other() {
        assert_eq!(dims("1280", "ow*ih/iw", 1920, 1080).expect("dims"), (1280, 720));
        assert_eq!(dims("oh*iw/ih", "360", 1920, 1080).expect("dims"), (640, 360));
    }

    #[test]
    fn zero_and_negative_sizes_keep_aspect() {
        assert_eq!(dims("0", "0", 1920, 1080).expect("dims"), (1920, 1080));
        assert_eq!(dims("-1", "-1", 1920, 1080).expect("dims"), (1920, 1080));
        assert_eq!(dims("iw/2", "-1", 1920, 1080).expect("dims"), (960, 540));
        assert_eq!(dims("-2", "720", 1920, 1080).expect("dims"), (1280, 720));
        assert_eq!(dims("1000", "-4", 1920, 1080).expect("dims"), (1000, 564));
    }

    #[test]
    fn parse_errors_name_the_problem() {
        for (src, needle) in [
            ("iw*", "unexpected end"),
            ("foo", "unknown variable"),
            ("sqrt(iw)", "unknown function"),
            ("min(iw)", "takes 2"),
            ("(iw", "missing ')'"),
            ("iw ih", "unexpected"),
        ] {
            let err = Expr::parse(src).expect_err(src);
            assert!(matches!(err, EngineError::InvalidExpression { .. }));
            assert!(err.to_string().contains(needle), "{src}: {err}");
        }
    }

    #[test]
    fn non_finite_results_are_rejected() {
        let err = dims("iw/0", "ih", 64, 64).expect_err("inf");
        assert!(err.to_string().contains("inf"));
        // The first width pass may be NaN; only the final value counts.
        assert_eq!(dims("oh*2", "ih/2", 64, 64).expect("dims"), (64, 32));
    }

    #[test]
    fn oversized_values_are_rejected_not_wrapped() {
        for (w, h) in [
            ("-100000000000000000000", "ih"),
            ("-1", "10000000000000000"),
            ("iw", "3000000000"),
        ] {
            let err = dims(w, h, 1920, 1080).expect_err("out of range");
            assert!(matches!(err, EngineError::InvalidExpression { .. }), "{w}x{h}: {err}");
            assert!(err.to_string().contains("out of range"), "{w}x{h}: {err}");
        }
        // In range, but the aspect-preserving product does not fit.
        let err = dims("-2147483647", "2147483647", u32::MAX, u32::MAX).expect_err("overflow");
        assert!(err.to_string().contains("overflows"));
        assert_eq!(dims("-2", "1080", 1920, 1080).expect("dims"), (1920, 1080));
    }
}
