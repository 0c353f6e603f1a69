use crate::error::CompileError;
use std::collections::BTreeMap;

/// Syntax tree of a formula or a declarative template, before name resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprAst {
    Call {
        name: String,
        args: Vec<ExprAst>,
        kwargs: BTreeMap<String, ExprAst>,
    },
    Identifier(String),
    Number(f64),
    Unary {
        op: UnaryOp,
        expr: Box<ExprAst>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<ExprAst>,
        rhs: Box<ExprAst>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Pow => "^",
        }
    }

    /// (left, right) binding power. `^` is right-associative and binds tighter
    /// than a leading sign.
    const fn binding_power(self) -> (u8, u8) {
        match self {
            Self::Add | Self::Sub => (1, 2),
            Self::Mul | Self::Div => (3, 4),
            Self::Pow => (8, 7),
        }
    }
}

const PREFIX_POWER: u8 = 5;

/// Deepest nesting of parentheses, calls and signs a formula may use.
pub const MAX_NESTING: usize = 256;
/// Longest formula, in tokens. Also bounds the depth of operator chains.
pub const MAX_TOKENS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tok<'s> {
    Ident(&'s str),
    Num(f64),
    Op(BinaryOp),
    Comma,
    Assign,
    Open,
    Close,
    End,
}

impl std::fmt::Display for Tok<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tok::Ident(name) => write!(f, "`{name}`"),
            Tok::Num(value) => write!(f, "`{value}`"),
            Tok::Op(op) => write!(f, "`{}`", op.symbol()),
            Tok::Comma => f.write_str("`,`"),
            Tok::Assign => f.write_str("`=`"),
            Tok::Open => f.write_str("`(`"),
            Tok::Close => f.write_str("`)`"),
            Tok::End => f.write_str("end of input"),
        }
    }
}

/// A token and the byte offset it starts at.
type Spanned<'s> = (Tok<'s>, usize);

#[inline]
fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

#[inline]
fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Whether `name` is usable as an identifier inside a formula.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if is_ident_start(c)) && chars.all(is_ident_continue)
}

fn invalid(source: &str, at: usize, reason: impl std::fmt::Display) -> CompileError {
    CompileError::InvalidExpression {
        expr: source.to_string(),
        reason: format!("{reason} at offset {at}"),
    }
}

/// Length of the numeric literal at the start of `rest`: digits, one `.`,
/// and an optional signed exponent.
fn number_len(rest: &str) -> usize {
    let bytes = rest.as_bytes();
    let digits = |from: usize| {
        bytes[from..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };
    let mut end = digits(0);
    if bytes.get(end) == Some(&b'.') {
        end += 1 + digits(end + 1);
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let n = digits(exp);
        if n > 0 {
            end = exp + n;
        }
    }
    end
}

fn tokenize(source: &str) -> Result<Vec<Spanned<'_>>, CompileError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(c) = source[pos..].chars().next() {
        let start = pos;
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        let tok = match c {
            '+' => Tok::Op(BinaryOp::Add),
            '-' => Tok::Op(BinaryOp::Sub),
            '/' => Tok::Op(BinaryOp::Div),
            '^' => Tok::Op(BinaryOp::Pow),
            // `**` is another spelling of `^`.
            '*' if source[pos + 1..].starts_with('*') => {
                pos += 1;
                Tok::Op(BinaryOp::Pow)
            }
            '*' => Tok::Op(BinaryOp::Mul),
            ',' => Tok::Comma,
            '=' => Tok::Assign,
            '(' => Tok::Open,
            ')' => Tok::Close,
            c if is_ident_start(c) => {
                let len = source[pos..]
                    .find(|ch: char| !is_ident_continue(ch))
                    .unwrap_or(source.len() - pos);
                pos += len;
                out.push((Tok::Ident(&source[start..pos]), start));
                continue;
            }
            c if c.is_ascii_digit() || c == '.' => {
                pos += number_len(&source[pos..]).max(1);
                let raw = &source[start..pos];
                let value = raw
                    .parse::<f64>()
                    .map_err(|_| invalid(source, start, format_args!("invalid number `{raw}`")))?;
                out.push((Tok::Num(value), start));
                continue;
            }
            other => {
                return Err(invalid(
                    source,
                    start,
                    format_args!("unexpected character `{other}`"),
                ))
            }
        };
        pos += c.len_utf8();
        out.push((tok, start));
    }
    out.push((Tok::End, source.len()));
    Ok(out)
}

pub fn parse_expression(source: &str) -> Result<ExprAst, CompileError> {
    let tokens = tokenize(source)?;
    if tokens.len() > MAX_TOKENS {
        return Err(invalid(
            source,
            tokens[MAX_TOKENS].1,
            format_args!("formula is longer than {MAX_TOKENS} tokens"),
        ));
    }
    let mut parser = Parser {
        source,
        tokens: &tokens,
        at: 0,
        depth: 0,
    };
    if parser.peek() == Tok::End {
        return Err(invalid(source, 0, "empty expression"));
    }
    let expr = parser.expr(0)?;
    match parser.bump() {
        (Tok::End, _) => Ok(expr),
        (tok, at) => Err(invalid(source, at, format_args!("unexpected trailing {tok}"))),
    }
}

struct Parser<'s, 't> {
    source: &'s str,
    tokens: &'t [Spanned<'s>],
    at: usize,
    depth: usize,
}

impl<'s> Parser<'s, '_> {
    fn peek(&self) -> Tok<'s> {
        self.tokens.get(self.at).map_or(Tok::End, |(tok, _)| *tok)
    }

    fn bump(&mut self) -> Spanned<'s> {
        let spanned = self
            .tokens
            .get(self.at)
            .copied()
            .unwrap_or((Tok::End, self.source.len()));
        if self.at < self.tokens.len() {
            self.at += 1;
        }
        spanned
    }

    fn error_here(&self, reason: impl std::fmt::Display) -> CompileError {
        let at = self
            .tokens
            .get(self.at)
            .map_or(self.source.len(), |(_, at)| *at);
        invalid(self.source, at, reason)
    }

    fn expect(&mut self, want: Tok<'static>) -> Result<(), CompileError> {
        match self.bump() {
            (tok, _) if tok == want => Ok(()),
            (tok, at) => Err(invalid(self.source, at, format_args!("expected {want}, found {tok}"))),
        }
    }

    /// Precedence climbing over the binary operators. Every nested construct
    /// comes back through here, so this is where depth is bounded.
    fn expr(&mut self, min_power: u8) -> Result<ExprAst, CompileError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error_here(format_args!("nesting deeper than {MAX_NESTING} levels")));
        }
        self.depth += 1;
        let parsed = self.climb(min_power);
        self.depth -= 1;
        parsed
    }

    fn climb(&mut self, min_power: u8) -> Result<ExprAst, CompileError> {
        let mut lhs = self.prefix()?;
        while let Tok::Op(op) = self.peek() {
            let (left, right) = op.binding_power();
            if left < min_power {
                break;
            }
            self.bump();
            let rhs = self.expr(right)?;
            lhs = ExprAst::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<ExprAst, CompileError> {
        let op = match self.peek() {
            Tok::Op(BinaryOp::Add) => UnaryOp::Plus,
            Tok::Op(BinaryOp::Sub) => UnaryOp::Minus,
            _ => return self.atom(),
        };
        self.bump();
        let expr = self.expr(PREFIX_POWER)?;
        Ok(ExprAst::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn atom(&mut self) -> Result<ExprAst, CompileError> {
        match self.bump() {
            (Tok::Num(value), _) => Ok(ExprAst::Number(value)),
            (Tok::Ident(name), _) if self.peek() == Tok::Open => {
                self.bump();
                let (args, kwargs) = self.call_args(name)?;
                Ok(ExprAst::Call {
                    name: name.to_string(),
                    args,
                    kwargs,
                })
            }
            (Tok::Ident(name), _) => Ok(ExprAst::Identifier(name.to_string())),
            (Tok::Open, _) => {
                let inner = self.expr(0)?;
                self.expect(Tok::Close)?;
                Ok(inner)
            }
            (tok, at) => Err(invalid(self.source, at, format_args!("unexpected {tok}"))),
        }
    }

    /// Arguments after the opening parenthesis, through the closing one.
    /// Positional arguments come first; keywords are `name = expr`.
    fn call_args(
        &mut self,
        callee: &str,
    ) -> Result<(Vec<ExprAst>, BTreeMap<String, ExprAst>), CompileError> {
        let mut args = Vec::new();
        let mut kwargs = BTreeMap::new();
        if self.peek() == Tok::Close {
            self.bump();
            return Ok((args, kwargs));
        }
        loop {
            let keyword = match (self.peek(), self.tokens.get(self.at + 1)) {
                (Tok::Ident(name), Some((Tok::Assign, _))) => Some(name),
                _ => None,
            };
            if let Some(name) = keyword {
                self.at += 2;
                let value = self.expr(0)?;
                if kwargs.insert(name.to_string(), value).is_some() {
                    return Err(self.error_here(format_args!(
                        "keyword `{name}` repeated in call to `{callee}`"
                    )));
                }
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error_here(format_args!(
                        "positional argument after keywords in call to `{callee}`"
                    )));
                }
                args.push(self.expr(0)?);
            }
            match self.bump() {
                (Tok::Comma, _) => {}
                (Tok::Close, _) => return Ok((args, kwargs)),
                (tok, at) => {
                    return Err(invalid(
                        self.source,
                        at,
                        format_args!("expected `,` or `)` in call to `{callee}`, found {tok}"),
                    ))
                }
            }
        }
    }
}
