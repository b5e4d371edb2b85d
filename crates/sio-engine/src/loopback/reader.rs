//! Reader for the statement dialect the client generates: literals, global
//! reads, `var` assignment, plain calls and single-level method calls.

use std::collections::BTreeMap;

use crate::engine::{EngineError, EngineValue};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Expr {
    Literal(EngineValue),
    Ident(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    Method {
        target: String,
        method: String,
        args: Vec<Expr>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Statement {
    Var { name: String, value: Expr },
    Expr(Expr),
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Punct(char),
}

pub(crate) fn parse_program(source: &str) -> Result<Vec<Statement>, EngineError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut statements = Vec::new();
    while !parser.at_end() {
        if parser.eat(';') {
            continue;
        }
        statements.push(parser.statement()?);
        if !parser.at_end() && !parser.eat(';') {
            return Err(parser.unexpected());
        }
    }
    Ok(statements)
}

fn tokenize(source: &str) -> Result<Vec<Token>, EngineError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                loop {
                    if i + 1 >= chars.len() {
                        return Err(EngineError::Syntax("unterminated comment".into()));
                    }
                    if chars[i] == '*' && chars[i + 1] == '/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            '\'' | '"' => {
                let (text, next) = read_string(&chars, i)?;
                tokens.push(Token::Str(text));
                i = next;
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let (number, next) = read_number(&chars, i)?;
                tokens.push(Token::Num(number));
                i = next;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '(' | ')' | '[' | ']' | '{' | '}' | ',' | ':' | ';' | '.' | '=' | '-' => {
                tokens.push(Token::Punct(c));
                i += 1;
            }
            other => {
                return Err(EngineError::Syntax(format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

fn read_string(chars: &[char], start: usize) -> Result<(String, usize), EngineError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    let mut pending_high: Option<u16> = None;

    loop {
        let c = *chars
            .get(i)
            .ok_or_else(|| EngineError::Syntax("unterminated string literal".into()))?;
        i += 1;

        if c == quote {
            break;
        }
        if c == '\n' || c == '\r' {
            return Err(EngineError::Syntax("unterminated string literal".into()));
        }
        if c != '\\' {
            flush_surrogate(&mut out, &mut pending_high);
            out.push(c);
            continue;
        }

        let escape = *chars
            .get(i)
            .ok_or_else(|| EngineError::Syntax("unterminated escape".into()))?;
        i += 1;
        if escape == 'u' {
            let hex: String = chars.get(i..i + 4).map(|s| s.iter().collect()).unwrap_or_default();
            let unit = u16::from_str_radix(&hex, 16)
                .map_err(|_| EngineError::Syntax(format!("invalid unicode escape '\\u{hex}'")))?;
            i += 4;
            push_code_unit(&mut out, &mut pending_high, unit);
            continue;
        }

        flush_surrogate(&mut out, &mut pending_high);
        out.push(match escape {
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            'b' => '\u{8}',
            'f' => '\u{c}',
            'v' => '\u{b}',
            '0' => '\0',
            other => other,
        });
    }

    flush_surrogate(&mut out, &mut pending_high);
    Ok((out, i))
}

fn push_code_unit(out: &mut String, pending_high: &mut Option<u16>, unit: u16) {
    match unit {
        0xD800..=0xDBFF => {
            flush_surrogate(out, pending_high);
            *pending_high = Some(unit);
        }
        0xDC00..=0xDFFF => match pending_high.take() {
            Some(high) => {
                let code = 0x10000 + ((u32::from(high) - 0xD800) << 10) + (u32::from(unit) - 0xDC00);
                out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            None => out.push(char::REPLACEMENT_CHARACTER),
        },
        _ => {
            flush_surrogate(out, pending_high);
            out.push(char::from_u32(u32::from(unit)).unwrap_or(char::REPLACEMENT_CHARACTER));
        }
    }
}

/// A lone high surrogate becomes U+FFFD.
fn flush_surrogate(out: &mut String, pending_high: &mut Option<u16>) {
    if pending_high.take().is_some() {
        out.push(char::REPLACEMENT_CHARACTER);
    }
}

fn read_number(chars: &[char], start: usize) -> Result<(f64, usize), EngineError> {
    let mut i = start;
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        i += 1;
        if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
            i += 1;
        }
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    let text: String = chars[start..i].iter().collect();
    let number = text
        .parse::<f64>()
        .map_err(|_| EngineError::Syntax(format!("invalid number '{text}'")))?;
    Ok((number, i))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, punct: char) -> bool {
        if self.peek() == Some(&Token::Punct(punct)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: char) -> Result<(), EngineError> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn unexpected(&self) -> EngineError {
        match self.peek() {
            Some(token) => EngineError::Syntax(format!("unexpected token {token:?}")),
            None => EngineError::Syntax("unexpected end of input".into()),
        }
    }

    fn ident(&mut self) -> Result<String, EngineError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            _ => {
                self.pos -= 1;
                Err(self.unexpected())
            }
        }
    }

    fn statement(&mut self) -> Result<Statement, EngineError> {
        if self.peek() == Some(&Token::Ident("var".into())) {
            self.pos += 1;
            let name = self.ident()?;
            self.expect('=')?;
            let value = self.expr()?;
            return Ok(Statement::Var { name, value });
        }
        Ok(Statement::Expr(self.expr()?))
    }

    fn expr(&mut self) -> Result<Expr, EngineError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Literal(EngineValue::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(EngineValue::String(s))),
            Some(Token::Punct('-')) => match self.next() {
                Some(Token::Num(n)) => Ok(Expr::Literal(EngineValue::Number(-n))),
                Some(Token::Ident(name)) if name == "Infinity" => {
                    Ok(Expr::Literal(EngineValue::Number(f64::NEG_INFINITY)))
                }
                _ => {
                    self.pos -= 1;
                    Err(self.unexpected())
                }
            },
            Some(Token::Punct('[')) => {
                let items = self.list(']', Self::expr)?;
                Ok(Expr::Array(items))
            }
            Some(Token::Punct('{')) => {
                let entries = self.list('}', Self::entry)?;
                Ok(Expr::Object(entries))
            }
            Some(Token::Ident(name)) => self.ident_expr(name),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected())
            }
        }
    }

    fn ident_expr(&mut self, name: String) -> Result<Expr, EngineError> {
        let literal = match name.as_str() {
            "null" => Some(EngineValue::Null),
            "undefined" => Some(EngineValue::Undefined),
            "true" => Some(EngineValue::Bool(true)),
            "false" => Some(EngineValue::Bool(false)),
            "NaN" => Some(EngineValue::Number(f64::NAN)),
            "Infinity" => Some(EngineValue::Number(f64::INFINITY)),
            _ => None,
        };
        if let Some(value) = literal {
            return Ok(Expr::Literal(value));
        }

        if self.eat('(') {
            let args = self.list(')', Self::expr)?;
            return Ok(Expr::Call { callee: name, args });
        }
        if self.eat('.') {
            let method = self.ident()?;
            self.expect('(')?;
            let args = self.list(')', Self::expr)?;
            return Ok(Expr::Method {
                target: name,
                method,
                args,
            });
        }
        Ok(Expr::Ident(name))
    }

    fn entry(&mut self) -> Result<(String, Expr), EngineError> {
        let key = match self.next() {
            Some(Token::Ident(key)) | Some(Token::Str(key)) => key,
            Some(Token::Num(n)) => format_key(n),
            _ => {
                self.pos -= 1;
                return Err(self.unexpected());
            }
        };
        self.expect(':')?;
        Ok((key, self.expr()?))
    }

    /// Comma-separated items up to `close`; the opening bracket is consumed.
    fn list<T>(
        &mut self,
        close: char,
        mut item: impl FnMut(&mut Self) -> Result<T, EngineError>,
    ) -> Result<Vec<T>, EngineError> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(item(self)?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(',')?;
        }
    }
}

fn format_key(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Evaluate an expression made only of literals, arrays and objects.
pub(crate) fn constant(expr: &Expr) -> Option<EngineValue> {
    match expr {
        Expr::Literal(value) => Some(value.clone()),
        Expr::Array(items) => items.iter().map(constant).collect::<Option<Vec<_>>>().map(EngineValue::Array),
        Expr::Object(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                map.insert(key.clone(), constant(value)?);
            }
            Some(EngineValue::Object(map))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(source: &str) -> Expr {
        let mut program = parse_program(source).unwrap();
        assert_eq!(program.len(), 1, "{program:?}");
        match program.remove(0) {
            Statement::Expr(expr) => expr,
            other => panic!("expected expression, got {other:?}"),
        }
    }

    #[test]
    fn reads_literals() {
        assert_eq!(single("null"), Expr::Literal(EngineValue::Null));
        assert_eq!(single("-2.5e3"), Expr::Literal(EngineValue::Number(-2500.0)));
        assert_eq!(single("-Infinity"), Expr::Literal(EngineValue::Number(f64::NEG_INFINITY)));
        assert!(matches!(single("NaN"), Expr::Literal(EngineValue::Number(n)) if n.is_nan()));
        assert_eq!(single("'it\\'s'"), Expr::Literal(EngineValue::String("it's".into())));
    }

    #[test]
    fn reads_escapes_and_surrogate_pairs() {
        assert_eq!(
            single(r#""a\nb \u2028\ud83d\ude00""#),
            Expr::Literal(EngineValue::String("a\nb\u{2028}\u{1F600}".into()))
        );
        assert_eq!(
            single(r"'\ud83d'"),
            Expr::Literal(EngineValue::String("\u{FFFD}".into()))
        );
    }

    #[test]
    fn reads_composites() {
        let expr = single(r#"{"a": [1, true], b: {}, 'c': null}"#);
        let value = constant(&expr).unwrap();
        let EngineValue::Object(map) = value else {
            panic!("expected object");
        };
        assert_eq!(
            map.get("a"),
            Some(&EngineValue::Array(vec![EngineValue::Number(1.0), EngineValue::Bool(true)]))
        );
        assert_eq!(map.get("b"), Some(&EngineValue::Object(BTreeMap::new())));
        assert_eq!(map.get("c"), Some(&EngineValue::Null));
    }

    #[test]
    fn reads_statements() {
        let program = parse_program(
            "var sio_client = io('http://h:1', {timeout: 20000}); sio_client.on('connect', sio_on_connect);",
        )
        .unwrap();
        assert_eq!(program.len(), 2);
        assert!(matches!(&program[0], Statement::Var { name, value: Expr::Call { callee, .. } }
            if name == "sio_client" && callee == "io"));
        assert!(matches!(&program[1], Statement::Expr(Expr::Method { target, method, args })
            if target == "sio_client" && method == "on" && args.len() == 2));
    }

    #[test]
    fn skips_comments() {
        let program = parse_program("/* header */ // line\n sio_client;").unwrap();
        assert_eq!(program, vec![Statement::Expr(Expr::Ident("sio_client".into()))]);
    }

    #[test]
    fn rejects_malformed_input() {
        for source in ["'open", "a.b.c()", "[1,", "{a 1}", "1 2", "#"] {
            assert!(
                matches!(parse_program(source), Err(EngineError::Syntax(_))),
                "accepted {source:?}"
            );
        }
    }
}
