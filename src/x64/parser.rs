// This module turns FASM-flavoured Intel-syntax source into a flat list of statements for
// the default engine. Parsing is line oriented: each line is lexed into tokens (identifiers,
// numbers, quoted strings and punctuation, stopping at a `;` comment), leading labels are
// peeled off, and the remainder becomes a code size directive, a data definition, a
// reservation or an instruction with its operands. Operand expressions are folded into a
// linear form (constant + register*scale + symbol) which is then classified as a register,
// immediate, symbol or memory reference. Local labels starting with a dot are qualified with
// the most recent global label. Errors are collected per line so one pass reports every
// malformed line rather than stopping at the first.

//! Source parser for the default engine.

use crate::core::engine::Diagnostic;
use crate::core::symbols::is_ident_char;

/// A general purpose register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gpr {
    /// Operand width in bits (8, 16, 32 or 64).
    pub width: u32,
    /// Hardware register number, 0-15.
    pub number: u8,
    /// One of AH, CH, DH or BH.
    pub high: bool,
}

const GPR64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
const GPR32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d",
    "r12d", "r13d", "r14d", "r15d",
];
const GPR16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w",
    "r13w", "r14w", "r15w",
];
const GPR8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];
const GPR8_HIGH: [&str; 4] = ["ah", "ch", "dh", "bh"];

impl Gpr {
    /// Look up a register by name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        let find = |table: &[&str]| table.iter().position(|&reg| reg == lower);

        if let Some(number) = find(&GPR64) {
            return Some(Self::new(64, number));
        }
        if let Some(number) = find(&GPR32) {
            return Some(Self::new(32, number));
        }
        if let Some(number) = find(&GPR16) {
            return Some(Self::new(16, number));
        }
        if let Some(number) = find(&GPR8) {
            return Some(Self::new(8, number));
        }
        find(&GPR8_HIGH).map(|number| Gpr {
            width: 8,
            number: number as u8 + 4,
            high: true,
        })
    }

    fn new(width: u32, number: usize) -> Self {
        Self {
            width,
            number: number as u8,
            high: false,
        }
    }

    pub fn name(self) -> &'static str {
        let idx = self.number as usize;
        match (self.width, self.high) {
            (8, true) => GPR8_HIGH[idx - 4],
            (8, false) => GPR8[idx],
            (16, _) => GPR16[idx],
            (32, _) => GPR32[idx],
            _ => GPR64[idx],
        }
    }

    /// Whether the register can only be encoded in 64-bit mode.
    pub fn requires_long_mode(self) -> bool {
        self.width == 64 || self.number >= 8 || (self.width == 8 && self.number >= 4 && !self.high)
    }
}

/// A memory reference `size [base + index*scale + displacement]` or `size [label]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    /// Explicit operand size in bits.
    pub size: Option<u32>,
    pub base: Option<Gpr>,
    /// Index register and scale (1, 2, 4 or 8).
    pub index: Option<(Gpr, u32)>,
    pub displacement: i64,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Register(Gpr),
    Immediate(i64),
    /// A reference to a label.
    Symbol(String),
    Memory(Memory),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataItem {
    Value(i64),
    Bytes(Vec<u8>),
    /// `?`, emitted as zero.
    Uninitialized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    /// A line that only defines labels.
    Empty,
    /// `use32` / `use64`.
    Mode(u32),
    Instruction {
        mnemonic: String,
        operands: Vec<Operand>,
    },
    /// `db`/`dw`/`dd`/`dq`; `unit` is the element size in bytes.
    Data { unit: usize, items: Vec<DataItem> },
    /// `rb`/`rw`/`rd`/`rq`.
    Reserve { unit: usize, count: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 1-based source line.
    pub line: usize,
    /// Labels defined on this line, fully qualified.
    pub labels: Vec<String>,
    pub kind: StatementKind,
}

/// Parse a whole source text.
pub fn parse_source(source: &str) -> Result<Vec<Statement>, Vec<Diagnostic>> {
    let mut parser = Parser::default();
    let mut statements = Vec::new();
    let mut diagnostics = Vec::new();

    for (idx, text) in source.lines().enumerate() {
        let line = idx + 1;
        match parser.parse_line(line, text) {
            Ok(Some(statement)) => statements.push(statement),
            Ok(None) => {}
            Err(message) => diagnostics.push(Diagnostic::at_line(line, message).with_source(text)),
        }
    }

    if diagnostics.is_empty() {
        Ok(statements)
    } else {
        Err(diagnostics)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Number(i64),
    Str(Vec<u8>),
    Punct(char),
}

fn describe(token: Option<&Token>) -> String {
    match token {
        None => "end of line".to_string(),
        Some(Token::Ident(name)) => format!("'{name}'"),
        Some(Token::Number(value)) => format!("'{value}'"),
        Some(Token::Str(_)) => "string".to_string(),
        Some(Token::Punct(ch)) => format!("'{ch}'"),
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(start, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
        } else if ch == ';' {
            break;
        } else if ch == '\'' || ch == '"' {
            chars.next();
            let mut bytes = Vec::new();
            let mut closed = false;
            while let Some((_, c)) = chars.next() {
                if c == ch {
                    // A doubled quote stands for the quote character itself.
                    if chars.peek().map(|&(_, next)| next) == Some(ch) {
                        chars.next();
                    } else {
                        closed = true;
                        break;
                    }
                }
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            if !closed {
                return Err("unterminated string".to_string());
            }
            tokens.push(Token::Str(bytes));
        } else if is_ident_char(ch) {
            let mut end = start;
            while let Some(&(idx, c)) = chars.peek() {
                if !is_ident_char(c) {
                    break;
                }
                end = idx + c.len_utf8();
                chars.next();
            }
            let word = &text[start..end];
            let token = match parse_number(word) {
                Some(value) => Token::Number(value),
                None if word.starts_with(|c: char| c.is_ascii_digit()) => {
                    return Err(format!("invalid number '{word}'"));
                }
                None => Token::Ident(word.to_string()),
            };
            tokens.push(token);
        } else if matches!(ch, ',' | '[' | ']' | '+' | '-' | '*' | '(' | ')' | ':') {
            chars.next();
            tokens.push(Token::Punct(ch));
        } else {
            return Err(format!("unexpected character '{ch}'"));
        }
    }

    Ok(tokens)
}

/// Parse a numeric literal: decimal, `0x`/`$`/`h` hexadecimal or `0b`/`b` binary.
///
/// Values are 64 bits wide; literals above `i64::MAX` wrap.
pub fn parse_number(word: &str) -> Option<i64> {
    let lower = word.to_ascii_lowercase();
    let (digits, radix) = if let Some(hex) = lower.strip_prefix("0x") {
        (hex, 16)
    } else if let Some(hex) = lower.strip_prefix('$') {
        (hex, 16)
    } else if !lower.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    } else if let Some(hex) = lower.strip_suffix('h') {
        (hex, 16)
    } else if let Some(bin) = lower.strip_prefix("0b") {
        (bin, 2)
    } else if let Some(bin) = lower.strip_suffix('b') {
        (bin, 2)
    } else {
        (lower.as_str(), 10)
    };

    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, radix).ok().map(|value| value as i64)
}

/// Little-endian value of a short quoted string used as a number.
fn char_constant(bytes: &[u8]) -> Result<i64, String> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err("character constant must hold 1 to 8 bytes".to_string());
    }
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(buf))
}

fn is_reserved(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    Gpr::from_name(&lower).is_some()
        || data_unit(&lower).is_some()
        || reserve_unit(&lower).is_some()
        || size_keyword(&lower).is_some()
        || matches!(lower.as_str(), "use32" | "use64" | "ptr" | "short" | "near")
}

fn data_unit(word: &str) -> Option<usize> {
    match word {
        "db" => Some(1),
        "dw" => Some(2),
        "dd" => Some(4),
        "dq" => Some(8),
        _ => None,
    }
}

fn reserve_unit(word: &str) -> Option<usize> {
    match word {
        "rb" => Some(1),
        "rw" => Some(2),
        "rd" => Some(4),
        "rq" => Some(8),
        _ => None,
    }
}

fn size_keyword(word: &str) -> Option<u32> {
    match word {
        "byte" => Some(8),
        "word" => Some(16),
        "dword" => Some(32),
        "qword" => Some(64),
        _ => None,
    }
}

/// `constant + sum(register * scale) + sum(symbol * coefficient)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Linear {
    constant: i64,
    registers: Vec<(Gpr, i64)>,
    symbols: Vec<(String, i64)>,
}


impl Linear {
    fn constant(value: i64) -> Self {
        Self {
            constant: value,
            ..Self::default()
        }
    }

    fn is_constant(&self) -> bool {
        self.registers.is_empty() && self.symbols.is_empty()
    }

    fn scale(mut self, factor: i64) -> Self {
        self.constant = self.constant.wrapping_mul(factor);
        for (_, coeff) in &mut self.registers {
            *coeff = coeff.wrapping_mul(factor);
        }
        for (_, coeff) in &mut self.symbols {
            *coeff = coeff.wrapping_mul(factor);
        }
        self
    }

    fn add(mut self, other: Linear) -> Self {
        self.constant = self.constant.wrapping_add(other.constant);
        for (reg, coeff) in other.registers {
            match self.registers.iter_mut().find(|(r, _)| *r == reg) {
                Some((_, existing)) => *existing = existing.wrapping_add(coeff),
                None => self.registers.push((reg, coeff)),
            }
        }
        for (name, coeff) in other.symbols {
            match self.symbols.iter_mut().find(|(s, _)| *s == name) {
                Some((_, existing)) => *existing = existing.wrapping_add(coeff),
                None => self.symbols.push((name, coeff)),
            }
        }
        self.registers.retain(|&(_, coeff)| coeff != 0);
        self.symbols.retain(|(_, coeff)| *coeff != 0);
        self
    }

    fn mul(self, other: Linear) -> Result<Self, String> {
        if other.is_constant() {
            Ok(self.scale(other.constant))
        } else if self.is_constant() {
            Ok(other.scale(self.constant))
        } else {
            Err("multiplication requires a constant operand".to_string())
        }
    }
}

/// Recursive descent over the tokens of one operand.
struct Expr<'t, 'p> {
    tokens: &'t [Token],
    pos: usize,
    parser: &'p Parser,
}

impl Expr<'_, '_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, ch: char) -> bool {
        if self.peek() == Some(&Token::Punct(ch)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expression(&mut self) -> Result<Linear, String> {
        let mut value = self.term()?;
        loop {
            if self.eat('+') {
                value = value.add(self.term()?);
            } else if self.eat('-') {
                value = value.add(self.term()?.scale(-1));
            } else {
                return Ok(value);
            }
        }
    }

    fn term(&mut self) -> Result<Linear, String> {
        let mut value = self.unary()?;
        while self.eat('*') {
            value = value.mul(self.unary()?)?;
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<Linear, String> {
        if self.eat('-') {
            return Ok(self.unary()?.scale(-1));
        }
        if self.eat('+') {
            return self.unary();
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Linear, String> {
        let token = self.peek().cloned();
        self.pos += 1;
        match token {
            Some(Token::Number(value)) => Ok(Linear::constant(value)),
            Some(Token::Str(bytes)) => Ok(Linear::constant(char_constant(&bytes)?)),
            Some(Token::Ident(name)) => match Gpr::from_name(&name) {
                Some(reg) => Ok(Linear {
                    registers: vec![(reg, 1)],
                    ..Linear::default()
                }),
                None if is_reserved(&name) => Err(format!("unexpected '{name}' in expression")),
                None => Ok(Linear {
                    symbols: vec![(self.parser.qualify(&name), 1)],
                    ..Linear::default()
                }),
            },
            Some(Token::Punct('(')) => {
                let value = self.expression()?;
                if !self.eat(')') {
                    return Err(format!("expected ')' but found {}", describe(self.peek())));
                }
                Ok(value)
            }
            other => Err(format!("expected expression but found {}", describe(other.as_ref()))),
        }
    }

    /// Parse the whole token slice as one expression.
    fn parse_all(tokens: &[Token], parser: &Parser) -> Result<Linear, String> {
        let mut expr = Expr {
            tokens,
            pos: 0,
            parser,
        };
        let value = expr.expression()?;
        if expr.pos < tokens.len() {
            return Err(format!("unexpected {} after expression", describe(expr.peek())));
        }
        Ok(value)
    }
}

/// Evaluate tokens that must form a constant.
fn constant(tokens: &[Token], parser: &Parser) -> Result<i64, String> {
    let value = Expr::parse_all(tokens, parser)?;
    if let Some((name, _)) = value.symbols.first() {
        return Err(format!("'{name}' is not a constant"));
    }
    if let Some((reg, _)) = value.registers.first() {
        return Err(format!("register '{}' is not allowed here", reg.name()));
    }
    Ok(value.constant)
}

fn split_commas(tokens: &[Token]) -> Vec<&[Token]> {
    tokens.split(|token| *token == Token::Punct(',')).collect()
}

#[derive(Debug, Default)]
struct Parser {
    /// Most recent label not starting with a dot.
    scope: Option<String>,
}

impl Parser {
    fn qualify(&self, name: &str) -> String {
        match &self.scope {
            Some(scope) if name.starts_with('.') => format!("{scope}{name}"),
            _ => name.to_string(),
        }
    }

    fn define_label(&mut self, name: &str) -> Result<String, String> {
        if is_reserved(name) {
            return Err(format!("'{name}' is a reserved word and cannot be a label"));
        }
        let qualified = self.qualify(name);
        if !name.starts_with('.') {
            self.scope = Some(name.to_string());
        }
        Ok(qualified)
    }

    fn parse_line(&mut self, line: usize, text: &str) -> Result<Option<Statement>, String> {
        let tokens = tokenize(text)?;
        let mut rest = tokens.as_slice();
        let mut labels = Vec::new();

        // `name:` labels, any number of them.
        while let [Token::Ident(name), Token::Punct(':'), tail @ ..] = rest {
            labels.push(self.define_label(name)?);
            rest = tail;
        }

        // FASM data labels: `name db ...`.
        if let [Token::Ident(name), Token::Ident(directive), ..] = rest {
            let directive = directive.to_ascii_lowercase();
            if !is_reserved(name)
                && (data_unit(&directive).is_some() || reserve_unit(&directive).is_some())
            {
                labels.push(self.define_label(name)?);
                rest = &rest[1..];
            }
        }

        let kind = match rest {
            [] if labels.is_empty() => return Ok(None),
            [] => StatementKind::Empty,
            [Token::Ident(word), operands @ ..] => self.parse_body(word, operands)?,
            [other, ..] => {
                return Err(format!("expected instruction but found {}", describe(Some(other))));
            }
        };

        Ok(Some(Statement { line, labels, kind }))
    }

    fn parse_body(&self, word: &str, operands: &[Token]) -> Result<StatementKind, String> {
        let keyword = word.to_ascii_lowercase();

        if let Some(bits) = match keyword.as_str() {
            "use32" => Some(32),
            "use64" => Some(64),
            _ => None,
        } {
            if !operands.is_empty() {
                return Err(format!("'{keyword}' takes no operands"));
            }
            return Ok(StatementKind::Mode(bits));
        }

        if let Some(unit) = data_unit(&keyword) {
            let items = split_commas(operands)
                .into_iter()
                .map(|item| self.parse_data_item(&keyword, unit, item))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(StatementKind::Data { unit, items });
        }

        if let Some(unit) = reserve_unit(&keyword) {
            let count = constant(operands, self)?;
            let count = u64::try_from(count)
                .map_err(|_| format!("reservation count {count} is negative"))?;
            return Ok(StatementKind::Reserve { unit, count });
        }

        if is_reserved(&keyword) {
            return Err(format!("unexpected '{word}'"));
        }

        let operands = if operands.is_empty() {
            Vec::new()
        } else {
            split_commas(operands)
                .into_iter()
                .map(|tokens| self.parse_operand(tokens))
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(StatementKind::Instruction {
            mnemonic: keyword,
            operands,
        })
    }

    fn parse_data_item(
        &self,
        keyword: &str,
        unit: usize,
        tokens: &[Token],
    ) -> Result<DataItem, String> {
        match tokens {
            [] => Err(format!("missing value in '{keyword}'")),
            [Token::Ident(name)] if name == "?" => Ok(DataItem::Uninitialized),
            [Token::Str(bytes)] if unit == 1 => Ok(DataItem::Bytes(bytes.clone())),
            [Token::Str(bytes)] if bytes.len() > unit => {
                Err(format!("string does not fit in a '{keyword}' element"))
            }
            _ => constant(tokens, self).map(DataItem::Value),
        }
    }

    fn parse_operand(&self, tokens: &[Token]) -> Result<Operand, String> {
        let mut rest = tokens;
        let mut size = None;

        if let [Token::Ident(word), tail @ ..] = rest {
            let lower = word.to_ascii_lowercase();
            if let Some(bits) = size_keyword(&lower) {
                size = Some(bits);
                rest = tail;
                if let [Token::Ident(ptr), tail @ ..] = rest {
                    if ptr.eq_ignore_ascii_case("ptr") {
                        rest = tail;
                    }
                }
            } else if lower == "short" || lower == "near" {
                rest = tail;
            }
        }

        match rest {
            [] => Err("missing operand".to_string()),
            [Token::Punct('['), inner @ .., Token::Punct(']')] => {
                self.parse_memory(size, inner).map(Operand::Memory)
            }
            [Token::Punct('['), ..] => Err("expected ']' at end of memory operand".to_string()),
            _ if size.is_some() => Err("size override requires a memory operand".to_string()),
            _ => classify(Expr::parse_all(rest, self)?),
        }
    }

    fn parse_memory(&self, size: Option<u32>, tokens: &[Token]) -> Result<Memory, String> {
        let mut value = Expr::parse_all(tokens, self)?;

        // `[rip + label]` is the same as `[label]`.
        if value.symbols.len() > 1 {
            value.symbols.retain(|(name, _)| !name.eq_ignore_ascii_case("rip"));
        }

        let label = match value.symbols.as_slice() {
            [] => None,
            [(name, 1)] => {
                if !value.registers.is_empty() || value.constant != 0 {
                    return Err(format!(
                        "label '{name}' cannot be combined with registers or a displacement"
                    ));
                }
                Some(name.clone())
            }
            _ => return Err("invalid label expression in memory operand".to_string()),
        };

        for &(reg, _) in &value.registers {
            if reg.width < 32 || reg.high {
                return Err(format!("'{}' cannot be used for addressing", reg.name()));
            }
        }

        let (base, index) = match value.registers.as_slice() {
            [] => (None, None),
            [(reg, 1)] => (Some(*reg), None),
            [(reg, scale)] => (None, Some((*reg, *scale))),
            // The stack pointer can only be a base.
            [(first, 1), (second, 1)] if second.number == 4 => (Some(*second), Some((*first, 1))),
            [(first, 1), (second, scale)] => (Some(*first), Some((*second, *scale))),
            [(first, scale), (second, 1)] => (Some(*second), Some((*first, *scale))),
            [_, _] => return Err("only one register can be scaled".to_string()),
            _ => return Err("too many registers in memory operand".to_string()),
        };

        if let Some((reg, scale)) = index {
            if !matches!(scale, 1 | 2 | 4 | 8) {
                return Err(format!("invalid scale {scale}, expected 1, 2, 4 or 8"));
            }
            if reg.number == 4 {
                return Err(format!("'{}' cannot be an index register", reg.name()));
            }
            if base.is_some_and(|base| base.width != reg.width) {
                return Err("base and index registers must have the same size".to_string());
            }
        }

        if (base.is_some() || index.is_some()) && i32::try_from(value.constant).is_err() {
            return Err(format!("displacement {:#x} is out of range", value.constant));
        }

        Ok(Memory {
            size,
            base,
            index: index.map(|(reg, scale)| (reg, scale as u32)),
            displacement: value.constant,
            label,
        })
    }
}

fn classify(value: Linear) -> Result<Operand, String> {
    match (value.registers.as_slice(), value.symbols.as_slice()) {
        ([], []) => Ok(Operand::Immediate(value.constant)),
        ([(reg, 1)], []) if value.constant == 0 => Ok(Operand::Register(*reg)),
        ([], [(name, 1)]) if value.constant == 0 => Ok(Operand::Symbol(name.clone())),
        ([], [(name, _)]) => Err(format!("arithmetic on label '{name}' is not supported")),
        _ => Err("register expressions are only allowed inside brackets".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(name: &str) -> Gpr {
        Gpr::from_name(name).unwrap()
    }

    fn single(source: &str) -> StatementKind {
        let mut statements = parse_source(source).unwrap();
        assert_eq!(statements.len(), 1);
        statements.remove(0).kind
    }

    fn operands(source: &str) -> Vec<Operand> {
        match single(source) {
            StatementKind::Instruction { operands, .. } => operands,
            other => panic!("expected instruction, got {other:?}"),
        }
    }

    #[test]
    fn test_number_formats() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0x2A"), Some(42));
        assert_eq!(parse_number("$2a"), Some(42));
        assert_eq!(parse_number("2Ah"), Some(42));
        assert_eq!(parse_number("0FFh"), Some(255));
        assert_eq!(parse_number("0b101010"), Some(42));
        assert_eq!(parse_number("101010b"), Some(42));
        assert_eq!(parse_number("0xFFFFFFFFFFFFFFFF"), Some(-1));
        assert_eq!(parse_number("label"), None);
        assert_eq!(parse_number("12x"), None);
        assert_eq!(parse_number("0x"), None);
    }

    #[test]
    fn test_register_table() {
        assert_eq!(reg("RAX"), Gpr { width: 64, number: 0, high: false });
        assert_eq!(reg("r12d"), Gpr { width: 32, number: 12, high: false });
        assert_eq!(reg("ah"), Gpr { width: 8, number: 4, high: true });
        assert_eq!(reg("spl").name(), "spl");
        assert_eq!(reg("bh").name(), "bh");
        assert!(reg("spl").requires_long_mode());
        assert!(!reg("ah").requires_long_mode());
        assert!(!reg("esi").requires_long_mode());
        assert!(reg("r8w").requires_long_mode());
        assert_eq!(Gpr::from_name("rip"), None);
    }

    #[test]
    fn test_instruction_operands() {
        assert_eq!(
            operands("  MOV eax, 40 + 2 ; answer"),
            vec![Operand::Register(reg("eax")), Operand::Immediate(42)]
        );
        assert_eq!(operands("push -(2 * 3)"), vec![Operand::Immediate(-6)]);
        assert_eq!(operands("mov al, 'A'"), vec![Operand::Register(reg("al")), Operand::Immediate(0x41)]);
        assert_eq!(operands("jmp short done"), vec![Operand::Symbol("done".to_string())]);
        assert_eq!(single("ret"), StatementKind::Instruction { mnemonic: "ret".to_string(), operands: vec![] });
    }

    #[test]
    fn test_memory_operands() {
        let ops = operands("mov rax, qword ptr [rbx + rcx*8 - 16]");
        assert_eq!(
            ops[1],
            Operand::Memory(Memory {
                size: Some(64),
                base: Some(reg("rbx")),
                index: Some((reg("rcx"), 8)),
                displacement: -16,
                label: None,
            })
        );

        let ops = operands("inc dword [4*esi]");
        assert_eq!(
            ops[0],
            Operand::Memory(Memory {
                size: Some(32),
                base: None,
                index: Some((reg("esi"), 4)),
                displacement: 0,
                label: None,
            })
        );

        let ops = operands("lea rdi, [rip + message]");
        assert_eq!(
            ops[1],
            Operand::Memory(Memory {
                size: None,
                base: None,
                index: None,
                displacement: 0,
                label: Some("message".to_string()),
            })
        );
    }

    #[test]
    fn test_labels_and_local_scope() {
        let source = "start:\n.loop: dec ecx\n jnz .loop\nother: .loop: nop\nmsg db 'hi', 0\n";
        let statements = parse_source(source).unwrap();
        assert_eq!(statements[0].labels, vec!["start"]);
        assert_eq!(statements[0].kind, StatementKind::Empty);
        assert_eq!(statements[1].labels, vec!["start.loop"]);
        assert_eq!(statements[1].line, 2);
        assert_eq!(
            statements[2].kind,
            StatementKind::Instruction {
                mnemonic: "jnz".to_string(),
                operands: vec![Operand::Symbol("start.loop".to_string())],
            }
        );
        assert_eq!(statements[3].labels, vec!["other", "other.loop"]);
        assert_eq!(statements[4].labels, vec!["msg"]);
        assert_eq!(
            statements[4].kind,
            StatementKind::Data {
                unit: 1,
                items: vec![DataItem::Bytes(b"hi".to_vec()), DataItem::Value(0)],
            }
        );
    }

    #[test]
    fn test_directives() {
        assert_eq!(single("use32"), StatementKind::Mode(32));
        assert_eq!(
            single("dw 1, ?, 'ab'"),
            StatementKind::Data {
                unit: 2,
                items: vec![DataItem::Value(1), DataItem::Uninitialized, DataItem::Value(0x6261)],
            }
        );
        assert_eq!(single("buffer rq 4"), StatementKind::Reserve { unit: 8, count: 4 });
        assert_eq!(
            single("db 'it''s'"),
            StatementKind::Data { unit: 1, items: vec![DataItem::Bytes(b"it's".to_vec())] }
        );
    }

    #[test]
    fn test_errors_are_collected_per_line() {
        let source = "mov eax, 1\nmov eax, 12q\nmov eax, 'oops\nmov eax, [rax + rbx + rcx]\nrax: nop\nmov eax, #1";
        let diagnostics = parse_source(source).unwrap_err();
        let lines: Vec<_> = diagnostics.iter().map(|d| d.line).collect();
        assert_eq!(lines, vec![Some(2), Some(3), Some(4), Some(5), Some(6)]);
        assert_eq!(diagnostics[0].message, "invalid number '12q'");
        assert_eq!(diagnostics[1].message, "unterminated string");
        assert_eq!(diagnostics[0].source.as_deref(), Some("mov eax, 12q"));
        assert_eq!(diagnostics[4].message, "unexpected character '#'");
    }

    #[test]
    fn test_operand_errors() {
        let err = |source: &str| parse_source(source).unwrap_err()[0].message.clone();
        assert_eq!(err("mov eax, msg + 4"), "arithmetic on label 'msg' is not supported");
        assert_eq!(err("mov eax, [rax*3]"), "invalid scale 3, expected 1, 2, 4 or 8");
        assert_eq!(err("mov eax, [rax + rsp*2]"), "'rsp' cannot be an index register");
        assert_eq!(err("mov eax, [rax + ecx]"), "base and index registers must have the same size");
        assert_eq!(err("mov eax, dword 5"), "size override requires a memory operand");
        assert_eq!(err("mov eax, [msg + 4]"), "label 'msg' cannot be combined with registers or a displacement");
        assert_eq!(err("rb -1"), "reservation count -1 is negative");
    }
}
