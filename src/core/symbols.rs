// This module implements predefinitions: host-side addresses that assembly source refers to
// by name. SymbolTable maps names to address-sized values (last write wins) and expands
// them into source text before the engine ever sees it. Expansion is a pure text pass in the
// manner of a preprocessor `define`: the source is scanned for identifier tokens and every
// token equal to a registered name is replaced by the address rendered as a 0x-prefixed
// hexadecimal literal. Matching is on whole tokens, so `printf` never rewrites part of
// `printf_impl`, and text inside quoted strings or after a `;` comment marker is copied
// through untouched. No scoping or type checking takes place.

//! Predefinition table and source expansion.

use hashbrown::HashMap;

/// Characters that may appear in an identifier token.
pub fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '@' | '?' | '$')
}

/// Whether `name` can ever match as a whole token during expansion.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if is_ident_char(first) && !first.is_ascii_digit() => chars.all(is_ident_char),
        _ => false,
    }
}

/// Render an address the way expanded source spells it.
pub fn render_address(address: usize) -> String {
    format!("0x{address:X}")
}

/// Name to address mapping applied to source text before assembly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    entries: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`, replacing any previous value. Returns the previous value.
    pub fn insert(&mut self, name: impl Into<String>, address: usize) -> Option<usize> {
        let name = name.into();
        if !is_valid_name(&name) {
            log::warn!("Predefinition {name:?} is not an identifier and will never be substituted");
        }
        self.entries.insert(name, address)
    }

    pub fn remove(&mut self, name: &str) -> Option<usize> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.entries.get(name).copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries.iter().map(|(name, &address)| (name.as_str(), address))
    }

    /// Substitute every registered name in `source` with its address literal.
    pub fn expand(&self, source: &str) -> String {
        if self.entries.is_empty() {
            return source.to_string();
        }

        let mut out = String::with_capacity(source.len());
        let mut substitutions = 0usize;
        let mut rest = source;

        while let Some(ch) = rest.chars().next() {
            if ch == ';' {
                // Comment runs to end of line.
                let end = rest.find('\n').unwrap_or(rest.len());
                out.push_str(&rest[..end]);
                rest = &rest[end..];
            } else if ch == '\'' || ch == '"' {
                // Quoted string runs to the matching quote or end of line.
                let body = &rest[1..];
                let end = body
                    .find(|c: char| c == ch || c == '\n')
                    .map_or(rest.len(), |idx| {
                        if body[idx..].starts_with(ch) {
                            idx + 2
                        } else {
                            idx + 1
                        }
                    });
                out.push_str(&rest[..end]);
                rest = &rest[end..];
            } else if is_ident_char(ch) {
                let end = rest.find(|c: char| !is_ident_char(c)).unwrap_or(rest.len());
                let token = &rest[..end];
                match self.entries.get(token) {
                    Some(&address) => {
                        out.push_str(&render_address(address));
                        substitutions += 1;
                    }
                    None => out.push_str(token),
                }
                rest = &rest[end..];
            } else {
                out.push(ch);
                rest = &rest[ch.len_utf8()..];
            }
        }

        log::trace!("Expanded {substitutions} predefinition references");
        out
    }
}

impl<S: Into<String>> FromIterator<(S, usize)> for SymbolTable {
    fn from_iter<I: IntoIterator<Item = (S, usize)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (name, address) in iter {
            table.insert(name, address);
        }
        table
    }
}
