//! LDAP search filters: the string form parser and the entry evaluator.
//!
//! Covers the filter shapes the core itself uses (DSE callback filters and
//! DSE searches): and/or/not, equality, substring, presence, and the
//! ordering comparisons. Extensible matching rules are out of scope.

use std::fmt;

use crate::entry::Entry;
use crate::error::{LdapError, LdapResult};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, String),
    Ge(String, String),
    Le(String, String),
    Approx(String, String),
    Present(String),
    Substring {
        ty: String,
        initial: Option<String>,
        any: Vec<String>,
        fin: Option<String>,
    },
}

impl Filter {
    /// Parses the string form of a filter. A bare `a=b` (no surrounding
    /// parentheses) is accepted the way the original parser accepted it.
    pub fn parse(s: &str) -> LdapResult<Filter> {
        let s = s.trim();
        let mut p = Parser { s, pos: 0 };
        let f = p.parse_filter()?;
        p.skip_spaces();
        if p.pos != p.s.len() {
            return Err(LdapError::InvalidSyntax(format!(
                "trailing characters in filter {s:?}"
            )));
        }
        Ok(f)
    }

    /// Evaluates the filter against an entry.
    #[must_use]
    pub fn matches(&self, e: &Entry) -> bool {
        match self {
            Filter::And(fs) => fs.iter().all(|f| f.matches(e)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(e)),
            Filter::Not(f) => !f.matches(e),
            Filter::Present(ty) => e.has_attr(ty),
            // Approximate matching degrades to equality here.
            Filter::Equality(ty, val) | Filter::Approx(ty, val) => match e.attr(ty) {
                Some(attr) => attr.find_value(&Value::from(val.as_str())).is_some(),
                None => false,
            },
            Filter::Ge(ty, val) => cmp_any(e, ty, val, |o| o != std::cmp::Ordering::Less),
            Filter::Le(ty, val) => cmp_any(e, ty, val, |o| o != std::cmp::Ordering::Greater),
            Filter::Substring {
                ty,
                initial,
                any,
                fin,
            } => match e.attr(ty) {
                Some(attr) => attr.values().iter().any(|v| {
                    v.as_str()
                        .is_some_and(|s| substring_match(&s.to_lowercase(), initial, any, fin))
                }),
                None => false,
            },
        }
    }
}

fn cmp_any(e: &Entry, ty: &str, val: &str, ok: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    let Some(attr) = e.attr(ty) else {
        return false;
    };
    let syntax = attr.syntax();
    let probe = Value::from(val);
    attr.values()
        .iter()
        .any(|v| ok(crate::attr::value_cmp(syntax, v, &probe)))
}

fn substring_match(
    s: &str,
    initial: &Option<String>,
    any: &[String],
    fin: &Option<String>,
) -> bool {
    let mut rest = s;
    if let Some(init) = initial {
        match rest.strip_prefix(init.as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for piece in any {
        match rest.find(piece.as_str()) {
            Some(idx) => rest = &rest[idx + piece.len()..],
            None => return false,
        }
    }
    match fin {
        Some(f) => rest.ends_with(f.as_str()),
        None => true,
    }
}

struct Parser<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.s[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_filter(&mut self) -> LdapResult<Filter> {
        self.skip_spaces();
        if self.peek() == Some('(') {
            self.pos += 1;
            let f = self.parse_component()?;
            self.skip_spaces();
            if self.bump() != Some(')') {
                return Err(LdapError::InvalidSyntax("unbalanced parenthesis".into()));
            }
            Ok(f)
        } else {
            self.parse_simple()
        }
    }

    fn parse_component(&mut self) -> LdapResult<Filter> {
        self.skip_spaces();
        match self.peek() {
            Some('&') => {
                self.pos += 1;
                Ok(Filter::And(self.parse_list()?))
            }
            Some('|') => {
                self.pos += 1;
                Ok(Filter::Or(self.parse_list()?))
            }
            Some('!') => {
                self.pos += 1;
                Ok(Filter::Not(Box::new(self.parse_filter()?)))
            }
            _ => self.parse_simple(),
        }
    }

    fn parse_list(&mut self) -> LdapResult<Vec<Filter>> {
        let mut items = Vec::new();
        loop {
            self.skip_spaces();
            if self.peek() == Some('(') {
                items.push(self.parse_filter()?);
            } else {
                break;
            }
        }
        if items.is_empty() {
            return Err(LdapError::InvalidSyntax("empty filter list".into()));
        }
        Ok(items)
    }

    /// Parses `type OP value` where OP is `=`, `>=`, `<=`, or `~=`.
    fn parse_simple(&mut self) -> LdapResult<Filter> {
        let start = self.pos;
        let mut op = None;
        while let Some(c) = self.peek() {
            match c {
                '=' => {
                    op = Some('=');
                    break;
                }
                '>' | '<' | '~' => {
                    op = Some(c);
                    break;
                }
                ')' | '(' => break,
                _ => {
                    self.pos += c.len_utf8();
                }
            }
        }
        let ty = self.s[start..self.pos].trim().to_lowercase();
        let op = op.ok_or_else(|| LdapError::InvalidSyntax("missing '=' in filter".into()))?;
        if ty.is_empty() {
            return Err(LdapError::InvalidSyntax("empty attribute in filter".into()));
        }
        self.pos += 1;
        if op != '=' {
            if self.bump() != Some('=') {
                return Err(LdapError::InvalidSyntax("dangling comparison operator".into()));
            }
        }
        let vstart = self.pos;
        let mut depth_end = self.s.len();
        for (i, c) in self.s[vstart..].char_indices() {
            if c == ')' {
                depth_end = vstart + i;
                break;
            }
        }
        let raw_val = &self.s[vstart..depth_end];
        self.pos = depth_end;
        match op {
            '>' => Ok(Filter::Ge(ty, unescape(raw_val)?)),
            '<' => Ok(Filter::Le(ty, unescape(raw_val)?)),
            '~' => Ok(Filter::Approx(ty, unescape(raw_val)?)),
            _ => {
                if raw_val == "*" {
                    return Ok(Filter::Present(ty));
                }
                if raw_val.contains('*') {
                    return parse_substring(ty, raw_val);
                }
                Ok(Filter::Equality(ty, unescape(raw_val)?))
            }
        }
    }
}

fn parse_substring(ty: String, raw: &str) -> LdapResult<Filter> {
    let pieces: Vec<&str> = raw.split('*').collect();
    let initial = if pieces[0].is_empty() {
        None
    } else {
        Some(unescape(pieces[0])?.to_lowercase())
    };
    let last = pieces.len() - 1;
    let fin = if pieces[last].is_empty() {
        None
    } else {
        Some(unescape(pieces[last])?.to_lowercase())
    };
    let mut any = Vec::new();
    for piece in &pieces[1..last] {
        if !piece.is_empty() {
            any.push(unescape(piece)?.to_lowercase());
        }
    }
    Ok(Filter::Substring {
        ty,
        initial,
        any,
        fin,
    })
}

/// Resolves `\HH` escapes inside an assertion value.
fn unescape(raw: &str) -> LdapResult<String> {
    if !raw.contains('\\') {
        return Ok(raw.to_owned());
    }
    let mut out = Vec::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hi = bytes.get(i + 1).and_then(|&b| (b as char).to_digit(16));
            let lo = bytes.get(i + 2).and_then(|&b| (b as char).to_digit(16));
            match (hi, lo) {
                (Some(hi), Some(lo)) => {
                    out.push(((hi << 4) | lo) as u8);
                    i += 3;
                }
                _ => {
                    // A lone backslash escapes the next character.
                    match bytes.get(i + 1) {
                        Some(&b) => {
                            out.push(b);
                            i += 2;
                        }
                        None => {
                            return Err(LdapError::InvalidSyntax(
                                "escape at end of filter value".into(),
                            ))
                        }
                    }
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| LdapError::InvalidSyntax("filter value is not UTF-8".into()))
}

fn escape_value(f: &mut fmt::Formatter<'_>, val: &str) -> fmt::Result {
    for c in val.chars() {
        match c {
            '(' | ')' | '*' | '\\' => write!(f, "\\{:02x}", c as u32)?,
            _ => write!(f, "{c}")?,
        }
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(fs) => {
                write!(f, "(&")?;
                for x in fs {
                    write!(f, "{x}")?;
                }
                write!(f, ")")
            }
            Filter::Or(fs) => {
                write!(f, "(|")?;
                for x in fs {
                    write!(f, "{x}")?;
                }
                write!(f, ")")
            }
            Filter::Not(x) => write!(f, "(!{x})"),
            Filter::Equality(ty, v) => {
                write!(f, "({ty}=")?;
                escape_value(f, v)?;
                write!(f, ")")
            }
            Filter::Ge(ty, v) => {
                write!(f, "({ty}>=")?;
                escape_value(f, v)?;
                write!(f, ")")
            }
            Filter::Le(ty, v) => {
                write!(f, "({ty}<=")?;
                escape_value(f, v)?;
                write!(f, ")")
            }
            Filter::Approx(ty, v) => {
                write!(f, "({ty}~=")?;
                escape_value(f, v)?;
                write!(f, ")")
            }
            Filter::Present(ty) => write!(f, "({ty}=*)"),
            Filter::Substring {
                ty,
                initial,
                any,
                fin,
            } => {
                write!(f, "({ty}=")?;
                if let Some(i) = initial {
                    escape_value(f, i)?;
                }
                write!(f, "*")?;
                for piece in any {
                    escape_value(f, piece)?;
                    write!(f, "*")?;
                }
                if let Some(x) = fin {
                    escape_value(f, x)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Sdn;

    fn entry() -> Entry {
        let mut e = Entry::new(Sdn::new("cn=alpha beta,o=org").unwrap());
        e.add_values("objectClass", vec!["top".into(), "person".into()], false)
            .unwrap();
        e.add_values("cn", vec!["alpha beta".into()], false).unwrap();
        e.add_values("uidNumber", vec!["42".into()], false).unwrap();
        e
    }

    #[test]
    fn equality_and_presence() {
        let e = entry();
        assert!(Filter::parse("(objectClass=TOP)").unwrap().matches(&e));
        assert!(Filter::parse("(cn=*)").unwrap().matches(&e));
        assert!(!Filter::parse("(sn=*)").unwrap().matches(&e));
        assert!(!Filter::parse("(cn=gamma)").unwrap().matches(&e));
    }

    #[test]
    fn boolean_composition() {
        let e = entry();
        let f = Filter::parse("(&(objectclass=top)(|(cn=alpha beta)(cn=other)))").unwrap();
        assert!(f.matches(&e));
        assert!(!Filter::parse("(!(objectclass=top))").unwrap().matches(&e));
    }

    #[test]
    fn substring_forms() {
        let e = entry();
        assert!(Filter::parse("(cn=alp*)").unwrap().matches(&e));
        assert!(Filter::parse("(cn=*beta)").unwrap().matches(&e));
        assert!(Filter::parse("(cn=a*b*a)").unwrap().matches(&e));
        assert!(!Filter::parse("(cn=beta*)").unwrap().matches(&e));
    }

    #[test]
    fn escaped_assertion_values() {
        let f = Filter::parse("(cn=a\\2ab)").unwrap();
        assert_eq!(f, Filter::Equality("cn".into(), "a*b".into()));
    }

    #[test]
    fn bare_ava_is_accepted() {
        let f = Filter::parse("objectclass=top").unwrap();
        assert_eq!(f, Filter::Equality("objectclass".into(), "top".into()));
    }

    #[test]
    fn display_roundtrips() {
        for s in [
            "(&(objectclass=top)(cn=a*b))",
            "(|(a=1)(b<=2)(c>=3))",
            "(!(x~=y))",
            "(cn=*)",
        ] {
            let f = Filter::parse(s).unwrap();
            assert_eq!(Filter::parse(&f.to_string()).unwrap(), f);
        }
    }

    #[test]
    fn malformed_filters_are_rejected() {
        assert!(Filter::parse("(&)").is_err());
        assert!(Filter::parse("(cn=x").is_err());
        assert!(Filter::parse("()").is_err());
        assert!(Filter::parse("(cn>x)").is_err());
    }
}
