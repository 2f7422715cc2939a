//! Distinguished name parsing, normalization, and comparison.
//!
//! Every DN keeps two spellings: the one the client sent (`dn`) and the
//! canonical normalized form (`ndn`). The normalized form is the only thing
//! used for equality, suffix tests, and index keys, so two DNs that differ
//! only in case, insignificant whitespace, or quoting convention normalize to
//! identical byte sequences.

use std::cmp::Ordering;
use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard upper bound on the byte length of a DN accepted by the normalizer.
pub const DN_MAX_LEN: usize = 8 * 1024;

/// Errors produced by DN parsing and normalization.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DnError {
    /// The DN does not parse as a sequence of `attribute=value` RDNs.
    #[error("malformed DN: {0}")]
    Malformed(&'static str),

    /// The DN exceeds [`DN_MAX_LEN`].
    #[error("DN of {0} bytes exceeds the {DN_MAX_LEN} byte limit")]
    TooLong(usize),
}

/// Search scope, as used by the dispatcher and the DSE store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Base,
    OneLevel,
    Subtree,
}

/// Attribute types whose values are themselves DNs. The normalizer applies
/// nested RDN sorting to values of these types.
const DN_SYNTAX_TYPES: &[&str] = &[
    "member",
    "uniquemember",
    "owner",
    "seealso",
    "manager",
    "secretary",
    "memberof",
];

/// Whether the attribute type is declared to use the Distinguished Name
/// syntax.
#[must_use]
pub fn is_dn_syntax_type(ty: &str) -> bool {
    DN_SYNTAX_TYPES.iter().any(|t| ty.eq_ignore_ascii_case(t))
}

fn is_separator(b: u8) -> bool {
    matches!(b, b',' | b';' | b'+')
}

fn needs_escape(b: u8) -> bool {
    matches!(b, b'\\' | b'"' | b',' | b';' | b'+' | b'<' | b'>' | b'=')
}

fn hex_val(c: char) -> Option<u8> {
    c.to_digit(16).map(|d| d as u8)
}

fn push_hex_escape(out: &mut String, b: u8) {
    let _ = write!(out, "\\{b:02X}");
}

fn push_lower(out: &mut String, c: char) {
    for lc in c.to_lowercase() {
        out.push(lc);
    }
}

/// One significant character of an attribute value, tagged with how it
/// arrived so the emitter can pick the canonical spelling.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ValEvent {
    /// A plain, unescaped character.
    Plain(char),
    /// A character that arrived escaped (or quoted) and must stay escaped.
    Escaped(u8),
    /// An escaped space; kept as `\20` only at the value boundaries.
    EscSpace,
    /// An escaped `#`; kept as `\23` only in leading position.
    EscHash,
    /// The literal sequence `\00`, preserved byte for byte.
    EscNul,
}

struct AvaParser<'a> {
    chars: Vec<char>,
    pos: usize,
    src: &'a str,
}

impl<'a> AvaParser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            src,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(' ' | '\n' | '\r')) {
            self.pos += 1;
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    /// Reads an attribute type up to the `=`, which is consumed.
    fn read_type(&mut self) -> Result<String, DnError> {
        let mut ty = String::new();
        loop {
            match self.peek() {
                None => return Err(DnError::Malformed("attribute type without '='")),
                Some('=') => {
                    self.pos += 1;
                    break;
                }
                Some(' ') => {
                    // Only trailing spaces may sit between the type and '='.
                    self.skip_spaces();
                    if self.bump() != Some('=') {
                        return Err(DnError::Malformed("space inside attribute type"));
                    }
                    break;
                }
                Some(c) if c.is_ascii() && is_separator(c as u8) => {
                    return Err(DnError::Malformed("attribute type without '='"));
                }
                Some(c) => {
                    push_lower(&mut ty, c);
                    self.pos += 1;
                }
            }
        }
        if ty.is_empty() {
            return Err(DnError::Malformed("empty attribute type"));
        }
        Ok(ty)
    }

    /// Parses one escape sequence; the leading `\` is already consumed.
    fn read_escape(&mut self) -> Result<ValEvent, DnError> {
        let first = self
            .bump()
            .ok_or(DnError::Malformed("escape at end of DN"))?;
        if let Some(hi) = hex_val(first) {
            if let Some(lo) = self.peek().and_then(hex_val) {
                self.pos += 1;
                let b = (hi << 4) | lo;
                return Ok(match b {
                    0 => ValEvent::EscNul,
                    b' ' => ValEvent::EscSpace,
                    b'#' => ValEvent::EscHash,
                    b if needs_escape(b) => ValEvent::Escaped(b),
                    b if b.is_ascii() => ValEvent::Plain(b as char),
                    // Non-ASCII escaped bytes stay in escaped form so the
                    // output remains valid UTF-8.
                    b => ValEvent::Escaped(b),
                });
            }
        }
        Ok(match first {
            ' ' => ValEvent::EscSpace,
            '#' => ValEvent::EscHash,
            c if c.is_ascii() && needs_escape(c as u8) => ValEvent::Escaped(c as u8),
            // An escape in front of an ordinary character carries no meaning.
            c => ValEvent::Plain(c),
        })
    }

    /// Reads a value in escape form, stopping at an unescaped separator
    /// (which is left unconsumed) or at the end of input.
    fn read_value(&mut self) -> Result<Vec<ValEvent>, DnError> {
        let mut events = Vec::new();
        loop {
            match self.peek() {
                None => break,
                Some(c) if c.is_ascii() && is_separator(c as u8) => {
                    if events.is_empty() {
                        return Err(DnError::Malformed("value begins with a separator"));
                    }
                    break;
                }
                Some('\\') => {
                    self.pos += 1;
                    events.push(self.read_escape()?);
                }
                Some(c) => {
                    self.pos += 1;
                    events.push(ValEvent::Plain(c));
                }
            }
        }
        Ok(events)
    }

    /// Reads a legacy quoted value (`cn="a,b"`); the opening quote is already
    /// consumed. Reserved characters inside the quotes come out escaped.
    fn read_quoted_value(&mut self) -> Result<Vec<ValEvent>, DnError> {
        let mut events = Vec::new();
        loop {
            match self.bump() {
                None => return Err(DnError::Malformed("unmatched quote")),
                Some('"') => break,
                Some('\\') => events.push(self.read_escape()?),
                Some(c) if c.is_ascii() && needs_escape(c as u8) => {
                    events.push(ValEvent::Escaped(c as u8));
                }
                Some(c) => events.push(ValEvent::Plain(c)),
            }
        }
        // Only a separator (or the end of the DN) may follow the close quote.
        self.skip_spaces();
        match self.peek() {
            None => {}
            Some(c) if c.is_ascii() && is_separator(c as u8) => {}
            Some(_) => return Err(DnError::Malformed("garbage after quoted value")),
        }
        Ok(events)
    }

    fn debug_src(&self) -> &str {
        self.src
    }
}

/// Renders the trimmed event list into the canonical value spelling.
fn emit_value(mut events: Vec<ValEvent>) -> String {
    // Unescaped spaces at either end of the value are insignificant.
    while matches!(events.first(), Some(ValEvent::Plain(' '))) {
        events.remove(0);
    }
    while matches!(events.last(), Some(ValEvent::Plain(' '))) {
        events.pop();
    }
    let last = events.len().saturating_sub(1);
    let mut out = String::new();
    for (i, ev) in events.iter().enumerate() {
        match *ev {
            ValEvent::Plain(c) => push_lower(&mut out, c),
            ValEvent::Escaped(b) => push_hex_escape(&mut out, b),
            ValEvent::EscSpace => {
                if i == 0 || i == last {
                    push_hex_escape(&mut out, b' ');
                } else {
                    out.push(' ');
                }
            }
            ValEvent::EscHash => {
                if i == 0 {
                    push_hex_escape(&mut out, b'#');
                } else {
                    out.push('#');
                }
            }
            ValEvent::EscNul => out.push_str("\\00"),
        }
    }
    out
}

/// Applies nested RDN sorting to a DN-syntax value: subcomponents joined by
/// an escaped `+` are sorted when every piece looks like an
/// `attribute\3Dvalue` assertion.
fn sort_nested_avas(val: &str) -> String {
    let mut parts: Vec<&str> = val.split("\\2B").collect();
    if parts.len() < 2 || !parts.iter().all(|p| p.contains("\\3D")) {
        return val.to_owned();
    }
    parts.sort_unstable();
    parts.join("\\2B")
}

/// Maps a raw DN to its canonical form.
///
/// The canonical form is lowercased, has RDN components sorted within each
/// RDN, drops insignificant whitespace, and spells every reserved character
/// as an uppercase `\XX` hex escape. Both the escape form (`cn=a\,b`) and the
/// legacy quoted form (`cn="a,b"`) are accepted; the escape form is emitted.
pub fn normalize(raw: &str) -> Result<String, DnError> {
    if raw.len() > DN_MAX_LEN {
        return Err(DnError::TooLong(raw.len()));
    }
    let mut p = AvaParser::new(raw);
    let mut rdns: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut expect_more = false;

    loop {
        p.skip_spaces();
        if p.at_end() {
            if expect_more {
                return Err(DnError::Malformed("trailing separator"));
            }
            break;
        }
        let ty = p.read_type()?;
        p.skip_spaces();
        let events = if p.peek() == Some('"') {
            p.pos += 1;
            p.read_quoted_value()?
        } else {
            p.read_value()?
        };
        let mut val = emit_value(events);
        if is_dn_syntax_type(&ty) {
            val = sort_nested_avas(&val);
        }
        current.push(format!("{ty}={val}"));

        p.skip_spaces();
        match p.bump() {
            None => {
                finish_rdn(&mut rdns, &mut current);
                break;
            }
            Some('+') => expect_more = true,
            Some(',' | ';') => {
                finish_rdn(&mut rdns, &mut current);
                expect_more = true;
            }
            Some(_) => {
                tracing::debug!(dn = p.debug_src(), "unexpected character after DN value");
                return Err(DnError::Malformed("unexpected character after value"));
            }
        }
    }

    Ok(rdns
        .iter()
        .map(|avas| avas.join("+"))
        .collect::<Vec<_>>()
        .join(","))
}

fn finish_rdn(rdns: &mut Vec<Vec<String>>, current: &mut Vec<String>) {
    // Components of a multi-valued RDN sort by byte order of the normalized
    // pair; shorter strings sort before their extensions.
    current.sort_unstable();
    rdns.push(std::mem::take(current));
}

/// Compares two DNs by their canonical bytes.
#[must_use]
pub fn compare(a: &str, b: &str) -> Ordering {
    a.as_bytes().cmp(b.as_bytes())
}

/// Tells whether `suffix` is a suffix of `dn` at an RDN boundary. Both
/// arguments must be normalized. The empty DN is a suffix of every DN.
#[must_use]
pub fn issuffix(dn: &str, suffix: &str) -> bool {
    if suffix.is_empty() {
        return true;
    }
    if suffix.len() > dn.len() {
        return false;
    }
    dn.ends_with(suffix) && (dn.len() == suffix.len() || dn.as_bytes()[dn.len() - suffix.len() - 1] == b',')
}

/// Returns the parent of a normalized DN, or `None` for the empty DN and for
/// one-RDN DNs (whose parent is the root DSE).
#[must_use]
pub fn parent(ndn: &str) -> Option<&str> {
    let idx = ndn.find(',')?;
    Some(&ndn[idx + 1..])
}

/// Splits a normalized DN into its RDN strings, leftmost first.
#[must_use]
pub fn split_rdns(ndn: &str) -> Vec<&str> {
    if ndn.is_empty() {
        Vec::new()
    } else {
        ndn.split(',').collect()
    }
}

/// Evaluates a search scope relation between a candidate and a base, both
/// normalized.
#[must_use]
pub fn scope_test(ndn: &str, base: &str, scope: Scope) -> bool {
    match scope {
        Scope::Base => ndn == base,
        Scope::OneLevel => match parent(ndn) {
            Some(p) => p == base,
            None => !ndn.is_empty() && base.is_empty(),
        },
        Scope::Subtree => issuffix(ndn, base),
    }
}

/// A DN carrying both the client spelling and its cached normalized form.
#[derive(Debug, Clone)]
pub struct Sdn {
    dn: String,
    ndn: String,
}

impl Sdn {
    /// Parses and normalizes a raw DN.
    pub fn new(raw: &str) -> Result<Self, DnError> {
        let ndn = normalize(raw)?;
        Ok(Self {
            dn: raw.to_owned(),
            ndn,
        })
    }

    /// Wraps an already-normalized DN without re-normalizing. The caller
    /// vouches that `ndn` is canonical.
    #[must_use]
    pub fn from_ndn(ndn: impl Into<String>) -> Self {
        let ndn = ndn.into();
        Self {
            dn: ndn.clone(),
            ndn,
        }
    }

    /// The empty DN naming the root DSE.
    #[must_use]
    pub fn root() -> Self {
        Self {
            dn: String::new(),
            ndn: String::new(),
        }
    }

    /// The original spelling.
    #[must_use]
    pub fn as_dn(&self) -> &str {
        &self.dn
    }

    /// The canonical spelling.
    #[must_use]
    pub fn as_ndn(&self) -> &str {
        &self.ndn
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ndn.is_empty()
    }

    /// Parent DN, if there is one.
    #[must_use]
    pub fn parent(&self) -> Option<Sdn> {
        parent(&self.ndn).map(Sdn::from_ndn)
    }

    /// Leftmost RDN of the normalized form.
    #[must_use]
    pub fn rdn(&self) -> Option<&str> {
        split_rdns(&self.ndn).first().copied()
    }

    /// Number of RDNs in the normalized form.
    #[must_use]
    pub fn rdn_count(&self) -> usize {
        split_rdns(&self.ndn).len()
    }

    /// Whether `suffix` is a suffix of this DN.
    #[must_use]
    pub fn issuffix(&self, suffix: &Sdn) -> bool {
        issuffix(&self.ndn, &suffix.ndn)
    }

    /// Whether this DN sits within `base` under the given scope.
    #[must_use]
    pub fn in_scope(&self, base: &Sdn, scope: Scope) -> bool {
        scope_test(&self.ndn, &base.ndn, scope)
    }

    /// Prepends an RDN, producing the DN of a child entry.
    pub fn add_rdn(&self, rdn: &str) -> Result<Sdn, DnError> {
        if self.ndn.is_empty() {
            Sdn::new(rdn)
        } else {
            Sdn::new(&format!("{rdn},{}", self.dn))
        }
    }

    /// Moves this DN under a new parent, keeping its leftmost RDN.
    pub fn set_parent(&self, new_parent: &Sdn) -> Result<Sdn, DnError> {
        let rdn = self
            .rdn()
            .ok_or(DnError::Malformed("empty DN has no RDN"))?;
        new_parent.add_rdn(rdn)
    }
}

impl PartialEq for Sdn {
    fn eq(&self, other: &Self) -> bool {
        self.ndn == other.ndn
    }
}

impl Eq for Sdn {}

impl std::hash::Hash for Sdn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ndn.hash(state);
    }
}

impl PartialOrd for Sdn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sdn {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.ndn, &other.ndn)
    }
}

impl fmt::Display for Sdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dn)
    }
}

impl std::str::FromStr for Sdn {
    type Err = DnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sdn::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_multivalued_rdn() {
        let ndn = normalize("UID=Bob+cn=Bob Builder,OU=People,dc=Example,dc=Com").unwrap();
        assert_eq!(ndn, "cn=bob builder+uid=bob,ou=people,dc=example,dc=com");
    }

    #[test]
    fn normalizes_escaped_separator() {
        let ndn = normalize("cn=Smith\\, John,dc=example,dc=com").unwrap();
        assert_eq!(ndn, "cn=smith\\2C john,dc=example,dc=com");
    }

    #[test]
    fn accepts_legacy_quoted_form() {
        let ndn = normalize("cn=\"Smith, John\",dc=example,dc=com").unwrap();
        assert_eq!(ndn, "cn=smith\\2C john,dc=example,dc=com");
    }

    #[test]
    fn strips_insignificant_spaces() {
        let ndn = normalize("cn = bob ,  dc = example , dc = com").unwrap();
        assert_eq!(ndn, "cn=bob,dc=example,dc=com");
    }

    #[test]
    fn preserves_escaped_trailing_space() {
        let ndn = normalize("cn=bob\\ ,dc=example,dc=com").unwrap();
        assert_eq!(ndn, "cn=bob\\20,dc=example,dc=com");
    }

    #[test]
    fn keeps_nul_escape_literal() {
        let ndn = normalize("cn=a\\00b,dc=example,dc=com").unwrap();
        assert_eq!(ndn, "cn=a\\00b,dc=example,dc=com");
    }

    #[test]
    fn reencodes_hex_pairs_canonically() {
        let ndn = normalize("cn=a\\2c b,o=x").unwrap();
        assert_eq!(ndn, "cn=a\\2C b,o=x");
        // A hex pair for an ordinary character decodes.
        assert_eq!(normalize("cn=a\\41b").unwrap(), "cn=aab");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in [
            "UID=Bob+cn=Bob Builder,OU=People,dc=Example,dc=Com",
            "cn=Smith\\, John,dc=example,dc=com",
            "cn=\"a=b,c=d\",o=org",
            "cn=bob\\ ,dc=example,dc=com",
            "ou= deep  space ,dc=x",
            "",
        ] {
            let once = normalize(raw).unwrap();
            assert_eq!(normalize(&once).unwrap(), once, "input {raw:?}");
        }
    }

    #[test]
    fn equal_canonical_forms_compare_equal() {
        let a = normalize("CN=Foo, DC=Example,DC=COM").unwrap();
        let b = normalize("cn=foo,dc=example , dc=com").unwrap();
        assert_eq!(compare(&a, &b), Ordering::Equal);
    }

    #[test]
    fn malformed_dns_are_rejected() {
        assert!(normalize("cn").is_err());
        assert!(normalize("cn=a\\").is_err());
        assert!(normalize("cn=\"unterminated,dc=x").is_err());
        assert!(normalize("=value").is_err());
        assert!(normalize("cn=a,,dc=x").is_err());
        assert!(normalize("cn=a,").is_err());
    }

    #[test]
    fn too_long_dn_is_rejected() {
        let raw = format!("cn={}", "a".repeat(DN_MAX_LEN));
        assert_eq!(normalize(&raw), Err(DnError::TooLong(raw.len())));
    }

    #[test]
    fn suffix_laws() {
        let dn = "uid=bob,ou=people,dc=example,dc=com";
        assert!(issuffix(dn, dn));
        assert!(issuffix(dn, ""));
        assert!(issuffix(dn, "dc=example,dc=com"));
        assert!(issuffix(dn, "ou=people,dc=example,dc=com"));
        // Not at an RDN boundary.
        assert!(!issuffix(dn, "xample,dc=com"));
        // Transitivity.
        let (a, b, c) = (dn, "ou=people,dc=example,dc=com", "dc=com");
        assert!(issuffix(a, b) && issuffix(b, c) && issuffix(a, c));
    }

    #[test]
    fn parent_walks_up() {
        assert_eq!(parent("uid=bob,ou=people,dc=x"), Some("ou=people,dc=x"));
        assert_eq!(parent("dc=x"), None);
        assert_eq!(parent(""), None);
    }

    #[test]
    fn scope_tests() {
        let base = "ou=people,dc=x";
        assert!(scope_test(base, base, Scope::Base));
        assert!(!scope_test("uid=a,ou=people,dc=x", base, Scope::Base));
        assert!(scope_test("uid=a,ou=people,dc=x", base, Scope::OneLevel));
        assert!(!scope_test("cn=c,uid=a,ou=people,dc=x", base, Scope::OneLevel));
        assert!(scope_test("cn=c,uid=a,ou=people,dc=x", base, Scope::Subtree));
        assert!(scope_test(base, base, Scope::Subtree));
        assert!(scope_test("dc=x", "", Scope::OneLevel));
    }

    #[test]
    fn sdn_identity_and_navigation() {
        let sdn = Sdn::new("UID=Bob, OU=People, DC=Example, DC=Com").unwrap();
        assert_eq!(sdn.as_ndn(), "uid=bob,ou=people,dc=example,dc=com");
        assert_eq!(sdn.as_dn(), "UID=Bob, OU=People, DC=Example, DC=Com");
        assert_eq!(sdn.rdn(), Some("uid=bob"));
        assert_eq!(sdn.rdn_count(), 4);
        let parent = sdn.parent().unwrap();
        assert_eq!(parent.as_ndn(), "ou=people,dc=example,dc=com");
        assert_eq!(sdn, Sdn::new("uid=bob,ou=people,dc=example,dc=com").unwrap());

        let child = parent.add_rdn("cn=new").unwrap();
        assert_eq!(child.as_ndn(), "cn=new,ou=people,dc=example,dc=com");
        let moved = sdn.set_parent(&Sdn::new("ou=robots,dc=example").unwrap()).unwrap();
        assert_eq!(moved.as_ndn(), "uid=bob,ou=robots,dc=example");
    }

    #[test]
    fn dn_syntax_values_sort_nested_components() {
        let ndn = normalize("member=uid\\3Db\\2Bcn\\3Da,o=org").unwrap();
        assert_eq!(ndn, "member=cn\\3Da\\2Buid\\3Db,o=org");
    }
}
