//! Attributes: a name, a syntax descriptor, and a value set.

use std::cmp::Ordering;

use crate::csn::Csn;
use crate::dn::{self, is_dn_syntax_type};
use crate::error::{LdapError, LdapResult};
use crate::value::Value;
use crate::valueset::{ValueSet, ValueSetError};

/// Attribute types the server maintains itself. They are skipped by the DSE
/// file writer when operational output is disabled and stripped on load where
/// noted.
const OPERATIONAL_TYPES: &[&str] = &[
    "numsubordinates",
    "creatorsname",
    "modifiersname",
    "createtimestamp",
    "modifytimestamp",
    "nsuniqueid",
];

#[must_use]
pub fn is_operational_type(ty: &str) -> bool {
    OPERATIONAL_TYPES.iter().any(|t| ty.eq_ignore_ascii_case(t))
}

/// The matching behavior an attribute's syntax supplies. The syntax produces
/// the normalize-to-key function that orders the attribute's value set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrSyntax {
    /// Case-insensitive directory strings (the default).
    CaseIgnore,
    /// Byte-exact octet strings.
    CaseExact,
    /// Values that are DNs; keys are the normalized DN bytes.
    Dn,
}

impl AttrSyntax {
    /// Chooses a syntax for an attribute type name.
    #[must_use]
    pub fn for_type(ty: &str) -> Self {
        if is_dn_syntax_type(ty) {
            Self::Dn
        } else {
            Self::CaseIgnore
        }
    }

    /// Produces the equality matching key for a value.
    pub fn key_of(&self, v: &Value) -> LdapResult<Vec<u8>> {
        match self {
            Self::CaseExact => Ok(v.bytes().to_vec()),
            Self::CaseIgnore => {
                let s = v
                    .as_str()
                    .ok_or_else(|| LdapError::InvalidSyntax("value is not UTF-8".into()))?;
                Ok(s.to_lowercase().into_bytes())
            }
            Self::Dn => {
                let s = v
                    .as_str()
                    .ok_or_else(|| LdapError::InvalidSyntax("DN value is not UTF-8".into()))?;
                Ok(dn::normalize(s)?.into_bytes())
            }
        }
    }
}

/// Compares two values under a syntax's key function. If the key function
/// fails, falls back to a case-insensitive UTF-8 comparison and logs it.
#[must_use]
pub fn value_cmp(syntax: AttrSyntax, a: &Value, b: &Value) -> Ordering {
    match (syntax.key_of(a), syntax.key_of(b)) {
        (Ok(ka), Ok(kb)) => ka.cmp(&kb),
        _ => {
            tracing::debug!("matching key function failed, falling back to casefold compare");
            let fold = |v: &Value| {
                v.as_str()
                    .map(str::to_lowercase)
                    .unwrap_or_else(|| String::from_utf8_lossy(v.bytes()).to_lowercase())
            };
            fold(a).cmp(&fold(b))
        }
    }
}

/// A named attribute with its multiset of values.
#[derive(Debug, Clone)]
pub struct Attr {
    name: String,
    syntax: AttrSyntax,
    values: ValueSet,
}

impl Attr {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let syntax = AttrSyntax::for_type(&name);
        Self {
            name,
            syntax,
            values: ValueSet::new(),
        }
    }

    /// Builds an attribute pre-populated with values; duplicates collapse.
    #[must_use]
    pub fn with_values(name: impl Into<String>, vals: Vec<Value>) -> Self {
        let mut attr = Self::new(name);
        for v in vals {
            let _ = attr.values.add(attr.syntax, v, true);
        }
        attr
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn syntax(&self) -> AttrSyntax {
        self.syntax
    }

    #[must_use]
    pub fn values(&self) -> &ValueSet {
        &self.values
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn add_value(&mut self, v: Value, dup_check: bool) -> Result<(), ValueSetError> {
        self.values.add(self.syntax, v, dup_check)
    }

    pub fn add_values(&mut self, vals: Vec<Value>, dup_check: bool) -> Result<(), ValueSetError> {
        self.values.add_all(self.syntax, vals, dup_check)
    }

    /// Removes a matching value. With `preserve_csns`, the stored value's CSN
    /// set moves into `probe` before the stored value is returned.
    pub fn remove_value(&mut self, probe: &mut Value, preserve_csns: bool) -> Option<Value> {
        self.values.remove(self.syntax, probe, preserve_csns)
    }

    #[must_use]
    pub fn find_value(&self, probe: &Value) -> Option<&Value> {
        self.values.find(self.syntax, probe)
    }

    pub fn replace_values(&mut self, vals: Vec<Value>) -> Result<(), ValueSetError> {
        self.values.replace(self.syntax, vals)
    }

    /// Drops CSNs older than `csn` from every value, freeing values whose
    /// CSN set empties out.
    pub fn purge(&mut self, csn: &Csn) {
        self.values.purge(csn);
    }

    #[must_use]
    pub fn first_str(&self) -> Option<&str> {
        self.values.first().and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_selection_follows_type() {
        assert_eq!(AttrSyntax::for_type("member"), AttrSyntax::Dn);
        assert_eq!(AttrSyntax::for_type("cn"), AttrSyntax::CaseIgnore);
    }

    #[test]
    fn dn_syntax_keys_normalize() {
        let syntax = AttrSyntax::Dn;
        let a = Value::from("CN=Kirsten, O=Example");
        let b = Value::from("cn=kirsten,o=example");
        assert_eq!(value_cmp(syntax, &a, &b), Ordering::Equal);
    }

    #[test]
    fn non_utf8_values_fall_back_to_lossy_compare() {
        let syntax = AttrSyntax::CaseIgnore;
        let a = Value::new(bytes::Bytes::from_static(&[0xff, 0x41]));
        let b = Value::new(bytes::Bytes::from_static(&[0xff, 0x61]));
        assert_eq!(value_cmp(syntax, &a, &b), Ordering::Equal);
    }

    #[test]
    fn with_values_collapses_duplicates() {
        let attr = Attr::with_values("cn", vec!["A".into(), "a".into(), "b".into()]);
        assert_eq!(attr.count(), 2);
    }
}
