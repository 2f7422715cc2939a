//! Directory entries and the LDIF-style record codec used by the DSE file.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;

use crate::attr::{is_operational_type, Attr};
use crate::dn::Sdn;
use crate::error::{LdapError, LdapResult};
use crate::value::Value;
use crate::valueset::ValueSetError;

/// One modification of an entry's attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
    Add,
    Delete,
    Replace,
}

/// A modification: operation, attribute type, and the values it applies to.
#[derive(Debug, Clone)]
pub struct Mod {
    pub op: ModOp,
    pub ty: String,
    pub values: Vec<Value>,
}

impl Mod {
    #[must_use]
    pub fn new(op: ModOp, ty: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            op,
            ty: ty.into(),
            values,
        }
    }
}

/// An entry: a DN plus an ordered list of attributes.
#[derive(Debug, Clone)]
pub struct Entry {
    sdn: Sdn,
    attrs: Vec<Attr>,
}

impl Entry {
    #[must_use]
    pub fn new(sdn: Sdn) -> Self {
        Self {
            sdn,
            attrs: Vec::new(),
        }
    }

    #[must_use]
    pub fn sdn(&self) -> &Sdn {
        &self.sdn
    }

    pub fn set_sdn(&mut self, sdn: Sdn) {
        self.sdn = sdn;
    }

    #[must_use]
    pub fn attrs(&self) -> &[Attr] {
        &self.attrs
    }

    #[must_use]
    pub fn attr(&self, ty: &str) -> Option<&Attr> {
        self.attrs.iter().find(|a| a.name().eq_ignore_ascii_case(ty))
    }

    fn attr_mut(&mut self, ty: &str) -> Option<&mut Attr> {
        self.attrs
            .iter_mut()
            .find(|a| a.name().eq_ignore_ascii_case(ty))
    }

    #[must_use]
    pub fn has_attr(&self, ty: &str) -> bool {
        self.attr(ty).is_some()
    }

    /// First value of an attribute as text.
    #[must_use]
    pub fn first_value_str(&self, ty: &str) -> Option<&str> {
        self.attr(ty).and_then(Attr::first_str)
    }

    /// Adds values to an attribute, creating the attribute if needed.
    pub fn add_values(&mut self, ty: &str, values: Vec<Value>, dup_check: bool) -> LdapResult<()> {
        if let Some(attr) = self.attr_mut(ty) {
            attr.add_values(values, dup_check)
                .map_err(|ValueSetError::Duplicate { index }| {
                    LdapError::TypeOrValueExists(format!("{ty} (value {index})"))
                })
        } else {
            let mut attr = Attr::new(ty);
            attr.add_values(values, dup_check)
                .map_err(|ValueSetError::Duplicate { index }| {
                    LdapError::TypeOrValueExists(format!("{ty} (value {index})"))
                })?;
            self.attrs.push(attr);
            Ok(())
        }
    }

    /// Deletes specific values, or the whole attribute when `values` is
    /// empty. Deleting a missing attribute or value fails.
    pub fn delete_values(&mut self, ty: &str, values: &[Value]) -> LdapResult<()> {
        let index = self
            .attrs
            .iter()
            .position(|a| a.name().eq_ignore_ascii_case(ty))
            .ok_or_else(|| LdapError::NoSuchAttribute(ty.to_owned()))?;
        if values.is_empty() {
            self.attrs.remove(index);
            return Ok(());
        }
        for v in values {
            let mut probe = v.clone();
            if self.attrs[index].remove_value(&mut probe, false).is_none() {
                return Err(LdapError::NoSuchAttribute(format!("{ty}: no such value")));
            }
        }
        if self.attrs[index].count() == 0 {
            self.attrs.remove(index);
        }
        Ok(())
    }

    /// Replaces an attribute's values wholesale. Replacing with no values
    /// removes the attribute; replacing a missing attribute creates it.
    pub fn replace_values(&mut self, ty: &str, values: Vec<Value>) -> LdapResult<()> {
        if values.is_empty() {
            self.attrs.retain(|a| !a.name().eq_ignore_ascii_case(ty));
            return Ok(());
        }
        if let Some(attr) = self.attr_mut(ty) {
            attr.replace_values(values)
                .map_err(|ValueSetError::Duplicate { index }| {
                    LdapError::TypeOrValueExists(format!("{ty} (value {index})"))
                })
        } else {
            self.add_values(ty, values, true)
        }
    }

    /// Applies a modification list in order; the first failure aborts.
    pub fn apply_mods(&mut self, mods: &[Mod]) -> LdapResult<()> {
        for m in mods {
            match m.op {
                ModOp::Add => self.add_values(&m.ty, m.values.clone(), true)?,
                ModOp::Delete => self.delete_values(&m.ty, &m.values)?,
                ModOp::Replace => self.replace_values(&m.ty, m.values.clone())?,
            }
        }
        Ok(())
    }

    /// Serializes the entry as one LDIF record (no trailing blank line).
    #[must_use]
    pub fn to_ldif(&self, write_operational: bool) -> String {
        let mut out = String::new();
        push_ldif_line(&mut out, "dn", self.sdn.as_dn().as_bytes());
        for attr in &self.attrs {
            if !write_operational && is_operational_type(attr.name()) {
                continue;
            }
            for v in attr.values().iter() {
                push_ldif_line(&mut out, attr.name(), v.bytes());
            }
        }
        out
    }

    /// Parses one LDIF record. Continuation lines (leading space) are
    /// unfolded and comment lines are skipped; the first attribute line must
    /// be the `dn`.
    pub fn from_ldif(record: &str) -> LdapResult<Entry> {
        let mut lines: Vec<String> = Vec::new();
        for raw in record.lines() {
            if raw.starts_with('#') {
                continue;
            }
            if let Some(cont) = raw.strip_prefix(' ') {
                match lines.last_mut() {
                    Some(last) => last.push_str(cont),
                    None => {
                        return Err(LdapError::MalformedMessage(
                            "continuation line with nothing to continue".into(),
                        ))
                    }
                }
            } else if !raw.is_empty() {
                lines.push(raw.to_owned());
            }
        }
        let mut entry: Option<Entry> = None;
        for line in &lines {
            let (ty, value) = parse_ldif_line(line)?;
            if ty.eq_ignore_ascii_case("dn") {
                if entry.is_some() {
                    return Err(LdapError::MalformedMessage("second dn line in record".into()));
                }
                let dn = String::from_utf8(value)
                    .map_err(|_| LdapError::MalformedMessage("dn is not UTF-8".into()))?;
                entry = Some(Entry::new(Sdn::new(&dn)?));
            } else {
                let entry = entry.as_mut().ok_or_else(|| {
                    LdapError::MalformedMessage("record does not begin with dn".into())
                })?;
                entry.add_values(&ty, vec![Value::new(Bytes::from(value))], false)?;
            }
        }
        entry.ok_or_else(|| LdapError::MalformedMessage("empty record".into()))
    }
}

impl PartialEq for Entry {
    /// Entries compare equal when their DNs normalize identically and their
    /// attribute value sets hold the same bytes, regardless of order.
    fn eq(&self, other: &Self) -> bool {
        if self.sdn != other.sdn || self.attrs.len() != other.attrs.len() {
            return false;
        }
        self.attrs.iter().all(|a| {
            other.attr(a.name()).is_some_and(|b| {
                let mut av: Vec<&[u8]> = a.values().iter().map(|v| v.bytes().as_ref()).collect();
                let mut bv: Vec<&[u8]> = b.values().iter().map(|v| v.bytes().as_ref()).collect();
                av.sort_unstable();
                bv.sort_unstable();
                av == bv
            })
        })
    }
}

impl Eq for Entry {}

/// Whether a value can be written verbatim after `attr: `.
fn ldif_safe(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return true;
    }
    if matches!(bytes[0], b' ' | b':' | b'<') || *bytes.last().unwrap_or(&b' ') == b' ' {
        return false;
    }
    bytes.iter().all(|&b| (0x20..0x7f).contains(&b))
}

fn push_ldif_line(out: &mut String, ty: &str, value: &[u8]) {
    out.push_str(ty);
    if ldif_safe(value) {
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value));
    } else {
        out.push_str(":: ");
        out.push_str(&BASE64.encode(value));
    }
    out.push('\n');
}

fn parse_ldif_line(line: &str) -> LdapResult<(String, Vec<u8>)> {
    let colon = line
        .find(':')
        .ok_or_else(|| LdapError::MalformedMessage(format!("no ':' in line {line:?}")))?;
    let ty = line[..colon].trim().to_owned();
    if ty.is_empty() {
        return Err(LdapError::MalformedMessage("empty attribute type".into()));
    }
    let rest = &line[colon + 1..];
    if let Some(b64) = rest.strip_prefix(':') {
        let decoded = BASE64
            .decode(b64.trim_start())
            .map_err(|e| LdapError::MalformedMessage(format!("bad base64 value: {e}")))?;
        Ok((ty, decoded))
    } else {
        Ok((ty, rest.strip_prefix(' ').unwrap_or(rest).as_bytes().to_vec()))
    }
}
