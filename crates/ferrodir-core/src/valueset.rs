//! The attribute value multiset.
//!
//! A value set keeps two views in sync: the value array itself (insertion
//! order, scanned linearly while the set is small) and a sorted-indices
//! array built once the set grows past [`SORT_THRESHOLD`] entries or a
//! duplicate-checking insert is requested. The sorted array holds indices
//! into the value array ordered by the attribute's equality matching key.

use std::cmp::Ordering;

use thiserror::Error;

use crate::attr::{value_cmp, AttrSyntax};
use crate::csn::Csn;
use crate::value::Value;

/// Set size beyond which the sorted-index array is maintained.
pub const SORT_THRESHOLD: usize = 10;

/// Errors from value-set mutation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueSetError {
    /// A duplicate-checked insert found the value already present. `index`
    /// is the 0-based position of the offending value in the caller's input.
    #[error("type or value exists (input index {index})")]
    Duplicate { index: usize },
}

#[derive(Debug, Clone, Default)]
pub struct ValueSet {
    va: Vec<Value>,
    sorted: Option<Vec<usize>>,
}

impl ValueSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.va.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.va.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<&Value> {
        self.va.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.va.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Value] {
        &self.va
    }

    fn check_invariant(&self) {
        debug_assert!(self.sorted.as_ref().map_or(true, |s| {
            s.len() == self.va.len() && s.iter().all(|&i| i < self.va.len())
        }));
    }

    /// Binary search over the sorted view. Returns the insertion slot and,
    /// when the probe is present, the position of the match.
    fn find_sorted(&self, syntax: AttrSyntax, probe: &Value) -> (usize, Option<usize>) {
        let sorted = match &self.sorted {
            Some(s) => s,
            None => return (0, None),
        };
        let mut bot: isize = -1;
        let mut top = sorted.len() as isize;
        while top - bot > 1 {
            let mid = (top + bot) / 2;
            if value_cmp(syntax, probe, &self.va[sorted[mid as usize]]) == Ordering::Greater {
                bot = mid;
            } else {
                top = mid;
            }
        }
        let slot = top as usize;
        if slot < sorted.len()
            && value_cmp(syntax, probe, &self.va[sorted[slot]]) == Ordering::Equal
        {
            (slot, Some(slot))
        } else {
            (slot, None)
        }
    }

    /// Builds the sorted-index array with an insertion sort; the array is
    /// always small when this first runs.
    fn build_sorted(&mut self, syntax: AttrSyntax) {
        let mut sorted: Vec<usize> = (0..self.va.len()).collect();
        for i in 1..sorted.len() {
            let swap = sorted[i];
            let mut j = i;
            while j > 0
                && value_cmp(syntax, &self.va[sorted[j - 1]], &self.va[swap]) == Ordering::Greater
            {
                sorted[j] = sorted[j - 1];
                j -= 1;
            }
            sorted[j] = swap;
        }
        self.sorted = Some(sorted);
    }

    fn ensure_sorted_for(&mut self, syntax: AttrSyntax, adding: usize, dup_check: bool) {
        if self.sorted.is_none() && (self.va.len() + adding > SORT_THRESHOLD || dup_check) {
            self.build_sorted(syntax);
        }
    }

    /// Adds one value. With `dup_check`, refuses a value already present.
    pub fn add(&mut self, syntax: AttrSyntax, v: Value, dup_check: bool) -> Result<(), ValueSetError> {
        self.add_all(syntax, vec![v], dup_check)
    }

    /// Adds a batch of values. With `dup_check`, the first duplicate aborts
    /// the whole batch: the set is restored to its prior state and the error
    /// names the offending input index.
    pub fn add_all(
        &mut self,
        syntax: AttrSyntax,
        vals: Vec<Value>,
        dup_check: bool,
    ) -> Result<(), ValueSetError> {
        if vals.is_empty() {
            return Ok(());
        }
        self.ensure_sorted_for(syntax, vals.len(), dup_check);
        let start = self.va.len();
        for (i, v) in vals.into_iter().enumerate() {
            if self.sorted.is_some() {
                let (slot, existing) = self.find_sorted(syntax, &v);
                if existing.is_some() && dup_check {
                    // Roll the whole batch back.
                    self.va.truncate(start);
                    self.sorted = None;
                    if self.va.len() > SORT_THRESHOLD {
                        self.build_sorted(syntax);
                    }
                    self.check_invariant();
                    return Err(ValueSetError::Duplicate { index: i });
                }
                self.va.push(v);
                if let Some(sorted) = &mut self.sorted {
                    sorted.insert(slot, self.va.len() - 1);
                }
            } else {
                self.va.push(v);
            }
        }
        self.check_invariant();
        Ok(())
    }

    /// Looks up a value by matching key.
    #[must_use]
    pub fn find(&self, syntax: AttrSyntax, probe: &Value) -> Option<&Value> {
        match &self.sorted {
            Some(sorted) => {
                let (slot, found) = self.find_sorted(syntax, probe);
                found.map(|_| &self.va[sorted[slot]])
            }
            None => self
                .va
                .iter()
                .find(|v| value_cmp(syntax, probe, v) == Ordering::Equal),
        }
    }

    /// Removes a matching value and returns it. With `preserve_csns`, the
    /// stored value's CSN set is moved into `probe` first.
    pub fn remove(
        &mut self,
        syntax: AttrSyntax,
        probe: &mut Value,
        preserve_csns: bool,
    ) -> Option<Value> {
        let index = if self.sorted.is_some() {
            let (slot, found) = self.find_sorted(syntax, probe);
            found?;
            let sorted = self.sorted.as_mut()?;
            let index = sorted[slot];
            sorted.remove(slot);
            // Indices past the removed element shift down by one.
            for s in sorted.iter_mut() {
                if *s > index {
                    *s -= 1;
                }
            }
            index
        } else {
            self.va
                .iter()
                .position(|v| value_cmp(syntax, probe, v) == Ordering::Equal)?
        };
        let mut removed = self.va.remove(index);
        if preserve_csns {
            probe.set_csns(removed.take_csns());
        }
        self.check_invariant();
        Some(removed)
    }

    /// Replaces the entire contents. A single replacement value installs in
    /// O(1); larger replacements build a fresh duplicate-checked set and, on
    /// a duplicate, leave this set untouched and name the offending index.
    pub fn replace(&mut self, syntax: AttrSyntax, vals: Vec<Value>) -> Result<(), ValueSetError> {
        if vals.len() <= 1 {
            self.va = vals;
            self.sorted = None;
            return Ok(());
        }
        let mut fresh = ValueSet::new();
        fresh.add_all(syntax, vals, true)?;
        *self = fresh;
        self.check_invariant();
        Ok(())
    }

    /// Removes every CSN older than `csn` from each value's CSN set and
    /// frees values whose set empties. The sorted view is rebuilt lazily on
    /// the next operation that needs it.
    pub fn purge(&mut self, csn: &Csn) {
        self.va.retain_mut(|v| {
            if v.csns().is_empty() {
                return true;
            }
            let mut csns = v.take_csns();
            csns.purge_older_than(csn);
            if csns.is_empty() {
                false
            } else {
                v.set_csns(csns);
                true
            }
        });
        self.sorted = None;
        self.check_invariant();
    }
}
