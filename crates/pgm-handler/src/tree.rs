use std::{
    cell::Cell,
    collections::{BTreeMap, btree_map},
};

use pgm_core::{Gcphys, PgmError};

use crate::{PhysHandler, RegisterError};

/// Hit and miss counters of the handler lookup cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LookupStats {
    /// Lookups answered by the cached handler.
    pub hits: u64,

    /// Lookups that had to search the tree.
    pub misses: u64,
}

/// Non-overlapping handler ranges keyed by their first byte.
#[derive(Debug, Default)]
pub(crate) struct HandlerTree {
    handlers: BTreeMap<Gcphys, PhysHandler>,
    last_hit: Cell<Option<Gcphys>>,
    hits: Cell<u64>,
    misses: Cell<u64>,
}

impl HandlerTree {
    /// Returns the handler overlapping `[start, last]`, if any.
    pub fn overlapping(&self, start: Gcphys, last: Gcphys) -> Option<&PhysHandler> {
        self.handlers
            .range(..=last)
            .next_back()
            .map(|(_, handler)| handler)
            .filter(|handler| handler.last >= start)
    }

    /// Returns every handler overlapping `[start, last]`, highest first.
    pub fn covering(&self, start: Gcphys, last: Gcphys) -> impl Iterator<Item = &PhysHandler> {
        self.handlers
            .range(..=last)
            .rev()
            .map(|(_, handler)| handler)
            .take_while(move |handler| handler.last >= start)
    }

    pub fn covering_mut(
        &mut self,
        start: Gcphys,
        last: Gcphys,
    ) -> impl Iterator<Item = &mut PhysHandler> {
        self.handlers
            .range_mut(..=last)
            .rev()
            .map(|(_, handler)| handler)
            .take_while(move |handler| handler.last >= start)
    }

    /// Returns the error an insertion of `[start, last]` would fail with.
    pub fn conflict(&self, start: Gcphys, last: Gcphys) -> Option<PgmError> {
        let existing = self.overlapping(start, last)?;

        Some(PgmError::Conflict {
            start,
            last,
            existing_start: existing.start,
            existing_last: existing.last,
        })
    }

    /// Inserts a handler whose range is already set.
    pub fn insert(&mut self, handler: PhysHandler) -> Result<(), RegisterError> {
        if let Some(error) = self.conflict(handler.start, handler.last) {
            return Err(RegisterError { error, handler });
        }

        self.handlers.insert(handler.start, handler);
        Ok(())
    }

    /// Removes the handler starting exactly at `key`.
    pub fn remove(&mut self, key: Gcphys) -> Option<PhysHandler> {
        self.last_hit.set(None);
        self.handlers.remove(&key)
    }

    pub fn get(&self, key: Gcphys) -> Option<&PhysHandler> {
        self.handlers.get(&key)
    }

    pub fn get_mut(&mut self, key: Gcphys) -> Option<&mut PhysHandler> {
        self.handlers.get_mut(&key)
    }

    /// Returns the handler containing `gcphys`.
    ///
    /// The most recent hit is checked first.
    pub fn find(&self, gcphys: Gcphys) -> Option<&PhysHandler> {
        let key = self.find_key(gcphys)?;
        self.handlers.get(&key)
    }

    pub fn find_mut(&mut self, gcphys: Gcphys) -> Option<&mut PhysHandler> {
        let key = self.find_key(gcphys)?;
        self.handlers.get_mut(&key)
    }

    fn find_key(&self, gcphys: Gcphys) -> Option<Gcphys> {
        if let Some(key) = self.last_hit.get()
            && let Some(handler) = self.handlers.get(&key)
            && handler.contains(gcphys)
        {
            self.hits.set(self.hits.get() + 1);
            return Some(key);
        }

        self.misses.set(self.misses.get() + 1);

        let (&key, _) = self
            .handlers
            .range(..=gcphys)
            .next_back()
            .filter(|(_, handler)| handler.contains(gcphys))?;

        self.last_hit.set(Some(key));
        Some(key)
    }

    /// Returns the nearest handler starting at or above `gcphys` if `above`
    /// is set, or starting at or below `gcphys` otherwise.
    pub fn best_fit(&self, gcphys: Gcphys, above: bool) -> Option<&PhysHandler> {
        let entry = if above {
            self.handlers.range(gcphys..).next()
        }
        else {
            self.handlers.range(..=gcphys).next_back()
        };

        entry.map(|(_, handler)| handler)
    }

    pub fn iter(&self) -> btree_map::Values<'_, Gcphys, PhysHandler> {
        self.handlers.values()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn invalidate_last_hit(&self) {
        self.last_hit.set(None);
    }

    pub fn stats(&self) -> LookupStats {
        LookupStats {
            hits: self.hits.get(),
            misses: self.misses.get(),
        }
    }
}
