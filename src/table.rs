// File: src/table.rs
//
// Open-addressed hash table (spec §4.5). Used for string interning, class
// method tables, instance field tables, and the global name -> slot table.
// Capacity is always a power of two; load factor is kept under 0.65 by
// growing (doubling) before insertion would exceed it.

use std::cell::{Cell, RefCell};

use crate::value::{GcRef, ObjData, Value};

const MAX_LOAD: f64 = 0.65;

#[derive(Clone, Copy)]
struct Entry {
    key: Value,
    value: Value,
}

pub struct Table {
    count: Cell<usize>,
    entries: RefCell<Vec<Entry>>,
}

impl Table {
    pub fn new() -> Self {
        Table { count: Cell::new(0), entries: RefCell::new(Vec::new()) }
    }

    pub fn len(&self) -> usize {
        self.count.get()
    }

    pub fn is_empty(&self) -> bool {
        self.count.get() == 0
    }

    pub fn approx_size(&self) -> usize {
        self.entries.borrow().len() * std::mem::size_of::<Entry>()
    }

    fn capacity(&self) -> usize {
        self.entries.borrow().len()
    }

    /// `find_entry` (spec §4.5): the first tombstone seen, or the first
    /// empty (never-used) slot if the key is absent.
    fn find_entry(entries: &[Entry], key: Value) -> usize {
        let cap = entries.len();
        let mut index = (key.hash_value() as usize) & (cap - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                Value::Empty => {
                    if entry.value.is_nil() {
                        return tombstone.unwrap_or(index);
                    } else if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                k if values_equal(k, key) => return index,
                _ => {}
            }
            index = (index + 1) & (cap - 1);
        }
    }

    fn adjust_capacity(&self, new_capacity: usize) {
        let mut new_entries = vec![Entry { key: Value::Empty, value: Value::Nil }; new_capacity];
        let old_entries = self.entries.borrow();
        let mut new_count = 0;
        for entry in old_entries.iter() {
            if matches!(entry.key, Value::Empty) {
                continue;
            }
            let idx = Self::find_entry(&new_entries, entry.key);
            new_entries[idx] = *entry;
            new_count += 1;
        }
        drop(old_entries);
        *self.entries.borrow_mut() = new_entries;
        self.count.set(new_count);
    }

    /// Returns `true` if this inserted a brand-new key.
    pub fn set(&self, key: Value, value: Value) -> bool {
        let needs_growth = {
            let cap = self.capacity();
            cap == 0 || (self.count.get() + 1) as f64 > cap as f64 * MAX_LOAD
        };
        if needs_growth {
            let new_cap = grow_capacity(self.capacity());
            self.adjust_capacity(new_cap);
        }

        let mut entries = self.entries.borrow_mut();
        let idx = Self::find_entry(&entries, key);
        let is_new_key = matches!(entries[idx].key, Value::Empty);
        if is_new_key && entries[idx].value.is_nil() {
            self.count.set(self.count.get() + 1);
        }
        entries[idx] = Entry { key, value };
        is_new_key
    }

    pub fn get(&self, key: Value) -> Option<Value> {
        if self.count.get() == 0 {
            return None;
        }
        let entries = self.entries.borrow();
        let idx = Self::find_entry(&entries, key);
        let entry = &entries[idx];
        if matches!(entry.key, Value::Empty) {
            None
        } else {
            Some(entry.value)
        }
    }

    pub fn delete(&self, key: Value) -> bool {
        if self.count.get() == 0 {
            return false;
        }
        let mut entries = self.entries.borrow_mut();
        let idx = Self::find_entry(&entries, key);
        if matches!(entries[idx].key, Value::Empty) {
            return false;
        }
        entries[idx] = Entry { key: Value::Empty, value: Value::Bool(true) };
        true
    }

    pub fn add_all(&self, from: &Table) {
        let entries = from.entries.borrow();
        for entry in entries.iter() {
            if !matches!(entry.key, Value::Empty) {
                self.set(entry.key, entry.value);
            }
        }
    }

    /// The unique path by which new strings become canonical
    /// (spec §4.5: "find_string").
    pub fn find_string(&self, bytes: &[u8], hash: u32) -> Option<GcRef> {
        let entries = self.entries.borrow();
        let cap = entries.len();
        if cap == 0 {
            return None;
        }
        let mut index = (hash as usize) & (cap - 1);
        loop {
            let entry = &entries[index];
            match entry.key {
                Value::Empty => {
                    if entry.value.is_nil() {
                        return None;
                    }
                }
                Value::Obj(r) => {
                    if let ObjData::Str(s) = unsafe { &r.as_ref().data } {
                        if s.hash == hash && s.bytes.as_ref() == bytes {
                            return Some(r);
                        }
                    }
                }
                _ => {}
            }
            index = (index + 1) & (cap - 1);
        }
    }

    /// Removes entries whose key string is unmarked in the current
    /// collection (spec §4.4: "string table sweep... before the general
    /// sweep"). Never triggers a resize.
    pub fn remove_white(&self, marker: bool) {
        let mut entries = self.entries.borrow_mut();
        for entry in entries.iter_mut() {
            if let Value::Obj(r) = entry.key {
                let marked = unsafe { r.as_ref() }.marked.get();
                if marked != marker {
                    *entry = Entry { key: Value::Empty, value: Value::Bool(true) };
                }
            }
        }
    }

    pub fn iter(&self) -> Vec<(Value, Value)> {
        self.entries
            .borrow()
            .iter()
            .filter(|e| !matches!(e.key, Value::Empty))
            .map(|e| (e.key, e.value))
            .collect()
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

fn grow_capacity(capacity: usize) -> usize {
    if capacity < 8 {
        8
    } else {
        capacity * 2
    }
}

fn values_equal(a: Value, b: Value) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_roundtrip() {
        let table = Table::new();
        table.set(Value::Number(1.0), Value::Number(42.0));
        assert_eq!(table.get(Value::Number(1.0)), Some(Value::Number(42.0)));
        assert_eq!(table.get(Value::Number(2.0)), None);
    }

    #[test]
    fn delete_then_reinsert_uses_tombstone() {
        let table = Table::new();
        table.set(Value::Number(1.0), Value::Bool(true));
        assert!(table.delete(Value::Number(1.0)));
        assert_eq!(table.get(Value::Number(1.0)), None);
        table.set(Value::Number(1.0), Value::Bool(false));
        assert_eq!(table.get(Value::Number(1.0)), Some(Value::Bool(false)));
    }

    #[test]
    fn load_factor_stays_under_max() {
        let table = Table::new();
        for i in 0..1000 {
            table.set(Value::Number(i as f64), Value::Bool(true));
        }
        let cap = table.capacity();
        assert!((table.len() as f64 / cap as f64) < MAX_LOAD);
    }
}
