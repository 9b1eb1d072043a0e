//! # Multi Address Container
//!
//! Linked lists of device page numbers for physical pages mapped at more
//! than one device address. Lists are identified by the id of their first
//! entry; freed entries are recycled.

const INVALID_ID: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Entry {
    next: u32,
    value: u32,
}

/// Storage for every multi-mapped physical page's device address list
#[derive(Debug, Default)]
pub struct MultiAddressContainer {
    entries: Vec<Entry>,
    free: Vec<u32>,
}

impl MultiAddressContainer {
    /// Create an empty container
    pub fn new() -> Self {
        Self::default()
    }

    fn new_entry(&mut self, value: u32) -> u32 {
        let entry = Entry { next: INVALID_ID, value };
        match self.free.pop() {
            Some(id) => {
                self.entries[id as usize] = entry;
                id
            }
            None => {
                let id = u32::try_from(self.entries.len()).expect("multi address container full");
                assert!(id != INVALID_ID, "multi address container full");
                self.entries.push(entry);
                id
            }
        }
    }

    /// Start a new list holding `value`; returns its id
    pub fn register(&mut self, value: u32) -> u32 {
        self.new_entry(value)
    }

    /// Append `value` to the list starting at `start_id`
    pub fn register_with(&mut self, value: u32, start_id: u32) {
        let mut id = start_id;
        while self.entries[id as usize].next != INVALID_ID {
            id = self.entries[id as usize].next;
        }
        let new_id = self.new_entry(value);
        self.entries[id as usize].next = new_id;
    }

    /// Remove `value` from the list starting at `start_id`.
    ///
    /// Returns whether more than one value remains, and the list's new start.
    pub fn unregister(&mut self, value: u32, start_id: u32) -> (bool, u32) {
        let mut previous = None;
        let mut id = start_id;
        let mut count = 0usize;
        while self.entries[id as usize].value != value {
            count += 1;
            previous = Some(id);
            id = self.entries[id as usize].next;
            assert!(id != INVALID_ID, "device page {value:#x} missing from multi mapping");
        }

        let next = self.entries[id as usize].next;
        let mut more_than_one_remaining = false;
        if next != INVALID_ID {
            count += 1;
            more_than_one_remaining = self.entries[next as usize].next != INVALID_ID;
        }

        let new_start = match previous {
            Some(previous) => {
                self.entries[previous as usize].next = next;
                start_id
            }
            None => next,
        };
        self.free.push(id);
        (more_than_one_remaining || count > 1, new_start)
    }

    /// Free a single-entry list, returning its value
    pub fn release_entry(&mut self, start_id: u32) -> u32 {
        let entry = self.entries[start_id as usize];
        debug_assert_eq!(entry.next, INVALID_ID);
        self.free.push(start_id);
        entry.value
    }

    /// Collect every value of the list starting at `start_id` into `out`
    pub fn gather(&self, start_id: u32, out: &mut Vec<u32>) {
        out.clear();
        let mut id = start_id;
        while id != INVALID_ID {
            let entry = self.entries[id as usize];
            out.push(entry.value);
            id = entry.next;
        }
    }

    /// Number of live entries
    pub fn live_entries(&self) -> usize {
        self.entries.len() - self.free.len()
    }
}
