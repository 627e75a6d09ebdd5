use crate::types::{PageNo, RecNo};

/*
 * Decoded index page, shared by both index dialects.
 *
 *   child_0  entry_0  child_1  entry_1 ... entry_n-1  trailing_child
 *
 * Keys under child_i sort at or before entry_i. An entry with rec_no 0 is a
 * separator only (interior NDX pages); NTX interior entries point at a record
 * as well as a child.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub child: PageNo,
    /// 1-based record number, 0 when the entry only separates children.
    pub rec_no: RecNo,
    pub key: Vec<u8>,
}

impl IndexEntry {
    pub fn is_record(&self) -> bool {
        self.rec_no > 0
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexPage {
    pub entries: Vec<IndexEntry>,
    /// Child for keys beyond the last entry; 0 for leaves.
    pub trailing_child: PageNo,
}

impl IndexPage {
    pub fn is_leaf(&self) -> bool {
        self.trailing_child == 0 && self.entries.iter().all(|e| e.child == 0)
    }

    /// A page visits `2 * entries + 1` slots in key order: even slots are
    /// children, odd slots are entries.
    pub fn slot_count(&self) -> usize {
        self.entries.len() * 2 + 1
    }

    pub fn child_at_slot(&self, slot: usize) -> PageNo {
        let i = slot / 2;
        if i < self.entries.len() {
            self.entries[i].child
        } else {
            self.trailing_child
        }
    }

    pub fn entry_at_slot(&self, slot: usize) -> Option<&IndexEntry> {
        if slot % 2 == 1 {
            self.entries.get(slot / 2)
        } else {
            None
        }
    }
}
