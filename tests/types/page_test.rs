use xbase::types::page::{IndexEntry, IndexPage};

fn entry(child: u32, rec_no: u32, key: &[u8]) -> IndexEntry {
    IndexEntry {
        child,
        rec_no,
        key: key.to_vec(),
    }
}

#[test]
fn test_leaf_slots() {
    let page = IndexPage {
        entries: vec![entry(0, 1, b"A"), entry(0, 2, b"B")],
        trailing_child: 0,
    };
    assert!(page.is_leaf());
    assert_eq!(page.slot_count(), 5);
    assert_eq!(page.child_at_slot(0), 0);
    assert_eq!(page.entry_at_slot(1).unwrap().rec_no, 1);
    assert_eq!(page.entry_at_slot(3).unwrap().rec_no, 2);
    assert!(page.entry_at_slot(2).is_none());
    assert!(page.entry_at_slot(4).is_none());
}

#[test]
fn test_interior_slots() {
    let page = IndexPage {
        entries: vec![entry(3, 0, b"M")],
        trailing_child: 4,
    };
    assert!(!page.is_leaf());
    assert_eq!(page.slot_count(), 3);
    assert_eq!(page.child_at_slot(0), 3);
    assert_eq!(page.child_at_slot(2), 4);
    assert!(!page.entry_at_slot(1).unwrap().is_record());
}

#[test]
fn test_empty_page() {
    let page = IndexPage::default();
    assert!(page.is_leaf());
    assert_eq!(page.slot_count(), 1);
    assert_eq!(page.child_at_slot(0), 0);
}
