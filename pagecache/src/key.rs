//! Identity of a cached page.

use std::fmt;

/// Identifies a page by the id of the file it belongs to and its index within that file.
///
/// Keys are ordered by `file_id` and then by `page_index`, so iterating an ordered collection of
/// keys visits the pages of each file sequentially.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    pub file_id: u64,
    pub page_index: u64,
}

impl PageKey {
    pub const fn new(file_id: u64, page_index: u64) -> Self {
        Self {
            file_id,
            page_index,
        }
    }

    /// The first possible key of a file.
    pub const fn first(file_id: u64) -> Self {
        Self::new(file_id, 0)
    }

    /// The last possible key of a file.
    pub const fn last(file_id: u64) -> Self {
        Self::new(file_id, u64::MAX)
    }

    /// Returns true if `other` is the page directly following this one in the same file.
    pub const fn precedes(&self, other: &Self) -> bool {
        self.file_id == other.file_id
            && self.page_index < u64::MAX
            && self.page_index + 1 == other.page_index
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_key_order() {
        let keys: BTreeSet<_> = [
            PageKey::new(2, 0),
            PageKey::new(1, 7),
            PageKey::new(1, 3),
            PageKey::new(2, u64::MAX),
        ]
        .into_iter()
        .collect();
        let ordered: Vec<_> = keys.into_iter().collect();
        assert_eq!(
            ordered,
            vec![
                PageKey::new(1, 3),
                PageKey::new(1, 7),
                PageKey::new(2, 0),
                PageKey::new(2, u64::MAX),
            ]
        );
        assert!(PageKey::first(2) <= PageKey::new(2, 0));
        assert!(PageKey::last(1) < PageKey::first(2));
    }

    #[test]
    fn test_key_precedes() {
        assert!(PageKey::new(1, 3).precedes(&PageKey::new(1, 4)));
        assert!(!PageKey::new(1, 3).precedes(&PageKey::new(1, 5)));
        assert!(!PageKey::new(1, 3).precedes(&PageKey::new(2, 4)));
        assert!(!PageKey::last(1).precedes(&PageKey::first(1)));
    }

    #[test]
    fn test_key_display() {
        assert_eq!(PageKey::new(4, 12).to_string(), "4:12");
    }
}
