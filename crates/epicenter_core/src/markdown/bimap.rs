//! Bidirectional row-id ↔ filename tracking.
//!
//! Each markdown-indexed table keeps one of these maps so that a filename
//! change can delete the old file, and an external file deletion can find
//! the row to remove. Both directions are O(1).

use std::collections::HashMap;

/// Per-table mapping between row ids and markdown filenames.
#[derive(Debug, Default)]
pub struct FilenameMap {
    by_row: HashMap<String, String>,
    by_filename: HashMap<String, String>,
}

impl FilenameMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a row with a filename, updating both directions.
    ///
    /// Stale reverse entries are evicted: if the row previously mapped to a
    /// different filename, or the filename to a different row, those old
    /// associations are removed first. On filename collisions the latest
    /// writer wins.
    pub fn set(&mut self, row_id: impl Into<String>, filename: impl Into<String>) {
        let row_id = row_id.into();
        let filename = filename.into();

        if let Some(old_filename) = self.by_row.get(&row_id)
            && *old_filename != filename
        {
            self.by_filename.remove(old_filename);
        }
        if let Some(old_row) = self.by_filename.get(&filename)
            && *old_row != row_id
        {
            self.by_row.remove(old_row);
        }

        self.by_row.insert(row_id.clone(), filename.clone());
        self.by_filename.insert(filename, row_id);
    }

    /// Remove the association for a row, if any.
    pub fn delete_by_row(&mut self, row_id: &str) -> Option<String> {
        let filename = self.by_row.remove(row_id)?;
        self.by_filename.remove(&filename);
        Some(filename)
    }

    /// Remove the association for a filename, if any.
    pub fn delete_by_filename(&mut self, filename: &str) -> Option<String> {
        let row_id = self.by_filename.remove(filename)?;
        self.by_row.remove(&row_id);
        Some(row_id)
    }

    /// The filename currently tracked for a row.
    pub fn get_filename(&self, row_id: &str) -> Option<&str> {
        self.by_row.get(row_id).map(String::as_str)
    }

    /// The row currently tracked for a filename.
    pub fn get_row_id(&self, filename: &str) -> Option<&str> {
        self.by_filename.get(filename).map(String::as_str)
    }

    /// Drop every association.
    pub fn clear(&mut self) {
        self.by_row.clear();
        self.by_filename.clear();
    }

    /// Number of tracked associations.
    pub fn len(&self) -> usize {
        self.by_row.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.by_row.is_empty()
    }

    /// Whether the forward and reverse images agree.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        self.by_row.len() == self.by_filename.len()
            && self
                .by_row
                .iter()
                .all(|(row, file)| self.by_filename.get(file).is_some_and(|r| r == row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_lookup_both_directions() {
        let mut map = FilenameMap::new();
        map.set("a", "a.md");
        assert_eq!(map.get_filename("a"), Some("a.md"));
        assert_eq!(map.get_row_id("a.md"), Some("a"));
        assert!(map.is_consistent());
    }

    #[test]
    fn rename_evicts_the_stale_reverse_entry() {
        let mut map = FilenameMap::new();
        map.set("a", "old.md");
        map.set("a", "new.md");

        assert_eq!(map.get_filename("a"), Some("new.md"));
        assert_eq!(map.get_row_id("old.md"), None);
        assert_eq!(map.get_row_id("new.md"), Some("a"));
        assert!(map.is_consistent());
    }

    #[test]
    fn filename_collision_last_writer_wins() {
        let mut map = FilenameMap::new();
        map.set("a", "shared.md");
        map.set("b", "shared.md");

        assert_eq!(map.get_row_id("shared.md"), Some("b"));
        assert_eq!(map.get_filename("a"), None);
        assert!(map.is_consistent());
    }

    #[test]
    fn deletes_clear_both_directions() {
        let mut map = FilenameMap::new();
        map.set("a", "a.md");
        map.set("b", "b.md");

        assert_eq!(map.delete_by_row("a"), Some("a.md".to_string()));
        assert_eq!(map.get_row_id("a.md"), None);

        assert_eq!(map.delete_by_filename("b.md"), Some("b".to_string()));
        assert_eq!(map.get_filename("b"), None);
        assert!(map.is_empty());
    }
}
