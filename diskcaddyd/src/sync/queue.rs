use diskcaddy_core::{ZipError, build_archive, read_entries};
use thiserror::Error;

use super::names::{base_of, file_name_of, is_archive, is_supported, sanitize_name, truncate_chars};

pub const MAX_ITEMS: usize = 14;
/// Character budget of an optimized name, extension excluded.
pub const NAME_BUDGET: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    pub name: String,
    pub original_name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("archive is unreadable: {0}")]
    Zip(#[from] ZipError),
    #[error("archive holds no supported disk images")]
    NoSupportedFiles,
}

impl ImportError {
    /// Short status label shown to the user.
    pub fn label(&self) -> &'static str {
        match self {
            ImportError::Zip(_) => "ZIP ERROR",
            ImportError::NoSupportedFiles => "NO SUPPORTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Added(usize),
    Full,
    Ignored,
}

#[derive(Debug, Default)]
pub struct DiskQueue {
    items: Vec<DiskImage>,
    optimized: bool,
}

impl DiskQueue {
    pub fn add(&mut self, name: &str, data: Vec<u8>) -> bool {
        if self.is_full() {
            return false;
        }
        let name = sanitize_name(name);
        self.items.push(DiskImage {
            original_name: name.clone(),
            name,
            data,
        });
        true
    }

    /// Adds every supported entry of a ZIP archive, dropping entries once full.
    pub fn import_archive(&mut self, bytes: &[u8]) -> Result<usize, ImportError> {
        let entries = read_entries(bytes)?;
        let mut has_supported = false;
        let mut added = 0;
        for entry in entries {
            if entry.is_dir() || !is_supported(&entry.name) {
                continue;
            }
            has_supported = true;
            if self.add(file_name_of(&entry.name), entry.data) {
                added += 1;
            }
        }
        if !has_supported {
            return Err(ImportError::NoSupportedFiles);
        }
        Ok(added)
    }

    /// Routes one selected file: archives are unpacked, disk images added,
    /// anything else ignored.
    pub fn import_file(&mut self, name: &str, bytes: Vec<u8>) -> Result<ImportOutcome, ImportError> {
        if is_archive(name) {
            return self.import_archive(&bytes).map(ImportOutcome::Added);
        }
        if !is_supported(name) {
            return Ok(ImportOutcome::Ignored);
        }
        if self.add(name, bytes) {
            Ok(ImportOutcome::Added(1))
        } else {
            Ok(ImportOutcome::Full)
        }
    }

    pub fn move_up(&mut self, index: usize) {
        if index == 0 || index >= self.items.len() {
            return;
        }
        self.items.swap(index - 1, index);
    }

    pub fn remove(&mut self, index: usize) -> Option<DiskImage> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    pub fn rename(&mut self, index: usize, new_name: &str) {
        let name = sanitize_name(new_name.trim());
        if name.is_empty() {
            return;
        }
        let optimized = self.optimized;
        let Some(item) = self.items.get_mut(index) else {
            return;
        };
        // Outside optimized mode a rename is the name undo must come back to.
        if !optimized {
            item.original_name = name.clone();
        }
        item.name = name;
    }

    pub fn optimize_names(&mut self) {
        self.optimized = true;
        for (idx, item) in self.items.iter_mut().enumerate() {
            let prefix = format!("{:02}_", idx + 1);
            let base = base_of(&item.original_name);
            let suffix = &item.original_name[base.len()..];
            let max_base = NAME_BUDGET.saturating_sub(prefix.chars().count()).max(1);
            item.name = format!("{prefix}{}{suffix}", truncate_chars(base, max_base));
        }
    }

    pub fn undo_optimize_names(&mut self) {
        self.optimized = false;
        for item in &mut self.items {
            item.name.clone_from(&item.original_name);
        }
    }

    pub fn toggle_optimize(&mut self) {
        if self.optimized {
            self.undo_optimize_names();
        } else {
            self.optimize_names();
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.optimized = false;
    }

    /// Stored ZIP of the queue in its current order and names; `None` when empty.
    pub fn export_archive(&self) -> Result<Option<Vec<u8>>, ZipError> {
        if self.items.is_empty() {
            return Ok(None);
        }
        build_archive(
            self.items
                .iter()
                .map(|item| (item.name.as_str(), item.data.as_slice())),
        )
        .map(Some)
    }

    pub fn items(&self) -> &[DiskImage] {
        &self.items
    }

    pub fn names(&self) -> Vec<String> {
        self.items.iter().map(|item| item.name.clone()).collect()
    }

    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= MAX_ITEMS
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
