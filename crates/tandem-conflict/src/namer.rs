//! Conflict copy naming
//!
//! Generates names for conflict copies, following the pattern:
//! `<base>-conflict-<YYYY-MM-DDTHH_MM_SS.mmmZ><ext>`
//!
//! Colons of the ISO-8601 date are replaced with underscores so the name is
//! valid on every platform. Renaming a conflict copy again replaces its
//! suffix instead of stacking a second one.

use chrono::{DateTime, Utc};
use tandem_core::domain::DocPath;

use crate::error::ConflictError;

const CONFLICT_MARKER: &str = "-conflict-";

/// Generates conflict copy paths
#[derive(Debug, Clone, Copy)]
pub struct ConflictNamer {
    max_base_chars: usize,
}

impl ConflictNamer {
    pub fn new(max_base_chars: usize) -> Self {
        Self { max_base_chars }
    }

    /// Conflict copy path for `path`, dated now
    pub fn conflict_path(&self, path: &DocPath) -> Result<DocPath, ConflictError> {
        self.conflict_path_at(path, Utc::now())
    }

    /// Conflict copy path for `path`, dated `now`
    ///
    /// Given "docs/report.txt", produces something like:
    /// "docs/report-conflict-2026-02-07T10_31_02.123Z.txt"
    pub fn conflict_path_at(
        &self,
        path: &DocPath,
        now: DateTime<Utc>,
    ) -> Result<DocPath, ConflictError> {
        let ext = path.extension().unwrap_or("");
        let name = path.file_name();
        let mut base = &name[..name.len() - ext.len()];

        if let Some(idx) = find_conflict_suffix(base) {
            base = &base[..idx];
        }

        let truncated: String = base.chars().take(self.max_base_chars).collect();
        let date = now.format("%Y-%m-%dT%H_%M_%S%.3fZ");
        let new_name = format!("{truncated}{CONFLICT_MARKER}{date}{ext}");

        Ok(path.with_file_name(&new_name)?)
    }
}

impl Default for ConflictNamer {
    fn default() -> Self {
        Self::new(180)
    }
}

/// Whether `name` carries a conflict suffix
pub fn is_conflict_name(name: &str) -> bool {
    find_conflict_suffix(name).is_some()
}

/// Byte offset of the first `-conflict-<date>` suffix in `name`
fn find_conflict_suffix(name: &str) -> Option<usize> {
    name.match_indices(CONFLICT_MARKER)
        .map(|(idx, _)| idx)
        .find(|&idx| is_conflict_date(&name[idx + CONFLICT_MARKER.len()..]))
}

/// Matches `\d{4}(-\d{2}){2}T(\d{2}_?){3}.\d{3}Z` at the start of `s`
fn is_conflict_date(s: &str) -> bool {
    let b = s.as_bytes();
    let mut i = 0;

    let digits = |i: &mut usize, n: usize| -> bool {
        for _ in 0..n {
            match b.get(*i) {
                Some(c) if c.is_ascii_digit() => *i += 1,
                _ => return false,
            }
        }
        true
    };
    let literal = |i: &mut usize, c: u8| -> bool {
        if b.get(*i) == Some(&c) {
            *i += 1;
            true
        } else {
            false
        }
    };

    if !digits(&mut i, 4) {
        return false;
    }
    for _ in 0..2 {
        if !(literal(&mut i, b'-') && digits(&mut i, 2)) {
            return false;
        }
    }
    if !literal(&mut i, b'T') {
        return false;
    }
    for _ in 0..3 {
        if !digits(&mut i, 2) {
            return false;
        }
        literal(&mut i, b'_');
    }
    // Any single separator before the milliseconds
    if b.get(i).is_none() {
        return false;
    }
    i += 1;
    digits(&mut i, 3) && literal(&mut i, b'Z')
}
