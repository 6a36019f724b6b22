//! Platform naming restrictions
//!
//! A record coming from the remote side may carry a name the local
//! filesystem cannot represent. Such records are kept in the store with
//! their incompatibilities and are not materialized locally.

use std::path::Path;

use tandem_core::domain::{ChangeRecord, DocType, Incompatibility, IncompatibilityKind, Platform};

/// Naming limits of one platform
#[derive(Debug, Clone, Copy)]
pub struct PathRestrictions {
    pub platform: Platform,
    pub path_max: usize,
    pub name_max: usize,
    /// Folders have a shorter limit on Windows so an 8.3 file fits inside
    pub dir_name_max: usize,
    pub reserved_chars: &'static [char],
    pub forbidden_last_chars: &'static [char],
    pub reserved_names: &'static [&'static str],
}

const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

impl PathRestrictions {
    pub const fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Windows => Self {
                platform,
                path_max: 259,
                name_max: 255,
                dir_name_max: 243,
                reserved_chars: &['<', '>', ':', '"', '/', '\\', '|', '?', '*'],
                forbidden_last_chars: &['.', ' '],
                reserved_names: WINDOWS_RESERVED_NAMES,
            },
            Platform::MacOs => Self {
                platform,
                path_max: 1023,
                name_max: 255,
                dir_name_max: 255,
                reserved_chars: &['/', ':'],
                forbidden_last_chars: &[],
                reserved_names: &[],
            },
            Platform::Linux => Self {
                platform,
                path_max: 4095,
                name_max: 255,
                dir_name_max: 255,
                reserved_chars: &['/'],
                forbidden_last_chars: &[],
                reserved_names: &[],
            },
        }
    }

    /// Length of `s` in the unit the platform limits are expressed in
    fn measure(&self, s: &str) -> usize {
        match self.platform {
            Platform::Windows => s.encode_utf16().count(),
            Platform::Linux | Platform::MacOs => s.len(),
        }
    }

    /// Issues with a single path component
    pub fn name_issues(&self, name: &str, doc_type: DocType) -> Vec<(IncompatibilityKind, Option<String>)> {
        let mut issues = Vec::new();

        let reserved: String = name
            .chars()
            .filter(|c| self.reserved_chars.contains(c))
            .collect();
        if !reserved.is_empty() {
            issues.push((IncompatibilityKind::ReservedChars, Some(reserved)));
        }

        if let Some(last) = name.chars().last() {
            if self.forbidden_last_chars.contains(&last) {
                issues.push((IncompatibilityKind::ForbiddenLastChar, Some(last.to_string())));
            }
        }

        let stem = name.split('.').next().unwrap_or(name).to_uppercase();
        if self.reserved_names.contains(&stem.as_str()) {
            issues.push((IncompatibilityKind::ReservedName, None));
        }

        let len = self.measure(name);
        match doc_type {
            DocType::Folder if len > self.dir_name_max => {
                issues.push((
                    IncompatibilityKind::DirNameMaxBytes,
                    Some(self.dir_name_max.to_string()),
                ));
            }
            DocType::File if len > self.name_max => {
                issues.push((
                    IncompatibilityKind::NameMaxBytes,
                    Some(self.name_max.to_string()),
                ));
            }
            _ => {}
        }

        issues
    }
}

/// Every naming rule of `platform` broken by `record` or one of its ancestors
///
/// The whole path is measured once joined to `sync_root`.
pub fn detect_incompatibilities(
    record: &ChangeRecord,
    sync_root: &Path,
    platform: Platform,
) -> Vec<Incompatibility> {
    let restrictions = PathRestrictions::for_platform(platform);
    let mut found = Vec::new();

    let mut push = |kind, name: &str, path: &str, doc_type, detail| {
        found.push(Incompatibility {
            kind,
            name: name.to_string(),
            path: path.to_string(),
            doc_type,
            platform,
            detail,
        });
    };

    let full = sync_root.join(record.path.as_str());
    let full = full.to_string_lossy();
    if restrictions.measure(&full) > restrictions.path_max {
        push(
            IncompatibilityKind::PathMaxBytes,
            record.path.as_str(),
            record.path.as_str(),
            record.doc_type,
            Some(restrictions.path_max.to_string()),
        );
    }

    for ancestor in record.path.ancestors() {
        for (kind, detail) in restrictions.name_issues(ancestor.file_name(), DocType::Folder) {
            push(kind, ancestor.file_name(), ancestor.as_str(), DocType::Folder, detail);
        }
    }
    for (kind, detail) in restrictions.name_issues(record.path.file_name(), record.doc_type) {
        push(
            kind,
            record.path.file_name(),
            record.path.as_str(),
            record.doc_type,
            detail,
        );
    }

    found
}
