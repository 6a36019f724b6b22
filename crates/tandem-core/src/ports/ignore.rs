//! Ignore matcher port
//!
//! Ignore rules are a local-only user preference: they are consulted for
//! changes reported by the local watcher and never for remote ones.

use crate::domain::{DocPath, DocType};

pub trait IIgnoreMatcher: Send + Sync {
    /// Whether a document at `path` must stay out of synchronization
    fn should_ignore(&self, path: &DocPath, doc_type: DocType) -> bool;
}

/// Matcher that ignores nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIgnore;

impl IIgnoreMatcher for NoIgnore {
    fn should_ignore(&self, _path: &DocPath, _doc_type: DocType) -> bool {
        false
    }
}
