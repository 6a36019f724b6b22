//! Gitignore-style rules for local changes
//!
//! Rules are glob patterns evaluated in order; a later negated rule (`!`)
//! can re-include a path excluded by an earlier one.
//!
//! - A pattern without `/` matches the file name at any depth
//! - A leading `/` anchors the pattern to the sync root
//! - A trailing `/` restricts the pattern to folders
//! - A path is ignored when it or one of its ancestors matches
//! - `{a,b}` alternatives expand into one rule each

use glob::{MatchOptions, Pattern};
use tracing::{debug, warn};

use tandem_core::config::IgnoreConfig;
use tandem_core::domain::{DocPath, DocType, Platform};
use tandem_core::ports::IIgnoreMatcher;

/// Temporary, hidden and OS bookkeeping files never worth syncing
pub const DEFAULT_RULES: &[&str] = &[
    ".*",
    ".dropbox",
    ".dropbox.attr",
    ".dropbox.cache",
    "*.tmp",
    "*.bak",
    "*~",
    "[#]*[#]",
    ".~lock.*#",
    ".fuse_hidden*",
    ".Trash-*",
    "~$*.doc*",
    "~$*.xls*",
    "~$*.ppt*",
    ".DS_Store",
    ".DocumentRevisions-V100",
    ".fseventsd",
    ".Spotlight-V100",
    ".TemporaryItems",
    ".Trashes",
    ".VolumeIcon.icns",
    "Icon\r",
    "*.sw[px]",
    "Thumbs.db",
    "ehthumbs.db",
];

#[derive(Debug)]
struct Rule {
    pattern: Pattern,
    /// Matches the file name alone, at any depth
    basename: bool,
    folder_only: bool,
    negate: bool,
}

impl Rule {
    fn parse(line: &str) -> Option<Result<Self, glob::PatternError>> {
        let line = line.trim_end_matches([' ', '\t']);
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (negate, line) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let anchored = line.starts_with('/');
        let line = line.strip_prefix('/').unwrap_or(line);
        let (folder_only, line) = match line.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let line = line.strip_prefix('\\').unwrap_or(line);
        let basename = !anchored && !line.contains('/') && !line.contains("**");

        Some(Pattern::new(line).map(|pattern| Self {
            pattern,
            basename,
            folder_only,
            negate,
        }))
    }

    fn matches(&self, path: &DocPath, is_folder: bool, options: MatchOptions) -> bool {
        if is_folder || !self.folder_only {
            if self.basename && self.pattern.matches_with(path.file_name(), options) {
                return true;
            }
            if self.pattern.matches_with(path.as_str(), options) {
                return true;
            }
        }
        match path.parent() {
            Some(parent) => self.matches(&parent, true, options),
            None => false,
        }
    }
}

/// Expands the first `{a,b}` group of `line`, recursively
///
/// `glob` has no brace syntax, so `*.{jpg,png}` becomes two rules.
fn expand_braces(line: &str) -> Vec<String> {
    let group = line
        .find('{')
        .and_then(|open| line[open..].find('}').map(|len| (open, open + len)));
    let Some((open, close)) = group else {
        return vec![line.to_string()];
    };

    let (head, tail) = (&line[..open], &line[close + 1..]);
    line[open + 1..close]
        .split(',')
        .flat_map(|alt| expand_braces(&format!("{head}{alt}{tail}")))
        .collect()
}

/// Ignore matcher built from glob rules
#[derive(Debug)]
pub struct GlobIgnore {
    rules: Vec<Rule>,
    options: MatchOptions,
}

impl GlobIgnore {
    /// Compiles `lines`, skipping invalid patterns with a warning
    pub fn new<'a>(lines: impl IntoIterator<Item = &'a str>, platform: Platform) -> Self {
        let rules: Vec<Rule> = lines
            .into_iter()
            .flat_map(expand_braces)
            .filter_map(|line| Rule::parse(&line))
            .filter_map(|rule| match rule {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!(error = %e, "Skipping invalid ignore pattern");
                    None
                }
            })
            .collect();

        let options = MatchOptions {
            case_sensitive: platform == Platform::Linux,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        debug!(rules_count = rules.len(), %platform, "Ignore rules compiled");
        Self { rules, options }
    }

    /// Rules from the configuration, after the default rules when enabled
    ///
    /// The trash folder at the sync root is always ignored.
    pub fn from_config(config: &IgnoreConfig, trash_dir: &str, platform: Platform) -> Self {
        let trash_rule = format!("/{}/", trash_dir);
        let defaults: &[&str] = if config.use_default_rules {
            DEFAULT_RULES
        } else {
            &[]
        };

        let lines = defaults
            .iter()
            .copied()
            .chain(std::iter::once(trash_rule.as_str()))
            .chain(config.patterns.iter().map(String::as_str));
        Self::new(lines, platform)
    }

    pub fn rules_count(&self) -> usize {
        self.rules.len()
    }
}

impl IIgnoreMatcher for GlobIgnore {
    fn should_ignore(&self, path: &DocPath, doc_type: DocType) -> bool {
        let is_folder = doc_type == DocType::Folder;
        let mut ignored = false;
        for rule in &self.rules {
            if rule.negate {
                if ignored && rule.matches(path, is_folder, self.options) {
                    ignored = false;
                }
            } else if !ignored && rule.matches(path, is_folder, self.options) {
                ignored = true;
            }
        }
        ignored
    }
}
