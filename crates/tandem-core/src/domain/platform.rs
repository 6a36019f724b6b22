//! Local filesystem naming rules
//!
//! The platform decides how two different literal paths can designate the
//! same file: case-insensitive volumes on Windows, and case-insensitive plus
//! Unicode-normalizing volumes on macOS.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use super::errors::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    #[serde(rename = "macos")]
    MacOs,
    Windows,
}

impl Platform {
    /// The platform this binary was compiled for
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    /// Fold a normalized path into the identity used as store key
    #[must_use]
    pub fn fold_identity(self, path: &str) -> String {
        match self {
            Platform::Linux => path.to_string(),
            Platform::MacOs => path.nfd().collect::<String>().to_uppercase(),
            Platform::Windows => path.to_uppercase(),
        }
    }

    /// Whether the filesystem keeps an executable bit
    #[must_use]
    pub const fn supports_executable_bit(self) -> bool {
        !matches!(self, Platform::Windows)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::Windows => "windows",
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(Platform::Linux),
            "macos" | "darwin" => Ok(Platform::MacOs),
            "windows" | "win32" => Ok(Platform::Windows),
            other => Err(DomainError::InvalidPlatform(other.to_string())),
        }
    }
}
