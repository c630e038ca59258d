//! Purpose: Configuration surface for a page-backed buffer.
//! Exports: `BufferConfig`, `default_cache_dir`.
//! Role: Shared by the library entry points and the CLI flags.
//! Invariants: Default cache directory is `$TMPDIR/filebuffer`.
//! Invariants: `page_size` counts the whole page file, header included.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{self, DEFAULT_PAGE_SIZE};

pub fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("filebuffer")
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    pub cache_dir: PathBuf,
    pub page_size: usize,
}

impl BufferConfig {
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn from_json_str(input: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(input).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid buffer config")
                .with_source(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("cache directory is empty"));
        }
        format::validate_page_size(self.page_size)
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self::new(default_cache_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferConfig, default_cache_dir};
    use crate::core::error::ErrorKind;
    use crate::core::format::DEFAULT_PAGE_SIZE;
    use std::path::PathBuf;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = BufferConfig::from_json_str(r#"{"page_size": 4096}"#).expect("config");
        assert_eq!(config.cache_dir, default_cache_dir());
        assert_eq!(config.page_size, 4096);

        let config = BufferConfig::from_json_str(r#"{"cache_dir": "/var/cache/fb"}"#).expect("config");
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/fb"));
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn bad_config_is_usage_error() {
        for input in [
            r#"{"page_size": 8}"#,
            r#"{"cache_dir": ""}"#,
            r#"{"page_bytes": 4096}"#,
            "not json",
        ] {
            let err = BufferConfig::from_json_str(input).expect_err(input);
            assert_eq!(err.kind(), ErrorKind::Usage, "{input}");
        }
    }
}
