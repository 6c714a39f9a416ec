//! Core runtime configuration.
//!
//! This module defines configuration that should be resolved once at process startup and then
//! passed into core services. Request handling never reads process-wide environment variables;
//! the binaries read them once and build a [`BridgeConfig`].

use crate::constants::{
    DEFAULT_LANGUAGE, DEFAULT_MAPPING_DIR, DEFAULT_REST_ADDR, DEFAULT_TEMPLATE_DIR,
    DEFAULT_TERRITORY,
};
use crate::error::{BridgeError, BridgeResult};
use std::path::{Path, PathBuf};

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    mapping_dir: PathBuf,
    template_dir: PathBuf,
    default_language: String,
    default_territory: String,
    rest_addr: String,
}

impl BridgeConfig {
    /// Create a new `BridgeConfig`.
    ///
    /// Both directories must exist; language and territory must not be blank.
    pub fn new(
        mapping_dir: PathBuf,
        template_dir: PathBuf,
        default_language: String,
        default_territory: String,
        rest_addr: String,
    ) -> BridgeResult<Self> {
        if !mapping_dir.is_dir() {
            return Err(BridgeError::InvalidInput(format!(
                "mapping directory {} does not exist",
                mapping_dir.display()
            )));
        }
        if !template_dir.is_dir() {
            return Err(BridgeError::InvalidInput(format!(
                "template directory {} does not exist",
                template_dir.display()
            )));
        }
        let default_language = default_language.trim().to_owned();
        if default_language.is_empty() {
            return Err(BridgeError::InvalidInput("default_language cannot be empty".into()));
        }
        let default_territory = default_territory.trim().to_owned();
        if default_territory.is_empty() {
            return Err(BridgeError::InvalidInput("default_territory cannot be empty".into()));
        }
        let rest_addr = match rest_addr.trim() {
            "" => DEFAULT_REST_ADDR.to_owned(),
            addr => addr.to_owned(),
        };

        Ok(Self {
            mapping_dir,
            template_dir,
            default_language,
            default_territory,
            rest_addr,
        })
    }

    /// Configuration with default language, territory and address.
    pub fn with_defaults(mapping_dir: PathBuf, template_dir: PathBuf) -> BridgeResult<Self> {
        Self::new(
            mapping_dir,
            template_dir,
            DEFAULT_LANGUAGE.to_owned(),
            DEFAULT_TERRITORY.to_owned(),
            DEFAULT_REST_ADDR.to_owned(),
        )
    }

    pub fn mapping_dir(&self) -> &Path {
        &self.mapping_dir
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    pub fn default_territory(&self) -> &str {
        &self.default_territory
    }

    pub fn rest_addr(&self) -> &str {
        &self.rest_addr
    }
}

/// Resolve the mapping directory without reading environment variables.
///
/// If `override_dir` is provided, it must be a directory. Otherwise this searches for
/// `mappings/` relative to the current working directory and then walks up from
/// `CARGO_MANIFEST_DIR`.
pub fn resolve_mapping_dir(override_dir: Option<PathBuf>) -> BridgeResult<PathBuf> {
    resolve_dir(override_dir, DEFAULT_MAPPING_DIR, "BRIDGE_MAPPING_DIR")
}

/// Resolve the web template directory, searching for `templates/` the same way
/// [`resolve_mapping_dir`] searches for `mappings/`.
pub fn resolve_template_dir(override_dir: Option<PathBuf>) -> BridgeResult<PathBuf> {
    resolve_dir(override_dir, DEFAULT_TEMPLATE_DIR, "BRIDGE_TEMPLATE_DIR")
}

fn resolve_dir(
    override_dir: Option<PathBuf>,
    default_name: &str,
    variable: &str,
) -> BridgeResult<PathBuf> {
    if let Some(dir) = override_dir {
        if dir.is_dir() {
            return Ok(dir);
        }
        return Err(BridgeError::InvalidInput(format!(
            "{variable} override {} is not a directory",
            dir.display()
        )));
    }

    let cwd_relative = PathBuf::from(default_name);
    if cwd_relative.is_dir() {
        return Ok(cwd_relative);
    }

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    for ancestor in manifest_dir.ancestors() {
        let candidate = ancestor.join(default_name);
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }

    Err(BridgeError::InvalidInput(format!("could not locate {default_name}/ directory")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_language_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = BridgeConfig::new(
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            "  ".into(),
            "DE".into(),
            String::new(),
        )
        .expect_err("blank language");
        assert!(err.to_string().contains("default_language"));
    }

    #[test]
    fn missing_directories_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        assert!(BridgeConfig::with_defaults(missing.clone(), dir.path().to_path_buf()).is_err());
        assert!(BridgeConfig::with_defaults(dir.path().to_path_buf(), missing).is_err());
    }

    #[test]
    fn defaults_fill_blank_address() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = BridgeConfig::new(
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            "de".into(),
            "AT".into(),
            " ".into(),
        )
        .expect("config");
        assert_eq!(config.rest_addr(), DEFAULT_REST_ADDR);
        assert_eq!(config.default_language(), "de");
        assert_eq!(config.default_territory(), "AT");
    }

    #[test]
    fn override_must_be_a_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("file.yml");
        std::fs::write(&file, "x").expect("write");
        assert!(resolve_mapping_dir(Some(file)).is_err());
        assert_eq!(
            resolve_template_dir(Some(dir.path().to_path_buf())).expect("dir"),
            dir.path().to_path_buf()
        );
    }
}
