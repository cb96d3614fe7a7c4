use crate::{error::QuireError, paths::LogicalPath};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{read_to_string, write},
    path::{Path, PathBuf},
};

/// Per-language toolchain settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    /// Source file extensions (without the dot) belonging to this language.
    pub extensions: Vec<String>,
    /// Line comment prefix used for the source-map preamble.
    pub comment_prefix: String,
    /// Extension given to generated compiland artifacts.
    pub artifact_extension: String,
    pub compiler_options: Vec<String>,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        LanguageConfig {
            extensions: Vec::new(),
            comment_prefix: "//".to_string(),
            artifact_extension: "gen".to_string(),
            compiler_options: Vec::new(),
        }
    }
}

/// External compiler invocation used by [`crate::build::toolchain::ProcessToolchain`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Logical root of the application. Includes may not escape it.
    pub app_root: LogicalPath,
    /// Physical directory receiving compiland artifacts.
    pub output_dir: PathBuf,
    /// When false every unit is compiled alone.
    pub batch: bool,
    pub max_batch_retries: usize,
    pub num_recompiles_before_restart: usize,
    pub debug: bool,
    pub suppress_debug_notice: bool,
    pub default_language: String,
    /// File name of the application entry unit, located at `app_root`.
    pub application_entry: String,
    /// Prefix for generated artifact names.
    pub artifact_prefix: String,
    /// External modules referenced by every compile.
    pub references: Vec<String>,
    /// Markup file extension -> unit kind name (`page`, `control`, `master`, `handler`).
    pub unit_extensions: BTreeMap<String, String>,
    pub languages: BTreeMap<String, LanguageConfig>,
    pub toolchain: ToolchainConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        let mut languages = BTreeMap::new();
        languages.insert(
            "csharp".to_string(),
            LanguageConfig {
                extensions: vec!["cs".to_string()],
                artifact_extension: "cs".to_string(),
                ..Default::default()
            },
        );
        languages.insert(
            "vb".to_string(),
            LanguageConfig {
                extensions: vec!["vb".to_string()],
                comment_prefix: "'".to_string(),
                artifact_extension: "vb".to_string(),
                ..Default::default()
            },
        );
        let unit_extensions = [
            ("page", "page"),
            ("ctl", "control"),
            ("master", "master"),
            ("handler", "handler"),
        ]
        .into_iter()
        .map(|(ext, kind)| (ext.to_string(), kind.to_string()))
        .collect();
        BuildConfig {
            app_root: LogicalPath::root(),
            output_dir: std::env::temp_dir().join("quire"),
            batch: true,
            max_batch_retries: 3,
            num_recompiles_before_restart: 15,
            debug: false,
            suppress_debug_notice: false,
            default_language: "csharp".to_string(),
            languages,
            unit_extensions,
            application_entry: "global.app".to_string(),
            artifact_prefix: "quire".to_string(),
            references: Vec::new(),
            toolchain: ToolchainConfig::default(),
        }
    }
}

impl BuildConfig {
    pub fn from_toml_str(content: &str) -> Result<BuildConfig, QuireError> {
        let config: BuildConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QuireError> {
        if self.max_batch_retries == 0 {
            return Err(QuireError::Custom(
                "max_batch_retries must be at least 1".to_string(),
            ));
        }
        if self.application_entry.contains('/') {
            return Err(QuireError::Custom(format!(
                "application_entry '{}' must be a bare file name",
                self.application_entry
            )));
        }
        if !self.languages.contains_key(&self.default_language) {
            return Err(QuireError::Custom(format!(
                "default_language '{}' has no [languages] entry",
                self.default_language
            )));
        }
        Ok(())
    }

    /// Logical path of the application entry unit.
    pub fn application_entry_path(&self) -> LogicalPath {
        self.app_root.join(&self.application_entry)
    }

    /// Language owning a raw source file extension.
    pub fn language_for_extension(&self, extension: &str) -> Option<&str> {
        self.languages
            .iter()
            .find(|(_, lang)| {
                lang.extensions
                    .iter()
                    .any(|e| e.eq_ignore_ascii_case(extension))
            })
            .map(|(name, _)| name.as_str())
    }

    /// Resolve a language name as written in a directive (`C#`, `cs`, `csharp`, ...).
    pub fn canonical_language(&self, name: &str) -> Option<String> {
        if let Some((key, _)) = self
            .languages
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            return Some(key.clone());
        }
        if name.eq_ignore_ascii_case("c#") {
            return self.canonical_language("csharp");
        }
        self.language_for_extension(name).map(str::to_string)
    }

    pub fn language(&self, name: &str) -> Option<&LanguageConfig> {
        self.languages.get(name)
    }
}

pub trait ConfigProvider: Send + Sync {
    fn get_config(&self) -> Result<BuildConfig, QuireError>;
    fn set_config(&self, config: &BuildConfig) -> Result<(), QuireError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn get_config(&self) -> Result<BuildConfig, QuireError> {
        tracing::debug!("Attempting to read build config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(BuildConfig::default());
        }
        let content = read_to_string(&self.path)?;
        BuildConfig::from_toml_str(&content)
    }

    fn set_config(&self, config: &BuildConfig) -> Result<(), QuireError> {
        tracing::debug!("Attempting to write build config to: {:?}", &self.path);
        config.validate()?;
        let toml_string = toml::to_string(config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}

/// Config held in memory, for hosts that assemble configuration themselves.
#[derive(Debug, Default)]
pub struct StaticConfigProvider(RwLock<BuildConfig>);

impl StaticConfigProvider {
    pub fn new(config: BuildConfig) -> Self {
        StaticConfigProvider(RwLock::new(config))
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn get_config(&self) -> Result<BuildConfig, QuireError> {
        Ok(self.0.read().clone())
    }

    fn set_config(&self, config: &BuildConfig) -> Result<(), QuireError> {
        config.validate()?;
        *self.0.write() = config.clone();
        Ok(())
    }
}

pub fn get_content<P: AsRef<Path>>(path: P) -> Result<String, QuireError> {
    tracing::debug!("Reading {:?}", path.as_ref());
    Ok(read_to_string(path)?)
}
