//! Configuration loading, candidate filtering and rule compilation.
//!
//! Configuration is read from a TOML file and compiled into [`Settings`], the
//! immutable value the organizer consumes. Candidates can be excluded by exact
//! name, extension, glob or regex; `include` globs win over every exclusion.
//!
//! # Configuration File Format
//!
//! ```toml
//! root_path = "~/Downloads"
//! archive_by_date = true
//! recursive = false
//! history_file = ".organize_history.jsonl"
//! leave_unclassified = false
//! unclassified_bucket = "其他"
//!
//! [watch]
//! quiet_period_ms = 2000
//! recheck_interval_ms = 500
//!
//! [[categories]]
//! name = "Documents"
//! extensions = ["pdf", "docx"]
//!
//! [[categories.subcategories]]
//! name = "Invoices"
//! keywords = ["invoice", "receipt"]
//!
//! [filters]
//! enable_hidden_files = false
//!
//! [filters.exclude]
//! filenames = [".DS_Store", "Thumbs.db"]
//! patterns = ["*.tmp", "node_modules/**"]
//! extensions = ["bak", "tmp"]
//! regex = []
//!
//! [filters.include]
//! patterns = []
//! ```
//!
//! Every key is optional. When `[[categories]]` is present it replaces the
//! built-in category table entirely.

use crate::classifier::ClassifyOptions;
use crate::rules::{CategoryRule, RuleError, RuleSet};
use crate::watch::DebounceConfig;
use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name of the per-directory configuration file.
pub const LOCAL_CONFIG_NAME: &str = ".dltidy.toml";

/// Default history journal name, relative to the organize root.
pub const DEFAULT_HISTORY_FILE: &str = ".organize_history.jsonl";

/// Default bucket for files whose extension matches no category.
pub const DEFAULT_UNCLASSIFIED_BUCKET: &str = "其他";

/// Errors that can occur during configuration loading and compilation.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("Configuration file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),
    /// Invalid TOML syntax or structure.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    /// Invalid glob pattern provided.
    #[error("Invalid glob pattern '{0}': expected *.ext or dir/**")]
    InvalidGlobPattern(String),
    /// Invalid regex pattern provided with the actual error reason.
    #[error("Invalid regex pattern '{pattern}': {reason}")]
    InvalidRegexPattern {
        /// The regex pattern that failed to compile.
        pattern: String,
        /// The reason why the pattern is invalid.
        reason: String,
    },
    /// IO error while reading configuration.
    #[error("IO error reading configuration: {0}")]
    IoError(String),
    /// The category/keyword table is malformed.
    #[error("Invalid rule table: {0}")]
    Rules(#[from] RuleError),
    /// A scalar setting is out of range.
    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },
    /// No root was configured and no Downloads directory could be located.
    #[error("No root_path configured and no Downloads directory could be found")]
    NoRootPath,
}

/// Watch-mode timing settings as written in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    /// Quiet interval with no notifications before a size check runs.
    pub quiet_period_ms: u64,
    /// Gap between the two size checks that confirm a file is stable.
    pub recheck_interval_ms: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            quiet_period_ms: 2000,
            recheck_interval_ms: 500,
        }
    }
}

/// Raw, uncompiled configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory to organize. Defaults to the user's Downloads folder.
    pub root_path: Option<PathBuf>,
    /// Add a `YYYY-MM` level under each (sub)category.
    pub archive_by_date: bool,
    /// Descend into subdirectories when scanning and watching.
    pub recursive: bool,
    /// History journal location; relative paths resolve against the root.
    pub history_file: PathBuf,
    /// Leave files with unknown extensions in place instead of bucketing them.
    pub leave_unclassified: bool,
    /// Bucket directory for files with unknown extensions.
    pub unclassified_bucket: String,
    /// Watch-mode timing.
    pub watch: WatchSettings,
    /// Custom category table; `None` uses the built-in one.
    pub categories: Option<Vec<CategoryRule>>,
    /// Candidate filtering rules.
    pub filters: FilterRules,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_path: None,
            archive_by_date: true,
            recursive: false,
            history_file: PathBuf::from(DEFAULT_HISTORY_FILE),
            leave_unclassified: false,
            unclassified_bucket: DEFAULT_UNCLASSIFIED_BUCKET.to_string(),
            watch: WatchSettings::default(),
            categories: None,
            filters: FilterRules::default(),
        }
    }
}

/// Root-level filter rules configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    /// Whether to include hidden files (starting with "."). Defaults to false.
    pub enable_hidden_files: bool,

    /// Rules for excluding files.
    pub exclude: ExcludeRules,

    /// Rules for including files (whitelist, overrides exclude rules).
    pub include: IncludeRules,
}

/// Rules for excluding files from organization.
///
/// Missing keys fall back to the defaults below, which skip desktop metadata
/// files and the partial files browsers leave behind while downloading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExcludeRules {
    /// Exact filenames to exclude (e.g., ".DS_Store", "Thumbs.db").
    pub filenames: Vec<String>,

    /// Glob patterns to exclude (e.g., "*.tmp", "node_modules/**").
    pub patterns: Vec<String>,

    /// File extensions to exclude (e.g., "bak", "tmp", "log").
    pub extensions: Vec<String>,

    /// Regex patterns to exclude, matched against the file name.
    pub regex: Vec<String>,
}

impl Default for ExcludeRules {
    fn default() -> Self {
        Self {
            filenames: [".DS_Store", ".localized", "Thumbs.db", "desktop.ini"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            patterns: Vec::new(),
            extensions: Vec::new(),
            regex: vec![r"(?i)\.(crdownload|part|download|uploading|tmp)(\.|$)".to_string()],
        }
    }
}

/// Rules for including files, overriding exclude rules (whitelist).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IncludeRules {
    /// Glob patterns that override exclude rules.
    pub patterns: Vec<String>,
}

/// What happens to files whose extension matches no category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnclassifiedPolicy {
    /// Leave the file where it is and report it.
    LeaveInPlace,
    /// Move the file into this top-level bucket.
    Bucket(String),
}

/// Compiled configuration consumed by the organizer.
#[derive(Debug)]
pub struct Settings {
    pub root: PathBuf,
    pub archive_by_date: bool,
    pub recursive: bool,
    pub history_path: PathBuf,
    pub unclassified: UnclassifiedPolicy,
    pub debounce: DebounceConfig,
    pub rules: RuleSet,
    pub filters: CompiledFilters,
}

impl Settings {
    /// Settings for `root` with every other value at its default.
    ///
    /// # Errors
    ///
    /// Only fails if the built-in defaults fail to compile.
    pub fn for_root(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Config {
            root_path: Some(root.into()),
            ..Config::default()
        }
        .compile()
    }

    /// Classification options derived from these settings.
    pub fn classify_options(&self) -> ClassifyOptions {
        ClassifyOptions {
            archive_by_date: self.archive_by_date,
        }
    }
}

impl Config {
    /// Load configuration from a file, with fallback to defaults.
    ///
    /// Attempts to load configuration in the following order:
    /// 1. If `config_path` is provided, load from that file
    /// 2. Look for `.dltidy.toml` in the current directory
    /// 3. Look for `<config dir>/dltidy/config.toml`
    /// 4. Fall back to default configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is explicitly provided but cannot be read,
    /// or if any discovered file fails to parse.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        let local_config = PathBuf::from(LOCAL_CONFIG_NAME);
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("dltidy").join("config.toml");
            if user_config.exists() {
                return Self::load_from_file(&user_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ConfigNotFound` if file does not exist.
    /// Returns `ConfigError::ConfigInvalid` if TOML parsing fails.
    /// Returns `ConfigError::IoError` if file cannot be read.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ConfigNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ConfigInvalid` if TOML parsing fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ConfigInvalid(e.to_string()))
    }

    /// Validate and compile into [`Settings`].
    ///
    /// # Errors
    ///
    /// Returns an error if the rule table, a pattern, or a scalar value is
    /// invalid. Nothing on disk is touched.
    pub fn compile(self) -> Result<Settings, ConfigError> {
        let root = match self.root_path {
            Some(path) => expand_home(&path),
            None => default_root().ok_or(ConfigError::NoRootPath)?,
        };

        let rules = match self.categories {
            Some(categories) => RuleSet::new(categories)?,
            None => RuleSet::default(),
        };

        let unclassified = if self.leave_unclassified {
            UnclassifiedPolicy::LeaveInPlace
        } else {
            let bucket = self.unclassified_bucket;
            if bucket.trim().is_empty()
                || bucket.contains('/')
                || bucket.contains('\\')
                || bucket == "."
                || bucket == ".."
            {
                return Err(ConfigError::InvalidValue {
                    key: "unclassified_bucket",
                    reason: format!("'{}' is not a single directory name", bucket),
                });
            }
            UnclassifiedPolicy::Bucket(bucket)
        };

        if self.history_file.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "history_file",
                reason: "must not be empty".to_string(),
            });
        }
        let history_path = if self.history_file.is_absolute() {
            self.history_file
        } else {
            root.join(self.history_file)
        };

        if self.watch.recheck_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "watch.recheck_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        let debounce = DebounceConfig {
            quiet_period: Duration::from_millis(self.watch.quiet_period_ms),
            recheck_interval: Duration::from_millis(self.watch.recheck_interval_ms),
        };

        Ok(Settings {
            root,
            archive_by_date: self.archive_by_date,
            recursive: self.recursive,
            history_path,
            unclassified,
            debounce,
            rules,
            filters: CompiledFilters::new(self.filters)?,
        })
    }
}

/// Default root: the platform Downloads directory, else `$HOME/Downloads`.
pub fn default_root() -> Option<PathBuf> {
    dirs::download_dir().or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}

/// Filter rules with every glob and regex parsed once up front.
#[derive(Debug)]
pub struct CompiledFilters {
    enable_hidden_files: bool,
    exclude_filenames: HashSet<String>,
    exclude_extensions: HashSet<String>,
    exclude_patterns: Vec<Pattern>,
    exclude_regexes: Vec<Regex>,
    include_patterns: Vec<Pattern>,
}

impl CompiledFilters {
    /// # Errors
    ///
    /// [`ConfigError::InvalidGlobPattern`] or [`ConfigError::InvalidRegexPattern`]
    /// for the first pattern that does not parse.
    pub fn new(rules: FilterRules) -> Result<Self, ConfigError> {
        let exclude_patterns = compile_globs(&rules.exclude.patterns)?;
        let include_patterns = compile_globs(&rules.include.patterns)?;

        let exclude_regexes = rules
            .exclude
            .regex
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| ConfigError::InvalidRegexPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            enable_hidden_files: rules.enable_hidden_files,
            exclude_filenames: rules.exclude.filenames.into_iter().collect(),
            exclude_extensions: rules
                .exclude
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            exclude_patterns,
            exclude_regexes,
            include_patterns,
        })
    }

    /// Check if a file should be considered for organization.
    ///
    /// `file_path` is expected relative to the organize root so glob patterns
    /// like `node_modules/**` behave the same wherever the root lives.
    ///
    /// An `include` match always wins. Otherwise the file is dropped if it is
    /// hidden (unless enabled), or matches an excluded name, extension, glob
    /// or regex.
    pub fn should_include(&self, file_path: &Path) -> bool {
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();

        if self.matches_include_patterns(file_path) {
            return true;
        }

        if !self.enable_hidden_files && file_name.starts_with('.') {
            return false;
        }

        if self.exclude_filenames.contains(file_name.as_ref()) {
            return false;
        }

        if let Some(ext) = file_path.extension() {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            if self.exclude_extensions.contains(&ext_lower) {
                return false;
            }
        }

        if self.matches_exclude_patterns(file_path) {
            return false;
        }

        if self.matches_exclude_regex(&file_name) {
            return false;
        }

        true
    }

    /// Whether hidden entries (names starting with '.') are considered at all.
    pub fn hidden_enabled(&self) -> bool {
        self.enable_hidden_files
    }

    fn matches_include_patterns(&self, file_path: &Path) -> bool {
        self.include_patterns
            .iter()
            .any(|pattern| pattern.matches_path(file_path))
    }

    fn matches_exclude_patterns(&self, file_path: &Path) -> bool {
        self.exclude_patterns
            .iter()
            .any(|pattern| pattern.matches_path(file_path))
    }

    fn matches_exclude_regex(&self, file_name: &str) -> bool {
        self.exclude_regexes
            .iter()
            .any(|regex| regex.is_match(file_name))
    }
}

impl Default for CompiledFilters {
    fn default() -> Self {
        Self {
            enable_hidden_files: false,
            exclude_filenames: HashSet::new(),
            exclude_extensions: HashSet::new(),
            exclude_patterns: Vec::new(),
            exclude_regexes: Vec::new(),
            include_patterns: Vec::new(),
        }
    }
}

fn compile_globs(patterns: &[String]) -> Result<Vec<Pattern>, ConfigError> {
    patterns
        .iter()
        .map(|pattern| {
            Pattern::new(pattern).map_err(|_| ConfigError::InvalidGlobPattern(pattern.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled(rules: FilterRules) -> CompiledFilters {
        CompiledFilters::new(rules).unwrap()
    }

    #[test]
    fn test_default_config_values() {
        let config = Config::default();
        assert!(config.archive_by_date);
        assert!(!config.recursive);
        assert!(!config.filters.enable_hidden_files);
        assert_eq!(config.unclassified_bucket, "其他");
    }

    #[test]
    fn test_default_filters_skip_partial_downloads() {
        let filters = compiled(FilterRules::default());

        assert!(!filters.should_include(Path::new("movie.mkv.crdownload")));
        assert!(!filters.should_include(Path::new("paper.pdf.part")));
        assert!(!filters.should_include(Path::new("setup.dmg.download")));
        assert!(!filters.should_include(Path::new("report.TMP")));
        assert!(!filters.should_include(Path::new("Thumbs.db")));
        assert!(!filters.should_include(Path::new(".DS_Store")));

        assert!(filters.should_include(Path::new("my.party.pdf")));
        assert!(filters.should_include(Path::new("archive.part1.rar")));
        assert!(filters.should_include(Path::new("report.partial.pdf")));
        assert!(filters.should_include(Path::new("layout.tmpl")));
        assert!(!filters.should_include(Path::new("video.part.1")));
        assert!(filters.should_include(Path::new("data.csv")));
    }

    #[test]
    fn test_hidden_file_included_when_enabled() {
        let filters = compiled(FilterRules {
            enable_hidden_files: true,
            exclude: ExcludeRules {
                filenames: Vec::new(),
                ..Default::default()
            },
            include: IncludeRules::default(),
        });

        assert!(filters.should_include(Path::new(".DS_Store")));
    }

    #[test]
    fn test_exclude_extensions() {
        let filters = compiled(FilterRules {
            enable_hidden_files: true,
            exclude: ExcludeRules {
                extensions: vec!["bak".to_string(), ".log".to_string()],
                ..Default::default()
            },
            include: IncludeRules::default(),
        });

        assert!(!filters.should_include(Path::new("file.bak")));
        assert!(!filters.should_include(Path::new("file.BAK")));
        assert!(!filters.should_include(Path::new("server.log")));
        assert!(filters.should_include(Path::new("file.txt")));
    }

    #[test]
    fn test_exclude_glob_patterns() {
        let filters = compiled(FilterRules {
            enable_hidden_files: true,
            exclude: ExcludeRules {
                patterns: vec!["*.cache".to_string(), "**/node_modules/**".to_string()],
                ..Default::default()
            },
            include: IncludeRules::default(),
        });

        assert!(!filters.should_include(Path::new("file.cache")));
        assert!(!filters.should_include(Path::new("node_modules/package.json")));
        assert!(!filters.should_include(Path::new("app/node_modules/pkg/index.js")));
        assert!(filters.should_include(Path::new("my_node_modules/pkg/index.js")));
        assert!(filters.should_include(Path::new("file.txt")));
    }

    #[test]
    fn test_include_overrides_exclude() {
        let filters = compiled(FilterRules {
            enable_hidden_files: false,
            exclude: ExcludeRules::default(),
            include: IncludeRules {
                patterns: vec![".important".to_string()],
            },
        });

        assert!(filters.should_include(Path::new(".important")));
        assert!(!filters.should_include(Path::new(".other")));
    }

    #[test]
    fn test_invalid_regex_returns_error() {
        let result = CompiledFilters::new(FilterRules {
            enable_hidden_files: true,
            exclude: ExcludeRules {
                regex: vec!["[invalid(".to_string()],
                ..Default::default()
            },
            include: IncludeRules::default(),
        });
        assert!(matches!(
            result,
            Err(ConfigError::InvalidRegexPattern { .. })
        ));
    }

    #[test]
    fn test_invalid_glob_pattern_returns_error() {
        let result = CompiledFilters::new(FilterRules {
            enable_hidden_files: true,
            exclude: ExcludeRules {
                patterns: vec!["[invalid".to_string()],
                ..Default::default()
            },
            include: IncludeRules::default(),
        });
        assert!(matches!(result, Err(ConfigError::InvalidGlobPattern(_))));
    }

    #[test]
    fn test_parse_full_toml() {
        let config = Config::from_toml(
            r#"
            root_path = "/srv/inbox"
            archive_by_date = false
            recursive = true
            history_file = "/var/lib/dltidy/history.jsonl"

            [watch]
            quiet_period_ms = 50

            [[categories]]
            name = "Docs"
            extensions = [".PDF", "txt"]

            [[categories.subcategories]]
            name = "Invoices"
            keywords = ["Invoice"]

            [filters.exclude]
            extensions = ["bak"]
            "#,
        )
        .unwrap();

        assert_eq!(config.watch.quiet_period_ms, 50);
        assert_eq!(config.watch.recheck_interval_ms, 500);
        // Unspecified exclude keys keep their defaults.
        assert!(config.filters.exclude.filenames.contains(&"Thumbs.db".to_string()));

        let settings = config.compile().unwrap();
        assert_eq!(settings.root, PathBuf::from("/srv/inbox"));
        assert!(!settings.archive_by_date);
        assert!(settings.recursive);
        assert_eq!(
            settings.history_path,
            PathBuf::from("/var/lib/dltidy/history.jsonl")
        );
        assert_eq!(settings.debounce.quiet_period, Duration::from_millis(50));

        let docs = settings.rules.category_for_extension("pdf").unwrap();
        assert_eq!(docs.name(), "Docs");
        assert_eq!(docs.subcategory_for("INVOICE-7.pdf"), Some("Invoices"));
        assert!(settings.rules.category_for_extension("jpg").is_none());
    }

    #[test]
    fn test_relative_history_file_resolves_against_root() {
        let settings = Settings::for_root("/data/dl").unwrap();
        assert_eq!(
            settings.history_path,
            PathBuf::from("/data/dl/.organize_history.jsonl")
        );
        assert_eq!(
            settings.unclassified,
            UnclassifiedPolicy::Bucket("其他".to_string())
        );
    }

    #[test]
    fn test_duplicate_extension_is_config_error() {
        let result = Config::from_toml(
            r#"
            root_path = "/tmp"
            [[categories]]
            name = "A"
            extensions = ["txt"]
            [[categories]]
            name = "B"
            extensions = ["TXT"]
            "#,
        )
        .unwrap()
        .compile();
        assert!(matches!(
            result,
            Err(ConfigError::Rules(RuleError::DuplicateExtension { .. }))
        ));
    }

    #[test]
    fn test_invalid_scalars_rejected() {
        let config = Config {
            root_path: Some(PathBuf::from("/tmp")),
            unclassified_bucket: "a/b".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.compile(),
            Err(ConfigError::InvalidValue { key: "unclassified_bucket", .. })
        ));

        let config = Config {
            root_path: Some(PathBuf::from("/tmp")),
            watch: WatchSettings {
                quiet_period_ms: 10,
                recheck_interval_ms: 0,
            },
            ..Config::default()
        };
        assert!(config.compile().is_err());
    }

    #[test]
    fn test_leave_unclassified_ignores_bucket() {
        let config = Config {
            root_path: Some(PathBuf::from("/tmp")),
            leave_unclassified: true,
            unclassified_bucket: String::new(),
            ..Config::default()
        };
        assert_eq!(
            config.compile().unwrap().unclassified,
            UnclassifiedPolicy::LeaveInPlace
        );
    }

    #[test]
    fn test_malformed_toml_is_reported() {
        let result = Config::from_toml("archive_by_date = \"yes\"");
        assert!(matches!(result, Err(ConfigError::ConfigInvalid(_))));
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let result = Config::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(result, Err(ConfigError::ConfigNotFound(_))));
    }
}
