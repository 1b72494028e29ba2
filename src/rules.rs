/// Category and keyword rule tables.
///
/// A [`RuleSet`] maps file extensions to a top-level category and, within a
/// category, ordered keyword lists to a subcategory. The set is immutable once
/// built and is passed by reference wherever classification happens.
///
/// # Examples
///
/// ```
/// use dltidy::rules::RuleSet;
///
/// let rules = RuleSet::default();
/// assert_eq!(rules.category_for_extension("PDF").map(|c| c.name()), Some("文档"));
/// assert_eq!(rules.category_for_extension(".jpg").map(|c| c.name()), Some("图片"));
/// assert!(rules.category_for_extension("xyz").is_none());
/// ```
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while validating a rule table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// The same extension was listed under two categories.
    #[error("extension '.{extension}' is mapped to both '{first}' and '{second}'")]
    DuplicateExtension {
        extension: String,
        first: String,
        second: String,
    },
    /// Two categories share a name.
    #[error("category '{0}' is declared more than once")]
    DuplicateCategory(String),
    /// A category or subcategory name is empty or would escape its directory.
    #[error("invalid {kind} name '{name}': must be a single non-empty path component")]
    InvalidName { kind: &'static str, name: String },
    /// A category has no extensions at all.
    #[error("category '{0}' lists no extensions")]
    NoExtensions(String),
    /// An extension is empty after normalization.
    #[error("category '{0}' contains an empty extension")]
    EmptyExtension(String),
    /// A keyword rule contains an empty keyword (which would match everything).
    #[error("subcategory '{subcategory}' of '{category}' contains an empty keyword")]
    EmptyKeyword {
        category: String,
        subcategory: String,
    },
}

/// A keyword list that refines a category into a subcategory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubcategoryRule {
    /// Directory name of the subcategory.
    pub name: String,
    /// Case-insensitive filename substrings; any one of them selects this rule.
    pub keywords: Vec<String>,
}

/// One top-level category: the extensions it owns and its ordered keyword rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    /// Directory name of the category.
    pub name: String,
    /// Extensions (with or without a leading dot) that belong to this category.
    pub extensions: Vec<String>,
    /// Keyword rules, tried in declaration order.
    #[serde(default)]
    pub subcategories: Vec<SubcategoryRule>,
}

impl CategoryRule {
    /// Returns the category's directory name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the first subcategory whose keywords occur in `file_name`.
    ///
    /// Matching is a case-insensitive substring test against the file name
    /// only. Rules are tried in declaration order and the first hit wins.
    pub fn subcategory_for(&self, file_name: &str) -> Option<&str> {
        let lowered = file_name.to_lowercase();
        self.subcategories
            .iter()
            .find(|rule| rule.keywords.iter().any(|kw| lowered.contains(kw.as_str())))
            .map(|rule| rule.name.as_str())
    }
}

/// Immutable set of classification rules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    categories: Vec<CategoryRule>,
    extension_map: HashMap<String, usize>,
}

impl RuleSet {
    /// Validates and indexes a list of category rules.
    ///
    /// Extensions are normalized to lowercase without a leading dot and
    /// keywords to lowercase, so lookups never have to normalize the table side.
    ///
    /// # Errors
    ///
    /// Returns a [`RuleError`] when an extension is claimed by two categories,
    /// a name is empty or contains a path separator, or a keyword is empty.
    pub fn new(categories: Vec<CategoryRule>) -> Result<Self, RuleError> {
        let mut normalized = Vec::with_capacity(categories.len());
        let mut extension_map: HashMap<String, usize> = HashMap::new();

        for (index, category) in categories.into_iter().enumerate() {
            validate_name("category", &category.name)?;
            if normalized
                .iter()
                .any(|existing: &CategoryRule| existing.name == category.name)
            {
                return Err(RuleError::DuplicateCategory(category.name));
            }
            if category.extensions.is_empty() {
                return Err(RuleError::NoExtensions(category.name));
            }

            let mut extensions = Vec::with_capacity(category.extensions.len());
            for raw in &category.extensions {
                let ext = normalize_extension(raw);
                if ext.is_empty() {
                    return Err(RuleError::EmptyExtension(category.name.clone()));
                }
                match extension_map.get(&ext) {
                    Some(&owner) if owner == index => continue,
                    Some(&owner) => {
                        let first: &CategoryRule = &normalized[owner];
                        return Err(RuleError::DuplicateExtension {
                            extension: ext,
                            first: first.name.clone(),
                            second: category.name.clone(),
                        });
                    }
                    None => {
                        extension_map.insert(ext.clone(), index);
                        extensions.push(ext);
                    }
                }
            }

            let mut subcategories = Vec::with_capacity(category.subcategories.len());
            for rule in category.subcategories {
                validate_name("subcategory", &rule.name)?;
                let mut keywords = Vec::with_capacity(rule.keywords.len());
                for keyword in &rule.keywords {
                    let keyword = keyword.trim().to_lowercase();
                    if keyword.is_empty() {
                        return Err(RuleError::EmptyKeyword {
                            category: category.name.clone(),
                            subcategory: rule.name.clone(),
                        });
                    }
                    keywords.push(keyword);
                }
                subcategories.push(SubcategoryRule {
                    name: rule.name,
                    keywords,
                });
            }

            normalized.push(CategoryRule {
                name: category.name,
                extensions,
                subcategories,
            });
        }

        Ok(Self {
            categories: normalized,
            extension_map,
        })
    }

    /// Maps an extension to its category.
    ///
    /// The lookup is case-insensitive and ignores a leading dot.
    pub fn category_for_extension(&self, ext: &str) -> Option<&CategoryRule> {
        self.extension_map
            .get(&normalize_extension(ext))
            .map(|&index| &self.categories[index])
    }

    /// Returns the categories in declaration order.
    pub fn categories(&self) -> &[CategoryRule] {
        &self.categories
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new(default_categories()).expect("built-in rule tables are valid")
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

fn validate_name(kind: &'static str, name: &str) -> Result<(), RuleError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed != name
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(RuleError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

fn category(name: &str, extensions: &[&str], subcategories: Vec<SubcategoryRule>) -> CategoryRule {
    CategoryRule {
        name: name.to_string(),
        extensions: extensions.iter().map(|e| e.to_string()).collect(),
        subcategories,
    }
}

fn keywords(name: &str, words: &[&str]) -> SubcategoryRule {
    SubcategoryRule {
        name: name.to_string(),
        keywords: words.iter().map(|w| w.to_string()).collect(),
    }
}

/// The built-in category table used when no `[[categories]]` are configured.
pub fn default_categories() -> Vec<CategoryRule> {
    vec![
        category(
            "文档",
            &[
                "pdf", "doc", "docx", "txt", "rtf", "odt", "xlsx", "xls", "pptx", "ppt",
            ],
            vec![
                // Academic papers: three lists, all landing in the same folder.
                keywords("论文", &["论文", "paper", "research", "study", "journal", "review"]),
                keywords(
                    "论文",
                    &["arxiv", "ieee", "acm", "springer", "elsevier", "s2.0-", "1-s2.0"],
                ),
                keywords("论文", &["摘要", "abstract", "introduction", "conclusion"]),
                keywords("发票", &["发票", "invoice", "receipt", "账单", "bill"]),
                keywords("合同", &["合同", "contract", "agreement", "协议"]),
                keywords("简历", &["简历", "resume", "cv", "curriculum"]),
                keywords("报告", &["报告", "report", "汇报", "总结"]),
                keywords("手册", &["手册", "manual", "guide", "教程", "tutorial"]),
            ],
        ),
        category(
            "图片",
            &[
                "jpg", "jpeg", "png", "gif", "bmp", "webp", "heic", "svg", "tiff",
            ],
            vec![
                keywords("截图", &["screenshot", "截图", "屏幕", "screen"]),
                keywords("照片", &["photo", "img_", "dsc_", "dcim", "9b6b"]),
                keywords("设计", &["design", "设计", "ui", "mockup"]),
            ],
        ),
        category(
            "安装包",
            &[
                "dmg", "pkg", "app", "exe", "msi", "zip", "rar", "7z", "tar", "gz", "bz2",
            ],
            Vec::new(),
        ),
        category("视频", &["mp4", "mov", "avi", "mkv", "wmv", "flv"], Vec::new()),
        category("音频", &["mp3", "wav", "flac", "aac", "m4a"], Vec::new()),
        category(
            "代码",
            &["py", "js", "ts", "html", "css", "json", "xml", "yaml", "yml"],
            Vec::new(),
        ),
        category(
            "数据分析",
            &["do", "csv", "dta", "sav", "rdata", "sqlite", "db"],
            Vec::new(),
        ),
    ]
}
