//! Filename-based classification.
//!
//! [`classify`] is a pure function over a [`Candidate`] snapshot and a
//! [`RuleSet`]: extension picks the category, filename keywords pick the
//! subcategory, and the optional date bucket comes from the snapshot's
//! modification time so a preview and a later execution agree.

use crate::rules::RuleSet;
use chrono::{DateTime, Local};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A file considered for organizing, captured at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Where the file currently lives.
    pub source: PathBuf,
    /// File name (last path component). Lossy for non-UTF-8 names, which the
    /// organizer rejects before planning.
    pub name: String,
    /// Lowercased extension without the dot, if any.
    pub extension: Option<String>,
    /// Modification time when the candidate was created.
    pub modified: SystemTime,
    /// Size in bytes when the candidate was created.
    pub size: u64,
}

impl Candidate {
    /// Builds a candidate from explicit snapshot values.
    pub fn new(source: impl Into<PathBuf>, modified: SystemTime, size: u64) -> Self {
        let source = source.into();
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = Path::new(&name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());
        Self {
            source,
            name,
            extension,
            modified,
            size,
        }
    }

    /// Stats `path` and snapshots its size and modification time.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be stat'ed or is not a regular file.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let modified = meta.modified()?;
        Ok(Self::new(path, modified, meta.len()))
    }
}

/// Classifier output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Classification {
    pub category: String,
    pub subcategory: Option<String>,
    /// `YYYY-MM` of the candidate's modification time, when archiving by date.
    pub date_bucket: Option<String>,
}

impl Classification {
    /// Destination directory relative to the organize root:
    /// `category[/subcategory][/date_bucket]`.
    pub fn relative_dir(&self) -> PathBuf {
        let mut dir = PathBuf::from(&self.category);
        if let Some(sub) = &self.subcategory {
            dir.push(sub);
        }
        if let Some(bucket) = &self.date_bucket {
            dir.push(bucket);
        }
        dir
    }

    /// Display label, `category` or `category/subcategory`.
    pub fn label(&self) -> String {
        match &self.subcategory {
            Some(sub) => format!("{}/{}", self.category, sub),
            None => self.category.clone(),
        }
    }
}

/// Options that affect classification output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifyOptions {
    /// Add a `YYYY-MM` bucket under the (sub)category.
    pub archive_by_date: bool,
}

/// Classifies a candidate.
///
/// Returns `None` when the extension is unknown; what happens to such files is
/// the caller's policy.
///
/// # Examples
///
/// ```
/// use dltidy::classifier::{classify, Candidate, ClassifyOptions};
/// use dltidy::rules::RuleSet;
/// use std::time::SystemTime;
///
/// let rules = RuleSet::default();
/// let candidate = Candidate::new("/tmp/paper_v2_final.pdf", SystemTime::now(), 10);
/// let class = classify(&candidate, &rules, ClassifyOptions::default()).unwrap();
/// assert_eq!(class.category, "文档");
/// assert_eq!(class.subcategory.as_deref(), Some("论文"));
/// assert_eq!(class.date_bucket, None);
/// ```
pub fn classify(
    candidate: &Candidate,
    rules: &RuleSet,
    options: ClassifyOptions,
) -> Option<Classification> {
    let ext = candidate.extension.as_deref()?;
    let category = rules.category_for_extension(ext)?;
    Some(Classification {
        category: category.name().to_string(),
        subcategory: category.subcategory_for(&candidate.name).map(str::to_string),
        date_bucket: options
            .archive_by_date
            .then(|| date_bucket(candidate.modified)),
    })
}

/// Formats a modification time as a local `YYYY-MM` bucket.
pub fn date_bucket(modified: SystemTime) -> String {
    let local: DateTime<Local> = modified.into();
    local.format("%Y-%m").to_string()
}
