use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use rocket_db_pools::sqlx;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::parser::RawRecord;

pub const TITLE_MAX_CHARS: usize = 200;
pub const CONTENT_MAX_CHARS: usize = 20_000;
pub const DESCRIPTION_MAX_CHARS: usize = 500;
pub const MAX_TAGS: usize = 10;
pub const TAG_MAX_CHARS: usize = 32;
pub const SLUG_MAX_CHARS: usize = 96;
/// Hex characters of the row key appended to every slug.
const SLUG_SUFFIX_CHARS: usize = 8;

static SLUG_SEPARATOR: OnceLock<Regex> = OnceLock::new();

fn slug_separator() -> &'static Regex {
    SLUG_SEPARATOR.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("Invalid slug regex"))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Writing,
    Coding,
    Marketing,
    Business,
    Education,
    Creative,
    Productivity,
    Research,
    Other,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Writing,
        Category::Coding,
        Category::Marketing,
        Category::Business,
        Category::Education,
        Category::Creative,
        Category::Productivity,
        Category::Research,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Writing => "writing",
            Category::Coding => "coding",
            Category::Marketing => "marketing",
            Category::Business => "business",
            Category::Education => "education",
            Category::Creative => "creative",
            Category::Productivity => "productivity",
            Category::Research => "research",
            Category::Other => "other",
        }
    }
}

impl FromStr for Category {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Category::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(value))
            .ok_or(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "content_post_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    #[default]
    Draft,
    Published,
}

impl FromStr for PostStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(PostStatus::Draft),
            "published" => Ok(PostStatus::Published),
            _ => Err(()),
        }
    }
}

/// A validated row, ready to be written to the content store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContentPost {
    pub title: String,
    pub slug: String,
    pub content: String,
    pub description: Option<String>,
    pub category: Category,
    pub tags: Vec<String>,
    pub status: PostStatus,
}

/// A row that was skipped; the batch carries on without it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    pub row: usize,
    pub message: String,
}

impl RowFailure {
    pub fn new(row: usize, message: impl Into<String>) -> Self {
        Self {
            row,
            message: message.into(),
        }
    }
}

impl fmt::Display for RowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Row {}: {}", self.row, self.message)
    }
}

fn field<'a>(record: &'a RawRecord, name: &str) -> Option<&'a str> {
    record
        .get(name)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn check_length(problems: &mut Vec<String>, name: &str, value: &str, max: usize) {
    let len = value.chars().count();
    if len > max {
        problems.push(format!("{name} is {len} characters, maximum is {max}"));
    }
}

/// Validate one record. All problems in the row are reported together.
pub fn validate_record(record: &RawRecord, row_key: &str) -> Result<NewContentPost, String> {
    let mut problems = Vec::new();

    let title = field(record, "title");
    match title {
        Some(title) => check_length(&mut problems, "title", title, TITLE_MAX_CHARS),
        None => problems.push("title is required".to_string()),
    }

    let content = field(record, "content");
    match content {
        Some(content) => check_length(&mut problems, "content", content, CONTENT_MAX_CHARS),
        None => problems.push("content is required".to_string()),
    }

    let category = match field(record, "category") {
        Some(raw) => match raw.parse::<Category>() {
            Ok(category) => Some(category),
            Err(()) => {
                problems.push(format!("category '{raw}' is not recognised"));
                None
            }
        },
        None => {
            problems.push("category is required".to_string());
            None
        }
    };

    let description = field(record, "description");
    if let Some(description) = description {
        check_length(&mut problems, "description", description, DESCRIPTION_MAX_CHARS);
    }

    let tags = field(record, "tags").map(split_tags).unwrap_or_default();
    if tags.len() > MAX_TAGS {
        problems.push(format!("{} tags given, maximum is {MAX_TAGS}", tags.len()));
    }
    for tag in &tags {
        if tag.chars().count() > TAG_MAX_CHARS {
            problems.push(format!("tag '{tag}' is longer than {TAG_MAX_CHARS} characters"));
        }
    }

    let status = match field(record, "status") {
        Some(raw) => raw.parse::<PostStatus>().unwrap_or_else(|()| {
            problems.push(format!("status '{raw}' must be draft or published"));
            PostStatus::Draft
        }),
        None => PostStatus::Draft,
    };

    match (title, content, category) {
        (Some(title), Some(content), Some(category)) if problems.is_empty() => Ok(NewContentPost {
            title: title.to_string(),
            slug: build_slug(title, row_key),
            content: content.to_string(),
            description: description.map(str::to_string),
            category,
            tags,
            status,
        }),
        _ => Err(problems.join("; ")),
    }
}

fn split_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw.split('|').map(str::trim).filter(|tag| !tag.is_empty()) {
        if !tags.iter().any(|seen| seen.eq_ignore_ascii_case(tag)) {
            tags.push(tag.to_string());
        }
    }
    tags
}

/// Lower-case ASCII words joined by `-`.
pub fn slugify(text: &str) -> String {
    let lowered = text.to_lowercase();
    slug_separator()
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

/// `slugify(title)` plus a short row-key suffix, kept within [`SLUG_MAX_CHARS`].
pub fn build_slug(title: &str, row_key: &str) -> String {
    let suffix: String = row_key.chars().take(SLUG_SUFFIX_CHARS).collect();
    let mut base = slugify(title);
    if base.is_empty() {
        base = "post".to_string();
    }

    let budget = SLUG_MAX_CHARS - SLUG_SUFFIX_CHARS - 1;
    if base.len() > budget {
        base.truncate(budget);
        base = base.trim_end_matches('-').to_string();
    }

    format!("{base}-{suffix}")
}
