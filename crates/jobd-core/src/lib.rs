//! Core listing model, link/identifier normalization and freshness policy for jobd.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use url::Url;

pub const CRATE_NAME: &str = "jobd-core";

/// Display value for fields a source does not expose.
pub const UNKNOWN: &str = "N/A";

/// Query parameters that only carry campaign attribution. `utm_*` is matched by prefix.
const TRACKING_PARAMS: &[&str] = &[
    "ref",
    "referrer",
    "gh_src",
    "lever-origin",
    "lever-source",
    "fbclid",
    "gclid",
    "trk",
    "mc_cid",
    "mc_eid",
];

/// Values that sources put in a cell when they have nothing to say.
const PLACEHOLDERS: &[&str] = &["", "n/a", "na", "-", "--", "unknown", "none", "null"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    InternList,
    GitHub,
}

impl Source {
    pub fn label(self) -> &'static str {
        match self {
            Source::InternList => "InternList",
            Source::GitHub => "GitHub",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Loose handoff shape produced by adapters before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub date: Option<String>,
    pub salary: Option<String>,
    pub work_model: Option<String>,
    pub link: Option<String>,
}

/// One normalized posting. Fields are read-only facts captured when the listing was seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobListing {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub date: String,
    pub salary: String,
    pub work_model: String,
    pub source: Source,
    pub link: String,
}

impl JobListing {
    /// Normalizes a raw record. Returns `None` only when no title can be recovered;
    /// every other missing field degrades to [`UNKNOWN`], and a missing link degrades
    /// to an empty string with a company+title identifier.
    pub fn from_raw(source: Source, raw: RawListing) -> Option<Self> {
        let title = clean_text(raw.title)?;
        let company = clean_text(raw.company);
        let link = raw
            .link
            .as_deref()
            .map(normalize_link)
            .unwrap_or_default();
        let id = listing_id(&link, company.as_deref(), &title);

        Some(Self {
            id,
            title,
            company: company.unwrap_or_else(unknown),
            location: clean_text(raw.location).unwrap_or_else(unknown),
            date: clean_text(raw.date).unwrap_or_else(unknown),
            salary: clean_text(raw.salary).unwrap_or_else(unknown),
            work_model: clean_text(raw.work_model).unwrap_or_else(unknown),
            source,
            link,
        })
    }

    pub fn has_link(&self) -> bool {
        !self.link.is_empty()
    }
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

/// Trims and collapses internal whitespace; blank values become `None`.
pub fn clean_text(value: Option<String>) -> Option<String> {
    let value = value?;
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub fn is_placeholder(value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    PLACEHOLDERS.contains(&lower.as_str())
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Canonical form of an application link: tracking parameters removed, the rest of the
/// query kept in order. Unparseable input is returned trimmed.
pub fn normalize_link(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    if url.query().is_some() {
        let kept = url
            .query_pairs()
            .filter(|(key, _)| !is_tracking_param(key))
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect::<Vec<_>>();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept.iter());
        }
    }

    url.to_string()
}

/// Dedup key: the normalized link, or company+title when the source gave no link.
pub fn listing_id(normalized_link: &str, company: Option<&str>, title: &str) -> String {
    if !normalized_link.is_empty() {
        return normalized_link.to_string();
    }
    format!("{}{}", company.unwrap_or_default(), title)
}

/// Accepts ISO `YYYY-MM-DD` and US `MM/DD/YY` (also `MM/DD/YYYY`).
pub fn parse_posting_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    ["%Y-%m-%d", "%m/%d/%y", "%m/%d/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Like [`parse_posting_date`] but never rejects: unknown formats count as `today`.
pub fn normalize_posting_date(raw: &str, today: NaiveDate) -> NaiveDate {
    match parse_posting_date(raw) {
        Some(date) => date,
        None => {
            tracing::warn!(raw_date = raw, %today, "unrecognized posting date, assuming today");
            today
        }
    }
}

/// How a source's date column decides whether a posting is from today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessPolicy {
    /// Absolute date equal to today.
    ExactDate,
    /// Relative age marker such as `3h`, `45 min ago`, `0d`, `today`.
    RelativeAge,
}

impl FreshnessPolicy {
    pub fn is_fresh(self, marker: &str, today: NaiveDate) -> bool {
        match self {
            FreshnessPolicy::ExactDate => parse_posting_date(marker) == Some(today),
            FreshnessPolicy::RelativeAge => is_recent_marker(marker),
        }
    }
}

fn is_recent_marker(marker: &str) -> bool {
    let lower = marker.trim().to_ascii_lowercase();
    if lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == "today" || token == "now")
    {
        return true;
    }

    let digits_end = lower
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(lower.len());
    if digits_end == 0 {
        return false;
    }
    let Ok(amount) = lower[..digits_end].parse::<u32>() else {
        return false;
    };
    let unit = lower[digits_end..]
        .trim()
        .trim_end_matches("ago")
        .trim();

    match unit {
        "h" | "hr" | "hrs" | "hour" | "hours" | "m" | "min" | "mins" | "minute" | "minutes" => true,
        "d" | "day" | "days" => amount == 0,
        _ => false,
    }
}
