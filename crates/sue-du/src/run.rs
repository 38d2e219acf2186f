//! Run discovery over a listing of inventory report artifacts.
//!
//! Artifact names follow `<date>/<rule-name>/<file>` where `<date>` is the
//! fixed-width `YYYY/MM/DD/hh-mm-ss` segment written by the inventory job.
//! Names that do not follow this layout are ignored.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::{DuError, RunDate};

/// chrono format of the `<date>` path segment.
pub const RUN_DATE_PATH_FORMAT: &str = "%Y/%m/%d/%H-%M-%S";

/// Run date → names of the inventory rules that produced output for it.
pub type RulesRanByDate = BTreeMap<RunDate, Vec<String>>;

fn run_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<date>\d{4}/\d{2}/\d{2}/\d{2}-\d{2}-\d{2})/(?P<rule>[^/]+)/[^_]+_\d+_\d+\.(?:csv|parquet)$",
        )
        .expect("static run file pattern compiles")
    })
}

/// A report file name that matched the run layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifact<'a> {
    pub name: &'a str,
    pub run_date: RunDate,
    pub rule: &'a str,
}

/// Parse one artifact name. `Ok(None)` means "not a report file".
pub fn parse_artifact(name: &str) -> Result<Option<RunArtifact<'_>>, DuError> {
    let Some(caps) = run_file_pattern().captures(name) else {
        return Ok(None);
    };
    let (Some(date), Some(rule)) = (caps.name("date"), caps.name("rule")) else {
        return Ok(None);
    };
    let run_date = parse_run_date(date.as_str()).map_err(|source| DuError::InvalidRunDate {
        name: name.to_string(),
        source,
    })?;
    Ok(Some(RunArtifact {
        name,
        run_date,
        rule: rule.as_str(),
    }))
}

pub fn parse_run_date(s: &str) -> Result<RunDate, chrono::ParseError> {
    let naive = NaiveDateTime::parse_from_str(s, RUN_DATE_PATH_FORMAT)?;
    Ok(Utc.from_utc_datetime(&naive))
}

pub fn format_run_date(run_date: RunDate) -> String {
    run_date.format(RUN_DATE_PATH_FORMAT).to_string()
}

/// Group all matching artifact names by run date.
///
/// A name that matches the layout but carries an impossible date (month 13,
/// ...) is an error: the listing is not what we expect it to be.
pub fn find_runs<I, S>(names: I) -> Result<RulesRanByDate, DuError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut runs = RulesRanByDate::new();
    for name in names {
        if let Some(artifact) = parse_artifact(name.as_ref())? {
            runs.entry(artifact.run_date)
                .or_default()
                .push(artifact.rule.to_string());
        }
    }
    Ok(runs)
}

/// Newest run date, if any run was found.
pub fn last_run_date(runs: &RulesRanByDate) -> Option<RunDate> {
    runs.keys().next_back().copied()
}

/// Artifact names that belong to `run_date`, in listing order.
pub fn files_for_run<'a, S>(names: &'a [S], run_date: RunDate) -> Vec<&'a str>
where
    S: AsRef<str>,
{
    names
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| {
            matches!(parse_artifact(name), Ok(Some(artifact)) if artifact.run_date == run_date)
        })
        .collect()
}
