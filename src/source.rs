//! Job source: loads the catalogue and computes the pending set.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use crate::job::Job;

/// Jobs without a persisted result, in dispatch order.
///
/// Pure: ordering depends only on identifiers, so re-submission order is
/// reproducible across runs.
pub fn pending(all_jobs: Vec<Job>, existing: &HashSet<String>) -> Vec<Job> {
    let mut seen = HashSet::new();
    let mut jobs: Vec<Job> = all_jobs
        .into_iter()
        .filter(|job| !existing.contains(&job.id))
        .filter(|job| seen.insert(job.id.clone()))
        .collect();
    jobs.sort_by_cached_key(Job::sort_key);
    jobs
}

/// Test definitions for a set of categories, read from JSON-lines files named
/// `<category>.json` inside a catalogue directory.
#[derive(Debug, Default)]
pub struct Catalogue {
    by_category: BTreeMap<String, Vec<Job>>,
}

impl Catalogue {
    /// Loads the named categories, or every `*.json` file when `categories` is empty.
    pub fn load(dir: &Path, categories: &[String]) -> Result<Self> {
        let categories = if categories.is_empty() {
            discover_categories(dir)?
        } else {
            categories.to_vec()
        };

        let mut by_category = BTreeMap::new();
        for category in categories {
            let path = dir.join(format!("{category}.json"));
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read catalogue file {}", path.display()))?;
            let jobs = parse_entries(&contents, &category)
                .with_context(|| format!("invalid catalogue file {}", path.display()))?;
            tracing::debug!(category = %category, jobs = jobs.len(), "loaded catalogue");
            by_category.insert(category, jobs);
        }
        Ok(Self { by_category })
    }

    pub fn from_jobs(jobs: Vec<Job>) -> Self {
        let mut by_category: BTreeMap<String, Vec<Job>> = BTreeMap::new();
        for job in jobs {
            by_category.entry(job.category.clone()).or_default().push(job);
        }
        Self { by_category }
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.by_category.keys().map(String::as_str)
    }

    pub fn jobs_in(&self, category: &str) -> &[Job] {
        self.by_category
            .get(category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_category.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keeps only the identifiers listed per category, dropping categories
    /// that are absent or empty in the selection.
    pub fn restrict_to(self, selection: &BTreeMap<String, Vec<String>>) -> Self {
        let by_category = self
            .by_category
            .into_iter()
            .filter_map(|(category, jobs)| {
                let wanted: HashSet<&str> = selection
                    .get(&category)?
                    .iter()
                    .map(String::as_str)
                    .collect();
                let jobs: Vec<Job> = jobs
                    .into_iter()
                    .filter(|j| wanted.contains(j.id.as_str()))
                    .collect();
                (!jobs.is_empty()).then_some((category, jobs))
            })
            .collect();
        Self { by_category }
    }

    /// Drops every job whose identifier is in `excluded`.
    pub fn exclude(mut self, excluded: &HashSet<String>) -> Self {
        for jobs in self.by_category.values_mut() {
            jobs.retain(|j| !excluded.contains(&j.id));
        }
        self
    }

    pub fn into_jobs(self) -> Vec<Job> {
        self.by_category.into_values().flatten().collect()
    }
}

fn discover_categories(dir: &Path) -> Result<Vec<String>> {
    let mut categories = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list catalogue directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            categories.push(stem.to_string());
        }
    }
    categories.sort();
    Ok(categories)
}

fn parse_entries(contents: &str, category: &str) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: Value = serde_json::from_str(line)
            .with_context(|| format!("line {} is not valid JSON", lineno + 1))?;
        match Job::from_entry(entry, Some(category)) {
            Some(job) => jobs.push(job),
            None => bail!("line {} has no string \"id\" field", lineno + 1),
        }
    }
    Ok(jobs)
}

/// Reads a `{category: [ids]}` selection file.
pub fn load_run_ids(path: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read run-ids file {}", path.display()))?;
    let selection: BTreeMap<String, Vec<String>> =
        serde_json::from_str(&contents).context("run-ids file must map categories to id lists")?;
    Ok(selection)
}

/// Reads a JSON array of identifiers to skip.
pub fn load_exclusions(path: &Path) -> Result<HashSet<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read exclusion list {}", path.display()))?;
    let ids: Vec<String> =
        serde_json::from_str(&contents).context("exclusion list must be a JSON array of ids")?;
    Ok(ids.into_iter().collect())
}
