use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::model::Dataset;

/// Run output directories are named `{prefix}_{timestamp}`.
pub const RUN_DIR_PREFIX: &str = "scraping_results";

/// Finds every run directory under `base` whose name starts with `prefix`.
/// Sorted by name, which with timestamped names is chronological.
pub fn discover_run_dirs(base: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let listing = fs::read_dir(base)
        .with_context(|| format!("failed to list {}", base.display()))?;
    for item in listing {
        let item = item?;
        if !item.file_type()?.is_dir() {
            continue;
        }
        if item.file_name().to_string_lossy().starts_with(prefix) {
            dirs.push(item.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Merges every partial dataset file in the given run directories into one
/// dataset. When two runs saw the same (hotel, room, stay), the entry with
/// the later scrape timestamp wins outright. Unreadable files are skipped
/// with a warning; one corrupt worker file never sinks the merge.
pub fn merge_partial_datasets(run_dirs: &[PathBuf]) -> Dataset {
    let mut merged = Dataset::new();
    for dir in run_dirs {
        let listing = match fs::read_dir(dir) {
            Ok(listing) => listing,
            Err(e) => {
                warn!("skipping run dir {}: {e}", dir.display());
                continue;
            }
        };
        for item in listing.flatten() {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let dataset = match read_partial(&path) {
                Ok(dataset) => dataset,
                Err(e) => {
                    warn!("skipping {}: {e:#}", path.display());
                    continue;
                }
            };
            let mut kept = 0;
            let total = dataset.len();
            for (key, entry) in dataset {
                match merged.get(&key) {
                    Some(existing) if existing.scraped_at >= entry.scraped_at => {}
                    _ => {
                        merged.insert(key, entry);
                        kept += 1;
                    }
                }
            }
            info!(
                "merged {}: {kept}/{total} entries newer than what was already seen",
                path.display()
            );
        }
    }
    merged
}

fn read_partial(path: &Path) -> Result<Dataset> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Writes the merged dataset as pretty JSON, creating the parent directory
/// if needed.
pub fn write_canonical(path: &Path, dataset: &Dataset) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(dataset)
        .context("failed to serialize merged dataset")?;
    fs::write(path, json)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!("wrote {} entries to {}", dataset.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Entry;
    use crate::task::ScrapeTask;
    use chrono::NaiveDate;

    fn entry(hotel: &str, price: &str, day: u32) -> Entry {
        let task = ScrapeTask::new(
            "paris".to_string(),
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            1,
            None,
        );
        let scraped_at = NaiveDate::from_ymd_opt(2025, 1, day)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let mut entry = Entry::new(hotel, "Classic Room", &task, scraped_at);
        entry.rates.insert(
            "SANS REMISE - Non remboursable - EUR".to_string(),
            price.to_string(),
        );
        entry
    }

    fn write_run(base: &Path, name: &str, file: &str, entries: Vec<Entry>) -> PathBuf {
        let dir = base.join(name);
        fs::create_dir_all(&dir).unwrap();
        let dataset: Dataset = entries.into_iter().map(|e| (e.key(), e)).collect();
        fs::write(
            dir.join(file),
            serde_json::to_string_pretty(&dataset).unwrap(),
        )
        .unwrap();
        dir
    }

    #[test]
    fn later_scrape_wins_across_runs() {
        let base = tempfile::tempdir().unwrap();
        let old = write_run(
            base.path(),
            "scraping_results_20250110",
            "paris_worker_0.json",
            vec![entry("Intercontinental Paris", "120,50", 10)],
        );
        let new = write_run(
            base.path(),
            "scraping_results_20250112",
            "paris_worker_1.json",
            vec![entry("Intercontinental Paris", "110,00", 12)],
        );

        // order of the run list must not matter
        for dirs in [vec![old.clone(), new.clone()], vec![new.clone(), old.clone()]] {
            let merged = merge_partial_datasets(&dirs);
            assert_eq!(merged.len(), 1);
            let winner = merged.values().next().unwrap();
            assert_eq!(
                winner.rates.get("SANS REMISE - Non remboursable - EUR"),
                Some(&"110,00".to_string())
            );
        }
    }

    #[test]
    fn distinct_keys_are_unioned() {
        let base = tempfile::tempdir().unwrap();
        let a = write_run(
            base.path(),
            "scraping_results_a",
            "paris_worker_0.json",
            vec![entry("Intercontinental Paris", "120,50", 10)],
        );
        let b = write_run(
            base.path(),
            "scraping_results_b",
            "paris_worker_0.json",
            vec![entry("Crowne Plaza Paris", "80,00", 10)],
        );

        let merged = merge_partial_datasets(&[a, b]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn malformed_files_are_skipped() {
        let base = tempfile::tempdir().unwrap();
        let dir = write_run(
            base.path(),
            "scraping_results_a",
            "paris_worker_0.json",
            vec![entry("Intercontinental Paris", "120,50", 10)],
        );
        fs::write(dir.join("tokyo_worker_1.json"), "{ not json").unwrap();
        fs::write(dir.join("notes.txt"), "ignore me").unwrap();

        let merged = merge_partial_datasets(&[dir]);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn discovery_only_returns_matching_directories() {
        let base = tempfile::tempdir().unwrap();
        fs::create_dir(base.path().join("scraping_results_20250110")).unwrap();
        fs::create_dir(base.path().join("scraping_results_20250112")).unwrap();
        fs::create_dir(base.path().join("merged_results")).unwrap();
        fs::write(base.path().join("scraping_results_stray.json"), "{}").unwrap();

        let dirs = discover_run_dirs(base.path(), RUN_DIR_PREFIX).unwrap();
        let names: Vec<_> = dirs
            .iter()
            .map(|d| d.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["scraping_results_20250110", "scraping_results_20250112"]
        );
    }

    #[test]
    fn canonical_output_creates_the_parent_directory() {
        let base = tempfile::tempdir().unwrap();
        let path = base.path().join("merged_results/canonical.json");
        let dataset: Dataset = vec![entry("Intercontinental Paris", "120,50", 10)]
            .into_iter()
            .map(|e| (e.key(), e))
            .collect();

        write_canonical(&path, &dataset).unwrap();

        let back: Dataset = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, dataset);
    }
}
