use std::fmt;

use chrono::{Days, NaiveDate};

use crate::config::ScrapeConfig;

/// A negotiated corporate account: the client company and the code the
/// booking site expects in the search request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorporateAccount {
    pub company: String,
    pub code: String,
}

impl CorporateAccount {
    pub fn new(company: &str, code: &str) -> Self {
        Self {
            company: company.to_string(),
            code: code.to_string(),
        }
    }
}

/// One unit of scraping work. Immutable once built; owned by the queue until
/// a worker takes it, then by that worker for the duration of processing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScrapeTask {
    pub city: String,
    pub check_in_date: NaiveDate,
    pub duration: u32,
    pub corporate_info: Option<CorporateAccount>,
}

impl ScrapeTask {
    pub fn new(
        city: String,
        check_in_date: NaiveDate,
        duration: u32,
        corporate_info: Option<CorporateAccount>,
    ) -> Self {
        Self {
            city,
            check_in_date,
            duration,
            corporate_info,
        }
    }

    pub fn check_out_date(&self) -> NaiveDate {
        self.check_in_date + Days::new(u64::from(self.duration))
    }

    pub fn company_name(&self) -> Option<&str> {
        self.corporate_info.as_ref().map(|c| c.company.as_str())
    }

    pub fn corporate_code(&self) -> Option<&str> {
        self.corporate_info.as_ref().map(|c| c.code.as_str())
    }
}

impl fmt::Display for ScrapeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} ({}n)",
            self.city,
            self.check_in_date.format("%Y-%m-%d"),
            self.duration
        )?;
        if let Some(company) = self.company_name() {
            write!(f, " - {company}")?;
        }
        Ok(())
    }
}

/// Expands the configured dimensions into the full Cartesian product of
/// tasks: for every (city, date, duration), one task without corporate info
/// plus one per corporate account.
pub fn build_tasks(config: &ScrapeConfig) -> Vec<ScrapeTask> {
    let mut tasks = Vec::new();
    for city in &config.cities {
        for &date in &config.check_in_dates {
            for &duration in &config.durations {
                tasks.push(ScrapeTask::new(city.clone(), date, duration, None));
                for account in &config.corporate_accounts {
                    tasks.push(ScrapeTask::new(
                        city.clone(),
                        date,
                        duration,
                        Some(account.clone()),
                    ));
                }
            }
        }
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config_with(cities: usize, dates: usize, durations: usize, corporates: usize) -> ScrapeConfig {
        let mut config = ScrapeConfig::default();
        config.cities = (0..cities).map(|i| format!("city{i}")).collect();
        config.check_in_dates = (0..dates)
            .map(|i| NaiveDate::from_ymd_opt(2025, 6, 1 + i as u32).unwrap())
            .collect();
        config.durations = (1..=durations as u32).collect();
        config.corporate_accounts = (0..corporates)
            .map(|i| CorporateAccount::new(&format!("corp{i}"), &format!("{i:06}")))
            .collect();
        config
    }

    #[test]
    fn task_source_produces_the_full_cross_product() {
        let config = config_with(3, 4, 2, 5);
        let tasks = build_tasks(&config);
        assert_eq!(tasks.len(), 3 * 4 * 2 * (1 + 5));
    }

    #[test]
    fn task_source_produces_no_duplicates() {
        let config = config_with(2, 3, 2, 4);
        let tasks = build_tasks(&config);
        let unique: HashSet<_> = tasks.iter().collect();
        assert_eq!(unique.len(), tasks.len());
    }

    #[test]
    fn every_combination_appears_once_without_corporate_info() {
        let config = config_with(2, 2, 2, 3);
        let tasks = build_tasks(&config);
        let plain = tasks.iter().filter(|t| t.corporate_info.is_none()).count();
        assert_eq!(plain, 2 * 2 * 2);
    }

    #[test]
    fn check_out_is_check_in_plus_duration() {
        let task = ScrapeTask::new(
            "paris".to_string(),
            NaiveDate::from_ymd_opt(2025, 12, 30).unwrap(),
            4,
            None,
        );
        assert_eq!(
            task.check_out_date(),
            NaiveDate::from_ymd_opt(2026, 1, 3).unwrap()
        );
    }

    #[test]
    fn display_includes_the_corporate_company() {
        let task = ScrapeTask::new(
            "tokyo".to_string(),
            NaiveDate::from_ymd_opt(2025, 4, 3).unwrap(),
            2,
            Some(CorporateAccount::new("IBM", "243132")),
        );
        assert_eq!(task.to_string(), "tokyo - 2025-04-03 (2n) - IBM");
    }
}
