use anyhow::Context;
use chrono::{Datelike, Days, Local, NaiveDate, Weekday};
use serde::{Deserialize, de::DeserializeOwned};

use crate::client::ClientSettings;
use crate::model::Currency;
use crate::task::CorporateAccount;
use crate::worker::WorkerBudgets;

/// The env vars a run can override. Everything is optional; defaults cover a
/// full production run.
#[derive(Debug, Deserialize)]
pub struct ScrapeEnv {
    num_workers: Option<usize>,
    output_base_dir: Option<String>,
    search_base_url: Option<String>,
}

/// Everything one run needs: the task dimensions, the worker pool size, the
/// client knobs and the budgets.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub num_workers: usize,
    pub cities: Vec<String>,
    pub check_in_dates: Vec<NaiveDate>,
    pub durations: Vec<u32>,
    pub corporate_accounts: Vec<CorporateAccount>,
    pub currencies: Vec<Currency>,
    /// Directory the run's partial files land in, timestamped per run.
    pub output_dir: String,
    pub budgets: WorkerBudgets,
    pub client: ClientSettings,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        let now = Local::now();
        Self {
            num_workers: 8,
            cities: ["frankfurt", "tokyo", "singapore", "dubai", "new york"]
                .map(str::to_string)
                .to_vec(),
            check_in_dates: default_check_in_dates(now.date_naive()),
            durations: vec![1, 2],
            corporate_accounts: corporate_account_table(),
            currencies: vec![Currency::Eur, Currency::Usd],
            output_dir: format!("scraping_results_{}", now.format("%Y%m%d_%H%M%S")),
            budgets: WorkerBudgets::default(),
            client: ClientSettings::default(),
        }
    }
}

impl ScrapeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let env = ScrapeEnv::load_from_env()?;
        let mut config = Self::default();
        if let Some(num_workers) = env.num_workers {
            anyhow::ensure!(num_workers > 0, "NUM_WORKERS must be at least 1");
            config.num_workers = num_workers;
        }
        if let Some(base) = env.output_base_dir {
            config.output_dir = format!("{base}/{}", config.output_dir);
        }
        if let Some(url) = env.search_base_url {
            config.client.base_url = url;
        }
        Ok(config)
    }
}

/// The negotiated corporate accounts to price against.
fn corporate_account_table() -> Vec<CorporateAccount> {
    [
        ("FedEx", "109207"),
        ("Fujitsu", "100016221"),
        ("Honda", "100371240"),
        ("IBM", "243132"),
        ("Lafarge", "900000588"),
        ("Lenovo", "100211707"),
        ("Lowes", "924806"),
        ("Oracle", "100183394"),
        ("Philips", "953100013"),
        ("Target", "888400"),
        ("UPS", "108146"),
    ]
    .map(|(company, code)| CorporateAccount::new(company, code))
    .to_vec()
}

/// Check-in dates for a run: four fixed dates spread across next year's
/// quarters, plus the next few weekdays for near-term prices. Fridays and
/// weekends are skipped because business rates differ there.
pub fn default_check_in_dates(today: NaiveDate) -> Vec<NaiveDate> {
    let next_year = today.year() + 1;
    let mut dates: Vec<NaiveDate> = [(1, 15), (4, 3), (7, 2), (10, 23)]
        .iter()
        .filter_map(|&(month, day)| NaiveDate::from_ymd_opt(next_year, month, day))
        .collect();

    let mut day = today + Days::new(1);
    let mut picked = 0;
    while picked < 3 {
        if !matches!(day.weekday(), Weekday::Fri | Weekday::Sat | Weekday::Sun) {
            dates.push(day);
            picked += 1;
        }
        day = day + Days::new(1);
    }
    dates
}

// Extension trait.
pub trait LoadFromEnv: DeserializeOwned {
    fn load_from_env() -> anyhow::Result<Self> {
        // Don't throw an error if .env file doesn't exist.
        let _ = dotenv::dotenv();
        let config =
            envy::from_env::<Self>().context("failed to load env variables into config struct")?;
        Ok(config)
    }
}

impl<T: DeserializeOwned> LoadFromEnv for T {}
