use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::task::ScrapeTask;

/// Currencies the rate pages can be switched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Currency {
    Eur,
    Usd,
    Gbp,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Currency::Eur => "EUR",
            Currency::Usd => "USD",
            Currency::Gbp => "GBP",
        };
        write!(f, "{code}")
    }
}

/// One raw price observation as it came off a rate card. Never persisted
/// directly; always folded into an [`Entry`] under a [`RateDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateRecord {
    pub is_member: bool,
    pub is_corporate: bool,
    pub rate_name: String,
    pub has_breakfast: bool,
    pub raw_price: String,
    pub currency: Currency,
}

/// Marker in the displayed rate name that flags a refundable rate.
const FREE_CANCELLATION_MARKER: &str = "Annulation gratuite";

/// Composite key classifying a price. Two scrape passes that see "the same
/// kind of rate" produce the same descriptor even when the site wording of
/// the rate name drifts, which is what makes passes comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateDescriptor {
    pub corporate: bool,
    pub member: bool,
    pub free_cancellation: bool,
    pub breakfast: bool,
    pub currency: Currency,
}

impl RateDescriptor {
    pub fn from_record(record: &RateRecord) -> Self {
        Self {
            corporate: record.is_corporate,
            member: record.is_member,
            free_cancellation: record.rate_name.contains(FREE_CANCELLATION_MARKER),
            breakfast: record.has_breakfast,
            currency: record.currency,
        }
    }
}

impl fmt::Display for RateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let breakfast = if self.breakfast {
            " avec petit déjeuner"
        } else {
            ""
        };
        if self.corporate {
            write!(f, "Tarif corporate (GOLD){breakfast} - {}", self.currency)
        } else {
            let prefix = if self.member {
                "REMISE MEMBRE"
            } else {
                "SANS REMISE"
            };
            let cancellation = if self.free_cancellation {
                "Annulation gratuite"
            } else {
                "Non remboursable"
            };
            write!(f, "{prefix} - {cancellation}{breakfast} - {}", self.currency)
        }
    }
}

/// Key of one persisted entry: (hotel, room, stay). Persisted as the
/// pipe-delimited string the partial dataset files use for their JSON keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    pub hotel: String,
    pub room: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub nights: u32,
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.hotel,
            self.room,
            self.check_in.format("%Y-%m-%d"),
            self.check_out.format("%Y-%m-%d"),
            self.nights
        )
    }
}

impl FromStr for EntryKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('|').collect();
        if parts.len() != 5 {
            anyhow::bail!("entry key {s:?} does not have 5 pipe-delimited fields");
        }
        Ok(EntryKey {
            hotel: parts[0].to_string(),
            room: parts[1].to_string(),
            check_in: NaiveDate::parse_from_str(parts[2], "%Y-%m-%d")?,
            check_out: NaiveDate::parse_from_str(parts[3], "%Y-%m-%d")?,
            nights: parts[4].parse()?,
        })
    }
}

impl Serialize for EntryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Timestamp format used by the partial dataset files.
pub mod timestamp_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(
        ts: &NaiveDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&ts.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<NaiveDateTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// The unit of persistence: every price observed for one (hotel, room, stay)
/// combination, keyed by rate descriptor. Field names are serialized with the
/// names the partial dataset files have always used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(rename = "Date_Scraping", with = "timestamp_format")]
    pub scraped_at: NaiveDateTime,
    #[serde(rename = "Hotel")]
    pub hotel: String,
    #[serde(rename = "Chaine")]
    pub chain: String,
    #[serde(rename = "Chambre")]
    pub room: String,
    #[serde(rename = "Entreprise_Cliente")]
    pub client_company: Option<String>,
    #[serde(rename = "Code_Corporate")]
    pub corporate_code: Option<String>,
    #[serde(rename = "Ville")]
    pub city: String,
    #[serde(rename = "Pays")]
    pub country: String,
    #[serde(rename = "Date_Arrivee")]
    pub arrival: NaiveDate,
    #[serde(rename = "Date_Depart")]
    pub departure: NaiveDate,
    #[serde(rename = "Nombre_Nuits")]
    pub nights: u32,
    #[serde(rename = "Tarifs")]
    pub rates: BTreeMap<String, String>,
}

impl Entry {
    pub fn new(hotel: &str, room: &str, task: &ScrapeTask, scraped_at: NaiveDateTime) -> Self {
        let chain = hotel.split_whitespace().next().unwrap_or("").to_string();
        Entry {
            scraped_at,
            hotel: hotel.to_string(),
            chain,
            room: room.to_string(),
            client_company: task.company_name().map(str::to_string),
            corporate_code: task.corporate_code().map(str::to_string),
            city: task.city.clone(),
            country: country_for_city(&task.city).unwrap_or_default().to_string(),
            arrival: task.check_in_date,
            departure: task.check_out_date(),
            nights: task.duration,
            rates: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> EntryKey {
        EntryKey {
            hotel: self.hotel.clone(),
            room: self.room.clone(),
            check_in: self.arrival,
            check_out: self.departure,
            nights: self.nights,
        }
    }

    /// Folds one observation into the rate map. The map is additive: a new
    /// descriptor is inserted, an already-seen descriptor takes the incoming
    /// price (the caller is by construction the newer sighting).
    pub fn apply_rate(&mut self, record: &RateRecord) {
        let descriptor = RateDescriptor::from_record(record);
        self.rates
            .insert(descriptor.to_string(), clean_price(&record.raw_price));
    }
}

/// A worker's accumulating view, and the shape of every dataset file on disk.
pub type Dataset = BTreeMap<EntryKey, Entry>;

/// Prices are kept as the site displayed them, minus the currency symbol.
pub fn clean_price(raw: &str) -> String {
    raw.replace('€', "").replace('$', "").trim().to_string()
}

pub fn country_for_city(city: &str) -> Option<&'static str> {
    let country = match city.to_lowercase().as_str() {
        "paris" => "France",
        "london" => "UK",
        "frankfurt" => "Germany",
        "milan" => "Italy",
        "tokyo" => "Japan",
        "shanghai" => "China",
        "singapore" => "Singapore",
        "seoul" => "South-Korea",
        "mumbai" => "India",
        "dubai" => "UAE",
        "sydney" => "Australia",
        "new york" => "USA",
        "chicago" => "USA",
        "los angeles" => "USA",
        "montreal" => "Canada",
        "sao paulo" => "Brazil",
        _ => return None,
    };
    Some(country)
}
