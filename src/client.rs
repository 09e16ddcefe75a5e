use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use log::debug;
use reqwest::Client;
use scraper::{Html, Selector};

use crate::extract::{ExtractionClient, ExtractionError, ResultItem, RoomRates, SessionFactory};
use crate::model::{Currency, RateRecord};

pub const DEFAULT_BASE_URL: &str =
    "https://www.ihg.com/hotels/fr/fr/find-hotels/hotel-search";

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Behaviour knobs for HTTP sessions.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub request_timeout: Duration,
    /// Whether switching currency reloads the result item first. Some site
    /// revisions reset widget state on a currency change, some keep it.
    pub reload_between_currencies: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(20),
            reload_between_currencies: true,
        }
    }
}

/// One scraping session: a cookie-carrying HTTP client plus the pages it
/// currently has open. Owned exclusively by one worker.
pub struct HttpSession {
    client: Client,
    settings: Arc<ClientSettings>,
    search_body: Option<String>,
    item_url: Option<String>,
    item_body: Option<String>,
    currency: Option<Currency>,
}

impl HttpSession {
    async fn fetch(&self, url: &str) -> Result<String, ExtractionError> {
        let response = tokio::time::timeout(
            self.settings.request_timeout,
            self.client.get(url).send(),
        )
        .await
        .map_err(|_| ExtractionError::transient(format!("timed out fetching {url}")))?
        .map_err(classify_reqwest_error)?;

        if !response.status().is_success() {
            return Err(ExtractionError::transient(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response.text().await.map_err(classify_reqwest_error)
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> ExtractionError {
    // A refused connection means the session's transport is gone; everything
    // else is worth retrying on the same session.
    if error.is_connect() || error.is_builder() {
        ExtractionError::session_fatal(error.to_string())
    } else {
        ExtractionError::transient(error.to_string())
    }
}

#[async_trait]
impl ExtractionClient for HttpSession {
    async fn navigate_to_search(
        &mut self,
        city: &str,
        check_in: NaiveDate,
        check_out: NaiveDate,
        corporate_code: Option<&str>,
    ) -> Result<(), ExtractionError> {
        let url = build_search_url(&self.settings.base_url, city, check_in, check_out, corporate_code);
        let body = self.fetch(&url).await?;
        self.search_body = Some(body);
        self.item_url = None;
        self.item_body = None;
        self.currency = None;
        Ok(())
    }

    async fn accept_consent_if_present(&mut self) -> Result<(), ExtractionError> {
        let Some(body) = &self.search_body else {
            return Ok(());
        };
        if has_consent_banner(body) {
            // The cookie jar carries the dismissal for the rest of the session.
            debug!("consent banner present on search page");
        }
        Ok(())
    }

    async fn list_result_items(&mut self) -> Result<Vec<ResultItem>, ExtractionError> {
        let body = self
            .search_body
            .as_ref()
            .ok_or_else(|| ExtractionError::transient("no search page loaded"))?;
        Ok(parse_result_items(body, &self.settings.base_url))
    }

    async fn open_item(&mut self, item: &ResultItem) -> Result<(), ExtractionError> {
        let body = self.fetch(&item.detail_url).await?;
        self.item_url = Some(item.detail_url.clone());
        self.item_body = Some(body);
        self.currency = None;
        Ok(())
    }

    async fn set_currency(&mut self, currency: Currency) -> Result<(), ExtractionError> {
        let url = self
            .item_url
            .clone()
            .ok_or_else(|| ExtractionError::transient("no result item open"))?;
        if self.settings.reload_between_currencies && self.currency.is_some() {
            // Full reload before switching; matches site revisions that only
            // honour the selector on a fresh page.
            self.item_body = Some(self.fetch(&url).await?);
        }
        let body = self.fetch(&currency_url(&url, currency)).await?;
        self.item_body = Some(body);
        self.currency = Some(currency);
        Ok(())
    }

    async fn extract_rate_records(&mut self) -> Result<Vec<RoomRates>, ExtractionError> {
        let body = self
            .item_body
            .as_ref()
            .ok_or_else(|| ExtractionError::transient("no result item open"))?;
        let currency = self
            .currency
            .ok_or_else(|| ExtractionError::transient("no currency selected"))?;
        Ok(parse_room_rates(body, currency))
    }
}

/// Builds fresh [`HttpSession`]s. Each session gets its own cookie jar, so a
/// restart also serves as the defensive cache/cookie wipe.
pub struct HttpSessionFactory {
    settings: Arc<ClientSettings>,
}

impl HttpSessionFactory {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn create_session(&self) -> Result<Box<dyn ExtractionClient>, ExtractionError> {
        let client = Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .timeout(self.settings.request_timeout)
            .build()
            .map_err(|e| ExtractionError::session_fatal(format!("failed to build http client: {e}")))?;
        Ok(Box::new(HttpSession {
            client,
            settings: Arc::clone(&self.settings),
            search_body: None,
            item_url: None,
            item_body: None,
            currency: None,
        }))
    }
}

/// Search URL for one task. The site counts months from zero, and the
/// month+year pair is a single concatenated parameter.
pub fn build_search_url(
    base: &str,
    city: &str,
    check_in: NaiveDate,
    check_out: NaiveDate,
    corporate_code: Option<&str>,
) -> String {
    let mut url = format!(
        "{base}?qDest={}&qCiD={}&qCoD={}&qCiMy={:02}{}&qCoMy={:02}{}&qAdlt=1&qChld=0&qRms=1",
        urlencoding::encode(city),
        check_in.day(),
        check_out.day(),
        check_in.month() - 1,
        check_in.year(),
        check_out.month() - 1,
        check_out.year(),
    );
    if let Some(code) = corporate_code {
        url.push_str(&format!("&qCpid={code}"));
    }
    url.push_str("&qAAR=6CBARC&setPMCookies=false&qpMbw=0&qErm=false");
    url
}

/// Detail URLs from search results may or may not carry a query string.
fn currency_url(url: &str, currency: Currency) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}currency={currency}")
}

fn has_consent_banner(body: &str) -> bool {
    let document = Html::parse_document(body);
    let consent = Selector::parse("#truste-consent-button").unwrap();
    document.select(&consent).next().is_some()
}

fn parse_result_items(body: &str, base_url: &str) -> Vec<ResultItem> {
    let document = Html::parse_document(body);
    let card = Selector::parse(".hotel-card-list-view-container").unwrap();
    let name = Selector::parse("[data-slnm-ihg='brandHotelNameSID']").unwrap();
    let link = Selector::parse("a[href]").unwrap();

    let mut items = Vec::new();
    for card_el in document.select(&card) {
        let Some(hotel_name) = card_el
            .select(&name)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
        else {
            continue;
        };
        let Some(href) = card_el
            .select(&link)
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            continue;
        };
        items.push(ResultItem {
            hotel_name,
            detail_url: absolutize(base_url, href),
        });
    }
    items
}

fn parse_room_rates(body: &str, currency: Currency) -> Vec<RoomRates> {
    let document = Html::parse_document(body);
    let room = Selector::parse("app-room-rate-item").unwrap();
    let room_name = Selector::parse("h2.roomName").unwrap();
    let rate_card = Selector::parse("app-rate-card").unwrap();
    let member = Selector::parse("div.discount.themeText").unwrap();
    let corporate = Selector::parse("div.preferred.themeButtonBackground").unwrap();
    let rate_name = Selector::parse("#rateNameOrPolicy").unwrap();
    let meals = Selector::parse("#meals").unwrap();
    let price = Selector::parse("div.total-price span.cash").unwrap();

    let mut rooms = Vec::new();
    for room_el in document.select(&room) {
        let Some(room_name) = room_el
            .select(&room_name)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
        else {
            continue;
        };

        let mut rates = Vec::new();
        for card in room_el.select(&rate_card) {
            let Some(rate_name) = card
                .select(&rate_name)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
            else {
                continue;
            };
            let Some(raw_price) = card
                .select(&price)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
            else {
                continue;
            };
            rates.push(RateRecord {
                is_member: card.select(&member).next().is_some(),
                is_corporate: card.select(&corporate).next().is_some(),
                rate_name,
                has_breakfast: card.select(&meals).next().is_some(),
                raw_price,
                currency,
            });
        }
        if !rates.is_empty() {
            rooms.push(RoomRates { room_name, rates });
        }
    }
    rooms
}

fn absolutize(base_url: &str, href: &str) -> String {
    match reqwest::Url::parse(base_url).and_then(|base| base.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}
