//! Live schedule source scraping the Royal Borough of Windsor and Maidenhead
//! bin collection forms.
//!
//! The council publishes no API. The postcode search page lists one table row
//! per property with a "Select this address" link carrying its UPRN, and the
//! property page renders upcoming collections inside a `widget-bin-collections`
//! element as `service | date` rows.

mod html;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use reqwest::{Client, RequestBuilder};

use bindicator_core::{
    clock::Clock,
    model::{
        AddressCandidate, BinKind, CollectionSchedule, Postcode, ScheduleRef, SourceKind, Uprn,
    },
    plugin::SourcePlugin,
    ports::{AddressPort, PortError, SchedulePort},
};

/// Bin collection form of the council.
pub const BASE_URL: &str = "https://forms.rbwm.gov.uk/bincollections";

const SCHEDULE_WIDGET: &str = "widget-bin-collections";
const DATE_FORMAT: &str = "%d %B %Y";
const SNIPPET_CHARS: usize = 240;

static ORDINAL_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})(?:st|nd|rd|th)\b").expect("ordinal pattern is valid")
});

static POSTCODE_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z]{1,2}\d{1,2}[A-Z]?)\s*(\d[ABD-HJLN-UW-Z]{2})\b")
        .expect("postcode pattern is valid")
});

/// Address search against the postcode form.
pub struct RbwmAddressPort {
    client: Client,
    base_url: String,
}

impl RbwmAddressPort {
    /// Create a new address port bound to the given HTTP client.
    #[must_use]
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AddressPort for RbwmAddressPort {
    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }

    async fn lookup_addresses(
        &self,
        postcode: &Postcode,
    ) -> Result<Vec<AddressCandidate>, PortError> {
        let req = self.client.get(&self.base_url).query(&[
            ("postcode", postcode.as_str()),
            ("submit", "Search for address"),
        ]);
        let (url, body) = fetch_html(req).await?;

        let addresses = parse_addresses(&body, postcode).inspect_err(|err| {
            tracing::warn!(%url, error = %err, snippet = %snippet(&body), "unexpected address page");
        })?;
        tracing::debug!(%postcode, %url, count = addresses.len(), "parsed address list");
        Ok(addresses)
    }
}

/// Schedule lookup against the property form.
pub struct RbwmSchedulePort {
    addresses: RbwmAddressPort,
    clock: Arc<dyn Clock>,
}

impl RbwmSchedulePort {
    /// Create a new schedule port bound to the given HTTP client.
    #[must_use]
    pub fn new(client: Client, base_url: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            addresses: RbwmAddressPort::new(client, base_url),
            clock,
        }
    }

    async fn schedule_for_uprn(
        &self,
        uprn: &Uprn,
        postcode: Option<&Postcode>,
    ) -> Result<CollectionSchedule, PortError> {
        let req = self
            .addresses
            .client
            .get(&self.addresses.base_url)
            .query(&[("uprn", uprn.as_str())]);
        let (url, body) = fetch_html(req).await?;

        let mut schedule = parse_schedule(&body, self.clock.today()).inspect_err(|err| {
            tracing::warn!(%url, error = %err, snippet = %snippet(&body), "unexpected schedule page");
        })?;
        if schedule.postcode.is_empty()
            && let Some(postcode) = postcode
        {
            schedule.postcode = postcode.to_string();
        }
        Ok(schedule)
    }
}

#[async_trait]
impl SchedulePort for RbwmSchedulePort {
    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }

    async fn lookup_schedule(
        &self,
        reference: &ScheduleRef,
    ) -> Result<CollectionSchedule, PortError> {
        match reference {
            ScheduleRef::Uprn(uprn) => self.schedule_for_uprn(uprn, None).await,
            // a postcode is one route; its first listed property stands in for all of them
            ScheduleRef::Postcode(postcode) => {
                let addresses = self.addresses.lookup_addresses(postcode).await?;
                let Some(first) = addresses.first() else {
                    return Err(PortError::NotFound(format!(
                        "no addresses listed for {postcode}"
                    )));
                };
                self.schedule_for_uprn(&first.uprn, Some(postcode)).await
            }
        }
    }
}

/// Build the plugin bundle for the council forms at `base_url`.
#[must_use]
pub fn plugin(client: Client, base_url: &str, clock: Arc<dyn Clock>) -> SourcePlugin {
    let address_port = Arc::new(RbwmAddressPort::new(client.clone(), base_url));
    let schedule_port = Arc::new(RbwmSchedulePort::new(client, base_url, clock));

    SourcePlugin::new(address_port, schedule_port)
}

/// Extract the selectable properties from a postcode search page.
///
/// Rows without a UPRN link are skipped. A page with no rows is an empty
/// list only while it still carries the postcode search form.
///
/// # Errors
///
/// Returns [`PortError::ParseFailure`] when the page has neither address rows
/// nor the search form, which means the layout has changed.
pub fn parse_addresses(
    body: &str,
    postcode: &Postcode,
) -> Result<Vec<AddressCandidate>, PortError> {
    let mut seen = BTreeSet::new();
    let mut addresses = Vec::new();

    for row in html::tag_blocks(body, "tr") {
        let Some(uprn) = html::attr_values(row, "href")
            .iter()
            .find_map(|href| uprn_from_href(href))
        else {
            continue;
        };
        if !seen.insert(uprn.clone()) {
            continue;
        }

        let address = html::tag_blocks(row, "td")
            .first()
            .map(|cell| html::inner_text(cell))
            .filter(|text| !text.is_empty() && !text.eq_ignore_ascii_case("select this address"))
            .unwrap_or_else(|| uprn.clone());

        addresses.push(AddressCandidate {
            uprn: Uprn(uprn),
            address,
            postcode: postcode.clone(),
        });
    }

    if addresses.is_empty() && !has_postcode_form(body) {
        return Err(PortError::ParseFailure("address results table not found".into()));
    }
    Ok(addresses)
}

fn has_postcode_form(body: &str) -> bool {
    html::tag_blocks(body, "form").iter().any(|form| {
        html::attr_values(form, "name")
            .iter()
            .any(|name| name.eq_ignore_ascii_case("postcode"))
    })
}

/// Extract the next collection from a property page.
///
/// Picks the earliest date on or after `today`, falling back to the earliest
/// listed date when everything is in the past.
///
/// # Errors
///
/// Returns [`PortError::ParseFailure`] when the schedule widget is missing or
/// holds no readable dates.
pub fn parse_schedule(body: &str, today: NaiveDate) -> Result<CollectionSchedule, PortError> {
    let widget = html::class_region(body, SCHEDULE_WIDGET)
        .ok_or_else(|| PortError::ParseFailure("collection schedule widget not found".into()))?;

    let mut services_by_date: BTreeMap<NaiveDate, Vec<String>> = BTreeMap::new();
    for row in html::tag_blocks(widget, "tr") {
        let cells = html::tag_blocks(row, "td");
        let [service, date, ..] = cells.as_slice() else {
            continue;
        };
        let Some(date) = parse_collection_date(&html::inner_text(date)) else {
            continue;
        };
        services_by_date
            .entry(date)
            .or_default()
            .push(html::inner_text(service));
    }

    let (next_collection_date, services) = services_by_date
        .range(today..)
        .next()
        .or_else(|| services_by_date.iter().next())
        .ok_or_else(|| PortError::ParseFailure("no collection dates in schedule table".into()))?;

    let postcode = POSTCODE_IN_TEXT
        .captures(&html::inner_text(widget).to_ascii_uppercase())
        .and_then(|captures| {
            let outward = captures.get(1)?.as_str();
            let inward = captures.get(2)?.as_str();
            Postcode::parse(&format!("{outward}{inward}")).ok()
        })
        .map(|postcode| postcode.to_string())
        .unwrap_or_default();

    Ok(CollectionSchedule {
        postcode,
        next_collection_date: *next_collection_date,
        bins: bins_for(services),
    })
}

/// Recycling goes out every week; the alternating bin depends on the services listed.
fn bins_for(services: &[String]) -> BTreeSet<BinKind> {
    let mentions = |word: &str| {
        services
            .iter()
            .any(|service| service.to_ascii_lowercase().contains(word))
    };

    let companion = if mentions("refuse") {
        BinKind::Refuse
    } else if mentions("garden") {
        BinKind::Garden
    } else {
        BinKind::Refuse
    };
    BTreeSet::from([BinKind::Recycling, companion])
}

fn parse_collection_date(text: &str) -> Option<NaiveDate> {
    let plain = ORDINAL_SUFFIX.replace_all(text.trim(), "$1");
    NaiveDate::parse_from_str(&plain, DATE_FORMAT)
        .ok()
        // some rows lead with the weekday, e.g. "Tuesday 15th October 2024"
        .or_else(|| {
            let (_weekday, rest) = plain.split_once(' ')?;
            NaiveDate::parse_from_str(rest, DATE_FORMAT).ok()
        })
}

fn uprn_from_href(href: &str) -> Option<String> {
    let (_, rest) = href.split_once("uprn=")?;
    let uprn: String = rest
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric())
        .collect();
    (!uprn.is_empty()).then_some(uprn)
}

async fn fetch_html(req: RequestBuilder) -> Result<(String, String), PortError> {
    let resp = req.send().await?.error_for_status()?;
    let url = resp.url().to_string();
    let body = resp.text().await?;
    Ok((url, body))
}

fn snippet(body: &str) -> String {
    body.chars().take(SNIPPET_CHARS).collect()
}
