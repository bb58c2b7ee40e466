//! Offline schedule source that derives stable placeholder data from hashes.
//!
//! Schedules depend on the postcode and the current UTC day only, so every call
//! on the same day returns the same answer. Addresses depend on the postcode
//! alone. Property references handed out by this source encode their postcode,
//! which keeps every property on the postcode's single route.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use sha2::{Digest, Sha256};

use bindicator_core::{
    clock::Clock,
    model::{
        AddressCandidate, BinKind, CollectionSchedule, Postcode, ScheduleRef, SourceKind, Uprn,
    },
    plugin::SourcePlugin,
    ports::{AddressPort, PortError, SchedulePort},
};

const UPRN_PREFIX: &str = "mock-";
const TOWN: &str = "Maidenhead";
const STREETS: [&str; 8] = [
    "The Crescent",
    "Mill Lane",
    "Station Road",
    "Oak Close",
    "Church Street",
    "Meadow View",
    "Park Avenue",
    "Bridge Gardens",
];
const DAYS_AHEAD: u8 = 7;

/// Address lookup for the mock source.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockAddressPort;

#[async_trait]
impl AddressPort for MockAddressPort {
    fn kind(&self) -> SourceKind {
        SourceKind::Mock
    }

    async fn lookup_addresses(
        &self,
        postcode: &Postcode,
    ) -> Result<Vec<AddressCandidate>, PortError> {
        Ok(addresses_for(postcode))
    }
}

/// Schedule lookup for the mock source.
pub struct MockSchedulePort {
    clock: Arc<dyn Clock>,
}

impl MockSchedulePort {
    /// Create a schedule port reading "today" from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl SchedulePort for MockSchedulePort {
    fn kind(&self) -> SourceKind {
        SourceKind::Mock
    }

    async fn lookup_schedule(
        &self,
        reference: &ScheduleRef,
    ) -> Result<CollectionSchedule, PortError> {
        let today = self.clock.today();
        let schedule = match reference {
            ScheduleRef::Postcode(postcode) => {
                schedule_for(&compact(postcode), postcode.to_string(), today)
            }
            ScheduleRef::Uprn(uprn) => match postcode_of(uprn) {
                Some(postcode) => schedule_for(&compact(&postcode), postcode.to_string(), today),
                None => schedule_for(uprn.as_str(), String::new(), today),
            },
        };
        Ok(schedule)
    }
}

/// Build the plugin bundle for the mock source.
#[must_use]
pub fn plugin(clock: Arc<dyn Clock>) -> SourcePlugin {
    SourcePlugin::new(
        Arc::new(MockAddressPort),
        Arc::new(MockSchedulePort::new(clock)),
    )
}

fn digest(parts: &[&str]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hasher.finalize().into()
}

fn schedule_for(seed: &str, postcode: String, today: NaiveDate) -> CollectionSchedule {
    let day = today.to_string();
    let [offset, parity, ..] = digest(&[seed, &day]);

    let days_ahead = u64::from(1 + offset % DAYS_AHEAD);
    let companion = if parity % 2 == 0 {
        BinKind::Refuse
    } else {
        BinKind::Garden
    };

    CollectionSchedule {
        postcode,
        next_collection_date: today.checked_add_days(Days::new(days_ahead)).unwrap_or(today),
        bins: BTreeSet::from([BinKind::Recycling, companion]),
    }
}

fn addresses_for(postcode: &Postcode) -> Vec<AddressCandidate> {
    let compact = compact(postcode);
    let [count, street, first_number, named, ..] = digest(&[&compact]);

    let street = STREETS
        .get(usize::from(street) % STREETS.len())
        .copied()
        .unwrap_or("High Street");
    let first_number = u32::from(first_number % 20) + 1;

    let mut lines: Vec<String> = (0..u32::from(4 + count % 5))
        .map(|step| format!("{} {street}, {TOWN}, {postcode}", first_number + step * 2))
        .collect();
    if named % 3 == 0 {
        lines.push(format!("Rose Cottage, {street}, {TOWN}, {postcode}"));
    }

    lines
        .into_iter()
        .enumerate()
        .map(|(index, address)| AddressCandidate {
            uprn: Uprn(format!("{UPRN_PREFIX}{compact}-{index:02}")),
            address,
            postcode: postcode.clone(),
        })
        .collect()
}

fn compact(postcode: &Postcode) -> String {
    postcode.as_str().replace(' ', "")
}

/// Recover the postcode from a reference issued by [`MockAddressPort`].
fn postcode_of(uprn: &Uprn) -> Option<Postcode> {
    let rest = uprn.as_str().strip_prefix(UPRN_PREFIX)?;
    let (postcode, _index) = rest.rsplit_once('-')?;
    Postcode::parse(postcode).ok()
}
