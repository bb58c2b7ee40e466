//! Bundle of ports that together make up one schedule source.

use std::sync::Arc;

use crate::model::SourceKind;
use crate::ports::{AddressPort, SchedulePort};

/// Collection of ports implementing a single source variant.
///
/// A deployment picks exactly one plugin at startup; the service never switches
/// between variants while running.
#[derive(Clone)]
pub struct SourcePlugin {
    /// Which variant the ports belong to.
    pub kind: SourceKind,
    /// Implementation for listing the addresses of a postcode.
    pub address_port: Arc<dyn AddressPort>,
    /// Implementation for fetching schedules.
    pub schedule_port: Arc<dyn SchedulePort>,
}

impl SourcePlugin {
    /// Bundle a pair of ports, taking the kind from the schedule port.
    #[must_use]
    pub fn new(address_port: Arc<dyn AddressPort>, schedule_port: Arc<dyn SchedulePort>) -> Self {
        Self {
            kind: schedule_port.kind(),
            address_port,
            schedule_port,
        }
    }
}
