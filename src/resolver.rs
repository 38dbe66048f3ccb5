// Vehicle identity resolution for the X-trafik realtime feed.
//
// X-trafik vehicle IDs typically look like 9031021000444499:
// - 903102 = prefix
// - 1000   = company segment, empirically correlated with a line number
// - 444499 = the vehicle's individual ID
//
// The dataset lookups are authoritative; the company-segment and digit-group
// tiers are best-effort guesses kept from field analysis of the feed. The
// `source` tag tells consumers which tier produced the number so they can
// distrust the low-confidence ones.

use serde::Serialize;
use std::collections::HashMap;

use crate::gtfs::GtfsTables;

pub const UNKNOWN_LINE_NUMBER: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusNumberSource {
    DirectOverride,
    DatasetRoute,
    DatasetTrip,
    DatasetBlock,
    RouteIdLiteral,
    HeuristicCompanySegment,
    HeuristicDigits,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub line_number: String,
    pub source: BusNumberSource,
    pub route_color: Option<String>,
    pub route_text_color: Option<String>,
    pub route_long_name: Option<String>,
}

impl Resolution {
    fn bare(line_number: String, source: BusNumberSource) -> Resolution {
        Resolution {
            line_number,
            source,
            route_color: None,
            route_text_color: None,
            route_long_name: None,
        }
    }

    fn unresolved() -> Resolution {
        Resolution::bare(UNKNOWN_LINE_NUMBER.to_string(), BusNumberSource::Unresolved)
    }
}

/// The hand-maintained lookup tables, kept as data so they can be updated or
/// tested without touching the algorithm.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Vehicle IDs the upstream feed is known to mislabel.
    pub direct_overrides: HashMap<String, String>,
    /// Known company segments (chars 6..10 of a 16-char vehicle ID).
    pub company_segments: HashMap<String, String>,
}

impl Default for ResolverConfig {
    fn default() -> ResolverConfig {
        // This vehicle carries company segment 1000 but runs line 55.
        let direct_overrides = [("9031021000557753", "55")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let company_segments = [
            ("1000", "44"),
            ("1001", "27"),
            ("0005", "55"),
            ("1002", "1"),
            ("1003", "2"),
            ("1004", "3"),
            ("1005", "4"),
            ("1010", "10"),
            ("1011", "11"),
            ("1012", "12"),
            ("1015", "15"),
            ("1020", "20"),
            ("1030", "30"),
            ("1041", "41"),
            ("1042", "42"),
            ("1050", "50"),
            ("0051", "51"),
            ("0052", "52"),
            ("0054", "54"),
            ("0056", "56"),
            ("0057", "57"),
            ("0058", "58"),
            ("0059", "59"),
            ("0060", "60"),
            ("0061", "61"),
            ("0062", "62"),
            ("0063", "63"),
            ("0064", "64"),
            ("0065", "65"),
            ("0066", "66"),
            ("0067", "67"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        ResolverConfig {
            direct_overrides,
            company_segments,
        }
    }
}

pub struct BusNumberResolver {
    config: ResolverConfig,
}

impl BusNumberResolver {
    pub fn new(config: ResolverConfig) -> BusNumberResolver {
        BusNumberResolver { config }
    }

    /// Maps one feed entity to a line number. Pure with respect to the given
    /// table snapshot; never fails, worst case returns the unresolved
    /// sentinel. First matching tier wins.
    pub fn resolve(
        &self,
        tables: &GtfsTables,
        vehicle_id: &str,
        trip_id: Option<&str>,
        route_id: Option<&str>,
        block_id: Option<&str>,
    ) -> Resolution {
        if vehicle_id.is_empty() {
            return Resolution::unresolved();
        }

        if let Some(line) = self.config.direct_overrides.get(vehicle_id) {
            return Resolution::bare(line.clone(), BusNumberSource::DirectOverride);
        }

        if let Some(rid) = route_id {
            if let Some(resolution) = dataset_lookup(tables, rid, BusNumberSource::DatasetRoute) {
                return resolution;
            }
        }

        if let Some(rid) = trip_id.and_then(|tid| tables.trip_to_route.get(tid)) {
            if let Some(resolution) = dataset_lookup(tables, rid, BusNumberSource::DatasetTrip) {
                return resolution;
            }
        }

        if let Some(rid) = block_id.and_then(|bid| tables.block_to_route.get(bid)) {
            if let Some(resolution) = dataset_lookup(tables, rid, BusNumberSource::DatasetBlock) {
                return resolution;
            }
        }

        if let Some(rid) = route_id {
            if is_bare_line_number(rid) {
                return Resolution::bare(rid.to_string(), BusNumberSource::RouteIdLiteral);
            }
        }

        if let Some(resolution) = self.company_segment_lookup(vehicle_id) {
            return resolution;
        }

        if let Some(line) = first_digit_group(vehicle_id) {
            return Resolution::bare(line, BusNumberSource::HeuristicDigits);
        }

        Resolution::unresolved()
    }

    fn company_segment_lookup(&self, vehicle_id: &str) -> Option<Resolution> {
        if vehicle_id.len() != 16 {
            return None;
        }
        let segment = vehicle_id.get(6..10)?;

        if let Some(line) = self.config.company_segments.get(segment) {
            return Some(Resolution::bare(
                line.clone(),
                BusNumberSource::HeuristicCompanySegment,
            ));
        }

        // Segments like 0055 encode the line number in their trailing digits.
        if let Some(trailing) = segment.strip_prefix("00") {
            if trailing.len() == 2 && trailing.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(n) = trailing.parse::<u32>() {
                    if n > 0 {
                        return Some(Resolution::bare(
                            n.to_string(),
                            BusNumberSource::HeuristicCompanySegment,
                        ));
                    }
                }
            }
        }
        None
    }
}

fn dataset_lookup(
    tables: &GtfsTables,
    route_id: &str,
    source: BusNumberSource,
) -> Option<Resolution> {
    let line = tables.routes.get(route_id)?;
    let info = tables.route_info.get(route_id);
    Some(Resolution {
        line_number: line.clone(),
        source,
        route_color: info.map(|i| format!("#{}", i.color)),
        route_text_color: info.map(|i| format!("#{}", i.text_color)),
        route_long_name: info
            .map(|i| i.long_name.clone())
            .filter(|name| !name.is_empty()),
    })
}

fn is_bare_line_number(route_id: &str) -> bool {
    !route_id.is_empty() && route_id.len() <= 3 && route_id.bytes().all(|b| b.is_ascii_digit())
}

/// Last-resort guess: the first 1-2 digit run in the ID whose value falls in
/// the plausible line-number range 1..=99.
fn first_digit_group(vehicle_id: &str) -> Option<String> {
    let bytes = vehicle_id.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let mut end = i + 1;
        if end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if let Ok(n) = vehicle_id[i..end].parse::<u32>() {
            if (1..=99).contains(&n) {
                return Some(n.to_string());
            }
        }
        i = end;
    }
    None
}
