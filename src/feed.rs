// Live vehicle positions: fetch the Samtrafiken GTFS-RT feed, decode it and
// annotate every entity with a resolved line number.

use gtfs_rt::FeedMessage;
use prost::Message;
use serde::Serialize;

use crate::error::{Result, TrackerError};
use crate::gtfs::GtfsTables;
use crate::resolver::{BusNumberResolver, BusNumberSource};

const VEHICLE_POSITIONS_URL: &str = "https://opendata.samtrafiken.se/gtfs-rt/xt/VehiclePositions.pb";
const REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_ROUTE_COLOR: &str = "#1c65b0";
const DEFAULT_ROUTE_TEXT_COLOR: &str = "#FFFFFF";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionInfo {
    pub latitude: f64,
    pub longitude: f64,
    pub bearing: Option<f32>,
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TripInfo {
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub start_time: Option<String>,
    pub start_date: Option<String>,
    pub direction_id: Option<u32>,
}

/// One annotated vehicle, as sent to the browser client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePayload {
    pub id: String,
    pub bus_number: String,
    pub bus_number_source: BusNumberSource,
    pub position: PositionInfo,
    pub timestamp: Option<i64>,
    pub route_id: Option<String>,
    pub trip: Option<TripInfo>,
    pub route_color: String,
    pub route_text_color: String,
    pub route_long_name: Option<String>,
}

pub fn fetch_vehicles(
    api_key: &str,
    resolver: &BusNumberResolver,
    tables: &GtfsTables,
) -> Result<Vec<VehiclePayload>> {
    let feed = fetch_feed(api_key)?;
    Ok(annotate_feed(feed, resolver, tables))
}

fn fetch_feed(api_key: &str) -> Result<FeedMessage> {
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|e| TrackerError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

    let response = client
        .get(format!("{}?key={}", VEHICLE_POSITIONS_URL, api_key))
        .header("Accept-Encoding", "gzip, deflate")
        .send()
        .map_err(|e| TrackerError::NetworkError(format!("Failed to fetch vehicle positions: {}", e)))?;

    if !response.status().is_success() {
        return Err(TrackerError::NetworkError(format!(
            "Vehicle feed responded with status: {}",
            response.status()
        )));
    }

    let body = response
        .bytes()
        .map_err(|e| TrackerError::NetworkError(format!("Failed to read vehicle feed: {}", e)))?;
    if body.is_empty() {
        return Err(TrackerError::NetworkError(
            "Vehicle feed returned an empty body".to_string(),
        ));
    }

    FeedMessage::decode(&*body)
        .map_err(|e| TrackerError::ParseError(format!("Failed to decode vehicle feed: {}", e)))
}

/// Resolves every positioned entity exactly once against the given snapshot.
/// Entities without a position are dropped.
pub fn annotate_feed(
    feed: FeedMessage,
    resolver: &BusNumberResolver,
    tables: &GtfsTables,
) -> Vec<VehiclePayload> {
    let mut vehicles = Vec::new();

    for entity in feed.entity {
        let Some(vehicle) = entity.vehicle else {
            continue;
        };
        let Some(position) = vehicle.position.as_ref() else {
            continue;
        };

        let vehicle_id = vehicle
            .vehicle
            .as_ref()
            .and_then(|v| v.id.clone())
            .unwrap_or_default();
        let trip = vehicle.trip.as_ref();

        let resolution = resolver.resolve(
            tables,
            &vehicle_id,
            trip.and_then(|t| t.trip_id.as_deref()),
            trip.and_then(|t| t.route_id.as_deref()),
            None, // the realtime TripDescriptor carries no block_id
        );

        vehicles.push(VehiclePayload {
            id: if vehicle_id.is_empty() {
                "unknown".to_string()
            } else {
                vehicle_id
            },
            bus_number: resolution.line_number,
            bus_number_source: resolution.source,
            position: PositionInfo {
                latitude: position.latitude as f64,
                longitude: position.longitude as f64,
                bearing: position.bearing,
                speed: position.speed,
            },
            timestamp: vehicle.timestamp.map(|ts| ts as i64),
            route_id: trip.and_then(|t| t.route_id.clone()),
            trip: trip.map(|t| TripInfo {
                trip_id: t.trip_id.clone(),
                route_id: t.route_id.clone(),
                start_time: t.start_time.clone(),
                start_date: t.start_date.clone(),
                direction_id: t.direction_id,
            }),
            route_color: resolution
                .route_color
                .unwrap_or_else(|| DEFAULT_ROUTE_COLOR.to_string()),
            route_text_color: resolution
                .route_text_color
                .unwrap_or_else(|| DEFAULT_ROUTE_TEXT_COLOR.to_string()),
            route_long_name: resolution.route_long_name,
        });
    }

    vehicles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolverConfig;
    use gtfs_rt::{FeedEntity, Position, TripDescriptor, VehicleDescriptor, VehiclePosition};

    fn entity(id: &str, vehicle_id: &str, route_id: Option<&str>, with_position: bool) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            vehicle: Some(VehiclePosition {
                trip: route_id.map(|rid| TripDescriptor {
                    route_id: Some(rid.to_string()),
                    ..Default::default()
                }),
                vehicle: Some(VehicleDescriptor {
                    id: Some(vehicle_id.to_string()),
                    ..Default::default()
                }),
                position: with_position.then(|| Position {
                    latitude: 60.67,
                    longitude: 17.14,
                    ..Default::default()
                }),
                timestamp: Some(1_700_000_000),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn feed(entities: Vec<FeedEntity>) -> FeedMessage {
        FeedMessage {
            entity: entities,
            ..Default::default()
        }
    }

    #[test]
    fn entities_without_position_are_dropped() {
        let resolver = BusNumberResolver::new(ResolverConfig::default());
        let tables = GtfsTables::default();
        let message = feed(vec![
            entity("1", "9031021000444499", None, true),
            entity("2", "9031021000444400", None, false),
        ]);

        let vehicles = annotate_feed(message, &resolver, &tables);
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].id, "9031021000444499");
    }

    #[test]
    fn resolution_and_defaults_are_merged_onto_the_payload() {
        let resolver = BusNumberResolver::new(ResolverConfig::default());
        let tables = GtfsTables::default();
        let message = feed(vec![entity("1", "9031021000444499", Some("no-match"), true)]);

        let vehicles = annotate_feed(message, &resolver, &tables);
        let v = &vehicles[0];
        assert_eq!(v.bus_number, "44");
        assert_eq!(v.bus_number_source, BusNumberSource::HeuristicCompanySegment);
        assert_eq!(v.route_color, DEFAULT_ROUTE_COLOR);
        assert_eq!(v.route_text_color, DEFAULT_ROUTE_TEXT_COLOR);
        assert_eq!(v.route_id.as_deref(), Some("no-match"));
        assert_eq!(v.timestamp, Some(1_700_000_000));
    }

    #[test]
    fn missing_vehicle_id_is_reported_as_unknown() {
        let resolver = BusNumberResolver::new(ResolverConfig::default());
        let tables = GtfsTables::default();
        let message = feed(vec![entity("1", "", None, true)]);

        let vehicles = annotate_feed(message, &resolver, &tables);
        assert_eq!(vehicles[0].id, "unknown");
        assert_eq!(vehicles[0].bus_number_source, BusNumberSource::Unresolved);
    }
}
