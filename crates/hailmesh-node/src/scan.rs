//! Batch scan tool.
//!
//! Input is one entry per line: `lat,lon,id` registers a taxi, `lat,lon`
//! runs a search. Blank lines and lines starting with `#` are skipped.
//! Every taxi is registered before the first search runs and deleted again
//! once the searches are done.

use hailmesh_geo::GeoPoint;
use hailmesh_transfer::Endpoint;
use hailmesh_wire::TaxiRecord;
use serde::Serialize;
use tracing::info;

use crate::client::DirectoryClient;
use crate::config::NodeConfig;
use crate::error::{Error, Result};

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanLine {
    Taxi(TaxiRecord),
    Search(GeoPoint),
}

/// Matches for one search, printed as a JSON line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchReport {
    pub latitude: f64,
    pub longitude: f64,
    pub matches: Vec<ScanMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanMatch {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&TaxiRecord> for ScanMatch {
    fn from(record: &TaxiRecord) -> Self {
        Self {
            id: record.id.to_string(),
            latitude: record.location.latitude,
            longitude: record.location.longitude,
        }
    }
}

pub fn parse_scan(text: &str) -> Result<Vec<ScanLine>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| parse_line(line.trim()).map_err(|e| Error::InvalidInput(format!("line {}: {e}", n + 1))))
        .collect()
}

fn parse_line(line: &str) -> std::result::Result<ScanLine, String> {
    let mut fields = line.splitn(3, ',').map(str::trim);
    let latitude = parse_coordinate(fields.next(), "latitude")?;
    let longitude = parse_coordinate(fields.next(), "longitude")?;

    match fields.next() {
        Some("") => Err("empty taxi id".to_string()),
        Some(id) => Ok(ScanLine::Taxi(TaxiRecord::new(id, latitude, longitude))),
        None => Ok(ScanLine::Search(GeoPoint::new(latitude, longitude))),
    }
}

fn parse_coordinate(field: Option<&str>, name: &str) -> std::result::Result<f64, String> {
    let raw = field.ok_or_else(|| format!("missing {name}"))?;
    let value: f64 = raw.parse().map_err(|e| format!("bad {name} {raw:?}: {e}"))?;
    if !value.is_finite() {
        return Err(format!("{name} is not finite"));
    }
    Ok(value)
}

/// Register the taxis, run the searches, then delete the taxis again.
pub async fn run_scan(config: &NodeConfig, lines: &[ScanLine]) -> Result<Vec<SearchReport>> {
    let endpoint = Endpoint::bind(config.local_transport()).await?;
    let client = DirectoryClient::new(endpoint, config.directory_addr, config.fetch_timeout);

    let taxis: Vec<&TaxiRecord> = lines
        .iter()
        .filter_map(|line| match line {
            ScanLine::Taxi(record) => Some(record),
            ScanLine::Search(_) => None,
        })
        .collect();
    for taxi in &taxis {
        client.update_location(taxi).await?;
    }
    info!(taxis = taxis.len(), "scan taxis registered");

    let searches = searches(lines, &client).await;

    for taxi in &taxis {
        client.delete(taxi).await?;
    }
    searches
}

async fn searches(lines: &[ScanLine], client: &DirectoryClient) -> Result<Vec<SearchReport>> {
    let mut reports = Vec::new();
    for line in lines {
        let ScanLine::Search(point) = line else {
            continue;
        };
        let found = client.fetch_nearest(point.latitude, point.longitude).await?;
        reports.push(SearchReport {
            latitude: point.latitude,
            longitude: point.longitude,
            matches: found.iter().map(ScanMatch::from).collect(),
        });
    }
    Ok(reports)
}
