use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Human-readable location for a data-center code.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct LocationInfo {
    #[serde(default)]
    pub region: String,
    #[serde(default, rename = "cca2")]
    pub country_code: String,
    #[serde(default)]
    pub city: String,
}

/// Read-only lookup table keyed by upper-case data-center code.
pub type LocationMap = HashMap<String, LocationInfo>;

#[derive(Deserialize)]
struct LocationRecord {
    iata: String,
    #[serde(flatten)]
    info: LocationInfo,
}

/// Parse the published locations JSON: an array of objects carrying at least
/// `iata`, plus optional `region`, `cca2` and `city`. Extra fields are ignored.
pub fn parse_locations_str(s: &str) -> Result<LocationMap> {
    let records: Vec<LocationRecord> =
        serde_json::from_str(s).context("locations JSON is not an array of location objects")?;
    Ok(records
        .into_iter()
        .map(|r| (r.iata.trim().to_ascii_uppercase(), r.info))
        .collect())
}

pub fn load_locations_from_path(path: impl AsRef<Path>) -> Result<LocationMap> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read locations file: {}", path.as_ref().display()))?;
    parse_locations_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_published_format() {
        let input = r#"[
            {"iata":"LAX","lat":33.94,"lon":-118.4,"cca2":"US","region":"North America","city":"Los Angeles"},
            {"iata":"nrt","cca2":"JP","region":"Asia Pacific","city":"Tokyo"}
        ]"#;
        let map = parse_locations_str(input).unwrap();
        assert_eq!(map.len(), 2);
        let lax = &map["LAX"];
        assert_eq!(lax.city, "Los Angeles");
        assert_eq!(lax.country_code, "US");
        assert_eq!(map["NRT"].region, "Asia Pacific");
    }

    #[test]
    fn missing_optional_fields_default_empty() {
        let map = parse_locations_str(r#"[{"iata":"SJC"}]"#).unwrap();
        assert_eq!(map["SJC"], LocationInfo::default());
    }

    #[test]
    fn rejects_non_array() {
        assert!(parse_locations_str(r#"{"iata":"SJC"}"#).is_err());
    }
}
