//! Address → jurisdiction resolution via the external geocoder.
//!
//! The geocoder is asked for geography layers (county FIPS, incorporated
//! place, districts); only the state abbreviation, county FIPS, and city
//! name are consumed. Resolution is deliberately unable to fail the
//! query pipeline: any error collapses to the federal-only scope
//! `["US"]`.

use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::citation::slugify;
use crate::config::GeocoderConfig;
use crate::error::{Error, Result};

/// Fields the retrieval pipeline consumes from a geocode hit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeocodedAddress {
    pub state: Option<String>,
    pub county_fips: Option<String>,
    pub city: Option<String>,
}

pub struct Geocoder {
    client: reqwest::Client,
    endpoint: String,
    timeout_secs: u64,
}

impl Geocoder {
    pub fn new(config: &GeocoderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build geocoder client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    /// Resolve an address to the jurisdiction list used for retrieval.
    /// Never errors: failures fall back to `["US"]`.
    pub async fn resolve_jurisdictions(&self, address: &str) -> Vec<String> {
        match self.lookup(address).await {
            Ok(geocoded) => jurisdictions_for(&geocoded),
            Err(e) => {
                warn!(error = %e, "geocoding failed; falling back to federal scope");
                vec!["US".to_string()]
            }
        }
    }

    async fn lookup(&self, address: &str) -> Result<GeocodedAddress> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("address", address),
                ("benchmark", "Public_AR_Current"),
                ("vintage", "Current_Current"),
                ("layers", "Counties,Incorporated Places"),
                ("format", "json"),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout {
                        service: "geocoder".to_string(),
                        seconds: self.timeout_secs,
                    }
                } else {
                    Error::Geocode(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Geocode(format!("HTTP {status}")));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::Geocode(format!("response parse failed: {e}")))?;
        parse_geocode_response(&value)
            .ok_or_else(|| Error::Geocode("no address match in response".to_string()))
    }
}

/// Pull state, county FIPS, and city out of a geocoder response.
pub fn parse_geocode_response(value: &Value) -> Option<GeocodedAddress> {
    let first_match = value
        .get("result")?
        .get("addressMatches")?
        .as_array()?
        .first()?;

    let state = first_match
        .pointer("/addressComponents/state")
        .and_then(|s| s.as_str())
        .map(|s| s.to_uppercase());

    let geographies = first_match.get("geographies");
    let county_fips = geographies
        .and_then(|g| g.get("Counties"))
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("GEOID"))
        .and_then(|g| g.as_str())
        .map(|g| g.to_string());
    let city = geographies
        .and_then(|g| g.get("Incorporated Places"))
        .and_then(|p| p.as_array())
        .and_then(|p| p.first())
        .and_then(|p| p.get("BASENAME").or_else(|| p.get("NAME")))
        .and_then(|n| n.as_str())
        .map(|n| n.to_string());

    Some(GeocodedAddress {
        state,
        county_fips,
        city,
    })
}

/// Compose the jurisdiction list: always `US`, then state, county
/// (`{state}-{fips}`), and municipality (`{state}-{slug}`) when known.
pub fn jurisdictions_for(geocoded: &GeocodedAddress) -> Vec<String> {
    let mut jurisdictions = vec!["US".to_string()];
    let Some(state) = geocoded.state.as_deref().filter(|s| !s.is_empty()) else {
        return jurisdictions;
    };
    jurisdictions.push(state.to_string());
    if let Some(fips) = geocoded.county_fips.as_deref().filter(|f| !f.is_empty()) {
        jurisdictions.push(format!("{state}-{fips}"));
    }
    if let Some(city) = geocoded.city.as_deref().filter(|c| !c.is_empty()) {
        jurisdictions.push(format!("{state}-{}", slugify(city)));
    }
    jurisdictions
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_match_yields_four_jurisdictions() {
        let geocoded = GeocodedAddress {
            state: Some("TX".into()),
            county_fips: Some("48201".into()),
            city: Some("Houston".into()),
        };
        assert_eq!(
            jurisdictions_for(&geocoded),
            vec!["US", "TX", "TX-48201", "TX-houston"]
        );
    }

    #[test]
    fn missing_pieces_shorten_the_list() {
        let state_only = GeocodedAddress {
            state: Some("TX".into()),
            ..Default::default()
        };
        assert_eq!(jurisdictions_for(&state_only), vec!["US", "TX"]);
        assert_eq!(jurisdictions_for(&GeocodedAddress::default()), vec!["US"]);
    }

    #[test]
    fn multi_word_city_slugs() {
        let geocoded = GeocodedAddress {
            state: Some("TX".into()),
            county_fips: None,
            city: Some("San Antonio".into()),
        };
        assert_eq!(jurisdictions_for(&geocoded), vec!["US", "TX", "TX-san-antonio"]);
    }

    #[test]
    fn parses_census_style_response() {
        let body = json!({
            "result": {
                "addressMatches": [{
                    "addressComponents": { "state": "TX" },
                    "geographies": {
                        "Counties": [{ "GEOID": "48201", "NAME": "Harris County" }],
                        "Incorporated Places": [{ "BASENAME": "Houston" }],
                        "118th Congressional Districts": [{ "GEOID": "4818" }]
                    }
                }]
            }
        });
        let geocoded = parse_geocode_response(&body).unwrap();
        assert_eq!(geocoded.state.as_deref(), Some("TX"));
        assert_eq!(geocoded.county_fips.as_deref(), Some("48201"));
        assert_eq!(geocoded.city.as_deref(), Some("Houston"));
    }

    #[test]
    fn empty_matches_is_none() {
        let body = json!({ "result": { "addressMatches": [] } });
        assert!(parse_geocode_response(&body).is_none());
    }
}
