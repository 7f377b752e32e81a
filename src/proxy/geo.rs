//! Geolocation of proxy addresses
//!
//! The broker only needs a country code per address, so lookups go through
//! the [`GeoLookup`] trait. [`GeoLocator`] implements it on top of an MMDB
//! database (GeoLite2 / GeoIP2 City or Country).

use crate::{Error, Result};
use maxminddb::{geoip2, Reader};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// Geographic location information for an IP address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GeoLocation {
    /// ISO 3166-1 alpha-2 country code (e.g., "US", "CN")
    pub country_code: Option<String>,
    /// Country name in English
    pub country_name: Option<String>,
    /// City name in English
    pub city_name: Option<String>,
}

impl GeoLocation {
    /// Create a new GeoLocation with country information
    pub fn with_country(country_code: Option<String>, country_name: Option<String>) -> Self {
        Self {
            country_code,
            country_name,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.country_code.is_none() && self.country_name.is_none() && self.city_name.is_none()
    }

    /// Whether the country code is one of `countries`; an empty list matches everything
    pub fn in_countries(&self, countries: &[String]) -> bool {
        if countries.is_empty() {
            return true;
        }
        match &self.country_code {
            Some(code) => countries.iter().any(|c| c.eq_ignore_ascii_case(code)),
            None => false,
        }
    }
}

impl std::fmt::Display for GeoLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.country_code, &self.city_name) {
            (Some(cc), Some(city)) => write!(f, "{}, {}", city, cc),
            (Some(cc), None) => write!(f, "{}", cc),
            (None, Some(city)) => write!(f, "{}", city),
            (None, None) => write!(f, "Unknown"),
        }
    }
}

/// Source of geolocation data for proxy addresses
pub trait GeoLookup: Send + Sync {
    /// Best-effort lookup; `None` when the address is unknown
    fn locate(&self, ip: IpAddr) -> Option<GeoLocation>;
}

/// GeoLocator for looking up IP addresses in MMDB databases
#[derive(Clone)]
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    /// Create a new GeoLocator from an MMDB file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path).map_err(|e| Error::geo(e.to_string()))?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// Look up the geolocation for an IpAddr
    pub fn lookup_ip(&self, ip: IpAddr) -> Result<GeoLocation> {
        let lookup_result = self
            .reader
            .lookup(ip)
            .map_err(|e| Error::geo(e.to_string()))?;

        let city: Option<geoip2::City> = lookup_result
            .decode()
            .map_err(|e| Error::geo(e.to_string()))?;

        let Some(city) = city else {
            return Ok(GeoLocation::default());
        };

        Ok(GeoLocation {
            country_code: city.country.iso_code.map(String::from),
            country_name: city.country.names.english.map(String::from),
            city_name: city.city.names.english.map(String::from),
        })
    }
}

impl GeoLookup for GeoLocator {
    fn locate(&self, ip: IpAddr) -> Option<GeoLocation> {
        match self.lookup_ip(ip) {
            Ok(location) if !location.is_empty() => Some(location),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("geo lookup for {} failed: {}", ip, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_location_default() {
        let loc = GeoLocation::default();
        assert!(loc.is_empty());
        assert_eq!(loc.to_string(), "Unknown");
    }

    #[test]
    fn test_geo_location_display() {
        let loc = GeoLocation::with_country(Some("US".to_string()), None);
        assert_eq!(loc.to_string(), "US");

        let mut loc = GeoLocation::with_country(Some("US".to_string()), None);
        loc.city_name = Some("New York".to_string());
        assert_eq!(loc.to_string(), "New York, US");
    }

    #[test]
    fn test_in_countries() {
        let loc = GeoLocation::with_country(Some("DE".to_string()), Some("Germany".to_string()));
        assert!(loc.in_countries(&[]));
        assert!(loc.in_countries(&["us".to_string(), "de".to_string()]));
        assert!(!loc.in_countries(&["FR".to_string()]));
        assert!(!GeoLocation::default().in_countries(&["DE".to_string()]));
    }

    #[test]
    fn test_missing_database() {
        assert!(GeoLocator::from_path("/nonexistent/GeoLite2-City.mmdb").is_err());
    }
}
