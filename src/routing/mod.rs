//! Route catalog and scoring types.
//!
//! Candidate route *generation* is external: precomputed candidates arrive
//! as a JSON catalog keyed by origin/destination, each route carrying its
//! ordered legs with lengths. Scoring lives in [`scorer`], the per-mode
//! constants in [`emissions`].

pub mod emissions;
pub mod scorer;

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Car,
    Bus,
    Metro,
    Rer,
    Tram,
    Cycling,
    Walking,
}

impl TransportMode {
    pub const ALL: [TransportMode; 7] = [
        TransportMode::Car,
        TransportMode::Bus,
        TransportMode::Metro,
        TransportMode::Rer,
        TransportMode::Tram,
        TransportMode::Cycling,
        TransportMode::Walking,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Car => "car",
            TransportMode::Bus => "bus",
            TransportMode::Metro => "metro",
            TransportMode::Rer => "rer",
            TransportMode::Tram => "tram",
            TransportMode::Cycling => "cycling",
            TransportMode::Walking => "walking",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransportMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| EngineError::Config(format!("unknown transport mode {s:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteLeg {
    pub segment_id: String,
    pub length_km: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub mode: TransportMode,
    pub legs: Vec<RouteLeg>,
}

impl Route {
    pub fn total_length_km(&self) -> f64 {
        self.legs.iter().map(|l| l.length_km).sum()
    }
}

/// One scored route. The normalized parts are kept for explainability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteScore {
    pub route_id: String,
    pub mode: TransportMode,
    pub expected_travel_time_s: f64,
    pub expected_emission_g: f64,
    pub normalized_time: f64,
    pub normalized_emission: f64,
    pub composite_score: f64,
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnscorableRoute {
    pub route_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub origin: String,
    pub destination: String,
    pub issued_at: DateTime<Utc>,
    pub ranked: Vec<RouteScore>,
    pub unscorable: Vec<UnscorableRoute>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub origin: String,
    pub destination: String,
    pub routes: Vec<Route>,
}

/// Precomputed candidate routes per origin/destination pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteCatalog {
    pub entries: Vec<CatalogEntry>,
}

impl RouteCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let content = fs::read_to_string(path.as_ref())?;
        let catalog: RouteCatalog = serde_json::from_str(&content)?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), EngineError> {
        for entry in &self.entries {
            for route in &entry.routes {
                if route.legs.is_empty() {
                    return Err(EngineError::Config(format!(
                        "catalog route {:?} has no legs",
                        route.id
                    )));
                }
                if route.legs.iter().any(|l| l.length_km <= 0.0) {
                    return Err(EngineError::Config(format!(
                        "catalog route {:?} has a non-positive leg length",
                        route.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn candidates(&self, origin: &str, destination: &str) -> Option<&[Route]> {
        self.entries
            .iter()
            .find(|e| e.origin == origin && e.destination == destination)
            .map(|e| e.routes.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip() {
        for mode in TransportMode::ALL {
            assert_eq!(mode.as_str().parse::<TransportMode>().unwrap(), mode);
        }
        assert!("teleport".parse::<TransportMode>().is_err());
    }

    #[test]
    fn test_catalog_lookup_and_validation() {
        let catalog = RouteCatalog {
            entries: vec![CatalogEntry {
                origin: "esplanade".to_string(),
                destination: "grande-arche".to_string(),
                routes: vec![Route {
                    id: "r1".to_string(),
                    mode: TransportMode::Bus,
                    legs: vec![RouteLeg {
                        segment_id: "S1".to_string(),
                        length_km: 2.5,
                    }],
                }],
            }],
        };
        assert!(catalog.validate().is_ok());
        assert_eq!(
            catalog.candidates("esplanade", "grande-arche").map(<[Route]>::len),
            Some(1)
        );
        assert!(catalog.candidates("esplanade", "nowhere").is_none());

        let mut bad = catalog.clone();
        bad.entries[0].routes[0].legs[0].length_km = 0.0;
        assert!(matches!(bad.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_catalog_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        std::fs::write(
            &path,
            r#"{"entries": [{"origin": "a", "destination": "b", "routes": [
                 {"id": "r1", "mode": "metro",
                  "legs": [{"segment_id": "S1", "length_km": 1.2}]}]}]}"#,
        )
        .unwrap();

        let catalog = RouteCatalog::load(&path).unwrap();
        let routes = catalog.candidates("a", "b").unwrap();
        assert_eq!(routes[0].mode, TransportMode::Metro);
        assert!((routes[0].total_length_km() - 1.2).abs() < 1e-12);
    }
}
