//! Per-mode emission factors and base speeds.
//!
//! CO₂ factors follow the ADEME-style per-passenger-km figures the network
//! around La Défense is usually modeled with; base speeds are door-to-door
//! urban averages, before congestion adjustment.

use super::TransportMode;

pub fn emission_factor_g_per_km(mode: TransportMode) -> f64 {
    match mode {
        TransportMode::Car => 120.0,
        TransportMode::Bus => 70.0,
        TransportMode::Metro => 4.0,
        TransportMode::Rer => 6.0,
        TransportMode::Tram => 3.0,
        TransportMode::Cycling => 0.0,
        TransportMode::Walking => 0.0,
    }
}

pub fn base_speed_kmh(mode: TransportMode) -> f64 {
    match mode {
        TransportMode::Car => 25.0,
        TransportMode::Bus => 15.0,
        TransportMode::Metro => 30.0,
        TransportMode::Rer => 30.0,
        TransportMode::Tram => 25.0,
        TransportMode::Cycling => 15.0,
        TransportMode::Walking => 5.0,
    }
}
