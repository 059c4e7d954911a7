//! Definitions of every metric the exporter can produce.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

/// Label attached to every device metric.
pub const DEVICE_LABEL: &str = "device_id";

/// Default metric name prefix.
pub const DEFAULT_PREFIX: &str = "weatherflow";

/// Catalog construction errors.
///
/// These indicate a programming or configuration error and are fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("missing metric definition for {0:?}")]
    MissingDefinition(Measurement),
    #[error("duplicate metric definition for {0:?}")]
    DuplicateDefinition(Measurement),
    #[error("duplicate metric name: {0}")]
    DuplicateName(String),
    #[error("invalid metric name: {0}")]
    InvalidName(String),
}

/// Every measurement dimension reported by a Tempest device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Measurement {
    WindLull,
    WindAvg,
    WindGust,
    WindDirectionAvg,
    WindSampleInterval,
    StationPressure,
    AirTemperature,
    RelativeHumidity,
    Illuminance,
    Uv,
    SolarRadiation,
    RainAccumulated,
    PrecipitationType,
    LightningStrikeAvgDistance,
    LightningStrikeCount,
    Battery,
    ReportInterval,
    LocalDailyRainAccumulation,
    RainAccumulatedFinal,
    LocalDailyRainAccumulationFinal,
    PrecipitationAnalysisType,
    // Rapid wind
    WindSpeed,
    WindDirection,
}

impl Measurement {
    /// All measurements, in exposition order.
    pub const ALL: [Measurement; 23] = [
        Measurement::WindLull,
        Measurement::WindAvg,
        Measurement::WindGust,
        Measurement::WindDirectionAvg,
        Measurement::WindSampleInterval,
        Measurement::StationPressure,
        Measurement::AirTemperature,
        Measurement::RelativeHumidity,
        Measurement::Illuminance,
        Measurement::Uv,
        Measurement::SolarRadiation,
        Measurement::RainAccumulated,
        Measurement::PrecipitationType,
        Measurement::LightningStrikeAvgDistance,
        Measurement::LightningStrikeCount,
        Measurement::Battery,
        Measurement::ReportInterval,
        Measurement::LocalDailyRainAccumulation,
        Measurement::RainAccumulatedFinal,
        Measurement::LocalDailyRainAccumulationFinal,
        Measurement::PrecipitationAnalysisType,
        Measurement::WindSpeed,
        Measurement::WindDirection,
    ];
}

/// Prometheus metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    /// Get the Prometheus type string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// Static description of one exported metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDefinition {
    pub measurement: Measurement,
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub label_names: Vec<String>,
}

/// A catalog entry before the prefix is applied.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub measurement: Measurement,
    pub suffix: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
}

const fn entry(
    measurement: Measurement,
    suffix: &'static str,
    help: &'static str,
    kind: MetricKind,
) -> CatalogEntry {
    CatalogEntry {
        measurement,
        suffix,
        help,
        kind,
    }
}

use Measurement as M;
use MetricKind::{Counter, Gauge};

/// Tempest metrics as documented by the WeatherFlow WebSocket API.
#[rustfmt::skip]
pub const STANDARD_ENTRIES: &[CatalogEntry] = &[
    entry(M::WindLull, "wind_lull", "Wind lull in meters per second (minimum 3 second sample)", Gauge),
    entry(M::WindAvg, "wind_avg", "Wind speed in meters per second (average over report interval)", Gauge),
    entry(M::WindGust, "wind_gust", "Wind gust in meters per second (maximum 3 second sample)", Gauge),
    entry(M::WindDirectionAvg, "wind_direction_avg", "Wind direction in degrees (average over report interval)", Gauge),
    entry(M::WindSampleInterval, "wind_sample_interval_seconds", "Wind sample interval in seconds", Gauge),
    entry(M::StationPressure, "station_pressure", "Station pressure in millibars", Gauge),
    entry(M::AirTemperature, "air_temperature", "Air temperature in degrees Celsius", Gauge),
    entry(M::RelativeHumidity, "relative_humidity", "Relative humidity in percent", Gauge),
    entry(M::Illuminance, "illuminance", "Illuminance in lux", Gauge),
    entry(M::Uv, "uv", "UV index", Gauge),
    entry(M::SolarRadiation, "solar_radiation", "Solar radiation in watts per square meter", Gauge),
    entry(M::RainAccumulated, "rain_accumulated", "Rain accumulated in millimeters", Counter),
    entry(M::PrecipitationType, "precipitation_type", "Precipitation type (0: none, 1: rain, 2: hail)", Gauge),
    entry(M::LightningStrikeAvgDistance, "lightning_strike_avg_distance", "Lightning strike average distance in kilometers", Gauge),
    entry(M::LightningStrikeCount, "lightning_strike_total", "Lightning strike count", Counter),
    entry(M::Battery, "battery_volts", "Battery in volts", Gauge),
    entry(M::ReportInterval, "report_interval_minutes", "Report interval in minutes", Gauge),
    entry(M::LocalDailyRainAccumulation, "local_daily_rain_total", "Local daily rain accumulation in millimeters", Counter),
    entry(M::RainAccumulatedFinal, "rain_final_total", "Rain accumulated final (Rain Check) in millimeters", Counter),
    entry(M::LocalDailyRainAccumulationFinal, "local_daily_rain_final_total", "Local daily rain accumulation final (Rain Check) in millimeters", Counter),
    entry(M::PrecipitationAnalysisType, "precipitation_analysis_type", "Precipitation analysis type (0: none, 1: Rain Check with user display on, 2: Rain Check with user display off)", Gauge),
    entry(M::WindSpeed, "wind_speed", "Wind speed in meters per second (instant)", Gauge),
    entry(M::WindDirection, "wind_direction", "Wind direction in degrees (instant)", Gauge),
];

/// Ordered, validated set of metric definitions.
///
/// Built once at startup and shared by the snapshot builder, collectors and
/// registries.
#[derive(Debug)]
pub struct MetricCatalog {
    definitions: Vec<Arc<MetricDefinition>>,
    by_measurement: HashMap<Measurement, usize>,
}

impl MetricCatalog {
    /// Build the standard Tempest catalog under `prefix`.
    pub fn standard(prefix: &str) -> Result<Self, CatalogError> {
        Self::from_entries(prefix, STANDARD_ENTRIES)
    }

    /// Build a catalog from explicit entries.
    ///
    /// Every [`Measurement`] must be defined exactly once and every resulting
    /// name must be a valid, unique Prometheus metric name.
    pub fn from_entries(prefix: &str, entries: &[CatalogEntry]) -> Result<Self, CatalogError> {
        let mut definitions = Vec::with_capacity(entries.len());
        let mut by_measurement = HashMap::with_capacity(entries.len());
        let mut names = HashSet::with_capacity(entries.len());

        for entry in entries {
            let name = if prefix.is_empty() {
                entry.suffix.to_string()
            } else {
                format!("{}_{}", prefix, entry.suffix)
            };

            if !is_valid_metric_name(&name) {
                return Err(CatalogError::InvalidName(name));
            }
            if !names.insert(name.clone()) {
                return Err(CatalogError::DuplicateName(name));
            }
            if by_measurement
                .insert(entry.measurement, definitions.len())
                .is_some()
            {
                return Err(CatalogError::DuplicateDefinition(entry.measurement));
            }

            definitions.push(Arc::new(MetricDefinition {
                measurement: entry.measurement,
                name,
                help: entry.help.to_string(),
                kind: entry.kind,
                label_names: vec![DEVICE_LABEL.to_string()],
            }));
        }

        if let Some(missing) = Measurement::ALL
            .iter()
            .find(|m| !by_measurement.contains_key(m))
        {
            return Err(CatalogError::MissingDefinition(*missing));
        }

        Ok(Self {
            definitions,
            by_measurement,
        })
    }

    /// Look up the definition of a measurement.
    pub fn get(&self, measurement: Measurement) -> &Arc<MetricDefinition> {
        // Construction guarantees every measurement is present.
        &self.definitions[self.by_measurement[&measurement]]
    }

    /// All definitions in exposition order.
    pub fn definitions(&self) -> &[Arc<MetricDefinition>] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Check a name against `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
