//! Conversion of feed messages into timestamped metric values.

use std::collections::HashMap;
use std::sync::Arc;

use weatherflow_common::{DeviceId, Message, RapidWindRecord, StRecord};

use crate::catalog::{Measurement, MetricCatalog, MetricDefinition};

/// One observed value for one metric of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValue {
    /// The metric this value belongs to.
    pub definition: Arc<MetricDefinition>,
    pub value: f64,
    /// Values for `definition.label_names`, in the same order.
    pub label_values: Vec<String>,
    /// Observation time (Unix epoch milliseconds) from the source message.
    pub timestamp_ms: i64,
}

impl MetricValue {
    pub fn measurement(&self) -> Measurement {
        self.definition.measurement
    }
}

/// Latest value of every metric observed so far for one device.
///
/// Metrics never observed are absent rather than zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    values: HashMap<Measurement, MetricValue>,
}

impl Snapshot {
    /// Replace each entry wholesale with the given values.
    pub fn apply(&mut self, values: impl IntoIterator<Item = MetricValue>) {
        for value in values {
            self.values.insert(value.measurement(), value);
        }
    }

    pub fn get(&self, measurement: Measurement) -> Option<&MetricValue> {
        self.values.get(&measurement)
    }

    pub fn contains(&self, measurement: Measurement) -> bool {
        self.values.contains_key(&measurement)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Stateless translation of feed messages into metric values.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    catalog: Arc<MetricCatalog>,
}

impl SnapshotBuilder {
    pub fn new(catalog: Arc<MetricCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<MetricCatalog> {
        &self.catalog
    }

    /// Compute the metric values carried by a message.
    ///
    /// Only `obs_st` and `rapid_wind` carry metrics; every other message, and
    /// an `obs_st` without records, yields nothing. All values of a message
    /// share the timestamp of its observation epoch.
    pub fn build(&self, message: &Message) -> Vec<MetricValue> {
        match message {
            Message::ObsSt(obs) => match obs.latest() {
                Some(record) => self.build_observation(obs.device_id, record),
                None => Vec::new(),
            },
            Message::RapidWind(rw) => self.build_rapid_wind(rw.device_id, &rw.ob),
            _ => Vec::new(),
        }
    }

    fn build_observation(&self, device_id: DeviceId, record: &StRecord) -> Vec<MetricValue> {
        let mut batch = Batch::new(&self.catalog, device_id, record.time_epoch);

        batch.push(Measurement::WindLull, record.wind_lull);
        batch.push(Measurement::WindAvg, record.wind_avg);
        batch.push(Measurement::WindGust, record.wind_gust);
        batch.push(Measurement::WindDirectionAvg, record.wind_direction);
        batch.push(Measurement::WindSampleInterval, record.wind_sample_interval);
        batch.push(Measurement::StationPressure, record.station_pressure);
        if let Some(temperature) = record.air_temperature {
            batch.push(Measurement::AirTemperature, temperature);
        }
        if let Some(humidity) = record.relative_humidity {
            batch.push(Measurement::RelativeHumidity, humidity);
        }
        batch.push(Measurement::Illuminance, record.illuminance);
        batch.push(Measurement::Uv, record.uv);
        batch.push(Measurement::SolarRadiation, record.solar_radiation);
        batch.push(Measurement::RainAccumulated, record.rain_accumulated);
        batch.push(Measurement::PrecipitationType, record.precipitation_type);
        batch.push(Measurement::LightningStrikeAvgDistance, record.lightning_strike_avg_distance);
        batch.push(Measurement::LightningStrikeCount, record.lightning_strike_count);
        batch.push(Measurement::Battery, record.battery);
        batch.push(Measurement::ReportInterval, record.report_interval);
        batch.push(Measurement::LocalDailyRainAccumulation, record.local_daily_rain_accumulation);
        batch.push(Measurement::RainAccumulatedFinal, record.rain_accumulated_final);
        batch.push(
            Measurement::LocalDailyRainAccumulationFinal,
            record.local_daily_rain_accumulation_final,
        );
        batch.push(Measurement::PrecipitationAnalysisType, record.precipitation_analysis_type);

        batch.finish()
    }

    fn build_rapid_wind(&self, device_id: DeviceId, record: &RapidWindRecord) -> Vec<MetricValue> {
        let mut batch = Batch::new(&self.catalog, device_id, record.time_epoch);

        batch.push(Measurement::WindSpeed, record.wind_speed);
        batch.push(Measurement::WindDirection, record.wind_direction);

        batch.finish()
    }
}

/// Values sharing one device label and one timestamp.
struct Batch<'a> {
    catalog: &'a MetricCatalog,
    device_label: String,
    timestamp_ms: i64,
    values: Vec<MetricValue>,
}

impl<'a> Batch<'a> {
    fn new(catalog: &'a MetricCatalog, device_id: DeviceId, epoch_secs: i64) -> Self {
        Self {
            catalog,
            device_label: device_id.to_string(),
            timestamp_ms: epoch_secs.saturating_mul(1000),
            values: Vec::with_capacity(catalog.len()),
        }
    }

    fn push(&mut self, measurement: Measurement, value: f64) {
        self.values.push(MetricValue {
            definition: self.catalog.get(measurement).clone(),
            value,
            label_values: vec![self.device_label.clone()],
            timestamp_ms: self.timestamp_ms,
        });
    }

    fn finish(self) -> Vec<MetricValue> {
        self.values
    }
}
