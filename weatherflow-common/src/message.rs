//! Typed messages exchanged with the WeatherFlow WebSocket API.
//!
//! Inbound messages are tagged by their `type` field. Observation records are
//! positional JSON arrays in which any element may be `null`.

use serde::{Deserialize, Serialize};

/// Device identifier as used by the WeatherFlow API.
pub type DeviceId = i64;

/// Inbound message from the WeatherFlow feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Sent once after the WebSocket handshake.
    ConnectionOpened,

    /// Acknowledgement of a listen request.
    Ack {
        #[serde(default)]
        id: Option<String>,
    },

    /// Periodic full observation from a Tempest device.
    ObsSt(StObservation),

    /// High-frequency wind report.
    RapidWind(RapidWind),

    /// Lightning strike event.
    EvtStrike(StrikeEvent),

    /// Rain start event.
    EvtPrecip(PrecipEvent),

    /// Any message type this crate does not model.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Device the message refers to, if it carries one.
    pub fn device_id(&self) -> Option<DeviceId> {
        match self {
            Message::ObsSt(m) => Some(m.device_id),
            Message::RapidWind(m) => Some(m.device_id),
            Message::EvtStrike(m) => Some(m.device_id),
            Message::EvtPrecip(m) => Some(m.device_id),
            Message::ConnectionOpened | Message::Ack { .. } | Message::Unknown => None,
        }
    }

    /// The wire `type` of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ConnectionOpened => "connection_opened",
            Message::Ack { .. } => "ack",
            Message::ObsSt(_) => "obs_st",
            Message::RapidWind(_) => "rapid_wind",
            Message::EvtStrike(_) => "evt_strike",
            Message::EvtPrecip(_) => "evt_precip",
            Message::Unknown => "unknown",
        }
    }
}

/// `obs_st` message body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StObservation {
    pub device_id: DeviceId,
    #[serde(default)]
    pub obs: Vec<StRecord>,
}

impl StObservation {
    /// The record the exporter reports. The API sends exactly one per message.
    pub fn latest(&self) -> Option<&StRecord> {
        self.obs.first()
    }
}

/// One Tempest observation record.
///
/// Decoded from a 22-element array. Missing or `null` elements decode to zero,
/// except air temperature and relative humidity which stay `None` because some
/// firmware omits them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Vec<Option<f64>>")]
pub struct StRecord {
    /// Observation time, seconds since the Unix epoch.
    pub time_epoch: i64,
    /// m/s
    pub wind_lull: f64,
    /// m/s
    pub wind_avg: f64,
    /// m/s
    pub wind_gust: f64,
    /// Degrees.
    pub wind_direction: f64,
    /// Seconds.
    pub wind_sample_interval: f64,
    /// Millibars.
    pub station_pressure: f64,
    /// Degrees Celsius.
    pub air_temperature: Option<f64>,
    /// Percent.
    pub relative_humidity: Option<f64>,
    /// Lux.
    pub illuminance: f64,
    pub uv: f64,
    /// W/m^2
    pub solar_radiation: f64,
    /// Millimeters over the report interval.
    pub rain_accumulated: f64,
    /// 0 none, 1 rain, 2 hail.
    pub precipitation_type: f64,
    /// Kilometers.
    pub lightning_strike_avg_distance: f64,
    pub lightning_strike_count: f64,
    /// Volts.
    pub battery: f64,
    /// Minutes.
    pub report_interval: f64,
    /// Millimeters.
    pub local_daily_rain_accumulation: f64,
    /// Millimeters (Rain Check).
    pub rain_accumulated_final: f64,
    /// Millimeters (Rain Check).
    pub local_daily_rain_accumulation_final: f64,
    /// 0 none, 1 Rain Check display on, 2 Rain Check display off.
    pub precipitation_analysis_type: f64,
}

impl TryFrom<Vec<Option<f64>>> for StRecord {
    type Error = String;

    fn try_from(row: Vec<Option<f64>>) -> Result<Self, Self::Error> {
        let time_epoch = epoch(&row)?;
        let num = |idx: usize| field(&row, idx).unwrap_or_default();

        Ok(Self {
            time_epoch,
            wind_lull: num(1),
            wind_avg: num(2),
            wind_gust: num(3),
            wind_direction: num(4),
            wind_sample_interval: num(5),
            station_pressure: num(6),
            air_temperature: field(&row, 7),
            relative_humidity: field(&row, 8),
            illuminance: num(9),
            uv: num(10),
            solar_radiation: num(11),
            rain_accumulated: num(12),
            precipitation_type: num(13),
            lightning_strike_avg_distance: num(14),
            lightning_strike_count: num(15),
            battery: num(16),
            report_interval: num(17),
            local_daily_rain_accumulation: num(18),
            rain_accumulated_final: num(19),
            local_daily_rain_accumulation_final: num(20),
            precipitation_analysis_type: num(21),
        })
    }
}

/// `rapid_wind` message body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RapidWind {
    pub device_id: DeviceId,
    pub ob: RapidWindRecord,
}

/// Instantaneous wind sample, decoded from `[epoch, speed, direction]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Vec<Option<f64>>")]
pub struct RapidWindRecord {
    pub time_epoch: i64,
    /// m/s
    pub wind_speed: f64,
    /// Degrees.
    pub wind_direction: f64,
}

impl TryFrom<Vec<Option<f64>>> for RapidWindRecord {
    type Error = String;

    fn try_from(row: Vec<Option<f64>>) -> Result<Self, Self::Error> {
        Ok(Self {
            time_epoch: epoch(&row)?,
            wind_speed: field(&row, 1).unwrap_or_default(),
            wind_direction: field(&row, 2).unwrap_or_default(),
        })
    }
}

/// `evt_strike` message body: `[epoch, distance_km, energy]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StrikeEvent {
    pub device_id: DeviceId,
    #[serde(default)]
    pub evt: Vec<Option<f64>>,
}

/// `evt_precip` message body: `[epoch]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PrecipEvent {
    pub device_id: DeviceId,
    #[serde(default)]
    pub evt: Vec<Option<f64>>,
}

/// Outbound listen request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    ListenStart { device_id: DeviceId, id: String },
    ListenStop { device_id: DeviceId, id: String },
    ListenRapidStart { device_id: DeviceId, id: String },
    ListenRapidStop { device_id: DeviceId, id: String },
}

fn field(row: &[Option<f64>], idx: usize) -> Option<f64> {
    row.get(idx).copied().flatten()
}

fn epoch(row: &[Option<f64>]) -> Result<i64, String> {
    field(row, 0)
        .map(|e| e as i64)
        .ok_or_else(|| "observation record has no epoch".to_string())
}
