use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

const VALUE_MAX: i64 = 100;
const ALERT_THRESHOLD: i64 = 80;

// Bounding box around Hangzhou for simulated device positions
const LNG_MIN: f64 = 119.9;
const LNG_SPAN: f64 = 0.6;
const LAT_MIN: f64 = 30.1;
const LAT_SPAN: f64 = 0.4;

/// One telemetry reading as published to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub info: String,
    pub value: i64,
    pub alert: bool,
    pub lng: f64,
    pub lat: f64,
    pub time: i64,
}

impl Message {
    /// Builds a randomized reading for one device. Values above the alert
    /// threshold are flagged.
    pub fn generate(
        rng: &mut impl Rng,
        user_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let value = rng.gen_range(0..VALUE_MAX);
        Self {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            info: format!("Device Data {}", now.format("%Y/%m/%d %H:%M:%S")),
            value,
            alert: value > ALERT_THRESHOLD,
            lng: LNG_MIN + rng.gen::<f64>() * LNG_SPAN,
            lat: LAT_MIN + rng.gen::<f64>() * LAT_SPAN,
            time: now.timestamp_millis(),
        }
    }
}
