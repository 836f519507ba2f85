use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{error::ConfigurationError, schedule::FinishWindow};

pub const DEVICE_MARKER: &str = "dishwasher";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub host: String,
    pub key: String,
    #[serde(default)]
    pub iv: Option<String>,
}

pub fn select_device<'a>(
    devices: &'a [DeviceDescriptor],
    marker: &str,
) -> Result<&'a DeviceDescriptor, ConfigurationError> {
    devices
        .iter()
        .find(|device| device.name.contains(marker))
        .ok_or_else(|| ConfigurationError::NoMatchingDevice {
            marker: marker.to_string(),
        })
}

pub fn parse_devices(raw: &[u8]) -> Result<Vec<DeviceDescriptor>, ConfigurationError> {
    Ok(serde_json::from_slice(raw)?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub finish_times: Vec<String>,
    pub fallback_finish_time: String,
    pub fallback_duration_secs: u64,
    pub start_now_threshold_secs: u64,
    pub max_delay_secs: u64,
    pub price_padding_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            finish_times: vec!["06:00".to_string()],
            fallback_finish_time: "06:00".to_string(),
            fallback_duration_secs: 10_800,
            start_now_threshold_secs: 60,
            max_delay_secs: 86_400,
            price_padding_secs: 3_600,
        }
    }
}

impl SchedulerConfig {
    pub fn sanitize(&mut self) {
        self.fallback_duration_secs = self.fallback_duration_secs.clamp(600, 86_400);
        self.max_delay_secs = self.max_delay_secs.clamp(60, 86_400);
        self.start_now_threshold_secs = self.start_now_threshold_secs.min(self.max_delay_secs);
        self.price_padding_secs = self.price_padding_secs.min(86_400);
    }

    pub fn finish_window(&self) -> Result<FinishWindow, ConfigurationError> {
        let fallback = parse_time_of_day(&self.fallback_finish_time)?;
        FinishWindow::parse(&self.finish_times, fallback)
    }

    pub fn fallback_duration(&self) -> Duration {
        Duration::from_secs(self.fallback_duration_secs)
    }
}

pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ConfigurationError> {
    let trimmed = value.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|_| ConfigurationError::InvalidFinishTime {
            value: value.to_string(),
        })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionMapping {
    pub key: String,
    pub uid: u32,
}

impl OptionMapping {
    fn new(key: &str, uid: u32) -> Self {
        Self {
            key: key.to_string(),
            uid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    pub program_id: u32,
    pub mirrored_options: Vec<OptionMapping>,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        // UIDs come from the appliance feature map and differ between models.
        Self {
            program_id: 8227,
            mirrored_options: vec![
                OptionMapping::new("Dishcare.Dishwasher.Option.IntensivZone", 5124),
                OptionMapping::new("Dishcare.Dishwasher.Option.BrillianceDry", 5128),
                OptionMapping::new("Dishcare.Dishwasher.Option.VarioSpeedPlus", 5127),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub topic_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
            topic_prefix: "homeconnect".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceFeedConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            url: "https://api.awattar.de/v1/marketdata".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_secs: 10,
            max_delay_secs: 10,
            factor: 1.0,
        }
    }
}

impl BackoffPolicy {
    pub fn sanitize(&mut self) {
        self.initial_delay_secs = self.initial_delay_secs.max(1);
        self.max_delay_secs = self.max_delay_secs.max(self.initial_delay_secs);
        if !self.factor.is_finite() || self.factor < 1.0 {
            self.factor = 1.0;
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay_secs as f64 * self.factor.powi(exponent);
        let secs = if scaled.is_finite() {
            (scaled as u64).min(self.max_delay_secs)
        } else {
            self.max_delay_secs
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub timezone: String,
    pub scheduler: SchedulerConfig,
    pub program: ProgramConfig,
    pub mqtt: MqttConfig,
    pub price_feed: Option<PriceFeedConfig>,
    pub retry: BackoffPolicy,
    pub status_port: Option<u16>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timezone: "Europe/Berlin".to_string(),
            scheduler: SchedulerConfig::default(),
            program: ProgramConfig::default(),
            mqtt: MqttConfig::default(),
            price_feed: None,
            retry: BackoffPolicy::default(),
            status_port: None,
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.scheduler.sanitize();
        self.retry.sanitize();
    }

    pub fn tz(&self) -> Result<Tz, ConfigurationError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigurationError::InvalidTimezone {
                value: self.timezone.clone(),
            })
    }
}
