//! Typed driver configuration and its persisted JSON form
//!
//! A calibration run writes the document out, later sessions read it back to come up with the same
//! settings. Every key must be present.

use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationModel;
use crate::registers::{
    AlertLatch, AlertPolarity, AlertSelection, AlertSource, Averaging, ConversionTime,
    DeviceConfiguration, InvalidSetting,
};

/// Default 7 bit I2C address with A0 and A1 tied to GND
pub const DEFAULT_ADDRESS: u8 = 0x40;

/// Settings mirrored into the Mask/Enable and Alert Limit registers
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct AlertConfiguration {
    pub sources: AlertSelection,
    pub polarity: AlertPolarity,
    pub latch: AlertLatch,
    /// Limit in the unit of the active alert function (A, V or W)
    pub limit: f32,
}

/// Everything needed to bring a session up in a known state
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Config {
    pub address: u8,
    /// Host I2C bus number the chip is attached to
    pub channel: u8,
    /// Host GPIO line wired to ALERT, if any
    pub alert_pin: Option<u8>,
    pub device: DeviceConfiguration,
    pub alert: AlertConfiguration,
    pub calibration: CalibrationModel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            channel: 1,
            alert_pin: None,
            device: DeviceConfiguration::default(),
            alert: AlertConfiguration::default(),
            calibration: CalibrationModel::default(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    /// Document is not valid JSON or lacks a key
    Json(serde_json_core::de::Error),
    /// Output buffer too small
    Serialize(serde_json_core::ser::Error),
    /// A value is outside of what the chip supports
    Invalid(&'static str),
}

impl From<serde_json_core::de::Error> for ConfigError {
    fn from(e: serde_json_core::de::Error) -> Self {
        ConfigError::Json(e)
    }
}

impl From<serde_json_core::ser::Error> for ConfigError {
    fn from(e: serde_json_core::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::Json(e) => write!(f, "Malformed configuration document: {}", e),
            ConfigError::Serialize(e) => write!(f, "Cannot write configuration document: {}", e),
            ConfigError::Invalid(key) => write!(f, "Invalid value for key {}", key),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Document {
    address: u8,
    channel: u8,
    // Required key, `null` when no ALERT line is wired
    #[serde(deserialize_with = "Option::deserialize")]
    alertpin: Option<u8>,
    avg: u16,
    vbusct: u16,
    ishct: u16,
    meascont: bool,
    measv: bool,
    measi: bool,
    alert: heapless::Vec<AlertSource, 6>,
    alertpol: u8,
    alertlatch: u8,
    alertlimit: f32,
    #[serde(rename = "Rdiv1")]
    rdiv1: f32,
    #[serde(rename = "Rvbus")]
    rvbus: f32,
    #[serde(rename = "Vt")]
    vt: f32,
}

fn invalid(key: &'static str) -> impl Fn(InvalidSetting) -> ConfigError {
    move |_| ConfigError::Invalid(key)
}

impl Config {
    /// Parse a persisted configuration document
    pub fn from_json(document: &[u8]) -> Result<Self, ConfigError> {
        let (doc, _): (Document, usize) = serde_json_core::from_slice(document)?;

        let sources = AlertSelection::collapse(&doc.alert);
        if doc.alertlimit != 0.0 && sources.function().is_none() {
            return Err(ConfigError::Invalid("alertlimit"));
        }
        if doc.rvbus.is_nan() || doc.rvbus <= 0.0 {
            return Err(ConfigError::Invalid("Rvbus"));
        }
        if doc.rdiv1.is_nan() || doc.rdiv1 < 0.0 {
            return Err(ConfigError::Invalid("Rdiv1"));
        }

        let config = Config {
            address: doc.address,
            channel: doc.channel,
            alert_pin: doc.alertpin,
            device: DeviceConfiguration {
                averaging: Averaging::try_from(doc.avg).map_err(invalid("avg"))?,
                bus_conversion_time: ConversionTime::try_from(doc.vbusct)
                    .map_err(invalid("vbusct"))?,
                shunt_conversion_time: ConversionTime::try_from(doc.ishct)
                    .map_err(invalid("ishct"))?,
                continuous: doc.meascont,
                measure_voltage: doc.measv,
                measure_current: doc.measi,
            },
            alert: AlertConfiguration {
                sources,
                polarity: AlertPolarity::try_from(doc.alertpol).map_err(invalid("alertpol"))?,
                latch: AlertLatch::try_from(doc.alertlatch).map_err(invalid("alertlatch"))?,
                limit: doc.alertlimit,
            },
            calibration: CalibrationModel {
                series_resistance: doc.rdiv1,
                bus_impedance: doc.rvbus,
                diode_offset: doc.vt,
            },
        };
        debug!("Loaded configuration for device at {:#x}", config.address);
        Ok(config)
    }

    /// Write the configuration document into `buffer`, returning the number of bytes used
    pub fn to_json(&self, buffer: &mut [u8]) -> Result<usize, ConfigError> {
        let mut alert = heapless::Vec::new();
        for source in self.alert.sources.sources() {
            // At most two sources, always fits
            let _ = alert.push(source);
        }
        let doc = Document {
            address: self.address,
            channel: self.channel,
            alertpin: self.alert_pin,
            avg: self.device.averaging.count(),
            vbusct: self.device.bus_conversion_time.micros(),
            ishct: self.device.shunt_conversion_time.micros(),
            meascont: self.device.continuous,
            measv: self.device.measure_voltage,
            measi: self.device.measure_current,
            alert,
            alertpol: self.alert.polarity as u8,
            alertlatch: self.alert.latch as u8,
            alertlimit: self.alert.limit,
            rdiv1: self.calibration.series_resistance,
            rvbus: self.calibration.bus_impedance,
            vt: self.calibration.diode_offset,
        };
        Ok(serde_json_core::to_slice(&doc, buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RIG: &str = r#"{
        "address": 64, "channel": 1, "alertpin": 13,
        "avg": 1024, "vbusct": 1100, "ishct": 140,
        "meascont": true, "measv": true, "measi": false,
        "alert": ["Conversion Ready"], "alertpol": 0, "alertlatch": 0, "alertlimit": 0.0,
        "Rdiv1": 220.0, "Rvbus": 211.8, "Vt": 0.1582257
    }"#;

    #[test]
    fn load_rig_document() {
        let config = Config::from_json(RIG.as_bytes()).unwrap();
        assert_eq!(config.address, 0x40);
        assert_eq!(config.alert_pin, Some(13));
        assert_eq!(config.device.averaging, Averaging::AVG1024);
        assert_eq!(config.device.shunt_conversion_time, ConversionTime::US140);
        assert!(!config.device.measure_current);
        assert!(config.alert.sources.conversion_ready());
        assert_eq!(config.alert.sources.function(), None);
        assert_eq!(config.calibration.bus_impedance, 211.8);
        assert_eq!(config.calibration.diode_offset, 0.1582257);
    }

    #[test]
    fn missing_key_is_fatal() {
        let doc = RIG.replace(r#""Vt": 0.1582257"#, r#""Vx": 0.1582257"#);
        assert!(matches!(
            Config::from_json(doc.as_bytes()),
            Err(ConfigError::Json(_))
        ));

        let doc = RIG.replace(r#""alertpin": 13,"#, "");
        assert!(matches!(
            Config::from_json(doc.as_bytes()),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn alert_pin_may_be_null() {
        let doc = RIG.replace(r#""alertpin": 13"#, r#""alertpin": null"#);
        assert_eq!(Config::from_json(doc.as_bytes()).unwrap().alert_pin, None);
    }

    #[test]
    fn values_outside_tables_are_rejected() {
        let doc = RIG.replace(r#""avg": 1024"#, r#""avg": 1000"#);
        assert!(matches!(
            Config::from_json(doc.as_bytes()),
            Err(ConfigError::Invalid("avg"))
        ));

        let doc = RIG.replace(r#""alertlatch": 0"#, r#""alertlatch": 2"#);
        assert!(matches!(
            Config::from_json(doc.as_bytes()),
            Err(ConfigError::Invalid("alertlatch"))
        ));

        let doc = RIG.replace("Conversion Ready", "Conversion Done");
        assert!(matches!(
            Config::from_json(doc.as_bytes()),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn alert_limit_needs_alert_function() {
        let doc = RIG.replace(r#""alertlimit": 0.0"#, r#""alertlimit": 1.5"#);
        assert!(matches!(
            Config::from_json(doc.as_bytes()),
            Err(ConfigError::Invalid("alertlimit"))
        ));

        let doc = doc.replace(
            r#"["Conversion Ready"]"#,
            r#"["Power Over Limit", "Over Current Limit"]"#,
        );
        let config = Config::from_json(doc.as_bytes()).unwrap();
        assert_eq!(
            config.alert.sources.function(),
            Some(AlertSource::OverCurrent)
        );
        assert_eq!(config.alert.limit, 1.5);
    }

    #[test]
    fn written_document_loads_back() {
        let mut config = Config::from_json(RIG.as_bytes()).unwrap();
        config.calibration.bus_impedance = 205.25;
        config.alert.latch = AlertLatch::Latched;

        let mut buffer = [0u8; 512];
        let len = config.to_json(&mut buffer).unwrap();
        assert_eq!(Config::from_json(&buffer[..len]).unwrap(), config);

        assert!(matches!(
            config.to_json(&mut buffer[..16]),
            Err(ConfigError::Serialize(_))
        ));
    }
}
