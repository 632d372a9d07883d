//! Conversion between raw register counts and physical units
//!
//! The rig measures its bus voltage through a series resistor forming a divider with the chip's
//! VBUS input impedance, behind a rectifier diode. Voltages are corrected by
//!
//! `measured = raw * 1.25 mV / divider_factor + diode_offset`
//!
//! where `divider_factor = R_bus / (R_series + R_bus)`. Power is scaled by the divider only,
//! current needs no correction.

use crate::registers::AlertSource;

/// Current per bit of the current register, in A
pub const CURRENT_LSB: f32 = 1.25e-3;
/// Voltage per bit of the bus voltage register, in V
pub const VOLTAGE_LSB: f32 = 1.25e-3;
/// Power per bit of the power register, in W
pub const POWER_LSB: f32 = 10.0e-3;

/// A physical value does not map onto a 16 bit unsigned register count
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct OutOfRange;

/// Physical quantity an alert function compares against
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Unit {
    Current,
    Voltage,
    Power,
}

impl Unit {
    /// Unit of the alert limit when `source` is the active alert function
    pub fn of_alert(source: AlertSource) -> Option<Unit> {
        match source {
            AlertSource::ConversionReady => None,
            AlertSource::PowerOverLimit => Some(Unit::Power),
            AlertSource::BusUnderVoltage | AlertSource::BusOverVoltage => Some(Unit::Voltage),
            AlertSource::UnderCurrent | AlertSource::OverCurrent => Some(Unit::Current),
        }
    }
}

/// A register count together with the physical value it actually stands for
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Quantized {
    pub raw: u16,
    pub value: f32,
}

/// Voltage divider and diode model of the sense input
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct CalibrationModel {
    /// Series resistor in front of VBUS, in kΩ. Zero means no divider.
    pub series_resistance: f32,
    /// VBUS input impedance, in kΩ
    pub bus_impedance: f32,
    /// Forward voltage of the rectifier diode, in V
    pub diode_offset: f32,
}

impl Default for CalibrationModel {
    fn default() -> Self {
        Self {
            series_resistance: 0.0,
            bus_impedance: 380.0,
            diode_offset: 0.0,
        }
    }
}

impl CalibrationModel {
    /// `V_bus / V_measured`
    pub fn divider_factor(&self) -> f32 {
        self.bus_impedance / (self.series_resistance + self.bus_impedance)
    }

    pub fn raw_to_voltage(&self, raw: u16) -> f32 {
        f32::from(raw) * VOLTAGE_LSB / self.divider_factor() + self.diode_offset
    }

    pub fn raw_to_current(&self, raw: u16) -> f32 {
        f32::from(raw as i16) * CURRENT_LSB
    }

    pub fn raw_to_power(&self, raw: u16) -> f32 {
        f32::from(raw) * POWER_LSB / self.divider_factor()
    }

    /// Nearest bus voltage register count for a measured voltage
    pub fn voltage_to_raw(&self, volts: f32) -> Result<Quantized, OutOfRange> {
        let raw = to_register((volts - self.diode_offset) * self.divider_factor() / VOLTAGE_LSB)?;
        Ok(Quantized {
            raw,
            value: self.raw_to_voltage(raw),
        })
    }

    /// Nearest current register count; negative currents do not fit the alert limit register
    pub fn current_to_raw(&self, amps: f32) -> Result<Quantized, OutOfRange> {
        let raw = to_register(amps / CURRENT_LSB)?;
        Ok(Quantized {
            raw,
            value: f32::from(raw) * CURRENT_LSB,
        })
    }

    pub fn power_to_raw(&self, watts: f32) -> Result<Quantized, OutOfRange> {
        let raw = to_register(watts * self.divider_factor() / POWER_LSB)?;
        Ok(Quantized {
            raw,
            value: self.raw_to_power(raw),
        })
    }

    pub fn to_raw(&self, unit: Unit, value: f32) -> Result<Quantized, OutOfRange> {
        match unit {
            Unit::Current => self.current_to_raw(value),
            Unit::Voltage => self.voltage_to_raw(value),
            Unit::Power => self.power_to_raw(value),
        }
    }
}

fn to_register(counts: f32) -> Result<u16, OutOfRange> {
    cast::u16(libm::roundf(counts)).map_err(|_| OutOfRange)
}
