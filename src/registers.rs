//! Register map and bit fields of the INA260
//!
//! Every enumerated setting is stored on the wire as an index into a fixed table. The helpers in
//! here only pack and unpack those indices; all bus traffic happens in the driver.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Value of the manufacturer id register ("TI" in ASCII)
pub const MANUFACTURER_ID: u16 = 0x5449;

/// Upper 12 bits of the die id register
pub const DIE_ID: u16 = 0x227;

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Register {
    // Configuration Register
    CONFIG = 0x00,
    // Current through the shunt, two's complement
    CURRENT = 0x01,
    // Bus voltage measurement data
    VOLTAGE = 0x02,
    // Power calculated by the chip
    POWER = 0x03,
    // Alert configuration and status flags
    MASK_ENABLE = 0x06,
    // Limit compared against the selected alert function
    ALERT_LIMIT = 0x07,
    // Manufacturer identification
    MANUFACTURER_ID = 0xFE,
    // Die identification and revision
    DIE_ID = 0xFF,
}

impl From<Register> for u8 {
    fn from(r: Register) -> u8 {
        r as u8
    }
}

/// A group of adjacent bits inside a 16 bit register
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Field {
    shift: u8,
    width: u8,
}

impl Field {
    pub(crate) const fn new(shift: u8, width: u8) -> Self {
        Self { shift, width }
    }

    pub(crate) const fn mask(self) -> u16 {
        ((1u16 << self.width) - 1) << self.shift
    }

    /// Clear the field in `reg` and OR in `value` shifted to the field's base bit
    pub(crate) const fn insert(self, reg: u16, value: u16) -> u16 {
        (reg & !self.mask()) | ((value << self.shift) & self.mask())
    }

    pub(crate) const fn extract(self, reg: u16) -> u16 {
        (reg & self.mask()) >> self.shift
    }
}

// Configuration register
pub(crate) const RESET: Field = Field::new(15, 1);
pub(crate) const AVERAGING: Field = Field::new(9, 3);
pub(crate) const BUS_CONVERSION_TIME: Field = Field::new(6, 3);
pub(crate) const SHUNT_CONVERSION_TIME: Field = Field::new(3, 3);
pub(crate) const MODE_CONTINUOUS: Field = Field::new(2, 1);
pub(crate) const MODE_VOLTAGE: Field = Field::new(1, 1);
pub(crate) const MODE_CURRENT: Field = Field::new(0, 1);
/// Bits 14..12 are fixed to 0b110 by the chip
pub(crate) const CONFIG_FIXED_BITS: u16 = 0x6000;

// Mask/Enable register
pub(crate) const ALERT_SOURCES: Field = Field::new(10, 6);
pub(crate) const ALERT_POLARITY: Field = Field::new(1, 1);
pub(crate) const ALERT_LATCH: Field = Field::new(0, 1);

/// Returned when a value is not a member of the table a register field encodes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct InvalidSetting;

const AVERAGING_COUNTS: [u16; 8] = [1, 4, 16, 64, 128, 256, 512, 1024];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// Averaging Mode
/// Determines the number of samples that are collected and averaged.
pub enum Averaging {
    // No averaging (default)
    AVG1 = 0,
    AVG4 = 1,
    AVG16 = 2,
    AVG64 = 3,
    AVG128 = 4,
    AVG256 = 5,
    AVG512 = 6,
    AVG1024 = 7,
}

impl Averaging {
    const ALL: [Averaging; 8] = [
        Averaging::AVG1,
        Averaging::AVG4,
        Averaging::AVG16,
        Averaging::AVG64,
        Averaging::AVG128,
        Averaging::AVG256,
        Averaging::AVG512,
        Averaging::AVG1024,
    ];

    /// Position in the table, as written to the register
    #[inline(always)]
    pub fn index(self) -> u16 {
        self as u16
    }

    /// Number of samples averaged per conversion
    pub fn count(self) -> u16 {
        AVERAGING_COUNTS[self as usize]
    }

    pub(crate) fn from_index(index: u16) -> Self {
        Self::ALL[usize::from(index & 0b111)]
    }
}

impl TryFrom<u16> for Averaging {
    type Error = InvalidSetting;

    fn try_from(count: u16) -> Result<Self, Self::Error> {
        AVERAGING_COUNTS
            .iter()
            .position(|&c| c == count)
            .map(|i| Self::ALL[i])
            .ok_or(InvalidSetting)
    }
}

const CONVERSION_TIMES_US: [u16; 8] = [140, 204, 332, 588, 1100, 2116, 4156, 8244];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// Conversion time of one ADC sample, shared by the bus voltage and shunt current channels
pub enum ConversionTime {
    // Conversion time = 140 µs
    US140 = 0,
    // Conversion time = 204 µs
    US204 = 1,
    // Conversion time = 332 µs
    US332 = 2,
    // Conversion time = 588 µs
    US588 = 3,
    // Conversion time = 1.1 ms (default)
    MS1_1 = 4,
    // Conversion time = 2.116 ms
    MS2_116 = 5,
    // Conversion time = 4.156 ms
    MS4_156 = 6,
    // Conversion time = 8.244 ms
    MS8_244 = 7,
}

impl ConversionTime {
    const ALL: [ConversionTime; 8] = [
        ConversionTime::US140,
        ConversionTime::US204,
        ConversionTime::US332,
        ConversionTime::US588,
        ConversionTime::MS1_1,
        ConversionTime::MS2_116,
        ConversionTime::MS4_156,
        ConversionTime::MS8_244,
    ];

    #[inline(always)]
    pub fn index(self) -> u16 {
        self as u16
    }

    pub fn micros(self) -> u16 {
        CONVERSION_TIMES_US[self as usize]
    }

    pub(crate) fn from_index(index: u16) -> Self {
        Self::ALL[usize::from(index & 0b111)]
    }
}

impl TryFrom<u16> for ConversionTime {
    type Error = InvalidSetting;

    fn try_from(micros: u16) -> Result<Self, Self::Error> {
        CONVERSION_TIMES_US
            .iter()
            .position(|&t| t == micros)
            .map(|i| Self::ALL[i])
            .ok_or(InvalidSetting)
    }
}

/// ADC input whose conversion time is configured
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Channel {
    BusVoltage,
    ShuntCurrent,
}

impl Channel {
    pub(crate) fn field(self) -> Field {
        match self {
            Channel::BusVoltage => BUS_CONVERSION_TIME,
            Channel::ShuntCurrent => SHUNT_CONVERSION_TIME,
        }
    }
}

/// Events that can drive the ALERT pin
///
/// Everything except [`AlertSource::ConversionReady`] is an alert *function* compared against the
/// Alert Limit Register. Only one function can be active; the chip gives the highest bit
/// priority.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum AlertSource {
    #[serde(rename = "Conversion Ready")]
    ConversionReady = 10,
    #[serde(rename = "Power Over Limit")]
    PowerOverLimit = 11,
    #[serde(rename = "Bus Voltage Under Voltage")]
    BusUnderVoltage = 12,
    #[serde(rename = "Bus Voltage Over Voltage")]
    BusOverVoltage = 13,
    #[serde(rename = "Under Current Limit")]
    UnderCurrent = 14,
    #[serde(rename = "Over Current Limit")]
    OverCurrent = 15,
}

impl AlertSource {
    const ALL: [AlertSource; 6] = [
        AlertSource::ConversionReady,
        AlertSource::PowerOverLimit,
        AlertSource::BusUnderVoltage,
        AlertSource::BusOverVoltage,
        AlertSource::UnderCurrent,
        AlertSource::OverCurrent,
    ];

    /// Bit position inside the Mask/Enable register
    #[inline(always)]
    pub fn bit(self) -> u8 {
        self as u8
    }

    /// True for the sources compared against the alert limit
    pub fn is_function(self) -> bool {
        self != AlertSource::ConversionReady
    }

    pub fn name(self) -> &'static str {
        match self {
            AlertSource::ConversionReady => "Conversion Ready",
            AlertSource::PowerOverLimit => "Power Over Limit",
            AlertSource::BusUnderVoltage => "Bus Voltage Under Voltage",
            AlertSource::BusOverVoltage => "Bus Voltage Over Voltage",
            AlertSource::UnderCurrent => "Under Current Limit",
            AlertSource::OverCurrent => "Over Current Limit",
        }
    }
}

impl FromStr for AlertSource {
    type Err = InvalidSetting;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|source| source.name() == s)
            .ok_or(InvalidSetting)
    }
}

/// Alert sources after applying the chip's one-function rule
///
/// Holds the conversion-ready source plus at most one alert function.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct AlertSelection {
    conversion_ready: bool,
    function: Option<AlertSource>,
}

impl AlertSelection {
    /// Reduce a requested list to what the chip can monitor at once
    ///
    /// Of several alert functions only the one with the highest bit position is kept; the others
    /// are dropped without failing the call. Conversion ready is kept alongside it.
    pub fn collapse(requested: &[AlertSource]) -> Self {
        let function = requested
            .iter()
            .copied()
            .filter(|source| source.is_function())
            .max();
        let dropped = requested
            .iter()
            .filter(|&&source| source.is_function() && Some(source) != function)
            .count();
        if dropped > 0 {
            warn!(
                "{} lower priority alert source(s) dropped, keeping {:?}",
                dropped, function
            );
        }
        Self {
            conversion_ready: requested.contains(&AlertSource::ConversionReady),
            function,
        }
    }

    pub fn conversion_ready(&self) -> bool {
        self.conversion_ready
    }

    /// The alert function responding to the alert limit, if any
    pub fn function(&self) -> Option<AlertSource> {
        self.function
    }

    pub fn is_empty(&self) -> bool {
        !self.conversion_ready && self.function.is_none()
    }

    /// Value of the 6 bit alert source field
    pub fn field_value(&self) -> u16 {
        let base = AlertSource::ConversionReady.bit();
        let function = self
            .function
            .map_or(0, |source| 1 << (source.bit() - base));
        function | u16::from(self.conversion_ready)
    }

    /// Active sources, conversion ready first
    pub fn sources(&self) -> heapless::Vec<AlertSource, 2> {
        let mut sources = heapless::Vec::new();
        // Capacity matches the two possible entries
        if self.conversion_ready {
            let _ = sources.push(AlertSource::ConversionReady);
        }
        if let Some(function) = self.function {
            let _ = sources.push(function);
        }
        sources
    }
}

/// Read-only status bits of the Mask/Enable register
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Flag {
    /// Set when the alert function was the source of the last alert
    AlertFunction = 4,
    /// Set after all conversions, averaging and multiplications are complete
    ConversionReady = 3,
    /// Power exceeded the maximum reportable value of 419.43 W
    MathOverflow = 2,
}

impl Flag {
    #[inline(always)]
    pub fn mask(self) -> u16 {
        1 << (self as u16)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// Alert Polarity bit
pub enum AlertPolarity {
    /// Active-low open collector (default)
    #[default]
    Normal = 0,
    /// Active-high open collector
    Inverted = 1,
}

impl TryFrom<u8> for AlertPolarity {
    type Error = InvalidSetting;

    fn try_from(bit: u8) -> Result<Self, Self::Error> {
        match bit {
            0 => Ok(AlertPolarity::Normal),
            1 => Ok(AlertPolarity::Inverted),
            _ => Err(InvalidSetting),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// Alert Latch Enable bit
pub enum AlertLatch {
    /// ALERT pin and flag return to idle once the fault clears (default)
    #[default]
    Transparent = 0,
    /// ALERT pin and flag stay active until the Mask/Enable register is read
    Latched = 1,
}

impl TryFrom<u8> for AlertLatch {
    type Error = InvalidSetting;

    fn try_from(bit: u8) -> Result<Self, Self::Error> {
        match bit {
            0 => Ok(AlertLatch::Transparent),
            1 => Ok(AlertLatch::Latched),
            _ => Err(InvalidSetting),
        }
    }
}

/// Settings mirrored into the configuration register
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct DeviceConfiguration {
    pub averaging: Averaging,
    pub bus_conversion_time: ConversionTime,
    pub shunt_conversion_time: ConversionTime,
    /// Continuous conversions when set, triggered otherwise
    pub continuous: bool,
    pub measure_voltage: bool,
    pub measure_current: bool,
}

impl Default for DeviceConfiguration {
    fn default() -> Self {
        Self {
            averaging: Averaging::AVG1,
            bus_conversion_time: ConversionTime::MS1_1,
            shunt_conversion_time: ConversionTime::MS1_1,
            continuous: true,
            measure_voltage: true,
            measure_current: true,
        }
    }
}

impl DeviceConfiguration {
    /// Register value these settings encode to
    pub fn bits(&self) -> u16 {
        let mut reg = CONFIG_FIXED_BITS;
        reg = AVERAGING.insert(reg, self.averaging.index());
        reg = BUS_CONVERSION_TIME.insert(reg, self.bus_conversion_time.index());
        reg = SHUNT_CONVERSION_TIME.insert(reg, self.shunt_conversion_time.index());
        reg = MODE_CONTINUOUS.insert(reg, u16::from(self.continuous));
        reg = MODE_VOLTAGE.insert(reg, u16::from(self.measure_voltage));
        MODE_CURRENT.insert(reg, u16::from(self.measure_current))
    }

    /// Decode a configuration register value
    pub fn from_bits(reg: u16) -> Self {
        Self {
            averaging: Averaging::from_index(AVERAGING.extract(reg)),
            bus_conversion_time: ConversionTime::from_index(BUS_CONVERSION_TIME.extract(reg)),
            shunt_conversion_time: ConversionTime::from_index(SHUNT_CONVERSION_TIME.extract(reg)),
            continuous: MODE_CONTINUOUS.extract(reg) != 0,
            measure_voltage: MODE_VOLTAGE.extract(reg) != 0,
            measure_current: MODE_CURRENT.extract(reg) != 0,
        }
    }

    pub fn conversion_time(&self, channel: Channel) -> ConversionTime {
        match channel {
            Channel::BusVoltage => self.bus_conversion_time,
            Channel::ShuntCurrent => self.shunt_conversion_time,
        }
    }

    /// Time from start of conversion until conversion ready, in µs
    pub fn conversion_period_us(&self) -> u32 {
        let bus = if self.measure_voltage {
            u32::from(self.bus_conversion_time.micros())
        } else {
            0
        };
        let shunt = if self.measure_current {
            u32::from(self.shunt_conversion_time.micros())
        } else {
            0
        };
        u32::from(self.averaging.count()) * (bus + shunt)
    }

    /// Twice the conversion period, but at least 1 ms
    pub fn automatic_timeout_us(&self) -> u32 {
        (2 * self.conversion_period_us()).max(1000)
    }
}
