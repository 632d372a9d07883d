//! A driver for the TI INA260 power monitor of the AC measurement rig
//!
//! This driver was built using [`embedded-hal`] traits.
//!
//! [`embedded-hal`]: https://docs.rs/embedded-hal/1.0
//!
//! The bus voltage is sensed through a series resistor and a rectifier diode, so all voltage and
//! power readings go through a [`CalibrationModel`]. Besides plain register access the driver can
//! block until the chip signals a finished conversion, either by watching the ALERT line or by
//! polling the conversion ready flag, and can wait for the next peak of the mains voltage so
//! loads are switched off with minimal transients.
//!
//! # Examples
//!
//! ```ignore
//! let config = Config::from_json(&document)?;
//! let mut ina260 = INA260::new_with_config(i2c, delay, Some(alert_pin), &config)?;
//! ina260.set_alert_sources(&[AlertSource::ConversionReady])?;
//! if ina260.wait_for_alert_edge(Timeout::Automatic)?.is_signaled() {
//!     let volts = ina260.voltage()?;
//! }
//! ```

#![cfg_attr(not(test), no_std)]

#[macro_use]
pub(crate) mod fmt;

pub mod calibration;
pub mod config;
#[cfg(test)]
mod fake;
pub mod registers;
pub mod wait;

#[cfg(not(any(feature = "sync", feature = "async")))]
compile_error!("You should probably choose at least one of `sync` and `async` features.");

#[cfg(feature = "sync")]
use embedded_hal::delay::DelayNs;
#[cfg(feature = "sync")]
use embedded_hal::i2c::I2c;
#[cfg(feature = "async")]
use embedded_hal_async::delay::DelayNs as AsyncDelayNs;
#[cfg(feature = "async")]
use embedded_hal_async::i2c::I2c as AsyncI2c;

pub use calibration::{CalibrationModel, OutOfRange, Quantized, Unit};
pub use config::{AlertConfiguration, Config, ConfigError, DEFAULT_ADDRESS};
pub use registers::{
    AlertLatch, AlertPolarity, AlertSelection, AlertSource, Averaging, Channel, ConversionTime,
    DeviceConfiguration, Flag, InvalidSetting, Register,
};
pub use wait::{NoAlertPin, PeakDetector, Timeout, WaitOutcome};

use registers::{
    ALERT_LATCH, ALERT_POLARITY, ALERT_SOURCES, AVERAGING, MODE_CONTINUOUS, MODE_CURRENT,
    MODE_VOLTAGE, RESET,
};

/// Driver errors
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Error<E> {
    /// I2C bus transaction failed
    I2c(E),
    /// Reading the ALERT line failed
    AlertPin,
    /// Value is not one of the settings the register field can encode
    InvalidArgument,
    /// Operation needs state that has not been configured yet
    Precondition,
    /// Converted value does not fit into a 16 bit register
    OutOfRange,
    /// Bounded wait ran out before the awaited event
    Timeout,
    /// Edge waiting requested but no ALERT line was handed to the driver
    NoAlertPin,
    /// Manufacturer or die id do not belong to an INA260
    UnknownDevice,
}

impl<E> From<InvalidSetting> for Error<E> {
    fn from(_: InvalidSetting) -> Self {
        Error::InvalidArgument
    }
}

impl<E> From<OutOfRange> for Error<E> {
    fn from(_: OutOfRange) -> Self {
        Error::OutOfRange
    }
}

impl<E: core::fmt::Debug> core::fmt::Display for Error<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::I2c(e) => write!(f, "I2C transfer failed: {:?}", e),
            Error::AlertPin => write!(f, "Cannot read ALERT line"),
            Error::InvalidArgument => write!(f, "Invalid Parameter"),
            Error::Precondition => write!(f, "No alert function configured"),
            Error::OutOfRange => write!(f, "Value outside of 16 bit register range"),
            Error::Timeout => write!(f, "Timed out"),
            Error::NoAlertPin => write!(f, "No ALERT line connected"),
            Error::UnknownDevice => write!(f, "Not an INA260"),
        }
    }
}

/// One session with an INA260 on the bus
///
/// `D` provides the timing for bounded waits, `P` is the optional input wired to the ALERT pin
/// (use [`NoAlertPin`] when there is none).
#[maybe_async_cfg::maybe(
    sync(feature = "sync", self = "INA260"),
    async(feature = "async", keep_self)
)]
pub struct AsyncINA260<I2C, D, P> {
    i2c: I2C,
    delay: D,
    alert_pin: Option<P>,
    address: u8,
    channel: u8,
    alert_line: Option<u8>,
    config: DeviceConfiguration,
    alert: AlertConfiguration,
    calibration: CalibrationModel,
}

#[maybe_async_cfg::maybe(
    sync(
        feature = "sync",
        self = "INA260",
        idents(AsyncI2c(sync = "I2c"), AsyncDelayNs(sync = "DelayNs"))
    ),
    async(feature = "async", keep_self)
)]
impl<I2C, D, P> AsyncINA260<I2C, D, P>
where
    I2C: AsyncI2c,
    D: AsyncDelayNs,
{
    /// Add a new driver for a INA260 chip found on the I2C bus at the specified address
    ///
    /// The chip is reset, so the driver starts out with the power-on configuration.
    pub async fn new_with_address(
        i2c: I2C,
        delay: D,
        alert_pin: Option<P>,
        address: u8,
    ) -> Result<Self, Error<I2C::Error>> {
        let mut ina260 = Self {
            i2c,
            delay,
            alert_pin,
            address,
            channel: 1,
            alert_line: None,
            config: DeviceConfiguration::default(),
            alert: AlertConfiguration::default(),
            calibration: CalibrationModel::default(),
        };
        ina260.reset().await?;
        Ok(ina260)
    }

    #[inline(always)]
    pub async fn new(i2c: I2C, delay: D, alert_pin: Option<P>) -> Result<Self, Error<I2C::Error>> {
        Self::new_with_address(i2c, delay, alert_pin, DEFAULT_ADDRESS).await
    }

    /// Reset the chip, then bring every setting of `config` into effect
    pub async fn new_with_config(
        i2c: I2C,
        delay: D,
        alert_pin: Option<P>,
        config: &Config,
    ) -> Result<Self, Error<I2C::Error>> {
        let mut ina260 = Self::new_with_address(i2c, delay, alert_pin, config.address).await?;
        ina260.channel = config.channel;
        ina260.alert_line = config.alert_pin;
        ina260.apply_config(config).await?;
        Ok(ina260)
    }

    /// Power the chip down and hand back the peripherals
    #[inline(always)]
    pub async fn release(mut self) -> (I2C, D, Option<P>) {
        let _ = self.shutdown().await;
        (self.i2c, self.delay, self.alert_pin)
    }

    /// Write every setting of `config` through the individual setters
    pub async fn apply_config(&mut self, config: &Config) -> Result<(), Error<I2C::Error>> {
        debug!("Applying configuration to {:#x}", self.address);
        self.calibration = config.calibration;
        self.apply_device_configuration(&config.device).await?;
        self.set_alert_selection(config.alert.sources).await?;
        self.set_alert_polarity(config.alert.polarity).await?;
        self.set_alert_latch(config.alert.latch).await?;
        if config.alert.sources.function().is_some() {
            self.set_alert_limit(config.alert.limit).await?;
        }
        Ok(())
    }

    /// Snapshot of the current settings, e.g. to persist them after a calibration run
    pub fn config(&self) -> Config {
        Config {
            address: self.address,
            channel: self.channel,
            alert_pin: self.alert_line,
            device: self.config,
            alert: self.alert,
            calibration: self.calibration,
        }
    }

    /// Generate a system reset that is the same as a power-on reset
    pub async fn reset(&mut self) -> Result<(), Error<I2C::Error>> {
        self.write_reg(Register::CONFIG, RESET.mask()).await?;
        self.config = DeviceConfiguration::default();
        self.alert = AlertConfiguration::default();
        info!("INA260 at {:#x} reset", self.address);
        Ok(())
    }

    /// Clear all mode bits, which powers the converter down
    pub async fn shutdown(&mut self) -> Result<(), Error<I2C::Error>> {
        let mode = MODE_CONTINUOUS.mask() | MODE_VOLTAGE.mask() | MODE_CURRENT.mask();
        let reg = self.read_reg(Register::CONFIG).await? & !mode;
        self.write_reg(Register::CONFIG, reg).await?;
        self.config.continuous = false;
        self.config.measure_voltage = false;
        self.config.measure_current = false;
        Ok(())
    }

    /// Start a single conversion. Only meaningful in triggered mode.
    pub async fn trigger(&mut self) -> Result<(), Error<I2C::Error>> {
        let reg = self.read_reg(Register::CONFIG).await?;
        self.write_reg(Register::CONFIG, reg).await
    }

    /// Change the averaging mode of the INA260
    pub async fn set_averaging(&mut self, a: Averaging) -> Result<(), Error<I2C::Error>> {
        self.update_reg(Register::CONFIG, AVERAGING, a.index()).await?;
        self.config.averaging = a;
        Ok(())
    }

    /// Change the averaging mode to `count` samples, which must be one of
    /// 1, 4, 16, 64, 128, 256, 512 or 1024
    pub async fn set_averaging_count(&mut self, count: u16) -> Result<(), Error<I2C::Error>> {
        let averaging = Averaging::try_from(count)?;
        self.set_averaging(averaging).await
    }

    /// Change the conversion time of one channel
    pub async fn set_conversion_time(
        &mut self,
        channel: Channel,
        t: ConversionTime,
    ) -> Result<(), Error<I2C::Error>> {
        self.update_reg(Register::CONFIG, channel.field(), t.index())
            .await?;
        match channel {
            Channel::BusVoltage => self.config.bus_conversion_time = t,
            Channel::ShuntCurrent => self.config.shunt_conversion_time = t,
        }
        Ok(())
    }

    /// Change the conversion time of one channel to one of 140, 204, 332, 588, 1100, 2116,
    /// 4156 or 8244 µs
    pub async fn set_conversion_time_us(
        &mut self,
        channel: Channel,
        micros: u16,
    ) -> Result<(), Error<I2C::Error>> {
        let t = ConversionTime::try_from(micros)?;
        self.set_conversion_time(channel, t).await
    }

    /// Select continuous (`true`) or triggered conversions
    pub async fn set_continuous(&mut self, continuous: bool) -> Result<(), Error<I2C::Error>> {
        self.update_reg(Register::CONFIG, MODE_CONTINUOUS, u16::from(continuous))
            .await?;
        self.config.continuous = continuous;
        Ok(())
    }

    pub async fn set_measure_voltage(&mut self, measure: bool) -> Result<(), Error<I2C::Error>> {
        self.update_reg(Register::CONFIG, MODE_VOLTAGE, u16::from(measure))
            .await?;
        self.config.measure_voltage = measure;
        Ok(())
    }

    pub async fn set_measure_current(&mut self, measure: bool) -> Result<(), Error<I2C::Error>> {
        self.update_reg(Register::CONFIG, MODE_CURRENT, u16::from(measure))
            .await?;
        self.config.measure_current = measure;
        Ok(())
    }

    /// Change the operating mode. Each of the three bits is written on its own.
    pub async fn set_mode(
        &mut self,
        continuous: bool,
        measure_voltage: bool,
        measure_current: bool,
    ) -> Result<(), Error<I2C::Error>> {
        self.set_continuous(continuous).await?;
        self.set_measure_voltage(measure_voltage).await?;
        self.set_measure_current(measure_current).await
    }

    pub async fn apply_device_configuration(
        &mut self,
        config: &DeviceConfiguration,
    ) -> Result<(), Error<I2C::Error>> {
        self.set_averaging(config.averaging).await?;
        self.set_conversion_time(Channel::BusVoltage, config.bus_conversion_time)
            .await?;
        self.set_conversion_time(Channel::ShuntCurrent, config.shunt_conversion_time)
            .await?;
        self.set_mode(
            config.continuous,
            config.measure_voltage,
            config.measure_current,
        )
        .await
    }

    /// Cached copy of the configuration register settings
    #[inline(always)]
    pub fn device_configuration(&self) -> DeviceConfiguration {
        self.config
    }

    /// Select which events drive the ALERT pin
    ///
    /// Only one alert function can be monitored at a time. When several are requested the one
    /// with the highest bit position wins and the others are silently dropped; check
    /// [`alert`](Self::alert) for what is in effect. Conversion ready can be combined with it.
    pub async fn set_alert_sources(
        &mut self,
        sources: &[AlertSource],
    ) -> Result<(), Error<I2C::Error>> {
        self.set_alert_selection(AlertSelection::collapse(sources))
            .await
    }

    pub async fn set_alert_selection(
        &mut self,
        selection: AlertSelection,
    ) -> Result<(), Error<I2C::Error>> {
        self.update_reg(Register::MASK_ENABLE, ALERT_SOURCES, selection.field_value())
            .await?;
        self.alert.sources = selection;
        Ok(())
    }

    /// Active alert sources, conversion ready first
    pub fn alert(&self) -> heapless::Vec<AlertSource, 2> {
        self.alert.sources.sources()
    }

    #[inline(always)]
    pub fn alert_configuration(&self) -> AlertConfiguration {
        self.alert
    }

    pub async fn set_alert_polarity(
        &mut self,
        polarity: AlertPolarity,
    ) -> Result<(), Error<I2C::Error>> {
        self.update_reg(Register::MASK_ENABLE, ALERT_POLARITY, polarity as u16)
            .await?;
        self.alert.polarity = polarity;
        Ok(())
    }

    /// Change the alert latch mode
    ///
    /// The latch bit is always cleared first and set again in a second write when latching is
    /// requested, so a pending latched alert gets disarmed.
    pub async fn set_alert_latch(&mut self, latch: AlertLatch) -> Result<(), Error<I2C::Error>> {
        self.update_reg(Register::MASK_ENABLE, ALERT_LATCH, 0)
            .await?;
        if latch == AlertLatch::Latched {
            self.update_reg(Register::MASK_ENABLE, ALERT_LATCH, 1)
                .await?;
        }
        self.alert.latch = latch;
        Ok(())
    }

    /// Set the alert limit in the unit of the active alert function (A, V or W)
    ///
    /// Voltage and power limits refer to the measured side of the divider. The limit is rounded
    /// to the nearest register step; the value actually in effect is returned and kept for
    /// [`alert_limit`](Self::alert_limit).
    pub async fn set_alert_limit(&mut self, limit: f32) -> Result<f32, Error<I2C::Error>> {
        let unit = self
            .alert
            .sources
            .function()
            .and_then(Unit::of_alert)
            .ok_or(Error::Precondition)?;
        let quantized = self.calibration.to_raw(unit, limit)?;
        self.write_reg(Register::ALERT_LIMIT, quantized.raw).await?;
        self.alert.limit = quantized.value;
        debug!(
            "Alert limit {} requested, {} in effect ({:#x})",
            limit, quantized.value, quantized.raw
        );
        Ok(quantized.value)
    }

    #[inline(always)]
    pub fn alert_limit(&self) -> f32 {
        self.alert.limit
    }

    /// Read one status bit of the Mask/Enable register
    ///
    /// Reading that register clears the conversion ready flag and, in transparent mode, the
    /// alert function flag, so two reads in a row may disagree.
    pub async fn read_flag(&mut self, flag: Flag) -> Result<bool, Error<I2C::Error>> {
        Ok(self.mask_enable_register().await? & flag.mask() != 0)
    }

    #[inline(always)]
    pub async fn alert_flag(&mut self) -> Result<bool, Error<I2C::Error>> {
        self.read_flag(Flag::AlertFunction).await
    }

    #[inline(always)]
    pub async fn conversion_ready(&mut self) -> Result<bool, Error<I2C::Error>> {
        self.read_flag(Flag::ConversionReady).await
    }

    #[inline(always)]
    pub async fn math_overflow(&mut self) -> Result<bool, Error<I2C::Error>> {
        self.read_flag(Flag::MathOverflow).await
    }

    /// Raw content of the configuration register
    #[inline(always)]
    pub async fn config_register(&mut self) -> Result<u16, Error<I2C::Error>> {
        self.read_reg(Register::CONFIG).await
    }

    /// Raw content of the Mask/Enable register. Clears the conversion ready flag.
    #[inline(always)]
    pub async fn mask_enable_register(&mut self) -> Result<u16, Error<I2C::Error>> {
        self.read_reg(Register::MASK_ENABLE).await
    }

    /// Delivers the manufacturer id, 0x5449 for TI
    #[inline(always)]
    pub async fn manufacturer_id(&mut self) -> Result<u16, Error<I2C::Error>> {
        self.read_reg(Register::MANUFACTURER_ID).await
    }

    /// Delivers the unique chip id
    #[inline(always)]
    pub async fn die_id(&mut self) -> Result<u16, Error<I2C::Error>> {
        Ok(self.read_reg(Register::DIE_ID).await? >> 4)
    }

    /// Delivers the die revision id
    #[inline(always)]
    pub async fn die_revision(&mut self) -> Result<u16, Error<I2C::Error>> {
        Ok(self.read_reg(Register::DIE_ID).await? & 0b1111)
    }

    /// Make sure the device at our address is an INA260
    pub async fn check_identity(&mut self) -> Result<(), Error<I2C::Error>> {
        let manufacturer = self.manufacturer_id().await?;
        let die = self.die_id().await?;
        if manufacturer != registers::MANUFACTURER_ID || die != registers::DIE_ID {
            error!(
                "Unexpected device at {:#x}: manufacturer {:#x}, die {:#x}",
                self.address, manufacturer, die
            );
            return Err(Error::UnknownDevice);
        }
        Ok(())
    }

    /// Delivers the measured raw current in 1.25mA per bit
    #[inline(always)]
    pub async fn current_raw(&mut self) -> Result<i16, Error<I2C::Error>> {
        Ok(self.read_reg(Register::CURRENT).await? as i16)
    }

    /// Delivers the measured current in A
    pub async fn current(&mut self) -> Result<f32, Error<I2C::Error>> {
        let raw = self.read_reg(Register::CURRENT).await?;
        Ok(self.calibration.raw_to_current(raw))
    }

    /// Delivers the measured raw voltage in 1.25mV per bit, as seen at the VBUS pin
    #[inline(always)]
    pub async fn voltage_raw(&mut self) -> Result<u16, Error<I2C::Error>> {
        self.read_reg(Register::VOLTAGE).await
    }

    /// Delivers the measured voltage in V, corrected for the divider and diode
    pub async fn voltage(&mut self) -> Result<f32, Error<I2C::Error>> {
        let raw = self.voltage_raw().await?;
        Ok(self.calibration.raw_to_voltage(raw))
    }

    /// Delivers the raw power in 10mW per bit
    #[inline(always)]
    pub async fn power_raw(&mut self) -> Result<u16, Error<I2C::Error>> {
        self.read_reg(Register::POWER).await
    }

    /// Delivers the power calculated by the chip in W, corrected for the divider
    pub async fn power(&mut self) -> Result<f32, Error<I2C::Error>> {
        let raw = self.power_raw().await?;
        Ok(self.calibration.raw_to_power(raw))
    }

    #[inline(always)]
    pub fn calibration(&self) -> CalibrationModel {
        self.calibration
    }

    /// Replace the divider and diode model, e.g. with freshly fitted values
    #[inline(always)]
    pub fn set_calibration(&mut self, calibration: CalibrationModel) {
        self.calibration = calibration;
    }

    async fn update_reg(
        &mut self,
        reg: Register,
        field: registers::Field,
        value: u16,
    ) -> Result<u16, Error<I2C::Error>> {
        let current = self.read_reg(reg).await?;
        let updated = field.insert(current, value);
        self.write_reg(reg, updated).await?;
        Ok(updated)
    }

    #[inline(always)]
    async fn write_reg<R: Into<u8>>(&mut self, reg: R, value: u16) -> Result<(), Error<I2C::Error>> {
        let reg = reg.into();
        trace!("write {:#x} <- {:#x}", reg, value);
        let bytes = value.to_be_bytes();
        self.i2c
            .write(self.address, &[reg, bytes[0], bytes[1]])
            .await
            .map_err(Error::I2c)
    }

    #[inline(always)]
    async fn read_reg<R: Into<u8>>(&mut self, reg: R) -> Result<u16, Error<I2C::Error>> {
        let mut buffer = [0u8; 2];
        self.i2c
            .write_read(self.address, &[reg.into()], &mut buffer)
            .await
            .map_err(Error::I2c)?;
        Ok(u16::from_be_bytes(buffer))
    }
}
