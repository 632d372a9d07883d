//! Waiting for the chip to finish a conversion
//!
//! Every wait goes Idle -> Armed -> Signaled or TimedOut. A timeout is not an error here, it is
//! reported as [`WaitOutcome::TimedOut`] so ramp and calibration loops can simply try again.
//!
//! `embedded-hal` has no clock, so time is accounted for in delay steps. Deadlines are therefore
//! lower bounds; bus traffic inside the loop adds to the real wait.

use core::convert::Infallible;

#[cfg(feature = "sync")]
use embedded_hal::delay::DelayNs;
#[cfg(feature = "sync")]
use embedded_hal::digital::InputPin;
#[cfg(feature = "sync")]
use embedded_hal::i2c::I2c;
#[cfg(feature = "async")]
use embedded_hal_async::delay::DelayNs as AsyncDelayNs;
#[cfg(feature = "async")]
use embedded_hal_async::digital::Wait as AsyncWait;
#[cfg(feature = "async")]
use embedded_hal_async::i2c::I2c as AsyncI2c;

#[cfg(feature = "async")]
use crate::AsyncINA260;
#[cfg(feature = "sync")]
use crate::INA260;
use crate::{AlertPolarity, AlertSelection, AlertSource, Averaging, ConversionTime, Error};
use crate::registers::DeviceConfiguration;

/// Sampling interval of the ALERT line in the blocking edge wait
pub const EDGE_POLL_INTERVAL_US: u32 = 100;

/// Interval between conversion ready flag reads
pub const FLAG_POLL_INTERVAL_US: u32 = 1000;

pub const MAINS_FREQUENCY_HZ: u32 = 50;

/// Default window for finding a voltage peak: five mains periods
pub const PEAK_WINDOW_US: u32 = 5 * 1_000_000 / MAINS_FREQUENCY_HZ;

/// Upper bound for a wait
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Timeout {
    /// Twice the conversion period of the current settings, at least 1 ms
    Automatic,
    Millis(u32),
    Micros(u32),
}

impl Timeout {
    /// Deadline in µs for a chip configured as `config`
    pub fn resolve(self, config: &DeviceConfiguration) -> u32 {
        match self {
            Timeout::Automatic => config.automatic_timeout_us(),
            Timeout::Millis(ms) => ms.saturating_mul(1000),
            Timeout::Micros(us) => us,
        }
    }
}

/// Time spent against a deadline, in µs
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Budget {
    limit_us: u32,
    spent_us: u32,
}

impl Budget {
    fn new(limit_us: u32) -> Self {
        Self {
            limit_us,
            spent_us: 0,
        }
    }

    fn spend(&mut self, us: u32) {
        self.spent_us = self.spent_us.saturating_add(us);
    }

    fn is_exhausted(&self) -> bool {
        self.spent_us >= self.limit_us
    }

    fn remaining_us(&self) -> u32 {
        self.limit_us.saturating_sub(self.spent_us)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

impl WaitOutcome {
    #[inline(always)]
    pub fn is_signaled(self) -> bool {
        self == WaitOutcome::Signaled
    }
}

/// Stand-in alert pin type for rigs without an ALERT connection
///
/// It has no values, so the only thing ever passed is `None`.
#[derive(Debug)]
pub enum NoAlertPin {}

impl embedded_hal::digital::ErrorType for NoAlertPin {
    type Error = Infallible;
}

impl embedded_hal::digital::InputPin for NoAlertPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        match *self {}
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        match *self {}
    }
}

#[cfg(feature = "async")]
impl embedded_hal_async::digital::Wait for NoAlertPin {
    async fn wait_for_high(&mut self) -> Result<(), Self::Error> {
        match *self {}
    }

    async fn wait_for_low(&mut self) -> Result<(), Self::Error> {
        match *self {}
    }

    async fn wait_for_rising_edge(&mut self) -> Result<(), Self::Error> {
        match *self {}
    }

    async fn wait_for_falling_edge(&mut self) -> Result<(), Self::Error> {
        match *self {}
    }

    async fn wait_for_any_edge(&mut self) -> Result<(), Self::Error> {
        match *self {}
    }
}

/// Finds a local maximum in a stream of voltage samples
///
/// Keeps the last three samples and reports the middle one when it is higher than both
/// neighbours and all three are above the noise threshold, which rules out ripples around the
/// zero crossing.
#[derive(Copy, Clone, Debug)]
pub struct PeakDetector {
    window: [f32; 3],
    len: usize,
    noise_threshold: f32,
}

impl PeakDetector {
    pub fn new(noise_threshold: f32) -> Self {
        Self {
            window: [0.0; 3],
            len: 0,
            noise_threshold,
        }
    }

    /// Add a sample; returns the peak value once one has been passed
    pub fn push(&mut self, sample: f32) -> Option<f32> {
        self.window.rotate_left(1);
        self.window[2] = sample;
        self.len = (self.len + 1).min(3);
        if self.len < 3 {
            return None;
        }
        let [oldest, middle, newest] = self.window;
        let above_noise = self.window.iter().all(|&v| v > self.noise_threshold);
        if above_noise && newest - middle < 0.0 && middle - oldest > 0.0 {
            Some(middle)
        } else {
            None
        }
    }
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
    /// Poll the conversion ready flag until it is set or `timeout` runs out
    ///
    /// Fallback for rigs without an ALERT line; the resolution is one flag poll interval.
    pub async fn wait_for_conversion_ready(
        &mut self,
        timeout: Timeout,
    ) -> Result<WaitOutcome, Error<I2C::Error>> {
        let mut budget = Budget::new(timeout.resolve(&self.config));
        loop {
            if self.conversion_ready().await? {
                return Ok(WaitOutcome::Signaled);
            }
            if budget.is_exhausted() {
                debug!("No conversion ready flag within {} us", budget.limit_us);
                return Ok(WaitOutcome::TimedOut);
            }
            self.delay.delay_us(FLAG_POLL_INTERVAL_US).await;
            budget.spend(FLAG_POLL_INTERVAL_US);
        }
    }
}

#[maybe_async_cfg::maybe(
    sync(
        feature = "sync",
        self = "INA260",
        idents(
            AsyncI2c(sync = "I2c"),
            AsyncDelayNs(sync = "DelayNs"),
            AsyncWait(sync = "InputPin")
        )
    ),
    async(feature = "async", keep_self)
)]
impl<I2C, D, P> AsyncINA260<I2C, D, P>
where
    I2C: AsyncI2c,
    D: AsyncDelayNs,
    P: AsyncWait,
{
    /// Wait for the next maximum of the rectified mains voltage
    ///
    /// Switches the chip to single samples at the fastest bus voltage conversion with a
    /// conversion ready alert, tracks the voltage until it passes a maximum above
    /// `noise_threshold` (in V) and returns that maximum. [`Timeout::Automatic`] allows five mains
    /// periods. Every conversion counts one conversion period against the window and every missed
    /// alert the time waited for it. The previous configuration and alert sources are restored on
    /// every exit.
    pub async fn wait_for_voltage_peak(
        &mut self,
        timeout: Timeout,
        noise_threshold: f32,
    ) -> Result<f32, Error<I2C::Error>> {
        if self.alert_pin.is_none() {
            return Err(Error::NoAlertPin);
        }
        let window_us = match timeout {
            Timeout::Automatic => PEAK_WINDOW_US,
            _ => timeout.resolve(&self.config),
        };
        let saved_config = self.config;
        let saved_sources = self.alert.sources;
        let fast = DeviceConfiguration {
            averaging: Averaging::AVG1,
            bus_conversion_time: ConversionTime::US140,
            continuous: true,
            measure_voltage: true,
            measure_current: false,
            ..saved_config
        };

        let outcome = self
            .track_voltage_peak(&fast, window_us, noise_threshold)
            .await;
        let restored = self.restore(&saved_config, saved_sources).await;
        let peak = outcome?;
        restored?;
        peak.ok_or(Error::Timeout)
    }

    async fn track_voltage_peak(
        &mut self,
        fast: &DeviceConfiguration,
        window_us: u32,
        noise_threshold: f32,
    ) -> Result<Option<f32>, Error<I2C::Error>> {
        self.apply_device_configuration(fast).await?;
        self.set_alert_selection(AlertSelection::collapse(&[AlertSource::ConversionReady]))
            .await?;

        let edge_timeout_us = Timeout::Automatic.resolve(fast);
        let mut budget = Budget::new(window_us);
        let mut detector = PeakDetector::new(noise_threshold);
        while !budget.is_exhausted() {
            let timeout_us = edge_timeout_us.min(budget.remaining_us());
            let outcome = self.wait_for_alert_edge(Timeout::Micros(timeout_us)).await?;
            if outcome == WaitOutcome::TimedOut {
                budget.spend(timeout_us);
                continue;
            }
            budget.spend(fast.conversion_period_us());
            let volts = self.voltage().await?;
            if let Some(peak) = detector.push(volts) {
                debug!("Voltage peak of {} V", peak);
                return Ok(Some(peak));
            }
        }
        warn!("No voltage peak within {} us", window_us);
        Ok(None)
    }

    async fn restore(
        &mut self,
        config: &DeviceConfiguration,
        sources: AlertSelection,
    ) -> Result<(), Error<I2C::Error>> {
        self.apply_device_configuration(config).await?;
        self.set_alert_selection(sources).await
    }
}

#[cfg(feature = "sync")]
impl<I2C, D, P> INA260<I2C, D, P>
where
    I2C: I2c,
    D: DelayNs,
    P: InputPin,
{
    /// Block until the ALERT line becomes active or `timeout` runs out
    ///
    /// The Mask/Enable register is read when arming, which releases a line held by a latched
    /// alert or an unread conversion ready flag. The line is then sampled every
    /// [`EDGE_POLL_INTERVAL_US`] and an inactive to active transition counts as the edge, falling
    /// for the normal polarity, rising for the inverted one.
    pub fn wait_for_alert_edge(
        &mut self,
        timeout: Timeout,
    ) -> Result<WaitOutcome, Error<I2C::Error>> {
        if self.alert_pin.is_none() {
            return Err(Error::NoAlertPin);
        }
        let mut budget = Budget::new(timeout.resolve(&self.config));
        let active_low = self.alert.polarity == AlertPolarity::Normal;
        self.mask_enable_register()?;

        let pin = self.alert_pin.as_mut().ok_or(Error::NoAlertPin)?;
        let mut was_active = line_active(pin, active_low)?;
        while !budget.is_exhausted() {
            self.delay.delay_us(EDGE_POLL_INTERVAL_US);
            budget.spend(EDGE_POLL_INTERVAL_US);
            let active = line_active(pin, active_low)?;
            if active && !was_active {
                return Ok(WaitOutcome::Signaled);
            }
            was_active = active;
        }
        debug!("No alert edge within {} us", budget.limit_us);
        Ok(WaitOutcome::TimedOut)
    }
}

#[cfg(feature = "sync")]
fn line_active<P: InputPin, E>(pin: &mut P, active_low: bool) -> Result<bool, Error<E>> {
    let level = if active_low {
        pin.is_low()
    } else {
        pin.is_high()
    };
    level.map_err(|_| Error::AlertPin)
}

#[cfg(feature = "async")]
impl<I2C, D, P> AsyncINA260<I2C, D, P>
where
    I2C: AsyncI2c,
    D: AsyncDelayNs,
    P: AsyncWait,
{
    /// Wait until the ALERT line signals or `timeout` runs out
    ///
    /// Arms like the blocking flavour, then awaits the edge for the configured polarity
    /// against a delay of the timeout.
    pub async fn wait_for_alert_edge(
        &mut self,
        timeout: Timeout,
    ) -> Result<WaitOutcome, Error<I2C::Error>> {
        use embassy_futures::select::{select, Either};

        if self.alert_pin.is_none() {
            return Err(Error::NoAlertPin);
        }
        let timeout_us = timeout.resolve(&self.config);
        let polarity = self.alert.polarity;
        self.mask_enable_register().await?;

        let pin = self.alert_pin.as_mut().ok_or(Error::NoAlertPin)?;
        let deadline = self.delay.delay_us(timeout_us);
        let edge = match polarity {
            AlertPolarity::Normal => select(pin.wait_for_falling_edge(), deadline).await,
            AlertPolarity::Inverted => select(pin.wait_for_rising_edge(), deadline).await,
        };
        match edge {
            Either::First(Ok(())) => Ok(WaitOutcome::Signaled),
            Either::First(Err(_)) => Err(Error::AlertPin),
            Either::Second(()) => {
                debug!("No alert edge within {} us", timeout_us);
                Ok(WaitOutcome::TimedOut)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_in_rising_then_falling_samples() {
        let mut detector = PeakDetector::new(0.5);
        assert_eq!(detector.push(1.0), None);
        assert_eq!(detector.push(2.0), None);
        assert_eq!(detector.push(3.0), None);
        assert_eq!(detector.push(2.5), Some(3.0));
    }

    #[test]
    fn plateau_is_not_a_peak() {
        let mut detector = PeakDetector::new(0.0);
        for v in [1.0, 2.0, 2.0, 1.0] {
            assert_eq!(detector.push(v), None);
        }
    }

    #[test]
    fn peaks_near_zero_crossing_are_noise() {
        let mut detector = PeakDetector::new(0.5);
        for v in [0.4, 0.6, 0.55, 3.0, 4.0] {
            assert_eq!(detector.push(v), None);
        }
        assert_eq!(detector.push(3.9), Some(4.0));
    }

    #[test]
    fn timeouts() {
        let config = DeviceConfiguration {
            averaging: Averaging::AVG1024,
            measure_current: false,
            ..Default::default()
        };
        assert_eq!(Timeout::Automatic.resolve(&config), 2_252_800);
        assert_eq!(Timeout::Millis(5).resolve(&config), 5000);
        assert_eq!(Timeout::Micros(250).resolve(&config), 250);
        assert_eq!(Timeout::Millis(u32::MAX).resolve(&config), u32::MAX);
        assert_eq!(PEAK_WINDOW_US, 100_000);
    }

    #[test]
    fn budget_saturates_at_longest_timeout() {
        let mut budget = Budget::new(u32::MAX);
        budget.spend(u32::MAX - 50);
        assert!(!budget.is_exhausted());
        assert_eq!(budget.remaining_us(), 50);
        budget.spend(EDGE_POLL_INTERVAL_US);
        assert!(budget.is_exhausted());
        assert_eq!(budget.remaining_us(), 0);
    }
}

#[cfg(all(test, feature = "sync"))]
mod sync_tests {
    use super::*;
    use crate::fake::FakeIna260;
    use crate::registers::Register;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::digital::{
        Mock as PinMock, State as PinState, Transaction as PinTransaction,
    };

    fn rig(levels: &[PinState]) -> (PinMock, INA260<FakeIna260, NoopDelay, PinMock>) {
        let expectations: Vec<PinTransaction> =
            levels.iter().map(|&s| PinTransaction::get(s)).collect();
        let pin = PinMock::new(&expectations);
        let ina260 = INA260::new(FakeIna260::new(), NoopDelay::new(), Some(pin.clone())).unwrap();
        (pin, ina260)
    }

    #[derive(Default)]
    struct CountingDelay {
        elapsed_ns: u64,
    }

    impl DelayNs for CountingDelay {
        fn delay_ns(&mut self, ns: u32) {
            self.elapsed_ns += u64::from(ns);
        }
    }

    fn edges(count: usize) -> Vec<PinState> {
        (0..count)
            .flat_map(|_| [PinState::High, PinState::Low])
            .collect()
    }

    #[test]
    fn falling_edge_signals() {
        let (mut pin, mut ina260) = rig(&[PinState::High, PinState::High, PinState::Low]);
        ina260.i2c.finish_conversion();
        assert_eq!(
            ina260.wait_for_alert_edge(Timeout::Automatic),
            Ok(WaitOutcome::Signaled)
        );
        // Arming cleared the flag
        assert_eq!(ina260.i2c.regs[Register::MASK_ENABLE as usize] & 0x0008, 0);
        pin.done();
    }

    #[test]
    fn line_already_low_is_no_edge() {
        let (mut pin, mut ina260) = rig(&[PinState::Low; 11]);
        assert_eq!(
            ina260.wait_for_alert_edge(Timeout::Millis(1)),
            Ok(WaitOutcome::TimedOut)
        );
        pin.done();
    }

    #[test]
    fn inverted_polarity_waits_for_rising_edge() {
        let (mut pin, mut ina260) = rig(&[PinState::Low, PinState::High]);
        ina260.set_alert_polarity(AlertPolarity::Inverted).unwrap();
        assert_eq!(
            ina260.wait_for_alert_edge(Timeout::Millis(1)),
            Ok(WaitOutcome::Signaled)
        );
        pin.done();
    }

    #[test]
    fn automatic_timeout_follows_configuration() {
        // Single samples of 140 µs on the bus voltage only: 280 µs, raised to 1 ms
        let (mut pin, mut ina260) = rig(&[PinState::High; 11]);
        ina260.set_averaging(Averaging::AVG1).unwrap();
        ina260
            .set_conversion_time(crate::Channel::BusVoltage, ConversionTime::US140)
            .unwrap();
        ina260.set_measure_current(false).unwrap();
        assert_eq!(
            ina260.wait_for_alert_edge(Timeout::Automatic),
            Ok(WaitOutcome::TimedOut)
        );
        pin.done();
    }

    #[test]
    fn edge_wait_needs_alert_pin() {
        let mut ina260: INA260<_, _, NoAlertPin> =
            INA260::new(FakeIna260::new(), NoopDelay::new(), None).unwrap();
        assert_eq!(
            ina260.wait_for_alert_edge(Timeout::Automatic),
            Err(Error::NoAlertPin)
        );
        assert_eq!(
            ina260.wait_for_voltage_peak(Timeout::Automatic, 0.5),
            Err(Error::NoAlertPin)
        );
    }

    #[test]
    fn conversion_ready_polling() {
        let mut ina260: INA260<_, _, NoAlertPin> =
            INA260::new(FakeIna260::new(), NoopDelay::new(), None).unwrap();
        ina260.i2c.finish_conversion();
        assert_eq!(
            ina260.wait_for_conversion_ready(Timeout::Millis(3)),
            Ok(WaitOutcome::Signaled)
        );
        assert_eq!(
            ina260.wait_for_conversion_ready(Timeout::Millis(3)),
            Ok(WaitOutcome::TimedOut)
        );
    }

    #[test]
    fn voltage_peak_restores_configuration() {
        let (mut pin, mut ina260) = rig(&edges(4));
        ina260.set_averaging(Averaging::AVG64).unwrap();
        ina260
            .set_alert_sources(&[AlertSource::BusOverVoltage])
            .unwrap();
        let before = ina260.config_register().unwrap();
        ina260.i2c.voltages.extend([800, 1600, 2400, 2000]);

        let peak = ina260.wait_for_voltage_peak(Timeout::Automatic, 0.5).unwrap();
        assert!((peak - 3.0).abs() < 1e-5);

        assert_eq!(ina260.config_register().unwrap(), before);
        assert_eq!(ina260.device_configuration().averaging, Averaging::AVG64);
        assert_eq!(ina260.alert().as_slice(), &[AlertSource::BusOverVoltage]);
        assert_eq!(ina260.mask_enable_register().unwrap(), 0x2000);
        pin.done();
    }

    #[test]
    fn voltage_peak_times_out() {
        // 1 ms at 140 µs per sample leaves room for 8 conversions
        let (mut pin, mut ina260) = rig(&edges(8));
        ina260
            .i2c
            .voltages
            .extend([800, 1600, 2400, 3200, 4000, 4800, 5600, 6400]);

        assert_eq!(
            ina260.wait_for_voltage_peak(Timeout::Millis(1), 0.5),
            Err(Error::Timeout)
        );
        assert_eq!(ina260.config_register().unwrap(), 0x6127);
        assert!(ina260.alert().is_empty());
        pin.done();
    }

    #[test]
    fn voltage_peak_without_alerts_stays_within_window() {
        // 100 edge waits of 1 ms, each sampling the line 11 times
        let levels: Vec<PinTransaction> = (0..1100)
            .map(|_| PinTransaction::get(PinState::High))
            .collect();
        let mut pin = PinMock::new(&levels);
        let mut ina260 = INA260::new(
            FakeIna260::new(),
            CountingDelay::default(),
            Some(pin.clone()),
        )
        .unwrap();

        assert_eq!(
            ina260.wait_for_voltage_peak(Timeout::Automatic, 0.5),
            Err(Error::Timeout)
        );
        assert_eq!(ina260.delay.elapsed_ns, u64::from(PEAK_WINDOW_US) * 1000);
        assert_eq!(ina260.config_register().unwrap(), 0x6127);
        pin.done();
    }
}
