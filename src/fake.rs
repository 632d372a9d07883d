//! Register file behaving like an INA260 on the bus, for scenario tests

use std::collections::VecDeque;

use embedded_hal::i2c::{ErrorType, I2c, Operation};

const CVRF: u16 = 0x0008;

pub(crate) struct FakeIna260 {
    pub(crate) regs: [u16; 256],
    pointer: u8,
    /// Bus voltage results handed out one per read of the voltage register
    pub(crate) voltages: VecDeque<u16>,
}

impl FakeIna260 {
    pub(crate) fn new() -> Self {
        let mut fake = Self {
            regs: [0; 256],
            pointer: 0,
            voltages: VecDeque::new(),
        };
        fake.power_on();
        fake
    }

    fn power_on(&mut self) {
        self.regs = [0; 256];
        self.regs[0x00] = 0x6127;
        self.regs[0xFE] = 0x5449;
        self.regs[0xFF] = 0x2270;
    }

    /// Raise the conversion ready flag as the ADC would
    pub(crate) fn finish_conversion(&mut self) {
        self.regs[0x06] |= CVRF;
    }

    fn read(&mut self, reg: u8) -> u16 {
        match reg {
            0x02 => {
                if let Some(v) = self.voltages.pop_front() {
                    self.regs[0x02] = v;
                }
                self.regs[0x02]
            }
            0x06 => {
                let value = self.regs[0x06];
                self.regs[0x06] &= !CVRF;
                value
            }
            _ => self.regs[usize::from(reg)],
        }
    }

    fn write(&mut self, reg: u8, value: u16) {
        match reg {
            0x00 if value & 0x8000 != 0 => self.power_on(),
            0x00 => {
                self.regs[0x00] = 0x6000 | (value & 0x0FFF);
                self.regs[0x06] &= !CVRF;
            }
            // Flag bits are read-only
            0x06 => self.regs[0x06] = (value & 0xFC03) | (self.regs[0x06] & 0x001C),
            0x07 => self.regs[0x07] = value,
            _ => panic!("write to read-only register {:#x}", reg),
        }
    }
}

impl ErrorType for FakeIna260 {
    type Error = core::convert::Infallible;
}

impl I2c for FakeIna260 {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        assert_eq!(address, 0x40);
        for operation in operations.iter_mut() {
            match operation {
                Operation::Write(bytes) => {
                    self.pointer = bytes[0];
                    if let [_, high, low] = **bytes {
                        self.write(self.pointer, u16::from_be_bytes([high, low]));
                    }
                }
                Operation::Read(buffer) => {
                    let value = self.read(self.pointer);
                    buffer.copy_from_slice(&value.to_be_bytes());
                }
            }
        }
        Ok(())
    }
}

#[cfg(feature = "async")]
impl embedded_hal_async::i2c::I2c for FakeIna260 {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        I2c::transaction(self, address, operations)
    }
}
