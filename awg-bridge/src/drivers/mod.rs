//! # Waveform Generator Drivers
//!
//! The capabilities the SCPI interpreter needs from a waveform generator.
//! Channel `0` addresses all channels at once.
use std::{error::Error, fmt::Display, io};

pub mod dummy;

/// Addresses every channel of the generator
pub const ALL_CHANNELS: u8 = 0;

/// Short names accepted by [`open_driver`]
const DRIVER_NAMES: [&str; 1] = [dummy::SHORT_NAME];

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaveType {
    Sine,
    Square,
    Pulse,
    Triangle,
    Noise,
    Arbitrary,
    Dc,
}

/// The load the generator assumes when computing its output voltage.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Load {
    Ohms(f64),
    HighZ,
}

impl Display for Load {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Load::Ohms(ohms) => write!(f, "{} Ohm", ohms),
            Load::HighZ => write!(f, "Hi-Z"),
        }
    }
}

#[derive(Debug)]
pub enum DriverError {
    UnknownChannel(u8),
    Unsupported(String),
    UnknownDriver(String),
    IoError(io::Error),
}

impl From<io::Error> for DriverError {
    fn from(value: io::Error) -> Self {
        DriverError::IoError(value)
    }
}

impl Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::UnknownChannel(channel) => write!(f, "Unknown channel {}", channel),
            DriverError::Unsupported(what) => write!(f, "Not supported: {}", what),
            DriverError::UnknownDriver(name) => write!(
                f,
                "Unknown generator '{}', available: {}",
                name,
                DRIVER_NAMES.join(", ")
            ),
            DriverError::IoError(error) => write!(f, "{}", error),
        }
    }
}

impl Error for DriverError {}

/// Trait that waveform generator drivers implement.
///
/// Implementations translate the generic operations into the command set of a
/// specific instrument, for example over a serial port or VISA.
pub trait AwgDriver {
    fn connect(&mut self) -> Result<(), DriverError>;

    fn disconnect(&mut self) -> Result<(), DriverError>;

    /// Bring the generator into a known state. Connects if necessary.
    fn initialize(&mut self) -> Result<(), DriverError>;

    fn get_id(&mut self) -> Result<String, DriverError>;

    fn enable_output(&mut self, channel: u8, on: bool) -> Result<(), DriverError>;

    fn set_frequency(&mut self, channel: u8, hz: f64) -> Result<(), DriverError>;

    fn set_phase(&mut self, channel: u8, degrees: f64) -> Result<(), DriverError>;

    fn set_wave_type(&mut self, channel: u8, wave_type: WaveType) -> Result<(), DriverError>;

    /// Set the peak-to-peak amplitude as seen by the configured load.
    fn set_amplitude(&mut self, channel: u8, vpp: f64) -> Result<(), DriverError>;

    fn set_offset(&mut self, channel: u8, volts: f64) -> Result<(), DriverError>;

    fn set_load_impedance(&mut self, channel: u8, load: Load) -> Result<(), DriverError>;
}

impl<D: AwgDriver + ?Sized> AwgDriver for Box<D> {
    fn connect(&mut self) -> Result<(), DriverError> {
        (**self).connect()
    }

    fn disconnect(&mut self) -> Result<(), DriverError> {
        (**self).disconnect()
    }

    fn initialize(&mut self) -> Result<(), DriverError> {
        (**self).initialize()
    }

    fn get_id(&mut self) -> Result<String, DriverError> {
        (**self).get_id()
    }

    fn enable_output(&mut self, channel: u8, on: bool) -> Result<(), DriverError> {
        (**self).enable_output(channel, on)
    }

    fn set_frequency(&mut self, channel: u8, hz: f64) -> Result<(), DriverError> {
        (**self).set_frequency(channel, hz)
    }

    fn set_phase(&mut self, channel: u8, degrees: f64) -> Result<(), DriverError> {
        (**self).set_phase(channel, degrees)
    }

    fn set_wave_type(&mut self, channel: u8, wave_type: WaveType) -> Result<(), DriverError> {
        (**self).set_wave_type(channel, wave_type)
    }

    fn set_amplitude(&mut self, channel: u8, vpp: f64) -> Result<(), DriverError> {
        (**self).set_amplitude(channel, vpp)
    }

    fn set_offset(&mut self, channel: u8, volts: f64) -> Result<(), DriverError> {
        (**self).set_offset(channel, volts)
    }

    fn set_load_impedance(&mut self, channel: u8, load: Load) -> Result<(), DriverError> {
        (**self).set_load_impedance(channel, load)
    }
}

pub fn driver_names() -> &'static [&'static str] {
    &DRIVER_NAMES
}

/// Creates the driver registered under `name`.
///
/// `port` is a serial port or VISA resource string, `baud_rate` applies to serial ports.
pub fn open_driver(
    name: &str,
    port: &str,
    baud_rate: u32,
) -> Result<Box<dyn AwgDriver + Send>, DriverError> {
    match name.to_lowercase().as_str() {
        dummy::SHORT_NAME => Ok(Box::new(dummy::DummyAwg::new(port, baud_rate))),
        _ => Err(DriverError::UnknownDriver(name.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_by_name() {
        let mut driver = open_driver("Dummy", "/dev/ttyUSB0", 19200).unwrap();
        assert_eq!(driver.get_id().unwrap(), "Dummy AWG");
    }

    #[test]
    fn unknown_driver() {
        match open_driver("sdg2042x", "", 0) {
            Err(DriverError::UnknownDriver(name)) => assert_eq!(name, "sdg2042x"),
            Err(other) => panic!("expected UnknownDriver, got {}", other),
            Ok(_) => panic!("expected UnknownDriver"),
        }
    }
}
