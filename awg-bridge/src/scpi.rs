//! # SCPI Interpreter
//!
//! Understands the subset of the Siglent SDG command set an oscilloscope uses
//! during a Bode plot sweep and forwards it to an [`AwgDriver`].
//!
//! A write such as `C1:BSWV WVTP,SINE,FRQ,1000HZ;C1:OUTP ON` is split at `;`.
//! A `C<n>:` prefix selects the channel for that part and all parts following it.
use std::{
    error::Error,
    fmt::Display,
    sync::{Arc, Mutex},
};

use vxi11_server::CommandHandler;

use crate::drivers::{AwgDriver, DriverError, Load, WaveType};

const DEFAULT_CHANNEL: u8 = 1;

#[derive(Debug)]
pub enum ScpiError {
    UnknownCommand(String),
    InvalidValue { key: String, value: String },
    MissingValue(String),
    Driver(DriverError),
}

impl From<DriverError> for ScpiError {
    fn from(value: DriverError) -> Self {
        ScpiError::Driver(value)
    }
}

impl Display for ScpiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScpiError::UnknownCommand(command) => write!(f, "Unknown command '{}'", command),
            ScpiError::InvalidValue { key, value } => {
                write!(f, "Invalid value '{}' for {}", value, key)
            }
            ScpiError::MissingValue(key) => write!(f, "Missing value for {}", key),
            ScpiError::Driver(error) => write!(f, "Driver error: {}", error),
        }
    }
}

impl Error for ScpiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ScpiError::Driver(error) => Some(error),
            _ => None,
        }
    }
}

/// Interprets SCPI commands and drives the shared generator.
pub struct CommandParser<D: AwgDriver> {
    driver: Arc<Mutex<D>>,
    channel: u8,
}

impl<D: AwgDriver> CommandParser<D> {
    pub fn new(driver: Arc<Mutex<D>>) -> CommandParser<D> {
        CommandParser {
            driver,
            channel: DEFAULT_CHANNEL,
        }
    }

    /// The channel commands without a `C<n>:` prefix apply to.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Executes every part of `command`.
    ///
    /// A failing part does not prevent the following parts from running.
    /// The first failure is returned.
    pub fn parse(&mut self, command: &str) -> Result<(), ScpiError> {
        let mut first_error = None;
        for part in command.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            if let Err(e) = self.parse_part(part) {
                log::debug!("'{}' failed: {}", part, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn parse_part(&mut self, part: &str) -> Result<(), ScpiError> {
        let body = match part.split_once(':') {
            Some((prefix, rest)) => match channel_prefix(prefix) {
                Some(channel) => {
                    self.channel = channel;
                    rest
                }
                None => part,
            },
            None => part,
        };
        if body.ends_with('?') {
            log::debug!("Ignoring query '{}'", part);
            return Ok(());
        }
        let (header, args) = body
            .split_once(char::is_whitespace)
            .unwrap_or((body, ""));
        match header.to_uppercase().as_str() {
            "OUTP" | "OUTPUT" => self.output(args),
            "BSWV" | "BASIC_WAVE" => self.basic_wave(args),
            _ => Err(ScpiError::UnknownCommand(body.to_string())),
        }
    }

    fn output(&mut self, args: &str) -> Result<(), ScpiError> {
        let mut driver = self.driver.lock().unwrap_or_else(|e| e.into_inner());
        let mut tokens = args.split(',').map(str::trim);
        while let Some(token) = tokens.next() {
            match token.to_uppercase().as_str() {
                "ON" => driver.enable_output(self.channel, true)?,
                "OFF" => driver.enable_output(self.channel, false)?,
                "LOAD" => {
                    let value = tokens
                        .next()
                        .ok_or_else(|| ScpiError::MissingValue("LOAD".to_string()))?;
                    let load = if value.eq_ignore_ascii_case("HZ") {
                        Load::HighZ
                    } else {
                        Load::Ohms(number("LOAD", value)?)
                    };
                    driver.set_load_impedance(self.channel, load)?;
                }
                "PLRT" => {
                    let polarity = tokens.next().unwrap_or_default();
                    log::debug!("Ignoring polarity {}", polarity);
                }
                "" => {}
                _ => return Err(ScpiError::UnknownCommand(format!("OUTP {}", token))),
            }
        }
        Ok(())
    }

    fn basic_wave(&mut self, args: &str) -> Result<(), ScpiError> {
        let mut driver = self.driver.lock().unwrap_or_else(|e| e.into_inner());
        let mut tokens = args.split(',').map(str::trim).filter(|t| !t.is_empty());
        while let Some(key) = tokens.next() {
            let key = key.to_uppercase();
            let value = tokens
                .next()
                .ok_or_else(|| ScpiError::MissingValue(key.clone()))?;
            match key.as_str() {
                "WVTP" => driver.set_wave_type(self.channel, wave_type(value)?)?,
                "FRQ" => driver.set_frequency(self.channel, number(&key, value)?)?,
                "AMP" => driver.set_amplitude(self.channel, number(&key, value)?)?,
                "OFST" => driver.set_offset(self.channel, number(&key, value)?)?,
                "PHSE" => driver.set_phase(self.channel, number(&key, value)?)?,
                _ => log::debug!("Ignoring {} {}", key, value),
            }
        }
        Ok(())
    }
}

impl<D: AwgDriver> CommandHandler for CommandParser<D> {
    fn execute(&mut self, command: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(self.parse(command)?)
    }
}

fn channel_prefix(prefix: &str) -> Option<u8> {
    let digits = prefix.strip_prefix(['C', 'c'])?;
    digits.parse().ok()
}

fn wave_type(value: &str) -> Result<WaveType, ScpiError> {
    match value.to_uppercase().as_str() {
        "SINE" => Ok(WaveType::Sine),
        "SQUARE" => Ok(WaveType::Square),
        "RAMP" => Ok(WaveType::Triangle),
        "PULSE" => Ok(WaveType::Pulse),
        "NOISE" => Ok(WaveType::Noise),
        "ARB" => Ok(WaveType::Arbitrary),
        "DC" => Ok(WaveType::Dc),
        _ => Err(ScpiError::InvalidValue {
            key: "WVTP".to_string(),
            value: value.to_string(),
        }),
    }
}

/// Parses a number, dropping a unit suffix such as `HZ` or `V`.
fn number(key: &str, value: &str) -> Result<f64, ScpiError> {
    value
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .map_err(|_| ScpiError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::drivers::dummy::DummyAwg;

    fn parser() -> (CommandParser<DummyAwg>, Arc<Mutex<DummyAwg>>) {
        let awg = Arc::new(Mutex::new(DummyAwg::new("", 0)));
        (CommandParser::new(Arc::clone(&awg)), awg)
    }

    #[test]
    fn basic_wave_settings() {
        let (mut parser, awg) = parser();
        parser
            .parse("C1:BSWV WVTP,SINE,FRQ,1000HZ,AMP,2.5V,OFST,-0.1V,PHSE,90")
            .unwrap();
        let awg = awg.lock().unwrap();
        let state = awg.channel(1).unwrap();
        assert_eq!(state.wave_type, WaveType::Sine);
        assert_eq!(state.frequency, 1000.0);
        assert_eq!(state.amplitude, 2.5);
        assert_eq!(state.offset, -0.1);
        assert_eq!(state.phase, 90.0);
    }

    #[test]
    fn channel_prefix_persists() {
        let (mut parser, awg) = parser();
        parser.parse("C2:OUTP LOAD,50;BSWV FRQ,20").unwrap();
        assert_eq!(parser.channel(), 2);
        let awg = awg.lock().unwrap();
        assert_eq!(awg.channel(2).unwrap().load, Load::Ohms(50.0));
        assert_eq!(awg.channel(2).unwrap().frequency, 20.0);
        assert_eq!(awg.channel(1).unwrap().frequency, 1000.0);
    }

    #[test]
    fn output_on_off_and_high_z() {
        let (mut parser, awg) = parser();
        parser.parse("C1:OUTP ON").unwrap();
        assert!(awg.lock().unwrap().channel(1).unwrap().output);
        parser.parse("c1:outp off,load,hz").unwrap();
        let awg = awg.lock().unwrap();
        assert!(!awg.channel(1).unwrap().output);
        assert_eq!(awg.channel(1).unwrap().load, Load::HighZ);
    }

    #[test]
    fn queries_are_ignored() {
        let (mut parser, _) = parser();
        parser.parse("*IDN?").unwrap();
        parser.parse("C1:BSWV?").unwrap();
    }

    #[test]
    fn ramp_is_triangle() {
        let (mut parser, awg) = parser();
        parser.parse("C1:BSWV WVTP,RAMP").unwrap();
        assert_eq!(
            awg.lock().unwrap().channel(1).unwrap().wave_type,
            WaveType::Triangle
        );
    }

    #[test]
    fn unknown_command_does_not_stop_following_parts() {
        let (mut parser, awg) = parser();
        let result = parser.parse("C1:FOO BAR;C1:BSWV FRQ,500");
        assert!(matches!(result, Err(ScpiError::UnknownCommand(cmd)) if cmd == "FOO BAR"));
        assert_eq!(awg.lock().unwrap().channel(1).unwrap().frequency, 500.0);
    }

    #[test]
    fn invalid_values() {
        let (mut parser, _) = parser();
        assert!(matches!(
            parser.parse("C1:BSWV FRQ,fast"),
            Err(ScpiError::InvalidValue { key, .. }) if key == "FRQ"
        ));
        assert!(matches!(
            parser.parse("C1:BSWV WVTP,SAW"),
            Err(ScpiError::InvalidValue { key, .. }) if key == "WVTP"
        ));
        assert!(matches!(
            parser.parse("C1:BSWV AMP"),
            Err(ScpiError::MissingValue(key)) if key == "AMP"
        ));
    }

    #[test]
    fn unknown_channel_is_a_driver_error() {
        let (mut parser, _) = parser();
        assert!(matches!(
            parser.parse("C3:OUTP ON"),
            Err(ScpiError::Driver(DriverError::UnknownChannel(3)))
        ));
    }

    #[test]
    fn command_handler_reports_errors() {
        let (mut parser, _) = parser();
        assert!(parser.execute("C1:OUTP ON").is_ok());
        let error = parser.execute("NONSENSE").unwrap_err();
        assert_eq!(error.to_string(), "Unknown command 'NONSENSE'");
    }
}
