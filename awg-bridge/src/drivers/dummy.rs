//! # Dummy Driver
//!
//! Accepts every setting without talking to hardware. Useful to check the
//! connection to the oscilloscope before a real generator is attached.
use super::{ALL_CHANNELS, AwgDriver, DriverError, Load, WaveType};

pub const SHORT_NAME: &str = "dummy";
const ID: &str = "Dummy AWG";
const CHANNELS: usize = 2;

/// The last settings applied to a channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelState {
    pub output: bool,
    pub frequency: f64,
    pub phase: f64,
    pub wave_type: WaveType,
    pub amplitude: f64,
    pub offset: f64,
    pub load: Load,
}

impl Default for ChannelState {
    fn default() -> Self {
        ChannelState {
            output: false,
            frequency: 1000.0,
            phase: 0.0,
            wave_type: WaveType::Sine,
            amplitude: 1.0,
            offset: 0.0,
            load: Load::HighZ,
        }
    }
}

#[derive(Debug)]
pub struct DummyAwg {
    port: String,
    connected: bool,
    channels: [ChannelState; CHANNELS],
}

impl DummyAwg {
    pub fn new(port: &str, baud_rate: u32) -> DummyAwg {
        log::debug!("Dummy AWG on {} at {} baud", port, baud_rate);
        DummyAwg {
            port: port.to_string(),
            connected: false,
            channels: Default::default(),
        }
    }

    /// The state of channel `1` or `2`.
    pub fn channel(&self, channel: u8) -> Option<&ChannelState> {
        self.channels.get(usize::from(channel).checked_sub(1)?)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn apply(
        &mut self,
        channel: u8,
        mut change: impl FnMut(&mut ChannelState),
    ) -> Result<(), DriverError> {
        match usize::from(channel) {
            0 => self.channels.iter_mut().for_each(change),
            n @ 1..=CHANNELS => change(&mut self.channels[n - 1]),
            _ => return Err(DriverError::UnknownChannel(channel)),
        }
        Ok(())
    }
}

impl AwgDriver for DummyAwg {
    fn connect(&mut self) -> Result<(), DriverError> {
        log::debug!("connect({})", self.port);
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), DriverError> {
        log::debug!("disconnect");
        self.connected = false;
        Ok(())
    }

    fn initialize(&mut self) -> Result<(), DriverError> {
        log::debug!("initialize");
        self.connect()?;
        self.enable_output(ALL_CHANNELS, false)
    }

    fn get_id(&mut self) -> Result<String, DriverError> {
        Ok(ID.to_string())
    }

    fn enable_output(&mut self, channel: u8, on: bool) -> Result<(), DriverError> {
        log::debug!("enable_output(channel: {}, on: {})", channel, on);
        self.apply(channel, |state| state.output = on)
    }

    fn set_frequency(&mut self, channel: u8, hz: f64) -> Result<(), DriverError> {
        log::debug!("set_frequency(channel: {}, freq: {})", channel, hz);
        self.apply(channel, |state| state.frequency = hz)
    }

    fn set_phase(&mut self, channel: u8, degrees: f64) -> Result<(), DriverError> {
        log::debug!("set_phase(channel: {}, phase: {})", channel, degrees);
        self.apply(channel, |state| state.phase = degrees)
    }

    fn set_wave_type(&mut self, channel: u8, wave_type: WaveType) -> Result<(), DriverError> {
        log::debug!("set_wave_type(channel: {}, wave_type: {:?})", channel, wave_type);
        self.apply(channel, |state| state.wave_type = wave_type)
    }

    fn set_amplitude(&mut self, channel: u8, vpp: f64) -> Result<(), DriverError> {
        log::debug!("set_amplitude(channel: {}, amplitude: {})", channel, vpp);
        self.apply(channel, |state| state.amplitude = vpp)
    }

    fn set_offset(&mut self, channel: u8, volts: f64) -> Result<(), DriverError> {
        log::debug!("set_offset(channel: {}, offset: {})", channel, volts);
        self.apply(channel, |state| state.offset = volts)
    }

    fn set_load_impedance(&mut self, channel: u8, load: Load) -> Result<(), DriverError> {
        log::debug!("set_load_impedance(channel: {}, load: {})", channel, load);
        self.apply(channel, |state| state.load = load)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel_zero_applies_to_all() {
        let mut awg = DummyAwg::new("", 0);
        awg.set_frequency(ALL_CHANNELS, 50_000.0).unwrap();
        assert_eq!(awg.channel(1).unwrap().frequency, 50_000.0);
        assert_eq!(awg.channel(2).unwrap().frequency, 50_000.0);
    }

    #[test]
    fn single_channel() {
        let mut awg = DummyAwg::new("", 0);
        awg.set_load_impedance(2, Load::Ohms(50.0)).unwrap();
        assert_eq!(awg.channel(1).unwrap().load, Load::HighZ);
        assert_eq!(awg.channel(2).unwrap().load, Load::Ohms(50.0));
    }

    #[test]
    fn third_channel_is_unknown() {
        let mut awg = DummyAwg::new("", 0);
        assert!(matches!(
            awg.enable_output(3, true),
            Err(DriverError::UnknownChannel(3))
        ));
        assert!(awg.channel(0).is_none());
        assert!(awg.channel(3).is_none());
    }

    #[test]
    fn initialize_connects_with_outputs_off() {
        let mut awg = DummyAwg::new("/dev/ttyUSB0", 115_200);
        awg.enable_output(1, true).unwrap();
        awg.initialize().unwrap();
        assert!(awg.is_connected());
        assert!(!awg.channel(1).unwrap().output);
        awg.disconnect().unwrap();
        assert!(!awg.is_connected());
    }
}
