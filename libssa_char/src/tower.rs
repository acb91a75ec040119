use super::error::HardwareError;

/// Something that can set the SA bias DAC of a column.
///
/// Implementations own the tower addressing (card address and tower column). Calls are
/// blocking and must not retry: after a failure the physical state of the bias is unknown.
pub trait Actuator {
    fn set_channel_voltage(&mut self, channel: usize, dac_value: i32) -> Result<(), HardwareError>;
}

impl<T: Actuator + ?Sized> Actuator for &mut T {
    fn set_channel_voltage(&mut self, channel: usize, dac_value: i32) -> Result<(), HardwareError> {
        (**self).set_channel_voltage(channel, dac_value)
    }
}

impl<T: Actuator + ?Sized> Actuator for Box<T> {
    fn set_channel_voltage(&mut self, channel: usize, dac_value: i32) -> Result<(), HardwareError> {
        (**self).set_channel_voltage(channel, dac_value)
    }
}
