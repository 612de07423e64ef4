pub mod device;
pub mod frame;

pub use device::{Device, Sensor, SensorReading, SensorSnapshot};
pub use frame::{CanonicalFrame, DeviceMeta, SensorReadingInput};
