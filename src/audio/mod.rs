//! Audio subsystem: click synthesis and device output

pub mod device;
pub mod output;
pub mod stub;
pub mod synth;

pub use device::{list_output_devices, CpalDevice, OutputDeviceInfo};
pub use output::{AudioDevice, AudioOutput, DeviceState, Ready};
pub use stub::{StubDevice, StubOptions};
pub use synth::{synthesize, ClickBuffer, ClickKind};
