pub mod control;
pub mod protocol;

pub use control::{ByteStream, ControlChannel};
