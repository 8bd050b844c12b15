//! Data models for VitalWatch

mod alert;
mod classification;
mod sample;
mod threshold;

pub use alert::*;
pub use classification::*;
pub use sample::*;
pub use threshold::*;
