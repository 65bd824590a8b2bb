pub mod error;
pub mod gxid;
pub mod limits;

pub use error::GtmError;
pub use gxid::Gxid;
