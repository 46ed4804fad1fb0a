//! One loader per module format

mod amf;
mod asylum;
mod dsm;
mod far;
mod gdm;
mod imf;
mod it;
mod m669;
mod s3m;
mod stm;
mod stx;
mod ult;
mod umx;
mod uni;
mod xm;

pub use amf::AmfLoader;
pub use asylum::AsylumLoader;
pub use dsm::DsmLoader;
pub use far::FarLoader;
pub use gdm::GdmLoader;
pub use imf::ImfLoader;
pub use it::ItLoader;
pub use m669::Loader669;
pub use s3m::S3mLoader;
pub use stm::StmLoader;
pub use stx::StxLoader;
pub use ult::UltLoader;
pub use umx::UmxLoader;
pub use uni::UniLoader;
pub use xm::XmLoader;
