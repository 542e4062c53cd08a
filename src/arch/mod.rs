mod builder;
pub mod functional;
mod init;
pub mod layers;
pub mod loss;
mod param;
mod sequential;

pub use builder::build_model;
pub use param::Param;
pub use sequential::Sequential;
