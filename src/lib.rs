pub mod client;
pub mod codec;
pub mod frame;
pub mod pubsub;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
