//! The layers of the launch pipeline.

mod auto_version;
mod eula;
mod monitoring;
mod server_jar;
mod server_properties;
mod world;

pub use auto_version::AutoVersionMiddleware;
pub use eula::EulaMiddleware;
pub use monitoring::MonitoringMiddleware;
pub use server_jar::ServerJarMiddleware;
pub use server_properties::{ServerProperties, ServerPropertiesMiddleware};
pub use world::WorldMiddleware;
