mod config_loader;
mod errors;
mod executor;
mod handler;
mod identifier;
mod logging;
mod registry;
mod session;

pub use config_loader::*;
pub use errors::*;
pub use executor::*;
pub use handler::*;
pub use identifier::*;
pub use logging::*;
pub use registry::*;
pub use session::*;

pub mod prelude {
    pub use crate::config_loader::*;
    pub use crate::errors::*;
    pub use crate::executor::*;
    pub use crate::handler::*;
    pub use crate::identifier::*;
    pub use crate::logging::*;
    pub use crate::registry::*;
    pub use crate::session::*;

    pub use bytes::Bytes;
    pub use tokio_tungstenite::tungstenite::Utf8Bytes;
}
