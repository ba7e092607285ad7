//! flashdeck: a bench flashing station for FT232H-based programmer adapters.
//!
//! The library watches USB for programmer adapters, tracks them in a
//! [`registry::Registry`], and drives claimed devices through the staged
//! flash sequence (connect, stub upload, erase, write, verify, reset) with
//! per-stage retry and timeout policy. Progress and outcomes stream to the
//! operator front end over the [`bus::EventBus`]; the front end issues
//! start/cancel commands back over the same bus.
//!
//! The byte-level chip protocol lives behind the [`engine::FlashEngine`]
//! trait; the core never touches the port itself.

pub mod bus;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod event;
pub mod image;
pub mod registry;
pub mod session;
pub mod tracing;
pub mod transport;
pub mod watcher;

pub use config::Config;
pub use error::{Error, Result};
