//! In-memory cache of live industrial telemetry: tags, alarms and the supervision state of the
//! processes and equipment producing them.

pub mod alarms;
pub mod clock;
pub mod config;
pub mod errors;
pub mod listeners;
pub mod loader;
pub mod logging;
pub mod rules;
pub mod store;
pub mod supervision;
pub mod tags;
