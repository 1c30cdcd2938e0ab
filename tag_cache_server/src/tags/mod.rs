pub mod engine;
pub mod live_view;
pub mod quality;
pub mod structures;
