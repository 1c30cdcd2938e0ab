pub mod changes;
pub mod settings;
