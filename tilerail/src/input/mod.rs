pub mod scenario;
pub mod settings;
