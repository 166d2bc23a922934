mod simulation;
pub use self::simulation::*;
