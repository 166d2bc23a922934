//! Trains, their reservations and the signals they obey.

pub mod follow;
pub mod reservation;
pub mod signal;
pub mod pbs;
pub mod pathfinder;
pub mod dynamics;
pub mod consist;
pub mod controller;
pub mod orders;
pub mod stuck;
pub mod world;

pub use self::world::World;
