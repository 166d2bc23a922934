//! The tile grid service: track pieces, signals, ownership and slopes per tile.

pub mod tile;
pub mod track;

pub use self::tile::*;
pub use self::track::*;
