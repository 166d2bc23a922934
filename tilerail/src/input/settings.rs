//! Game settings, read from an optional TOML file. Every missing key keeps its default.

use crate::railway::dynamics::AccelerationModel;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathfinderKind {
    #[serde(rename = "astar")]
    AStar,
    #[serde(rename = "direct")]
    Direct,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathfindingSettings {
    pub pathfinder: PathfinderKind,
    pub forbid_90_deg: bool,
    /// Reserve paths even where only block signals are used.
    pub reserve_paths: bool,
    /// Ticks between retries of a stuck train.
    pub path_backoff_interval: u32,
    /// Days a stuck train waits before turning around.
    pub wait_for_pbs_path: u32,
    pub reverse_at_signals: bool,
    pub wait_oneway_signal: u32,
    pub wait_twoway_signal: u32,
    pub max_search_nodes: usize,
    /// 0 searches as far as the node limit allows.
    pub max_depot_search_tiles: u32,
    pub tile_cost: u32,
    pub corner_cost: u32,
    pub curve_penalty: u32,
    pub signal_penalty: u32,
    pub red_signal_penalty: u32,
    pub station_penalty: u32,
    pub reserved_penalty: u32,
}

impl Default for PathfindingSettings {
    fn default() -> PathfindingSettings {
        PathfindingSettings {
            pathfinder: PathfinderKind::AStar,
            forbid_90_deg: false,
            reserve_paths: false,
            path_backoff_interval: 20,
            wait_for_pbs_path: 30,
            reverse_at_signals: true,
            wait_oneway_signal: 15,
            wait_twoway_signal: 41,
            max_search_nodes: 10000,
            max_depot_search_tiles: 0,
            tile_cost: 100,
            corner_cost: 71,
            curve_penalty: 50,
            signal_penalty: 100,
            red_signal_penalty: 1000,
            station_penalty: 300,
            reserved_penalty: 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleSettings {
    pub acceleration_model: AccelerationModel,
    /// In tiles.
    pub max_train_length: u32,
    /// Percent.
    pub slope_steepness: u32,
    /// Days between services, 0 to disable.
    pub service_interval: u32,
    /// Reliability does not decay with time.
    pub never_expire: bool,
}

impl Default for VehicleSettings {
    fn default() -> VehicleSettings {
        VehicleSettings {
            acceleration_model: AccelerationModel::Realistic,
            max_train_length: 64,
            slope_steepness: 3,
            service_interval: 150,
            never_expire: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSettings {
    pub day_ticks: u32,
    pub news_review_interval: u32,
    pub loading_ticks: u32,
    pub crash_clear_ticks: u32,
    pub seed: u64,
    pub max_orders: usize,
    pub max_order_lists: usize,
}

impl Default for GameSettings {
    fn default() -> GameSettings {
        GameSettings {
            day_ticks: 74,
            news_review_interval: 74,
            loading_ticks: 20,
            crash_clear_ticks: 4440,
            seed: 0,
            max_orders: 254,
            max_order_lists: 4000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pathfinding: PathfindingSettings,
    pub vehicle: VehicleSettings,
    pub game: GameSettings,
}

impl Settings {
    /// Ticks in one game day, never zero.
    pub fn day_ticks(&self) -> u32 {
        self.game.day_ticks.max(1)
    }
}

pub fn parse_settings(s: &str) -> Result<Settings, toml::de::Error> {
    toml::from_str(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_defaults() {
        assert_eq!(parse_settings("").unwrap(), Settings::default());
    }

    #[test]
    fn partial_sections() {
        let s = parse_settings(
            r#"
            [pathfinding]
            pathfinder = "direct"
            reserve_paths = true
            path_backoff_interval = 5

            [vehicle]
            acceleration_model = "original"
            "#,
        )
        .unwrap();
        assert_eq!(s.pathfinding.pathfinder, PathfinderKind::Direct);
        assert!(s.pathfinding.reserve_paths);
        assert_eq!(s.pathfinding.path_backoff_interval, 5);
        assert_eq!(s.pathfinding.wait_for_pbs_path, 30);
        assert_eq!(s.vehicle.acceleration_model, AccelerationModel::Original);
        assert_eq!(s.vehicle.max_train_length, 64);
        assert_eq!(s.game, GameSettings::default());
    }

    #[test]
    fn malformed_is_an_error() {
        assert!(parse_settings("[pathfinding]\npathfinder = \"dijkstra\"").is_err());
        assert!(parse_settings("[game\nday_ticks = 3").is_err());
    }
}
