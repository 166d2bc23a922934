//! Vehicles, trains and the consist view over the vehicle arena.
//!
//! Every vehicle has a coordinate along its train's path. The path is the
//! sequence of directed tile pieces the train covers, rear first; one
//! coordinate unit is one sub-tile step. Moving a vehicle is incrementing its
//! coordinate, and its tile and world position follow from the path.

use crate::ids::*;
use crate::map::*;
use crate::railway::orders::{LoadingState, Order};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use smallvec::SmallVec;
use std::collections::VecDeque;

/// Cargo units weighing one tonne.
pub const CARGO_UNITS_PER_TONNE: u32 = 16;

/// Inward offset on a depot tile where a vehicle disappears.
pub const DEPOT_HIDE_OFFSET: u32 = 8;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub name: String,
    pub is_engine: bool,
    pub power_kw: u32,
    pub weight_t: u32,
    /// km-ish/h, 0 for no limit.
    pub max_speed: u32,
    pub max_te_kn: u32,
    /// Length in sub-tile steps; a straight tile is 16.
    pub length: u8,
    pub railtype: RailType,
    pub capacity: u32,
    /// Cargos the vehicle can be refitted to; the first one is the default.
    pub cargos: Vec<String>,
}

impl EngineInfo {
    pub fn cost(&self) -> i64 {
        self.power_kw as i64 * 10 + self.weight_t as i64 * 50
    }

    pub fn default_cargo(&self) -> String {
        self.cargos.first().cloned().unwrap_or_else(|| "goods".to_string())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlopeState {
    Level,
    GoingUp,
    GoingDown,
}

impl Default for SlopeState {
    fn default() -> SlopeState {
        SlopeState::Level
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub engine: EngineId,
    /// Front vehicle of the consist this vehicle belongs to.
    pub train: Option<VehicleId>,
    pub tile: TileIndex,
    pub trackdir: Trackdir,
    pub coord: i64,
    /// World position in sub-tile units.
    pub pos: (i32, i32),
    pub hidden: bool,
    pub in_wormhole: bool,
    pub crashed: bool,
    pub slope: SlopeState,
    pub cargo: u32,
    pub cargo_type: String,
    /// Drawn the other way round; only changes the look of the unit.
    pub flipped: bool,
}

impl Vehicle {
    pub fn new(engine: EngineId, info: &EngineInfo) -> Vehicle {
        Vehicle {
            engine,
            train: None,
            tile: 0,
            trackdir: Trackdir::new(Track::X, false),
            coord: 0,
            pos: (0, 0),
            hidden: true,
            in_wormhole: false,
            crashed: false,
            slope: SlopeState::Level,
            cargo: 0,
            cargo_type: info.default_cargo(),
            flipped: false,
        }
    }
}

/// One directed tile piece of a train's path.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathEntry {
    pub tile: TileIndex,
    pub trackdir: Trackdir,
    pub start: i64,
    pub len: u32,
    /// The inside of a tunnel or bridge; `tile` is the entrance portal.
    pub wormhole: bool,
}

impl PathEntry {
    pub fn end(&self) -> i64 {
        self.start + self.len as i64
    }

    pub fn contains(&self, coord: i64) -> bool {
        coord >= self.start && coord < self.end()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForceProceed {
    None,
    /// Ignore being stuck, but stop at the next signal.
    Stuck,
    /// Pass the next signal, then behave as `Stuck`.
    Signal,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerFlags {
    pub powered_wagons: bool,
    pub has_power: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationFlags {
    pub stuck: bool,
    pub stuck_advised: bool,
    /// The stuck handler already reversed the train in this episode.
    pub stuck_reversed: bool,
    pub no_path: bool,
    pub leaving_station: bool,
    pub reversing: bool,
    pub waiting_at_signal: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainState {
    InDepot,
    Moving,
    StoppedAtSignal,
    Loading,
    Stuck,
    Reversing,
    Crashed,
}

/// Aggregates recomputed whenever the composition or the rail under the train changes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistCache {
    pub power_kw: u32,
    pub weight_t: u32,
    pub max_te_kn: u32,
    pub max_speed: u32,
    pub total_length: u32,
    /// Distance from each vehicle to the one behind it.
    pub offsets: Vec<i64>,
    pub air_drag: u32,
    pub railtypes: RailTypes,
    /// Rail the power figures were computed for.
    pub on_railtype: Option<RailType>,
    pub num_vehicles: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Train {
    pub name: String,
    pub owner: Owner,
    pub members: SmallVec<[VehicleId; 8]>,
    pub path: VecDeque<PathEntry>,
    pub speed: u32,
    pub subspeed: u8,
    pub progress: u32,
    pub cache: ConsistCache,
    pub power: PowerFlags,
    pub res: ReservationFlags,
    pub stopped: bool,
    pub crashed_at: Option<u64>,
    pub force_proceed: ForceProceed,
    pub wait_counter: u32,
    pub orders: Option<OrderListId>,
    pub order_index: usize,
    pub current_order: Order,
    /// The current order was given directly and is not part of the order list.
    pub order_is_manual: bool,
    pub dest_tile: Option<TileIndex>,
    pub last_station_visited: Option<StationId>,
    pub loading: Option<LoadingState>,
    /// Percent.
    pub reliability: u32,
    pub age_days: u32,
    pub days_since_service: u32,
    /// The pathfinder found a route last time it was asked.
    pub had_path: bool,
}

impl Train {
    pub fn new(name: &str, owner: Owner) -> Train {
        Train {
            name: name.to_string(),
            owner,
            members: SmallVec::new(),
            path: VecDeque::new(),
            speed: 0,
            subspeed: 0,
            progress: 0,
            cache: ConsistCache::default(),
            power: PowerFlags::default(),
            res: ReservationFlags::default(),
            stopped: false,
            crashed_at: None,
            force_proceed: ForceProceed::None,
            wait_counter: 0,
            orders: None,
            order_index: 0,
            current_order: Order::Nothing,
            order_is_manual: false,
            dest_tile: None,
            last_station_visited: None,
            loading: None,
            reliability: 100,
            age_days: 0,
            days_since_service: 0,
            had_path: true,
        }
    }

    pub fn front(&self) -> VehicleId {
        self.members[0]
    }

    pub fn rear(&self) -> VehicleId {
        self.members[self.members.len() - 1]
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed_at.is_some()
    }

    /// Path entry holding `coord`.
    pub fn entry_at(&self, coord: i64) -> Option<&PathEntry> {
        self.path.iter().find(|e| e.contains(coord))
    }

    pub fn head(&self) -> Option<&PathEntry> {
        self.path.back()
    }
}

pub type Vehicles = SlotMap<VehicleId, Vehicle>;

/// A consist found broken while moving it.
#[derive(Debug, Fail)]
pub enum ConsistError {
    #[fail(display = "train {} has no vehicles", _0)]
    Empty(String),
    #[fail(display = "train {} lost vehicle {} of its chain", _0, _1)]
    MissingVehicle(String, usize),
    #[fail(display = "vehicle {} of train {} belongs to another train", _1, _0)]
    ForeignVehicle(String, usize),
    #[fail(display = "vehicle {} of train {} is off its path", _1, _0)]
    Disconnected(String, usize),
    #[fail(display = "train {} is led by a wagon", _0)]
    WagonInFront(String),
}

/// Checks that the chain of `id` is whole and every visible member stands on its path.
pub fn check_chain(id: VehicleId, train: &Train, vehicles: &Vehicles, engines: &[EngineInfo]) -> Result<(), ConsistError> {
    if train.members.is_empty() || train.path.is_empty() {
        return Err(ConsistError::Empty(train.name.clone()));
    }
    for (i, m) in train.members.iter().enumerate() {
        let v = vehicles
            .get(*m)
            .ok_or_else(|| ConsistError::MissingVehicle(train.name.clone(), i))?;
        if v.train != Some(id) {
            return Err(ConsistError::ForeignVehicle(train.name.clone(), i));
        }
        if train.entry_at(v.coord).is_none() {
            return Err(ConsistError::Disconnected(train.name.clone(), i));
        }
        if i == 0 && !engines.get(v.engine as usize).map(|e| e.is_engine).unwrap_or(false) {
            return Err(ConsistError::WagonInFront(train.name.clone()));
        }
    }
    Ok(())
}

/// Distance kept between a vehicle of length `len` and the vehicle of length `next_len` behind it.
pub fn next_vehicle_offset(len: u8, next_len: u8) -> i64 {
    (len as i64) / 2 + (next_len as i64 + 1) / 2
}

fn length_of(vehicles: &Vehicles, engines: &[EngineInfo], v: VehicleId) -> u8 {
    vehicles
        .get(v)
        .and_then(|v| engines.get(v.engine as usize))
        .map(|e| e.length)
        .unwrap_or(8)
}

/// Recomputes the consist cache. `railtype` is the rail under the front vehicle.
pub fn compute_cache(
    members: &[VehicleId],
    vehicles: &Vehicles,
    engines: &[EngineInfo],
    railtype: Option<RailType>,
) -> ConsistCache {
    let mut c = ConsistCache {
        railtypes: RailTypes(0xff),
        on_railtype: railtype,
        ..ConsistCache::default()
    };
    let mut max_speed = u32::max_value();
    for (i, &id) in members.iter().enumerate() {
        let v = match vehicles.get(id) {
            Some(v) => v,
            None => continue,
        };
        let e = match engines.get(v.engine as usize) {
            Some(e) => e,
            None => continue,
        };
        let powered = railtype.map(|rt| e.railtype.powered().contains(rt)).unwrap_or(true);
        if e.power_kw > 0 && powered {
            c.power_kw += e.power_kw;
            c.max_te_kn += e.max_te_kn;
        }
        c.weight_t += e.weight_t + v.cargo / CARGO_UNITS_PER_TONNE;
        if e.max_speed > 0 {
            max_speed = max_speed.min(e.max_speed);
        }
        c.total_length += e.length as u32;
        c.railtypes = RailTypes(c.railtypes.0 & e.railtype.compatible().0);
        let next_len = members
            .get(i + 1)
            .map(|n| length_of(vehicles, engines, *n));
        if let Some(next_len) = next_len {
            c.offsets.push(next_vehicle_offset(e.length, next_len));
        }
    }
    c.num_vehicles = members.len() as u32;
    c.max_speed = if max_speed == u32::max_value() { 0 } else { max_speed };
    let base_drag = if c.max_speed == 0 || c.max_speed <= 10 {
        192
    } else {
        (2048 / c.max_speed).max(1)
    };
    c.air_drag = base_drag + 3 * base_drag * c.num_vehicles / 20;
    c
}

/// Recomputes the cache and the power flags of a train.
pub fn consist_changed(train: &mut Train, vehicles: &Vehicles, engines: &[EngineInfo], railtype: Option<RailType>) {
    train.cache = compute_cache(&train.members, vehicles, engines, railtype);
    train.power.has_power = train.cache.power_kw > 0;
    train.power.powered_wagons = train.members.iter().skip(1).any(|id| {
        vehicles
            .get(*id)
            .and_then(|v| engines.get(v.engine as usize))
            .map(|e| !e.is_engine && e.power_kw > 0)
            .unwrap_or(false)
    });
}

/// World position of a path coordinate, with the tile it lies on.
pub fn position_on(map: &Map, e: &PathEntry, coord: i64) -> (TileIndex, (i32, i32)) {
    let offset = (coord - e.start).max(0) as u32;
    let (tile, local) = if e.wormhole {
        let dir = e.trackdir.exit();
        let mut tile = e.tile;
        for _ in 0..(offset / TILE_SIZE as u32 + 1) {
            tile = map.neighbour(tile, dir).unwrap_or(tile);
        }
        (tile, e.trackdir.local_position(offset % TILE_SIZE as u32))
    } else {
        (e.tile, e.trackdir.local_position(offset.min(e.len.saturating_sub(1))))
    };
    let (x, y) = map.xy(tile);
    (tile, (x as i32 * TILE_SIZE + local.0, y as i32 * TILE_SIZE + local.1))
}

fn slope_state(map: &Map, tile: TileIndex, td: Trackdir) -> SlopeState {
    match map.tile(tile).slope {
        Slope::Flat => SlopeState::Level,
        Slope::Inclined(d) if d == td.exit() => SlopeState::GoingUp,
        Slope::Inclined(d) if d == td.entry() => SlopeState::GoingDown,
        Slope::Inclined(_) => SlopeState::Level,
    }
}

/// Derives tile, trackdir, position and slope of every member from its coordinate.
pub fn place_vehicles(map: &Map, train: &Train, vehicles: &mut Vehicles) {
    for &id in train.members.iter() {
        let v = match vehicles.get_mut(id) {
            Some(v) => v,
            None => continue,
        };
        if let Some(e) = train.entry_at(v.coord) {
            let (tile, pos) = position_on(map, e, v.coord);
            v.tile = tile;
            v.pos = pos;
            v.trackdir = e.trackdir;
            v.in_wormhole = e.wormhole;
            v.slope = if e.wormhole {
                SlopeState::Level
            } else {
                slope_state(map, tile, e.trackdir)
            };
        }
    }
}

fn advance_range(train: &Train, vehicles: &mut Vehicles, first: usize, last: usize, steps: i64) {
    if steps <= 0 {
        return;
    }
    for &id in &train.members[first..=last] {
        if let Some(v) = vehicles.get_mut(id) {
            v.coord += steps;
        }
    }
}

fn offset_of(train: &Train, i: usize) -> i64 {
    train.cache.offsets.get(i).cloned().unwrap_or(0)
}

/// Shifts the middle of the consist so that after the swap every vehicle
/// keeps the spacing its own length asks for.
fn advance_wagons_before_swap(train: &Train, vehicles: &mut Vehicles) {
    let n = train.members.len();
    let (mut base, mut last, mut length) = (0usize, n - 1, n);
    while length > 2 {
        last -= 1;
        let first = base + 1;
        let differential = offset_of(train, base) - offset_of(train, last);
        advance_range(train, vehicles, first, last, differential);
        base = first;
        length -= 2;
    }
}

fn advance_wagons_after_swap(train: &Train, vehicles: &mut Vehicles) {
    let n = train.members.len();
    let (mut base, mut last, mut length) = (0usize, n - 1, n);
    while length > 2 {
        last -= 1;
        let first = base + 1;
        let differential = offset_of(train, last) - offset_of(train, base);
        advance_range(train, vehicles, first, last, differential);
        base = first;
        length -= 2;
    }
}

/// Turns the consist around in place. The chain order is kept: vehicle `i` takes the
/// place of vehicle `n-1-i` and the path is mirrored.
pub fn reverse_consist(map: &Map, train: &mut Train, vehicles: &mut Vehicles) {
    let n = train.members.len();
    if n == 0 || train.path.is_empty() {
        return;
    }
    advance_wagons_before_swap(train, vehicles);

    for i in 0..n / 2 {
        let (a, b) = (train.members[i], train.members[n - 1 - i]);
        let pa = vehicles.get(a).map(|v| (v.coord, v.hidden));
        let pb = vehicles.get(b).map(|v| (v.coord, v.hidden));
        if let (Some(pa), Some(pb)) = (pa, pb) {
            if let Some(v) = vehicles.get_mut(a) {
                v.coord = pb.0;
                v.hidden = pb.1;
            }
            if let Some(v) = vehicles.get_mut(b) {
                v.coord = pa.0;
                v.hidden = pa.1;
            }
        }
    }

    let lo = train.path.front().map(|e| e.start).unwrap_or(0);
    let hi = train.path.back().map(|e| e.end()).unwrap_or(0);
    let mirrored: VecDeque<PathEntry> = train
        .path
        .iter()
        .rev()
        .map(|e| {
            let (tile, trackdir) = if e.wormhole {
                // the far portal becomes the entrance
                let far = map.tunnel_bridge(e.tile).map(|(_, _, o)| o).unwrap_or(e.tile);
                (far, e.trackdir.reverse())
            } else {
                (e.tile, e.trackdir.reverse())
            };
            PathEntry {
                tile,
                trackdir,
                start: lo + hi - e.end(),
                len: e.len,
                wormhole: e.wormhole,
            }
        })
        .collect();
    train.path = mirrored;
    for &id in train.members.iter() {
        if let Some(v) = vehicles.get_mut(id) {
            v.coord = lo + hi - 1 - v.coord;
        }
    }

    advance_wagons_after_swap(train, vehicles);
    place_vehicles(map, train, vehicles);
}

/// Drops path entries no vehicle stands on any more, returning them rear first.
pub fn trim_path_behind(train: &mut Train, vehicles: &Vehicles) -> Vec<PathEntry> {
    let rear = train
        .members
        .iter()
        .filter_map(|id| vehicles.get(*id))
        .map(|v| v.coord)
        .min();
    let mut left = vec![];
    if let Some(rear) = rear {
        while train.path.len() > 1 && train.path.front().map(|e| e.end() <= rear).unwrap_or(false) {
            if let Some(e) = train.path.pop_front() {
                left.push(e);
            }
        }
    }
    left
}

/// Lays a consist out on a straight run of path entries, front at the end of
/// the last entry minus `front_margin` steps, keeping the natural spacing.
pub fn line_up(map: &Map, train: &mut Train, vehicles: &mut Vehicles, front_margin: i64) {
    let end = train.path.back().map(|e| e.end()).unwrap_or(0);
    let mut coord = end - 1 - front_margin;
    for i in 0..train.members.len() {
        if let Some(v) = vehicles.get_mut(train.members[i]) {
            v.coord = coord;
            v.hidden = false;
        }
        coord -= offset_of(train, i);
    }
    place_vehicles(map, train, vehicles);
}

impl crate::railway::signal::Occupancy for Vehicles {
    fn occupied(&self, tile: TileIndex) -> bool {
        self.values()
            .any(|v| v.train.is_some() && !v.crashed && !v.hidden && !v.in_wormhole && v.tile == tile)
    }

    fn approaching(&self, map: &Map, tile: TileIndex) -> bool {
        self.values().any(|v| {
            !v.crashed
                && !v.hidden
                && v.train.is_some()
                && map.neighbour(v.tile, v.trackdir.exit()) == Some(tile)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(len: u8) -> EngineInfo {
        EngineInfo {
            name: format!("e{}", len),
            is_engine: len == 8,
            power_kw: if len == 8 { 1000 } else { 0 },
            weight_t: 50,
            max_speed: 100,
            max_te_kn: 200,
            length: len,
            railtype: RailType::Rail,
            capacity: 0,
            cargos: vec![],
        }
    }

    #[test]
    fn offsets_follow_lengths() {
        assert_eq!(next_vehicle_offset(8, 8), 8);
        assert_eq!(next_vehicle_offset(8, 6), 7);
        assert_eq!(next_vehicle_offset(6, 8), 7);
        assert_eq!(next_vehicle_offset(3, 4), 3);
    }

    #[test]
    fn cache_sums_and_limits() {
        let engines = vec![engine(8), engine(6)];
        let mut vs: Vehicles = SlotMap::with_key();
        let ids: Vec<VehicleId> = [0u16, 1, 1]
            .iter()
            .map(|&e| vs.insert(Vehicle::new(e, &engines[e as usize])))
            .collect();
        let c = compute_cache(&ids, &vs, &engines, Some(RailType::Rail));
        assert_eq!(c.power_kw, 1000);
        assert_eq!(c.weight_t, 150);
        assert_eq!(c.total_length, 20);
        assert_eq!(c.offsets, vec![7, 6]);
        assert_eq!(c.max_speed, 100);
        assert!(c.railtypes.contains(RailType::Electric));
        let on_mono = compute_cache(&ids, &vs, &engines, Some(RailType::Monorail));
        assert_eq!(on_mono.power_kw, 0);
    }
}
