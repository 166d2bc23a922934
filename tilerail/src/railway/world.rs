//! The world aggregate: the map, the vehicle arena, trains and the registries
//! they refer to.

use crate::ids::*;
use crate::input::settings::Settings;
use crate::map::*;
use crate::news::{AdviceKind, NewsQueue};
use crate::output::history::{History, InfrastructureLogEvent, TrainLogEvent};
use crate::railway::consist::*;
use crate::railway::follow::TrackFollower;
use crate::railway::orders::{Order, OrderPool};
use crate::railway::reservation;
use crate::railway::signal::{self, SegmentState, SignalBuffer};
use log::{debug, info};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, VecDeque};

/// Ticks between two wreck vehicles being cleared away.
pub const WRECK_CLEAR_INTERVAL: u64 = 32;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StationInfo {
    pub name: String,
    /// Waypoints are passed through, never stopped at.
    pub waypoint: bool,
    pub tiles: Vec<TileIndex>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DepotInfo {
    pub name: String,
    pub tile: TileIndex,
}

pub struct World {
    pub map: Map,
    pub settings: Settings,
    pub engines: Vec<EngineInfo>,
    pub vehicles: Vehicles,
    /// Trains keyed by their front vehicle, processed in key order.
    pub trains: BTreeMap<VehicleId, Train>,
    pub orders: OrderPool,
    pub stations: Vec<StationInfo>,
    pub depots: Vec<DepotInfo>,
    pub news: NewsQueue,
    pub tick: u64,
    pub rng: ChaCha8Rng,
    pub signal_buffer: SignalBuffer,
    pub history: History,
}

impl World {
    pub fn new(map: Map, settings: Settings) -> World {
        let rng = ChaCha8Rng::seed_from_u64(settings.game.seed);
        World {
            map,
            settings,
            engines: vec![],
            vehicles: Vehicles::with_key(),
            trains: BTreeMap::new(),
            orders: OrderPool::default(),
            stations: vec![],
            depots: vec![],
            news: NewsQueue::default(),
            tick: 0,
            rng,
            signal_buffer: SignalBuffer::default(),
            history: History::default(),
        }
    }

    pub fn follower(&self, train: &Train) -> TrackFollower<'_> {
        TrackFollower::new(
            &self.map,
            train.owner,
            train.cache.railtypes,
            self.settings.pathfinding.forbid_90_deg,
        )
    }

    pub fn train_ids(&self) -> Vec<VehicleId> {
        self.trains.keys().cloned().collect()
    }

    pub fn front_tile(&self, train: &Train) -> Option<TileIndex> {
        train.members.first().and_then(|m| self.vehicles.get(*m)).map(|v| v.tile)
    }

    /// Tile and trackdir the front vehicle is on. Inside a wormhole this is the far portal.
    pub fn front_position(&self, train: &Train) -> Option<(TileIndex, Trackdir)> {
        let head = train.head()?;
        if head.wormhole {
            let far = self.map.tunnel_bridge(head.tile).map(|(_, _, o)| o)?;
            Some((far, head.trackdir))
        } else {
            Some((head.tile, head.trackdir))
        }
    }

    pub fn station_tile(&self, station: StationId) -> Option<TileIndex> {
        let info = self.stations.get(station as usize)?;
        info.tiles
            .iter()
            .cloned()
            .find(|t| self.map.station_id(*t) == Some(station))
    }

    pub fn depot_tile(&self, depot: DepotId) -> Option<TileIndex> {
        self.depots
            .get(depot as usize)
            .map(|d| d.tile)
            .filter(|t| self.map.depot(*t).map(|(id, _)| id) == Some(depot))
    }

    pub fn station_by_name(&self, name: &str) -> Option<StationId> {
        self.stations.iter().position(|s| s.name == name).map(|i| i as StationId)
    }

    pub fn depot_by_name(&self, name: &str) -> Option<DepotId> {
        self.depots.iter().position(|d| d.name == name).map(|i| i as DepotId)
    }

    pub fn engine_by_name(&self, name: &str) -> Option<EngineId> {
        self.engines.iter().position(|e| e.name == name).map(|i| i as EngineId)
    }

    pub fn train_by_name(&self, name: &str) -> Option<VehicleId> {
        self.trains.iter().find(|(_, t)| t.name == name).map(|(id, _)| *id)
    }

    pub fn add_engine(&mut self, info: EngineInfo) -> EngineId {
        self.engines.push(info);
        (self.engines.len() - 1) as EngineId
    }

    /// Registers a station or waypoint tile, creating the station on first use of `name`.
    pub fn add_station_tile(&mut self, name: &str, waypoint: bool, tile: TileIndex) -> StationId {
        let id = match self.station_by_name(name) {
            Some(id) => id,
            None => {
                self.stations.push(StationInfo {
                    name: name.to_string(),
                    waypoint,
                    tiles: vec![],
                });
                (self.stations.len() - 1) as StationId
            }
        };
        if let Some(s) = self.stations.get_mut(id as usize) {
            s.tiles.push(tile);
        }
        id
    }

    pub fn add_depot(&mut self, name: &str, tile: TileIndex) -> DepotId {
        self.depots.push(DepotInfo {
            name: name.to_string(),
            tile,
        });
        (self.depots.len() - 1) as DepotId
    }

    /// Every vehicle of the train is hidden inside a depot.
    pub fn is_in_depot(&self, id: VehicleId) -> bool {
        let train = match self.trains.get(&id) {
            Some(t) => t,
            None => return false,
        };
        let in_depot = self.front_tile(train).and_then(|t| self.map.depot(t)).is_some();
        in_depot
            && train
                .members
                .iter()
                .all(|m| self.vehicles.get(*m).map(|v| v.hidden).unwrap_or(false))
    }

    pub fn stopped_in_depot(&self, id: VehicleId) -> bool {
        self.is_in_depot(id) && self.trains.get(&id).map(|t| t.stopped && t.speed == 0).unwrap_or(false)
    }

    pub fn train_state(&self, id: VehicleId) -> Option<TrainState> {
        let t = self.trains.get(&id)?;
        Some(if t.is_crashed() {
            TrainState::Crashed
        } else if self.is_in_depot(id) {
            TrainState::InDepot
        } else if t.res.stuck {
            TrainState::Stuck
        } else if t.res.reversing {
            TrainState::Reversing
        } else if let Order::Loading { .. } = t.current_order {
            TrainState::Loading
        } else if t.speed == 0 && t.res.waiting_at_signal {
            TrainState::StoppedAtSignal
        } else {
            TrainState::Moving
        })
    }

    pub fn service_train(&mut self, id: VehicleId) {
        if let Some(t) = self.trains.get_mut(&id) {
            t.reliability = 100;
            t.days_since_service = 0;
            debug!("train {} serviced", t.name);
        }
    }

    /// Recomputes the consist cache for the rail under the front vehicle and
    /// force-stops a train left without power.
    pub fn refresh_consist(&mut self, id: VehicleId) {
        let (engines, vehicles, map) = (&self.engines, &self.vehicles, &self.map);
        if let Some(t) = self.trains.get_mut(&id) {
            let rt = t
                .members
                .first()
                .and_then(|m| vehicles.get(*m))
                .map(|v| map.tile(v.tile).railtype);
            consist_changed(t, vehicles, engines, rt);
            if !t.power.has_power && !t.stopped && !t.members.is_empty() {
                info!("train {} has no power and is stopped", t.name);
                t.stopped = true;
            }
        }
    }

    pub fn update_signals(&mut self, tile: TileIndex, side: Option<DiagDir>, owner: Owner) -> SegmentState {
        signal::update_signals_on_segment(&mut self.map, &self.vehicles, tile, side, owner)
    }

    pub fn update_crossing(&mut self, tile: TileIndex) {
        signal::update_level_crossing(&mut self.map, &self.vehicles, tile);
    }

    pub fn update_all_signals(&mut self) {
        signal::update_all_signals(&mut self.map, &self.vehicles);
    }

    /// Runs the flood fills queued by topology changes.
    pub fn flush_signals(&mut self) {
        let (map, buf, vehicles) = (&mut self.map, &mut self.signal_buffer, &self.vehicles);
        buf.flush(map, vehicles);
    }

    pub fn log_train(&mut self, id: VehicleId, ev: TrainLogEvent) {
        let tick = self.tick;
        if let Some(t) = self.trains.get(&id) {
            self.history.record_train(&t.name, tick, ev);
        }
    }

    /// Moves the map's change journal into the infrastructure history.
    pub fn drain_journal(&mut self) {
        let changes = std::mem::replace(&mut self.map.journal, vec![]);
        for c in changes {
            let ev = match c {
                MapChange::Reserved { tile, track, holder } => {
                    let name = holder.and_then(|h| self.trains.get(&h)).map(|t| t.name.clone());
                    InfrastructureLogEvent::Reserved(tile, track, name)
                }
                MapChange::Aspect { tile, trackdir, state } => InfrastructureLogEvent::Aspect(tile, trackdir, state),
                MapChange::Barred { tile, barred } => InfrastructureLogEvent::Crossing(tile, barred),
            };
            self.history.record_inf(self.tick, ev);
        }
    }

    fn create_vehicles(&mut self, front: Option<VehicleId>, consist: &[EngineId]) -> Option<SmallVec<[VehicleId; 8]>> {
        let mut members = SmallVec::new();
        for &e in consist {
            let info = self.engines.get(e as usize)?;
            let mut v = Vehicle::new(e, info);
            v.train = front;
            members.push(self.vehicles.insert(v));
        }
        let front = front.or_else(|| members.first().cloned())?;
        for m in members.iter() {
            if let Some(v) = self.vehicles.get_mut(*m) {
                v.train = Some(front);
            }
        }
        Some(members)
    }

    /// Builds a train parked inside the depot on `tile`.
    pub fn spawn_in_depot(&mut self, name: &str, tile: TileIndex, consist: &[EngineId], stopped: bool) -> Option<VehicleId> {
        let (_, exit) = self.map.depot(tile)?;
        let outward = Trackdir::with_exit(exit.axis().track(), exit)?;
        if consist.is_empty() || consist.iter().any(|e| self.engines.get(*e as usize).is_none()) {
            return None;
        }
        let members = self.create_vehicles(None, consist)?;
        let front = members[0];
        let mut train = Train::new(name, self.map.tile(tile).owner);
        train.members = members;
        train.stopped = stopped;
        train.path.push_back(PathEntry {
            tile,
            trackdir: outward,
            start: 0,
            len: outward.steps(),
            wormhole: false,
        });
        for m in train.members.iter() {
            if let Some(v) = self.vehicles.get_mut(*m) {
                v.coord = DEPOT_HIDE_OFFSET as i64 - 1;
                v.hidden = true;
            }
        }
        consist_changed(&mut train, &self.vehicles, &self.engines, Some(self.map.tile(tile).railtype));
        place_vehicles(&self.map, &train, &mut self.vehicles);
        debug!("train {} built in depot at {}", name, tile);
        self.trains.insert(front, train);
        Some(front)
    }

    /// Places a train on open track with its front in the middle of `tile`,
    /// heading along `td`, and reserves the tiles under it.
    pub fn spawn_on_track(&mut self, name: &str, tile: TileIndex, td: Trackdir, consist: &[EngineId], stopped: bool) -> Option<VehicleId> {
        if consist.is_empty() || !self.map.track_bits(tile).contains(td.track) {
            return None;
        }
        let lengths: Vec<u8> = consist
            .iter()
            .map(|e| self.engines.get(*e as usize).map(|i| i.length))
            .collect::<Option<Vec<u8>>>()?;
        let spacing: i64 = lengths.windows(2).map(|w| next_vehicle_offset(w[0], w[1])).sum();
        let margin = (td.steps() / 2) as i64;
        let needed = spacing + margin + 1;

        let owner = self.map.tile(tile).owner;
        let railtypes = consist
            .iter()
            .filter_map(|e| self.engines.get(*e as usize))
            .fold(RailTypes(0xff), |acc, e| RailTypes(acc.0 & e.railtype.compatible().0));
        let ft = TrackFollower::new(&self.map, owner, railtypes, false).stepwise();

        // walk backwards from the front, collecting pieces in driving order reversed
        let mut back: Vec<PathEntry> = vec![PathEntry {
            tile,
            trackdir: td,
            start: 0,
            len: td.steps(),
            wormhole: false,
        }];
        let mut covered = td.steps() as i64;
        let (mut cur_tile, mut cur_td) = (tile, td.reverse());
        while covered < needed {
            let f = ft.follow(cur_tile, cur_td).ok()?;
            let next = f.new_td_bits.first()?;
            if f.is_tunnel || f.is_bridge {
                let len = TILE_SIZE as u32 * f.tiles_skipped.max(1);
                back.push(PathEntry {
                    tile: f.new_tile,
                    trackdir: next.reverse(),
                    start: 0,
                    len,
                    wormhole: true,
                });
                covered += len as i64;
            }
            back.push(PathEntry {
                tile: f.new_tile,
                trackdir: next.reverse(),
                start: 0,
                len: next.steps(),
                wormhole: false,
            });
            covered += next.steps() as i64;
            cur_tile = f.new_tile;
            cur_td = next;
        }

        let mut path: VecDeque<PathEntry> = back.into_iter().rev().collect();
        let mut start = 0;
        for e in path.iter_mut() {
            e.start = start;
            start += e.len as i64;
        }
        let units: Vec<(TileIndex, Track)> = path.iter().filter(|e| !e.wormhole).map(|e| (e.tile, e.trackdir.track)).collect();
        if units.iter().any(|&(t, tr)| reservation::has_reserved_tracks(&self.map, t, tr.bits() | tr.crossing_tracks())) {
            return None;
        }

        let members = self.create_vehicles(None, consist)?;
        let front = members[0];
        let mut train = Train::new(name, owner);
        train.members = members;
        train.path = path;
        train.stopped = stopped;
        consist_changed(&mut train, &self.vehicles, &self.engines, Some(self.map.tile(tile).railtype));
        line_up(&self.map, &mut train, &mut self.vehicles, margin);
        for (t, tr) in units {
            if reservation::holder(&self.map, t, tr) != Some(front) {
                reservation::try_reserve_track(&mut self.map, t, tr, front);
            }
        }
        debug!("train {} placed at {} {:?}", name, tile, td);
        self.trains.insert(front, train);
        Some(front)
    }

    /// The train's front vehicle changed; moves the train and what it holds to the new key.
    pub fn rekey_train(&mut self, old: VehicleId, new: VehicleId) {
        if old == new {
            return;
        }
        let train = match self.trains.remove(&old) {
            Some(t) => t,
            None => return,
        };
        for (tile, track, who) in reservation::snapshot(&self.map) {
            if who == old && reservation::holder(&self.map, tile, track) == Some(old) {
                reservation::unreserve_track(&mut self.map, tile, track);
                reservation::try_reserve_track(&mut self.map, tile, track, new);
            }
        }
        for m in train.members.iter() {
            if let Some(v) = self.vehicles.get_mut(*m) {
                v.train = Some(new);
            }
        }
        self.trains.insert(new, train);
    }

    /// Deletes a train, its vehicles and everything it holds.
    pub fn remove_train(&mut self, id: VehicleId) {
        let train = match self.trains.remove(&id) {
            Some(t) => t,
            None => return,
        };
        let tiles: Vec<TileIndex> = reservation::snapshot(&self.map)
            .into_iter()
            .filter(|&(_, _, h)| h == id)
            .map(|(t, _, _)| t)
            .collect();
        reservation::release_held_by(&mut self.map, id, &[]);
        if let Some(list) = train.orders {
            self.orders.leave(list);
        }
        for m in train.members.iter() {
            self.vehicles.remove(*m);
        }
        for t in tiles {
            self.signal_buffer.add_tile(&self.map, t);
        }
        self.flush_signals();
        info!("train {} removed", train.name);
    }

    pub fn check_integrity(&self, id: VehicleId) -> Result<(), ConsistError> {
        match self.trains.get(&id) {
            Some(t) => check_chain(id, t, &self.vehicles, &self.engines),
            None => Ok(()),
        }
    }

    /// Tiles whose units stay held under the train's vehicles.
    fn tiles_under(&self, id: VehicleId) -> Vec<TileIndex> {
        let train = match self.trains.get(&id) {
            Some(t) => t,
            None => return vec![],
        };
        train
            .members
            .iter()
            .filter_map(|m| self.vehicles.get(*m))
            .filter(|v| !v.hidden)
            .map(|v| {
                if v.in_wormhole {
                    train.entry_at(v.coord).map(|e| e.tile).unwrap_or(v.tile)
                } else {
                    v.tile
                }
            })
            .collect()
    }

    /// Wrecks a train. Its reservations are released except under the wreckage.
    pub fn crash_train(&mut self, id: VehicleId) {
        let tick = self.tick;
        let (members, tile) = match self.trains.get_mut(&id) {
            Some(t) if !t.is_crashed() => {
                t.crashed_at = Some(tick);
                t.speed = 0;
                t.subspeed = 0;
                t.progress = 0;
                t.res.stuck = false;
                t.res.reversing = false;
                (t.members.clone(), 0)
            }
            _ => return,
        };
        let tile = members
            .first()
            .and_then(|m| self.vehicles.get(*m))
            .map(|v| v.tile)
            .unwrap_or(tile);
        for m in members.iter() {
            let jitter = (self.rng.gen_range(-2..=2), self.rng.gen_range(-2..=2));
            if let Some(v) = self.vehicles.get_mut(*m) {
                v.crashed = true;
                v.pos = (v.pos.0 + jitter.0, v.pos.1 + jitter.1);
            }
        }
        let keep = self.tiles_under(id);
        let held: Vec<TileIndex> = reservation::snapshot(&self.map)
            .into_iter()
            .filter(|&(_, _, h)| h == id)
            .map(|(t, _, _)| t)
            .collect();
        reservation::release_held_by(&mut self.map, id, &keep);
        for t in held.iter().chain(keep.iter()) {
            self.signal_buffer.add_tile(&self.map, *t);
            if self.map.is_crossing(*t) {
                self.update_crossing(*t);
            }
        }
        self.flush_signals();
        if let Some(t) = self.trains.get(&id) {
            info!("train {} crashed at tile {}", t.name, tile);
        }
        self.news.add(AdviceKind::TrainCrashed, id, tile, tick);
        self.log_train(id, TrainLogEvent::Crashed(tile));
    }

    /// Crash caused from outside the railway, e.g. by water.
    pub fn flood_train(&mut self, id: VehicleId) {
        self.crash_train(id);
    }

    /// Clears wreckage one vehicle at a time once the wreck has stood long enough.
    pub fn handle_wrecks(&mut self) {
        let clear_after = self.settings.game.crash_clear_ticks as u64;
        let due: Vec<VehicleId> = self
            .trains
            .iter()
            .filter_map(|(id, t)| t.crashed_at.map(|at| (*id, at)))
            .filter(|&(_, at)| {
                let age = self.tick.saturating_sub(at);
                age >= clear_after && (age - clear_after) % WRECK_CLEAR_INTERVAL == 0
            })
            .map(|(id, _)| id)
            .collect();
        for id in due {
            let last = match self.trains.get_mut(&id) {
                Some(t) if t.members.len() > 1 => t.members.pop(),
                Some(_) => {
                    self.remove_train(id);
                    continue;
                }
                None => continue,
            };
            if let Some(v) = last {
                self.vehicles.remove(v);
            }
            let keep = self.tiles_under(id);
            reservation::release_held_by(&mut self.map, id, &keep);
            if let Some(t) = self.trains.get(&id) {
                debug!("wreck of {} shrinks to {} vehicles", t.name, t.members.len());
            }
        }
    }

    /// Daily bookkeeping: ageing, reliability and service checks.
    pub fn on_new_day(&mut self) {
        let never_expire = self.settings.vehicle.never_expire;
        for id in self.train_ids() {
            match self.trains.get_mut(&id) {
                Some(t) if !t.is_crashed() => {
                    t.age_days += 1;
                    t.days_since_service += 1;
                    if !never_expire && t.days_since_service % 10 == 0 && t.reliability > 25 {
                        t.reliability -= 1;
                    }
                }
                _ => continue,
            }
            self.check_if_train_needs_service(id);
        }
    }
}
