//! The per-tick train controller.
//!
//! A tick updates the speed, turns it into a distance budget and spends the
//! budget one sub-tile step at a time. A step that needs a new tile goes
//! through `enter_next_tile`, where tracks are chosen, red signals stop the
//! train and reservations are made. Tiles the rear leaves are released.

use crate::ids::*;
use crate::map::*;
use crate::news::AdviceKind;
use crate::output::history::TrainLogEvent;
use crate::railway::consist::*;
use crate::railway::dynamics::{self, AccelerationModel, DriverAction, SpeedState, TractionParams};
use crate::railway::follow::TrackFollower;
use crate::railway::orders::Order;
use crate::railway::reservation::{self, holder, held_trackbits};
use crate::railway::signal::{signal_blocks, SegmentState};
use crate::railway::world::World;
use log::{debug, info, trace};

/// Visible vehicles of two trains closer than this on both axes collide.
pub const COLLISION_DISTANCE: i32 = 6;

/// Ticks between two attempts of a train to leave its depot.
pub const DEPOT_LEAVE_INTERVAL: u32 = 37;

/// Speed at which a train may still meet a train waiting on the far side of a signal.
const MEETING_SPEED: u32 = 5;

fn is_depot_inward(map: &Map, e: &PathEntry) -> bool {
    !e.wormhole && map.depot(e.tile).map(|(_, exit)| e.trackdir.exit() != exit).unwrap_or(false)
}

impl World {
    /// Runs one tick of the train `id`. A broken consist is reported instead of moved.
    pub fn train_tick(&mut self, id: VehicleId) -> Result<(), ConsistError> {
        self.check_integrity(id)?;
        let (reversing, speed) = match self.trains.get(&id) {
            Some(t) if !t.is_crashed() => (t.res.reversing, t.speed),
            _ => return Ok(()),
        };
        if reversing && speed == 0 {
            self.reverse_train_direction(id);
        }
        if self.trains.get(&id).map(|t| t.stopped && t.speed == 0).unwrap_or(true) {
            return Ok(());
        }

        let had_order = match self.current_order(id) {
            Some(Order::Nothing) | Some(Order::Conditional { .. }) | None => false,
            _ => true,
        };
        self.process_orders(id);

        if let Some(Order::Loading { .. }) = self.current_order(id) {
            if self.handle_loading(id) {
                return Ok(());
            }
            self.leave_station(id);
        }

        if self.check_train_stay_in_depot(id) {
            return Ok(());
        }

        if !had_order {
            match self.current_order(id) {
                Some(Order::Nothing) | None => {}
                Some(_) => self.check_next_train_tile(id),
            }
        }

        if self.handle_stuck(id) {
            return Ok(());
        }

        if let Some(t) = self.trains.get_mut(&id) {
            if t.current_order == Order::LeaveStation {
                t.current_order = Order::Nothing;
            }
        }

        let mut budget = self.update_train_speed(id);
        let mut adv = self.advance_distance(id);
        if budget < adv {
            self.set_progress(id, budget);
            return Ok(());
        }
        if !self.check_if_line_ends(id) {
            self.set_progress(id, 0);
            return Ok(());
        }

        loop {
            budget -= adv;
            if !self.step_train(id) {
                budget = 0;
                break;
            }
            if self.check_train_collision(id) {
                return Ok(());
            }
            if self.check_station_arrival(id) {
                budget = 0;
                break;
            }
            let halted = match self.trains.get(&id) {
                Some(t) => t.speed == 0 || t.is_crashed(),
                None => return Ok(()),
            };
            if halted || self.is_in_depot(id) {
                break;
            }
            adv = self.advance_distance(id);
            if budget < adv {
                break;
            }
        }
        self.set_progress(id, budget);
        Ok(())
    }

    fn current_order(&self, id: VehicleId) -> Option<Order> {
        self.trains.get(&id).map(|t| t.current_order)
    }

    fn set_progress(&mut self, id: VehicleId, progress: u32) {
        if let Some(t) = self.trains.get_mut(&id) {
            t.progress = progress;
        }
    }

    fn advance_distance(&self, id: VehicleId) -> u32 {
        self.trains
            .get(&id)
            .and_then(|t| t.head())
            .map(|e| e.trackdir.direction().advance_distance())
            .unwrap_or(192)
    }

    /// Loading is over: reserve a way out when the segment asks for it.
    fn leave_station(&mut self, id: VehicleId) {
        let (tile, td, owner) = match self.trains.get(&id).and_then(|t| self.front_position(t).map(|p| (p, t.owner))) {
            Some(((tile, td), owner)) => (tile, td, owner),
            None => return,
        };
        let side = if self.map.depot(tile).is_some() || self.map.tunnel_bridge(tile).is_some() {
            None
        } else {
            Some(td.exit())
        };
        if self.update_signals(tile, side, owner) == SegmentState::Pbs || self.settings.pathfinding.reserve_paths {
            self.try_path_reserve(id, true, true);
        }
    }

    fn traction(&self, t: &Train) -> TractionParams {
        let steepness = self.settings.vehicle.slope_steepness as i64;
        let slope_resistance = t
            .members
            .iter()
            .filter_map(|m| self.vehicles.get(*m))
            .filter(|v| !v.hidden)
            .map(|v| {
                let weight = self.engines.get(v.engine as usize).map(|e| e.weight_t).unwrap_or(0)
                    + v.cargo / CARGO_UNITS_PER_TONNE;
                let r = weight as i64 * steepness * 100;
                match v.slope {
                    SlopeState::GoingUp => r,
                    SlopeState::GoingDown => -r,
                    SlopeState::Level => 0,
                }
            })
            .sum();
        TractionParams {
            power_kw: t.cache.power_kw,
            mass_t: t.cache.weight_t,
            max_te_kn: t.cache.max_te_kn,
            air_drag: t.cache.air_drag,
            vehicles: t.cache.num_vehicles,
            slope_resistance,
            maglev: t.cache.on_railtype == Some(RailType::Maglev),
        }
    }

    /// Platform `station` the train will stop at, with the tiles left before its end.
    fn stopping_platform(&self, t: &Train) -> Option<(StationId, u32)> {
        let head = t.head()?;
        if head.wormhole {
            return None;
        }
        let station = self.map.station_id(head.tile)?;
        match t.current_order {
            Order::Loading { .. } | Order::LeaveStation => return None,
            _ => {}
        }
        if !self.should_stop_at_station(t, station) {
            return None;
        }
        let ahead = self.map.platform_length_ahead(head.tile, head.trackdir.exit());
        Some((station, ahead.saturating_sub(1)))
    }

    fn current_max_speed(&self, t: &Train) -> u32 {
        if t.stopped || t.res.reversing {
            return 0;
        }
        let mut max = if t.cache.max_speed == 0 { u32::max_value() } else { t.cache.max_speed };
        if self.settings.vehicle.acceleration_model == AccelerationModel::Realistic {
            if let Some(e) = t.head() {
                if !e.wormhole && self.map.depot(e.tile).is_some() {
                    max = max.min(dynamics::DEPOT_SPEED);
                }
            }
        }
        if let Some((_, tiles_left)) = self.stopping_platform(t) {
            max = max.min((tiles_left * 25).max(15));
        }
        max
    }

    /// Applies this tick's acceleration and returns the distance budget.
    fn update_train_speed(&mut self, id: VehicleId) -> u32 {
        let model = self.settings.vehicle.acceleration_model;
        let (accel, min_speed, max_speed, mut state) = match self.trains.get(&id) {
            Some(t) => {
                let action = if t.stopped || t.res.reversing {
                    DriverAction::Brake
                } else {
                    DriverAction::Accel
                };
                let accel = match model {
                    AccelerationModel::Realistic => dynamics::realistic_acceleration(&self.traction(t), t.speed, action),
                    AccelerationModel::Original => {
                        let a = dynamics::original_acceleration(t.cache.power_kw, t.cache.weight_t);
                        if action == DriverAction::Brake {
                            -2 * a
                        } else {
                            a
                        }
                    }
                };
                let min_speed = if action == DriverAction::Accel && model == AccelerationModel::Realistic {
                    2
                } else {
                    0
                };
                let state = SpeedState {
                    speed: t.speed,
                    subspeed: t.subspeed,
                    progress: t.progress,
                };
                (accel, min_speed, self.current_max_speed(t), state)
            }
            None => return 0,
        };
        let budget = dynamics::update_speed(&mut state, accel, min_speed, max_speed);
        if let Some(t) = self.trains.get_mut(&id) {
            t.speed = state.speed;
            t.subspeed = state.subspeed;
            t.progress = state.progress;
        }
        budget
    }

    /// Slows the train for a red signal or line end on the next tile, turning
    /// it around when it already stands at the line end. False when the train
    /// must not move this tick.
    fn check_if_line_ends(&mut self, id: VehicleId) -> bool {
        let (head, x, half_len, force, stopping) = match self.trains.get(&id) {
            Some(t) => {
                let head = match t.head() {
                    Some(h) => *h,
                    None => return false,
                };
                let front = match self.vehicles.get(t.front()) {
                    Some(v) => v,
                    None => return false,
                };
                if front.hidden {
                    return true;
                }
                let len = self.engines.get(front.engine as usize).map(|e| e.length).unwrap_or(8) as u32;
                let offset = (front.coord - head.start).max(0) as u32;
                let x = head.trackdir.progress16(offset).min(15);
                (head, x, (len + 1) / 2, t.force_proceed, self.stopping_platform(t).is_some())
            }
            None => return false,
        };
        if head.wormhole || is_depot_inward(&self.map, &head) {
            return true;
        }

        let followed = match self.train_follower_of(id) {
            Some(ft) => ft.follow(head.tile, head.trackdir),
            None => return false,
        };
        let signal = match followed {
            Err(_) => false,
            Ok(f) => {
                if self.map.is_crossing(f.new_tile) {
                    self.update_crossing(f.new_tile);
                }
                let held = TrackdirBits::from_tracks(held_trackbits(&self.map, f.new_tile, id));
                let td = TrackdirBits(f.new_td_bits.0 & held.0).first().or_else(|| f.new_td_bits.first());
                match td {
                    Some(td) if force == ForceProceed::None && signal_blocks(&self.map, f.new_tile, td, id) => true,
                    _ => return true,
                }
            }
        };

        let factor = if head.trackdir.direction().is_axial() { 1 } else { 2 };
        if !signal && !stopping && x + half_len * factor >= 16 {
            if let Some(t) = self.trains.get_mut(&id) {
                t.speed = 0;
                t.subspeed = 0;
                trace!("train {} reached a line end at {}", t.name, head.tile);
            }
            self.reverse_train_direction(id);
            return false;
        }
        if let Some(t) = self.trains.get_mut(&id) {
            t.speed = t.speed.min(dynamics::APPROACH_SPEEDS[x as usize]);
        }
        true
    }

    fn train_follower_of(&self, id: VehicleId) -> Option<TrackFollower<'_>> {
        self.trains.get(&id).map(|t| self.follower(t).stepwise())
    }

    /// Moves the whole consist one sub-tile step. False when the train could
    /// not go on.
    fn step_train(&mut self, id: VehicleId) -> bool {
        let needs_tile = match self.trains.get(&id) {
            Some(t) => match (t.head(), self.vehicles.get(t.front())) {
                (Some(head), Some(front)) => !front.hidden && front.coord + 1 >= head.end(),
                _ => return false,
            },
            None => return false,
        };
        if needs_tile && !self.enter_next_tile(id) {
            return false;
        }

        let left = {
            let (map, vehicles) = (&self.map, &mut self.vehicles);
            let t = match self.trains.get_mut(&id) {
                Some(t) => t,
                None => return false,
            };
            let mut ahead: Option<i64> = None;
            for i in 0..t.members.len() {
                let m = t.members[i];
                let (coord, hidden) = match vehicles.get(m) {
                    Some(v) => (v.coord, v.hidden),
                    None => continue,
                };
                if hidden {
                    let parked = t.entry_at(coord).map(|e| is_depot_inward(map, e)).unwrap_or(true);
                    let gap = i
                        .checked_sub(1)
                        .and_then(|p| t.cache.offsets.get(p))
                        .cloned()
                        .unwrap_or(0);
                    // after this step's move the gap is exactly the offset
                    let released = !parked && ahead.map(|a| a - coord > gap).unwrap_or(false);
                    if !released {
                        ahead = None;
                        continue;
                    }
                }
                let mut coord = coord + 1;
                let mut hide = false;
                if let Some(e) = t.entry_at(coord) {
                    if is_depot_inward(map, e) && coord - e.start >= DEPOT_HIDE_OFFSET as i64 {
                        coord = e.start + DEPOT_HIDE_OFFSET as i64;
                        hide = true;
                    }
                }
                if let Some(v) = vehicles.get_mut(m) {
                    v.coord = coord;
                    v.hidden = hide;
                }
                ahead = if hide { None } else { Some(coord) };
            }
            place_vehicles(map, t, vehicles);
            trim_path_behind(t, vehicles)
        };

        let owner = self.trains.get(&id).map(|t| t.owner).unwrap_or(0);
        for e in left {
            if e.wormhole {
                continue;
            }
            let span_free = self.span_free(e.tile);
            reservation::clear_path_reservation(&mut self.map, e.tile, e.trackdir, id, span_free);
            if self.map.is_crossing(e.tile) {
                self.update_crossing(e.tile);
            }
            if self.map.has_signals(e.tile) || self.map.depot(e.tile).is_some() {
                self.update_signals(e.tile, None, owner);
            }
        }

        let head = self.trains.get(&id).and_then(|t| t.head().cloned());
        if let Some(head) = head {
            if self.map.station_id(head.tile).is_none() {
                if let Some(t) = self.trains.get_mut(&id) {
                    t.res.leaving_station = false;
                }
            }
            if is_depot_inward(&self.map, &head) && self.is_in_depot(id) {
                self.vehicle_enter_depot(id);
            }
        }
        true
    }

    /// No vehicle of any train is inside the tunnel or bridge starting at `portal`.
    fn span_free(&self, portal: TileIndex) -> bool {
        let other = match self.map.tunnel_bridge(portal) {
            Some((_, _, o)) => o,
            None => return true,
        };
        !self.trains.values().any(|t| {
            t.path.iter().any(|e| {
                e.wormhole
                    && (e.tile == portal || e.tile == other)
                    && t.members
                        .iter()
                        .filter_map(|m| self.vehicles.get(*m))
                        .any(|v| e.contains(v.coord))
            })
        })
    }

    fn push_entry(&mut self, id: VehicleId, tile: TileIndex, trackdir: Trackdir, len: u32, wormhole: bool) {
        if let Some(t) = self.trains.get_mut(&id) {
            let start = t.head().map(|e| e.end()).unwrap_or(0);
            t.path.push_back(PathEntry {
                tile,
                trackdir,
                start,
                len,
                wormhole,
            });
        }
    }

    fn stop_and_reverse(&mut self, id: VehicleId) {
        if let Some(t) = self.trains.get_mut(&id) {
            t.speed = 0;
            t.subspeed = 0;
            t.wait_counter = 0;
        }
        self.reverse_train_direction(id);
    }

    /// Extends the path by the tile ahead of the front. False when the train
    /// has to stop in front of it.
    fn enter_next_tile(&mut self, id: VehicleId) -> bool {
        let (head, force, waiting, stuck, owner) = match self.trains.get(&id) {
            Some(t) => match t.head() {
                Some(h) => (*h, t.force_proceed, t.res.waiting_at_signal, t.res.stuck, t.owner),
                None => return false,
            },
            None => return false,
        };

        if head.wormhole {
            let far = match self.map.tunnel_bridge(head.tile) {
                Some((_, _, o)) => o,
                None => return false,
            };
            self.push_entry(id, far, head.trackdir, head.trackdir.steps(), false);
            self.entered_tile(id, far, owner);
            return true;
        }

        let followed = match self.train_follower_of(id) {
            Some(ft) => ft.follow(head.tile, head.trackdir),
            None => return false,
        };
        let f = match followed {
            Ok(f) => f,
            Err(e) => {
                debug!("train {:?} cannot go on from {}: {:?}", id, head.tile, e);
                self.stop_and_reverse(id);
                return false;
            }
        };

        if f.is_tunnel || f.is_bridge {
            // the portal reservation covers the span
            let len = TILE_SIZE as u32 * f.tiles_skipped.max(1);
            self.push_entry(id, head.tile, head.trackdir, len, true);
            return true;
        }

        let mark_stuck = waiting && force == ForceProceed::None;
        let (chosen, _) = self.choose_train_track(id, f.new_tile, f.exitdir, f.new_td_bits.tracks(), false, mark_stuck);
        let td = match chosen
            .and_then(|t| t.with_enterdir(f.exitdir))
            .filter(|td| f.new_td_bits.contains(*td))
            .or_else(|| f.new_td_bits.first())
        {
            Some(td) => td,
            None => {
                self.stop_and_reverse(id);
                return false;
            }
        };

        let mut force = force;
        if force != ForceProceed::None && self.map.has_signals(f.new_tile) {
            let against_block = self.map.has_signal_on_trackdir(f.new_tile, td.reverse())
                && !self.map.has_pbs_signal_on_trackdir(f.new_tile, td.reverse());
            if self.map.has_signal_on_trackdir(f.new_tile, td) || against_block {
                force = if force == ForceProceed::Signal {
                    ForceProceed::Stuck
                } else {
                    ForceProceed::None
                };
                if let Some(t) = self.trains.get_mut(&id) {
                    t.force_proceed = force;
                }
            }
        }

        if force == ForceProceed::None && signal_blocks(&self.map, f.new_tile, td, id) {
            return self.wait_at_signal(id, f.new_tile, td, stuck);
        }

        if holder(&self.map, f.new_tile, td.track) != Some(id)
            && !reservation::try_reserve_track(&mut self.map, f.new_tile, td.track, id)
        {
            debug!("train {:?} enters {} without a reservation", id, f.new_tile);
        }
        if self.map.is_crossing(f.new_tile) {
            self.update_crossing(f.new_tile);
        }
        self.push_entry(id, f.new_tile, td, td.steps(), false);
        if let Some(t) = self.trains.get_mut(&id) {
            t.res.waiting_at_signal = false;
            if !t.res.stuck {
                t.wait_counter = 0;
            }
        }
        self.entered_tile(id, f.new_tile, owner);
        true
    }

    fn entered_tile(&mut self, id: VehicleId, tile: TileIndex, owner: Owner) {
        self.log_train(id, TrainLogEvent::EnteredTile(tile));
        if self.map.has_signals(tile) {
            self.update_signals(tile, None, owner);
        }
        self.check_next_train_tile(id);
    }

    /// The train stands in front of a red signal on `tile`. Counts the wait
    /// and turns the train around once it has waited long enough.
    fn wait_at_signal(&mut self, id: VehicleId, tile: TileIndex, td: Trackdir, stuck: bool) -> bool {
        if stuck {
            return false;
        }
        let wait = match self.trains.get_mut(&id) {
            Some(t) => {
                t.speed = 0;
                t.subspeed = 0;
                t.progress = 0;
                t.res.waiting_at_signal = true;
                t.wait_counter += 1;
                t.wait_counter
            }
            None => return false,
        };
        let p = &self.settings.pathfinding;
        let day = self.settings.day_ticks();
        let facing = self.map.has_signal_on_trackdir(tile, td);
        let against = self.map.has_signal_on_trackdir(tile, td.reverse());
        if facing && !against {
            if !p.reverse_at_signals || wait < p.wait_oneway_signal * day {
                return false;
            }
        } else if facing {
            let waited = p.reverse_at_signals && wait >= p.wait_twoway_signal * day;
            if !waited && !self.train_waiting_beyond(id, tile, td) {
                return false;
            }
        }
        debug!("train {:?} gives up waiting at the signal on {}", id, tile);
        self.reverse_train_direction(id);
        false
    }

    /// Another train waits on the far side of the signal on `tile`, facing us.
    fn train_waiting_beyond(&self, id: VehicleId, tile: TileIndex, td: Trackdir) -> bool {
        let exitdir = td.exit();
        let beyond = match self.map.neighbour(tile, exitdir) {
            Some(n) => n,
            None => return false,
        };
        self.trains.iter().any(|(other, t)| {
            *other != id
                && !t.is_crashed()
                && t.speed <= MEETING_SPEED
                && t.head()
                    .map(|e| !e.wormhole && e.tile == beyond && e.trackdir.exit() == exitdir.reverse())
                    .unwrap_or(false)
        })
    }

    /// The train has arrived at its platform stop. Returns true once loading began.
    fn check_station_arrival(&mut self, id: VehicleId) -> bool {
        let (station, tile, arrived, total_length) = match self.trains.get(&id) {
            Some(t) => {
                let (station, tiles_left) = match self.stopping_platform(t) {
                    Some(s) => s,
                    None => return false,
                };
                let head = match t.head() {
                    Some(h) => *h,
                    None => return false,
                };
                let front = match self.vehicles.get(t.front()) {
                    Some(v) => v.coord,
                    None => return false,
                };
                let arrived = tiles_left == 0 && front - head.start >= head.len as i64 - 1;
                (station, head.tile, arrived, t.cache.total_length)
            }
            None => return false,
        };
        if !arrived {
            return false;
        }
        let platform_len = self.map.platform_tiles(tile).len() as u32 * TILE_SIZE as u32;
        if total_length > platform_len {
            let tick = self.tick;
            self.news.add(AdviceKind::TrainTooLong, id, tile, tick);
        }
        self.begin_loading(id, station);
        if let Some(t) = self.trains.get_mut(&id) {
            t.res.waiting_at_signal = false;
            info!("train {} arrived at station {}", t.name, station);
        }
        self.log_train(id, TrainLogEvent::ArrivedAtStation(station));
        true
    }

    /// Visible vehicles of this train run into those of another one that is
    /// off its reservation. Crashes both and returns true.
    fn check_train_collision(&mut self, id: VehicleId) -> bool {
        let unit_tile = |t: &Train, v: &Vehicle| t.entry_at(v.coord).map(|e| e.tile).unwrap_or(v.tile);
        let mine: Vec<((i32, i32), bool)> = match self.trains.get(&id) {
            Some(t) => t
                .members
                .iter()
                .filter_map(|m| self.vehicles.get(*m))
                .filter(|v| !v.hidden)
                .map(|v| (v.pos, holder(&self.map, unit_tile(t, v), v.trackdir.track) == Some(id)))
                .collect(),
            None => return false,
        };
        let mut hit = None;
        'trains: for (other, t) in self.trains.iter() {
            if *other == id {
                continue;
            }
            for v in t.members.iter().filter_map(|m| self.vehicles.get(*m)).filter(|v| !v.hidden) {
                let theirs_held = holder(&self.map, unit_tile(t, v), v.trackdir.track) == Some(*other);
                let close = mine.iter().any(|(p, held)| {
                    (p.0 - v.pos.0).abs() <= COLLISION_DISTANCE
                        && (p.1 - v.pos.1).abs() <= COLLISION_DISTANCE
                        && !(*held && theirs_held)
                });
                if close {
                    hit = Some(*other);
                    break 'trains;
                }
            }
        }
        match hit {
            Some(other) => {
                info!("trains {:?} and {:?} collided", id, other);
                self.crash_train(id);
                self.crash_train(other);
                true
            }
            None => false,
        }
    }

    /// Turns the train around. Frees the reservation ahead and reserves anew
    /// from the new front when the segment needs it.
    pub fn reverse_train_direction(&mut self, id: VehicleId) {
        let stuck = match self.trains.get(&id) {
            Some(t) if !t.is_crashed() => t.res.stuck,
            _ => return,
        };
        if self.is_in_depot(id) {
            return;
        }
        if !stuck {
            self.free_train_track_reservation(id);
        }
        let ahead_before = self.tile_ahead(id);
        {
            let (map, vehicles) = (&self.map, &mut self.vehicles);
            if let Some(t) = self.trains.get_mut(&id) {
                reverse_consist(map, t, vehicles);
                t.res.reversing = false;
                t.speed = 0;
                t.subspeed = 0;
                t.progress = 0;
                debug!("train {} reversed", t.name);
            }
        }
        let (tile, td, owner, loading) = match self
            .trains
            .get(&id)
            .and_then(|t| self.front_position(t).map(|p| (p, t.owner, t.current_order)))
        {
            Some(((tile, td), owner, order)) => (tile, td, owner, matches!(order, Order::Loading { .. })),
            None => return,
        };
        self.log_train(id, TrainLogEvent::Reversed(tile));
        if let Some(c) = ahead_before {
            self.update_crossing(c);
        }
        if let Some(c) = self.tile_ahead(id) {
            self.update_crossing(c);
        }

        let depot = self.map.depot(tile);
        let side = if depot.is_some() || self.map.tunnel_bridge(tile).is_some() {
            None
        } else {
            Some(td.exit())
        };
        if self.update_signals(tile, side, owner) == SegmentState::Pbs || self.settings.pathfinding.reserve_paths {
            let mut first_tile_okay = !(self.map.is_plain_rail(tile)
                && self.map.has_signal_on_trackdir(tile, td)
                && !self.map.has_pbs_signal_on_trackdir(tile, td));
            if depot.map(|(_, exit)| exit == td.exit()).unwrap_or(false) {
                first_tile_okay = false;
            }
            if self.map.station_id(tile).is_some() && holder(&self.map, tile, td.track).is_none() {
                reservation::set_platform_reservation(&mut self.map, tile, Some(id));
            }
            if self.try_path_reserve(id, false, first_tile_okay) {
                self.check_next_train_tile(id);
            } else if !loading {
                self.mark_train_as_stuck(id);
            }
        } else if stuck {
            self.clear_stuck(id);
            if let Some(t) = self.trains.get_mut(&id) {
                t.wait_counter = 0;
            }
        }
    }

    /// The crossing right in front of the train, if any.
    fn tile_ahead(&self, id: VehicleId) -> Option<TileIndex> {
        let (tile, td) = self.trains.get(&id).and_then(|t| self.front_position(t))?;
        self.map
            .neighbour(tile, td.exit())
            .filter(|n| self.map.is_crossing(*n))
    }

    /// The last vehicle disappeared into the depot: park the train, service it
    /// and complete a depot order.
    fn vehicle_enter_depot(&mut self, id: VehicleId) {
        let (tile, depot, exit) = match self
            .trains
            .get(&id)
            .and_then(|t| t.head())
            .and_then(|e| self.map.depot(e.tile).map(|(d, x)| (e.tile, d, x)))
        {
            Some(x) => x,
            None => return,
        };
        let outward = match Trackdir::with_exit(exit.axis().track(), exit) {
            Some(td) => td,
            None => return,
        };
        let owner = {
            let (map, vehicles) = (&self.map, &mut self.vehicles);
            let t = match self.trains.get_mut(&id) {
                Some(t) => t,
                None => return,
            };
            t.path.clear();
            t.path.push_back(PathEntry {
                tile,
                trackdir: outward,
                start: 0,
                len: outward.steps(),
                wormhole: false,
            });
            for m in t.members.iter() {
                if let Some(v) = vehicles.get_mut(*m) {
                    v.coord = DEPOT_HIDE_OFFSET as i64 - 1;
                    v.hidden = true;
                }
            }
            t.speed = 0;
            t.subspeed = 0;
            t.progress = 0;
            t.wait_counter = 0;
            t.res.waiting_at_signal = false;
            t.res.reversing = false;
            place_vehicles(map, t, vehicles);
            info!("train {} entered depot {}", t.name, depot);
            t.owner
        };
        reservation::release_track(&mut self.map, tile, outward.track, id);
        self.update_signals(tile, None, owner);
        self.service_train(id);
        self.log_train(id, TrainLogEvent::EnteredDepot(depot));
        self.clear_stuck(id);

        let num_orders = self.trains.get(&id).map(|t| self.train_orders(t).len()).unwrap_or(0);
        if let Some(t) = self.trains.get_mut(&id) {
            if let Order::GoToDepot { halt, .. } = t.current_order {
                if t.dest_tile.map(|d| d == tile).unwrap_or(true) {
                    if !t.order_is_manual && num_orders > 0 {
                        t.order_index = (t.order_index + 1) % num_orders;
                    }
                    if halt {
                        t.stopped = true;
                    }
                    t.current_order = Order::Nothing;
                    t.order_is_manual = false;
                    t.dest_tile = None;
                }
            }
        }
    }

    /// Keeps a parked train inside until its way out is clear. Returns true
    /// while it stays.
    fn check_train_stay_in_depot(&mut self, id: VehicleId) -> bool {
        if !self.is_in_depot(id) {
            return false;
        }
        let (tile, owner, force, order, dest) = match self.trains.get(&id) {
            Some(t) => match self.front_tile(t) {
                Some(tile) => (tile, t.owner, t.force_proceed, t.current_order, t.dest_tile),
                None => return true,
            },
            None => return true,
        };
        let track = match self.map.depot(tile) {
            Some((_, exit)) => exit.axis().track(),
            None => return true,
        };
        let reserved_by_other = holder(&self.map, tile, track).map(|h| h != id).unwrap_or(false);

        let seg = if force == ForceProceed::None {
            let wait = match self.trains.get_mut(&id) {
                Some(t) => {
                    t.wait_counter += 1;
                    t.wait_counter
                }
                None => return true,
            };
            if wait < DEPOT_LEAVE_INTERVAL {
                return true;
            }
            if let Some(t) = self.trains.get_mut(&id) {
                t.wait_counter = 0;
            }
            let seg = if self.settings.pathfinding.reserve_paths {
                SegmentState::Pbs
            } else {
                self.update_signals(tile, None, owner)
            };
            if seg == SegmentState::Full || reserved_by_other {
                return true;
            }
            seg
        } else if self.settings.pathfinding.reserve_paths {
            SegmentState::Pbs
        } else {
            self.update_signals(tile, None, owner)
        };

        if let Order::GoToDepot { .. } = order {
            if dest == Some(tile) {
                if !reserved_by_other {
                    self.vehicle_enter_depot(id);
                }
                return true;
            }
        }

        if seg == SegmentState::Pbs && !self.try_path_reserve(id, false, true) && force == ForceProceed::None {
            self.mark_train_as_stuck(id);
            return true;
        }

        if holder(&self.map, tile, track).is_none() {
            reservation::try_reserve_track(&mut self.map, tile, track, id);
        }
        self.service_train(id);
        let depot = self.map.depot(tile).map(|(d, _)| d).unwrap_or(0);
        let vehicles = &mut self.vehicles;
        if let Some(t) = self.trains.get_mut(&id) {
            t.speed = 0;
            t.subspeed = 0;
            t.progress = 0;
            if let Some(v) = t.members.first().and_then(|m| vehicles.get_mut(*m)) {
                v.hidden = false;
            }
            info!("train {} leaves depot {}", t.name, depot);
        }
        self.log_train(id, TrainLogEvent::LeftDepot(depot));
        self.update_signals(tile, None, owner);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::settings::Settings;

    fn loco() -> EngineInfo {
        EngineInfo {
            name: "loco".to_string(),
            is_engine: true,
            power_kw: 2000,
            weight_t: 80,
            max_speed: 120,
            max_te_kn: 250,
            length: 8,
            railtype: RailType::Rail,
            capacity: 0,
            cargos: vec![],
        }
    }

    fn straight_line(width: u32) -> World {
        let mut map = Map::new(width, 3);
        for x in 0..width {
            let t = map.tile_xy(x, 1).unwrap();
            map.build_rail(t, Track::X, 0, RailType::Rail).unwrap();
        }
        World::new(map, Settings::default())
    }

    #[test]
    fn train_runs_to_line_end_and_turns() {
        let mut w = straight_line(8);
        let e = w.add_engine(loco());
        let start = w.map.tile_xy(2, 1).unwrap();
        let sw = Trackdir::with_exit(Track::X, DiagDir::SW).unwrap();
        let id = w.spawn_on_track("t", start, sw, &[e], false).unwrap();
        let mut reversed_at = None;
        for _ in 0..3000 {
            w.tick += 1;
            w.train_tick(id).unwrap();
            let td = w.trains[&id].head().unwrap().trackdir;
            if td.exit() == DiagDir::NE {
                reversed_at = w.front_tile(&w.trains[&id]);
                break;
            }
        }
        assert_eq!(reversed_at, w.map.tile_xy(7, 1));
    }

    #[test]
    fn rear_releases_tiles_it_leaves() {
        let mut w = straight_line(12);
        let e = w.add_engine(loco());
        let start = w.map.tile_xy(1, 1).unwrap();
        let sw = Trackdir::with_exit(Track::X, DiagDir::SW).unwrap();
        let id = w.spawn_on_track("t", start, sw, &[e], false).unwrap();
        for _ in 0..300 {
            w.tick += 1;
            w.train_tick(id).unwrap();
        }
        let front = w.front_tile(&w.trains[&id]).unwrap();
        let (fx, _) = w.map.xy(front);
        assert!(fx > 2);
        assert_eq!(holder(&w.map, start, Track::X), None);
        assert_eq!(holder(&w.map, front, Track::X), Some(id));
    }

    #[test]
    fn stopped_train_stays_put() {
        let mut w = straight_line(6);
        let e = w.add_engine(loco());
        let start = w.map.tile_xy(2, 1).unwrap();
        let sw = Trackdir::with_exit(Track::X, DiagDir::SW).unwrap();
        let id = w.spawn_on_track("t", start, sw, &[e], true).unwrap();
        let before = w.vehicles[id].coord;
        for _ in 0..100 {
            w.train_tick(id).unwrap();
        }
        assert_eq!(w.vehicles[id].coord, before);
        assert_eq!(w.trains[&id].speed, 0);
    }
}
