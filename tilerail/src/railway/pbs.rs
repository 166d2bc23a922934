//! Path based signalling: following, extending and freeing the path a train
//! has reserved ahead of itself.

use crate::ids::*;
use crate::map::*;
use crate::news::AdviceKind;
use crate::output::history::TrainLogEvent;
use crate::railway::follow::TrackFollower;
use crate::railway::orders::Order;
use crate::railway::pathfinder::{Goal, Target};
use crate::railway::reservation::{self, has_reserved_tracks, held_trackbits, holder};
use crate::railway::world::World;
use log::{debug, error, trace};

/// Where a reservation ends, and whether a train may wait there.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PbsTileInfo {
    pub tile: TileIndex,
    pub trackdir: Trackdir,
    pub okay: bool,
}

/// A junction or possible target met while extending a reservation. The
/// pathfinder takes over from here.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Choice {
    pub tile: TileIndex,
    pub enterdir: DiagDir,
    pub tracks: TrackBits,
}

/// Whether `track` could be reserved on `tile` right now.
pub fn track_free(map: &Map, tile: TileIndex, track: Track) -> bool {
    let r = reservation::reserved_trackbits(map, tile);
    r.is_empty() || (!r.contains(track) && !(r | track.bits()).overlap())
}

/// Walks the tracks held by `who` from `(tile, td)` and returns the last one.
pub fn follow_reservation(ft: &TrackFollower, who: VehicleId, tile: TileIndex, td: Trackdir) -> PbsTileInfo {
    let map = ft.map;
    let (mut tile, mut td) = (tile, td);
    let limit = map.len() * 6;
    for _ in 0..limit {
        let f = match ft.follow(tile, td) {
            Ok(f) => f,
            Err(_) => break,
        };
        let held = TrackdirBits::from_tracks(held_trackbits(map, f.new_tile, who));
        let next = match (f.new_td_bits & held).first() {
            Some(n) => n,
            None => break,
        };
        if map.has_oneway_signal_blocking(f.new_tile, next) {
            break;
        }
        tile = f.new_tile;
        td = next;
    }
    PbsTileInfo {
        tile,
        trackdir: td,
        okay: is_safe_waiting_position(ft, tile, td, true),
    }
}

/// A train may end its reservation on `(tile, td)` without blocking a junction.
///
/// Depots are safe, as is the tile just before a signal facing the train. A
/// signal tile belongs to the block it protects, so the train waits in front of it.
pub fn is_safe_waiting_position(ft: &TrackFollower, tile: TileIndex, td: Trackdir, include_line_end: bool) -> bool {
    let map = ft.map;
    if map.depot(tile).is_some() {
        return true;
    }
    let f = match ft.follow(tile, td) {
        Ok(f) => f,
        Err(_) => return include_line_end,
    };
    let next = match f.single() {
        Some(n) => n,
        None => return false,
    };
    if map.has_signal_on_trackdir(f.new_tile, next) {
        return true;
    }
    if map.has_oneway_signal_blocking(f.new_tile, next) {
        return include_line_end;
    }
    false
}

/// The waiting position is not reserved, and neither is the way out of it.
pub fn is_waiting_position_free(ft: &TrackFollower, tile: TileIndex, td: Trackdir) -> bool {
    let map = ft.map;
    if !track_free(map, tile, td.track) {
        return false;
    }
    if map.depot(tile).is_some() {
        return true;
    }
    if let Ok(f) = ft.follow(tile, td) {
        if has_reserved_tracks(map, f.new_tile, f.new_td_bits.tracks()) {
            return false;
        }
    }
    true
}

/// `b` is part of the reservation unit of `a`: the same platform or the other portal.
pub fn same_unit(map: &Map, a: TileIndex, b: TileIndex) -> bool {
    if a == b {
        return true;
    }
    if let Some((_, _, other)) = map.tunnel_bridge(a) {
        return other == b;
    }
    map.station_id(a).is_some() && map.platform_tiles(a).contains(&b)
}

fn rollback(map: &mut Map, made: &[(TileIndex, Track)]) {
    for &(t, tr) in made.iter().rev() {
        reservation::unreserve_track(map, t, tr);
    }
}

/// Reserves the pieces of `nodes` in order for `who`, stepping over pieces of a
/// unit that is already held. Undoes everything on failure.
fn reserve_nodes(map: &mut Map, who: VehicleId, nodes: &[(TileIndex, Trackdir)]) -> bool {
    let mut made = vec![];
    let mut prev: Option<TileIndex> = None;
    for &(t, td) in nodes {
        // the first piece may still belong to the unit the reservation ends in
        let continued = prev.map(|p| same_unit(map, p, t)).unwrap_or(true);
        prev = Some(t);
        if continued && holder(map, t, td.track) == Some(who) {
            continue;
        }
        if !reservation::try_reserve_track(map, t, td.track, who) {
            trace!("reservation failed at {} {:?}", t, td);
            rollback(map, &made);
            return false;
        }
        made.push((t, td.track));
    }
    true
}

impl World {
    fn train_follower(&self, id: VehicleId) -> Option<TrackFollower<'_>> {
        self.trains.get(&id).map(|t| self.follower(t).stepwise())
    }

    /// End of the train's reservation, and any other train standing on it.
    pub fn follow_train_reservation(&self, id: VehicleId) -> Option<(PbsTileInfo, Option<VehicleId>)> {
        let train = self.trains.get(&id)?;
        let (tile, td) = self.front_position(train)?;
        let ft = self.follower(train).stepwise();
        if self.map.depot(tile).is_some() && holder(&self.map, tile, td.track) != Some(id) {
            // a depot reservation can never be ours while still inside
            return Some((
                PbsTileInfo {
                    tile,
                    trackdir: td,
                    okay: false,
                },
                None,
            ));
        }
        let end = follow_reservation(&ft, id, tile, td);
        let other = self
            .vehicles
            .values()
            .find(|v| !v.hidden && !v.crashed && v.tile == end.tile && v.train.is_some() && v.train != Some(id))
            .and_then(|v| v.train);
        Some((end, other))
    }

    /// Reserves ahead of the current reservation up to the next safe position,
    /// stopping at the first junction or possible target.
    ///
    /// `None` when the way is blocked; nothing is left reserved then. A choice
    /// is returned together with the unchanged end when the pathfinder has to decide.
    pub fn extend_train_reservation(&mut self, id: VehicleId) -> Option<(PbsTileInfo, Option<Choice>)> {
        let (origin, _) = self.follow_train_reservation(id)?;
        let (owner, railtypes) = self.trains.get(&id).map(|t| (t.owner, t.cache.railtypes))?;
        let forbid_90 = self.settings.pathfinding.forbid_90_deg;
        let before = if cfg!(debug_assertions) {
            Some(reservation::snapshot(&self.map))
        } else {
            None
        };

        let mut made: Vec<(TileIndex, Track)> = vec![];
        let (mut tile, mut td) = (origin.tile, origin.trackdir);
        let mut result = None;
        for _ in 0..self.map.len() * 6 {
            let f = TrackFollower::new(&self.map, owner, railtypes, forbid_90).follow(tile, td);
            let f = match f {
                Ok(f) => f,
                Err(e) => {
                    if e.is_line_end() {
                        result = Some((
                            PbsTileInfo {
                                tile,
                                trackdir: td,
                                okay: true,
                            },
                            None,
                        ));
                    }
                    break;
                }
            };
            let target_seen = f.is_station || self.map.depot(f.new_tile).is_some();
            if target_seen || f.single().is_none() {
                let first = f.first_new_tile(&self.map);
                let tracks = f.new_td_bits.tracks();
                if has_reserved_tracks(&self.map, first, tracks) && !same_unit(&self.map, tile, first) {
                    break;
                }
                result = Some((
                    PbsTileInfo {
                        tile,
                        trackdir: td,
                        okay: false,
                    },
                    Some(Choice {
                        tile: first,
                        enterdir: f.exitdir,
                        tracks,
                    }),
                ));
                break;
            }
            let next = match f.single() {
                Some(n) => n,
                None => break,
            };
            if self.map.has_oneway_signal_blocking(f.new_tile, next) {
                break;
            }
            let continued = same_unit(&self.map, tile, f.new_tile) && holder(&self.map, f.new_tile, next.track) == Some(id);
            if !continued {
                if !reservation::try_reserve_track(&mut self.map, f.new_tile, next.track, id) {
                    break;
                }
                made.push((f.new_tile, next.track));
            }
            tile = f.new_tile;
            td = next;
            let safe = {
                let ft = TrackFollower::new(&self.map, owner, railtypes, forbid_90).stepwise();
                is_safe_waiting_position(&ft, tile, td, true)
            };
            if safe {
                result = Some((
                    PbsTileInfo {
                        tile,
                        trackdir: td,
                        okay: true,
                    },
                    None,
                ));
                break;
            }
        }

        if result.is_none() {
            rollback(&mut self.map, &made);
            for &(t, _) in &made {
                if self.map.is_crossing(t) {
                    self.update_crossing(t);
                }
            }
            if let Some(before) = before {
                let after = reservation::snapshot(&self.map);
                if before != after {
                    error!("reservation rollback left {} units changed", before.symmetric_difference(&after).count());
                    debug_assert!(false, "reservation rollback is not exact");
                }
            }
            if let Some(t) = self.trains.get(&id) {
                debug!("train {} could not extend its reservation past {}", t.name, tile);
            }
        }
        result
    }

    /// Frees the reservation ahead of the train. The tiles it stands on stay held.
    pub fn free_train_track_reservation(&mut self, id: VehicleId) {
        let (front, td, under) = match self.trains.get(&id) {
            Some(t) => match self.front_position(t) {
                Some((tile, td)) => {
                    let under: Vec<TileIndex> = t.path.iter().take(t.path.len().saturating_sub(1)).map(|e| e.tile).collect();
                    (tile, td, under)
                }
                None => return,
            },
            None => return,
        };
        let mut to_release = vec![];
        {
            let ft = match self.train_follower(id) {
                Some(ft) => ft,
                None => return,
            };
            let (mut tile, mut td) = (front, td);
            for _ in 0..self.map.len() * 6 {
                let f = match ft.follow(tile, td) {
                    Ok(f) => f,
                    Err(_) => break,
                };
                if under.contains(&f.new_tile) {
                    break;
                }
                let held = TrackdirBits::from_tracks(held_trackbits(&self.map, f.new_tile, id));
                let next = match (f.new_td_bits & held).first() {
                    Some(n) => n,
                    None => break,
                };
                if self.map.has_oneway_signal_blocking(f.new_tile, next) {
                    break;
                }
                if !same_unit(&self.map, front, f.new_tile) {
                    to_release.push((f.new_tile, next.track));
                }
                tile = f.new_tile;
                td = next;
                if self.map.depot(tile).is_some() {
                    break;
                }
            }
        }
        for (t, tr) in to_release {
            reservation::release_track(&mut self.map, t, tr, id);
            if self.map.is_crossing(t) {
                self.update_crossing(t);
            }
        }
    }

    /// Reserves `nodes` of a route up to its reservation target: the first safe
    /// position met before passing two signals, or else the end of the route.
    pub fn reserve_route(&mut self, id: VehicleId, nodes: &[(TileIndex, Trackdir)]) -> Option<PbsTileInfo> {
        if nodes.is_empty() {
            return None;
        }
        let mut target = nodes.len() - 1;
        let free = {
            let ft = self.train_follower(id)?;
            let mut signals = 0;
            for (i, &(t, td)) in nodes.iter().enumerate() {
                if signals >= 2 {
                    break;
                }
                if is_safe_waiting_position(&ft, t, td, true) {
                    target = i;
                    break;
                }
                if self.map.has_signal_on_trackdir(t, td) {
                    signals += 1;
                }
            }
            let (t, td) = nodes[target];
            is_waiting_position_free(&ft, t, td)
        };
        let (t, td) = nodes[target];
        let mut res = PbsTileInfo {
            tile: t,
            trackdir: td,
            okay: false,
        };
        if free && reserve_nodes(&mut self.map, id, &nodes[..=target]) {
            res.okay = true;
        }
        Some(res)
    }

    /// Finds the nearest safe and free waiting position behind `(tile, td)` and
    /// reserves the way there.
    pub fn try_reserve_safe_track(&mut self, id: VehicleId, tile: TileIndex, td: Trackdir) -> bool {
        let start: Vec<(TileIndex, Trackdir)> = {
            let ft = match self.train_follower(id) {
                Some(ft) => ft,
                None => return false,
            };
            if is_safe_waiting_position(&ft, tile, td, true) {
                return true;
            }
            match ft.follow(tile, td) {
                Ok(f) => f.new_td_bits.iter().map(|n| (f.new_tile, n)).collect(),
                Err(e) => return e.is_line_end(),
            }
        };
        let q = match self.query_for(id, start, Goal::SafeFree, vec![]) {
            Some(q) => q,
            None => return false,
        };
        let pf = self.pathfinder();
        let route = pf.find_nearest_safe_tile(&self.map, &q, &mut self.rng);
        if !route.found {
            return false;
        }
        reserve_nodes(&mut self.map, id, &route.nodes)
    }

    /// Destinations the train will head for, the current one first.
    pub fn route_targets(&self, id: VehicleId) -> Vec<Target> {
        let train = match self.trains.get(&id) {
            Some(t) => t,
            None => return vec![],
        };
        let mut targets = vec![];
        let here = self.front_tile(train).and_then(|t| self.map.station_id(t));
        let from = match train.current_order {
            Order::GoToStation { station, .. } | Order::GoToWaypoint { waypoint: station, .. } => {
                if here != Some(station) {
                    targets.extend(self.order_target(&train.current_order));
                }
                Some(train.order_index + 1)
            }
            Order::GoToDepot { .. } => {
                if let Some(d) = train.dest_tile {
                    targets.push(Target {
                        goal: Goal::Tile(d),
                        hints: vec![d],
                    });
                }
                if train.order_is_manual {
                    Some(train.order_index)
                } else {
                    Some(train.order_index + 1)
                }
            }
            Order::Loading { .. } => Some(train.order_index + 1),
            Order::LeaveStation | Order::Nothing => Some(train.order_index),
            Order::Conditional { .. } | Order::Dummy => None,
        };
        let orders = self.train_orders(train);
        if let Some(mut i) = from {
            for _ in 0..orders.len() {
                if targets.len() >= 3 {
                    break;
                }
                let idx = match self.resolved_order_index(id, i) {
                    Some(idx) => idx,
                    None => break,
                };
                targets.extend(self.order_target(&orders[idx]));
                i = idx + 1;
            }
        }
        targets
    }

    fn order_target(&self, order: &Order) -> Option<Target> {
        match *order {
            Order::GoToStation { station, .. } | Order::GoToWaypoint { waypoint: station, .. } => {
                self.station_tile(station)?;
                Some(Target {
                    goal: Goal::Station(station),
                    hints: self.stations.get(station as usize).map(|s| s.tiles.clone()).unwrap_or_default(),
                })
            }
            Order::GoToDepot { depot: Some(d), .. } => {
                let tile = self.depot_tile(d)?;
                Some(Target {
                    goal: Goal::Tile(tile),
                    hints: vec![tile],
                })
            }
            Order::GoToDepot { depot: None, .. } => Some(Target {
                goal: Goal::AnyDepot,
                hints: vec![],
            }),
            _ => None,
        }
    }

    /// Runs the pathfinder from `start` towards `target` and, if asked,
    /// reserves the route found. Without a target the first start is taken.
    pub fn pathfind(
        &mut self,
        id: VehicleId,
        target: Option<&Target>,
        start: Vec<(TileIndex, Trackdir)>,
        reserve: bool,
    ) -> (Option<Track>, bool, Option<PbsTileInfo>) {
        let target = match target {
            Some(t) => t,
            None => return (start.first().map(|s| s.1.track), true, None),
        };
        if start.is_empty() {
            return (None, false, None);
        }
        let q = match self.query_for(id, start, target.goal, target.hints.clone()) {
            Some(q) => q,
            None => return (None, false, None),
        };
        let pf = self.pathfinder();
        if !reserve {
            let (track, found) = pf.choose_track(&self.map, &q, &mut self.rng);
            return (track, found, None);
        }
        let route = pf.route_to_destination(&self.map, &q, &mut self.rng);
        trace!("route to {:?}: found {} over {} nodes", target.goal, route.found, route.nodes.len());
        let first = route.nodes.first().map(|n| n.1.track);
        let res = if route.found { self.reserve_route(id, &route.nodes) } else { None };
        (first, route.found, res)
    }

    /// Raises the lost advisory when a train that had a route loses it.
    pub fn handle_pathfinding_result(&mut self, id: VehicleId, found: bool) {
        let tick = self.tick;
        let (lost, tile) = match self.trains.get_mut(&id) {
            Some(t) => {
                let lost = !found && t.had_path;
                t.had_path = found;
                t.res.no_path = !found;
                (lost, t.members.first().cloned())
            }
            None => return,
        };
        if lost {
            let tile = tile.and_then(|m| self.vehicles.get(m)).map(|v| v.tile).unwrap_or(0);
            self.news.add(AdviceKind::TrainLost, id, tile, tick);
        }
    }

    fn reserve_front_tile(&mut self, id: VehicleId) {
        let pos = self.trains.get(&id).and_then(|t| {
            let head = t.head()?;
            if head.wormhole {
                None
            } else {
                Some((head.tile, head.trackdir.track))
            }
        });
        if let Some((tile, track)) = pos {
            if holder(&self.map, tile, track).is_none() {
                reservation::try_reserve_track(&mut self.map, tile, track, id);
            }
        }
    }

    fn reserved_choice(&self, id: VehicleId, tile: TileIndex, enterdir: DiagDir) -> Option<Track> {
        (held_trackbits(&self.map, tile, id) & TrackBits::reaching(enterdir)).first()
    }

    /// Whether the train may end a reservation on `res`: a safe waiting
    /// position, or a platform of a station it is heading for.
    fn is_safe_for(&self, id: VehicleId, res: &PbsTileInfo, targets: &[Target]) -> bool {
        let ft = match self.train_follower(id) {
            Some(ft) => ft,
            None => return false,
        };
        if is_safe_waiting_position(&ft, res.tile, res.trackdir, true) {
            return true;
        }
        match self.map.station_id(res.tile) {
            Some(s) => {
                let waypoint = self.stations.get(s as usize).map(|i| i.waypoint).unwrap_or(true);
                !waypoint && targets.iter().any(|t| t.goal == Goal::Station(s))
            }
            None => false,
        }
    }

    /// Picks the track to take on `tile`, entered through `enterdir`, and
    /// reserves ahead when path signals or the settings ask for it.
    ///
    /// Always gives a track when `tracks` has one. The flag tells whether a
    /// reservation was made.
    pub fn choose_train_track(
        &mut self,
        id: VehicleId,
        tile: TileIndex,
        enterdir: DiagDir,
        tracks: TrackBits,
        force_res: bool,
        mark_stuck: bool,
    ) -> (Option<Track>, bool) {
        if let Some(t) = self.reserved_choice(id, tile, enterdir) {
            return (Some(t), true);
        }
        let fallback = tracks.first();
        let mut do_res = self.settings.pathfinding.reserve_paths || force_res;
        let mut best = None;
        if let Some(track) = tracks.single() {
            let pbs = track
                .with_enterdir(enterdir)
                .map(|td| self.map.has_pbs_signal_on_trackdir(tile, td))
                .unwrap_or(false);
            if pbs {
                do_res = true;
            } else if !do_res {
                return (Some(track), false);
            }
            best = Some(track);
        }

        let mut choice = Choice { tile, enterdir, tracks };
        if do_res {
            match self.extend_train_reservation(id) {
                None => {
                    if mark_stuck {
                        self.mark_train_as_stuck(id);
                    }
                    return (best.or(fallback), false);
                }
                Some((_, None)) => {
                    self.reserve_front_tile(id);
                    let t = self.reserved_choice(id, tile, enterdir).or(best).or(fallback);
                    return (t, true);
                }
                Some((_, Some(c))) => choice = c,
            }
            self.check_if_train_needs_service(id);
            let current = self.trains.get(&id).map(|t| t.current_order);
            match current {
                Some(Order::Dummy) | Some(Order::Conditional { .. }) | Some(Order::GoToDepot { .. }) => {
                    self.process_orders(id);
                }
                _ => {}
            }
        }

        let targets = self.route_targets(id);
        let start: Vec<(TileIndex, Trackdir)> = choice
            .tracks
            .iter()
            .filter_map(|t| t.with_enterdir(choice.enterdir))
            .map(|td| (choice.tile, td))
            .collect();
        let (next, found, res) = self.pathfind(id, targets.first(), start, do_res);
        if choice.tile == tile && next.is_some() {
            best = next;
        }
        self.handle_pathfinding_result(id, found);
        if !do_res {
            return (best.or(fallback), false);
        }

        let mut dest = match res {
            Some(d) if !d.okay => {
                if mark_stuck {
                    self.mark_train_as_stuck(id);
                }
                self.free_train_track_reservation(id);
                return (best.or(fallback), false);
            }
            Some(d) => d,
            None => {
                // no target: any safe place will do
                let origin = self.follow_train_reservation(id).map(|(o, _)| o);
                let reserved = match origin {
                    Some(o) => self.try_reserve_safe_track(id, o.tile, o.trackdir),
                    None => false,
                };
                if reserved {
                    self.reserve_front_tile(id);
                    let t = self.reserved_choice(id, tile, enterdir).or(best).or(fallback);
                    return (t, true);
                }
                self.free_train_track_reservation(id);
                if mark_stuck {
                    self.mark_train_as_stuck(id);
                }
                return (best.or(fallback), false);
            }
        };

        let mut got = true;
        let mut next_target = 1;
        while !self.is_safe_for(id, &dest, &targets) {
            // look ahead through the following orders
            let start: Vec<(TileIndex, Trackdir)> = match self.train_follower(id).map(|ft| ft.follow(dest.tile, dest.trackdir)) {
                Some(Ok(f)) => f.new_td_bits.iter().map(|n| (f.new_tile, n)).collect(),
                _ => vec![],
            };
            if let Some(target) = targets.get(next_target).cloned() {
                next_target += 1;
                if !start.is_empty() {
                    let (_, _, cur) = self.pathfind(id, Some(&target), start, true);
                    if let Some(cur) = cur {
                        dest = cur;
                        if dest.okay {
                            continue;
                        }
                        self.free_train_track_reservation(id);
                        if mark_stuck {
                            self.mark_train_as_stuck(id);
                        }
                        got = false;
                        break;
                    }
                }
            }
            if !self.try_reserve_safe_track(id, dest.tile, dest.trackdir) {
                self.free_train_track_reservation(id);
                if mark_stuck {
                    self.mark_train_as_stuck(id);
                }
                got = false;
            }
            break;
        }

        self.reserve_front_tile(id);
        let t = self.reserved_choice(id, tile, enterdir).or(best).or(fallback);
        (t, got)
    }

    /// Tries to get the train a reservation to a safe position. Clears the
    /// stuck state on success.
    pub fn try_path_reserve(&mut self, id: VehicleId, mark_as_stuck: bool, first_tile_okay: bool) -> bool {
        let in_depot = self.is_in_depot(id);
        let front = match self.trains.get(&id).and_then(|t| self.front_tile(t)) {
            Some(t) => t,
            None => return false,
        };
        let depot_track = self.map.depot(front).map(|(_, exit)| (exit, exit.axis().track()));
        if in_depot {
            if let Some((exit, track)) = depot_track {
                if holder(&self.map, front, track).is_some() {
                    if mark_as_stuck {
                        self.mark_train_as_stuck(id);
                    }
                    return false;
                }
                if let Some(n) = self.map.neighbour(front, exit) {
                    if has_reserved_tracks(&self.map, n, TrackBits::reaching(exit)) {
                        return false;
                    }
                }
            }
        }

        let (origin, other) = match self.follow_train_reservation(id) {
            Some(x) => x,
            None => return false,
        };
        if other.is_some() {
            // someone already stands on our path
            if mark_as_stuck {
                self.mark_train_as_stuck(id);
            }
            return false;
        }
        if origin.okay && (front != origin.tile || first_tile_okay) {
            self.clear_stuck(id);
            return true;
        }

        if in_depot {
            if let Some((_, track)) = depot_track {
                reservation::try_reserve_track(&mut self.map, front, track, id);
            }
        }

        let f = match self.train_follower(id).map(|ft| ft.follow(origin.tile, origin.trackdir)) {
            Some(Ok(f)) => f,
            _ => {
                if in_depot {
                    if let Some((_, track)) = depot_track {
                        reservation::release_track(&mut self.map, front, track, id);
                    }
                }
                return false;
            }
        };
        let (_, made) = self.choose_train_track(id, f.new_tile, f.exitdir, f.new_td_bits.tracks(), true, mark_as_stuck);
        let end = self.follow_train_reservation(id).map(|(o, _)| o.tile).unwrap_or(front);
        self.log_train(id, TrainLogEvent::Reservation(made, end));
        if !made {
            if in_depot {
                if let Some((_, track)) = depot_track {
                    reservation::release_track(&mut self.map, front, track, id);
                }
            }
            return false;
        }
        if let Some(t) = self.trains.get_mut(&id) {
            if t.res.stuck {
                t.wait_counter = 0;
            }
        }
        self.clear_stuck(id);
        true
    }

    /// Looks one tile ahead and reserves through a path signal waiting there.
    pub fn check_next_train_tile(&mut self, id: VehicleId) {
        if self.is_in_depot(id) {
            return;
        }
        let (order, front, dest, has_orders) = match self.trains.get(&id) {
            Some(t) => (t.current_order, self.front_tile(t), t.dest_tile, !self.train_orders(t).is_empty()),
            None => return,
        };
        let front = match front {
            Some(f) => f,
            None => return,
        };
        match order {
            Order::GoToDepot { .. } => {
                if Some(front) == dest {
                    return;
                }
            }
            Order::GoToWaypoint { waypoint, .. } => {
                if self.map.station_id(front) == Some(waypoint) {
                    self.process_orders(id);
                }
            }
            Order::Nothing | Order::LeaveStation | Order::Loading { .. } => {
                if has_orders {
                    return;
                }
            }
            _ => {}
        }
        if let Some(s) = self.map.station_id(front) {
            if self.trains.get(&id).map(|t| self.should_stop_at_station(t, s)).unwrap_or(false) {
                return;
            }
        }
        let (tile, td) = match self.trains.get(&id).and_then(|t| self.front_position(t)) {
            Some(p) => p,
            None => return,
        };
        if self.map.has_signal_on_trackdir(tile, td)
            && !self.map.has_pbs_signal_on_trackdir(tile, td)
            && self.map.signal_state(tile, td) == Some(SignalState::Red)
        {
            return;
        }
        let f = match self.train_follower(id).map(|ft| ft.follow(tile, td)) {
            Some(Ok(f)) => f,
            _ => return,
        };
        if has_reserved_tracks(&self.map, f.new_tile, f.new_td_bits.tracks()) {
            return;
        }
        if let Some(next) = f.single() {
            if self.map.has_pbs_signal_on_trackdir(f.new_tile, next) {
                self.choose_train_track(id, f.new_tile, f.exitdir, f.new_td_bits.tracks(), false, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::settings::Settings;
    use crate::railway::consist::EngineInfo;

    fn engine() -> EngineInfo {
        EngineInfo {
            name: "loco".to_string(),
            is_engine: true,
            power_kw: 1000,
            weight_t: 80,
            max_speed: 120,
            max_te_kn: 200,
            length: 8,
            railtype: RailType::Rail,
            capacity: 0,
            cargos: vec![],
        }
    }

    fn sw() -> Trackdir {
        Trackdir::with_exit(Track::X, DiagDir::SW).unwrap()
    }

    /// A straight line along y = 1 with a path signal on `signal_x` facing SW.
    fn line(w: u32, signal_x: Option<u32>) -> World {
        let mut m = Map::new(w, 3);
        for x in 0..w {
            let t = m.tile_xy(x, 1).unwrap();
            m.build_rail(t, Track::X, 0, RailType::Rail).unwrap();
        }
        if let Some(x) = signal_x {
            let t = m.tile_xy(x, 1).unwrap();
            m.build_signal(t, Track::X, SignalKind::PathOneWay, [false, true]).unwrap();
        }
        let mut w = World::new(m, Settings::default());
        w.add_engine(engine());
        w
    }

    #[test]
    fn safe_before_signal_and_at_line_end() {
        let w = line(10, Some(6));
        let ft = TrackFollower::new(&w.map, 0, RailType::Rail.compatible(), false).stepwise();
        let t = |x| w.map.tile_xy(x, 1).unwrap();
        assert!(is_safe_waiting_position(&ft, t(5), sw(), false));
        assert!(!is_safe_waiting_position(&ft, t(4), sw(), false));
        assert!(!is_safe_waiting_position(&ft, t(9), sw(), false));
        assert!(is_safe_waiting_position(&ft, t(9), sw(), true));
        assert!(is_waiting_position_free(&ft, t(5), sw()));
    }

    #[test]
    fn extension_stops_before_signal() {
        let mut w = line(12, Some(7));
        let t = |w: &World, x| w.map.tile_xy(x, 1).unwrap();
        let start = t(&w, 3);
        let id = w.spawn_on_track("a", start, sw(), &[0], false).unwrap();
        let (end, choice) = w.extend_train_reservation(id).unwrap();
        assert!(end.okay);
        assert!(choice.is_none());
        assert_eq!(end.tile, t(&w, 6));
        for x in 4..=6 {
            assert_eq!(holder(&w.map, t(&w, x), Track::X), Some(id));
        }
        assert_eq!(holder(&w.map, t(&w, 7), Track::X), None);

        w.free_train_track_reservation(id);
        for x in 4..=6 {
            assert_eq!(holder(&w.map, t(&w, x), Track::X), None);
        }
        assert_eq!(holder(&w.map, start, Track::X), Some(id));
    }

    #[test]
    fn blocked_extension_leaves_nothing_behind() {
        let mut w = line(12, Some(9));
        let t = |w: &World, x| w.map.tile_xy(x, 1).unwrap();
        let id = w.spawn_on_track("a", t(&w, 3), sw(), &[0], false).unwrap();
        let other = w.spawn_on_track("b", t(&w, 6), sw(), &[0], true).unwrap();
        let before = reservation::snapshot(&w.map);
        assert!(w.extend_train_reservation(id).is_none());
        assert_eq!(reservation::snapshot(&w.map), before);
        assert_eq!(holder(&w.map, t(&w, 6), Track::X), Some(other));
    }
}
