//! Persisted state. `SaveGame` is a full snapshot of the world; `LegacySave`
//! is the older layout where consists are implied by record order.

use crate::ids::*;
use crate::input::settings::Settings;
use crate::map::Map;
use crate::news::NewsQueue;
use crate::railway::consist::*;
use crate::railway::orders::{Order, OrderPool};
use crate::railway::reservation;
use crate::railway::world::{DepotInfo, StationInfo, World};
use failure::Error;
use log::{debug, warn};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;

pub const SAVE_VERSION: u32 = 2;

#[derive(Debug, Fail)]
pub enum SaveError {
    #[fail(display = "unsupported save version {}", _0)]
    Version(u32),
    #[fail(display = "vehicle record {} follows no front engine", _0)]
    OrphanVehicle(usize),
    #[fail(display = "front record {} carries no train state", _0)]
    MissingTrain(usize),
    #[fail(display = "train {} does not match its vehicles", _0)]
    BrokenChain(String),
    #[fail(display = "order list {} does not exist", _0)]
    UnknownOrderList(usize),
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SaveGame {
    pub version: u32,
    pub settings: Settings,
    pub map: Map,
    pub engines: Vec<EngineInfo>,
    pub vehicles: Vehicles,
    /// Keyed by front vehicle; kept as a list since the keys are not strings.
    pub trains: Vec<(VehicleId, Train)>,
    pub orders: OrderPool,
    pub stations: Vec<StationInfo>,
    pub depots: Vec<DepotInfo>,
    pub news: NewsQueue,
    pub tick: u64,
    pub rng: ChaCha8Rng,
}

impl SaveGame {
    pub fn from_world(w: &World) -> SaveGame {
        SaveGame {
            version: SAVE_VERSION,
            settings: w.settings.clone(),
            map: w.map.clone(),
            engines: w.engines.clone(),
            vehicles: w.vehicles.clone(),
            trains: w.trains.iter().map(|(id, t)| (*id, t.clone())).collect(),
            orders: w.orders.clone(),
            stations: w.stations.clone(),
            depots: w.depots.clone(),
            news: w.news.clone(),
            tick: w.tick,
            rng: w.rng.clone(),
        }
    }

    pub fn into_world(self) -> Result<World, SaveError> {
        if self.version != SAVE_VERSION {
            return Err(SaveError::Version(self.version));
        }
        for (id, t) in &self.trains {
            let whole = t.members.first() == Some(id)
                && t.members
                    .iter()
                    .all(|m| self.vehicles.get(*m).map(|v| v.train == Some(*id)).unwrap_or(false));
            if !whole {
                return Err(SaveError::BrokenChain(t.name.clone()));
            }
        }
        let mut w = World::new(self.map, self.settings);
        w.engines = self.engines;
        w.vehicles = self.vehicles;
        w.trains = self.trains.into_iter().collect();
        w.orders = self.orders;
        w.stations = self.stations;
        w.depots = self.depots;
        w.news = self.news;
        w.tick = self.tick;
        w.rng = self.rng;
        w.map.journal.clear();
        Ok(w)
    }
}

pub fn write_save<W: io::Write>(w: &World, f: &mut W) -> Result<(), Error> {
    serde_json::to_writer(f, &SaveGame::from_world(w))?;
    Ok(())
}

pub fn read_save(s: &str) -> Result<World, Error> {
    let save: SaveGame = serde_json::from_str(s)?;
    Ok(save.into_world()?)
}

/// Train state carried by a front record of the older layout.
#[derive(Clone, Serialize, Deserialize)]
pub struct LegacyTrain {
    /// Members and order list are ignored and rebuilt on load.
    pub state: Train,
    pub order_list: Option<usize>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LegacyVehicle {
    pub is_front: bool,
    pub vehicle: Vehicle,
    pub train: Option<LegacyTrain>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LegacySave {
    pub settings: Settings,
    pub map: Map,
    pub engines: Vec<EngineInfo>,
    pub vehicles: Vec<LegacyVehicle>,
    pub order_lists: Vec<Vec<Order>>,
    pub stations: Vec<StationInfo>,
    pub depots: Vec<DepotInfo>,
    pub tick: u64,
}

impl LegacySave {
    /// Rebuilds consists by position: each front record opens a train and
    /// the records after it join that train.
    pub fn into_world(self) -> Result<World, SaveError> {
        let mut w = World::new(self.map, self.settings);
        w.engines = self.engines;
        w.stations = self.stations;
        w.depots = self.depots;
        w.tick = self.tick;

        // reservations name vehicles of the old arena
        for (tile, track, _) in reservation::snapshot(&w.map) {
            reservation::unreserve_track(&mut w.map, tile, track);
        }

        let mut lists = BTreeMap::new();
        let mut current: Option<VehicleId> = None;
        for (i, rec) in self.vehicles.into_iter().enumerate() {
            let mut v = rec.vehicle;
            if rec.is_front {
                let lt = rec.train.ok_or(SaveError::MissingTrain(i))?;
                if !w.engines.get(v.engine as usize).map(|e| e.is_engine).unwrap_or(false) {
                    return Err(SaveError::BrokenChain(lt.state.name.clone()));
                }
                let id = w.vehicles.insert_with_key(|k| {
                    v.train = Some(k);
                    v
                });
                let mut train = lt.state;
                train.members.clear();
                train.members.push(id);
                train.orders = match lt.order_list {
                    None => None,
                    Some(n) => {
                        let orders = self.order_lists.get(n).ok_or(SaveError::UnknownOrderList(n))?;
                        Some(match lists.get(&n) {
                            Some(&l) => {
                                w.orders.share(l);
                                l
                            }
                            None => {
                                let max = w.settings.game.max_order_lists;
                                let l = w.orders.create(orders.clone(), max).ok_or(SaveError::UnknownOrderList(n))?;
                                lists.insert(n, l);
                                l
                            }
                        })
                    }
                };
                w.trains.insert(id, train);
                current = Some(id);
            } else {
                let front = current.ok_or(SaveError::OrphanVehicle(i))?;
                v.train = Some(front);
                let id = w.vehicles.insert(v);
                if let Some(t) = w.trains.get_mut(&front) {
                    t.members.push(id);
                }
            }
        }

        for id in w.train_ids() {
            w.refresh_consist(id);
            let hidden = w
                .trains
                .get(&id)
                .and_then(|t| t.members.first())
                .and_then(|m| w.vehicles.get(*m))
                .map(|v| v.hidden)
                .unwrap_or(true);
            if hidden {
                continue;
            }
            let units: Vec<_> = w.trains[&id]
                .path
                .iter()
                .filter(|e| !e.wormhole)
                .map(|e| (e.tile, e.trackdir.track))
                .collect();
            for (tile, track) in units {
                if !reservation::try_reserve_track(&mut w.map, tile, track, id) {
                    warn!("legacy load: track {:?} on tile {} claimed twice", track, tile);
                }
            }
        }
        w.update_all_signals();
        w.map.journal.clear();
        debug!("legacy load: {} trains, {} vehicles", w.trains.len(), w.vehicles.len());
        Ok(w)
    }
}

pub fn read_legacy_save(s: &str) -> Result<World, Error> {
    let save: LegacySave = serde_json::from_str(s)?;
    Ok(save.into_world()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::*;

    fn world() -> (World, VehicleId) {
        let mut map = Map::new(10, 1);
        for x in 0..10 {
            let t = map.tile_xy(x, 0).unwrap();
            map.build_rail(t, Track::X, 0, RailType::Rail).unwrap();
        }
        let mut w = World::new(map, Settings::default());
        let e = w.add_engine(EngineInfo {
            name: "loco".to_string(),
            is_engine: true,
            power_kw: 1000,
            weight_t: 60,
            max_speed: 100,
            max_te_kn: 200,
            length: 8,
            railtype: RailType::Rail,
            capacity: 0,
            cargos: vec![],
        });
        let c = w.add_engine(EngineInfo {
            name: "coach".to_string(),
            is_engine: false,
            power_kw: 0,
            weight_t: 30,
            max_speed: 0,
            max_te_kn: 0,
            length: 8,
            railtype: RailType::Rail,
            capacity: 40,
            cargos: vec!["mail".to_string()],
        });
        let td = Trackdir::parse("x_sw").unwrap();
        let t = w.map.tile_xy(5, 0).unwrap();
        let id = w.spawn_on_track("A", t, td, &[e, c, c], false).unwrap();
        let list = w.orders.create(vec![Order::Dummy], 10).unwrap();
        w.trains.get_mut(&id).unwrap().orders = Some(list);
        (w, id)
    }

    #[test]
    fn snapshot_round_trips() {
        let (w, id) = world();
        let mut out = vec![];
        write_save(&w, &mut out).unwrap();
        let back = read_save(std::str::from_utf8(&out).unwrap()).unwrap();
        assert_eq!(back.trains[&id], w.trains[&id]);
        assert_eq!(back.vehicles.len(), 3);
        for m in w.trains[&id].members.iter() {
            assert_eq!(back.vehicles[*m], w.vehicles[*m]);
        }
        assert_eq!(reservation::snapshot(&back.map), reservation::snapshot(&w.map));
        assert_eq!(back.orders.orders(w.trains[&id].orders), &[Order::Dummy]);
    }

    fn legacy_of(w: &World) -> LegacySave {
        let mut records = vec![];
        for (_, t) in &w.trains {
            for (i, m) in t.members.iter().enumerate() {
                let mut v = w.vehicles[*m].clone();
                v.train = None;
                records.push(LegacyVehicle {
                    is_front: i == 0,
                    vehicle: v,
                    train: if i == 0 {
                        Some(LegacyTrain {
                            state: t.clone(),
                            order_list: Some(0),
                        })
                    } else {
                        None
                    },
                });
            }
        }
        LegacySave {
            settings: w.settings.clone(),
            map: w.map.clone(),
            engines: w.engines.clone(),
            vehicles: records,
            order_lists: vec![vec![Order::Dummy]],
            stations: vec![],
            depots: vec![],
            tick: 40,
        }
    }

    #[test]
    fn legacy_consists_by_position() {
        let (w, id) = world();
        let back = legacy_of(&w).into_world().unwrap();
        assert_eq!(back.trains.len(), 1);
        let (nid, t) = back.trains.iter().next().unwrap();
        assert_eq!(t.members.len(), 3);
        assert_eq!(t.path, w.trains[&id].path);
        assert!(back.check_integrity(*nid).is_ok());
        let held = reservation::snapshot(&back.map).into_iter().filter(|&(_, _, h)| h == *nid).count();
        let before = reservation::snapshot(&w.map).len();
        assert_eq!(held, before);
    }

    #[test]
    fn legacy_orphan_is_an_error() {
        let (w, _) = world();
        let mut save = legacy_of(&w);
        save.vehicles.remove(0);
        match save.into_world() {
            Err(SaveError::OrphanVehicle(0)) => {}
            r => panic!("unexpected {:?}", r.map(|_| ())),
        }
    }
}
