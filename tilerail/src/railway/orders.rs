//! Orders, the shared order-list pool and the destination resolver.

use crate::ids::*;
use crate::news::AdviceKind;
use crate::railway::consist::{consist_changed, Train};
use crate::railway::world::World;
use log::debug;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadKind {
    Normal,
    FullLoad,
    NoLoad,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnloadKind {
    Normal,
    Unload,
    Transfer,
    NoUnload,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CondVariable {
    LoadPercentage,
    Reliability,
    MaxSpeed,
    Age,
    RequiresService,
    Always,
}

impl CondVariable {
    pub fn parse(s: &str) -> Option<CondVariable> {
        match s {
            "load" | "load_percentage" => Some(CondVariable::LoadPercentage),
            "reliability" => Some(CondVariable::Reliability),
            "max_speed" => Some(CondVariable::MaxSpeed),
            "age" => Some(CondVariable::Age),
            "requires_service" => Some(CondVariable::RequiresService),
            "always" => Some(CondVariable::Always),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    IsTrue,
    IsFalse,
}

impl Comparator {
    pub fn apply(self, value: u32, threshold: u32) -> bool {
        match self {
            Comparator::Equal => value == threshold,
            Comparator::NotEqual => value != threshold,
            Comparator::Less => value < threshold,
            Comparator::LessEqual => value <= threshold,
            Comparator::Greater => value > threshold,
            Comparator::GreaterEqual => value >= threshold,
            Comparator::IsTrue => value != 0,
            Comparator::IsFalse => value == 0,
        }
    }

    pub fn parse(s: &str) -> Option<Comparator> {
        match s {
            "==" | "eq" => Some(Comparator::Equal),
            "!=" | "ne" => Some(Comparator::NotEqual),
            "<" | "lt" => Some(Comparator::Less),
            "<=" | "le" => Some(Comparator::LessEqual),
            ">" | "gt" => Some(Comparator::Greater),
            ">=" | "ge" => Some(Comparator::GreaterEqual),
            "true" | "is_true" => Some(Comparator::IsTrue),
            "false" | "is_false" => Some(Comparator::IsFalse),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    Nothing,
    GoToStation {
        station: StationId,
        non_stop: bool,
        load: LoadKind,
        unload: UnloadKind,
    },
    /// `depot: None` goes to the nearest depot.
    GoToDepot {
        depot: Option<DepotId>,
        service_only: bool,
        halt: bool,
    },
    GoToWaypoint {
        waypoint: StationId,
        non_stop: bool,
    },
    Loading {
        station: StationId,
    },
    LeaveStation,
    Conditional {
        variable: CondVariable,
        comparator: Comparator,
        value: u32,
        skip_to: usize,
    },
    /// An order whose destination no longer exists.
    Dummy,
}

impl Order {
    pub fn station(station: StationId) -> Order {
        Order::GoToStation {
            station,
            non_stop: false,
            load: LoadKind::Normal,
            unload: UnloadKind::Normal,
        }
    }

    /// Orders a train can be sent along by the pathfinder.
    pub fn is_goto(&self) -> bool {
        match self {
            Order::GoToStation { .. } | Order::GoToDepot { .. } | Order::GoToWaypoint { .. } => true,
            _ => false,
        }
    }

    /// Whether two orders are the same kind of order, flags aside.
    pub fn same_kind(&self, other: &Order) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// The station or waypoint this order heads for.
    pub fn destination_station(&self) -> Option<StationId> {
        match *self {
            Order::GoToStation { station, .. } => Some(station),
            Order::GoToWaypoint { waypoint, .. } => Some(waypoint),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadingState {
    pub station: StationId,
    pub ticks: u32,
    pub full_load: bool,
    pub no_load: bool,
    /// The stop completes the order at the current index.
    pub is_destination: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderList {
    pub orders: Vec<Order>,
    /// Number of trains using the list.
    pub shared: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OrderPool {
    pub lists: SlotMap<OrderListId, OrderList>,
}

impl OrderPool {
    pub fn get(&self, id: OrderListId) -> Option<&OrderList> {
        self.lists.get(id)
    }

    pub fn get_mut(&mut self, id: OrderListId) -> Option<&mut OrderList> {
        self.lists.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// A new list with one sharer, or `None` when the pool is full.
    pub fn create(&mut self, orders: Vec<Order>, max_lists: usize) -> Option<OrderListId> {
        if self.lists.len() >= max_lists {
            return None;
        }
        Some(self.lists.insert(OrderList { orders, shared: 1 }))
    }

    pub fn share(&mut self, id: OrderListId) {
        if let Some(l) = self.lists.get_mut(id) {
            l.shared += 1;
        }
    }

    /// One sharer leaves. Returns true if that freed the list.
    pub fn leave(&mut self, id: OrderListId) -> bool {
        let freed = match self.lists.get_mut(id) {
            Some(l) => {
                l.shared = l.shared.saturating_sub(1);
                l.shared == 0
            }
            None => false,
        };
        if freed {
            self.lists.remove(id);
        }
        freed
    }

    pub fn orders(&self, id: Option<OrderListId>) -> &[Order] {
        id.and_then(|id| self.lists.get(id))
            .map(|l| &l.orders[..])
            .unwrap_or(&[])
    }
}

/// Follows conditional orders from `index` to the first order that is not one.
/// Gives up after visiting as many orders as the list holds.
pub fn resolve_index(orders: &[Order], index: usize, mut cond: impl FnMut(CondVariable, Comparator, u32) -> bool) -> Option<usize> {
    if orders.is_empty() {
        return None;
    }
    let n = orders.len();
    let mut index = index % n;
    for _ in 0..=n {
        match orders[index] {
            Order::Conditional {
                variable,
                comparator,
                value,
                skip_to,
            } => {
                index = if cond(variable, comparator, value) {
                    skip_to % n
                } else {
                    (index + 1) % n
                };
            }
            _ => return Some(index),
        }
    }
    None
}

impl World {
    pub fn train_orders(&self, train: &Train) -> &[Order] {
        self.orders.orders(train.orders)
    }

    pub fn needs_service(&self, train: &Train) -> bool {
        let interval = self.settings.vehicle.service_interval;
        interval > 0 && train.days_since_service >= interval
    }

    /// The value a conditional order compares for `train`.
    pub fn condition_value(&self, train: &Train, variable: CondVariable) -> u32 {
        match variable {
            CondVariable::LoadPercentage => {
                let (mut cargo, mut cap) = (0u64, 0u64);
                for v in train.members.iter().filter_map(|id| self.vehicles.get(*id)) {
                    cargo += v.cargo as u64;
                    cap += self.engines.get(v.engine as usize).map(|e| e.capacity).unwrap_or(0) as u64;
                }
                if cap == 0 {
                    0
                } else {
                    (cargo * 100 / cap) as u32
                }
            }
            CondVariable::Reliability => train.reliability,
            CondVariable::MaxSpeed => train.cache.max_speed,
            CondVariable::Age => train.age_days,
            CondVariable::RequiresService => self.needs_service(train) as u32,
            CondVariable::Always => 1,
        }
    }

    fn evaluate(&self, train: &Train, variable: CondVariable, comparator: Comparator, value: u32) -> bool {
        if variable == CondVariable::Always {
            return true;
        }
        comparator.apply(self.condition_value(train, variable), value)
    }

    /// The index the train acts on next, conditionals followed.
    pub fn resolved_order_index(&self, id: VehicleId, from: usize) -> Option<usize> {
        let train = self.trains.get(&id)?;
        resolve_index(self.train_orders(train), from, |v, c, x| self.evaluate(train, v, c, x))
    }

    /// Picks the order the train should carry out now. Returns true if the current
    /// order changed.
    pub fn process_orders(&mut self, id: VehicleId) -> bool {
        let (current, manual, front_tile) = match self.trains.get(&id) {
            Some(t) => (t.current_order, t.order_is_manual, self.front_tile(t)),
            None => return false,
        };
        match current {
            Order::Loading { .. } | Order::LeaveStation => return false,
            Order::GoToDepot { .. } if manual => return false,
            Order::GoToWaypoint { waypoint, .. } => {
                // passing through the waypoint completes the order
                if front_tile.and_then(|t| self.map.station_id(t)) == Some(waypoint) {
                    let n = self.train_orders(&self.trains[&id]).len().max(1);
                    if let Some(t) = self.trains.get_mut(&id) {
                        t.last_station_visited = Some(waypoint);
                        t.order_index = (t.order_index + 1) % n;
                        t.current_order = Order::Nothing;
                    }
                }
            }
            _ => {}
        }

        let index = self.trains.get(&id).map(|t| t.order_index).unwrap_or(0);
        let resolved = self.resolved_order_index(id, index);
        let (order, index) = match resolved {
            Some(i) => (self.train_orders(&self.trains[&id])[i], i),
            None => {
                if let Some(t) = self.trains.get_mut(&id) {
                    let changed = t.current_order != Order::Nothing;
                    t.current_order = Order::Nothing;
                    t.order_is_manual = false;
                    t.dest_tile = None;
                    return changed;
                }
                return false;
            }
        };

        let train = match self.trains.get_mut(&id) {
            Some(t) => t,
            None => return false,
        };
        train.order_index = index;
        if train.current_order == order && train.dest_tile.is_some() {
            return false;
        }
        train.current_order = order;
        train.order_is_manual = false;
        debug!("train {} takes order {} {:?}", train.name, index, order);
        self.update_order_dest(id);
        true
    }

    /// Resolves the current order into `dest_tile`, skipping or voiding orders that
    /// cannot be carried out.
    pub fn update_order_dest(&mut self, id: VehicleId) {
        let (order, needs_service) = match self.trains.get(&id) {
            Some(t) => (t.current_order, self.needs_service(t)),
            None => return,
        };
        match order {
            Order::GoToStation { station, .. } | Order::GoToWaypoint { waypoint: station, .. } => {
                match self.station_tile(station) {
                    Some(tile) => self.set_dest(id, Some(tile)),
                    None => self.void_current_order(id),
                }
            }
            Order::GoToDepot {
                depot, service_only, ..
            } => {
                if service_only && !needs_service {
                    self.skip_current_order(id);
                    return;
                }
                match depot {
                    Some(d) => match self.depot_tile(d) {
                        Some(tile) => self.set_dest(id, Some(tile)),
                        None => self.void_current_order(id),
                    },
                    None => {
                        let limit = self.settings.pathfinding.max_depot_search_tiles;
                        match self.find_nearest_depot(id, limit) {
                            Some((tile, _, _)) => self.set_dest(id, Some(tile)),
                            None => self.skip_current_order(id),
                        }
                    }
                }
            }
            _ => self.set_dest(id, None),
        }
    }

    fn set_dest(&mut self, id: VehicleId, tile: Option<TileIndex>) {
        if let Some(t) = self.trains.get_mut(&id) {
            t.dest_tile = tile;
        }
    }

    fn skip_current_order(&mut self, id: VehicleId) {
        let n = self.trains.get(&id).map(|t| self.train_orders(t).len()).unwrap_or(0);
        if let Some(t) = self.trains.get_mut(&id) {
            if n > 0 && !t.order_is_manual {
                t.order_index = (t.order_index + 1) % n;
            }
            t.current_order = Order::Nothing;
            t.order_is_manual = false;
            t.dest_tile = None;
        }
    }

    /// The destination is gone: the order turns into a dummy in place.
    fn void_current_order(&mut self, id: VehicleId) {
        let (list, index, manual, tile) = match self.trains.get(&id) {
            Some(t) => (t.orders, t.order_index, t.order_is_manual, self.front_tile(t).unwrap_or(0)),
            None => return,
        };
        if !manual {
            if let Some(l) = list.and_then(|l| self.orders.get_mut(l)) {
                if let Some(o) = l.orders.get_mut(index) {
                    *o = Order::Dummy;
                }
            }
        }
        if let Some(t) = self.trains.get_mut(&id) {
            t.current_order = Order::Dummy;
            t.dest_tile = None;
        }
        let tick = self.tick;
        self.news.add(AdviceKind::VoidOrder, id, tile, tick);
    }

    /// Whether the train stops at a platform of `station` it is entering.
    pub fn should_stop_at_station(&self, train: &Train, station: StationId) -> bool {
        if self.stations.get(station as usize).map(|s| s.waypoint).unwrap_or(false) {
            return false;
        }
        let visited = train.last_station_visited == Some(station);
        match train.current_order {
            Order::GoToStation { station: s, non_stop, .. } => {
                if s == station {
                    !visited
                } else {
                    !non_stop && !visited
                }
            }
            Order::GoToWaypoint { non_stop, .. } => !non_stop && !visited,
            Order::GoToDepot { .. } if train.order_is_manual => false,
            Order::GoToDepot { .. } => !visited,
            Order::Nothing => !visited,
            _ => false,
        }
    }

    /// The train has stopped at a platform of `station`.
    pub fn begin_loading(&mut self, id: VehicleId, station: StationId) {
        let (is_dest, load, unload, last) = match self.trains.get(&id) {
            Some(t) => match t.current_order {
                Order::GoToStation {
                    station: s, load, unload, ..
                } if s == station => (true, load, unload, t.last_station_visited),
                _ => (false, LoadKind::Normal, UnloadKind::Normal, t.last_station_visited),
            },
            None => return,
        };
        let empty = match unload {
            UnloadKind::Unload | UnloadKind::Transfer => true,
            UnloadKind::Normal => last != Some(station),
            UnloadKind::NoUnload => false,
        };
        let members: Vec<VehicleId> = self.trains[&id].members.iter().cloned().collect();
        if empty {
            for m in &members {
                if let Some(v) = self.vehicles.get_mut(*m) {
                    v.cargo = 0;
                }
            }
        }
        let (engines, vehicles, map) = (&self.engines, &self.vehicles, &self.map);
        if let Some(t) = self.trains.get_mut(&id) {
            let rt = t.head().map(|e| map.tile(e.tile).railtype);
            consist_changed(t, vehicles, engines, rt);
            t.speed = 0;
            t.subspeed = 0;
            t.current_order = Order::Loading { station };
            t.order_is_manual = false;
            t.last_station_visited = Some(station);
            t.loading = Some(LoadingState {
                station,
                ticks: 0,
                full_load: load == LoadKind::FullLoad,
                no_load: load == LoadKind::NoLoad,
                is_destination: is_dest,
            });
            debug!("train {} loading at station {}", t.name, station);
        }
    }

    /// One tick of loading. Returns true while the train is still loading.
    pub fn handle_loading(&mut self, id: VehicleId) -> bool {
        let mut state = match self.trains.get(&id).and_then(|t| t.loading) {
            Some(s) => s,
            None => return false,
        };
        state.ticks += 1;
        let loading_ticks = self.settings.game.loading_ticks.max(1);
        let interval = (loading_ticks / 4).max(1);
        let members: Vec<VehicleId> = self.trains[&id].members.iter().cloned().collect();
        let mut all_full = true;
        for m in &members {
            let cap = self
                .vehicles
                .get(*m)
                .and_then(|v| self.engines.get(v.engine as usize))
                .map(|e| e.capacity)
                .unwrap_or(0);
            if let Some(v) = self.vehicles.get_mut(*m) {
                if !state.no_load && state.ticks % interval == 0 && v.cargo < cap {
                    v.cargo = (v.cargo + (cap / 8).max(1)).min(cap);
                }
                if v.cargo < cap {
                    all_full = false;
                }
            }
        }
        let done = if state.full_load {
            all_full
        } else {
            state.ticks >= loading_ticks
        };

        let n = self.train_orders(&self.trains[&id]).len();
        let (engines, vehicles, map) = (&self.engines, &self.vehicles, &self.map);
        let train = match self.trains.get_mut(&id) {
            Some(t) => t,
            None => return false,
        };
        let rt = train.head().map(|e| map.tile(e.tile).railtype);
        consist_changed(train, vehicles, engines, rt);
        if !done {
            train.loading = Some(state);
            return true;
        }
        if state.is_destination && n > 0 {
            train.order_index = (train.order_index + 1) % n;
        }
        train.loading = None;
        train.current_order = Order::LeaveStation;
        train.res.leaving_station = true;
        debug!("train {} leaves station {}", train.name, state.station);
        false
    }

    /// Sends a train that is due for service to the nearest depot, unless its
    /// orders already visit one.
    pub fn check_if_train_needs_service(&mut self, id: VehicleId) {
        let due = match self.trains.get(&id) {
            Some(t) => {
                self.needs_service(t)
                    && !t.stopped
                    && !t.is_crashed()
                    && match t.current_order {
                        Order::GoToDepot { .. } | Order::Loading { .. } | Order::LeaveStation => false,
                        _ => true,
                    }
                    && !self.train_orders(t).iter().any(|o| match o {
                        Order::GoToDepot { .. } => true,
                        _ => false,
                    })
            }
            None => false,
        };
        if !due {
            return;
        }
        if self.is_in_depot(id) {
            self.service_train(id);
            return;
        }
        let limit = match self.settings.pathfinding.max_depot_search_tiles {
            0 => 20,
            n => n,
        };
        if let Some((tile, depot, _)) = self.find_nearest_depot(id, limit) {
            if let Some(t) = self.trains.get_mut(&id) {
                debug!("train {} heads for depot {} for service", t.name, depot);
                t.current_order = Order::GoToDepot {
                    depot: Some(depot),
                    service_only: true,
                    halt: false,
                };
                t.order_is_manual = true;
                t.dest_tile = Some(tile);
            }
        }
    }

    /// Periodic sanity check of a train's order list.
    pub fn check_orders(&mut self, id: VehicleId) {
        let (kinds, tile) = match self.trains.get(&id) {
            Some(t) => {
                let orders = self.train_orders(t);
                let mut kinds = vec![];
                if !orders.is_empty() {
                    let stations = orders
                        .iter()
                        .filter(|o| match o {
                            Order::GoToStation { .. } => true,
                            _ => false,
                        })
                        .count();
                    if stations < 2 {
                        kinds.push(AdviceKind::TooFewOrders);
                    }
                    let n = orders.len();
                    let duplicate = n > 1
                        && (0..n).any(|i| match (orders[i], orders[(i + 1) % n]) {
                            (Order::GoToStation { station: a, .. }, Order::GoToStation { station: b, .. }) => a == b,
                            _ => false,
                        });
                    if duplicate {
                        kinds.push(AdviceKind::DuplicateOrder);
                    }
                    if orders.iter().any(|o| *o == Order::Dummy) {
                        kinds.push(AdviceKind::VoidOrder);
                    }
                }
                (kinds, self.front_tile(t).unwrap_or(0))
            }
            None => return,
        };
        let tick = self.tick;
        for k in kinds {
            self.news.add(k, id, tile, tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(skip_to: usize) -> Order {
        Order::Conditional {
            variable: CondVariable::Always,
            comparator: Comparator::IsTrue,
            value: 0,
            skip_to,
        }
    }

    #[test]
    fn comparators() {
        assert!(Comparator::Less.apply(3, 4));
        assert!(!Comparator::Less.apply(4, 4));
        assert!(Comparator::GreaterEqual.apply(4, 4));
        assert!(Comparator::IsTrue.apply(1, 0));
        assert!(Comparator::IsFalse.apply(0, 7));
        assert_eq!(Comparator::parse("<="), Some(Comparator::LessEqual));
        assert_eq!(CondVariable::parse("age"), Some(CondVariable::Age));
    }

    #[test]
    fn conditionals_jump_and_fall_through() {
        let orders = vec![Order::station(0), cond(3), Order::station(1), Order::station(2)];
        assert_eq!(resolve_index(&orders, 1, |_, _, _| true), Some(3));
        assert_eq!(resolve_index(&orders, 1, |_, _, _| false), Some(2));
        assert_eq!(resolve_index(&orders, 4, |_, _, _| true), Some(0));
        assert_eq!(resolve_index(&[], 0, |_, _, _| true), None);
    }

    #[test]
    fn conditional_loop_is_bounded() {
        let orders = vec![cond(1), cond(0)];
        let mut calls = 0;
        assert_eq!(
            resolve_index(&orders, 0, |_, _, _| {
                calls += 1;
                true
            }),
            None
        );
        assert!(calls <= 3);
    }

    #[test]
    fn pool_frees_list_with_last_sharer() {
        let mut pool = OrderPool::default();
        let id = pool.create(vec![Order::station(0)], 2).unwrap();
        pool.share(id);
        assert_eq!(pool.get(id).unwrap().shared, 2);
        assert!(!pool.leave(id));
        assert!(pool.leave(id));
        assert!(pool.get(id).is_none());

        pool.create(vec![], 2).unwrap();
        pool.create(vec![], 2).unwrap();
        assert!(pool.create(vec![], 2).is_none());
        assert!(pool.orders(None).is_empty());
    }
}
