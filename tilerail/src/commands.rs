//! Player commands. Every command validates the same way whether it is only
//! tested or executed, and touches state only when executed.

use crate::ids::*;
use crate::map::*;
use crate::railway::consist::*;
use crate::railway::orders::{LoadKind, Order, UnloadKind};
use crate::railway::reservation;
use crate::railway::signal;
use crate::railway::World;
use log::{debug, error, info};

/// Cost of one piece of track.
pub const RAIL_COST: i64 = 100;
/// Cost of one signal.
pub const SIGNAL_COST: i64 = 40;

#[derive(Debug, Fail, PartialEq)]
pub enum CommandError {
    #[fail(display = "invalid vehicle")]
    InvalidVehicle,
    #[fail(display = "invalid order index {}", _0)]
    InvalidOrderIndex(usize),
    #[fail(display = "vehicle belongs to another company")]
    WrongOwner,
    #[fail(display = "incompatible rail type")]
    IncompatibleRail,
    #[fail(display = "vehicle cannot carry {}", _0)]
    IncompatibleCargo(String),
    #[fail(display = "no more order lists available")]
    OrderPoolFull,
    #[fail(display = "too many orders")]
    TooManyOrders,
    #[fail(display = "train too long")]
    TrainTooLong,
    #[fail(display = "train must be stopped inside a depot")]
    NotStoppedInDepot,
    #[fail(display = "conflicting order flags")]
    ConflictingFlags,
    #[fail(display = "invalid destination")]
    InvalidDestination,
    #[fail(display = "unknown engine {}", _0)]
    UnknownEngine(EngineId),
    #[fail(display = "no depot found")]
    DepotNotFound,
    #[fail(display = "tile {} is not a depot", _0)]
    NotADepot(TileIndex),
    #[fail(display = "train cannot reverse here")]
    CannotReverse,
    #[fail(display = "train has no power")]
    NoPower,
    #[fail(display = "vehicle is crashed")]
    VehicleCrashed,
    #[fail(display = "a wagon cannot lead a train")]
    WagonCannotLead,
    #[fail(display = "train is already heading for a depot")]
    AlreadyHeadingToDepot,
    #[fail(display = "tile {} is not on the map", _0)]
    InvalidTile(TileIndex),
    #[fail(display = "tile {} is occupied", _0)]
    TileOccupied(TileIndex),
    #[fail(display = "no such track or signal on tile {}", _0)]
    NoTrack(TileIndex),
    #[fail(display = "track on tile {} is in use", _0)]
    TrackInUse(TileIndex),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandFlags {
    pub exec: bool,
}

impl CommandFlags {
    pub const TEST: CommandFlags = CommandFlags { exec: false };
    pub const EXEC: CommandFlags = CommandFlags { exec: true };
}

/// What a command costs, and the vehicle it created if any.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandCost {
    pub cost: i64,
    pub created: Option<VehicleId>,
}

impl CommandCost {
    fn of(cost: i64) -> CommandCost {
        CommandCost { cost, created: None }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloneMode {
    Share,
    Copy,
    Unshare,
}

/// Where a newly built vehicle goes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AttachTo {
    NewTrain,
    Train(VehicleId),
    /// The train built by the first step of the running saga.
    SagaHead,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    InsertOrder { train: VehicleId, index: usize, order: Order },
    DeleteOrder { train: VehicleId, index: usize },
    MoveOrder { train: VehicleId, from: usize, to: usize },
    ModifyOrder { train: VehicleId, index: usize, order: Order },
    CloneOrder { train: VehicleId, source: VehicleId, mode: CloneMode },
    SkipToOrder { train: VehicleId, index: usize },
    BuildRailVehicle { depot: TileIndex, engine: EngineId, attach: AttachTo, name: Option<String> },
    SellRailVehicle { vehicle: VehicleId, whole_train: bool },
    /// Moves `vehicle` (and everything behind it with `chain`) to right after
    /// `after`, or into a train of its own.
    MoveRailVehicle { vehicle: VehicleId, after: Option<VehicleId>, chain: bool },
    /// Turns the train around, or flips a single unit of a train in a depot.
    ReverseTrainDirection { train: VehicleId, unit: Option<VehicleId> },
    ForceTrainProceed { train: VehicleId },
    RefitRailVehicle { vehicle: VehicleId, cargo: String },
    SendTrainToDepot { train: VehicleId, service_only: bool, cancel: bool },
    StartStopTrain { train: VehicleId },
    BuildRail { tile: TileIndex, track: Track, owner: Owner, railtype: RailType },
    RemoveRail { tile: TileIndex, track: Track },
    BuildSignal { tile: TileIndex, track: Track, kind: SignalKind, present: [bool; 2] },
    RemoveSignal { tile: TileIndex, track: Track },
}

impl Command {
    /// The command undoing this one after it succeeded with `result`.
    pub fn compensation(&self, result: &CommandCost) -> Option<Command> {
        match *self {
            Command::BuildRailVehicle { .. } => result.created.map(|vehicle| Command::SellRailVehicle {
                vehicle,
                whole_train: false,
            }),
            Command::InsertOrder { train, index, .. } => Some(Command::DeleteOrder { train, index }),
            Command::BuildRail { tile, track, .. } => Some(Command::RemoveRail { tile, track }),
            Command::BuildSignal { tile, track, .. } => Some(Command::RemoveSignal { tile, track }),
            Command::StartStopTrain { train } => Some(Command::StartStopTrain { train }),
            _ => None,
        }
    }
}

/// An ordered list of commands carried out as one action.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Saga {
    pub steps: Vec<Command>,
}

#[derive(Debug, Fail)]
#[fail(display = "step {} failed: {}", step, error)]
pub struct SagaError {
    pub step: usize,
    pub error: CommandError,
}

/// An engine followed by wagons, attached in order.
pub fn build_train_saga(depot: TileIndex, engine: EngineId, wagons: &[EngineId], name: Option<String>) -> Saga {
    let mut steps = vec![Command::BuildRailVehicle {
        depot,
        engine,
        attach: AttachTo::NewTrain,
        name,
    }];
    steps.extend(wagons.iter().map(|&w| Command::BuildRailVehicle {
        depot,
        engine: w,
        attach: AttachTo::SagaHead,
        name: None,
    }));
    Saga { steps }
}

/// Executes the steps in order. When one fails, the completed steps are
/// undone in reverse and the failing step is reported.
pub fn run_saga(world: &mut World, saga: &Saga) -> Result<CommandCost, SagaError> {
    let mut done: Vec<(Command, CommandCost)> = vec![];
    let mut head = None;
    let mut total = CommandCost::default();
    for (step, cmd) in saga.steps.iter().enumerate() {
        let cmd = match *cmd {
            Command::BuildRailVehicle {
                depot,
                engine,
                attach: AttachTo::SagaHead,
                ref name,
            } => Command::BuildRailVehicle {
                depot,
                engine,
                attach: head.map(AttachTo::Train).unwrap_or(AttachTo::NewTrain),
                name: name.clone(),
            },
            ref c => c.clone(),
        };
        match world.execute(&cmd, CommandFlags::EXEC) {
            Ok(cost) => {
                if head.is_none() {
                    head = cost.created;
                }
                total.cost += cost.cost;
                done.push((cmd, cost));
            }
            Err(error) => {
                debug!("saga step {} failed: {}; undoing {} steps", step, error, done.len());
                for (cmd, cost) in done.iter().rev() {
                    if let Some(undo) = cmd.compensation(cost) {
                        if let Err(e) = world.execute(&undo, CommandFlags::EXEC) {
                            error!("could not undo {:?}: {}", cmd, e);
                        }
                    }
                }
                return Err(SagaError { step, error });
            }
        }
    }
    total.created = head;
    Ok(total)
}

fn check_order_flags(load: LoadKind, unload: UnloadKind) -> Result<(), CommandError> {
    match (load, unload) {
        (LoadKind::FullLoad, UnloadKind::NoUnload) | (LoadKind::NoLoad, UnloadKind::NoUnload) => {
            Err(CommandError::ConflictingFlags)
        }
        _ => Ok(()),
    }
}

impl World {
    /// Tests or executes a command.
    pub fn execute(&mut self, cmd: &Command, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let result = match *cmd {
            Command::InsertOrder { train, index, order } => self.cmd_insert_order(train, index, order, flags),
            Command::DeleteOrder { train, index } => self.cmd_delete_order(train, index, flags),
            Command::MoveOrder { train, from, to } => self.cmd_move_order(train, from, to, flags),
            Command::ModifyOrder { train, index, order } => self.cmd_modify_order(train, index, order, flags),
            Command::CloneOrder { train, source, mode } => self.cmd_clone_order(train, source, mode, flags),
            Command::SkipToOrder { train, index } => self.cmd_skip_to_order(train, index, flags),
            Command::BuildRailVehicle {
                depot,
                engine,
                attach,
                ref name,
            } => self.cmd_build_vehicle(depot, engine, attach, name.as_ref().map(|s| &s[..]), flags),
            Command::SellRailVehicle { vehicle, whole_train } => self.cmd_sell_vehicle(vehicle, whole_train, flags),
            Command::MoveRailVehicle { vehicle, after, chain } => self.cmd_move_vehicle(vehicle, after, chain, flags),
            Command::ReverseTrainDirection { train, unit } => self.cmd_reverse(train, unit, flags),
            Command::ForceTrainProceed { train } => self.cmd_force_proceed(train, flags),
            Command::RefitRailVehicle { vehicle, ref cargo } => self.cmd_refit(vehicle, cargo, flags),
            Command::SendTrainToDepot {
                train,
                service_only,
                cancel,
            } => self.cmd_send_to_depot(train, service_only, cancel, flags),
            Command::StartStopTrain { train } => self.cmd_start_stop(train, flags),
            Command::BuildRail {
                tile,
                track,
                owner,
                railtype,
            } => self.cmd_build_rail(tile, track, owner, railtype, flags),
            Command::RemoveRail { tile, track } => self.cmd_remove_rail(tile, track, flags),
            Command::BuildSignal {
                tile,
                track,
                kind,
                present,
            } => self.cmd_build_signal(tile, track, kind, present, flags),
            Command::RemoveSignal { tile, track } => self.cmd_remove_signal(tile, track, flags),
        };
        if flags.exec {
            match result {
                Ok(ref c) => info!("executed {:?} (cost {})", cmd, c.cost),
                Err(ref e) => debug!("rejected {:?}: {}", cmd, e),
            }
        }
        result
    }

    fn live_train(&self, id: VehicleId) -> Result<&Train, CommandError> {
        match self.trains.get(&id) {
            Some(t) if t.is_crashed() => Err(CommandError::VehicleCrashed),
            Some(t) => Ok(t),
            None => Err(CommandError::InvalidVehicle),
        }
    }

    fn check_order(&self, order: &Order, list_len: usize) -> Result<(), CommandError> {
        match *order {
            Order::GoToStation { station, load, unload, .. } => {
                match self.stations.get(station as usize) {
                    Some(s) if !s.waypoint && !s.tiles.is_empty() => {}
                    _ => return Err(CommandError::InvalidDestination),
                }
                check_order_flags(load, unload)
            }
            Order::GoToWaypoint { waypoint, .. } => match self.stations.get(waypoint as usize) {
                Some(s) if s.waypoint => Ok(()),
                _ => Err(CommandError::InvalidDestination),
            },
            Order::GoToDepot { depot: Some(d), .. } => {
                if self.depot_tile(d).is_some() {
                    Ok(())
                } else {
                    Err(CommandError::InvalidDestination)
                }
            }
            Order::GoToDepot { depot: None, .. } => Ok(()),
            Order::Conditional { skip_to, .. } => {
                if skip_to < list_len {
                    Ok(())
                } else {
                    Err(CommandError::InvalidOrderIndex(skip_to))
                }
            }
            Order::Nothing | Order::Loading { .. } | Order::LeaveStation | Order::Dummy => {
                Err(CommandError::InvalidDestination)
            }
        }
    }

    /// Trains using the order list of `train`, itself included.
    fn sharers(&self, train: VehicleId) -> Vec<VehicleId> {
        let list = match self.trains.get(&train).and_then(|t| t.orders) {
            Some(l) => l,
            None => return vec![train],
        };
        self.trains
            .iter()
            .filter(|(_, t)| t.orders == Some(list))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Remaps the order list of `train` and every sharer's position in it.
    fn edit_orders(&mut self, train: VehicleId, edit: impl FnOnce(&mut Vec<Order>), remap: impl Fn(usize) -> Option<usize>) {
        let list = match self.trains.get(&train).and_then(|t| t.orders) {
            Some(l) => l,
            None => return,
        };
        let len = match self.orders.get_mut(list) {
            Some(l) => {
                edit(&mut l.orders);
                for o in l.orders.iter_mut() {
                    if let Order::Conditional { ref mut skip_to, .. } = *o {
                        *skip_to = remap(*skip_to).unwrap_or(*skip_to);
                    }
                }
                l.orders.len()
            }
            None => return,
        };
        for id in self.sharers(train) {
            if let Some(t) = self.trains.get_mut(&id) {
                match remap(t.order_index) {
                    Some(i) => t.order_index = i,
                    None => {
                        // the current order went away
                        if !t.order_is_manual && t.current_order.is_goto() {
                            t.current_order = Order::Nothing;
                            t.dest_tile = None;
                        }
                    }
                }
                if len == 0 || t.order_index >= len {
                    t.order_index = 0;
                }
            }
        }
    }

    fn cmd_insert_order(&mut self, train: VehicleId, index: usize, order: Order, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let t = self.trains.get(&train).ok_or(CommandError::InvalidVehicle)?;
        let len = self.train_orders(t).len();
        if index > len {
            return Err(CommandError::InvalidOrderIndex(index));
        }
        if len >= self.settings.game.max_orders {
            return Err(CommandError::TooManyOrders);
        }
        self.check_order(&order, len + 1)?;
        let needs_list = t.orders.is_none();
        if needs_list && self.orders.len() >= self.settings.game.max_order_lists {
            return Err(CommandError::OrderPoolFull);
        }
        if !flags.exec {
            return Ok(CommandCost::default());
        }

        if needs_list {
            let max = self.settings.game.max_order_lists;
            let list = self.orders.create(vec![order], max).ok_or(CommandError::OrderPoolFull)?;
            if let Some(t) = self.trains.get_mut(&train) {
                t.orders = Some(list);
                t.order_index = 0;
            }
        } else {
            let shift = move |i: usize| Some(if i >= index { i + 1 } else { i });
            self.edit_orders(train, |orders| orders.insert(index, order), shift);
            // the conditional just inserted already points where it should
            if let Order::Conditional { skip_to, .. } = order {
                let list = self.trains.get(&train).and_then(|t| t.orders);
                if let Some(o) = list.and_then(|l| self.orders.get_mut(l)).and_then(|l| l.orders.get_mut(index)) {
                    if let Order::Conditional { skip_to: ref mut s, .. } = *o {
                        *s = skip_to;
                    }
                }
            }
        }
        Ok(CommandCost::default())
    }

    fn cmd_delete_order(&mut self, train: VehicleId, index: usize, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let t = self.trains.get(&train).ok_or(CommandError::InvalidVehicle)?;
        if index >= self.train_orders(t).len() {
            return Err(CommandError::InvalidOrderIndex(index));
        }
        if !flags.exec {
            return Ok(CommandCost::default());
        }
        let remap = move |i: usize| {
            if i == index {
                None
            } else if i > index {
                Some(i - 1)
            } else {
                Some(i)
            }
        };
        self.edit_orders(
            train,
            |orders| {
                orders.remove(index);
            },
            remap,
        );
        Ok(CommandCost::default())
    }

    fn cmd_move_order(&mut self, train: VehicleId, from: usize, to: usize, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let t = self.trains.get(&train).ok_or(CommandError::InvalidVehicle)?;
        let len = self.train_orders(t).len();
        if from >= len {
            return Err(CommandError::InvalidOrderIndex(from));
        }
        if to >= len {
            return Err(CommandError::InvalidOrderIndex(to));
        }
        if !flags.exec || from == to {
            return Ok(CommandCost::default());
        }
        let remap = move |i: usize| {
            Some(if i == from {
                to
            } else if from < to && i > from && i <= to {
                i - 1
            } else if to < from && i >= to && i < from {
                i + 1
            } else {
                i
            })
        };
        self.edit_orders(
            train,
            |orders| {
                let o = orders.remove(from);
                orders.insert(to, o);
            },
            remap,
        );
        Ok(CommandCost::default())
    }

    fn cmd_modify_order(&mut self, train: VehicleId, index: usize, order: Order, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let t = self.trains.get(&train).ok_or(CommandError::InvalidVehicle)?;
        let orders = self.train_orders(t);
        let old = *orders.get(index).ok_or(CommandError::InvalidOrderIndex(index))?;
        if !old.same_kind(&order) {
            return Err(CommandError::InvalidDestination);
        }
        self.check_order(&order, orders.len())?;
        if !flags.exec {
            return Ok(CommandCost::default());
        }
        let list = t.orders;
        if let Some(o) = list.and_then(|l| self.orders.get_mut(l)).and_then(|l| l.orders.get_mut(index)) {
            *o = order;
        }
        for id in self.sharers(train) {
            if let Some(t) = self.trains.get_mut(&id) {
                if t.order_index == index && !t.order_is_manual && t.current_order.is_goto() {
                    t.current_order = Order::Nothing;
                    t.dest_tile = None;
                }
            }
        }
        Ok(CommandCost::default())
    }

    fn cmd_clone_order(&mut self, train: VehicleId, source: VehicleId, mode: CloneMode, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let t = self.trains.get(&train).ok_or(CommandError::InvalidVehicle)?;
        let own = t.orders;
        let src = match mode {
            CloneMode::Unshare => own,
            _ => {
                if source == train {
                    return Err(CommandError::InvalidVehicle);
                }
                let s = self.trains.get(&source).ok_or(CommandError::InvalidVehicle)?;
                if s.owner != t.owner {
                    return Err(CommandError::WrongOwner);
                }
                s.orders
            }
        };
        let needs_new = match mode {
            CloneMode::Share => false,
            CloneMode::Copy => src.is_some(),
            CloneMode::Unshare => own.and_then(|l| self.orders.get(l)).map(|l| l.shared > 1).unwrap_or(false),
        };
        if needs_new && self.orders.len() >= self.settings.game.max_order_lists {
            return Err(CommandError::OrderPoolFull);
        }
        if !flags.exec {
            return Ok(CommandCost::default());
        }
        if mode == CloneMode::Unshare && !needs_new {
            return Ok(CommandCost::default());
        }
        if mode == CloneMode::Share && own == src {
            return Ok(CommandCost::default());
        }

        let copied: Vec<Order> = self.orders.orders(src).to_vec();
        if let Some(l) = own {
            self.orders.leave(l);
        }
        let new_list = match mode {
            CloneMode::Share => {
                if let Some(l) = src {
                    self.orders.share(l);
                }
                src
            }
            _ if copied.is_empty() => None,
            _ => {
                let max = self.settings.game.max_order_lists;
                Some(self.orders.create(copied, max).ok_or(CommandError::OrderPoolFull)?)
            }
        };
        let len = self.orders.orders(new_list).len();
        if let Some(t) = self.trains.get_mut(&train) {
            t.orders = new_list;
            if mode != CloneMode::Unshare {
                t.order_index = 0;
                if t.current_order.is_goto() && !t.order_is_manual {
                    t.current_order = Order::Nothing;
                    t.dest_tile = None;
                }
            }
            if t.order_index >= len {
                t.order_index = 0;
            }
        }
        Ok(CommandCost::default())
    }

    fn cmd_skip_to_order(&mut self, train: VehicleId, index: usize, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let t = self.trains.get(&train).ok_or(CommandError::InvalidVehicle)?;
        if index >= self.train_orders(t).len() {
            return Err(CommandError::InvalidOrderIndex(index));
        }
        if !flags.exec {
            return Ok(CommandCost::default());
        }
        if let Some(t) = self.trains.get_mut(&train) {
            t.order_index = index;
            t.current_order = match t.current_order {
                Order::Loading { .. } => Order::LeaveStation,
                _ => Order::Nothing,
            };
            t.order_is_manual = false;
            t.dest_tile = None;
        }
        Ok(CommandCost::default())
    }

    fn free_train_name(&self) -> String {
        let mut n = self.trains.len() + 1;
        loop {
            let name = format!("Train {}", n);
            if self.train_by_name(&name).is_none() {
                return name;
            }
            n += 1;
        }
    }

    fn max_length_units(&self) -> u32 {
        self.settings.vehicle.max_train_length * TILE_SIZE as u32
    }

    fn cmd_build_vehicle(
        &mut self,
        depot: TileIndex,
        engine: EngineId,
        attach: AttachTo,
        name: Option<&str>,
        flags: CommandFlags,
    ) -> Result<CommandCost, CommandError> {
        if depot as usize >= self.map.len() {
            return Err(CommandError::InvalidTile(depot));
        }
        if self.map.depot(depot).is_none() {
            return Err(CommandError::NotADepot(depot));
        }
        let info = self.engines.get(engine as usize).ok_or(CommandError::UnknownEngine(engine))?;
        if !info.railtype.compatible().contains(self.map.tile(depot).railtype) {
            return Err(CommandError::IncompatibleRail);
        }
        let cost = info.cost();
        let length = info.length as u32;
        let target = match attach {
            AttachTo::NewTrain | AttachTo::SagaHead => {
                if !info.is_engine {
                    return Err(CommandError::WagonCannotLead);
                }
                None
            }
            AttachTo::Train(id) => {
                let t = self.live_train(id)?;
                if !self.stopped_in_depot(id) || self.front_tile(t) != Some(depot) {
                    return Err(CommandError::NotStoppedInDepot);
                }
                if t.cache.total_length + length > self.max_length_units() {
                    return Err(CommandError::TrainTooLong);
                }
                Some(id)
            }
        };
        if !flags.exec {
            return Ok(CommandCost::of(cost));
        }

        let created = match target {
            None => {
                let name = name.map(|n| n.to_string()).unwrap_or_else(|| self.free_train_name());
                self.spawn_in_depot(&name, depot, &[engine], true)
                    .ok_or(CommandError::NotADepot(depot))?
            }
            Some(id) => {
                let info = &self.engines[engine as usize];
                let mut v = Vehicle::new(engine, info);
                v.train = Some(id);
                v.coord = DEPOT_HIDE_OFFSET as i64 - 1;
                v.hidden = true;
                let vid = self.vehicles.insert(v);
                if let Some(t) = self.trains.get_mut(&id) {
                    t.members.push(vid);
                }
                self.refresh_consist(id);
                if let Some(t) = self.trains.get(&id) {
                    place_vehicles(&self.map, t, &mut self.vehicles);
                }
                vid
            }
        };
        Ok(CommandCost {
            cost,
            created: Some(created),
        })
    }

    fn vehicle_train(&self, vehicle: VehicleId) -> Result<VehicleId, CommandError> {
        let v = self.vehicles.get(vehicle).ok_or(CommandError::InvalidVehicle)?;
        let id = v.train.ok_or(CommandError::InvalidVehicle)?;
        self.live_train(id)?;
        Ok(id)
    }

    fn is_engine(&self, vehicle: VehicleId) -> bool {
        self.vehicles
            .get(vehicle)
            .and_then(|v| self.engines.get(v.engine as usize))
            .map(|e| e.is_engine)
            .unwrap_or(false)
    }

    fn vehicle_value(&self, vehicle: VehicleId) -> i64 {
        self.vehicles
            .get(vehicle)
            .and_then(|v| self.engines.get(v.engine as usize))
            .map(|e| e.cost())
            .unwrap_or(0)
    }

    fn cmd_sell_vehicle(&mut self, vehicle: VehicleId, whole_train: bool, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let id = self.vehicle_train(vehicle)?;
        if !self.stopped_in_depot(id) {
            return Err(CommandError::NotStoppedInDepot);
        }
        let members: Vec<VehicleId> = self.trains[&id].members.iter().cloned().collect();
        let pos = members.iter().position(|m| *m == vehicle).ok_or(CommandError::InvalidVehicle)?;
        let whole = whole_train || members.len() == 1;
        if !whole && pos == 0 && !self.is_engine(members[1]) {
            return Err(CommandError::WagonCannotLead);
        }
        let refund: i64 = if whole {
            members.iter().map(|m| self.vehicle_value(*m)).sum()
        } else {
            self.vehicle_value(vehicle)
        };
        if !flags.exec {
            return Ok(CommandCost::of(-refund));
        }

        if whole {
            self.remove_train(id);
        } else {
            if let Some(t) = self.trains.get_mut(&id) {
                t.members.remove(pos);
            }
            self.vehicles.remove(vehicle);
            let key = if pos == 0 { members[1] } else { id };
            self.rekey_train(id, key);
            self.refresh_consist(key);
        }
        Ok(CommandCost::of(-refund))
    }

    fn cmd_move_vehicle(&mut self, vehicle: VehicleId, after: Option<VehicleId>, chain: bool, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let src = self.vehicle_train(vehicle)?;
        if !self.stopped_in_depot(src) {
            return Err(CommandError::NotStoppedInDepot);
        }
        let src_members: Vec<VehicleId> = self.trains[&src].members.iter().cloned().collect();
        let pos = src_members.iter().position(|m| *m == vehicle).ok_or(CommandError::InvalidVehicle)?;
        let moving: Vec<VehicleId> = if chain {
            src_members[pos..].to_vec()
        } else {
            vec![vehicle]
        };
        let remaining: Vec<VehicleId> = src_members.iter().filter(|m| !moving.contains(m)).cloned().collect();
        if after.is_none() && remaining.is_empty() {
            // already a train of its own
            return Ok(CommandCost::default());
        }

        let dest = match after {
            Some(a) => {
                if moving.contains(&a) {
                    return Err(CommandError::InvalidVehicle);
                }
                let d = self.vehicle_train(a)?;
                let depot = self.trains.get(&src).and_then(|t| self.front_tile(t));
                if !self.stopped_in_depot(d) || self.trains.get(&d).and_then(|t| self.front_tile(t)) != depot {
                    return Err(CommandError::NotStoppedInDepot);
                }
                if self.trains[&d].owner != self.trains[&src].owner {
                    return Err(CommandError::WrongOwner);
                }
                Some((d, a))
            }
            None => None,
        };

        let length = |list: &[VehicleId]| -> u32 {
            list.iter()
                .filter_map(|m| self.vehicles.get(*m))
                .filter_map(|v| self.engines.get(v.engine as usize))
                .map(|e| e.length as u32)
                .sum()
        };
        // the lists after the move, keyed by their current train
        let (new_src, new_dest): (Vec<VehicleId>, Option<(VehicleId, Vec<VehicleId>)>) = match dest {
            Some((d, a)) if d == src => {
                let mut list = remaining.clone();
                let at = list.iter().position(|m| *m == a).map(|p| p + 1).unwrap_or(list.len());
                for (i, m) in moving.iter().enumerate() {
                    list.insert(at + i, *m);
                }
                (list, None)
            }
            Some((d, a)) => {
                let mut list: Vec<VehicleId> = self.trains[&d].members.iter().cloned().collect();
                let at = list.iter().position(|m| *m == a).map(|p| p + 1).unwrap_or(list.len());
                for (i, m) in moving.iter().enumerate() {
                    list.insert(at + i, *m);
                }
                (remaining.clone(), Some((d, list)))
            }
            None => (remaining.clone(), None),
        };
        if let Some(first) = new_src.first() {
            if !self.is_engine(*first) {
                return Err(CommandError::WagonCannotLead);
            }
        }
        if let Some((_, ref list)) = new_dest {
            if list.first().map(|f| !self.is_engine(*f)).unwrap_or(true) {
                return Err(CommandError::WagonCannotLead);
            }
            if length(list) > self.max_length_units() {
                return Err(CommandError::TrainTooLong);
            }
        }
        if after.is_none() && !self.is_engine(moving[0]) {
            return Err(CommandError::WagonCannotLead);
        }
        if !flags.exec {
            return Ok(CommandCost::default());
        }

        let (owner, path, name) = {
            let t = &self.trains[&src];
            (t.owner, t.path.clone(), t.name.clone())
        };
        // source keeps what is left
        if new_src.is_empty() {
            if let Some(t) = self.trains.remove(&src) {
                if let Some(l) = t.orders {
                    self.orders.leave(l);
                }
            }
        } else {
            if let Some(t) = self.trains.get_mut(&src) {
                t.members = new_src.iter().cloned().collect();
            }
            self.rekey_train(src, new_src[0]);
            self.refresh_consist(new_src[0]);
        }

        let dest_key = match new_dest {
            Some((d, list)) => {
                if let Some(t) = self.trains.get_mut(&d) {
                    t.members = list.iter().cloned().collect();
                }
                for m in &list {
                    if let Some(v) = self.vehicles.get_mut(*m) {
                        v.train = Some(d);
                    }
                }
                self.rekey_train(d, list[0]);
                Some(list[0])
            }
            None if after.is_none() => {
                let mut t = Train::new(&format!("{}/{}", name, short_id(moving[0])), owner);
                t.members = moving.iter().cloned().collect();
                t.path = path;
                t.stopped = true;
                for m in &moving {
                    if let Some(v) = self.vehicles.get_mut(*m) {
                        v.train = Some(moving[0]);
                    }
                }
                self.trains.insert(moving[0], t);
                Some(moving[0])
            }
            None => None,
        };
        if let Some(k) = dest_key {
            self.refresh_consist(k);
            if let Some(t) = self.trains.get(&k) {
                place_vehicles(&self.map, t, &mut self.vehicles);
            }
        }
        Ok(CommandCost::default())
    }

    fn cmd_reverse(&mut self, train: VehicleId, unit: Option<VehicleId>, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let t = self.live_train(train)?;
        if let Some(u) = unit {
            if !t.members.contains(&u) {
                return Err(CommandError::InvalidVehicle);
            }
            if !self.stopped_in_depot(train) {
                return Err(CommandError::NotStoppedInDepot);
            }
            if flags.exec {
                if let Some(v) = self.vehicles.get_mut(u) {
                    v.flipped = !v.flipped;
                }
            }
            return Ok(CommandCost::default());
        }
        if self.is_in_depot(train) {
            return Err(CommandError::CannotReverse);
        }
        if !flags.exec {
            return Ok(CommandCost::default());
        }

        let realistic = self.settings.vehicle.acceleration_model == crate::railway::dynamics::AccelerationModel::Realistic;
        let moving = match self.trains.get_mut(&train) {
            Some(t) => {
                if let Order::Loading { .. } = t.current_order {
                    t.current_order = Order::LeaveStation;
                    t.loading = None;
                    t.res.leaving_station = true;
                }
                t.force_proceed = ForceProceed::None;
                if realistic && t.speed != 0 {
                    t.res.reversing = !t.res.reversing;
                    true
                } else {
                    t.speed = 0;
                    false
                }
            }
            None => return Err(CommandError::InvalidVehicle),
        };
        if !moving {
            self.reverse_train_direction(train);
        }
        Ok(CommandCost::default())
    }

    fn cmd_force_proceed(&mut self, train: VehicleId, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        self.live_train(train)?;
        if flags.exec {
            let in_depot = self.is_in_depot(train);
            if let Some(t) = self.trains.get_mut(&train) {
                // a train held at a red signal is let past it, stuck or not
                t.force_proceed = match t.force_proceed {
                    ForceProceed::Signal => ForceProceed::None,
                    _ if in_depot => ForceProceed::Stuck,
                    _ if t.res.waiting_at_signal => ForceProceed::Signal,
                    _ if t.res.stuck => ForceProceed::Stuck,
                    _ => ForceProceed::Signal,
                };
            }
        }
        Ok(CommandCost::default())
    }

    fn cmd_refit(&mut self, vehicle: VehicleId, cargo: &str, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let id = self.vehicle_train(vehicle)?;
        let info = self
            .vehicles
            .get(vehicle)
            .and_then(|v| self.engines.get(v.engine as usize))
            .ok_or(CommandError::InvalidVehicle)?;
        if info.capacity == 0 || !info.cargos.iter().any(|c| c == cargo) {
            return Err(CommandError::IncompatibleCargo(cargo.to_string()));
        }
        if !self.stopped_in_depot(id) {
            return Err(CommandError::NotStoppedInDepot);
        }
        if flags.exec {
            if let Some(v) = self.vehicles.get_mut(vehicle) {
                v.cargo_type = cargo.to_string();
                v.cargo = 0;
            }
            self.refresh_consist(id);
        }
        Ok(CommandCost::default())
    }

    fn cmd_send_to_depot(&mut self, train: VehicleId, service_only: bool, cancel: bool, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let t = self.live_train(train)?;
        if let Order::GoToDepot { .. } = t.current_order {
            if !cancel {
                return Err(CommandError::AlreadyHeadingToDepot);
            }
            if flags.exec {
                if let Some(t) = self.trains.get_mut(&train) {
                    if !t.order_is_manual {
                        let n = self.orders.orders(t.orders).len().max(1);
                        t.order_index = (t.order_index + 1) % n;
                    }
                    t.current_order = Order::Nothing;
                    t.order_is_manual = false;
                    t.dest_tile = None;
                }
            }
            return Ok(CommandCost::default());
        }

        let rng = self.rng.clone();
        let limit = self.settings.pathfinding.max_depot_search_tiles;
        let found = self.find_nearest_depot(train, limit);
        if !flags.exec {
            self.rng = rng;
        }
        let (tile, depot, reverse) = found.ok_or(CommandError::DepotNotFound)?;
        if !flags.exec {
            return Ok(CommandCost::default());
        }

        if let Some(t) = self.trains.get_mut(&train) {
            if let Order::Loading { .. } = t.current_order {
                t.loading = None;
                t.res.leaving_station = true;
            }
            t.current_order = Order::GoToDepot {
                depot: Some(depot),
                service_only,
                halt: !service_only,
            };
            t.order_is_manual = true;
            t.dest_tile = Some(tile);
            debug!("train {} sent to depot {} at {}", t.name, depot, tile);
        }
        if reverse {
            let speed = self.trains.get(&train).map(|t| t.speed).unwrap_or(0);
            if speed == 0 {
                self.reverse_train_direction(train);
            } else if let Some(t) = self.trains.get_mut(&train) {
                t.res.reversing = true;
            }
        }
        Ok(CommandCost::default())
    }

    fn cmd_start_stop(&mut self, train: VehicleId, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let t = self.live_train(train)?;
        if t.stopped && !t.power.has_power {
            return Err(CommandError::NoPower);
        }
        if flags.exec {
            if let Some(t) = self.trains.get_mut(&train) {
                t.stopped = !t.stopped;
                t.wait_counter = 0;
            }
        }
        Ok(CommandCost::default())
    }

    fn check_tile(&self, tile: TileIndex) -> Result<(), CommandError> {
        if (tile as usize) < self.map.len() {
            Ok(())
        } else {
            Err(CommandError::InvalidTile(tile))
        }
    }

    fn cmd_build_rail(&mut self, tile: TileIndex, track: Track, owner: Owner, railtype: RailType, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        self.check_tile(tile)?;
        let free = match self.map.tile(tile).kind {
            TileKind::Clear => true,
            TileKind::Rail { .. } => {
                if self.map.track_bits(tile).contains(track) {
                    return Err(CommandError::TileOccupied(tile));
                }
                if self.map.tile(tile).railtype != railtype {
                    return Err(CommandError::IncompatibleRail);
                }
                false
            }
            _ => return Err(CommandError::TileOccupied(tile)),
        };
        if !free && self.map.tile(tile).owner != owner {
            return Err(CommandError::WrongOwner);
        }
        if !flags.exec {
            return Ok(CommandCost::of(RAIL_COST));
        }
        self.map
            .build_rail(tile, track, owner, railtype)
            .map_err(|_| CommandError::TileOccupied(tile))?;
        self.signal_buffer.add_track(&self.map, tile, track);
        self.flush_signals();
        Ok(CommandCost::of(RAIL_COST))
    }

    fn cmd_remove_rail(&mut self, tile: TileIndex, track: Track, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        self.check_tile(tile)?;
        if !self.map.is_plain_rail(tile) || !self.map.track_bits(tile).contains(track) {
            return Err(CommandError::NoTrack(tile));
        }
        let occupied = self
            .vehicles
            .values()
            .any(|v| v.tile == tile && !v.hidden && v.trackdir.track == track);
        if occupied || reservation::holder(&self.map, tile, track).is_some() {
            return Err(CommandError::TrackInUse(tile));
        }
        if !flags.exec {
            return Ok(CommandCost::of(RAIL_COST / 2));
        }
        self.signal_buffer.add_track(&self.map, tile, track);
        match self.map.remove_rail(tile, track) {
            Ok(true) => {}
            Ok(false) => return Err(CommandError::TrackInUse(tile)),
            Err(_) => return Err(CommandError::NoTrack(tile)),
        }
        self.flush_signals();
        Ok(CommandCost::of(RAIL_COST / 2))
    }

    fn cmd_build_signal(&mut self, tile: TileIndex, track: Track, kind: SignalKind, present: [bool; 2], flags: CommandFlags) -> Result<CommandCost, CommandError> {
        self.check_tile(tile)?;
        if !self.map.is_plain_rail(tile) || !self.map.track_bits(tile).contains(track) {
            return Err(CommandError::NoTrack(tile));
        }
        if !present[0] && !present[1] {
            return Err(CommandError::ConflictingFlags);
        }
        if !flags.exec {
            return Ok(CommandCost::of(SIGNAL_COST));
        }
        self.map
            .build_signal(tile, track, kind, present)
            .map_err(|_| CommandError::NoTrack(tile))?;
        signal::refresh_path_signals(&mut self.map, tile);
        self.signal_buffer.add_track(&self.map, tile, track);
        self.flush_signals();
        Ok(CommandCost::of(SIGNAL_COST))
    }

    fn cmd_remove_signal(&mut self, tile: TileIndex, track: Track, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        self.check_tile(tile)?;
        if self.map.signal(tile, track).is_none() {
            return Err(CommandError::NoTrack(tile));
        }
        if !flags.exec {
            return Ok(CommandCost::of(SIGNAL_COST / 2));
        }
        self.map.remove_signal(tile, track);
        self.signal_buffer.add_track(&self.map, tile, track);
        self.flush_signals();
        Ok(CommandCost::of(SIGNAL_COST / 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::settings::Settings;

    fn engine(name: &str, is_engine: bool, length: u8) -> EngineInfo {
        EngineInfo {
            name: name.to_string(),
            is_engine,
            power_kw: if is_engine { 1500 } else { 0 },
            weight_t: 40,
            max_speed: 100,
            max_te_kn: if is_engine { 200 } else { 0 },
            length,
            railtype: RailType::Rail,
            capacity: if is_engine { 0 } else { 30 },
            cargos: if is_engine { vec![] } else { vec!["coal".to_string(), "goods".to_string()] },
        }
    }

    fn depot_world() -> (World, TileIndex, EngineId, EngineId) {
        let mut map = Map::new(6, 3);
        let depot = map.tile_xy(0, 1).unwrap();
        map.build_depot(depot, 0, DiagDir::SW, 0, RailType::Rail).unwrap();
        for x in 1..6 {
            let t = map.tile_xy(x, 1).unwrap();
            map.build_rail(t, Track::X, 0, RailType::Rail).unwrap();
        }
        let mut w = World::new(map, Settings::default());
        w.add_depot("D", depot);
        let e = w.add_engine(engine("loco", true, 8));
        let c = w.add_engine(engine("coach", false, 6));
        (w, depot, e, c)
    }

    #[test]
    fn test_mode_leaves_world_alone() {
        let (mut w, depot, e, _) = depot_world();
        let cmd = Command::BuildRailVehicle {
            depot,
            engine: e,
            attach: AttachTo::NewTrain,
            name: None,
        };
        let tested = w.execute(&cmd, CommandFlags::TEST).unwrap();
        assert!(w.trains.is_empty());
        let done = w.execute(&cmd, CommandFlags::EXEC).unwrap();
        assert_eq!(tested.cost, done.cost);
        assert_eq!(w.trains.len(), 1);
    }

    #[test]
    fn wagon_cannot_lead() {
        let (mut w, depot, _, c) = depot_world();
        let cmd = Command::BuildRailVehicle {
            depot,
            engine: c,
            attach: AttachTo::NewTrain,
            name: None,
        };
        assert_eq!(w.execute(&cmd, CommandFlags::EXEC), Err(CommandError::WagonCannotLead));
    }

    #[test]
    fn saga_builds_in_order_and_undoes_on_failure() {
        let (mut w, depot, e, c) = depot_world();
        let saga = build_train_saga(depot, e, &[c, c], Some("T".to_string()));
        let done = run_saga(&mut w, &saga).unwrap();
        let id = done.created.unwrap();
        assert_eq!(w.trains[&id].members.len(), 3);
        assert_eq!(w.trains[&id].cache.total_length, 20);

        w.settings.vehicle.max_train_length = 1;
        let before = w.vehicles.len();
        let saga = build_train_saga(depot, e, &[c, c], Some("U".to_string()));
        let err = run_saga(&mut w, &saga).unwrap_err();
        assert_eq!(err.step, 2);
        assert_eq!(err.error, CommandError::TrainTooLong);
        assert_eq!(w.vehicles.len(), before);
        assert!(w.train_by_name("U").is_none());
    }

    #[test]
    fn conflicting_load_flags_are_rejected() {
        let (mut w, depot, e, _) = depot_world();
        let st = w.map.tile_xy(4, 0).unwrap();
        w.map.build_station(st, 0, Axis::X, 0, RailType::Rail).unwrap();
        w.add_station_tile("S", false, st);
        let id = w.spawn_in_depot("T", depot, &[e], true).unwrap();
        let order = Order::GoToStation {
            station: 0,
            non_stop: false,
            load: LoadKind::FullLoad,
            unload: UnloadKind::NoUnload,
        };
        let cmd = Command::InsertOrder { train: id, index: 0, order };
        assert_eq!(w.execute(&cmd, CommandFlags::TEST), Err(CommandError::ConflictingFlags));
        let ok = Command::InsertOrder {
            train: id,
            index: 0,
            order: Order::station(0),
        };
        assert!(w.execute(&ok, CommandFlags::EXEC).is_ok());
        assert_eq!(w.train_orders(&w.trains[&id]).len(), 1);
    }

    #[test]
    fn sell_requires_stopped_in_depot() {
        let (mut w, depot, e, _) = depot_world();
        let id = w.spawn_in_depot("T", depot, &[e], false).unwrap();
        let sell = Command::SellRailVehicle {
            vehicle: id,
            whole_train: true,
        };
        assert_eq!(w.execute(&sell, CommandFlags::TEST), Err(CommandError::NotStoppedInDepot));
        w.execute(&Command::StartStopTrain { train: id }, CommandFlags::EXEC).unwrap();
        let refund = w.execute(&sell, CommandFlags::EXEC).unwrap();
        assert!(refund.cost < 0);
        assert!(w.trains.is_empty());
        assert!(w.vehicles.is_empty());
    }

    #[test]
    fn shared_orders_follow_deletes() {
        let (mut w, depot, e, _) = depot_world();
        for (i, x) in [2u32, 4].iter().enumerate() {
            let st = w.map.tile_xy(*x, 0).unwrap();
            w.map.build_station(st, i as StationId, Axis::X, 0, RailType::Rail).unwrap();
            w.add_station_tile(&format!("S{}", i), false, st);
        }
        let a = w.spawn_in_depot("A", depot, &[e], true).unwrap();
        let b = w.spawn_in_depot("B", depot, &[e], true).unwrap();
        for (i, s) in [0, 1].iter().enumerate() {
            let cmd = Command::InsertOrder {
                train: a,
                index: i,
                order: Order::station(*s),
            };
            w.execute(&cmd, CommandFlags::EXEC).unwrap();
        }
        let share = Command::CloneOrder {
            train: b,
            source: a,
            mode: CloneMode::Share,
        };
        w.execute(&share, CommandFlags::EXEC).unwrap();
        let list = w.trains[&a].orders.unwrap();
        assert_eq!(w.orders.get(list).unwrap().shared, 2);
        w.execute(&Command::DeleteOrder { train: b, index: 0 }, CommandFlags::EXEC).unwrap();
        assert_eq!(w.train_orders(&w.trains[&a]), &[Order::station(1)]);

        let unshare = Command::CloneOrder {
            train: b,
            source: b,
            mode: CloneMode::Unshare,
        };
        w.execute(&unshare, CommandFlags::EXEC).unwrap();
        assert_ne!(w.trains[&b].orders, Some(list));
        assert_eq!(w.orders.get(list).unwrap().shared, 1);
    }
}
