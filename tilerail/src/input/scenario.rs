use crate::ids::*;
use crate::input::settings::Settings;
use crate::map::*;
use crate::railway::consist::EngineInfo;
use crate::railway::orders::{Comparator, CondVariable, LoadKind, Order, UnloadKind};
use crate::railway::signal;
use crate::railway::World;
use log::debug;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

#[derive(Debug, Fail)]
pub enum ParseError {
    #[fail(display = "error in regular expression: {}", _0)]
    RegexError(String),
    #[fail(display = "line {}: error converting number", _0)]
    NumberError(usize),
    #[fail(display = "line {}: unrecognized scenario line: {}", _0, _1)]
    Unrecognized(usize, String),
    #[fail(display = "line {}: the map must be declared first", _0)]
    NoMap(usize),
    #[fail(display = "line {}: unknown {} {:?}", _0, _1, _2)]
    Unknown(usize, &'static str, String),
    #[fail(display = "line {}: {}", _0, _1)]
    Map(usize, String),
    #[fail(display = "line {}: invalid order: {}", _0, _1)]
    InvalidOrder(usize, String),
}

fn re(s: &str) -> Result<Regex, ParseError> {
    Regex::new(s).map_err(|e| ParseError::RegexError(format!("{:?}", e)))
}

/// `key=value` options trailing a line.
fn options(line: usize, s: Option<regex::Match>) -> Result<BTreeMap<String, String>, ParseError> {
    let mut map = BTreeMap::new();
    if let Some(s) = s {
        for word in s.as_str().split_whitespace() {
            match word.find('=') {
                Some(i) => {
                    map.insert(word[..i].to_string(), word[i + 1..].to_string());
                }
                None => return Err(ParseError::Unrecognized(line, word.to_string())),
            }
        }
    }
    Ok(map)
}

struct Parser {
    world: Option<World>,
    settings: Settings,
    line: usize,
    orders: BTreeMap<String, Vec<(usize, Order)>>,
}

impl Parser {
    fn world(&mut self) -> Result<&mut World, ParseError> {
        let line = self.line;
        self.world.as_mut().ok_or(ParseError::NoMap(line))
    }

    fn num<T: std::str::FromStr>(&self, s: &str) -> Result<T, ParseError> {
        s.parse::<T>().map_err(|_e| ParseError::NumberError(self.line))
    }

    fn opt_num<T: std::str::FromStr>(&self, opts: &BTreeMap<String, String>, key: &str, default: T) -> Result<T, ParseError> {
        match opts.get(key) {
            Some(v) => self.num(v),
            None => Ok(default),
        }
    }

    fn tile(&mut self, x: &str, y: &str) -> Result<TileIndex, ParseError> {
        let line = self.line;
        let (x, y) = (self.num::<u32>(x)?, self.num::<u32>(y)?);
        self.world()?
            .map
            .tile_xy(x, y)
            .ok_or_else(|| ParseError::Map(line, format!("tile ({}, {}) is outside the map", x, y)))
    }

    fn unknown(&self, what: &'static str, s: &str) -> ParseError {
        ParseError::Unknown(self.line, what, s.to_string())
    }

    fn map_err(&self, e: MapError) -> ParseError {
        ParseError::Map(self.line, format!("{}", e))
    }

    fn railtype(&self, opts: &BTreeMap<String, String>) -> Result<RailType, ParseError> {
        match opts.get("type") {
            Some(t) => RailType::parse(t).ok_or_else(|| self.unknown("rail type", t)),
            None => Ok(RailType::Rail),
        }
    }

    fn consist(&mut self, list: &str) -> Result<Vec<EngineId>, ParseError> {
        let mut ids = vec![];
        for name in list.split(',') {
            let id = self.world()?.engine_by_name(name);
            ids.push(id.ok_or_else(|| self.unknown("engine", name))?);
        }
        Ok(ids)
    }

    fn engine(&self, name: &str, is_engine: bool, opts: &BTreeMap<String, String>) -> Result<EngineInfo, ParseError> {
        let capacity = self.opt_num(opts, "capacity", 0u32)?;
        let cargos = match opts.get("cargo") {
            Some(c) => c.split(',').map(|s| s.to_string()).collect(),
            None if capacity > 0 => vec!["goods".to_string()],
            None => vec![],
        };
        let required = |key: &str| opts.get(key).ok_or_else(|| ParseError::Unknown(self.line, "value for", key.to_string()));
        Ok(EngineInfo {
            name: name.to_string(),
            is_engine,
            power_kw: if is_engine { self.num(required("power")?)? } else { 0 },
            weight_t: self.num(required("weight")?)?,
            max_speed: self.opt_num(opts, "speed", 0)?,
            max_te_kn: if is_engine { self.opt_num(opts, "te", 0)? } else { 0 },
            length: self.num(required("len")?)?,
            railtype: self.railtype(opts)?,
            capacity,
            cargos,
        })
    }

    /// `along` faces trains on the forward trackdir (`x_ne`, `y_se`, ...),
    /// `against` those on the reversed one.
    fn signal_sides(&self, s: Option<&str>) -> Result<[bool; 2], ParseError> {
        match s {
            None | Some("both") => Ok([true, true]),
            Some("along") => Ok([true, false]),
            Some("against") => Ok([false, true]),
            Some(x) => Err(self.unknown("signal side", x)),
        }
    }

    fn push_order(&mut self, train: &str, order: Order) {
        let line = self.line;
        self.orders.entry(train.to_string()).or_insert_with(Vec::new).push((line, order));
    }
}

/// Parses the scenario format into a ready world.
///
/// * map 20 10
/// * line 0 3 19 3
/// * signal 3 3 x path_oneway against
/// * engine loco power=1500 weight=80 speed=120 te=250 len=8
/// * train A at 1 3 x_sw consist loco,coach
/// * order A station East full
///
pub fn parse_scenario(input: &str, settings: Settings) -> Result<World, ParseError> {
    let comment_re = re(r"^\s*(#.*)?$")?;
    let map_re = re(r"^\s*map\s+(\d+)\s+(\d+)\s*$")?;
    let rail_re = re(r"(?x) ^ \s* rail \s+ (?P<x>\d+) \s+ (?P<y>\d+) \s+ (?P<tracks>[a-z,]+) (?P<opts>(\s+\w+=\w+)*) \s* $")?;
    let line_re = re(r"(?x) ^ \s* line \s+ (\d+) \s+ (\d+) \s+ (\d+) \s+ (\d+) (?P<opts>(\s+\w+=\w+)*) \s* $")?;
    let signal_re = re(r"(?x) ^ \s* signal \s+ (\d+) \s+ (\d+) \s+ ([a-z]+) \s+ (block|path|path_oneway) (\s+ (both|along|against))? \s* $")?;
    let depot_re = re(r"(?x) ^ \s* depot \s+ (\d+) \s+ (\d+) \s+ (ne|se|sw|nw) (\s+ (?P<name>\S+))? \s* $")?;
    let station_re = re(r"(?x) ^ \s* (station|waypoint) \s+ (\d+) \s+ (\d+) \s+ (x|y) \s+ (\S+) \s* $")?;
    let tunnel_re = re(r"(?x) ^ \s* (tunnel|bridge) \s+ (\d+) \s+ (\d+) \s+ (\d+) \s+ (\d+) \s* $")?;
    let crossing_re = re(r"^\s*crossing\s+(\d+)\s+(\d+)\s+(x|y)\s*$")?;
    let slope_re = re(r"^\s*slope\s+(\d+)\s+(\d+)\s+(ne|se|sw|nw)\s*$")?;
    let engine_re = re(r"(?x) ^ \s* (engine|wagon) \s+ (?P<name>\S+) (?P<opts>(\s+\w+=[\w,]+)*) \s* $")?;
    let train_at_re = re(r"(?x) ^ \s* train \s+ (?P<name>\S+) \s+ at \s+ (\d+) \s+ (\d+) \s+ (?P<td>\w+) \s+
            consist \s+ (?P<consist>[\w,]+) (?P<stopped>\s+stopped)? \s* $")?;
    let train_depot_re = re(r"(?x) ^ \s* train \s+ (?P<name>\S+) \s+ depot \s+ (\d+) \s+ (\d+) \s+
            consist \s+ (?P<consist>[\w,]+) (?P<stopped>\s+stopped)? \s* $")?;
    let order_station_re = re(r"(?x) ^ \s* order \s+ (?P<train>\S+) \s+ station \s+ (?P<name>\S+)
            (?P<nonstop>\s+nonstop)? (\s+(?P<load>full|noload))? (\s+(?P<unload>unload|transfer|nounload))? \s* $")?;
    let order_depot_re = re(r"(?x) ^ \s* order \s+ (?P<train>\S+) \s+ depot \s+ (?P<name>\S+)
            (?P<service>\s+service)? (?P<halt>\s+halt)? \s* $")?;
    let order_waypoint_re = re(r"^\s*order\s+(\S+)\s+waypoint\s+(\S+)\s*$")?;
    let order_if_re = re(r"(?x) ^ \s* order \s+ (?P<train>\S+) \s+ if \s+ (?P<var>\w+) \s+ (?P<cmp>\S+) \s+ (?P<value>\d+)
            \s+ goto \s+ (?P<index>\d+) \s* $")?;

    let mut p = Parser {
        world: None,
        settings,
        line: 0,
        orders: BTreeMap::new(),
    };
    let mut depot_count = 0;

    for (i, line) in input.lines().enumerate() {
        p.line = i + 1;
        if comment_re.is_match(line) {
            continue;
        }
        if let Some(g) = map_re.captures(line) {
            let (w, h) = (p.num::<u32>(&g[1])?, p.num::<u32>(&g[2])?);
            if p.world.is_some() || w == 0 || h == 0 {
                return Err(ParseError::Map(p.line, format!("bad map declaration {}x{}", w, h)));
            }
            p.world = Some(World::new(Map::new(w, h), p.settings.clone()));
            continue;
        }
        if let Some(g) = rail_re.captures(line) {
            let t = p.tile(&g["x"], &g["y"])?;
            let opts = options(p.line, g.name("opts"))?;
            let (owner, rt) = (p.opt_num::<Owner>(&opts, "owner", 0)?, p.railtype(&opts)?);
            for name in g["tracks"].split(',') {
                let track = Track::parse(name).ok_or_else(|| p.unknown("track", name))?;
                let r = p.world()?.map.build_rail(t, track, owner, rt);
                r.map_err(|e| p.map_err(e))?;
            }
            continue;
        }
        if let Some(g) = line_re.captures(line) {
            build_line(&mut p, &g)?;
            continue;
        }
        if let Some(g) = signal_re.captures(line) {
            let t = p.tile(&g[1], &g[2])?;
            let track = Track::parse(&g[3]).ok_or_else(|| p.unknown("track", &g[3]))?;
            let kind = SignalKind::parse(&g[4]).ok_or_else(|| p.unknown("signal kind", &g[4]))?;
            let present = p.signal_sides(g.get(6).map(|m| m.as_str()))?;
            let r = p.world()?.map.build_signal(t, track, kind, present);
            r.map_err(|e| p.map_err(e))?;
            continue;
        }
        if let Some(g) = depot_re.captures(line) {
            let t = p.tile(&g[1], &g[2])?;
            let exit = DiagDir::parse(&g[3]).ok_or_else(|| p.unknown("direction", &g[3]))?;
            depot_count += 1;
            let name = g.name("name").map(|m| m.as_str().to_string()).unwrap_or_else(|| format!("Depot {}", depot_count));
            let w = p.world()?;
            let id = w.depots.len() as DepotId;
            let r = w.map.build_depot(t, id, exit, 0, RailType::Rail);
            r.map_err(|e| p.map_err(e))?;
            p.world()?.add_depot(&name, t);
            continue;
        }
        if let Some(g) = station_re.captures(line) {
            let waypoint = &g[1] == "waypoint";
            let t = p.tile(&g[2], &g[3])?;
            let axis = Axis::parse(&g[4]).ok_or_else(|| p.unknown("axis", &g[4]))?;
            let w = p.world()?;
            let id = w.station_by_name(&g[5]).unwrap_or(w.stations.len() as StationId);
            let r = w.map.build_station(t, id, axis, 0, RailType::Rail);
            r.map_err(|e| p.map_err(e))?;
            p.world()?.add_station_tile(&g[5], waypoint, t);
            continue;
        }
        if let Some(g) = tunnel_re.captures(line) {
            let kind = if &g[1] == "tunnel" { TunnelBridgeKind::Tunnel } else { TunnelBridgeKind::Bridge };
            let a = p.tile(&g[2], &g[3])?;
            let b = p.tile(&g[4], &g[5])?;
            let r = p.world()?.map.build_tunnel_bridge(a, b, kind, 0, RailType::Rail);
            r.map_err(|e| p.map_err(e))?;
            continue;
        }
        if let Some(g) = crossing_re.captures(line) {
            let t = p.tile(&g[1], &g[2])?;
            let axis = Axis::parse(&g[3]).ok_or_else(|| p.unknown("axis", &g[3]))?;
            let r = p.world()?.map.build_crossing(t, axis, 0, RailType::Rail);
            r.map_err(|e| p.map_err(e))?;
            continue;
        }
        if let Some(g) = slope_re.captures(line) {
            let t = p.tile(&g[1], &g[2])?;
            let dir = DiagDir::parse(&g[3]).ok_or_else(|| p.unknown("direction", &g[3]))?;
            p.world()?.map.set_slope(t, Slope::Inclined(dir));
            continue;
        }
        if let Some(g) = engine_re.captures(line) {
            let opts = options(p.line, g.name("opts"))?;
            let info = p.engine(&g["name"], &g[1] == "engine", &opts)?;
            p.world()?.add_engine(info);
            continue;
        }
        if let Some(g) = train_at_re.captures(line) {
            let t = p.tile(&g[2], &g[3])?;
            let td = Trackdir::parse(&g["td"]).ok_or_else(|| p.unknown("trackdir", &g["td"]))?;
            let consist = p.consist(&g["consist"])?;
            let stopped = g.name("stopped").is_some();
            let spawned = p.world()?.spawn_on_track(&g["name"], t, td, &consist, stopped);
            if spawned.is_none() {
                return Err(ParseError::Map(p.line, format!("cannot place train {}", &g["name"])));
            }
            continue;
        }
        if let Some(g) = train_depot_re.captures(line) {
            let t = p.tile(&g[2], &g[3])?;
            let consist = p.consist(&g["consist"])?;
            let stopped = g.name("stopped").is_some();
            let spawned = p.world()?.spawn_in_depot(&g["name"], t, &consist, stopped);
            if spawned.is_none() {
                return Err(ParseError::Map(p.line, format!("cannot build train {} in a depot", &g["name"])));
            }
            continue;
        }
        if let Some(g) = order_station_re.captures(line) {
            let station = p.world()?.station_by_name(&g["name"]);
            let station = station.ok_or_else(|| p.unknown("station", &g["name"]))?;
            let load = match g.name("load").map(|m| m.as_str()) {
                Some("full") => LoadKind::FullLoad,
                Some(_) => LoadKind::NoLoad,
                None => LoadKind::Normal,
            };
            let unload = match g.name("unload").map(|m| m.as_str()) {
                Some("unload") => UnloadKind::Unload,
                Some("transfer") => UnloadKind::Transfer,
                Some(_) => UnloadKind::NoUnload,
                None => UnloadKind::Normal,
            };
            p.push_order(
                &g["train"],
                Order::GoToStation {
                    station,
                    non_stop: g.name("nonstop").is_some(),
                    load,
                    unload,
                },
            );
            continue;
        }
        if let Some(g) = order_depot_re.captures(line) {
            let depot = match &g["name"] {
                "nearest" => None,
                name => {
                    let d = p.world()?.depot_by_name(name);
                    Some(d.ok_or_else(|| p.unknown("depot", name))?)
                }
            };
            p.push_order(
                &g["train"],
                Order::GoToDepot {
                    depot,
                    service_only: g.name("service").is_some(),
                    halt: g.name("halt").is_some(),
                },
            );
            continue;
        }
        if let Some(g) = order_waypoint_re.captures(line) {
            let wp = p.world()?.station_by_name(&g[2]);
            let waypoint = wp.ok_or_else(|| p.unknown("waypoint", &g[2]))?;
            p.push_order(&g[1], Order::GoToWaypoint { waypoint, non_stop: false });
            continue;
        }
        if let Some(g) = order_if_re.captures(line) {
            let variable = CondVariable::parse(&g["var"]).ok_or_else(|| p.unknown("condition variable", &g["var"]))?;
            let comparator = Comparator::parse(&g["cmp"]).ok_or_else(|| p.unknown("comparator", &g["cmp"]))?;
            let order = Order::Conditional {
                variable,
                comparator,
                value: p.num(&g["value"])?,
                skip_to: p.num(&g["index"])?,
            };
            p.push_order(&g["train"], order);
            continue;
        }
        return Err(ParseError::Unrecognized(p.line, line.to_string()));
    }

    let line = p.line;
    let orders = std::mem::replace(&mut p.orders, BTreeMap::new());
    let mut world = p.world.ok_or(ParseError::NoMap(line))?;
    for (train, list) in orders {
        attach_orders(&mut world, &train, list)?;
    }
    let tiles: Vec<TileIndex> = world.map.indices().filter(|t| world.map.has_signals(*t)).collect();
    for t in tiles {
        signal::refresh_path_signals(&mut world.map, t);
    }
    world.update_all_signals();
    world.map.journal.clear();
    debug!(
        "scenario: {}x{} map, {} engines, {} trains",
        world.map.width,
        world.map.height,
        world.engines.len(),
        world.trains.len()
    );
    Ok(world)
}

fn build_line(p: &mut Parser, g: &Captures) -> Result<(), ParseError> {
    let (x1, y1) = (p.num::<u32>(&g[1])?, p.num::<u32>(&g[2])?);
    let (x2, y2) = (p.num::<u32>(&g[3])?, p.num::<u32>(&g[4])?);
    let opts = options(p.line, g.name("opts"))?;
    let (owner, rt) = (p.opt_num::<Owner>(&opts, "owner", 0)?, p.railtype(&opts)?);
    let (track, tiles): (Track, Vec<(u32, u32)>) = if y1 == y2 {
        (Track::X, (x1.min(x2)..=x1.max(x2)).map(|x| (x, y1)).collect())
    } else if x1 == x2 {
        (Track::Y, (y1.min(y2)..=y1.max(y2)).map(|y| (x1, y)).collect())
    } else {
        return Err(ParseError::Map(p.line, "a line must be straight".to_string()));
    };
    for (x, y) in tiles {
        let t = p.tile(&x.to_string(), &y.to_string())?;
        let w = p.world()?;
        // station and crossing tiles already carry the track
        if w.map.station_id(t).is_some() || w.map.is_crossing(t) || w.map.depot(t).is_some() || w.map.tunnel_bridge(t).is_some() {
            continue;
        }
        let r = w.map.build_rail(t, track, owner, rt);
        r.map_err(|e| p.map_err(e))?;
    }
    Ok(())
}

fn attach_orders(world: &mut World, train: &str, list: Vec<(usize, Order)>) -> Result<(), ParseError> {
    let line = list.first().map(|(l, _)| *l).unwrap_or(0);
    let id = world
        .train_by_name(train)
        .ok_or_else(|| ParseError::Unknown(line, "train", train.to_string()))?;
    let len = list.len();
    if len > world.settings.game.max_orders {
        return Err(ParseError::InvalidOrder(line, format!("train {} has {} orders", train, len)));
    }
    for &(l, ref o) in &list {
        match *o {
            Order::Conditional { skip_to, .. } if skip_to >= len => {
                return Err(ParseError::InvalidOrder(l, format!("goto {} past the end of the list", skip_to)));
            }
            Order::GoToStation { load, unload, .. } => {
                let conflict = unload == UnloadKind::NoUnload && load != LoadKind::Normal;
                if conflict {
                    return Err(ParseError::InvalidOrder(l, "conflicting load and unload flags".to_string()));
                }
            }
            _ => {}
        }
    }
    let max = world.settings.game.max_order_lists;
    let orders = list.into_iter().map(|(_, o)| o).collect();
    let list = world
        .orders
        .create(orders, max)
        .ok_or_else(|| ParseError::InvalidOrder(line, "too many order lists".to_string()))?;
    if let Some(t) = world.trains.get_mut(&id) {
        t.orders = Some(list);
        t.order_index = 0;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = r#"
# two stations on a straight line
map 12 3
line 1 1 9 1
depot 0 1 sw Shed
station 10 1 x East
station 11 1 x East
signal 5 1 x path_oneway along
engine loco power=1500 weight=80 speed=120 te=250 len=8
wagon coach weight=30 len=8 capacity=40 cargo=passengers,mail
train A at 3 1 x_sw consist loco,coach
train B depot 0 1 consist loco stopped
order A station East full
order A depot Shed service
order A if always true 0 goto 0
"#;

    #[test]
    fn parses_small_scenario() {
        let w = parse_scenario(SMALL, Settings::default()).unwrap();
        assert_eq!(w.map.width, 12);
        assert_eq!(w.stations.len(), 1);
        assert_eq!(w.stations[0].tiles.len(), 2);
        assert_eq!(w.engines[1].cargos, vec!["passengers".to_string(), "mail".to_string()]);
        let a = w.train_by_name("A").unwrap();
        assert_eq!(w.train_orders(&w.trains[&a]).len(), 3);
        let b = w.train_by_name("B").unwrap();
        assert!(w.stopped_in_depot(b));
        let s = w.map.tile_xy(5, 1).unwrap();
        let sig = w.map.signal(s, Track::X).unwrap();
        assert_eq!(sig.kind, SignalKind::PathOneWay);
        assert_eq!(sig.present, [true, false]);
    }

    #[test]
    fn map_comes_first() {
        match parse_scenario("rail 1 1 x", Settings::default()) {
            Err(ParseError::NoMap(1)) => {}
            r => panic!("unexpected {:?}", r.map(|_| ())),
        }
    }

    #[test]
    fn reports_line_of_bad_input() {
        let input = "map 4 4\nrail 1 1 x\nfly 1 1\n";
        match parse_scenario(input, Settings::default()) {
            Err(ParseError::Unrecognized(3, _)) => {}
            r => panic!("unexpected {:?}", r.map(|_| ())),
        }
    }

    #[test]
    fn rejects_goto_past_end() {
        let input = "map 4 1\nline 0 0 3 0\nengine e power=1 weight=1 len=8\ntrain T at 1 0 x_sw consist e\norder T if always true 0 goto 4\n";
        match parse_scenario(input, Settings::default()) {
            Err(ParseError::InvalidOrder(5, _)) => {}
            r => panic!("unexpected {:?}", r.map(|_| ())),
        }
    }
}
