//! Route search over the directed track graph. Nodes are `(tile, trackdir)`
//! pieces, expanded one tile at a time with the track follower.

use crate::ids::*;
use crate::input::settings::{PathfinderKind, PathfindingSettings};
use crate::map::*;
use crate::railway::follow::{Followed, TrackFollower};
use crate::railway::pbs::{is_safe_waiting_position, is_waiting_position_free, track_free};
use crate::railway::reservation;
use crate::railway::world::World;
use log::trace;
use ordered_float::OrderedFloat;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Extra cost of a depot found behind the train, which has to turn around first.
pub const DEPOT_REVERSE_PENALTY: u64 = 1000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Goal {
    Tile(TileIndex),
    Station(StationId),
    AnyDepot,
    /// A safe waiting position that nobody has reserved.
    SafeFree,
}

/// A goal with the tiles its heuristic measures towards.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub goal: Goal,
    pub hints: Vec<TileIndex>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Costs {
    pub tile: u64,
    pub corner: u64,
    pub curve: u64,
    pub signal: u64,
    pub red_signal: u64,
    pub station: u64,
    pub reserved: u64,
}

impl Costs {
    pub fn from_settings(p: &PathfindingSettings) -> Costs {
        Costs {
            tile: p.tile_cost as u64,
            corner: p.corner_cost as u64,
            curve: p.curve_penalty as u64,
            signal: p.signal_penalty as u64,
            red_signal: p.red_signal_penalty as u64,
            station: p.station_penalty as u64,
            reserved: p.reserved_penalty as u64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Query {
    /// Reservations held by this train cost nothing extra.
    pub train: VehicleId,
    pub owner: Owner,
    pub railtypes: RailTypes,
    pub forbid_90: bool,
    pub start: Vec<(TileIndex, Trackdir)>,
    pub goal: Goal,
    pub hints: Vec<TileIndex>,
    pub costs: Costs,
    pub max_nodes: usize,
    /// Path length limit in tiles, 0 for none.
    pub max_tiles: u32,
}

/// The pieces from a start node to the goal. When no goal was reached, the
/// way to the node closest to the hints is given instead.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Route {
    pub found: bool,
    pub nodes: Vec<(TileIndex, Trackdir)>,
    pub cost: u64,
}

pub trait Pathfinder: Sync {
    fn name(&self) -> &'static str;

    fn route(&self, map: &Map, q: &Query, rng: &mut ChaCha8Rng) -> Route;

    /// The track to take on the start tile, and whether the goal was reached.
    fn choose_track(&self, map: &Map, q: &Query, rng: &mut ChaCha8Rng) -> (Option<Track>, bool) {
        let r = self.route(map, q, rng);
        (r.nodes.first().map(|&(_, td)| td.track), r.found)
    }

    fn find_nearest_safe_tile(&self, map: &Map, q: &Query, rng: &mut ChaCha8Rng) -> Route {
        let mut q = q.clone();
        q.goal = Goal::SafeFree;
        q.hints.clear();
        self.route(map, &q, rng)
    }

    fn route_to_destination(&self, map: &Map, q: &Query, rng: &mut ChaCha8Rng) -> Route {
        self.route(map, q, rng)
    }
}

/// Cheapest route, with a distance heuristic that never overestimates.
pub struct AStar;

/// Greedy search towards the hints, ties broken at random.
pub struct Direct;

pub static ASTAR: AStar = AStar;
pub static DIRECT: Direct = Direct;

impl Pathfinder for AStar {
    fn name(&self) -> &'static str {
        "astar"
    }

    fn route(&self, map: &Map, q: &Query, rng: &mut ChaCha8Rng) -> Route {
        search(map, q, rng, false)
    }
}

impl Pathfinder for Direct {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn route(&self, map: &Map, q: &Query, rng: &mut ChaCha8Rng) -> Route {
        search(map, q, rng, true)
    }
}

struct Node {
    tile: TileIndex,
    td: Trackdir,
    parent: Option<usize>,
    g: u64,
    h: u64,
    tiles: u32,
}

#[derive(Debug)]
struct Open {
    f: OrderedFloat<f64>,
    seq: u64,
    node: usize,
}

impl Ord for Open {
    fn cmp(&self, other: &Open) -> Ordering {
        other.f.cmp(&self.f).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Open {
    fn partial_cmp(&self, other: &Open) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Open {
    fn eq(&self, other: &Open) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Open {}

fn heuristic(map: &Map, q: &Query, tile: TileIndex) -> u64 {
    let step = q.costs.tile.min(q.costs.corner);
    q.hints
        .iter()
        .map(|h| map.manhattan(tile, *h) as u64)
        .min()
        .unwrap_or(0)
        * step
}

fn passable(map: &Map, q: &Query, tile: TileIndex, td: Trackdir) -> bool {
    if map.has_oneway_signal_blocking(tile, td) {
        return false;
    }
    match q.goal {
        Goal::SafeFree => track_free(map, tile, td.track),
        _ => true,
    }
}

fn is_goal(ft: &TrackFollower, q: &Query, tile: TileIndex, td: Trackdir) -> bool {
    let map = ft.map;
    match q.goal {
        Goal::Tile(t) => tile == t,
        Goal::Station(s) => map.station_id(tile) == Some(s),
        Goal::AnyDepot => map.depot(tile).is_some(),
        Goal::SafeFree => is_safe_waiting_position(ft, tile, td, true) && is_waiting_position_free(ft, tile, td),
    }
}

/// Cost of entering `(tile, td)` coming from a piece heading along `prev`.
fn piece_cost(map: &Map, q: &Query, tile: TileIndex, td: Trackdir, prev: Trackdir, f: Option<&Followed>) -> u64 {
    let c = &q.costs;
    let mut cost = if td.track.is_straight() { c.tile } else { c.corner };
    if let Some(f) = f {
        if f.is_tunnel || f.is_bridge {
            cost += c.tile * f.tiles_skipped as u64;
        }
    }
    if td.direction() != prev.direction() {
        cost += c.curve;
    }
    if map.has_signal_on_trackdir(tile, td) {
        cost += c.signal;
        if map.signal_shows_stop(tile, td) && reservation::holder(map, tile, td.track) != Some(q.train) {
            cost += c.red_signal;
        }
    }
    if let Some(s) = map.station_id(tile) {
        if q.goal != Goal::Station(s) {
            cost += c.station;
        }
    }
    let foreign = match reservation::holder(map, tile, td.track) {
        Some(h) => h != q.train,
        None => !track_free(map, tile, td.track),
    };
    if foreign {
        cost += c.reserved;
    }
    cost
}

fn trace_back(nodes: &[Node], mut i: usize) -> Vec<(TileIndex, Trackdir)> {
    let mut path = vec![(nodes[i].tile, nodes[i].td)];
    while let Some(p) = nodes[i].parent {
        path.push((nodes[p].tile, nodes[p].td));
        i = p;
    }
    path.reverse();
    path
}

fn search(map: &Map, q: &Query, rng: &mut ChaCha8Rng, greedy: bool) -> Route {
    let ft = TrackFollower::new(map, q.owner, q.railtypes, q.forbid_90).stepwise();
    let mut nodes: Vec<Node> = vec![];
    let mut best_g: HashMap<(TileIndex, Trackdir), u64> = HashMap::new();
    let mut open = BinaryHeap::new();
    let mut seq = 0u64;

    let priority = |n: &Node, rng: &mut ChaCha8Rng| -> OrderedFloat<f64> {
        if greedy {
            let base = if q.hints.is_empty() { n.tiles as u64 } else { n.h };
            OrderedFloat(base as f64 + rng.gen::<f64>() * 0.5)
        } else {
            OrderedFloat((n.g + n.h) as f64)
        }
    };

    for &(tile, td) in &q.start {
        if !passable(map, q, tile, td) || best_g.contains_key(&(tile, td)) {
            continue;
        }
        let node = Node {
            tile,
            td,
            parent: None,
            g: piece_cost(map, q, tile, td, td, None),
            h: heuristic(map, q, tile),
            tiles: 1,
        };
        best_g.insert((tile, td), node.g);
        let f = priority(&node, rng);
        nodes.push(node);
        open.push(Open {
            f,
            seq,
            node: nodes.len() - 1,
        });
        seq += 1;
    }

    let mut expanded = 0;
    while let Some(Open { node, .. }) = open.pop() {
        let (tile, td, g, tiles) = {
            let n = &nodes[node];
            (n.tile, n.td, n.g, n.tiles)
        };
        if best_g.get(&(tile, td)).map(|&b| b < g).unwrap_or(false) {
            continue;
        }
        if is_goal(&ft, q, tile, td) {
            trace!("route found after {} expansions, cost {}", expanded, g);
            return Route {
                found: true,
                nodes: trace_back(&nodes, node),
                cost: g,
            };
        }
        expanded += 1;
        if expanded > q.max_nodes {
            break;
        }
        if q.max_tiles > 0 && tiles >= q.max_tiles {
            continue;
        }
        let f = match ft.follow(tile, td) {
            Ok(f) => f,
            Err(_) => continue,
        };
        for next in f.new_td_bits.iter() {
            if !passable(map, q, f.new_tile, next) {
                continue;
            }
            let ng = g + piece_cost(map, q, f.new_tile, next, td, Some(&f));
            let key = (f.new_tile, next);
            if best_g.get(&key).map(|&b| b <= ng).unwrap_or(false) {
                continue;
            }
            best_g.insert(key, ng);
            let n = Node {
                tile: f.new_tile,
                td: next,
                parent: Some(node),
                g: ng,
                h: heuristic(map, q, f.new_tile),
                tiles: tiles + 1 + f.tiles_skipped,
            };
            let pf = priority(&n, rng);
            nodes.push(n);
            open.push(Open {
                f: pf,
                seq,
                node: nodes.len() - 1,
            });
            seq += 1;
        }
    }

    // best effort: the node that got closest
    let closest = if q.hints.is_empty() {
        if nodes.is_empty() {
            None
        } else {
            Some(0)
        }
    } else {
        nodes
            .iter()
            .enumerate()
            .min_by_key(|(i, n)| (n.h, *i))
            .map(|(i, _)| i)
    };
    match closest {
        Some(i) => Route {
            found: false,
            nodes: trace_back(&nodes, i),
            cost: nodes[i].g,
        },
        None => Route::default(),
    }
}

impl World {
    pub fn pathfinder(&self) -> &'static dyn Pathfinder {
        match self.settings.pathfinding.pathfinder {
            PathfinderKind::AStar => &ASTAR,
            PathfinderKind::Direct => &DIRECT,
        }
    }

    pub fn query_for(&self, id: VehicleId, start: Vec<(TileIndex, Trackdir)>, goal: Goal, hints: Vec<TileIndex>) -> Option<Query> {
        let t = self.trains.get(&id)?;
        let p = &self.settings.pathfinding;
        Some(Query {
            train: id,
            owner: t.owner,
            railtypes: t.cache.railtypes,
            forbid_90: p.forbid_90_deg,
            start,
            goal,
            hints,
            costs: Costs::from_settings(p),
            max_nodes: p.max_search_nodes,
            max_tiles: 0,
        })
    }

    /// Nearest depot ahead of or behind the train, within `max_tiles` (0 for
    /// no limit). The flag tells that the train has to reverse to get there.
    pub fn find_nearest_depot(&mut self, id: VehicleId, max_tiles: u32) -> Option<(TileIndex, DepotId, bool)> {
        if self.is_in_depot(id) {
            let tile = self.trains.get(&id).and_then(|t| self.front_tile(t))?;
            return self.map.depot(tile).map(|(d, _)| (tile, d, false));
        }
        let (ahead, behind) = {
            let train = self.trains.get(&id)?;
            let (tile, td) = self.front_position(train)?;
            if let Some((d, exit)) = self.map.depot(tile) {
                if td.exit() == exit.reverse() {
                    return Some((tile, d, false));
                }
            }
            let ft = self.follower(train).stepwise();
            let starts = |t: TileIndex, td: Trackdir| -> Vec<(TileIndex, Trackdir)> {
                match ft.follow(t, td) {
                    Ok(f) => f.new_td_bits.iter().map(|n| (f.new_tile, n)).collect(),
                    Err(_) => vec![],
                }
            };
            let ahead = starts(tile, td);
            let behind = match train.path.front() {
                Some(e) if !e.wormhole => starts(e.tile, e.trackdir.reverse()),
                _ => vec![],
            };
            (ahead, behind)
        };

        let pf = self.pathfinder();
        let mut best: Option<(u64, TileIndex, bool)> = None;
        for (start, reverse) in vec![(ahead, false), (behind, true)] {
            if start.is_empty() {
                continue;
            }
            let mut q = self.query_for(id, start, Goal::AnyDepot, vec![])?;
            q.max_tiles = max_tiles;
            let route = pf.route(&self.map, &q, &mut self.rng);
            if !route.found {
                continue;
            }
            let cost = route.cost + if reverse { DEPOT_REVERSE_PENALTY } else { 0 };
            if let Some(&(tile, _)) = route.nodes.last() {
                if best.map(|(c, _, _)| cost < c).unwrap_or(true) {
                    best = Some((cost, tile, reverse));
                }
            }
        }
        let (_, tile, reverse) = best?;
        self.map.depot(tile).map(|(d, _)| (tile, d, reverse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use slotmap::SlotMap;

    #[test]
    fn test_ordering() {
        let mut p = BinaryHeap::new();
        p.push(Open {
            f: OrderedFloat::from(123.0),
            seq: 0,
            node: 0,
        });
        p.push(Open {
            f: OrderedFloat::from(0.0),
            seq: 1,
            node: 1,
        });
        p.push(Open {
            f: OrderedFloat::from(122.0),
            seq: 2,
            node: 2,
        });
        p.push(Open {
            f: OrderedFloat::from(122.0),
            seq: 3,
            node: 3,
        });
        assert_eq!(*p.pop().unwrap().f, 0.0);
        assert_eq!(p.pop().unwrap().node, 2);
        assert_eq!(p.pop().unwrap().node, 3);
        assert_eq!(*p.pop().unwrap().f, 123.0);
    }

    fn sw() -> Trackdir {
        Trackdir::with_exit(Track::X, DiagDir::SW).unwrap()
    }

    /// A line along y = 1 that forks at x = 3: straight on to a dead end, or
    /// down a curve to a line along x = 4 with a station at its end.
    fn fork() -> (Map, TileIndex) {
        let mut m = Map::new(10, 8);
        for x in 0..8 {
            let t = m.tile_xy(x, 1).unwrap();
            m.build_rail(t, Track::X, 0, RailType::Rail).unwrap();
        }
        let j = m.tile_xy(4, 1).unwrap();
        m.build_rail(j, Track::Right, 0, RailType::Rail).unwrap();
        for y in 2..6 {
            let t = m.tile_xy(4, y).unwrap();
            m.build_rail(t, Track::Y, 0, RailType::Rail).unwrap();
        }
        let st = m.tile_xy(4, 6).unwrap();
        m.build_station(st, 0, Axis::Y, 0, RailType::Rail).unwrap();
        (m, st)
    }

    fn query(m: &Map, goal: Goal, hints: Vec<TileIndex>) -> Query {
        let mut sm: SlotMap<VehicleId, ()> = SlotMap::with_key();
        Query {
            train: sm.insert(()),
            owner: 0,
            railtypes: RailType::Rail.compatible(),
            forbid_90: false,
            start: vec![(m.tile_xy(1, 1).unwrap(), sw())],
            goal,
            hints,
            costs: Costs::from_settings(&PathfindingSettings::default()),
            max_nodes: 1000,
            max_tiles: 0,
        }
    }

    #[test]
    fn both_strategies_take_the_branch() {
        let (m, st) = fork();
        for pf in [&ASTAR as &dyn Pathfinder, &DIRECT].iter() {
            let mut rng = ChaCha8Rng::seed_from_u64(7);
            let r = pf.route(&m, &query(&m, Goal::Station(0), vec![st]), &mut rng);
            assert!(r.found, "{}", pf.name());
            assert_eq!(r.nodes.last().unwrap().0, st);
            assert!(r.nodes.iter().any(|&(t, td)| t == m.tile_xy(4, 1).unwrap() && td.track == Track::Right));
        }
    }

    #[test]
    fn unreachable_goal_gives_closest_approach() {
        let (m, _) = fork();
        let far = m.tile_xy(9, 7).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let r = ASTAR.route(&m, &query(&m, Goal::Tile(far), vec![far]), &mut rng);
        assert!(!r.found);
        assert!(!r.nodes.is_empty());
        assert_eq!(r.nodes[0].0, m.tile_xy(1, 1).unwrap());
    }

    #[test]
    fn tile_limit_bounds_the_search() {
        let (mut m, _) = fork();
        let d = m.tile_xy(8, 1).unwrap();
        m.build_depot(d, 0, DiagDir::NE, 0, RailType::Rail).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut q = query(&m, Goal::AnyDepot, vec![]);
        assert!(ASTAR.route(&m, &q, &mut rng).found);
        q.max_tiles = 4;
        assert!(!ASTAR.route(&m, &q, &mut rng).found);
    }
}
