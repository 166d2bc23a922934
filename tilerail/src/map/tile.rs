use crate::ids::*;
use crate::map::track::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RailType {
    Rail,
    Electric,
    Monorail,
    Maglev,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RailTypes(pub u8);

impl RailTypes {
    pub fn contains(self, rt: RailType) -> bool {
        self.0 & (1 << rt as u8) != 0
    }
}

impl RailType {
    /// Rail types a vehicle of this type may run on.
    pub fn compatible(self) -> RailTypes {
        match self {
            RailType::Rail => RailTypes(1 << RailType::Rail as u8 | 1 << RailType::Electric as u8),
            rt => RailTypes(1 << rt as u8),
        }
    }

    /// Rail types on which an engine of this type has power.
    pub fn powered(self) -> RailTypes {
        self.compatible()
    }

    pub fn parse(s: &str) -> Option<RailType> {
        match s {
            "rail" => Some(RailType::Rail),
            "electric" => Some(RailType::Electric),
            "monorail" => Some(RailType::Monorail),
            "maglev" => Some(RailType::Maglev),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slope {
    Flat,
    /// The tile rises towards the given side.
    Inclined(DiagDir),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    Block,
    Path,
    PathOneWay,
}

impl SignalKind {
    pub fn is_path(self) -> bool {
        self != SignalKind::Block
    }

    /// One-way signals cannot be passed from behind.
    pub fn is_oneway(self) -> bool {
        self != SignalKind::Path
    }

    pub fn parse(s: &str) -> Option<SignalKind> {
        match s {
            "block" => Some(SignalKind::Block),
            "path" => Some(SignalKind::Path),
            "path_oneway" => Some(SignalKind::PathOneWay),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalState {
    Red,
    Green,
}

/// Signal(s) on one track of a tile. Index 0 faces trains on the forward
/// trackdir, index 1 trains on the reversed trackdir.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub track: Track,
    pub kind: SignalKind,
    pub present: [bool; 2],
    pub state: [SignalState; 2],
}

impl Signal {
    pub fn faces(&self, td: Trackdir) -> bool {
        td.track == self.track && self.present[td.reversed as usize]
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelBridgeKind {
    Tunnel,
    Bridge,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TileKind {
    Clear,
    Rail {
        tracks: TrackBits,
        reserved: [Option<VehicleId>; 6],
        signals: SmallVec<[Signal; 2]>,
    },
    Depot {
        id: DepotId,
        exit: DiagDir,
        reserved: Option<VehicleId>,
    },
    Station {
        id: StationId,
        axis: Axis,
        reserved: Option<VehicleId>,
    },
    /// Portal of a tunnel or bridge; `dir` points from this portal into the span.
    TunnelBridge {
        kind: TunnelBridgeKind,
        dir: DiagDir,
        other_end: TileIndex,
        reserved: Option<VehicleId>,
    },
    Crossing {
        axis: Axis,
        reserved: Option<VehicleId>,
        barred: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub kind: TileKind,
    pub owner: Owner,
    pub railtype: RailType,
    pub slope: Slope,
}

impl Default for Tile {
    fn default() -> Tile {
        Tile {
            kind: TileKind::Clear,
            owner: 0,
            railtype: RailType::Rail,
            slope: Slope::Flat,
        }
    }
}

#[derive(Debug, Fail)]
pub enum MapError {
    #[fail(display = "tile ({}, {}) is outside the map", _0, _1)]
    OutOfBounds(u32, u32),
    #[fail(display = "tile ({}, {}) already holds something else", _0, _1)]
    Occupied(u32, u32),
    #[fail(display = "tunnel/bridge ends must be on one line: {} -> {}", _0, _1)]
    NotInLine(TileIndex, TileIndex),
    #[fail(display = "no {:?} track on tile {}", _1, _0)]
    NoTrack(TileIndex, Track),
}

/// A change to the dynamic part of the map, drained into the history every tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MapChange {
    Reserved {
        tile: TileIndex,
        track: Track,
        holder: Option<VehicleId>,
    },
    Aspect {
        tile: TileIndex,
        trackdir: Trackdir,
        state: SignalState,
    },
    Barred {
        tile: TileIndex,
        barred: bool,
    },
}

/// The tile grid. Tiles are addressed row by row, `index = y * width + x`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Map {
    pub width: u32,
    pub height: u32,
    tiles: Vec<Tile>,
    #[serde(skip)]
    pub journal: Vec<MapChange>,
}

impl PartialEq for Map {
    fn eq(&self, other: &Map) -> bool {
        self.width == other.width && self.height == other.height && self.tiles == other.tiles
    }
}

impl Map {
    pub fn new(width: u32, height: u32) -> Map {
        Map {
            width,
            height,
            tiles: vec![Tile::default(); (width * height) as usize],
            journal: Vec::new(),
        }
    }

    pub fn tile_xy(&self, x: u32, y: u32) -> Option<TileIndex> {
        if x < self.width && y < self.height {
            Some(y * self.width + x)
        } else {
            None
        }
    }

    pub fn xy(&self, t: TileIndex) -> (u32, u32) {
        (t % self.width, t / self.width)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn indices(&self) -> impl Iterator<Item = TileIndex> {
        0..self.tiles.len() as TileIndex
    }

    pub fn neighbour(&self, t: TileIndex, d: DiagDir) -> Option<TileIndex> {
        let (x, y) = self.xy(t);
        let (dx, dy) = d.offset();
        let nx = x as i64 + dx as i64;
        let ny = y as i64 + dy as i64;
        if nx < 0 || ny < 0 {
            return None;
        }
        self.tile_xy(nx as u32, ny as u32)
    }

    pub fn manhattan(&self, a: TileIndex, b: TileIndex) -> u32 {
        let (ax, ay) = self.xy(a);
        let (bx, by) = self.xy(b);
        ((ax as i64 - bx as i64).abs() + (ay as i64 - by as i64).abs()) as u32
    }

    pub fn tile(&self, t: TileIndex) -> &Tile {
        &self.tiles[t as usize]
    }

    pub fn tile_mut(&mut self, t: TileIndex) -> &mut Tile {
        &mut self.tiles[t as usize]
    }

    /// All rail pieces present on a tile, whatever the tile kind.
    pub fn track_bits(&self, t: TileIndex) -> TrackBits {
        match self.tile(t).kind {
            TileKind::Clear => TrackBits::NONE,
            TileKind::Rail { tracks, .. } => tracks,
            TileKind::Depot { exit, .. } => exit.axis().track().bits(),
            TileKind::Station { axis, .. } | TileKind::Crossing { axis, .. } => axis.track().bits(),
            TileKind::TunnelBridge { dir, .. } => dir.axis().track().bits(),
        }
    }

    pub fn is_plain_rail(&self, t: TileIndex) -> bool {
        match self.tile(t).kind {
            TileKind::Rail { .. } => true,
            _ => false,
        }
    }

    pub fn has_signals(&self, t: TileIndex) -> bool {
        match self.tile(t).kind {
            TileKind::Rail { ref signals, .. } => !signals.is_empty(),
            _ => false,
        }
    }

    pub fn station_id(&self, t: TileIndex) -> Option<StationId> {
        match self.tile(t).kind {
            TileKind::Station { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn depot(&self, t: TileIndex) -> Option<(DepotId, DiagDir)> {
        match self.tile(t).kind {
            TileKind::Depot { id, exit, .. } => Some((id, exit)),
            _ => None,
        }
    }

    pub fn tunnel_bridge(&self, t: TileIndex) -> Option<(TunnelBridgeKind, DiagDir, TileIndex)> {
        match self.tile(t).kind {
            TileKind::TunnelBridge { kind, dir, other_end, .. } => Some((kind, dir, other_end)),
            _ => None,
        }
    }

    pub fn is_crossing(&self, t: TileIndex) -> bool {
        match self.tile(t).kind {
            TileKind::Crossing { .. } => true,
            _ => false,
        }
    }

    pub fn signals(&self, t: TileIndex) -> &[Signal] {
        match self.tile(t).kind {
            TileKind::Rail { ref signals, .. } => signals,
            _ => &[],
        }
    }

    pub fn signal(&self, t: TileIndex, track: Track) -> Option<&Signal> {
        self.signals(t).iter().find(|s| s.track == track)
    }

    pub fn has_signal_on_trackdir(&self, t: TileIndex, td: Trackdir) -> bool {
        self.signal(t, td.track).map(|s| s.faces(td)).unwrap_or(false)
    }

    pub fn has_pbs_signal_on_trackdir(&self, t: TileIndex, td: Trackdir) -> bool {
        self.signal(t, td.track).map(|s| s.kind.is_path() && s.faces(td)).unwrap_or(false)
    }

    /// A one-way signal stands against `td` with nothing facing `td`.
    pub fn has_oneway_signal_blocking(&self, t: TileIndex, td: Trackdir) -> bool {
        match self.signal(t, td.track) {
            Some(s) => s.kind.is_oneway() && s.faces(td.reverse()) && !s.faces(td),
            None => false,
        }
    }

    pub fn signal_state(&self, t: TileIndex, td: Trackdir) -> Option<SignalState> {
        self.signal(t, td.track)
            .filter(|s| s.faces(td))
            .map(|s| s.state[td.reversed as usize])
    }

    /// Returns true if the aspect changed.
    pub fn set_signal_state(&mut self, t: TileIndex, td: Trackdir, state: SignalState) -> bool {
        let changed = match self.tiles[t as usize].kind {
            TileKind::Rail { ref mut signals, .. } => match signals.iter_mut().find(|s| s.faces(td)) {
                Some(s) => {
                    let old = s.state[td.reversed as usize];
                    s.state[td.reversed as usize] = state;
                    old != state
                }
                None => false,
            },
            _ => false,
        };
        if changed {
            self.journal.push(MapChange::Aspect { tile: t, trackdir: td, state });
        }
        changed
    }

    /// Whether a train on `td` may not pass the signal on tile `t` on aspect alone.
    pub fn signal_shows_stop(&self, t: TileIndex, td: Trackdir) -> bool {
        match self.signal_state(t, td) {
            Some(state) => state == SignalState::Red,
            None => self.has_oneway_signal_blocking(t, td),
        }
    }

    /// Consecutive tiles of the same station along the platform axis through `t`.
    pub fn platform_tiles(&self, t: TileIndex) -> Vec<TileIndex> {
        let (id, axis) = match self.tile(t).kind {
            TileKind::Station { id, axis, .. } => (id, axis),
            _ => return vec![],
        };
        let (back, fwd) = match axis {
            Axis::X => (DiagDir::NE, DiagDir::SW),
            Axis::Y => (DiagDir::NW, DiagDir::SE),
        };
        let mut start = t;
        while let Some(n) = self.neighbour(start, back).filter(|n| self.same_platform(*n, id, axis)) {
            start = n;
        }
        let mut tiles = vec![start];
        let mut cur = start;
        while let Some(n) = self.neighbour(cur, fwd).filter(|n| self.same_platform(*n, id, axis)) {
            tiles.push(n);
            cur = n;
        }
        tiles
    }

    /// Whether `n` continues a platform of station `id` along `axis`.
    pub fn same_platform(&self, n: TileIndex, id: StationId, axis: Axis) -> bool {
        match self.tile(n).kind {
            TileKind::Station { id: i, axis: a, .. } => i == id && a == axis,
            _ => false,
        }
    }

    /// Number of platform tiles from `t` up to the platform end in direction `d`.
    pub fn platform_length_ahead(&self, t: TileIndex, d: DiagDir) -> u32 {
        let (id, axis) = match self.tile(t).kind {
            TileKind::Station { id, axis, .. } => (id, axis),
            _ => return 0,
        };
        let mut len = 1;
        let mut cur = t;
        while let Some(n) = self.neighbour(cur, d).filter(|n| self.same_platform(*n, id, axis)) {
            len += 1;
            cur = n;
        }
        len
    }

    fn check_free(&self, t: TileIndex) -> Result<(), MapError> {
        match self.tile(t).kind {
            TileKind::Clear => Ok(()),
            _ => {
                let (x, y) = self.xy(t);
                Err(MapError::Occupied(x, y))
            }
        }
    }

    pub fn build_rail(&mut self, t: TileIndex, track: Track, owner: Owner, railtype: RailType) -> Result<(), MapError> {
        let (x, y) = self.xy(t);
        let tile = self.tile_mut(t);
        match tile.kind {
            TileKind::Rail { ref mut tracks, .. } => {
                *tracks |= track.bits();
                Ok(())
            }
            TileKind::Clear => {
                tile.kind = TileKind::Rail {
                    tracks: track.bits(),
                    reserved: [None; 6],
                    signals: SmallVec::new(),
                };
                tile.owner = owner;
                tile.railtype = railtype;
                Ok(())
            }
            _ => Err(MapError::Occupied(x, y)),
        }
    }

    /// Removes a track piece along with any signal on it. A reserved piece is kept.
    pub fn remove_rail(&mut self, t: TileIndex, track: Track) -> Result<bool, MapError> {
        let now_empty = match self.tile_mut(t).kind {
            TileKind::Rail { ref mut tracks, ref reserved, ref mut signals } => {
                if !tracks.contains(track) {
                    return Err(MapError::NoTrack(t, track));
                }
                if reserved[track.index()].is_some() {
                    return Ok(false);
                }
                *tracks &= !track.bits();
                signals.retain(|s| s.track != track);
                tracks.is_empty()
            }
            _ => return Err(MapError::NoTrack(t, track)),
        };
        if now_empty {
            self.tile_mut(t).kind = TileKind::Clear;
        }
        Ok(true)
    }

    pub fn build_signal(&mut self, t: TileIndex, track: Track, kind: SignalKind, present: [bool; 2]) -> Result<(), MapError> {
        if !self.is_plain_rail(t) || !self.track_bits(t).contains(track) {
            return Err(MapError::NoTrack(t, track));
        }
        if let TileKind::Rail { ref mut signals, .. } = self.tile_mut(t).kind {
            let initial = if kind.is_path() { SignalState::Green } else { SignalState::Red };
            signals.retain(|s| s.track != track);
            signals.push(Signal {
                track,
                kind,
                present,
                state: [initial, initial],
            });
        }
        Ok(())
    }

    pub fn remove_signal(&mut self, t: TileIndex, track: Track) -> bool {
        if let TileKind::Rail { ref mut signals, .. } = self.tile_mut(t).kind {
            let before = signals.len();
            signals.retain(|s| s.track != track);
            return before != signals.len();
        }
        false
    }

    pub fn build_depot(&mut self, t: TileIndex, id: DepotId, exit: DiagDir, owner: Owner, railtype: RailType) -> Result<(), MapError> {
        self.check_free(t)?;
        let slope = self.tile(t).slope;
        *self.tile_mut(t) = Tile {
            kind: TileKind::Depot { id, exit, reserved: None },
            owner,
            railtype,
            slope,
        };
        Ok(())
    }

    pub fn build_station(&mut self, t: TileIndex, id: StationId, axis: Axis, owner: Owner, railtype: RailType) -> Result<(), MapError> {
        self.check_free(t)?;
        *self.tile_mut(t) = Tile {
            kind: TileKind::Station { id, axis, reserved: None },
            owner,
            railtype,
            slope: Slope::Flat,
        };
        Ok(())
    }

    pub fn build_crossing(&mut self, t: TileIndex, axis: Axis, owner: Owner, railtype: RailType) -> Result<(), MapError> {
        self.check_free(t)?;
        *self.tile_mut(t) = Tile {
            kind: TileKind::Crossing { axis, reserved: None, barred: false },
            owner,
            railtype,
            slope: Slope::Flat,
        };
        Ok(())
    }

    /// Builds the two portals of a tunnel or bridge between `a` and `b`.
    pub fn build_tunnel_bridge(&mut self, a: TileIndex, b: TileIndex, kind: TunnelBridgeKind, owner: Owner, railtype: RailType) -> Result<(), MapError> {
        let (ax, ay) = self.xy(a);
        let (bx, by) = self.xy(b);
        let dir = if ay == by && bx > ax + 1 {
            DiagDir::SW
        } else if ay == by && ax > bx + 1 {
            DiagDir::NE
        } else if ax == bx && by > ay + 1 {
            DiagDir::SE
        } else if ax == bx && ay > by + 1 {
            DiagDir::NW
        } else {
            return Err(MapError::NotInLine(a, b));
        };
        self.check_free(a)?;
        self.check_free(b)?;
        for &(t, d, other) in [(a, dir, b), (b, dir.reverse(), a)].iter() {
            *self.tile_mut(t) = Tile {
                kind: TileKind::TunnelBridge { kind, dir: d, other_end: other, reserved: None },
                owner,
                railtype,
                slope: Slope::Flat,
            };
        }
        Ok(())
    }

    pub fn set_slope(&mut self, t: TileIndex, slope: Slope) {
        self.tile_mut(t).slope = slope;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_map() -> Map {
        let mut m = Map::new(8, 4);
        for x in 0..8 {
            let t = m.tile_xy(x, 1).unwrap();
            m.build_rail(t, Track::X, 0, RailType::Rail).unwrap();
        }
        m
    }

    #[test]
    fn neighbours_stop_at_edges() {
        let m = Map::new(4, 4);
        let t = m.tile_xy(0, 0).unwrap();
        assert_eq!(m.neighbour(t, DiagDir::NE), None);
        assert_eq!(m.neighbour(t, DiagDir::NW), None);
        assert_eq!(m.neighbour(t, DiagDir::SW), m.tile_xy(1, 0));
        assert_eq!(m.neighbour(t, DiagDir::SE), m.tile_xy(0, 1));
    }

    #[test]
    fn oneway_signal_blocks_from_behind() {
        let mut m = line_map();
        let t = m.tile_xy(3, 1).unwrap();
        m.build_signal(t, Track::X, SignalKind::PathOneWay, [true, false]).unwrap();
        let fwd = Trackdir::new(Track::X, false);
        assert!(m.has_pbs_signal_on_trackdir(t, fwd));
        assert!(m.has_oneway_signal_blocking(t, fwd.reverse()));
        assert!(!m.has_oneway_signal_blocking(t, fwd));
        assert!(m.signal_shows_stop(t, fwd.reverse()));

        m.build_signal(t, Track::X, SignalKind::Path, [true, false]).unwrap();
        assert!(!m.signal_shows_stop(t, fwd.reverse()));
    }

    #[test]
    fn platform_extent() {
        let mut m = Map::new(8, 4);
        for x in 2..5 {
            let t = m.tile_xy(x, 1).unwrap();
            m.build_station(t, 7, Axis::X, 0, RailType::Rail).unwrap();
        }
        let mid = m.tile_xy(3, 1).unwrap();
        assert_eq!(m.platform_tiles(mid).len(), 3);
        assert_eq!(m.platform_length_ahead(mid, DiagDir::SW), 2);
        assert_eq!(m.platform_length_ahead(mid, DiagDir::NE), 2);
    }

    #[test]
    fn tunnel_needs_a_straight_line() {
        let mut m = Map::new(8, 8);
        let a = m.tile_xy(1, 1).unwrap();
        let b = m.tile_xy(5, 1).unwrap();
        let c = m.tile_xy(5, 5).unwrap();
        assert!(m.build_tunnel_bridge(a, c, TunnelBridgeKind::Tunnel, 0, RailType::Rail).is_err());
        m.build_tunnel_bridge(a, b, TunnelBridgeKind::Tunnel, 0, RailType::Rail).unwrap();
        assert_eq!(m.tunnel_bridge(a), Some((TunnelBridgeKind::Tunnel, DiagDir::SW, b)));
        assert_eq!(m.tunnel_bridge(b), Some((TunnelBridgeKind::Tunnel, DiagDir::NE, a)));
    }
}
