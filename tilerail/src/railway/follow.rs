use crate::ids::*;
use crate::map::*;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FollowError {
    /// Dead end, map edge, or a piece that cannot be entered from this side.
    NoWay,
    /// The next tile belongs to someone else.
    Owner,
    /// The next tile's rail type is not usable by the vehicle.
    RailType,
    /// Only 90 degree continuations exist and those are forbidden.
    Turn90,
}

impl FollowError {
    /// Errors that a train treats as the end of the line.
    pub fn is_line_end(self) -> bool {
        match self {
            FollowError::NoWay | FollowError::Owner => true,
            _ => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Followed {
    pub old_tile: TileIndex,
    pub old_td: Trackdir,
    pub exitdir: DiagDir,
    pub new_tile: TileIndex,
    pub new_td_bits: TrackdirBits,
    pub is_station: bool,
    pub is_tunnel: bool,
    pub is_bridge: bool,
    /// Tiles jumped over: the wormhole of a tunnel/bridge, or the rest of a platform.
    pub tiles_skipped: u32,
}

impl Followed {
    pub fn single(&self) -> Option<Trackdir> {
        self.new_td_bits.single()
    }

    /// The first tile after the old one, before any skip.
    pub fn first_new_tile(&self, map: &Map) -> TileIndex {
        if self.tiles_skipped == 0 || self.is_tunnel || self.is_bridge {
            return self.new_tile;
        }
        map.neighbour(self.old_tile, self.exitdir).unwrap_or(self.new_tile)
    }
}

/// Computes where a directed track leads. Pure function of the map.
#[derive(Copy, Clone)]
pub struct TrackFollower<'a> {
    pub map: &'a Map,
    pub owner: Owner,
    pub railtypes: RailTypes,
    pub forbid_90: bool,
    /// Jump to the far end of a platform, treating it as one unit.
    pub skip_platforms: bool,
}

impl<'a> TrackFollower<'a> {
    pub fn new(map: &'a Map, owner: Owner, railtypes: RailTypes, forbid_90: bool) -> TrackFollower<'a> {
        TrackFollower {
            map,
            owner,
            railtypes,
            forbid_90,
            skip_platforms: true,
        }
    }

    /// The same follower stepping one tile at a time, as vehicles move.
    pub fn stepwise(self) -> TrackFollower<'a> {
        TrackFollower {
            skip_platforms: false,
            ..self
        }
    }

    pub fn follow(&self, tile: TileIndex, td: Trackdir) -> Result<Followed, FollowError> {
        let map = self.map;
        let exitdir = td.exit();
        let mut res = Followed {
            old_tile: tile,
            old_td: td,
            exitdir,
            new_tile: tile,
            new_td_bits: TrackdirBits::NONE,
            is_station: false,
            is_tunnel: false,
            is_bridge: false,
            tiles_skipped: 0,
        };

        match map.tile(tile).kind {
            TileKind::Depot { exit, .. } if exit != exitdir => return Err(FollowError::NoWay),
            TileKind::TunnelBridge { kind, dir, other_end, .. } if dir == exitdir => {
                res.new_tile = other_end;
                res.is_tunnel = kind == TunnelBridgeKind::Tunnel;
                res.is_bridge = kind == TunnelBridgeKind::Bridge;
                res.tiles_skipped = map.manhattan(tile, other_end).saturating_sub(1);
                self.check_enter(other_end)?;
                res.new_td_bits = Trackdir::with_exit(dir.axis().track(), exitdir)
                    .map(|td| td.bits())
                    .unwrap_or_default();
                return Ok(res);
            }
            _ => {}
        }

        let new_tile = map.neighbour(tile, exitdir).ok_or(FollowError::NoWay)?;
        res.new_tile = new_tile;
        let reach = TrackdirBits::reaching(exitdir);
        let bits = match map.tile(new_tile).kind {
            TileKind::Clear => TrackdirBits::NONE,
            TileKind::Rail { tracks, .. } => TrackdirBits::from_tracks(tracks),
            TileKind::Depot { exit, .. } if exit == exitdir.reverse() => {
                TrackdirBits::from_tracks(exit.axis().track().bits())
            }
            TileKind::Station { axis, .. } if axis == exitdir.axis() => {
                res.is_station = true;
                TrackdirBits::from_tracks(axis.track().bits())
            }
            TileKind::TunnelBridge { dir, .. } if dir == exitdir => {
                TrackdirBits::from_tracks(dir.axis().track().bits())
            }
            TileKind::Crossing { axis, .. } if axis == exitdir.axis() => {
                TrackdirBits::from_tracks(axis.track().bits())
            }
            _ => TrackdirBits::NONE,
        } & reach;

        if bits.is_empty() {
            return Err(FollowError::NoWay);
        }
        self.check_enter(new_tile)?;
        res.new_td_bits = bits;

        if self.forbid_90 {
            res.new_td_bits = res.new_td_bits & !td.crossing_trackdirs();
            if res.new_td_bits.is_empty() {
                return Err(FollowError::Turn90);
            }
        }

        if res.is_station && self.skip_platforms {
            let len = map.platform_length_ahead(new_tile, exitdir);
            for _ in 1..len {
                if let Some(n) = map.neighbour(res.new_tile, exitdir) {
                    res.new_tile = n;
                }
            }
            res.tiles_skipped = len - 1;
        }
        Ok(res)
    }

    fn check_enter(&self, t: TileIndex) -> Result<(), FollowError> {
        let tile = self.map.tile(t);
        if tile.owner != self.owner {
            return Err(FollowError::Owner);
        }
        if !self.railtypes.contains(tile.railtype) {
            return Err(FollowError::RailType);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight(m: &mut Map, y: u32, xs: std::ops::Range<u32>) {
        for x in xs {
            let t = m.tile_xy(x, y).unwrap();
            m.build_rail(t, Track::X, 0, RailType::Rail).unwrap();
        }
    }

    fn sw() -> Trackdir {
        Trackdir::with_exit(Track::X, DiagDir::SW).unwrap()
    }

    #[test]
    fn straight_and_dead_end() {
        let mut m = Map::new(6, 3);
        straight(&mut m, 1, 0..3);
        let ft = TrackFollower::new(&m, 0, RailType::Rail.compatible(), false);
        let f = ft.follow(m.tile_xy(0, 1).unwrap(), sw()).unwrap();
        assert_eq!(f.new_tile, m.tile_xy(1, 1).unwrap());
        assert_eq!(f.single(), Some(sw()));
        assert_eq!(ft.follow(m.tile_xy(2, 1).unwrap(), sw()), Err(FollowError::NoWay));
    }

    #[test]
    fn owner_and_railtype() {
        let mut m = Map::new(6, 3);
        straight(&mut m, 1, 0..2);
        let t = m.tile_xy(2, 1).unwrap();
        m.build_rail(t, Track::X, 1, RailType::Rail).unwrap();
        let ft = TrackFollower::new(&m, 0, RailType::Rail.compatible(), false);
        assert_eq!(ft.follow(m.tile_xy(1, 1).unwrap(), sw()), Err(FollowError::Owner));

        let mut m = Map::new(6, 3);
        straight(&mut m, 1, 0..2);
        let t = m.tile_xy(2, 1).unwrap();
        m.build_rail(t, Track::X, 0, RailType::Monorail).unwrap();
        let ft = TrackFollower::new(&m, 0, RailType::Rail.compatible(), false);
        assert_eq!(ft.follow(m.tile_xy(1, 1).unwrap(), sw()), Err(FollowError::RailType));
    }

    #[test]
    fn tunnel_is_one_hop() {
        let mut m = Map::new(10, 3);
        straight(&mut m, 1, 0..2);
        let a = m.tile_xy(2, 1).unwrap();
        let b = m.tile_xy(6, 1).unwrap();
        m.build_tunnel_bridge(a, b, TunnelBridgeKind::Tunnel, 0, RailType::Rail).unwrap();
        let ft = TrackFollower::new(&m, 0, RailType::Rail.compatible(), false);

        let into = ft.follow(m.tile_xy(1, 1).unwrap(), sw()).unwrap();
        assert_eq!(into.new_tile, a);
        assert_eq!(into.tiles_skipped, 0);

        let hop = ft.follow(a, sw()).unwrap();
        assert_eq!(hop.new_tile, b);
        assert!(hop.is_tunnel);
        assert_eq!(hop.tiles_skipped, 3);
    }

    #[test]
    fn platform_is_skipped_only_when_asked() {
        let mut m = Map::new(10, 3);
        straight(&mut m, 1, 0..2);
        for x in 2..5 {
            let t = m.tile_xy(x, 1).unwrap();
            m.build_station(t, 1, Axis::X, 0, RailType::Rail).unwrap();
        }
        let ft = TrackFollower::new(&m, 0, RailType::Rail.compatible(), false);
        let f = ft.follow(m.tile_xy(1, 1).unwrap(), sw()).unwrap();
        assert!(f.is_station);
        assert_eq!(f.new_tile, m.tile_xy(4, 1).unwrap());
        assert_eq!(f.tiles_skipped, 2);
        assert_eq!(f.first_new_tile(&m), m.tile_xy(2, 1).unwrap());

        let f = ft.stepwise().follow(m.tile_xy(1, 1).unwrap(), sw()).unwrap();
        assert_eq!(f.new_tile, m.tile_xy(2, 1).unwrap());
    }

    #[test]
    fn depot_has_one_entrance() {
        let mut m = Map::new(6, 3);
        straight(&mut m, 1, 0..2);
        let d = m.tile_xy(2, 1).unwrap();
        m.build_depot(d, 0, DiagDir::NE, 0, RailType::Rail).unwrap();
        let ft = TrackFollower::new(&m, 0, RailType::Rail.compatible(), false);
        assert!(ft.follow(m.tile_xy(1, 1).unwrap(), sw()).is_ok());
        // cannot leave through the back wall
        assert_eq!(ft.follow(d, sw()), Err(FollowError::NoWay));
        let out = ft.follow(d, sw().reverse()).unwrap();
        assert_eq!(out.new_tile, m.tile_xy(1, 1).unwrap());
    }

    #[test]
    fn ninety_degree_turns() {
        let mut m = Map::new(6, 6);
        let a = m.tile_xy(1, 1).unwrap();
        let b = m.tile_xy(2, 1).unwrap();
        m.build_rail(a, Track::X, 0, RailType::Rail).unwrap();
        m.build_rail(b, Track::Left, 0, RailType::Rail).unwrap();
        // only `right` connects to b's NE side
        m.build_rail(b, Track::Right, 0, RailType::Rail).unwrap();
        let ft = TrackFollower::new(&m, 0, RailType::Rail.compatible(), true);
        let f = ft.follow(a, sw()).unwrap();
        assert_eq!(f.new_td_bits.tracks(), Track::Right.bits());

        let c = m.tile_xy(1, 3).unwrap();
        m.build_rail(c, Track::Upper, 0, RailType::Rail).unwrap();
        let upper_w = Trackdir::parse("upper_w").unwrap();
        assert_eq!(upper_w.exit(), DiagDir::NW);
        let e = m.tile_xy(1, 2).unwrap();
        m.build_rail(e, Track::Right, 0, RailType::Rail).unwrap();
        let ft = TrackFollower::new(&m, 0, RailType::Rail.compatible(), true);
        // upper_w leaves through NW onto `right`, which heads north: a 90 degree turn
        assert_eq!(ft.follow(c, upper_w), Err(FollowError::Turn90));
        let lenient = TrackFollower::new(&m, 0, RailType::Rail.compatible(), false);
        assert!(lenient.follow(c, upper_w).is_ok());
    }
}
