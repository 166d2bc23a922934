//! Signal aspects. Path signals follow the reservations next to them; block
//! signals follow the occupancy of the block they protect, found by a flood fill.

use crate::ids::*;
use crate::map::*;
use crate::railway::reservation::*;
use log::trace;
use std::collections::HashSet;

/// Where trains are, as far as signals are concerned.
pub trait Occupancy {
    /// Some non-crashed vehicle stands on `tile`.
    fn occupied(&self, tile: TileIndex) -> bool;
    /// A front vehicle on a neighbouring tile is heading into `tile`.
    fn approaching(&self, _map: &Map, _tile: TileIndex) -> bool {
        false
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SegmentState {
    Free,
    Full,
    /// A two-way path signal, or a path signal seen from behind, was met.
    Pbs,
}

/// The aspect a path signal facing `td` should show.
pub fn path_signal_aspect(map: &Map, tile: TileIndex, td: Trackdir) -> SignalState {
    if reserved_trackbits(map, tile).intersects(td.track.bits() | td.track.crossing_tracks()) {
        return SignalState::Red;
    }
    let exit = td.exit();
    if let Some(next) = map.neighbour(tile, exit) {
        if has_reserved_tracks(map, next, TrackBits::reaching(exit)) {
            return SignalState::Red;
        }
    }
    SignalState::Green
}

/// Recomputes the path signals on `tile` and on the tiles around it.
pub fn refresh_path_signals(map: &mut Map, tile: TileIndex) {
    let mut tiles = vec![tile];
    for d in ALL_DIAGDIRS.iter() {
        if let Some(n) = map.neighbour(tile, *d) {
            tiles.push(n);
        }
    }
    for t in tiles {
        let faces: Vec<Trackdir> = map
            .signals(t)
            .iter()
            .filter(|s| s.kind.is_path())
            .flat_map(|s| {
                let fwd = Trackdir::new(s.track, false);
                vec![fwd, fwd.reverse()].into_iter().filter(move |td| s.faces(*td))
            })
            .collect();
        for td in faces {
            let aspect = path_signal_aspect(map, t, td);
            map.set_signal_state(t, td, aspect);
        }
    }
}

#[derive(Default)]
struct Found {
    train: bool,
    pbs: bool,
}

type Side = Option<DiagDir>;

/// Queue a tile for exploring, unless the same border is already queued from the other side.
fn maybe_add(todo: &mut Vec<(TileIndex, Side)>, t1: TileIndex, d1: Side, t2: TileIndex, d2: Side) {
    if let Some(pos) = todo.iter().position(|&x| x == (t2, d2)) {
        todo.remove(pos);
        return;
    }
    todo.push((t1, d1));
}

fn train_in(map: &Map, occ: &dyn Occupancy, tile: TileIndex, tracks: TrackBits, found: &mut Found) {
    if !found.train && (occ.occupied(tile) || has_reserved_tracks(map, tile, tracks)) {
        found.train = true;
    }
}

/// Walks the block reachable from the queued tile sides. `side` is the side a tile is
/// entered through; `None` enters a depot from inside or a portal from the span.
fn explore_segment(
    map: &Map,
    occ: &dyn Occupancy,
    owner: Owner,
    todo: &mut Vec<(TileIndex, Side)>,
    to_update: &mut Vec<(TileIndex, Trackdir)>,
) -> Found {
    let mut found = Found::default();
    let mut seen = HashSet::new();

    while let Some((tile, side)) = todo.pop() {
        if !seen.insert((tile, side)) {
            continue;
        }
        if map.tile(tile).owner != owner {
            continue;
        }
        match map.tile(tile).kind {
            TileKind::Rail { tracks, .. } => {
                let side = match side {
                    Some(s) => s,
                    None => continue,
                };
                let entered = tracks & TrackBits::touching(side);
                let tracks = if tracks == TrackBits::HORZ || tracks == TrackBits::VERT {
                    entered
                } else {
                    tracks
                };
                if entered.is_empty() {
                    continue;
                }
                train_in(map, occ, tile, tracks, &mut found);

                if map.has_signals(tile) {
                    if let Some(track) = entered.first() {
                        if let Some(sig) = map.signal(tile, track) {
                            if let Some(td) = track.with_enterdir(side.reverse()) {
                                let rev = td.reverse();
                                if sig.faces(rev) {
                                    if sig.kind.is_path() {
                                        found.pbs = true;
                                    } else {
                                        to_update.push((tile, rev));
                                    }
                                }
                                if sig.faces(td) && !sig.kind.is_oneway() {
                                    found.pbs = true;
                                }
                            }
                            continue;
                        }
                    }
                }

                for d in ALL_DIAGDIRS.iter().cloned() {
                    if d == side || !tracks.intersects(TrackBits::touching(d)) {
                        continue;
                    }
                    if let Some(n) = map.neighbour(tile, d) {
                        maybe_add(todo, n, Some(d.reverse()), tile, Some(d));
                    }
                }
            }
            TileKind::Depot { exit, .. } => match side {
                None => {
                    train_in(map, occ, tile, TrackBits::ALL, &mut found);
                    if let Some(n) = map.neighbour(tile, exit) {
                        maybe_add(todo, n, Some(exit.reverse()), tile, Some(exit));
                    }
                }
                Some(s) if s == exit => {
                    train_in(map, occ, tile, TrackBits::ALL, &mut found);
                }
                _ => {}
            },
            TileKind::Station { axis, .. } | TileKind::Crossing { axis, .. } => {
                let side = match side {
                    Some(s) if s.axis() == axis => s,
                    _ => continue,
                };
                train_in(map, occ, tile, TrackBits::ALL, &mut found);
                let exit = side.reverse();
                if let Some(n) = map.neighbour(tile, exit) {
                    maybe_add(todo, n, Some(side), tile, Some(exit));
                }
            }
            TileKind::TunnelBridge { dir, other_end, .. } => match side {
                None => {
                    train_in(map, occ, tile, TrackBits::ALL, &mut found);
                    let exit = dir.reverse();
                    if let Some(n) = map.neighbour(tile, exit) {
                        maybe_add(todo, n, Some(dir), tile, Some(exit));
                    }
                }
                Some(s) if s.reverse() == dir => {
                    train_in(map, occ, tile, TrackBits::ALL, &mut found);
                    maybe_add(todo, other_end, None, tile, None);
                }
                _ => {}
            },
            TileKind::Clear => {}
        }
    }
    found
}

/// Where to start exploring when something changed at `side` of `tile`.
fn segment_starts(map: &Map, tile: TileIndex, side: Side) -> Vec<(TileIndex, Side)> {
    match map.tile(tile).kind {
        TileKind::Depot { .. } => vec![(tile, None)],
        TileKind::TunnelBridge { other_end, .. } => vec![(tile, None), (other_end, None)],
        TileKind::Clear => vec![],
        _ => {
            let sides: Vec<DiagDir> = match side {
                Some(s) => vec![s],
                None => ALL_DIAGDIRS
                    .iter()
                    .cloned()
                    .filter(|d| map.track_bits(tile).intersects(TrackBits::touching(*d)))
                    .collect(),
            };
            let mut starts = vec![];
            for s in sides {
                if map.track_bits(tile).intersects(TrackBits::touching(s)) {
                    starts.push((tile, Some(s)));
                }
                if let Some(n) = map.neighbour(tile, s) {
                    if map.track_bits(n).intersects(TrackBits::touching(s.reverse())) {
                        starts.push((n, Some(s.reverse())));
                    }
                }
            }
            starts
        }
    }
}

/// Flood fills the block(s) around `side` of `tile` and sets the block signals
/// facing into them.
pub fn update_signals_on_segment(
    map: &mut Map,
    occ: &dyn Occupancy,
    tile: TileIndex,
    side: Option<DiagDir>,
    owner: Owner,
) -> SegmentState {
    let mut todo = segment_starts(map, tile, side);
    if todo.is_empty() {
        return SegmentState::Free;
    }
    let mut to_update = vec![];
    let found = explore_segment(map, occ, owner, &mut todo, &mut to_update);
    let aspect = if found.train { SignalState::Red } else { SignalState::Green };
    for (t, td) in to_update {
        if map.set_signal_state(t, td, aspect) {
            trace!("block signal {} {:?} -> {:?}", t, td, aspect);
        }
    }
    if found.pbs {
        SegmentState::Pbs
    } else if found.train {
        SegmentState::Full
    } else {
        SegmentState::Free
    }
}

/// Recomputes every signal on the map.
pub fn update_all_signals(map: &mut Map, occ: &dyn Occupancy) {
    let mut blocks = vec![];
    for t in map.indices() {
        for s in map.signals(t) {
            let fwd = Trackdir::new(s.track, false);
            for td in [fwd, fwd.reverse()].iter() {
                if s.faces(*td) && !s.kind.is_path() {
                    blocks.push((t, td.exit(), map.tile(t).owner));
                }
            }
        }
    }
    for (t, side, owner) in blocks {
        update_signals_on_segment(map, occ, t, Some(side), owner);
    }
    for t in map.indices() {
        if map.has_signals(t) {
            refresh_path_signals(map, t);
        }
    }
}

/// Whether a train on `td` must stop before the signal on `tile`. A path signal
/// is passable only on the train's own reservation.
pub fn signal_blocks(map: &Map, tile: TileIndex, td: Trackdir, train: VehicleId) -> bool {
    if map.has_oneway_signal_blocking(tile, td) {
        return true;
    }
    match map.signal(tile, td.track) {
        Some(s) if s.faces(td) => {
            if s.kind.is_path() {
                holder(map, tile, td.track) != Some(train)
            } else {
                map.signal_state(tile, td) == Some(SignalState::Red)
            }
        }
        _ => false,
    }
}

/// Bars or opens a level crossing.
pub fn update_level_crossing(map: &mut Map, occ: &dyn Occupancy, tile: TileIndex) {
    let reserved = has_reserved_tracks(map, tile, TrackBits::ALL);
    let want = reserved || occ.occupied(tile) || occ.approaching(map, tile);
    if let TileKind::Crossing { ref mut barred, .. } = map.tile_mut(tile).kind {
        if *barred == want {
            return;
        }
        *barred = want;
    } else {
        return;
    }
    map.journal.push(MapChange::Barred { tile, barred: want });
}

/// Tiles and sides whose blocks need a flood fill after topology changes.
#[derive(Default, Debug)]
pub struct SignalBuffer {
    pending: Vec<(TileIndex, Side, Owner)>,
}

impl SignalBuffer {
    pub fn add_track(&mut self, map: &Map, tile: TileIndex, track: Track) {
        let owner = map.tile(tile).owner;
        let (a, b) = track.sides();
        self.push(tile, Some(a), owner);
        self.push(tile, Some(b), owner);
    }

    pub fn add_side(&mut self, map: &Map, tile: TileIndex, side: DiagDir) {
        let owner = map.tile(tile).owner;
        self.push(tile, Some(side), owner);
    }

    pub fn add_tile(&mut self, map: &Map, tile: TileIndex) {
        let owner = map.tile(tile).owner;
        self.push(tile, None, owner);
    }

    fn push(&mut self, tile: TileIndex, side: Side, owner: Owner) {
        if !self.pending.contains(&(tile, side, owner)) {
            self.pending.push((tile, side, owner));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn flush(&mut self, map: &mut Map, occ: &dyn Occupancy) {
        for (tile, side, owner) in std::mem::replace(&mut self.pending, vec![]) {
            match map.tile(tile).kind {
                TileKind::Clear => {
                    // the piece is gone; its neighbours still need updating
                    if let Some(s) = side {
                        if let Some(n) = map.neighbour(tile, s) {
                            update_signals_on_segment(map, occ, n, Some(s.reverse()), owner);
                        }
                    }
                }
                _ => {
                    update_signals_on_segment(map, occ, tile, side, owner);
                }
            }
            refresh_path_signals(map, tile);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    struct Trains(BTreeSet<TileIndex>);
    impl Occupancy for Trains {
        fn occupied(&self, tile: TileIndex) -> bool {
            self.0.contains(&tile)
        }
    }

    fn x_line(w: u32) -> Map {
        let mut m = Map::new(w, 3);
        for x in 0..w {
            let t = m.tile_xy(x, 1).unwrap();
            m.build_rail(t, Track::X, 0, RailType::Rail).unwrap();
        }
        m
    }

    fn sw() -> Trackdir {
        Trackdir::with_exit(Track::X, DiagDir::SW).unwrap()
    }

    #[test]
    fn block_signal_follows_occupancy() {
        let mut m = x_line(10);
        let s = m.tile_xy(3, 1).unwrap();
        // faces trains heading SW
        m.build_signal(s, Track::X, SignalKind::Block, [false, true]).unwrap();
        let occupied = Trains(vec![m.tile_xy(6, 1).unwrap()].into_iter().collect());
        let empty = Trains(BTreeSet::new());

        update_all_signals(&mut m, &occupied);
        assert_eq!(m.signal_state(s, sw()), Some(SignalState::Red));
        update_all_signals(&mut m, &empty);
        assert_eq!(m.signal_state(s, sw()), Some(SignalState::Green));

        // a train behind the signal does not matter
        let behind = Trains(vec![m.tile_xy(1, 1).unwrap()].into_iter().collect());
        assert_eq!(
            update_signals_on_segment(&mut m, &behind, s, Some(DiagDir::SW), 0),
            SegmentState::Free
        );
        assert_eq!(m.signal_state(s, sw()), Some(SignalState::Green));
    }

    #[test]
    fn reservation_fills_block_and_turns_path_signal_red() {
        use slotmap::SlotMap;
        let mut sm: SlotMap<VehicleId, ()> = SlotMap::with_key();
        let a = sm.insert(());
        let mut m = x_line(10);
        let s = m.tile_xy(3, 1).unwrap();
        m.build_signal(s, Track::X, SignalKind::PathOneWay, [false, true]).unwrap();
        assert_eq!(m.signal_state(s, sw()), Some(SignalState::Green));
        let ahead = m.tile_xy(4, 1).unwrap();
        assert!(try_reserve_track(&mut m, ahead, Track::X, a));
        assert_eq!(m.signal_state(s, sw()), Some(SignalState::Red));
        assert!(signal_blocks(&m, s, sw(), a));
        assert!(try_reserve_track(&mut m, s, Track::X, a));
        assert!(!signal_blocks(&m, s, sw(), a));
        unreserve_track(&mut m, ahead, Track::X);
        unreserve_track(&mut m, s, Track::X);
        assert_eq!(m.signal_state(s, sw()), Some(SignalState::Green));
        // one-way path signal from behind
        assert!(signal_blocks(&m, s, sw().reverse(), a));
    }

    #[test]
    fn two_way_path_signal_reports_pbs() {
        let mut m = x_line(10);
        let s = m.tile_xy(5, 1).unwrap();
        m.build_signal(s, Track::X, SignalKind::Path, [true, true]).unwrap();
        let empty = Trains(BTreeSet::new());
        let t = m.tile_xy(2, 1).unwrap();
        assert_eq!(update_signals_on_segment(&mut m, &empty, t, Some(DiagDir::SW), 0), SegmentState::Pbs);
    }

    #[test]
    fn buffer_updates_after_removal() {
        let mut m = x_line(10);
        let s = m.tile_xy(3, 1).unwrap();
        m.build_signal(s, Track::X, SignalKind::Block, [false, true]).unwrap();
        let occupied = Trains(vec![m.tile_xy(7, 1).unwrap()].into_iter().collect());
        update_all_signals(&mut m, &occupied);
        assert_eq!(m.signal_state(s, sw()), Some(SignalState::Red));

        // cut the line between the signal and the train
        let cut = m.tile_xy(5, 1).unwrap();
        m.remove_rail(cut, Track::X).unwrap();
        let mut buf = SignalBuffer::default();
        buf.add_track(&m, cut, Track::X);
        buf.flush(&mut m, &occupied);
        assert_eq!(m.signal_state(s, sw()), Some(SignalState::Green));
    }
}
