//! The reservation overlay. Every reserved unit records the train holding it:
//! a track on plain rail, a whole platform, a tunnel/bridge span, a depot or a
//! level crossing.

use crate::ids::*;
use crate::map::*;
use crate::railway::signal;
use std::collections::BTreeSet;

/// Reserved tracks on a tile, whoever holds them.
pub fn reserved_trackbits(map: &Map, tile: TileIndex) -> TrackBits {
    match map.tile(tile).kind {
        TileKind::Rail { ref reserved, .. } => {
            let mut bits = TrackBits::NONE;
            for t in ALL_TRACKS.iter() {
                if reserved[t.index()].is_some() {
                    bits |= t.bits();
                }
            }
            bits
        }
        TileKind::Depot { reserved, .. }
        | TileKind::Station { reserved, .. }
        | TileKind::TunnelBridge { reserved, .. }
        | TileKind::Crossing { reserved, .. } => {
            if reserved.is_some() {
                map.track_bits(tile)
            } else {
                TrackBits::NONE
            }
        }
        TileKind::Clear => TrackBits::NONE,
    }
}

pub fn has_reserved_tracks(map: &Map, tile: TileIndex, tracks: TrackBits) -> bool {
    reserved_trackbits(map, tile).intersects(tracks)
}

/// The train holding `track` on `tile`, if any.
pub fn holder(map: &Map, tile: TileIndex, track: Track) -> Option<VehicleId> {
    if !map.track_bits(tile).contains(track) {
        return None;
    }
    match map.tile(tile).kind {
        TileKind::Rail { ref reserved, .. } => reserved[track.index()],
        TileKind::Depot { reserved, .. }
        | TileKind::Station { reserved, .. }
        | TileKind::TunnelBridge { reserved, .. }
        | TileKind::Crossing { reserved, .. } => reserved,
        TileKind::Clear => None,
    }
}

/// Tracks on `tile` held by `who`.
pub fn held_trackbits(map: &Map, tile: TileIndex, who: VehicleId) -> TrackBits {
    let mut bits = TrackBits::NONE;
    for t in map.track_bits(tile).iter() {
        if holder(map, tile, t) == Some(who) {
            bits |= t.bits();
        }
    }
    bits
}

fn set_holder(map: &mut Map, tile: TileIndex, track: Track, who: Option<VehicleId>) {
    match map.tile_mut(tile).kind {
        TileKind::Rail { ref mut reserved, .. } => reserved[track.index()] = who,
        TileKind::Depot { ref mut reserved, .. }
        | TileKind::Station { ref mut reserved, .. }
        | TileKind::TunnelBridge { ref mut reserved, .. }
        | TileKind::Crossing { ref mut reserved, .. } => *reserved = who,
        TileKind::Clear => return,
    }
    map.journal.push(MapChange::Reserved { tile, track, holder: who });
}

/// Every tile sharing one reservation unit with `tile`.
fn unit_tiles(map: &Map, tile: TileIndex) -> Vec<TileIndex> {
    match map.tile(tile).kind {
        TileKind::Station { .. } => map.platform_tiles(tile),
        TileKind::TunnelBridge { other_end, .. } => vec![tile, other_end],
        _ => vec![tile],
    }
}

fn refresh_around(map: &mut Map, tiles: &[TileIndex]) {
    for &t in tiles {
        signal::refresh_path_signals(map, t);
    }
}

/// Reserves `track` on `tile` for `who`. Fails if the unit is already held,
/// or if it would cross a track reserved on the same tile.
pub fn try_reserve_track(map: &mut Map, tile: TileIndex, track: Track, who: VehicleId) -> bool {
    if !map.track_bits(tile).contains(track) {
        return false;
    }
    let reserved = reserved_trackbits(map, tile);
    if reserved.contains(track) || (reserved | track.bits()).overlap() {
        return false;
    }
    let tiles = unit_tiles(map, tile);
    // the tile itself was checked track by track above
    if tiles.iter().any(|&t| t != tile && !reserved_trackbits(map, t).is_empty()) {
        return false;
    }
    for &t in &tiles {
        set_holder(map, t, track_of_unit(map, t, track), Some(who));
        if let TileKind::Crossing { ref mut barred, .. } = map.tile_mut(t).kind {
            if !*barred {
                *barred = true;
                map.journal.push(MapChange::Barred { tile: t, barred: true });
            }
        }
    }
    refresh_around(map, &tiles);
    true
}

fn track_of_unit(map: &Map, t: TileIndex, track: Track) -> Track {
    if map.is_plain_rail(t) {
        track
    } else {
        map.track_bits(t).first().unwrap_or(track)
    }
}

/// Lifts the reservation of `track` on `tile` and of the unit it belongs to.
/// Idempotent. Crossings are left barred; the crossing update opens them.
pub fn unreserve_track(map: &mut Map, tile: TileIndex, track: Track) {
    if holder(map, tile, track).is_none() {
        return;
    }
    let tiles = unit_tiles(map, tile);
    for &t in &tiles {
        let tr = track_of_unit(map, t, track);
        if holder(map, t, tr).is_some() {
            set_holder(map, t, tr, None);
        }
    }
    refresh_around(map, &tiles);
}

/// Lifts the reservation only if `who` holds it.
pub fn release_track(map: &mut Map, tile: TileIndex, track: Track, who: VehicleId) -> bool {
    if holder(map, tile, track) == Some(who) {
        unreserve_track(map, tile, track);
        true
    } else {
        false
    }
}

/// Sets or clears the reservation of the whole platform through `tile`.
pub fn set_platform_reservation(map: &mut Map, tile: TileIndex, who: Option<VehicleId>) {
    let tiles = map.platform_tiles(tile);
    for &t in &tiles {
        let track = map.track_bits(t).first();
        if let Some(track) = track {
            set_holder(map, t, track, who);
        }
    }
    refresh_around(map, &tiles);
}

/// Releases the unit under a rear vehicle that has just left `tile` on `td`.
///
/// A platform is only released once the train leaves the platform itself, and a
/// tunnel/bridge span only when the train leaves through the far portal with
/// nothing left inside (`span_free`).
pub fn clear_path_reservation(map: &mut Map, tile: TileIndex, td: Trackdir, who: VehicleId, span_free: bool) {
    match map.tile(tile).kind {
        TileKind::TunnelBridge { dir, .. } => {
            if dir == td.exit().reverse() && span_free {
                release_track(map, tile, td.track, who);
            }
        }
        TileKind::Station { id, axis, .. } => {
            let next = map.neighbour(tile, td.exit());
            let same = next.map(|n| map.same_platform(n, id, axis)).unwrap_or(false);
            if !same {
                release_track(map, tile, td.track, who);
            }
        }
        _ => {
            release_track(map, tile, td.track, who);
        }
    }
}

/// All held units as `(tile, track, holder)`.
pub fn snapshot(map: &Map) -> BTreeSet<(TileIndex, Track, VehicleId)> {
    let mut set = BTreeSet::new();
    for tile in map.indices() {
        for track in map.track_bits(tile).iter() {
            if let Some(who) = holder(map, tile, track) {
                set.insert((tile, track, who));
            }
        }
    }
    set
}

/// Releases everything held by `who` except units touching a tile in `keep`.
pub fn release_held_by(map: &mut Map, who: VehicleId, keep: &[TileIndex]) {
    let held: Vec<(TileIndex, Track)> = snapshot(map)
        .into_iter()
        .filter(|&(_, _, h)| h == who)
        .map(|(t, tr, _)| (t, tr))
        .collect();
    for (tile, track) in held {
        let unit = unit_tiles(map, tile);
        if unit.iter().any(|t| keep.contains(t)) {
            continue;
        }
        release_track(map, tile, track, who);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn ids() -> (VehicleId, VehicleId) {
        let mut sm: SlotMap<VehicleId, ()> = SlotMap::with_key();
        (sm.insert(()), sm.insert(()))
    }

    #[test]
    fn crossing_tracks_are_exclusive() {
        let (a, b) = ids();
        let mut m = Map::new(4, 4);
        let t = m.tile_xy(1, 1).unwrap();
        for tr in [Track::X, Track::Y, Track::Upper, Track::Lower].iter() {
            m.build_rail(t, *tr, 0, RailType::Rail).unwrap();
        }
        assert!(try_reserve_track(&mut m, t, Track::Upper, a));
        assert!(!try_reserve_track(&mut m, t, Track::Upper, b));
        assert!(!try_reserve_track(&mut m, t, Track::X, b));
        // parallel corner pieces share no point
        assert!(try_reserve_track(&mut m, t, Track::Lower, b));
        assert_eq!(holder(&m, t, Track::Upper), Some(a));
        assert_eq!(holder(&m, t, Track::Lower), Some(b));
        assert_eq!(reserved_trackbits(&m, t), TrackBits::HORZ);
    }

    #[test]
    fn side_pieces_are_held_by_two_trains() {
        let (a, b) = ids();
        let mut m = Map::new(4, 4);
        let t = m.tile_xy(2, 2).unwrap();
        m.build_rail(t, Track::Left, 0, RailType::Rail).unwrap();
        m.build_rail(t, Track::Right, 0, RailType::Rail).unwrap();
        assert!(try_reserve_track(&mut m, t, Track::Right, a));
        assert!(try_reserve_track(&mut m, t, Track::Left, b));
        assert_eq!(snapshot(&m).len(), 2);
        release_track(&mut m, t, Track::Right, a);
        assert_eq!(holder(&m, t, Track::Left), Some(b));
        assert_eq!(holder(&m, t, Track::Right), None);
    }

    #[test]
    fn platform_and_span_are_single_units() {
        let (a, b) = ids();
        let mut m = Map::new(12, 3);
        for x in 1..4 {
            let t = m.tile_xy(x, 1).unwrap();
            m.build_station(t, 0, Axis::X, 0, RailType::Rail).unwrap();
        }
        let mid = m.tile_xy(2, 1).unwrap();
        assert!(try_reserve_track(&mut m, mid, Track::X, a));
        for x in 1..4 {
            assert_eq!(holder(&m, m.tile_xy(x, 1).unwrap(), Track::X), Some(a));
        }
        let t3 = m.tile_xy(3, 1).unwrap();
        assert!(!try_reserve_track(&mut m, t3, Track::X, b));

        let p = m.tile_xy(5, 1).unwrap();
        let q = m.tile_xy(9, 1).unwrap();
        m.build_tunnel_bridge(p, q, TunnelBridgeKind::Bridge, 0, RailType::Rail).unwrap();
        assert!(try_reserve_track(&mut m, q, Track::X, b));
        assert_eq!(holder(&m, p, Track::X), Some(b));
        unreserve_track(&mut m, p, Track::X);
        assert!(snapshot(&m).iter().all(|&(_, _, h)| h == a));
    }

    #[test]
    fn platform_released_only_when_leaving_it() {
        let (a, _) = ids();
        let mut m = Map::new(8, 3);
        for x in 1..4 {
            let t = m.tile_xy(x, 1).unwrap();
            m.build_station(t, 0, Axis::X, 0, RailType::Rail).unwrap();
        }
        let sw = Trackdir::with_exit(Track::X, DiagDir::SW).unwrap();
        let t1 = m.tile_xy(1, 1).unwrap();
        let t3 = m.tile_xy(3, 1).unwrap();
        assert!(try_reserve_track(&mut m, t1, Track::X, a));
        clear_path_reservation(&mut m, t1, sw, a, true);
        assert!(has_reserved_tracks(&m, m.tile_xy(1, 1).unwrap(), TrackBits::X));
        clear_path_reservation(&mut m, t3, sw, a, true);
        assert!(snapshot(&m).is_empty());
    }

    #[test]
    fn only_the_holder_releases() {
        let (a, b) = ids();
        let mut m = Map::new(4, 4);
        let t = m.tile_xy(1, 1).unwrap();
        m.build_crossing(t, Axis::Y, 0, RailType::Rail).unwrap();
        assert!(try_reserve_track(&mut m, t, Track::Y, a));
        match m.tile(t).kind {
            TileKind::Crossing { barred, .. } => assert!(barred),
            _ => unreachable!(),
        }
        assert!(!release_track(&mut m, t, Track::Y, b));
        assert!(release_track(&mut m, t, Track::Y, a));
        assert!(!has_reserved_tracks(&m, t, TrackBits::ALL));
        assert!(m.journal.len() >= 3);
    }

    #[test]
    fn release_keeps_wreck_tiles() {
        let (a, _) = ids();
        let mut m = Map::new(6, 3);
        for x in 0..6 {
            let t = m.tile_xy(x, 1).unwrap();
            m.build_rail(t, Track::X, 0, RailType::Rail).unwrap();
            assert!(try_reserve_track(&mut m, t, Track::X, a));
        }
        let keep = [m.tile_xy(2, 1).unwrap()];
        release_held_by(&mut m, a, &keep);
        let left: Vec<_> = snapshot(&m).into_iter().map(|(t, _, _)| t).collect();
        assert_eq!(left, keep.to_vec());
    }
}
