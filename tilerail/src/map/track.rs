//! Tile geometry: tile sides, the six track pieces and directed tracks.
//!
//! Sub-tile coordinates run 0..16 on both axes, `x` growing towards the SW side
//! and `y` growing towards the SE side.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

pub const TILE_SIZE: i32 = 16;

/// A side of a tile, also the direction of travel when crossing that side.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiagDir {
    NE,
    SE,
    SW,
    NW,
}

pub const ALL_DIAGDIRS: [DiagDir; 4] = [DiagDir::NE, DiagDir::SE, DiagDir::SW, DiagDir::NW];

impl DiagDir {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> DiagDir {
        ALL_DIAGDIRS[i & 3]
    }

    pub fn reverse(self) -> DiagDir {
        DiagDir::from_index(self.index() + 2)
    }

    pub fn axis(self) -> Axis {
        match self {
            DiagDir::NE | DiagDir::SW => Axis::X,
            DiagDir::SE | DiagDir::NW => Axis::Y,
        }
    }

    /// Tile offset `(dx, dy)` when stepping across this side.
    pub fn offset(self) -> (i32, i32) {
        match self {
            DiagDir::NE => (-1, 0),
            DiagDir::SE => (0, 1),
            DiagDir::SW => (1, 0),
            DiagDir::NW => (0, -1),
        }
    }

    pub fn to_direction(self) -> Direction {
        match self {
            DiagDir::NE => Direction::NE,
            DiagDir::SE => Direction::SE,
            DiagDir::SW => Direction::SW,
            DiagDir::NW => Direction::NW,
        }
    }

    fn edge_midpoint(self) -> (i32, i32) {
        match self {
            DiagDir::NE => (0, 8),
            DiagDir::SE => (8, 15),
            DiagDir::SW => (15, 8),
            DiagDir::NW => (8, 0),
        }
    }

    pub fn parse(s: &str) -> Option<DiagDir> {
        match s {
            "ne" => Some(DiagDir::NE),
            "se" => Some(DiagDir::SE),
            "sw" => Some(DiagDir::SW),
            "nw" => Some(DiagDir::NW),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    pub fn track(self) -> Track {
        match self {
            Axis::X => Track::X,
            Axis::Y => Track::Y,
        }
    }

    pub fn parse(s: &str) -> Option<Axis> {
        match s {
            "x" => Some(Axis::X),
            "y" => Some(Axis::Y),
            _ => None,
        }
    }
}

/// Eight-way vehicle heading. Odd values run along a tile axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    N,
    NE,
    E,
    SE,
    S,
    SW,
    W,
    NW,
}

impl Direction {
    /// Headings along the X or Y axis, i.e. the straight track pieces.
    pub fn is_axial(self) -> bool {
        (self as u8) & 1 == 1
    }

    /// Distance units consumed by one sub-tile step in this heading.
    pub fn advance_distance(self) -> u32 {
        if self.is_axial() {
            192
        } else {
            256
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Track {
    X,
    Y,
    Upper,
    Lower,
    Left,
    Right,
}

pub const ALL_TRACKS: [Track; 6] = [
    Track::X,
    Track::Y,
    Track::Upper,
    Track::Lower,
    Track::Left,
    Track::Right,
];

impl Track {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<Track> {
        ALL_TRACKS.get(i).cloned()
    }

    /// The two sides a track connects, as `(forward exit, reverse exit)`.
    pub fn sides(self) -> (DiagDir, DiagDir) {
        match self {
            Track::X => (DiagDir::NE, DiagDir::SW),
            Track::Y => (DiagDir::SE, DiagDir::NW),
            Track::Upper => (DiagDir::NE, DiagDir::NW),
            Track::Lower => (DiagDir::SE, DiagDir::SW),
            Track::Left => (DiagDir::SW, DiagDir::NW),
            Track::Right => (DiagDir::SE, DiagDir::NE),
        }
    }

    pub fn is_straight(self) -> bool {
        match self {
            Track::X | Track::Y => true,
            _ => false,
        }
    }

    pub fn bits(self) -> TrackBits {
        TrackBits(1 << self.index())
    }

    /// Tracks a train on this track would turn 90 degrees onto.
    pub fn crossing_tracks(self) -> TrackBits {
        match self {
            Track::X => TrackBits::Y,
            Track::Y => TrackBits::X,
            Track::Upper | Track::Lower => TrackBits::VERT,
            Track::Left | Track::Right => TrackBits::HORZ,
        }
    }

    /// Travelling on this track after crossing into the tile in direction `enterdir`.
    pub fn with_enterdir(self, enterdir: DiagDir) -> Option<Trackdir> {
        let td = Trackdir::new(self, false);
        if td.entry() == enterdir.reverse() {
            Some(td)
        } else if td.reverse().entry() == enterdir.reverse() {
            Some(td.reverse())
        } else {
            None
        }
    }

    pub fn parse(s: &str) -> Option<Track> {
        match s {
            "x" => Some(Track::X),
            "y" => Some(Track::Y),
            "upper" => Some(Track::Upper),
            "lower" => Some(Track::Lower),
            "left" => Some(Track::Left),
            "right" => Some(Track::Right),
            _ => None,
        }
    }
}

/// Set of tracks on a tile.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackBits(pub u8);

impl TrackBits {
    pub const NONE: TrackBits = TrackBits(0);
    pub const X: TrackBits = TrackBits(1);
    pub const Y: TrackBits = TrackBits(2);
    pub const HORZ: TrackBits = TrackBits(4 | 8);
    pub const VERT: TrackBits = TrackBits(16 | 32);
    pub const ALL: TrackBits = TrackBits(63);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, t: Track) -> bool {
        self.0 & t.bits().0 != 0
    }

    pub fn intersects(self, other: TrackBits) -> bool {
        self.0 & other.0 != 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn first(self) -> Option<Track> {
        self.iter().next()
    }

    /// The track if exactly one is present.
    pub fn single(self) -> Option<Track> {
        if self.count() == 1 {
            self.first()
        } else {
            None
        }
    }

    pub fn iter(self) -> impl Iterator<Item = Track> {
        ALL_TRACKS.iter().cloned().filter(move |t| self.contains(*t))
    }

    /// Whether the set holds tracks that physically cross each other.
    /// Two parallel corner pieces share no point and do not overlap.
    pub fn overlap(self) -> bool {
        if self.count() < 2 {
            return false;
        }
        self != TrackBits::HORZ && self != TrackBits::VERT
    }

    /// Reachable tracks when entering a tile in direction `enterdir`.
    pub fn reaching(enterdir: DiagDir) -> TrackBits {
        TrackdirBits::reaching(enterdir).tracks()
    }

    /// Tracks with an end on the given side of the tile.
    pub fn touching(side: DiagDir) -> TrackBits {
        TrackBits::reaching(side.reverse())
    }

    pub fn mask_crossing(self, t: Track) -> TrackBits {
        self & !t.crossing_tracks()
    }
}

impl BitOr for TrackBits {
    type Output = TrackBits;
    fn bitor(self, o: TrackBits) -> TrackBits {
        TrackBits(self.0 | o.0)
    }
}

impl BitOrAssign for TrackBits {
    fn bitor_assign(&mut self, o: TrackBits) {
        self.0 |= o.0;
    }
}

impl BitAnd for TrackBits {
    type Output = TrackBits;
    fn bitand(self, o: TrackBits) -> TrackBits {
        TrackBits(self.0 & o.0)
    }
}

impl BitAndAssign for TrackBits {
    fn bitand_assign(&mut self, o: TrackBits) {
        self.0 &= o.0;
    }
}

impl Not for TrackBits {
    type Output = TrackBits;
    fn not(self) -> TrackBits {
        TrackBits(!self.0 & TrackBits::ALL.0)
    }
}

impl fmt::Debug for TrackBits {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A track together with a direction of travel along it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Trackdir {
    pub track: Track,
    pub reversed: bool,
}

impl Trackdir {
    pub fn new(track: Track, reversed: bool) -> Trackdir {
        Trackdir { track, reversed }
    }

    /// Directed track leaving the tile through `exit`.
    pub fn with_exit(track: Track, exit: DiagDir) -> Option<Trackdir> {
        let (fwd, rev) = track.sides();
        if exit == fwd {
            Some(Trackdir::new(track, false))
        } else if exit == rev {
            Some(Trackdir::new(track, true))
        } else {
            None
        }
    }

    pub fn index(self) -> usize {
        self.track.index() + if self.reversed { 8 } else { 0 }
    }

    pub fn from_index(i: usize) -> Option<Trackdir> {
        Track::from_index(i & 7).map(|t| Trackdir::new(t, i & 8 != 0))
    }

    pub fn reverse(self) -> Trackdir {
        Trackdir::new(self.track, !self.reversed)
    }

    pub fn exit(self) -> DiagDir {
        let (fwd, rev) = self.track.sides();
        if self.reversed {
            rev
        } else {
            fwd
        }
    }

    pub fn entry(self) -> DiagDir {
        self.reverse().exit()
    }

    pub fn bits(self) -> TrackdirBits {
        TrackdirBits(1 << self.index())
    }

    pub fn direction(self) -> Direction {
        use self::Direction::*;
        match (self.track, self.reversed) {
            (Track::X, false) => NE,
            (Track::X, true) => SW,
            (Track::Y, false) => SE,
            (Track::Y, true) => NW,
            (Track::Upper, false) | (Track::Lower, false) => E,
            (Track::Upper, true) | (Track::Lower, true) => W,
            (Track::Left, false) | (Track::Right, false) => S,
            (Track::Left, true) | (Track::Right, true) => N,
        }
    }

    /// Number of sub-tile steps to cross the tile along this trackdir.
    pub fn steps(self) -> u32 {
        if self.track.is_straight() {
            16
        } else {
            8
        }
    }

    /// Sub-tile position after `offset` steps along this trackdir.
    pub fn local_position(self, offset: u32) -> (i32, i32) {
        let (sx, sy) = self.entry().edge_midpoint();
        let (ex, ey) = self.exit().edge_midpoint();
        let o = offset as i32;
        (sx + (ex - sx).signum() * o, sy + (ey - sy).signum() * o)
    }

    /// How far into the tile `offset` steps are, in sixteenths of a tile.
    pub fn progress16(self, offset: u32) -> u32 {
        if self.track.is_straight() {
            offset
        } else {
            offset * 2 + 1
        }
    }

    /// Trackdirs on the next tile that would be a 90 degree turn from this one.
    pub fn crossing_trackdirs(self) -> TrackdirBits {
        TrackdirBits::from_tracks(self.track.crossing_tracks())
    }

    pub fn parse(s: &str) -> Option<Trackdir> {
        let (track, dir) = match s.find('_') {
            Some(i) => (&s[..i], &s[i + 1..]),
            None => return None,
        };
        let track = Track::parse(track)?;
        let wanted = match dir {
            "ne" | "se" | "sw" | "nw" => return Trackdir::with_exit(track, DiagDir::parse(dir)?),
            "n" => Direction::N,
            "e" => Direction::E,
            "s" => Direction::S,
            "w" => Direction::W,
            _ => return None,
        };
        [Trackdir::new(track, false), Trackdir::new(track, true)]
            .iter()
            .cloned()
            .find(|td| td.direction() == wanted)
    }
}

impl fmt::Debug for Trackdir {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}_{:?}", self.track, self.direction())
    }
}

/// Set of directed tracks, indexed by `Trackdir::index`.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackdirBits(pub u16);

impl TrackdirBits {
    pub const NONE: TrackdirBits = TrackdirBits(0);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, td: Trackdir) -> bool {
        self.0 & td.bits().0 != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Trackdir> {
        (0..16usize)
            .filter(move |i| self.0 & (1 << i) != 0)
            .filter_map(Trackdir::from_index)
    }

    pub fn first(self) -> Option<Trackdir> {
        self.iter().next()
    }

    pub fn single(self) -> Option<Trackdir> {
        if self.0.count_ones() == 1 {
            self.first()
        } else {
            None
        }
    }

    pub fn from_tracks(tracks: TrackBits) -> TrackdirBits {
        let b = tracks.0 as u16;
        TrackdirBits(b | (b << 8))
    }

    pub fn tracks(self) -> TrackBits {
        TrackBits(((self.0 | (self.0 >> 8)) & 0x3f) as u8)
    }

    /// Trackdirs that can be taken after crossing into a tile moving in `enterdir`.
    pub fn reaching(enterdir: DiagDir) -> TrackdirBits {
        let mut bits = TrackdirBits::NONE;
        for t in ALL_TRACKS.iter() {
            if let Some(td) = t.with_enterdir(enterdir) {
                bits = bits | td.bits();
            }
        }
        bits
    }
}

impl BitOr for TrackdirBits {
    type Output = TrackdirBits;
    fn bitor(self, o: TrackdirBits) -> TrackdirBits {
        TrackdirBits(self.0 | o.0)
    }
}

impl BitAnd for TrackdirBits {
    type Output = TrackdirBits;
    fn bitand(self, o: TrackdirBits) -> TrackdirBits {
        TrackdirBits(self.0 & o.0)
    }
}

impl Not for TrackdirBits {
    type Output = TrackdirBits;
    fn not(self) -> TrackdirBits {
        TrackdirBits(!self.0 & 0x3f3f)
    }
}

impl fmt::Debug for TrackdirBits {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaching_trackdirs() {
        let ne = TrackdirBits::reaching(DiagDir::NE);
        let names: Vec<_> = ne.iter().map(|td| format!("{:?}", td)).collect();
        assert_eq!(names, vec!["X_NE", "Lower_E", "Left_N"]);
        for d in ALL_DIAGDIRS.iter() {
            for td in TrackdirBits::reaching(*d).iter() {
                assert_eq!(td.entry(), d.reverse());
            }
        }
    }

    #[test]
    fn overlap() {
        assert!(!TrackBits::HORZ.overlap());
        assert!(!TrackBits::VERT.overlap());
        assert!((TrackBits::X | TrackBits::Y).overlap());
        assert!((Track::Upper.bits() | Track::Left.bits()).overlap());
        assert!(!TrackBits::X.overlap());
    }

    #[test]
    fn local_positions() {
        let td = Trackdir::with_exit(Track::X, DiagDir::NE).unwrap();
        assert_eq!(td.local_position(0), (15, 8));
        assert_eq!(td.local_position(15), (0, 8));
        let corner = Trackdir::with_exit(Track::Upper, DiagDir::NE).unwrap();
        assert_eq!(corner.steps(), 8);
        assert_eq!(corner.local_position(0), (8, 0));
        assert_eq!(corner.local_position(7), (1, 7));
    }

    #[test]
    fn parse_trackdirs() {
        assert_eq!(Trackdir::parse("x_ne"), Trackdir::with_exit(Track::X, DiagDir::NE));
        assert_eq!(Trackdir::parse("upper_w"), Some(Trackdir::new(Track::Upper, true)));
        assert_eq!(Trackdir::parse("left_n").map(|t| t.exit()), Some(DiagDir::NW));
        assert_eq!(Trackdir::parse("x_n"), None);
        assert_eq!(Trackdir::parse("bogus"), None);
    }

    #[test]
    fn advance_distance() {
        assert_eq!(Trackdir::new(Track::X, false).direction().advance_distance(), 192);
        assert_eq!(Trackdir::new(Track::Left, false).direction().advance_distance(), 256);
    }
}
