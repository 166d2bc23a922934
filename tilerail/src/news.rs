//! Player-visible advisories, rate limited per train and problem.

use crate::ids::*;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AdviceKind {
    TrainLost,
    TrainStuck,
    TrainCrashed,
    TooFewOrders,
    DuplicateOrder,
    VoidOrder,
    TrainTooLong,
}

impl AdviceKind {
    pub fn message(self) -> &'static str {
        match self {
            AdviceKind::TrainLost => "train is lost",
            AdviceKind::TrainStuck => "train is stuck",
            AdviceKind::TrainCrashed => "train crashed",
            AdviceKind::TooFewOrders => "too few orders",
            AdviceKind::DuplicateOrder => "duplicate order entry",
            AdviceKind::VoidOrder => "void order",
            AdviceKind::TrainTooLong => "train too long",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Advice {
    pub kind: AdviceKind,
    pub train: VehicleId,
    pub tile: TileIndex,
    pub tick: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewsQueue {
    pub items: Vec<Advice>,
    seen: BTreeSet<(VehicleId, AdviceKind)>,
}

impl NewsQueue {
    /// Queues an advisory unless the same one was already raised this review cycle.
    pub fn add(&mut self, kind: AdviceKind, train: VehicleId, tile: TileIndex, tick: u64) -> bool {
        if !self.seen.insert((train, kind)) {
            return false;
        }
        warn!("{} (train {}, tile {}, tick {})", kind.message(), short_id(train), tile, tick);
        self.items.push(Advice { kind, train, tile, tick });
        true
    }

    /// Starts a new review cycle.
    pub fn roll_cycle(&mut self) {
        self.seen.clear();
    }

    pub fn count(&self, train: VehicleId, kind: AdviceKind) -> usize {
        self.items.iter().filter(|a| a.train == train && a.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn one_item_per_cycle() {
        let mut sm: SlotMap<VehicleId, ()> = SlotMap::with_key();
        let (a, b) = (sm.insert(()), sm.insert(()));
        let mut news = NewsQueue::default();
        assert!(news.add(AdviceKind::TrainLost, a, 3, 0));
        assert!(!news.add(AdviceKind::TrainLost, a, 4, 1));
        assert!(news.add(AdviceKind::TrainLost, b, 3, 1));
        assert!(news.add(AdviceKind::VoidOrder, a, 3, 1));
        news.roll_cycle();
        assert!(news.add(AdviceKind::TrainLost, a, 3, 80));
        assert_eq!(news.count(a, AdviceKind::TrainLost), 2);
    }
}
