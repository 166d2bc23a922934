use crate::ids::*;
use crate::map::{SignalState, Track, Trackdir};
use failure;

#[derive(Debug, Clone)]
pub struct History {
    pub inf: Vec<(u64, InfrastructureLogEvent)>,
    pub trains: Vec<(String, Vec<(u64, TrainLogEvent)>)>,
    /// When off, events are dropped as they arrive.
    pub recording: bool,
}

impl Default for History {
    fn default() -> Self {
        History { inf: vec![], trains: vec![], recording: true }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InfrastructureLogEvent {
    /// Holder is the train name, `None` when released.
    Reserved(TileIndex, Track, Option<String>),
    Aspect(TileIndex, Trackdir, SignalState),
    Crossing(TileIndex, bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainLogEvent {
    EnteredTile(TileIndex),
    Stopped(TileIndex),
    Stuck(TileIndex),
    Unstuck,
    Reversed(TileIndex),
    EnteredDepot(DepotId),
    LeftDepot(DepotId),
    ArrivedAtStation(StationId),
    Crashed(TileIndex),
    /// Outcome of a path reservation attempt, with the tile it ended on.
    Reservation(bool, TileIndex),
}

impl History {
    pub fn record_train(&mut self, name: &str, tick: u64, ev: TrainLogEvent) {
        if self.recording {
            self.train_log(name).push((tick, ev));
        }
    }

    pub fn record_inf(&mut self, tick: u64, ev: InfrastructureLogEvent) {
        if self.recording {
            self.inf.push((tick, ev));
        }
    }

    pub fn train_log(&mut self, name: &str) -> &mut Vec<(u64, TrainLogEvent)> {
        let idx = match self.trains.iter().position(|(n, _)| n == name) {
            Some(i) => i,
            None => {
                self.trains.push((name.to_string(), vec![]));
                self.trains.len() - 1
            }
        };
        &mut self.trains[idx].1
    }

    pub fn events_of(&self, name: &str) -> &[(u64, TrainLogEvent)] {
        self.trains
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| &e[..])
            .unwrap_or(&[])
    }
}

/// Print one tile visit per line on the format `trainname tick tile`.
pub fn visits(h: &History) -> Result<String, failure::Error> {
    use std::fmt::Write;
    let mut s = String::new();
    for &(ref train_name, ref events) in &h.trains {
        for &(tick, ref ev) in events {
            if let TrainLogEvent::EnteredTile(tile) = *ev {
                write!(s, "{} {} {}\n", train_name, tick, tile)?;
            }
        }
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_is_kept_while_not_recording() {
        let mut h = History::default();
        h.record_train("A", 1, TrainLogEvent::Unstuck);
        h.record_inf(1, InfrastructureLogEvent::Crossing(3, true));
        assert_eq!(h.events_of("A"), &[(1, TrainLogEvent::Unstuck)][..]);
        assert_eq!(h.inf.len(), 1);

        h.recording = false;
        h.record_train("A", 2, TrainLogEvent::Unstuck);
        h.record_train("B", 2, TrainLogEvent::Unstuck);
        h.record_inf(2, InfrastructureLogEvent::Crossing(3, false));
        assert_eq!(h.events_of("A").len(), 1);
        assert!(h.events_of("B").is_empty());
        assert_eq!(h.trains.len(), 1);
        assert_eq!(h.inf.len(), 1);
    }
}
