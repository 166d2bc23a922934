//! Recovery of trains that could not get a path reservation: periodic retries,
//! one turn-around and one advisory per episode.

use crate::ids::*;
use crate::news::AdviceKind;
use crate::output::history::TrainLogEvent;
use crate::railway::consist::ForceProceed;
use crate::railway::world::World;
use log::debug;

impl World {
    /// Halts the train and flags it stuck. Repeated calls within one episode do nothing.
    pub fn mark_train_as_stuck(&mut self, id: VehicleId) {
        let tile = match self.trains.get_mut(&id) {
            Some(t) if !t.res.stuck && !t.is_crashed() => {
                t.res.stuck = true;
                t.wait_counter = 0;
                t.speed = 0;
                t.subspeed = 0;
                t.progress = 0;
                debug!("train {} is stuck", t.name);
                t.members.first().cloned()
            }
            _ => return,
        };
        let tile = tile.and_then(|m| self.vehicles.get(m)).map(|v| v.tile).unwrap_or(0);
        self.log_train(id, TrainLogEvent::Stuck(tile));
    }

    pub fn clear_stuck(&mut self, id: VehicleId) {
        match self.trains.get_mut(&id) {
            Some(t) if t.res.stuck => {
                t.res.stuck = false;
                t.res.stuck_advised = false;
                t.res.stuck_reversed = false;
                debug!("train {} is no longer stuck", t.name);
            }
            _ => return,
        }
        self.log_train(id, TrainLogEvent::Unstuck);
    }

    /// One tick of a stuck train. Returns true while the train has to stay put.
    pub fn handle_stuck(&mut self, id: VehicleId) -> bool {
        let (wait, force, reversed, advised) = match self.trains.get_mut(&id) {
            Some(t) if t.res.stuck => {
                t.wait_counter += 1;
                (t.wait_counter, t.force_proceed, t.res.stuck_reversed, t.res.stuck_advised)
            }
            _ => return false,
        };
        let p = &self.settings.pathfinding;
        let patience = p.wait_for_pbs_path.max(1) * self.settings.day_ticks();
        let backoff = p.path_backoff_interval.max(1);
        let turn_around = p.reverse_at_signals && !reversed && wait >= patience;

        if !turn_around && wait % backoff != 0 && force == ForceProceed::None {
            return true;
        }
        if self.try_path_reserve(id, true, false) {
            return false;
        }

        if turn_around {
            if let Some(t) = self.trains.get_mut(&id) {
                t.res.stuck_reversed = true;
                debug!("train {} turns around after waiting {} ticks", t.name, wait);
            }
            self.reverse_train_direction(id);
        }
        if !advised && wait > 2 * patience {
            let tick = self.tick;
            let tile = self
                .trains
                .get(&id)
                .and_then(|t| self.front_tile(t))
                .unwrap_or(0);
            self.news.add(AdviceKind::TrainStuck, id, tile, tick);
            if let Some(t) = self.trains.get_mut(&id) {
                t.res.stuck_advised = true;
            }
        }
        if force != ForceProceed::None {
            self.clear_stuck(id);
            return false;
        }
        true
    }
}
