use crate::commands::{Command, CommandCost, CommandError, CommandFlags};
use crate::railway::World;
use log::{error, trace};

/// Fixed-tick driver around a `World`.
pub struct Simulation {
    pub world: World,
}

impl Simulation {
    pub fn new(world: World) -> Simulation {
        Simulation { world }
    }

    pub fn time(&self) -> u64 {
        self.world.tick
    }

    /// One tick: every train in ascending id order, then wrecks, then the
    /// periodic checks.
    pub fn step(&mut self) {
        let world = &mut self.world;
        trace!("tick {}", world.tick);
        for id in world.train_ids() {
            if let Err(e) = world.train_tick(id) {
                error!("{}", e);
                if let Some(t) = world.trains.get_mut(&id) {
                    t.speed = 0;
                    t.subspeed = 0;
                    t.stopped = true;
                }
            }
        }
        world.handle_wrecks();

        let review = world.settings.game.news_review_interval.max(1) as u64;
        if world.tick % review == 0 {
            for id in world.train_ids() {
                world.check_orders(id);
            }
            world.news.roll_cycle();
        }
        let day = world.settings.day_ticks().max(1) as u64;
        if world.tick > 0 && world.tick % day == 0 {
            world.on_new_day();
        }
        world.drain_journal();
        world.tick += 1;
    }

    pub fn advance_by(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Steps until `pred` holds, at most `max` ticks. Returns whether it held.
    pub fn run_until(&mut self, mut pred: impl FnMut(&World) -> bool, max: u64) -> bool {
        for _ in 0..max {
            if pred(&self.world) {
                return true;
            }
            self.step();
        }
        pred(&self.world)
    }

    /// Applies a command between ticks.
    pub fn execute(&mut self, cmd: &Command, flags: CommandFlags) -> Result<CommandCost, CommandError> {
        let r = self.world.execute(cmd, flags);
        self.world.drain_journal();
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::settings::Settings;
    use crate::map::Map;

    #[test]
    fn empty_world_ticks() {
        let mut sim = Simulation::new(World::new(Map::new(4, 4), Settings::default()));
        sim.advance_by(10);
        assert_eq!(sim.time(), 10);
        assert!(sim.run_until(|w| w.tick >= 15, 100));
        assert_eq!(sim.time(), 15);
        assert!(!sim.run_until(|_| false, 5));
        assert_eq!(sim.time(), 20);
    }
}
