//! Acceleration models and the speed to distance bookkeeping.
//!
//! Speeds are in km-ish/h, masses in tonnes, forces in newtons. Acceleration
//! is returned in 1/256 speed units per tick, the unit `subspeed` counts in.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverAction {
    Accel,
    Brake,
    Coast,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccelerationModel {
    Original,
    Realistic,
}

/// Speeds allowed near a line end or red signal, by progress into the tile.
pub const APPROACH_SPEEDS: [u32; 16] = [
    225, 210, 195, 180, 165, 150, 135, 120, 105, 90, 75, 60, 45, 30, 15, 15,
];

/// Highest speed inside a depot under the realistic model.
pub const DEPOT_SPEED: u32 = 61;

#[derive(Copy, Clone, Debug)]
pub struct TractionParams {
    pub power_kw: u32,
    pub mass_t: u32,
    pub max_te_kn: u32,
    pub air_drag: u32,
    pub vehicles: u32,
    /// Sum over the vehicles on a slope, negative when going down.
    pub slope_resistance: i64,
    pub maglev: bool,
}

/// Resistance to motion at `speed`, in newtons.
pub fn resistance(p: &TractionParams, speed: i64) -> i64 {
    let mass = p.mass_t.max(1) as i64;
    let mut r = 0;
    if !p.maglev {
        r += 10 * p.vehicles as i64;
        r += mass * 15 * (512 + speed) / 512;
    }
    // frontal area of a train
    let area = 14;
    r += area * p.air_drag as i64 * speed * speed / 1000;
    r + p.slope_resistance
}

/// Tractive force at `speed`, in newtons.
pub fn tractive_force(p: &TractionParams, speed: i64, action: DriverAction) -> i64 {
    let power = p.power_kw as i64 * 1000;
    let max_te = p.max_te_kn as i64 * 1000;
    let mass = p.mass_t.max(1) as i64;
    if speed > 0 {
        if p.maglev {
            return power / 25;
        }
        let force = power * 18 / (speed * 5);
        if action == DriverAction::Accel && force > max_te {
            max_te
        } else {
            force
        }
    } else {
        let force = if action == DriverAction::Accel && !p.maglev {
            max_te.min(power)
        } else {
            power
        };
        force.max(mass * 8 + resistance(p, 0))
    }
}

pub fn realistic_acceleration(p: &TractionParams, speed: u32, action: DriverAction) -> i32 {
    let speed = speed as i64;
    let mass = p.mass_t.max(1) as i64;
    let r = resistance(p, speed);
    match action {
        DriverAction::Coast => 0,
        DriverAction::Accel => {
            let force = tractive_force(p, speed, action);
            if force == r {
                return 0;
            }
            let accel = clamp_i32((force - r) / (mass * 4));
            if force < r {
                accel.min(-1)
            } else {
                accel.max(1)
            }
        }
        DriverAction::Brake => {
            let force = tractive_force(p, speed, action);
            clamp_i32((-force - r).min(-10000) / mass)
        }
    }
}

/// The fixed acceleration of the original model, cached per consist.
pub fn original_acceleration(power_kw: u32, weight_t: u32) -> i32 {
    (power_kw / weight_t.max(1) * 4).max(1).min(255) as i32
}

fn clamp_i32(x: i64) -> i32 {
    x.max(i32::min_value() as i64).min(i32::max_value() as i64) as i32
}

/// Speed, its fraction and the distance carried over from the last tick.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SpeedState {
    pub speed: u32,
    pub subspeed: u8,
    pub progress: u32,
}

/// Applies `accel` to the speed and returns the distance budget for this tick.
/// Above `max_speed` the train slows gradually rather than snapping down.
pub fn update_speed(s: &mut SpeedState, accel: i32, min_speed: u32, max_speed: u32) -> u32 {
    let spd = s.subspeed as i32 + accel;
    s.subspeed = (spd & 0xff) as u8;
    let mut tempmax = max_speed as i64;
    if s.speed > max_speed {
        let cur = s.speed as i64;
        tempmax = (cur - cur / 10 - 1).max(max_speed as i64);
    }
    let min_speed = (min_speed as i64).min(tempmax);
    let new_speed = (s.speed as i64 + (spd >> 8) as i64).max(min_speed).min(tempmax);
    s.speed = new_speed.max(0) as u32;
    let budget = advance_speed(s.speed) + s.progress;
    s.progress = 0;
    budget
}

pub fn advance_speed(speed: u32) -> u32 {
    speed * 3 / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(power_kw: u32, mass_t: u32) -> TractionParams {
        TractionParams {
            power_kw,
            mass_t,
            max_te_kn: 300,
            air_drag: 50,
            vehicles: 10,
            slope_resistance: 0,
            maglev: false,
        }
    }

    #[test]
    fn heavier_never_accelerates_faster() {
        for speed in (0..=160).step_by(8) {
            let mut last = i32::max_value();
            for mass in (20..=1000).step_by(20) {
                let a = realistic_acceleration(&params(3000, mass), speed, DriverAction::Accel);
                assert!(a <= last, "speed {} mass {}: {} > {}", speed, mass, a, last);
                last = a;
            }
        }
    }

    #[test]
    fn more_power_never_accelerates_slower() {
        for speed in (0..=160).step_by(8) {
            let mut last = i32::min_value();
            for power in (100..=5000).step_by(100) {
                let a = realistic_acceleration(&params(power, 400), speed, DriverAction::Accel);
                assert!(a >= last, "speed {} power {}: {} < {}", speed, power, a, last);
                last = a;
            }
        }
    }

    #[test]
    fn braking_is_strong() {
        let p = params(1000, 100);
        assert!(realistic_acceleration(&p, 80, DriverAction::Brake) <= -100);
        assert_eq!(realistic_acceleration(&p, 80, DriverAction::Coast), 0);
    }

    #[test]
    fn original_model_bounds() {
        assert_eq!(original_acceleration(0, 100), 1);
        assert_eq!(original_acceleration(100000, 1), 255);
        assert_eq!(original_acceleration(1000, 100), 40);
    }

    #[test]
    fn speed_update_carries_fractions() {
        let mut s = SpeedState::default();
        let mut total = 0;
        for _ in 0..4 {
            total += update_speed(&mut s, 64, 0, 100);
        }
        assert_eq!(s.speed, 1);
        assert_eq!(s.subspeed, 0);
        assert_eq!(total, 0);

        s.speed = 200;
        update_speed(&mut s, 0, 0, 100);
        // decays by a tenth instead of dropping to the limit
        assert_eq!(s.speed, 179);

        s.speed = 40;
        s.progress = 7;
        assert_eq!(update_speed(&mut s, 0, 0, 100), 37);
    }
}
