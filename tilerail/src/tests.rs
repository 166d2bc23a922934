//! Whole-system runs over small scenarios.

use crate::commands::{Command, CommandError, CommandFlags};
use crate::ids::*;
use crate::input::scenario::parse_scenario;
use crate::input::settings::Settings;
use crate::map::Track;
use crate::news::AdviceKind;
use crate::output::history::TrainLogEvent;
use crate::railway::consist::{ForceProceed, TrainState};
use crate::railway::orders::Order;
use crate::railway::reservation::holder;
use crate::railway::World;
use crate::sim::Simulation;
use std::collections::{BTreeMap, BTreeSet};

const ENGINES: &str = r#"
engine loco power=1500 weight=80 speed=120 te=250 len=8
wagon short weight=20 len=6 capacity=20
wagon long weight=30 len=8 capacity=30
"#;

/// `body` starts with its map line; the shared engines go right after it.
fn sim(body: &str, settings: Settings) -> Simulation {
    let body = body.trim_start();
    let split = body.find('\n').unwrap_or(body.len());
    let src = format!("{}{}{}", &body[..split], ENGINES, &body[split..]);
    Simulation::new(parse_scenario(&src, settings).unwrap())
}

fn tile(w: &World, x: u32, y: u32) -> TileIndex {
    w.map.tile_xy(x, y).unwrap()
}

fn id(w: &World, name: &str) -> VehicleId {
    w.train_by_name(name).unwrap()
}

fn entered(w: &World, name: &str, t: TileIndex) -> bool {
    w.history
        .events_of(name)
        .iter()
        .any(|(_, e)| *e == TrainLogEvent::EnteredTile(t))
}

fn first_tick(w: &World, name: &str, pred: impl Fn(&TrainLogEvent) -> bool) -> Option<u64> {
    w.history.events_of(name).iter().find(|(_, e)| pred(e)).map(|(t, _)| *t)
}

/// Tiles under the visible vehicles of a train.
fn occupied(w: &World, train: VehicleId) -> BTreeSet<TileIndex> {
    w.trains[&train]
        .members
        .iter()
        .filter_map(|m| w.vehicles.get(*m))
        .filter(|v| !v.hidden && !v.in_wormhole)
        .map(|v| v.tile)
        .collect()
}

const FOLLOWING: &str = r#"
map 26 3
line 0 1 25 1
signal 6 1 x path_oneway against
signal 12 1 x path_oneway against
signal 18 1 x path_oneway against
train A at 2 1 x_sw consist loco,long
train B at 9 1 x_sw consist loco
"#;

#[test]
fn following_trains_never_share_a_tile() {
    let mut s = sim(FOLLOWING, Settings::default());
    let (a, b) = (id(&s.world, "A"), id(&s.world, "B"));
    for _ in 0..1200 {
        s.step();
        let w = &s.world;
        assert!(occupied(w, a).is_disjoint(&occupied(w, b)), "tick {}", w.tick);
        assert!(!w.trains[&a].is_crashed() && !w.trains[&b].is_crashed());
        for (tile, track, who) in crate::railway::reservation::snapshot(&w.map) {
            assert!(w.trains.contains_key(&who), "{:?} on {} held by a missing train", track, tile);
        }
    }
    assert!(entered(&s.world, "B", tile(&s.world, 20, 1)));
}

#[test]
fn runs_are_deterministic() {
    let run = || {
        let mut s = sim(FOLLOWING, Settings::default());
        s.advance_by(800);
        let w = &s.world;
        let positions: Vec<(String, Option<TileIndex>, u32)> =
            w.trains.values().map(|t| (t.name.clone(), w.front_tile(t), t.speed)).collect();
        let history = format!("{:?}", w.history);
        (history, positions)
    };
    assert_eq!(run(), run());
}

fn gaps(w: &World, train: VehicleId) -> Vec<i64> {
    let coords: Vec<i64> = w.trains[&train].members.iter().map(|m| w.vehicles[*m].coord).collect();
    coords.windows(2).map(|c| c[0] - c[1]).collect()
}

#[test]
fn reversal_keeps_spacing_by_length() {
    let mut s = sim("map 12 3\nline 0 1 11 1\ntrain A at 9 1 x_sw consist loco,short,long\n", Settings::default());
    let a = id(&s.world, "A");
    assert_eq!(gaps(&s.world, a), vec![7, 7]);
    assert_eq!(s.world.trains[&a].cache.total_length, 22);
    let before = s.world.front_position(&s.world.trains[&a]);

    s.world.reverse_train_direction(a);
    let w = &s.world;
    assert_eq!(gaps(w, a), vec![7, 7]);
    let (tile, td) = w.front_position(&w.trains[&a]).unwrap();
    assert_eq!(td, before.unwrap().1.reverse());
    assert!(tile <= before.unwrap().0);
    assert!(w.check_integrity(a).is_ok());
}

#[test]
fn uneven_consists_reverse_in_place() {
    let cases: [(&str, Vec<i64>); 2] = [
        ("loco,short,short", vec![7, 6]),
        ("loco,short,long,short,short", vec![7, 7, 7, 6]),
    ];
    for (consist, expected) in cases.iter() {
        let mut s = sim(&format!("map 16 3\nline 0 1 15 1\ntrain A at 12 1 x_sw consist {}\n", consist), Settings::default());
        let a = id(&s.world, "A");
        let (_, td) = s.world.front_position(&s.world.trains[&a]).unwrap();
        assert_eq!(&gaps(&s.world, a), expected);

        s.world.reverse_train_direction(a);
        assert_eq!(&gaps(&s.world, a), expected, "{} reversed once", consist);
        s.world.reverse_train_direction(a);
        assert_eq!(&gaps(&s.world, a), expected, "{} reversed twice", consist);
        assert_eq!(s.world.front_position(&s.world.trains[&a]).unwrap().1, td);
        assert!(s.world.check_integrity(a).is_ok());
    }
}

#[test]
fn spacing_holds_out_of_the_depot_and_back() {
    let mut s = sim(
        "map 14 3\ndepot 0 1 sw Shed\nline 1 1 13 1\ntrain A depot 0 1 consist loco,short,long stopped\n",
        Settings::default(),
    );
    let a = id(&s.world, "A");
    let whole = Command::ReverseTrainDirection { train: a, unit: None };
    assert_eq!(s.execute(&whole, CommandFlags::TEST), Err(CommandError::CannotReverse));

    let middle = s.world.trains[&a].members[1];
    let unit = Command::ReverseTrainDirection { train: a, unit: Some(middle) };
    s.execute(&unit, CommandFlags::EXEC).unwrap();
    let flipped: Vec<bool> = s.world.trains[&a].members.iter().map(|m| s.world.vehicles[*m].flipped).collect();
    assert_eq!(flipped, vec![false, true, false]);

    s.execute(&Command::StartStopTrain { train: a }, CommandFlags::EXEC).unwrap();
    let out = s.run_until(
        |w| w.trains[&a].members.iter().all(|m| !w.vehicles[*m].hidden),
        3000,
    );
    assert!(out);
    assert!(first_tick(&s.world, "A", |e| *e == TrainLogEvent::LeftDepot(0)).is_some());
    assert_eq!(gaps(&s.world, a), vec![7, 7]);

    s.world.reverse_train_direction(a);
    assert_eq!(gaps(&s.world, a), vec![7, 7]);
    assert!(s.world.check_integrity(a).is_ok());
}

#[test]
fn order_list_survives_serialization() {
    use crate::railway::orders::{resolve_index, Comparator, CondVariable};
    let list = vec![
        Order::station(0),
        Order::Conditional {
            variable: CondVariable::Age,
            comparator: Comparator::Less,
            value: 3,
            skip_to: 0,
        },
        Order::station(1),
        Order::GoToDepot {
            depot: None,
            service_only: true,
            halt: false,
        },
        Order::station(2),
    ];
    let replay = |orders: &[Order]| -> Vec<Order> {
        let mut index = 0;
        (0..12u32)
            .filter_map(|age| {
                let i = resolve_index(orders, index, |_, cmp, value| cmp.apply(age, value))?;
                index = i + 1;
                Some(orders[i])
            })
            .collect()
    };
    let text = serde_json::to_string(&list).unwrap();
    let back: Vec<Order> = serde_json::from_str(&text).unwrap();
    assert_eq!(back, list);
    let played = replay(&list);
    assert_eq!(played.len(), 12);
    assert_eq!(replay(&back), played);
    // the young train is sent back once before it runs the whole ring
    assert_eq!(played[..3], [Order::station(0), Order::station(0), Order::station(0)]);
}

#[test]
fn single_train_reaches_its_station() {
    let mut s = sim(
        "map 16 3\nline 0 1 13 1\nstation 14 1 x East\nstation 15 1 x East\ntrain A at 2 1 x_sw consist loco\norder A station East\n",
        Settings::default(),
    );
    let a = id(&s.world, "A");
    let arrived = s.run_until(
        |w| first_tick(w, "A", |e| *e == TrainLogEvent::ArrivedAtStation(0)).is_some(),
        5000,
    );
    assert!(arrived);
    assert_eq!(s.world.train_state(a), Some(TrainState::Loading));
    assert_eq!(s.world.front_tile(&s.world.trains[&a]), Some(tile(&s.world, 15, 1)));
}

const BLOCKED: &str = r#"
map 12 3
line 0 1 11 1
signal 6 1 x path_oneway against
train A at 2 1 x_sw consist loco
train B at 10 1 x_sw consist loco stopped
"#;

#[test]
fn run_without_recording_keeps_no_history() {
    let body = "map 16 3\nline 0 1 13 1\nstation 14 1 x East\nstation 15 1 x East\ntrain A at 2 1 x_sw consist loco\norder A station East\n";
    let mut s = sim(body, Settings::default());
    s.world.history.recording = false;
    let a = id(&s.world, "A");
    let start = tile(&s.world, 2, 1);
    assert!(s.run_until(|w| w.front_tile(&w.trains[&a]).map_or(false, |t| t != start), 3000));
    assert!(s.world.history.inf.is_empty());
    assert!(s.world.history.trains.is_empty());
    assert!(s.world.map.journal.is_empty());
}

fn impatient(reverse: bool) -> Settings {
    let mut s = Settings::default();
    s.pathfinding.wait_for_pbs_path = 2;
    s.pathfinding.reverse_at_signals = reverse;
    s
}

#[test]
fn blocked_train_waits_then_gets_stuck_then_turns() {
    let mut s = sim(BLOCKED, impatient(true));
    let a = id(&s.world, "A");
    assert!(s.run_until(|w| w.train_state(a) == Some(TrainState::StoppedAtSignal), 3000));
    assert!(!s.world.trains[&a].res.stuck);
    assert!(s.run_until(|w| w.trains[&a].res.stuck, 500));

    s.advance_by(1000);
    let w = &s.world;
    let stuck = first_tick(w, "A", |e| match e {
        TrainLogEvent::Stuck(_) => true,
        _ => false,
    });
    let reversed = first_tick(w, "A", |e| match e {
        TrainLogEvent::Reversed(_) => true,
        _ => false,
    });
    assert!(stuck.unwrap() < reversed.unwrap());
    assert!(w.history.events_of("B").iter().all(|(_, e)| match e {
        TrainLogEvent::EnteredTile(_) => false,
        _ => true,
    }));
}

#[test]
fn stuck_advice_is_given_once_per_episode() {
    let mut s = sim(BLOCKED, impatient(false));
    let a = id(&s.world, "A");
    s.advance_by(2500);
    let w = &s.world;
    assert_eq!(w.train_state(a), Some(TrainState::Stuck));
    assert_eq!(w.news.count(a, AdviceKind::TrainStuck), 1);
    assert!(first_tick(w, "A", |e| match e {
        TrainLogEvent::Reversed(_) => true,
        _ => false,
    })
    .is_none());

    // forcing it on lets it pass the red signal
    s.execute(&Command::ForceTrainProceed { train: a }, CommandFlags::EXEC).unwrap();
    assert_eq!(s.world.trains[&a].force_proceed, ForceProceed::Signal);
    let passed = tile(&s.world, 6, 1);
    assert!(s.run_until(|w| entered(w, "A", passed), 500));
}

/// Two trains meet at the ends of a shared main line: A runs east to East,
/// B comes up from the south and heads west to North over the same line.
const OPPOSITE: &str = r#"
map 20 10
line 0 3 17 3
rail 4 3 left
rail 15 3 right
rail 4 2 y
station 4 0 y North
station 4 1 y North
station 18 3 x East
station 19 3 x East
line 15 4 15 9
signal 3 3 x path_oneway against
signal 15 5 y path_oneway against
train A at 2 3 x_sw consist loco
train B at 15 9 y_nw consist loco
order A station East
order B station North
"#;

#[test]
fn opposite_ends_share_the_main_line() {
    let mut settings = Settings::default();
    settings.game.loading_ticks = 50_000;
    let mut s = sim(OPPOSITE, settings);
    let (a, b) = (id(&s.world, "A"), id(&s.world, "B"));
    let junction = tile(&s.world, 15, 3);

    assert!(s.run_until(|w| holder(&w.map, junction, Track::X) == Some(a), 500));
    assert!(s.run_until(|w| w.train_state(b) == Some(TrainState::StoppedAtSignal), 3000));
    assert!(!entered(&s.world, "B", junction));
    assert!(s.run_until(|w| w.trains[&b].res.stuck || entered(w, "B", junction), 500));
    assert!(s.run_until(|w| entered(w, "B", junction), 6000));
    assert!(s.run_until(
        |w| first_tick(w, "B", |e| *e == TrainLogEvent::ArrivedAtStation(0)).is_some(),
        6000
    ));
    assert!(!s.world.trains[&a].is_crashed() && !s.world.trains[&b].is_crashed());
}

#[test]
fn sent_to_a_far_depot_and_halted() {
    let mut s = sim("map 62 3\ndepot 0 1 sw Shed\nline 1 1 60 1\ntrain A at 55 1 x_sw consist loco,long\n", Settings::default());
    let a = id(&s.world, "A");
    let send = Command::SendTrainToDepot {
        train: a,
        service_only: false,
        cancel: false,
    };
    s.execute(&send, CommandFlags::EXEC).unwrap();
    match s.world.trains[&a].current_order {
        Order::GoToDepot { depot: Some(0), halt: true, .. } => {}
        o => panic!("unexpected order {:?}", o),
    }
    assert_eq!(s.execute(&send, CommandFlags::TEST), Err(CommandError::AlreadyHeadingToDepot));

    assert!(s.run_until(|w| w.stopped_in_depot(a), 20_000));
    assert!(first_tick(&s.world, "A", |e| *e == TrainLogEvent::EnteredDepot(0)).is_some());
    assert_eq!(s.world.trains[&a].current_order, Order::Nothing);
}

#[test]
fn order_edits_follow_every_sharer() {
    let mut s = sim(
        "map 10 4\nline 0 1 9 1\nstation 2 3 x P\nstation 4 3 x Q\nstation 6 3 x R\ndepot 0 0 sw D\ntrain A depot 0 0 consist loco stopped\ntrain B depot 0 0 consist loco stopped\n",
        Settings::default(),
    );
    let (a, b) = (id(&s.world, "A"), id(&s.world, "B"));
    for (i, st) in [0, 1, 2].iter().enumerate() {
        let cmd = Command::InsertOrder {
            train: a,
            index: i,
            order: Order::station(*st),
        };
        s.execute(&cmd, CommandFlags::EXEC).unwrap();
    }
    let share = Command::CloneOrder {
        train: b,
        source: a,
        mode: crate::commands::CloneMode::Share,
    };
    s.execute(&share, CommandFlags::EXEC).unwrap();
    s.execute(&Command::SkipToOrder { train: b, index: 2 }, CommandFlags::EXEC).unwrap();

    // previews change nothing
    let mv = Command::MoveOrder { train: a, from: 2, to: 0 };
    s.execute(&mv, CommandFlags::TEST).unwrap();
    assert_eq!(s.world.trains[&b].order_index, 2);

    s.execute(&mv, CommandFlags::EXEC).unwrap();
    s.execute(&Command::DeleteOrder { train: a, index: 1 }, CommandFlags::EXEC).unwrap();

    let w = &s.world;
    let stations = |t: VehicleId| -> Vec<StationId> {
        w.train_orders(&w.trains[&t])
            .iter()
            .filter_map(|o| o.destination_station())
            .collect()
    };
    let expected: BTreeMap<VehicleId, (Vec<StationId>, usize)> = btreemap! {
        a => (vec![2, 1], 1),
        b => (vec![2, 1], 0),
    };
    let got: BTreeMap<VehicleId, (Vec<StationId>, usize)> = btreemap! {
        a => (stations(a), w.trains[&a].order_index),
        b => (stations(b), w.trains[&b].order_index),
    };
    assert_eq!(got, expected);
    assert_eq!(
        s.world.execute(&Command::DeleteOrder { train: a, index: 5 }, CommandFlags::TEST),
        Err(CommandError::InvalidOrderIndex(5))
    );
}
