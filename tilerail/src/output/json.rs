use super::history::{History, InfrastructureLogEvent, TrainLogEvent};
use crate::map::SignalState;
use failure::Error;
use std::io;

fn quoted(s: &str) -> Result<String, Error> {
    Ok(serde_json::to_string(s)?)
}

fn separator<W: io::Write>(f: &mut W, first: &mut bool) -> Result<(), Error> {
    if *first {
        *first = false;
    } else {
        write!(f, ", ")?;
    }
    Ok(())
}

pub fn javascript_history<W: io::Write>(history: &History, f: &mut W) -> Result<(), Error> {
    write!(f, "var data = ")?;
    json_history(history, f)?;
    write!(f, ";")?;
    Ok(())
}

/// Writes `{ "infrastructure": [...], "trains": { name: [...] } }`.
pub fn json_history<W: io::Write>(history: &History, f: &mut W) -> Result<(), Error> {
    write!(f, "{{ \"infrastructure\": [")?;
    let mut first = true;
    for &(tick, ref ev) in &history.inf {
        separator(f, &mut first)?;
        match *ev {
            InfrastructureLogEvent::Reserved(tile, track, ref holder) => {
                let holder = match *holder {
                    Some(ref h) => quoted(h)?,
                    None => "null".to_string(),
                };
                write!(
                    f,
                    "{{ \"tick\": {}, \"event\": \"reserved\", \"tile\": {}, \"track\": \"{:?}\", \"holder\": {} }}",
                    tick, tile, track, holder
                )?;
            }
            InfrastructureLogEvent::Aspect(tile, td, state) => {
                let aspect = if state == SignalState::Green { "green" } else { "red" };
                write!(
                    f,
                    "{{ \"tick\": {}, \"event\": \"signal\", \"tile\": {}, \"trackdir\": \"{:?}\", \"value\": \"{}\" }}",
                    tick, tile, td, aspect
                )?;
            }
            InfrastructureLogEvent::Crossing(tile, barred) => {
                write!(
                    f,
                    "{{ \"tick\": {}, \"event\": \"crossing\", \"tile\": {}, \"value\": {} }}",
                    tick, tile, barred
                )?;
            }
        }
    }
    write!(f, "], \"trains\": {{")?;

    let mut firsttrain = true;
    for &(ref name, ref events) in &history.trains {
        separator(f, &mut firsttrain)?;
        write!(f, " {}: [", quoted(name)?)?;
        let mut first = true;
        for &(tick, ref ev) in events {
            separator(f, &mut first)?;
            let (event, value) = match *ev {
                TrainLogEvent::EnteredTile(t) => ("tile", t.to_string()),
                TrainLogEvent::Stopped(t) => ("stopped", t.to_string()),
                TrainLogEvent::Stuck(t) => ("stuck", t.to_string()),
                TrainLogEvent::Unstuck => ("unstuck", "null".to_string()),
                TrainLogEvent::Reversed(t) => ("reversed", t.to_string()),
                TrainLogEvent::EnteredDepot(d) => ("depot_in", d.to_string()),
                TrainLogEvent::LeftDepot(d) => ("depot_out", d.to_string()),
                TrainLogEvent::ArrivedAtStation(s) => ("station", s.to_string()),
                TrainLogEvent::Crashed(t) => ("crashed", t.to_string()),
                TrainLogEvent::Reservation(ok, t) => {
                    ("reservation", format!("{{ \"success\": {}, \"tile\": {} }}", ok, t))
                }
            };
            write!(f, "{{ \"tick\": {}, \"event\": \"{}\", \"value\": {} }}", tick, event, value)?;
        }
        write!(f, "]")?;
    }
    write!(f, " }} }}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Track;

    #[test]
    fn writes_valid_json() {
        let mut h = History::default();
        h.inf.push((3, InfrastructureLogEvent::Reserved(7, Track::X, Some("A \"1\"".to_string()))));
        h.inf.push((4, InfrastructureLogEvent::Crossing(9, true)));
        h.train_log("A \"1\"").push((3, TrainLogEvent::EnteredTile(7)));
        h.train_log("A \"1\"").push((5, TrainLogEvent::Reservation(false, 8)));
        h.train_log("B").push((6, TrainLogEvent::Unstuck));

        let mut out = vec![];
        json_history(&h, &mut out).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["infrastructure"][0]["holder"], "A \"1\"");
        assert_eq!(v["infrastructure"][1]["value"], true);
        assert_eq!(v["trains"]["A \"1\""][1]["value"]["success"], false);
        assert_eq!(v["trains"]["B"][0]["event"], "unstuck");
    }
}
