extern crate failure;
#[macro_use]
extern crate failure_derive;
extern crate log;
extern crate ordered_float;
extern crate rand;
extern crate rand_chacha;
extern crate regex;
extern crate serde;
extern crate serde_json;
extern crate slotmap;
extern crate smallvec;
extern crate toml;

#[cfg(test)]
#[macro_use]
extern crate maplit;

pub mod commands;
pub mod ids;
pub mod input;
pub mod map;
pub mod news;
pub mod output;
pub mod railway;
pub mod sim;

#[cfg(test)]
mod tests;

use input::settings::Settings;
use railway::World;
use std::path::Path;

pub type AppResult<T> = Result<T, failure::Error>;

pub fn read_file(f: &Path) -> AppResult<String> {
    use std::fs::File;
    use std::io::prelude::*;
    use std::io::BufReader;

    let file = File::open(f)?;
    let mut file = BufReader::new(&file);
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    Ok(contents)
}

/// Settings from an optional TOML file; no file means defaults.
pub fn get_settings(s: Option<&Path>) -> AppResult<Settings> {
    match s {
        Some(s) => {
            let contents = read_file(s)?;
            Ok(input::settings::parse_settings(&contents)?)
        }
        None => Ok(Settings::default()),
    }
}

pub fn get_scenario(s: &Path, settings: Settings) -> AppResult<World> {
    let contents = read_file(s)?;
    get_scenario_string(&contents, settings)
}

pub fn get_scenario_string(s: &str, settings: Settings) -> AppResult<World> {
    let w = input::scenario::parse_scenario(s, settings)?;
    Ok(w)
}

pub fn get_save(s: &Path) -> AppResult<World> {
    let contents = read_file(s)?;
    output::save::read_save(&contents)
}
