extern crate failure;
extern crate log;
extern crate structopt;
extern crate tilerail;

use log::{Level, Log, Metadata, Record};
use std::path::PathBuf;
use structopt::StructOpt;
use tilerail::*;

/// tilerail -- tile-grid train, signal and path reservation simulation
#[derive(StructOpt, Debug)]
#[structopt(name = "tilerail")]
struct Opt {
    /// Verbose mode (-v, -vv, -vvv)
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,

    /// Scenario file
    #[structopt(parse(from_os_str))]
    scenario: PathBuf,

    /// Number of ticks to simulate
    #[structopt(short = "t", long = "ticks", default_value = "1000")]
    ticks: u64,

    /// Settings file (TOML)
    #[structopt(short = "s", long = "settings", parse(from_os_str))]
    settings: Option<PathBuf>,

    /// Output JSON history file
    #[structopt(short = "j", long = "json", parse(from_os_str))]
    json: Option<PathBuf>,

    /// Write the final state to this save file
    #[structopt(long = "save", parse(from_os_str))]
    save: Option<PathBuf>,

    /// Resume from a save file instead of the scenario's initial state
    #[structopt(long = "load", parse(from_os_str))]
    load: Option<PathBuf>,
}

// no logger crate in the stack, so warnings go straight to stderr
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => Level::Warn,
        1 => Level::Info,
        2 => Level::Debug,
        _ => Level::Trace,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level.to_level_filter());
    }
}

fn run(opt: &Opt) -> AppResult<()> {
    let settings = get_settings(opt.settings.as_ref().map(|p| p.as_path()))?;
    let world = match opt.load {
        Some(ref save) => get_save(save)?,
        None => get_scenario(&opt.scenario, settings)?,
    };
    if opt.verbose >= 2 {
        println!("Engines:");
        for e in &world.engines {
            println!("  - {:?}", e);
        }
    }

    let mut sim = sim::Simulation::new(world);
    sim.world.history.recording = opt.json.is_some();
    sim.advance_by(opt.ticks);

    let w = &sim.world;
    println!("# Trains after {} ticks:", w.tick);
    for (id, t) in &w.trains {
        let tile = w.front_tile(t).map(|t| w.map.xy(t));
        println!(
            "  {}: tile {:?}, {:?}, speed {}",
            t.name,
            tile,
            w.train_state(*id),
            t.speed
        );
    }
    if !w.news.items.is_empty() {
        println!("# Advisories:");
        for a in &w.news.items {
            let name = w.trains.get(&a.train).map(|t| &t.name[..]).unwrap_or("?");
            println!("  tick {}: {} ({}, tile {})", a.tick, a.kind.message(), name, a.tile);
        }
    }

    if let Some(ref json) = opt.json {
        use std::fs::File;
        use std::io::BufWriter;
        let file = File::create(json)?;
        let mut writer = BufWriter::new(&file);
        output::json::json_history(&w.history, &mut writer)?;
    }

    if let Some(ref save) = opt.save {
        use std::fs::File;
        use std::io::BufWriter;
        let file = File::create(save)?;
        let mut writer = BufWriter::new(&file);
        output::save::write_save(w, &mut writer)?;
    }

    Ok(())
}

pub fn main() {
    let opt = Opt::from_args();
    init_logger(opt.verbose);
    match run(&opt) {
        Ok(()) => {}
        Err(e) => {
            println!("Error:\n{}", e.as_fail());
            std::process::exit(1);
        }
    }
}
