use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use libssa_char::config::{
    locate_system_config, locate_test_config, ConfigPaths, SystemConfig, TestConfig,
    SSA_TEST_CONFIG_NAME, SYSTEM_CONFIG_NAME,
};
use libssa_char::column_map::TowerAddress;
use libssa_char::error::ConfigError;
use libssa_char::record::ChannelRecord;
use libssa_char::report::{render_table, SummaryRow};
use libssa_char::session::{run_all, Session};
use libssa_char::simulate::{SimulatedInstrument, SimulationSettings};

fn write_yaml<T: serde::Serialize>(value: &T, path: &Path) -> Result<(), ConfigError> {
    let yaml_str = serde_yaml::to_string(value)?;
    let mut file = File::create(path)?;
    file.write_all(yaml_str.as_bytes())?;
    Ok(())
}

fn make_template_configs(dir: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(dir)?;
    write_yaml(&SystemConfig::default(), &dir.join(SYSTEM_CONFIG_NAME))?;
    write_yaml(&TestConfig::default(), &dir.join(SSA_TEST_CONFIG_NAME))?;
    Ok(())
}

fn config_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("system")
                .short('s')
                .long("system")
                .help("Path to the system config"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the SSA test config"),
        )
}

/// Find and load both configs named on the command line
fn load_configs(
    matches: &ArgMatches,
) -> Result<(SystemConfig, TestConfig, ConfigPaths), ConfigError> {
    let system_arg = matches.get_one::<String>("system").map(PathBuf::from);
    let test_arg = matches.get_one::<String>("config").map(PathBuf::from);
    let system_path = locate_system_config(system_arg.as_deref())?;
    let test_path = locate_test_config(test_arg.as_deref())?;
    log::info!("Loading system config from {}...", system_path.to_string_lossy());
    let system = SystemConfig::read_config_file(&system_path)?;
    log::info!("Loading test config from {}...", test_path.to_string_lossy());
    let test = TestConfig::read_config_file(&test_path)?;
    Ok((
        system,
        test,
        ConfigPaths {
            system: Some(system_path),
            test: Some(test_path),
        },
    ))
}

fn check(matches: &ArgMatches) {
    let (system, test, _) = match load_configs(matches) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    let column_map = match test.validate(&system) {
        Ok(map) => map,
        Err(e) => {
            log::error!("Config is invalid: {e}");
            return;
        }
    };
    log::info!("Configs successfully loaded and validated.");
    log::info!("User: {} System: {}", test.info.user, test.info.system);
    log::info!("Column | SA Bias        | SA FB          | SA Input       | DAQ");
    for hardware in column_map.iter() {
        let line = |a: &TowerAddress| {
            format!("{}@{}:{}", a.card, a.address, a.tower_column)
        };
        log::info!(
            "{:6} | {:14} | {:14} | {:14} | {}",
            hardware.column,
            line(&hardware.sa_bias),
            line(&hardware.sa_fb),
            line(&hardware.sa_input),
            hardware.daq_card
        );
    }
    let sweep = &test.phase0_0;
    log::info!(
        "Bias sweep: {} points from {} to {}, {} samples per triangle, {} averages",
        sweep.bias_sweep_npoints,
        sweep.bias_sweep_start,
        sweep.bias_sweep_end,
        sweep.triangle.points_per_period().unwrap_or_default(),
        sweep.n_avg
    );
}

fn simulate(matches: &ArgMatches, pb_manager: &MultiProgress) {
    let (system, test, paths) = match load_configs(matches) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    let seed = matches.get_one::<u64>("seed").copied().unwrap_or(0);
    let session = match Session::new(&system, test.clone(), paths) {
        Ok(s) => s,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    let settings = SimulationSettings {
        n_rows: test.test_globals.n_rows,
        dac_full_scale: session
            .column_map()
            .iter()
            .map(|h| h.calibration.dac_full_scale())
            .min()
            .unwrap_or(SimulationSettings::default().dac_full_scale),
        ..Default::default()
    };
    let instrument = SimulatedInstrument::for_sweep(
        &test.test_globals.columns,
        test.phase0_0.bias_sweep_start,
        test.phase0_0.bias_sweep_end,
        settings,
        seed,
    );
    log::info!("Simulating columns {:?} with seed {seed}", test.test_globals.columns);

    // Setup the progress bar
    let pb = pb_manager.add(ProgressBar::new(100));
    if let Ok(style) = ProgressStyle::with_template("{msg:>16} [{bar:40}] {pos:>3}%") {
        pb.set_style(style);
    }
    let (tx, rx) = mpsc::channel();
    // Spawn the task!
    let handle = std::thread::spawn(move || {
        let mut tower = instrument.tower();
        let mut daq = instrument.daq();
        run_all(session, &mut tower, &mut daq, &tx)
    });

    loop {
        std::thread::sleep(std::time::Duration::from_millis(100));
        for status in rx.try_iter() {
            pb.set_message(status.phase.to_string());
            pb.set_position((status.progress * 100.0) as u64);
        }

        if handle.is_finished() {
            match handle.join() {
                Ok(result) => match result {
                    Ok(paths) => log::info!("Successfully saved {} records!", paths.len()),
                    Err(e) => log::error!("Test run failed with error: {e}"),
                },
                Err(_) => log::error!("Failed to join test task!"),
            }
            break;
        }
    }

    pb.finish();
}

fn report(matches: &ArgMatches) {
    let mut rows = vec![];
    for path in matches
        .get_many::<String>("records")
        .into_iter()
        .flatten()
        .map(PathBuf::from)
    {
        match ChannelRecord::load(&path) {
            Ok(record) => rows.push(SummaryRow::from_record(&record)),
            Err(e) => log::error!("Skipping {}: {e}", path.to_string_lossy()),
        }
    }
    print!("{}", render_table(&rows));
}

fn main() {
    // Create a cli
    let matches = Command::new("ssa_char_cli")
        .about("SQUID Series Array screening")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("Increase log verbosity"),
        )
        .subcommand(
            Command::new("new")
                .about("Make template system and test configuration yaml files")
                .arg(
                    Arg::new("path")
                        .short('p')
                        .long("path")
                        .default_value(".")
                        .help("Directory to write the templates to"),
                ),
        )
        .subcommand(config_args(
            Command::new("check").about("Load and validate the configuration"),
        ))
        .subcommand(config_args(
            Command::new("simulate")
                .about("Run every test phase against a simulated instrument")
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_parser(clap::value_parser!(u64))
                        .help("Seed of the simulated noise"),
                ),
        ))
        .subcommand(
            Command::new("report")
                .about("Print a summary of saved records")
                .arg(
                    Arg::new("records")
                        .num_args(1..)
                        .required(true)
                        .help("Record files"),
                ),
        )
        .get_matches();

    let level = match matches.get_count("verbose") {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");

    match matches.subcommand() {
        Some(("new", sub)) => {
            let dir = PathBuf::from(sub.get_one::<String>("path").map_or(".", |p| p.as_str()));
            log::info!("Making template configs in {}...", dir.to_string_lossy());
            match make_template_configs(&dir) {
                Ok(()) => log::info!("Done."),
                Err(e) => log::error!("{e}"),
            }
        }
        Some(("check", sub)) => check(sub),
        Some(("simulate", sub)) => simulate(sub, &pb_manager),
        Some(("report", sub)) => report(sub),
        _ => (),
    }
}
