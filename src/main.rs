use clap::{Arg, Command};
use log::LevelFilter;
use mailpack::{Config, FileMailClient, SensorEngine};
use std::process;

fn main() {
    let matches = Command::new("mailpack")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Turns delivery-notification emails into consistent package metrics")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/mailpack.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity (compiles every pattern)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("maildir")
                .short('m')
                .long("maildir")
                .value_name("DIR")
                .help("Directory of .eml files to evaluate one cycle against"),
        )
        .arg(
            Arg::new("resources")
                .short('r')
                .long("resources")
                .value_name("LIST")
                .help("Comma-separated metric names (default: resources from the config)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("Testing configuration...");
        println!("Configured carriers: {}", config.carriers.len());
        for carrier in &config.carriers {
            println!("  {} ({} address(es))", carrier.key, carrier.addresses.len());
        }
        match config.validate() {
            Ok(()) => println!("All patterns compiled successfully."),
            Err(e) => {
                println!("Configuration validation failed: {e}");
                process::exit(1);
            }
        }
        return;
    }

    let Some(maildir) = matches.get_one::<String>("maildir") else {
        eprintln!("Nothing to do: pass --maildir to evaluate a cycle, or --test-config");
        process::exit(1);
    };

    let resources: Vec<String> = match matches.get_one::<String>("resources") {
        Some(list) => list
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => config.resources.clone(),
    };

    if let Err(e) = run_cycle(&config, maildir, &resources) {
        eprintln!("Evaluation cycle failed: {e}");
        process::exit(1);
    }
}

fn run_cycle(config: &Config, maildir: &str, resources: &[String]) -> anyhow::Result<()> {
    // A failed mailbox open aborts the whole cycle; per-metric failures do not
    let client = FileMailClient::new(maildir)?;
    let engine = SensorEngine::new(&client, config)?;

    log::info!("Evaluating {} metric(s) against {maildir}", resources.len());
    let evaluation = engine.evaluate(resources);

    for (name, err) in &evaluation.errors {
        log::error!("Metric {name} unavailable this cycle: {err:#}");
    }

    println!("{}", serde_json::to_string_pretty(&evaluation.results)?);
    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        log::info!("Loading configuration from: {path}");
        Config::from_file(path)
    } else {
        log::warn!("Configuration file not found at {path}, using defaults");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => println!("Default configuration written to: {path}"),
        Err(e) => {
            eprintln!("Failed to write configuration: {e}");
            process::exit(1);
        }
    }
}
