//! fsctl: bring flow steering up on the in-memory device and show the tree.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use flowsteer_cmd::{DeviceCommand, FlowDestination, MockDevice};
use flowsteer_core::{
    add_roce_rules, FlowSteering, NamespaceType, RoceModes, RootTemplate, SteeringConfig,
};
use itertools::Itertools;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Yaml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoceArg {
    V1,
    V2,
    All,
}

impl RoceArg {
    fn modes(self) -> RoceModes {
        match self {
            RoceArg::V1 => RoceModes::V1,
            RoceArg::V2 => RoceModes::V2,
            RoceArg::All => RoceModes::V1 | RoceModes::V2,
        }
    }
}

/// Flow steering tree inspector
#[derive(Parser, Debug)]
#[command(name = "fsctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Steering configuration (YAML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// NIC receive root template (YAML)
    #[arg(short = 't', long)]
    template: Option<PathBuf>,

    /// Pretend the device cannot select the root table
    #[arg(long)]
    no_modify_root: bool,

    /// Override the deepest table level the device supports
    #[arg(long)]
    max_ft_level: Option<u32>,

    /// Install RoCE rules into the kernel namespace
    #[arg(long, value_enum)]
    roce: Option<RoceArg>,

    /// TIR the RoCE rules forward to
    #[arg(long, default_value = "1")]
    roce_tir: u32,

    /// Dump format
    #[arg(short = 'f', long, value_enum, default_value = "yaml")]
    format: OutputFormat,

    /// Print the device command log after the dump
    #[arg(long)]
    show_commands: bool,
}

fn load_config(args: &Args) -> Result<SteeringConfig> {
    let mut config = match &args.config {
        Some(path) => SteeringConfig::from_yaml_file(path)?,
        None => SteeringConfig::default(),
    };
    if args.no_modify_root {
        config = config.with_modify_root(false);
    }
    if let Some(level) = args.max_ft_level {
        config = config.with_max_ft_level(level);
    }
    Ok(config)
}

fn format_command(cmd: &DeviceCommand) -> String {
    match cmd {
        DeviceCommand::SetEntry {
            table,
            group,
            index,
            destinations,
        } => format!(
            "SET_FTE table={} group={} index={} dest=[{}]",
            table,
            group,
            index,
            destinations.iter().join(", ")
        ),
        other => format!("{:?}", other),
    }
}

fn run(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let template = match &args.template {
        Some(path) => RootTemplate::from_yaml_file(path)?,
        None => RootTemplate::default(),
    };

    let device = Arc::new(MockDevice::new());
    let mut steering = FlowSteering::init_with_template(device.clone(), config, &template)
        .context("flow steering bring-up failed")?;

    let mut roce = None;
    if let Some(mode) = args.roce {
        let kernel = steering
            .get_namespace(NamespaceType::Kernel)
            .context("kernel namespace is not available")?;
        let table = kernel.create_auto_grouped_table(0, "roce", 8, 2)?;
        let rules = add_roce_rules(&table, mode.modes(), FlowDestination::Tir(args.roce_tir))?;
        info!("installed {} RoCE rules in {}", rules.len(), table.name());
        roce = Some((table, rules));
    }

    let dump = steering.dump()?;
    let text = match args.format {
        OutputFormat::Json => serde_json::to_string_pretty(&dump)?,
        OutputFormat::Yaml => serde_yaml::to_string(&dump)?,
    };
    println!("{}", text);

    if args.show_commands {
        for (i, cmd) in device.commands().iter().enumerate() {
            println!("{:4} {}", i, format_command(cmd));
        }
    }

    if let Some((table, rules)) = roce {
        for rule in rules {
            rule.delete()?;
        }
        table.destroy()?;
    }
    steering.cleanup()?;
    info!("device left with {} tables", device.table_count());
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fsctl failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
