// fanout CLI - ad-hoc commands on every host of an inventory

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;

use fanout::executor::{Scheduler, SchedulerConfig};
use fanout::inventory::{HostFilter, Inventory, Secret};
use fanout::operation::{Escalation, Intent, RemoteCommand, Script};
use fanout::output::{sort_for_display, FanoutError, OutputFormat, OutputWriter, RunRecap};

#[derive(Parser)]
#[command(
    name = "fanout",
    about = "Run one program on every host, in parallel",
    version,
    author,
    disable_colored_help = true,
    term_width = 0,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Write the diagnostic log to this file instead of stderr
    #[arg(long, global = true)]
    logging: Option<PathBuf>,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum Commands {
    /// Run a shell command on every matching host
    Run {
        /// Command line to run
        command: String,

        /// Path to the inventory file
        #[arg(short, long)]
        inventory: PathBuf,

        /// Only run on hosts in this group
        #[arg(short, long)]
        group: Option<String>,

        /// Run the command with sudo
        #[arg(short = 's', long, conflicts_with = "su")]
        sudo: bool,

        /// Run the command with su
        #[arg(long)]
        su: bool,

        /// Method intent: get, put or post
        #[arg(long, default_value = "get")]
        intent: Intent,

        /// Limit to specific hosts or groups (comma-separated)
        #[arg(short, long)]
        limit: Option<String>,

        /// Output format
        #[arg(long, value_enum, ignore_case = true, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Prompt for the sudo or su password
        #[arg(short = 'K', long)]
        ask_sudo_pass: bool,

        /// Per-command timeout in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,

        /// SSH connection timeout in seconds
        #[arg(long, default_value = "30")]
        connect_timeout: u64,

        /// Append an NDJSON run log to this file
        #[arg(long)]
        logfile: Option<PathBuf>,
    },

    /// List hosts and groups of an inventory
    Inventory {
        /// Path to the inventory file
        #[arg(short, long)]
        inventory: PathBuf,

        /// Only list hosts in this group
        #[arg(short, long, default_value = "all")]
        group: String,
    },
}

struct RunArgs {
    command: String,
    inventory: PathBuf,
    group: Option<String>,
    escalation: Escalation,
    intent: Intent,
    limit: Option<String>,
    format: OutputFormat,
    ask_sudo_pass: bool,
    timeout: u64,
    connect_timeout: u64,
    logfile: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.logging.as_deref(), cli.verbose) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Run {
            command,
            inventory,
            group,
            sudo,
            su,
            intent,
            limit,
            format,
            ask_sudo_pass,
            timeout,
            connect_timeout,
            logfile,
        } => {
            let escalation = if sudo {
                Escalation::Sudo
            } else if su {
                Escalation::Su
            } else {
                Escalation::None
            };
            let args = RunArgs {
                command,
                inventory,
                group,
                escalation,
                intent,
                limit,
                format,
                ask_sudo_pass,
                timeout,
                connect_timeout,
                logfile,
            };
            run_command(args, cli.verbose, cli.quiet).await
        }
        Commands::Inventory { inventory, group } => list_inventory(&inventory, &group),
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

/// Diagnostic log: `RUST_LOG` wins, otherwise `fanout=info` (`debug` with -v)
fn init_logging(path: Option<&Path>, verbose: bool) -> Result<(), FanoutError> {
    let default = if verbose { "fanout=debug" } else { "fanout=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| FanoutError::Io {
                    message: format!("Failed to open log file: {}", e),
                    path: Some(path.to_path_buf()),
                })?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
    Ok(())
}

async fn run_command(args: RunArgs, verbose: bool, quiet: bool) -> Result<(), FanoutError> {
    let start = Instant::now();
    let mut inventory = Inventory::from_file(&args.inventory)?;

    if args.ask_sudo_pass && args.escalation != Escalation::None {
        let prompt = match args.escalation {
            Escalation::Su => "SU password: ",
            _ => "SUDO password: ",
        };
        let password = prompt_password(prompt)?;
        inventory = with_escalation_password(&inventory, args.escalation, &password)?;
    }

    let config = SchedulerConfig {
        connect_timeout: Duration::from_secs(args.connect_timeout),
        command_timeout: Duration::from_secs(args.timeout),
        limit: args.limit.as_deref().map(HostFilter::parse_list),
        logfile: args.logfile.clone(),
        ..SchedulerConfig::default()
    };

    let output = OutputWriter::new(args.format, verbose, quiet);
    let mut selected = HostFilter::new();
    if let Some(limit) = &config.limit {
        selected = selected.with_limit(limit.clone());
    }
    let addresses: Vec<String> = selected
        .apply(inventory.hosts())
        .iter()
        .map(|h| h.address().to_string())
        .collect();
    output.print_run_header(&args.command, &addresses);

    let command = args.command.clone();
    let escalation = args.escalation;
    let intent = args.intent;
    let group = args.group.clone();
    let factory = move || {
        let mut op = RemoteCommand::new(command.clone())
            .escalation(escalation)
            .intent(intent);
        if let Some(group) = &group {
            op = op.group(group.clone());
        }
        Script::new().step(op)
    };

    let scheduler = Scheduler::new(config);
    let mut responses = scheduler.execute(&factory, &inventory).await?;

    sort_for_display(&mut responses);
    for response in &responses {
        output.print_response(response);
    }

    let recap = RunRecap::from_responses(&responses, start.elapsed());
    output.print_recap(&recap);

    if recap.has_failures() {
        std::process::exit(2);
    }
    Ok(())
}

/// Copy of `inventory` with the prompted password on every host that has
/// none configured for `escalation`
fn with_escalation_password(
    inventory: &Inventory,
    escalation: Escalation,
    password: &str,
) -> Result<Inventory, FanoutError> {
    let hosts = inventory.hosts().iter().cloned().map(|mut host| {
        let slot = match escalation {
            Escalation::Su => &mut host.authentication.su_password,
            _ => &mut host.authentication.sudo_password,
        };
        if slot.is_none() {
            *slot = Some(Secret::new(password));
        }
        host
    });
    Inventory::from_hosts(hosts)
}

fn list_inventory(path: &Path, group: &str) -> Result<(), FanoutError> {
    let inventory = Inventory::from_file(path)?;
    let hosts = inventory.get_hosts(group);

    println!(
        "{} {} host(s) in group '{}'",
        "Found".green(),
        hosts.len(),
        group
    );
    println!();

    for host in hosts {
        println!("  {} {}", "•".cyan(), host.address().white().bold());
        println!("    {} {}", "Port:".dimmed(), host.port());

        if !host.connection.username.is_empty() {
            println!("    {} {}", "User:".dimmed(), host.connection.username);
        }

        if !host.groups.is_empty() {
            println!("    {} {}", "Groups:".dimmed(), host.groups.join(", "));
        }

        if host.is_local() {
            println!("    {} local", "Transport:".dimmed());
        }

        println!();
    }

    println!("{}:", "Groups".green());
    for name in inventory.group_names() {
        let count = inventory.get_hosts(name).len();
        println!("  {} {} ({} hosts)", "•".cyan(), name, count);
    }

    Ok(())
}

fn prompt_password(prompt: &str) -> Result<String, FanoutError> {
    // Print prompt to stderr so it appears even with redirected stdout
    eprint!("{}", prompt.cyan());
    io::stderr().flush().ok();

    // Read password with echo disabled
    let password = rpassword::read_password().map_err(|e| FanoutError::Io {
        message: format!("Failed to read password: {}", e),
        path: None,
    })?;

    Ok(password.trim_end().to_string())
}
