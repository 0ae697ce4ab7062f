// Rich terminal output for fanout

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::time::Duration;

use colored::*;

use super::errors::ErrorKind;
use super::response::Response;

/// Terminal output manager
pub struct TerminalOutput {
    verbose: bool,
    quiet: bool,
}

impl TerminalOutput {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        let is_tty = std::io::stdout().is_terminal();

        // Respect NO_COLOR environment variable (https://no-color.org/)
        // Also disable colors if not a TTY
        if std::env::var("NO_COLOR").is_ok() || !is_tty {
            colored::control::set_override(false);
        }

        TerminalOutput { verbose, quiet }
    }

    /// Print a header for a run
    pub fn print_run_header(&self, title: &str, hosts_count: usize) {
        if self.quiet {
            return;
        }

        println!();
        println!(
            "{} {} ({} hosts)",
            "RUN".green().bold(),
            title.cyan(),
            hosts_count
        );
        println!("{}", "─".repeat(60).dimmed());
    }

    /// Print one Response: a status line, then process output or the value
    pub fn print_response(&self, response: &Response) {
        if self.quiet && !response.error {
            return;
        }

        let status = match (response.error, response.kind) {
            (true, Some(ErrorKind::Unreachable)) => "UNREACHABLE".magenta().bold(),
            (true, _) => "FAILED".red().bold(),
            (false, _) if response.changed == Some(true) => "CHANGED".yellow(),
            _ => "OK".green(),
        };

        let mut line = format!(
            "  {} {} {} {}",
            status,
            format!("#{}", response.index).dimmed(),
            "=>".dimmed(),
            response.host.white().bold()
        );
        if let Some(label) = &response.label {
            line.push_str(&format!(" {}", format!("[{}]", label).dimmed()));
        }

        let process = response.completed_process();
        if let Some(process) = &process {
            match (&process.exit_signal, process.exit_status) {
                (Some(signal), _) => {
                    line.push_str(&format!(" {}", format!("(signal {})", signal.name()).red()))
                }
                (None, code) if code != 0 => {
                    line.push_str(&format!(" {}", format!("(rc={})", code).red()))
                }
                _ => {}
            }
        }
        println!("{}", line);

        match &process {
            Some(process) => {
                for out in process.stdout.lines() {
                    println!("      {}", out.dimmed());
                }
                if self.verbose || response.error {
                    for err in process.stderr.lines() {
                        println!("      {}", err.red());
                    }
                }
            }
            None => {
                if let Some(value) = response.value.as_ref().filter(|v| !v.is_null()) {
                    if self.verbose {
                        let pretty = serde_json::to_string_pretty(value).unwrap_or_default();
                        for out in pretty.lines() {
                            println!("      {}", out.dimmed());
                        }
                    } else {
                        println!("      {}", value.to_string().dimmed());
                    }
                }
            }
        }

        if response.error && !response.message.is_empty() {
            println!("      {}", response.message.red());
        }
    }

    /// Print the per-host recap and the run duration
    pub fn print_recap(&self, recap: &RunRecap) {
        if self.quiet {
            return;
        }

        println!();
        println!("{}", "RECAP".green().bold());
        println!("{}", "─".repeat(60).dimmed());

        for (host, stats) in &recap.hosts {
            println!(
                "{:<30} : {}  {}  {}  {}",
                host.white().bold(),
                counter("ok", stats.ok, Color::Green),
                counter("changed", stats.changed, Color::Yellow),
                counter("unreachable", stats.unreachable, Color::Magenta),
                counter("failed", stats.failed, Color::Red),
            );
        }

        println!();
        println!(
            "{} responses from {} hosts in {:.2}s",
            recap.total_responses(),
            recap.hosts.len(),
            recap.total_duration.as_secs_f64()
        );
    }
}

/// `name=n`, coloured only when non-zero
fn counter(name: &str, n: usize, color: Color) -> ColoredString {
    let text = format!("{}={}", name, n);
    if n > 0 {
        text.color(color)
    } else {
        text.normal()
    }
}

/// Response counts for one host
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostStats {
    pub ok: usize,
    pub changed: usize,
    pub unreachable: usize,
    pub failed: usize,
}

impl HostStats {
    pub fn record(&mut self, response: &Response) {
        match (response.error, response.kind) {
            (true, Some(ErrorKind::Unreachable)) => self.unreachable += 1,
            (true, _) => self.failed += 1,
            (false, _) if response.changed == Some(true) => self.changed += 1,
            _ => self.ok += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.ok + self.changed + self.unreachable + self.failed
    }
}

/// Per-host counts over a whole run
#[derive(Debug, Default, Clone)]
pub struct RunRecap {
    pub hosts: BTreeMap<String, HostStats>,
    pub total_duration: Duration,
}

impl RunRecap {
    pub fn new() -> Self {
        RunRecap::default()
    }

    pub fn from_responses(responses: &[Response], total_duration: Duration) -> Self {
        let mut recap = RunRecap {
            total_duration,
            ..RunRecap::default()
        };
        for response in responses {
            recap.record(response);
        }
        recap
    }

    pub fn record(&mut self, response: &Response) {
        self.hosts
            .entry(response.host.clone())
            .or_default()
            .record(response);
    }

    /// True when any Response has `error` set, whatever its kind
    pub fn has_failures(&self) -> bool {
        self.hosts.values().any(|s| s.failed + s.unreachable > 0)
    }

    pub fn total_failed(&self) -> usize {
        self.hosts.values().map(|s| s.failed + s.unreachable).sum()
    }

    pub fn total_changed(&self) -> usize {
        self.hosts.values().map(|s| s.changed).sum()
    }

    pub fn total_responses(&self) -> usize {
        self.hosts.values().map(HostStats::total).sum()
    }
}
