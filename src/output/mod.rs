// Output module for fanout

pub mod errors;
pub mod json_output;
pub mod response;
pub mod terminal;

pub use errors::*;
pub use json_output::*;
pub use response::*;
pub use terminal::*;

/// Output format for fanout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output with colors
    #[default]
    Text,
    /// Machine-readable JSON output (NDJSON format)
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(()),
        }
    }
}

/// Unified output writer supporting both text and JSON formats
pub enum OutputWriter {
    Text(TerminalOutput),
    Json(JsonOutput),
}

impl OutputWriter {
    pub fn new(format: OutputFormat, verbose: bool, quiet: bool) -> Self {
        match format {
            OutputFormat::Text => OutputWriter::Text(TerminalOutput::new(verbose, quiet)),
            OutputFormat::Json => OutputWriter::Json(JsonOutput::new(quiet)),
        }
    }

    pub fn print_run_header(&self, title: &str, hosts: &[String]) {
        match self {
            OutputWriter::Text(output) => output.print_run_header(title, hosts.len()),
            OutputWriter::Json(output) => output.print_run_header(title, hosts),
        }
    }

    pub fn print_response(&self, response: &Response) {
        match self {
            OutputWriter::Text(output) => output.print_response(response),
            OutputWriter::Json(output) => output.print_response(response),
        }
    }

    pub fn print_recap(&self, recap: &RunRecap) {
        match self {
            OutputWriter::Text(output) => output.print_recap(recap),
            OutputWriter::Json(output) => output.print_recap(recap),
        }
    }
}

/// Sort responses for display: by yield index, then host address. The
/// engine itself only guarantees per-host order.
pub fn sort_for_display(responses: &mut [Response]) {
    responses.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.host.cmp(&b.host)));
}
