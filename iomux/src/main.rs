mod logging;

use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitCode, ExitStatus};

use clap::Parser;
use iomux::{FdTag, MuxConfig, Muxer, PrintInfo, TransportKind};

use crate::logging::{init_logging, LogFormat, LogLevel};

/// Exit code used when iomux itself fails rather than the child.
const INTERNAL: u8 = 125;

#[derive(Parser, Debug)]
#[command(
    name = "iomux",
    version,
    about = "Run a program with its stdout and stderr multiplexed"
)]
struct Cli {
    /// Socket kind carrying the child's output (unix, unixgram, unixpacket).
    #[arg(long, value_name = "KIND", env = "IOMUX_TRANSPORT", default_value = "unix")]
    transport: TransportKind,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "warn")]
    log_level: LogLevel,

    /// Disable colored output.
    #[arg(long)]
    no_color: bool,

    /// Program to run.
    #[arg(value_name = "PROGRAM")]
    program: OsString,

    /// Arguments passed to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
    args: Vec<OsString>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);
    if cli.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    match run(&cli) {
        Ok(status) => ExitCode::from(exit_code(status)),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(INTERNAL)
        }
    }
}

fn run(cli: &Cli) -> iomux::Result<ExitStatus> {
    let config = MuxConfig::default().with_transport(cli.transport);
    let mut muxer = Muxer::with_config(config)?;
    muxer.add_hook(PrintInfo::new());

    let mut cmd = Command::new(&cli.program);
    cmd.args(&cli.args);

    let capture = muxer.capture(cmd, FdTag::Stdout, FdTag::Stderr)?;
    Ok(capture.status)
}

/// The child's own code, or 128 + signal number when it was killed.
fn exit_code(status: ExitStatus) -> u8 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code as u8,
        (None, Some(signal)) => 128u8.wrapping_add(signal as u8),
        (None, None) => INTERNAL,
    }
}
