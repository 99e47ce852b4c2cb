//! Command-line argument parsing for the `bmi-echo` demonstration binary.
//!
//! `bmi-echo` is a minimal client/server driving the message-passing shim
//! and state-machine engine through an echo scenario: a client posts a
//! send and a matching recv against a server address; the server posts a
//! recv and echoes the payload back. It exists to give this crate a
//! runnable program, trimmed to what BMI actually needs (no message-size
//! sweeps, no percentile/throughput reporting — this crate carries no
//! benchmarking surface).

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, ValueEnum,
};

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Which side of the echo exchange this process plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Posts a recv, then echoes back whatever it receives.
    Server,
    /// Posts a send and a matching recv, and checks the echoed payload.
    Client,
}

/// A minimal BMI client/server exercising MP post/test directly.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Which side of the exchange to run.
    #[arg(long, value_enum, default_value_t = Role::Client)]
    pub role: Role,

    /// Transport method to activate: "tcp", "gm", or "mx".
    ///
    /// GM and MX stand in for Myrinet hardware this environment doesn't
    /// have; both run in loopback/simulated mode (see `transport::gm`,
    /// `transport::mx`), so every scheme is usable without special
    /// hardware.
    #[arg(long, default_value = "tcp")]
    pub scheme: String,

    /// BMI address to connect to (client) or advertise (server), in
    /// `scheme://host:port` form.
    #[arg(long, default_value = "tcp://127.0.0.1:7000")]
    pub address: String,

    /// Payload to send (client role only).
    #[arg(short = 'm', long, default_value = "hello from bmi-echo")]
    pub message: String,

    /// Number of request/response round trips to perform.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: u32,

    /// Tag value attached to every posted send/recv.
    #[arg(long, default_value_t = 1)]
    pub tag: u64,

    /// Silence user-facing informational output on stdout.
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity on stderr.
    ///
    /// Can be used multiple times to increase detail:
    ///  -v: debug
    ///  -vv and above: trace
    /// By default, only INFO and above are shown.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Write detailed logs to this file instead of stderr.
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn default_role_is_client() {
        let args = Args::parse_from(["bmi-echo"]);
        assert_eq!(args.role, Role::Client);
        assert_eq!(args.scheme, "tcp");
    }

    #[test]
    fn server_role_parses() {
        let args = Args::parse_from(["bmi-echo", "--role", "server", "--scheme", "gm"]);
        assert_eq!(args.role, Role::Server);
        assert_eq!(args.scheme, "gm");
    }
}
