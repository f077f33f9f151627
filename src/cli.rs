//! Command-line interface.

use clap::Parser;

use crate::config::DEFAULT_PORT;

/// Command-line arguments of the bridge binary.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(
    name = "stdio-bridge",
    about = "HTTP bridge to a JSON-over-stdio tool running in a container",
    version,
    long_about = None
)]
pub struct Cli {
    /// Container the tool process is exec'd into.
    #[arg(long, visible_alias = "container", value_name = "NAME")]
    pub target: String,

    /// Port the HTTP listener binds to.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}
