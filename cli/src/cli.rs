use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;

use shipsec_mcp_client::TransportKind;

#[derive(Parser, Debug)]
#[command(name = "shipsec", version, about = "ShipSec component execution runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the runtime: MCP gateway, webhook endpoint and ingestors.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },

    /// Execute a single component locally and print its output record.
    RunComponent {
        /// Fully-qualified component id, e.g. `shipsec.core.text-block`.
        #[arg(long)]
        component: String,

        /// Parameter record as JSON.
        #[arg(long, default_value = "{}")]
        params: String,

        /// Input record as JSON.
        #[arg(long, default_value = "{}")]
        inputs: String,

        #[arg(long, default_value = "local-run")]
        run_id: String,

        #[arg(long, default_value = "node-1")]
        node_ref: String,

        #[arg(long, default_value = "dev")]
        organization: String,
    },

    /// Enumerate the tools of an MCP server and print the report.
    Discover {
        #[arg(long, value_enum)]
        transport: TransportArg,

        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long)]
        command: Option<String>,

        /// Arguments for a stdio server command.
        #[arg(long = "arg")]
        args: Vec<String>,

        /// `key=value` headers for HTTP-family transports.
        #[arg(long = "header")]
        headers: Vec<String>,

        #[arg(long)]
        cache_token: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum TransportArg {
    Http,
    Sse,
    Websocket,
    Stdio,
}

impl From<TransportArg> for TransportKind {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Http => TransportKind::Http,
            TransportArg::Sse => TransportKind::Sse,
            TransportArg::Websocket => TransportKind::Websocket,
            TransportArg::Stdio => TransportKind::Stdio,
        }
    }
}
