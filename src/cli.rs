use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "fidelio",
    about = "Fidelio - dependency-aware multi-container orchestration",
    version
)]
pub struct Cli {
    /// Path to the application schema file
    #[arg(short, long, global = true, default_value = "fidelio.yaml")]
    pub schema: PathBuf,

    /// Coordination-store hosts ("local" selects the in-process store)
    #[arg(long, global = true)]
    pub hosts: Option<String>,

    /// Client session timeout in seconds
    #[arg(long, global = true)]
    pub session_timeout: Option<u64>,

    /// Root of the coordination-store tree
    #[arg(long, global = true, default_value = "/fidelio")]
    pub root: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the application schema without launching anything
    Validate,

    /// Launch the application and run it in the foreground until shutdown
    Start,

    /// Signal application-wide shutdown
    Stop,

    /// Stop the application, wait for the drain, then launch it again
    Restart {
        /// Seconds to wait for all services to drain before relaunching
        #[arg(long, default_value_t = 60)]
        drain_timeout: u64,
    },

    /// Show the advertised status of every service
    Status,

    /// Run the in-container broker agent for one service
    Broker {
        /// Service name of the container this broker drives
        #[arg(long)]
        service: String,

        /// Container tier: "web", "business" or "data"
        #[arg(long, default_value = "business")]
        tier: String,

        /// Container-node path (defaults to the layout path for the tier)
        #[arg(long)]
        container_path: Option<String>,

        /// Configuration-node path (defaults to the layout path)
        #[arg(long)]
        conf_path: Option<String>,
    },
}
