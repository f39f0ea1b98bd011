//! CLI command definitions using clap.
//!
//! Group management (`register-tool-set`, `unregister-tool`, `list-tools`,
//! `clear-tools`, `register-trigger`), run and sample control
//! (`tool-meister-start`, `start-tools`, `stop-tools`, `tool-meister-client`,
//! `tool-meister-stop`, `watch-triggers`), results (`assemble`, `package`) and
//! the per-host `meister` daemon.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Toolmeister - synchronized benchmark tool collection across hosts
#[derive(Parser, Debug)]
#[command(name = "toolmeister")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Identifies one sample of a run
#[derive(Args, Debug, Clone)]
pub struct SampleArgs {
    /// Run name
    #[arg(short, long)]
    pub run: String,

    /// Benchmark iteration
    #[arg(short, long, default_value_t = 1)]
    pub iteration: u32,

    /// Sample number within the iteration
    #[arg(short, long, default_value_t = 1)]
    pub sample: u32,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
    Start,
    Stop,
    Collect,
    Status,
    Terminate,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    #[default]
    Substring,
    Regex,
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register tools on hosts in a group
    RegisterToolSet {
        /// Tools to register
        #[arg(required = true)]
        tools: Vec<String>,

        /// Tool group
        #[arg(short, long, default_value = "default")]
        group: String,

        /// Host to register on; repeat for several
        #[arg(long = "remote", required = true)]
        remotes: Vec<String>,

        /// Tool parameter as key=value; repeat for several
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Replace existing bindings
        #[arg(long)]
        force: bool,

        /// Label for the hosts
        #[arg(long)]
        label: Option<String>,
    },

    /// Remove one tool binding
    UnregisterTool {
        tool: String,

        #[arg(short, long, default_value = "default")]
        group: String,

        #[arg(long)]
        remote: String,
    },

    /// List groups and their bindings
    ListTools {
        /// Only this group
        #[arg(short, long)]
        group: Option<String>,

        /// List the tool catalog instead
        #[arg(long)]
        catalog: bool,
    },

    /// Delete a tool group
    ClearTools {
        #[arg(short, long, default_value = "default")]
        group: String,
    },

    /// Set the start/stop patterns for a group
    RegisterTrigger {
        #[arg(short, long, default_value = "default")]
        group: String,

        /// Pattern that starts a sample
        #[arg(long)]
        start: String,

        /// Pattern that stops a sample
        #[arg(long)]
        stop: String,

        #[arg(long, value_enum, default_value_t = MatchMode::Substring)]
        mode: MatchMode,
    },

    /// Begin a run: register tools on every host, archive the group, gather sysinfo, write metadata
    ToolMeisterStart {
        /// Run name; `<group>_<timestamp>` when omitted
        run: Option<String>,

        #[arg(short, long, default_value = "default")]
        group: String,

        /// Comma-separated sysinfo items, overrides the config
        #[arg(long, value_delimiter = ',')]
        sysinfo: Option<Vec<String>>,
    },

    /// Start tools for a sample
    StartTools {
        #[command(flatten)]
        sample: SampleArgs,

        #[arg(short, long, default_value = "default")]
        group: String,
    },

    /// Stop tools for a sample and collect their output
    StopTools {
        #[command(flatten)]
        sample: SampleArgs,

        /// Leave output on the hosts
        #[arg(long)]
        no_collect: bool,
    },

    /// Send one action to every host of a group
    ToolMeisterClient {
        #[arg(value_enum)]
        action: ClientAction,

        #[arg(short, long, default_value = "default")]
        group: String,

        /// Run name, required for start/stop/collect
        #[arg(short, long)]
        run: Option<String>,

        #[arg(short, long, default_value_t = 1)]
        iteration: u32,

        #[arg(short, long, default_value_t = 1)]
        sample: u32,
    },

    /// End a run
    ToolMeisterStop {
        run: String,

        /// Also shut the meisters down
        #[arg(long)]
        terminate: bool,
    },

    /// Start and stop samples from trigger matches on stdin
    WatchTriggers {
        #[arg(short, long, default_value = "default")]
        group: String,

        #[arg(short, long)]
        run: String,

        #[arg(short, long, default_value_t = 1)]
        iteration: u32,

        /// Leave output on the hosts after each stop
        #[arg(long)]
        no_collect: bool,
    },

    /// Assemble a stopped sample from staged output
    Assemble {
        #[command(flatten)]
        sample: SampleArgs,
    },

    /// Tar and checksum a run's result tree
    Package { run: String },

    /// Run the per-host Tool Meister
    Meister {
        /// Listen address, overrides the config
        #[arg(long)]
        listen: Option<String>,

        /// Host name reported to the controller
        #[arg(long)]
        hostname: Option<String>,

        /// Where tools write raw output
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}
