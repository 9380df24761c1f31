use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "fwforge", about = "Firewall policy compiler", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compile a firewall's rule sets into packet-filter configuration.
    Compile(CompileArgs),
    /// Dump the loaded object tree.
    Inspect(InspectArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Iptables,
    IptablesRestore,
    IptablesRestoreEcho,
    Nftables,
}

#[derive(Debug, Parser)]
pub struct CompileArgs {
    /// Object graph document (YAML).
    pub graph: PathBuf,

    /// Name of the firewall object to compile.
    #[arg(short, long)]
    pub firewall: String,

    /// Target backend.
    #[arg(short, long, value_enum, default_value_t = Backend::Iptables)]
    pub backend: Backend,

    /// Write the result here instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Trace one policy rule (by position) through every stage.
    #[arg(long, value_name = "N")]
    pub debug_policy_rule: Option<usize>,

    /// Trace one NAT rule (by position) through every stage.
    #[arg(long, value_name = "N")]
    pub debug_nat_rule: Option<usize>,

    /// Trace one routing rule (by position) through every stage.
    #[arg(long, value_name = "N")]
    pub debug_routing_rule: Option<usize>,
}

#[derive(Debug, Parser)]
pub struct InspectArgs {
    /// Object graph document (YAML).
    pub graph: PathBuf,
}
