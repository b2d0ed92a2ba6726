//! CLI argument parsing for score-fly.
//!
//! Every command works against one state directory; `generate` is the only
//! command that dispatches provisioners for the whole project.
use crate::state::DEFAULT_STATE_DIR;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "score-fly",
    version,
    about = "Provision Score workload resources and generate Fly app configs",
    after_help = "Examples:\n  score-fly init --app-prefix acme-\n  score-fly provisioners add pg postgres --cmd-binary ./provision-pg.sh\n  score-fly generate score.yaml --image registry.fly.io/web:latest\n  score-fly generate score.yaml --override-property containers.main.variables.MODE=prod\n  score-fly resources list\n  score-fly resources deprovision postgres.default#web.db",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Project state directory
    #[arg(long, global = true, value_name = "DIR", default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Upper bound in seconds for a single provisioner call
    #[arg(long, global = true, value_name = "SECS")]
    pub dispatch_timeout: Option<u64>,

    /// Enable debug logging; also enabled by SCORE_FLY_DEBUG=true (RUST_LOG wins)
    #[arg(long, short = 'd', global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Init(InitArgs),
    Generate(GenerateArgs),
    /// Manage the provisioner registry
    #[command(subcommand)]
    Provisioners(ProvisionersCommand),
    /// Inspect and deprovision resources
    #[command(subcommand)]
    Resources(ResourcesCommand),
}

#[derive(Parser, Debug)]
#[command(about = "Create the state directory and a sample Score file")]
pub struct InitArgs {
    /// Prefix added to workload names to form Fly app names (required on first init)
    #[arg(long, value_name = "PREFIX")]
    pub app_prefix: Option<String>,

    /// Sample Score file to create if missing; pass an empty value to skip
    #[arg(long, short = 'f', value_name = "PATH", default_value = "score.yaml")]
    pub file: PathBuf,
}

#[derive(Parser, Debug)]
#[command(about = "Add workloads, provision their resources, and write Fly configs")]
pub struct GenerateArgs {
    /// Score workload files to add to the project
    #[arg(value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Image for containers declared with image '.'
    #[arg(long, value_name = "IMAGE")]
    pub image: Option<String>,

    /// YAML file merged into the Score file before it is validated
    #[arg(long, value_name = "FILE")]
    pub overrides_file: Option<PathBuf>,

    /// Set (path=value) or remove (path=) a property of the Score file
    #[arg(long, value_name = "PATH=VALUE")]
    pub override_property: Vec<String>,

    /// Directory receiving <workload>.fly.toml and <workload>.secrets.json
    #[arg(long, short = 'o', value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum ProvisionersCommand {
    /// Register a provisioner ahead of existing ones
    Add(AddProvisionerArgs),
    /// List provisioners in match precedence order
    List,
    /// Remove a provisioner by id
    Remove {
        #[arg(value_name = "ID")]
        id: String,
    },
}

#[derive(Parser, Debug)]
pub struct AddProvisionerArgs {
    #[arg(value_name = "ID")]
    pub id: String,

    /// Resource type to match
    #[arg(value_name = "TYPE")]
    pub resource_type: String,

    /// Resource class to match (any when omitted)
    #[arg(long, value_name = "CLASS")]
    pub res_class: Option<String>,

    /// Resource id to match (any when omitted)
    #[arg(long, value_name = "ID")]
    pub res_id: Option<String>,

    #[command(flatten)]
    pub dispatch: DispatchArgs,

    /// Extra arguments for --cmd-binary, shell-quoted
    #[arg(long, value_name = "ARGS", requires = "cmd_binary")]
    pub cmd_args: Option<String>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct DispatchArgs {
    /// Fixed outputs as a JSON object
    #[arg(long, value_name = "JSON")]
    pub static_json: Option<String>,

    /// Executable receiving the request on stdin
    #[arg(long, value_name = "BIN")]
    pub cmd_binary: Option<String>,

    /// Endpoint receiving the request as a POST body
    #[arg(long, value_name = "URL")]
    pub http_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ResourcesCommand {
    /// List resources with outputs (secrets masked)
    List {
        /// Emit machine-readable JSON output
        #[arg(long)]
        json: bool,
    },
    /// Deprovision a resource and remove it from the state
    Deprovision {
        #[arg(value_name = "UID")]
        uid: String,
    },
}
