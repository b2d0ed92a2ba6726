use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::Path;
use std::time::Instant;

mod cli;
mod config;
mod convert;
mod error;
mod graph;
mod patch;
mod provision;
mod provisioners;
mod secrets;
mod state;
mod template;
mod util;
mod workload;

use cli::{
    AddProvisionerArgs, Command, GenerateArgs, InitArgs, ProvisionersCommand, ResourcesCommand,
    RootArgs,
};
use config::EngineConfig;
use provisioners::{add_provisioner, remove_provisioner, resolve_binary, Dispatch, Provisioner};
use state::{ResourceUid, State, StateDirectory};
use util::{mask, write_atomic};

const SAMPLE_WORKLOAD: &str = r#"apiVersion: score.dev/v1b1
metadata:
  name: example
containers:
  main:
    image: stefanprodan/podinfo
service:
  ports:
    web:
      port: 8080
"#;

fn main() -> Result<()> {
    let root = RootArgs::parse();
    init_tracing(config::debug_enabled(root.debug));

    match &root.command {
        Command::Init(args) => cmd_init(&root, args),
        Command::Generate(args) => cmd_generate(&root, args),
        Command::Provisioners(command) => cmd_provisioners(&root, command),
        Command::Resources(command) => cmd_resources(&root, command),
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_state_dir(path: &Path) -> Result<StateDirectory> {
    StateDirectory::load(path)?.ok_or_else(|| {
        anyhow!(
            "state directory {} does not exist, run `score-fly init` first",
            path.display()
        )
    })
}

fn cmd_init(root: &RootArgs, args: &InitArgs) -> Result<()> {
    match StateDirectory::load(&root.state_dir)? {
        Some(sd) => {
            tracing::info!(dir = %sd.path.display(), "found existing state directory");
            if let Some(prefix) = &args.app_prefix {
                if prefix != &sd.state.extras.app_prefix {
                    bail!(
                        "--app-prefix cannot be changed after first init ('{}' != '{}')",
                        prefix,
                        sd.state.extras.app_prefix
                    );
                }
            }
        }
        None => {
            let prefix = args
                .app_prefix
                .as_deref()
                .ok_or_else(|| anyhow!("--app-prefix must be set on first init"))?;
            let sd = StateDirectory::new(root.state_dir.clone(), State::new(prefix));
            sd.persist().context("write new state directory")?;
            tracing::info!(dir = %sd.path.display(), "created state directory");
        }
    }

    if args.file.as_os_str().is_empty() {
        return Ok(());
    }
    if args.file.exists() {
        tracing::info!(file = %args.file.display(), "Score file already exists; leaving it alone");
        return Ok(());
    }
    write_atomic(&args.file, SAMPLE_WORKLOAD.as_bytes())?;
    tracing::info!(file = %args.file.display(), "created sample Score file");
    Ok(())
}

fn cmd_generate(root: &RootArgs, args: &GenerateArgs) -> Result<()> {
    let mut sd = load_state_dir(&root.state_dir)?;
    let overrides = workload::Overrides {
        file: args.overrides_file.clone(),
        properties: args.override_property.clone(),
    };
    if (args.image.is_some() || !overrides.is_empty()) && args.files.len() != 1 {
        bail!(
            "--image, --overrides-file and --override-property can only be used with exactly one Score file"
        );
    }

    let mut files = args.files.clone();
    files.sort();
    for file in &files {
        let mut spec = workload::load_workload_with(file, &overrides)?;
        workload::apply_image_override(&mut spec, args.image.as_deref())
            .with_context(|| format!("convert {}", file.display()))?;
        sd.state
            .with_workload(spec, Some(file.display().to_string()))
            .with_context(|| format!("add {} to the project", file.display()))?;
        tracing::info!(file = %file.display(), "added Score file to project");
    }
    if sd.state.workloads.is_empty() {
        bail!("project is empty, pass at least one Score file");
    }

    let config = EngineConfig::resolve(root.dispatch_timeout)?;
    // rejected plans leave state.json untouched
    let plan = provision::plan_provisioning(&sd.state).context("plan provisioning")?;
    tracing::info!(
        workloads = sd.state.workloads.len(),
        resources = plan.order().len(),
        "planned provisioning"
    );

    let start = Instant::now();
    let outcome = provision::execute_plan(&mut sd.state, plan, &config);
    let report = sd.persist_after(outcome).context("provision resources")?;
    tracing::info!(
        provisioned = report.provisioned.len(),
        orphans = report.orphans.len(),
        elapsed_ms = start.elapsed().as_millis(),
        "provisioning complete; state persisted"
    );

    for name in sd.state.workloads.keys() {
        let manifest = convert::workload_manifest(&sd.state, name)
            .with_context(|| format!("convert workload '{name}'"))?;
        let toml_path = args.output_dir.join(format!("{name}.fly.toml"));
        write_atomic(&toml_path, manifest.to_toml()?.as_bytes())?;

        let secrets_path = args.output_dir.join(format!("{name}.secrets.json"));
        if manifest.secrets.is_empty() {
            if secrets_path.exists() {
                fs::remove_file(&secrets_path)
                    .with_context(|| format!("remove stale {}", secrets_path.display()))?;
            }
        } else {
            let mut text = serde_json::to_string_pretty(&manifest.secrets)
                .context("serialize runtime secrets")?;
            text.push('\n');
            write_atomic(&secrets_path, text.as_bytes())?;
            tracing::info!(
                workload = %name,
                count = manifest.secrets.len(),
                file = %secrets_path.display(),
                "wrote runtime secrets"
            );
        }
        println!("{}", toml_path.display());
    }
    Ok(())
}

fn cmd_provisioners(root: &RootArgs, command: &ProvisionersCommand) -> Result<()> {
    let mut sd = load_state_dir(&root.state_dir)?;
    match command {
        ProvisionersCommand::Add(args) => {
            let provisioner = provisioner_from_args(args)?;
            let summary = provisioner.describe();
            add_provisioner(&mut sd.state.extras.provisioners, provisioner)?;
            sd.persist()?;
            println!("{summary}");
        }
        ProvisionersCommand::List => {
            for provisioner in &sd.state.extras.provisioners {
                println!("{}", provisioner.describe());
            }
        }
        ProvisionersCommand::Remove { id } => {
            if !remove_provisioner(&mut sd.state.extras.provisioners, id) {
                bail!("no provisioner with id '{id}'");
            }
            sd.persist()?;
            tracing::info!(id = %id, "removed provisioner");
        }
    }
    Ok(())
}

fn provisioner_from_args(args: &AddProvisionerArgs) -> Result<Provisioner> {
    let dispatch = match (
        &args.dispatch.static_json,
        &args.dispatch.cmd_binary,
        &args.dispatch.http_url,
    ) {
        (Some(raw), None, None) => {
            let value: Value = serde_json::from_str(raw).context("parse --static-json")?;
            let Value::Object(values) = value else {
                bail!("--static-json must be a JSON object");
            };
            Dispatch::Static { values }
        }
        (None, Some(binary), None) => {
            let binary = resolve_binary(binary)?.display().to_string();
            let args = match &args.cmd_args {
                Some(raw) => shell_words::split(raw).context("parse --cmd-args")?,
                None => Vec::new(),
            };
            Dispatch::Cmd { binary, args }
        }
        (None, None, Some(url)) => Dispatch::Http { url: url.clone() },
        _ => bail!("exactly one of --static-json, --cmd-binary or --http-url is required"),
    };
    Ok(Provisioner {
        id: args.id.clone(),
        resource_type: args.resource_type.clone(),
        resource_class: args.res_class.clone().unwrap_or_default(),
        resource_id: args.res_id.clone().unwrap_or_default(),
        dispatch,
    })
}

fn cmd_resources(root: &RootArgs, command: &ResourcesCommand) -> Result<()> {
    let mut sd = load_state_dir(&root.state_dir)?;
    match command {
        ResourcesCommand::List { json } => {
            let rows: Vec<Value> = sd
                .state
                .resources
                .iter()
                .map(|(uid, resource)| {
                    json!({
                        "uid": uid,
                        "type": resource.res_type,
                        "class": resource.class,
                        "id": resource.id,
                        "source_workload": resource.source_workload,
                        "provisioner": resource.provisioner,
                        "outputs": resource.outputs,
                        "secrets": masked(&resource.secrets),
                    })
                })
                .collect();
            if *json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(());
            }
            for (uid, resource) in &sd.state.resources {
                let owner = if resource.is_orphaned() {
                    "(orphaned)"
                } else {
                    resource.source_workload.as_str()
                };
                let mut outputs = resource.outputs.clone();
                outputs.extend(masked(&resource.secrets));
                let provisioner = if resource.provisioner.is_empty() {
                    "-"
                } else {
                    resource.provisioner.as_str()
                };
                println!("{uid}\t{owner}\t{provisioner}\t{}", Value::Object(outputs));
            }
        }
        ResourcesCommand::Deprovision { uid } => {
            let config = EngineConfig::resolve(root.dispatch_timeout)?;
            let uid = ResourceUid::from(uid.as_str());
            let outcome = provision::deprovision_resource(&mut sd.state, &uid, &config);
            sd.persist_after(outcome)
                .with_context(|| format!("deprovision {uid}"))?;
            println!("{uid}");
        }
    }
    Ok(())
}

fn masked(secrets: &Map<String, Value>) -> Map<String, Value> {
    secrets
        .iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), Value::String(mask(&text)))
        })
        .collect()
}
