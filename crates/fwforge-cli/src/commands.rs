use crate::args::{Backend, Cli, Command, CompileArgs, InspectArgs};
use anyhow::{bail, Context};
use fwforge_compiler::{CompileStatus, DebugFilter, Driver, OutputFormat, RuleSetKind};
use fwforge_model::{yaml, ObjectKind, ObjectStore};

/// Exit codes: 0 clean, 1 compiled with errors, 2 fatal.
pub fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Compile(args) => compile(args),
        Command::Inspect(args) => inspect(args),
    }
}

fn debug_filter(args: &CompileArgs) -> anyhow::Result<Option<DebugFilter>> {
    let filters: Vec<DebugFilter> = [
        (RuleSetKind::Policy, args.debug_policy_rule),
        (RuleSetKind::Nat, args.debug_nat_rule),
        (RuleSetKind::Routing, args.debug_routing_rule),
    ]
    .into_iter()
    .filter_map(|(kind, position)| position.map(|position| DebugFilter { kind, position }))
    .collect();
    if filters.len() > 1 {
        bail!("only one --debug-*-rule flag can be given at a time");
    }
    Ok(filters.into_iter().next())
}

fn compile(args: CompileArgs) -> anyhow::Result<i32> {
    let store = yaml::load_file(&args.graph)
        .with_context(|| format!("failed to load {}", args.graph.display()))?;
    let fw = store
        .find_by_name(&args.firewall)
        .with_context(|| format!("no object named '{}'", args.firewall))?;
    if !matches!(store.get(fw).kind, ObjectKind::Firewall { .. }) {
        bail!("object '{}' is not a firewall", args.firewall);
    }

    let format = match args.backend {
        Backend::Iptables => OutputFormat::IptablesScript,
        Backend::IptablesRestore => OutputFormat::IptablesRestore,
        Backend::IptablesRestoreEcho => OutputFormat::IptablesRestoreEcho,
        Backend::Nftables => OutputFormat::Nftables,
    };

    let out = Driver::new(&store, fw, format)
        .with_debug(debug_filter(&args)?)
        .run()?;

    match &args.output {
        Some(path) => std::fs::write(path, &out.text)
            .with_context(|| format!("cannot write {}", path.display()))?,
        None => print!("{}", out.text),
    }

    match out.status {
        CompileStatus::Ok => Ok(0),
        CompileStatus::Warnings => {
            tracing::warn!(warnings = out.warnings, "compiled with warnings");
            Ok(0)
        }
        CompileStatus::Errors => {
            eprintln!(
                "compiled with {} error(s), {} warning(s)",
                out.errors, out.warnings
            );
            Ok(1)
        }
    }
}

fn inspect(args: InspectArgs) -> anyhow::Result<i32> {
    let store = yaml::load_file(&args.graph)
        .with_context(|| format!("failed to load {}", args.graph.display()))?;
    for obj in store.iter().filter(|o| o.parent.is_none()) {
        print_tree(&store, obj.id, 0);
    }
    Ok(0)
}

fn print_tree(store: &ObjectStore, id: fwforge_model::ObjectId, depth: usize) {
    let obj = store.get(id);
    println!("{}{} [{}]", "  ".repeat(depth), obj.name, obj.kind.tag());
    for child in &obj.children {
        print_tree(store, *child, depth + 1);
    }
}
