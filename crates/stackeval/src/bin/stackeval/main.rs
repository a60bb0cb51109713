mod cli;

use hcl::eval::Evaluate;
use indexmap::IndexMap;
use stackeval::config::StackConfig;
use stackeval::diagnostics::Diagnostics;
use stackeval::engine::Main;
use stackeval::phase::EvalPhase;
use stackeval::promising::CancelToken;
use stackeval::value::Value;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    use clap::Parser;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("STACKEVAL_LOG"))
        .with_writer(std::io::stderr)
        .init();

    for new_path in cli.directory.iter() {
        match new_path.canonicalize() {
            Err(e) => {
                eprintln!(
                    "Failed to resolve path for -C/--directory {}\n{}",
                    new_path.display(),
                    e
                );
                std::process::exit(1);
            }
            Ok(cwd) => {
                if let Err(err) = std::env::set_current_dir(&cwd) {
                    eprintln!("Failed to set work directory to {}\n{}", cwd.display(), err,);
                    std::process::exit(1);
                }

                tracing::info!(directory=%cwd.display(), "Changed working directory");
            }
        }
    }

    let command_result = match cli.command {
        cli::Command::Validate(validate_cli) => validate(validate_cli).await,
        cli::Command::Plan(plan_cli) => plan(plan_cli).await,
        cli::Command::Dev(dev_cli) => dev(dev_cli),
    };

    if let Err(e) = command_result {
        for error in e.chain() {
            eprintln!("{error}")
        }
        std::process::exit(1);
    }
}

pub async fn validate(cli: cli::ValidateCommand) -> anyhow::Result<()> {
    let config = StackConfig::new(&load(&cli.input)?)?;
    let main = Arc::new(Main::new(config));

    let diags = stackeval::walk::validate_all(Arc::clone(&main), cancel_on_interrupt()).await?;
    report(&diags)?;

    let outputs = main
        .root_stack()
        .output_values_object(&main, EvalPhase::Validate)
        .await?;
    output(&cli.output, &outputs)
}

pub async fn plan(cli: cli::PlanCommand) -> anyhow::Result<()> {
    let config = StackConfig::new(&load(&cli.input)?)?;

    let mut root_inputs = IndexMap::new();
    for (name, source) in &cli.vars {
        root_inputs.insert(name.clone(), constant(source)?);
    }
    let main = Arc::new(Main::new(config).with_root_input_values(EvalPhase::Plan, root_inputs));

    let (changes, diags) =
        stackeval::walk::plan_all(Arc::clone(&main), cancel_on_interrupt()).await?;
    report(&diags)?;
    tracing::info!(changes = changes.len(), "planned");

    let outputs = main
        .root_stack()
        .output_values_object(&main, EvalPhase::Plan)
        .await?;
    output(&cli.output, &outputs)
}

/// A token canceled by the first ctrl-c
fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, canceling");
            on_interrupt.cancel();
        }
    });
    cancel
}

/// Prints all diagnostics, failing if any of them is an error
fn report(diags: &Diagnostics) -> anyhow::Result<()> {
    for diag in diags.iter() {
        eprintln!("{diag}\n");
    }

    let errors = diags.errors().count();
    anyhow::ensure!(errors == 0, "{errors} error(s) found");
    Ok(())
}

fn constant(source: &str) -> anyhow::Result<Value> {
    let expr: hcl_edit::expr::Expression = source.parse()?;
    let expr: hcl::Expression = expr.into();
    let value = expr.evaluate(&hcl::eval::Context::new())?;
    Ok(value.into())
}

fn load(input: &cli::InputArgs) -> anyhow::Result<stackeval::hcl_documents::HclDocuments> {
    let mut documents = stackeval::hcl_documents::HclDocuments::default();

    if !input.workdir && input.files.is_empty() && input.directories.is_empty() {
        let stdin = std::io::read_to_string(std::io::stdin())?;
        documents.parse_str(&stdin, None::<std::path::PathBuf>)?;
        return Ok(documents);
    }

    if input.workdir {
        documents.load_directory(&std::env::current_dir()?)?;
    }

    for file_path in &input.files {
        documents.load_file(file_path)?;
    }

    for dir_path in &input.directories {
        documents.load_directory(dir_path)?;
    }

    anyhow::ensure!(documents.source_count() > 0, "No files loaded");

    Ok(documents)
}

fn output(output: &cli::OutputArgs, value: &Value) -> anyhow::Result<()> {
    match output.format {
        cli::OutputFormat::Yaml => serde_yaml::to_writer(std::io::stdout(), value)?,
        cli::OutputFormat::Json => serde_json::to_writer_pretty(std::io::stdout(), value)?,
    };

    Ok(())
}

/// (stackeval-)developer utilities
///
/// A quick way to expose internal structures for debugging purposes
pub fn dev(cli: cli::DevCommand) -> anyhow::Result<()> {
    use cli::DevSubCommand::*;

    let documents = load(&cli.input)?;

    match cli.command {
        Documents => println!("{documents:#?}"),
        Config => println!("{:#?}", StackConfig::new(&documents)?),
    }

    Ok(())
}
