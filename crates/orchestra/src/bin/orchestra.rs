//! Orchestra CLI
//!
//! Usage:
//!   orchestra orchestra.yaml
//!   orchestra orchestra.yaml --mode run-serial
//!   orchestra orchestra.yaml --validate

use orchestra::cli::orchestrate;
use orchestra::{Callbacks, CliError, ColorCycle, Manager, OrchestraArgs, OrchestraFile, Service};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let args: OrchestraArgs = argh::from_env();

    // Initialize logging
    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    if let Err(e) = run(args).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: OrchestraArgs) -> Result<(), CliError> {
    log::info!("Loading orchestra file: {}", args.file);
    let file = OrchestraFile::from_file(&args.file)?;

    // Validate only mode
    if args.validate {
        println!("Orchestra file '{}' is valid", args.file);
        println!("  Version: {}", file.version);
        println!("  Services: {}", file.services.len());
        for (name, service) in &file.services {
            println!(
                "    {} (prepare: {}, start: {})",
                name,
                service.prepare.is_some(),
                service.start.is_some()
            );
        }
        return Ok(());
    }

    let colors = (!args.no_color).then(ColorCycle::default);
    let manager = Manager::new(args.file.clone());
    let callbacks = Callbacks::default()
        .with_status_changed(|svc| log::info!("[{}] {}", svc.name(), svc.status()));
    manager.add_services(
        file.shell_services(colors.as_ref())
            .into_iter()
            .map(|service| Arc::new(service) as Arc<dyn Service>),
        callbacks,
    );

    // Count Ctrl+C presses: the first one stops gracefully, later ones force
    let (interrupt_tx, interrupt_rx) = watch::channel(0u32);
    ctrlc::set_handler(move || {
        interrupt_tx.send_modify(|count| *count += 1);
    })?;

    log::info!("Running {} service(s) in '{}' mode", manager.services().len(), args.mode);
    orchestrate(&manager, args.mode, interrupt_rx).await?;
    log::info!("Orchestra exiting");
    Ok(())
}
