use std::io::{self, BufRead, Write};

use tracing::{info, warn};
use uuid::Uuid;
use wavelane_core::{
    CommandDispatch, DocumentId, diagnostics::init_tracing_with_options, spawn_event_logger,
};
use wavelane_host::{Host, config::AppConfig};

fn print_documents(host: &Host) {
    let active = host.session().active_document();
    for document in host.session().documents() {
        let marker = if Some(document.id) == active { '*' } else { ' ' };
        let dirty = if document.dirty { " (modified)" } else { "" };
        println!(
            "{marker} {} {} [{}]{dirty}",
            document.id,
            document.display_name,
            document.kind()
        );
    }
}

fn handle_line(host: &Host, line: &str) -> bool {
    let (verb, argument) = line
        .split_once(' ')
        .map_or((line, ""), |(verb, rest)| (verb, rest.trim()));
    match verb {
        "" => true,
        "quit" | "exit" => false,
        "help" => {
            println!("commands: {}", host.command_ids().join(", "));
            println!("also: open <path>, activate <id>, list, templates, quit");
            true
        }
        "list" => {
            print_documents(host);
            true
        }
        "templates" => {
            match host.session().list_templates() {
                Ok(names) => names.iter().for_each(|name| println!("{name}")),
                Err(error) => warn!(%error, "failed to list templates"),
            }
            true
        }
        "open" => {
            println!("{}", host.open(argument));
            true
        }
        "activate" => {
            let activated = Uuid::parse_str(argument)
                .map_err(|error| error.to_string())
                .and_then(|uuid| {
                    host.session()
                        .activate(DocumentId(uuid))
                        .map_err(|error| error.to_string())
                });
            if let Err(error) = &activated {
                warn!(%error, "activate failed");
            }
            println!("{}", activated.is_ok());
            true
        }
        command => {
            println!("{}", host.invoke(command));
            true
        }
    }
}

fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_default()?;
    let _telemetry = init_tracing_with_options(
        &config.paths.logs_dir,
        &config.diagnostics.trace_file_prefix,
        &config.diagnostics.rust_log_filter,
    )?;
    let host = Host::new(config);
    let _event_log = spawn_event_logger(host.session().subscribe())?;
    info!(commands = host.command_ids().len(), "wavelane host ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        if !handle_line(&host, line?.trim()) {
            break;
        }
        stdout.flush()?;
    }
    info!("wavelane host shutting down");
    Ok(())
}
