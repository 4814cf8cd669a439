//! apiscope CLI - drive the API debugging engine from a terminal
//!
//! Commands:
//! - `send <curl>`          send a request given as a curl command
//! - `history [limit]`      list recent history, newest first
//! - `import <file.json>`   import a request or collection document
//! - `export <request-id>`  print a stored request as JSON
//! - `collections`          list collections and their requests

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use apiscope::config::Config;
use apiscope::curl;
use apiscope::import_export::Imported;
use apiscope::network::transport;
use apiscope::{logging, DispatchEngine, ScriptResult, ScriptSandbox, Session, Store};

const USAGE: &str = "\
Usage: apiscope <command> [args]

Commands:
  send <curl>            Send a request given as a curl command
  history [limit]        Show recent history (default 20)
  import <file.json>     Import a request or collection
  export <request-id>    Print a stored request as JSON
  collections            List collections";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    let _guard = logging::init(&config)?;

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let store = Store::open(&config.database_path())
        .with_context(|| format!("Failed to open {}", config.database_path().display()))?;
    let engine = DispatchEngine::new(transport::for_host(config.embed_origin.clone()));
    let scripts = ScriptSandbox::new(Duration::from_millis(config.script_timeout_ms));
    let mut session = Session::open(store, engine, scripts)?;

    match command.as_str() {
        "send" => {
            let curl = curl_from_args(&args[1..]);
            if curl.trim().is_empty() {
                bail!("send needs a curl command");
            }
            send(&mut session, &curl).await
        }
        "history" => {
            let limit = match args.get(1) {
                Some(n) => n.parse().with_context(|| format!("Invalid limit `{}`", n))?,
                None => 20,
            };
            history(&session, limit)
        }
        "import" => {
            let path = args.get(1).context("import needs a file path")?;
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path))?;
            match session.import_json(&text)? {
                Imported::Request(request) => {
                    println!("Imported request {} ({})", request.name, request.id)
                }
                Imported::Collection(collection, requests) => println!(
                    "Imported collection {} with {} requests ({})",
                    collection.name,
                    requests.len(),
                    collection.id
                ),
            }
            Ok(())
        }
        "export" => {
            let id = args.get(1).context("export needs a request id")?;
            println!("{}", session.export_request(id)?);
            Ok(())
        }
        "collections" => collections(&session),
        other => bail!("Unknown command `{}`\n\n{}", other, USAGE),
    }
}

/// One argument is taken as a whole curl command line. Several arguments
/// were already split by the shell, so each is quoted back into one token.
fn curl_from_args(args: &[String]) -> String {
    match args {
        [single] => single.clone(),
        _ => args
            .iter()
            .map(|arg| if arg == "curl" { arg.clone() } else { curl::shell_quote(arg) })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// Send one request; Ctrl-C cancels it.
async fn send(session: &mut Session, curl: &str) -> Result<()> {
    let request = session.import_curl(curl)?;
    let cancel = CancellationToken::new();

    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let report = session.send(&request, cancel).await;
    watcher.abort();
    let report = report?;

    print_script("pre-request", report.pre_script.as_ref());
    match &report.outcome {
        Ok(response) => {
            println!(
                "{} {}  {} ms  {} bytes",
                response.status, response.status_text, response.response_time_ms, response.size_bytes
            );
            for (key, value) in &response.headers {
                println!("{}: {}", key, value);
            }
            println!();
            println!("{}", pretty(&response.body));
        }
        Err(error) => println!("{}", error),
    }
    print_script("post-response", report.post_script.as_ref());
    Ok(())
}

fn print_script(phase: &str, result: Option<&ScriptResult>) {
    let Some(result) = result else { return };
    for line in &result.output {
        println!("[{}] {}", phase, line);
    }
    if let Some(error) = &result.error {
        println!("[{}] failed: {}", phase, error);
    }
}

fn pretty(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| body.to_string())
}

fn history(session: &Session, limit: usize) -> Result<()> {
    for entry in session.history(limit, 0)? {
        let outcome = match (&entry.status, &entry.error) {
            (Some(status), _) => status.to_string(),
            (None, Some(error)) => error.code.clone(),
            (None, None) => "-".to_string(),
        };
        println!(
            "{}  {:<7} {:<16} {:>6} ms  {}",
            entry.executed_at.format("%Y-%m-%d %H:%M:%S"),
            entry.method.as_str(),
            outcome,
            entry.response_time_ms,
            entry.url
        );
    }
    Ok(())
}

fn collections(session: &Session) -> Result<()> {
    for collection in session.store().get_all_collections()? {
        println!("{} ({})", collection.name, collection.id);
        for request in session.store().get_requests_by_collection(&collection.id)? {
            println!("  {:<7} {}  {} ({})", request.method.as_str(), request.name, request.url, request.id);
        }
    }
    Ok(())
}
