//! REPL – interactive console over the in-process loopback bus.
//!
//! Supported slash-commands:
//!   /register <agent> <location>  – watch a location on behalf of an agent
//!   /unregister <agent>           – stop watching
//!   /snapshot <json-file>         – publish a VEHICLELIST payload
//!   /delta <json-file>            – publish a VEHICLELISTDELTA payload
//!   /respond <agent>              – publish BOOKING_RESPONSE on the agent's channel
//!   /nearest <lat> <lon> [k]      – query the vehicle index
//!   /status                       – scanner and watcher summary
//!   /ledger                       – recorded reservation attempts
//!   /help                         – show this list
//!   /quit | /exit                 – leave the console

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Runtime;

use carscout_middleware::{ChannelScheme, LoopbackSession, MessageBus};
use carscout_runtime::ScannerHandle;
use carscout_types::{AgentId, BOOKING_RESPONSE, LocationId};

/// A parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Help,
    Register { agent: AgentId, location: LocationId },
    Unregister { agent: AgentId },
    Snapshot(PathBuf),
    Delta(PathBuf),
    Respond { agent: AgentId },
    Nearest { latitude: f64, longitude: f64, k: usize },
    Status,
    Ledger,
    Quit,
}

/// Parse one console line.
pub fn parse(line: &str) -> Result<ConsoleCommand, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();
    let arity = |n: usize, usage: &str| -> Result<(), String> {
        if args.len() == n {
            Ok(())
        } else {
            Err(format!("usage: {usage}"))
        }
    };

    match head {
        "/help" => Ok(ConsoleCommand::Help),
        "/status" => Ok(ConsoleCommand::Status),
        "/ledger" => Ok(ConsoleCommand::Ledger),
        "/quit" | "/exit" => Ok(ConsoleCommand::Quit),
        "/register" => {
            arity(2, "/register <agent> <location>")?;
            Ok(ConsoleCommand::Register {
                agent: args[0].into(),
                location: args[1].into(),
            })
        }
        "/unregister" => {
            arity(1, "/unregister <agent>")?;
            Ok(ConsoleCommand::Unregister {
                agent: args[0].into(),
            })
        }
        "/respond" => {
            arity(1, "/respond <agent>")?;
            Ok(ConsoleCommand::Respond {
                agent: args[0].into(),
            })
        }
        "/snapshot" => {
            arity(1, "/snapshot <json-file>")?;
            Ok(ConsoleCommand::Snapshot(PathBuf::from(args[0])))
        }
        "/delta" => {
            arity(1, "/delta <json-file>")?;
            Ok(ConsoleCommand::Delta(PathBuf::from(args[0])))
        }
        "/nearest" => {
            const USAGE: &str = "usage: /nearest <lat> <lon> [k]";
            if !(2..=3).contains(&args.len()) {
                return Err(USAGE.to_string());
            }
            let latitude = args[0].parse::<f64>().map_err(|_| USAGE.to_string())?;
            let longitude = args[1].parse::<f64>().map_err(|_| USAGE.to_string())?;
            let k = match args.get(2) {
                Some(k) => k.parse::<usize>().map_err(|_| USAGE.to_string())?,
                None => 1,
            };
            Ok(ConsoleCommand::Nearest {
                latitude,
                longitude,
                k,
            })
        }
        other => Err(format!("unknown command '{other}'")),
    }
}

/// Console state: the running scanner plus the agent sessions created from
/// the prompt.
pub struct Console<'a> {
    runtime: &'a Runtime,
    scanner: &'a ScannerHandle,
    bus: MessageBus,
    channels: ChannelScheme,
    sessions: BTreeMap<AgentId, Arc<LoopbackSession>>,
}

impl<'a> Console<'a> {
    pub fn new(
        runtime: &'a Runtime,
        scanner: &'a ScannerHandle,
        bus: MessageBus,
        channels: ChannelScheme,
    ) -> Self {
        Self {
            runtime,
            scanner,
            bus,
            channels,
            sessions: BTreeMap::new(),
        }
    }

    /// Execute one command.  Returns `false` when the console should exit.
    pub fn execute(&mut self, command: ConsoleCommand) -> bool {
        match command {
            ConsoleCommand::Help => cmd_help(),
            ConsoleCommand::Register { agent, location } => self.cmd_register(agent, location),
            ConsoleCommand::Unregister { agent } => self.cmd_unregister(agent),
            ConsoleCommand::Snapshot(path) => self.cmd_publish_file(&self.channels.vehicle_list(), &path),
            ConsoleCommand::Delta(path) => self.cmd_publish_file(&self.channels.vehicle_delta(), &path),
            ConsoleCommand::Respond { agent } => self.cmd_respond(&agent),
            ConsoleCommand::Nearest {
                latitude,
                longitude,
                k,
            } => self.cmd_nearest(latitude, longitude, k),
            ConsoleCommand::Status => self.cmd_status(),
            ConsoleCommand::Ledger => self.cmd_ledger(),
            ConsoleCommand::Quit => {
                println!("{}", "Goodbye.".green());
                return false;
            }
        }
        true
    }

    fn cmd_register(&mut self, agent: AgentId, location: LocationId) {
        let session = Arc::new(LoopbackSession::new(self.bus.clone(), agent.clone()));
        match self
            .runtime
            .block_on(self.scanner.register(session.clone(), location.clone()))
        {
            Ok(fresh) => {
                self.sessions.insert(agent.clone(), session);
                let verb = if fresh { "now watches" } else { "re-registered for" };
                println!("{} {} {} {}", "✓".green(), agent.to_string().bold(), verb, location.to_string().yellow());
            }
            Err(e) => println!("{}: {}", "Register failed".red(), e),
        }
    }

    fn cmd_unregister(&mut self, agent: AgentId) {
        match self.runtime.block_on(self.scanner.unregister(agent.clone())) {
            Ok(true) => println!("{} {} unregistered", "✓".green(), agent.to_string().bold()),
            Ok(false) => println!("{} '{}'", "Not registered:".yellow(), agent),
            Err(e) => println!("{}: {}", "Unregister failed".red(), e),
        }
    }

    fn cmd_publish_file(&self, channel: &str, path: &Path) {
        let payload = match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).map_err(|e| e.to_string()))
        {
            Ok(payload) => payload,
            Err(e) => {
                println!("{} {}: {}", "Cannot read".red(), path.display(), e);
                return;
            }
        };
        let before = self.published_counts();
        match self.bus.publish(channel, payload) {
            Ok(receivers) => {
                println!("  published on {} ({} subscriber(s))", channel.bold(), receivers);
                self.report_requests(&before);
            }
            Err(e) => println!("{}: {}", "Publish failed".red(), e),
        }
    }

    fn cmd_respond(&self, agent: &AgentId) {
        let channel = self.channels.private(agent);
        let payload = serde_json::json!({ "eventType": BOOKING_RESPONSE });
        match self.bus.publish(&channel, payload) {
            Ok(0) => println!("{} no pending exchange on {}", "!".yellow(), channel.bold()),
            Ok(_) => {
                println!("  {} sent on {}", BOOKING_RESPONSE, channel.bold());
                // Let the scanner act on the response before reporting.
                if self.runtime.block_on(self.scanner.status()).is_ok() {
                    if let Some(session) = self.sessions.get(agent) {
                        let closed = session.client().journal().closes > 0;
                        println!("  session closed: {}", if closed { "yes".green() } else { "no".dimmed() });
                    }
                }
            }
            Err(e) => println!("{}: {}", "Publish failed".red(), e),
        }
    }

    fn cmd_nearest(&self, latitude: f64, longitude: f64, k: usize) {
        match self.runtime.block_on(self.scanner.nearest(latitude, longitude, k)) {
            Ok(points) if points.is_empty() => println!("  {}", "no indexed vehicles".dimmed()),
            Ok(points) => {
                for p in points {
                    let metres = carscout_spatial::radians_to_metres(
                        carscout_spatial::central_angle_deg(latitude, longitude, p.latitude, p.longitude),
                    );
                    println!("    • {} ({:.5}, {:.5})  {:.0} m", p.id.bold(), p.latitude, p.longitude, metres);
                }
            }
            Err(e) => println!("{}: {}", "Query failed".red(), e),
        }
    }

    fn cmd_status(&self) {
        let status = match self.runtime.block_on(self.scanner.status()) {
            Ok(status) => status,
            Err(e) => {
                println!("{}: {}", "Status failed".red(), e);
                return;
            }
        };
        println!("{}", "Scanner".bold().underline());
        println!("  feed            : {}", status.feed_state.as_str().yellow());
        println!("  indexed vehicles: {}", status.indexed_vehicles);
        println!("  watchers        : {}", status.watchers);
        println!("  in flight       : {}", status.in_flight);
        println!("  dispatch        : {:?}", status.dispatch_mode);
        if !self.sessions.is_empty() {
            println!("{}", "Sessions".bold().underline());
            for (agent, session) in &self.sessions {
                let journal = session.client().journal();
                println!(
                    "  {}  requests sent: {}  closed: {}",
                    agent.to_string().bold(),
                    journal.published.len(),
                    if journal.closes > 0 { "yes".green() } else { "no".dimmed() }
                );
            }
        }
    }

    fn cmd_ledger(&self) {
        match self.runtime.block_on(self.scanner.ledger()) {
            Ok(entries) if entries.is_empty() => println!("  {}", "no attempts recorded".dimmed()),
            Ok(entries) => {
                for e in entries {
                    println!(
                        "  {}  {} → {} @ {}  [{}]{}",
                        e.requested_at.dimmed(),
                        e.agent_id.bold(),
                        e.vehicle_id,
                        e.location_id,
                        e.state.as_str().yellow(),
                        e.note.map(|n| format!("  {n}")).unwrap_or_default()
                    );
                }
            }
            Err(e) => println!("{}: {}", "Ledger unavailable".red(), e),
        }
    }

    fn published_counts(&self) -> BTreeMap<AgentId, usize> {
        self.sessions
            .iter()
            .map(|(agent, session)| (agent.clone(), session.client().journal().published.len()))
            .collect()
    }

    /// Print booking requests published by console sessions since `before`.
    fn report_requests(&self, before: &BTreeMap<AgentId, usize>) {
        // Round-trip through the scanner so it has processed the publish.
        if self.runtime.block_on(self.scanner.status()).is_err() {
            return;
        }
        for (agent, session) in &self.sessions {
            let skip = before.get(agent).copied().unwrap_or(0);
            for (channel, payload) in session.client().journal().published.into_iter().skip(skip) {
                println!("    {} {} {}", agent.to_string().bold(), channel.dimmed(), payload);
            }
        }
    }
}

/// Entry point for the interactive console.
///
/// `shutdown` is polled each iteration; when set the loop exits.
pub fn run(mut console: Console<'_>, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Cannot open console".red(), e);
            return;
        }
    };

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let line = match editor.readline("carscout> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };

        let cmd = line.trim();
        if cmd.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(cmd);

        match parse(cmd) {
            Ok(command) => {
                if !console.execute(command) {
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
            }
            Err(e) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                e.yellow(),
                "/help".bold()
            ),
        }
    }
}

fn cmd_help() {
    println!();
    println!("{}", "CarScout Commands".bold().underline());
    println!("  {}  – watch a location", "/register <agent> <location>".bold().cyan());
    println!("  {}           – stop watching", "/unregister <agent>".bold().cyan());
    println!("  {}         – publish a vehicle snapshot", "/snapshot <json-file>".bold().cyan());
    println!("  {}            – publish a vehicle delta", "/delta <json-file>".bold().cyan());
    println!("  {}              – conclude an agent's booking exchange", "/respond <agent>".bold().cyan());
    println!("  {}      – nearest indexed vehicles", "/nearest <lat> <lon> [k]".bold().cyan());
    println!("  {}                       – scanner summary", "/status".bold().cyan());
    println!("  {}                       – reservation attempts", "/ledger".bold().cyan());
    println!("  {}                 – exit", "/quit  /exit".bold().cyan());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_register() {
        assert_eq!(
            parse("/register w1 11").unwrap(),
            ConsoleCommand::Register {
                agent: "w1".into(),
                location: "11".into()
            }
        );
    }

    #[test]
    fn register_requires_two_arguments() {
        assert!(parse("/register w1").unwrap_err().starts_with("usage"));
    }

    #[test]
    fn parses_nearest_with_default_k() {
        assert_eq!(
            parse("/nearest 52.52 13.405").unwrap(),
            ConsoleCommand::Nearest {
                latitude: 52.52,
                longitude: 13.405,
                k: 1
            }
        );
        assert_eq!(
            parse("/nearest 52.52 13.405 3").unwrap(),
            ConsoleCommand::Nearest {
                latitude: 52.52,
                longitude: 13.405,
                k: 3
            }
        );
    }

    #[test]
    fn nearest_rejects_non_numeric_coordinates() {
        assert!(parse("/nearest north 13.4").is_err());
    }

    #[test]
    fn parses_file_commands() {
        assert_eq!(
            parse("/snapshot feed/list.json").unwrap(),
            ConsoleCommand::Snapshot(PathBuf::from("feed/list.json"))
        );
        assert_eq!(
            parse("/delta d.json").unwrap(),
            ConsoleCommand::Delta(PathBuf::from("d.json"))
        );
    }

    #[test]
    fn quit_aliases() {
        assert_eq!(parse("/quit").unwrap(), ConsoleCommand::Quit);
        assert_eq!(parse("/exit").unwrap(), ConsoleCommand::Quit);
    }

    #[test]
    fn unknown_command_is_reported() {
        assert!(parse("/fly").unwrap_err().contains("/fly"));
    }
}
