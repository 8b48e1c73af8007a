#![forbid(unsafe_code)]

use std::net::SocketAddr;

use parlor_client_core::{ClientSettings, Session};
use parlor_protocol::Msg;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parlor_client --token <token> [--connect quic://host:port] [--addr ip:port] [--sni name]\n\
\n\
Options:\n\
	--token     Bearer token from /api/register or /api/login\n\
	            (or set PARLOR_TOKEN)\n\
	--connect   Server endpoint (default: quic://127.0.0.1:4433)\n\
	            Format: quic://host:port\n\
	--addr      Server SocketAddr (overrides DNS resolution from --connect)\n\
	--sni       TLS server name/SNI (overrides the host from --connect)\n\
	--help      Show this help\n\
\n\
Lines read from stdin are published to the room.\n\
\n\
Examples:\n\
	parlor_client --token $TOKEN --connect quic://127.0.0.1:4433\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parlor_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_args() -> (String, String, Option<SocketAddr>, Option<String>) {
	let mut endpoint = "quic://127.0.0.1:4433".to_string();
	let mut token = std::env::var("PARLOR_TOKEN").ok().and_then(|v| {
		let v = v.trim().to_string();
		(!v.is_empty()).then_some(v)
	});

	let mut addr_override: Option<SocketAddr> = None;
	let mut sni_override: Option<String> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--token" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--token must be non-empty");
					usage_and_exit();
				}
				token = Some(v);
			}
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--addr" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let parsed: SocketAddr = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --addr value: {v}");
					usage_and_exit()
				});
				addr_override = Some(parsed);
			}
			"--sni" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--sni must be non-empty");
					usage_and_exit();
				}
				sni_override = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(token) = token else {
		eprintln!("Missing --token (or PARLOR_TOKEN)");
		usage_and_exit();
	};

	(endpoint, token, addr_override, sni_override)
}

fn print_record(record: &parlor_domain::MessageRecord) {
	if record.system {
		println!("-- {}", record.text);
	} else {
		println!("{}: {}", record.user, record.text);
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let (endpoint, token, addr_override, sni_override) = parse_args();

	let mut cfg = ClientSettings::from_quic_endpoint(&endpoint, token)?;
	cfg.client_name = format!("parlor-client-cli/{}", env!("CARGO_PKG_VERSION"));
	cfg.server_addr = addr_override.or_else(|| format!("{}:{}", cfg.server_host, cfg.server_port).parse().ok());
	if let Some(sni) = sni_override {
		cfg.server_host = sni;
	}

	info!(server = %cfg.server_host, port = cfg.server_port, "connecting");

	let (mut session, joined) = Session::connect(cfg).await?;
	info!(server = %joined.server_name, history = joined.history.len(), "joined the room");

	for record in &joined.history {
		print_record(record);
	}

	let mut lines = BufReader::new(tokio::io::stdin()).lines();

	loop {
		tokio::select! {
			msg = session.next_msg() => match msg? {
				Some(Msg::Message { message }) => print_record(&message),
				Some(Msg::Lagged { dropped }) => warn!(dropped, "fell behind; some messages were skipped"),
				Some(Msg::Pong { .. }) => {}
				Some(other) => warn!("unexpected server message: {other:?}"),
				None => {
					info!("server closed the session");
					break;
				}
			},

			line = lines.next_line() => match line? {
				Some(line) => session.send_message(&line).await?,
				None => {
					session.close(0, "bye");
					break;
				}
			},
		}
	}

	Ok(())
}
