use clap::Parser;
use client::{Client, ShutdownPolicy};
use log::info;
use protocol::Parameters;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:3141")]
    server: String,

    /// Operating system reported in the handshake
    #[arg(long, default_value = std::env::consts::OS)]
    os: String,

    /// Request type to send. Without one, the client idles until disconnected
    #[arg(short = 'r', long)]
    request: Option<String>,

    /// Request parameter as key=value, may be repeated
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Veto shutdown negotiations
    #[arg(long)]
    refuse_shutdown: bool,
}

fn parse_param(arg: &str) -> Result<(String, String), String> {
    arg.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{arg}`"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let policy = if args.refuse_shutdown {
        ShutdownPolicy::Refuse
    } else {
        ShutdownPolicy::Accept
    };

    info!("Connecting to: {}", args.server);
    let mut client = Client::connect_with(&args.server, &args.os, policy).await?;
    let welcome = client.welcome();
    println!(
        "connected as client {} to Karfunkel {} ({} clients, project: {})",
        welcome.id,
        welcome.version,
        welcome.clients,
        welcome.project.as_deref().unwrap_or("none")
    );

    let Some(kind) = args.request else {
        client.serve().await?;
        println!("server closed the connection");
        return Ok(());
    };

    let parameters: Parameters = args.params.into_iter().collect();
    let id = client.send_request(&kind, parameters).await?;

    loop {
        let command = client.next_command().await?;
        for notification in &command.notifications {
            println!("notification {} {:?}", notification.kind, notification.parameters);
        }
        for response in &command.responses {
            println!(
                "response {} to {}: {} {:?}",
                response.kind, response.answers, response.status, response.parameters
            );
            if response.answers == id && response.status.is_final() {
                return client.close().await.map_err(Into::into);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("file=/tmp/a=b"),
            Ok(("file".to_string(), "/tmp/a=b".to_string()))
        );
        assert!(parse_param("file").is_err());
    }
}
