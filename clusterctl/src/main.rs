use std::io::{self, IsTerminal};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use clap_complete::Shell;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use clusterwire::{
    address, Action, AgentClient, CommandRequest, Component, ConnectionParameters, DryRunHandler,
    HostKind, ListenConfig,
};

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + 'static + Send + Sync>>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn component_arg() -> Arg {
    Arg::new("COMPONENT")
        .required(true)
        .value_parser(value_parser!(Component))
        .help("hadoop, zookeeper, hbase, hive, spark, flink, kafka or presto")
}

fn cli() -> Command {
    let mut app = Command::new("clusterctl")
        .version(VERSION)
        .about("Drive cluster management agents")
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("print debug"),
        )
        .arg(
            Arg::new("color")
                .long("color")
                .value_parser(["on", "off", "auto"])
                .default_value("auto")
                .global(true)
                .help("colorize output"),
        )
        .arg(
            Arg::new("conninfo")
                .short('d')
                .long("conninfo")
                .value_name("CONNINFO")
                .global(true)
                .help("connection string, key=value pairs or a clusterwire:// URI"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOSTS")
                .global(true)
                .help("comma separated agent hosts or socket directories"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORTS")
                .global(true)
                .help("agent port, one for all hosts or one per host"),
        )
        .arg(
            Arg::new("user")
                .long("user")
                .value_name("USER")
                .global(true)
                .help("user name sent to the agent"),
        );

    for action in [
        Action::Status,
        Action::Uninstall,
        Action::Start,
        Action::Stop,
        Action::Restart,
    ] {
        let about = match action {
            Action::Status => "Report the status of a component".to_string(),
            _ => format!("Ask the agent to {} a component", action.name()),
        };
        app = app.subcommand(
            Command::new(action.name())
                .about(about)
                .arg(component_arg()),
        );
    }

    app.subcommand(
        Command::new("install")
            .about("Install a component, optionally a specific version")
            .arg(component_arg())
            .arg(
                Arg::new("version")
                    .long("version")
                    .value_name("VERSION")
                    .help("version to install"),
            ),
    )
    .subcommand(
        Command::new("configure")
            .about("Set a configuration value of a component")
            .arg(component_arg())
            .arg(Arg::new("NAME").required(true))
            .arg(Arg::new("VALUE").required(true)),
    )
    .subcommand(
        Command::new("conninfo")
            .about("Print the resolved connection plan")
            .long_about(
                "Prints the connection string after applying environment defaults, and \
                 the hosts that would be tried, in order.",
            ),
    )
    .subcommand(
        Command::new("serve")
            .about("Run a dry-run agent")
            .long_about(
                "Runs an agent that acknowledges and logs every request without \
                 executing it.",
            )
            .arg(
                Arg::new("listen")
                    .long("listen")
                    .value_name("ADDRESS")
                    .required(true)
                    .help("tcp:<host>:<port> or unix:<path>"),
            )
            .arg(
                Arg::new("password")
                    .long("password")
                    .value_name("PASSWORD")
                    .help("password clients must present"),
            ),
    )
    .subcommand(
        Command::new("completions")
            .about("Generates completion scripts for your shell")
            .arg(
                Arg::new("SHELL")
                    .required(true)
                    .value_parser(value_parser!(Shell))
                    .help("The shell to generate the script for"),
            ),
    )
}

fn should_colorize(matches: &ArgMatches) -> bool {
    match matches.get_one::<String>("color").map(String::as_str) {
        Some("on") => true,
        Some("off") => false,
        _ => io::stdout().is_terminal() && io::stderr().is_terminal(),
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn connection_parameters(matches: &ArgMatches) -> Result<ConnectionParameters> {
    let mut params = match matches.get_one::<String>("conninfo") {
        Some(conninfo) => ConnectionParameters::parse(conninfo)
            .map_err(|e| format!("Failed to parse '{conninfo}': {e}"))?,
        None => ConnectionParameters::new(),
    };
    for keyword in ["host", "port", "user"] {
        if let Some(value) = matches.get_one::<String>(keyword) {
            params.set(keyword, value)?;
        }
    }
    Ok(params)
}

fn print_plan(params: &ConnectionParameters, colorize: bool) -> Result<()> {
    let bold = |w: &str| {
        if colorize {
            w.bold().to_string()
        } else {
            w.to_string()
        }
    };

    let mut params = params.clone();
    params.add_defaults();
    let target = params.resolve_target()?;

    let mut shown = params.clone();
    shown.unset("password");
    println!("{} {}", bold("Connection:"), shown.to_conninfo_string());
    println!("{} {}", bold("TLS mode:"), target.sslmode.as_str());
    println!("{}", bold("Hosts:"));
    for (i, entry) in target.hosts.iter().enumerate() {
        let kind = match entry.kind {
            HostKind::Name => "name",
            HostKind::NumericAddress => "address",
            HostKind::LocalSocket => "socket",
        };
        let port = match address::entry_port(entry) {
            Ok(port) => port.to_string(),
            Err(reason) => format!("({reason})"),
        };
        let mut line = format!("  {}. {} port {} [{}]", i + 1, entry.display_name(), port, kind);
        if let Some(hostaddr) = &entry.hostaddr {
            line.push_str(&format!(" via {hostaddr}"));
        }
        if entry.password.is_some() {
            line.push_str(" with password");
        }
        println!("{line}");
    }
    Ok(())
}

fn run_command(params: &ConnectionParameters, request: CommandRequest) -> Result<()> {
    let mut client = AgentClient::connect(params).map_err(|e| format!("Cannot connect: {e}"))?;
    let reply = client
        .execute(&request)
        .map_err(|e| format!("'{request}' failed: {e}"));
    client.close();
    println!("{}", reply?);
    Ok(())
}

fn serve(sub_matches: &ArgMatches) -> Result<()> {
    let address = sub_matches
        .get_one::<String>("listen")
        .ok_or("No listen ADDRESS")?;
    let config = ListenConfig {
        password: sub_matches.get_one::<String>("password").cloned(),
        ..Default::default()
    };
    log::info!("serving dry-run agent on {}", address);
    clusterwire::listen(DryRunHandler, address, &config)
        .map_err(|e| format!("Failed to serve on '{address}': {e}"))?;
    Ok(())
}

fn main() {
    let mut app = cli();
    let matches = app.clone().get_matches();
    init_logging(matches.get_flag("debug"));

    if let Err(e) = do_main(&mut app, &matches) {
        let red_bold = |w: &str| {
            if should_colorize(&matches) {
                w.red().bold().to_string()
            } else {
                w.to_string()
            }
        };

        if matches.get_flag("debug") {
            eprintln!("{} {:?}", red_bold("Error:"), e);
        } else {
            eprintln!("{} {}", red_bold("Error:"), e);
        }
        std::process::exit(1);
    }
}

fn do_main(app: &mut Command, matches: &ArgMatches) -> Result<()> {
    let colorize = should_colorize(matches);
    colored::control::set_override(colorize);

    let (name, sub_matches) = match matches.subcommand() {
        Some(sub) => sub,
        None => {
            app.print_help()
                .map_err(|e| format!("Couldn't print help: {e}"))?;
            println!();
            return Ok(());
        }
    };

    match name {
        "completions" => {
            let shell = *sub_matches
                .get_one::<Shell>("SHELL")
                .ok_or("No SHELL given")?;
            clap_complete::generate(shell, app, "clusterctl", &mut io::stdout());
        }
        "conninfo" => print_plan(&connection_parameters(matches)?, colorize)?,
        "serve" => serve(sub_matches)?,
        _ => {
            let action: Action = name.parse()?;
            let component = *sub_matches
                .get_one::<Component>("COMPONENT")
                .ok_or("No COMPONENT given")?;
            let request = match action {
                Action::Install => CommandRequest::install(
                    component,
                    sub_matches.get_one::<String>("version").map(String::as_str),
                ),
                Action::Configure => {
                    let name = sub_matches.get_one::<String>("NAME").ok_or("No NAME given")?;
                    let value = sub_matches
                        .get_one::<String>("VALUE")
                        .ok_or("No VALUE given")?;
                    CommandRequest::configure(component, name, value)
                }
                _ => CommandRequest::new(component, action),
            };
            run_command(&connection_parameters(matches)?, request)?
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cli_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn overrides_apply_on_top_of_conninfo() {
        let matches = cli().get_matches_from([
            "clusterctl",
            "--conninfo",
            "host=a,b port=7000 user=ops",
            "--port",
            "7001",
            "status",
            "kafka",
        ]);
        let params = connection_parameters(&matches).unwrap();
        assert_eq!(params.get("host"), Some("a,b"));
        assert_eq!(params.get("port"), Some("7001"));
        assert_eq!(params.get("user"), Some("ops"));

        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "status");
        assert_eq!(
            sub.get_one::<Component>("COMPONENT"),
            Some(&Component::Kafka)
        );
    }

    #[test]
    fn install_version_flag() {
        let matches =
            cli().get_matches_from(["clusterctl", "install", "spark", "--version", "3.5.1"]);
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(
            sub.get_one::<String>("version").map(String::as_str),
            Some("3.5.1")
        );
    }
}
