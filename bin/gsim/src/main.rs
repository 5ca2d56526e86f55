use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use grammar::prelude::*;
use grammar::run_sessions;
use grammar_learning::prelude::*;
use owo_colors::OwoColorize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use tracing::{debug, error, info, trace};
use tracing_subscriber::{filter, prelude::*};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};

#[derive(Debug, Error)]
enum CliError {
    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid {what} in {}: {source}", path.display())]
    Json {
        what: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Learning(#[from] LearningError),
}

fn file_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .value_name("FILE")
        .value_parser(value_parser!(PathBuf))
        .help(help)
}

fn cli() -> clap::Command {
    Command::new("gsim")
    .about("Protocol grammar simulation and inference")
    .subcommand_required(true)
    .arg(
        Arg::new("verbosity")
        .short('v')
        .long("verbosity")
        .num_args(0..=1)
        .require_equals(true)
        .value_parser(["info", "debug", "trace"])
        .default_missing_value("info")
        .global(true)
    )
    .subcommand(
        Command::new("run")
        .about("plays an automaton against a live peer and prints the visited states")
        .arg(file_arg("alphabet", "alphabet record (JSON)").required(true))
        .arg(file_arg("automaton", "automaton record (JSON)").required(true))
        .arg(file_arg("channel", "channel configuration (JSON)").required(true))
        .arg(file_arg("config", "execution configuration (JSON)"))
        .arg(
            Arg::new("role")
            .long("role")
            .value_parser(["client", "server"])
            .default_value("client")
            .help("the side of the conversation that is impersonated")
        )
        .arg(
            Arg::new("sessions")
            .long("sessions")
            .value_parser(value_parser!(usize))
            .default_value("1")
            .help("number of sessions run in parallel, each on its own connection")
        )
        .arg(
            Arg::new("max-steps")
            .long("max-steps")
            .value_parser(value_parser!(usize))
        )
    )
    .subcommand(
        Command::new("learn")
        .about("infers a Mealy machine from a live peer with L*")
        .arg(file_arg("alphabet", "alphabet record (JSON)").required(true))
        .arg(file_arg("channel", "channel configuration (JSON)").required(true))
        .arg(file_arg("seed", "automaton that is played before every query (JSON)"))
        .arg(file_arg("oracle", "network oracle configuration (JSON)"))
        .arg(file_arg("config", "learning configuration (JSON)"))
        .arg(
            Arg::new("inputs")
            .long("inputs")
            .value_delimiter(',')
            .action(ArgAction::Append)
            .help("names of the symbols that queries are made of, defaults to the whole alphabet")
        )
        .arg(
            Arg::new("timeout")
            .long("timeout")
            .value_parser(value_parser!(u64))
            .help("receive timeout of a query in milliseconds")
        )
        .arg(
            Arg::new("budget")
            .long("budget")
            .value_parser(value_parser!(usize))
            .help("maximal number of membership queries")
        )
        .arg(
            Arg::new("max-states")
            .long("max-states")
            .value_parser(value_parser!(usize))
            .default_value("8")
            .help("upper bound on the states of the peer, used by the W-method")
        )
        .arg(
            Arg::new("random")
            .long("random")
            .value_parser(value_parser!(usize))
            .conflicts_with("max-states")
            .help("test hypotheses with this many random words instead of the W-method")
        )
        .arg(
            Arg::new("max-length")
            .long("max-length")
            .value_parser(value_parser!(usize))
            .default_value("8")
            .help("maximal length of a random word")
        )
        .arg(
            Arg::new("format")
            .long("format")
            .value_parser(["mealy", "dot", "json"])
            .default_value("mealy")
        )
        .arg(
            Arg::new("name")
            .long("name")
            .default_value("learned")
            .help("name of the learned automaton")
        )
    )
}

fn setup_logging(matches: &ArgMatches) {
    let level = match matches
        .try_get_one::<String>("verbosity")
        .ok()
        .flatten()
        .map(|m| m.as_str())
    {
        Some("trace") => filter::LevelFilter::TRACE,
        Some("debug") => filter::LevelFilter::DEBUG,
        Some("info") => filter::LevelFilter::INFO,
        _ => filter::LevelFilter::WARN,
    };

    let stderr_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(stderr_log.with_filter(level))
        .init();

    trace!("setup {level} logging");
}

fn read(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn load<T: DeserializeOwned>(path: &Path, what: &'static str) -> Result<T, CliError> {
    serde_json::from_str(&read(path)?).map_err(|source| CliError::Json {
        what,
        path: path.to_path_buf(),
        source,
    })
}

fn load_or_default<T: DeserializeOwned + Default>(
    matches: &ArgMatches,
    name: &str,
    what: &'static str,
) -> Result<T, CliError> {
    match matches.get_one::<PathBuf>(name) {
        Some(path) => load(path, what),
        None => Ok(T::default()),
    }
}

fn required_path<'a>(matches: &'a ArgMatches, name: &str) -> &'a Path {
    matches
        .get_one::<PathBuf>(name)
        .map(PathBuf::as_path)
        .unwrap_or_else(|| Path::new(""))
}

fn load_alphabet(matches: &ArgMatches) -> Result<Arc<Alphabet>, CliError> {
    let alphabet = Alphabet::from_json(&read(required_path(matches, "alphabet"))?)?;
    debug!("loaded alphabet with {} symbols", alphabet.size());
    Ok(Arc::new(alphabet))
}

fn describe_exchange(exchange: &Exchange, alphabet: &Alphabet) -> String {
    match exchange {
        Exchange::Nothing => "-".to_string(),
        Exchange::Sent { symbol, bytes } => {
            format!("sent {} ({bytes} bytes)", alphabet.show_symbol(*symbol))
        }
        Exchange::Received { abstraction, bytes } => match abstraction.symbol() {
            Some(symbol) => format!(
                "received {} ({} bytes)",
                alphabet.show_symbol(symbol),
                bytes.len()
            ),
            None if bytes.is_empty() => "received nothing".to_string(),
            None => format!("received {} unknown bytes", bytes.len()),
        },
    }
}

fn describe_divergence(divergence: &Divergence, alphabet: &Alphabet) -> String {
    match divergence {
        Divergence::Unexpected { expected, received } => format!(
            "expected one of {}, got {}",
            alphabet.show_word(expected),
            alphabet.show_symbol(*received)
        ),
        Divergence::Unknown { .. } if divergence.is_silence() => "peer stayed silent".to_string(),
        Divergence::Unknown { bytes } => format!("{} bytes of no known symbol", bytes.len()),
    }
}

fn describe_end(end: &SessionEnd, alphabet: &Alphabet) -> String {
    match end {
        SessionEnd::Terminal(_) => "reached a terminal state".to_string(),
        SessionEnd::SelectorExhausted => "nothing left to emit".to_string(),
        SessionEnd::StepLimit => "step limit reached".to_string(),
        SessionEnd::Silence => "peer stayed silent".to_string(),
        SessionEnd::Diverged(divergence) => {
            format!("diverged, {}", describe_divergence(divergence, alphabet))
        }
        SessionEnd::Aborted(err) => format!("aborted, {err}"),
    }
}

fn print_trace(index: usize, trace: &SessionTrace, automaton: &Automaton, alphabet: &Alphabet) {
    println!("{}", format!("session {index}").bold());
    for step in &trace.steps {
        let name = automaton
            .transition(step.transition)
            .map(|t| t.name())
            .unwrap_or("?");
        println!(
            "  {:<24} {}",
            name.blue(),
            describe_exchange(&step.exchange, alphabet)
        );
        if let Some(divergence) = &step.divergence {
            println!(
                "  {:<24} {}",
                "",
                describe_divergence(divergence, alphabet).yellow()
            );
        }
    }
    println!("  states: {}", trace.history.join(" -> "));
    let end = describe_end(&trace.end, alphabet);
    if trace.end.is_aborted() {
        println!("  {}", end.red());
    } else {
        println!("  {}", end.green());
    }
}

fn run(matches: &ArgMatches) -> Result<(), CliError> {
    let alphabet = load_alphabet(matches)?;
    let automaton = Automaton::from_json(&read(required_path(matches, "automaton"))?, &alphabet)?;
    automaton.validate(&alphabet)?;
    let channel: ChannelConfig = load(required_path(matches, "channel"), "channel configuration")?;
    let mut config: ExecutionConfig = load_or_default(matches, "config", "execution configuration")?;
    if let Some(steps) = matches.get_one::<usize>("max-steps") {
        config = config.with_max_steps(*steps);
    }
    let role = match matches.get_one::<String>("role").map(String::as_str) {
        Some("server") => Role::Server,
        _ => Role::Client,
    };
    let sessions = matches.get_one::<usize>("sessions").copied().unwrap_or(1).max(1);

    info!(
        "running {sessions} session(s) of {} as {}",
        automaton.name(),
        role.show()
    );
    let snapshot = automaton.into_snapshot();
    let runners = (0..sessions)
        .map(|_| {
            let layer = AbstractionLayer::new(channel.build(), Arc::clone(&alphabet));
            SessionRunner::new(Arc::clone(&snapshot), layer, role).with_config(config.clone())
        })
        .collect::<Vec<_>>();

    let mut failure = None;
    for (i, result) in run_sessions(runners).into_iter().enumerate() {
        match result {
            Ok(trace) => print_trace(i, &trace, &snapshot, &alphabet),
            Err(err) => {
                error!("session {i} could not be started: {err}");
                failure = Some(err);
            }
        }
    }
    match failure {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn learn(matches: &ArgMatches) -> Result<(), CliError> {
    let alphabet = load_alphabet(matches)?;
    let channel: ChannelConfig = load(required_path(matches, "channel"), "channel configuration")?;
    let inputs = match matches.get_many::<String>("inputs") {
        Some(names) => alphabet.ids_of(names.map(String::as_str))?,
        None => alphabet.universe().collect(),
    };

    let mut oracle_config: NetworkOracleConfig =
        load_or_default(matches, "oracle", "network oracle configuration")?;
    if let Some(timeout) = matches.get_one::<u64>("timeout") {
        oracle_config = oracle_config.with_receive_timeout(Duration::from_millis(*timeout));
    }
    let mut config: LearningConfig = load_or_default(matches, "config", "learning configuration")?;
    if let Some(budget) = matches.get_one::<usize>("budget") {
        config = config.with_query_budget(*budget);
    }

    let equivalence: Box<dyn EquivalenceOracle<NetworkOracle>> =
        match matches.get_one::<usize>("random") {
            Some(tests) => {
                let length = matches.get_one::<usize>("max-length").copied().unwrap_or(8);
                Box::new(RandomWords::new(*tests, length))
            }
            None => Box::new(WMethod::new(
                matches.get_one::<usize>("max-states").copied().unwrap_or(8),
            )),
        };

    let oracle = NetworkOracle::connect(&channel, Arc::clone(&alphabet), inputs)
        .with_config(oracle_config);
    let mut learner = LStar::new(oracle, equivalence).with_config(config);
    if let Some(path) = matches.get_one::<PathBuf>("seed") {
        let seed = Automaton::from_json(&read(path)?, &alphabet)?;
        seed.validate(&alphabet)?;
        learner = learner.with_seed(seed);
    }

    info!("learning from {} with {} inputs", channel_label(&channel), learner.table().inputs().len());
    let learned = learner.infer()?;
    info!(
        "final observation table\n{}",
        learner.table().render(Some(&alphabet))
    );

    let name = matches
        .get_one::<String>("name")
        .map(String::as_str)
        .unwrap_or("learned");
    match matches.get_one::<String>("format").map(String::as_str) {
        Some("dot") => println!("{}", learned.to_automaton(name, &alphabet)?.to_dot(&alphabet)),
        Some("json") => println!("{}", learned.to_automaton(name, &alphabet)?.to_json(&alphabet)?),
        _ => {
            for (q, a, o, p) in learned.edges() {
                println!(
                    "{q} -{}|{}-> {p}",
                    alphabet.show_symbol(a).blue(),
                    alphabet.show_reply(&o)
                );
            }
        }
    }
    Ok(())
}

fn channel_label(channel: &ChannelConfig) -> String {
    match channel {
        ChannelConfig::TcpClient { remote, .. } => format!("tcp://{remote}"),
        ChannelConfig::TcpServer { local, .. } => format!("tcp server on {local}"),
        ChannelConfig::UdpClient { remote } => format!("udp://{remote}"),
        ChannelConfig::UdpServer { local } => format!("udp server on {local}"),
    }
}

pub fn main() -> ExitCode {
    let matches = cli().get_matches();

    setup_logging(&matches);

    let result = match matches.subcommand() {
        Some(("run", sub_matches)) => run(sub_matches),
        Some(("learn", sub_matches)) => learn(sub_matches),
        _ => unreachable!(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn learn_arguments() {
        let matches = cli()
            .try_get_matches_from([
                "gsim",
                "-v=debug",
                "learn",
                "--alphabet",
                "a.json",
                "--channel",
                "c.json",
                "--inputs",
                "HELLO,BYE",
                "--random",
                "20",
            ])
            .unwrap();
        let (name, learn) = matches.subcommand().unwrap();
        assert_eq!(name, "learn");
        let inputs = learn
            .get_many::<String>("inputs")
            .unwrap()
            .map(String::as_str)
            .collect::<Vec<_>>();
        assert_eq!(inputs, ["HELLO", "BYE"]);
        assert_eq!(learn.get_one::<usize>("random"), Some(&20));
        assert_eq!(learn.get_one::<String>("format").unwrap(), "mealy");
    }

    #[test]
    fn run_requires_automaton() {
        let result = cli().try_get_matches_from([
            "gsim",
            "run",
            "--alphabet",
            "a.json",
            "--channel",
            "c.json",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn missing_files_are_reported() {
        let err = read(Path::new("/nonexistent/alphabet.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/alphabet.json"));
    }
}
