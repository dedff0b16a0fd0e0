extern crate clap;
extern crate crypto400;
#[macro_use]
extern crate error_chain;
extern crate simplelog;

use crypto400::error::*;
use crypto400::solve::{self, Config};
use crypto400::target::Target;

fn parse_usize(matches: &clap::ArgMatches, name: &str) -> Result<Option<usize>> {
    match matches.value_of(name) {
        Some(value) => Ok(Some(
            value
                .parse::<usize>()
                .chain_err(|| format!("Invalid value for --{}: {}", name, value))?,
        )),
        None => Ok(None),
    }
}

fn run() -> Result<()> {
    let matches = clap::App::new("crypto400-solve")
        .version("0.1.0")
        .about("Solves the WhitehatCTF 2015 crypto400 crackme")
        .author("Alex Eubanks")
        .arg(
            clap::Arg::with_name("binary")
                .short("f")
                .long("binary")
                .value_name("FILE")
                .help("The crackme, run from the current directory if a bare file name"),
        )
        .arg(
            clap::Arg::with_name("log")
                .short("l")
                .long("log")
                .value_name("LOG_LEVEL")
                .help("Log level (error, warn, info, debug, trace)"),
        )
        .arg(
            clap::Arg::with_name("jobs")
                .short("j")
                .long("jobs")
                .value_name("N")
                .help("Run N guesses at once"),
        )
        .arg(
            clap::Arg::with_name("limit")
                .short("n")
                .long("limit")
                .value_name("N")
                .help("Most candidates enumerated per byte pair"),
        )
        .arg(
            clap::Arg::with_name("steps")
                .short("s")
                .long("steps")
                .value_name("N")
                .help("Most rounds each exploration stage may take"),
        )
        .arg(
            clap::Arg::with_name("max_active")
                .long("max-active")
                .value_name("N")
                .help("Drop the oldest paths beyond N active paths"),
        )
        .arg(
            clap::Arg::with_name("no_bypass_syscalls")
                .long("no-bypass-syscalls")
                .help("Fail paths on syscalls instead of returning unconstrained values"),
        )
        .arg(
            clap::Arg::with_name("candidates_only")
                .long("candidates-only")
                .help("Print the candidates for each byte pair and stop"),
        )
        .get_matches();

    let level_filter = match matches.value_of("log").unwrap_or("info") {
        "debug" => simplelog::LevelFilter::Debug,
        "info" => simplelog::LevelFilter::Info,
        "trace" => simplelog::LevelFilter::Trace,
        "warn" => simplelog::LevelFilter::Warn,
        _ => simplelog::LevelFilter::Error,
    };
    simplelog::TermLogger::init(
        level_filter,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    let defaults = Config::default();
    let config = Config {
        binary: matches
            .value_of("binary")
            .map(|binary| binary.into())
            .unwrap_or(defaults.binary),
        max_steps: parse_usize(&matches, "steps")?.unwrap_or(defaults.max_steps),
        limit: parse_usize(&matches, "limit")?.unwrap_or(defaults.limit),
        jobs: parse_usize(&matches, "jobs")?.unwrap_or(defaults.jobs),
        max_active: parse_usize(&matches, "max_active")?.or(defaults.max_active),
        bypass_unsupported_syscalls: !matches.is_present("no_bypass_syscalls"),
    };

    let target = Target::whitehat_crypto400();

    if matches.is_present("candidates_only") {
        for (i, window) in solve::candidates(&config, &target)?.iter().enumerate() {
            let window = window
                .iter()
                .map(|candidate| String::from_utf8_lossy(candidate).to_string())
                .collect::<Vec<String>>();
            println!("{}: {}", i * target.chunk, window.join(" "));
        }
        return Ok(());
    }

    match solve::solve(&config, &target)? {
        Some(flag) => println!("{}", flag),
        None => bail!("No candidate produced \"{}\"", target.marker),
    }

    Ok(())
}

fn main() {
    match run() {
        Ok(_) => {}
        Err(e) => {
            eprintln!("error: {}", e);
            for e in e.iter().skip(1) {
                eprintln!("caused by: {}", e);
            }
            if let Some(backtrace) = e.backtrace() {
                eprintln!("backtrace: {:?}", backtrace);
            }
            std::process::exit(1);
        }
    }
}
