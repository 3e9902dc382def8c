use anyhow::Result;
use clap::{App, Arg, ArgGroup, ArgMatches};
use nix::unistd::Pid;

use std::io::stdout;
use std::path::{Path, PathBuf};
use std::process;
use std::time::SystemTime;

use lochs_taint::archive::{binary_key, Archive};
use lochs_taint::disasm::IcedDecoder;
use lochs_taint::eventbus::{Engine, EventKind};
use lochs_taint::host::{ApiInfoTable, NoApiInfo, ProcessorView};
use lochs_taint::ptrace_host::{Step, Tracee, Tracer};
use lochs_taint::taint::TaintEngine;
use lochs_taint::trace::RunTrace;
use lochs_taint::Config;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("output-format")
                .help("The output format to use")
                .short("F")
                .long("format")
                .takes_value(true)
                .possible_values(&["archive", "raw-json"])
                .default_value("archive"),
        )
        .arg(
            Arg::with_name("mode")
                .help("The CPU mode to decode instructions with")
                .short("m")
                .long("mode")
                .takes_value(true)
                .possible_values(&["32", "64"])
                .default_value("32"),
        )
        .arg(
            Arg::with_name("config")
                .help("Path to the [General]/[Taint]/[Tracer] INI config")
                .short("c")
                .long("config")
                .takes_value(true)
                .default_value("lochsdbg.ini"),
        )
        .arg(
            Arg::with_name("archive-dir")
                .help("Directory to write the per-binary archive to (overrides config)")
                .long("archive-dir")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ignore-unsupported-memops")
                .help("Ignore unsupported memory ops instead of failing")
                .short("I")
                .long("ignore-unsupported-memops"),
        )
        .arg(
            Arg::with_name("debug-on-fault")
                .help("Suspend the tracee and detach if a memory access faults")
                .short("d")
                .long("debug-on-fault"),
        )
        .arg(
            Arg::with_name("tracee-pid")
                .help("Attach to the given PID for tracing")
                .short("a")
                .long("attach")
                .takes_value(true),
        )
        .arg(Arg::with_name("tracee-name").help("The program to trace").index(1))
        .arg(
            Arg::with_name("tracee-args")
                .help("The command-line arguments to execute the tracee with")
                .raw(true),
        )
        .group(
            ArgGroup::with_name("target")
                .required(true)
                .args(&["tracee-pid", "tracee-name"]),
        )
}

fn tracer_from_matches(matches: &ArgMatches, bitness: u32) -> Tracer {
    Tracer {
        ignore_unsupported_memops: matches.is_present("ignore-unsupported-memops"),
        debug_on_fault: matches.is_present("debug-on-fault"),
        bitness,
        tracee_pid: matches.value_of("tracee-pid").map(|s| Pid::from_raw(s.parse().unwrap())),
        tracee_name: matches.value_of("tracee-name").map(str::to_string),
        tracee_args: matches
            .values_of("tracee-args")
            .map(|vs| vs.map(str::to_string).collect())
            .unwrap_or_default(),
    }
}

fn run_archive_mode(matches: &ArgMatches, config: &Config, tracee: &mut Tracee) -> Result<()> {
    let decoder = IcedDecoder::new32();
    let api: &dyn ApiInfoTable = &NoApiInfo;

    let mut engine = Engine::new(
        TaintEngine::new(config.taint.rules),
        RunTrace::new(config.tracer.max_traces, config.tracer.merge_call_jmp),
    );

    while !tracee.is_terminated() {
        let eip = tracee.eip();
        engine.dispatch(EventKind::PreExecute, eip, eip, tracee, &decoder, api);

        let _step = tracee.step()?;

        let eip_after = tracee.eip();
        engine.dispatch(EventKind::PostExecute, eip_after, eip_after, tracee, &decoder, api);
    }

    if config.general.enabled {
        let archive_dir = matches
            .value_of("archive-dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&config.general.archive_dir));

        let mut archive = Archive::new();
        archive.put("stats", &ArchivedStats::from(&engine.stats));

        let target = matches
            .value_of("tracee-name")
            .map(Path::new)
            .unwrap_or_else(|| Path::new("attached"));
        let key = binary_key(target, SystemTime::now());
        archive.save(&archive_dir, key, "main")?;
    }

    Ok(())
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ArchivedStats {
    instructions_executed: u64,
    mem_reads: u64,
    mem_writes: u64,
}

impl From<&lochs_taint::eventbus::Statistics> for ArchivedStats {
    fn from(s: &lochs_taint::eventbus::Statistics) -> Self {
        ArchivedStats {
            instructions_executed: s.instructions_executed,
            mem_reads: s.mem_reads,
            mem_writes: s.mem_writes,
        }
    }
}

impl lochs_taint::archive::Archivable for ArchivedStats {
    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap()
    }
    fn from_json(value: serde_json::Value) -> Result<Self, lochs_taint::ArchiveError> {
        serde_json::from_value(value).map_err(|source| lochs_taint::ArchiveError::Serde {
            component: "ArchivedStats",
            source,
        })
    }
}

fn run() -> Result<()> {
    let matches = app().get_matches();

    let config_path = PathBuf::from(matches.value_of("config").unwrap());
    let config = Config::load(&config_path)?;

    let bitness: u32 = matches.value_of("mode").unwrap().parse()?;
    let tracer = tracer_from_matches(&matches, bitness);
    let mut tracee = tracer.trace()?;

    match matches.value_of("output-format").unwrap() {
        "archive" => run_archive_mode(&matches, &config, &mut tracee)?,
        "raw-json" => {
            let steps: Result<Vec<Step>> = std::iter::from_fn(|| {
                if tracee.is_terminated() {
                    None
                } else {
                    Some(tracee.step())
                }
            })
            .collect();
            serde_json::to_writer(stdout(), &steps?)?;
        }
        _ => unreachable!(),
    }

    Ok(())
}

fn main() {
    env_logger::init();

    process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Fatal: {:#}", e);
            1
        }
    });
}
