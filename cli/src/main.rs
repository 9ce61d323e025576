//! Run one double-fetch race attempt against the in-process consumer and report its outcome.
//!
//! The consumer classifies each descriptor by its kind, parks on the descriptor's auxiliary
//! data, then re-reads the kind before executing it. This binary submits a `recv` whose
//! auxiliary data lives in a trapped region, swaps the kind to `send` while the consumer is
//! parked, and releases it with a message page.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin doublefetch -- --message hello
//! ```
//!
//! ```txt
//! outcome: success
//! state: completed
//! submission: 0
//! fault: region=1 offset=0 len=4096
//! window: 87us
//! result: 5
//! ```
//!
//! Against a consumer that reads the kind once (`--single-fetch`) the same run reports
//! `blocked`. With `--skip-auxiliary` the consumer never opens the window and the run reports
//! `race not triggered` once `--fault-timeout` expires. `--no-trap` skips arming the region,
//! which aborts the attempt (exit code 1).

use clap::{value_parser, Arg, ArgAction, Command};
use doublefetch_race::{
    harness::Harness,
    mocks::{self, Backend},
    racer, ring, Endpoint, Kind, Payload,
};
use std::time::Duration;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

fn main() {
    // Parse arguments
    let matches = Command::new("doublefetch")
        .about("race the kind of a submitted descriptor against its auxiliary data")
        .arg(
            Arg::new("entries")
                .long("entries")
                .default_value("10")
                .value_parser(value_parser!(u32))
                .help("Submission ring size (rounded up to a power of two)"),
        )
        .arg(
            Arg::new("region-size")
                .long("region-size")
                .default_value("4096")
                .value_parser(value_parser!(usize))
                .help("Size of the trapped auxiliary region in bytes"),
        )
        .arg(
            Arg::new("fault-timeout")
                .long("fault-timeout")
                .default_value("5000")
                .value_parser(value_parser!(u64))
                .help("Milliseconds to wait for the consumer to touch the region"),
        )
        .arg(
            Arg::new("completion-timeout")
                .long("completion-timeout")
                .default_value("5000")
                .value_parser(value_parser!(u64))
                .help("Milliseconds to wait for the completion record"),
        )
        .arg(
            Arg::new("benign")
                .long("benign")
                .default_value("recv")
                .value_parser(value_parser!(Kind))
                .help("Kind the descriptor is submitted as"),
        )
        .arg(
            Arg::new("malicious")
                .long("malicious")
                .default_value("send")
                .value_parser(value_parser!(Kind))
                .help("Kind swapped in while the consumer is parked"),
        )
        .arg(
            Arg::new("endpoint")
                .long("endpoint")
                .default_value("3")
                .value_parser(value_parser!(i32)),
        )
        .arg(
            Arg::new("message")
                .long("message")
                .default_value("")
                .help("Body of the message page released to the consumer"),
        )
        .arg(
            Arg::new("single-fetch")
                .long("single-fetch")
                .action(ArgAction::SetTrue)
                .help("Consumer reads the kind only once"),
        )
        .arg(
            Arg::new("skip-auxiliary")
                .long("skip-auxiliary")
                .action(ArgAction::SetTrue)
                .help("Consumer never reads the auxiliary region"),
        )
        .arg(
            Arg::new("no-trap")
                .long("no-trap")
                .action(ArgAction::SetTrue)
                .help("Do not arm the auxiliary region"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print the report as JSON"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .value_parser(value_parser!(tracing::Level)),
        )
        .get_matches();

    // Create logger
    let level = *matches.get_one::<tracing::Level>("log-level").unwrap();
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if matches.get_flag("log-json") {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    // Configure attempt
    let cfg = racer::Config {
        ring: ring::Config {
            entries: *matches.get_one::<u32>("entries").unwrap(),
        },
        region_length: *matches.get_one::<usize>("region-size").unwrap(),
        arm_trap: !matches.get_flag("no-trap"),
        fault_timeout: Duration::from_millis(*matches.get_one::<u64>("fault-timeout").unwrap()),
        completion_timeout: Duration::from_millis(
            *matches.get_one::<u64>("completion-timeout").unwrap(),
        ),
        ..Default::default()
    };
    let backend = Backend::new(mocks::Config {
        double_fetch: !matches.get_flag("single-fetch"),
        touch_auxiliary: !matches.get_flag("skip-auxiliary"),
    });

    // Build payload
    let message = matches.get_one::<String>("message").unwrap();
    let page = match mocks::message(message.as_bytes(), cfg.region_length) {
        Ok(page) => page,
        Err(err) => {
            error!(?err, "unable to build message");
            std::process::exit(2);
        }
    };
    let payload = Payload::new(
        *matches.get_one::<Kind>("benign").unwrap(),
        *matches.get_one::<Kind>("malicious").unwrap(),
        Endpoint(*matches.get_one::<i32>("endpoint").unwrap()),
        page,
    );
    info!(
        benign = %payload.benign,
        malicious = %payload.malicious,
        len = payload.len(),
        "starting attempt"
    );

    // Run once
    let report = Harness::new(cfg, backend).run(&payload);
    if matches.get_flag("json") {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                error!(?err, "unable to serialize report");
                std::process::exit(2);
            }
        }
    } else {
        println!("{report}");
    }
    std::process::exit(report.exit_code());
}
