use std::time::Duration;

use clap::Parser;
use epicars_pv::{
    PvArrayBuilder, PvBuilder, PvError,
    dbr::Status,
    sources::{IntercomSource, intercom::Intercom},
};

use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Options {
    /// Names of the simulated PVs to serve and watch
    #[clap(id = "PV_NAME", default_values_t = ["SIM:A".to_string(), "SIM:B".to_string(), "SIM:C".to_string()])]
    names: Vec<String>,
    /// Milliseconds between simulated updates
    #[clap(long, default_value_t = 500)]
    period: u64,
    /// Number of simulated updates to make before exiting
    #[clap(short = 'n', long, default_value_t = 20)]
    updates: usize,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Drive each PV through a slow ramp, dropping one out every so often
async fn simulate(pvs: Vec<Intercom<f64>>, period: Duration, updates: usize) {
    for step in 0..updates {
        tokio::time::sleep(period).await;
        let index = step % pvs.len();
        let pv = &pvs[index];
        if step % 7 == 6 {
            info!("Simulating disconnect of {}", pv.name());
            pv.disconnect();
            continue;
        }
        let value = (step as f64 / 4.0).sin() * 10.0 + index as f64;
        if value > 9.0 {
            pv.set_alarm(Status {
                status: 3,
                severity: 1,
            });
        } else {
            pv.set_alarm(Status::default());
        }
        pv.store(value);
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();

    let filter = EnvFilter::default().add_directive(
        match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        }
        .into(),
    );
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let source = IntercomSource::new();
    let mut pvs = Vec::new();
    for (i, name) in opts.names.iter().enumerate() {
        // Leave the last PV unconnected, so that it only shows up once simulated
        let pv = if i + 1 == opts.names.len() {
            source.add_unconnected_pv::<f64>(name)
        } else {
            source.add_pv(name, 0.0f64)
        };
        match pv {
            Ok(pv) => pvs.push(pv),
            Err(_) => {
                eprintln!("Error: PV {name} given more than once");
                std::process::exit(1);
            }
        }
    }

    let names: Vec<&str> = opts.names.iter().map(String::as_str).collect();
    let array = PvArrayBuilder::<f64>::new(&names)
        .on_update(|state, index| {
            let values = state.get();
            println!(
                "{:<12} {:>8.3}  ok={:<5} severity={}   all_ok={}",
                state.names()[index],
                values[index],
                state.ok()[index],
                state.severity()[index],
                state.all_ok(),
            );
        })
        .connect(source.clone())
        .await
        .unwrap();

    let first = PvBuilder::new(&opts.names[0])
        .notify_disconnect(true)
        .connect(source.clone())
        .await
        .unwrap();

    tokio::spawn(simulate(
        pvs,
        Duration::from_millis(opts.period),
        opts.updates,
    ));

    // Follow the first PV through every update until the simulation stops
    let idle = Duration::from_millis(opts.period * (opts.names.len() as u64 + 1));
    loop {
        match first.get_next(idle, true).await {
            Ok(Some(value)) => info!("{} is now {}", first.name(), value.value()),
            Ok(None) => warn!("{} disconnected", first.name()),
            Err(PvError::Timeout(_)) => break,
            Err(e) => {
                warn!("Stopped following {}: {e}", first.name());
                break;
            }
        }
    }

    match array.sync(Duration::from_secs(1), false).await {
        Ok(()) => println!("Final: {:?} ok={:?}", array.get().as_slice(), array.ok()),
        Err(e) => println!("Could not sync: {e}"),
    }
    array.close();
    first.close();
    info!("Finished.");
}
