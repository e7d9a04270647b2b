use std::{net::SocketAddr, process::ExitCode, time::Duration};

use peer_timesync::{
    channel::{
        link::{self, LinkConfig},
        udp,
    },
    configuration::{Configuration, Parser},
    report::SyncReport,
    session::{Role, SyncConfig},
    sync::{SyncOutcome, TimeSync},
    time::SharedClock,
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let conf = Configuration::parse();
    if let Err(e) = conf.validate() {
        eprintln!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    log::info!("Configuration valid. Starting up...");

    let result = match conf.simulate_delay {
        Some(delay) => run_simulation(&conf, delay).await,
        None => run_udp(&conf).await,
    };

    match result {
        Ok(outcome) if outcome.is_done() => {
            if let Some(clock) = SharedClock::aligned(&outcome) {
                log::info!("Shared clock starts at {:?}", clock.offset());
            }
            ExitCode::SUCCESS
        }
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Time sync failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_udp(conf: &Configuration) -> Result<SyncOutcome, Box<dyn std::error::Error>> {
    let remote_addr = conf
        .remote_addr
        .ok_or("remote address is required")?;
    let local: SocketAddr = (conf.local_addr, conf.local_port).into();
    let remote: SocketAddr = (remote_addr, conf.remote_port).into();

    let channel = udp::connect(local, remote).await?;
    let role = Role::from(conf.initiator);
    let mut sync = TimeSync::new(channel, conf.sync_config())?;
    sync.start(role)?;

    println!("Time sync as {} with {}", role, remote);
    let outcome = sync.run().await?;
    SyncReport::new(role, &outcome, sync.session()).print(conf.output_format);
    Ok(outcome)
}

async fn run_simulation(
    conf: &Configuration,
    delay_ms: u64,
) -> Result<SyncOutcome, Box<dyn std::error::Error>> {
    let mut link_config = LinkConfig::with_delay(Duration::from_millis(delay_ms));
    link_config.drop_every = conf.simulate_loss_every;
    let (a, b) = link::symmetric(link_config);

    let config: SyncConfig = conf.sync_config();
    let mut initiator = TimeSync::new(a, config)?;
    let mut responder = TimeSync::new(b, config)?;
    initiator.start(Role::Initiator)?;
    responder.start(Role::Responder)?;

    println!(
        "Simulating a {} ms one-way link{}",
        delay_ms,
        conf.simulate_loss_every
            .map_or_else(String::new, |n| format!(", dropping every {} messages", n))
    );

    // The responder only finishes once the completion gets through.
    let responder_run = tokio::time::timeout(
        config.timeout + Duration::from_millis(delay_ms) * 2,
        responder.run(),
    );
    let (initiator_out, responder_out) = tokio::join!(initiator.run(), responder_run);

    let initiator_out = initiator_out?;
    SyncReport::new(Role::Initiator, &initiator_out, initiator.session())
        .print(conf.output_format);

    match responder_out {
        Ok(Ok(outcome)) => {
            SyncReport::new(Role::Responder, &outcome, responder.session())
                .print(conf.output_format);
        }
        Ok(Err(e)) => log::warn!("responder failed: {}", e),
        Err(_) => log::warn!("responder never received the completion"),
    }

    Ok(initiator_out)
}
