use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Arg, Command, crate_version};
use tokio::sync::mpsc;
use warden_store::Backend;
use wardend::config::{Config, DEFAULT_CONFIG_PATH};
use wardend::control::{self, ControlError};
use wardend::datetime::UnixTime;
use wardend::db::KeyRole;
use wardend::db::zone::Adapter;
use wardend::enforcer;
use wardend::factory::{self, KeyFactory, KeySlot};
use wardend::{kasp, scheduler::Scheduler};

fn main() -> ExitCode {
    let matches = cli().get_matches();

    // Construct the configuration.
    let config_path = matches
        .get_one::<String>("config")
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Warden couldn't be configured: {error}");
            return ExitCode::FAILURE;
        }
    };

    if matches.get_flag("check_config") {
        return ExitCode::SUCCESS;
    }

    if let Err(error) = wardend::log::launch(&config.logging) {
        eprintln!("Warden couldn't set up logging: {error}");
        return ExitCode::FAILURE;
    }

    // Bring up the store, the HSM binding and the key factory.
    let store: Arc<dyn Backend> = match config.open_store() {
        Ok(store) => store,
        Err(error) => {
            log::error!("Cannot open the store: {error}");
            return ExitCode::FAILURE;
        }
    };
    let hsm = config.build_hsm();
    let (factory, gen_rx) = match KeyFactory::load(&*store, hsm) {
        Ok(pair) => pair,
        Err(error) => {
            log::error!("Cannot initialize the key factory: {error}");
            return ExitCode::FAILURE;
        }
    };

    match matches.subcommand() {
        Some(("run", _)) => run_daemon(config, store, factory, gen_rx),
        Some(("policy", sub)) => match sub.subcommand() {
            Some(("load", _)) => match kasp::load_dir(&*store, &config.policy_dir) {
                Ok(names) => {
                    println!("Loaded {} policies", names.len());
                    ExitCode::SUCCESS
                }
                Err(error) => {
                    log::error!("Policy load failed: {error}");
                    ExitCode::FAILURE
                }
            },
            _ => unreachable!("subcommands are required"),
        },
        Some(("zone", sub)) => zone_command(sub, &config, &store, &factory),
        Some((cmd @ ("ds-submit" | "ds-seen" | "ds-retract" | "ds-gone"), sub)) => {
            let zone = sub.get_one::<String>("zone").expect("required");
            let keytag = *sub.get_one::<u16>("keytag").expect("required");
            let now = UnixTime::now();
            let result = match cmd {
                "ds-submit" => control::ds_submit(&*store, &factory, zone, keytag, now),
                "ds-seen" => control::ds_seen(&*store, &factory, zone, keytag, now),
                "ds-retract" => control::ds_retract(&*store, &factory, zone, keytag, now),
                "ds-gone" => control::ds_gone(&*store, &factory, zone, keytag, now),
                _ => unreachable!(),
            };
            report_control(result.map(|outcome| {
                println!("Zone '{zone}' is now {}", outcome.status);
            }))
        }
        Some(("roll", sub)) => {
            let zone = sub.get_one::<String>("zone").expect("required");
            let role = match sub.get_one::<String>("role").expect("required").as_str() {
                "ksk" => KeyRole::KSK,
                "zsk" => KeyRole::ZSK,
                "csk" => KeyRole::CSK,
                _ => unreachable!("the value parser limits the role"),
            };
            let result = control::roll_now(&*store, &factory, zone, role, UnixTime::now())
                .map(|outcome| {
                    println!("Zone '{zone}' is now {}", outcome.status);
                });
            report_control(result)
        }
        Some(("rollover-list", sub)) => {
            let zone = sub.get_one::<String>("zone").map(String::as_str);
            match control::rollover_list(&*store, zone) {
                Ok(report) => {
                    for row in report {
                        let at = match row.at {
                            Some(at) => at.to_string(),
                            None => "manual".into(),
                        };
                        println!("{}\t{}\t{}", row.zone, row.role, at);
                    }
                    ExitCode::SUCCESS
                }
                Err(error) => report_control(Err::<(), _>(error)),
            }
        }
        _ => unreachable!("subcommands are required"),
    }
}

fn cli() -> Command {
    let zone_keytag = |name: &'static str, about: &'static str| {
        Command::new(name)
            .about(about)
            .arg(Arg::new("zone").required(true).help("The zone name"))
            .arg(
                Arg::new("keytag")
                    .required(true)
                    .value_parser(clap::value_parser!(u16))
                    .help("The key tag"),
            )
    };

    Command::new("wardend")
        .version(crate_version!())
        .about("A DNSSEC key and signing policy enforcer")
        .next_line_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("The configuration file to use"),
        )
        .arg(
            Arg::new("check_config")
                .long("check-config")
                .action(clap::ArgAction::SetTrue)
                .help("Check the configuration and exit"),
        )
        .subcommand_required(true)
        .subcommand(Command::new("run").about("Run the enforcer daemon"))
        .subcommand(
            Command::new("policy")
                .about("Manage policies")
                .subcommand_required(true)
                .subcommand(
                    Command::new("load").about("Sync policy files into the store"),
                ),
        )
        .subcommand(
            Command::new("zone")
                .about("Manage zones")
                .subcommand_required(true)
                .subcommand(
                    Command::new("add")
                        .about("Put a zone under enforcement")
                        .arg(Arg::new("name").required(true).help("The zone name"))
                        .arg(
                            Arg::new("policy")
                                .long("policy")
                                .default_value("default")
                                .help("The policy to enforce"),
                        )
                        .arg(
                            Arg::new("input")
                                .long("input")
                                .help("The unsigned zone file"),
                        )
                        .arg(
                            Arg::new("output")
                                .long("output")
                                .help("The signed zone file"),
                        ),
                )
                .subcommand(
                    Command::new("remove")
                        .about("Stop enforcing a zone")
                        .arg(Arg::new("name").required(true).help("The zone name")),
                )
                .subcommand(Command::new("list").about("List zones and their status")),
        )
        .subcommand(zone_keytag(
            "ds-submit",
            "Confirm that a DS was submitted to the parent",
        ))
        .subcommand(zone_keytag(
            "ds-seen",
            "Confirm that the parent publishes a DS",
        ))
        .subcommand(zone_keytag(
            "ds-retract",
            "Confirm that a DS retraction was submitted to the parent",
        ))
        .subcommand(zone_keytag(
            "ds-gone",
            "Confirm that the parent no longer serves a DS",
        ))
        .subcommand(
            Command::new("roll")
                .about("Start a rollover now")
                .arg(Arg::new("zone").required(true).help("The zone name"))
                .arg(
                    Arg::new("role")
                        .required(true)
                        .value_parser(["ksk", "zsk", "csk"])
                        .help("The role to roll"),
                ),
        )
        .subcommand(
            Command::new("rollover-list")
                .about("Show scheduled rollovers")
                .arg(Arg::new("zone").long("zone").help("Limit to one zone")),
        )
}

fn zone_command(
    sub: &clap::ArgMatches,
    config: &Config,
    store: &Arc<dyn Backend>,
    factory: &Arc<KeyFactory>,
) -> ExitCode {
    match sub.subcommand() {
        Some(("add", m)) => {
            let name = m.get_one::<String>("name").expect("required");
            let policy = m.get_one::<String>("policy").expect("defaulted");
            let input = m
                .get_one::<String>("input")
                .cloned()
                .unwrap_or_else(|| format!("{name}.zone"));
            let output = m
                .get_one::<String>("output")
                .cloned()
                .unwrap_or_else(|| format!("{name}.zone.signed"));

            let result = control::zone_add(
                &**store,
                name,
                policy,
                config.signconf_path(name),
                Adapter::file(input),
                Adapter::file(output),
            )
            .map(|zone| {
                // Bind the initial key set right away.
                match enforcer::tick(&**store, factory, zone.id, UnixTime::now(), None) {
                    Ok(outcome) => {
                        println!("Zone '{name}' added ({})", outcome.status);
                    }
                    Err(err) => {
                        log::warn!("Zone '{name}' added but its first tick failed: {err}");
                    }
                }
            });
            report_control(result)
        }
        Some(("remove", m)) => {
            let name = m.get_one::<String>("name").expect("required");
            report_control(control::zone_remove(&**store, name))
        }
        Some(("list", _)) => {
            let result = control::zone_list(&**store).map(|zones| {
                for (zone, status) in zones {
                    let next = match zone.next_change {
                        Some(next) => next.to_string(),
                        None => "never".into(),
                    };
                    println!("{}\t{}\t{}", zone.name, status, next);
                }
            });
            report_control(result)
        }
        _ => unreachable!("subcommands are required"),
    }
}

fn report_control<T>(result: Result<T, ControlError>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::from(error.exit_code())
        }
    }
}

fn run_daemon(
    config: Config,
    store: Arc<dyn Backend>,
    factory: Arc<KeyFactory>,
    gen_rx: mpsc::UnboundedReceiver<KeySlot>,
) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            log::error!("Cannot start the runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        if let Err(error) = kasp::load_dir(&*store, &config.policy_dir) {
            log::error!("Cannot load policies: {error}");
            return ExitCode::FAILURE;
        }

        let scheduler = Scheduler::new(
            store.clone(),
            factory.clone(),
            config.scheduler_options(),
        );
        if let Err(error) = scheduler.load_zones() {
            log::error!("Cannot schedule zones: {error}");
            return ExitCode::FAILURE;
        }

        tokio::spawn(factory::run_generator(
            factory.clone(),
            store.clone(),
            gen_rx,
        ));

        log::info!("Warden is running");
        tokio::select! {
            _ = scheduler.run() => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
            }
        }
        ExitCode::SUCCESS
    })
}
