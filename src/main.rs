use std::path::PathBuf;
use std::sync::Arc;

use clap::{App, Arg, ArgMatches};

use kiwi::catalog::Catalog;
use kiwi::config::Config;
use kiwi::error::{EXIT_BAD_INVOCATION, EXIT_ERROR, EXIT_OK};

const ABOUT: &str = r#"
kiwi — an extensible command dispatcher

Discovers, fetches, and runs user-contributed modules on behalf of the
local user, and optionally exposes the same modules over HTTP so a remote
kiwi can invoke a module's server-side half and retrieve its response.
"#;

const ARG_LIST_MODULES: &str = "list_modules";
const ARG_GET_MODULES: &str = "get_modules";
const ARG_UPDATE_MODULES: &str = "update_modules";
const ARG_SELF_UPDATE: &str = "self_update";
const ARG_DUMP_CONFIG: &str = "dump_config";
const ARG_START_SERVER: &str = "start_server";
const ARG_YES: &str = "yes";
const ARG_SERVER: &str = "server";
const ARG_CONFIG: &str = "config";
const ARG_HOME: &str = "home";
const ARG_MODULE: &str = "module";
const ARG_MODULE_ARGS: &str = "module_args";

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .event_format(kiwi::log_format::KiwiFormatter)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!(version = kiwi::version::KIWI_VERSION, "kiwi starting");

    let matches = cli().get_matches();
    let code = run(&matches).await;
    std::process::exit(code);
}

fn cli() -> App<'static, 'static> {
    App::new("kiwi")
        .version(clap::crate_version!())
        .about(ABOUT)
        .setting(clap::AppSettings::TrailingVarArg)
        .arg(Arg::with_name(ARG_LIST_MODULES).long("list-modules").help("list installed and remote modules"))
        .arg(
            Arg::with_name(ARG_GET_MODULES)
                .long("get-modules")
                .value_name("NAMES")
                .takes_value(true)
                .multiple(true)
                .help("fetch one or more modules by name, or 'all'"),
        )
        .arg(
            Arg::with_name(ARG_UPDATE_MODULES)
                .long("update-modules")
                .value_name("NAMES")
                .takes_value(true)
                .multiple(true)
                .help("update one or more modules by name, or 'all'"),
        )
        .arg(Arg::with_name(ARG_SELF_UPDATE).long("self-update").help("replace this binary with the remote one if it differs"))
        .arg(
            Arg::with_name(ARG_DUMP_CONFIG)
                .long("dump-config")
                .value_name("PATH")
                .takes_value(true)
                .help("write the canonical configuration to PATH"),
        )
        .arg(Arg::with_name(ARG_START_SERVER).long("start-server").help("start (or stop, if already running) the daemon"))
        .arg(Arg::with_name(ARG_YES).long("yes").short("y").help("pre-answer 'y' to every interactive prompt"))
        .arg(Arg::with_name(ARG_SERVER).long("server").help("run the daemon in the foreground instead of detaching"))
        .arg(
            Arg::with_name(ARG_CONFIG)
                .long("config")
                .env("KIWI_CONFIG")
                .value_name("PATH")
                .takes_value(true)
                .help("override the configuration file path"),
        )
        .arg(
            Arg::with_name(ARG_HOME)
                .long("home")
                .env("HOME")
                .value_name("PATH")
                .takes_value(true)
                .help("the kiwi home directory (defaults to ~/.kiwi)"),
        )
        .arg(Arg::with_name(ARG_MODULE).help("the module to run").index(1))
        .arg(Arg::with_name(ARG_MODULE_ARGS).help("arguments passed to the module").index(2).multiple(true))
}

async fn run(matches: &ArgMatches<'_>) -> i32 {
    let home_dir = resolve_home_dir(matches);
    let config_path = matches.value_of(ARG_CONFIG).map(PathBuf::from).unwrap_or_else(|| home_dir.join("kiwi.toml"));

    let config = match Config::load(&home_dir, Some(&config_path)) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("configuration is malformed: {:#}", e);
            return EXIT_ERROR;
        }
    };

    let auto_yes = matches.is_present(ARG_YES);

    match dispatch(matches, config, auto_yes).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{:#}", e);
            EXIT_ERROR
        }
    }
}

fn resolve_home_dir(matches: &ArgMatches) -> PathBuf {
    matches
        .value_of(ARG_HOME)
        .map(|h| PathBuf::from(h).join(".kiwi"))
        .unwrap_or_else(|| PathBuf::from(".").join(".kiwi"))
}

async fn dispatch(matches: &ArgMatches<'_>, config: Arc<Config>, auto_yes: bool) -> anyhow::Result<i32> {
    if let Some(path) = matches.value_of(ARG_DUMP_CONFIG) {
        std::fs::write(path, config.dump())?;
        return Ok(EXIT_OK);
    }

    if matches.is_present(ARG_LIST_MODULES) {
        return list_modules(&config).await;
    }

    if let Some(names) = matches.values_of(ARG_GET_MODULES) {
        return fetch_modules(&config, names.map(str::to_owned).collect(), false, auto_yes).await;
    }

    if let Some(names) = matches.values_of(ARG_UPDATE_MODULES) {
        return fetch_modules(&config, names.map(str::to_owned).collect(), true, auto_yes).await;
    }

    if matches.is_present(ARG_SELF_UPDATE) {
        return self_update(&config).await;
    }

    if matches.is_present(ARG_START_SERVER) {
        kiwi::daemon::start(config, matches.is_present(ARG_SERVER)).await?;
        return Ok(EXIT_OK);
    }

    match matches.value_of(ARG_MODULE) {
        Some(name) => {
            let argline = matches
                .values_of(ARG_MODULE_ARGS)
                .map(|vs| vs.collect::<Vec<_>>().join(" "))
                .unwrap_or_default();
            let client = !matches.is_present(ARG_SERVER);
            let (code, captured) = kiwi::loader::run(config, name, &argline, client, true, auto_yes).await?;
            if !captured.is_empty() {
                print!("{}", captured);
            }
            Ok(code)
        }
        None => {
            eprintln!("no module named and no other action requested");
            Ok(EXIT_BAD_INVOCATION)
        }
    }
}

async fn list_modules(config: &Arc<Config>) -> anyhow::Result<i32> {
    let catalog = Catalog::new(config);
    let installed = catalog.installed()?;

    let remote_names = match catalog.remote_manifest().await {
        Ok(manifest) => manifest.names(),
        Err(_) => {
            println!("could not reach remote to fetch module list, listing local modules only");
            for name in &installed {
                println!("[x] {}: {}", name, catalog.description(name));
            }
            return Ok(EXIT_OK);
        }
    };

    for (name, mark) in catalog.classify(&installed, &remote_names) {
        println!("[{}] {}: {}", mark, name, catalog.description(&name));
    }
    Ok(EXIT_OK)
}

async fn fetch_modules(config: &Arc<Config>, names: Vec<String>, for_update: bool, auto_yes: bool) -> anyhow::Result<i32> {
    let catalog = Catalog::new(config);
    let report = catalog.fetch(&names, for_update, for_update).await?;

    if !report.fetched.is_empty() {
        println!("{} module(s) fetched: {}", report.fetched.len(), report.fetched.join(", "));
    } else {
        println!("0 new modules fetched");
    }

    if !report.updatable.is_empty() {
        let prompt = format!(
            "{} module(s) have updates available: {}. Apply now?",
            report.updatable.len(),
            report.updatable.join(", ")
        );
        let answer = if auto_yes {
            "y".to_owned()
        } else {
            kiwi::helper::HelperState::new("kiwi", "", config.modules_dir(), config.clone(), auto_yes)?
                .ask(&prompt, &["y".to_owned(), "n".to_owned()], Some("n"))
        };
        if answer == "y" {
            let forced = catalog.fetch(&report.updatable, true, false).await?;
            println!("{} module(s) updated", forced.fetched.len());
        }
    }

    if !report.failed.is_empty() {
        println!("Tip: the following modules could not be resolved: {}", report.failed.join(", "));
        return Ok(EXIT_ERROR);
    }

    Ok(EXIT_OK)
}

async fn self_update(config: &Arc<Config>) -> anyhow::Result<i32> {
    let catalog = Catalog::new(config);
    let manifest = catalog.remote_manifest().await?;

    let entry = match manifest.entry("kiwi") {
        Some(e) => e,
        None => {
            println!("remote manifest does not list a kiwi binary");
            return Ok(EXIT_OK);
        }
    };

    let remote_hash = match entry.files.first() {
        Some(f) => &f.sha256,
        None => {
            println!("remote kiwi entry has no files");
            return Ok(EXIT_OK);
        }
    };

    let current_exe = std::env::current_exe()?;
    let local_bytes = std::fs::read(&current_exe)?;
    let local_hash = kiwi::manifest::sha256_hex(&local_bytes);

    if &local_hash == remote_hash {
        println!("I'm up to date");
        return Ok(EXIT_OK);
    }

    let base_url = config.get_str("remote.base_url").unwrap_or_default();
    let url = format!("{}/assets/kiwi/", base_url.trim_end_matches('/'));
    let bytes = reqwest::get(&url).await?.error_for_status()?.bytes().await?;
    kiwi::catalog::atomic_write(&current_exe, &bytes).await?;
    println!("kiwi updated to the latest version");
    Ok(EXIT_OK)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cli_parses_module_invocation_with_extra_args() {
        let matches = cli().get_matches_from(vec!["kiwi", "helloworld", "-n", "Ada"]);
        assert_eq!(Some("helloworld"), matches.value_of(ARG_MODULE));
        let extra: Vec<&str> = matches.values_of(ARG_MODULE_ARGS).unwrap().collect();
        assert_eq!(vec!["-n", "Ada"], extra);
    }

    #[test]
    fn cli_treats_unrecognized_flags_after_the_module_name_as_module_args() {
        // Without AppSettings::TrailingVarArg, clap would reject "-s" here as
        // an unknown top-level flag instead of handing it to module_args.
        let matches = cli().get_matches_from(vec!["kiwi", "helloworld", "-n", "Ada", "-s"]);
        assert_eq!(Some("helloworld"), matches.value_of(ARG_MODULE));
        let extra: Vec<&str> = matches.values_of(ARG_MODULE_ARGS).unwrap().collect();
        assert_eq!(vec!["-n", "Ada", "-s"], extra);
    }

    #[test]
    fn cli_parses_get_modules_with_multiple_names() {
        let matches = cli().get_matches_from(vec!["kiwi", "--get-modules", "journal", "storage"]);
        let names: Vec<&str> = matches.values_of(ARG_GET_MODULES).unwrap().collect();
        assert_eq!(vec!["journal", "storage"], names);
    }
}
