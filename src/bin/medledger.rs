//! Operator CLI for the medledger record-integrity core.
//!
//! Covers one-off cryptographic helpers (digesting, sealing, password
//! hashing), the record lifecycle against the configured store and ledger,
//! audit segment inspection, and a local development ledger node.

use medledger::audit::{FileAuditLog, RETENTION_DAYS};
use medledger::canonical;
use medledger::crypto::{generate_secure_token, CredentialHasher, EncryptedPayload, PasswordCost};
use medledger::devnet::{run_devnet, DevnetConfig, DEFAULT_CHAIN_ID};
use medledger::ledger::{HealthResponse, LedgerAnchor};
use medledger::verifier::VerifyResponse;
use medledger::{anchor_digest, seal_document, Config, ContentDigest, RecordIntegrityService};
use rpassword::prompt_password;
use serde::Serialize;
use serde_json::Value;
use std::{
    env, fs,
    io::{self, Read},
    net::SocketAddr,
    path::PathBuf,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_ACTOR: &str = "cli";
const ENV_CONFIG: &str = "MEDLEDGER_CONFIG";
const ENV_LOG_FILE: &str = "MEDLEDGER_LOG_FILE";

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn print_help() {
    println!("Usage: medledger <command> ...");
    println!("  digest <record.json|->");
    println!("  encrypt <record.json|-> [--config <file>] [--actor <name>]");
    println!("  decrypt <iv:tag:ciphertext> [--config <file>]");
    println!("  token [--bytes <N>]");
    println!("  hash-password [--cost low|default|high]");
    println!("  verify-password <hash>");
    println!("  health [--config <file>]");
    println!("  verify-digest <hex> [--config <file>]");
    println!("  anchor <hex> [--config <file>] [--actor <name>]");
    println!("  trail <hex> [--config <file>]");
    println!("  record <create|update|read|delete|history|anchor|verify|trail|replay> ...");
    println!("  audit <show|expired> ...");
    println!("  devnet [--listen <addr>] [--chain-id <N>] [--state <file>]");
}

fn print_record_help() {
    println!("Usage: medledger record <sub> ... [--config <file>] [--actor <name>]");
    println!("  create --kind <kind> --file <record.json> [--id <id>]");
    println!("  update <id> --file <record.json>");
    println!("  read <id> [--version <N>]");
    println!("  delete <id>");
    println!("  history <id>");
    println!("  anchor <id>");
    println!("  verify <id> [--version <N>]");
    println!("  trail <id>");
    println!("  replay [--state <file>]");
}

fn print_audit_help() {
    println!("Usage: medledger audit <show|expired> [--config <file>]");
    println!("  show [--day <YYYY-MM-DD>]");
    println!("  expired");
}

fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    let (writer, guard) = match env::var(ENV_LOG_FILE) {
        Ok(path) => {
            if let Some(parent) = std::path::Path::new(&path).parent() {
                let _ = fs::create_dir_all(parent);
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .unwrap_or_else(|err| fatal(&format!("failed to open log file {path}: {err}")));
            tracing_appender::non_blocking(file)
        }
        Err(_) => tracing_appender::non_blocking(io::stderr()),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .init();
    guard
}

fn main() {
    let _guard = init_tracing();
    let mut args = env::args().skip(1);
    let command = args.next();
    match command.as_deref() {
        Some("digest") => cmd_digest(args.collect()),
        Some("encrypt") => cmd_encrypt(args.collect()),
        Some("decrypt") => cmd_decrypt(args.collect()),
        Some("token") => cmd_token(args.collect()),
        Some("hash-password") => cmd_hash_password(args.collect()),
        Some("verify-password") => cmd_verify_password(args.collect()),
        Some("health") => cmd_health(args.collect()),
        Some("verify-digest") => cmd_verify_digest(args.collect()),
        Some("anchor") => cmd_anchor_digest(args.collect()),
        Some("trail") => cmd_digest_trail(args.collect()),
        Some("record") => {
            let sub = args.next().unwrap_or_else(|| {
                print_record_help();
                std::process::exit(1);
            });
            handle_record(&sub, args.collect());
        }
        Some("audit") => {
            let sub = args.next().unwrap_or_else(|| {
                print_audit_help();
                std::process::exit(1);
            });
            handle_audit(&sub, args.collect());
        }
        Some("devnet") => cmd_devnet(args.collect()),
        Some("-h") | Some("--help") | Some("help") => print_help(),
        Some(other) => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
        None => {
            print_help();
            std::process::exit(1);
        }
    }
}

fn handle_record(sub: &str, tail: Vec<String>) {
    let mut opts = RecordOptions::parse(tail);
    let runtime = runtime();
    runtime.block_on(async move {
        let config = load_config(opts.config.take());
        let service = RecordIntegrityService::from_config(&config)
            .await
            .unwrap_or_else(|err| fatal(&format!("failed to start service: {err}")));
        let actor = opts.actor.clone();
        match sub {
            "create" => {
                let kind = opts
                    .kind
                    .clone()
                    .unwrap_or_else(|| fatal("record create requires --kind"));
                let body = read_record_file(opts.file.as_deref());
                let receipt = match opts.positional.clone().or_else(|| opts.id.clone()) {
                    Some(id) => service.create_record_with_id(&id, &kind, &body, &actor),
                    None => service.create_record(&kind, &body, &actor),
                }
                .unwrap_or_else(|err| fatal(&format!("create failed: {err}")));
                print_json(&receipt);
            }
            "update" => {
                let id = opts.require_id("update");
                let body = read_record_file(opts.file.as_deref());
                let receipt = service
                    .update_record(&id, &body, &actor)
                    .unwrap_or_else(|err| fatal(&format!("update failed: {err}")));
                print_json(&receipt);
            }
            "read" => {
                let id = opts.require_id("read");
                let body = match opts.version {
                    Some(version) => service.read_version(&id, version, &actor),
                    None => service.read_record(&id, &actor),
                }
                .unwrap_or_else(|err| fatal(&format!("read failed: {err}")));
                print_json(&body);
            }
            "delete" => {
                let id = opts.require_id("delete");
                service
                    .delete_record(&id, &actor)
                    .unwrap_or_else(|err| fatal(&format!("delete failed: {err}")));
                println!("deleted: {id}");
            }
            "history" => {
                let id = opts.require_id("history");
                let history = service
                    .history(&id)
                    .unwrap_or_else(|err| fatal(&format!("history failed: {err}")));
                print_json(&history);
            }
            "anchor" => {
                let id = opts.require_id("anchor");
                let receipt = service
                    .anchor_record(&id, &actor)
                    .await
                    .unwrap_or_else(|err| fatal(&format!("anchor failed: {err}")));
                print_json(&receipt);
            }
            "verify" => {
                let id = opts.require_id("verify");
                let report = match opts.version {
                    Some(version) => service.verify_version(&id, version, &actor).await,
                    None => service.verify_record(&id, &actor).await,
                }
                .unwrap_or_else(|err| fatal(&format!("verify failed: {err}")));
                if opts.full {
                    print_json(&report);
                } else {
                    print_json(&VerifyResponse::from(&report));
                }
            }
            "trail" => {
                let id = opts.require_id("trail");
                let events = service
                    .audit_trail(&id)
                    .await
                    .unwrap_or_else(|err| fatal(&format!("trail failed: {err}")));
                print_json(&events);
            }
            "replay" => {
                let summary = service
                    .replay_dead_letters(opts.state.as_deref())
                    .unwrap_or_else(|err| fatal(&format!("replay failed: {err}")));
                println!("enqueued: {}", summary.enqueued);
                println!("skipped: {}", summary.skipped);
                println!("deferred: {}", summary.deferred);
                println!("state_path: {}", summary.state_path.display());
            }
            "-h" | "--help" => print_record_help(),
            other => {
                eprintln!("unknown record command: {other}");
                print_record_help();
                std::process::exit(1);
            }
        }
        service.shutdown().await;
    });
}

#[derive(Debug)]
struct RecordOptions {
    positional: Option<String>,
    id: Option<String>,
    kind: Option<String>,
    file: Option<String>,
    version: Option<u32>,
    state: Option<PathBuf>,
    config: Option<PathBuf>,
    actor: String,
    full: bool,
}

impl RecordOptions {
    fn parse(args: Vec<String>) -> Self {
        let mut opts = Self {
            positional: None,
            id: None,
            kind: None,
            file: None,
            version: None,
            state: None,
            config: None,
            actor: DEFAULT_ACTOR.to_string(),
            full: false,
        };
        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--id" => {
                    opts.id = Some(iter.next().unwrap_or_else(|| fatal("--id expects a value")));
                }
                "--kind" => {
                    opts.kind = Some(
                        iter.next()
                            .unwrap_or_else(|| fatal("--kind expects a value")),
                    );
                }
                "--file" => {
                    opts.file = Some(
                        iter.next()
                            .unwrap_or_else(|| fatal("--file expects a value")),
                    );
                }
                "--version" => {
                    let raw = iter
                        .next()
                        .unwrap_or_else(|| fatal("--version expects a value"));
                    opts.version = Some(
                        raw.parse()
                            .unwrap_or_else(|_| fatal(&format!("invalid version: {raw}"))),
                    );
                }
                "--state" => {
                    opts.state = Some(PathBuf::from(
                        iter.next()
                            .unwrap_or_else(|| fatal("--state expects a value")),
                    ));
                }
                "--config" => {
                    opts.config = Some(PathBuf::from(
                        iter.next()
                            .unwrap_or_else(|| fatal("--config expects a value")),
                    ));
                }
                "--actor" => {
                    opts.actor = iter
                        .next()
                        .unwrap_or_else(|| fatal("--actor expects a value"));
                }
                "--full" => opts.full = true,
                value if value.starts_with("--") => {
                    fatal(&format!("unknown argument: {value}"));
                }
                value => {
                    if opts.positional.is_none() {
                        opts.positional = Some(value.to_string());
                    } else {
                        fatal(&format!("unexpected argument: {value}"));
                    }
                }
            }
        }
        opts
    }

    fn require_id(&self, command: &str) -> String {
        self.positional
            .clone()
            .or_else(|| self.id.clone())
            .unwrap_or_else(|| fatal(&format!("Usage: medledger record {command} <id> ...")))
    }
}

fn handle_audit(sub: &str, tail: Vec<String>) {
    let mut config_path = None;
    let mut day = None;
    let mut iter = tail.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(PathBuf::from(
                    iter.next()
                        .unwrap_or_else(|| fatal("--config expects a value")),
                ));
            }
            "--day" => {
                let raw = iter.next().unwrap_or_else(|| fatal("--day expects a value"));
                day = Some(
                    chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                        .unwrap_or_else(|_| fatal(&format!("invalid day: {raw}"))),
                );
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let config = load_config(config_path);
    let log = open_audit(&config);
    let today = chrono::Utc::now().date_naive();
    match sub {
        "show" => {
            let entries = log
                .read_day(day.unwrap_or(today))
                .unwrap_or_else(|err| fatal(&format!("failed to read audit segment: {err}")));
            for entry in entries {
                match serde_json::to_string(&entry) {
                    Ok(line) => println!("{line}"),
                    Err(err) => eprintln!("failed to encode audit entry: {err}"),
                }
            }
        }
        "expired" => {
            let expired = log
                .expired_segments(today)
                .unwrap_or_else(|err| fatal(&format!("failed to list segments: {err}")));
            println!("retention_days: {RETENTION_DAYS}");
            for path in expired {
                println!("{}", path.display());
            }
        }
        "-h" | "--help" => print_audit_help(),
        other => {
            eprintln!("unknown audit command: {other}");
            print_audit_help();
            std::process::exit(1);
        }
    }
}

fn cmd_digest(args: Vec<String>) {
    let source = args.first().map(String::as_str);
    let body = read_record_file(source);
    let digest = canonical::digest(&body)
        .unwrap_or_else(|err| fatal(&format!("failed to digest record: {err}")));
    println!("{digest}");
}

fn cmd_encrypt(args: Vec<String>) {
    let (positional, config_path) = split_config_flag(args);
    let (positional, actor) = split_actor_flag(positional);
    let body = read_record_file(positional.first().map(String::as_str));
    let config = load_config(config_path);
    let crypto = config
        .crypto_box()
        .unwrap_or_else(|err| fatal(&format!("invalid encryption key: {err}")));
    let audit = open_audit(&config);
    let sealed = seal_document(&crypto, &audit, &body, &actor)
        .unwrap_or_else(|err| fatal(&format!("encryption failed: {err}")));
    println!("{}", sealed.to_text());
}

fn cmd_decrypt(args: Vec<String>) {
    let (positional, config_path) = split_config_flag(args);
    let text = positional
        .first()
        .cloned()
        .unwrap_or_else(|| fatal("Usage: medledger decrypt <iv:tag:ciphertext>"));
    let payload = EncryptedPayload::from_text(&text)
        .unwrap_or_else(|err| fatal(&format!("malformed payload: {err}")));
    let crypto = load_config(config_path)
        .crypto_box()
        .unwrap_or_else(|err| fatal(&format!("invalid encryption key: {err}")));
    let body = crypto
        .decrypt_json(&payload)
        .unwrap_or_else(|err| fatal(&format!("decryption failed: {err}")));
    print_json(&body);
}

fn cmd_token(args: Vec<String>) {
    let mut bytes = 32usize;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--bytes" => {
                let raw = iter
                    .next()
                    .unwrap_or_else(|| fatal("--bytes expects a value"));
                bytes = raw
                    .parse()
                    .unwrap_or_else(|_| fatal(&format!("invalid byte count: {raw}")));
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    println!("{}", generate_secure_token(bytes));
}

fn cmd_hash_password(args: Vec<String>) {
    let mut cost = PasswordCost::DEFAULT;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--cost" => {
                let raw = iter.next().unwrap_or_else(|| fatal("--cost expects a value"));
                cost = PasswordCost::from_name(&raw)
                    .unwrap_or_else(|| fatal(&format!("unknown cost profile: {raw}")));
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let password = prompt_password("Password: ")
        .unwrap_or_else(|err| fatal(&format!("failed to read password: {err}")));
    let hash = CredentialHasher::new(cost)
        .hash_password(&password)
        .unwrap_or_else(|err| fatal(&format!("hashing failed: {err}")));
    println!("{hash}");
}

fn cmd_verify_password(args: Vec<String>) {
    let hash = args
        .first()
        .cloned()
        .unwrap_or_else(|| fatal("Usage: medledger verify-password <hash>"));
    let password = prompt_password("Password: ")
        .unwrap_or_else(|err| fatal(&format!("failed to read password: {err}")));
    if CredentialHasher::new(PasswordCost::DEFAULT).verify_password(&password, &hash) {
        println!("match");
    } else {
        fatal("mismatch");
    }
}

fn cmd_health(args: Vec<String>) {
    let (_, config_path) = split_config_flag(args);
    let config = load_config(config_path);
    let health = runtime().block_on(async {
        let ledger = LedgerAnchor::connect(config.ledger_settings()).await;
        ledger.check_health().await
    });
    print_json(&HealthResponse::from(health));
}

fn cmd_verify_digest(args: Vec<String>) {
    let (positional, config_path) = split_config_flag(args);
    let digest = parse_digest(
        positional
            .first()
            .map(String::as_str)
            .unwrap_or_else(|| fatal("Usage: medledger verify-digest <hex>")),
    );
    let config = load_config(config_path);
    let result = runtime().block_on(async {
        let ledger = LedgerAnchor::connect(config.ledger_settings()).await;
        ledger.verify(&digest).await
    });
    match result {
        Ok(verification) => print_json(&verification),
        Err(err) => fatal(&format!("ledger lookup failed: {err}")),
    }
}

fn cmd_anchor_digest(args: Vec<String>) {
    let (positional, config_path) = split_config_flag(args);
    let (positional, actor) = split_actor_flag(positional);
    let digest = parse_digest(
        positional
            .first()
            .map(String::as_str)
            .unwrap_or_else(|| fatal("Usage: medledger anchor <hex>")),
    );
    let config = load_config(config_path);
    let audit = open_audit(&config);
    let result = runtime().block_on(async {
        let ledger = LedgerAnchor::connect(config.ledger_settings()).await;
        anchor_digest(&ledger, &audit, &digest, &actor).await
    });
    match result {
        Ok(reference) => print_json(&reference),
        Err(err) => fatal(&format!("anchor failed: {err}")),
    }
}

fn cmd_digest_trail(args: Vec<String>) {
    let (positional, config_path) = split_config_flag(args);
    let digest = parse_digest(
        positional
            .first()
            .map(String::as_str)
            .unwrap_or_else(|| fatal("Usage: medledger trail <hex>")),
    );
    let config = load_config(config_path);
    let events = runtime().block_on(async {
        let ledger = LedgerAnchor::connect(config.ledger_settings()).await;
        ledger.audit_trail(&digest).await
    });
    print_json(&events);
}

fn cmd_devnet(args: Vec<String>) {
    let mut listen: SocketAddr = "127.0.0.1:8545"
        .parse()
        .unwrap_or_else(|_| fatal("invalid default listen address"));
    let mut chain_id = DEFAULT_CHAIN_ID;
    let mut state_path: Option<PathBuf> = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--listen" => {
                let raw = iter
                    .next()
                    .unwrap_or_else(|| fatal("--listen expects a value"));
                listen = raw
                    .parse()
                    .unwrap_or_else(|_| fatal(&format!("invalid listen address: {raw}")));
            }
            "--chain-id" => {
                let raw = iter
                    .next()
                    .unwrap_or_else(|| fatal("--chain-id expects a value"));
                chain_id = raw
                    .parse()
                    .unwrap_or_else(|_| fatal(&format!("invalid chain id: {raw}")));
            }
            "--state" => {
                state_path = Some(PathBuf::from(
                    iter.next()
                        .unwrap_or_else(|| fatal("--state expects a value")),
                ));
            }
            "-h" | "--help" => {
                println!("Usage: medledger devnet [--listen <addr>] [--chain-id <N>] [--state <file>]");
                return;
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let mut cfg = DevnetConfig::new(listen, chain_id);
    if let Some(path) = state_path {
        cfg = cfg.with_state_path(path);
    }
    println!("devnet_url: http://{listen}");
    println!("contract: {}", cfg.contract);
    println!("chain_id: {chain_id}");
    let runtime = runtime();
    runtime.block_on(async move {
        tokio::select! {
            res = run_devnet(cfg) => {
                if let Err(err) = res {
                    fatal(&format!("devnet error: {err}"));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(evt = "DEVNET_STOP", "devnet interrupted");
            }
        }
    });
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| fatal(&format!("failed to start runtime: {err}")))
}

fn load_config(path: Option<PathBuf>) -> Config {
    let path = path.or_else(|| env::var(ENV_CONFIG).ok().map(PathBuf::from));
    Config::load(path.as_deref()).unwrap_or_else(|err| fatal(&format!("config error: {err}")))
}

fn split_config_flag(args: Vec<String>) -> (Vec<String>, Option<PathBuf>) {
    let mut positional = Vec::new();
    let mut config = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            config = Some(PathBuf::from(
                iter.next()
                    .unwrap_or_else(|| fatal("--config expects a value")),
            ));
        } else {
            positional.push(arg);
        }
    }
    (positional, config)
}

fn split_actor_flag(args: Vec<String>) -> (Vec<String>, String) {
    let mut positional = Vec::new();
    let mut actor = DEFAULT_ACTOR.to_string();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--actor" {
            actor = iter
                .next()
                .unwrap_or_else(|| fatal("--actor expects a value"));
        } else {
            positional.push(arg);
        }
    }
    (positional, actor)
}

fn open_audit(config: &Config) -> FileAuditLog {
    FileAuditLog::open(&config.audit_dir)
        .unwrap_or_else(|err| fatal(&format!("failed to open audit log: {err}")))
}

fn read_record_file(source: Option<&str>) -> Value {
    let raw = match source {
        None | Some("-") => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .unwrap_or_else(|err| fatal(&format!("failed to read stdin: {err}")));
            buf
        }
        Some(path) => fs::read_to_string(path)
            .unwrap_or_else(|err| fatal(&format!("failed to read {path}: {err}"))),
    };
    serde_json::from_str(&raw).unwrap_or_else(|err| fatal(&format!("invalid JSON record: {err}")))
}

fn print_json<T: Serialize>(value: &T) {
    let pretty =
        serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"));
    println!("{pretty}");
}

fn parse_digest(raw: &str) -> ContentDigest {
    ContentDigest::from_hex(raw).unwrap_or_else(|err| fatal(&format!("invalid digest: {err}")))
}
