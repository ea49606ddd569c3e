//! Rollcall CLI: peer-verified attendance from the terminal
//!
//! Commands:
//!   rollcall start      open a session for a class
//!   rollcall end        end a session
//!   rollcall token      mint a teacher or student token payload
//!   rollcall checkin    check a student in
//!   rollcall scan       record a peer verification
//!   rollcall biometric  record a face-match result
//!   rollcall override   set or clear a teacher override
//!   rollcall recompute  re-derive trust scores for a session
//!   rollcall show       session summary and records
//!   rollcall fraud      analyze a class's ended sessions
//!   rollcall queue      inspect, replay or discard offline operations
//!   rollcall serve      run the replay daemon until Ctrl+C
//!   rollcall demo       run a full walkthrough in memory

use rollcall_core::attendance::{BiometricResult, OverrideDecision};
use rollcall_core::resilience::{DaemonConfig, Delivery, OfflineQueue, ReplayDaemon, ResilientClient};
use rollcall_core::service::{CheckInRequest, OverrideRequest, PeerScanRequest};
use rollcall_core::{
    AttendanceService, Clock, JsonFileStore, ManualClock, MemoryStore, ProtocolConfig, Session,
    SystemClock, Token,
};
use std::env;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::watch;

const STORE_FILE: &str = "rollcall-store.json";
const QUEUE_FILE: &str = "rollcall-queue.json";
const CONFIG_ENV: &str = "ROLLCALL_CONFIG";

type CliResult = Result<(), Box<dyn Error>>;

fn print_usage() {
    println!(
        r#"
Rollcall: peer-verified attendance

Usage: rollcall <command> [options]

Commands:
  start     <class> <teacher>                                  Open a session
  end       <session> <teacher>                                End a session
  token     teacher <session> <teacher>                        Mint a check-in token
  token     student <session> <student>                        Mint a peer token
  checkin   <session> <student> <name> [token-json]            Check a student in
  scan      <session> <scanner> <scanner-name> <peer> <peer-name> <token-json>
                                                               Verify a peer
  biometric <session> <student> <match|no-match|skip> [conf]   Record a face match
  override  <session> <student> <teacher> <present|absent|clear> [reason...]
                                                               Teacher override
  recompute <session>                                          Re-derive trust scores
  show      <session>                                          Summary and records
  fraud     <class>                                            Fraud analysis
  queue     [list|replay|discard <op-id>]                      Offline queue
  serve                                                        Replay daemon
  demo                                                         Full in-memory walkthrough

Environment:
  ROLLCALL_CONFIG   path to a JSON protocol config
  RUST_LOG          log filter (default: info)
"#
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let rest = &args[2..];
    let result = match args[1].as_str() {
        "start" => cmd_start(rest),
        "end" => cmd_end(rest),
        "token" => cmd_token(rest),
        "checkin" => cmd_checkin(rest),
        "scan" => cmd_scan(rest),
        "biometric" => cmd_biometric(rest),
        "override" => cmd_override(rest),
        "recompute" => cmd_recompute(rest),
        "show" => cmd_show(rest),
        "fraud" => cmd_fraud(rest),
        "queue" => cmd_queue(rest),
        "serve" => cmd_serve().await,
        "demo" => cmd_demo(),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("  Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config() -> Result<ProtocolConfig, Box<dyn Error>> {
    match env::var(CONFIG_ENV) {
        Ok(path) => Ok(ProtocolConfig::load(path)?),
        Err(_) => Ok(ProtocolConfig::default()),
    }
}

/// Service over the on-disk store
fn open_service() -> Result<Arc<AttendanceService>, Box<dyn Error>> {
    let config = load_config()?;
    let store = Arc::new(JsonFileStore::open(STORE_FILE)?);
    Ok(Arc::new(AttendanceService::new(store, Arc::new(SystemClock), config)))
}

fn open_client() -> Result<ResilientClient, Box<dyn Error>> {
    Ok(ResilientClient::new(open_service()?, OfflineQueue::open(QUEUE_FILE)?))
}

fn need<'a>(args: &'a [String], n: usize, usage: &str) -> Result<&'a [String], Box<dyn Error>> {
    if args.len() < n {
        return Err(format!("usage: rollcall {}", usage).into());
    }
    Ok(args)
}

fn report<T>(delivery: &Delivery<T>, describe: impl Fn(&T) -> String) {
    match delivery {
        Delivery::Confirmed(value) => println!("  {}", describe(value)),
        Delivery::Degraded { provisional, op_id } => {
            println!("  Store unreachable, queued as {}", op_id);
            if let Some(value) = provisional {
                println!("  (provisional) {}", describe(value));
            }
        }
    }
}

fn cmd_start(args: &[String]) -> CliResult {
    let args = need(args, 2, "start <class> <teacher>")?;
    let service = open_service()?;
    let session = service.start_session(&args[0], &args[1])?;
    println!("  {}", session.summary());
    println!("  Refresh the displayed token every {}s", session.token_refresh_interval_secs);
    Ok(())
}

fn cmd_end(args: &[String]) -> CliResult {
    let args = need(args, 2, "end <session> <teacher>")?;
    let client = open_client()?;
    let delivery = client.end_session(&args[0], &args[1])?;
    report(&delivery, Session::summary);
    Ok(())
}

fn cmd_token(args: &[String]) -> CliResult {
    let args = need(args, 3, "token <teacher|student> <session> <id>")?;
    let service = open_service()?;
    let token = match args[0].as_str() {
        "teacher" => service.issue_authority_token(&args[1], &args[2])?,
        "student" => service.issue_participant_token(&args[1], &args[2])?,
        other => return Err(format!("unknown token type '{}'", other).into()),
    };
    println!("{}", token.to_payload()?);
    Ok(())
}

fn cmd_checkin(args: &[String]) -> CliResult {
    let args = need(args, 3, "checkin <session> <student> <name> [token-json]")?;
    let token = args.get(3).map(|p| Token::from_payload(p)).transpose()?;
    let client = open_client()?;
    let delivery = client.check_in(&CheckInRequest {
        session_id: args[0].clone(),
        student_id: args[1].clone(),
        student_name: args[2].clone(),
        token,
    })?;
    report(&delivery, |r| r.summary());
    Ok(())
}

fn cmd_scan(args: &[String]) -> CliResult {
    let args = need(
        args,
        6,
        "scan <session> <scanner> <scanner-name> <peer> <peer-name> <token-json>",
    )?;
    let client = open_client()?;
    let delivery = client.verify_peer(&PeerScanRequest {
        session_id: args[0].clone(),
        scanner_id: args[1].clone(),
        scanner_name: args[2].clone(),
        peer_id: args[3].clone(),
        peer_name: args[4].clone(),
        token: Token::from_payload(&args[5])?,
    })?;
    report(&delivery, |o| {
        if o.already_verified() {
            "Already verified each other".to_string()
        } else {
            format!("Verified (scanner updated: {}, peer updated: {})", o.scanner_updated, o.peer_updated)
        }
    });
    Ok(())
}

fn cmd_biometric(args: &[String]) -> CliResult {
    let args = need(args, 3, "biometric <session> <student> <match|no-match|skip> [confidence]")?;
    let client = open_client()?;
    let now = client.service().now();
    let confidence: f64 = match args.get(3) {
        Some(c) => c.parse().map_err(|_| format!("confidence '{}' is not a number", c))?,
        None => 1.0,
    };
    let result = match args[2].as_str() {
        "match" => BiometricResult::completed(true, confidence, now),
        "no-match" => BiometricResult::completed(false, confidence, now),
        "skip" => BiometricResult::skipped(now),
        other => return Err(format!("unknown biometric outcome '{}'", other).into()),
    };
    let delivery = client.record_biometric(&args[0], &args[1], result)?;
    report(&delivery, |r| r.summary());
    Ok(())
}

fn cmd_override(args: &[String]) -> CliResult {
    let args = need(
        args,
        4,
        "override <session> <student> <teacher> <present|absent|clear> [reason...]",
    )?;
    let decision = match args[3].as_str() {
        "present" => OverrideDecision::Present,
        "absent" => OverrideDecision::Absent,
        "clear" => {
            let service = open_service()?;
            let record = service.clear_override(&args[0], &args[1], &args[2])?;
            println!("  {}", record.summary());
            return Ok(());
        }
        other => return Err(format!("unknown decision '{}'", other).into()),
    };
    let reason = (args.len() > 4).then(|| args[4..].join(" "));
    let client = open_client()?;
    let delivery = client.set_override(&OverrideRequest {
        session_id: args[0].clone(),
        student_id: args[1].clone(),
        requester_id: args[2].clone(),
        decision,
        reason,
    })?;
    report(&delivery, |r| r.summary());
    Ok(())
}

fn cmd_recompute(args: &[String]) -> CliResult {
    let args = need(args, 1, "recompute <session>")?;
    let service = open_service()?;
    let changed = service.recompute_all(&args[0])?;
    println!("  {} record(s) changed", changed);
    Ok(())
}

fn cmd_show(args: &[String]) -> CliResult {
    let args = need(args, 1, "show <session>")?;
    let service = open_service()?;
    print_session(&service, &args[0])
}

fn print_session(service: &AttendanceService, session_id: &str) -> CliResult {
    let session = service.get_session(session_id)?;
    let summary = service.session_summary(session_id)?;
    println!("  {}", session.summary());
    println!(
        "  {} checked in | present={} review={} absent={} overridden={}",
        summary.total, summary.present, summary.review, summary.absent, summary.overridden
    );
    for record in service.session_attendance(session_id)? {
        println!("    {}", record.summary());
    }
    Ok(())
}

fn cmd_fraud(args: &[String]) -> CliResult {
    let args = need(args, 1, "fraud <class>")?;
    let service = open_service()?;
    print_fraud_report(&service, &args[0])
}

fn cmd_queue(args: &[String]) -> CliResult {
    let client = open_client()?;
    match args.first().map(String::as_str).unwrap_or("list") {
        "list" => {
            let pending = client.queue().pending();
            println!("  {} pending operation(s)", pending.len());
            for entry in pending {
                println!("    {} {:?} queued {}", entry.id, entry.op.kind(), entry.enqueued_at);
            }
        }
        "replay" => {
            let report = client.replay()?;
            println!(
                "  replayed={} failed={} remaining={}",
                report.replayed, report.failed, report.remaining
            );
        }
        "discard" => {
            let args = need(args, 2, "queue discard <op-id>")?;
            client.discard(&args[1])?;
            println!("  Discarded {}", args[1]);
        }
        other => return Err(format!("unknown queue action '{}'", other).into()),
    }
    Ok(())
}

async fn cmd_serve() -> CliResult {
    let client = Arc::new(open_client()?);
    let config = DaemonConfig::from(client.service().config());
    println!("  Replay daemon over {} / {}", STORE_FILE, QUEUE_FILE);
    println!("  Press Ctrl+C to stop.\n");

    let (tx, rx) = watch::channel(false);
    let daemon = tokio::spawn(ReplayDaemon::new(config, client).run(rx));
    tokio::signal::ctrl_c().await?;
    println!("\n  Shutting down...");
    tx.send(true)?;
    daemon.await?;
    Ok(())
}

fn cmd_demo() -> CliResult {
    println!("\nRollcall demo (in-memory store, simulated clock)");
    println!("{}", "-".repeat(60));

    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::starting_now());
    let service = Arc::new(AttendanceService::new(
        store.clone(),
        clock.clone(),
        ProtocolConfig::default(),
    ));
    let students = ["ana", "ben", "cho", "dev", "eli"];

    // Step 1: three lectures where ana and ben only ever pair with each other
    println!("\nStep 1: Running three sessions of class cs101...");
    let mut last = None;
    for lecture in 1..=3 {
        let session = service.start_session("cs101", "prof")?;
        let teacher_token = service.issue_authority_token(&session.id, "prof")?;
        for s in students {
            service.check_in(&CheckInRequest {
                session_id: session.id.clone(),
                student_id: s.to_string(),
                student_name: s.to_uppercase(),
                token: Some(teacher_token.clone()),
            })?;
        }
        let pairs = [("ana", "ben"), ("cho", "dev"), ("dev", "eli"), ("eli", "cho")];
        for (scanner, peer) in pairs {
            let token = service.issue_participant_token(&session.id, peer)?;
            service.verify_peer(&PeerScanRequest {
                session_id: session.id.clone(),
                scanner_id: scanner.to_string(),
                scanner_name: scanner.to_uppercase(),
                peer_id: peer.to_string(),
                peer_name: peer.to_uppercase(),
                token,
            })?;
        }
        println!("  Lecture {}: {} checked in", lecture, students.len());
        if lecture < 3 {
            service.end_session(&session.id, "prof")?;
        } else {
            last = Some(session);
        }
        clock.advance_secs(3600);
    }
    let session = last.ok_or("no session")?;

    // Step 2: biometric and override on the live session
    println!("\nStep 2: Biometric and teacher override...");
    service.record_biometric(
        &session.id,
        "cho",
        BiometricResult::completed(false, 0.35, clock.now()),
    )?;
    service.set_override(&OverrideRequest {
        session_id: session.id.clone(),
        student_id: "ana".into(),
        requester_id: "prof".into(),
        decision: OverrideDecision::Present,
        reason: Some("seen in the front row".into()),
    })?;
    print_session(&service, &session.id)?;

    // Step 3: outage with a queued check-in
    println!("\nStep 3: Store outage and replay...");
    let client = ResilientClient::new(service.clone(), OfflineQueue::in_memory());
    store.set_online(false);
    let delivery = client.check_in(&CheckInRequest {
        session_id: session.id.clone(),
        student_id: "fay".into(),
        student_name: "FAY".into(),
        token: None,
    })?;
    report(&delivery, |r| r.summary());
    store.set_online(true);
    let replay = client.replay()?;
    println!(
        "  Replay: replayed={} failed={} remaining={}",
        replay.replayed, replay.failed, replay.remaining
    );
    service.end_session(&session.id, "prof")?;

    // Step 4: fraud analysis
    println!("\nStep 4: Fraud analysis...");
    print_fraud_report(&service, "cs101")?;
    Ok(())
}

fn print_fraud_report(service: &AttendanceService, class_id: &str) -> CliResult {
    let report = service.analyze_fraud(class_id)?;
    println!("  {}", report.summary);
    for pattern in &report.patterns {
        println!(
            "    [{:?}] {}: {}",
            pattern.severity,
            pattern.student_ids.join(", "),
            pattern.description
        );
    }
    Ok(())
}
