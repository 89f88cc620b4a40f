//! Outreach Engine: automated multi-step contact sequences.
//!
//! Wires the sequence engine to the in-process channels, seeds demo
//! sequences and contacts, then runs the worker for a fixed period.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use outreach_channels::{
    EmailTemplate, EngagementLog, InMemoryContactStore, LoopbackTransport,
    RecordingWebhookClient, TemplateRegistry,
};
use outreach_core::config::AppConfig;
use outreach_core::event_bus::{capture_sink, EventSink, FanoutSink, TracingSink};
use outreach_core::types::{Contact, EngagementEvent, EngagementKind};
use outreach_sequences::enrollment::EnrollOptions;
use outreach_sequences::types::{
    ActionStep, ConditionStep, DayType, EmailStep, Predicate, Sequence, Step, StepAction,
    StepKind,
};
use outreach_sequences::{Collaborators, SequenceEngine};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "outreach-engine")]
#[command(about = "Automated multi-step outreach sequences")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "OUTREACH__NODE_ID")]
    node_id: Option<String>,

    /// Concurrent step executions (overrides config)
    #[arg(long, env = "OUTREACH__EXECUTOR__MAX_CONCURRENCY")]
    workers: Option<usize>,

    /// Queue poll interval in milliseconds (overrides config)
    #[arg(long, env = "OUTREACH__SCHEDULER__POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Number of demo contacts to enroll
    #[arg(long, default_value_t = 25)]
    demo_contacts: usize,

    /// Seconds to run the worker before shutting down
    #[arg(long, default_value_t = 5)]
    run_for_secs: u64,

    /// Expose Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outreach_engine=info,outreach_sequences=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Outreach Engine starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(workers) = cli.workers {
        config.executor.max_concurrency = workers;
    }
    if let Some(poll) = cli.poll_interval_ms {
        config.scheduler.poll_interval_ms = poll;
    }

    info!(
        node_id = %config.node_id,
        workers = config.executor.max_concurrency,
        poll_interval_ms = config.scheduler.poll_interval_ms,
        default_zone = %config.scheduler.default_utc_offset,
        "Configuration loaded"
    );

    if let Some(port) = cli.metrics_port {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
            .install_recorder();
        match handle {
            Ok(handle) => {
                info!(port, "Metrics exporter started");
                std::mem::forget(handle);
            }
            Err(e) => error!(error = %e, "Failed to start metrics exporter"),
        }
    }

    let templates = Arc::new(TemplateRegistry::new());
    register_email_templates(&templates);
    let contacts = Arc::new(InMemoryContactStore::new());
    let transport = Arc::new(LoopbackTransport::new());
    let engagement = Arc::new(EngagementLog::new());
    let events = capture_sink();
    let sinks: Vec<Arc<dyn EventSink>> = vec![
        Arc::new(TracingSink::new(config.node_id.clone())),
        events.clone(),
    ];

    let engine = SequenceEngine::builder(Collaborators {
        renderer: templates,
        transport: transport.clone(),
        contacts: contacts.clone(),
        engagement,
        webhooks: Arc::new(RecordingWebhookClient::new()),
    })
    .with_event_sink(Arc::new(FanoutSink::new(sinks)))
    .with_config(config)
    .build();

    let seeded = engine.seed_demo_sequences()?;
    let warm_up = create_warm_up_sequence(&engine)?;

    let contact_ids: Vec<Uuid> = (0..cli.demo_contacts)
        .map(|i| contacts.upsert(demo_contact(i)))
        .collect();
    let manager = engine.manager();
    let options = EnrollOptions {
        enrolled_by: "outreach-engine".to_string(),
        method: "demo".to_string(),
    };
    for sequence_id in std::iter::once(&warm_up).chain(seeded.iter()) {
        let mut variables = HashMap::new();
        variables.insert("campaign".to_string(), serde_json::json!("demo"));
        let bulk = manager
            .enroll_many(sequence_id, &contact_ids, variables, options.clone())
            .await?;
        info!(
            sequence_id = %sequence_id,
            enrolled = bulk.enrolled.len(),
            skipped = bulk.skipped.len(),
            "Demo contacts enrolled"
        );
    }

    let worker = engine.worker();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(worker.run(shutdown_rx));

    // Let the first batch go out, then feed back some opens.
    tokio::time::sleep(Duration::from_secs(cli.run_for_secs.min(1))).await;
    let mut opens = 0;
    for (i, sent) in transport.outbox().iter().enumerate() {
        if i % 3 != 0 {
            continue;
        }
        let meta = &sent.message.metadata;
        let ids = (
            meta.get("enrollment_id").and_then(|v| v.parse::<Uuid>().ok()),
            meta.get("step_id").and_then(|v| v.parse::<Uuid>().ok()),
        );
        let (Some(enrollment_id), Some(step_id)) = ids else {
            continue;
        };
        let Ok(enrollment) = manager.get(&enrollment_id) else {
            continue;
        };
        let event = EngagementEvent::new(enrollment.contact_id, EngagementKind::Opened)
            .correlated(enrollment_id, step_id);
        if engine.analytics().record_engagement(event).await? {
            opens += 1;
        }
    }
    info!(opens, "Demo engagement recorded");

    tokio::time::sleep(Duration::from_secs(cli.run_for_secs.saturating_sub(1))).await;
    let _ = shutdown_tx.send(());
    if let Err(e) = handle.await {
        error!(error = %e, "Worker task failed");
    }

    for sequence_id in std::iter::once(&warm_up).chain(seeded.iter()) {
        let report = engine.analytics().report(sequence_id)?;
        info!(
            sequence = %report.sequence_name,
            enrolled = report.total_enrolled,
            active = report.total_active,
            completed = report.total_completed,
            report = %serde_json::to_string(&report)?,
            "Sequence report"
        );
    }

    let chain = engine.ledger().verify_chain();
    info!(
        entries = chain.total_entries,
        intact = chain.chain_intact,
        emails_sent = transport.sent_count(),
        events_emitted = events.count(),
        "Outreach Engine shutting down"
    );
    Ok(())
}

fn register_email_templates(registry: &TemplateRegistry) {
    for (slug, subject, body) in [
        ("warm_up", "Welcome, {{first_name}}", "Thanks for joining {{sequence_name}}."),
        ("cold_intro", "Quick question, {{first_name}}", "Hi {{first_name}}, is {{company}} hiring?"),
        ("cold_follow_up", "Following up", "Circling back on my last note, {{first_name}}."),
        ("cold_breakup", "Closing the loop", "I'll stop here. Unsubscribe: {{unsubscribe_url}}"),
        ("meeting_recap", "Recap of our call", "Great speaking with you, {{first_name}}."),
        ("meeting_check_in", "Checking in", "Any questions on the proposal for {{company}}?"),
    ] {
        registry.register(EmailTemplate::new(slug, subject, body));
    }
}

/// Sends immediately and finishes within one poll cycle so the demo shows a
/// complete run.
fn create_warm_up_sequence(engine: &SequenceEngine) -> anyhow::Result<Uuid> {
    let mut sequence = Sequence::new("Demo Warm-up");
    sequence.description = "Welcome email, engagement check and tagging".to_string();
    sequence.send_window.timezone_optimized = false;
    sequence.send_window.skip_weekends = false;

    let store = engine.store();
    let id = store.create_sequence(sequence)?;
    let steps = [
        Step::new(
            0,
            "Welcome",
            StepKind::Email(EmailStep {
                template_id: "warm_up".to_string(),
                subject_override: None,
                variant: None,
            }),
        ),
        Step::new(
            1,
            "Opened?",
            StepKind::Condition(ConditionStep {
                predicate: Predicate::HasOpened,
            }),
        ),
        Step::new(
            2,
            "Tag",
            StepKind::Action(ActionStep {
                action: StepAction::AddTag {
                    tag: "warmed_up".to_string(),
                },
            }),
        ),
    ];
    for step in steps {
        store.add_step(&id, step.with_delay(0, 0, DayType::Calendar))?;
    }
    engine.manager().activate_sequence(&id)?;
    Ok(id)
}

fn demo_contact(i: usize) -> Contact {
    let mut contact = Contact::new(format!("contact{}@example.com", i));
    contact.first_name = format!("Contact{}", i);
    contact.last_name = "Demo".to_string();
    contact.company = "Example Corp".to_string();
    contact.timezone = match i % 3 {
        0 => Some("+05:30".to_string()),
        1 => Some("-08:00".to_string()),
        _ => None,
    };
    contact
}
