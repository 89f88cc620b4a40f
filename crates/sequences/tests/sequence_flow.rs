//! End-to-end sequence flows against the in-process channels.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use outreach_channels::{
        EmailTemplate, EngagementLog, InMemoryContactStore, LoopbackTransport,
        RecordingWebhookClient, TemplateRegistry,
    };
    use outreach_core::event_bus::{capture_sink, CaptureSink};
    use outreach_core::types::{Contact, EngagementEvent, EngagementKind, SequenceEventType};
    use outreach_core::{AppConfig, CollaboratorError};
    use outreach_sequences::clock::{Clock, ManualClock};
    use outreach_sequences::queue::DeferredQueue;
    use outreach_sequences::scheduler::NextStep;
    use outreach_sequences::types::{
        AbTestStep, DayType, EmailStep, EnrollmentStatus, ExecutionStatus, ExitReason, Sequence,
        Step, StepKind, Variant, VariantRef,
    };
    use outreach_sequences::{Collaborators, ExecutionOutcome, SequenceEngine, SequenceError};
    use uuid::Uuid;

    struct Harness {
        engine: SequenceEngine,
        clock: Arc<ManualClock>,
        contacts: Arc<InMemoryContactStore>,
        transport: Arc<LoopbackTransport>,
        events: Arc<CaptureSink>,
    }

    /// Monday 2024-03-04 09:00 UTC.
    fn monday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
    }

    fn harness_with(start: DateTime<Utc>, config: AppConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(start));
        let contacts = Arc::new(InMemoryContactStore::new());
        let transport = Arc::new(LoopbackTransport::new());
        let templates = Arc::new(TemplateRegistry::new());
        templates.register(EmailTemplate::new("intro", "Hi {{first_name}}", "Hello from {{sequence_name}}"));
        templates.register(EmailTemplate::new("variant_a", "A: {{first_name}}", "Variant A"));
        templates.register(EmailTemplate::new("variant_b", "B: {{first_name}}", "Variant B"));
        let events = capture_sink();

        let engine = SequenceEngine::builder(Collaborators {
            renderer: templates,
            transport: transport.clone(),
            contacts: contacts.clone(),
            engagement: Arc::new(EngagementLog::new()),
            webhooks: Arc::new(RecordingWebhookClient::new()),
        })
        .with_config(config)
        .with_clock(clock.clone())
        .with_event_sink(events.clone())
        .with_ab_seed(7)
        .build();

        Harness {
            engine,
            clock,
            contacts,
            transport,
            events,
        }
    }

    fn harness(start: DateTime<Utc>) -> Harness {
        harness_with(start, AppConfig::default())
    }

    fn email(template_id: &str) -> StepKind {
        StepKind::Email(EmailStep {
            template_id: template_id.to_string(),
            subject_override: None,
            variant: None,
        })
    }

    fn variant_email(template_id: &str, label: &str) -> StepKind {
        StepKind::Email(EmailStep {
            template_id: template_id.to_string(),
            subject_override: None,
            variant: Some(VariantRef {
                group: "subject".to_string(),
                label: label.to_string(),
            }),
        })
    }

    /// Creates and activates a sequence with the time-of-day snap disabled.
    fn active_sequence(h: &Harness, steps: Vec<Step>) -> Uuid {
        let mut sequence = Sequence::new("Flow");
        sequence.send_window.timezone_optimized = false;
        let store = h.engine.store();
        let id = store.create_sequence(sequence).unwrap();
        for step in steps {
            store.add_step(&id, step).unwrap();
        }
        h.engine.manager().activate_sequence(&id).unwrap();
        id
    }

    fn contact(h: &Harness, email: &str) -> Uuid {
        let mut contact = Contact::new(email);
        contact.first_name = "Ada".to_string();
        h.contacts.upsert(contact)
    }

    #[tokio::test]
    async fn test_friday_plus_three_business_days_fires_wednesday() {
        let friday = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let h = harness(friday);
        let seq = active_sequence(
            &h,
            vec![Step::new(0, "Intro", email("intro")).with_delay(3, 0, DayType::Business)],
        );
        let ada = contact(&h, "ada@example.com");

        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();
        let wednesday = Utc.with_ymd_and_hms(2024, 3, 6, 10, 0, 0).unwrap();
        assert_eq!(enrollment.next_fire_at, Some(wednesday));

        let worker = h.engine.worker();
        assert_eq!(worker.drain_due().await.dispatched, 0);

        h.clock.set(wednesday);
        let report = worker.drain_due().await;
        assert_eq!(report.completed, 1);
        assert_eq!(h.transport.sent_count(), 1);
        assert_eq!(h.transport.sent_to("ada@example.com")[0].message.subject, "Hi Ada");

        let done = h.engine.manager().get(&enrollment.id).unwrap();
        assert_eq!(done.status, EnrollmentStatus::Completed);
        assert_eq!(h.events.count_type(SequenceEventType::EnrollmentCompleted), 1);
    }

    #[tokio::test]
    async fn test_ab_split_is_balanced_and_sticky() {
        let h = harness(monday());
        let seq = active_sequence(
            &h,
            vec![
                Step::new(
                    0,
                    "Split",
                    StepKind::AbTest(AbTestStep {
                        group: "subject".to_string(),
                        variants: vec![
                            Variant { label: "A".to_string(), weight: 50 },
                            Variant { label: "B".to_string(), weight: 50 },
                        ],
                    }),
                ),
                Step::new(1, "Send A", variant_email("variant_a", "A")),
                Step::new(2, "Send B", variant_email("variant_b", "B")),
            ],
        );

        let contact_ids: Vec<Uuid> = (0..1000)
            .map(|i| contact(&h, &format!("c{}@example.com", i)))
            .collect();
        let bulk = h
            .engine
            .manager()
            .enroll_many(&seq, &contact_ids, HashMap::new(), Default::default())
            .await
            .unwrap();
        assert_eq!(bulk.enrolled.len(), 1000);

        h.engine.worker().drain_until_idle(10).await;

        let enrollments = h.engine.manager().for_sequence(&seq);
        let count = |label: &str| {
            enrollments
                .iter()
                .filter(|e| e.variant_assignments.get("subject").map(String::as_str) == Some(label))
                .count()
        };
        let (a, b) = (count("A"), count("B"));
        assert_eq!(a + b, 1000);
        assert!((400..=600).contains(&a), "A got {}", a);
        assert!((400..=600).contains(&b), "B got {}", b);

        // Each contact received exactly the email for its variant.
        assert_eq!(h.transport.sent_count(), 1000);
        for (i, contact_id) in contact_ids.iter().enumerate() {
            let enrollment = h.engine.manager().find(&seq, contact_id).unwrap();
            assert_eq!(enrollment.status, EnrollmentStatus::Completed);
            let label = &enrollment.variant_assignments["subject"];
            let sent = h.transport.sent_to(&format!("c{}@example.com", i));
            assert_eq!(sent.len(), 1);
            assert!(sent[0].message.subject.starts_with(&format!("{}:", label)));
        }
    }

    #[tokio::test]
    async fn test_reply_before_wait_skips_and_exits() {
        let h = harness(monday());
        let seq = active_sequence(
            &h,
            vec![
                Step::new(0, "Intro", email("intro")),
                Step::new(1, "Pause", StepKind::Wait).with_delay(1, 0, DayType::Calendar),
                Step::new(2, "Follow-up", email("intro")),
            ],
        );
        let ada = contact(&h, "ada@example.com");
        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();
        let worker = h.engine.worker();
        worker.drain_due().await;
        assert_eq!(h.transport.sent_count(), 1);

        let intro_step = h.engine.store().first_step(&seq).unwrap();
        let reply = EngagementEvent::new(ada, EngagementKind::Replied)
            .correlated(enrollment.id, intro_step.id);
        assert!(h.engine.analytics().record_engagement(reply.clone()).await.unwrap());
        assert!(!h.engine.analytics().record_engagement(reply).await.unwrap());
        assert_eq!(h.engine.store().step_stats(&intro_step.id).total_replied, 1);

        h.clock.advance(Duration::days(1));
        let report = worker.drain_due().await;
        assert_eq!(report.skipped, 1);

        let exited = h.engine.manager().get(&enrollment.id).unwrap();
        assert_eq!(exited.status, EnrollmentStatus::Exited);
        let exit = exited.exit.unwrap();
        assert_eq!(exit.reason, ExitReason::ConditionMet);

        let executions = h.engine.analytics().timeline(&enrollment.id).unwrap().entries;
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[1].status, ExecutionStatus::Skipped);
        assert_eq!(executions[1].result["skipped"], "exit_condition");

        h.clock.advance(Duration::days(7));
        assert_eq!(worker.drain_until_idle(5).await.dispatched, 0);
        assert_eq!(h.transport.sent_count(), 1);

        let report = h.engine.analytics().report(&seq).unwrap();
        assert_eq!(report.exit_reasons.len(), 1);
        assert_eq!(report.exit_reasons[0].reason, ExitReason::ConditionMet);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retries_then_stall() {
        let h = harness(monday());
        let seq = active_sequence(&h, vec![Step::new(0, "Intro", email("intro"))]);
        let ada = contact(&h, "ada@example.com");
        for _ in 0..4 {
            h.transport
                .fail_next(CollaboratorError::Transient("smtp 451".to_string()));
        }

        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();
        let worker = h.engine.worker();
        assert_eq!(worker.drain_due().await.failed, 1);
        for attempt in 1..=3 {
            h.clock.advance(Duration::seconds(60 * attempt));
            assert_eq!(worker.drain_due().await.failed, 1, "attempt {}", attempt + 1);
        }

        let timeline = h.engine.analytics().timeline(&enrollment.id).unwrap();
        assert_eq!(timeline.entries.len(), 4);
        assert!(timeline
            .entries
            .iter()
            .all(|e| e.status == ExecutionStatus::Failed));
        assert_eq!(
            timeline.entries.iter().map(|e| e.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );

        let stalled = h.engine.manager().get(&enrollment.id).unwrap();
        assert_eq!(stalled.status, EnrollmentStatus::Active);
        assert_eq!(stalled.next_fire_at, None);
        h.clock.advance(Duration::hours(1));
        assert_eq!(worker.drain_due().await.dispatched, 0);

        h.engine.manager().retry_stalled(&enrollment.id).await.unwrap();
        assert_eq!(worker.drain_due().await.completed, 1);
        assert_eq!(
            h.engine.manager().get(&enrollment.id).unwrap().status,
            EnrollmentStatus::Completed
        );
        assert!(h.engine.ledger().verify_chain().chain_intact);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let h = harness(monday());
        let seq = active_sequence(&h, vec![Step::new(0, "Intro", email("intro"))]);
        let ada = contact(&h, "ada@example.com");
        h.transport
            .fail_next(CollaboratorError::Permanent("hard bounce".to_string()));

        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();
        let report = h.engine.worker().drain_due().await;
        assert_eq!(report.failed, 1);

        let timeline = h.engine.analytics().timeline(&enrollment.id).unwrap();
        assert_eq!(timeline.entries.len(), 1);
        assert_eq!(timeline.entries[0].result["retryable"], false);
        assert_eq!(
            h.engine.manager().get(&enrollment.id).unwrap().status,
            EnrollmentStatus::Active
        );
    }

    #[tokio::test]
    async fn test_slow_transport_times_out_and_retries() {
        let mut config = AppConfig::default();
        config.executor.handler_timeout_ms = 50;
        let h = harness_with(monday(), config);
        let seq = active_sequence(&h, vec![Step::new(0, "Intro", email("intro"))]);
        let ada = contact(&h, "ada@example.com");
        h.transport
            .set_latency(Some(std::time::Duration::from_millis(300)));

        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();
        assert_eq!(h.engine.worker().drain_due().await.failed, 1);

        let retry = h.engine.manager().get(&enrollment.id).unwrap();
        assert_eq!(retry.next_fire_at, Some(monday() + Duration::seconds(60)));
        let timeline = h.engine.analytics().timeline(&enrollment.id).unwrap();
        assert_eq!(timeline.entries[1].status, ExecutionStatus::Scheduled);
        assert_eq!(timeline.entries[1].attempt, 2);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_a_no_op() {
        let h = harness(monday());
        let seq = active_sequence(&h, vec![Step::new(0, "Intro", email("intro"))]);
        let ada = contact(&h, "ada@example.com");
        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();

        let execution_id = h.engine.analytics().timeline(&enrollment.id).unwrap().entries[0].execution_id;
        h.engine.queue().schedule_at(execution_id, monday());
        h.engine.queue().schedule_at(execution_id, monday());

        let report = h.engine.worker().drain_due().await;
        assert_eq!(report.dispatched, 3);
        assert_eq!(report.completed, 1);
        assert_eq!(report.no_ops, 2);
        assert_eq!(h.transport.sent_count(), 1);

        let again = h.engine.executor().execute(&execution_id).await.unwrap();
        assert!(matches!(
            again,
            ExecutionOutcome::NoOp {
                status: ExecutionStatus::Completed
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_execute_sends_once() {
        let h = harness(monday());
        let seq = active_sequence(&h, vec![Step::new(0, "Intro", email("intro"))]);
        let ada = contact(&h, "ada@example.com");
        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();
        let execution_id = h.engine.analytics().timeline(&enrollment.id).unwrap().entries[0].execution_id;

        let executor = h.engine.executor();
        let (first, second) = tokio::join!(executor.execute(&execution_id), executor.execute(&execution_id));
        let no_ops = [first.unwrap(), second.unwrap()]
            .iter()
            .filter(|o| matches!(o, ExecutionOutcome::NoOp { .. }))
            .count();
        assert_eq!(no_ops, 1);
        assert_eq!(h.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_enrolling_twice_is_rejected() {
        let h = harness(monday());
        let seq = active_sequence(&h, vec![Step::new(0, "Intro", email("intro"))]);
        let ada = contact(&h, "ada@example.com");
        h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();

        let err = h
            .engine
            .manager()
            .enroll(&seq, &ada, HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SequenceError::AlreadyEnrolled { .. }));
        assert_eq!(h.engine.manager().for_sequence(&seq).len(), 1);

        let missing = h
            .engine
            .manager()
            .enroll(&seq, &Uuid::new_v4(), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(missing, SequenceError::Collaborator(CollaboratorError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_step_index_only_moves_forward() {
        let h = harness(monday());
        let seq = active_sequence(
            &h,
            vec![
                Step::new(0, "Intro", email("intro")),
                Step::new(1, "Pause", StepKind::Wait).with_delay(0, 2, DayType::Calendar),
                Step::new(2, "Follow-up", email("intro")),
            ],
        );
        let ada = contact(&h, "ada@example.com");
        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();
        let worker = h.engine.worker();

        let mut seen = vec![enrollment.current_step_index];
        for _ in 0..4 {
            worker.drain_due().await;
            seen.push(h.engine.manager().get(&enrollment.id).unwrap().current_step_index);
            h.clock.advance(Duration::hours(2));
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
        assert_eq!(*seen.last().unwrap(), 2);

        let report = h.engine.analytics().report(&seq).unwrap();
        assert_eq!(report.total_completed, 1);
        assert_eq!(report.step_performance.len(), 2);
        assert_eq!(report.step_performance[0].total_sent, 1);
        assert_eq!(
            report
                .conversion_funnel
                .iter()
                .map(|s| s.contacts_reached)
                .collect::<Vec<_>>(),
            vec![1, 1, 1]
        );
        assert!(h.engine.ledger().verify_chain().chain_intact);
    }

    #[tokio::test]
    async fn test_paused_enrollment_defers_until_resumed() {
        let h = harness(monday());
        let seq = active_sequence(
            &h,
            vec![Step::new(0, "Intro", email("intro")).with_delay(1, 0, DayType::Calendar)],
        );
        let ada = contact(&h, "ada@example.com");
        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();

        let paused = h.engine.manager().pause(&enrollment.id).unwrap();
        assert_eq!(paused.next_fire_at, None);

        h.clock.advance(Duration::days(2));
        let worker = h.engine.worker();
        let report = worker.drain_due().await;
        assert_eq!(report.deferred, 1);
        assert_eq!(h.transport.sent_count(), 0);

        let resumed = h.engine.manager().resume(&enrollment.id).unwrap();
        assert_eq!(resumed.next_fire_at, Some(h.clock.now()));
        assert_eq!(worker.drain_due().await.completed, 1);
        assert_eq!(h.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_seeded_templates_become_active_sequences() {
        let h = harness(monday());
        let ids = h.engine.seed_demo_sequences().unwrap();
        assert_eq!(ids.len(), 2);
        for id in &ids {
            let sequence = h.engine.store().get_sequence(id).unwrap();
            assert_eq!(sequence.status, outreach_sequences::types::SequenceStatus::Active);
        }
        assert_eq!(h.events.count_type(SequenceEventType::SequenceActivated), 2);
    }

    fn contact_in_zone(h: &Harness, email: &str, zone: &str) -> Uuid {
        let mut contact = Contact::new(email);
        contact.first_name = "Ada".to_string();
        contact.timezone = Some(zone.to_string());
        h.contacts.upsert(contact)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_send_does_not_block_other_dispatches() {
        let mut config = AppConfig::default();
        config.executor.handler_timeout_ms = 5_000;
        config.scheduler.poll_interval_ms = 20;
        let h = harness_with(monday(), config);
        let emails = active_sequence(&h, vec![Step::new(0, "Intro", email("intro"))]);
        let waits = active_sequence(&h, vec![Step::new(0, "Pause", StepKind::Wait)]);
        let ada = contact(&h, "ada@example.com");
        let bob = contact(&h, "bob@example.com");
        h.transport
            .set_latency(Some(std::time::Duration::from_millis(1_500)));

        let (stop, shutdown) = tokio::sync::oneshot::channel();
        let running = tokio::spawn(h.engine.worker().run(shutdown));

        h.engine.manager().enroll(&emails, &ada, HashMap::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let waiting = h.engine.manager().enroll(&waits, &bob, HashMap::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let done = h.engine.manager().get(&waiting.id).unwrap();
        assert_eq!(done.status, EnrollmentStatus::Completed);
        assert_eq!(h.transport.sent_count(), 0);

        stop.send(()).unwrap();
        running.await.unwrap();
        assert_eq!(h.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_exit_while_paused_skips_the_pending_execution() {
        let h = harness(monday());
        let seq = active_sequence(
            &h,
            vec![Step::new(0, "Intro", email("intro")).with_delay(1, 0, DayType::Calendar)],
        );
        let ada = contact(&h, "ada@example.com");
        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();
        h.engine.manager().pause(&enrollment.id).unwrap();
        h.clock.advance(Duration::days(2));
        let worker = h.engine.worker();
        assert_eq!(worker.drain_due().await.deferred, 1);

        let exited = h
            .engine
            .manager()
            .exit(&enrollment.id, ExitReason::Manual, "Removed by owner")
            .unwrap();
        assert_eq!(exited.status, EnrollmentStatus::Exited);

        let entries = h.engine.analytics().timeline(&enrollment.id).unwrap().entries;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ExecutionStatus::Skipped);
        assert_eq!(entries[0].result["skipped"], "manual");
        let history = h.engine.ledger().entries_for_execution(&entries[0].execution_id);
        assert_eq!(history.last().unwrap().to, ExecutionStatus::Skipped);

        h.engine.queue().schedule_at(entries[0].execution_id, h.clock.now());
        let report = worker.drain_due().await;
        assert_eq!(report.no_ops, 1);
        assert_eq!(h.transport.sent_count(), 0);
        assert!(h.engine.ledger().verify_chain().chain_intact);
    }

    #[tokio::test]
    async fn test_pause_and_resume_reject_wrong_states() {
        let h = harness(monday());
        let seq = active_sequence(&h, vec![Step::new(0, "Intro", email("intro"))]);
        let ada = contact(&h, "ada@example.com");
        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();

        let err = h.engine.manager().resume(&enrollment.id).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidTransition { .. }), "{:?}", err);

        h.engine.worker().drain_due().await;
        let done = h.engine.manager().get(&enrollment.id).unwrap();
        assert_eq!(done.status, EnrollmentStatus::Completed);
        let err = h.engine.manager().pause(&enrollment.id).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidTransition { .. }), "{:?}", err);
        assert_eq!(
            h.engine.manager().get(&enrollment.id).unwrap().status,
            EnrollmentStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_exit_on_terminal_enrollment_changes_nothing() {
        let h = harness(monday());
        let seq = active_sequence(
            &h,
            vec![Step::new(0, "Intro", email("intro")).with_delay(1, 0, DayType::Calendar)],
        );
        let ada = contact(&h, "ada@example.com");
        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();

        let manager = h.engine.manager();
        manager.exit(&enrollment.id, ExitReason::Unsubscribed, "Opted out").unwrap();
        let again = manager.exit(&enrollment.id, ExitReason::Manual, "Removed twice").unwrap();

        assert_eq!(again.status, EnrollmentStatus::Exited);
        assert_eq!(again.exit.unwrap().reason, ExitReason::Unsubscribed);
        assert_eq!(h.events.count_type(SequenceEventType::EnrollmentExited), 1);
    }

    #[tokio::test]
    async fn test_conversion_is_counted_once_and_exits() {
        let h = harness(monday());
        let seq = active_sequence(
            &h,
            vec![Step::new(0, "Intro", email("intro")).with_delay(1, 0, DayType::Calendar)],
        );
        let ada = contact(&h, "ada@example.com");
        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();

        let converted = h
            .engine
            .manager()
            .mark_converted(&enrollment.id, Some(rust_decimal::Decimal::new(4_999, 2)))
            .unwrap();
        assert_eq!(converted.status, EnrollmentStatus::Exited);
        assert_eq!(converted.exit.as_ref().unwrap().reason, ExitReason::Converted);
        assert!(converted.is_converted());
        assert_eq!(
            h.engine.store().get_sequence(&seq).unwrap().stats.total_converted,
            1
        );

        h.engine.manager().mark_converted(&enrollment.id, None).unwrap();
        assert_eq!(
            h.engine.store().get_sequence(&seq).unwrap().stats.total_converted,
            1
        );
        assert_eq!(h.events.count_type(SequenceEventType::EnrollmentConverted), 1);
    }

    #[tokio::test]
    async fn test_conversion_without_exit_rule_keeps_enrollment_active() {
        let h = harness(monday());
        let mut sequence = Sequence::new("Keep going");
        sequence.send_window.timezone_optimized = false;
        sequence.exit_rules.on_conversion = false;
        let seq = h.engine.store().create_sequence(sequence).unwrap();
        h.engine
            .store()
            .add_step(&seq, Step::new(0, "Intro", email("intro")).with_delay(1, 0, DayType::Calendar))
            .unwrap();
        h.engine.manager().activate_sequence(&seq).unwrap();
        let ada = contact(&h, "ada@example.com");
        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();

        let converted = h.engine.manager().mark_converted(&enrollment.id, None).unwrap();
        assert_eq!(converted.status, EnrollmentStatus::Active);
        assert!(converted.is_converted());
        assert_eq!(
            h.engine.store().get_sequence(&seq).unwrap().stats.total_converted,
            1
        );
    }

    #[tokio::test]
    async fn test_sequence_pause_and_resume_cascade() {
        let h = harness(monday());
        let seq = active_sequence(
            &h,
            vec![Step::new(0, "Intro", email("intro")).with_delay(1, 0, DayType::Calendar)],
        );
        let ada = contact(&h, "ada@example.com");
        let bob = contact(&h, "bob@example.com");
        let manager = h.engine.manager();
        let first = manager.enroll(&seq, &ada, HashMap::new()).await.unwrap();
        let second = manager.enroll(&seq, &bob, HashMap::new()).await.unwrap();

        assert_eq!(manager.pause_sequence(&seq).unwrap(), 2);
        for id in [first.id, second.id] {
            let paused = manager.get(&id).unwrap();
            assert_eq!(paused.status, EnrollmentStatus::Paused);
            assert_eq!(paused.next_fire_at, None);
        }

        h.clock.advance(Duration::days(2));
        let worker = h.engine.worker();
        assert_eq!(worker.drain_due().await.deferred, 2);
        assert!(h.engine.queue().is_empty());

        assert_eq!(manager.resume_sequence(&seq).unwrap(), 2);
        for id in [first.id, second.id] {
            let resumed = manager.get(&id).unwrap();
            assert_eq!(resumed.status, EnrollmentStatus::Active);
            assert_eq!(resumed.next_fire_at, Some(h.clock.now()));
        }
        assert_eq!(h.engine.queue().len(), 2);
        assert_eq!(worker.drain_due().await.completed, 2);
        assert_eq!(h.transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_unresolvable_contact_zone_uses_org_default() {
        let mut config = AppConfig::default();
        config.scheduler.default_utc_offset = "+05:30".to_string();
        let h = harness_with(monday(), config);
        let mut sequence = Sequence::new("Zoned");
        sequence.send_window.skip_weekends = false;
        let seq = h.engine.store().create_sequence(sequence).unwrap();
        h.engine
            .store()
            .add_step(&seq, Step::new(0, "Intro", email("intro")))
            .unwrap();
        h.engine.manager().activate_sequence(&seq).unwrap();
        let ada = contact_in_zone(&h, "ada@example.com", "America/New_York");

        // 10:00 +05:30 on Monday is already past at 09:00 UTC.
        let tuesday = Utc.with_ymd_and_hms(2024, 3, 5, 4, 30, 0).unwrap();
        let sequence = h.engine.store().get_sequence(&seq).unwrap();
        let step = h.engine.store().first_step(&seq).unwrap();
        let at = h
            .engine
            .scheduler()
            .compute_next_fire_time(&sequence.send_window, &step, Some("America/New_York"))
            .unwrap();
        assert_eq!(at, tuesday);

        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();
        assert_eq!(enrollment.next_fire_at, Some(tuesday));
    }

    #[tokio::test]
    async fn test_malformed_default_zone_stalls_the_enrollment() {
        let mut config = AppConfig::default();
        config.scheduler.default_utc_offset = "Mars/Olympus".to_string();
        let h = harness_with(monday(), config);
        let seq = active_sequence(&h, vec![Step::new(0, "Intro", email("intro"))]);
        let ada = contact(&h, "ada@example.com");

        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Active);
        assert_eq!(enrollment.next_fire_at, None);
        assert!(h.engine.queue().is_empty());

        let entries = h.engine.analytics().timeline(&enrollment.id).unwrap().entries;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ExecutionStatus::Failed);
        assert_eq!(entries[0].result["phase"], "scheduling");
        assert!(entries[0].error.as_deref().unwrap().starts_with("scheduling error"));
        assert_eq!(h.events.count_type(SequenceEventType::StepFailed), 1);

        let retried = h.engine.manager().retry_stalled(&enrollment.id).await.unwrap();
        assert!(matches!(retried, NextStep::Stalled(_)), "{:?}", retried);
        assert_eq!(
            h.engine.manager().get(&enrollment.id).unwrap().status,
            EnrollmentStatus::Active
        );

        let zoned = contact_in_zone(&h, "bob@example.com", "+02:00");
        let scheduled = h.engine.manager().enroll(&seq, &zoned, HashMap::new()).await.unwrap();
        assert_eq!(scheduled.next_fire_at, Some(monday()));
    }

    #[tokio::test]
    async fn test_two_emails_friday_then_three_business_days() {
        let friday = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let h = harness(friday);
        let seq = active_sequence(
            &h,
            vec![
                Step::new(0, "Intro", email("intro")),
                Step::new(1, "Follow-up", email("intro")).with_delay(3, 0, DayType::Business),
            ],
        );
        let ada = contact(&h, "ada@example.com");
        let enrollment = h.engine.manager().enroll(&seq, &ada, HashMap::new()).await.unwrap();
        assert_eq!(enrollment.next_fire_at, Some(friday));

        let worker = h.engine.worker();
        assert_eq!(worker.drain_due().await.completed, 1);
        assert_eq!(h.transport.sent_count(), 1);

        let wednesday = Utc.with_ymd_and_hms(2024, 3, 6, 10, 0, 0).unwrap();
        let waiting = h.engine.manager().get(&enrollment.id).unwrap();
        assert_eq!(waiting.next_fire_at, Some(wednesday));
        assert_eq!(waiting.current_step_index, 1);

        h.clock.set(wednesday - Duration::minutes(1));
        assert_eq!(worker.drain_due().await.dispatched, 0);
        h.clock.set(wednesday);
        assert_eq!(worker.drain_due().await.completed, 1);
        assert_eq!(h.transport.sent_count(), 2);
        assert_eq!(
            h.engine.manager().get(&enrollment.id).unwrap().status,
            EnrollmentStatus::Completed
        );
    }
}
