//! End-to-end conversations through the flow engine.

use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use wacrm::crm::{
    AdminNotification, ChannelNotifier, CrmStore, FlowStateStore, InMemoryStore, NotificationKind, Record,
};
use wacrm::flows::actions::{ActionError, FnHandler, OPPORTUNITY_COLLECTION};
use wacrm::flows::{
    create_engine, parse_flows, ActionRegistry, Context, FlowCatalog, FlowEngine, PassOutcome, PassStatus,
};
use wacrm::messages::{InboundMessage, MessagePayload};

const CONTACT: &str = "263771234567";

fn catalog(source: &str) -> FlowCatalog {
    FlowCatalog::from_definitions(parse_flows(source, "test").unwrap()).unwrap()
}

fn shipped_catalog() -> FlowCatalog {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("flows");
    FlowCatalog::load_dir(&dir).unwrap()
}

fn products() -> Vec<Record> {
    [
        json!({"id": "p1", "sku": "POS-BASIC", "name": "Retail POS Basic", "price": 150, "is_active": true}),
        json!({"id": "p2", "sku": "ACC-CLOUD", "name": "Cloud Accounting", "price": 300, "is_active": true}),
        json!({"id": "p3", "sku": "HR-LEGACY", "name": "Legacy Payroll", "price": 90, "is_active": false}),
    ]
    .into_iter()
    .filter_map(|v| v.as_object().cloned())
    .collect()
}

fn texts(outcome: &PassOutcome) -> Vec<String> {
    outcome.messages.iter().map(|m| m.payload.preview()).collect()
}

async fn say(engine: &FlowEngine, text: &str) -> PassOutcome {
    engine
        .handle_inbound(InboundMessage::text_message(CONTACT, text))
        .await
        .unwrap()
}

async fn tap(engine: &FlowEngine, id: &str) -> PassOutcome {
    engine
        .handle_inbound(InboundMessage::interactive(CONTACT, id, id))
        .await
        .unwrap()
}

fn text_message(body: &str) -> serde_json::Value {
    json!({"message_type": "text", "text": {"body": body}})
}

#[tokio::test]
async fn test_shipped_flows_load() {
    let catalog = shipped_catalog();
    for name in ["fiscalisation_service", "lead_generation", "support_handover"] {
        assert!(catalog.get(name).is_some(), "missing flow {name}");
    }
}

#[tokio::test]
async fn test_lowest_priority_satisfied_transition_wins() {
    let source = json!({
        "name": "routing",
        "trigger_keywords": ["route"],
        "steps": [
            {"name": "start", "is_entry_point": true, "type": "send_message",
             "config": text_message("routing"),
             "transitions": [
                {"to_step": "c", "priority": 100, "condition_config": {"type": "user_reply_equals", "value": "never"}},
                {"to_step": "b", "priority": 10, "condition_config": {"type": "user_reply_contains_keyword", "keyword": "route"}},
                {"to_step": "a", "priority": 0, "condition_config": {"type": "variable_exists", "variable_name": "missing"}}
             ]},
            {"name": "a", "type": "end_flow", "config": {"message_config": text_message("A")}},
            {"name": "b", "type": "end_flow", "config": {"message_config": text_message("B")}},
            {"name": "c", "type": "end_flow", "config": {"message_config": text_message("C")}}
        ]
    })
    .to_string();
    let engine = create_engine(catalog(&source), Arc::new(InMemoryStore::new()));
    let outcome = say(&engine, "please route me").await;
    assert_eq!(texts(&outcome), vec!["routing", "B"]);
    assert_eq!(outcome.status, PassStatus::Completed);
}

#[tokio::test]
async fn test_plain_text_passes_through_unchanged() {
    let source = json!({
        "name": "echo",
        "trigger_keywords": ["echo"],
        "steps": [
            {"name": "say", "is_entry_point": true, "type": "send_message",
             "config": text_message("hello"), "transitions": [{"to_step": "bye"}]},
            {"name": "bye", "type": "end_flow"}
        ]
    })
    .to_string();
    let engine = create_engine(catalog(&source), Arc::new(InMemoryStore::new()));
    assert_eq!(texts(&say(&engine, "echo").await), vec!["hello"]);
}

#[tokio::test]
async fn test_branch_on_query_results() {
    let with_products = Arc::new(InMemoryStore::new().with_records("products_and_services.SoftwareProduct", products()));
    let engine = create_engine(shipped_catalog(), with_products).with_default_flow("lead_generation");
    say(&engine, "hi").await;
    say(&engine, "Retail").await;
    tap(&engine, "cost").await;
    let outcome = say(&engine, "Harare").await;
    assert_eq!(outcome.status, PassStatus::AwaitingReply);
    let preview = texts(&outcome).join("\n");
    assert!(preview.contains("[#ACC-CLOUD] Cloud Accounting"), "{preview}");
    assert!(preview.contains("[#POS-BASIC] Retail POS Basic"));
    assert!(!preview.contains("HR-LEGACY"));

    let empty = Arc::new(InMemoryStore::new());
    let engine = create_engine(shipped_catalog(), empty).with_default_flow("lead_generation");
    say(&engine, "hi").await;
    say(&engine, "Retail").await;
    tap(&engine, "cost").await;
    let outcome = say(&engine, "Harare").await;
    assert_eq!(outcome.status, PassStatus::Completed);
    assert!(texts(&outcome)[0].starts_with("Apologies"));
}

#[tokio::test]
async fn test_lead_generation_creates_opportunity() {
    let store = Arc::new(InMemoryStore::new().with_records("products_and_services.SoftwareProduct", products()));
    let engine = create_engine(shipped_catalog(), store.clone()).with_default_flow("lead_generation");

    let greeting = say(&engine, "Hello").await;
    assert_eq!(greeting.flow_name.as_deref(), Some("lead_generation"));
    say(&engine, "Hardware").await;
    tap(&engine, "features").await;
    say(&engine, "Bulawayo").await;
    tap(&engine, "POS-BASIC").await;
    let done = say(&engine, "Tomorrow morning").await;

    assert_eq!(done.status, PassStatus::Completed);
    assert_eq!(
        texts(&done),
        vec![
            "Thank you! We have collected your information. Our team will contact you soon.",
            "Thank you for your interest!"
        ]
    );

    let opportunities = store.records(OPPORTUNITY_COLLECTION);
    assert_eq!(opportunities.len(), 1);
    let opportunity = &opportunities[0];
    assert_eq!(opportunity["name"], "New Lead - Hardware");
    assert_eq!(opportunity["stage"], "prospecting");
    assert_eq!(opportunity["product_id"], "p1");
    assert_eq!(opportunity["amount"], 150);
    assert_eq!(opportunity["contact_id"], CONTACT);

    let profile = store.get_profile(CONTACT).await.unwrap().unwrap();
    assert_eq!(profile.city.as_deref(), Some("Bulawayo"));
    assert_eq!(profile.lead_score, 10);
    assert_eq!(profile.custom_attributes["business"]["type"], "Hardware");
}

#[tokio::test]
async fn test_fallback_fires_after_retries_exhausted() {
    let source = json!({
        "name": "age",
        "trigger_keywords": ["age"],
        "steps": [
            {"name": "ask", "is_entry_point": true, "type": "question",
             "config": {
                "message_config": text_message("How old are you?"),
                "reply_config": {"save_to_variable": "age", "expected_type": "number"},
                "fallback_config": {"action": "end_flow", "max_retries": 2, "re_prompt_message_text": "A number please."}
             },
             "transitions": [{"to_step": "done"}]},
            {"name": "done", "type": "end_flow", "config": {"message_config": text_message("You are {{ age }}")}}
        ]
    })
    .to_string();
    let store = Arc::new(InMemoryStore::new());
    let engine = create_engine(catalog(&source), store.clone());

    assert_eq!(texts(&say(&engine, "age").await), vec!["How old are you?"]);

    let first = say(&engine, "old").await;
    assert_eq!(first.status, PassStatus::AwaitingReply);
    assert_eq!(texts(&first), vec!["A number please."]);
    assert_eq!(store.load_state(CONTACT).await.unwrap().unwrap().retry_count, 1);

    let second = say(&engine, "very old").await;
    assert_eq!(second.status, PassStatus::AwaitingReply);
    assert_eq!(store.load_state(CONTACT).await.unwrap().unwrap().retry_count, 2);

    let third = say(&engine, "ancient").await;
    assert_eq!(third.status, PassStatus::Completed);
    assert!(third.messages.is_empty());
    assert!(store.load_state(CONTACT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_valid_reply_resets_retries() {
    let source = json!({
        "name": "age",
        "trigger_keywords": ["age"],
        "steps": [
            {"name": "ask", "is_entry_point": true, "type": "question",
             "config": {
                "message_config": text_message("How old are you?"),
                "reply_config": {"save_to_variable": "age", "expected_type": "number"}
             },
             "transitions": [{"to_step": "done"}]},
            {"name": "done", "type": "end_flow", "config": {"message_config": text_message("You are {{ age }}")}}
        ]
    })
    .to_string();
    let engine = create_engine(catalog(&source), Arc::new(InMemoryStore::new()));
    say(&engine, "age").await;
    let reprompt = say(&engine, "forty").await;
    assert_eq!(texts(&reprompt), vec!["How old are you?"]);
    let done = say(&engine, "40").await;
    assert_eq!(texts(&done), vec!["You are 40"]);
}

#[tokio::test]
async fn test_switch_flow_fallback() {
    let source = json!([
        {"name": "picky", "trigger_keywords": ["pick"], "steps": [
            {"name": "ask", "is_entry_point": true, "type": "question",
             "config": {
                "message_config": text_message("Pick a button"),
                "reply_config": {"save_to_variable": "choice", "expected_type": "interactive_id"},
                "fallback_config": {"action": "switch_flow", "max_retries": 0, "target_flow_name": "rescue"}
             },
             "transitions": [{"to_step": "done"}]},
            {"name": "done", "type": "end_flow"}
        ]},
        {"name": "rescue", "steps": [
            {"name": "help", "is_entry_point": true, "type": "end_flow", "config": {"message_config": text_message("Let me help.")}}
        ]}
    ])
    .to_string();
    let engine = create_engine(catalog(&source), Arc::new(InMemoryStore::new()));
    say(&engine, "pick").await;
    let outcome = say(&engine, "typing instead").await;
    assert_eq!(texts(&outcome), vec!["Let me help."]);
    assert_eq!(outcome.flow_name.as_deref(), Some("rescue"));
    assert_eq!(outcome.status, PassStatus::Completed);
}

#[tokio::test]
async fn test_end_flow_removes_state() {
    let store = Arc::new(InMemoryStore::new());
    let engine = create_engine(shipped_catalog(), store.clone());
    say(&engine, "support").await;
    assert!(store.load_state(CONTACT).await.unwrap().is_some());
    let reprompt = say(&engine, "billing").await;
    assert_eq!(reprompt.status, PassStatus::AwaitingReply);
    let outcome = say(&engine, "billing, please").await;
    assert_eq!(outcome.status, PassStatus::Completed);
    assert!(store.load_state(CONTACT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_context_value_written_to_profile_as_text() {
    let source = json!({
        "name": "notes",
        "trigger_keywords": ["note"],
        "steps": [
            {"name": "act", "is_entry_point": true, "type": "action",
             "config": {"actions_to_run": [
                {"action_type": "set_context_variable", "variable_name": "x", "value_template": "5"},
                {"action_type": "update_customer_profile", "fields_to_update": {"notes": "{{ x }}"}}
             ]},
             "transitions": [{"to_step": "done"}]},
            {"name": "done", "type": "end_flow"}
        ]
    })
    .to_string();
    let store = Arc::new(InMemoryStore::new());
    let engine = create_engine(catalog(&source), store.clone());
    let outcome = say(&engine, "note").await;
    assert_eq!(outcome.status, PassStatus::Completed);
    let profile = store.get_profile(CONTACT).await.unwrap().unwrap();
    assert_eq!(profile.notes.as_deref(), Some("5"));
}

#[tokio::test]
async fn test_variable_equals_branches() {
    let source = json!({
        "name": "segment",
        "trigger_keywords": ["segment"],
        "steps": [
            {"name": "ask", "is_entry_point": true, "type": "question",
             "config": {"message_config": text_message("Business type?"),
                        "reply_config": {"save_to_variable": "business_type"}},
             "transitions": [
                {"to_step": "retail", "priority": 0, "condition_config": {"type": "variable_equals", "variable_name": "business_type", "value": "retail"}},
                {"to_step": "other", "priority": 1}
             ]},
            {"name": "retail", "type": "end_flow", "config": {"message_config": text_message("Retail track")}},
            {"name": "other", "type": "end_flow", "config": {"message_config": text_message("General track")}}
        ]
    })
    .to_string();
    let engine = create_engine(catalog(&source), Arc::new(InMemoryStore::new()));

    say(&engine, "segment").await;
    assert_eq!(texts(&say(&engine, "retail").await), vec!["Retail track"]);

    say(&engine, "segment").await;
    assert_eq!(texts(&say(&engine, "consulting").await), vec!["General track"]);
}

#[tokio::test]
async fn test_trigger_keywords_match_whole_words() {
    let engine = create_engine(shipped_catalog(), Arc::new(InMemoryStore::new()));
    let none = say(&engine, "zimrabad is a place").await;
    assert_eq!(none.status, PassStatus::NoFlow);

    let outcome = say(&engine, "Can you help with ZIMRA?").await;
    assert_eq!(outcome.flow_name.as_deref(), Some("fiscalisation_service"));
    assert!(texts(&outcome)[0].contains("are you VAT registered?"));
}

#[tokio::test]
async fn test_fiscalisation_urgent_path_notifies_admins() {
    let store = Arc::new(InMemoryStore::new());
    let (tx, mut rx) = mpsc::channel::<AdminNotification>(16);
    let engine = create_engine(shipped_catalog(), store.clone()).with_notifier(Arc::new(ChannelNotifier::new(tx)));

    engine
        .handle_inbound(InboundMessage::text_message(CONTACT, "fiscalisation").with_contact_name("Tariro"))
        .await
        .unwrap();
    let cost = tap(&engine, "vat_yes").await;
    assert!(texts(&cost)[0].contains("$150"));
    let ack = tap(&engine, "reason_customers").await;
    assert_eq!(texts(&ack)[0], "Ok, understood.");
    say(&engine, "Hardware").await;
    tap(&engine, "urgent_very").await;
    tap(&engine, "start_today").await;
    say(&engine, "Moyo Hardware (Pvt) Ltd").await;
    say(&engine, "2000123456").await;
    say(&engine, "N/A").await;
    say(&engine, "+263771234567").await;
    let bad_email = say(&engine, "not an email").await;
    assert!(texts(&bad_email)[0].starts_with("That doesn't look like an email"));
    say(&engine, "info@moyohardware.co.zw").await;
    let done = say(&engine, "12 Main St, Harare").await;

    assert_eq!(done.status, PassStatus::Completed);
    assert!(texts(&done)[0].starts_with("Thank you for providing all the details."));

    let profile = store.get_profile(CONTACT).await.unwrap().unwrap();
    let notes = profile.notes.unwrap();
    assert!(notes.starts_with("New Fiscalisation Lead (Urgent):"));
    assert!(notes.contains("Company: Moyo Hardware (Pvt) Ltd"));
    assert!(notes.contains("VAT Registered: vat_yes"));
    assert!(notes.ends_with("---\n"));
    assert_eq!(profile.email.as_deref(), Some("info@moyohardware.co.zw"));

    let notification = rx.recv().await.unwrap();
    assert_eq!(notification.kind, NotificationKind::FlowAction);
    assert!(notification.message.starts_with("URGENT Fiscalisation Lead for Tariro:"));
}

#[tokio::test]
async fn test_fiscalisation_not_urgent_path() {
    let store = Arc::new(InMemoryStore::new());
    let engine = create_engine(shipped_catalog(), store.clone());
    say(&engine, "zimra").await;
    tap(&engine, "vat_no").await;
    tap(&engine, "reason_voluntary").await;
    say(&engine, "Consulting").await;
    let done = tap(&engine, "urgent_next_week").await;
    assert_eq!(done.status, PassStatus::Completed);
    assert!(texts(&done)[0].starts_with("Thank you for your interest in our fiscalisation service."));
    let notes = store.get_profile(CONTACT).await.unwrap().unwrap().notes.unwrap();
    assert!(notes.contains("Urgency: urgent_next_week"));
}

#[tokio::test]
async fn test_handover_parks_contact() {
    let store = Arc::new(InMemoryStore::new());
    let (tx, mut rx) = mpsc::channel::<AdminNotification>(16);
    let engine = create_engine(shipped_catalog(), store.clone()).with_notifier(Arc::new(ChannelNotifier::new(tx)));

    say(&engine, "I want a human").await;
    let handed = tap(&engine, "topic_other").await;
    assert_eq!(handed.status, PassStatus::HandedOver);
    assert_eq!(texts(&handed), vec!["Connecting you to one of our team members. Please hold on."]);

    let contact = store.get_contact(CONTACT).await.unwrap().unwrap();
    assert!(contact.needs_human_intervention);
    assert!(contact.intervention_requested_at.is_some());

    let notification = rx.recv().await.unwrap();
    assert_eq!(notification.kind, NotificationKind::HumanHandover);
    assert_eq!(notification.message, format!("{CONTACT} asked for an agent (topic: topic_other)."));

    let parked = say(&engine, "hello? zimra").await;
    assert_eq!(parked.status, PassStatus::Parked);
    assert!(parked.messages.is_empty());

    let removed = tokio_test::assert_ok!(engine.abandon(CONTACT).await);
    assert!(removed);
    let fresh = say(&engine, "zimra").await;
    assert_eq!(fresh.flow_name.as_deref(), Some("fiscalisation_service"));
}

#[tokio::test]
async fn test_switch_flow_carries_context() {
    let store = Arc::new(InMemoryStore::new());
    let engine = create_engine(shipped_catalog(), store.clone());
    say(&engine, "agent please").await;
    let switched = tap(&engine, "topic_fiscal").await;
    assert_eq!(switched.flow_name.as_deref(), Some("fiscalisation_service"));
    assert_eq!(switched.status, PassStatus::AwaitingReply);

    let state = store.load_state(CONTACT).await.unwrap().unwrap();
    assert_eq!(state.flow_name, "fiscalisation_service");
    assert_eq!(state.current_step, "ask_vat_registered");
    assert_eq!(state.context["referred_from"], "support_handover");
    assert_eq!(state.context["trigger_keyword"], "topic_fiscal");
    assert!(state.context.get("topic").is_none());
}

#[tokio::test]
async fn test_fatal_action_terminates() {
    let source = json!({
        "name": "fragile",
        "trigger_keywords": ["go"],
        "steps": [
            {"name": "act", "is_entry_point": true, "type": "action",
             "config": {"actions_to_run": [
                {"action_type": "sync_erp", "fatal": true},
                {"action_type": "set_context_variable", "variable_name": "after", "value_template": "yes"}
             ]},
             "transitions": [{"to_step": "done"}]},
            {"name": "done", "type": "end_flow", "config": {"message_config": text_message("unreachable")}}
        ]
    })
    .to_string();
    let store = Arc::new(InMemoryStore::new());
    let engine = create_engine(catalog(&source), store.clone());
    let outcome = say(&engine, "go").await;
    assert!(matches!(outcome.status, PassStatus::Terminated { .. }));
    assert!(outcome.messages.is_empty());
    assert!(store.load_state(CONTACT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_fatal_failure_is_skipped() {
    let source = json!({
        "name": "tolerant",
        "trigger_keywords": ["go"],
        "steps": [
            {"name": "act", "is_entry_point": true, "type": "action",
             "config": {"actions_to_run": [
                {"action_type": "sync_erp"},
                {"action_type": "set_context_variable", "variable_name": "after", "value_template": "yes"}
             ]},
             "transitions": [{"to_step": "done"}]},
            {"name": "done", "type": "end_flow", "config": {"message_config": text_message("after={{ after }}")}}
        ]
    })
    .to_string();
    let engine = create_engine(catalog(&source), Arc::new(InMemoryStore::new()));
    assert_eq!(texts(&say(&engine, "go").await), vec!["after=yes"]);
}

#[tokio::test]
async fn test_dead_end_terminates() {
    let source = json!({
        "name": "narrow",
        "trigger_keywords": ["narrow"],
        "steps": [
            {"name": "start", "is_entry_point": true, "type": "send_message",
             "config": text_message("checking"),
             "transitions": [{"to_step": "done", "condition_config": {"type": "variable_exists", "variable_name": "never_set"}}]},
            {"name": "done", "type": "end_flow"}
        ]
    })
    .to_string();
    let store = Arc::new(InMemoryStore::new());
    let engine = create_engine(catalog(&source), store.clone());
    let outcome = say(&engine, "narrow").await;
    assert_eq!(texts(&outcome), vec!["checking"]);
    match outcome.status {
        PassStatus::Terminated { reason } => assert!(reason.contains("start")),
        other => panic!("Expected Terminated, got {:?}", other),
    }
    assert!(store.load_state(CONTACT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cycle_guard_terminates() {
    let source = json!({
        "name": "loop",
        "trigger_keywords": ["loop"],
        "steps": [
            {"name": "a", "is_entry_point": true, "type": "action", "config": {"actions_to_run": []},
             "transitions": [{"to_step": "b"}]},
            {"name": "b", "type": "action", "config": {"actions_to_run": []},
             "transitions": [{"to_step": "a"}, {"to_step": "out", "priority": 5}]},
            {"name": "out", "type": "end_flow"}
        ]
    })
    .to_string();
    let engine = create_engine(catalog(&source), Arc::new(InMemoryStore::new())).with_max_steps_per_pass(10);
    let outcome = say(&engine, "loop").await;
    match outcome.status {
        PassStatus::Terminated { reason } => assert!(reason.contains("more than 10 steps")),
        other => panic!("Expected Terminated, got {:?}", other),
    }
}

#[tokio::test]
async fn test_custom_action_handler() {
    let source = json!({
        "name": "quote",
        "trigger_keywords": ["quote"],
        "steps": [
            {"name": "price", "is_entry_point": true, "type": "action",
             "config": {"actions_to_run": [
                {"action_type": "calculate_quote", "params_template": {"units": 5}}
             ]},
             "transitions": [{"to_step": "done"}]},
            {"name": "done", "type": "end_flow", "config": {"message_config": text_message("Quote {{ quote_total }}")}}
        ]
    })
    .to_string();
    let mut registry = ActionRegistry::with_builtins();
    registry.register(
        "calculate_quote",
        FnHandler::new(|_contact, context: &mut Context, params| {
            let units = params
                .get("units")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ActionError::invalid("calculate_quote", "units must be an integer"))?;
            context.insert("quote_total".into(), json!(units * 10));
            Ok(vec![MessagePayload::text("Calculating...")])
        }),
    );
    let engine = create_engine(catalog(&source), Arc::new(InMemoryStore::new())).with_registry(registry);
    assert_eq!(texts(&say(&engine, "quote").await), vec!["Calculating...", "Quote 50"]);
}

#[tokio::test]
async fn test_start_flow_with_initial_context() {
    let store = Arc::new(InMemoryStore::new());
    let engine = create_engine(shipped_catalog(), store.clone());
    let mut context = Context::new();
    context.insert("campaign".into(), json!("october"));
    let outcome = engine.start_flow(CONTACT, "fiscalisation_service", context).await.unwrap();
    assert_eq!(outcome.status, PassStatus::AwaitingReply);
    let state = store.load_state(CONTACT).await.unwrap().unwrap();
    assert_eq!(state.context["campaign"], "october");
}

#[tokio::test]
async fn test_concurrent_messages_for_one_contact_are_serialized() {
    let source = json!({
        "name": "greeting",
        "trigger_keywords": ["hi"],
        "steps": [
            {"name": "ask", "is_entry_point": true, "type": "question",
             "config": {"message_config": text_message("Name?"), "reply_config": {"save_to_variable": "name"}},
             "transitions": [{"to_step": "bye"}]},
            {"name": "bye", "type": "end_flow", "config": {"message_config": text_message("Bye {{ name }}")}}
        ]
    })
    .to_string();
    let engine = Arc::new(create_engine(catalog(&source), Arc::new(InMemoryStore::new())));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .handle_inbound(InboundMessage::text_message(CONTACT, "hi"))
                    .await
                    .unwrap()
                    .status
            })
        })
        .collect();
    let mut statuses = Vec::new();
    for handle in handles {
        statuses.push(handle.await.unwrap());
    }
    assert!(statuses.contains(&PassStatus::AwaitingReply));
    assert!(statuses.contains(&PassStatus::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contacts_run_in_parallel() {
    let store = Arc::new(InMemoryStore::new());
    let engine = Arc::new(create_engine(shipped_catalog(), store.clone()));
    let handles: Vec<_> = (0..20)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .handle_inbound(InboundMessage::text_message(format!("2637700000{i:02}"), "zimra"))
                    .await
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().status, PassStatus::AwaitingReply);
    }
    for i in 0..20 {
        let state = store.load_state(&format!("2637700000{i:02}")).await.unwrap().unwrap();
        assert_eq!(state.current_step, "ask_vat_registered");
    }
}
