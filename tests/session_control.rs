//! Session controller behavior: supersession with merge-and-restart, the
//! superseded status for displaced callers, and ordered segment emission.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use rapport_backend::config::AppConfig;
use rapport_backend::database::ChatStore;
use rapport_backend::graph::stage_manage::StageProfileSet;
use rapport_backend::graph::GraphExecutor;
use rapport_backend::invoker::Role;
use rapport_backend::session::{SessionManager, TurnStatus};
use rapport_backend::state::{BotBasicInfo, BotBigFive, BotPersona};
use rapport_backend::test_support::ScriptedInvoker;

fn build_sessions(
    invoker: Arc<ScriptedInvoker>,
) -> (Arc<SessionManager>, Arc<ChatStore>, i64) {
    let store = Arc::new(ChatStore::in_memory().expect("store"));
    let bot_id = store
        .create_bot(
            "Mika",
            &BotBasicInfo {
                name: "Mika".to_string(),
                ..Default::default()
            },
            &BotBigFive::default(),
            &BotPersona::default(),
        )
        .expect("bot");
    let config = Arc::new(AppConfig::default());
    let executor = Arc::new(GraphExecutor::new(
        invoker,
        store.clone(),
        config.clone(),
        Arc::new(StageProfileSet::builtin()),
    ));
    (SessionManager::new(executor, config), store, bot_id)
}

fn good_soft() -> Value {
    json!({
        "assistantiness": 0.1,
        "immersion_break": 0.05,
        "persona_consistency": 0.9,
        "relationship_fit": 0.85,
        "mode_behavior_fit": 0.85,
        "plan_alignment": 0.8,
        "overall_score": 0.85
    })
}

fn kitchen_sink_fast() -> Value {
    json!({
        "is_injection_attempt": false,
        "is_ai_test": false,
        "is_user_treating_as_assistant": false,
        "word_budget": 30,
        "task_budget_max": 1,
        "selected": [],
        "deltas": {},
        "summary": "short chat",
        "topic": "chat",
        "importance": 0.2,
        "short_context": "a short exchange"
    })
}

fn kitchen_sink_main(reply: &str) -> Value {
    json!({
        "scores": {},
        "brief": "",
        "inner_monologue": "",
        "messages": [{"content": reply}],
        "plans": [{"messages": [{"content": reply}]}]
    })
}

fn set_defaults(invoker: &ScriptedInvoker, reply: &str) {
    invoker.set_default(Role::Fast, kitchen_sink_fast());
    invoker.set_default(Role::Main, kitchen_sink_main(reply));
    invoker.set_default(Role::Judge, good_soft());
}

#[tokio::test(flavor = "multi_thread")]
async fn second_message_supersedes_and_merges_the_first() {
    // Every model call stalls long enough for the second message to land
    // while the first turn is still inside the interruptible window.
    let invoker = Arc::new(
        ScriptedInvoker::new().with_delay(Duration::from_millis(200)),
    );
    set_defaults(&invoker, "都听到啦，一条条说");

    let (sessions, store, bot_id) = build_sessions(invoker);

    let first = sessions.submit(bot_id, "u1", "今天好累".to_string()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = sessions
        .submit(bot_id, "u1", "而且还没吃饭".to_string())
        .await;

    let first_response = first.await.expect("first response");
    assert_eq!(first_response.status, TurnStatus::Superseded);
    assert!(first_response.segments.is_empty());

    let second_response = second.await.expect("second response");
    assert_eq!(second_response.status, TurnStatus::Success);
    assert!(!second_response.segments.is_empty());

    // No ghost writes from the canceled turn: exactly one exchange landed,
    // and its user row carries the merged input.
    let user_id = store.user_id_for(bot_id, "u1").unwrap().expect("user");
    assert_eq!(store.count_messages(user_id).unwrap(), 2);
    assert_eq!(store.count_transcripts(user_id).unwrap(), 1);

    let ctx = store.load_turn_context(bot_id, "u1").expect("ctx");
    assert_eq!(ctx.chat_buffer[0].content, "今天好累\n而且还没吃饭");
}

#[tokio::test(flavor = "multi_thread")]
async fn segments_are_emitted_in_order_with_delays_honored() {
    let invoker = Arc::new(ScriptedInvoker::new());
    set_defaults(&invoker, "placeholder");
    // A three-bubble reply with short real delays.
    invoker.set_default(
        Role::Processor,
        json!({"segments": [
            {"content": "好啦好啦我在听呢", "delay_seconds": 0},
            {"content": "你慢慢说", "delay_seconds": 0.05},
            {"content": "不急哈", "delay_seconds": 0.05}
        ]}),
    );
    invoker.set_default(Role::Main, kitchen_sink_main("好啦好啦我在听呢 你慢慢说 不急哈"));

    let (sessions, _store, bot_id) = build_sessions(invoker);
    let mut events = sessions.subscribe_events();

    let response = sessions
        .submit(bot_id, "u1", "我跟你说件事".to_string())
        .await
        .await
        .expect("response");
    assert_eq!(response.status, TurnStatus::Success);
    assert_eq!(response.segments.len(), 3);

    let mut seen = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        seen.push((event.index, event.content));
    }
    assert_eq!(
        seen,
        vec![
            (0, "好啦好啦我在听呢".to_string()),
            (1, "你慢慢说".to_string()),
            (2, "不急哈".to_string())
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn a_new_message_discards_unemitted_segments() {
    let invoker = Arc::new(ScriptedInvoker::new());
    set_defaults(&invoker, "placeholder");
    // The second and third bubbles sit behind a long delay; a follow-up
    // message should cancel them before they fire.
    invoker.set_default(
        Role::Processor,
        json!({"segments": [
            {"content": "这条先发你别着急哈", "delay_seconds": 0},
            {"content": "后面这条要等很久", "delay_seconds": 30}
        ]}),
    );
    invoker.set_default(Role::Main, kitchen_sink_main("这条先发你别着急哈 后面这条要等很久"));

    let (sessions, _store, bot_id) = build_sessions(invoker);
    let mut events = sessions.subscribe_events();

    let first = sessions
        .submit(bot_id, "u1", "第一个问题".to_string())
        .await
        .await
        .expect("first turn");
    assert_eq!(first.status, TurnStatus::Success);

    // The zero-delay bubble arrives...
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("first bubble")
        .expect("channel open");
    assert_eq!(event.content, "这条先发你别着急哈");

    // ...then a new message supersedes the rest of the emission.
    let second = sessions
        .submit(bot_id, "u1", "等等，先别说这个".to_string())
        .await
        .await
        .expect("second turn");
    assert_eq!(second.status, TurnStatus::Success);

    // Whatever arrives next on the event stream belongs to the new turn,
    // never the canceled tail of the old one.
    let next = tokio::time::timeout(Duration::from_secs(2), events.recv()).await;
    if let Ok(Ok(event)) = next {
        assert_ne!(event.content, "后面这条要等很久", "stale bubble leaked through");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn independent_sessions_do_not_interfere() {
    let invoker = Arc::new(ScriptedInvoker::new());
    set_defaults(&invoker, "各聊各的");

    let (sessions, store, bot_id) = build_sessions(invoker);

    let a = sessions.submit(bot_id, "alice", "你好".to_string()).await;
    let b = sessions.submit(bot_id, "bob", "hello".to_string()).await;

    assert_eq!(a.await.expect("a").status, TurnStatus::Success);
    assert_eq!(b.await.expect("b").status, TurnStatus::Success);

    let alice = store.user_id_for(bot_id, "alice").unwrap().expect("alice");
    let bob = store.user_id_for(bot_id, "bob").unwrap().expect("bob");
    assert_eq!(store.count_messages(alice).unwrap(), 2);
    assert_eq!(store.count_messages(bob).unwrap(), 2);
}
