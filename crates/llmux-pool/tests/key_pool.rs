use std::collections::BTreeSet;
use std::time::Duration;

use llmux_common::{ModelFamily, Service};
use llmux_pool::{
    DisableReason, EventHub, KeyPatch, KeyPool, LockoutPeriod, PoolConfig, PoolEvent,
};

fn pool_with(service: Service, secrets: &[&str]) -> KeyPool {
    let pool = KeyPool::new(PoolConfig::default(), EventHub::new(64));
    let secrets: Vec<String> = secrets.iter().map(|s| s.to_string()).collect();
    pool.insert_secrets(service, &secrets);
    pool
}

#[tokio::test]
async fn get_prefers_least_recently_used() {
    let pool = pool_with(Service::Anthropic, &["key-a", "key-b"]);

    let first = pool.get("claude-3-5-sonnet-20241022", Service::Anthropic).unwrap();
    let second = pool.get("claude-3-5-sonnet-20241022", Service::Anthropic).unwrap();
    // Two keys, two gets: both must be handed out before either repeats.
    assert_ne!(first.hash, second.hash);
}

#[tokio::test]
async fn reuse_delay_blocks_immediate_reissue() {
    let pool = pool_with(Service::Anthropic, &["only-key"]);

    let key = pool.get("claude-3-opus-20240229", Service::Anthropic).unwrap();
    assert!(!key.hash.is_empty());
    // The single key is inside its reuse window now.
    assert!(pool.get("claude-3-opus-20240229", Service::Anthropic).is_err());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(pool.get("claude-3-opus-20240229", Service::Anthropic).is_ok());
}

#[tokio::test]
async fn disabled_keys_never_dispatch() {
    let pool = pool_with(Service::Openai, &["sk-1", "sk-2"]);
    let key = pool.get("gpt-4o", Service::Openai).unwrap();
    pool.disable(&key.hash, DisableReason::Revoked);

    for _ in 0..8 {
        if let Ok(other) = pool.get("gpt-4o", Service::Openai) {
            assert_ne!(other.hash, key.hash);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let records = pool.list(Service::Openai);
    let revoked = records.iter().find(|r| r.hash == key.hash).unwrap();
    assert!(revoked.is_disabled && revoked.is_revoked);
}

#[tokio::test]
async fn rate_limit_window_is_respected() {
    let pool = pool_with(Service::Deepseek, &["ds-1"]);
    let key = pool.get("deepseek-chat", Service::Deepseek).unwrap();
    pool.mark_rate_limited(&key.hash);

    // Inside the lockout the key must not come back.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(pool.get("deepseek-chat", Service::Deepseek).is_err());

    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert!(pool.get("deepseek-chat", Service::Deepseek).is_ok());
}

#[tokio::test]
async fn update_is_idempotent_and_ignores_unknown_hashes() {
    let pool = pool_with(Service::Anthropic, &["key-a"]);
    let hash = pool.list(Service::Anthropic)[0].hash.clone();

    let patch = KeyPatch {
        requires_preamble: Some(true),
        families: Some(BTreeSet::from([ModelFamily::Claude])),
        ..KeyPatch::default()
    };
    pool.update(&hash, &patch);
    let after_one: Vec<_> = pool.list(Service::Anthropic);
    pool.update(&hash, &patch);
    let after_two: Vec<_> = pool.list(Service::Anthropic);
    assert_eq!(after_one[0].families, after_two[0].families);

    // Unknown hash is a no-op, not a panic.
    pool.update("anthropic-ffffffffffffffff", &patch);
}

#[tokio::test]
async fn family_removal_is_permanent_until_recheck() {
    let pool = pool_with(Service::Anthropic, &["key-a"]);
    let hash = pool.list(Service::Anthropic)[0].hash.clone();

    pool.remove_family(&hash, ModelFamily::ClaudeOpus);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(pool.get("claude-3-opus-20240229", Service::Anthropic).is_err());
    assert!(pool.get("claude-3-5-haiku-20241022", Service::Anthropic).is_ok());

    pool.recheck(Service::Anthropic);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(pool.get("claude-3-opus-20240229", Service::Anthropic).is_ok());
}

#[tokio::test]
async fn google_per_family_quota_spares_other_families() {
    let pool = pool_with(Service::GoogleAi, &["g-key"]);
    let hash = pool.list(Service::GoogleAi)[0].hash.clone();

    pool.update(
        &hash,
        &KeyPatch {
            over_quota_families_add: Some(BTreeSet::from([ModelFamily::GeminiPro])),
            ..KeyPatch::default()
        },
    );

    assert!(pool.get("gemini-1.5-pro", Service::GoogleAi).is_err());
    assert!(pool.get("gemini-1.5-flash", Service::GoogleAi).is_ok());
}

#[tokio::test]
async fn lockout_period_reports_partition_state() {
    let pool = pool_with(Service::Xai, &["x-key"]);

    assert_eq!(
        pool.lockout_period(Service::Xai, ModelFamily::Grok),
        LockoutPeriod::Ready
    );
    // A family no key owns refuses dispatch outright.
    assert_eq!(
        pool.lockout_period(Service::Xai, ModelFamily::Claude),
        LockoutPeriod::NoKeys
    );

    let key = pool.get("grok-2", Service::Xai).unwrap();
    pool.mark_rate_limited(&key.hash);
    match pool.lockout_period(Service::Xai, ModelFamily::Grok) {
        LockoutPeriod::Wait(wait) => assert!(wait <= Duration::from_millis(2000)),
        other => panic!("expected pending lockout, got {other:?}"),
    }
}

#[tokio::test]
async fn usage_refund_round_trips() {
    let pool = pool_with(Service::Openai, &["sk-1"]);
    let hash = pool.list(Service::Openai)[0].hash.clone();

    pool.increment_usage(&hash, ModelFamily::Gpt4o, 1000, 250);
    pool.refund_usage(&hash, ModelFamily::Gpt4o, 1000, 250);

    let record = &pool.list(Service::Openai)[0];
    let usage = record.token_usage.get(&ModelFamily::Gpt4o).copied().unwrap();
    assert_eq!((usage.input, usage.output), (0, 0));
}

#[tokio::test]
async fn disable_emits_event() {
    let pool = pool_with(Service::Openai, &["sk-1"]);
    let mut rx = pool.events().subscribe();
    let hash = pool.list(Service::Openai)[0].hash.clone();

    pool.disable(&hash, DisableReason::Quota);

    let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, PoolEvent::KeyDisabled { .. }));
}
