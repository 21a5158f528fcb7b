use super::*;
use crate::kv::{MemoryKv, UnreachableKv};
use crate::metrics::TracingMetrics;
use std::sync::Arc;

fn identity() -> Identity {
    Identity::new("github", "ws1", ActorType::User, "u1")
}

fn credential(expires_in: Duration, refreshable: bool) -> Credential {
    Credential {
        identity: identity(),
        access_token: "gho_access".to_string(),
        refresh_token: refreshable.then(|| "ghr_refresh".to_string()),
        expires_at: Utc::now() + expires_in,
        scope: ["repo".to_string()].into(),
    }
}

fn store_with(kv: Option<Arc<dyn crate::kv::DistributedCache>>) -> CredentialStore {
    let durable = DurableStore::open(":memory:").unwrap();
    let cache = kv.map(|kv| CredentialCache::new(kv, Arc::new(TracingMetrics)));
    CredentialStore::new(durable, Codec::ephemeral(), cache)
}

#[test]
fn test_identity_display() {
    assert_eq!(identity().to_string(), "github/ws1/user/u1");
}

#[test]
fn test_keys_separate_actors() {
    let a = Identity::new("github", "ws1", ActorType::User, "u1");
    let b = Identity::new("github", "ws1", ActorType::User, "u2");
    let c = Identity::new("github", "ws1", ActorType::Service, "u1");

    assert_ne!(a.lock_key(), b.lock_key());
    assert_ne!(a.lock_key(), c.lock_key());
    assert_ne!(a.cache_key(), c.cache_key());
    assert!(a.cache_key().starts_with("cred:"));
}

#[test]
fn test_debug_redacts_tokens() {
    let rendered = format!("{:?}", credential(Duration::hours(1), true));
    assert!(!rendered.contains("gho_access"));
    assert!(!rendered.contains("ghr_refresh"));
    assert!(rendered.contains("github"));
}

#[test]
fn test_credential_state() {
    let now = Utc::now();
    let margin = Duration::seconds(120);

    assert_eq!(credential(Duration::hours(1), true).state(margin, now), CredentialState::Valid);
    assert_eq!(
        credential(Duration::seconds(30), true).state(margin, now),
        CredentialState::NearExpiry
    );
    assert_eq!(
        credential(Duration::seconds(-30), true).state(margin, now),
        CredentialState::Expired
    );
}

#[tokio::test]
async fn test_store_and_get_through_cache() {
    let kv = Arc::new(MemoryKv::new());
    let store = store_with(Some(kv.clone()));
    let cred = credential(Duration::hours(1), true);

    store.store(&cred).await.unwrap();
    assert_eq!(kv.keys_with_prefix("cred:").len(), 1);

    let fetched = store.get(&cred.identity).await.unwrap().unwrap();
    assert_eq!(fetched, cred);
}

#[tokio::test]
async fn test_durable_rows_hold_ciphertext_only() {
    let store = store_with(None);
    let cred = credential(Duration::hours(1), true);
    store.store(&cred).await.unwrap();

    let sealed = store.durable.fetch(&cred.identity).unwrap().unwrap();
    assert!(sealed.access_token.starts_with("v1:"));
    assert!(!sealed.access_token.contains("gho_access"));
    assert!(!sealed.refresh_token.unwrap().contains("ghr_refresh"));
}

#[tokio::test]
async fn test_flushed_cache_falls_back_and_rewarms() {
    let kv = Arc::new(MemoryKv::new());
    let store = store_with(Some(kv.clone()));
    let cred = credential(Duration::hours(1), true);
    store.store(&cred).await.unwrap();

    kv.flush();
    assert!(kv.is_empty());

    let fetched = store.get(&cred.identity).await.unwrap().unwrap();
    assert_eq!(fetched.access_token, cred.access_token);
    assert_eq!(kv.keys_with_prefix("cred:").len(), 1);
}

#[tokio::test]
async fn test_reload_bypasses_stale_cache_entry() {
    let kv = Arc::new(MemoryKv::new());
    let store = store_with(Some(kv.clone()));
    let stale = credential(Duration::seconds(30), true);
    store.store(&stale).await.unwrap();

    // A newer row lands while the cache still holds the old entry
    let fresh = Credential {
        access_token: "gho_fresh".to_string(),
        expires_at: Utc::now() + Duration::hours(1),
        ..stale.clone()
    };
    store.durable.upsert(&fresh.seal(&store.codec).unwrap()).unwrap();

    assert_eq!(store.get(&stale.identity).await.unwrap().unwrap().access_token, "gho_access");
    assert_eq!(store.reload(&stale.identity).await.unwrap().unwrap().access_token, "gho_fresh");
    // Reload rewarmed the cache
    assert_eq!(store.get(&stale.identity).await.unwrap().unwrap().access_token, "gho_fresh");
}

#[tokio::test]
async fn test_expired_without_refresh_token_reads_as_absent() {
    let store = store_with(Some(Arc::new(MemoryKv::new())));
    store.store(&credential(Duration::seconds(-10), false)).await.unwrap();

    assert!(store.get(&identity()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_with_refresh_token_is_returned_uncached() {
    let kv = Arc::new(MemoryKv::new());
    let store = store_with(Some(kv.clone()));
    store.store(&credential(Duration::seconds(-10), true)).await.unwrap();

    let fetched = store.get(&identity()).await.unwrap().unwrap();
    assert!(fetched.is_expired_at(Utc::now()));
    assert!(kv.is_empty());
}

#[tokio::test]
async fn test_unreachable_cache_is_not_fatal() {
    let store = store_with(Some(Arc::new(UnreachableKv)));
    let cred = credential(Duration::hours(1), true);

    store.store(&cred).await.unwrap();
    assert!(store.cache_degraded());

    let fetched = store.get(&cred.identity).await.unwrap().unwrap();
    assert_eq!(fetched.access_token, cred.access_token);
}

#[tokio::test]
async fn test_delete_removes_both_copies() {
    let kv = Arc::new(MemoryKv::new());
    let store = store_with(Some(kv.clone()));
    let cred = credential(Duration::hours(1), true);
    store.store(&cred).await.unwrap();

    assert!(store.delete(&cred.identity).await.unwrap());
    assert!(kv.is_empty());
    assert!(store.get(&cred.identity).await.unwrap().is_none());
    assert!(!store.delete(&cred.identity).await.unwrap());
}

#[tokio::test]
async fn test_wrong_key_surfaces_codec_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.db");
    let cred = credential(Duration::hours(1), true);

    let first = CredentialStore::new(DurableStore::open(&path).unwrap(), Codec::ephemeral(), None);
    first.store(&cred).await.unwrap();

    let rotated = CredentialStore::new(DurableStore::open(&path).unwrap(), Codec::ephemeral(), None);
    let err = rotated.get(&cred.identity).await.unwrap_err();
    assert!(matches!(err, GateError::Codec(CodecError::Decryption)));
}

#[tokio::test]
async fn test_list_for_workspace() {
    let store = store_with(None);
    store.store(&credential(Duration::hours(1), true)).await.unwrap();

    let mut other = credential(Duration::hours(1), true);
    other.identity = Identity::new("gmail", "ws2", ActorType::Service, "svc");
    store.store(&other).await.unwrap();

    assert_eq!(store.list_for_workspace("ws1").unwrap(), vec![identity()]);
    assert_eq!(store.list_all().unwrap().len(), 2);
}
