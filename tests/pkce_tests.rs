//! End-to-end PKCE ceremony tests.

use std::sync::Arc;

use authgate::cache::{CacheFacade, MemoryStore};
use authgate::config::PkceConfig;
use authgate::pkce::{PkceManager, PkceOptions};
use pretty_assertions::assert_eq;

fn manager() -> PkceManager {
    let cache = CacheFacade::new(Arc::new(MemoryStore::new()), true);
    PkceManager::new(cache, PkceConfig::default())
}

#[tokio::test]
async fn full_round_trip_is_single_use() {
    let pkce = manager();

    // Generate a pair bound to a user
    let pair = pkce
        .generate_pair(PkceOptions {
            user_id: Some("u3".to_string()),
            client_id: None,
        })
        .await
        .unwrap();

    assert_eq!(pair.method, "S256");
    assert!(pair.verifier.len() >= 43);
    assert!(!pair.state.is_empty());

    // First validation succeeds
    let first = pkce.validate(&pair.state, &pair.verifier).await;
    assert!(first.valid);
    assert_eq!(first.error_code, None);
    assert_eq!(first.pair.unwrap().user_id.as_deref(), Some("u3"));

    // Replay with the same state fails with invalid_grant
    let second = pkce.validate(&pair.state, &pair.verifier).await;
    assert!(!second.valid);
    assert_eq!(second.error_code, Some("invalid_grant"));
}

#[tokio::test]
async fn cross_pair_verifiers_do_not_validate() {
    let pkce = manager();
    let pair_a = pkce.generate_pair(PkceOptions::default()).await.unwrap();
    let pair_b = pkce.generate_pair(PkceOptions::default()).await.unwrap();

    // B's verifier against A's state must fail, and must not consume A
    let crossed = pkce.validate(&pair_a.state, &pair_b.verifier).await;
    assert!(!crossed.valid);
    assert_eq!(crossed.error_code, Some("invalid_grant"));

    let proper = pkce.validate(&pair_a.state, &pair_a.verifier).await;
    assert!(proper.valid);
}

#[tokio::test]
async fn expired_pairs_fail_with_invalid_grant() {
    let cache = CacheFacade::new(Arc::new(MemoryStore::new()), true);
    let pkce = PkceManager::new(
        cache,
        PkceConfig {
            ttl_secs: 0,
            ..PkceConfig::default()
        },
    );

    let pair = pkce.generate_pair(PkceOptions::default()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let result = pkce.validate(&pair.state, &pair.verifier).await;
    assert!(!result.valid);
    assert_eq!(result.error_code, Some("invalid_grant"));
}

#[tokio::test]
async fn authorization_url_helper_appends_ceremony_params() {
    let pkce = manager();
    let pair = pkce.generate_pair(PkceOptions::default()).await.unwrap();

    let url = pkce
        .authorization_url(
            "https://id.example.com/realms/acme/auth?prompt=login",
            &pair,
            &[("client_id", "gateway"), ("response_type", "code")],
        )
        .unwrap();

    assert!(url.contains("prompt=login"));
    assert!(url.contains(&format!("state={}", pair.state)));
    assert!(url.contains("code_challenge_method=S256"));
    assert!(url.contains("response_type=code"));
}
