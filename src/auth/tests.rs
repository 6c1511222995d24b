//! Auth module tests

use super::*;
use crate::config::{AuthConfig, UserConfig};

fn make_auth_config(enabled: bool, allow_anonymous: bool, users: Vec<UserConfig>) -> AuthConfig {
    AuthConfig {
        enabled,
        allow_anonymous,
        users,
    }
}

fn make_user_plaintext(username: &str, password: &str, role: Option<&str>) -> UserConfig {
    UserConfig {
        username: username.to_string(),
        password: Some(password.to_string()),
        password_hash: None,
        role: role.map(|s| s.to_string()),
    }
}

fn make_user_hashed(username: &str, password_hash: &str) -> UserConfig {
    UserConfig {
        username: username.to_string(),
        password: None,
        password_hash: Some(password_hash.to_string()),
        role: None,
    }
}

// Argon2 hash for "secret" generated with default params
const TEST_ARGON2_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$3QUugnyLZGsTrETNoga03Q$Tnmpw8w1t/PzI36MTps259IB7ntGAb4NA0KlYD9Yzlw";

#[tokio::test]
async fn test_auth_disabled_allows_all() {
    let provider = AuthProvider::new(&make_auth_config(false, false, vec![]));
    assert!(provider
        .check_connect("client1", Some("user"), Some(b"pass"))
        .await
        .unwrap());
    assert!(!provider.is_enabled());
}

#[tokio::test]
async fn test_anonymous() {
    let provider = AuthProvider::new(&make_auth_config(true, true, vec![]));
    assert!(provider.check_connect("c", None, None).await.unwrap());

    let provider = AuthProvider::new(&make_auth_config(true, false, vec![]));
    assert!(!provider.check_connect("c", None, None).await.unwrap());
}

#[tokio::test]
async fn test_plaintext_credentials() {
    let provider = AuthProvider::new(&make_auth_config(
        true,
        false,
        vec![make_user_plaintext("admin", "secret", None)],
    ));

    assert!(provider
        .check_connect("c", Some("admin"), Some(b"secret"))
        .await
        .unwrap());
    assert!(!provider
        .check_connect("c", Some("admin"), Some(b"wrong"))
        .await
        .unwrap());
    assert!(!provider
        .check_connect("c", Some("admin"), None)
        .await
        .unwrap());
    assert!(!provider
        .check_connect("c", Some("unknown"), Some(b"secret"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_password_hash() {
    let provider = AuthProvider::new(&make_auth_config(
        true,
        false,
        vec![
            make_user_plaintext("plain_user", "plainpass", None),
            make_user_hashed("hash_user", TEST_ARGON2_HASH),
        ],
    ));

    assert!(provider
        .check_connect("c1", Some("hash_user"), Some(b"secret"))
        .await
        .unwrap());
    assert!(!provider
        .check_connect("c1", Some("hash_user"), Some(b"wrong"))
        .await
        .unwrap());
    assert!(provider
        .check_connect("c2", Some("plain_user"), Some(b"plainpass"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_malformed_hash_rejects() {
    let provider = AuthProvider::new(&make_auth_config(
        true,
        false,
        vec![make_user_hashed("u", "$argon2id$garbage")],
    ));
    assert!(!provider
        .check_connect("c", Some("u"), Some(b"secret"))
        .await
        .unwrap());
}

#[test]
fn test_user_role() {
    let provider = AuthProvider::new(&make_auth_config(
        true,
        false,
        vec![make_user_plaintext("admin", "x", Some("admin_role"))],
    ));
    assert_eq!(provider.get_user_role("admin"), Some("admin_role"));
    assert_eq!(provider.get_user_role("unknown"), None);
}
