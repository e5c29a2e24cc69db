//! # 凭据轮换端到端测试
//!
//! 覆盖零空窗轮换、重叠窗口停用、审计追踪与加密落盘。

mod common;

use common::credential_files;
use sis_gateway::config::CredentialCrypto;
use sis_gateway::credentials::{
    ApiKeyKind, ApiKeyManager, ApiKeyStatus, AuditOperation, CredentialStore, KeyLifecycleTask,
    RotationPolicy,
};
use sis_gateway::types::ProviderId;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn manager_in(dir: &TempDir) -> ApiKeyManager {
    ApiKeyManager::new(CredentialStore::new(
        credential_files(dir),
        CredentialCrypto::new(&[21u8; 32]),
    ))
}

#[tokio::test]
async fn rotation_never_leaves_provider_without_active_key() {
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir);
    let provider = ProviderId::new("powerschool");

    manager
        .create_key(provider.clone(), "sk-v1", ApiKeyKind::Primary, None)
        .await
        .unwrap();

    // 轮换前后任何时刻 get_active_key 都有值
    assert!(manager.get_active_key(&provider).await.is_some());

    let (new_key, old_key) = manager
        .rotate_key(&provider, "sk-v2", false)
        .await
        .unwrap();
    let old_key = old_key.unwrap();

    let active = manager
        .get_active_key(&provider)
        .await
        .expect("active key must exist during rotation overlap");
    assert_eq!(active.id, new_key.id);
    assert_eq!(active.value, "sk-v2");
    assert_eq!(old_key.status, ApiKeyStatus::Rotating);

    // 清扫后旧密钥停用，新密钥依旧活跃
    let report = manager.check_key_health().await;
    assert_eq!(report.by_status.get("active"), Some(&1));
    assert_eq!(report.by_status.get("rotating"), Some(&1));
}

#[tokio::test]
async fn lifecycle_task_deactivates_old_key_after_overlap() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(manager_in(&dir));
    let provider = ProviderId::new("skyward");

    // 重叠窗口为 0 天：清扫一跑旧密钥即停用
    manager
        .set_policy(
            &provider,
            RotationPolicy {
                rotation_interval_days: 90,
                warning_days: 14,
                overlap_days: 0,
            },
        )
        .await;

    manager
        .create_key(provider.clone(), "sk-v1", ApiKeyKind::Primary, None)
        .await
        .unwrap();
    let (new_key, old_key) = manager
        .rotate_key(&provider, "sk-v2", false)
        .await
        .unwrap();
    let old_id = old_key.unwrap().id;

    let task = KeyLifecycleTask::with_intervals(
        manager.clone(),
        Duration::from_millis(20),
        Duration::from_secs(3600),
    );
    task.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    task.stop().await;

    let report = manager.check_key_health().await;
    assert_eq!(report.by_status.get("inactive"), Some(&1));
    assert_eq!(report.by_status.get("active"), Some(&1));

    // 活跃的必须是新密钥
    let active = manager.get_active_key(&provider).await.unwrap();
    assert_eq!(active.id, new_key.id);
    assert_ne!(active.id, old_id);
}

#[tokio::test]
async fn audit_log_records_every_mutation_and_persists() {
    let dir = TempDir::new().unwrap();
    let provider = ProviderId::new("aeries");

    {
        let manager = manager_in(&dir);
        let key = manager
            .create_key(provider.clone(), "sk-1", ApiKeyKind::Primary, None)
            .await
            .unwrap();
        manager.rotate_key(&provider, "sk-2", false).await.unwrap();
        manager
            .update_key_status(&key.id, ApiKeyStatus::Compromised, Some("leaked in logs"))
            .await
            .unwrap();
        manager.delete_key(&key.id).await.unwrap();
    }

    // 新实例从磁盘恢复审计与密钥
    let manager = manager_in(&dir);
    manager.load().await.unwrap();

    let audit = manager.recent_audit(50).await;
    let operations: Vec<AuditOperation> = audit.iter().map(|r| r.operation).collect();
    assert!(operations.contains(&AuditOperation::CreateKey));
    assert!(operations.contains(&AuditOperation::RotateKey));
    assert!(operations.contains(&AuditOperation::UpdateStatus));
    assert!(operations.contains(&AuditOperation::DeleteKey));

    // 轮换出的新密钥在重启后仍可取用
    let active = manager.get_active_key(&provider).await.unwrap();
    assert_eq!(active.value, "sk-2");
}

#[tokio::test]
async fn key_store_on_disk_never_contains_plaintext() {
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir);

    manager
        .create_key(
            ProviderId::new("qmlativ"),
            "super-secret-value-42",
            ApiKeyKind::Primary,
            None,
        )
        .await
        .unwrap();

    let raw = std::fs::read_to_string(dir.path().join("keys.json")).unwrap();
    assert!(!raw.contains("super-secret-value-42"));
}

#[tokio::test]
async fn compromised_key_is_flagged_for_rotation() {
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir);
    let provider = ProviderId::new("powerschool");

    let key = manager
        .create_key(provider, "sk-1", ApiKeyKind::Primary, None)
        .await
        .unwrap();
    manager
        .update_key_status(&key.id, ApiKeyStatus::Compromised, Some("credential stuffing"))
        .await
        .unwrap();

    let report = manager.check_key_health().await;
    assert_eq!(report.rotation_due.len(), 1);
    assert_eq!(report.rotation_due[0].key_id, key.id);
}
