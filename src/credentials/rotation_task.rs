//! # 密钥生命周期后台任务
//!
//! 周期清扫密钥状态（Rotating→Inactive、Active→Expired），并按更长周期
//! 检查轮换到期情况发出预警。单次迭代失败只记录日志，循环继续。

use super::manager::ApiKeyManager;
use crate::logging::{LogComponent, LogStage};
use crate::{lerror, linfo, lwarn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// 默认生命周期清扫周期
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// 默认轮换到期检查周期
const DEFAULT_ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// 密钥生命周期任务
#[derive(Clone)]
pub struct KeyLifecycleTask {
    manager: Arc<ApiKeyManager>,
    sweep_interval: Duration,
    rotation_check_interval: Duration,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl KeyLifecycleTask {
    /// 创建生命周期任务
    #[must_use]
    pub fn new(manager: Arc<ApiKeyManager>) -> Self {
        Self::with_intervals(
            manager,
            DEFAULT_SWEEP_INTERVAL,
            DEFAULT_ROTATION_CHECK_INTERVAL,
        )
    }

    /// 使用自定义周期创建（测试用）
    #[must_use]
    pub fn with_intervals(
        manager: Arc<ApiKeyManager>,
        sweep_interval: Duration,
        rotation_check_interval: Duration,
    ) -> Self {
        Self {
            manager,
            sweep_interval,
            rotation_check_interval,
            task_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// 启动后台循环
    pub async fn start(&self) {
        let mut guard = self.task_handle.write().await;
        if guard.is_some() {
            return;
        }

        let manager = self.manager.clone();
        let sweep_interval = self.sweep_interval;
        let rotation_check_interval = self.rotation_check_interval;
        let handle = tokio::spawn(run(manager, sweep_interval, rotation_check_interval));
        *guard = Some(handle);

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Credentials,
            "lifecycle_task_started",
            "Key lifecycle task started",
            sweep_interval_secs = sweep_interval.as_secs(),
            rotation_check_interval_secs = rotation_check_interval.as_secs()
        );
    }

    /// 停止后台循环
    pub async fn stop(&self) {
        let handle = {
            let mut guard = self.task_handle.write().await;
            guard.take()
        };

        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::Credentials,
            "lifecycle_task_stopped",
            "Key lifecycle task stopped"
        );
    }
}

async fn run(
    manager: Arc<ApiKeyManager>,
    sweep_interval: Duration,
    rotation_check_interval: Duration,
) {
    let mut sweep_tick = tokio::time::interval(sweep_interval);
    let mut rotation_tick = tokio::time::interval(rotation_check_interval);
    // 启动时的首个立即 tick 跳过，避免与 load() 竞争
    sweep_tick.tick().await;
    rotation_tick.tick().await;

    loop {
        tokio::select! {
            _ = sweep_tick.tick() => {
                match manager.sweep_lifecycle().await {
                    Ok(outcome) => {
                        if !outcome.deactivated.is_empty() || !outcome.expired.is_empty() {
                            linfo!(
                                "system",
                                LogStage::BackgroundTask,
                                LogComponent::Credentials,
                                "lifecycle_sweep_applied",
                                "Key lifecycle sweep applied transitions",
                                deactivated = outcome.deactivated.len(),
                                expired = outcome.expired.len()
                            );
                        }
                    }
                    Err(err) => {
                        lerror!(
                            "system",
                            LogStage::BackgroundTask,
                            LogComponent::Credentials,
                            "lifecycle_sweep_failed",
                            "Key lifecycle sweep failed, will retry next cycle",
                            error = %err
                        );
                    }
                }
            }
            _ = rotation_tick.tick() => {
                let report = manager.check_key_health().await;
                for entry in &report.rotation_due {
                    lwarn!(
                        "system",
                        LogStage::BackgroundTask,
                        LogComponent::Credentials,
                        "rotation_due",
                        "API key is due for rotation",
                        key_id = %entry.key_id,
                        provider = %entry.provider,
                        reason = entry.reason.as_str()
                    );
                }
                for warning in &report.expiry_warnings {
                    lwarn!(
                        "system",
                        LogStage::BackgroundTask,
                        LogComponent::Credentials,
                        "expiry_warning",
                        "API key approaching hard expiry",
                        key_id = %warning.key_id,
                        provider = %warning.provider,
                        days_left = warning.days_left
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialCrypto, CredentialFilesConfig};
    use crate::credentials::store::CredentialStore;
    use crate::credentials::types::ApiKeyKind;
    use crate::types::ProviderId;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let dir = TempDir::new().unwrap();
        let files = CredentialFilesConfig {
            key_store_path: dir.path().join("keys.json"),
            rotation_config_path: dir.path().join("rotation.toml"),
            audit_log_path: dir.path().join("audit.json"),
            audit_max_entries: 10,
        };
        let manager = Arc::new(ApiKeyManager::new(CredentialStore::new(
            files,
            CredentialCrypto::new(&[1u8; 32]),
        )));

        let task = KeyLifecycleTask::with_intervals(
            manager.clone(),
            Duration::from_millis(20),
            Duration::from_secs(3600),
        );
        task.start().await;
        task.start().await;

        manager
            .create_key(ProviderId::new("powerschool"), "sk", ApiKeyKind::Primary, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        task.stop().await;
        task.stop().await;
    }
}
