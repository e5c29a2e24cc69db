//! # 凭据持久化存储
//!
//! 三个独立工件：加密密钥存储（JSON）、轮换策略（TOML）、审计日志（JSON）。
//! 任一工件损坏或缺失不影响其余工件加载。

use super::types::{ApiKey, ApiKeyKind, ApiKeyStatus, AuditRecord, RotationPolicy};
use crate::config::{CredentialCrypto, CredentialFilesConfig, EncryptedValue};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::types::ProviderId;
use crate::{ldebug, lwarn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// 落盘形式的密钥：明文替换为加密值
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredApiKey {
    id: String,
    provider: ProviderId,
    kind: ApiKeyKind,
    status: ApiKeyStatus,
    value: EncryptedValue,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    deactivate_after: Option<DateTime<Utc>>,
    usage_count: u64,
    rotation_count: u32,
}

/// 轮换策略文件结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationConfigFile {
    /// 未单独配置的提供商使用的默认策略
    #[serde(default)]
    pub default: RotationPolicy,
    /// 按提供商覆盖
    #[serde(default)]
    pub providers: HashMap<String, RotationPolicy>,
}

/// 凭据文件存储
pub struct CredentialStore {
    files: CredentialFilesConfig,
    crypto: CredentialCrypto,
}

impl CredentialStore {
    /// 创建凭据存储
    #[must_use]
    pub const fn new(files: CredentialFilesConfig, crypto: CredentialCrypto) -> Self {
        Self { files, crypto }
    }

    /// 加载密钥存储
    ///
    /// 文件缺失视为空存储；解析或解密失败返回错误由调用方决定降级。
    pub fn load_keys(&self) -> Result<Vec<ApiKey>> {
        let path = &self.files.key_store_path;
        if !path.exists() {
            ldebug!(
                "system",
                LogStage::Startup,
                LogComponent::Credentials,
                "key_store_missing",
                "Key store file missing, starting empty",
                path = %path.display()
            );
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(path)?;
        let stored: Vec<StoredApiKey> = serde_json::from_str(&content)?;

        let mut keys = Vec::with_capacity(stored.len());
        for entry in stored {
            let value = self.crypto.decrypt(&entry.value)?;
            keys.push(ApiKey {
                id: entry.id,
                provider: entry.provider,
                kind: entry.kind,
                status: entry.status,
                value,
                created_at: entry.created_at,
                expires_at: entry.expires_at,
                last_used_at: entry.last_used_at,
                deactivate_after: entry.deactivate_after,
                usage_count: entry.usage_count,
                rotation_count: entry.rotation_count,
            });
        }
        Ok(keys)
    }

    /// 保存密钥存储（静态加密）
    pub fn save_keys(&self, keys: &[ApiKey]) -> Result<()> {
        let mut stored = Vec::with_capacity(keys.len());
        for key in keys {
            stored.push(StoredApiKey {
                id: key.id.clone(),
                provider: key.provider.clone(),
                kind: key.kind,
                status: key.status,
                value: self.crypto.encrypt(&key.value)?,
                created_at: key.created_at,
                expires_at: key.expires_at,
                last_used_at: key.last_used_at,
                deactivate_after: key.deactivate_after,
                usage_count: key.usage_count,
                rotation_count: key.rotation_count,
            });
        }

        let content = serde_json::to_string_pretty(&stored)?;
        write_atomically(&self.files.key_store_path, &content)
    }

    /// 加载轮换策略
    pub fn load_rotation_config(&self) -> Result<RotationConfigFile> {
        let path = &self.files.rotation_config_path;
        if !path.exists() {
            return Ok(RotationConfigFile::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// 保存轮换策略
    pub fn save_rotation_config(&self, config: &RotationConfigFile) -> Result<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            crate::error::GatewayError::internal_with_source("轮换策略序列化失败", e)
        })?;
        write_atomically(&self.files.rotation_config_path, &content)
    }

    /// 加载审计日志
    pub fn load_audit(&self) -> Result<Vec<AuditRecord>> {
        let path = &self.files.audit_log_path;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// 保存审计日志（仅保留最近 N 条）
    pub fn save_audit(&self, records: &[AuditRecord]) -> Result<()> {
        let keep = if records.len() > self.files.audit_max_entries {
            &records[records.len() - self.files.audit_max_entries..]
        } else {
            records
        };
        let content = serde_json::to_string_pretty(keep)?;
        write_atomically(&self.files.audit_log_path, &content)
    }

    /// 审计日志保留条目数
    #[must_use]
    pub const fn audit_max_entries(&self) -> usize {
        self.files.audit_max_entries
    }
}

/// 先写临时文件再改名，避免半写状态破坏现有工件
fn write_atomically(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)?;
    if let Err(err) = std::fs::rename(&tmp_path, path) {
        lwarn!(
            "system",
            LogStage::Credentials,
            LogComponent::Credentials,
            "atomic_rename_failed",
            "Atomic rename failed, falling back to direct write",
            path = %path.display(),
            error = %err
        );
        std::fs::write(path, content)?;
        let _ = std::fs::remove_file(&tmp_path);
    }
    Ok(())
}
