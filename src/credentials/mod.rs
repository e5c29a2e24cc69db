//! # 凭据管理模块
//!
//! 加密存储、生命周期状态机与轮换策略。

mod manager;
mod rotation_task;
mod store;
mod types;

pub use manager::{ApiKeyManager, SweepOutcome};
pub use rotation_task::KeyLifecycleTask;
pub use store::{CredentialStore, RotationConfigFile};
pub use types::{
    ApiKey, ApiKeyKind, ApiKeyStatus, AuditOperation, AuditRecord, ExpiryWarning, KeyHealthReport,
    RotationDueEntry, RotationPolicy, RotationReason,
};
