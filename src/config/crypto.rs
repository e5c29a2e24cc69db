//! # 凭据加密模块
//!
//! 密钥存储的静态加密与解密。密钥材料本身绝不写入日志。

use aes_gcm::{
    Aes256Gcm,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 主密钥环境变量（64个十六进制字符，32字节）
pub const MASTER_KEY_ENV: &str = "SIS_GATEWAY_MASTER_KEY";

/// 加密后的值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedValue {
    /// Base64编码的加密数据
    pub data: String,
    /// Base64编码的随机数
    pub nonce: String,
}

/// 凭据加密器
pub struct CredentialCrypto {
    cipher: Aes256Gcm,
}

impl CredentialCrypto {
    /// 创建新的凭据加密器
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        let key: [u8; 32] = *key;
        let key = key.into();
        let cipher = Aes256Gcm::new(&key);
        Self { cipher }
    }

    /// 从环境变量创建加密器
    pub fn from_env() -> crate::error::Result<Self> {
        let key_str = std::env::var(MASTER_KEY_ENV).map_err(|_| {
            crate::error::GatewayError::crypto(format!("缺少主密钥环境变量 {MASTER_KEY_ENV}"))
        })?;

        if key_str.len() != 64 {
            return Err(crate::error::GatewayError::crypto(
                "主密钥必须是64个字符的十六进制字符串（32字节）",
            ));
        }

        let key_bytes = hex::decode(&key_str)
            .map_err(|e| crate::error::GatewayError::crypto_with_source("主密钥格式错误", e))?;

        if key_bytes.len() != 32 {
            return Err(crate::error::GatewayError::crypto("主密钥必须是32字节"));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);
        Ok(Self::new(&key))
    }

    /// 从操作员口令派生加密器（SHA-256）
    #[must_use]
    pub fn from_password(password: &str) -> Self {
        let digest = Sha256::digest(password.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self::new(&key)
    }

    /// 加密字符串
    pub fn encrypt(&self, plaintext: &str) -> crate::error::Result<EncryptedValue> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| {
                crate::error::GatewayError::crypto_with_source(
                    "凭据加密失败",
                    anyhow::anyhow!("AES-GCM encryption failed: {e}"),
                )
            })?;

        Ok(EncryptedValue {
            data: general_purpose::STANDARD.encode(&ciphertext),
            nonce: general_purpose::STANDARD.encode(nonce),
        })
    }

    /// 解密字符串
    pub fn decrypt(&self, encrypted: &EncryptedValue) -> crate::error::Result<String> {
        let ciphertext = general_purpose::STANDARD
            .decode(&encrypted.data)
            .map_err(|e| crate::error::GatewayError::crypto_with_source("加密数据格式错误", e))?;

        let nonce_bytes = general_purpose::STANDARD
            .decode(&encrypted.nonce)
            .map_err(|e| crate::error::GatewayError::crypto_with_source("加密随机数格式错误", e))?;

        if nonce_bytes.len() != 12 {
            return Err(crate::error::GatewayError::crypto("加密随机数长度错误"));
        }

        let nonce_bytes: [u8; 12] = nonce_bytes
            .try_into()
            .map_err(|_| crate::error::GatewayError::crypto("加密随机数长度错误"))?;
        let nonce = nonce_bytes.into();

        let plaintext = self
            .cipher
            .decrypt(&nonce, ciphertext.as_ref())
            .map_err(|e| {
                crate::error::GatewayError::crypto_with_source(
                    "凭据解密失败",
                    anyhow::anyhow!("AES-GCM decryption failed: {e}"),
                )
            })?;

        String::from_utf8(plaintext).map_err(|e| {
            crate::error::GatewayError::crypto_with_source("解密后的数据不是有效的UTF-8字符串", e)
        })
    }

    /// 生成新的主密钥
    #[must_use]
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }
}
