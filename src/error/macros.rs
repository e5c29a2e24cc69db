//! # 错误处理宏

/// 快速创建配置错误的宏
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::GatewayError::config($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::GatewayError::config(format!($fmt, $($arg)*))
    };
}

/// 快速创建网络错误的宏
#[macro_export]
macro_rules! network_error {
    ($msg:expr) => {
        $crate::error::GatewayError::network($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::GatewayError::network(format!($fmt, $($arg)*))
    };
}

/// 快速创建凭据错误的宏
#[macro_export]
macro_rules! credential_error {
    ($msg:expr) => {
        $crate::error::GatewayError::credential($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::GatewayError::credential(format!($fmt, $($arg)*))
    };
}

/// 快速创建内部错误的宏
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::GatewayError::internal($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::GatewayError::internal(format!($fmt, $($arg)*))
    };
}

/// 确保条件成立，否则返回配置错误
#[macro_export]
macro_rules! ensure_config {
    ($cond:expr, $msg:expr) => {
        if !($cond) {
            return Err($crate::config_error!($msg));
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::config_error!($fmt, $($arg)*));
        }
    };
}
