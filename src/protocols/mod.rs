// 协议模块 - inbound/outbound 插件实现，经由 registry 按名称注册
use crate::error::{ProxyError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub mod blackhole;
pub mod freedom;
pub mod socks;

pub use blackhole::BlackholeProtocol;
pub use freedom::{FreedomProtocol, FreedomSettings};
pub use socks::{SocksInbound, SocksSettings};

/// 解析协议自己的 settings；缺省时使用默认值
pub(crate) fn parse_settings<T>(protocol: &str, settings: Option<&Value>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match settings {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| ProxyError::Config(format!("Invalid {} settings: {}", protocol, e))),
    }
}
