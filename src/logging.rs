//! 日志初始化：`RUST_LOG` 优先，否则使用默认过滤规则。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// redis 客户端的重连日志较多，默认只保留告警。
const DEFAULT_LOG_FILTER: &str = "info,redis=warn";

/// 初始化 tracing 日志订阅。
pub fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
