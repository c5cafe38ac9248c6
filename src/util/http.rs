//! 进程级 HTTP 客户端 / Process-wide HTTP client
//!
//! 所有出站请求共用一个带连接池的 reqwest::Client，服务启动早期初始化，
//! 请求路径上不做任何惰性构建。

use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

use crate::config;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    let cfg = config::config();
    Client::builder()
        .user_agent(cfg.http.user_agent.clone())
        .timeout(cfg.http_timeout())
        .connect_timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(16)
        .gzip(true)
        .build()
        .expect("构建 HTTP 客户端失败")
});

/// 获取共享客户端（首次调用时构建）
pub fn client() -> &'static Client {
    &HTTP_CLIENT
}

/// 服务启动时调用，保证客户端在接受流量前就已构建完成
pub fn init_http_client() {
    Lazy::force(&HTTP_CLIENT);
}
