use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use yaosou::api;
use yaosou::cache::{DelayedBatchWriter, TwoLevelCache};
use yaosou::config;
use yaosou::plugin::{self, PluginManager};
use yaosou::search::SearchService;
use yaosou::state::AppState;
use yaosou::util::http;

#[tokio::main]
async fn main() {
    println!(
        r#"
██╗   ██╗ █████╗  ██████╗ ███████╗ ██████╗ ██╗   ██╗
╚██╗ ██╔╝██╔══██╗██╔═══██╗██╔════╝██╔═══██╗██║   ██║
 ╚████╔╝ ███████║██║   ██║███████╗██║   ██║██║   ██║
  ╚██╔╝  ██╔══██║██║   ██║╚════██║██║   ██║██║   ██║
   ██║   ██║  ██║╚██████╔╝███████║╚██████╔╝╚██████╔╝
   ╚═╝   ╚═╝  ╚═╝ ╚═════╝ ╚══════╝ ╚═════╝  ╚═════╝

网盘资源搜索聚合服务 (构建于 {})
"#,
        env!("YAOSOU_BUILD_TIME")
    );

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_ansi(true)
        .compact()
        .init();

    println!("🚀 服务启动中...");

    // 配置与 HTTP 客户端必须在接受流量前就绪，请求路径上不做惰性初始化
    let cfg = config::init_config();
    http::init_http_client();

    let cache = TwoLevelCache::new(&cfg.cache)
        .await
        .expect("缓存初始化失败");
    cache.spawn_sweeper();
    if cfg.cache.enabled {
        println!("💾 磁盘缓存目录: {}", cfg.cache.path);
    } else {
        println!("💾 磁盘缓存已禁用，仅使用内存缓存");
    }

    let writer = DelayedBatchWriter::new(cache.clone());

    // 插件写透主缓存的函数在两者都构造完成后注入一次
    {
        let cache = cache.clone();
        let writer = writer.clone();
        plugin::set_main_cache_updater(Arc::new(
            move |key: String, data: Vec<u8>, ttl: std::time::Duration, is_final: bool| {
                cache.set_memory(&key, data.clone(), ttl, is_final);
                writer.enqueue(&key, data, ttl, is_final);
            },
        ));
    }

    let plugin_manager = if cfg.plugin.enabled {
        plugin::register_builtin_plugins();
        let manager = PluginManager::from_registry(&cfg.plugin.enabled_plugins);
        println!("✅ 已注册 {} 个搜索插件", manager.len());
        Arc::new(manager)
    } else {
        println!("⚠️ 异步插件已禁用");
        Arc::new(PluginManager::disabled())
    };

    let search_service = SearchService::new(plugin_manager.clone(), cache.clone(), writer.clone());

    let state = Arc::new(AppState {
        search_service,
        plugin_manager,
    });
    let app = api::build_router(state);

    let addr = cfg.bind_address();
    println!("🌐 服务器监听地址: {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("端口绑定失败");
    println!("✅ 服务器启动成功，等待连接...");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("服务器异常退出");

    // 停机前同步排空写入队列，未落盘的缓存在这里补齐
    println!("🛑 收到停机信号，正在排空缓存写入队列...");
    writer.drain().await;
    println!("👋 已退出");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
