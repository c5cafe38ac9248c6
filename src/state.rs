//! 应用共享状态 / Shared application state

use std::sync::Arc;

use crate::plugin::PluginManager;
use crate::search::SearchService;

/// 通过 axum State 注入各 handler
pub struct AppState {
    pub search_service: SearchService,
    pub plugin_manager: Arc<PluginManager>,
}
